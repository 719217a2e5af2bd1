//! Broker connection descriptors.
//!
//! A descriptor is a `;`-separated list of `key=value` pairs:
//!
//! ```text
//! host=broker1;port=5673;user=svc;pass=secret;vhost=/app
//! ```
//!
//! Keys are case-insensitive. Unrecognized keys are ignored and absent keys
//! keep the connector defaults.

use std::fmt;
use std::str::FromStr;

/// Default broker host.
pub const DEFAULT_HOST: &str = "localhost";
/// Default AMQP port.
pub const DEFAULT_PORT: u16 = 5672;
/// Default user.
pub const DEFAULT_USER: &str = "guest";
/// Default password.
pub const DEFAULT_PASSWORD: &str = "guest";
/// Default virtual host.
pub const DEFAULT_VHOST: &str = "/";

/// Errors raised while parsing a descriptor.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    #[error("Malformed descriptor entry '{0}': expected key=value")]
    MalformedEntry(String),

    #[error("Descriptor entry '{0}' has an empty key")]
    EmptyKey(String),

    #[error("Invalid port '{0}': expected a number between 1 and 65535")]
    InvalidPort(String),
}

/// Parsed broker connection settings.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
}

impl Default for ConnectionDescriptor {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            user: DEFAULT_USER.to_string(),
            password: DEFAULT_PASSWORD.to_string(),
            vhost: DEFAULT_VHOST.to_string(),
        }
    }
}

impl ConnectionDescriptor {
    /// Parse a descriptor string on top of the connector defaults.
    pub fn parse(descriptor: &str) -> Result<Self, DescriptorError> {
        let mut parsed = Self::default();

        for entry in descriptor.split(';') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }

            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| DescriptorError::MalformedEntry(entry.to_string()))?;
            let key = key.trim();
            let value = value.trim();

            if key.is_empty() {
                return Err(DescriptorError::EmptyKey(entry.to_string()));
            }

            match key.to_ascii_lowercase().as_str() {
                "host" => parsed.host = value.to_string(),
                "port" => {
                    parsed.port = value
                        .parse::<u16>()
                        .ok()
                        .filter(|port| *port != 0)
                        .ok_or_else(|| DescriptorError::InvalidPort(value.to_string()))?;
                }
                "user" => parsed.user = value.to_string(),
                "pass" => parsed.password = value.to_string(),
                "vhost" => parsed.vhost = value.to_string(),
                _ => {}
            }
        }

        Ok(parsed)
    }

    /// `host:port/vhost`, safe to log.
    pub fn endpoint(&self) -> String {
        format!("{}:{}{}", self.host, self.port, self.vhost_path())
    }

    fn vhost_path(&self) -> String {
        if self.vhost.starts_with('/') {
            self.vhost.clone()
        } else {
            format!("/{}", self.vhost)
        }
    }
}

impl FromStr for ConnectionDescriptor {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("vhost", &self.vhost)
            .finish()
    }
}
