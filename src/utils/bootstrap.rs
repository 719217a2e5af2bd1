//! Bootstrap utilities for callwatch binaries.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LOG_ENV_VAR;
use crate::logging::FanOutLayer;

/// Initialize tracing with the CALLWATCH_LOG environment variable.
///
/// Defaults to "info" level if CALLWATCH_LOG is not set. When `fan_out` is
/// given, events are also forwarded to its fan-out loggers.
pub fn init_tracing(fan_out: Option<FanOutLayer>) {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer())
        .with(fan_out)
        .init();
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("info"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_env_filter_defaults_to_info() {
        std::env::remove_var(LOG_ENV_VAR);
        assert_eq!(env_filter().to_string(), "info");
    }

    #[test]
    #[serial]
    fn test_env_filter_reads_log_var() {
        std::env::set_var(LOG_ENV_VAR, "callwatch=debug");
        let filter = env_filter();
        std::env::remove_var(LOG_ENV_VAR);
        assert_eq!(filter.to_string(), "callwatch=debug");
    }
}
