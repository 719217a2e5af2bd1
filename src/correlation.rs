//! Operation id resolution and propagation.
//!
//! Every inbound call gets exactly one operation id, resolved in order:
//! 1. The trace id of a valid W3C `traceparent` entry
//! 2. An `x-correlation` entry that parses as a UUID
//! 3. A freshly generated id
//!
//! The resolved id is written back into `traceparent` so downstream code and
//! the caller observe the same value.

use std::fmt;

use serde::{Deserialize, Serialize};
use tonic::metadata::{MetadataMap, MetadataValue};
use tonic::service::Interceptor;
use tonic::{Request, Status};
use tracing::debug;
use uuid::Uuid;

/// Native gRPC trace field (W3C trace context).
pub const TRACEPARENT_HEADER: &str = "traceparent";
/// Caller-supplied correlation header.
pub const CORRELATION_HEADER: &str = "x-correlation";

/// Trace flags used when a traceparent is generated locally (sampled).
const DEFAULT_TRACE_FLAGS: u8 = 0x01;

/// 128-bit identifier correlating all telemetry of one logical call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Generate a fresh random operation id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Hex form used as the trace id of a `traceparent`.
    pub fn trace_id_hex(&self) -> String {
        self.0.simple().to_string()
    }
}

impl From<Uuid> for OperationId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Where a resolved operation id came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdSource {
    TraceParent,
    CorrelationHeader,
    Generated,
}

/// Outcome of resolving the operation id for one call.
#[derive(Clone, Debug)]
pub struct Resolution {
    pub operation_id: OperationId,
    pub source: IdSource,
    /// The `traceparent` value written back to the request.
    pub traceparent: String,
}

/// Parsed W3C `traceparent` value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct TraceParent {
    trace_id: u128,
    parent_id: u64,
    flags: u8,
}

impl TraceParent {
    fn parse(value: &str) -> Option<Self> {
        let mut parts = value.trim().split('-');
        let version = parts.next()?;
        let trace = parts.next()?;
        let parent = parts.next()?;
        let flags = parts.next()?;

        if !is_hex(version, 2) || version.eq_ignore_ascii_case("ff") {
            return None;
        }
        // Version 00 has exactly four fields; later versions may append more.
        if version == "00" && parts.next().is_some() {
            return None;
        }
        if !is_hex(trace, 32) || !is_hex(parent, 16) || !is_hex(flags, 2) {
            return None;
        }

        let trace_id = u128::from_str_radix(trace, 16).ok()?;
        let parent_id = u64::from_str_radix(parent, 16).ok()?;
        let flags = u8::from_str_radix(flags, 16).ok()?;

        if trace_id == 0 || parent_id == 0 {
            return None;
        }

        Some(Self {
            trace_id,
            parent_id,
            flags,
        })
    }

    fn fresh(trace_id: u128) -> Self {
        let (_, low) = Uuid::new_v4().as_u64_pair();
        Self {
            trace_id,
            parent_id: low.max(1),
            flags: DEFAULT_TRACE_FLAGS,
        }
    }
}

impl fmt::Display for TraceParent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "00-{:032x}-{:016x}-{:02x}",
            self.trace_id, self.parent_id, self.flags
        )
    }
}

fn is_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Resolves and propagates operation ids through gRPC metadata.
#[derive(Clone, Copy, Debug, Default)]
pub struct CorrelationTracker;

impl CorrelationTracker {
    pub fn new() -> Self {
        Self
    }

    /// Resolve the operation id for a call and write it back into `metadata`.
    ///
    /// Never fails: malformed inputs fall through to the next source.
    pub fn resolve(&self, metadata: &mut MetadataMap) -> Resolution {
        let native = metadata
            .get(TRACEPARENT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(TraceParent::parse);

        let (parent, source) = match native {
            Some(parent) => (parent, IdSource::TraceParent),
            None => match Self::correlation_header(metadata) {
                Some(id) => (TraceParent::fresh(id.as_u128()), IdSource::CorrelationHeader),
                None => (
                    TraceParent::fresh(Uuid::new_v4().as_u128()),
                    IdSource::Generated,
                ),
            },
        };

        let operation_id = OperationId(Uuid::from_u128(parent.trace_id));
        let traceparent = parent.to_string();
        Self::write_traceparent(metadata, &traceparent);

        debug!(
            operation_id = %operation_id,
            source = ?source,
            "Resolved operation id"
        );

        Resolution {
            operation_id,
            source,
            traceparent,
        }
    }

    /// Echo a resolved `traceparent` on outbound (response) metadata.
    pub fn echo(&self, resolution: &Resolution, metadata: &mut MetadataMap) {
        Self::write_traceparent(metadata, &resolution.traceparent);
    }

    fn correlation_header(metadata: &MetadataMap) -> Option<Uuid> {
        let raw = metadata.get(CORRELATION_HEADER)?.to_str().ok()?;
        Uuid::parse_str(raw.trim()).ok().filter(|id| !id.is_nil())
    }

    fn write_traceparent(metadata: &mut MetadataMap, traceparent: &str) {
        if let Ok(value) = MetadataValue::try_from(traceparent) {
            metadata.insert(TRACEPARENT_HEADER, value);
        }
    }
}

/// Read the operation id stamped on a request by the correlation layer.
pub fn operation_id<T>(request: &Request<T>) -> Option<OperationId> {
    request.extensions().get::<OperationId>().copied()
}

/// tonic interceptor that only resolves and stamps the operation id.
///
/// Use this for services that need correlation without request telemetry.
#[derive(Clone, Copy, Debug, Default)]
pub struct CorrelationInterceptor {
    tracker: CorrelationTracker,
}

impl CorrelationInterceptor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Interceptor for CorrelationInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        let resolution = self.tracker.resolve(request.metadata_mut());
        request.extensions_mut().insert(resolution.operation_id);
        Ok(request)
    }
}
