//! Per-call request tracking for gRPC handlers.
//!
//! [`RequestInterceptor::intercept`] wraps one unary handler invocation:
//! it resolves the operation id, times the handler, translates the final
//! status and publishes an `HttpRequest` envelope, then returns the
//! handler's result unchanged.
//!
//! ```ignore
//! async fn create_order(
//!     &self,
//!     request: Request<CreateOrder>,
//! ) -> Result<Response<Order>, Status> {
//!     self.interceptor
//!         .intercept("/orders.Orders/CreateOrder", request, |req| self.handle_create(req))
//!         .await
//! }
//! ```

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::Deserialize;
use tonic::{Code, Request, Response, Status};
use tracing::debug;

use crate::correlation::{CorrelationTracker, OperationId};
use crate::envelope::{RequestTelemetry, TelemetryEnvelope, TelemetryItem};
use crate::publish::TelemetryPublisher;
use crate::status::translate;

/// gRPC deadline header.
const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";

/// Whether the response waits for the telemetry publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishPolicy {
    /// Publish completes before the response is returned.
    #[default]
    Await,
    /// Publish runs on a spawned task; the response is returned immediately.
    Detach,
}

/// Inbound call details captured before the handler runs.
#[derive(Debug, Clone)]
struct CallInfo {
    method: String,
    url: String,
    peer: Option<String>,
    request_body: String,
    deadline_ms: Option<u64>,
}

impl CallInfo {
    fn capture<Req: fmt::Debug>(method: &str, request: &Request<Req>) -> Self {
        let url = match request.local_addr() {
            Some(local) => format!("grpc://{}{}", local, method),
            None => method.to_string(),
        };

        let deadline_ms = request
            .metadata()
            .get(GRPC_TIMEOUT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_grpc_timeout)
            .map(|d| d.as_millis() as u64);

        Self {
            method: method.to_string(),
            url,
            peer: request.remote_addr().map(|addr| addr.to_string()),
            request_body: format!("{:?}", request.get_ref()),
            deadline_ms,
        }
    }

    fn into_envelope(
        self,
        operation_id: OperationId,
        elapsed: Duration,
        code: Code,
        response_body: String,
    ) -> TelemetryEnvelope {
        let telemetry = RequestTelemetry {
            name: self.method,
            url: self.url,
            source: self.peer,
            duration_ms: elapsed.as_secs_f64() * 1000.0,
            request_body: self.request_body,
            response_body,
            deadline_ms: self.deadline_ms,
            operation_id: Some(operation_id),
            ..Default::default()
        }
        .with_outcome(translate(code));

        TelemetryEnvelope::new(TelemetryItem::HttpRequest(telemetry))
    }
}

/// Parse a `grpc-timeout` value: up to 8 digits followed by a unit.
fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.len() < 2 || value.len() > 9 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;

    match unit {
        "H" => Some(Duration::from_secs(amount * 3600)),
        "M" => Some(Duration::from_secs(amount * 60)),
        "S" => Some(Duration::from_secs(amount)),
        "m" => Some(Duration::from_millis(amount)),
        "u" => Some(Duration::from_micros(amount)),
        "n" => Some(Duration::from_nanos(amount)),
        _ => None,
    }
}

/// Tracks unary gRPC calls and publishes one request envelope per call.
#[derive(Clone)]
pub struct RequestInterceptor {
    tracker: CorrelationTracker,
    publisher: Arc<dyn TelemetryPublisher>,
    policy: PublishPolicy,
}

impl RequestInterceptor {
    pub fn new(publisher: Arc<dyn TelemetryPublisher>) -> Self {
        Self {
            tracker: CorrelationTracker::new(),
            publisher,
            policy: PublishPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: PublishPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> PublishPolicy {
        self.policy
    }

    /// Run `handler` for `request` with correlation and request telemetry.
    ///
    /// `method` is the full gRPC path (`/package.Service/Method`). The handler
    /// is invoked exactly once. Telemetry is published whether the handler
    /// succeeds, returns an error status or panics; errors and panics are
    /// then passed through to the caller. The resolved `traceparent` is
    /// echoed on the response or error metadata.
    pub async fn intercept<Req, Resp, F, Fut>(
        &self,
        method: &str,
        mut request: Request<Req>,
        handler: F,
    ) -> Result<Response<Resp>, Status>
    where
        Req: fmt::Debug,
        Resp: fmt::Debug,
        F: FnOnce(Request<Req>) -> Fut,
        Fut: Future<Output = Result<Response<Resp>, Status>>,
    {
        let resolution = self.tracker.resolve(request.metadata_mut());
        request.extensions_mut().insert(resolution.operation_id);

        let call = CallInfo::capture(method, &request);
        let start = Instant::now();

        let outcome = AssertUnwindSafe(handler(request)).catch_unwind().await;

        let elapsed = start.elapsed();
        let (code, response_body) = match &outcome {
            Ok(Ok(response)) => (Code::Ok, format!("{:?}", response.get_ref())),
            Ok(Err(status)) => (status.code(), status.message().to_string()),
            Err(_) => (Code::Internal, String::new()),
        };

        debug!(
            operation_id = %resolution.operation_id,
            method = %method,
            code = ?code,
            duration_ms = elapsed.as_millis() as u64,
            "Request tracked"
        );

        let envelope = call.into_envelope(resolution.operation_id, elapsed, code, response_body);
        self.dispatch(envelope).await;

        match outcome {
            Ok(Ok(mut response)) => {
                self.tracker.echo(&resolution, response.metadata_mut());
                Ok(response)
            }
            Ok(Err(mut status)) => {
                self.tracker.echo(&resolution, status.metadata_mut());
                Err(status)
            }
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    async fn dispatch(&self, envelope: TelemetryEnvelope) {
        match self.policy {
            PublishPolicy::Await => self.publisher.publish(envelope).await,
            PublishPolicy::Detach => {
                let publisher = Arc::clone(&self.publisher);
                tokio::spawn(async move { publisher.publish(envelope).await });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::{operation_id, CORRELATION_HEADER, TRACEPARENT_HEADER};
    use crate::publish::RecordingPublisher;
    use tonic::metadata::MetadataValue;

    const METHOD: &str = "/orders.Orders/Get";

    fn interceptor() -> (RequestInterceptor, Arc<RecordingPublisher>) {
        let recorder = Arc::new(RecordingPublisher::new());
        (RequestInterceptor::new(recorder.clone()), recorder)
    }

    fn request_of(envelope: &TelemetryEnvelope) -> &RequestTelemetry {
        match &envelope.item {
            TelemetryItem::HttpRequest(r) => r,
            other => panic!("unexpected kind {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_success_publishes_ok_envelope() {
        let (interceptor, recorder) = interceptor();

        let response = interceptor
            .intercept(METHOD, Request::new("order-1".to_string()), |req| async move {
                Ok::<_, Status>(Response::new(format!("found {}", req.into_inner())))
            })
            .await
            .unwrap();

        assert_eq!(response.get_ref(), "found order-1");

        let published = recorder.take_published().await;
        assert_eq!(published.len(), 1);
        let tracked = request_of(&published[0]);
        assert_eq!(tracked.name, METHOD);
        assert_eq!(tracked.url, METHOD);
        assert_eq!(tracked.response_code, 200);
        assert!(tracked.success);
        assert_eq!(tracked.request_body, "\"order-1\"");
        assert_eq!(tracked.response_body, "\"found order-1\"");
        assert!(tracked.operation_id.is_some());
        assert!(!published[0].id.is_nil());
    }

    #[tokio::test]
    async fn test_error_status_propagates_after_publish() {
        let (interceptor, recorder) = interceptor();

        let result = interceptor
            .intercept(METHOD, Request::new(()), |_req| async {
                Err::<Response<()>, _>(Status::not_found("no such order"))
            })
            .await;

        let status = result.unwrap_err();
        assert_eq!(status.code(), Code::NotFound);

        let published = recorder.take_published().await;
        let tracked = request_of(&published[0]);
        assert_eq!(tracked.response_code, 404);
        assert!(!tracked.success);
        assert_eq!(tracked.response_body, "no such order");
        assert!(status.metadata().get(TRACEPARENT_HEADER).is_some());
    }

    #[tokio::test]
    async fn test_unrecognized_status_tracked_as_500() {
        let (interceptor, recorder) = interceptor();

        let _ = interceptor
            .intercept(METHOD, Request::new(()), |_req| async {
                Err::<Response<()>, _>(Status::unavailable("down"))
            })
            .await;

        let published = recorder.take_published().await;
        assert_eq!(request_of(&published[0]).response_code, 500);
    }

    #[tokio::test]
    async fn test_handler_sees_operation_id_and_response_echoes_it() {
        let (interceptor, recorder) = interceptor();
        let mut request = Request::new(());
        request.metadata_mut().insert(
            CORRELATION_HEADER,
            MetadataValue::from_static("3fa85f64-5717-4562-b3fc-2c963f66afa6"),
        );

        let response = interceptor
            .intercept(METHOD, request, |req| async move {
                let id = operation_id(&req).unwrap();
                Ok::<_, Status>(Response::new(id.to_string()))
            })
            .await
            .unwrap();

        assert_eq!(response.get_ref(), "3fa85f64-5717-4562-b3fc-2c963f66afa6");
        let echoed = response
            .metadata()
            .get(TRACEPARENT_HEADER)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(echoed.contains("3fa85f6457174562b3fc2c963f66afa6"));

        let published = recorder.take_published().await;
        assert_eq!(
            request_of(&published[0]).operation_id.unwrap().to_string(),
            "3fa85f64-5717-4562-b3fc-2c963f66afa6"
        );
    }

    #[tokio::test]
    async fn test_handler_invoked_exactly_once() {
        let (interceptor, _recorder) = interceptor();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let counter = calls.clone();
        interceptor
            .intercept(METHOD, Request::new(()), move |_req| async move {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok::<_, Status>(Response::new(()))
            })
            .await
            .unwrap();

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panic_publishes_then_resumes() {
        let (interceptor, recorder) = interceptor();

        let handle = tokio::spawn(async move {
            interceptor
                .intercept(METHOD, Request::new(()), |_req| async {
                    if true {
                        panic!("handler exploded");
                    }
                    Ok::<_, Status>(Response::new(()))
                })
                .await
        });

        let join = handle.await;
        assert!(join.unwrap_err().is_panic());

        let published = recorder.take_published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(request_of(&published[0]).response_code, 500);
    }

    #[tokio::test]
    async fn test_deadline_recorded() {
        let (interceptor, recorder) = interceptor();
        let mut request = Request::new(());
        request
            .metadata_mut()
            .insert(GRPC_TIMEOUT_HEADER, MetadataValue::from_static("250m"));

        interceptor
            .intercept(METHOD, request, |_req| async { Ok::<_, Status>(Response::new(())) })
            .await
            .unwrap();

        let published = recorder.take_published().await;
        assert_eq!(request_of(&published[0]).deadline_ms, Some(250));
    }

    #[tokio::test]
    async fn test_detach_policy_still_publishes() {
        let recorder = Arc::new(RecordingPublisher::new());
        let interceptor =
            RequestInterceptor::new(recorder.clone()).with_policy(PublishPolicy::Detach);

        interceptor
            .intercept(METHOD, Request::new(()), |_req| async { Ok::<_, Status>(Response::new(())) })
            .await
            .unwrap();

        for _ in 0..50 {
            if recorder.published_count().await == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("detached publish never arrived");
    }

    #[test]
    fn test_parse_grpc_timeout() {
        assert_eq!(parse_grpc_timeout("1H"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_grpc_timeout("2M"), Some(Duration::from_secs(120)));
        assert_eq!(parse_grpc_timeout("3S"), Some(Duration::from_secs(3)));
        assert_eq!(parse_grpc_timeout("250m"), Some(Duration::from_millis(250)));
        assert_eq!(parse_grpc_timeout("10u"), Some(Duration::from_micros(10)));
        assert_eq!(parse_grpc_timeout("99n"), Some(Duration::from_nanos(99)));
        assert_eq!(parse_grpc_timeout("m"), None);
        assert_eq!(parse_grpc_timeout("123456789S"), None);
        assert_eq!(parse_grpc_timeout("12x"), None);
        assert_eq!(parse_grpc_timeout("-1S"), None);
    }
}
