//! Telemetry envelopes.
//!
//! An envelope carries the common `id` and `timestamp` fields plus exactly one
//! telemetry item. Items are a closed set of kinds; on the wire the kind is a
//! `kind` tag next to the item's own fields:
//!
//! ```json
//! {"id":"…","timestamp":"2024-05-01T12:00:00.000000Z","kind":"HttpRequest","name":"…",…}
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::correlation::OperationId;
use crate::status::{self, OutcomeCode};

/// One tracked inbound request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestTelemetry {
    /// Method name (full gRPC path).
    pub name: String,
    pub url: String,
    /// Peer address of the caller, if known.
    pub source: Option<String>,
    pub duration_ms: f64,
    pub response_code: OutcomeCode,
    pub success: bool,
    pub request_body: String,
    pub response_body: String,
    /// Caller deadline in milliseconds, informational only.
    pub deadline_ms: Option<u64>,
    pub operation_id: Option<OperationId>,
}

impl RequestTelemetry {
    /// Set the outcome code and derive `success` from it.
    pub fn with_outcome(mut self, code: OutcomeCode) -> Self {
        self.response_code = code;
        self.success = status::is_success(code);
        self
    }
}

/// A call made by this service to something else.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyTelemetry {
    pub name: String,
    pub dependency_type: String,
    pub target: String,
    pub data: Option<String>,
    pub duration_ms: f64,
    pub result_code: Option<String>,
    pub success: bool,
    pub operation_id: Option<OperationId>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventTelemetry {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    pub operation_id: Option<OperationId>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricTelemetry {
    pub name: String,
    pub value: f64,
    pub count: Option<u64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageViewTelemetry {
    pub name: String,
    pub url: String,
    pub duration_ms: f64,
    pub operation_id: Option<OperationId>,
}

/// Result of an availability or synthetic test run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResultTelemetry {
    pub test_name: String,
    pub run_location: String,
    pub success: bool,
    pub duration_ms: f64,
    pub message: Option<String>,
}

/// Severity of a trace message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeverityLevel {
    Verbose,
    #[default]
    Information,
    Warning,
    Error,
    Critical,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceTelemetry {
    pub message: String,
    pub severity_level: SeverityLevel,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    pub operation_id: Option<OperationId>,
}

/// Closed set of telemetry kinds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum TelemetryItem {
    HttpRequest(RequestTelemetry),
    Dependency(DependencyTelemetry),
    Event(EventTelemetry),
    Metric(MetricTelemetry),
    PageView(PageViewTelemetry),
    TestResult(TestResultTelemetry),
    Trace(TraceTelemetry),
}

impl TelemetryItem {
    /// Kind name, as written in the `kind` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            TelemetryItem::HttpRequest(_) => "HttpRequest",
            TelemetryItem::Dependency(_) => "Dependency",
            TelemetryItem::Event(_) => "Event",
            TelemetryItem::Metric(_) => "Metric",
            TelemetryItem::PageView(_) => "PageView",
            TelemetryItem::TestResult(_) => "TestResult",
            TelemetryItem::Trace(_) => "Trace",
        }
    }
}

/// A telemetry item plus the fields every published record carries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEnvelope {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub item: TelemetryItem,
}

impl TelemetryEnvelope {
    /// Wrap an item. `id` and `timestamp` are placeholders until [`stamp`].
    ///
    /// [`stamp`]: TelemetryEnvelope::stamp
    pub fn new(item: TelemetryItem) -> Self {
        Self {
            id: Uuid::nil(),
            timestamp: DateTime::<Utc>::default(),
            item,
        }
    }

    /// Assign a fresh id and the current UTC time, replacing any prior values.
    pub fn stamp(&mut self) {
        self.id = Uuid::new_v4();
        self.timestamp = Utc::now();
    }

    /// Compact UTF-8 JSON wire form.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn kind(&self) -> &'static str {
        self.item.kind()
    }
}

impl From<TelemetryItem> for TelemetryEnvelope {
    fn from(item: TelemetryItem) -> Self {
        Self::new(item)
    }
}
