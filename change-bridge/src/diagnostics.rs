use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;
use tracing::warn;

use crate::kafka::types::Partition;
use crate::metrics_consts::EVENTS_SKIPPED_COUNTER;

/// Why an event was skipped without a sink write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Unparseable,
    MalformedPayload,
    UnsupportedIdentifier,
    PermanentApplyFailure,
    RetriesExhausted,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Unparseable => "unparseable",
            SkipReason::MalformedPayload => "malformed_payload",
            SkipReason::UnsupportedIdentifier => "unsupported_identifier",
            SkipReason::PermanentApplyFailure => "permanent_apply_failure",
            SkipReason::RetriesExhausted => "retries_exhausted",
        }
    }
}

/// Everything an operator needs to find and replay a skipped event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkipReport {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub reason: SkipReason,
    pub error: String,
    /// Raw message bytes, base64 encoded so binary payloads survive JSON.
    pub payload_base64: Option<String>,
}

impl SkipReport {
    pub fn new(
        partition: &Partition,
        offset: i64,
        reason: SkipReason,
        error: impl ToString,
        payload: Option<&[u8]>,
    ) -> Self {
        Self {
            topic: partition.topic().to_string(),
            partition: partition.partition_number(),
            offset,
            reason,
            error: error.to_string(),
            payload_base64: payload.map(|bytes| STANDARD.encode(bytes)),
        }
    }
}

/// Destination for skipped events. Reporting is best effort and never blocks
/// progress of the partition.
#[async_trait]
pub trait SkipReporter: Send + Sync {
    async fn report(&self, report: SkipReport);
}

/// Reports skipped events to the log and the skip counter only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

#[async_trait]
impl SkipReporter for LogReporter {
    async fn report(&self, report: SkipReport) {
        log_skip(&report);
    }
}

pub(crate) fn log_skip(report: &SkipReport) {
    warn!(
        topic = %report.topic,
        partition = report.partition,
        offset = report.offset,
        reason = report.reason.as_str(),
        error = %report.error,
        "Skipping change event"
    );
    metrics::counter!(EVENTS_SKIPPED_COUNTER, "reason" => report.reason.as_str()).increment(1);
}
