use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::applier::{Applied, ChangeApplier};
use crate::diagnostics::{SkipReason, SkipReport, SkipReporter};
use crate::error::{ApplyError, DecodeError, FatalError};
use crate::event::{ChangeKind, EventDecoder};
use crate::kafka::types::SourceMessage;
use crate::metrics_consts::{
    APPLY_RETRIES_COUNTER, EVENTS_APPLIED_COUNTER, EVENTS_UNKNOWN_COUNTER,
};
use crate::reconcile::{IdentifierReconciler, ReconciledWrite};
use crate::retry::RetryPolicy;

/// What happened to a single source message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// The sink confirmed the write.
    Applied(Applied),
    /// An event kind that needs no write. Its offset still counts as progress.
    Ignored,
    /// Skipped with a diagnostic. The offset is not recorded.
    Skipped(SkipReason),
    /// The stop signal arrived while waiting to retry.
    Interrupted,
    Fatal(FatalError),
}

impl EventOutcome {
    /// Whether the message's offset may be recorded as applied.
    pub fn advances_offset(&self) -> bool {
        matches!(self, EventOutcome::Applied(_) | EventOutcome::Ignored)
    }
}

/// Decode, reconcile and apply one message, retrying transient sink failures.
pub struct EventProcessor {
    decoder: EventDecoder,
    reconciler: IdentifierReconciler,
    applier: ChangeApplier,
    retry_policy: RetryPolicy,
    reporter: Arc<dyn SkipReporter>,
}

impl EventProcessor {
    pub fn new(
        decoder: EventDecoder,
        reconciler: IdentifierReconciler,
        applier: ChangeApplier,
        retry_policy: RetryPolicy,
        reporter: Arc<dyn SkipReporter>,
    ) -> Self {
        Self {
            decoder,
            reconciler,
            applier,
            retry_policy,
            reporter,
        }
    }

    pub async fn process(
        &self,
        message: &SourceMessage,
        cancel: &CancellationToken,
    ) -> EventOutcome {
        let Some(raw) = message.payload.as_deref() else {
            return self
                .skip(message, SkipReason::MalformedPayload, "message has no payload")
                .await;
        };

        let event = match self.decoder.decode(raw) {
            Ok(event) => event,
            Err(e @ DecodeError::Unparseable(_)) => {
                return self.skip(message, SkipReason::Unparseable, e).await;
            }
            Err(e @ DecodeError::MalformedPayload(_)) => {
                return self.skip(message, SkipReason::MalformedPayload, e).await;
            }
        };

        if event.kind == ChangeKind::Unknown {
            debug!(
                topic = message.partition.topic(),
                partition = message.partition.partition_number(),
                offset = message.offset,
                event_type = %event.event_type,
                "Ignoring change event of unhandled type"
            );
            metrics::counter!(EVENTS_UNKNOWN_COUNTER).increment(1);
            return EventOutcome::Ignored;
        }

        let write = match self.reconciler.reconcile_event(event) {
            Ok(Some(write)) => write,
            Ok(None) => return EventOutcome::Ignored,
            Err(e) => {
                return self
                    .skip(message, SkipReason::UnsupportedIdentifier, e)
                    .await;
            }
        };

        self.apply_with_retry(message, &write, cancel).await
    }

    async fn apply_with_retry(
        &self,
        message: &SourceMessage,
        write: &ReconciledWrite,
        cancel: &CancellationToken,
    ) -> EventOutcome {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.applier.apply(write).await {
                Ok(applied) => {
                    metrics::counter!(
                        EVENTS_APPLIED_COUNTER,
                        "operation" => write.operation.as_str()
                    )
                    .increment(1);
                    return EventOutcome::Applied(applied);
                }
                Err(ApplyError::Unauthorized(reason)) => {
                    return EventOutcome::Fatal(FatalError::AuthFailure {
                        component: "sink",
                        message: reason,
                    });
                }
                Err(e @ ApplyError::Permanent(_)) => {
                    return self
                        .skip(message, SkipReason::PermanentApplyFailure, e)
                        .await;
                }
                Err(e @ ApplyError::Transient(_)) => {
                    if !self.retry_policy.should_retry(attempt) {
                        return self.skip(message, SkipReason::RetriesExhausted, e).await;
                    }

                    let interval = self.retry_policy.retry_interval(attempt);
                    warn!(
                        topic = message.partition.topic(),
                        partition = message.partition.partition_number(),
                        offset = message.offset,
                        sink_identifier = %write.sink_identifier,
                        attempt = attempt,
                        retry_in = ?interval,
                        error = %e,
                        "Transient sink failure, retrying"
                    );
                    metrics::counter!(APPLY_RETRIES_COUNTER).increment(1);

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return EventOutcome::Interrupted,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
            }
        }
    }

    async fn skip(
        &self,
        message: &SourceMessage,
        reason: SkipReason,
        error: impl ToString,
    ) -> EventOutcome {
        let report = SkipReport::new(
            &message.partition,
            message.offset,
            reason,
            error,
            message.payload.as_deref(),
        );
        self.reporter.report(report).await;
        EventOutcome::Skipped(reason)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::event::DecoderConfig;
    use crate::kafka::types::Partition;
    use crate::reconcile::{ReconcilerConfig, SinkIdentifier};
    use crate::sink::memory::MemorySink;
    use crate::test_utils::RecordingReporter;

    struct Harness {
        processor: EventProcessor,
        sink: MemorySink,
        reporter: RecordingReporter,
    }

    fn harness(max_attempts: u32) -> Harness {
        let sink = MemorySink::new();
        let reporter = RecordingReporter::default();
        let processor = EventProcessor::new(
            EventDecoder::new(DecoderConfig::default()),
            IdentifierReconciler::new(ReconcilerConfig::default()),
            ChangeApplier::new(Arc::new(sink.clone()), Duration::from_secs(1)),
            RetryPolicy::build(1, Duration::from_millis(1))
                .max_attempts(max_attempts)
                .provide(),
            Arc::new(reporter.clone()),
        );
        Harness {
            processor,
            sink,
            reporter,
        }
    }

    fn message(offset: i64, payload: &[u8]) -> SourceMessage {
        SourceMessage::new(
            Partition::new("changes".to_string(), 0),
            offset,
            Some(payload.to_vec()),
        )
    }

    fn changed(id: &str) -> Vec<u8> {
        json!({
            "type": "documentChanged",
            "change": {"newValue": {"_id": id, "_version": 1, "name": "widget"}}
        })
        .to_string()
        .into_bytes()
    }

    #[tokio::test]
    async fn test_applies_document_changed() {
        let h = harness(3);

        let outcome = h
            .processor
            .process(&message(0, &changed("abc123")), &CancellationToken::new())
            .await;

        assert_eq!(outcome, EventOutcome::Applied(Applied::Upserted));
        let stored = h
            .sink
            .document(&SinkIdentifier::String("abc123".to_string()))
            .await;
        assert_eq!(stored, json!({"name": "widget"}).as_object().cloned());
    }

    #[tokio::test]
    async fn test_unknown_type_is_ignored_without_write() {
        let h = harness(3);

        let outcome = h
            .processor
            .process(
                &message(0, br#"{"type":"somethingElse"}"#),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(outcome, EventOutcome::Ignored);
        assert!(outcome.advances_offset());
        assert_eq!(h.sink.write_count().await, 0);
        assert!(h.reporter.reports().is_empty());
    }

    #[tokio::test]
    async fn test_unparseable_is_reported() {
        let h = harness(3);

        let outcome = h
            .processor
            .process(&message(4, b"{not json"), &CancellationToken::new())
            .await;

        assert_eq!(outcome, EventOutcome::Skipped(SkipReason::Unparseable));
        assert!(!outcome.advances_offset());
        let reports = h.reporter.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].offset, 4);
        assert_eq!(reports[0].reason, SkipReason::Unparseable);
    }

    #[tokio::test]
    async fn test_missing_payload_is_malformed() {
        let h = harness(3);
        let mut msg = message(0, b"");
        msg.payload = None;

        let outcome = h.processor.process(&msg, &CancellationToken::new()).await;

        assert_eq!(outcome, EventOutcome::Skipped(SkipReason::MalformedPayload));
    }

    #[tokio::test]
    async fn test_composite_identifier_is_rejected_by_default() {
        let h = harness(3);
        let payload = json!({
            "type": "documentChanged",
            "change": {"newValue": {"_id": {"a": 1, "b": "x"}, "name": "widget"}}
        })
        .to_string();

        let outcome = h
            .processor
            .process(&message(0, payload.as_bytes()), &CancellationToken::new())
            .await;

        assert_eq!(
            outcome,
            EventOutcome::Skipped(SkipReason::UnsupportedIdentifier)
        );
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let h = harness(5);
        for _ in 0..3 {
            h.sink
                .fail_next(ApplyError::Transient("connection reset".to_string()))
                .await;
        }

        let outcome = h
            .processor
            .process(&message(0, &changed("abc123")), &CancellationToken::new())
            .await;

        assert_eq!(outcome, EventOutcome::Applied(Applied::Upserted));
        assert_eq!(h.sink.write_count().await, 1);
    }

    #[tokio::test]
    async fn test_retry_ceiling_demotes_to_skip() {
        let h = harness(2);
        for _ in 0..2 {
            h.sink
                .fail_next(ApplyError::Transient("connection reset".to_string()))
                .await;
        }

        let outcome = h
            .processor
            .process(&message(0, &changed("abc123")), &CancellationToken::new())
            .await;

        assert_eq!(outcome, EventOutcome::Skipped(SkipReason::RetriesExhausted));
        assert_eq!(h.sink.write_count().await, 0);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let h = harness(5);
        h.sink
            .fail_next(ApplyError::Permanent("duplicate key".to_string()))
            .await;

        let outcome = h
            .processor
            .process(&message(0, &changed("abc123")), &CancellationToken::new())
            .await;

        assert_eq!(
            outcome,
            EventOutcome::Skipped(SkipReason::PermanentApplyFailure)
        );
        assert_eq!(h.reporter.reports().len(), 1);
    }

    #[tokio::test]
    async fn test_unauthorized_sink_is_fatal() {
        let h = harness(5);
        h.sink
            .fail_next(ApplyError::Unauthorized("bad credentials".to_string()))
            .await;

        let outcome = h
            .processor
            .process(&message(0, &changed("abc123")), &CancellationToken::new())
            .await;

        assert_eq!(
            outcome,
            EventOutcome::Fatal(FatalError::AuthFailure {
                component: "sink",
                message: "bad credentials".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let h = harness(5);
        h.sink
            .fail_next(ApplyError::Transient("connection reset".to_string()))
            .await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = h.processor.process(&message(0, &changed("abc123")), &cancel).await;

        assert_eq!(outcome, EventOutcome::Interrupted);
        assert!(!outcome.advances_offset());
    }
}
