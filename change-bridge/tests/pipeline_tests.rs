use std::sync::Arc;
use std::time::Duration;

use assert_json_diff::assert_json_eq;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use change_bridge::diagnostics::SkipReason;
use change_bridge::kafka::types::Partition;
use change_bridge::reconcile::SinkIdentifier;
use change_bridge::sink::memory::MemorySink;
use change_bridge::test_utils::{
    changed_message, document_deleted, json_message, raw_message, test_processor, MemorySource,
    RecordingReporter,
};
use change_bridge::{ApplyError, FatalError, PipelineConfig, PipelineLoop, PipelineState, SourceError};

const TOPIC: &str = "user-consumable-acme";

struct Bridge {
    source: MemorySource,
    sink: MemorySink,
    reporter: RecordingReporter,
    pipeline: PipelineLoop,
}

fn bridge_with(configure: impl FnOnce(&mut PipelineConfig)) -> Bridge {
    let source = MemorySource::new();
    let sink = MemorySink::new();
    let reporter = RecordingReporter::default();

    let mut config = PipelineConfig {
        topic: TOPIC.to_string(),
        poll_timeout: Duration::from_millis(5),
        commit_interval: Duration::from_secs(10),
        stop_at_partition_eof: true,
        shutdown_timeout: Duration::from_secs(5),
        channel_buffer_size: 10,
        connection_loss_tolerance: Duration::from_secs(60),
    };
    configure(&mut config);

    let pipeline = PipelineLoop::new(
        config,
        Arc::new(source.clone()),
        Arc::new(test_processor(&sink, &reporter)),
    );

    Bridge {
        source,
        sink,
        reporter,
        pipeline,
    }
}

fn bounded_bridge() -> Bridge {
    bridge_with(|_| {})
}

fn partition(number: i32) -> Partition {
    Partition::new(TOPIC.to_string(), number)
}

fn end_of(number: i32) -> SourceError {
    SourceError::EndOfPartition(partition(number))
}

async fn run(bridge: &mut Bridge, shutdown: CancellationToken) -> Result<(), FatalError> {
    tokio::time::timeout(Duration::from_secs(10), bridge.pipeline.run(shutdown))
        .await
        .expect("pipeline did not stop")
}

fn as_value(document: Option<serde_json::Map<String, Value>>) -> Value {
    Value::Object(document.expect("document not in sink"))
}

#[tokio::test]
async fn test_upsert_strips_metadata_fields() {
    let mut bridge = bounded_bridge();
    bridge.source.push_message(json_message(
        &partition(0),
        0,
        &json!({
            "type": "documentChanged",
            "change": {"newValue": {"_id": "abc123", "_version": 7, "name": "widget"}}
        }),
    ));
    bridge.source.push_error(end_of(0));

    assert_eq!(run(&mut bridge, CancellationToken::new()).await, Ok(()));

    let stored = bridge
        .sink
        .document(&SinkIdentifier::String("abc123".to_string()))
        .await;
    assert_json_eq!(as_value(stored), json!({"name": "widget"}));
    assert_eq!(bridge.sink.write_count().await, 1);
    assert_eq!(bridge.source.committed(&partition(0)), Some(0));
    assert_eq!(bridge.source.subscribed(), Some(TOPIC.to_string()));
    assert!(bridge.source.is_closed());
    assert_eq!(bridge.pipeline.state(), PipelineState::Draining);
}

#[tokio::test]
async fn test_redelivered_message_leaves_sink_unchanged() {
    let sink_after_first_run = {
        let mut bridge = bounded_bridge();
        bridge
            .source
            .push_message(changed_message(&partition(0), 0, "abc123"));
        bridge.source.push_error(end_of(0));
        run(&mut bridge, CancellationToken::new()).await.unwrap();
        bridge.sink
    };
    let before = sink_after_first_run.documents().await;

    // A restart before the commit landed redelivers the same offset.
    let source = MemorySource::new();
    let reporter = RecordingReporter::default();
    let mut pipeline = PipelineLoop::new(
        PipelineConfig {
            topic: TOPIC.to_string(),
            poll_timeout: Duration::from_millis(5),
            stop_at_partition_eof: true,
            ..PipelineConfig::default()
        },
        Arc::new(source.clone()),
        Arc::new(test_processor(&sink_after_first_run, &reporter)),
    );
    source.push_message(changed_message(&partition(0), 0, "abc123"));
    source.push_message(changed_message(&partition(0), 1, "abc123"));
    source.push_error(end_of(0));

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        pipeline.run(CancellationToken::new()),
    )
    .await
    .unwrap();

    assert_eq!(result, Ok(()));
    assert_eq!(sink_after_first_run.documents().await, before);
    assert_eq!(source.committed(&partition(0)), Some(1));
}

#[tokio::test]
async fn test_unknown_event_type_is_committed_without_write() {
    let mut bridge = bounded_bridge();
    bridge.source.push_message(json_message(
        &partition(0),
        0,
        &json!({"type": "somethingElse", "change": {"newValue": {"_id": "abc123"}}}),
    ));
    bridge.source.push_error(end_of(0));

    assert_eq!(run(&mut bridge, CancellationToken::new()).await, Ok(()));

    assert_eq!(bridge.sink.write_count().await, 0);
    assert!(bridge.reporter.reports().is_empty());
    assert_eq!(bridge.source.committed(&partition(0)), Some(0));
}

#[tokio::test]
async fn test_unparseable_message_is_skipped_and_not_committed() {
    let mut bridge = bounded_bridge();
    bridge
        .source
        .push_message(raw_message(&partition(0), 0, b"\x00\x01 definitely not json"));
    bridge.source.push_error(end_of(0));

    assert_eq!(run(&mut bridge, CancellationToken::new()).await, Ok(()));

    let reports = bridge.reporter.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].reason, SkipReason::Unparseable);
    assert_eq!(reports[0].partition, 0);
    assert_eq!(reports[0].offset, 0);
    assert!(reports[0].payload_base64.is_some());
    assert_eq!(bridge.sink.write_count().await, 0);
    assert_eq!(bridge.pipeline.offset_tracker().commit_ready(&partition(0)), None);
    assert_eq!(bridge.source.committed(&partition(0)), None);
}

#[tokio::test]
async fn test_transient_failures_then_success_write_once() {
    let mut bridge = bounded_bridge();
    for _ in 0..3 {
        bridge
            .sink
            .fail_next(ApplyError::Transient("connection reset".to_string()))
            .await;
    }
    bridge
        .source
        .push_message(changed_message(&partition(0), 0, "abc123"));
    bridge.source.push_error(end_of(0));

    assert_eq!(run(&mut bridge, CancellationToken::new()).await, Ok(()));

    assert_eq!(bridge.sink.write_count().await, 1);
    assert_eq!(bridge.sink.documents().await.len(), 1);
    assert!(bridge.reporter.reports().is_empty());
    assert_eq!(bridge.source.committed(&partition(0)), Some(0));
}

#[tokio::test]
async fn test_bad_messages_do_not_block_the_partition() {
    let mut bridge = bounded_bridge();
    bridge
        .sink
        .fail_next(ApplyError::Permanent("document too large".to_string()))
        .await;
    bridge
        .source
        .push_message(changed_message(&partition(0), 0, "too-large"));
    bridge
        .source
        .push_message(raw_message(&partition(0), 1, b"{\"type\":"));
    bridge.source.push_message(json_message(
        &partition(0),
        2,
        &json!({"type": "documentChanged", "change": {}}),
    ));
    bridge
        .source
        .push_message(changed_message(&partition(0), 3, "abc123"));
    bridge.source.push_error(end_of(0));

    assert_eq!(run(&mut bridge, CancellationToken::new()).await, Ok(()));

    let reasons: Vec<SkipReason> = bridge
        .reporter
        .reports()
        .iter()
        .map(|report| report.reason)
        .collect();
    assert_eq!(
        reasons,
        vec![
            SkipReason::PermanentApplyFailure,
            SkipReason::Unparseable,
            SkipReason::MalformedPayload,
        ]
    );
    assert!(bridge
        .sink
        .document(&SinkIdentifier::String("abc123".to_string()))
        .await
        .is_some());
    assert_eq!(bridge.source.committed(&partition(0)), Some(3));
}

#[tokio::test]
async fn test_exhausted_retries_are_reported_and_skipped() {
    let mut bridge = bounded_bridge();
    for _ in 0..5 {
        bridge
            .sink
            .fail_next(ApplyError::Transient("timed out".to_string()))
            .await;
    }
    bridge
        .source
        .push_message(changed_message(&partition(0), 0, "poisoned"));
    bridge
        .source
        .push_message(changed_message(&partition(0), 1, "healthy"));
    bridge.source.push_error(end_of(0));

    assert_eq!(run(&mut bridge, CancellationToken::new()).await, Ok(()));

    let reports = bridge.reporter.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].reason, SkipReason::RetriesExhausted);
    assert_eq!(reports[0].offset, 0);
    assert_eq!(bridge.sink.write_count().await, 1);
    assert_eq!(bridge.source.committed(&partition(0)), Some(1));
}

#[tokio::test]
async fn test_delete_removes_document() {
    let mut bridge = bounded_bridge();
    bridge
        .source
        .push_message(changed_message(&partition(0), 0, "abc123"));
    bridge
        .source
        .push_message(json_message(&partition(0), 1, &document_deleted("abc123")));
    bridge
        .source
        .push_message(json_message(&partition(0), 2, &document_deleted("abc123")));
    bridge.source.push_error(end_of(0));

    assert_eq!(run(&mut bridge, CancellationToken::new()).await, Ok(()));

    assert!(bridge.sink.documents().await.is_empty());
    assert_eq!(bridge.source.committed(&partition(0)), Some(2));
}

#[tokio::test]
async fn test_committed_offsets_never_pass_applied_offsets() {
    let mut bridge = bridge_with(|config| config.commit_interval = Duration::from_millis(5));
    let composite = json!({
        "type": "documentChanged",
        "change": {"newValue": {"_id": {"region": "eu", "serial": 9}, "name": "widget"}}
    });

    for offset in 0..20 {
        let message = match offset % 4 {
            1 => raw_message(&partition(0), offset, b"garbage"),
            3 => json_message(&partition(0), offset, &composite),
            _ => changed_message(&partition(0), offset, &format!("doc-{offset}")),
        };
        bridge.source.push_message(message);
        bridge.source.push_pause(Duration::from_millis(2));
    }
    bridge.source.push_error(end_of(0));

    assert_eq!(run(&mut bridge, CancellationToken::new()).await, Ok(()));

    let applied: Vec<i64> = (0..20).filter(|offset| offset % 2 == 0).collect();
    let commits = bridge.source.commits();
    assert!(!commits.is_empty());

    let mut previous = i64::MIN;
    for commit in &commits {
        assert!(
            applied.contains(&commit.applied_offset),
            "committed offset {} was never applied",
            commit.applied_offset
        );
        assert!(commit.applied_offset >= previous, "commits went backwards");
        previous = commit.applied_offset;
    }

    let last = commits.last().unwrap();
    assert!(last.sync);
    assert_eq!(last.applied_offset, 18);
    assert_eq!(
        bridge.pipeline.offset_tracker().commit_ready(&partition(0)),
        Some(18)
    );
}

#[tokio::test]
async fn test_partitions_progress_independently() {
    let mut bridge = bounded_bridge();
    for offset in 0..3 {
        bridge
            .source
            .push_message(changed_message(&partition(0), offset, &format!("p0-{offset}")));
        if offset < 2 {
            bridge
                .source
                .push_message(changed_message(&partition(1), offset, &format!("p1-{offset}")));
        }
    }
    bridge.source.push_error(end_of(0));
    bridge.source.push_error(end_of(1));

    assert_eq!(run(&mut bridge, CancellationToken::new()).await, Ok(()));

    assert_eq!(bridge.sink.documents().await.len(), 5);
    assert_eq!(bridge.source.committed(&partition(0)), Some(2));
    assert_eq!(bridge.source.committed(&partition(1)), Some(1));
}

#[tokio::test]
async fn test_empty_partition_reaching_its_end_first_does_not_drain() {
    let mut bridge = bounded_bridge();
    bridge.source.push_error(end_of(1));
    bridge
        .source
        .push_message(changed_message(&partition(0), 0, "first"));
    bridge
        .source
        .push_message(changed_message(&partition(0), 1, "second"));
    bridge.source.push_error(end_of(0));

    assert_eq!(run(&mut bridge, CancellationToken::new()).await, Ok(()));

    assert_eq!(bridge.source.pending(), 0);
    assert_eq!(bridge.sink.write_count().await, 2);
    assert_eq!(bridge.source.committed(&partition(0)), Some(1));
    assert_eq!(bridge.source.committed(&partition(1)), None);
}

#[tokio::test]
async fn test_bounded_run_waits_for_every_partition() {
    let mut bridge = bounded_bridge();
    bridge
        .source
        .push_message(changed_message(&partition(0), 0, "first"));
    bridge
        .source
        .push_message(changed_message(&partition(1), 0, "second"));
    bridge.source.push_error(end_of(0));
    bridge
        .source
        .push_message(changed_message(&partition(1), 1, "third"));
    bridge.source.push_error(end_of(1));

    assert_eq!(run(&mut bridge, CancellationToken::new()).await, Ok(()));

    assert_eq!(bridge.source.pending(), 0);
    assert_eq!(bridge.sink.documents().await.len(), 3);
    assert_eq!(bridge.source.committed(&partition(1)), Some(1));
}

#[tokio::test]
async fn test_stop_signal_drains_and_flushes() {
    let mut bridge = bridge_with(|config| config.stop_at_partition_eof = false);
    bridge
        .source
        .push_message(changed_message(&partition(0), 0, "abc123"));

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    assert_eq!(run(&mut bridge, shutdown).await, Ok(()));

    assert_eq!(bridge.pipeline.state(), PipelineState::Draining);
    let commits = bridge.source.commits();
    assert_eq!(commits.len(), 1);
    assert!(commits[0].sync);
    assert_eq!(commits[0].applied_offset, 0);
    assert!(bridge.source.is_closed());
}

#[tokio::test]
async fn test_periodic_commits_are_async() {
    let mut bridge = bridge_with(|config| {
        config.stop_at_partition_eof = false;
        config.commit_interval = Duration::from_millis(20);
    });
    bridge
        .source
        .push_message(changed_message(&partition(0), 0, "abc123"));

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    assert_eq!(run(&mut bridge, shutdown).await, Ok(()));

    let commits = bridge.source.commits();
    // Unchanged offsets are not committed again until the final flush.
    assert_eq!(commits.len(), 2);
    assert!(!commits[0].sync);
    assert!(commits[1].sync);
    assert!(commits.iter().all(|commit| commit.applied_offset == 0));
}

#[tokio::test]
async fn test_sink_auth_failure_fails_pipeline() {
    let mut bridge = bridge_with(|config| config.stop_at_partition_eof = false);
    bridge
        .sink
        .fail_next(ApplyError::Unauthorized("auth failed".to_string()))
        .await;
    bridge
        .source
        .push_message(changed_message(&partition(0), 0, "abc123"));
    bridge
        .source
        .push_message(changed_message(&partition(0), 1, "def456"));

    let result = run(&mut bridge, CancellationToken::new()).await;

    assert_eq!(
        result,
        Err(FatalError::AuthFailure {
            component: "sink",
            message: "auth failed".to_string(),
        })
    );
    assert_eq!(bridge.pipeline.state(), PipelineState::Failed);
    assert_eq!(bridge.source.committed(&partition(0)), None);
    assert!(bridge.source.is_closed());
}

#[tokio::test]
async fn test_source_auth_failure_flushes_applied_offsets() {
    let mut bridge = bridge_with(|config| config.stop_at_partition_eof = false);
    bridge
        .source
        .push_message(changed_message(&partition(0), 0, "abc123"));
    bridge.source.push_pause(Duration::from_millis(200));
    bridge
        .source
        .push_error(SourceError::Fatal(FatalError::AuthFailure {
            component: "kafka",
            message: "SASL authentication failed".to_string(),
        }));

    let result = run(&mut bridge, CancellationToken::new()).await;

    assert!(matches!(
        result,
        Err(FatalError::AuthFailure {
            component: "kafka",
            ..
        })
    ));
    assert_eq!(bridge.pipeline.state(), PipelineState::Failed);
    let commits = bridge.source.commits();
    assert_eq!(commits.len(), 1);
    assert!(commits[0].sync);
    assert_eq!(commits[0].applied_offset, 0);
    assert!(bridge.source.is_closed());
}

#[tokio::test]
async fn test_connection_loss_beyond_tolerance_fails() {
    let mut bridge = bridge_with(|config| {
        config.stop_at_partition_eof = false;
        config.connection_loss_tolerance = Duration::ZERO;
    });
    bridge
        .source
        .push_error(SourceError::ConnectionLost("all brokers down".to_string()));

    let result = run(&mut bridge, CancellationToken::new()).await;

    assert_eq!(
        result,
        Err(FatalError::ConnectionLost {
            component: "kafka",
            message: "all brokers down".to_string(),
        })
    );
    assert_eq!(bridge.pipeline.state(), PipelineState::Failed);
}

#[tokio::test]
async fn test_connection_loss_followed_by_silence_fails() {
    let mut bridge = bridge_with(|config| {
        config.stop_at_partition_eof = false;
        config.connection_loss_tolerance = Duration::from_millis(50);
    });
    bridge
        .source
        .push_error(SourceError::ConnectionLost("all brokers down".to_string()));
    bridge
        .source
        .push_error(SourceError::Transient("broker transport failure".to_string()));

    let result = run(&mut bridge, CancellationToken::new()).await;

    assert_eq!(
        result,
        Err(FatalError::ConnectionLost {
            component: "kafka",
            message: "all brokers down".to_string(),
        })
    );
    assert_eq!(bridge.pipeline.state(), PipelineState::Failed);
    assert!(bridge.source.is_closed());
}

#[tokio::test]
async fn test_message_after_connection_loss_resets_tolerance() {
    let mut bridge = bridge_with(|config| {
        config.stop_at_partition_eof = false;
        config.connection_loss_tolerance = Duration::from_millis(100);
    });
    bridge
        .source
        .push_error(SourceError::ConnectionLost("all brokers down".to_string()));
    bridge
        .source
        .push_message(changed_message(&partition(0), 0, "abc123"));

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    assert_eq!(run(&mut bridge, shutdown).await, Ok(()));
    assert_eq!(bridge.pipeline.state(), PipelineState::Draining);
    assert_eq!(bridge.source.committed(&partition(0)), Some(0));
}

#[tokio::test]
async fn test_recoverable_source_errors_keep_polling() {
    let mut bridge = bounded_bridge();
    bridge
        .source
        .push_error(SourceError::ConnectionLost("all brokers down".to_string()));
    bridge
        .source
        .push_error(SourceError::Transient("broker transport failure".to_string()));
    bridge
        .source
        .push_message(changed_message(&partition(0), 0, "abc123"));
    bridge.source.push_error(end_of(0));

    assert_eq!(run(&mut bridge, CancellationToken::new()).await, Ok(()));

    assert_eq!(bridge.sink.write_count().await, 1);
    assert_eq!(bridge.source.committed(&partition(0)), Some(0));
}

#[tokio::test]
async fn test_subscribe_failure_is_fatal() {
    let mut bridge = bounded_bridge();
    bridge
        .source
        .fail_subscribe(SourceError::Fatal(FatalError::AuthFailure {
            component: "kafka",
            message: "topic authorization failed".to_string(),
        }));

    let result = run(&mut bridge, CancellationToken::new()).await;

    assert!(matches!(result, Err(FatalError::AuthFailure { .. })));
    assert_eq!(bridge.pipeline.state(), PipelineState::Failed);
    assert!(bridge.source.is_closed());
    assert!(bridge.source.commits().is_empty());
}
