//! In-memory collaborators for driving the pipeline without a broker or a
//! database.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::CommitMode;
use serde_json::{json, Value};

use crate::applier::ChangeApplier;
use crate::diagnostics::{SkipReport, SkipReporter};
use crate::error::SourceError;
use crate::event::{DecoderConfig, EventDecoder};
use crate::kafka::source::ChangeSource;
use crate::kafka::types::{Partition, SourceMessage};
use crate::pipeline::processor::EventProcessor;
use crate::reconcile::{IdentifierReconciler, ReconcilerConfig};
use crate::retry::RetryPolicy;
use crate::sink::memory::MemorySink;

/// An offset commit as seen by the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommit {
    pub partition: Partition,
    pub applied_offset: i64,
    pub sync: bool,
}

enum Scripted {
    Message(SourceMessage),
    Error(SourceError),
    Pause(Duration),
}

#[derive(Default)]
struct SourceState {
    queue: VecDeque<Scripted>,
    subscribe_error: Option<SourceError>,
    subscribed: Option<String>,
    assigned: BTreeSet<Partition>,
    commits: Vec<RecordedCommit>,
    closed: bool,
}

/// Scripted `ChangeSource`: polls return the queued messages, errors and
/// pauses in order, then time out. Every partition a scripted message or end
/// of partition refers to counts as assigned. Clones share state.
#[derive(Clone, Default)]
pub struct MemorySource {
    state: Arc<Mutex<SourceState>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_message(&self, message: SourceMessage) {
        let mut state = self.state.lock().unwrap();
        state.assigned.insert(message.partition.clone());
        state.queue.push_back(Scripted::Message(message));
    }

    pub fn push_error(&self, error: SourceError) {
        let mut state = self.state.lock().unwrap();
        if let SourceError::EndOfPartition(partition) = &error {
            state.assigned.insert(partition.clone());
        }
        state.queue.push_back(Scripted::Error(error));
    }

    /// Make one poll come back empty only after `duration`.
    pub fn push_pause(&self, duration: Duration) {
        self.state
            .lock()
            .unwrap()
            .queue
            .push_back(Scripted::Pause(duration));
    }

    pub fn fail_subscribe(&self, error: SourceError) {
        self.state.lock().unwrap().subscribe_error = Some(error);
    }

    pub fn subscribed(&self) -> Option<String> {
        self.state.lock().unwrap().subscribed.clone()
    }

    pub fn commits(&self) -> Vec<RecordedCommit> {
        self.state.lock().unwrap().commits.clone()
    }

    /// The last offset committed for `partition`, if any.
    pub fn committed(&self, partition: &Partition) -> Option<i64> {
        self.state
            .lock()
            .unwrap()
            .commits
            .iter()
            .rev()
            .find(|commit| &commit.partition == partition)
            .map(|commit| commit.applied_offset)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn pending(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }
}

#[async_trait]
impl ChangeSource for MemorySource {
    async fn subscribe(&self, topic: &str) -> Result<(), SourceError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.subscribe_error.take() {
            return Err(error);
        }
        state.subscribed = Some(topic.to_string());
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> Result<Option<SourceMessage>, SourceError> {
        let next = self.state.lock().unwrap().queue.pop_front();
        match next {
            Some(Scripted::Message(message)) => Ok(Some(message)),
            Some(Scripted::Error(error)) => Err(error),
            Some(Scripted::Pause(duration)) => {
                tokio::time::sleep(duration).await;
                Ok(None)
            }
            None => {
                tokio::time::sleep(timeout).await;
                Ok(None)
            }
        }
    }

    async fn commit(
        &self,
        partition: &Partition,
        applied_offset: i64,
        mode: CommitMode,
    ) -> Result<(), SourceError> {
        self.state.lock().unwrap().commits.push(RecordedCommit {
            partition: partition.clone(),
            applied_offset,
            sync: matches!(mode, CommitMode::Sync),
        });
        Ok(())
    }

    fn assignment(&self) -> Result<Vec<Partition>, SourceError> {
        Ok(self.state.lock().unwrap().assigned.iter().cloned().collect())
    }

    async fn close(&self) {
        self.state.lock().unwrap().closed = true;
    }
}

/// Keeps every skip report for inspection.
#[derive(Clone, Default)]
pub struct RecordingReporter {
    reports: Arc<Mutex<Vec<SkipReport>>>,
}

impl RecordingReporter {
    pub fn reports(&self) -> Vec<SkipReport> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl SkipReporter for RecordingReporter {
    async fn report(&self, report: SkipReport) {
        self.reports.lock().unwrap().push(report);
    }
}

/// Processor with default decoding and reconciliation and a 1ms constant
/// backoff over five attempts.
pub fn test_processor(sink: &MemorySink, reporter: &RecordingReporter) -> EventProcessor {
    EventProcessor::new(
        EventDecoder::new(DecoderConfig::default()),
        IdentifierReconciler::new(ReconcilerConfig::default()),
        ChangeApplier::new(Arc::new(sink.clone()), Duration::from_secs(1)),
        RetryPolicy::build(1, Duration::from_millis(1))
            .max_attempts(5)
            .provide(),
        Arc::new(reporter.clone()),
    )
}

/// A `documentChanged` payload whose document carries `id`, a `_version`
/// and a `name`.
pub fn document_changed(id: &str) -> Value {
    json!({
        "type": "documentChanged",
        "change": {
            "newValue": {"_id": id, "_version": 7, "name": "widget"}
        }
    })
}

pub fn document_deleted(id: &str) -> Value {
    json!({
        "type": "documentDeleted",
        "change": {"oldValue": {"_id": id}}
    })
}

pub fn json_message(partition: &Partition, offset: i64, payload: &Value) -> SourceMessage {
    raw_message(partition, offset, payload.to_string().as_bytes())
}

pub fn changed_message(partition: &Partition, offset: i64, id: &str) -> SourceMessage {
    json_message(partition, offset, &document_changed(id))
}

pub fn raw_message(partition: &Partition, offset: i64, payload: &[u8]) -> SourceMessage {
    SourceMessage::new(partition.clone(), offset, Some(payload.to_vec()))
}
