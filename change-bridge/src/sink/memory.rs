use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::error::ApplyError;
use crate::reconcile::SinkIdentifier;
use crate::sink::DocumentSink;

#[derive(Debug, Default)]
struct Inner {
    documents: HashMap<SinkIdentifier, Map<String, Value>>,
    /// Number of calls that durably mutated (or confirmed) the store.
    writes: usize,
    /// Failures returned, in order, by the next write calls.
    injected_failures: VecDeque<ApplyError>,
}

/// In-memory document store for tests and local runs.
///
/// Clones share the same storage, so a test can keep a handle and inspect what
/// the pipeline wrote. Failures can be queued with [`MemorySink::fail_next`].
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<Inner>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next write call fail with `error`. Calls accumulate.
    pub async fn fail_next(&self, error: ApplyError) {
        self.inner.lock().await.injected_failures.push_back(error);
    }

    pub async fn document(&self, identifier: &SinkIdentifier) -> Option<Map<String, Value>> {
        self.inner.lock().await.documents.get(identifier).cloned()
    }

    pub async fn documents(&self) -> HashMap<SinkIdentifier, Map<String, Value>> {
        self.inner.lock().await.documents.clone()
    }

    pub async fn write_count(&self) -> usize {
        self.inner.lock().await.writes
    }
}

#[async_trait]
impl DocumentSink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn upsert(
        &self,
        identifier: &SinkIdentifier,
        document: &Map<String, Value>,
    ) -> Result<(), ApplyError> {
        let mut inner = self.inner.lock().await;
        if let Some(error) = inner.injected_failures.pop_front() {
            return Err(error);
        }
        inner.documents.insert(identifier.clone(), document.clone());
        inner.writes += 1;
        Ok(())
    }

    async fn delete(&self, identifier: &SinkIdentifier) -> Result<(), ApplyError> {
        let mut inner = self.inner.lock().await;
        if let Some(error) = inner.injected_failures.pop_front() {
            return Err(error);
        }
        inner.documents.remove(identifier);
        inner.writes += 1;
        Ok(())
    }

    async fn ping(&self) -> Result<(), ApplyError> {
        Ok(())
    }
}
