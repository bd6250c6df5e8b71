use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::ApplyError;
use crate::reconcile::SinkIdentifier;

pub mod memory;
pub mod mongo;

/// A document store addressable by a single identifier per document.
///
/// Implementations classify their failures into [`ApplyError`] so the pipeline
/// can decide between retrying, skipping and stopping. Both writes must be
/// idempotent: `upsert` replaces by key and `delete` of an absent key succeeds.
#[async_trait]
pub trait DocumentSink: Send + Sync {
    /// Returns the name of the sink, used in logs.
    fn name(&self) -> &'static str;

    /// Replace the document stored under `identifier`, creating it if needed.
    async fn upsert(
        &self,
        identifier: &SinkIdentifier,
        document: &Map<String, Value>,
    ) -> Result<(), ApplyError>;

    /// Remove the document stored under `identifier`.
    async fn delete(&self, identifier: &SinkIdentifier) -> Result<(), ApplyError>;

    /// Health check.
    async fn ping(&self) -> Result<(), ApplyError>;
}
