use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::error::ApplyError;
use crate::metrics_consts::APPLY_DURATION_HISTOGRAM;
use crate::reconcile::{ReconciledWrite, WriteOperation};
use crate::sink::DocumentSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Upserted,
    Deleted,
}

/// Executes reconciled writes against the sink, one durable mutation per
/// successful call. Every call is bounded by `write_timeout`, an elapsed
/// timeout is reported as a transient failure.
pub struct ChangeApplier {
    sink: Arc<dyn DocumentSink>,
    write_timeout: Duration,
}

impl ChangeApplier {
    pub fn new(sink: Arc<dyn DocumentSink>, write_timeout: Duration) -> Self {
        Self {
            sink,
            write_timeout,
        }
    }

    pub async fn apply(&self, write: &ReconciledWrite) -> Result<Applied, ApplyError> {
        let start = Instant::now();

        let result = timeout(self.write_timeout, async {
            match write.operation {
                WriteOperation::Upsert => self
                    .sink
                    .upsert(&write.sink_identifier, &write.document)
                    .await
                    .map(|()| Applied::Upserted),
                WriteOperation::Delete => self
                    .sink
                    .delete(&write.sink_identifier)
                    .await
                    .map(|()| Applied::Deleted),
            }
        })
        .await
        .unwrap_or_else(|_| {
            Err(ApplyError::Transient(format!(
                "{} write timed out after {:?}",
                self.sink.name(),
                self.write_timeout
            )))
        });

        let status = if result.is_ok() { "success" } else { "failure" };
        metrics::histogram!(
            APPLY_DURATION_HISTOGRAM,
            "operation" => write.operation.as_str(),
            "status" => status
        )
        .record(start.elapsed().as_secs_f64());

        result
    }
}
