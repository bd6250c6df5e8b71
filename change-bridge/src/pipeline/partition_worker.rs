//! Partition Worker - Dedicated worker for the change events of a single partition
//!
//! Each partition gets its own worker with a bounded channel, ensuring:
//! 1. Events are applied in offset order within each partition
//! 2. Partitions are applied in parallel
//! 3. Backpressure reaches the poll loop when a partition falls behind

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::FatalError;
use crate::kafka::offset_tracker::OffsetTracker;
use crate::kafka::types::{Partition, SourceMessage};
use crate::metrics_consts::EVENTS_RECEIVED_COUNTER;
use crate::pipeline::processor::{EventOutcome, EventProcessor};

#[derive(Debug, Clone)]
pub struct PartitionWorkerConfig {
    /// Number of messages buffered per partition
    pub channel_buffer_size: usize,
}

impl Default for PartitionWorkerConfig {
    fn default() -> Self {
        Self {
            channel_buffer_size: 100,
        }
    }
}

/// A worker that applies the messages of a single partition
pub struct PartitionWorker {
    partition: Partition,
    sender: mpsc::Sender<SourceMessage>,
    handle: Option<JoinHandle<()>>,
}

impl PartitionWorker {
    /// Spawn a worker. It runs until its sender is dropped (after finishing
    /// the queued messages), `cancel` fires (between messages), or an event
    /// hits a fatal condition, which is forwarded on `fatal_tx`.
    pub fn new(
        partition: Partition,
        processor: Arc<EventProcessor>,
        offset_tracker: Arc<OffsetTracker>,
        fatal_tx: mpsc::UnboundedSender<FatalError>,
        cancel: CancellationToken,
        config: &PartitionWorkerConfig,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.channel_buffer_size);
        let partition_clone = partition.clone();

        let handle = tokio::spawn(async move {
            Self::run_worker(
                partition_clone,
                receiver,
                processor,
                offset_tracker,
                fatal_tx,
                cancel,
            )
            .await;
        });

        Self {
            partition,
            sender,
            handle: Some(handle),
        }
    }

    /// Get a clone of the sender, so the caller can await capacity without
    /// holding a borrow of the worker
    pub fn sender(&self) -> mpsc::Sender<SourceMessage> {
        self.sender.clone()
    }

    /// Stop accepting messages and wait for the worker to finish.
    ///
    /// A worker still busy after `timeout` is aborted; its unfinished events
    /// were never recorded and will be redelivered. A worker that panicked is
    /// reported as `FatalError::WorkerCrashed`.
    pub async fn shutdown(mut self, timeout: Duration) -> Result<(), FatalError> {
        drop(self.sender);

        let Some(mut handle) = self.handle.take() else {
            return Ok(());
        };

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => {
                debug!(
                    topic = self.partition.topic(),
                    partition = self.partition.partition_number(),
                    "Partition worker shut down gracefully"
                );
                Ok(())
            }
            Ok(Err(e)) => {
                error!(
                    topic = self.partition.topic(),
                    partition = self.partition.partition_number(),
                    error = %e,
                    "Partition worker panicked"
                );
                Err(FatalError::WorkerCrashed(self.partition))
            }
            Err(_) => {
                warn!(
                    topic = self.partition.topic(),
                    partition = self.partition.partition_number(),
                    timeout = ?timeout,
                    "Partition worker did not stop in time, aborting"
                );
                handle.abort();
                Ok(())
            }
        }
    }

    async fn run_worker(
        partition: Partition,
        mut receiver: mpsc::Receiver<SourceMessage>,
        processor: Arc<EventProcessor>,
        offset_tracker: Arc<OffsetTracker>,
        fatal_tx: mpsc::UnboundedSender<FatalError>,
        cancel: CancellationToken,
    ) {
        info!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            "Starting partition worker"
        );

        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                message = receiver.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            metrics::counter!(
                EVENTS_RECEIVED_COUNTER,
                "partition" => partition.partition_number().to_string()
            )
            .increment(1);

            let outcome = processor.process(&message, &cancel).await;
            if outcome.advances_offset() {
                offset_tracker.record(&partition, message.offset);
                continue;
            }

            match outcome {
                EventOutcome::Interrupted => {
                    debug!(
                        topic = partition.topic(),
                        partition = partition.partition_number(),
                        offset = message.offset,
                        "Stopped while retrying, offset not recorded"
                    );
                    break;
                }
                EventOutcome::Fatal(e) => {
                    error!(
                        topic = partition.topic(),
                        partition = partition.partition_number(),
                        offset = message.offset,
                        error = %e,
                        "Fatal error while applying change event"
                    );
                    if fatal_tx.send(e).is_err() {
                        warn!("Pipeline loop is gone, dropping fatal error");
                    }
                    break;
                }
                // Skipped events were reported by the processor.
                _ => {}
            }
        }

        info!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            "Partition worker shutting down"
        );
    }
}
