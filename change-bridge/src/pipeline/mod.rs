//! The control loop that moves change events from the source into the sink.
//!
//! One `PipelineLoop` polls the source and fans messages out to a
//! `PartitionWorker` per partition. Workers decode, reconcile and apply each
//! event in offset order and record progress in the shared `OffsetTracker`.
//! The loop commits recorded progress on a timer and once more, synchronously,
//! on every exit path before the source is closed.

pub mod partition_worker;
pub mod processor;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rdkafka::consumer::CommitMode;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{FatalError, SourceError};
use crate::kafka::offset_tracker::OffsetTracker;
use crate::kafka::source::ChangeSource;
use crate::kafka::types::{Partition, SourceMessage};
use crate::metrics_consts::{OFFSET_COMMITS_COUNTER, SOURCE_ERRORS_COUNTER};
use partition_worker::{PartitionWorker, PartitionWorkerConfig};
use processor::EventProcessor;

pub use processor::EventOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Not started yet.
    Idle,
    /// Waiting for the next message. Decoding, reconciling and applying
    /// happen concurrently in the partition workers.
    Polling,
    /// Handing recorded progress to the source.
    Committing,
    /// Stopped on request or at the end of a bounded run.
    Draining,
    /// Stopped on a fatal condition.
    Failed,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub topic: String,
    pub poll_timeout: Duration,
    pub commit_interval: Duration,
    /// Bounded run: drain once every assigned partition reached its end.
    pub stop_at_partition_eof: bool,
    /// How long workers get to finish when the loop stops.
    pub shutdown_timeout: Duration,
    pub channel_buffer_size: usize,
    /// How long consecutive connection losses are tolerated before failing.
    pub connection_loss_tolerance: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            topic: String::new(),
            poll_timeout: Duration::from_secs(1),
            commit_interval: Duration::from_secs(5),
            stop_at_partition_eof: false,
            shutdown_timeout: Duration::from_secs(30),
            channel_buffer_size: 100,
            connection_loss_tolerance: Duration::from_secs(60),
        }
    }
}

pub struct PipelineLoop {
    config: PipelineConfig,
    source: Arc<dyn ChangeSource>,
    processor: Arc<EventProcessor>,
    offset_tracker: Arc<OffsetTracker>,
    workers: HashMap<Partition, PartitionWorker>,
    /// Partitions whose end was reached and that received nothing since.
    at_eof: HashSet<Partition>,
    last_committed: HashMap<Partition, i64>,
    state: PipelineState,
}

impl PipelineLoop {
    pub fn new(
        config: PipelineConfig,
        source: Arc<dyn ChangeSource>,
        processor: Arc<EventProcessor>,
    ) -> Self {
        Self {
            config,
            source,
            processor,
            offset_tracker: Arc::new(OffsetTracker::new()),
            workers: HashMap::new(),
            at_eof: HashSet::new(),
            last_committed: HashMap::new(),
            state: PipelineState::Idle,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn offset_tracker(&self) -> Arc<OffsetTracker> {
        self.offset_tracker.clone()
    }

    /// Run until `shutdown` fires, a bounded run reaches the end of its
    /// partitions, or a fatal condition occurs. `Ok` means the loop drained,
    /// `Err` that it failed. Either way already applied offsets have been
    /// committed and the source is closed when this returns.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<(), FatalError> {
        if let Err(e) = self.source.subscribe(&self.config.topic).await {
            let fatal = into_fatal(e);
            error!(topic = %self.config.topic, error = %fatal, "Failed to subscribe");
            self.source.close().await;
            self.state = PipelineState::Failed;
            return Err(fatal);
        }

        let worker_cancel = shutdown.child_token();
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
        let source = self.source.clone();
        let poll_timeout = self.config.poll_timeout;

        let mut commit_interval = tokio::time::interval(self.config.commit_interval);
        commit_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        commit_interval.tick().await;

        let mut connection_loss: Option<ConnectionLoss> = None;
        self.state = PipelineState::Polling;
        info!(topic = %self.config.topic, "Starting change pipeline");

        let result = loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Stop signal received, draining");
                    break Ok(());
                }

                Some(fatal) = fatal_rx.recv() => {
                    break Err(fatal);
                }

                _ = commit_interval.tick() => {
                    self.commit(CommitMode::Async).await;
                }

                polled = source.poll(poll_timeout) => {
                    match polled {
                        Ok(None) => {}
                        Ok(Some(message)) => {
                            connection_loss = None;
                            if let Err(partition) =
                                self.dispatch(message, &fatal_tx, &worker_cancel, &shutdown).await
                            {
                                // A worker only hangs up after a fatal error or a panic.
                                break Err(fatal_rx
                                    .try_recv()
                                    .unwrap_or(FatalError::WorkerCrashed(partition)));
                            }
                        }
                        Err(SourceError::EndOfPartition(partition)) => {
                            connection_loss = None;
                            debug!(partition = %partition, "Reached end of partition");
                            self.at_eof.insert(partition);
                            if self.config.stop_at_partition_eof && self.all_assigned_at_eof() {
                                info!(
                                    partitions = self.at_eof.len(),
                                    "All partitions reached their end, draining"
                                );
                                break Ok(());
                            }
                        }
                        Err(SourceError::ConnectionLost(message)) => {
                            metrics::counter!(SOURCE_ERRORS_COUNTER, "kind" => "connection_lost")
                                .increment(1);
                            let loss = connection_loss.get_or_insert_with(|| ConnectionLoss {
                                since: Instant::now(),
                                message: String::new(),
                            });
                            loss.message = message;
                            warn!(
                                error = %loss.message,
                                lost_for = ?loss.since.elapsed(),
                                "Lost connection to the source, waiting for it to recover"
                            );
                        }
                        Err(SourceError::Transient(message)) => {
                            metrics::counter!(SOURCE_ERRORS_COUNTER, "kind" => "transient")
                                .increment(1);
                            warn!(error = %message, "Transient source error");
                        }
                        Err(SourceError::Fatal(fatal)) => {
                            break Err(fatal);
                        }
                    }

                    // Only a message or an end of partition proves the source is back.
                    if let Some(loss) = &connection_loss {
                        if loss.since.elapsed() >= self.config.connection_loss_tolerance {
                            break Err(FatalError::ConnectionLost {
                                component: "kafka",
                                message: loss.message.clone(),
                            });
                        }
                    }
                }
            }
        };

        if let Err(fatal) = &result {
            error!(error = %fatal, "Pipeline failed");
        }
        self.finish(result, &worker_cancel).await
    }

    async fn dispatch(
        &mut self,
        message: SourceMessage,
        fatal_tx: &mpsc::UnboundedSender<FatalError>,
        worker_cancel: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> Result<(), Partition> {
        let partition = message.partition.clone();
        self.at_eof.remove(&partition);

        let sender = self
            .workers
            .entry(partition.clone())
            .or_insert_with(|| {
                PartitionWorker::new(
                    partition.clone(),
                    self.processor.clone(),
                    self.offset_tracker.clone(),
                    fatal_tx.clone(),
                    worker_cancel.clone(),
                    &PartitionWorkerConfig {
                        channel_buffer_size: self.config.channel_buffer_size,
                    },
                )
            })
            .sender();

        tokio::select! {
            biased;
            // Not handed over, so never recorded: the message is redelivered.
            _ = shutdown.cancelled() => Ok(()),
            sent = sender.send(message) => sent.map_err(|_| partition),
        }
    }

    /// True once every partition assigned to this consumer reported its end
    /// and received nothing since.
    fn all_assigned_at_eof(&self) -> bool {
        match self.source.assignment() {
            Ok(assigned) => {
                !assigned.is_empty()
                    && assigned
                        .iter()
                        .all(|partition| self.at_eof.contains(partition))
            }
            Err(e) => {
                warn!(error = %e, "Failed to read the partition assignment, not draining yet");
                false
            }
        }
    }

    /// Commit recorded progress. Periodic async commits skip partitions that
    /// did not move since their last commit, a sync commit covers them all.
    async fn commit(&mut self, mode: CommitMode) {
        let previous = self.state;
        self.state = PipelineState::Committing;
        let only_changed = matches!(mode, CommitMode::Async);

        for (partition, applied_offset) in self.offset_tracker.committable() {
            if only_changed && self.last_committed.get(&partition) == Some(&applied_offset) {
                continue;
            }

            match self.source.commit(&partition, applied_offset, mode).await {
                Ok(()) => {
                    debug!(
                        partition = %partition,
                        applied_offset = applied_offset,
                        "Committed offset"
                    );
                    metrics::counter!(OFFSET_COMMITS_COUNTER, "status" => "success").increment(1);
                    self.last_committed.insert(partition, applied_offset);
                }
                Err(e) => {
                    warn!(
                        partition = %partition,
                        applied_offset = applied_offset,
                        error = %e,
                        "Failed to commit offset"
                    );
                    metrics::counter!(OFFSET_COMMITS_COUNTER, "status" => "failure").increment(1);
                }
            }
        }

        self.state = previous;
    }

    /// Stop the workers, flush the final offsets and release the source.
    async fn finish(
        &mut self,
        mut result: Result<(), FatalError>,
        worker_cancel: &CancellationToken,
    ) -> Result<(), FatalError> {
        if result.is_err() {
            worker_cancel.cancel();
        }

        for (_, worker) in self.workers.drain() {
            if let Err(crashed) = worker.shutdown(self.config.shutdown_timeout).await {
                if result.is_ok() {
                    result = Err(crashed);
                }
            }
        }

        self.commit(CommitMode::Sync).await;
        for progress in self.offset_tracker.progress() {
            info!(
                partition = %progress.partition,
                applied_offset = progress.applied_offset,
                "Final applied offset"
            );
        }
        self.source.close().await;

        self.state = if result.is_ok() {
            PipelineState::Draining
        } else {
            PipelineState::Failed
        };
        info!(state = ?self.state, "Change pipeline stopped");
        result
    }
}

/// Consecutive connection losses since the source last delivered something.
struct ConnectionLoss {
    since: Instant,
    message: String,
}

fn into_fatal(err: SourceError) -> FatalError {
    match err {
        SourceError::Fatal(fatal) => fatal,
        other => FatalError::ConnectionLost {
            component: "kafka",
            message: other.to_string(),
        },
    }
}
