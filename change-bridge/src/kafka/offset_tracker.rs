//! Offset Tracker - Tracks the highest durably applied offset per partition
//!
//! The tracker is the only place partition progress is mutated. Workers call
//! `record` after the sink confirmed a write (or after an event that needed no
//! write), and the pipeline loop periodically asks which offsets are safe to
//! commit. Committing never goes past what has been recorded, which is the
//! at-least-once guarantee of the bridge.

use std::collections::HashMap;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::kafka::types::{Partition, PartitionProgress};
use crate::metrics_consts::{OFFSET_TRACKER_OUT_OF_ORDER, PARTITION_APPLIED_OFFSET};

/// Thread-safe map of partition to applied watermark.
///
/// Each partition has a single writer (its worker), so entries are never
/// contended. The map is shared only so the loop can read it when committing.
#[derive(Default)]
pub struct OffsetTracker {
    applied: DashMap<Partition, i64>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the event at `offset` has been applied.
    ///
    /// The watermark only moves forward: an offset at or below the current
    /// watermark is a no-op, which tolerates out-of-order confirmations.
    pub fn record(&self, partition: &Partition, offset: i64) {
        self.applied
            .entry(partition.clone())
            .and_modify(|applied| {
                if offset > *applied {
                    debug!(
                        topic = partition.topic(),
                        partition = partition.partition_number(),
                        previous_offset = *applied,
                        new_offset = offset,
                        "Advancing applied offset"
                    );
                    *applied = offset;
                } else if offset < *applied {
                    warn!(
                        topic = partition.topic(),
                        partition = partition.partition_number(),
                        offset = offset,
                        applied_offset = *applied,
                        "Offset confirmed out of order, watermark unchanged"
                    );
                    metrics::counter!(
                        OFFSET_TRACKER_OUT_OF_ORDER,
                        "topic" => partition.topic().to_string(),
                        "partition" => partition.partition_number().to_string()
                    )
                    .increment(1);
                }
            })
            .or_insert_with(|| {
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = offset,
                    "Initializing partition progress"
                );
                offset
            });

        if let Some(applied) = self.applied.get(partition) {
            metrics::gauge!(
                PARTITION_APPLIED_OFFSET,
                "topic" => partition.topic().to_string(),
                "partition" => partition.partition_number().to_string()
            )
            .set(*applied as f64);
        }
    }

    /// The offset safe to commit for `partition`: its applied watermark.
    /// `None` until something has been applied on the partition.
    pub fn commit_ready(&self, partition: &Partition) -> Option<i64> {
        self.applied.get(partition).map(|applied| *applied)
    }

    /// Snapshot of all partitions with progress, for a commit round.
    pub fn committable(&self) -> HashMap<Partition, i64> {
        self.applied
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    pub fn progress(&self) -> Vec<PartitionProgress> {
        let mut progress: Vec<PartitionProgress> = self
            .applied
            .iter()
            .map(|entry| PartitionProgress {
                partition: entry.key().clone(),
                applied_offset: *entry.value(),
            })
            .collect();
        progress.sort_by(|a, b| a.partition.cmp(&b.partition));
        progress
    }
}
