// ==== Pipeline metrics ====
/// Counter for messages handed to partition workers
pub const EVENTS_RECEIVED_COUNTER: &str = "change_bridge_events_received_total";

/// Counter for writes confirmed by the sink (with operation label: upsert/delete)
pub const EVENTS_APPLIED_COUNTER: &str = "change_bridge_events_applied_total";

/// Counter for events skipped without a write (with reason label)
pub const EVENTS_SKIPPED_COUNTER: &str = "change_bridge_events_skipped_total";

/// Counter for events of a kind the pipeline does not handle
pub const EVENTS_UNKNOWN_COUNTER: &str = "change_bridge_events_unknown_total";

/// Counter for transient sink failures that were retried
pub const APPLY_RETRIES_COUNTER: &str = "change_bridge_apply_retries_total";

/// Histogram for sink write duration (with operation and status labels)
pub const APPLY_DURATION_HISTOGRAM: &str = "change_bridge_apply_duration_seconds";

/// Counter for skip reports that could not be delivered to the dead letter topic
pub const DEAD_LETTER_FAILURES_COUNTER: &str = "change_bridge_dead_letter_failures_total";

// ==== Offset metrics ====
/// Gauge for the highest applied offset per partition
pub const PARTITION_APPLIED_OFFSET: &str = "change_bridge_partition_applied_offset";

/// Counter for out-of-order (lower than watermark) offset confirmations
pub const OFFSET_TRACKER_OUT_OF_ORDER: &str = "change_bridge_offset_out_of_order_total";

/// Counter for offset commits to the source (with status label: success/failure)
pub const OFFSET_COMMITS_COUNTER: &str = "change_bridge_offset_commits_total";

// ==== Source metrics ====
/// Counter for errors returned by the source while polling (with kind label)
pub const SOURCE_ERRORS_COUNTER: &str = "change_bridge_source_errors_total";
