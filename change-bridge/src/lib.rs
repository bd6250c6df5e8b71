//! Change bridge: replicates document change events from a Kafka topic into a
//! MongoDB collection with at-least-once delivery.
//!
//! ## Error logging (anyhow)
//!
//! When logging `anyhow::Error` or other error types that implement `std::error::Error` with
//! a cause chain, use formats that include the full chain so root causes are visible in logs:
//!
//! - **Inline format:** `{e:#}` (full chain on one line, `outer: middle: root cause`).
//! - **Structured field:** `error = ?e` (full chain with `Caused by:` sections).
//!
//! Avoid `{}` / `%e` (Display) for `anyhow::Error`, it only shows the top-level message.
//!
//! When constructing errors, use `.context()` / `.with_context()` so the original error remains
//! the source.

pub mod applier;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod event;
pub mod kafka;
pub mod metrics_consts;
pub mod pipeline;
pub mod reconcile;
pub mod retry;
pub mod server;
pub mod service;
pub mod sink;
pub mod test_utils;

pub use error::{ApplyError, DecodeError, FatalError, ReconcileError, SourceError};
pub use pipeline::{PipelineConfig, PipelineLoop, PipelineState};
