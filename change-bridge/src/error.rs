use thiserror::Error;

use crate::kafka::types::Partition;

/// Failure to turn raw message bytes into a `ChangeEvent`.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("message is not valid UTF-8 JSON")]
    Unparseable(#[source] serde_json::Error),
    #[error("malformed change payload: {0}")]
    MalformedPayload(String),
}

/// Failure to map a source identifier onto the sink's identifier scheme.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("composite identifier with fields {fields:?} has no configured sink mapping")]
    UnsupportedCompositeIdentifier { fields: Vec<String> },
    #[error("identifier {0} cannot be converted to a sink identifier")]
    InvalidIdentifier(String),
}

/// Classified failure of a sink write.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    /// Connectivity or timeout problems, the write may succeed if retried.
    #[error("transient sink failure: {0}")]
    Transient(String),
    /// The sink refused the document, retrying will not help.
    #[error("permanent sink failure: {0}")]
    Permanent(String),
    /// The sink refused our credentials. Escalated to `FatalError::AuthFailure`.
    #[error("sink rejected credentials: {0}")]
    Unauthorized(String),
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("reached the end of partition {0}")]
    EndOfPartition(Partition),
    #[error("lost connection to the source: {0}")]
    ConnectionLost(String),
    /// Broker hiccups the consumer recovers from on its own.
    #[error("transient source error: {0}")]
    Transient(String),
    #[error(transparent)]
    Fatal(#[from] FatalError),
}

/// Conditions that move the pipeline into the `Failed` state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FatalError {
    #[error("{component} authentication failed: {message}")]
    AuthFailure {
        component: &'static str,
        message: String,
    },
    #[error("connection to {component} lost: {message}")]
    ConnectionLost {
        component: &'static str,
        message: String,
    },
    #[error("worker for partition {0} terminated unexpectedly")]
    WorkerCrashed(Partition),
}
