/// Error taxonomy for the testbed
///
/// - `SetupError`: fatal, aborts a run before any loop starts
/// - `BusError`: transient send/receive failure, logged and retried next iteration
/// - `DataError`: malformed input or empty window, skipped where it occurs
///
/// Out-of-range physical quantities are never errors; they are clamped.
use crate::types::CanId;
use std::path::PathBuf;
use thiserror::Error;

/// Fatal setup failures (bus unavailable, missing model artifacts, bad config)
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("CAN bus unavailable: {0}")]
    BusUnavailable(String),

    #[error("Failed to connect to bus server at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Model artifact not found: {}", .0.display())]
    ArtifactMissing(PathBuf),

    #[error("Model artifact {} is invalid: {reason}", path.display())]
    ArtifactInvalid { path: PathBuf, reason: String },

    #[error("Model artifact {} has format version {found}, expected {expected}", path.display())]
    ArtifactVersion {
        path: PathBuf,
        expected: String,
        found: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("{task} task failed: {reason}")]
    TaskFailed { task: &'static str, reason: String },
}

/// Transient bus I/O failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("bus is closed")]
    Closed,

    #[error("invalid CAN frame: data length {len} exceeds 8 bytes")]
    InvalidFrame { len: usize },

    #[error("invalid CAN frame: id {id} out of range")]
    InvalidId { id: CanId },

    #[error("transport error: {0}")]
    Transport(String),
}

/// Locally-skipped data problems
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataError {
    #[error("line {line_no}: {reason}")]
    MalformedLine { line_no: usize, reason: String },

    #[error("window contains no frames")]
    EmptyWindow,
}
