//! Error taxonomy for the camera service.
//!
//! Each variant corresponds to a recovery policy rather than an origin:
//! device errors are retried and then disable the camera, protocol errors
//! trigger reconnect/backoff, validation errors reject the request at the
//! boundary, resource conflicts fail fast, encode failures drop the session.

use std::io;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Capture/encode hardware unavailable or rejected a request.
    #[error("device error: {0}")]
    Device(String),

    /// Malformed, oversized, or unexpected data on a protocol connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Externally supplied name or path failed sanitization.
    #[error("validation error: {0}")]
    Validation(String),

    /// The hardware encoder channel is already held by another user.
    #[error("resource conflict: {0}")]
    ResourceConflict(&'static str),

    /// Video assembly failed on both the hardware and fallback paths.
    #[error("encode failure: {0}")]
    Encode(String),

    /// A timelapse session is already active.
    #[error("timelapse session already active")]
    AlreadyActive,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
