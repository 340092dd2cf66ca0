//! Typed error taxonomy for the protocol/session boundary.
//!
//! `thiserror` types for anything a caller might want to match on,
//! `anyhow::Result` at the outer boundaries (main, worker-pool task
//! closures) where only propagation matters.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("buffer size limit exceeded")]
    BufferOverflow,
    #[error("invalid BodyLength value: {0}")]
    InvalidBodyLength(String),
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("tag {0} not found")]
    MissingTag(u32),
    #[error("tag {0} value is not a valid integer: {1}")]
    NotAnInteger(u32, String),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("body length mismatch: header said {declared}, measured {actual}")]
    BodyLengthMismatch { declared: usize, actual: usize },
    #[error("checksum field (10) not found")]
    MissingChecksum,
    #[error("malformed field: {0}")]
    MalformedField(String),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("sequence number too low: expected {expected}, got {got}")]
    SeqTooLow { expected: i64, got: i64 },
    #[error("persistence failure: {0}")]
    Persistence(#[from] PersistenceError),
}
