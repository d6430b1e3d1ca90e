//! Error taxonomy for the trace store.
//!
//! Transient storage errors are retried locally (ingester flush, compactor);
//! query-path failures surface as partial results rather than hard errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TraceError {
    /// Not enough ingester replicas acknowledged a write. Retryable by the caller.
    #[error("write quorum not reached: {acked}/{required} acks")]
    WriteQuorum { acked: usize, required: usize },

    /// Backing-store failure while flushing a cut buffer. Retried internally
    /// with backoff; buffered data is never dropped on this error.
    #[error("flush failed: {0}")]
    Flush(String),

    /// Some query shard or backend was unreachable; the result is best-effort.
    #[error("partial result: {0}")]
    Partial(String),

    /// Valid absence of a trace. Not a failure.
    #[error("not found")]
    NotFound,

    /// Another compaction job already claimed this input set. Abandon silently.
    #[error("compaction input set already claimed")]
    CompactionConflict,

    /// Object store operation failed.
    #[error("backend error: {0}")]
    Backend(String),

    /// Block segment could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// On-disk data failed validation (checksum mismatch, truncated segment).
    #[error("corrupt block data: {0}")]
    Corrupt(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] bincode::Error),

    /// Component is draining and no longer accepts writes.
    #[error("shutting down")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for TraceError {
    fn from(e: serde_json::Error) -> Self {
        TraceError::Codec(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TraceError>;
