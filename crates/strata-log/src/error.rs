//! Log error types.

use crate::record::LogOffset;

/// Errors from log reads and appends.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// Underlying I/O failure. Read-side callers retry; write-side callers
    /// see this on the append future.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The log has been closed.
    #[error("log is closed")]
    Closed,

    /// A record on disk (or in flight) could not be decoded.
    #[error("corrupt log record: {0}")]
    Corrupt(String),

    /// The requested range has left the bounded read window.
    #[error("offset {requested} has been evicted (earliest retained is {earliest})")]
    Evicted {
        /// First offset the caller asked for.
        requested: LogOffset,
        /// Earliest offset still retained.
        earliest: LogOffset,
    },
}
