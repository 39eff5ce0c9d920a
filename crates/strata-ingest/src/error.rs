//! Ingestion error types.

use strata_codec::CodecError;
use strata_log::{LogError, LogOffset};

/// Errors surfaced through the watch registry and the submit path.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Envelope encode/decode failure.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Log append or read failure.
    #[error(transparent)]
    Log(#[from] LogError),

    /// The indexer rejected a record. Once recorded this becomes the
    /// registry's sticky error and all later awaits fail with it.
    #[error("indexing failed at offset {offset}: {message}")]
    Indexer {
        /// Offset of the record that failed to apply.
        offset: LogOffset,
        /// Indexer-reported reason.
        message: String,
    },
}
