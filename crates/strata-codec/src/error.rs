//! Error types for envelope encode/decode.

/// Errors raised while encoding or decoding a transaction envelope.
///
/// All encode-side errors are fatal to the whole batch: nothing is written
/// to the log and any partially built buffers are dropped.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// A put/patch document has no `_id` field.
    #[error("document has no `_id` field")]
    MissingId,

    /// Write to a system table.
    #[error("writes to table '{0}' are not allowed")]
    ForbiddenTable(String),

    /// SQL parameter rows of one operation differ in arity.
    #[error("SQL parameter row {row} has {found} values, expected {expected}")]
    ArgRowArityMismatch {
        /// Zero-based index of the offending row.
        row: usize,
        /// Arity of the first row.
        expected: usize,
        /// Arity of the offending row.
        found: usize,
    },

    /// An operation variant that this codec does not know.
    #[error("unknown tx-op variant '{0}'")]
    UnknownOpVariant(String),

    /// `valid-from` is later than `valid-to`.
    #[error("valid-from must not be later than valid-to")]
    InvalidValidTime,

    /// A value shape the envelope cannot represent.
    #[error("unsupported value: {0}")]
    Unsupported(String),

    /// Malformed envelope bytes on the read path.
    #[error("envelope decode: {0}")]
    Decode(String),

    /// Underlying Arrow failure.
    #[error(transparent)]
    Arrow(#[from] arrow_schema::ArrowError),
}
