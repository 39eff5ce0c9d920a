//! Contracts consumed by the log processor.
//!
//! The indexer and trie catalog are external collaborators; the processor
//! only drives them. Calls are synchronous: the processor applies records
//! sequentially on its subscription worker.

use arrow_array::RecordBatch;
use chrono::{DateTime, Utc};

use strata_log::{LogOffset, LogRecord};

use crate::error::IngestError;

/// Descriptor of an applied transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxDescriptor {
    /// The transaction's log offset.
    pub tx_id: LogOffset,
    /// The logical commit time the indexer assigned.
    pub system_time: DateTime<Utc>,
}

/// Applies decoded transactions to the index and maintains chunk
/// boundaries.
pub trait Indexer: Send + Sync + 'static {
    /// Applies one transaction envelope at `offset`. `timestamp` is the
    /// log-assigned instant; the envelope may override it with its own
    /// system time.
    ///
    /// # Errors
    ///
    /// A returned error is recorded against the offset and halts the
    /// ingestion stream (sticky-error semantics).
    fn index_tx(
        &self,
        offset: LogOffset,
        timestamp: DateTime<Utc>,
        envelope: &RecordBatch,
    ) -> Result<TxDescriptor, IngestError>;

    /// Forces a durable chunk boundary in response to a flush-chunk
    /// record. The indexer ignores the request when the record's expected
    /// previous chunk tx-id no longer matches its own, which de-duplicates
    /// flush signals replayed across nodes.
    fn force_flush(&self, record: &LogRecord);

    /// The newest fully applied transaction, if any.
    fn latest_completed_tx(&self) -> Option<TxDescriptor>;

    /// The tx-id of the newest durable chunk, if any.
    fn latest_completed_chunk_tx(&self) -> Option<LogOffset>;

    /// A fatal indexer-internal error, if one has occurred outside the
    /// record path.
    fn indexer_error(&self) -> Option<String>;
}

/// Registry of on-disk tries, fed by `TriesAdded` log records.
pub trait TrieCatalog: Send + Sync + 'static {
    /// Registers a trie for a table.
    fn add_trie(&self, table: &str, trie_key: &str);
}
