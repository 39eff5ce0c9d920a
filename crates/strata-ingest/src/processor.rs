//! The log processor: the single consumer that drives the indexer.
//!
//! Runs on its subscription's delivery worker, so application is strictly
//! sequential in offset order. Every batch first gives the [`Flusher`] a
//! chance to inject a `FlushChunk` message (whose append is awaited so its
//! eventual arrival back through the log is well-defined), then dispatches
//! each record by message kind. Success and failure both advance the watch
//! registry; a failure is sticky and halts the stream.

use std::sync::Arc;
use std::time::Duration;

use strata_codec::read_envelope_batch;
use strata_log::{
    Clock, LogError, LogMessage, LogOffset, LogRecord, Subscriber, SubscriberClosed, TxLog,
};

use crate::error::IngestError;
use crate::flusher::Flusher;
use crate::indexer::{Indexer, TrieCatalog, TxDescriptor};
use crate::watch::WatchRegistry;

/// Ingestion tuning knobs.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Idle threshold before a chunk flush is requested.
    pub flush_timeout: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            flush_timeout: Duration::from_secs(60),
        }
    }
}

/// Applies log records to the indexer and releases awaiters.
pub struct LogProcessor<L: TxLog> {
    log: Arc<L>,
    indexer: Arc<dyn Indexer>,
    trie_catalog: Arc<dyn TrieCatalog>,
    watch: Arc<WatchRegistry>,
    clock: Arc<dyn Clock>,
    flusher: parking_lot::Mutex<Flusher>,
}

impl<L: TxLog> LogProcessor<L> {
    /// Creates a processor. The flusher's first idle window starts now.
    #[must_use]
    pub fn new(
        log: Arc<L>,
        indexer: Arc<dyn Indexer>,
        trie_catalog: Arc<dyn TrieCatalog>,
        clock: Arc<dyn Clock>,
        config: &IngestConfig,
    ) -> Self {
        let flusher = Flusher::new(config.flush_timeout, clock.now());
        Self {
            log,
            indexer,
            trie_catalog,
            watch: Arc::new(WatchRegistry::new()),
            clock,
            flusher: parking_lot::Mutex::new(flusher),
        }
    }

    /// The registry awaiters use to observe applied offsets.
    #[must_use]
    pub fn watch(&self) -> Arc<WatchRegistry> {
        Arc::clone(&self.watch)
    }

    /// Runs one flusher check; appends and awaits the flush message when
    /// one is due. Returns whether a message was appended.
    ///
    /// # Errors
    ///
    /// Propagates the append failure; the flusher state stays armed, so a
    /// later check retries.
    pub async fn run_flush_check(&self) -> Result<bool, LogError> {
        let message = {
            let mut flusher = self.flusher.lock();
            flusher.check(
                self.clock.now(),
                self.indexer.latest_completed_chunk_tx(),
                self.indexer.latest_completed_tx().map(|d| d.tx_id),
            )
        };
        match message {
            Some(message) => {
                let offset = self.log.append_message(message).await?;
                tracing::debug!(offset, "flush-chunk message appended");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn apply(&self, record: &LogRecord) -> Result<Option<TxDescriptor>, IngestError> {
        match &record.message {
            LogMessage::Tx(payload) => {
                // The decoded envelope is scoped to this record: it is
                // dropped before the next one is applied.
                let envelope = read_envelope_batch(payload)?;
                self.indexer
                    .index_tx(record.offset, record.timestamp, &envelope)
                    .map(Some)
            }
            LogMessage::FlushChunk(_) => {
                self.indexer.force_flush(record);
                Ok(None)
            }
            LogMessage::TriesAdded(entries) => {
                for entry in entries {
                    self.trie_catalog.add_trie(&entry.table, &entry.trie_key);
                }
                Ok(None)
            }
        }
    }
}

#[async_trait::async_trait]
impl<L: TxLog> Subscriber for LogProcessor<L> {
    fn latest_processed_offset(&self) -> Option<LogOffset> {
        self.indexer.latest_completed_tx().map(|d| d.tx_id)
    }

    async fn process_records(&self, records: Vec<LogRecord>) -> Result<(), SubscriberClosed> {
        if let Some(first) = records.first() {
            // A fatal indexer-internal error halts the stream before any
            // further record is applied.
            if let Some(message) = self.indexer.indexer_error() {
                let error = Arc::new(IngestError::Indexer {
                    offset: first.offset,
                    message,
                });
                self.watch.notify(first.offset, Err(error));
                return Err(SubscriberClosed);
            }
        }

        if let Err(e) = self.run_flush_check().await {
            tracing::warn!(error = %e, "flush message append failed, will retry");
        }

        for record in records {
            let offset = record.offset;
            match self.apply(&record) {
                Ok(descriptor) => self.watch.notify(offset, Ok(descriptor)),
                Err(error) => {
                    let error = Arc::new(error);
                    tracing::error!(offset, error = %error, "record application failed, halting");
                    // The offset still advances; the error is the stored
                    // result and every later await observes it.
                    self.watch.notify(offset, Err(error));
                    return Err(SubscriberClosed);
                }
            }
        }
        Ok(())
    }
}
