//! The ingester facade: submit path plus the wired-up read side.
//!
//! Owns the processor's subscription and a periodic flush driver that
//! keeps the flusher honest while the log is idle (record arrival alone
//! cannot observe idleness).

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use strata_codec::{serialize, TxOp, TxOptions};
use strata_log::{Clock, LogOffset, Subscription, TxLog};

use crate::error::IngestError;
use crate::indexer::{Indexer, TrieCatalog};
use crate::processor::{IngestConfig, LogProcessor};
use crate::watch::{AwaitResult, WatchRegistry};

/// A running ingestion pipeline over one log.
pub struct Ingester<L: TxLog> {
    log: Arc<L>,
    watch: Arc<WatchRegistry>,
    subscription: Subscription,
    flush_shutdown: Arc<Notify>,
    flush_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl<L: TxLog> Ingester<L> {
    /// Wires processor, subscription, and flush driver together and
    /// starts consuming the log.
    #[must_use]
    pub fn start(
        log: Arc<L>,
        indexer: Arc<dyn Indexer>,
        trie_catalog: Arc<dyn TrieCatalog>,
        clock: Arc<dyn Clock>,
        config: IngestConfig,
    ) -> Self {
        let processor = Arc::new(LogProcessor::new(
            Arc::clone(&log),
            indexer,
            trie_catalog,
            clock,
            &config,
        ));
        let watch = processor.watch();
        let subscription = Arc::clone(&log).subscribe(Arc::clone(&processor) as _);

        let flush_shutdown = Arc::new(Notify::new());
        let tick = (config.flush_timeout / 2).max(Duration::from_millis(1));
        let driver_shutdown = Arc::clone(&flush_shutdown);
        let flush_task = tokio::spawn(async move {
            flush_driver(processor, tick, driver_shutdown).await;
        });

        Self {
            log,
            watch,
            subscription,
            flush_shutdown,
            flush_task: parking_lot::Mutex::new(Some(flush_task)),
        }
    }

    /// Serialises `ops` and appends the envelope to the log, returning
    /// the assigned offset once the append is durable.
    ///
    /// # Errors
    ///
    /// Codec failures reject the whole batch before anything reaches the
    /// log; log failures come from the append future.
    pub async fn submit_tx(
        &self,
        ops: &[TxOp],
        opts: &TxOptions,
    ) -> Result<LogOffset, IngestError> {
        let payload = serialize(ops, opts)?;
        let offset = self.log.append_tx(Bytes::from(payload)).await?;
        tracing::debug!(offset, ops = ops.len(), "transaction submitted");
        Ok(offset)
    }

    /// Waits until the transaction at `offset` has been applied.
    ///
    /// # Errors
    ///
    /// The sticky ingestion error, once set.
    pub async fn await_tx(&self, offset: LogOffset) -> AwaitResult {
        self.watch.await_offset(offset).await
    }

    /// The watch registry.
    #[must_use]
    pub fn watch(&self) -> &Arc<WatchRegistry> {
        &self.watch
    }

    /// The underlying log.
    #[must_use]
    pub fn log(&self) -> &Arc<L> {
        &self.log
    }

    /// Stops the flush driver and closes the subscription. Idempotent.
    pub async fn shutdown(&self) {
        self.flush_shutdown.notify_one();
        let task = self.flush_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.subscription.close().await;
    }
}

async fn flush_driver<L: TxLog>(
    processor: Arc<LogProcessor<L>>,
    tick: Duration,
    shutdown: Arc<Notify>,
) {
    tracing::debug!(tick_ms = tick.as_millis(), "flush driver started");
    loop {
        tokio::select! {
            biased;
            () = shutdown.notified() => break,
            () = tokio::time::sleep(tick) => {}
        }
        if let Err(e) = processor.run_flush_check().await {
            tracing::warn!(error = %e, "flush check failed, will retry");
        }
    }
    tracing::debug!("flush driver stopped");
}
