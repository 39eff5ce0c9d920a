//! The log contract.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::LogError;
use crate::record::{LogMessage, LogOffset, LogRecord};
use crate::subscription::{Subscriber, Subscription};

/// An append-only, totally-ordered record store.
///
/// Appends are FIFO through a single append point; the returned offset is
/// durable per the backing implementation before the future resolves.
/// Callers may await the future or fire-and-forget.
#[async_trait::async_trait]
pub trait TxLog: Send + Sync + 'static {
    /// Durably appends a transaction record. The payload must be a framed
    /// envelope (its first byte is the record header).
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Closed`] after close, or the I/O failure that
    /// prevented the append from becoming durable.
    async fn append_tx(&self, payload: Bytes) -> Result<LogOffset, LogError>;

    /// Appends a non-transaction control message.
    ///
    /// # Errors
    ///
    /// See [`TxLog::append_tx`].
    async fn append_message(&self, message: LogMessage) -> Result<LogOffset, LogError>;

    /// Returns up to `max` records strictly after `after` in offset order.
    /// May return fewer, including none.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Evicted`] when the requested range has left the
    /// bounded read window, or an I/O failure.
    async fn read_records(
        &self,
        after: Option<LogOffset>,
        max: usize,
    ) -> Result<Vec<LogRecord>, LogError>;

    /// Highest offset known to the log, even if not yet delivered to any
    /// subscriber. `None` while the log is empty.
    fn latest_submitted_offset(&self) -> Option<LogOffset>;

    /// Registers a subscriber and starts its delivery worker. The returned
    /// handle closes the subscription; close is idempotent.
    fn subscribe(self: Arc<Self>, subscriber: Arc<dyn Subscriber>) -> Subscription;
}
