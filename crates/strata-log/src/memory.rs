//! In-memory log: a bounded ring with push notification.
//!
//! Appends complete immediately (durability is the ring itself) and
//! release one permit on every subscriber's counting signal, so
//! subscriptions run in notifying mode: catch-up to the high-water mark
//! captured at subscribe, then live delivery driven by the signal.
//!
//! Timestamps come from an injected [`Clock`], which keeps tests
//! deterministic.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::clock::{Clock, SystemClock};
use crate::error::LogError;
use crate::log::TxLog;
use crate::record::{LogMessage, LogOffset, LogRecord, HEADER_TX};
use crate::subscription::{self, Subscriber, Subscription};

/// Default ring capacity, in records.
pub const DEFAULT_CAPACITY: usize = 65_536;

/// An in-memory, bounded-ring log.
pub struct MemoryLog {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    capacity: usize,
    /// Highest assigned offset, `-1` while empty.
    latest: AtomicI64,
    signals: Mutex<Vec<SignalEntry>>,
    next_signal_id: AtomicU64,
}

struct State {
    records: VecDeque<LogRecord>,
    next_offset: LogOffset,
}

struct SignalEntry {
    id: u64,
    signal: Arc<Semaphore>,
}

impl MemoryLog {
    /// Creates a log with default capacity and the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts building a log with custom capacity or clock.
    #[must_use]
    pub fn builder() -> MemoryLogBuilder {
        MemoryLogBuilder::default()
    }

    fn append(&self, message: LogMessage) -> LogOffset {
        let offset = {
            let mut state = self.state.lock();
            let offset = state.next_offset;
            state.next_offset += 1;
            state.records.push_back(LogRecord {
                offset,
                timestamp: self.clock.now(),
                message,
            });
            if state.records.len() > self.capacity {
                state.records.pop_front();
            }
            offset
        };
        self.latest.fetch_max(offset, Ordering::AcqRel);

        // Release one permit per subscriber signal.
        for entry in self.signals.lock().iter() {
            entry.signal.add_permits(1);
        }
        offset
    }

    /// Number of records currently retained.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Whether no records are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().records.is_empty()
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl TxLog for MemoryLog {
    async fn append_tx(&self, payload: Bytes) -> Result<LogOffset, LogError> {
        if payload.first() != Some(&HEADER_TX) {
            return Err(LogError::Corrupt(
                "tx payload does not start with the record header".into(),
            ));
        }
        Ok(self.append(LogMessage::Tx(payload)))
    }

    async fn append_message(&self, message: LogMessage) -> Result<LogOffset, LogError> {
        Ok(self.append(message))
    }

    async fn read_records(
        &self,
        after: Option<LogOffset>,
        max: usize,
    ) -> Result<Vec<LogRecord>, LogError> {
        let state = self.state.lock();
        let Some(front) = state.records.front() else {
            return Ok(Vec::new());
        };
        let earliest = front.offset;
        let first_wanted = after.map_or(0, |a| a + 1);
        if first_wanted < earliest {
            return Err(LogError::Evicted {
                requested: first_wanted,
                earliest,
            });
        }
        #[allow(clippy::cast_sign_loss)]
        let start = (first_wanted - earliest) as usize;
        Ok(state.records.iter().skip(start).take(max).cloned().collect())
    }

    fn latest_submitted_offset(&self) -> Option<LogOffset> {
        let latest = self.latest.load(Ordering::Acquire);
        (latest >= 0).then_some(latest)
    }

    fn subscribe(self: Arc<Self>, subscriber: Arc<dyn Subscriber>) -> Subscription {
        let signal = Arc::new(Semaphore::new(0));
        let id = self.next_signal_id.fetch_add(1, Ordering::Relaxed);
        self.signals.lock().push(SignalEntry {
            id,
            signal: Arc::clone(&signal),
        });
        let latest_known = self.latest_submitted_offset();
        let guard = SignalGuard {
            log: Arc::clone(&self),
            id,
        };
        subscription::spawn_notifying(self, subscriber, signal, latest_known, guard)
    }
}

/// Deregisters a subscriber's signal when its worker exits.
struct SignalGuard {
    log: Arc<MemoryLog>,
    id: u64,
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        self.log.signals.lock().retain(|e| e.id != self.id);
    }
}

/// Builder for [`MemoryLog`].
#[derive(Default)]
pub struct MemoryLogBuilder {
    capacity: Option<usize>,
    clock: Option<Arc<dyn Clock>>,
}

impl MemoryLogBuilder {
    /// Sets the ring capacity in records.
    #[must_use]
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Injects the instant source used for record timestamps.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Builds the log.
    #[must_use]
    pub fn build(self) -> MemoryLog {
        MemoryLog {
            state: Mutex::new(State {
                records: VecDeque::new(),
                next_offset: 0,
            }),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            capacity: self.capacity.unwrap_or(DEFAULT_CAPACITY).max(1),
            latest: AtomicI64::new(-1),
            signals: Mutex::new(Vec::new()),
            next_signal_id: AtomicU64::new(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::subscription::SubscriberClosed;
    use std::time::Duration;

    /// Test subscriber that records delivered offsets.
    #[derive(Default)]
    struct Collector {
        offsets: Mutex<Vec<LogOffset>>,
    }

    impl Collector {
        fn seen(&self) -> Vec<LogOffset> {
            self.offsets.lock().clone()
        }
    }

    #[async_trait::async_trait]
    impl Subscriber for Collector {
        fn latest_processed_offset(&self) -> Option<LogOffset> {
            self.offsets.lock().last().copied()
        }

        async fn process_records(&self, records: Vec<LogRecord>) -> Result<(), SubscriberClosed> {
            self.offsets.lock().extend(records.iter().map(|r| r.offset));
            Ok(())
        }
    }

    async fn wait_until(deadline_ms: u64, mut ready: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(deadline_ms);
        while !ready() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached in time"
            );
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    fn flush_msg() -> LogMessage {
        LogMessage::FlushChunk(-1)
    }

    #[tokio::test]
    async fn test_append_assigns_dense_offsets() {
        let log = MemoryLog::new();
        for expected in 0..5 {
            let offset = log.append_message(flush_msg()).await.unwrap();
            assert_eq!(offset, expected);
        }
        assert_eq!(log.latest_submitted_offset(), Some(4));
    }

    #[tokio::test]
    async fn test_append_tx_requires_header() {
        let log = MemoryLog::new();
        let err = log
            .append_tx(Bytes::from_static(&[0x00, 0x01]))
            .await
            .unwrap_err();
        assert!(matches!(err, LogError::Corrupt(_)));
    }

    #[tokio::test]
    async fn test_read_records_window() {
        let log = MemoryLog::new();
        for _ in 0..10 {
            log.append_message(flush_msg()).await.unwrap();
        }
        let records = log.read_records(Some(3), 4).await.unwrap();
        let offsets: Vec<_> = records.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![4, 5, 6, 7]);

        assert!(log.read_records(Some(9), 10).await.unwrap().is_empty());
        assert_eq!(log.read_records(None, 100).await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_evicted_range_is_an_error() {
        let log = MemoryLog::builder().capacity(4).build();
        for _ in 0..10 {
            log.append_message(flush_msg()).await.unwrap();
        }
        // Offsets 0..=5 have been evicted.
        let err = log.read_records(None, 10).await.unwrap_err();
        assert!(matches!(err, LogError::Evicted { earliest: 6, .. }));
        let records = log.read_records(Some(5), 10).await.unwrap();
        assert_eq!(records.first().map(|r| r.offset), Some(6));
    }

    #[tokio::test]
    async fn test_clock_injection_pins_timestamps() {
        let start = "2024-01-01T00:00:00Z".parse().unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let log = MemoryLog::builder().clock(clock.clone()).build();

        log.append_message(flush_msg()).await.unwrap();
        clock.advance(Duration::from_secs(5));
        log.append_message(flush_msg()).await.unwrap();

        let records = log.read_records(None, 10).await.unwrap();
        assert_eq!(records[0].timestamp, start);
        assert_eq!(
            records[1].timestamp - records[0].timestamp,
            chrono::Duration::seconds(5)
        );
    }

    #[tokio::test]
    async fn test_live_delivery_in_order() {
        let log = Arc::new(MemoryLog::new());
        let collector = Arc::new(Collector::default());
        let subscription = Arc::clone(&log).subscribe(collector.clone());

        for _ in 0..20 {
            log.append_message(flush_msg()).await.unwrap();
        }
        wait_until(2_000, || collector.seen().len() == 20).await;
        assert_eq!(collector.seen(), (0..20).collect::<Vec<_>>());

        subscription.close().await;
    }

    #[tokio::test]
    async fn test_catch_up_then_live() {
        let log = Arc::new(MemoryLog::new());
        for _ in 0..250 {
            log.append_message(flush_msg()).await.unwrap();
        }

        let collector = Arc::new(Collector::default());
        let subscription = Arc::clone(&log).subscribe(collector.clone());

        wait_until(2_000, || collector.seen().len() == 250).await;
        assert_eq!(collector.seen(), (0..250).collect::<Vec<_>>());

        // Live appends keep flowing after catch-up.
        for _ in 0..5 {
            log.append_message(flush_msg()).await.unwrap();
        }
        wait_until(2_000, || collector.seen().len() == 255).await;
        assert_eq!(collector.seen().last(), Some(&254));

        subscription.close().await;
    }

    #[tokio::test]
    async fn test_subscriber_resumes_from_its_own_cursor() {
        let log = Arc::new(MemoryLog::new());
        for _ in 0..10 {
            log.append_message(flush_msg()).await.unwrap();
        }

        let collector = Arc::new(Collector::default());
        collector.offsets.lock().push(6);
        let subscription = Arc::clone(&log).subscribe(collector.clone());

        wait_until(2_000, || collector.seen().len() == 1 + 3).await;
        assert_eq!(collector.seen(), vec![6, 7, 8, 9]);

        subscription.close().await;
    }

    #[tokio::test]
    async fn test_close_stops_delivery_and_deregisters() {
        let log = Arc::new(MemoryLog::new());
        let collector = Arc::new(Collector::default());
        let subscription = Arc::clone(&log).subscribe(collector.clone());

        log.append_message(flush_msg()).await.unwrap();
        wait_until(2_000, || collector.seen().len() == 1).await;

        subscription.close().await;
        assert!(log.signals.lock().is_empty());

        let before = collector.seen().len();
        log.append_message(flush_msg()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(collector.seen().len(), before);

        // Close is idempotent.
        subscription.close().await;
    }
}
