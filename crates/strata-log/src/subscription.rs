//! Subscription delivery workers.
//!
//! Each subscriber gets a dedicated tokio task that reads records from the
//! log and delivers them strictly in offset order, advancing its cursor
//! after every record. Two strategies exist:
//!
//! - **Polling** — for logs that cannot push: read up to the batch limit,
//!   sleep the idle backoff when nothing is there.
//! - **Notifying** — for logs that push offsets: replay to the high-water
//!   mark captured at subscribe (catch-up), then block on a counting
//!   signal and read exactly as many records as permits were taken
//!   (live mode).
//!
//! Closing the returned [`Subscription`] interrupts the worker and joins
//! it; at most the in-flight record is still delivered, and the subscriber
//! is never called again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;

use crate::log::TxLog;
use crate::metrics::{SubscriptionMetrics, SubscriptionMetricsSnapshot};
use crate::record::{LogOffset, LogRecord};

/// Upper bound on records taken per read, in both catch-up and live mode.
pub const READ_BATCH_LIMIT: usize = 100;

/// Backoff before retrying a failed catch-up read.
const RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// Terminal signal from a subscriber: it is shutting down and must not be
/// called again. Not an error when the worker itself initiated shutdown.
#[derive(Debug)]
pub struct SubscriberClosed;

/// A consumer of log records.
#[async_trait::async_trait]
pub trait Subscriber: Send + Sync + 'static {
    /// The offset this subscriber has already applied durably, used to
    /// seed the delivery cursor at subscribe time.
    fn latest_processed_offset(&self) -> Option<LogOffset>;

    /// Processes an ordered batch of records.
    ///
    /// # Errors
    ///
    /// Returning [`SubscriberClosed`] stops the delivery worker; the
    /// subscriber is not called again.
    async fn process_records(&self, records: Vec<LogRecord>) -> Result<(), SubscriberClosed>;
}

#[derive(Default)]
pub(crate) struct WorkerShared {
    closed: AtomicBool,
    shutdown: Notify,
}

impl WorkerShared {
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.shutdown.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Handle to a running subscription worker.
///
/// Dropping the handle signals the worker to stop; [`Subscription::close`]
/// additionally joins it. Close is idempotent.
pub struct Subscription {
    shared: Arc<WorkerShared>,
    join: parking_lot::Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<SubscriptionMetrics>,
}

impl Subscription {
    fn new(
        shared: Arc<WorkerShared>,
        join: JoinHandle<()>,
        metrics: Arc<SubscriptionMetrics>,
    ) -> Self {
        Self {
            shared,
            join: parking_lot::Mutex::new(Some(join)),
            metrics,
        }
    }

    /// Stops the worker and waits for it to finish.
    pub async fn close(&self) {
        self.shared.close();
        let join = self.join.lock().take();
        if let Some(join) = join {
            if let Err(e) = join.await {
                tracing::warn!(error = %e, "subscription worker join error");
            }
        }
    }

    /// Snapshot of the delivery counters.
    #[must_use]
    pub fn metrics(&self) -> SubscriptionMetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shared.close();
    }
}

enum Delivery {
    Continue,
    Stop,
}

/// Delivers records one at a time, checking for close between records so
/// shutdown drains at most the in-flight record.
async fn deliver(
    subscriber: &dyn Subscriber,
    batch: Vec<LogRecord>,
    cursor: &mut Option<LogOffset>,
    shared: &WorkerShared,
    metrics: &SubscriptionMetrics,
) -> Delivery {
    for record in batch {
        if shared.is_closed() {
            return Delivery::Stop;
        }
        let offset = record.offset;
        if subscriber.process_records(vec![record]).await.is_err() {
            tracing::debug!(offset, "subscriber closed, stopping delivery");
            return Delivery::Stop;
        }
        metrics.record_delivery();
        *cursor = Some(offset);
    }
    Delivery::Continue
}

/// Sleeps for the idle backoff. Returns `true` when shutdown fired.
async fn idle_or_shutdown(shared: &WorkerShared, idle: Duration) -> bool {
    tokio::select! {
        biased;
        () = shared.shutdown.notified() => true,
        () = tokio::time::sleep(idle) => false,
    }
}

/// Spawns a polling delivery worker.
pub(crate) fn spawn_polling<L: TxLog>(
    log: Arc<L>,
    subscriber: Arc<dyn Subscriber>,
    poll_sleep: Duration,
) -> Subscription {
    let shared = Arc::new(WorkerShared::default());
    let metrics = Arc::new(SubscriptionMetrics::default());
    let worker_shared = Arc::clone(&shared);
    let worker_metrics = Arc::clone(&metrics);

    let join = tokio::spawn(async move {
        polling_worker(log, subscriber, poll_sleep, &worker_shared, &worker_metrics).await;
    });
    Subscription::new(shared, join, metrics)
}

async fn polling_worker<L: TxLog>(
    log: Arc<L>,
    subscriber: Arc<dyn Subscriber>,
    poll_sleep: Duration,
    shared: &WorkerShared,
    metrics: &SubscriptionMetrics,
) {
    let mut cursor = subscriber.latest_processed_offset();
    tracing::debug!(?cursor, "polling subscription started");

    loop {
        if shared.is_closed() {
            break;
        }
        metrics.record_read();
        let batch = match log.read_records(cursor, READ_BATCH_LIMIT).await {
            Ok(batch) => batch,
            Err(e) => {
                metrics.record_read_error();
                tracing::warn!(error = %e, "log read failed, retrying");
                if idle_or_shutdown(shared, poll_sleep).await {
                    break;
                }
                continue;
            }
        };
        if batch.is_empty() {
            if idle_or_shutdown(shared, poll_sleep).await {
                break;
            }
            continue;
        }
        if let Delivery::Stop = deliver(&*subscriber, batch, &mut cursor, shared, metrics).await {
            break;
        }
    }
    tracing::debug!(?cursor, "polling subscription stopped");
}

/// Spawns a notifying delivery worker. `guard` is dropped when the worker
/// exits, deregistering the subscriber's signal from the log.
pub(crate) fn spawn_notifying<L: TxLog, G: Send + 'static>(
    log: Arc<L>,
    subscriber: Arc<dyn Subscriber>,
    signal: Arc<Semaphore>,
    latest_known: Option<LogOffset>,
    guard: G,
) -> Subscription {
    let shared = Arc::new(WorkerShared::default());
    let metrics = Arc::new(SubscriptionMetrics::default());
    let worker_shared = Arc::clone(&shared);
    let worker_metrics = Arc::clone(&metrics);

    let join = tokio::spawn(async move {
        let _guard = guard;
        notifying_worker(
            log,
            subscriber,
            signal,
            latest_known,
            &worker_shared,
            &worker_metrics,
        )
        .await;
    });
    Subscription::new(shared, join, metrics)
}

async fn notifying_worker<L: TxLog>(
    log: Arc<L>,
    subscriber: Arc<dyn Subscriber>,
    signal: Arc<Semaphore>,
    latest_known: Option<LogOffset>,
    shared: &WorkerShared,
    metrics: &SubscriptionMetrics,
) {
    let mut cursor = subscriber.latest_processed_offset();
    tracing::debug!(?cursor, ?latest_known, "notifying subscription started");

    // Catch-up: replay records up to the high-water mark captured at
    // subscribe time, without touching the live signal.
    if let Some(limit) = latest_known {
        while cursor.map_or(true, |c| c < limit) {
            if shared.is_closed() {
                return;
            }
            metrics.record_read();
            let batch = match log.read_records(cursor, READ_BATCH_LIMIT).await {
                Ok(batch) => batch,
                Err(e) => {
                    metrics.record_read_error();
                    tracing::warn!(error = %e, "catch-up read failed, retrying");
                    if idle_or_shutdown(shared, RETRY_BACKOFF).await {
                        return;
                    }
                    continue;
                }
            };
            let batch: Vec<LogRecord> =
                batch.into_iter().filter(|r| r.offset <= limit).collect();
            if batch.is_empty() {
                break;
            }
            if let Delivery::Stop =
                deliver(&*subscriber, batch, &mut cursor, shared, metrics).await
            {
                return;
            }
        }
        tracing::debug!(?cursor, limit, "catch-up complete, entering live mode");
    }

    // Live mode: block for one permit, drain up to the batch limit, read
    // that many records. Appends made during catch-up left their permits
    // on the signal, so nothing is missed.
    loop {
        if shared.is_closed() {
            break;
        }
        tokio::select! {
            biased;
            () = shared.shutdown.notified() => break,
            permit = signal.acquire() => match permit {
                Ok(permit) => permit.forget(),
                Err(_) => break,
            },
        }

        let mut take = 1;
        while take < READ_BATCH_LIMIT {
            match signal.try_acquire() {
                Ok(permit) => {
                    permit.forget();
                    take += 1;
                }
                Err(_) => break,
            }
        }

        metrics.record_read();
        let batch = match log.read_records(cursor, take).await {
            Ok(batch) => batch,
            Err(e) => {
                metrics.record_read_error();
                tracing::warn!(error = %e, "live read failed, retrying");
                continue;
            }
        };
        if let Delivery::Stop = deliver(&*subscriber, batch, &mut cursor, shared, metrics).await
        {
            break;
        }
    }
    tracing::debug!(?cursor, "notifying subscription stopped");
}
