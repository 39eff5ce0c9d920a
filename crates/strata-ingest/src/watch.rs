//! Await/watch registry.
//!
//! Tracks the highest applied offset and lets callers block until a
//! target offset is reached, or fail fast once an indexing error has
//! been recorded. All state lives under one short-critical-section mutex:
//! the high-water mark is advanced before any awaiter is completed, and
//! the sticky error never reverts.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;

use strata_log::{LogError, LogOffset};

use crate::error::IngestError;
use crate::indexer::TxDescriptor;

/// Offsets for which per-offset descriptors are retained. Awaits for
/// older (already applied) offsets still complete, just without a
/// descriptor.
const RESULT_WINDOW: usize = 1024;

/// Outcome of awaiting an offset: the applied-tx descriptor when the
/// offset carried a transaction and is still in the result window.
pub type AwaitResult = Result<Option<TxDescriptor>, Arc<IngestError>>;

/// Registry of applied offsets and their awaiters.
#[derive(Default)]
pub struct WatchRegistry {
    inner: Mutex<WatchState>,
}

#[derive(Default)]
struct WatchState {
    high_water: Option<LogOffset>,
    sticky: Option<Arc<IngestError>>,
    results: FxHashMap<LogOffset, TxDescriptor>,
    recent: VecDeque<LogOffset>,
    waiters: Vec<Waiter>,
}

struct Waiter {
    target: LogOffset,
    tx: oneshot::Sender<AwaitResult>,
}

impl WatchRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the outcome of applying `offset` and releases every
    /// awaiter whose target is now covered.
    ///
    /// An error is promoted to the sticky error (the first error wins);
    /// from then on every waiter, present and future, fails with it.
    /// The offset still advances the high-water mark either way.
    pub fn notify(
        &self,
        offset: LogOffset,
        result: Result<Option<TxDescriptor>, Arc<IngestError>>,
    ) {
        let mut state = self.inner.lock();
        let high_water = state.high_water.map_or(offset, |hw| hw.max(offset));
        state.high_water = Some(high_water);

        match result {
            Ok(Some(descriptor)) => {
                state.results.insert(offset, descriptor);
                state.recent.push_back(offset);
                while state.recent.len() > RESULT_WINDOW {
                    if let Some(old) = state.recent.pop_front() {
                        state.results.remove(&old);
                    }
                }
            }
            Ok(None) => {}
            Err(error) => {
                if state.sticky.is_none() {
                    tracing::error!(offset, error = %error, "ingestion tainted by sticky error");
                    state.sticky = Some(error);
                }
            }
        }

        let tainted = state.sticky.is_some();
        let drained: Vec<Waiter> = state.waiters.drain(..).collect();
        let mut remaining = Vec::with_capacity(drained.len());
        for waiter in drained {
            if tainted || waiter.target <= high_water {
                let outcome = match &state.sticky {
                    Some(error) => Err(Arc::clone(error)),
                    None => Ok(state.results.get(&waiter.target).copied()),
                };
                let _ = waiter.tx.send(outcome);
            } else {
                remaining.push(waiter);
            }
        }
        state.waiters = remaining;
    }

    /// Waits until `offset` has been applied.
    ///
    /// Completes immediately when the offset is already covered by the
    /// high-water mark, and fails immediately once the sticky error is
    /// set.
    ///
    /// # Errors
    ///
    /// The sticky [`IngestError`], or [`LogError::Closed`] when the
    /// registry is dropped mid-wait.
    pub async fn await_offset(&self, offset: LogOffset) -> AwaitResult {
        let rx = {
            let mut state = self.inner.lock();
            if let Some(error) = &state.sticky {
                return Err(Arc::clone(error));
            }
            if state.high_water.map_or(false, |hw| offset <= hw) {
                return Ok(state.results.get(&offset).copied());
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push(Waiter { target: offset, tx });
            rx
        };
        rx.await
            .unwrap_or_else(|_| Err(Arc::new(IngestError::Log(LogError::Closed))))
    }

    /// Highest applied offset.
    #[must_use]
    pub fn high_water(&self) -> Option<LogOffset> {
        self.inner.lock().high_water
    }

    /// The sticky error, once ingestion is tainted.
    #[must_use]
    pub fn sticky_error(&self) -> Option<Arc<IngestError>> {
        self.inner.lock().sticky.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn descriptor(tx_id: LogOffset) -> TxDescriptor {
        TxDescriptor {
            tx_id,
            system_time: Utc::now(),
        }
    }

    fn indexer_error(offset: LogOffset) -> Arc<IngestError> {
        Arc::new(IngestError::Indexer {
            offset,
            message: "boom".into(),
        })
    }

    #[tokio::test]
    async fn test_await_after_notify_short_circuits() {
        let registry = WatchRegistry::new();
        registry.notify(0, Ok(Some(descriptor(0))));

        let result = registry.await_offset(0).await.unwrap();
        assert_eq!(result.map(|d| d.tx_id), Some(0));
        assert_eq!(registry.high_water(), Some(0));
    }

    #[tokio::test]
    async fn test_await_blocks_until_target_reached() {
        let registry = Arc::new(WatchRegistry::new());
        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.await_offset(2).await })
        };

        registry.notify(0, Ok(Some(descriptor(0))));
        registry.notify(1, Ok(Some(descriptor(1))));
        assert!(!waiter.is_finished());

        registry.notify(2, Ok(Some(descriptor(2))));
        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result.map(|d| d.tx_id), Some(2));
        // The mark was advanced before the awaiter completed.
        assert_eq!(registry.high_water(), Some(2));
    }

    #[tokio::test]
    async fn test_control_records_advance_without_descriptor() {
        let registry = WatchRegistry::new();
        registry.notify(0, Ok(None));
        assert_eq!(registry.high_water(), Some(0));
        assert!(registry.await_offset(0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sticky_error_fails_pending_and_future_awaits() {
        let registry = Arc::new(WatchRegistry::new());
        let pending = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.await_offset(10).await })
        };

        registry.notify(0, Ok(Some(descriptor(0))));
        registry.notify(1, Err(indexer_error(1)));

        // The pending waiter fails even though its target was never reached.
        assert!(pending.await.unwrap().is_err());
        // Future awaits fail immediately, including already-applied offsets.
        assert!(registry.await_offset(0).await.is_err());
        assert!(registry.sticky_error().is_some());
        // The failing offset still advanced the mark.
        assert_eq!(registry.high_water(), Some(1));
    }

    #[tokio::test]
    async fn test_first_error_wins() {
        let registry = WatchRegistry::new();
        registry.notify(1, Err(indexer_error(1)));
        registry.notify(2, Err(indexer_error(2)));

        let err = registry.await_offset(5).await.unwrap_err();
        assert!(matches!(
            &*err,
            IngestError::Indexer { offset: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_results_pruned_beyond_window() {
        let registry = WatchRegistry::new();
        for offset in 0..(RESULT_WINDOW as LogOffset + 10) {
            registry.notify(offset, Ok(Some(descriptor(offset))));
        }
        // Offset 0 left the result window but the await still completes.
        assert!(registry.await_offset(0).await.unwrap().is_none());
        let newest = RESULT_WINDOW as LogOffset + 9;
        assert!(registry.await_offset(newest).await.unwrap().is_some());
    }
}
