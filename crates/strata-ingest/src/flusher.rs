//! Chunk-flush control.
//!
//! A small state machine that decides when to inject a `FlushChunk`
//! message: only after `flush_timeout` has elapsed with no chunk progress
//! while completed transactions are waiting to be flushed. The emitted
//! message carries the chunk tx-id observed at decision time so replaying
//! indexers can discard redundant flush signals.

use std::time::Duration;

use chrono::{DateTime, Utc};

use strata_log::{LogMessage, LogOffset};

/// Wire value for "no chunk exists yet".
pub const NO_CHUNK_TX_ID: i64 = -1;

/// Timeout-driven flush decision state.
#[derive(Debug)]
pub struct Flusher {
    flush_timeout: chrono::Duration,
    last_flush_check: DateTime<Utc>,
    previous_chunk_tx_id: Option<LogOffset>,
    flushed_tx_id: Option<LogOffset>,
}

impl Flusher {
    /// Creates a flusher whose first timeout window starts at `now`.
    ///
    /// # Panics
    ///
    /// Panics if `flush_timeout` exceeds the chrono duration range.
    #[must_use]
    pub fn new(flush_timeout: Duration, now: DateTime<Utc>) -> Self {
        Self {
            flush_timeout: chrono::Duration::from_std(flush_timeout)
                .expect("flush timeout in range"),
            last_flush_check: now,
            previous_chunk_tx_id: None,
            flushed_tx_id: None,
        }
    }

    /// Decides whether a flush message is due.
    ///
    /// `current_chunk_tx_id` is the indexer's newest durable chunk tx-id
    /// and `latest_completed_tx_id` its newest applied transaction. A
    /// message is produced only when the timeout has elapsed, the chunk
    /// boundary has not moved since the previous check, and a completed
    /// transaction exists that has not already been flushed for.
    pub fn check(
        &mut self,
        now: DateTime<Utc>,
        current_chunk_tx_id: Option<LogOffset>,
        latest_completed_tx_id: Option<LogOffset>,
    ) -> Option<LogMessage> {
        if now - self.last_flush_check < self.flush_timeout {
            return None;
        }
        let latest_completed = latest_completed_tx_id?;
        if self.flushed_tx_id == Some(latest_completed) {
            return None;
        }
        if current_chunk_tx_id != self.previous_chunk_tx_id {
            // The chunk boundary moved on its own; restart the idle window.
            self.last_flush_check = now;
            self.previous_chunk_tx_id = current_chunk_tx_id;
            return None;
        }
        self.last_flush_check = now;
        self.flushed_tx_id = Some(latest_completed);
        tracing::debug!(
            chunk_tx_id = ?current_chunk_tx_id,
            latest_completed,
            "requesting chunk flush"
        );
        Some(LogMessage::FlushChunk(
            current_chunk_tx_id.unwrap_or(NO_CHUNK_TX_ID),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(50);

    fn start() -> DateTime<Utc> {
        "2024-01-01T00:00:00Z".parse().unwrap()
    }

    fn at(ms: i64) -> DateTime<Utc> {
        start() + chrono::Duration::milliseconds(ms)
    }

    #[test]
    fn test_no_flush_before_timeout() {
        let mut flusher = Flusher::new(TIMEOUT, start());
        assert_eq!(flusher.check(at(49), None, Some(3)), None);
    }

    #[test]
    fn test_flush_after_idle_timeout() {
        let mut flusher = Flusher::new(TIMEOUT, start());
        assert_eq!(
            flusher.check(at(50), None, Some(3)),
            Some(LogMessage::FlushChunk(NO_CHUNK_TX_ID))
        );
    }

    #[test]
    fn test_flush_carries_current_chunk_tx_id() {
        let mut flusher = Flusher::new(TIMEOUT, start());
        // First elapsed check observes the chunk boundary and resets.
        assert_eq!(flusher.check(at(50), Some(7), Some(9)), None);
        // Still no progress one timeout later: flush for chunk 7.
        assert_eq!(
            flusher.check(at(100), Some(7), Some(9)),
            Some(LogMessage::FlushChunk(7))
        );
    }

    #[test]
    fn test_no_flush_without_completed_tx() {
        let mut flusher = Flusher::new(TIMEOUT, start());
        assert_eq!(flusher.check(at(100), None, None), None);
    }

    #[test]
    fn test_no_repeat_flush_for_same_completed_tx() {
        let mut flusher = Flusher::new(TIMEOUT, start());
        assert!(flusher.check(at(50), None, Some(3)).is_some());
        assert_eq!(flusher.check(at(200), None, Some(3)), None);
        // A newer completed tx re-arms the flusher.
        assert!(flusher.check(at(300), None, Some(4)).is_some());
    }

    #[test]
    fn test_chunk_progress_suppresses_flush() {
        let mut flusher = Flusher::new(TIMEOUT, start());
        assert_eq!(flusher.check(at(60), Some(1), Some(5)), None);
        // Chunk advanced between checks: progress, no flush.
        assert_eq!(flusher.check(at(120), Some(2), Some(5)), None);
        // No further progress: flush.
        assert_eq!(
            flusher.check(at(180), Some(2), Some(5)),
            Some(LogMessage::FlushChunk(2))
        );
    }

    #[test]
    fn test_flush_within_two_timeouts_of_stall() {
        // From the first check after a stall begins, a flush is emitted at
        // most two timeout windows later.
        let mut flusher = Flusher::new(TIMEOUT, start());
        let stalled_chunk = Some(4);
        assert_eq!(flusher.check(at(50), stalled_chunk, Some(10)), None);
        assert!(flusher.check(at(100), stalled_chunk, Some(10)).is_some());
    }
}
