//! Rate limiter between a price poller and its consumer that keeps only the newest pending update.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;

/// Counters reported by [`PriceThrottler::stats`].
///
/// `sent + dropped + pending` always equals the number of `send` calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThrottleStats {
    pub sent: u64,
    /// Updates superseded by a newer one or refused by a closed sink
    pub dropped: u64,
    /// 0 or 1
    pub pending: u64,
}

struct ThrottleState<T> {
    last_sent: Option<Instant>,
    pending: Option<T>,
    sent: u64,
    dropped: u64,
}

/// Forwards updates to a sink at most once per interval, keeping only the
/// newest update that arrives in between. Never blocks the producer.
pub struct PriceThrottler<T> {
    sink: mpsc::Sender<T>,
    interval: Duration,
    state: Mutex<ThrottleState<T>>,
}

impl<T> PriceThrottler<T> {
    pub fn new(sink: mpsc::Sender<T>, interval: Duration) -> Self {
        Self {
            sink,
            interval,
            state: Mutex::new(ThrottleState {
                last_sent: None,
                pending: None,
                sent: 0,
                dropped: 0,
            }),
        }
    }

    fn due(&self, state: &ThrottleState<T>, now: Instant) -> bool {
        match state.last_sent {
            Some(last) => now.duration_since(last) >= self.interval,
            None => true,
        }
    }

    /// Try to deliver `update` now, or park it as the pending update
    pub fn send(&self, update: T) {
        let mut state = self.state.lock();
        let now = Instant::now();

        if !self.due(&state, now) {
            if state.pending.replace(update).is_some() {
                state.dropped += 1;
            }
            return;
        }

        match self.sink.try_send(update) {
            Ok(()) => {
                state.last_sent = Some(now);
                state.sent += 1;
                if state.pending.take().is_some() {
                    state.dropped += 1;
                }
            }
            Err(TrySendError::Full(update)) => {
                if state.pending.replace(update).is_some() {
                    state.dropped += 1;
                }
            }
            Err(TrySendError::Closed(_)) => {
                state.dropped += 1;
            }
        }
    }

    /// Deliver the pending update if the interval has elapsed and the sink
    /// has room. Returns whether something was sent.
    pub fn flush_pending(&self) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        if state.pending.is_none() || !self.due(&state, now) {
            return false;
        }

        let Some(update) = state.pending.take() else {
            return false;
        };
        match self.sink.try_send(update) {
            Ok(()) => {
                state.last_sent = Some(now);
                state.sent += 1;
                true
            }
            Err(TrySendError::Full(update)) => {
                state.pending = Some(update);
                false
            }
            Err(TrySendError::Closed(_)) => {
                state.dropped += 1;
                false
            }
        }
    }

    pub fn has_pending(&self) -> bool {
        self.state.lock().pending.is_some()
    }

    pub fn stats(&self) -> ThrottleStats {
        let state = self.state.lock();
        ThrottleStats {
            sent: state.sent,
            dropped: state.dropped,
            pending: state.pending.is_some() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_throttling_preserves_latest() {
        let (tx, mut rx) = mpsc::channel::<u32>(1);
        let throttler = PriceThrottler::new(tx, Duration::from_millis(50));
        let mut received = Vec::new();

        for i in 0..100u32 {
            throttler.send(i);
            while let Ok(v) = rx.try_recv() {
                received.push(v);
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        throttler.flush_pending();
        while let Ok(v) = rx.try_recv() {
            received.push(v);
        }

        let last = *received.last().unwrap();
        assert!(last >= 97, "last delivered update was {}", last);

        let stats = throttler.stats();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.sent + stats.dropped, 100);
        // roughly one send per 50ms window plus the final flush
        assert!(stats.sent >= 2 && stats.sent < 10, "sent {}", stats.sent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_sink_parks_update_until_drained() {
        let (tx, mut rx) = mpsc::channel::<u32>(1);
        let throttler = PriceThrottler::new(tx, Duration::from_millis(10));

        throttler.send(1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        // sink still holds 1
        throttler.send(2);
        assert!(throttler.has_pending());
        assert!(!throttler.flush_pending());

        assert_eq!(rx.recv().await, Some(1));
        assert!(throttler.flush_pending());
        assert_eq!(rx.recv().await, Some(2));

        let stats = throttler.stats();
        assert_eq!(stats, ThrottleStats { sent: 2, dropped: 0, pending: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_waits_for_interval() {
        let (tx, mut rx) = mpsc::channel::<u32>(4);
        let throttler = PriceThrottler::new(tx, Duration::from_millis(100));

        throttler.send(1);
        throttler.send(2);
        throttler.send(3);
        assert!(!throttler.flush_pending());
        assert_eq!(throttler.stats(), ThrottleStats { sent: 1, dropped: 1, pending: 1 });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(throttler.flush_pending());
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(3));
    }

    #[tokio::test]
    async fn test_closed_sink_counts_as_dropped() {
        let (tx, rx) = mpsc::channel::<u32>(1);
        drop(rx);
        let throttler = PriceThrottler::new(tx, Duration::ZERO);
        throttler.send(1);
        assert_eq!(throttler.stats(), ThrottleStats { sent: 0, dropped: 1, pending: 0 });
    }
}
