//! Send-rate throttle
//!
//! Tracks the instant of the last successful send. A frame may only go out
//! once the configured minimum interval has elapsed since then. Unlike a
//! queueing rate limiter nothing is delayed: a frame that arrives too early
//! is simply not sent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

const NEVER: u64 = u64::MAX;

/// Last-send bookkeeping shared between the capture path and the upload worker.
///
/// The last send instant is stored as microseconds since `origin` in an atomic,
/// so checks from the capture thread never take a lock.
#[derive(Debug)]
pub struct SendThrottle {
    origin: Instant,
    last_sent_us: AtomicU64,
}

impl SendThrottle {
    pub fn new() -> Self {
        Self { origin: Instant::now(), last_sent_us: AtomicU64::new(NEVER) }
    }

    /// True when at least `min_interval` has passed since the last send.
    pub fn is_ready(&self, now: Instant, min_interval: Duration) -> bool {
        match self.last_sent() {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= min_interval,
        }
    }

    /// Record a successful send at `at`.
    pub fn mark_sent(&self, at: Instant) {
        let micros = at.saturating_duration_since(self.origin).as_micros() as u64;
        self.last_sent_us.store(micros.min(NEVER - 1), Ordering::Release);
    }

    /// Instant of the last successful send, if any.
    pub fn last_sent(&self) -> Option<Instant> {
        match self.last_sent_us.load(Ordering::Acquire) {
            NEVER => None,
            micros => Some(self.origin + Duration::from_micros(micros)),
        }
    }
}

impl Default for SendThrottle {
    fn default() -> Self {
        Self::new()
    }
}
