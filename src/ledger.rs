//! Pending-request ledger
//!
//! Correlates heading feedback with the frame that caused it. The upload
//! worker inserts `(frame_id, sent_at)` after a frame is handed to the
//! transport; the reader path removes the entry when a response carrying
//! that id arrives and turns the elapsed time into a latency sample.
//!
//! Entries are independent per key, so a concurrent map is the only
//! synchronization needed between the two paths.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::types::FrameId;

const UNKNOWN: u64 = u64::MAX;

/// Result of feeding one server response through the ledger.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeadingUpdate {
    /// Heading reported by the server, in degrees
    pub heading: f64,
    /// Frame id echoed by the server, if any
    pub frame_id: Option<FrameId>,
    /// Latency of this response when matched, otherwise the last known latency
    pub latency: Option<Duration>,
    /// Whether `frame_id` matched a pending entry
    pub matched: bool,
}

/// Concurrent map of outstanding frames keyed by frame id.
#[derive(Debug)]
pub struct PendingLedger {
    pending: DashMap<FrameId, Instant>,
    last_latency_us: AtomicU64,
    ttl: Option<Duration>,
}

impl PendingLedger {
    /// Create a ledger. Entries older than `ttl` are evicted on insert;
    /// `None` keeps unanswered entries until they match.
    pub fn new(ttl: Option<Duration>) -> Self {
        Self { pending: DashMap::new(), last_latency_us: AtomicU64::new(UNKNOWN), ttl }
    }

    /// Record that `frame_id` was handed to the transport at `sent_at`.
    ///
    /// An existing entry for the same id is overwritten.
    pub fn record_sent(&self, frame_id: FrameId, sent_at: Instant) {
        if let Some(ttl) = self.ttl {
            self.evict_older_than(sent_at, ttl);
        }

        if self.pending.insert(frame_id, sent_at).is_some() {
            debug!(frame_id, "Overwrote pending entry for reused frame id");
        }
        trace!(frame_id, pending = self.pending.len(), "Frame pending");
    }

    /// Feed a server response through the ledger.
    ///
    /// A matching entry is removed and its latency becomes the new last known
    /// latency. Unmatched or id-less responses report the last known latency.
    pub fn on_response(&self, frame_id: Option<FrameId>, heading: f64) -> HeadingUpdate {
        let matched = frame_id.and_then(|id| self.pending.remove(&id));

        match matched {
            Some((id, sent_at)) => {
                let latency = Instant::now().saturating_duration_since(sent_at);
                self.last_latency_us.store((latency.as_micros() as u64).min(UNKNOWN - 1), Ordering::Release);
                trace!(frame_id = id, latency_ms = latency.as_millis() as u64, "Response matched");
                HeadingUpdate { heading, frame_id, latency: Some(latency), matched: true }
            }
            None => {
                if let Some(id) = frame_id {
                    debug!(frame_id = id, "Response for unknown frame id");
                }
                HeadingUpdate { heading, frame_id, latency: self.last_latency(), matched: false }
            }
        }
    }

    /// Latency of the most recent matched response.
    pub fn last_latency(&self) -> Option<Duration> {
        match self.last_latency_us.load(Ordering::Acquire) {
            UNKNOWN => None,
            micros => Some(Duration::from_micros(micros)),
        }
    }

    /// Drop entries sent more than `ttl` before `now`. Returns how many were removed.
    pub fn evict_older_than(&self, now: Instant, ttl: Duration) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, sent_at| now.saturating_duration_since(*sent_at) < ttl);
        let evicted = before.saturating_sub(self.pending.len());
        if evicted > 0 {
            debug!(evicted, ttl_ms = ttl.as_millis() as u64, "Evicted unanswered frames");
        }
        evicted
    }

    /// Number of frames still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, frame_id: FrameId) -> bool {
        self.pending.contains_key(&frame_id)
    }
}

impl Default for PendingLedger {
    fn default() -> Self {
        Self::new(None)
    }
}
