//! Upload scheduler
//!
//! Decides for every candidate frame whether it goes out now, and if so hands
//! the metadata envelope and payload to the connection as one pair.
//!
//! `submit` runs on the capture thread and never waits: it stores the frame
//! in a single "latest" slot, checks the throttle, the in-flight slot and
//! the connection, and either wakes the upload worker or drops the frame.
//! The worker is a single task, so at most one pair is ever being written.

use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::Settings;
use crate::connection::ConnectionManager;
use crate::events::{EventHub, UplinkEvent};
use crate::ledger::PendingLedger;
use crate::protocol::{FrameMeta, OutboundMessage, epoch_millis};
use crate::throttle::SendThrottle;
use crate::types::{FrameContext, FrameId, SentFrame};

/// Decision taken for a submitted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The upload worker will send the latest frame
    Accepted,
    /// The frame will not be sent
    Dropped(DropReason),
}

impl SubmitOutcome {
    pub fn is_accepted(self) -> bool {
        self == SubmitOutcome::Accepted
    }
}

/// Why a frame was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    Empty,
    Oversized,
    /// Less than the minimum interval since the last successful send
    RateLimited,
    /// Another frame is being sent
    Busy,
    /// The link is not open; a connect attempt was requested
    NotConnected,
    ShuttingDown,
}

/// Per-reason drop counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropCounts {
    pub empty: u64,
    pub oversized: u64,
    pub rate_limited: u64,
    pub busy: u64,
    pub not_connected: u64,
    pub shutting_down: u64,
}

impl DropCounts {
    pub fn total(&self) -> u64 {
        self.empty + self.oversized + self.rate_limited + self.busy + self.not_connected + self.shutting_down
    }
}

#[derive(Debug, Default)]
struct DropCounters {
    empty: AtomicU64,
    oversized: AtomicU64,
    rate_limited: AtomicU64,
    busy: AtomicU64,
    not_connected: AtomicU64,
    shutting_down: AtomicU64,
}

impl DropCounters {
    fn record(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::Empty => &self.empty,
            DropReason::Oversized => &self.oversized,
            DropReason::RateLimited => &self.rate_limited,
            DropReason::Busy => &self.busy,
            DropReason::NotConnected => &self.not_connected,
            DropReason::ShuttingDown => &self.shutting_down,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DropCounts {
        DropCounts {
            empty: self.empty.load(Ordering::Relaxed),
            oversized: self.oversized.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            busy: self.busy.load(Ordering::Relaxed),
            not_connected: self.not_connected.load(Ordering::Relaxed),
            shutting_down: self.shutting_down.load(Ordering::Relaxed),
        }
    }
}

/// Candidate frame waiting in the single slot.
#[derive(Debug, Clone)]
struct Candidate {
    frame: Bytes,
    context: FrameContext,
}

/// Releases the in-flight slot when the send finishes or the job is dropped.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Rate-limited, freshest-frame-wins upload pipeline.
pub struct UploadScheduler {
    connection: Arc<ConnectionManager>,
    ledger: Arc<PendingLedger>,
    hub: Arc<EventHub>,
    settings: watch::Receiver<Settings>,
    latest: watch::Sender<Option<Candidate>>,
    throttle: SendThrottle,
    in_flight: AtomicBool,
    next_id: AtomicU64,
    jobs: mpsc::Sender<()>,
    drops: DropCounters,
    cancel: CancellationToken,
}

impl UploadScheduler {
    /// Create the scheduler and spawn its upload worker on the connection's runtime.
    ///
    /// The worker stops when `cancel` fires.
    pub fn spawn(
        connection: Arc<ConnectionManager>,
        ledger: Arc<PendingLedger>,
        hub: Arc<EventHub>,
        settings: watch::Receiver<Settings>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (jobs, job_rx) = mpsc::channel(1);
        let (latest, _) = watch::channel(None);
        let runtime = connection.runtime().clone();

        let scheduler = Arc::new(Self {
            connection,
            ledger,
            hub,
            settings,
            latest,
            throttle: SendThrottle::new(),
            in_flight: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            jobs,
            drops: DropCounters::default(),
            cancel,
        });

        let worker = Arc::clone(&scheduler);
        runtime.spawn(async move { worker.upload_worker(job_rx).await });

        scheduler
    }

    /// Offer a frame for upload. Never blocks and never fails.
    ///
    /// Checks run in order: size bounds, shutdown, throttle, in-flight slot,
    /// connection. A frame that passes the size check always replaces the
    /// latest candidate, even when it is then dropped, so the worker sends the
    /// freshest frame available when it runs.
    pub fn submit(&self, frame: Bytes, context: FrameContext) -> SubmitOutcome {
        let (max_frame_bytes, min_interval) = {
            let settings = self.settings.borrow();
            (settings.max_frame_bytes, settings.min_interval)
        };

        if frame.is_empty() {
            return self.drop_frame(DropReason::Empty);
        }
        if frame.len() > max_frame_bytes {
            trace!(len = frame.len(), max = max_frame_bytes, "Frame too large");
            return self.drop_frame(DropReason::Oversized);
        }
        if self.cancel.is_cancelled() {
            return self.drop_frame(DropReason::ShuttingDown);
        }

        self.latest.send_replace(Some(Candidate { frame, context }));

        if !self.throttle.is_ready(Instant::now(), min_interval) {
            return self.drop_frame(DropReason::RateLimited);
        }
        if self.in_flight.load(Ordering::Acquire) {
            return self.drop_frame(DropReason::Busy);
        }
        if !self.connection.state().is_open() {
            self.connection.ensure_connected();
            return self.drop_frame(DropReason::NotConnected);
        }
        if self.in_flight.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return self.drop_frame(DropReason::Busy);
        }

        if self.jobs.try_send(()).is_err() {
            self.in_flight.store(false, Ordering::Release);
            return self.drop_frame(DropReason::ShuttingDown);
        }

        SubmitOutcome::Accepted
    }

    fn drop_frame(&self, reason: DropReason) -> SubmitOutcome {
        self.drops.record(reason);
        SubmitOutcome::Dropped(reason)
    }

    /// Drop counters since creation.
    pub fn drop_counts(&self) -> DropCounts {
        self.drops.snapshot()
    }

    /// Whether a frame is currently being sent.
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Highest frame id assigned so far (0 before the first send).
    pub fn last_frame_id(&self) -> FrameId {
        self.next_id.load(Ordering::Acquire)
    }

    async fn upload_worker(self: Arc<Self>, mut jobs: mpsc::Receiver<()>) {
        info!("Upload worker started");
        let mut sent = 0u64;

        loop {
            let job = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Upload worker cancelled");
                    break;
                }
                job = jobs.recv() => job,
            };
            if job.is_none() {
                break;
            }

            if self.send_latest().await {
                sent += 1;
            }
        }

        // Unblock any submit that raced with cancellation
        jobs.close();
        self.in_flight.store(false, Ordering::Release);
        info!("Upload worker stopped after {} frames", sent);
    }

    /// Send the current candidate as a metadata + payload pair.
    async fn send_latest(&self) -> bool {
        let slot = InFlightGuard(&self.in_flight);

        let Some(candidate) = self.latest.send_replace(None) else {
            trace!("No candidate frame");
            return false;
        };
        let settings = self.settings.borrow().clone();

        let frame_id = self.next_id.fetch_add(1, Ordering::AcqRel) + 1;
        let payload = if candidate.frame.len() > settings.max_frame_bytes {
            debug!(frame_id, len = candidate.frame.len(), max = settings.max_frame_bytes, "Clamping payload");
            candidate.frame.slice(..settings.max_frame_bytes)
        } else {
            candidate.frame
        };

        let model = candidate.context.selected_model.as_deref().unwrap_or(&settings.selected_model);
        let meta = OutboundMessage::FrameMeta(FrameMeta::new(frame_id, epoch_millis(), &candidate.context, model));
        let text = match meta.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(frame_id, "Failed to encode frame envelope: {}", e);
                return false;
            }
        };

        if let Err(e) = self.connection.send_pair(text, payload.clone()).await {
            debug!(frame_id, "Frame not sent: {}", e);
            return false;
        }

        let sent_at = Instant::now();
        self.throttle.mark_sent(sent_at);
        drop(slot);

        self.ledger.record_sent(frame_id, sent_at);
        trace!(frame_id, len = payload.len(), "Frame sent");
        self.hub.publish(UplinkEvent::FrameSent(SentFrame { id: frame_id, payload, sent_at }));
        true
    }
}
