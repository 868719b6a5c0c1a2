//! Connection manager: one logical link, reconnected forever with a fixed delay

use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::transport::{Incoming, LinkSink, LinkSource, NORMAL_CLOSURE, Outgoing, Transport};
use crate::types::ConnectionState;
use crate::{Result, UplinkError};

/// Capacity of the inbound text channel handed to the owner.
pub const INBOUND_CAPACITY: usize = 64;

/// Upper bound on how long shutdown waits to deliver the close frame.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Timing knobs for the connection manager.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Fixed delay between a failure and the next connect attempt
    pub reconnect_delay: Duration,
    /// Keepalive ping interval while open
    pub ping_interval: Option<Duration>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self { reconnect_delay: Duration::from_secs(1), ping_interval: Some(Duration::from_secs(15)) }
    }
}

/// Write half tagged with the generation of the link it belongs to.
///
/// `closed` fires when the link is being torn down, which aborts any write
/// stuck on it so the sink lock is released.
struct ActiveSink {
    generation: u64,
    sink: Box<dyn LinkSink>,
    closed: CancellationToken,
}

/// Owns the single link to the remote endpoint.
///
/// Only the manager opens, writes and closes the link. State transitions go
/// through the `state` watch channel with compare-and-set semantics so at
/// most one connect attempt is ever in flight.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    options: ConnectionOptions,
    runtime: Handle,
    state: watch::Sender<ConnectionState>,
    sink: Mutex<Option<ActiveSink>>,
    generation: AtomicU64,
    attempts: AtomicU64,
    inbound: mpsc::Sender<String>,
    cancel: CancellationToken,
    shut_down: AtomicBool,
}

impl ConnectionManager {
    /// Create a manager bound to the current tokio runtime.
    ///
    /// Returns the manager and the receiver for inbound text messages.
    pub fn new(
        transport: Arc<dyn Transport>,
        options: ConnectionOptions,
    ) -> Result<(Arc<Self>, mpsc::Receiver<String>)> {
        let runtime = Handle::try_current()
            .map_err(|e| UplinkError::Runtime { details: e.to_string() })?;
        Ok(Self::with_runtime(transport, options, runtime))
    }

    /// Create a manager that spawns its tasks on `runtime`.
    pub fn with_runtime(
        transport: Arc<dyn Transport>,
        options: ConnectionOptions,
        runtime: Handle,
    ) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (inbound, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        let manager = Arc::new(Self {
            transport,
            options,
            runtime,
            state,
            sink: Mutex::new(None),
            generation: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            inbound,
            cancel: CancellationToken::new(),
            shut_down: AtomicBool::new(false),
        });

        (manager, inbound_rx)
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Total connect attempts started so far.
    pub fn connect_attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Runtime the manager spawns its tasks on.
    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Start a connect attempt unless one is running, the link is open, or
    /// the manager has been shut down. Never waits for the attempt.
    pub fn ensure_connected(self: &Arc<Self>) {
        if self.cancel.is_cancelled() {
            return;
        }

        let claimed = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return;
        }

        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(attempt, endpoint = self.transport.endpoint(), "Connecting");

        let this = Arc::clone(self);
        self.runtime.spawn(async move { this.connect_once(attempt).await });
    }

    async fn connect_once(self: Arc<Self>, attempt: u64) {
        let result = tokio::select! {
            _ = self.cancel.cancelled() => {
                debug!(attempt, "Connect attempt cancelled");
                return;
            }
            result = self.transport.connect() => result,
        };

        match result {
            Ok((mut sink, source)) => {
                let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
                let closed = self.cancel.child_token();
                {
                    let mut slot = self.sink.lock().await;
                    if self.cancel.is_cancelled() {
                        let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close(NORMAL_CLOSURE, "bye")).await;
                        return;
                    }
                    *slot = Some(ActiveSink { generation, sink, closed: closed.clone() });
                }

                let opened = self.state.send_if_modified(|state| {
                    if *state == ConnectionState::Connecting {
                        *state = ConnectionState::Open;
                        true
                    } else {
                        false
                    }
                });
                if !opened {
                    return;
                }

                info!(attempt, generation, endpoint = self.transport.endpoint(), "Connection open");

                let reader = Arc::clone(&self);
                self.runtime.spawn(async move { reader.read_loop(generation, closed, source).await });

                if let Some(interval) = self.options.ping_interval {
                    let pinger = Arc::clone(&self);
                    self.runtime.spawn(async move { pinger.keepalive(generation, interval).await });
                }
            }
            Err(e) => {
                warn!(attempt, "Connect failed: {}", e);
                self.state.send_if_modified(|state| {
                    if *state == ConnectionState::Connecting {
                        *state = ConnectionState::Disconnected;
                        true
                    } else {
                        false
                    }
                });
                self.schedule_reconnect();
            }
        }
    }

    /// Arm the fixed-delay reconnect timer.
    fn schedule_reconnect(self: &Arc<Self>) {
        if self.cancel.is_cancelled() {
            return;
        }

        let delay = self.options.reconnect_delay;
        debug!(delay_ms = delay.as_millis() as u64, "Reconnect scheduled");

        let this = Arc::clone(self);
        self.runtime.spawn(async move {
            tokio::select! {
                _ = this.cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => this.ensure_connected(),
            }
        });
    }

    async fn read_loop(
        self: Arc<Self>,
        generation: u64,
        closed: CancellationToken,
        mut source: Box<dyn LinkSource>,
    ) {
        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = source.recv() => received,
            };

            match received {
                Ok(Some(Incoming::Text(text))) => {
                    trace!(len = text.len(), "Text message received");
                    if self.inbound.send(text).await.is_err() {
                        debug!("Inbound receiver dropped");
                    }
                }
                Ok(Some(Incoming::Binary(bytes))) => {
                    trace!(len = bytes.len(), "Ignoring binary message");
                }
                Ok(None) => {
                    info!(generation, "Connection closed by peer");
                    closed.cancel();
                    self.drop_link(generation).await;
                    break;
                }
                Err(e) => {
                    warn!(generation, "Connection lost: {}", e);
                    closed.cancel();
                    if self.drop_link(generation).await {
                        self.schedule_reconnect();
                    }
                    break;
                }
            }
        }
        trace!(generation, "Reader finished");
    }

    async fn keepalive(self: Arc<Self>, generation: u64, interval: Duration) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.generation.load(Ordering::Acquire) != generation || !self.state().is_open() {
                break;
            }
            if let Err(e) = self.send(Outgoing::Ping).await {
                debug!("Keepalive ping failed: {}", e);
                break;
            }
        }
    }

    /// Forget the link of `generation` if it is still the current one.
    ///
    /// Returns true when the link was current and has been released.
    async fn drop_link(&self, generation: u64) -> bool {
        let mut slot = self.sink.lock().await;
        let current = slot.as_ref().is_some_and(|active| active.generation == generation);
        if !current {
            return false;
        }
        *slot = None;
        drop(slot);

        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Open {
                *state = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        });
        true
    }

    /// Send one message. Fails with `NotConnected` unless the link is open.
    pub async fn send(self: &Arc<Self>, message: Outgoing) -> Result<()> {
        self.write(vec![message]).await
    }

    /// Send a text envelope immediately followed by its binary payload.
    ///
    /// Both messages are written under one lock, so nothing else can be
    /// interleaved between them.
    pub async fn send_pair(self: &Arc<Self>, text: String, payload: Bytes) -> Result<()> {
        self.write(vec![Outgoing::Text(text), Outgoing::Binary(payload)]).await
    }

    async fn write(self: &Arc<Self>, messages: Vec<Outgoing>) -> Result<()> {
        let mut slot = self.sink.lock().await;
        let Some(active) = slot.as_mut() else {
            return Err(UplinkError::NotConnected);
        };
        let generation = active.generation;
        let closed = active.closed.clone();

        let written = tokio::select! {
            _ = closed.cancelled() => None,
            result = write_all(active.sink.as_mut(), messages) => Some(result),
        };
        drop(slot);

        match written {
            Some(Ok(())) => Ok(()),
            // The reader or shutdown owns the teardown of this link
            None => {
                debug!(generation, "Write abandoned, link is closing");
                Err(UplinkError::NotConnected)
            }
            Some(Err(e)) => {
                warn!(generation, "Write failed: {}", e);
                closed.cancel();
                if self.drop_link(generation).await {
                    self.schedule_reconnect();
                }
                Err(e)
            }
        }
    }

    /// Stop background tasks without sending a close frame.
    ///
    /// Used from synchronous drop paths; prefer [`shutdown`](Self::shutdown).
    pub fn abort(&self) {
        self.shut_down.store(true, Ordering::Release);
        self.cancel.cancel();
    }

    /// Close the link with a normal-closure frame, cancel pending reconnects
    /// and stop all background tasks. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.state.send_replace(ConnectionState::Closing);

        // Cancelling aborts any in-flight write, so the lock frees up promptly
        let active = match tokio::time::timeout(CLOSE_TIMEOUT, self.sink.lock()).await {
            Ok(mut slot) => slot.take(),
            Err(_) => {
                warn!("Sink still busy, skipping close frame");
                None
            }
        };
        if let Some(mut active) = active {
            match tokio::time::timeout(CLOSE_TIMEOUT, active.sink.close(NORMAL_CLOSURE, "bye")).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Close frame not delivered: {}", e),
                Err(_) => debug!("Close frame timed out"),
            }
        }

        self.state.send_replace(ConnectionState::Disconnected);
        info!("Connection manager shut down");
    }
}

async fn write_all(sink: &mut dyn LinkSink, messages: Vec<Outgoing>) -> Result<()> {
    for message in messages {
        sink.send(message).await?;
    }
    Ok(())
}
