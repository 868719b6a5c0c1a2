//! Test utilities: a scripted in-memory transport
//!
//! [`MockTransport`] records every message written to any of its links in a
//! single shared log, lets tests script connect failures, and exposes a
//! [`ServerHandle`] to push messages or kill the current link.

use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::transport::{Incoming, LinkSink, LinkSource, Outgoing, Transport};
use crate::{Result, UplinkError};

/// What the peer does with the current link.
#[derive(Debug)]
enum ServerAction {
    Deliver(Incoming),
    Close,
    Fail,
}

#[derive(Debug, Default)]
struct MockState {
    script: Mutex<VecDeque<bool>>,
    attempts: AtomicU64,
    in_progress: AtomicUsize,
    max_in_progress: AtomicUsize,
    log: Mutex<Vec<Outgoing>>,
    closes: Mutex<Vec<u16>>,
    peer: Mutex<Option<mpsc::UnboundedSender<ServerAction>>>,
    fail_writes: AtomicBool,
    stall_writes: AtomicBool,
    connect_delay_ms: AtomicU64,
}

/// In-memory transport with scripted connect outcomes.
///
/// Connect attempts succeed unless a failure was queued with
/// [`fail_next`](Self::fail_next).
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` connect attempts fail.
    pub fn fail_next(&self, count: usize) -> &Self {
        let mut script = self.state.script.lock().expect("script lock");
        script.extend(std::iter::repeat_n(false, count));
        self
    }

    /// Delay every connect attempt by `delay` (tokio time).
    pub fn set_connect_delay(&self, delay: Duration) -> &Self {
        self.state.connect_delay_ms.store(delay.as_millis() as u64, Ordering::Relaxed);
        self
    }

    /// Make writes on every link fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Make writes on every link hang forever, like a peer that stopped
    /// reading. Affects writes started after the call.
    pub fn set_stall_writes(&self, stall: bool) {
        self.state.stall_writes.store(stall, Ordering::Relaxed);
    }

    /// Number of connect attempts observed.
    pub fn connect_attempts(&self) -> u64 {
        self.state.attempts.load(Ordering::Relaxed)
    }

    /// Highest number of connect attempts that were running at the same time.
    pub fn max_concurrent_connects(&self) -> usize {
        self.state.max_in_progress.load(Ordering::Relaxed)
    }

    /// Every message written so far, across all links, in write order.
    pub fn sent(&self) -> Vec<Outgoing> {
        self.state.log.lock().expect("log lock").clone()
    }

    /// Text messages written so far.
    pub fn sent_text(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m {
                Outgoing::Text(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    /// Close codes sent by the client.
    pub fn close_codes(&self) -> Vec<u16> {
        self.state.closes.lock().expect("closes lock").clone()
    }

    /// Handle to act as the remote peer on the current link.
    pub fn server(&self) -> ServerHandle {
        ServerHandle { state: Arc::clone(&self.state) }
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<(Box<dyn LinkSink>, Box<dyn LinkSource>)> {
        let state = &self.state;
        state.attempts.fetch_add(1, Ordering::Relaxed);
        let running = state.in_progress.fetch_add(1, Ordering::AcqRel) + 1;
        state.max_in_progress.fetch_max(running, Ordering::AcqRel);

        let delay = state.connect_delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        } else {
            tokio::task::yield_now().await;
        }

        state.in_progress.fetch_sub(1, Ordering::AcqRel);

        let succeed = state.script.lock().expect("script lock").pop_front().unwrap_or(true);
        if !succeed {
            return Err(UplinkError::connection_failed("scripted connect failure"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *state.peer.lock().expect("peer lock") = Some(tx);

        Ok((Box::new(MockSink { state: Arc::clone(state) }), Box::new(MockSource { rx })))
    }

    fn endpoint(&self) -> &str {
        "mock://server"
    }
}

struct MockSink {
    state: Arc<MockState>,
}

#[async_trait::async_trait]
impl LinkSink for MockSink {
    async fn send(&mut self, message: Outgoing) -> Result<()> {
        if self.state.fail_writes.load(Ordering::Relaxed) {
            return Err(UplinkError::Transport { operation: "mock send".to_string(), source: None });
        }
        if self.state.stall_writes.load(Ordering::Relaxed) {
            std::future::pending::<()>().await;
        }
        self.state.log.lock().expect("log lock").push(message);
        Ok(())
    }

    async fn close(&mut self, code: u16, _reason: &str) -> Result<()> {
        self.state.closes.lock().expect("closes lock").push(code);
        Ok(())
    }
}

struct MockSource {
    rx: mpsc::UnboundedReceiver<ServerAction>,
}

#[async_trait::async_trait]
impl LinkSource for MockSource {
    async fn recv(&mut self) -> Result<Option<Incoming>> {
        match self.rx.recv().await {
            Some(ServerAction::Deliver(message)) => Ok(Some(message)),
            Some(ServerAction::Close) => Ok(None),
            Some(ServerAction::Fail) | None => Err(UplinkError::connection_failed("mock link dropped")),
        }
    }
}

/// Acts as the remote peer of the most recent link.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    state: Arc<MockState>,
}

impl ServerHandle {
    fn act(&self, action: ServerAction) -> bool {
        let peer = self.state.peer.lock().expect("peer lock");
        peer.as_ref().is_some_and(|tx| tx.send(action).is_ok())
    }

    /// Deliver a text message to the client. Returns false without a live link.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.act(ServerAction::Deliver(Incoming::Text(text.into())))
    }

    pub fn send_binary(&self, bytes: impl Into<Bytes>) -> bool {
        self.act(ServerAction::Deliver(Incoming::Binary(bytes.into())))
    }

    /// Close the link cleanly.
    pub fn close(&self) -> bool {
        self.act(ServerAction::Close)
    }

    /// Break the link abruptly.
    pub fn fail(&self) -> bool {
        self.act(ServerAction::Fail)
    }
}

/// Let spawned tasks run until they block. Works with paused time.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}
