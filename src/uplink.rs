//! The `Uplink` facade
//!
//! Wires the connection manager, upload scheduler, pending ledger and event
//! hub together and exposes the operations the capture, location and UI
//! layers call.

use bytes::Bytes;
use futures::Stream;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{Settings, UplinkConfig, clamp_tolerance};
use crate::connection::{ConnectionManager, ConnectionOptions};
use crate::events::{EventHub, UplinkEvent, UplinkStatus};
use crate::feedback::{Direction, DirectionTracker};
use crate::ledger::PendingLedger;
use crate::protocol::{Feedback, LocationReport, OutboundMessage, SettingChange, StatsReport, epoch_millis};
use crate::scheduler::{DropCounts, SubmitOutcome, UploadScheduler};
use crate::transport::{Outgoing, Transport};
use crate::types::{ConnectionState, FrameContext, LocationFix};
use crate::{Result, UplinkError};

/// Camera frame uplink to a signaling server.
///
/// Construction spawns the background tasks on the current tokio runtime.
/// The link itself is opened lazily: the first submitted frame or telemetry
/// message (or an explicit [`connect`](Self::connect)) starts it.
///
/// ```no_run
/// # async fn run() -> ipcam_uplink::Result<()> {
/// use ipcam_uplink::{Uplink, UplinkConfig};
/// use std::time::Duration;
///
/// let uplink = Uplink::start(UplinkConfig::new("ws://192.168.1.20:9000"))?;
/// uplink.connect();
/// uplink.wait_connected(Duration::from_secs(5)).await?;
///
/// let jpeg: Vec<u8> = vec![0xFF, 0xD8, 0xFF, 0xD9];
/// uplink.submit_frame(jpeg);
///
/// uplink.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Uplink {
    connection: Arc<ConnectionManager>,
    scheduler: Arc<UploadScheduler>,
    ledger: Arc<PendingLedger>,
    hub: Arc<EventHub>,
    settings: watch::Sender<Settings>,
    location: watch::Sender<Option<LocationFix>>,
    cancel: CancellationToken,
}

impl Uplink {
    /// Start an uplink over WebSocket to `config.url`.
    #[cfg(feature = "websocket")]
    pub fn start(config: UplinkConfig) -> Result<Self> {
        let transport = crate::transports::WebSocketTransport::new(config.url.trim());
        Self::with_transport(config, transport)
    }

    /// Start an uplink over a custom transport.
    pub fn with_transport<T: Transport>(config: UplinkConfig, transport: T) -> Result<Self> {
        config.validate()?;

        let options =
            ConnectionOptions { reconnect_delay: config.reconnect_delay(), ping_interval: config.ping_interval() };
        let (connection, inbound) = ConnectionManager::new(Arc::new(transport), options)?;

        let hub = Arc::new(EventHub::new(config.event_capacity));
        let ledger = Arc::new(PendingLedger::new(config.pending_ttl()));
        let (settings, settings_rx) = watch::channel(config.settings());
        let (location, _) = watch::channel(None);
        let cancel = CancellationToken::new();

        let scheduler = UploadScheduler::spawn(
            Arc::clone(&connection),
            Arc::clone(&ledger),
            Arc::clone(&hub),
            settings_rx.clone(),
            cancel.child_token(),
        );

        let runtime = connection.runtime().clone();
        runtime.spawn(route_feedback(
            inbound,
            Arc::clone(&ledger),
            Arc::clone(&hub),
            settings_rx,
            cancel.child_token(),
        ));
        runtime.spawn(forward_connection_state(connection.watch_state(), Arc::clone(&hub)));

        info!(endpoint = %config.url, "Uplink started");

        Ok(Self { connection, scheduler, ledger, hub, settings, location, cancel })
    }

    /// Request a connection without waiting for it.
    pub fn connect(&self) {
        self.connection.ensure_connected();
    }

    /// Wait until the link is open.
    ///
    /// Does not start a connection by itself; pair with [`connect`](Self::connect).
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        if self.connection.is_shut_down() {
            return Err(UplinkError::ShutDown);
        }
        let mut state = self.connection.watch_state();
        match tokio::time::timeout(timeout, state.wait_for(|s| s.is_open())).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(UplinkError::ShutDown),
            Err(_) => Err(UplinkError::Timeout { duration: timeout }),
        }
    }

    /// Offer a frame with explicit context. See [`UploadScheduler::submit`].
    pub fn submit(&self, frame: impl Into<Bytes>, context: FrameContext) -> SubmitOutcome {
        self.scheduler.submit(frame.into(), context)
    }

    /// Offer a frame using the latest known latency and location.
    pub fn submit_frame(&self, frame: impl Into<Bytes>) -> SubmitOutcome {
        self.scheduler.submit(frame.into(), self.current_context())
    }

    /// Context embedded in the next envelope: last matched latency and last location.
    pub fn current_context(&self) -> FrameContext {
        let location = self.location.borrow().map(|fix| fix.position);
        FrameContext::new(self.ledger.last_latency(), location)
    }

    /// Remember `fix` for frame envelopes and report it to the server.
    pub async fn send_location(&self, fix: LocationFix) {
        self.location.send_replace(Some(fix));
        let message = OutboundMessage::Location(LocationReport::new(&fix, epoch_millis()));
        self.send_telemetry(message).await;
    }

    /// Report the last known latency and location.
    pub async fn send_stats(&self) {
        let message = OutboundMessage::Stats(StatsReport::new(&self.current_context()));
        self.send_telemetry(message).await;
    }

    /// Telemetry is not throttled. Failures are logged and dropped.
    async fn send_telemetry(&self, message: OutboundMessage) {
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode telemetry: {}", e);
                return;
            }
        };

        if !self.connection.state().is_open() {
            self.connection.ensure_connected();
            debug!("Telemetry dropped, not connected");
            return;
        }

        if let Err(e) = self.connection.send(Outgoing::Text(text)).await {
            debug!("Telemetry not sent: {}", e);
        }
    }

    pub fn update_min_interval(&self, min_interval_ms: u64) {
        self.settings.send_modify(|s| s.min_interval = Duration::from_millis(min_interval_ms));
    }

    /// Set the direction tolerance in percent; clamped to 0..=40.
    pub fn update_heading_tolerance(&self, tolerance_pct: i64) {
        let pct = clamp_tolerance(tolerance_pct);
        self.settings.send_modify(|s| s.heading_tolerance_pct = pct);
    }

    /// Set the frame size ceiling. Zero is ignored.
    pub fn update_max_frame_bytes(&self, max_frame_bytes: usize) {
        if max_frame_bytes == 0 {
            warn!("Ignoring max_frame_bytes of 0");
            return;
        }
        self.settings.send_modify(|s| s.max_frame_bytes = max_frame_bytes);
    }

    /// Switch the processing model and notify the server.
    pub async fn update_model(&self, model: impl Into<String>) {
        let model = model.into();
        self.settings.send_modify(|s| s.selected_model = model.clone());
        self.send_telemetry(OutboundMessage::Setting(SettingChange { selected_model: model })).await;
    }

    /// Current hot-reloadable settings.
    pub fn settings(&self) -> Settings {
        self.settings.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Stream of events published after this call.
    pub fn events(&self) -> impl Stream<Item = UplinkEvent> + 'static {
        self.hub.events()
    }

    pub fn status(&self) -> UplinkStatus {
        self.hub.status()
    }

    /// Stream of status snapshots, starting with the current one.
    pub fn status_updates(&self) -> impl Stream<Item = UplinkStatus> + 'static {
        self.hub.status_updates()
    }

    pub fn drop_counts(&self) -> DropCounts {
        self.scheduler.drop_counts()
    }

    /// Frames still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.ledger.pending_count()
    }

    pub fn last_latency(&self) -> Option<Duration> {
        self.ledger.last_latency()
    }

    /// Close the link and stop every background task. Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.connection.shutdown().await;
        self.hub.publish(UplinkEvent::Connection(self.connection.state()));
    }
}

impl Drop for Uplink {
    fn drop(&mut self) {
        debug!("Dropping uplink");
        self.cancel.cancel();
        self.connection.abort();
    }
}

/// Turn inbound text into heading events.
async fn route_feedback(
    mut inbound: mpsc::Receiver<String>,
    ledger: Arc<PendingLedger>,
    hub: Arc<EventHub>,
    settings: watch::Receiver<Settings>,
    cancel: CancellationToken,
) {
    let mut tracker = DirectionTracker::new();

    loop {
        let text = tokio::select! {
            _ = cancel.cancelled() => break,
            text = inbound.recv() => match text {
                Some(text) => text,
                None => break,
            },
        };

        let Some(feedback) = Feedback::parse(&text) else {
            trace!(len = text.len(), "Ignoring non-feedback message");
            continue;
        };

        let update = ledger.on_response(feedback.frame_id, feedback.heading);
        hub.publish(UplinkEvent::Heading(update));

        let tolerance = settings.borrow().heading_tolerance_pct;
        if let Some(direction) = tracker.observe(Direction::from_heading(update.heading, tolerance)) {
            debug!(?direction, heading = update.heading, "Direction changed");
            hub.publish(UplinkEvent::DirectionChanged(direction));
        }
    }

    trace!("Feedback router finished");
}

/// Publish connection state changes until the manager goes away.
async fn forward_connection_state(mut states: watch::Receiver<ConnectionState>, hub: Arc<EventHub>) {
    while states.changed().await.is_ok() {
        let state = *states.borrow_and_update();
        hub.publish(UplinkEvent::Connection(state));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockTransport, settle};
    use futures::StreamExt;
    use serde_json::Value;

    fn config() -> UplinkConfig {
        UplinkConfig { ping_interval_secs: 0, ..UplinkConfig::new("ws://mock") }
    }

    async fn started(config: UplinkConfig) -> (Uplink, MockTransport) {
        let transport = MockTransport::new();
        let uplink = Uplink::with_transport(config, transport.clone()).expect("valid config");
        uplink.connect();
        uplink.wait_connected(Duration::from_secs(5)).await.expect("mock connects");
        (uplink, transport)
    }

    fn sent_json(transport: &MockTransport) -> Vec<Value> {
        transport
            .sent_text()
            .iter()
            .map(|text| serde_json::from_str(text).expect("outbound text is JSON"))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn heading_response_reports_latency() {
        let _ = tracing_subscriber::fmt::try_init();
        let (uplink, transport) = started(config()).await;
        let mut events = Box::pin(uplink.events());

        assert!(uplink.submit_frame(vec![0xFF, 0xD8, 0xFF]).is_accepted());
        settle().await;
        tokio::time::advance(Duration::from_millis(120)).await;
        assert!(transport.server().send_text(r#"{"heading": 45.0, "frame_id": 1}"#));

        let update = loop {
            match events.next().await {
                Some(UplinkEvent::Heading(update)) => break update,
                Some(_) => continue,
                None => panic!("event stream ended"),
            }
        };

        assert!(update.matched);
        assert_eq!(update.heading, 45.0);
        assert_eq!(update.latency, Some(Duration::from_millis(120)));
        assert_eq!(uplink.pending_count(), 0);
        assert_eq!(uplink.status().last_latency, Some(Duration::from_millis(120)));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_frame_id_still_delivers_heading() {
        let (uplink, transport) = started(config()).await;
        let mut events = Box::pin(uplink.events());

        assert!(transport.server().send_text(r#"{"heading": 100.0, "frame_id": 999}"#));

        let update = loop {
            match events.next().await {
                Some(UplinkEvent::Heading(update)) => break update,
                Some(_) => continue,
                None => panic!("event stream ended"),
            }
        };
        assert!(!update.matched);
        assert_eq!(update.frame_id, Some(999));
        assert_eq!(update.latency, None);
        assert_eq!(uplink.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_messages_are_ignored() {
        let (uplink, transport) = started(config()).await;
        let server = transport.server();

        assert!(server.send_text("not json"));
        assert!(server.send_text(r#"{"type": "hello"}"#));
        assert!(server.send_text(r#"{"heading": "north"}"#));
        assert!(server.send_text("[1, 2, 3]"));
        settle().await;

        assert_eq!(uplink.status().last_heading, None);
        assert_eq!(uplink.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn direction_changes_are_published_once() {
        let (uplink, transport) = started(config()).await;
        let server = transport.server();

        for heading in [90.0, 92.0, 130.0, 135.0, 20.0] {
            assert!(server.send_text(format!(r#"{{"heading": {}}}"#, heading)));
        }
        settle().await;

        assert_eq!(uplink.status().last_direction, Some(Direction::Right));

        let mut events = Box::pin(uplink.events());
        uplink.update_heading_tolerance(40);
        // 60° is inside the widened forward band (54, 126)
        assert!(server.send_text(r#"{"heading": 60.0}"#));
        settle().await;

        let mut directions = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(1), events.next()).await {
            if let UplinkEvent::DirectionChanged(direction) = event {
                directions.push(direction);
            }
        }
        assert_eq!(directions, vec![Direction::Forward]);
    }

    #[tokio::test(start_paused = true)]
    async fn location_is_sent_and_used_in_envelopes() {
        let (uplink, transport) = started(config()).await;

        uplink.send_location(LocationFix::new(51.05, 3.72, 9.5)).await;
        assert!(uplink.submit_frame(vec![1u8; 16]).is_accepted());
        settle().await;

        let messages = sent_json(&transport);
        assert_eq!(messages[0]["type"], "location");
        assert_eq!(messages[0]["lat"], 51.05);
        assert_eq!(messages[0]["accuracy_m"], 9.5);
        assert_eq!(messages[1]["type"], "frame_meta");
        assert_eq!(messages[1]["latitude"], "51.05");
        assert_eq!(messages[1]["longitude"], "3.72");
        assert_eq!(messages[1]["latency_ms"], "");
    }

    #[tokio::test(start_paused = true)]
    async fn stats_report_last_known_values() {
        let (uplink, transport) = started(config()).await;

        uplink.send_stats().await;

        let messages = sent_json(&transport);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["type"], "stats");
        assert_eq!(messages[0]["latency"], "");
    }

    #[tokio::test(start_paused = true)]
    async fn model_update_notifies_server_and_applies_to_next_frame() {
        let (uplink, transport) = started(config()).await;

        uplink.update_model("yolov8n.pt").await;
        assert!(uplink.submit_frame(vec![7u8; 4]).is_accepted());
        settle().await;

        let messages = sent_json(&transport);
        assert_eq!(messages[0]["type"], "Setting");
        assert_eq!(messages[0]["selectedModel"], "yolov8n.pt");
        assert_eq!(messages[1]["selectedModel"], "yolov8n.pt");
        assert_eq!(uplink.settings().selected_model, "yolov8n.pt");
    }

    #[tokio::test(start_paused = true)]
    async fn settings_updates_are_validated() {
        let (uplink, _transport) = started(config()).await;

        uplink.update_heading_tolerance(75);
        assert_eq!(uplink.settings().heading_tolerance_pct, 40);
        uplink.update_heading_tolerance(-3);
        assert_eq!(uplink.settings().heading_tolerance_pct, 0);

        uplink.update_max_frame_bytes(0);
        assert_eq!(uplink.settings().max_frame_bytes, crate::config::DEFAULT_MAX_FRAME_BYTES);

        uplink.update_min_interval(0);
        assert_eq!(uplink.settings().min_interval, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_while_disconnected_triggers_connect() {
        let transport = MockTransport::new();
        transport.set_connect_delay(Duration::from_millis(10));
        let uplink = Uplink::with_transport(config(), transport.clone()).expect("valid config");

        uplink.send_stats().await;
        uplink.send_stats().await;
        settle().await;

        assert_eq!(transport.connect_attempts(), 1);
        assert!(transport.sent().is_empty());
        uplink.wait_connected(Duration::from_secs(1)).await.expect("connects");
    }

    #[tokio::test(start_paused = true)]
    async fn status_tracks_connection() {
        let (uplink, _transport) = started(config()).await;
        settle().await;
        assert_eq!(uplink.status().connection, ConnectionState::Open);

        uplink.shutdown().await;
        settle().await;
        assert_eq!(uplink.status().connection, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_uploads() {
        let (uplink, transport) = started(config()).await;

        uplink.shutdown().await;
        uplink.shutdown().await;

        assert_eq!(transport.close_codes(), vec![1000]);
        assert!(!uplink.submit_frame(vec![1u8; 4]).is_accepted());
        assert!(matches!(
            uplink.wait_connected(Duration::from_millis(10)).await,
            Err(UplinkError::ShutDown)
        ));
        settle().await;
        assert!(transport.sent().is_empty());
        assert_eq!(transport.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_does_not_hang_on_stalled_frame_write() {
        let (uplink, transport) = started(config()).await;
        transport.set_stall_writes(true);

        assert!(uplink.submit_frame(vec![0xFF, 0xD8, 0xFF]).is_accepted());
        settle().await;

        tokio::time::timeout(Duration::from_secs(60), uplink.shutdown())
            .await
            .expect("shutdown hung behind the frame write");

        assert_eq!(uplink.state(), ConnectionState::Disconnected);
        assert_eq!(transport.close_codes(), vec![1000]);
        assert_eq!(uplink.pending_count(), 0);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let result = Uplink::with_transport(UplinkConfig::default(), MockTransport::new());
        assert!(matches!(result, Err(UplinkError::Config { .. })));
    }
}
