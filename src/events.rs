//! Events and aggregate status published to the presentation layer
//!
//! Producers never block on consumers: events go through a broadcast channel
//! (slow subscribers skip ahead) and the aggregate status lives in a watch
//! channel that always holds the latest snapshot.

use futures::{Stream, StreamExt};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tracing::debug;

use crate::feedback::Direction;
use crate::ledger::HeadingUpdate;
use crate::types::{ConnectionState, FrameId, SentFrame};

/// Typed notification from the uplink.
#[derive(Debug, Clone)]
pub enum UplinkEvent {
    /// A frame envelope and payload were handed to the transport
    FrameSent(SentFrame),
    /// The server reported a heading
    Heading(HeadingUpdate),
    /// The direction cue changed
    DirectionChanged(Direction),
    /// The connection changed state
    Connection(ConnectionState),
}

/// Aggregate state suitable for an info overlay.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UplinkStatus {
    pub connection: ConnectionState,
    pub last_frame_id: Option<FrameId>,
    pub last_latency: Option<Duration>,
    pub last_heading: Option<f64>,
    pub last_direction: Option<Direction>,
    pub frames_sent: u64,
}

/// Fan-out point for events and status.
#[derive(Debug)]
pub struct EventHub {
    events: broadcast::Sender<UplinkEvent>,
    status: watch::Sender<UplinkStatus>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        let (status, _) = watch::channel(UplinkStatus::default());
        Self { events, status }
    }

    /// Fold `event` into the status snapshot and broadcast it.
    pub fn publish(&self, event: UplinkEvent) {
        self.status.send_if_modified(|status| match &event {
            UplinkEvent::FrameSent(frame) => {
                status.last_frame_id = Some(frame.id);
                status.frames_sent += 1;
                true
            }
            UplinkEvent::Heading(update) => {
                status.last_heading = Some(update.heading);
                if update.latency.is_some() {
                    status.last_latency = update.latency;
                }
                true
            }
            UplinkEvent::DirectionChanged(direction) => {
                status.last_direction = Some(*direction);
                true
            }
            UplinkEvent::Connection(state) => {
                let changed = status.connection != *state;
                status.connection = *state;
                changed
            }
        });

        // No subscribers is fine
        if self.events.send(event).is_err() {
            debug!("No event subscribers");
        }
    }

    /// Current status snapshot.
    pub fn status(&self) -> UplinkStatus {
        self.status.borrow().clone()
    }

    /// Stream of status snapshots, starting with the current one.
    pub fn status_updates(&self) -> impl Stream<Item = UplinkStatus> + 'static {
        WatchStream::new(self.status.subscribe())
    }

    /// Stream of events published after this call. Lagged items are skipped.
    pub fn events(&self) -> impl Stream<Item = UplinkEvent> + 'static {
        BroadcastStream::new(self.events.subscribe()).filter_map(|item| async move {
            match item {
                Ok(event) => Some(event),
                Err(lagged) => {
                    debug!("Event subscriber lagged: {}", lagged);
                    None
                }
            }
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::time::Instant;

    fn sent(id: FrameId) -> UplinkEvent {
        UplinkEvent::FrameSent(SentFrame { id, payload: Bytes::from_static(b"x"), sent_at: Instant::now() })
    }

    #[tokio::test]
    async fn status_folds_events() {
        let hub = EventHub::new(8);
        hub.publish(sent(1));
        hub.publish(sent(2));
        hub.publish(UplinkEvent::Heading(HeadingUpdate {
            heading: 80.0,
            frame_id: Some(2),
            latency: Some(Duration::from_millis(33)),
            matched: true,
        }));
        hub.publish(UplinkEvent::Connection(ConnectionState::Open));

        let status = hub.status();
        assert_eq!(status.last_frame_id, Some(2));
        assert_eq!(status.frames_sent, 2);
        assert_eq!(status.last_heading, Some(80.0));
        assert_eq!(status.last_latency, Some(Duration::from_millis(33)));
        assert_eq!(status.connection, ConnectionState::Open);
    }

    #[tokio::test]
    async fn unknown_latency_keeps_previous_value() {
        let hub = EventHub::new(8);
        hub.publish(UplinkEvent::Heading(HeadingUpdate {
            heading: 80.0,
            frame_id: Some(1),
            latency: Some(Duration::from_millis(10)),
            matched: true,
        }));
        hub.publish(UplinkEvent::Heading(HeadingUpdate { heading: 70.0, frame_id: None, latency: None, matched: false }));

        assert_eq!(hub.status().last_latency, Some(Duration::from_millis(10)));
        assert_eq!(hub.status().last_heading, Some(70.0));
    }

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let hub = EventHub::new(8);
        let mut events = Box::pin(hub.events());

        hub.publish(sent(1));
        hub.publish(UplinkEvent::DirectionChanged(Direction::Left));

        assert!(matches!(events.next().await, Some(UplinkEvent::FrameSent(f)) if f.id == 1));
        assert!(matches!(events.next().await, Some(UplinkEvent::DirectionChanged(Direction::Left))));
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_ahead() {
        let hub = EventHub::new(2);
        let mut events = Box::pin(hub.events());

        for id in 1..=5 {
            hub.publish(sent(id));
        }

        // Capacity 2 keeps the newest two
        assert!(matches!(events.next().await, Some(UplinkEvent::FrameSent(f)) if f.id == 4));
        assert!(matches!(events.next().await, Some(UplinkEvent::FrameSent(f)) if f.id == 5));
    }
}
