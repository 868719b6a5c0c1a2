//! WebSocket transport built on tokio-tungstenite

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace};

use crate::transport::{Incoming, LinkSink, LinkSource, Outgoing, Transport};
use crate::{Result, UplinkError};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport that opens a WebSocket client connection to a fixed URL.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait::async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self) -> Result<(Box<dyn LinkSink>, Box<dyn LinkSource>)> {
        debug!(url = %self.url, "Opening WebSocket");

        let (socket, response) = connect_async(self.url.as_str()).await.map_err(|e| {
            UplinkError::connection_failed_with_source(
                format!("WebSocket handshake with {} failed", self.url),
                Box::new(e),
            )
        })?;

        info!(url = %self.url, status = %response.status(), "WebSocket connected");

        let (sink, stream) = socket.split();
        Ok((Box::new(WebSocketSink { sink }), Box::new(WebSocketSource { stream })))
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}

struct WebSocketSink {
    sink: SplitSink<Socket, Message>,
}

#[async_trait::async_trait]
impl LinkSink for WebSocketSink {
    async fn send(&mut self, message: Outgoing) -> Result<()> {
        let message = match message {
            Outgoing::Text(text) => Message::Text(text.into()),
            Outgoing::Binary(bytes) => Message::Binary(bytes),
            Outgoing::Ping => Message::Ping(Default::default()),
        };

        self.sink
            .send(message)
            .await
            .map_err(|e| UplinkError::transport_failed("WebSocket send", Box::new(e)))
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<()> {
        let frame = CloseFrame { code: CloseCode::from(code), reason: reason.to_owned().into() };

        self.sink
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| UplinkError::transport_failed("WebSocket close", Box::new(e)))?;
        self.sink
            .close()
            .await
            .map_err(|e| UplinkError::transport_failed("WebSocket close", Box::new(e)))
    }
}

struct WebSocketSource {
    stream: SplitStream<Socket>,
}

#[async_trait::async_trait]
impl LinkSource for WebSocketSource {
    async fn recv(&mut self) -> Result<Option<Incoming>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(Incoming::Text(text.as_str().to_owned()))),
                Some(Ok(Message::Binary(bytes))) => return Ok(Some(Incoming::Binary(bytes))),
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Peer sent close frame");
                    return Ok(None);
                }
                // tungstenite answers pings itself
                Some(Ok(other)) => {
                    trace!(kind = ?other, "Ignoring control message");
                    continue;
                }
                Some(Err(e)) => {
                    return Err(UplinkError::connection_failed_with_source(
                        "WebSocket read failed",
                        Box::new(e),
                    ));
                }
                None => return Err(UplinkError::connection_failed("WebSocket stream ended without close frame")),
            }
        }
    }
}
