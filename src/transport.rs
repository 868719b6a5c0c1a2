//! Transport trait for the message channel
//!
//! A transport opens one bidirectional, message-framed link to the remote
//! endpoint and hands back its two halves. The connection manager owns both
//! halves exclusively: it writes through the [`LinkSink`] and a dedicated
//! reader task drains the [`LinkSource`].

use bytes::Bytes;

use crate::Result;

/// Close code for a normal, intentional closure.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Message written to the link.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    /// UTF-8 text (JSON telemetry and frame envelopes)
    Text(String),
    /// Raw binary payload (JPEG bytes)
    Binary(Bytes),
    /// Keepalive probe
    Ping,
}

/// Message read from the link.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Text(String),
    Binary(Bytes),
}

/// Factory for links to the remote endpoint.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a new link.
    ///
    /// Returns:
    /// - `Ok((sink, source))` - Link established
    /// - `Err(e)` - Endpoint unreachable or handshake rejected
    async fn connect(&self) -> Result<(Box<dyn LinkSink>, Box<dyn LinkSource>)>;

    /// Human readable endpoint description for logs.
    fn endpoint(&self) -> &str;
}

/// Write half of a link.
#[async_trait::async_trait]
pub trait LinkSink: Send + 'static {
    /// Write one message. Messages are delivered in call order.
    async fn send(&mut self, message: Outgoing) -> Result<()>;

    /// Send a close frame and release the write half.
    async fn close(&mut self, code: u16, reason: &str) -> Result<()>;
}

/// Read half of a link.
#[async_trait::async_trait]
pub trait LinkSource: Send + 'static {
    /// Wait for the next message.
    ///
    /// Returns:
    /// - `Ok(Some(message))` - Message received
    /// - `Ok(None)` - The peer closed the link cleanly
    /// - `Err(e)` - The link failed or ended abruptly
    async fn recv(&mut self) -> Result<Option<Incoming>>;
}
