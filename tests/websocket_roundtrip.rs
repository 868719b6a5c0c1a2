//! End-to-end tests for the WebSocket transport against a local server
//!
//! The server side is a plain tokio-tungstenite acceptor on an ephemeral
//! port, so these run anywhere without external services.

use anyhow::{Context, Result, bail};
use futures::{SinkExt, StreamExt};
use ipcam_uplink::{ConnectionState, Uplink, UplinkConfig, UplinkEvent};
use serde_json::Value;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};

type ServerSocket = WebSocketStream<TcpStream>;

async fn listen() -> Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    Ok((listener, addr))
}

async fn accept(listener: &TcpListener) -> Result<ServerSocket> {
    let (stream, _) = listener.accept().await?;
    Ok(accept_async(stream).await?)
}

fn config(addr: SocketAddr) -> UplinkConfig {
    UplinkConfig {
        ping_interval_secs: 0,
        reconnect_delay_ms: 100,
        ..UplinkConfig::new(format!("ws://{}", addr))
    }
}

/// Next text or binary message, skipping control frames.
async fn next_data(ws: &mut ServerSocket) -> Result<Message> {
    while let Some(message) = ws.next().await {
        match message? {
            message @ (Message::Text(_) | Message::Binary(_)) => return Ok(message),
            Message::Close(frame) => bail!("client closed early: {:?}", frame),
            _ => continue,
        }
    }
    bail!("client went away")
}

/// Close code sent by the client, once it closes.
async fn close_code(ws: &mut ServerSocket) -> Result<Option<u16>> {
    while let Some(message) = ws.next().await {
        if let Message::Close(frame) = message? {
            return Ok(frame.map(|f| u16::from(f.code)));
        }
    }
    Ok(None)
}

#[tokio::test]
async fn frame_pair_and_heading_round_trip() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let (listener, addr) = listen().await?;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await?;

        let Message::Text(meta) = next_data(&mut ws).await? else {
            bail!("expected frame_meta text first");
        };
        let meta: Value = serde_json::from_str(meta.as_str())?;
        let Message::Binary(payload) = next_data(&mut ws).await? else {
            bail!("expected binary payload after frame_meta");
        };

        let frame_id = meta["frame_id"].as_u64().context("frame_id missing")?;
        let reply = serde_json::json!({ "heading": 130.0, "frame_id": frame_id }).to_string();
        ws.send(Message::Text(reply.into())).await?;

        let code = close_code(&mut ws).await?;
        Ok::<_, anyhow::Error>((meta, payload.to_vec(), code))
    });

    let uplink = Uplink::start(config(addr))?;
    let mut events = Box::pin(uplink.events());
    uplink.connect();
    uplink.wait_connected(Duration::from_secs(5)).await?;

    let jpeg = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0xFF, 0xD9];
    assert!(uplink.submit_frame(jpeg.clone()).is_accepted());

    let (heading, direction) = tokio::time::timeout(Duration::from_secs(5), async {
        let mut heading = None;
        while let Some(event) = events.next().await {
            match event {
                UplinkEvent::Heading(update) => heading = Some(update),
                UplinkEvent::DirectionChanged(direction) => return (heading, Some(direction)),
                _ => {}
            }
        }
        (heading, None)
    })
    .await?;

    let heading = heading.context("no heading event")?;
    assert!(heading.matched);
    assert_eq!(heading.frame_id, Some(1));
    assert!(heading.latency.is_some());
    assert_eq!(direction, Some(ipcam_uplink::Direction::Left));

    uplink.shutdown().await;

    let (meta, payload, code) = server.await??;
    assert_eq!(meta["type"], "frame_meta");
    assert_eq!(meta["frame_id"], 1);
    assert_eq!(meta["latency_ms"], "");
    assert_eq!(meta["selectedModel"], "unrealsim.pt");
    assert_eq!(payload, jpeg);
    assert_eq!(code, Some(1000));
    Ok(())
}

#[tokio::test]
async fn reconnects_after_server_drops_connection() -> Result<()> {
    let (listener, addr) = listen().await?;

    let server = tokio::spawn(async move {
        // First link is dropped without a close handshake
        let first = accept(&listener).await?;
        drop(first);

        let mut second = accept(&listener).await?;
        close_code(&mut second).await
    });

    let uplink = Uplink::start(config(addr))?;
    let mut events = Box::pin(uplink.events());
    uplink.connect();

    let transitions = tokio::time::timeout(Duration::from_secs(10), async {
        let mut seen = Vec::new();
        while let Some(event) = events.next().await {
            if let UplinkEvent::Connection(state) = event {
                seen.push(state);
                if state == ConnectionState::Open && seen.contains(&ConnectionState::Disconnected) {
                    break;
                }
            }
        }
        seen
    })
    .await?;

    assert!(transitions.contains(&ConnectionState::Disconnected));
    assert_eq!(uplink.state(), ConnectionState::Open);

    uplink.shutdown().await;
    assert_eq!(server.await??, Some(1000));
    Ok(())
}

#[tokio::test]
async fn unreachable_server_keeps_retrying() -> Result<()> {
    // Bind then drop to get a port nothing listens on
    let (listener, addr) = listen().await?;
    drop(listener);

    let uplink = Uplink::start(config(addr))?;
    uplink.connect();

    let result = uplink.wait_connected(Duration::from_millis(500)).await;
    assert!(matches!(result, Err(ipcam_uplink::UplinkError::Timeout { .. })));
    assert_ne!(uplink.state(), ConnectionState::Open);

    let dropped = uplink.submit_frame(vec![1u8, 2, 3]);
    assert!(!dropped.is_accepted());

    uplink.shutdown().await;
    assert_eq!(uplink.state(), ConnectionState::Disconnected);
    Ok(())
}
