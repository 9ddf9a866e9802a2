//! Common test utilities for pulsewire integration tests
//!
//! - Retry policies with short delays
//! - A scripted in-memory transport (HTTP statuses and duplex streams)
//! - A local WebSocket echo server built on tokio-tungstenite

#![allow(dead_code)]

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::channel::mpsc as fmpsc;
use futures::future::{BoxFuture, FutureExt};
use futures::{Sink, SinkExt, StreamExt};
use pulsewire::client::{Duplex, Transport};
use pulsewire::errors::{PulsewireError, Result};
use pulsewire::request::{Request, Response};
use pulsewire::websocket::WsMessage;
use pulsewire::RetryPolicy;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

/// Retry policy with a 10ms base delay and no jitter
pub fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy::default()
        .with_max_retries(max_retries)
        .with_base_delay(Duration::from_millis(10))
}

// ============================================================================
// Scripted transport
// ============================================================================

/// Test-side handles of a duplex stream handed out by [`ScriptedTransport`]
pub struct DuplexPeer {
    /// Frames the session wrote
    pub written: fmpsc::UnboundedReceiver<WsMessage>,
    /// Push frames (or errors) for the session to read
    pub inbound: fmpsc::UnboundedSender<Result<WsMessage>>,
}

/// Build a connected in-memory duplex pair
pub fn duplex_pair() -> (Duplex, DuplexPeer) {
    let (out_tx, out_rx) = fmpsc::unbounded::<WsMessage>();
    let (in_tx, in_rx) = fmpsc::unbounded::<Result<WsMessage>>();
    let sink = out_tx.sink_map_err(|e| PulsewireError::ConnectionClosed(e.to_string()));
    let duplex = Duplex::new(Box::pin(sink), in_rx.boxed());
    (
        duplex,
        DuplexPeer {
            written: out_rx,
            inbound: in_tx,
        },
    )
}

/// Sink that never becomes ready, like a peer that stopped reading
struct StalledSink;

impl Sink<WsMessage> for StalledSink {
    type Error = PulsewireError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Pending
    }

    fn start_send(self: Pin<&mut Self>, _item: WsMessage) -> Result<()> {
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Pending
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Pending
    }
}

/// Duplex whose writes block forever; the sender feeds its read side
pub fn stalled_pair() -> (Duplex, fmpsc::UnboundedSender<Result<WsMessage>>) {
    let (in_tx, in_rx) = fmpsc::unbounded::<Result<WsMessage>>();
    (Duplex::new(Box::pin(StalledSink), in_rx.boxed()), in_tx)
}

/// Replays canned statuses in order, then answers 200.
///
/// Each body is `{"n": <call number>}`.
#[derive(Default)]
pub struct ScriptedTransport {
    statuses: Mutex<Vec<u16>>,
    seen: Mutex<Vec<Request>>,
    duplexes: Mutex<Vec<Duplex>>,
}

impl ScriptedTransport {
    pub fn new(statuses: &[u16]) -> Arc<Self> {
        Arc::new(Self {
            statuses: Mutex::new(statuses.iter().rev().copied().collect()),
            ..Default::default()
        })
    }

    /// Queue a duplex stream for the next `open_duplex` call
    pub fn push_duplex(&self, duplex: Duplex) {
        self.duplexes.lock().unwrap().push(duplex);
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<Request> {
        self.seen.lock().unwrap().clone()
    }
}

impl Transport for ScriptedTransport {
    fn send<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>> {
        let n = {
            let mut seen = self.seen.lock().unwrap();
            seen.push(request.clone());
            seen.len()
        };
        let status = self.statuses.lock().unwrap().pop().unwrap_or(200);
        let response = Response::new(
            StatusCode::from_u16(status).unwrap(),
            HeaderMap::new(),
            format!(r#"{{"n":{}}}"#, n),
        );
        async move { Ok(response) }.boxed()
    }

    fn open_duplex<'a>(&'a self, _url: &'a Url, _headers: &'a HeaderMap) -> BoxFuture<'a, Result<Duplex>> {
        let next = self.duplexes.lock().unwrap().pop();
        async move { next.ok_or_else(|| PulsewireError::Connection("connection refused".to_string())) }.boxed()
    }
}

// ============================================================================
// WebSocket echo server
// ============================================================================

/// Start a local WebSocket server and return its `ws://` URL.
///
/// Text and binary frames are echoed. The text `"close"` makes the server
/// send a Close frame (1000, "bye"); `"drop"` makes it drop the TCP stream
/// without a closing handshake.
pub async fn echo_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(message)) = ws.next().await {
                    match message {
                        Message::Text(ref text) if text.as_str() == "close" => {
                            let frame = CloseFrame {
                                code: CloseCode::Normal,
                                reason: "bye".into(),
                            };
                            let _ = ws.send(Message::Close(Some(frame))).await;
                        }
                        Message::Text(ref text) if text.as_str() == "drop" => return,
                        Message::Text(_) | Message::Binary(_) => {
                            if ws.send(message).await.is_err() {
                                return;
                            }
                        }
                        Message::Close(_) => return,
                        _ => {}
                    }
                }
            });
        }
    });

    format!("ws://{}", addr)
}
