//! WebSocket session state machine over a transport duplex stream
//!
//! ```text
//! Disconnected --connect--> Connecting --handshake ok--> Open
//!      ^                        |                          |
//!      |                   handshake err              disconnect / remote close
//!      |                        v                          v
//!      +------------------- Failed <--- I/O error ---- Closing
//! ```
//!
//! Each Open period owns one reader task, one optional keep-alive task and a
//! connection-scoped cancellation token. Leaving Open cancels the token, which
//! ends the period's incoming stream.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::stream::{self, BoxStream};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::types::{ws_url, SessionState, WsMessage, WsOptions};
use crate::client::transport::{DuplexSink, DuplexSource, Transport};
use crate::errors::{PulsewireError, Result};

type Writer = Arc<AsyncMutex<DuplexSink>>;

/// Read error that ended a period, yielded after the buffered messages
type Failure = Arc<Mutex<Option<PulsewireError>>>;

/// Resources of one Open period
struct Connection {
    generation: u64,
    writer: Writer,
    cancel: CancellationToken,
    incoming: Option<mpsc::Receiver<Result<WsMessage>>>,
    failure: Failure,
}

#[derive(Default)]
struct Slot {
    generation: u64,
    connection: Option<Connection>,
    /// Cancels a handshake that is still running
    connecting: Option<CancellationToken>,
}

struct Shared {
    slot: Mutex<Slot>,
    state: watch::Sender<SessionState>,
}

impl Shared {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        // Nothing panics while holding the lock; recover the data regardless
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "websocket state change");
        }
    }

    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Tear down the Open period `generation` if it is still current
    fn end_connection(&self, generation: u64, next: SessionState) {
        let mut slot = self.slot();
        let current = slot.connection.as_ref().map(|c| c.generation);
        if current == Some(generation) {
            if let Some(connection) = slot.connection.take() {
                connection.cancel.cancel();
            }
            self.set_state(next);
        }
    }
}

/// A reconnectable WebSocket session.
///
/// Sending and receiving are independent: writes are serialized through an
/// async mutex while a background task reads into the current incoming
/// stream.
pub struct WsSession {
    transport: Arc<dyn Transport>,
    url: Url,
    options: WsOptions,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for WsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsSession")
            .field("url", &self.url.as_str())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl WsSession {
    pub fn new(transport: Arc<dyn Transport>, url: &str, options: WsOptions) -> Result<Self> {
        let url = ws_url(url)?;
        let (state, _) = watch::channel(SessionState::Disconnected);
        Ok(Self {
            transport,
            url,
            options,
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot::default()),
                state,
            }),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Observe every state change
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Open the connection.
    ///
    /// A no-op while Open. Fails with `WebSocket` while another connect or a
    /// disconnect is in progress, and with `Connection` when the handshake
    /// fails, leaving the session Failed.
    pub async fn connect(&self) -> Result<()> {
        let (generation, abort) = {
            let mut slot = self.shared.slot();
            match self.shared.state() {
                SessionState::Open => return Ok(()),
                SessionState::Connecting => {
                    return Err(PulsewireError::WebSocket("connect already in progress".to_string()))
                }
                SessionState::Closing => {
                    return Err(PulsewireError::WebSocket("disconnect in progress".to_string()))
                }
                SessionState::Disconnected | SessionState::Failed => {}
            }
            slot.generation += 1;
            let abort = CancellationToken::new();
            slot.connecting = Some(abort.clone());
            self.shared.set_state(SessionState::Connecting);
            (slot.generation, abort)
        };

        info!(url = %self.url, "connecting websocket");
        let handshake = async {
            let open = self.transport.open_duplex(&self.url, &self.options.headers);
            match self.options.connect_timeout {
                Some(limit) => match tokio::time::timeout(limit, open).await {
                    Ok(result) => result,
                    Err(_) => Err(PulsewireError::Timeout(limit.as_secs_f64())),
                },
                None => open.await,
            }
        };
        let result = tokio::select! {
            biased;
            _ = abort.cancelled() => Err(PulsewireError::Cancelled),
            result = handshake => result,
        };

        let mut slot = self.shared.slot();
        let still_current = slot.generation == generation && self.shared.state() == SessionState::Connecting;
        if still_current {
            slot.connecting = None;
        }

        let duplex = match result {
            Ok(duplex) if still_current => duplex,
            // disconnect() won the race; the fresh stream is dropped here
            Ok(_) | Err(PulsewireError::Cancelled) => return Err(PulsewireError::Cancelled),
            Err(error) => {
                if still_current {
                    self.shared.set_state(SessionState::Failed);
                }
                warn!(url = %self.url, error = %error, "websocket handshake failed");
                return Err(match error {
                    PulsewireError::Connection(_) | PulsewireError::Timeout(_) => error,
                    other => PulsewireError::Connection(other.to_string()),
                });
            }
        };

        let writer: Writer = Arc::new(AsyncMutex::new(duplex.sink));
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(self.options.buffer.max(1));
        let failure = Failure::default();

        tokio::spawn(read_loop(
            self.shared.clone(),
            generation,
            duplex.source,
            writer.clone(),
            tx,
            failure.clone(),
            cancel.clone(),
            self.options.auto_pong,
        ));
        if let Some(interval) = self.options.ping_interval {
            tokio::spawn(keep_alive(self.shared.clone(), generation, writer.clone(), cancel.clone(), interval));
        }

        slot.connection = Some(Connection {
            generation,
            writer,
            cancel,
            incoming: Some(rx),
            failure,
        });
        self.shared.set_state(SessionState::Open);
        info!(url = %self.url, "websocket open");
        Ok(())
    }

    /// Send one message; only valid while Open
    pub async fn send(&self, message: WsMessage) -> Result<()> {
        let (generation, writer, cancel) = {
            let slot = self.shared.slot();
            match (&slot.connection, self.shared.state()) {
                (Some(c), SessionState::Open) => (c.generation, c.writer.clone(), c.cancel.clone()),
                _ => return Err(PulsewireError::NotConnected),
            }
        };

        let write = async {
            let mut sink = writer.lock().await;
            sink.send(message).await
        };
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PulsewireError::ConnectionClosed("session closed".to_string())),
            result = write => result,
        };

        if let Err(ref error) = result {
            // A cancelled token means disconnect() already owns the teardown
            if !cancel.is_cancelled() {
                warn!(error = %error, "websocket send failed");
                self.shared.end_connection(generation, SessionState::Failed);
            }
        }
        result
    }

    /// Serialize `value` as JSON and send it as a text frame
    pub async fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        self.send(WsMessage::json(value)?).await
    }

    /// Messages received during the current Open period.
    ///
    /// Can be taken once per period; the stream ends when the session leaves
    /// Open. A read error that fails the session is yielded as the last item.
    /// Control frames are handled internally and not yielded.
    ///
    /// Frames are read in order. Once [`WsOptions::buffer`] messages are
    /// waiting, reading pauses until the stream is polled, so Pings behind
    /// them go unanswered and a remote Close goes unnoticed. Drain the stream
    /// (or drop it) to keep the connection serviced; a stream that is never
    /// taken pauses reading the same way.
    pub fn incoming(&self) -> Result<BoxStream<'static, Result<WsMessage>>> {
        let mut slot = self.shared.slot();
        if self.shared.state() != SessionState::Open {
            return Err(PulsewireError::NotConnected);
        }
        let (receiver, failure) = slot
            .connection
            .as_mut()
            .and_then(|c| c.incoming.take().map(|rx| (rx, c.failure.clone())))
            .ok_or_else(|| PulsewireError::WebSocket("incoming stream already taken".to_string()))?;

        let messages = stream::unfold(Some((receiver, failure)), |state| async move {
            let (mut rx, failure) = state?;
            match rx.recv().await {
                Some(item) => Some((item, Some((rx, failure)))),
                None => {
                    let error = lock_failure(&failure).take()?;
                    Some((Err(error), None))
                }
            }
        });
        Ok(messages.boxed())
    }

    /// Close the connection. Safe to call in any state.
    ///
    /// Pending sends and reads are cancelled right away; a Close frame is then
    /// written on a best-effort basis, bounded by `close_timeout`.
    pub async fn disconnect(&self) -> Result<()> {
        let connection = {
            let mut slot = self.shared.slot();
            match self.shared.state() {
                SessionState::Disconnected => return Ok(()),
                SessionState::Closing => None,
                SessionState::Connecting => {
                    if let Some(abort) = slot.connecting.take() {
                        abort.cancel();
                    }
                    self.shared.set_state(SessionState::Disconnected);
                    return Ok(());
                }
                SessionState::Open | SessionState::Failed => match slot.connection.take() {
                    Some(connection) => {
                        self.shared.set_state(SessionState::Closing);
                        Some(connection)
                    }
                    None => {
                        self.shared.set_state(SessionState::Disconnected);
                        return Ok(());
                    }
                },
            }
        };

        let Some(connection) = connection else {
            // Another caller is closing; wait for it to finish
            let mut state = self.watch_state();
            let _ = state.wait_for(|s| *s != SessionState::Closing).await;
            return Ok(());
        };

        connection.cancel.cancel();
        let writer = connection.writer.clone();
        let close = async move {
            let mut sink = writer.lock().await;
            sink.send(WsMessage::Close(Some(1000), String::new())).await?;
            sink.close().await
        };
        match tokio::time::timeout(self.options.close_timeout, close).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => debug!(error = %error, "close frame not delivered"),
            Err(_) => debug!("close frame timed out"),
        }

        self.shared.set_state(SessionState::Disconnected);
        info!(url = %self.url, "websocket disconnected");
        Ok(())
    }
}

impl Drop for WsSession {
    fn drop(&mut self) {
        let mut slot = self.shared.slot();
        if let Some(abort) = slot.connecting.take() {
            abort.cancel();
        }
        if let Some(connection) = slot.connection.take() {
            connection.cancel.cancel();
        }
    }
}

fn lock_failure(failure: &Failure) -> MutexGuard<'_, Option<PulsewireError>> {
    failure.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Pump the duplex source into the incoming channel until the period ends
#[allow(clippy::too_many_arguments)]
async fn read_loop(
    shared: Arc<Shared>,
    generation: u64,
    mut source: DuplexSource,
    writer: Writer,
    tx: mpsc::Sender<Result<WsMessage>>,
    failure: Failure,
    cancel: CancellationToken,
    auto_pong: bool,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = source.next() => next,
        };

        match next {
            Some(Ok(WsMessage::Ping(data))) => {
                if auto_pong {
                    let pong = async {
                        let mut sink = writer.lock().await;
                        sink.send(WsMessage::Pong(data)).await
                    };
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        result = pong => if let Err(error) = result {
                            debug!(error = %error, "pong failed");
                        },
                    }
                }
            }
            Some(Ok(WsMessage::Pong(_))) => {}
            Some(Ok(WsMessage::Close(code, reason))) => {
                info!(code = ?code, reason = %reason, "websocket closed by peer");
                shared.end_connection(generation, SessionState::Disconnected);
                return;
            }
            Some(Ok(message)) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    // A dropped receiver only means nobody is listening
                    _ = tx.send(Ok(message)) => {}
                }
            }
            Some(Err(error)) => {
                warn!(error = %error, "websocket read failed");
                // Dropping `tx` below closes the channel; the stream yields this last
                *lock_failure(&failure) = Some(error);
                shared.end_connection(generation, SessionState::Failed);
                return;
            }
            None => {
                debug!("websocket stream ended");
                shared.end_connection(generation, SessionState::Disconnected);
                return;
            }
        }
    }
}

/// Send a Ping every `interval` while the period lasts
async fn keep_alive(
    shared: Arc<Shared>,
    generation: u64,
    writer: Writer,
    cancel: CancellationToken,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let ping = async {
            let mut sink = writer.lock().await;
            sink.send(WsMessage::Ping(Vec::new())).await
        };
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = ping => result,
        };
        if let Err(error) = result {
            warn!(error = %error, "keep-alive ping failed");
            shared.end_connection(generation, SessionState::Failed);
            return;
        }
    }
}
