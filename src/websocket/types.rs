//! WebSocket types and data structures

use std::fmt;
use std::time::Duration;

use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use url::Url;

use crate::errors::{PulsewireError, Result};

/// WebSocket message types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<u16>, String),
}

impl WsMessage {
    pub fn text(text: impl Into<String>) -> Self {
        WsMessage::Text(text.into())
    }

    /// Text frame holding `value` as JSON
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        serde_json::to_string(value)
            .map(WsMessage::Text)
            .map_err(|e| PulsewireError::Encoding(e.to_string()))
    }

    /// Decode a text or binary frame as JSON
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        let bytes = match self {
            WsMessage::Text(text) => text.as_bytes(),
            WsMessage::Binary(data) => data.as_slice(),
            other => {
                return Err(PulsewireError::Decoding(format!(
                    "cannot decode a {} frame",
                    other.type_name()
                )))
            }
        };
        serde_json::from_slice(bytes).map_err(|e| PulsewireError::Decoding(e.to_string()))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            WsMessage::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Check if message is a control frame
    pub fn is_control(&self) -> bool {
        matches!(self, WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Close(_, _))
    }

    /// Get message type name
    pub fn type_name(&self) -> &'static str {
        match self {
            WsMessage::Text(_) => "text",
            WsMessage::Binary(_) => "binary",
            WsMessage::Ping(_) => "ping",
            WsMessage::Pong(_) => "pong",
            WsMessage::Close(_, _) => "close",
        }
    }
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Open,
    Closing,
    /// The last handshake or connection failed; `connect` may be retried
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Open => "open",
            SessionState::Closing => "closing",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// WebSocket connection options
#[derive(Debug, Clone)]
pub struct WsOptions {
    /// Extra handshake headers
    pub headers: HeaderMap,
    pub connect_timeout: Option<Duration>,
    /// Send a Ping this often while open
    pub ping_interval: Option<Duration>,
    /// How long `disconnect` waits for the Close frame to be written
    pub close_timeout: Duration,
    /// Answer Ping frames with Pong automatically
    pub auto_pong: bool,
    /// Buffered incoming messages before reading pauses. Control frames
    /// queued behind a full buffer wait too.
    pub buffer: usize,
}

impl Default for WsOptions {
    fn default() -> Self {
        Self {
            headers: HeaderMap::new(),
            connect_timeout: Some(Duration::from_secs(30)),
            ping_interval: None,
            close_timeout: Duration::from_secs(1),
            auto_pong: true,
            buffer: 64,
        }
    }
}

/// Normalize a WebSocket URL.
///
/// `http`/`https` map onto `ws`/`wss`; any other scheme is rejected.
pub fn ws_url(url: &str) -> Result<Url> {
    let mut url = Url::parse(url.trim())?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(PulsewireError::InvalidEndpoint(format!(
                "unsupported WebSocket scheme '{}'",
                other
            )))
        }
    };
    if url.host_str().map_or(true, str::is_empty) {
        return Err(PulsewireError::InvalidEndpoint(
            "WebSocket URL must include a host".to_string(),
        ));
    }
    if url.scheme() != scheme {
        // http(s) -> ws(s) is an allowed special-scheme change
        url.set_scheme(scheme)
            .map_err(|_| PulsewireError::InvalidEndpoint(format!("cannot use scheme '{}'", scheme)))?;
    }
    Ok(url)
}
