//! Error types for pulsewire

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::codec::Codec;

/// Main error type for pulsewire
#[derive(Error, Debug)]
pub enum PulsewireError {
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Interceptor '{interceptor}' failed: {cause}")]
    InterceptorFailed {
        interceptor: &'static str,
        cause: String,
    },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timeout after {0:.1} seconds")]
    Timeout(f64),

    #[error("HTTP {status}")]
    Http {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },

    #[error("Decoding error: {0}")]
    Decoding(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("WebSocket is not connected")]
    NotConnected,

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of a [`PulsewireError`], used by retry policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorKind {
    InvalidEndpoint,
    InterceptorFailed,
    Connection,
    Timeout,
    Http,
    Decoding,
    Encoding,
    NotConnected,
    ConnectionClosed,
    WebSocket,
    Cancelled,
    Config,
    Io,
}

impl ErrorKind {
    /// Name used in config files and log fields
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidEndpoint => "invalid-endpoint",
            ErrorKind::InterceptorFailed => "interceptor",
            ErrorKind::Connection => "connection",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Http => "http",
            ErrorKind::Decoding => "decoding",
            ErrorKind::Encoding => "encoding",
            ErrorKind::NotConnected => "not-connected",
            ErrorKind::ConnectionClosed => "connection-closed",
            ErrorKind::WebSocket => "websocket",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Config => "config",
            ErrorKind::Io => "io",
        }
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "invalid-endpoint" => Ok(ErrorKind::InvalidEndpoint),
            "interceptor" | "interceptor-failed" => Ok(ErrorKind::InterceptorFailed),
            "connection" => Ok(ErrorKind::Connection),
            "timeout" => Ok(ErrorKind::Timeout),
            "http" => Ok(ErrorKind::Http),
            "decoding" => Ok(ErrorKind::Decoding),
            "encoding" => Ok(ErrorKind::Encoding),
            "not-connected" => Ok(ErrorKind::NotConnected),
            "connection-closed" => Ok(ErrorKind::ConnectionClosed),
            "websocket" => Ok(ErrorKind::WebSocket),
            "cancelled" => Ok(ErrorKind::Cancelled),
            "config" => Ok(ErrorKind::Config),
            "io" => Ok(ErrorKind::Io),
            _ => Err(format!("Unknown error kind: '{}'", s)),
        }
    }
}

impl PulsewireError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PulsewireError::InvalidEndpoint(_) => ErrorKind::InvalidEndpoint,
            PulsewireError::InterceptorFailed { .. } => ErrorKind::InterceptorFailed,
            PulsewireError::Connection(_) => ErrorKind::Connection,
            PulsewireError::Timeout(_) => ErrorKind::Timeout,
            PulsewireError::Http { .. } => ErrorKind::Http,
            PulsewireError::Decoding(_) => ErrorKind::Decoding,
            PulsewireError::Encoding(_) => ErrorKind::Encoding,
            PulsewireError::NotConnected => ErrorKind::NotConnected,
            PulsewireError::ConnectionClosed(_) => ErrorKind::ConnectionClosed,
            PulsewireError::WebSocket(_) => ErrorKind::WebSocket,
            PulsewireError::Cancelled => ErrorKind::Cancelled,
            PulsewireError::Config(_) => ErrorKind::Config,
            PulsewireError::Io(_) => ErrorKind::Io,
        }
    }

    /// Status code of an `Http` error
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            PulsewireError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Raw body of an `Http` error
    pub fn body(&self) -> Option<&Bytes> {
        match self {
            PulsewireError::Http { body, .. } => Some(body),
            _ => None,
        }
    }

    /// Opt-in structured decoding of an `Http` error body.
    ///
    /// Returns `None` for non-HTTP errors. A decode failure is reported in the
    /// inner result and leaves `self` untouched.
    pub fn decode_body<E: DeserializeOwned>(&self, codec: Codec) -> Option<Result<E>> {
        self.body().map(|body| codec.decode(body))
    }

    pub(crate) fn interceptor(interceptor: &'static str, cause: impl std::fmt::Display) -> Self {
        PulsewireError::InterceptorFailed {
            interceptor,
            cause: cause.to_string(),
        }
    }
}

impl From<url::ParseError> for PulsewireError {
    fn from(err: url::ParseError) -> Self {
        PulsewireError::InvalidEndpoint(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PulsewireError>;
