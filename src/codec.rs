//! Typed body encoding and decoding
//!
//! The codec is a closed set of wire formats. Request bodies are encoded once
//! during endpoint resolution; response bodies are decoded only for 2xx
//! responses unless the caller asks for structured error decoding.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::{PulsewireError, Result};

/// Wire format for typed payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    /// `application/json` via serde_json
    #[default]
    Json,
    /// `application/x-www-form-urlencoded` via serde_urlencoded
    Form,
}

impl Codec {
    /// Content-Type header value produced by [`Codec::encode`]
    pub fn content_type(&self) -> &'static str {
        match self {
            Codec::Json => "application/json",
            Codec::Form => "application/x-www-form-urlencoded",
        }
    }

    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes> {
        match self {
            Codec::Json => serde_json::to_vec(value)
                .map(Bytes::from)
                .map_err(|e| PulsewireError::Encoding(e.to_string())),
            Codec::Form => serde_urlencoded::to_string(value)
                .map(Bytes::from)
                .map_err(|e| PulsewireError::Encoding(e.to_string())),
        }
    }

    /// Decode `bytes` into `T`.
    ///
    /// An empty JSON body is read as `null`, so `()` and `Option<_>` targets
    /// accept 204-style responses.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            Codec::Json => {
                let input: &[u8] = if bytes.iter().all(u8::is_ascii_whitespace) {
                    b"null"
                } else {
                    bytes
                };
                serde_json::from_slice(input).map_err(|e| PulsewireError::Decoding(e.to_string()))
            }
            Codec::Form => serde_urlencoded::from_bytes(bytes)
                .map_err(|e| PulsewireError::Decoding(e.to_string())),
        }
    }
}
