//! The boundary between the pipeline and the network

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::BoxStream;
use futures::Sink;
use reqwest::header::HeaderMap;
use url::Url;

use crate::errors::{PulsewireError, Result};
use crate::request::{Request, Response};
use crate::websocket::WsMessage;

/// Outgoing half of a duplex stream
pub type DuplexSink = Pin<Box<dyn Sink<WsMessage, Error = PulsewireError> + Send>>;

/// Incoming half of a duplex stream
pub type DuplexSource = BoxStream<'static, Result<WsMessage>>;

/// An open bidirectional message stream
pub struct Duplex {
    pub sink: DuplexSink,
    pub source: DuplexSource,
}

impl Duplex {
    pub fn new(sink: DuplexSink, source: DuplexSource) -> Self {
        Self { sink, source }
    }
}

impl fmt::Debug for Duplex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Duplex")
    }
}

/// Performs one network round trip per call.
///
/// Implementations report network failures as `Connection` or `Timeout`; a
/// non-2xx status is a normal `Response`, never an error.
pub trait Transport: Send + Sync {
    fn send<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>>;

    /// Open a WebSocket-style duplex stream
    fn open_duplex<'a>(&'a self, url: &'a Url, headers: &'a HeaderMap) -> BoxFuture<'a, Result<Duplex>> {
        let _ = (url, headers);
        future::ready(Err(PulsewireError::WebSocket(
            "transport does not support duplex streams".to_string(),
        )))
        .boxed()
    }
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>> {
        (**self).send(request)
    }

    fn open_duplex<'a>(&'a self, url: &'a Url, headers: &'a HeaderMap) -> BoxFuture<'a, Result<Duplex>> {
        (**self).open_duplex(url, headers)
    }
}
