//! Default transport over reqwest and tokio-tungstenite

use std::error::Error as StdError;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::future::{self, BoxFuture, FutureExt};
use futures::{SinkExt, StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_LENGTH};
use reqwest::Client;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::{connect_async_tls_with_config, tungstenite, Connector};
use tracing::debug;
use url::Url;

use super::ssl::TlsSettings;
use super::transport::{Duplex, Transport};
use crate::errors::{PulsewireError, Result};
use crate::request::{Request, Response};
use crate::websocket::WsMessage;

pub const USER_AGENT_STRING: &str = concat!("pulsewire/", env!("CARGO_PKG_VERSION"));

/// Transport backed by a pooled `reqwest::Client`.
///
/// Response bodies are returned as streams; the dispatcher decides whether to
/// buffer them.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
    tls: TlsSettings,
    timeout: Option<Duration>,
    ws_tls: Arc<OnceLock<Arc<rustls::ClientConfig>>>,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    pub fn builder() -> ReqwestTransportBuilder {
        ReqwestTransportBuilder::default()
    }

    /// Wrap an existing client; WebSockets use default TLS settings
    pub fn from_client(client: Client) -> Self {
        Self {
            client,
            tls: TlsSettings::default(),
            timeout: None,
            ws_tls: Arc::new(OnceLock::new()),
        }
    }

    fn to_reqwest(&self, request: &Request) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());

        if request.is_streaming() {
            builder = builder
                .header(CONTENT_LENGTH, HeaderValue::from(request.body.content_length()))
                .body(reqwest::Body::wrap_stream(request.body_stream()));
        } else if !request.body.is_empty() {
            builder = builder.body(request.body_bytes());
        }
        builder
    }

    async fn round_trip(&self, request: &Request) -> Result<Response> {
        let timeout = self.timeout;
        let response = self
            .to_reqwest(request)
            .send()
            .await
            .map_err(|e| map_reqwest_error(&e, timeout))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes_stream().map_err(move |e| map_reqwest_error(&e, timeout)).boxed();
        Ok(Response::streaming(status, headers, body))
    }

    fn ws_connector(&self) -> Connector {
        let config = self.ws_tls.get_or_init(|| self.tls.rustls_config());
        Connector::Rustls(config.clone())
    }

    async fn connect_duplex(&self, url: &Url, headers: &HeaderMap) -> Result<Duplex> {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| PulsewireError::WebSocket(format!("Invalid WebSocket URL: {}", e)))?;
        for (name, value) in headers {
            request.headers_mut().insert(name.clone(), value.clone());
        }

        let connector = (url.scheme() == "wss").then(|| self.ws_connector());
        let (stream, response) = connect_async_tls_with_config(request, None, false, connector)
            .await
            .map_err(|e| PulsewireError::Connection(format!("WebSocket handshake failed: {}", e)))?;

        if let Some(proto) = response.headers().get("Sec-WebSocket-Protocol") {
            debug!(subprotocol = ?proto, "negotiated subprotocol");
        }

        let (sink, source) = stream.split();
        let sink = sink
            .sink_map_err(map_ws_error)
            .with(|msg: WsMessage| future::ready(Ok::<_, PulsewireError>(to_tungstenite(msg))));
        let source = source.filter_map(|item| {
            future::ready(match item {
                Ok(Message::Frame(_)) => None,
                Ok(msg) => Some(Ok(from_tungstenite(msg))),
                Err(e) => Some(Err(map_ws_error(e))),
            })
        });

        Ok(Duplex::new(Box::pin(sink), source.boxed()))
    }
}

impl Transport for ReqwestTransport {
    fn send<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>> {
        self.round_trip(request).boxed()
    }

    fn open_duplex<'a>(&'a self, url: &'a Url, headers: &'a HeaderMap) -> BoxFuture<'a, Result<Duplex>> {
        self.connect_duplex(url, headers).boxed()
    }
}

/// Builder for [`ReqwestTransport`]
#[derive(Debug, Clone)]
pub struct ReqwestTransportBuilder {
    user_agent: String,
    connect_timeout: Option<Duration>,
    timeout: Option<Duration>,
    max_redirects: usize,
    tls: TlsSettings,
}

impl Default for ReqwestTransportBuilder {
    fn default() -> Self {
        Self {
            user_agent: USER_AGENT_STRING.to_string(),
            connect_timeout: None,
            timeout: None,
            max_redirects: 10,
            tls: TlsSettings::default(),
        }
    }
}

impl ReqwestTransportBuilder {
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Whole-request timeout enforced by reqwest itself
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// `0` disables redirects
    pub fn max_redirects(mut self, max: usize) -> Self {
        self.max_redirects = max;
        self
    }

    pub fn tls(mut self, tls: TlsSettings) -> Self {
        self.tls = tls;
        self
    }

    pub fn build(self) -> Result<ReqwestTransport> {
        let mut builder = Client::builder().user_agent(&self.user_agent);

        if let Some(timeout) = self.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        builder = if self.max_redirects == 0 {
            builder.redirect(reqwest::redirect::Policy::none())
        } else {
            builder.redirect(reqwest::redirect::Policy::limited(self.max_redirects))
        };
        builder = self.tls.apply_to_builder(builder)?;

        let client = builder
            .build()
            .map_err(|e| PulsewireError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(ReqwestTransport {
            client,
            tls: self.tls,
            timeout: self.timeout,
            ws_tls: Arc::new(OnceLock::new()),
        })
    }
}

fn map_reqwest_error(error: &reqwest::Error, timeout: Option<Duration>) -> PulsewireError {
    if error.is_timeout() {
        return PulsewireError::Timeout(timeout.map(|t| t.as_secs_f64()).unwrap_or_default());
    }
    PulsewireError::Connection(error_chain(error))
}

/// reqwest's top-level message rarely names the cause
fn error_chain(error: &dyn StdError) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn map_ws_error(error: tungstenite::Error) -> PulsewireError {
    match error {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            PulsewireError::ConnectionClosed(error.to_string())
        }
        tungstenite::Error::Io(e) => PulsewireError::Connection(e.to_string()),
        other => PulsewireError::WebSocket(other.to_string()),
    }
}

fn to_tungstenite(msg: WsMessage) -> Message {
    match msg {
        WsMessage::Text(text) => Message::Text(text.into()),
        WsMessage::Binary(data) => Message::Binary(data.into()),
        WsMessage::Ping(data) => Message::Ping(data.into()),
        WsMessage::Pong(data) => Message::Pong(data.into()),
        WsMessage::Close(code, reason) => Message::Close(code.map(|code| CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        })),
    }
}

fn from_tungstenite(msg: Message) -> WsMessage {
    match msg {
        Message::Text(s) => WsMessage::Text(s.to_string()),
        Message::Binary(b) => WsMessage::Binary(b.to_vec()),
        Message::Ping(b) => WsMessage::Ping(b.to_vec()),
        Message::Pong(b) => WsMessage::Pong(b.to_vec()),
        Message::Close(frame) => {
            let (code, reason) = frame
                .map(|f| (Some(f.code.into()), f.reason.to_string()))
                .unwrap_or((None, String::new()));
            WsMessage::Close(code, reason)
        }
        Message::Frame(_) => WsMessage::Binary(Vec::new()),
    }
}
