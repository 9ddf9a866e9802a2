//! pulsewire: a resilient async HTTP and WebSocket client
//!
//! # Module Organization
//!
//! - [`client`] - Dispatcher, transports and TLS (Client, Transport)
//! - [`request`] - Endpoint descriptions and concrete requests/responses
//! - [`retry`] - Retry policy and backoff decisions
//! - [`middleware`] - Interceptors: hooks, auth, logging, caching
//! - [`websocket`] - Long-lived WebSocket sessions
//! - [`uploads`] / [`downloads`] - Streaming transfers with progress
//! - [`errors`] - Error types (PulsewireError, ErrorKind, Result)
//! - [`config`] - TOML config file loading

pub mod client;
pub mod codec;
pub mod config;
pub mod downloads;
pub mod errors;
pub mod logging;
pub mod middleware;
pub mod progress;
pub mod request;
pub mod retry;
pub mod uploads;
pub mod websocket;

pub use client::{Client, ClientBuilder, ExecuteOptions, ReqwestTransport, Transport};
pub use codec::Codec;
pub use config::ConfigFile;
pub use downloads::{DownloadSummary, Downloader};
pub use errors::{ErrorKind, PulsewireError, Result};
pub use middleware::{Auth, Hook, Interceptor, RequestFlow};
pub use progress::{Progress, ProgressSink};
pub use request::{ApiEndpoint, Endpoint, Request, Response};
pub use retry::{Jitter, RetryPolicy};
pub use uploads::{MultipartForm, Part};
pub use websocket::{SessionState, WsMessage, WsOptions, WsSession};
