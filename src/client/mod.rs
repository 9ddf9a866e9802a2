//! HTTP client functionality

pub mod dispatch;
pub mod http;
pub mod ssl;
pub mod transport;

pub use dispatch::{Client, ClientBuilder, ClientConfig, ExecuteOptions};
pub use http::{ReqwestTransport, ReqwestTransportBuilder, USER_AGENT_STRING};
pub use ssl::{TlsSettings, TlsVersion};
pub use transport::{Duplex, DuplexSink, DuplexSource, Transport};
