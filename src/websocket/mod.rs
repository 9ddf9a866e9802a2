//! WebSocket support module
//!
//! A [`WsSession`] drives one logical connection through its lifecycle on top
//! of any [`Transport`](crate::client::Transport) that can open duplex streams.

mod session;
pub mod types;

pub use session::WsSession;
pub use types::{ws_url, SessionState, WsMessage, WsOptions};
