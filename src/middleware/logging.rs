//! Request/response logging through `tracing`

use reqwest::header::{HeaderMap, HeaderName, AUTHORIZATION, COOKIE, PROXY_AUTHORIZATION, SET_COOKIE};
use tracing::{debug, info, trace, Level};
use url::Url;

use crate::request::{Request, Response};

const REDACTED: &str = "[REDACTED]";

/// Emits one event per request and one per response
#[derive(Debug, Clone)]
pub struct LoggingInterceptor {
    level: Level,
    log_headers: bool,
    redact: Vec<HeaderName>,
}

impl Default for LoggingInterceptor {
    fn default() -> Self {
        Self {
            level: Level::DEBUG,
            log_headers: false,
            redact: vec![AUTHORIZATION, PROXY_AUTHORIZATION, COOKIE, SET_COOKIE],
        }
    }
}

impl LoggingInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Level for both events; anything above INFO is logged at INFO
    pub fn level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Include headers (with credentials redacted)
    pub fn with_headers(mut self) -> Self {
        self.log_headers = true;
        self
    }

    /// Also redact this header
    pub fn redact(mut self, name: HeaderName) -> Self {
        self.redact.push(name);
        self
    }

    pub(crate) fn log_request(&self, request: &Request) {
        let url = redacted_url(&request.url);
        let headers = self.render_headers(&request.headers);
        let body_len = request.body.content_length();
        match self.level {
            Level::TRACE => trace!(method = %request.method, url = %url, body_len, headers = %headers, "sending request"),
            Level::DEBUG => debug!(method = %request.method, url = %url, body_len, headers = %headers, "sending request"),
            _ => info!(method = %request.method, url = %url, body_len, headers = %headers, "sending request"),
        }
    }

    pub(crate) fn log_response(&self, response: &Response, request: &Request) {
        let url = redacted_url(&request.url);
        let headers = self.render_headers(&response.headers);
        let status = response.status.as_u16();
        let body_len = response.full_body().map(|b| b.len() as u64).or_else(|| response.content_length());
        match self.level {
            Level::TRACE => trace!(method = %request.method, url = %url, status, ?body_len, headers = %headers, "received response"),
            Level::DEBUG => debug!(method = %request.method, url = %url, status, ?body_len, headers = %headers, "received response"),
            _ => info!(method = %request.method, url = %url, status, ?body_len, headers = %headers, "received response"),
        }
    }

    fn render_headers(&self, headers: &HeaderMap) -> String {
        if !self.log_headers {
            return String::new();
        }
        headers
            .iter()
            .map(|(name, value)| {
                let shown = if self.redact.contains(name) || value.is_sensitive() {
                    REDACTED
                } else {
                    value.to_str().unwrap_or("<binary>")
                };
                format!("{}: {}", name, shown)
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// URL with any userinfo password replaced
fn redacted_url(url: &Url) -> String {
    if url.password().is_some() {
        let mut url = url.clone();
        let _ = url.set_password(Some(REDACTED));
        return url.to_string();
    }
    url.to_string()
}
