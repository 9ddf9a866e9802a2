//! Interceptor chain applied around every dispatch attempt
//!
//! Interceptors are a closed set of variants rather than a stack of trait
//! objects; `Custom` is the single open extension point. Both phases run the
//! hooks in declaration order, one at a time, each finishing before the next
//! starts. The first failing hook aborts the attempt with `InterceptorFailed`.

pub mod auth;
pub mod cache;
pub mod logging;

pub use auth::{AccessToken, Auth, AuthError, ClientCredentials, TokenAuth, TokenCache, TokenSource};
pub use cache::ResponseCache;
pub use logging::LoggingInterceptor;

use std::fmt;
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};
use reqwest::header::HeaderMap;

use crate::errors::{PulsewireError, Result};
use crate::request::{Request, Response};

/// User-defined hook
///
/// Both methods default to doing nothing, so implementors override only the
/// phase they care about.
pub trait Hook: Send + Sync {
    fn name(&self) -> &'static str {
        "custom"
    }

    fn on_request<'a>(&'a self, _request: &'a mut Request) -> BoxFuture<'a, anyhow::Result<()>> {
        future::ready(Ok(())).boxed()
    }

    fn on_response<'a>(&'a self, _response: &'a Response, _request: &'a Request) -> BoxFuture<'a, anyhow::Result<()>> {
        future::ready(Ok(())).boxed()
    }
}

/// What the request phase decided
#[derive(Debug)]
pub enum RequestFlow {
    /// Send the request to the transport
    Continue,
    /// An interceptor already has the response; skip the transport
    Respond(Response),
}

/// A request/response interceptor
#[derive(Clone)]
pub enum Interceptor {
    /// Static credentials
    Auth(Auth),
    /// Bearer token from a shared, refreshing cache
    Token(TokenAuth),
    /// Headers inserted on every request
    Headers(HeaderMap),
    Logging(LoggingInterceptor),
    Cache(ResponseCache),
    Custom(Arc<dyn Hook>),
}

impl Interceptor {
    pub fn custom(hook: impl Hook + 'static) -> Self {
        Interceptor::Custom(Arc::new(hook))
    }

    /// Name used in errors and log fields
    pub fn name(&self) -> &'static str {
        match self {
            Interceptor::Auth(auth) => auth.type_name(),
            Interceptor::Token(_) => "token",
            Interceptor::Headers(_) => "headers",
            Interceptor::Logging(_) => "logging",
            Interceptor::Cache(_) => "cache",
            Interceptor::Custom(hook) => hook.name(),
        }
    }

    pub async fn on_request(&self, request: &mut Request) -> Result<RequestFlow> {
        let name = self.name();
        match self {
            Interceptor::Auth(auth) => auth
                .apply(request)
                .map_err(|e| PulsewireError::interceptor(name, e))?,
            Interceptor::Token(token) => token
                .apply(request)
                .await
                .map_err(|e| PulsewireError::interceptor(name, e))?,
            Interceptor::Headers(headers) => {
                for (header, value) in headers {
                    request.headers.insert(header.clone(), value.clone());
                }
            }
            Interceptor::Logging(logging) => logging.log_request(request),
            Interceptor::Cache(cache) => {
                if let Some(hit) = cache.lookup(request) {
                    return Ok(RequestFlow::Respond(hit));
                }
            }
            Interceptor::Custom(hook) => hook
                .on_request(request)
                .await
                .map_err(|e| PulsewireError::interceptor(name, format!("{:#}", e)))?,
        }
        Ok(RequestFlow::Continue)
    }

    pub async fn on_response(&self, response: &Response, request: &Request) -> Result<()> {
        let name = self.name();
        match self {
            Interceptor::Auth(_) | Interceptor::Headers(_) => {}
            Interceptor::Token(token) => token.observe(response).await,
            Interceptor::Logging(logging) => logging.log_response(response, request),
            Interceptor::Cache(cache) => cache.store(response, request),
            Interceptor::Custom(hook) => hook
                .on_response(response, request)
                .await
                .map_err(|e| PulsewireError::interceptor(name, format!("{:#}", e)))?,
        }
        Ok(())
    }
}

impl fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interceptor::Auth(auth) => f.debug_tuple("Auth").field(&auth.type_name()).finish(),
            Interceptor::Token(_) => f.write_str("Token"),
            Interceptor::Headers(headers) => f.debug_tuple("Headers").field(&headers.len()).finish(),
            Interceptor::Logging(logging) => f.debug_tuple("Logging").field(logging).finish(),
            Interceptor::Cache(cache) => f.debug_tuple("Cache").field(cache).finish(),
            Interceptor::Custom(hook) => f.debug_tuple("Custom").field(&hook.name()).finish(),
        }
    }
}

impl From<Auth> for Interceptor {
    fn from(auth: Auth) -> Self {
        Interceptor::Auth(auth)
    }
}

impl From<TokenAuth> for Interceptor {
    fn from(token: TokenAuth) -> Self {
        Interceptor::Token(token)
    }
}

impl From<LoggingInterceptor> for Interceptor {
    fn from(logging: LoggingInterceptor) -> Self {
        Interceptor::Logging(logging)
    }
}

impl From<ResponseCache> for Interceptor {
    fn from(cache: ResponseCache) -> Self {
        Interceptor::Cache(cache)
    }
}

/// Run every request-phase hook in order.
///
/// Stops early when a hook fails or answers the request itself.
pub async fn apply_request_phase(request: &mut Request, interceptors: &[Interceptor]) -> Result<RequestFlow> {
    for interceptor in interceptors {
        if let RequestFlow::Respond(response) = interceptor.on_request(request).await? {
            tracing::debug!(interceptor = interceptor.name(), "request answered by interceptor");
            return Ok(RequestFlow::Respond(response));
        }
    }
    Ok(RequestFlow::Continue)
}

/// Run every response-phase hook in declaration order
pub async fn apply_response_phase(response: &Response, request: &Request, interceptors: &[Interceptor]) -> Result<()> {
    for interceptor in interceptors {
        interceptor.on_response(response, request).await?;
    }
    Ok(())
}
