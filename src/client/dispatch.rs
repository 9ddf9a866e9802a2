//! Request execution: resolve, intercept, send, retry, decode

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::http::ReqwestTransport;
use super::transport::Transport;
use crate::codec::Codec;
use crate::downloads::{DownloadSummary, Downloader};
use crate::errors::{PulsewireError, Result};
use crate::middleware::{apply_request_phase, apply_response_phase, Interceptor, RequestFlow};
use crate::progress::ProgressSink;
use crate::request::{resolve, ApiEndpoint, Endpoint, Request, Response};
use crate::retry::{should_retry, AttemptState, Outcome, RetryPolicy};
use crate::websocket::{WsOptions, WsSession};

/// Settings shared by every request a [`Client`] makes
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub retry_policy: Arc<RetryPolicy>,
    /// Applied in this order in both phases
    pub interceptors: Arc<[Interceptor]>,
    /// Lowest-precedence headers on every request
    pub default_headers: HeaderMap,
    pub codec: Codec,
    /// Limit for one attempt, hooks and body included
    pub attempt_timeout: Option<Duration>,
    /// Limit for the whole call, retries and delays included
    pub deadline: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            retry_policy: Arc::new(RetryPolicy::default()),
            interceptors: Arc::from(Vec::new()),
            default_headers: HeaderMap::new(),
            codec: Codec::default(),
            attempt_timeout: None,
            deadline: None,
        }
    }
}

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Highest-precedence headers
    pub headers: HeaderMap,
    pub cancel: Option<CancellationToken>,
    /// Replaces the client's policy for this call
    pub retry_policy: Option<Arc<RetryPolicy>>,
    pub upload_progress: Option<ProgressSink>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(Arc::new(policy));
        self
    }

    pub fn upload_progress(mut self, sink: ProgressSink) -> Self {
        self.upload_progress = Some(sink);
        self
    }
}

/// Typed HTTP client. Cheap to clone; clones share transport and state.
#[derive(Clone)]
pub struct Client {
    transport: Arc<dyn Transport>,
    config: Arc<ClientConfig>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("config", &self.config).finish_non_exhaustive()
    }
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    pub fn new(transport: impl Transport + 'static, config: ClientConfig) -> Result<Self> {
        config.retry_policy.validate()?;
        Ok(Self {
            transport: Arc::new(transport),
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Run an endpoint and decode a 2xx body into `T`.
    ///
    /// Any other final status becomes `Http` with the body attached.
    pub async fn execute<T, B>(&self, endpoint: Endpoint<B>, options: ExecuteOptions) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        let response = self.dispatch(endpoint, &options, true).await?;
        if !response.is_success() {
            return Err(response.into_http_error().await);
        }
        let body = response.bytes().await?;
        self.config.codec.decode(&body)
    }

    /// [`execute`](Self::execute) for a typed endpoint description
    pub async fn call<E: ApiEndpoint>(&self, api: &E, options: ExecuteOptions) -> Result<E::Output> {
        self.execute(api.endpoint(), options).await
    }

    /// Run an endpoint and return the buffered response whatever its status
    pub async fn send<B: Serialize>(&self, endpoint: Endpoint<B>, options: ExecuteOptions) -> Result<Response> {
        self.dispatch(endpoint, &options, true).await
    }

    /// Stream a 2xx body into `writer`, publishing progress per chunk
    pub async fn download<B, W>(
        &self,
        endpoint: Endpoint<B>,
        writer: &mut W,
        progress: Option<ProgressSink>,
        options: ExecuteOptions,
    ) -> Result<DownloadSummary>
    where
        B: Serialize,
        W: AsyncWrite + Unpin,
    {
        let mut downloader = Downloader::new();
        if let Some(sink) = progress {
            downloader = downloader.progress(sink);
        }
        downloader.run(self, endpoint, writer, options).await
    }

    /// WebSocket session sharing this client's transport
    pub fn websocket(&self, url: &str, options: WsOptions) -> Result<WsSession> {
        WsSession::new(self.transport.clone(), url, options)
    }

    /// Resolve, then attempt until the retry policy says stop.
    ///
    /// With `buffer` unset the final response keeps its streaming body.
    pub(crate) async fn dispatch<B: Serialize>(
        &self,
        endpoint: Endpoint<B>,
        options: &ExecuteOptions,
        buffer: bool,
    ) -> Result<Response> {
        let mut request = resolve(endpoint, self.config.codec)?;

        let mut headers = self.config.default_headers.clone();
        overlay_headers(&mut headers, &request.headers);
        overlay_headers(&mut headers, &options.headers);
        request.headers = headers;
        request.upload_progress = options.upload_progress.clone();

        let cancel = options.cancel.clone().unwrap_or_default();
        let policy = options
            .retry_policy
            .clone()
            .unwrap_or_else(|| self.config.retry_policy.clone());

        let attempts = self.attempt_loop(&request, &policy, &cancel, buffer);
        match self.config.deadline {
            Some(deadline) => tokio::time::timeout(deadline, attempts)
                .await
                .map_err(|_| PulsewireError::Timeout(deadline.as_secs_f64()))?,
            None => attempts.await,
        }
    }

    async fn attempt_loop(
        &self,
        request: &Request,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        buffer: bool,
    ) -> Result<Response> {
        let mut state = AttemptState::new();
        loop {
            debug!(
                method = %request.method,
                url = %request.url,
                attempt = state.attempt_number,
                "sending attempt"
            );
            let outcome = self.attempt(request, cancel, buffer).await;
            if matches!(outcome, Err(PulsewireError::Cancelled)) {
                return outcome;
            }

            let decision = match &outcome {
                Ok(response) => should_retry(&state, Outcome::Response(response), policy),
                Err(error) => should_retry(&state, Outcome::Failure(error), policy),
            };
            if !decision.retry {
                return outcome;
            }

            match &outcome {
                Ok(response) => warn!(
                    url = %request.url,
                    attempt = state.attempt_number,
                    status = response.status.as_u16(),
                    delay_ms = decision.delay.as_millis() as u64,
                    "retrying after retryable status"
                ),
                Err(error) => warn!(
                    url = %request.url,
                    attempt = state.attempt_number,
                    error = %error,
                    delay_ms = decision.delay.as_millis() as u64,
                    "retrying after failure"
                ),
            }
            // The discarded outcome releases its connection before the wait
            drop(outcome);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PulsewireError::Cancelled),
                _ = tokio::time::sleep(decision.delay) => {}
            }
            state.advance(decision.delay);
        }
    }

    /// One transport round trip on a fresh copy of the frozen request
    async fn attempt(&self, frozen: &Request, cancel: &CancellationToken, buffer: bool) -> Result<Response> {
        let mut request = frozen.clone();
        let work = self.run_attempt(&mut request, buffer);

        let timed = async {
            match self.config.attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, work).await {
                    Ok(result) => result,
                    Err(_) => Err(PulsewireError::Timeout(limit.as_secs_f64())),
                },
                None => work.await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PulsewireError::Cancelled),
            result = timed => result,
        }
    }

    async fn run_attempt(&self, request: &mut Request, buffer: bool) -> Result<Response> {
        let interceptors = &self.config.interceptors;
        if let RequestFlow::Respond(response) = apply_request_phase(request, interceptors).await? {
            return Ok(response);
        }
        let mut response = self.transport.send(request).await?;
        if buffer {
            response = response.buffered().await?;
        }
        apply_response_phase(&response, request, interceptors).await?;
        Ok(response)
    }
}

/// Replace every header in `top` on `base`, keeping multi-valued entries
fn overlay_headers(base: &mut HeaderMap, top: &HeaderMap) {
    for name in top.keys() {
        base.remove(name);
        for value in top.get_all(name) {
            base.append(name.clone(), value.clone());
        }
    }
}

/// Builder for [`Client`]
#[derive(Default)]
pub struct ClientBuilder {
    transport: Option<Arc<dyn Transport>>,
    config: ClientConfig,
    interceptors: Vec<Interceptor>,
    header_errors: Vec<String>,
}

impl ClientBuilder {
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn shared_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry_policy = Arc::new(policy);
        self
    }

    pub fn interceptor(mut self, interceptor: impl Into<Interceptor>) -> Self {
        self.interceptors.push(interceptor.into());
        self
    }

    pub fn default_headers(mut self, headers: HeaderMap) -> Self {
        overlay_headers(&mut self.config.default_headers, &headers);
        self
    }

    /// Invalid names or values are reported by [`build`](Self::build)
    pub fn default_header(mut self, name: &str, value: &str) -> Self {
        match (HeaderName::try_from(name), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                self.config.default_headers.insert(name, value);
            }
            _ => self.header_errors.push(format!("invalid default header '{}'", name)),
        }
        self
    }

    pub fn codec(mut self, codec: Codec) -> Self {
        self.config.codec = codec;
        self
    }

    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.config.attempt_timeout = Some(timeout);
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.config.deadline = Some(deadline);
        self
    }

    /// Uses [`ReqwestTransport`] when no transport was set
    pub fn build(self) -> Result<Client> {
        if let Some(error) = self.header_errors.into_iter().next() {
            return Err(PulsewireError::Config(error));
        }
        self.config.retry_policy.validate()?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new()?),
        };

        let mut config = self.config;
        config.interceptors = Arc::from(self.interceptors);
        Ok(Client {
            transport,
            config: Arc::new(config),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::{BoxFuture, FutureExt};
    use reqwest::StatusCode;
    use serde::Deserialize;
    use std::sync::Mutex;

    /// Replays canned statuses and records what it was sent
    struct Scripted {
        statuses: Mutex<Vec<u16>>,
        seen: Mutex<Vec<Request>>,
    }

    impl Scripted {
        fn new(statuses: &[u16]) -> Arc<Self> {
            Arc::new(Self {
                statuses: Mutex::new(statuses.iter().rev().copied().collect()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    impl Transport for Scripted {
        fn send<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>> {
            self.seen.lock().unwrap().push(request.clone());
            let status = self.statuses.lock().unwrap().pop().unwrap_or(200);
            let body = format!(r#"{{"n":{}}}"#, self.calls());
            let status = StatusCode::from_u16(status).unwrap();
            async move { Ok(Response::new(status, HeaderMap::new(), body)) }.boxed()
        }
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct N {
        n: usize,
    }

    fn client(transport: Arc<Scripted>, policy: RetryPolicy) -> Client {
        Client::builder()
            .shared_transport(transport)
            .retry_policy(policy)
            .default_header("x-client", "default")
            .default_header("x-layer", "default")
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let transport = Scripted::new(&[503, 503]);
        let client = client(transport.clone(), RetryPolicy::default());

        let out: N = client
            .execute(Endpoint::get("https://api.test", "/n"), ExecuteOptions::new())
            .await
            .unwrap();
        assert_eq!(out, N { n: 3 });
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_header_precedence() {
        let transport = Scripted::new(&[]);
        let client = client(transport.clone(), RetryPolicy::no_retry());

        let endpoint = Endpoint::get("https://api.test", "/n")
            .header("X-Layer", "endpoint")
            .header("x-endpoint", "yes");
        let options = ExecuteOptions::new().header(
            HeaderName::from_static("x-layer"),
            HeaderValue::from_static("caller"),
        );
        let _: N = client.execute(endpoint, options).await.unwrap();

        let seen = transport.seen.lock().unwrap();
        let headers = &seen[0].headers;
        assert_eq!(headers.get("x-client").unwrap(), "default");
        assert_eq!(headers.get("x-endpoint").unwrap(), "yes");
        assert_eq!(headers.get_all("x-layer").iter().count(), 1);
        assert_eq!(headers.get("x-layer").unwrap(), "caller");
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_call_policy_override() {
        let transport = Scripted::new(&[503, 503]);
        let client = client(transport.clone(), RetryPolicy::default());

        let err = client
            .execute::<N, ()>(
                Endpoint::get("https://api.test", "/n"),
                ExecuteOptions::new().retry_policy(RetryPolicy::no_retry()),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_endpoint_never_reaches_transport() {
        let transport = Scripted::new(&[]);
        let client = client(transport.clone(), RetryPolicy::default());

        let err = client
            .send(Endpoint::get("ftp://files.test", "/a"), ExecuteOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PulsewireError::InvalidEndpoint(_)));
        assert_eq!(transport.calls(), 0);
    }

    #[test]
    fn test_bad_default_header_fails_build() {
        let err = Client::builder()
            .shared_transport(Scripted::new(&[]))
            .default_header("bad header", "x")
            .build()
            .unwrap_err();
        assert!(matches!(err, PulsewireError::Config(_)));
    }

    #[test]
    fn test_overlay_replaces_case_insensitively() {
        let mut base = HeaderMap::new();
        base.insert("accept", HeaderValue::from_static("text/plain"));
        let mut top = HeaderMap::new();
        top.append("Accept", HeaderValue::from_static("application/json"));
        top.append("Accept", HeaderValue::from_static("text/html"));

        overlay_headers(&mut base, &top);
        let values: Vec<_> = base.get_all("accept").iter().collect();
        assert_eq!(values, vec!["application/json", "text/html"]);
    }
}
