//! Expiring bearer tokens shared across concurrent requests

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::{header_value, AuthError};
use crate::request::{Request, Response};

/// Tokens are treated as expired this long before the server says so
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

/// A freshly issued access token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub value: String,
    /// Authorization scheme, usually `Bearer`
    pub token_type: String,
    pub expires_in: Option<Duration>,
}

impl AccessToken {
    pub fn bearer(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            token_type: "Bearer".to_string(),
            expires_in: None,
        }
    }

    pub fn expiring_in(mut self, expires_in: Duration) -> Self {
        self.expires_in = Some(expires_in);
        self
    }

    pub fn authorization_header(&self) -> String {
        format!("{} {}", self.token_type, self.value)
    }
}

/// Anything that can issue access tokens
pub trait TokenSource: Send + Sync {
    fn fetch(&self) -> BoxFuture<'_, Result<AccessToken, AuthError>>;
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: AccessToken,
    obtained_at: Instant,
}

impl CachedToken {
    fn is_valid(&self) -> bool {
        match self.token.expires_in {
            Some(expires_in) => self.obtained_at.elapsed() < expires_in.saturating_sub(EXPIRY_MARGIN),
            None => true,
        }
    }
}

/// Token cache that refreshes at most once under contention.
///
/// The slot lock is held across the fetch, so concurrent callers that find
/// the token stale wait for the single in-flight refresh and then reuse it.
pub struct TokenCache {
    source: Arc<dyn TokenSource>,
    slot: Mutex<Option<CachedToken>>,
    refreshes: AtomicU64,
}

impl TokenCache {
    pub fn new(source: impl TokenSource + 'static) -> Self {
        Self::from_arc(Arc::new(source))
    }

    pub fn from_arc(source: Arc<dyn TokenSource>) -> Self {
        Self {
            source,
            slot: Mutex::new(None),
            refreshes: AtomicU64::new(0),
        }
    }

    /// Current token, fetching a new one if missing or expired
    pub async fn token(&self) -> Result<AccessToken, AuthError> {
        let mut slot = self.slot.lock().await;
        if let Some(cached) = slot.as_ref().filter(|c| c.is_valid()) {
            return Ok(cached.token.clone());
        }

        debug!("refreshing access token");
        let token = self.source.fetch().await?;
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        *slot = Some(CachedToken {
            token: token.clone(),
            obtained_at: Instant::now(),
        });
        Ok(token)
    }

    /// Forget the cached token; the next request fetches a new one
    pub async fn invalidate(&self) {
        self.slot.lock().await.take();
    }

    /// How many times the source has been asked for a token
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCache")
            .field("refreshes", &self.refresh_count())
            .finish_non_exhaustive()
    }
}

/// Interceptor attaching a cached token to every request
#[derive(Debug, Clone)]
pub struct TokenAuth {
    cache: Arc<TokenCache>,
    invalidate_on_unauthorized: bool,
}

impl TokenAuth {
    pub fn new(cache: Arc<TokenCache>) -> Self {
        Self {
            cache,
            invalidate_on_unauthorized: true,
        }
    }

    /// Keep the cached token even after a 401 response
    pub fn keep_on_unauthorized(mut self) -> Self {
        self.invalidate_on_unauthorized = false;
        self
    }

    pub fn cache(&self) -> &Arc<TokenCache> {
        &self.cache
    }

    pub(crate) async fn apply(&self, request: &mut Request) -> Result<(), AuthError> {
        let token = self.cache.token().await?;
        request
            .headers
            .insert(AUTHORIZATION, header_value(&token.authorization_header())?);
        Ok(())
    }

    /// A 401 means the server rejected the token, so the next attempt refetches
    pub(crate) async fn observe(&self, response: &Response) {
        if self.invalidate_on_unauthorized && response.status == StatusCode::UNAUTHORIZED {
            debug!("token rejected with 401; invalidating cache");
            self.cache.invalidate().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use reqwest::header::HeaderMap;
    use reqwest::Method;
    use std::sync::atomic::AtomicUsize;
    use url::Url;

    struct CountingSource {
        calls: Arc<AtomicUsize>,
        expires_in: Option<Duration>,
    }

    impl TokenSource for CountingSource {
        fn fetch(&self) -> BoxFuture<'_, Result<AccessToken, AuthError>> {
            async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(Duration::from_millis(20)).await;
                let mut token = AccessToken::bearer(format!("token-{}", n));
                token.expires_in = self.expires_in;
                Ok(token)
            }
            .boxed()
        }
    }

    fn source(expires_in: Option<Duration>) -> (CountingSource, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (CountingSource { calls: calls.clone(), expires_in }, calls)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_refresh() {
        let (src, calls) = source(None);
        let cache = Arc::new(TokenCache::new(src));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.token().await.unwrap() })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().value, "token-1");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.refresh_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_token_is_refreshed() {
        let (src, calls) = source(Some(Duration::from_secs(60)));
        let cache = TokenCache::new(src);

        assert_eq!(cache.token().await.unwrap().value, "token-1");
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(cache.token().await.unwrap().value, "token-1");
        // Within the 30s safety margin
        tokio::time::advance(Duration::from_secs(15)).await;
        assert_eq!(cache.token().await.unwrap().value, "token-2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unauthorized_invalidates() {
        let (src, calls) = source(None);
        let auth = TokenAuth::new(Arc::new(TokenCache::new(src)));
        let mut req = Request::new(Method::GET, Url::parse("https://h/").unwrap());

        auth.apply(&mut req).await.unwrap();
        assert_eq!(req.headers.get(AUTHORIZATION).unwrap(), "Bearer token-1");

        let rejected = Response::new(StatusCode::UNAUTHORIZED, HeaderMap::new(), "");
        auth.observe(&rejected).await;
        auth.apply(&mut req).await.unwrap();
        assert_eq!(req.headers.get(AUTHORIZATION).unwrap(), "Bearer token-2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
