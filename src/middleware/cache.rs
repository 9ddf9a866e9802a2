//! In-memory cache for successful GET responses

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CACHE_CONTROL, COOKIE, PROXY_AUTHORIZATION, VARY};
use reqwest::{Method, StatusCode};
use tokio::time::Instant;
use tracing::trace;

use crate::request::{Request, Response};

const DEFAULT_MAX_ENTRIES: usize = 1024;

/// Request headers that identify the caller
const CREDENTIAL_HEADERS: [HeaderName; 3] = [AUTHORIZATION, PROXY_AUTHORIZATION, COOKIE];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    url: String,
    credentials: Vec<HeaderValue>,
}

impl CacheKey {
    fn of(request: &Request) -> Self {
        let credentials = CREDENTIAL_HEADERS
            .iter()
            .flat_map(|name| request.headers.get_all(name).iter().cloned())
            .collect();
        Self {
            url: request.url.to_string(),
            credentials,
        }
    }
}

#[derive(Clone)]
struct CachedResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    /// Request values of the headers named by `Vary`
    vary: Vec<(HeaderName, Option<HeaderValue>)>,
    stored_at: Instant,
}

impl CachedResponse {
    fn matches(&self, request: &Request) -> bool {
        self.vary
            .iter()
            .all(|(name, value)| request.headers.get(name) == value.as_ref())
    }
}

/// Response cache keyed by URL and the caller's credentials.
///
/// Only GET requests with a buffered 2xx response are cached, and
/// `Cache-Control: no-store` on either side bypasses it. `Vary` is honored;
/// `Vary: *` is never cached. Place it after auth interceptors so lookups see
/// the final credentials. Clones share storage.
#[derive(Clone)]
pub struct ResponseCache {
    entries: Arc<DashMap<CacheKey, CachedResponse>>,
    ttl: Duration,
    max_entries: usize,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }

    /// Evict the oldest entry once this many are stored
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max.max(1);
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub(crate) fn lookup(&self, request: &Request) -> Option<Response> {
        if !cacheable_request(request) {
            return None;
        }
        let key = CacheKey::of(request);
        let entry = self.entries.get(&key)?.clone();
        if entry.stored_at.elapsed() >= self.ttl {
            self.entries.remove(&key);
            return None;
        }
        if !entry.matches(request) {
            return None;
        }
        trace!(url = %key.url, "cache hit");
        Some(Response::new(entry.status, entry.headers, entry.body))
    }

    pub(crate) fn store(&self, response: &Response, request: &Request) {
        if !cacheable_request(request) || !response.is_success() || no_store(&response.headers) {
            return;
        }
        // Streaming bodies can only be read once
        let Some(body) = response.full_body() else {
            return;
        };
        let Some(vary) = vary_values(&response.headers, request) else {
            return;
        };

        self.evict_expired();
        let key = CacheKey::of(request);
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            self.evict_oldest();
        }
        self.entries.insert(
            key,
            CachedResponse {
                status: response.status,
                headers: response.headers.clone(),
                body: body.clone(),
                vary,
                stored_at: Instant::now(),
            },
        );
    }

    fn evict_expired(&self) {
        let ttl = self.ttl;
        self.entries.retain(|_, entry| entry.stored_at.elapsed() < ttl);
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.stored_at)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}

impl fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseCache")
            .field("entries", &self.entries.len())
            .field("ttl", &self.ttl)
            .field("max_entries", &self.max_entries)
            .finish()
    }
}

fn cacheable_request(request: &Request) -> bool {
    request.method == Method::GET && !no_store(&request.headers)
}

fn header_tokens(headers: &HeaderMap, name: HeaderName) -> impl Iterator<Item = &str> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn no_store(headers: &HeaderMap) -> bool {
    header_tokens(headers, CACHE_CONTROL).any(|directive| directive.eq_ignore_ascii_case("no-store"))
}

/// Request values for each header the response varies on; `None` for `Vary: *`
fn vary_values(response_headers: &HeaderMap, request: &Request) -> Option<Vec<(HeaderName, Option<HeaderValue>)>> {
    let mut values = Vec::new();
    for token in header_tokens(response_headers, VARY) {
        if token == "*" {
            return None;
        }
        // Unparseable names cannot be compared, so the response is not cached
        let name = HeaderName::try_from(token).ok()?;
        let value = request.headers.get(&name).cloned();
        values.push((name, value));
    }
    Some(values)
}
