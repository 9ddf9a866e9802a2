//! Typed endpoint descriptions and their resolution into concrete requests

use std::sync::Arc;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use url::Url;

use super::types::{Body, Request};
use crate::codec::Codec;
use crate::errors::{PulsewireError, Result};
use crate::uploads::MultipartForm;

/// Body carried by an [`Endpoint`]
#[derive(Debug, Clone, Default)]
pub enum EndpointBody<B> {
    #[default]
    Empty,
    /// Value encoded by the client's codec during resolution
    Encodable(B),
    /// Pre-encoded bytes with an optional Content-Type
    Raw {
        bytes: Bytes,
        content_type: Option<String>,
    },
    Multipart(MultipartForm),
}

/// Description of one logical API call
///
/// Header values are validated when the endpoint is resolved, so building an
/// endpoint never fails.
#[derive(Debug, Clone)]
pub struct Endpoint<B = ()> {
    pub base_url: String,
    pub path: String,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: EndpointBody<B>,
}

impl Endpoint<()> {
    pub fn new(method: Method, base_url: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            path: path.into(),
            method,
            headers: Vec::new(),
            query: Vec::new(),
            body: EndpointBody::Empty,
        }
    }

    pub fn get(base_url: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(Method::GET, base_url, path)
    }

    pub fn post(base_url: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(Method::POST, base_url, path)
    }

    pub fn put(base_url: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(Method::PUT, base_url, path)
    }

    pub fn patch(base_url: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, base_url, path)
    }

    pub fn delete(base_url: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, base_url, path)
    }
}

impl<B> Endpoint<B> {
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Attach a typed body, encoded by the client's codec
    pub fn body<C: Serialize>(self, body: C) -> Endpoint<C> {
        self.with_body(EndpointBody::Encodable(body))
    }

    pub fn raw_body(self, bytes: impl Into<Bytes>, content_type: Option<&str>) -> Endpoint<B> {
        self.with_body(EndpointBody::Raw {
            bytes: bytes.into(),
            content_type: content_type.map(str::to_string),
        })
    }

    pub fn multipart(self, form: MultipartForm) -> Endpoint<B> {
        self.with_body(EndpointBody::Multipart(form))
    }

    fn with_body<C>(self, body: EndpointBody<C>) -> Endpoint<C> {
        Endpoint {
            base_url: self.base_url,
            path: self.path,
            method: self.method,
            headers: self.headers,
            query: self.query,
            body,
        }
    }
}

/// A typed API operation: knows its endpoint and its response shape
pub trait ApiEndpoint {
    type Body: Serialize;
    type Output: DeserializeOwned;

    fn endpoint(&self) -> Endpoint<Self::Body>;
}

/// Turn an endpoint into a frozen [`Request`].
///
/// Fails with `InvalidEndpoint` when the URL cannot be composed or a header is
/// malformed, and with `Encoding` when the body cannot be encoded.
pub fn resolve<B: Serialize>(endpoint: Endpoint<B>, codec: Codec) -> Result<Request> {
    let url = compose_url(&endpoint.base_url, &endpoint.path, &endpoint.query)?;
    let mut request = Request::new(endpoint.method, url);
    request.headers = parse_headers(&endpoint.headers)?;

    match endpoint.body {
        EndpointBody::Empty => {}
        EndpointBody::Encodable(value) => {
            request.body = Body::Full(codec.encode(&value)?);
            set_default_content_type(&mut request.headers, codec.content_type())?;
        }
        EndpointBody::Raw { bytes, content_type } => {
            request.body = Body::Full(bytes);
            if let Some(ct) = content_type {
                set_default_content_type(&mut request.headers, &ct)?;
            }
        }
        EndpointBody::Multipart(form) => {
            // The boundary in the header has to match the body
            let ct = HeaderValue::from_str(&form.content_type())
                .map_err(|e| PulsewireError::InvalidEndpoint(format!("invalid multipart boundary: {}", e)))?;
            request.headers.insert(CONTENT_TYPE, ct);
            request.body = Body::Multipart(Arc::new(form));
        }
    }

    Ok(request)
}

fn compose_url(base_url: &str, path: &str, query: &[(String, String)]) -> Result<Url> {
    let mut url = Url::parse(base_url.trim())
        .map_err(|e| PulsewireError::InvalidEndpoint(format!("invalid base URL '{}': {}", base_url, e)))?;

    if !matches!(url.scheme(), "http" | "https") || url.cannot_be_a_base() {
        return Err(PulsewireError::InvalidEndpoint(format!(
            "base URL '{}' is not an absolute http(s) URL",
            base_url
        )));
    }

    let path = path.trim();
    if path.is_empty() {
        return Err(PulsewireError::InvalidEndpoint("empty path".to_string()));
    }
    // set_path would percent-encode these into the path
    if path.contains(['?', '#']) {
        return Err(PulsewireError::InvalidEndpoint(format!(
            "path '{}' contains a query or fragment; use Endpoint::query",
            path
        )));
    }

    let joined = format!(
        "{}/{}",
        url.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    url.set_path(&joined);

    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (name, value) in query {
            pairs.append_pair(name, value);
        }
    }

    Ok(url)
}

fn parse_headers(headers: &[(String, String)]) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| PulsewireError::InvalidEndpoint(format!("invalid header name '{}': {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| PulsewireError::InvalidEndpoint(format!("invalid value for header '{}': {}", name, e)))?;
        map.insert(name, value);
    }
    Ok(map)
}

fn set_default_content_type(headers: &mut HeaderMap, content_type: &str) -> Result<()> {
    if !headers.contains_key(CONTENT_TYPE) {
        let value = HeaderValue::from_str(content_type)
            .map_err(|e| PulsewireError::InvalidEndpoint(format!("invalid Content-Type: {}", e)))?;
        headers.insert(CONTENT_TYPE, value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct NewUser {
        name: &'static str,
    }

    #[test]
    fn test_joins_base_path_and_path() {
        let request = resolve(Endpoint::get("https://api.example.com/v1/", "/users/42"), Codec::Json).unwrap();
        assert_eq!(request.url.as_str(), "https://api.example.com/v1/users/42");
        assert_eq!(request.method, Method::GET);
        assert!(request.body.is_empty());
    }

    #[test]
    fn test_query_pairs_are_encoded() {
        let endpoint = Endpoint::get("http://localhost:8080", "search")
            .query("q", "a b")
            .query("page", "2");
        let request = resolve(endpoint, Codec::Json).unwrap();
        assert_eq!(request.url.as_str(), "http://localhost:8080/search?q=a+b&page=2");
    }

    #[test]
    fn test_empty_path_is_invalid() {
        let result = resolve(Endpoint::get("https://api.example.com", "  "), Codec::Json);
        assert!(matches!(result, Err(PulsewireError::InvalidEndpoint(_))));
    }

    #[test]
    fn test_query_or_fragment_in_path_is_invalid() {
        for path in ["/search?q=1", "docs#intro"] {
            let result = resolve(Endpoint::get("https://api.example.com", path), Codec::Json);
            assert!(matches!(result, Err(PulsewireError::InvalidEndpoint(_))), "{path}");
        }
    }

    #[test]
    fn test_malformed_base_is_invalid() {
        for base in ["not a url", "api.example.com", "mailto:me@example.com", "ftp://host/x"] {
            let result = resolve(Endpoint::get(base, "x"), Codec::Json);
            assert!(matches!(result, Err(PulsewireError::InvalidEndpoint(_))), "{base}");
        }
    }

    #[test]
    fn test_header_names_are_case_insensitive_last_write_wins() {
        let endpoint = Endpoint::get("https://h", "p")
            .header("X-Trace", "one")
            .header("x-trace", "two");
        let request = resolve(endpoint, Codec::Json).unwrap();
        assert_eq!(request.headers.get("X-TRACE").unwrap(), "two");
        assert_eq!(request.headers.len(), 1);
    }

    #[test]
    fn test_invalid_header_is_rejected() {
        let result = resolve(Endpoint::get("https://h", "p").header("bad header", "v"), Codec::Json);
        assert!(matches!(result, Err(PulsewireError::InvalidEndpoint(_))));
    }

    #[test]
    fn test_encodable_body_sets_content_type() {
        let endpoint = Endpoint::post("https://h", "users").body(NewUser { name: "ada" });
        let request = resolve(endpoint, Codec::Json).unwrap();
        assert_eq!(request.headers.get(CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(request.body_bytes(), Bytes::from_static(br#"{"name":"ada"}"#));
    }

    #[test]
    fn test_explicit_content_type_is_kept() {
        let endpoint = Endpoint::post("https://h", "users")
            .header("Content-Type", "application/vnd.api+json")
            .body(NewUser { name: "ada" });
        let request = resolve(endpoint, Codec::Json).unwrap();
        assert_eq!(request.headers.get(CONTENT_TYPE).unwrap(), "application/vnd.api+json");
    }

    #[test]
    fn test_multipart_sets_boundary_header() {
        let form = MultipartForm::with_boundary("abc").text("k", "v");
        let request = resolve(Endpoint::post("https://h", "upload").multipart(form), Codec::Json).unwrap();
        assert_eq!(request.headers.get(CONTENT_TYPE).unwrap(), "multipart/form-data; boundary=abc");
        assert!(matches!(request.body, Body::Multipart(_)));
    }
}
