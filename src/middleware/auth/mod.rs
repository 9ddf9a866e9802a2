//! Authentication interceptors
//!
//! Static credentials are a sum type applied synchronously; bearer tokens
//! that expire go through [`TokenAuth`] and its shared [`TokenCache`].

mod oauth2;
mod token;

pub use oauth2::ClientCredentials;
pub use token::{AccessToken, TokenAuth, TokenCache, TokenSource};

use base64::Engine;
use reqwest::header::{HeaderName, HeaderValue, AUTHORIZATION};
use thiserror::Error;

use crate::request::Request;

/// Authentication error types
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid header value: {0}")]
    InvalidHeader(String),

    #[error("missing credentials")]
    MissingCredentials,

    #[error("token request failed: {0}")]
    TokenRequest(String),

    #[error("invalid token response: {0}")]
    InvalidTokenResponse(String),
}

/// Where an API key is sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiKeyLocation {
    /// Custom request header, e.g. `X-API-Key`
    Header(String),
    /// Query string parameter, e.g. `?api_key=...`
    Query(String),
}

/// Static authentication method
#[derive(Debug, Clone)]
pub enum Auth {
    /// HTTP Basic Authentication (RFC 7617)
    Basic { username: String, password: Option<String> },
    /// Bearer token authentication (RFC 6750)
    Bearer(String),
    /// API key in a header or query parameter
    ApiKey { location: ApiKeyLocation, key: String },
}

impl Auth {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Auth::Basic {
            username: username.into(),
            password: Some(password.into()),
        }
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Auth::Bearer(token.into())
    }

    pub fn api_key_header(header_name: impl Into<String>, key: impl Into<String>) -> Self {
        Auth::ApiKey {
            location: ApiKeyLocation::Header(header_name.into()),
            key: key.into(),
        }
    }

    pub fn api_key_query(param: impl Into<String>, key: impl Into<String>) -> Self {
        Auth::ApiKey {
            location: ApiKeyLocation::Query(param.into()),
            key: key.into(),
        }
    }

    /// Add credentials to the request
    pub fn apply(&self, request: &mut Request) -> Result<(), AuthError> {
        match self {
            Auth::Basic { username, password } => {
                if username.is_empty() {
                    return Err(AuthError::MissingCredentials);
                }
                let credentials = format!("{}:{}", username, password.as_deref().unwrap_or(""));
                let encoded = base64::engine::general_purpose::STANDARD.encode(credentials.as_bytes());
                request.headers.insert(AUTHORIZATION, header_value(&format!("Basic {}", encoded))?);
            }
            Auth::Bearer(token) => {
                if token.is_empty() {
                    return Err(AuthError::MissingCredentials);
                }
                request.headers.insert(AUTHORIZATION, header_value(&format!("Bearer {}", token))?);
            }
            Auth::ApiKey { location: ApiKeyLocation::Header(name), key } => {
                let name = HeaderName::try_from(name.as_str())
                    .map_err(|e| AuthError::InvalidHeader(format!("invalid header name: {}", e)))?;
                request.headers.insert(name, header_value(key)?);
            }
            Auth::ApiKey { location: ApiKeyLocation::Query(param), key } => {
                // Drop any earlier value so retries don't stack duplicates
                let kept: Vec<(String, String)> = request
                    .url
                    .query_pairs()
                    .filter(|(k, _)| k != param.as_str())
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect();
                let mut pairs = request.url.query_pairs_mut();
                pairs.clear();
                pairs.extend_pairs(kept);
                pairs.append_pair(param, key);
            }
        }
        Ok(())
    }

    /// Authentication type name for display/debugging
    pub fn type_name(&self) -> &'static str {
        match self {
            Auth::Basic { .. } => "basic",
            Auth::Bearer(_) => "bearer",
            Auth::ApiKey { .. } => "api-key",
        }
    }
}

pub(crate) fn header_value(value: &str) -> Result<HeaderValue, AuthError> {
    let mut value = HeaderValue::from_str(value).map_err(|e| AuthError::InvalidHeader(e.to_string()))?;
    value.set_sensitive(true);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Method;
    use url::Url;

    fn request(url: &str) -> Request {
        Request::new(Method::GET, Url::parse(url).unwrap())
    }

    #[test]
    fn test_basic_auth() {
        let mut req = request("https://example.org/");
        Auth::basic("user", "pass").apply(&mut req).unwrap();

        let value = req.headers.get(AUTHORIZATION).unwrap();
        assert!(value.is_sensitive());
        let value = value.to_str().unwrap();
        assert!(value.starts_with("Basic "));

        let decoded = base64::engine::general_purpose::STANDARD.decode(&value[6..]).unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), "user:pass");
    }

    #[test]
    fn test_bearer_auth() {
        let mut req = request("https://example.org/");
        Auth::bearer("my-token").apply(&mut req).unwrap();
        assert_eq!(req.headers.get(AUTHORIZATION).unwrap(), "Bearer my-token");
    }

    #[test]
    fn test_empty_bearer_is_missing() {
        let mut req = request("https://example.org/");
        assert!(matches!(Auth::bearer("").apply(&mut req), Err(AuthError::MissingCredentials)));
    }

    #[test]
    fn test_api_key_header() {
        let mut req = request("https://example.org/");
        Auth::api_key_header("X-API-Key", "secret123").apply(&mut req).unwrap();
        assert_eq!(req.headers.get("x-api-key").unwrap(), "secret123");
    }

    #[test]
    fn test_api_key_query_is_not_duplicated() {
        let mut req = request("https://example.org/items?page=2");
        let auth = Auth::api_key_query("api_key", "s3cret");
        auth.apply(&mut req).unwrap();
        auth.apply(&mut req).unwrap();
        assert_eq!(req.url.as_str(), "https://example.org/items?page=2&api_key=s3cret");
    }

    #[test]
    fn test_invalid_header_value() {
        let mut req = request("https://example.org/");
        let result = Auth::bearer("bad\ntoken").apply(&mut req);
        assert!(matches!(result, Err(AuthError::InvalidHeader(_))));
    }
}
