//! Concrete request and response values exchanged with a transport

use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use url::Url;

use crate::errors::{PulsewireError, Result};
use crate::progress::ProgressSink;
use crate::uploads::chunked::{upload_stream, CHUNK_SIZE};
use crate::uploads::MultipartForm;

/// Streamed response body
pub type BodyStream = BoxStream<'static, Result<Bytes>>;

/// Streamed request body handed to a transport
pub type UploadStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Request body variants
#[derive(Debug, Clone, Default)]
pub enum Body {
    #[default]
    Empty,
    /// Fully buffered bytes
    Full(Bytes),
    /// Multipart form, encoded lazily for every attempt
    Multipart(Arc<MultipartForm>),
}

impl Body {
    pub fn is_empty(&self) -> bool {
        match self {
            Body::Empty => true,
            Body::Full(bytes) => bytes.is_empty(),
            Body::Multipart(_) => false,
        }
    }

    /// Exact length of the encoded body
    pub fn content_length(&self) -> u64 {
        match self {
            Body::Empty => 0,
            Body::Full(bytes) => bytes.len() as u64,
            Body::Multipart(form) => form.content_length(),
        }
    }
}

/// A concrete HTTP request
///
/// Header names are case-insensitive and `insert` replaces earlier values, so
/// the last write wins.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Body,
    /// Receives upload progress while the body is streamed
    pub upload_progress: Option<ProgressSink>,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Body::Empty,
            upload_progress: None,
        }
    }

    /// Whether the body has to be streamed rather than sent as one buffer
    pub fn is_streaming(&self) -> bool {
        matches!(self.body, Body::Multipart(_)) || (self.upload_progress.is_some() && !self.body.is_empty())
    }

    /// Body as a chunked stream that publishes upload progress
    pub fn body_stream(&self) -> UploadStream {
        let total = Some(self.body.content_length());
        let sink = self.upload_progress.clone();
        match &self.body {
            Body::Empty => stream::empty().boxed(),
            Body::Full(bytes) => upload_stream(vec![bytes.clone()], CHUNK_SIZE, total, sink).boxed(),
            Body::Multipart(form) => form.stream(sink).boxed(),
        }
    }

    /// Whole body in one buffer
    pub fn body_bytes(&self) -> Bytes {
        match &self.body {
            Body::Empty => Bytes::new(),
            Body::Full(bytes) => bytes.clone(),
            Body::Multipart(form) => form.to_bytes(),
        }
    }
}

/// Response body variants
pub enum ResponseBody {
    Full(Bytes),
    Streaming(BodyStream),
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            ResponseBody::Streaming(_) => f.write_str("Streaming"),
        }
    }
}

/// A response received from a transport. Read-only once returned.
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl Response {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: ResponseBody::Full(body.into()),
        }
    }

    pub fn streaming(status: StatusCode, headers: HeaderMap, body: BodyStream) -> Self {
        Self {
            status,
            headers,
            body: ResponseBody::Streaming(body),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Declared Content-Length, if any
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse().ok())
    }

    /// Buffered body, if it has already been read
    pub fn full_body(&self) -> Option<&Bytes> {
        match &self.body {
            ResponseBody::Full(bytes) => Some(bytes),
            ResponseBody::Streaming(_) => None,
        }
    }

    /// Collect the whole body
    pub async fn bytes(self) -> Result<Bytes> {
        match self.body {
            ResponseBody::Full(bytes) => Ok(bytes),
            ResponseBody::Streaming(stream) => {
                let buf = stream
                    .try_fold(BytesMut::new(), |mut buf, chunk| async move {
                        buf.extend_from_slice(&chunk);
                        Ok(buf)
                    })
                    .await?;
                Ok(buf.freeze())
            }
        }
    }

    /// Same response with the body read into memory
    pub async fn buffered(self) -> Result<Response> {
        match self.body {
            ResponseBody::Full(_) => Ok(self),
            ResponseBody::Streaming(_) => {
                let status = self.status;
                let headers = self.headers.clone();
                let body = self.bytes().await?;
                Ok(Response::new(status, headers, body))
            }
        }
    }

    /// Body as a stream of chunks
    pub fn into_stream(self) -> BodyStream {
        match self.body {
            ResponseBody::Full(bytes) => stream::once(async move { Ok(bytes) }).boxed(),
            ResponseBody::Streaming(stream) => stream,
        }
    }

    /// Convert into an `Http` error carrying the collected body
    pub async fn into_http_error(self) -> PulsewireError {
        let status = self.status;
        let headers = self.headers.clone();
        match self.bytes().await {
            Ok(body) => PulsewireError::Http { status, headers, body },
            Err(e) => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploads::Part;

    #[tokio::test]
    async fn test_streaming_body_collects() {
        let chunks = vec![Ok(Bytes::from_static(b"ab")), Ok(Bytes::from_static(b"cd"))];
        let response = Response::streaming(StatusCode::OK, HeaderMap::new(), stream::iter(chunks).boxed());
        assert_eq!(response.bytes().await.unwrap(), Bytes::from_static(b"abcd"));
    }

    #[tokio::test]
    async fn test_streaming_error_surfaces() {
        let chunks = vec![Ok(Bytes::from_static(b"ab")), Err(PulsewireError::Connection("reset".into()))];
        let response = Response::streaming(StatusCode::OK, HeaderMap::new(), stream::iter(chunks).boxed());
        assert!(matches!(response.bytes().await, Err(PulsewireError::Connection(_))));
    }

    #[tokio::test]
    async fn test_into_http_error_keeps_body() {
        let response = Response::new(StatusCode::NOT_FOUND, HeaderMap::new(), "missing");
        match response.into_http_error().await {
            PulsewireError::Http { status, body, .. } => {
                assert_eq!(status, StatusCode::NOT_FOUND);
                assert_eq!(body, Bytes::from_static(b"missing"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_multipart_body_stream_matches_buffer() {
        let form = MultipartForm::with_boundary("b").part(Part::text("a", "1"));
        let mut request = Request::new(Method::POST, Url::parse("http://localhost/").unwrap());
        request.body = Body::Multipart(Arc::new(form));

        assert!(request.is_streaming());
        let streamed: Vec<Bytes> = request.body_stream().try_collect().await.unwrap();
        assert_eq!(streamed.concat(), request.body_bytes().to_vec());
        assert_eq!(request.body.content_length(), request.body_bytes().len() as u64);
    }
}
