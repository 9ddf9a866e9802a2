//! Multipart form data encoding
//!
//! Parts are laid out as `--boundary`, a header section, the raw bytes, and a
//! final `--boundary--`. The boundary is a random 32-character token. Part
//! contents are not scanned for it: callers must not upload data that contains
//! the literal boundary line.

use bytes::{BufMut, Bytes, BytesMut};
use futures::Stream;
use rand::distr::Alphanumeric;
use rand::Rng;

use super::chunked::{upload_stream, CHUNK_SIZE};
use crate::progress::ProgressSink;

const BOUNDARY_LEN: usize = 32;

/// Content of a single form part
#[derive(Debug, Clone, PartialEq)]
pub enum PartContent {
    Text(String),
    Bytes {
        data: Bytes,
        filename: Option<String>,
        content_type: Option<String>,
    },
}

/// One named part of a multipart form
#[derive(Debug, Clone, PartialEq)]
pub struct Part {
    pub name: String,
    pub content: PartContent,
}

impl Part {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: PartContent::Text(value.into()),
        }
    }

    pub fn bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            content: PartContent::Bytes {
                data: data.into(),
                filename: None,
                content_type: None,
            },
        }
    }

    /// Set the filename; ignored for text parts
    pub fn file_name(mut self, name: impl Into<String>) -> Self {
        if let PartContent::Bytes { ref mut filename, .. } = self.content {
            *filename = Some(name.into());
        }
        self
    }

    /// Set the Content-Type; ignored for text parts
    pub fn mime_str(mut self, mime: impl Into<String>) -> Self {
        if let PartContent::Bytes { ref mut content_type, .. } = self.content {
            *content_type = Some(mime.into());
        }
        self
    }

    fn header_section(&self, boundary: &str) -> Bytes {
        let mut head = format!(
            "--{}\r\nContent-Disposition: form-data; name=\"{}\"",
            boundary,
            escape_quoted(&self.name)
        );

        if let PartContent::Bytes { filename, content_type, .. } = &self.content {
            if let Some(filename) = filename {
                head.push_str(&format!("; filename=\"{}\"", escape_quoted(filename)));
            }
            head.push_str("\r\n");

            let mime = content_type.clone().or_else(|| {
                filename
                    .as_deref()
                    .and_then(|f| mime_guess::from_path(f).first_raw())
                    .map(str::to_string)
            });
            let mime = mime.unwrap_or_else(|| "application/octet-stream".to_string());
            head.push_str(&format!("Content-Type: {}\r\n", mime));
        } else {
            head.push_str("\r\n");
        }

        head.push_str("\r\n");
        Bytes::from(head)
    }

    fn body(&self) -> Bytes {
        match &self.content {
            PartContent::Text(text) => Bytes::copy_from_slice(text.as_bytes()),
            PartContent::Bytes { data, .. } => data.clone(),
        }
    }
}

/// Ordered multipart form, immutable once handed to an endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct MultipartForm {
    boundary: String,
    parts: Vec<Part>,
}

impl Default for MultipartForm {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipartForm {
    /// Create an empty form with a freshly generated boundary
    pub fn new() -> Self {
        Self::with_boundary(generate_boundary())
    }

    pub fn with_boundary(boundary: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
            parts: Vec::new(),
        }
    }

    pub fn text(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.part(Part::text(name, value))
    }

    pub fn part(mut self, part: Part) -> Self {
        self.parts.push(part);
        self
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    /// Value for the request's Content-Type header
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// Encoded body as an ordered list of segments
    pub fn segments(&self) -> Vec<Bytes> {
        let mut segments = Vec::with_capacity(self.parts.len() * 3 + 1);
        for part in &self.parts {
            segments.push(part.header_section(&self.boundary));
            segments.push(part.body());
            segments.push(Bytes::from_static(b"\r\n"));
        }
        segments.push(Bytes::from(format!("--{}--\r\n", self.boundary)));
        segments
    }

    /// Exact encoded length in bytes
    pub fn content_length(&self) -> u64 {
        self.segments().iter().map(|s| s.len() as u64).sum()
    }

    /// Whole body in one buffer
    pub fn to_bytes(&self) -> Bytes {
        let segments = self.segments();
        let mut buf = BytesMut::with_capacity(segments.iter().map(Bytes::len).sum());
        for segment in segments {
            buf.put(segment);
        }
        buf.freeze()
    }

    /// Encoded body as a chunked stream, reporting upload progress to `sink`
    pub fn stream(
        &self,
        sink: Option<ProgressSink>,
    ) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static {
        upload_stream(self.segments(), CHUNK_SIZE, Some(self.content_length()), sink)
    }
}

fn generate_boundary() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(BOUNDARY_LEN)
        .map(char::from)
        .collect()
}

fn escape_quoted(value: &str) -> String {
    value
        .replace('"', "%22")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}
