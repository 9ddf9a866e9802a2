//! Streamed downloads with progress and resume support

use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{HeaderValue, ACCEPT_ENCODING, CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::{Client, ExecuteOptions};
use crate::errors::{PulsewireError, Result};
use crate::progress::{ProgressSink, ProgressTracker};
use crate::request::{Endpoint, Response};

/// What a finished download wrote
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadSummary {
    pub status: StatusCode,
    /// Bytes written by this call
    pub bytes_written: u64,
    /// Offset the body was appended at
    pub resumed_from: u64,
    pub total_bytes: Option<u64>,
}

/// Downloader with progress tracking and resume support
#[derive(Debug, Clone, Default)]
pub struct Downloader {
    resume_from: u64,
    progress: Option<ProgressSink>,
    /// Longest wait for the next body chunk
    chunk_timeout: Option<Duration>,
}

impl Downloader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue after `offset` bytes the writer already holds
    pub fn resume_from(mut self, offset: u64) -> Self {
        self.resume_from = offset;
        self
    }

    pub fn progress(mut self, sink: ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    /// Fail with `Timeout` when the body stalls this long between chunks.
    /// [`run`](Self::run) falls back to the client's attempt timeout.
    pub fn chunk_timeout(mut self, limit: Duration) -> Self {
        self.chunk_timeout = Some(limit);
        self
    }

    /// Prepare request headers for download
    fn pre_request(&self, options: &mut ExecuteOptions) {
        // Compressed bodies would make byte offsets meaningless
        options.headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        if self.resume_from > 0 {
            if let Ok(range) = HeaderValue::from_str(&format_range(self.resume_from)) {
                options.headers.insert(RANGE, range);
            }
        }
    }

    /// Dispatch `endpoint` through `client` and stream the body into `writer`.
    ///
    /// Non-2xx final responses become `Http` errors and nothing is written.
    /// The client's deadline covers the body as well as the attempts.
    pub async fn run<B, W>(
        &self,
        client: &Client,
        endpoint: Endpoint<B>,
        writer: &mut W,
        mut options: ExecuteOptions,
    ) -> Result<DownloadSummary>
    where
        B: Serialize,
        W: AsyncWrite + Unpin,
    {
        self.pre_request(&mut options);
        let cancel = options.cancel.clone().unwrap_or_default();
        let config = client.config();
        let started = Instant::now();

        let response = client.dispatch(endpoint, &options, false).await?;
        if !response.is_success() {
            return Err(response.into_http_error().await);
        }

        let chunk_timeout = self.chunk_timeout.or(config.attempt_timeout);
        let copy = self.copy_body(response, writer, &cancel, chunk_timeout);
        match config.deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_sub(started.elapsed());
                tokio::time::timeout(remaining, copy)
                    .await
                    .map_err(|_| PulsewireError::Timeout(deadline.as_secs_f64()))?
            }
            None => copy.await,
        }
    }

    /// Copy a response body into `writer`, publishing progress after each chunk
    pub async fn write_body<W>(
        &self,
        response: Response,
        writer: &mut W,
        cancel: &CancellationToken,
    ) -> Result<DownloadSummary>
    where
        W: AsyncWrite + Unpin,
    {
        self.copy_body(response, writer, cancel, self.chunk_timeout).await
    }

    async fn copy_body<W>(
        &self,
        response: Response,
        writer: &mut W,
        cancel: &CancellationToken,
        chunk_timeout: Option<Duration>,
    ) -> Result<DownloadSummary>
    where
        W: AsyncWrite + Unpin,
    {
        let status = response.status;
        let mut total_bytes = response.content_length();
        let mut resumed_from = 0;
        // Bytes of the body the writer already holds
        let mut skip = 0u64;

        if status == StatusCode::PARTIAL_CONTENT {
            if let Some((from, total)) = response
                .headers
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range)
            {
                resumed_from = from;
                total_bytes = Some(total);
            }
        } else if self.resume_from > 0 {
            // Range ignored: the full body is coming, drop what we already have
            debug!(offset = self.resume_from, "server ignored range request");
            resumed_from = self.resume_from;
            skip = self.resume_from;
        }

        let mut tracker = ProgressTracker::starting_at(self.progress.clone(), resumed_from, total_bytes);
        let mut stream = response.into_stream();
        let mut written = 0u64;

        loop {
            let read = async {
                match chunk_timeout {
                    Some(limit) => tokio::time::timeout(limit, stream.next())
                        .await
                        .map_err(|_| PulsewireError::Timeout(limit.as_secs_f64())),
                    None => Ok(stream.next().await),
                }
            };
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    writer.flush().await?;
                    return Err(PulsewireError::Cancelled);
                }
                next = read => next?,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = skip_prefix(chunk?, &mut skip);
            if chunk.is_empty() {
                continue;
            }

            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
            tracker.advance(chunk.len());
        }

        writer.flush().await?;
        info!(bytes = written, total = ?total_bytes, "download complete");

        Ok(DownloadSummary {
            status,
            bytes_written: written,
            resumed_from,
            total_bytes,
        })
    }
}

fn format_range(offset: u64) -> String {
    format!("bytes={}-", offset)
}

fn skip_prefix(mut chunk: Bytes, skip: &mut u64) -> Bytes {
    if *skip == 0 {
        return chunk;
    }
    let n = (*skip).min(chunk.len() as u64) as usize;
    *skip -= n as u64;
    chunk.split_off(n)
}

/// Parse Content-Range header: "bytes 0-499/1234"
pub fn parse_content_range(range: &str) -> Option<(u64, u64)> {
    let rest = range.trim().strip_prefix("bytes ")?;
    let (range_part, total_part) = rest.split_once('/')?;
    let (first, _last) = range_part.split_once('-')?;

    let first: u64 = first.trim().parse().ok()?;
    let total: u64 = total_part.trim().parse().ok()?;

    Some((first, total))
}
