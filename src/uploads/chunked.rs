//! Chunked body streaming with progress reporting

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};

use crate::progress::{ProgressSink, ProgressTracker};

/// Default chunk size for uploads (100KB)
pub const CHUNK_SIZE: usize = 100 * 1024;

/// Iterator that yields zero-copy slices of a buffer
pub struct ChunkedBytes {
    data: Bytes,
    chunk_size: usize,
}

impl ChunkedBytes {
    pub fn new(data: Bytes) -> Self {
        Self::with_chunk_size(data, CHUNK_SIZE)
    }

    pub fn with_chunk_size(data: Bytes, chunk_size: usize) -> Self {
        Self {
            data,
            chunk_size: chunk_size.max(1),
        }
    }
}

impl Iterator for ChunkedBytes {
    type Item = Bytes;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }
        let take = self.chunk_size.min(self.data.len());
        Some(self.data.split_to(take))
    }
}

/// Turn a sequence of segments into a chunked stream that reports upload
/// progress after each chunk is handed out.
pub fn upload_stream(
    segments: Vec<Bytes>,
    chunk_size: usize,
    total: Option<u64>,
    sink: Option<ProgressSink>,
) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static {
    let mut tracker = ProgressTracker::new(sink, total);
    stream::iter(
        segments
            .into_iter()
            .flat_map(move |segment| ChunkedBytes::with_chunk_size(segment, chunk_size)),
    )
    .map(move |chunk| {
        tracker.advance(chunk.len());
        Ok(chunk)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::Progress;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_chunked_bytes_splits_evenly() {
        let chunks: Vec<Bytes> = ChunkedBytes::with_chunk_size(Bytes::from_static(b"abcdefg"), 3).collect();
        assert_eq!(chunks, vec![Bytes::from_static(b"abc"), Bytes::from_static(b"def"), Bytes::from_static(b"g")]);
    }

    #[test]
    fn test_chunked_bytes_empty() {
        assert_eq!(ChunkedBytes::new(Bytes::new()).count(), 0);
    }

    #[tokio::test]
    async fn test_upload_stream_reports_progress() {
        let seen: Arc<Mutex<Vec<Progress>>> = Arc::default();
        let seen_clone = seen.clone();
        let sink = ProgressSink::callback(move |p| seen_clone.lock().unwrap().push(p));

        let segments = vec![Bytes::from_static(b"hello "), Bytes::from_static(b"world")];
        let body: Vec<Bytes> = upload_stream(segments, 4, Some(11), Some(sink))
            .map(|r| r.unwrap())
            .collect()
            .await;

        assert_eq!(body.concat(), b"hello world");
        let seen = seen.lock().unwrap();
        assert_eq!(seen.last().unwrap().bytes_transferred, 11);
        assert_eq!(seen.last().unwrap().fraction_complete, Some(1.0));
        assert!(seen.windows(2).all(|w| w[0].bytes_transferred < w[1].bytes_transferred));
    }
}
