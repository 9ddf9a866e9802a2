//! Byte-level transfer progress reporting
//!
//! Uploads and downloads publish a [`Progress`] snapshot after every chunk to a
//! caller-supplied [`ProgressSink`]: either a callback or a `watch` channel.

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Progress snapshot for one transfer
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Progress {
    pub bytes_transferred: u64,
    /// Total size when known up front
    pub total_bytes: Option<u64>,
    /// `bytes_transferred / total_bytes` in `[0.0, 1.0]`; `None` if the total is unknown
    pub fraction_complete: Option<f64>,
}

impl Progress {
    pub fn new(bytes_transferred: u64, total_bytes: Option<u64>) -> Self {
        let fraction_complete = match total_bytes {
            Some(0) => Some(1.0),
            Some(total) => Some((bytes_transferred as f64 / total as f64).min(1.0)),
            None => None,
        };
        Self {
            bytes_transferred,
            total_bytes,
            fraction_complete,
        }
    }

    /// Progress as percentage (0-100)
    pub fn percent(&self) -> Option<f64> {
        self.fraction_complete.map(|f| f * 100.0)
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.total_bytes, Some(total) if self.bytes_transferred >= total)
    }
}

#[derive(Clone)]
enum SinkInner {
    Callback(Arc<dyn Fn(Progress) + Send + Sync>),
    Channel(Arc<watch::Sender<Progress>>),
}

/// Destination for progress updates
#[derive(Clone)]
pub struct ProgressSink {
    inner: SinkInner,
}

impl ProgressSink {
    /// Invoke `f` for every update
    pub fn callback(f: impl Fn(Progress) + Send + Sync + 'static) -> Self {
        Self {
            inner: SinkInner::Callback(Arc::new(f)),
        }
    }

    /// Publish updates into a `watch` channel; the receiver always holds the latest snapshot
    pub fn channel() -> (Self, watch::Receiver<Progress>) {
        let (tx, rx) = watch::channel(Progress::default());
        let sink = Self {
            inner: SinkInner::Channel(Arc::new(tx)),
        };
        (sink, rx)
    }

    pub fn publish(&self, progress: Progress) {
        match &self.inner {
            SinkInner::Callback(f) => f(progress),
            // A dropped receiver just means nobody is watching
            SinkInner::Channel(tx) => {
                tx.send_replace(progress);
            }
        }
    }
}

impl fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.inner {
            SinkInner::Callback(_) => "callback",
            SinkInner::Channel(_) => "channel",
        };
        f.debug_struct("ProgressSink").field("kind", &kind).finish()
    }
}

/// Running byte counter that publishes to an optional sink
#[derive(Debug)]
pub(crate) struct ProgressTracker {
    sink: Option<ProgressSink>,
    transferred: u64,
    total: Option<u64>,
}

impl ProgressTracker {
    pub(crate) fn new(sink: Option<ProgressSink>, total: Option<u64>) -> Self {
        Self::starting_at(sink, 0, total)
    }

    pub(crate) fn starting_at(sink: Option<ProgressSink>, transferred: u64, total: Option<u64>) -> Self {
        Self {
            sink,
            transferred,
            total,
        }
    }

    pub(crate) fn advance(&mut self, bytes: usize) -> Progress {
        self.transferred += bytes as u64;
        let progress = Progress::new(self.transferred, self.total);
        if let Some(ref sink) = self.sink {
            sink.publish(progress);
        }
        progress
    }

    pub(crate) fn transferred(&self) -> u64 {
        self.transferred
    }
}
