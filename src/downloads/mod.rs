//! Downloads streamed into caller-supplied writers

mod downloader;

pub use downloader::{parse_content_range, DownloadSummary, Downloader};
