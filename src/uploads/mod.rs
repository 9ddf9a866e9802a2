//! Upload handling (multipart encoding, chunked streaming)

pub mod chunked;
pub mod multipart;

pub use multipart::{MultipartForm, Part, PartContent};
