//! Request building module
//!
//! Endpoints describe a call; [`resolve`] turns them into frozen [`Request`]s.

mod endpoint;
mod types;

pub use endpoint::{resolve, ApiEndpoint, Endpoint, EndpointBody};
pub use types::{Body, BodyStream, Request, Response, ResponseBody, UploadStream};
