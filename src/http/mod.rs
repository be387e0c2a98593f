//! HTTP/1.1 framing and parsing over the buffered message pipeline.

pub mod framer;
pub mod parser;

pub use framer::{read_request, FramedRequest, MAX_CONTENT_LENGTH, MAX_HEADER};
pub use parser::{normalize_path, parse_request, Request};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HttpError {
    /// Peer closed before sending anything.
    #[error("connection closed by peer")]
    ConnectionClosed,
    /// Peer closed mid-request.
    #[error("truncated request")]
    Truncated,
    #[error("request headers exceed {0} bytes")]
    HeadersTooLarge(usize),
    #[error("content length {0} exceeds the configured limit")]
    BodyTooLarge(i64),
    #[error("malformed request: {0}")]
    Malformed(&'static str),
    #[error("buffer pool exhausted")]
    PoolExhausted,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
