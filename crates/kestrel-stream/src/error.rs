//! Stream subsystem error types.

use crate::types::StreamId;
use thiserror::Error;

/// Errors surfaced by the stream request/response subsystem.
#[derive(Error, Debug)]
pub enum StreamError {
    /// Frame exceeds the maximum allowed size.
    #[error("frame too large: {size} bytes, max {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    /// Stream ended in the middle of a length-prefixed payload.
    #[error("short read: truncated frame")]
    ShortRead,

    /// Malformed wire message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Non-blocking rate limit check failed.
    #[error("rate limited: {0}")]
    RateLimited(StreamId),

    /// Stream already registered with the stream manager.
    #[error("stream already exists: {0}")]
    StreamAlreadyExists(StreamId),

    /// Stream not known to the stream manager.
    #[error("stream not found: {0}")]
    StreamNotFound(StreamId),

    /// Stream manager is at its hard capacity.
    #[error("too many streams: {count}, max {max}")]
    TooManyStreams { count: usize, max: usize },

    /// Remote protocol cannot serve our requests.
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// Request manager was closed while the request was in flight.
    #[error("request manager closed")]
    ManagerClosed,

    /// No stream available to serve the request (fail-fast mode only).
    #[error("no available stream")]
    NoAvailableStream,

    /// Peer connection is gone.
    #[error("connection closed")]
    ConnectionClosed,

    /// I/O error on the underlying byte stream.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Metric registration failed.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Result type for stream operations.
pub type StreamResult<T> = Result<T, StreamError>;
