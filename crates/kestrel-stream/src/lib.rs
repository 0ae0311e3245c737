//! # kestrel-stream
//!
//! Stream-based p2p request/response subsystem for the Kestrel node.
//!
//! This crate provides:
//! - Length-prefixed frame codec over duplex byte streams
//! - Wire envelope for the sync protocol request kinds
//! - Live stream registry with add/remove event subscriptions
//! - Request manager matching responses to requests under retries,
//!   timeouts and cancellation
//! - Inbound request rate limiting

mod codec;
mod error;
mod manager;
mod message;
mod metrics;
mod ratelimit;
mod request;
mod types;

pub use codec::FrameCodec;
pub use error::{StreamError, StreamResult};
pub use manager::{StreamManager, StreamManagerConfig};
pub use message::{
    ErrorCode, Message, Request, RequestKind, RequestPayload, Response, ResponsePayload,
    GET_BLOCKS_BY_HASHES_CAP, GET_BLOCKS_BY_NUM_CAP, GET_BLOCK_HASHES_CAP,
};
pub use metrics::{RequestManagerMetrics, StreamManagerMetrics};
pub use ratelimit::{RateLimiter, RateLimiterConfig};
pub use request::{
    RequestManager, RequestManagerConfig, RequestManagerStats, RequestOptions,
};
pub use types::{BlockHash, ProtoId, ProtoSpec, ProtoVersion, StreamHandle, StreamId};

/// Maximum frame size on a peer stream.
pub const MAX_FRAME_BYTES: usize = 20 * 1024 * 1024; // 20 MiB
