//! # kestrel-sync
//!
//! Sync protocol and block-download pipeline for the Kestrel node.
//!
//! This crate provides:
//! - Per-stream protocol handlers serving the sync request kinds
//! - Typed client calls over the request manager
//! - The chain collaborator interface
//! - Result queue for in-order block insertion
//! - Long-range and short-range download pipeline

mod block;
mod chain;
mod downloader;
mod error;
mod longrange;
mod metrics;
mod protocol;
mod queue;
mod shortrange;

pub use block::{Block, Header};
pub use chain::{Chain, ChainConfig, ChainHelper, EpochState};
pub use downloader::{DownloadTask, Downloader, DownloaderConfig, SyncState};
pub use error::{ChainError, SyncError, SyncResult};
pub use metrics::{DownloaderMetrics, ProtocolMetrics};
pub use protocol::{Protocol, MIN_VERSION, PROTOCOL_VERSION, SERVICE_NAME};
pub use queue::{BlockResult, ResultQueue};

/// Blocks fetched per blocks-by-number request.
pub const NUM_BLOCKS_BY_NUM_PER_REQUEST: usize = 10;

/// Blocks per chain insert batch.
pub const BLOCKS_PER_INSERT: usize = 50;

/// Heights covered by one short-range hash request.
pub const NUM_BLOCK_HASHES_PER_REQUEST: usize = 20;

/// Upper bound on one blocks-by-hashes request.
pub const NUM_BLOCKS_BY_HASHES_UPPER_CAP: usize = 10;

/// Lower bound on one blocks-by-hashes request when the window allows it.
pub const NUM_BLOCKS_BY_HASHES_LOWER_CAP: usize = 3;

/// Gap to the best peer tip at or below which sync goes short-range.
pub const LAST_MILE_THRES: u64 = 10;

/// Result queue depth above which workers stop issuing new fetches.
pub const SOFT_QUEUE_CAP: usize = 100;

/// Hard cap on the result queue.
pub const QUEUE_MAX_SIZE: usize = 200;
