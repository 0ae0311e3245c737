//! Inbound request rate limiting.
//!
//! Two layers of token buckets: one global bucket shared by all peers and one
//! bucket per peer stream. A request passes only when both buckets hold a
//! token. The service side blocks until tokens are available; the client
//! side uses the non-blocking variant and treats an empty bucket as an error.

use crate::error::{StreamError, StreamResult};
use crate::types::StreamId;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Rate limiter configuration. Rates are tokens per second; capacities are
/// the burst sizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    pub global_rate: f64,
    pub global_capacity: f64,
    pub per_stream_rate: f64,
    pub per_stream_capacity: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            global_rate: 64.0,
            global_capacity: 128.0,
            per_stream_rate: 10.0,
            per_stream_capacity: 20.0,
        }
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, rate: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Time until at least one token is available. Zero when a token is
    /// already there.
    fn wait_hint(&self) -> Duration {
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.rate)
        }
    }
}

/// Global + per-stream token bucket limiter.
pub struct RateLimiter {
    config: RateLimiterConfig,
    global: Mutex<TokenBucket>,
    per_stream: DashMap<StreamId, TokenBucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        let global = Mutex::new(TokenBucket::new(config.global_capacity, config.global_rate));
        Self {
            config,
            global,
            per_stream: DashMap::new(),
        }
    }

    /// Wait until both the global and the stream's bucket yield a token.
    ///
    /// Cancellation-safe: dropping the future consumes no tokens.
    pub async fn limit_request(&self, stream_id: &StreamId) {
        loop {
            match self.try_take(stream_id) {
                Ok(()) => return,
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    /// Non-blocking variant; fails with `RateLimited` when either bucket is
    /// empty.
    pub fn try_limit_request(&self, stream_id: &StreamId) -> StreamResult<()> {
        self.try_take(stream_id)
            .map_err(|_| StreamError::RateLimited(stream_id.clone()))
    }

    /// Drop the bucket of a removed stream.
    pub fn remove_stream(&self, stream_id: &StreamId) {
        self.per_stream.remove(stream_id);
    }

    /// Take one token from both buckets, or report how long to wait.
    ///
    /// Tokens are consumed atomically under both locks so a passing global
    /// check never leaks a token when the per-stream bucket is empty.
    fn try_take(&self, stream_id: &StreamId) -> Result<(), Duration> {
        let mut global = self.global.lock();
        global.refill();

        let mut peer = self
            .per_stream
            .entry(stream_id.clone())
            .or_insert_with(|| {
                TokenBucket::new(self.config.per_stream_capacity, self.config.per_stream_rate)
            });
        peer.refill();

        if global.tokens >= 1.0 && peer.tokens >= 1.0 {
            global.tokens -= 1.0;
            peer.tokens -= 1.0;
            return Ok(());
        }

        let wait = global.wait_hint().max(peer.wait_hint());
        Err(wait.max(Duration::from_millis(1)))
    }
}
