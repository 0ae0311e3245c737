//! Block-download pipeline orchestration.
//!
//! The pipeline drives syncing through `Idle -> Probe -> LongRange ->
//! ShortRange -> Idle`. A probe asks live peers for their tips; a gap wider
//! than the last-mile threshold runs a long-range session (parallel
//! blocks-by-number workers feeding the result queue, one in-order
//! inserter), anything shorter runs a short-range session (hash majority
//! vote, then blocks-by-hashes). Peers that serve unusable data collect
//! demerits and are cut loose at a threshold.

use crate::chain::Chain;
use crate::error::{SyncError, SyncResult};
use crate::metrics::DownloaderMetrics;
use crate::protocol::Protocol;
use crate::queue::ResultQueue;
use crate::{longrange, shortrange, LAST_MILE_THRES};
use kestrel_stream::{StreamId, StreamManager};
use parking_lot::{Mutex, RwLock};
use prometheus::Registry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long a probe waits for tip answers.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Downloader configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloaderConfig {
    /// Network name.
    pub network: String,
    /// Number of concurrent download workers.
    pub concurrency: usize,
    /// Minimum live streams to keep syncing.
    pub min_streams: usize,
    /// Streams required before the first sync starts.
    pub init_streams: usize,
    /// Request failures tolerated per peer before it is cut loose.
    pub demerit_threshold: u32,
    /// Pause between probe rounds while in sync.
    pub idle_interval_ms: u64,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            network: "mainnet".to_string(),
            concurrency: 16,
            min_streams: 16,
            init_streams: 16,
            demerit_threshold: 3,
            idle_interval_ms: 5_000,
        }
    }
}

impl DownloaderConfig {
    /// Normalise so that `concurrency <= min_streams <= init_streams`.
    pub fn fix_values(&mut self) {
        if self.concurrency == 0 {
            self.concurrency = 16;
        }
        if self.min_streams < self.concurrency {
            self.min_streams = self.concurrency;
        }
        if self.init_streams < self.min_streams {
            self.init_streams = self.min_streams;
        }
        if self.demerit_threshold == 0 {
            self.demerit_threshold = 3;
        }
    }
}

/// Pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// In sync; waiting for the next probe round.
    Idle,
    /// Querying peer tips.
    Probe,
    /// Bulk download towards the target number.
    LongRange { target: u64 },
    /// Last-mile download via hash majority.
    ShortRange,
}

/// A contiguous half-open range `[lo, hi)` of block numbers to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadTask {
    pub lo: u64,
    pub hi: u64,
}

impl DownloadTask {
    pub fn new(lo: u64, hi: u64) -> Self {
        Self { lo, hi }
    }

    /// Number of blocks covered.
    pub fn len(&self) -> u64 {
        self.hi.saturating_sub(self.lo)
    }

    pub fn is_empty(&self) -> bool {
        self.hi <= self.lo
    }

    /// Slice into request-sized sub-batches.
    pub fn batches(&self, per_request: usize) -> Vec<Vec<u64>> {
        let mut out = Vec::new();
        let mut bn = self.lo;
        while bn < self.hi {
            let end = (bn + per_request as u64).min(self.hi);
            out.push((bn..end).collect());
            bn = end;
        }
        out
    }
}

/// The download pipeline.
pub struct Downloader {
    config: DownloaderConfig,
    chain: Arc<dyn Chain>,
    protocol: Arc<Protocol>,
    stream_manager: Arc<StreamManager>,
    queue: Arc<ResultQueue>,
    state: RwLock<SyncState>,
    demerits: Mutex<HashMap<StreamId, u32>>,
    metrics: DownloaderMetrics,
    shutdown: CancellationToken,
}

impl Downloader {
    pub fn new(
        mut config: DownloaderConfig,
        chain: Arc<dyn Chain>,
        protocol: Arc<Protocol>,
        stream_manager: Arc<StreamManager>,
        registry: &Registry,
    ) -> SyncResult<Arc<Self>> {
        config.fix_values();
        let metrics = DownloaderMetrics::new(registry).map_err(kestrel_stream::StreamError::from)?;
        Ok(Arc::new(Self {
            config,
            chain,
            protocol,
            stream_manager,
            queue: Arc::new(ResultQueue::new()),
            state: RwLock::new(SyncState::Idle),
            demerits: Mutex::new(HashMap::new()),
            metrics,
            shutdown: CancellationToken::new(),
        }))
    }

    /// Spawn the pipeline loop.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let dl = self.clone();
        tokio::spawn(dl.run())
    }

    /// Stop the pipeline.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Current pipeline state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// The result queue owned by this pipeline.
    pub fn result_queue(&self) -> &Arc<ResultQueue> {
        &self.queue
    }

    pub(crate) fn chain(&self) -> &Arc<dyn Chain> {
        &self.chain
    }

    pub(crate) fn protocol(&self) -> &Arc<Protocol> {
        &self.protocol
    }

    pub(crate) fn stream_manager(&self) -> &Arc<StreamManager> {
        &self.stream_manager
    }

    pub(crate) fn config(&self) -> &DownloaderConfig {
        &self.config
    }

    pub(crate) fn metrics(&self) -> &DownloaderMetrics {
        &self.metrics
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    async fn run(self: Arc<Self>) {
        // Block the first sync until the stream manager is bootstrapped.
        tokio::select! {
            _ = self.shutdown.cancelled() => return,
            _ = self.stream_manager.wait_bootstrapped() => {}
        }
        info!("downloader started");

        while !self.shutdown.is_cancelled() {
            *self.state.write() = SyncState::Probe;
            let target = match self.probe().await {
                Ok(target) => target,
                Err(err) => {
                    warn!(error = %err, "probe failed");
                    self.idle().await;
                    continue;
                }
            };

            let tip = self.chain.current_number();
            match target {
                Some(target) if target > tip + LAST_MILE_THRES => {
                    *self.state.write() = SyncState::LongRange { target };
                    self.metrics.long_range_sessions_total.inc();
                    info!(tip, target, "starting long-range sync");
                    match longrange::run(&self, target).await {
                        Ok(inserted) => {
                            info!(inserted, "long-range sync finished");
                        }
                        Err(err) => {
                            warn!(error = %err, "long-range sync failed");
                            continue; // re-probe
                        }
                    }
                    // Finish the last mile against agreed hashes.
                    self.run_short_range().await;
                }
                Some(target) => {
                    info!(tip, target, "starting short-range sync");
                    self.run_short_range().await;
                }
                None => {}
            }
            self.idle().await;
        }
        info!("downloader stopped");
    }

    async fn run_short_range(&self) {
        *self.state.write() = SyncState::ShortRange;
        self.metrics.short_range_sessions_total.inc();
        match shortrange::run(self).await {
            Ok(inserted) => info!(inserted, "short-range sync finished"),
            Err(err) => warn!(error = %err, "short-range sync failed"),
        }
    }

    async fn idle(&self) {
        *self.state.write() = SyncState::Idle;
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(Duration::from_millis(self.config.idle_interval_ms)) => {}
        }
    }

    /// Ask live peers for their tips; returns the best tip strictly above
    /// ours, if any peer is ahead.
    async fn probe(&self) -> SyncResult<Option<u64>> {
        let live = self.stream_manager.num_streams();
        if live == 0 {
            return Err(SyncError::Stalled("no live streams".into()));
        }
        let probes = live.min(self.config.concurrency);

        let mut set = JoinSet::new();
        for _ in 0..probes {
            let protocol = self.protocol.clone();
            set.spawn(async move {
                tokio::time::timeout(PROBE_TIMEOUT, protocol.get_current_block_number()).await
            });
        }

        let mut best: Option<u64> = None;
        while let Some(joined) = set.join_next().await {
            if let Ok(Ok(Ok((bn, _stid)))) = joined {
                best = Some(best.map_or(bn, |b| b.max(bn)));
            }
        }
        if best.is_none() {
            return Err(SyncError::Stalled("no peer answered the tip probe".into()));
        }
        let tip = self.chain.current_number();
        Ok(best.filter(|b| *b > tip))
    }

    /// Charge a demerit against a peer; at the threshold the peer is
    /// disqualified.
    pub(crate) fn demerit(&self, stream_id: &StreamId) {
        self.metrics.demerits_total.inc();
        let count = {
            let mut demerits = self.demerits.lock();
            let count = demerits.entry(stream_id.clone()).or_insert(0);
            *count += 1;
            *count
        };
        warn!(stream = %stream_id, count, "peer demerit");
        if count >= self.config.demerit_threshold {
            self.disqualify(stream_id);
        }
    }

    /// Purge a peer's queued blocks and close its stream. The peer handler
    /// unregisters the stream when it observes the close.
    pub(crate) fn disqualify(&self, stream_id: &StreamId) {
        self.metrics.disqualified_total.inc();
        self.demerits.lock().remove(stream_id);
        let purged = self.queue.remove_by_stream_id(stream_id);
        self.metrics.queue_depth.set(self.queue.len() as i64);
        warn!(stream = %stream_id, purged = purged.len(), "disqualifying peer");
        if let Some(handle) = self.stream_manager.get_stream(stream_id) {
            handle.close();
        }
    }
}
