//! Long-range sync session.
//!
//! Workers slice the target range into blocks-by-number batches and feed the
//! result queue; a single inserter drains the queue in order into the chain.
//! Workers park while the queue sits above the soft cap, and the whole
//! session aborts when a batch keeps failing or an insert goes wrong.

use crate::block::Block;
use crate::downloader::{DownloadTask, Downloader};
use crate::error::{ChainError, SyncError, SyncResult};
use crate::queue::BlockResult;
use crate::{BLOCKS_PER_INSERT, NUM_BLOCKS_BY_NUM_PER_REQUEST, SOFT_QUEUE_CAP};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Attempts per batch before the session gives up.
const MAX_BATCH_ATTEMPTS: u32 = 5;
/// Deadline for one blocks-by-number call, retries included.
const REQUEST_DEADLINE: Duration = Duration::from_secs(20);
/// Worker pause while parked (soft cap or transient failure).
const PARK_INTERVAL: Duration = Duration::from_millis(100);
/// Inserter poll cadence while the queue has no usable prefix.
const INSERT_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct Batch {
    nums: Vec<u64>,
    attempts: u32,
}

struct Session {
    dl: Arc<Downloader>,
    target: u64,
    batches: Mutex<VecDeque<Batch>>,
    /// Cancelled on fatal failure (or downloader shutdown, as the parent).
    abort: CancellationToken,
    /// Cancelled once every worker has exited.
    workers_done: CancellationToken,
}

/// Run one long-range session towards `target`. Returns blocks inserted.
pub(crate) async fn run(dl: &Arc<Downloader>, target: u64) -> SyncResult<u64> {
    let start = dl.chain().current_number();
    let task = DownloadTask::new(start + 1, target + 1);
    let batches = task
        .batches(NUM_BLOCKS_BY_NUM_PER_REQUEST)
        .into_iter()
        .map(|nums| Batch { nums, attempts: 0 })
        .collect();

    let session = Arc::new(Session {
        dl: dl.clone(),
        target,
        batches: Mutex::new(batches),
        abort: dl.shutdown_token().child_token(),
        workers_done: CancellationToken::new(),
    });

    let mut workers = JoinSet::new();
    for worker_id in 0..dl.config().concurrency {
        let session = session.clone();
        workers.spawn(async move { session.worker(worker_id).await });
    }
    let inserter = {
        let session = session.clone();
        tokio::spawn(async move { session.inserter().await })
    };

    while workers.join_next().await.is_some() {}
    session.workers_done.cancel();

    inserter
        .await
        .unwrap_or_else(|_| Err(SyncError::Stalled("inserter task died".into())))
}

impl Session {
    fn next_batch(&self) -> Option<Batch> {
        self.batches.lock().pop_front()
    }

    /// Put a failed batch back for another attempt; aborts the session when
    /// the batch is out of attempts.
    fn requeue(&self, mut batch: Batch) {
        batch.attempts += 1;
        if batch.attempts >= MAX_BATCH_ATTEMPTS {
            error!(
                from = batch.nums.first().copied().unwrap_or_default(),
                attempts = batch.attempts,
                "batch keeps failing; aborting long-range session"
            );
            self.abort.cancel();
            return;
        }
        self.batches.lock().push_back(batch);
    }

    /// Put a batch back untouched; used when the queue is full.
    fn park_batch(&self, batch: Batch) {
        self.batches.lock().push_front(batch);
    }

    async fn park(&self) {
        tokio::select! {
            _ = self.abort.cancelled() => {}
            _ = tokio::time::sleep(PARK_INTERVAL) => {}
        }
    }

    async fn worker(self: Arc<Self>, worker_id: usize) {
        loop {
            if self.abort.is_cancelled() {
                return;
            }
            if self.dl.result_queue().len() > SOFT_QUEUE_CAP {
                self.park().await;
                continue;
            }
            let Some(batch) = self.next_batch() else {
                debug!(worker_id, "no more batches; worker exiting");
                return;
            };

            let fetched = tokio::select! {
                _ = self.abort.cancelled() => return,
                fetched = tokio::time::timeout(
                    REQUEST_DEADLINE,
                    self.dl.protocol().get_blocks_by_number(&batch.nums),
                ) => fetched,
            };
            match fetched {
                Ok(Ok((blocks, stid))) => match validate_batch(&batch.nums, blocks) {
                    Ok(blocks) => {
                        let queue = self.dl.result_queue();
                        if queue.add_block_results(blocks, stid).is_err() {
                            self.park_batch(batch);
                            self.park().await;
                            continue;
                        }
                        self.dl.metrics().queue_depth.set(queue.len() as i64);
                    }
                    Err(reason) => {
                        warn!(worker_id, stream = %stid, reason, "unusable batch from peer");
                        self.dl.demerit(&stid);
                        self.requeue(batch);
                    }
                },
                Ok(Err(err)) => {
                    warn!(worker_id, error = %err, "blocks-by-number request failed");
                    self.requeue(batch);
                    self.park().await;
                }
                Err(_) => {
                    warn!(worker_id, "blocks-by-number request deadline exceeded");
                    self.requeue(batch);
                }
            }
        }
    }

    async fn inserter(self: Arc<Self>) -> SyncResult<u64> {
        let mut inserted_total = 0u64;
        loop {
            if self.abort.is_cancelled() {
                return Err(SyncError::Stalled("long-range session aborted".into()));
            }

            let next = self.dl.chain().current_number() + 1;
            let results = self
                .dl
                .result_queue()
                .pop_block_results(next, BLOCKS_PER_INSERT);
            self.dl
                .metrics()
                .queue_depth
                .set(self.dl.result_queue().len() as i64);

            if results.is_empty() {
                if self.dl.chain().current_number() >= self.target {
                    return Ok(inserted_total);
                }
                if self.workers_done.is_cancelled() && self.batches.lock().is_empty() {
                    // Nobody is left to fill the gap at `next`.
                    return Err(SyncError::Stalled(format!(
                        "download stopped short at block {}",
                        next
                    )));
                }
                tokio::select! {
                    _ = self.abort.cancelled() => {}
                    _ = tokio::time::sleep(INSERT_POLL_INTERVAL) => {}
                }
                continue;
            }

            inserted_total += self.insert(results)?;
        }
    }

    fn insert(&self, results: Vec<BlockResult>) -> SyncResult<u64> {
        let blocks: Vec<Block> = results.iter().map(|r| r.block.clone()).collect();
        match self.dl.chain().insert_chain(blocks) {
            Ok(count) => {
                self.dl.metrics().inserted_blocks_total.inc_by(count as u64);
                Ok(count as u64)
            }
            Err(err) => {
                self.dl.metrics().insert_failures_total.inc();
                // Disqualify the peer that served the offending block; its
                // remaining queued blocks are purged along the way.
                let offender = match &err {
                    ChainError::InvalidBlock { number, .. } => results
                        .iter()
                        .find(|r| r.block.number() == *number)
                        .map(|r| r.stream_id.clone()),
                    _ => None,
                }
                .or_else(|| results.first().map(|r| r.stream_id.clone()));
                if let Some(stid) = offender {
                    error!(stream = %stid, error = %err, "chain insert failed; disqualifying peer");
                    self.dl.disqualify(&stid);
                }
                self.abort.cancel();
                Err(SyncError::Chain(err))
            }
        }
    }
}

/// Check a blocks-by-number reply against the request: every slot filled,
/// every number the one asked for.
fn validate_batch(requested: &[u64], blocks: Vec<Option<Block>>) -> Result<Vec<Block>, &'static str> {
    if blocks.len() != requested.len() {
        return Err("reply length does not match request");
    }
    let mut out = Vec::with_capacity(blocks.len());
    for (bn, block) in requested.iter().zip(blocks) {
        let Some(block) = block else {
            return Err("peer is missing a requested block");
        };
        if block.number() != *bn {
            return Err("block number does not match request");
        }
        out.push(block);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Header;
    use bytes::Bytes;
    use kestrel_stream::BlockHash;

    fn make_block(number: u64) -> Block {
        Block::new(
            Header {
                number,
                epoch: 0,
                timestamp: number,
                hash: BlockHash([number as u8; 32]),
                parent_hash: BlockHash::ZERO,
            },
            Bytes::new(),
        )
    }

    #[test]
    fn test_validate_batch_accepts_exact_reply() {
        let requested = vec![4, 5, 6];
        let blocks = requested.iter().map(|bn| Some(make_block(*bn))).collect();
        let validated = validate_batch(&requested, blocks).unwrap();
        assert_eq!(validated.len(), 3);
    }

    #[test]
    fn test_validate_batch_rejects_holes_and_mismatches() {
        let requested = vec![4, 5];
        assert!(validate_batch(&requested, vec![Some(make_block(4)), None]).is_err());
        assert!(validate_batch(&requested, vec![Some(make_block(4))]).is_err());
        assert!(
            validate_batch(&requested, vec![Some(make_block(4)), Some(make_block(9))]).is_err()
        );
    }
}
