//! Short-range sync session.
//!
//! For the last mile the pipeline does not trust a single peer: it asks
//! several peers for the hashes of the next window of heights, keeps the
//! majority-agreed hash per height, and only then fans out blocks-by-hashes
//! requests for the agreed chain.

use crate::block::Block;
use crate::downloader::Downloader;
use crate::error::{ChainError, SyncError, SyncResult};
use crate::{
    BLOCKS_PER_INSERT, NUM_BLOCKS_BY_HASHES_LOWER_CAP, NUM_BLOCKS_BY_HASHES_UPPER_CAP,
    NUM_BLOCK_HASHES_PER_REQUEST,
};
use kestrel_stream::{BlockHash, StreamId};
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

/// Peers polled for the hash vote.
const HASH_VOTE_PEERS: usize = 3;
/// Deadline for one client call, retries included.
const REQUEST_DEADLINE: Duration = Duration::from_secs(20);

/// Run one short-range session. Returns blocks inserted.
pub(crate) async fn run(dl: &Downloader) -> SyncResult<u64> {
    let current = dl.chain().current_number();
    let window: Vec<u64> = (1..=NUM_BLOCK_HASHES_PER_REQUEST as u64)
        .map(|offset| current + offset)
        .collect();

    let votes = collect_hash_votes(dl, &window).await?;
    let hashes = majority_hashes(&votes);
    if hashes.is_empty() {
        debug!(current, "no majority-agreed hashes; nothing to fetch");
        return Ok(0);
    }

    let results = fetch_agreed_blocks(dl, &hashes).await;
    insert_contiguous(dl, current, results)
}

/// Ask several peers for the hash window. Distinct streams answer because a
/// busy stream cannot take a second request.
async fn collect_hash_votes(
    dl: &Downloader,
    window: &[u64],
) -> SyncResult<Vec<(Vec<BlockHash>, StreamId)>> {
    let voters = dl
        .stream_manager()
        .num_streams()
        .min(HASH_VOTE_PEERS)
        .max(1);

    let mut set = JoinSet::new();
    for _ in 0..voters {
        let protocol = dl.protocol().clone();
        let window = window.to_vec();
        set.spawn(async move {
            tokio::time::timeout(REQUEST_DEADLINE, protocol.get_block_hashes(&window)).await
        });
    }

    let mut votes: Vec<(Vec<BlockHash>, StreamId)> = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(Ok((hashes, stid)))) => {
                // One vote per stream; a repeat answer changes nothing.
                if votes.iter().all(|(_, voted)| *voted != stid) {
                    votes.push((hashes, stid));
                }
            }
            Ok(Ok(Err(err))) => warn!(error = %err, "hash request failed"),
            Ok(Err(_)) => warn!("hash request deadline exceeded"),
            Err(_) => {}
        }
    }
    if votes.is_empty() {
        return Err(SyncError::Stalled("no peer answered the hash vote".into()));
    }
    Ok(votes)
}

/// Majority-agreed hash per height, stopping at the first height without a
/// strict majority. Zero hashes (peer does not know the height) never win.
pub(crate) fn majority_hashes(votes: &[(Vec<BlockHash>, StreamId)]) -> Vec<BlockHash> {
    let total = votes.len();
    let window = votes.iter().map(|(hashes, _)| hashes.len()).max().unwrap_or(0);

    let mut agreed = Vec::new();
    for height in 0..window {
        let mut counts: HashMap<BlockHash, usize> = HashMap::new();
        for (hashes, _) in votes {
            if let Some(hash) = hashes.get(height) {
                if !hash.is_zero() {
                    *counts.entry(*hash).or_default() += 1;
                }
            }
        }
        let winner = counts
            .into_iter()
            .filter(|(_, count)| count * 2 > total)
            .max_by_key(|(_, count)| *count)
            .map(|(hash, _)| hash);
        match winner {
            Some(hash) => agreed.push(hash),
            None => break,
        }
    }
    agreed
}

/// Slice the agreed hashes into fan-out chunks sized within the caps. A
/// window smaller than the lower cap goes out as one small request.
pub(crate) fn chunk_hashes(hashes: &[BlockHash], upper: usize) -> Vec<Vec<BlockHash>> {
    if hashes.is_empty() {
        return Vec::new();
    }
    let chunks = hashes.len().div_ceil(upper);
    let base = hashes.len() / chunks;
    let remainder = hashes.len() % chunks;

    let mut out = Vec::with_capacity(chunks);
    let mut start = 0;
    for i in 0..chunks {
        let size = base + usize::from(i < remainder);
        out.push(hashes[start..start + size].to_vec());
        start += size;
    }
    out
}

/// Fetch the agreed blocks chunk by chunk. Failed chunks are dropped; the
/// serving peer of an unusable chunk collects a demerit.
async fn fetch_agreed_blocks(
    dl: &Downloader,
    hashes: &[BlockHash],
) -> Vec<(Block, StreamId)> {
    let mut set = JoinSet::new();
    for chunk in chunk_hashes(hashes, NUM_BLOCKS_BY_HASHES_UPPER_CAP) {
        debug_assert!(
            chunk.len() <= NUM_BLOCKS_BY_HASHES_UPPER_CAP
                && (chunk.len() >= NUM_BLOCKS_BY_HASHES_LOWER_CAP
                    || hashes.len() < NUM_BLOCKS_BY_HASHES_LOWER_CAP)
        );
        let protocol = dl.protocol().clone();
        set.spawn(async move {
            let fetched =
                tokio::time::timeout(REQUEST_DEADLINE, protocol.get_blocks_by_hashes(&chunk))
                    .await;
            (chunk, fetched)
        });
    }

    let mut results: Vec<(Block, StreamId)> = Vec::new();
    while let Some(joined) = set.join_next().await {
        let Ok((chunk, fetched)) = joined else {
            continue;
        };
        match fetched {
            Ok(Ok((blocks, stid))) => match validate_chunk(&chunk, blocks) {
                Ok(blocks) => {
                    results.extend(blocks.into_iter().map(|b| (b, stid.clone())));
                }
                Err(reason) => {
                    warn!(stream = %stid, reason, "unusable chunk from peer");
                    dl.demerit(&stid);
                }
            },
            Ok(Err(err)) => warn!(error = %err, "blocks-by-hashes request failed"),
            Err(_) => warn!("blocks-by-hashes request deadline exceeded"),
        }
    }
    results
}

/// Check a blocks-by-hashes reply against the request.
fn validate_chunk(
    requested: &[BlockHash],
    blocks: Vec<Option<Block>>,
) -> Result<Vec<Block>, &'static str> {
    if blocks.len() != requested.len() {
        return Err("reply length does not match request");
    }
    let mut out = Vec::with_capacity(blocks.len());
    for (hash, block) in requested.iter().zip(blocks) {
        let Some(block) = block else {
            return Err("peer is missing an agreed block");
        };
        if block.hash() != *hash {
            return Err("block hash does not match request");
        }
        out.push(block);
    }
    Ok(out)
}

/// Insert the contiguous prefix starting right above our tip. A failure
/// disqualifies the serving peer and aborts the session.
fn insert_contiguous(
    dl: &Downloader,
    current: u64,
    mut results: Vec<(Block, StreamId)>,
) -> SyncResult<u64> {
    results.sort_by_key(|(block, _)| block.number());

    let mut prefix: Vec<(Block, StreamId)> = Vec::new();
    let mut expected = current + 1;
    for (block, stid) in results {
        if block.number() == expected {
            expected += 1;
            prefix.push((block, stid));
        } else if block.number() > expected {
            break;
        }
    }

    let mut inserted = 0u64;
    for batch in prefix.chunks(BLOCKS_PER_INSERT) {
        let blocks: Vec<Block> = batch.iter().map(|(b, _)| b.clone()).collect();
        match dl.chain().insert_chain(blocks) {
            Ok(count) => {
                dl.metrics().inserted_blocks_total.inc_by(count as u64);
                inserted += count as u64;
            }
            Err(err) => {
                dl.metrics().insert_failures_total.inc();
                let offender = match &err {
                    ChainError::InvalidBlock { number, .. } => batch
                        .iter()
                        .find(|(b, _)| b.number() == *number)
                        .map(|(_, stid)| stid.clone()),
                    _ => None,
                }
                .or_else(|| batch.first().map(|(_, stid)| stid.clone()));
                if let Some(stid) = offender {
                    error!(stream = %stid, error = %err, "chain insert failed; disqualifying peer");
                    dl.disqualify(&stid);
                }
                return Err(SyncError::Chain(err));
            }
        }
    }
    Ok(inserted)
}
