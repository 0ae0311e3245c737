//! Result queue: downloaded blocks awaiting in-order insertion.
//!
//! A min-heap keyed by block number, ties broken by insertion order. Workers
//! push out-of-order batches in; the inserter drains the longest contiguous
//! prefix out.

use crate::block::Block;
use crate::error::{SyncError, SyncResult};
use crate::QUEUE_MAX_SIZE;
use kestrel_stream::StreamId;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// A downloaded block together with the stream that served it.
#[derive(Debug, Clone)]
pub struct BlockResult {
    pub block: Block,
    pub stream_id: StreamId,
}

/// Heap entry ordered by (number, insertion sequence).
#[derive(Debug)]
struct Entry {
    result: BlockResult,
    seq: u64,
}

impl Entry {
    fn key(&self) -> (u64, u64) {
        (self.result.block.number(), self.seq)
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}

struct Inner {
    heap: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
}

/// Bounded min-heap of download results.
pub struct ResultQueue {
    inner: Mutex<Inner>,
    max_size: usize,
}

impl ResultQueue {
    pub fn new() -> Self {
        Self::with_max_size(QUEUE_MAX_SIZE)
    }

    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
            max_size,
        }
    }

    /// Add a batch of downloaded blocks from one stream.
    ///
    /// Fails with `QueueFull` when the batch would push the queue past its
    /// hard cap; the queue is left untouched in that case.
    pub fn add_block_results(
        &self,
        blocks: Vec<Block>,
        stream_id: StreamId,
    ) -> SyncResult<()> {
        let mut inner = self.inner.lock();
        if inner.heap.len() + blocks.len() > self.max_size {
            return Err(SyncError::QueueFull {
                size: inner.heap.len(),
                max: self.max_size,
            });
        }
        for block in blocks {
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.heap.push(Reverse(Entry {
                result: BlockResult {
                    block,
                    stream_id: stream_id.clone(),
                },
                seq,
            }));
        }
        Ok(())
    }

    /// Pop the longest prefix of blocks numbered `start_bn, start_bn+1, ...`
    /// up to `cap` entries. Duplicates of an already-popped number are
    /// collapsed (first in wins); a gap stops the pop.
    pub fn pop_block_results(&self, start_bn: u64, cap: usize) -> Vec<BlockResult> {
        let mut inner = self.inner.lock();
        let mut results: Vec<BlockResult> = Vec::new();
        let mut expected = start_bn;

        while results.len() < cap {
            let Some(Reverse(top)) = inner.heap.peek() else {
                break;
            };
            let number = top.result.block.number();
            if number < expected {
                // Duplicate of a number already taken (or stale below the
                // requested start); drop it.
                inner.heap.pop();
                continue;
            }
            if number > expected {
                break;
            }
            if let Some(Reverse(entry)) = inner.heap.pop() {
                results.push(entry.result);
            }
            expected += 1;
        }
        results
    }

    /// Remove every queued block served by the given stream, returning them.
    pub fn remove_by_stream_id(&self, stream_id: &StreamId) -> Vec<BlockResult> {
        let mut inner = self.inner.lock();
        let mut kept = BinaryHeap::with_capacity(inner.heap.len());
        let mut removed = Vec::new();
        for Reverse(entry) in inner.heap.drain() {
            if entry.result.stream_id == *stream_id {
                removed.push(entry.result);
            } else {
                kept.push(Reverse(entry));
            }
        }
        inner.heap = kept;
        removed
    }

    /// Current queue depth.
    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ResultQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Header;
    use bytes::Bytes;
    use kestrel_stream::BlockHash;

    fn make_block(number: u64) -> Block {
        let mut hash = [0u8; 32];
        hash[..8].copy_from_slice(&number.to_le_bytes());
        Block::new(
            Header {
                number,
                epoch: 0,
                timestamp: number,
                hash: BlockHash(hash),
                parent_hash: BlockHash::ZERO,
            },
            Bytes::new(),
        )
    }

    fn make_blocks(numbers: &[u64]) -> Vec<Block> {
        numbers.iter().copied().map(make_block).collect()
    }

    fn filled_queue(numbers: &[u64]) -> ResultQueue {
        let queue = ResultQueue::new();
        queue
            .add_block_results(make_blocks(numbers), StreamId::from("A"))
            .unwrap();
        queue
    }

    fn popped_numbers(results: &[BlockResult]) -> Vec<u64> {
        results.iter().map(|r| r.block.number()).collect()
    }

    #[test]
    fn test_pop_in_order() {
        let queue = filled_queue(&[1, 2, 3, 4, 5]);

        let first = queue.pop_block_results(1, 3);
        assert_eq!(popped_numbers(&first), vec![1, 2, 3]);

        let rest = queue.pop_block_results(4, 10);
        assert_eq!(popped_numbers(&rest), vec![4, 5]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_gap_stops_pop() {
        let queue = filled_queue(&[1, 3, 4, 5]);
        let popped = queue.pop_block_results(1, 10);
        assert_eq!(popped_numbers(&popped), vec![1]);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_pop_before_queued_range_returns_nothing() {
        let queue = filled_queue(&[1, 2, 3, 4, 5]);
        assert!(queue.pop_block_results(0, 10).is_empty());
        assert_eq!(queue.len(), 5);
    }

    #[test]
    fn test_pop_from_middle() {
        let queue = filled_queue(&[1, 2, 3, 4, 5]);
        let popped = queue.pop_block_results(2, 10);
        assert_eq!(popped_numbers(&popped), vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_duplicate_head_collapsed() {
        let queue = filled_queue(&[1, 1, 1, 1, 2]);
        let popped = queue.pop_block_results(1, 10);
        assert_eq!(popped_numbers(&popped), vec![1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_first_duplicate_wins() {
        let queue = ResultQueue::new();
        queue
            .add_block_results(make_blocks(&[7]), StreamId::from("A"))
            .unwrap();
        queue
            .add_block_results(make_blocks(&[7, 8]), StreamId::from("B"))
            .unwrap();

        let popped = queue.pop_block_results(7, 10);
        assert_eq!(popped_numbers(&popped), vec![7, 8]);
        assert_eq!(popped[0].stream_id, StreamId::from("A"));
    }

    #[test]
    fn test_remove_by_stream_id() {
        let queue = ResultQueue::new();
        queue
            .add_block_results(make_blocks(&[2, 3, 4, 5]), StreamId::from("A"))
            .unwrap();
        queue
            .add_block_results(make_blocks(&[1, 5, 6]), StreamId::from("B"))
            .unwrap();

        let removed = queue.remove_by_stream_id(&StreamId::from("A"));
        assert_eq!(removed.len(), 4);
        assert_eq!(queue.len(), 3);

        let removed = queue.remove_by_stream_id(&StreamId::from("B"));
        assert_eq!(removed.len(), 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_capacity_rejects_whole_batch() {
        let queue = ResultQueue::new();
        let preload: Vec<u64> = (0..(QUEUE_MAX_SIZE - 3) as u64).collect();
        queue
            .add_block_results(make_blocks(&preload), StreamId::from("A"))
            .unwrap();

        let err = queue
            .add_block_results(make_blocks(&[1, 2, 3, 4]), StreamId::from("A"))
            .unwrap_err();
        assert!(matches!(err, SyncError::QueueFull { .. }));
        assert_eq!(queue.len(), QUEUE_MAX_SIZE - 3);

        // A batch that fits exactly is accepted.
        queue
            .add_block_results(make_blocks(&[1, 2, 3]), StreamId::from("A"))
            .unwrap();
        assert_eq!(queue.len(), QUEUE_MAX_SIZE);
    }
}
