//! Chain collaborator interface.
//!
//! The sync subsystem never validates or stores blocks itself; everything it
//! needs from the node's chain goes through this trait, which keeps the
//! service logic and the download pipeline testable against a mock.

use crate::block::{Block, Header};
use crate::error::ChainError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use kestrel_stream::BlockHash;

/// Static chain parameters.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// Network name, e.g. "mainnet".
    pub network: String,
    /// Shard this chain belongs to; shard 0 is the beacon chain.
    pub shard_id: u32,
    /// Blocks per epoch, fixed by the schedule.
    pub blocks_per_epoch: u64,
}

impl ChainConfig {
    /// Last block number of the given epoch.
    pub fn epoch_last_block(&self, epoch: u64) -> u64 {
        (epoch + 1) * self.blocks_per_epoch - 1
    }
}

/// The chain collaborator. Errors surface unchanged to the pipeline.
pub trait Chain: Send + Sync {
    /// Current tip block number.
    fn current_number(&self) -> u64;

    /// Header at the given number, if known.
    fn header_by_number(&self, number: u64) -> Option<Header>;

    /// Header with the given hash, if known.
    fn header_by_hash(&self, hash: &BlockHash) -> Option<Header>;

    /// Full block by hash and number, if known.
    fn block(&self, hash: &BlockHash, number: u64) -> Option<Block>;

    /// Aggregate commit signature stored for the given number.
    fn read_commit_sig(&self, number: u64) -> Result<Bytes, ChainError>;

    /// Serialized shard state for the given epoch.
    fn read_shard_state(&self, epoch: u64) -> Result<Bytes, ChainError>;

    /// Insert a contiguous run of blocks. Returns the count inserted; the
    /// error names the offending block.
    fn insert_chain(&self, blocks: Vec<Block>) -> Result<usize, ChainError>;

    /// Static chain parameters.
    fn config(&self) -> &ChainConfig;
}

/// Service-side adapter over the chain trait.
///
/// Computes the wire answers for inbound sync requests: zero hashes and
/// empty blobs stand in for entities the chain does not have.
pub struct ChainHelper {
    chain: std::sync::Arc<dyn Chain>,
}

impl ChainHelper {
    pub fn new(chain: std::sync::Arc<dyn Chain>) -> Self {
        Self { chain }
    }

    /// The wrapped chain.
    pub fn chain(&self) -> &std::sync::Arc<dyn Chain> {
        &self.chain
    }

    /// One hash per requested number; zero hash for unknown numbers.
    pub fn get_block_hashes(&self, bns: &[u64]) -> Vec<BlockHash> {
        bns.iter()
            .map(|bn| {
                self.chain
                    .header_by_number(*bn)
                    .map(|h| h.hash)
                    .unwrap_or(BlockHash::ZERO)
            })
            .collect()
    }

    /// One encoded block per requested number; empty blob for unknown.
    pub fn get_blocks_by_number(&self, bns: &[u64]) -> Result<Vec<Bytes>, ChainError> {
        bns.iter()
            .map(|bn| match self.chain.header_by_number(*bn) {
                Some(header) => self.block_with_sig(&header),
                None => Ok(Bytes::new()),
            })
            .collect()
    }

    /// One encoded block per requested hash; empty blob for unknown.
    pub fn get_blocks_by_hashes(&self, hashes: &[BlockHash]) -> Result<Vec<Bytes>, ChainError> {
        hashes
            .iter()
            .map(|hash| match self.chain.header_by_hash(hash) {
                Some(header) => self.block_with_sig(&header),
                None => Ok(Bytes::new()),
            })
            .collect()
    }

    fn block_with_sig(&self, header: &Header) -> Result<Bytes, ChainError> {
        let Some(mut block) = self.chain.block(&header.hash, header.number) else {
            return Ok(Bytes::new());
        };
        let sig = self.chain.read_commit_sig(header.number)?;
        if !sig.is_empty() {
            block.set_commit_sig(sig);
        }
        Ok(block.encode())
    }

    /// Epoch state for an epoch: the last header of the previous epoch plus
    /// the shard state committed there. Served only by the beacon chain.
    pub fn get_epoch_state(&self, epoch: u64) -> Result<EpochState, ChainError> {
        let config = self.chain.config();
        if config.shard_id != 0 {
            return Err(ChainError::NotFound(
                "epoch state unavailable on side chains".into(),
            ));
        }
        if epoch == 0 {
            return Err(ChainError::NotFound("no shard state for epoch 0".into()));
        }
        let target = config.epoch_last_block(epoch - 1);
        let header = self
            .chain
            .header_by_number(target)
            .ok_or_else(|| ChainError::NotFound(format!("epoch {} not reached", epoch)))?;
        let shard_state = self.chain.read_shard_state(epoch)?;
        Ok(EpochState {
            header,
            shard_state,
        })
    }
}

/// Epoch state served to syncing peers: the last header of the previous
/// epoch plus the shard state committed there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochState {
    pub header: Header,
    pub shard_state: Bytes,
}

impl EpochState {
    /// Encode into the opaque wire form.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.header.encode_into(&mut buf);
        buf.put_u32_le(self.shard_state.len() as u32);
        buf.put_slice(&self.shard_state);
        buf.freeze()
    }

    /// Decode from the opaque wire form.
    pub fn decode(mut buf: Bytes) -> crate::error::SyncResult<Self> {
        let header = Header::decode_from(&mut buf)?;
        if buf.remaining() < 4 {
            return Err(crate::error::SyncError::InvalidBlockData(
                "truncated epoch state".into(),
            ));
        }
        let len = buf.get_u32_le() as usize;
        if buf.remaining() < len {
            return Err(crate::error::SyncError::InvalidBlockData(
                "truncated epoch state".into(),
            ));
        }
        let shard_state = buf.copy_to_bytes(len);
        Ok(Self {
            header,
            shard_state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_last_block() {
        let config = ChainConfig {
            network: "testnet".to_string(),
            shard_id: 0,
            blocks_per_epoch: 32,
        };
        assert_eq!(config.epoch_last_block(0), 31);
        assert_eq!(config.epoch_last_block(3), 127);
    }

    #[test]
    fn test_epoch_state_roundtrip() {
        let state = EpochState {
            header: Header {
                number: 31,
                epoch: 0,
                timestamp: 1_700_000_000,
                hash: BlockHash([7u8; 32]),
                parent_hash: BlockHash([6u8; 32]),
            },
            shard_state: Bytes::from_static(b"shard state bytes"),
        };
        assert_eq!(EpochState::decode(state.encode()).unwrap(), state);
    }
}
