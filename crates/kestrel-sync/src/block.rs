//! Block and header types.
//!
//! Blocks travel the wire as opaque byte blobs; this module owns their
//! binary codec. Validation belongs to the chain collaborator.

use crate::error::{SyncError, SyncResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use kestrel_stream::BlockHash;

/// Block header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub number: u64,
    pub epoch: u64,
    pub timestamp: u64,
    pub hash: BlockHash,
    pub parent_hash: BlockHash,
}

impl Header {
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.number);
        buf.put_u64_le(self.epoch);
        buf.put_u64_le(self.timestamp);
        buf.put_slice(&self.hash.0);
        buf.put_slice(&self.parent_hash.0);
    }

    pub fn decode_from(buf: &mut Bytes) -> SyncResult<Self> {
        if buf.remaining() < 8 * 3 + 32 * 2 {
            return Err(SyncError::InvalidBlockData("truncated header".into()));
        }
        let number = buf.get_u64_le();
        let epoch = buf.get_u64_le();
        let timestamp = buf.get_u64_le();
        let mut hash = [0u8; 32];
        buf.copy_to_slice(&mut hash);
        let mut parent = [0u8; 32];
        buf.copy_to_slice(&mut parent);
        Ok(Self {
            number,
            epoch,
            timestamp,
            hash: BlockHash(hash),
            parent_hash: BlockHash(parent),
        })
    }
}

/// A full block: header, aggregate commit signature, and the opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: Header,
    pub commit_sig: Bytes,
    pub body: Bytes,
}

impl Block {
    pub fn new(header: Header, body: Bytes) -> Self {
        Self {
            header,
            commit_sig: Bytes::new(),
            body,
        }
    }

    /// Block number shorthand.
    pub fn number(&self) -> u64 {
        self.header.number
    }

    /// Block hash shorthand.
    pub fn hash(&self) -> BlockHash {
        self.header.hash
    }

    /// Attach the aggregate commit signature read from chain storage.
    pub fn set_commit_sig(&mut self, sig: Bytes) {
        self.commit_sig = sig;
    }

    /// Encode into the opaque wire form.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.header.encode_into(&mut buf);
        buf.put_u32_le(self.commit_sig.len() as u32);
        buf.put_slice(&self.commit_sig);
        buf.put_u32_le(self.body.len() as u32);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// Decode from the opaque wire form.
    pub fn decode(mut buf: Bytes) -> SyncResult<Self> {
        let header = Header::decode_from(&mut buf)?;
        let commit_sig = get_blob(&mut buf)?;
        let body = get_blob(&mut buf)?;
        if buf.has_remaining() {
            return Err(SyncError::InvalidBlockData(
                "trailing bytes after block".into(),
            ));
        }
        Ok(Self {
            header,
            commit_sig,
            body,
        })
    }
}

fn get_blob(buf: &mut Bytes) -> SyncResult<Bytes> {
    if buf.remaining() < 4 {
        return Err(SyncError::InvalidBlockData("truncated block".into()));
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(SyncError::InvalidBlockData("truncated block".into()));
    }
    Ok(buf.copy_to_bytes(len))
}
