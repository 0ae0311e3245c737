//! Wire envelope for the sync protocol.
//!
//! Each frame payload carries exactly one envelope: a request or a response,
//! both tagged with the 64-bit correlation ID assigned by the request
//! manager. Block bodies travel as opaque byte blobs; their codec belongs to
//! the chain layer.

use crate::error::{StreamError, StreamResult};
use crate::types::BlockHash;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Maximum block numbers per `GetBlockHashes` request.
pub const GET_BLOCK_HASHES_CAP: usize = 20;
/// Maximum block numbers per `GetBlocksByNumber` request.
pub const GET_BLOCKS_BY_NUM_CAP: usize = 10;
/// Maximum hashes per `GetBlocksByHashes` request.
pub const GET_BLOCKS_BY_HASHES_CAP: usize = 10;

const TAG_REQUEST: u8 = 0x01;
const TAG_RESPONSE: u8 = 0x02;

const RESP_ERROR: u8 = 0x00;

/// Request kind identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestKind {
    /// Current tip block number of the serving peer.
    BlockNumber = 1,
    /// Block hashes for a list of block numbers.
    BlockHashes = 2,
    /// Full blocks for a list of block numbers.
    BlocksByNumber = 3,
    /// Full blocks for a list of block hashes.
    BlocksByHashes = 4,
    /// Epoch state (header + shard state) for an epoch.
    EpochState = 5,
}

impl TryFrom<u8> for RequestKind {
    type Error = StreamError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(RequestKind::BlockNumber),
            2 => Ok(RequestKind::BlockHashes),
            3 => Ok(RequestKind::BlocksByNumber),
            4 => Ok(RequestKind::BlocksByHashes),
            5 => Ok(RequestKind::EpochState),
            _ => Err(StreamError::InvalidMessage(format!(
                "unknown request kind: {}",
                value
            ))),
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RequestKind::BlockNumber => "GetBlockNumber",
            RequestKind::BlockHashes => "GetBlockHashes",
            RequestKind::BlocksByNumber => "GetBlocksByNumber",
            RequestKind::BlocksByHashes => "GetBlocksByHashes",
            RequestKind::EpochState => "GetEpochState",
        };
        write!(f, "{}", name)
    }
}

/// Error codes carried in typed error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    /// The request kind is not supported by the serving peer.
    UnknownRequestKind = 1,
    /// The request exceeds a per-call cap.
    CapExceeded = 2,
    /// The requested entity does not exist on the serving peer.
    NotFound = 3,
    /// The serving peer failed internally.
    ServerError = 4,
}

impl TryFrom<u32> for ErrorCode {
    type Error = StreamError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ErrorCode::UnknownRequestKind),
            2 => Ok(ErrorCode::CapExceeded),
            3 => Ok(ErrorCode::NotFound),
            4 => Ok(ErrorCode::ServerError),
            _ => Err(StreamError::InvalidMessage(format!(
                "unknown error code: {}",
                value
            ))),
        }
    }
}

/// Request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPayload {
    GetBlockNumber,
    GetBlockHashes(Vec<u64>),
    GetBlocksByNumber(Vec<u64>),
    GetBlocksByHashes(Vec<BlockHash>),
    GetEpochState(u64),
}

impl RequestPayload {
    /// The kind tag of this payload.
    pub fn kind(&self) -> RequestKind {
        match self {
            RequestPayload::GetBlockNumber => RequestKind::BlockNumber,
            RequestPayload::GetBlockHashes(_) => RequestKind::BlockHashes,
            RequestPayload::GetBlocksByNumber(_) => RequestKind::BlocksByNumber,
            RequestPayload::GetBlocksByHashes(_) => RequestKind::BlocksByHashes,
            RequestPayload::GetEpochState(_) => RequestKind::EpochState,
        }
    }
}

/// A request envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Correlation ID, assigned per send attempt by the request manager.
    pub req_id: u64,
    /// Request body.
    pub payload: RequestPayload,
}

impl Request {
    pub fn new(req_id: u64, payload: RequestPayload) -> Self {
        Self { req_id, payload }
    }
}

/// Response body. Mirrors the request kinds, plus the typed error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePayload {
    BlockNumber(u64),
    /// One hash per requested number; zero hash for unknown numbers.
    BlockHashes(Vec<BlockHash>),
    /// One opaque encoded block per requested number; empty for unknown.
    BlocksByNumber(Vec<Bytes>),
    /// One opaque encoded block per requested hash; empty for unknown.
    BlocksByHashes(Vec<Bytes>),
    /// Opaque encoded epoch state.
    EpochState(Bytes),
    /// Typed error reply.
    Error { code: ErrorCode, message: String },
}

impl ResponsePayload {
    /// The request kind this response answers, if it is not an error.
    pub fn kind(&self) -> Option<RequestKind> {
        match self {
            ResponsePayload::BlockNumber(_) => Some(RequestKind::BlockNumber),
            ResponsePayload::BlockHashes(_) => Some(RequestKind::BlockHashes),
            ResponsePayload::BlocksByNumber(_) => Some(RequestKind::BlocksByNumber),
            ResponsePayload::BlocksByHashes(_) => Some(RequestKind::BlocksByHashes),
            ResponsePayload::EpochState(_) => Some(RequestKind::EpochState),
            ResponsePayload::Error { .. } => None,
        }
    }
}

/// A response envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Correlation ID copied from the request.
    pub req_id: u64,
    /// Response body.
    pub payload: ResponsePayload,
}

impl Response {
    pub fn new(req_id: u64, payload: ResponsePayload) -> Self {
        Self { req_id, payload }
    }

    /// Build a typed error reply.
    pub fn error(req_id: u64, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            req_id,
            payload: ResponsePayload::Error {
                code,
                message: message.into(),
            },
        }
    }
}

/// The envelope: exactly one of request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    /// Encode into a frame payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Message::Request(req) => {
                buf.put_u8(TAG_REQUEST);
                buf.put_u64_le(req.req_id);
                buf.put_u8(req.payload.kind() as u8);
                match &req.payload {
                    RequestPayload::GetBlockNumber => {}
                    RequestPayload::GetBlockHashes(nums)
                    | RequestPayload::GetBlocksByNumber(nums) => put_u64_list(&mut buf, nums),
                    RequestPayload::GetBlocksByHashes(hashes) => put_hash_list(&mut buf, hashes),
                    RequestPayload::GetEpochState(epoch) => buf.put_u64_le(*epoch),
                }
            }
            Message::Response(resp) => {
                buf.put_u8(TAG_RESPONSE);
                buf.put_u64_le(resp.req_id);
                match &resp.payload {
                    ResponsePayload::Error { code, message } => {
                        buf.put_u8(RESP_ERROR);
                        buf.put_u32_le(*code as u32);
                        put_bytes(&mut buf, message.as_bytes());
                    }
                    ResponsePayload::BlockNumber(bn) => {
                        buf.put_u8(RequestKind::BlockNumber as u8);
                        buf.put_u64_le(*bn);
                    }
                    ResponsePayload::BlockHashes(hashes) => {
                        buf.put_u8(RequestKind::BlockHashes as u8);
                        put_hash_list(&mut buf, hashes);
                    }
                    ResponsePayload::BlocksByNumber(blocks) => {
                        buf.put_u8(RequestKind::BlocksByNumber as u8);
                        put_blob_list(&mut buf, blocks);
                    }
                    ResponsePayload::BlocksByHashes(blocks) => {
                        buf.put_u8(RequestKind::BlocksByHashes as u8);
                        put_blob_list(&mut buf, blocks);
                    }
                    ResponsePayload::EpochState(data) => {
                        buf.put_u8(RequestKind::EpochState as u8);
                        put_bytes(&mut buf, data);
                    }
                }
            }
        }
        buf.freeze()
    }

    /// Decode a frame payload.
    pub fn decode(mut buf: Bytes) -> StreamResult<Self> {
        let tag = get_u8(&mut buf)?;
        let req_id = get_u64(&mut buf)?;
        match tag {
            TAG_REQUEST => {
                let kind = RequestKind::try_from(get_u8(&mut buf)?)?;
                let payload = match kind {
                    RequestKind::BlockNumber => RequestPayload::GetBlockNumber,
                    RequestKind::BlockHashes => RequestPayload::GetBlockHashes(get_u64_list(&mut buf)?),
                    RequestKind::BlocksByNumber => {
                        RequestPayload::GetBlocksByNumber(get_u64_list(&mut buf)?)
                    }
                    RequestKind::BlocksByHashes => {
                        RequestPayload::GetBlocksByHashes(get_hash_list(&mut buf)?)
                    }
                    RequestKind::EpochState => RequestPayload::GetEpochState(get_u64(&mut buf)?),
                };
                ensure_drained(&buf)?;
                Ok(Message::Request(Request { req_id, payload }))
            }
            TAG_RESPONSE => {
                let kind = get_u8(&mut buf)?;
                let payload = if kind == RESP_ERROR {
                    let code = ErrorCode::try_from(get_u32(&mut buf)?)?;
                    let message = String::from_utf8_lossy(&get_bytes(&mut buf)?).to_string();
                    ResponsePayload::Error { code, message }
                } else {
                    match RequestKind::try_from(kind)? {
                        RequestKind::BlockNumber => ResponsePayload::BlockNumber(get_u64(&mut buf)?),
                        RequestKind::BlockHashes => {
                            ResponsePayload::BlockHashes(get_hash_list(&mut buf)?)
                        }
                        RequestKind::BlocksByNumber => {
                            ResponsePayload::BlocksByNumber(get_blob_list(&mut buf)?)
                        }
                        RequestKind::BlocksByHashes => {
                            ResponsePayload::BlocksByHashes(get_blob_list(&mut buf)?)
                        }
                        RequestKind::EpochState => ResponsePayload::EpochState(get_bytes(&mut buf)?),
                    }
                };
                ensure_drained(&buf)?;
                Ok(Message::Response(Response { req_id, payload }))
            }
            other => Err(StreamError::InvalidMessage(format!(
                "unknown envelope tag: {}",
                other
            ))),
        }
    }
}

fn ensure_drained(buf: &Bytes) -> StreamResult<()> {
    if buf.has_remaining() {
        return Err(StreamError::InvalidMessage(format!(
            "{} trailing bytes after envelope",
            buf.remaining()
        )));
    }
    Ok(())
}

fn get_u8(buf: &mut Bytes) -> StreamResult<u8> {
    if buf.remaining() < 1 {
        return Err(StreamError::InvalidMessage("truncated envelope".into()));
    }
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut Bytes) -> StreamResult<u32> {
    if buf.remaining() < 4 {
        return Err(StreamError::InvalidMessage("truncated envelope".into()));
    }
    Ok(buf.get_u32_le())
}

fn get_u64(buf: &mut Bytes) -> StreamResult<u64> {
    if buf.remaining() < 8 {
        return Err(StreamError::InvalidMessage("truncated envelope".into()));
    }
    Ok(buf.get_u64_le())
}

fn put_u64_list(buf: &mut BytesMut, nums: &[u64]) {
    buf.put_u32_le(nums.len() as u32);
    for bn in nums {
        buf.put_u64_le(*bn);
    }
}

fn get_u64_list(buf: &mut Bytes) -> StreamResult<Vec<u64>> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len * 8 {
        return Err(StreamError::InvalidMessage("truncated number list".into()));
    }
    (0..len).map(|_| get_u64(buf)).collect()
}

fn put_hash_list(buf: &mut BytesMut, hashes: &[BlockHash]) {
    buf.put_u32_le(hashes.len() as u32);
    for h in hashes {
        buf.put_slice(&h.0);
    }
}

fn get_hash_list(buf: &mut Bytes) -> StreamResult<Vec<BlockHash>> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len * 32 {
        return Err(StreamError::InvalidMessage("truncated hash list".into()));
    }
    let mut hashes = Vec::with_capacity(len);
    for _ in 0..len {
        let mut h = [0u8; 32];
        buf.copy_to_slice(&mut h);
        hashes.push(BlockHash(h));
    }
    Ok(hashes)
}

fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
}

fn get_bytes(buf: &mut Bytes) -> StreamResult<Bytes> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(StreamError::InvalidMessage("truncated byte blob".into()));
    }
    Ok(buf.copy_to_bytes(len))
}

fn put_blob_list(buf: &mut BytesMut, blobs: &[Bytes]) {
    buf.put_u32_le(blobs.len() as u32);
    for b in blobs {
        put_bytes(buf, b);
    }
}

fn get_blob_list(buf: &mut Bytes) -> StreamResult<Vec<Bytes>> {
    let len = get_u32(buf)? as usize;
    (0..len).map(|_| get_bytes(buf)).collect()
}
