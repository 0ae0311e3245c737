//! Shared identifiers and the registered stream record.

use crate::error::{StreamError, StreamResult};
use crate::message::Message;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Unique identifier of a peer stream. Stable for the stream's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(String);

impl StreamId {
    /// Create a stream ID from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// 32-byte block hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    /// The all-zero hash, used on the wire for unknown block numbers.
    pub const ZERO: BlockHash = BlockHash([0u8; 32]);

    /// Whether this is the all-zero placeholder hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl std::fmt::Display for BlockHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for BlockHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Negotiated protocol descriptor in its raw string form:
/// `<service>/<major>.<minor>.<patch>/<network>/<shard>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtoId(String);

impl ProtoId {
    /// Wrap a raw protocol ID string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse into a structured spec.
    pub fn spec(&self) -> StreamResult<ProtoSpec> {
        ProtoSpec::parse(&self.0)
    }
}

impl std::fmt::Display for ProtoId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Protocol version triple. Compatibility is semver style: same major,
/// and the candidate is not older than the required minimum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProtoVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ProtoVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Whether a peer running `self` can serve a client requiring at
    /// least `min`.
    pub fn is_compatible_with(&self, min: &ProtoVersion) -> bool {
        self.major == min.major && self >= min
    }
}

impl std::fmt::Display for ProtoVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Parsed protocol descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtoSpec {
    /// Service name, e.g. "sync".
    pub service: String,
    /// Protocol version.
    pub version: ProtoVersion,
    /// Network name, e.g. "mainnet".
    pub network: String,
    /// Shard identifier.
    pub shard: u32,
}

impl ProtoSpec {
    /// Parse a `<service>/<x>.<y>.<z>/<network>/<shard>` descriptor.
    pub fn parse(raw: &str) -> StreamResult<Self> {
        let invalid = || StreamError::UnsupportedProtocol(raw.to_string());

        let mut parts = raw.split('/');
        let service = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
        let version = parts.next().ok_or_else(invalid)?;
        let network = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
        let shard = parts.next().ok_or_else(invalid)?;
        if parts.next().is_some() {
            return Err(invalid());
        }

        let mut nums = version.split('.').map(|v| v.parse::<u32>().ok());
        let major = nums.next().flatten().ok_or_else(invalid)?;
        let minor = nums.next().flatten().ok_or_else(invalid)?;
        let patch = nums.next().flatten().ok_or_else(invalid)?;
        if nums.next().is_some() {
            return Err(invalid());
        }

        Ok(Self {
            service: service.to_string(),
            version: ProtoVersion::new(major, minor, patch),
            network: network.to_string(),
            shard: shard.parse().map_err(|_| invalid())?,
        })
    }

    /// Format back into the raw descriptor.
    pub fn to_proto_id(&self) -> ProtoId {
        ProtoId::new(format!(
            "{}/{}/{}/{}",
            self.service, self.version, self.network, self.shard
        ))
    }
}

/// A registered peer stream.
///
/// The handle is the stream manager's record of a live peer: it carries the
/// outbound frame queue into the peer's writer task and the close trigger
/// observed by all of the peer's tasks. Close is idempotent; the first call
/// wins and everything afterwards is a no-op.
#[derive(Debug)]
pub struct StreamHandle {
    id: StreamId,
    proto_id: ProtoId,
    outbound: mpsc::Sender<Message>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl StreamHandle {
    /// Create a handle over the peer's outbound message queue.
    pub fn new(id: StreamId, proto_id: ProtoId, outbound: mpsc::Sender<Message>) -> Self {
        Self {
            id,
            proto_id,
            outbound,
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// The stream's unique ID.
    pub fn id(&self) -> &StreamId {
        &self.id
    }

    /// The negotiated protocol descriptor.
    pub fn proto_id(&self) -> &ProtoId {
        &self.proto_id
    }

    /// Parse the protocol descriptor.
    pub fn proto_spec(&self) -> StreamResult<ProtoSpec> {
        self.proto_id.spec()
    }

    /// Queue a message for the peer's writer task.
    ///
    /// Fails with `ConnectionClosed` once the peer tasks have torn down.
    pub async fn send_message(&self, msg: Message) -> StreamResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StreamError::ConnectionClosed);
        }
        self.outbound
            .send(msg)
            .await
            .map_err(|_| StreamError::ConnectionClosed)
    }

    /// Trigger teardown of the peer's tasks. Safe to call any number of
    /// times; only the first call has an effect.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.cancel.cancel();
        }
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Token cancelled when the stream closes. Peer tasks select on this.
    pub fn closed_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
