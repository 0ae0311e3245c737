//! Sync protocol: per-stream peer handler and typed client calls.
//!
//! Each accepted or dialled stream gets three cooperating tasks:
//! - a reader that decodes envelopes and dispatches them in arrival order,
//! - a request server that answers inbound requests behind the rate limiter,
//! - a response forwarder feeding the request manager.
//!
//! A fourth task owns the write half: every outbound message, whether a
//! request from the request manager or a reply from the request server, goes
//! through one queue so sink access stays single-writer.

use crate::block::Block;
use crate::chain::{Chain, ChainHelper, EpochState};
use crate::error::{SyncError, SyncResult};
use crate::metrics::ProtocolMetrics;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use kestrel_stream::{
    BlockHash, ErrorCode, FrameCodec, Message, ProtoId, ProtoSpec, ProtoVersion, RateLimiter,
    Request, RequestKind, RequestManager, RequestPayload, Response, ResponsePayload,
    StreamError, StreamHandle, StreamId, StreamManager, GET_BLOCKS_BY_HASHES_CAP,
    GET_BLOCKS_BY_NUM_CAP, GET_BLOCK_HASHES_CAP,
};
use prometheus::Registry;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// Service name carried in the protocol descriptor.
pub const SERVICE_NAME: &str = "sync";
/// Version we speak.
pub const PROTOCOL_VERSION: ProtoVersion = ProtoVersion::new(1, 1, 0);
/// Oldest version we can serve.
pub const MIN_VERSION: ProtoVersion = ProtoVersion::new(1, 0, 0);

/// Capacity of the per-stream request/response pipelines.
const PIPE_CAPACITY: usize = 100;
/// Capacity of the outbound write queue.
const OUTBOUND_CAPACITY: usize = 100;
/// How long the reader waits on a jammed request server before dropping.
const DISPATCH_JAM_TIMEOUT: Duration = Duration::from_secs(60);

/// The sync protocol instance shared by all peer streams.
pub struct Protocol {
    chain_helper: ChainHelper,
    stream_manager: Arc<StreamManager>,
    request_manager: Arc<RequestManager>,
    rate_limiter: Arc<RateLimiter>,
    metrics: ProtocolMetrics,
}

impl Protocol {
    pub fn new(
        chain: Arc<dyn Chain>,
        stream_manager: Arc<StreamManager>,
        request_manager: Arc<RequestManager>,
        rate_limiter: Arc<RateLimiter>,
        registry: &Registry,
    ) -> SyncResult<Arc<Self>> {
        let metrics = ProtocolMetrics::new(registry).map_err(StreamError::from)?;
        Ok(Arc::new(Self {
            chain_helper: ChainHelper::new(chain),
            stream_manager,
            request_manager,
            rate_limiter,
            metrics,
        }))
    }

    /// The protocol descriptor we advertise.
    pub fn proto_id(&self) -> ProtoId {
        let config = self.chain_helper.chain().config();
        ProtoSpec {
            service: SERVICE_NAME.to_string(),
            version: PROTOCOL_VERSION,
            network: config.network.clone(),
            shard: config.shard_id,
        }
        .to_proto_id()
    }

    /// Validate a remote protocol descriptor against ours.
    pub fn match_protocol(&self, remote: &ProtoId) -> SyncResult<ProtoSpec> {
        let spec = remote.spec()?;
        let config = self.chain_helper.chain().config();
        if spec.service != SERVICE_NAME
            || spec.network != config.network
            || spec.shard != config.shard_id
            || !spec.version.is_compatible_with(&MIN_VERSION)
        {
            return Err(StreamError::UnsupportedProtocol(remote.to_string()).into());
        }
        Ok(spec)
    }

    /// The request manager driving this protocol's client calls.
    pub fn request_manager(&self) -> &Arc<RequestManager> {
        &self.request_manager
    }

    /// Adopt a freshly handshaked duplex stream: register it and spawn its
    /// peer tasks. Returns the registered handle.
    pub fn run_stream<S>(
        self: &Arc<Self>,
        io: S,
        id: StreamId,
        remote_proto: ProtoId,
    ) -> SyncResult<Arc<StreamHandle>>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.match_protocol(&remote_proto)?;

        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let handle = Arc::new(StreamHandle::new(id, remote_proto, out_tx));
        self.stream_manager.new_stream(handle.clone())?;

        let framed = Framed::new(io, FrameCodec::new());
        tokio::spawn(run_peer(self.clone(), handle.clone(), framed, out_rx));
        Ok(handle)
    }

    // ==================== client calls ====================

    /// Query some peer's current tip block number.
    pub async fn get_current_block_number(&self) -> SyncResult<(u64, StreamId)> {
        let (resp, stid) = self
            .request_manager
            .do_request(RequestPayload::GetBlockNumber)
            .await?;
        match resp.payload {
            ResponsePayload::BlockNumber(bn) => Ok((bn, stid)),
            other => Err(unexpected(other, RequestKind::BlockNumber)),
        }
    }

    /// Query block hashes for the given numbers. Unknown numbers come back
    /// as the zero hash.
    pub async fn get_block_hashes(&self, bns: &[u64]) -> SyncResult<(Vec<BlockHash>, StreamId)> {
        check_cap(bns.len(), GET_BLOCK_HASHES_CAP)?;
        let (resp, stid) = self
            .request_manager
            .do_request(RequestPayload::GetBlockHashes(bns.to_vec()))
            .await?;
        match resp.payload {
            ResponsePayload::BlockHashes(hashes) => Ok((hashes, stid)),
            other => Err(unexpected(other, RequestKind::BlockHashes)),
        }
    }

    /// Fetch blocks by number. Unknown numbers come back as `None`.
    pub async fn get_blocks_by_number(
        &self,
        bns: &[u64],
    ) -> SyncResult<(Vec<Option<Block>>, StreamId)> {
        check_cap(bns.len(), GET_BLOCKS_BY_NUM_CAP)?;
        let (resp, stid) = self
            .request_manager
            .do_request(RequestPayload::GetBlocksByNumber(bns.to_vec()))
            .await?;
        match resp.payload {
            ResponsePayload::BlocksByNumber(blobs) => Ok((decode_blocks(blobs)?, stid)),
            other => Err(unexpected(other, RequestKind::BlocksByNumber)),
        }
    }

    /// Fetch blocks by hash. Unknown hashes come back as `None`.
    pub async fn get_blocks_by_hashes(
        &self,
        hashes: &[BlockHash],
    ) -> SyncResult<(Vec<Option<Block>>, StreamId)> {
        check_cap(hashes.len(), GET_BLOCKS_BY_HASHES_CAP)?;
        let (resp, stid) = self
            .request_manager
            .do_request(RequestPayload::GetBlocksByHashes(hashes.to_vec()))
            .await?;
        match resp.payload {
            ResponsePayload::BlocksByHashes(blobs) => Ok((decode_blocks(blobs)?, stid)),
            other => Err(unexpected(other, RequestKind::BlocksByHashes)),
        }
    }

    /// Fetch the epoch state for an epoch from a beacon peer.
    pub async fn get_epoch_state(&self, epoch: u64) -> SyncResult<(EpochState, StreamId)> {
        let (resp, stid) = self
            .request_manager
            .do_request(RequestPayload::GetEpochState(epoch))
            .await?;
        match resp.payload {
            ResponsePayload::EpochState(data) => Ok((EpochState::decode(data)?, stid)),
            other => Err(unexpected(other, RequestKind::EpochState)),
        }
    }

    // ==================== service side ====================

    /// Answer one inbound request. Cap violations and chain failures turn
    /// into typed error replies.
    fn handle_request(&self, req: Request) -> Response {
        self.metrics.served_requests_total.inc();
        let rid = req.req_id;
        let resp = match req.payload {
            RequestPayload::GetBlockNumber => Response::new(
                rid,
                ResponsePayload::BlockNumber(self.chain_helper.chain().current_number()),
            ),
            RequestPayload::GetBlockHashes(bns) => {
                if bns.len() > GET_BLOCK_HASHES_CAP {
                    cap_error(rid, bns.len(), GET_BLOCK_HASHES_CAP)
                } else {
                    Response::new(
                        rid,
                        ResponsePayload::BlockHashes(self.chain_helper.get_block_hashes(&bns)),
                    )
                }
            }
            RequestPayload::GetBlocksByNumber(bns) => {
                if bns.len() > GET_BLOCKS_BY_NUM_CAP {
                    cap_error(rid, bns.len(), GET_BLOCKS_BY_NUM_CAP)
                } else {
                    match self.chain_helper.get_blocks_by_number(&bns) {
                        Ok(blobs) => Response::new(rid, ResponsePayload::BlocksByNumber(blobs)),
                        Err(err) => {
                            Response::error(rid, ErrorCode::ServerError, err.to_string())
                        }
                    }
                }
            }
            RequestPayload::GetBlocksByHashes(hashes) => {
                if hashes.len() > GET_BLOCKS_BY_HASHES_CAP {
                    cap_error(rid, hashes.len(), GET_BLOCKS_BY_HASHES_CAP)
                } else {
                    match self.chain_helper.get_blocks_by_hashes(&hashes) {
                        Ok(blobs) => Response::new(rid, ResponsePayload::BlocksByHashes(blobs)),
                        Err(err) => {
                            Response::error(rid, ErrorCode::ServerError, err.to_string())
                        }
                    }
                }
            }
            RequestPayload::GetEpochState(epoch) => {
                match self.chain_helper.get_epoch_state(epoch) {
                    Ok(state) => Response::new(rid, ResponsePayload::EpochState(state.encode())),
                    Err(err) => Response::error(rid, ErrorCode::NotFound, err.to_string()),
                }
            }
        };
        if matches!(resp.payload, ResponsePayload::Error { .. }) {
            self.metrics.served_errors_total.inc();
        }
        resp
    }
}

fn check_cap(requested: usize, cap: usize) -> SyncResult<()> {
    if requested > cap {
        return Err(SyncError::CapExceeded { requested, cap });
    }
    Ok(())
}

fn cap_error(rid: u64, requested: usize, cap: usize) -> Response {
    Response::error(
        rid,
        ErrorCode::CapExceeded,
        format!("requested {} items, cap {}", requested, cap),
    )
}

fn unexpected(payload: ResponsePayload, expected: RequestKind) -> SyncError {
    match payload {
        ResponsePayload::Error { code, message } => SyncError::Remote { code, message },
        _ => SyncError::UnexpectedResponse { expected },
    }
}

fn decode_blocks(blobs: Vec<Bytes>) -> SyncResult<Vec<Option<Block>>> {
    blobs
        .into_iter()
        .map(|blob| {
            if blob.is_empty() {
                Ok(None)
            } else {
                Block::decode(blob).map(Some)
            }
        })
        .collect()
}

/// Drive one peer stream until it closes.
async fn run_peer<S>(
    protocol: Arc<Protocol>,
    handle: Arc<StreamHandle>,
    framed: Framed<S, FrameCodec>,
    mut out_rx: mpsc::Receiver<Message>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let id = handle.id().clone();
    let closed = handle.closed_token();
    let (mut sink, mut frames) = framed.split();
    let (req_tx, mut req_rx) = mpsc::channel::<Request>(PIPE_CAPACITY);
    let (resp_tx, mut resp_rx) = mpsc::channel::<Response>(PIPE_CAPACITY);

    // Writer: sole owner of the sink.
    let writer = {
        let handle = handle.clone();
        let closed = closed.clone();
        let metrics = protocol.metrics.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    maybe = out_rx.recv() => match maybe {
                        Some(msg) => {
                            let frame = msg.encode();
                            metrics.bytes_out_total.inc_by(frame.len() as u64);
                            if let Err(err) = sink.send(frame).await {
                                warn!(stream = %handle.id(), error = %err, "write failed; closing stream");
                                handle.close();
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
            // Reset the transport so the remote observes EOF.
            let _ = sink.close().await;
        })
    };

    // Request server: rate limit, serve, reply.
    let server = {
        let protocol = protocol.clone();
        let handle = handle.clone();
        let closed = closed.clone();
        tokio::spawn(async move {
            loop {
                let req = tokio::select! {
                    _ = closed.cancelled() => break,
                    maybe = req_rx.recv() => match maybe {
                        Some(req) => req,
                        None => break,
                    }
                };
                tokio::select! {
                    _ = closed.cancelled() => break,
                    _ = protocol.rate_limiter.limit_request(handle.id()) => {}
                }
                let resp = protocol.handle_request(req);
                if handle.send_message(Message::Response(resp)).await.is_err() {
                    break;
                }
            }
        })
    };

    // Response forwarder: hand replies to the request manager.
    let forwarder = {
        let protocol = protocol.clone();
        let id = id.clone();
        let closed = closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    maybe = resp_rx.recv() => match maybe {
                        Some(resp) => {
                            protocol
                                .request_manager
                                .deliver_response(id.clone(), resp)
                                .await;
                        }
                        None => break,
                    }
                }
            }
        })
    };

    // Reader: this task. Messages are dispatched in arrival order.
    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            maybe = frames.next() => match maybe {
                Some(Ok(frame)) => frame,
                Some(Err(err)) => {
                    warn!(stream = %id, error = %err, "read failed; closing stream");
                    break;
                }
                None => {
                    debug!(stream = %id, "stream closed by peer");
                    break;
                }
            }
        };
        protocol.metrics.bytes_in_total.inc_by(frame.len() as u64);
        match Message::decode(frame) {
            Ok(Message::Request(req)) => {
                match tokio::time::timeout(DISPATCH_JAM_TIMEOUT, req_tx.send(req)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => break,
                    Err(_) => {
                        warn!(stream = %id, "request server jammed; dropping request");
                    }
                }
            }
            Ok(Message::Response(resp)) => {
                match tokio::time::timeout(DISPATCH_JAM_TIMEOUT, resp_tx.send(resp)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => break,
                    Err(_) => {
                        warn!(stream = %id, "response forwarder jammed; dropping response");
                    }
                }
            }
            Err(err) => {
                warn!(stream = %id, error = %err, "malformed message; closing stream");
                break;
            }
        }
    }

    handle.close();
    match protocol.stream_manager.remove_stream(&id) {
        Ok(_) => {}
        // Removal may have been what triggered the close.
        Err(StreamError::StreamNotFound(_)) => {}
        Err(err) => warn!(stream = %id, error = %err, "failed to remove stream"),
    }
    protocol.rate_limiter.remove_stream(&id);
    let _ = tokio::join!(writer, server, forwarder);
    info!(stream = %id, "peer stream torn down");
}
