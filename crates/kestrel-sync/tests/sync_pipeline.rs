//! End-to-end tests: two protocol instances wired over in-memory duplex
//! streams, one serving its chain to the other.

use bytes::Bytes;
use kestrel_stream::{
    BlockHash, ErrorCode, RateLimiter, RateLimiterConfig, RequestManager, RequestManagerConfig,
    RequestPayload, ResponsePayload, StreamId, StreamManager, StreamManagerConfig,
};
use kestrel_sync::{
    Block, Chain, ChainConfig, ChainError, Downloader, DownloaderConfig, Header, Protocol,
    SyncError,
};
use parking_lot::Mutex;
use prometheus::Registry;
use std::sync::Arc;
use std::time::Duration;

/// In-memory chain: `blocks[i]` holds block number `i`.
struct TestChain {
    config: ChainConfig,
    blocks: Mutex<Vec<Block>>,
}

impl TestChain {
    fn new(blocks: Vec<Block>) -> Arc<Self> {
        Arc::new(Self {
            config: ChainConfig {
                network: "testnet".to_string(),
                shard_id: 0,
                blocks_per_epoch: 16,
            },
            blocks: Mutex::new(blocks),
        })
    }
}

impl Chain for TestChain {
    fn current_number(&self) -> u64 {
        self.blocks.lock().len() as u64 - 1
    }

    fn header_by_number(&self, number: u64) -> Option<Header> {
        self.blocks
            .lock()
            .get(number as usize)
            .map(|b| b.header.clone())
    }

    fn header_by_hash(&self, hash: &BlockHash) -> Option<Header> {
        self.blocks
            .lock()
            .iter()
            .find(|b| b.hash() == *hash)
            .map(|b| b.header.clone())
    }

    fn block(&self, hash: &BlockHash, number: u64) -> Option<Block> {
        self.blocks
            .lock()
            .get(number as usize)
            .filter(|b| b.hash() == *hash)
            .cloned()
    }

    fn read_commit_sig(&self, number: u64) -> Result<Bytes, ChainError> {
        Ok(Bytes::from(format!("sig-{number}")))
    }

    fn read_shard_state(&self, epoch: u64) -> Result<Bytes, ChainError> {
        Ok(Bytes::from(format!("shard-state-{epoch}")))
    }

    fn insert_chain(&self, to_insert: Vec<Block>) -> Result<usize, ChainError> {
        let mut blocks = self.blocks.lock();
        let mut inserted = 0;
        for block in to_insert {
            let expected = blocks.len() as u64;
            if block.number() != expected {
                return Err(ChainError::InvalidBlock {
                    number: block.number(),
                    reason: format!("expected number {expected}"),
                });
            }
            let parent = blocks.last().map(|b| b.hash()).unwrap_or(BlockHash::ZERO);
            if block.header.parent_hash != parent {
                return Err(ChainError::InvalidBlock {
                    number: block.number(),
                    reason: "parent hash mismatch".to_string(),
                });
            }
            blocks.push(block);
            inserted += 1;
        }
        Ok(inserted)
    }

    fn config(&self) -> &ChainConfig {
        &self.config
    }
}

fn number_hash(number: u64) -> BlockHash {
    let mut hash = [0u8; 32];
    hash[..8].copy_from_slice(&number.to_le_bytes());
    hash[8] = 0x5a;
    BlockHash(hash)
}

/// A linked chain of `count` blocks starting at genesis (number 0).
fn make_chain_blocks(count: u64) -> Vec<Block> {
    (0..count)
        .map(|number| {
            Block::new(
                Header {
                    number,
                    epoch: number / 16,
                    timestamp: 1_700_000_000 + number,
                    hash: number_hash(number),
                    parent_hash: if number == 0 {
                        BlockHash::ZERO
                    } else {
                        number_hash(number - 1)
                    },
                },
                Bytes::from(vec![number as u8; 8]),
            )
        })
        .collect()
}

struct Node {
    chain: Arc<TestChain>,
    stream_manager: Arc<StreamManager>,
    request_manager: Arc<RequestManager>,
    protocol: Arc<Protocol>,
    registry: Registry,
}

fn make_node(blocks: Vec<Block>) -> Node {
    let registry = Registry::new();
    let chain = TestChain::new(blocks);
    let stream_manager = StreamManager::new(
        StreamManagerConfig {
            network: "testnet".to_string(),
            concurrency: 1,
            min_streams: 1,
            init_streams: 1,
            max_streams: 8,
        },
        &registry,
    )
    .unwrap();
    let request_manager = RequestManager::start(
        stream_manager.clone(),
        RequestManagerConfig {
            req_timeout: Duration::from_secs(2),
            throttle_interval: Duration::from_millis(20),
            throttle_batch: 16,
            deliver_timeout: Duration::from_secs(2),
        },
        &registry,
    )
    .unwrap();
    let rate_limiter = Arc::new(RateLimiter::new(RateLimiterConfig::default()));
    let protocol = Protocol::new(
        chain.clone(),
        stream_manager.clone(),
        request_manager.clone(),
        rate_limiter,
        &registry,
    )
    .unwrap();
    Node {
        chain,
        stream_manager,
        request_manager,
        protocol,
        registry,
    }
}

/// Wire two nodes with an in-memory duplex stream.
fn connect(a: &Node, b: &Node, link: &str) {
    let (io_a, io_b) = tokio::io::duplex(1 << 20);
    a.protocol
        .run_stream(io_a, StreamId::new(format!("{link}/a")), b.protocol.proto_id())
        .unwrap();
    b.protocol
        .run_stream(io_b, StreamId::new(format!("{link}/b")), a.protocol.proto_id())
        .unwrap();
}

async fn wait_until(mut predicate: impl FnMut() -> bool, what: &str) {
    for _ in 0..500 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_served_request_kinds() {
    let client = make_node(make_chain_blocks(1));
    let server = make_node(make_chain_blocks(41));
    connect(&client, &server, "link");
    client.stream_manager.wait_bootstrapped().await;

    // Current tip.
    let (tip, _) = client.protocol.get_current_block_number().await.unwrap();
    assert_eq!(tip, 40);

    // Hashes; unknown heights come back zero.
    let (hashes, _) = client
        .protocol
        .get_block_hashes(&[1, 2, 999])
        .await
        .unwrap();
    assert_eq!(hashes, vec![number_hash(1), number_hash(2), BlockHash::ZERO]);

    // Blocks by number, with the commit signature attached from storage.
    let (blocks, _) = client
        .protocol
        .get_blocks_by_number(&[3, 4, 999])
        .await
        .unwrap();
    assert_eq!(blocks[0].as_ref().unwrap().number(), 3);
    assert_eq!(
        blocks[0].as_ref().unwrap().commit_sig,
        Bytes::from_static(b"sig-3")
    );
    assert_eq!(blocks[1].as_ref().unwrap().number(), 4);
    assert!(blocks[2].is_none());

    // Blocks by hashes.
    let (blocks, _) = client
        .protocol
        .get_blocks_by_hashes(&[number_hash(7), number_hash(8)])
        .await
        .unwrap();
    assert_eq!(blocks[0].as_ref().unwrap().number(), 7);
    assert_eq!(blocks[1].as_ref().unwrap().number(), 8);

    // Epoch state: last header of epoch 0 plus the stored shard state.
    let (state, _) = client.protocol.get_epoch_state(1).await.unwrap();
    assert_eq!(state.header.number, 15);
    assert_eq!(state.shard_state, Bytes::from_static(b"shard-state-1"));

    // Epoch 0 has no shard state; the server answers with a typed error.
    let err = client.protocol.get_epoch_state(0).await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Remote {
            code: ErrorCode::NotFound,
            ..
        }
    ));

    // Client-side cap validation rejects before anything hits the wire.
    let too_many: Vec<u64> = (1..=11).collect();
    let err = client
        .protocol
        .get_blocks_by_number(&too_many)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::CapExceeded { cap: 10, .. }));

    // An oversized request pushed straight through the request manager gets
    // the server-side typed error instead.
    let (resp, _) = client
        .request_manager
        .do_request(RequestPayload::GetBlocksByNumber((1..=11).collect()))
        .await
        .unwrap();
    assert!(matches!(
        resp.payload,
        ResponsePayload::Error {
            code: ErrorCode::CapExceeded,
            ..
        }
    ));
}

#[tokio::test]
async fn test_pipeline_syncs_from_peer() {
    let client = make_node(make_chain_blocks(1));
    let server = make_node(make_chain_blocks(26));
    connect(&client, &server, "link");

    let downloader = Downloader::new(
        DownloaderConfig {
            network: "testnet".to_string(),
            concurrency: 2,
            min_streams: 1,
            init_streams: 1,
            demerit_threshold: 3,
            idle_interval_ms: 50,
        },
        client.chain.clone(),
        client.protocol.clone(),
        client.stream_manager.clone(),
        &client.registry,
    )
    .unwrap();
    let pipeline = downloader.start();

    let chain = client.chain.clone();
    wait_until(|| chain.current_number() == 25, "client to reach block 25").await;

    downloader.close();
    pipeline.await.unwrap();
    assert!(downloader.result_queue().is_empty());
}

#[tokio::test]
async fn test_insert_failure_disqualifies_serving_peer() {
    let client = make_node(make_chain_blocks(1));

    // A server whose block 5 does not link to block 4.
    let mut blocks = make_chain_blocks(26);
    blocks[5].header.parent_hash = BlockHash([0xde; 32]);
    let server = make_node(blocks);
    connect(&client, &server, "link");

    let downloader = Downloader::new(
        DownloaderConfig {
            network: "testnet".to_string(),
            concurrency: 2,
            min_streams: 1,
            init_streams: 1,
            demerit_threshold: 3,
            idle_interval_ms: 50,
        },
        client.chain.clone(),
        client.protocol.clone(),
        client.stream_manager.clone(),
        &client.registry,
    )
    .unwrap();
    let pipeline = downloader.start();

    // The valid prefix lands; the offending peer is cut loose.
    let chain = client.chain.clone();
    wait_until(|| chain.current_number() == 4, "client to reach block 4").await;
    let sm = client.stream_manager.clone();
    wait_until(|| sm.num_streams() == 0, "bad peer to be dropped").await;

    // The purge leaves nothing of the bad peer behind.
    assert!(downloader.result_queue().is_empty());
    assert_eq!(client.chain.current_number(), 4);

    downloader.close();
    pipeline.await.unwrap();
}
