use std::sync::Arc;
use std::time::Duration;

use meridian_node::chain::BlockCache;
use meridian_node::codec::{self, BlockHashEntry, BlockHashResponse, QueryKind};
use meridian_node::config::SyncConfig;
use meridian_node::mode::{ModeFlag, SyncMode};
use meridian_node::sync::Synchronizer;
use meridian_node::test_utils::{make_chain, witness, MemoryCache, MemoryChain};
use network::{MemoryHub, MessageKind, NetworkService, PeerId, Priority};
use tokio::time::timeout;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .try_init();
}

fn peer(tag: u8) -> PeerId {
    [tag; 32]
}

fn test_config() -> SyncConfig {
    SyncConfig {
        retry_interval: Duration::from_millis(200),
        mission_timeout: Duration::from_millis(150),
        query_pacing: Duration::from_millis(10),
        ..SyncConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_blocks_covers_range_in_windows() {
    init_tracing();
    let hub = MemoryHub::new();
    let node_net = hub.endpoint(peer(1));
    let observer = hub.endpoint(peer(2));
    let mut queries = observer.register("observer", &[MessageKind::BlockHashQuery]);

    let blocks = make_chain(1, witness(7)).unwrap();
    let chain = Arc::new(MemoryChain::with_blocks(blocks.clone()));
    let cache = Arc::new(MemoryCache::new(blocks[0].clone()).unwrap());
    let mode = Arc::new(ModeFlag::new(SyncMode::Normal));
    let sy = Synchronizer::new(test_config(), chain, cache, mode.clone(), node_net);
    let handle = sy.clone().start().unwrap();

    sy.sync_blocks(10, 35).await;
    assert_eq!(mode.mode(), SyncMode::Sync);

    let mut windows = Vec::new();
    for _ in 0..3 {
        let msg = timeout(Duration::from_secs(2), queries.recv())
            .await
            .expect("query window broadcast")
            .expect("hub open");
        let query = codec::deserialize_hash_query(&msg.data).unwrap();
        assert_eq!(query.kind, QueryKind::Range);
        windows.push((query.start, query.end));
    }
    windows.sort_unstable();
    assert_eq!(windows, vec![(10, 19), (20, 29), (30, 35)]);

    // Nothing answered, so the retry loop must re-request the whole range as
    // one sparse query: every height exactly once.
    let msg = timeout(Duration::from_secs(2), queries.recv())
        .await
        .expect("retry query broadcast")
        .expect("hub open");
    let query = codec::deserialize_hash_query(&msg.data).unwrap();
    assert_eq!(query.kind, QueryKind::Numbers);
    assert_eq!(query.numbers, (10..=35).collect::<Vec<u64>>());

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_recovers_a_dropped_response() {
    init_tracing();
    let hub = MemoryHub::new();
    let node_net = hub.endpoint(peer(1));
    let remote_net = hub.endpoint(peer(9));
    let mut remote_inbox = remote_net.register(
        "remote",
        &[MessageKind::BlockHashQuery, MessageKind::BlockRequest],
    );

    let blocks = make_chain(1, witness(7)).unwrap();
    let chain = Arc::new(MemoryChain::with_blocks(blocks.clone()));
    let cache = Arc::new(MemoryCache::new(blocks[0].clone()).unwrap());
    let mode = Arc::new(ModeFlag::new(SyncMode::Normal));
    let sy = Synchronizer::new(test_config(), chain, cache, mode, node_net);
    let handle = sy.clone().start().unwrap();

    let remote_blocks = make_chain(36, witness(3)).unwrap();
    sy.sync_blocks(10, 35).await;

    // Answer every query except height 17, as if that entry's response was
    // lost on the wire. Once the rest of the range has been answered, the
    // retry loop must come back for 17 alone with a sparse query.
    let served = async {
        loop {
            let msg = remote_inbox.recv().await.expect("hub open");
            if msg.kind != MessageKind::BlockHashQuery {
                continue;
            }
            let query = codec::deserialize_hash_query(&msg.data).unwrap();
            let heights: Vec<u64> = match query.kind {
                QueryKind::Range => (query.start..=query.end).collect(),
                QueryKind::Numbers => {
                    if query.numbers == vec![17] {
                        return query.numbers;
                    }
                    query.numbers.clone()
                }
            };
            let entries: Vec<BlockHashEntry> = heights
                .into_iter()
                .filter(|&number| number != 17)
                .map(|number| BlockHashEntry {
                    number,
                    hash: remote_blocks[number as usize].head.hash().unwrap(),
                })
                .collect();
            if entries.is_empty() {
                continue;
            }
            let bytes = codec::serialize_hash_response(&BlockHashResponse { entries }).unwrap();
            remote_net.send_to_peer(
                msg.from,
                bytes,
                MessageKind::BlockHashResponse,
                Priority::Normal,
            );
        }
    };
    let numbers = timeout(Duration::from_secs(5), served)
        .await
        .expect("sparse retry narrows to the dropped height");
    assert_eq!(numbers, vec![17]);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn fresh_node_syncs_to_network_tip() {
    init_tracing();
    let hub = MemoryHub::new();
    let node_net = hub.endpoint(peer(1));
    let remote_net = hub.endpoint(peer(2));
    let mut remote_inbox = remote_net.register(
        "remote",
        &[MessageKind::BlockHashQuery, MessageKind::BlockRequest],
    );
    // The block-insertion path: consumes fetched block bodies, verifies and
    // absorbs them, then retires the missions.
    let mut block_responses = node_net.register("consensus", &[MessageKind::BlockResponse]);

    let blocks = make_chain(6, witness(2)).unwrap();
    let chain = Arc::new(MemoryChain::with_blocks(blocks[..1].to_vec()));
    let cache = Arc::new(MemoryCache::new(blocks[0].clone()).unwrap());
    let mode = Arc::new(ModeFlag::new(SyncMode::Normal));
    let sy = Synchronizer::new(
        test_config(),
        chain,
        cache.clone(),
        mode.clone(),
        node_net,
    );
    let handle = sy.clone().start().unwrap();

    let (from, to) = sy.need_sync(5).expect("node is behind the network");
    assert_eq!((from, to), (1, 5));
    sy.sync_blocks(from, to).await;

    let remote_blocks = blocks.clone();
    let remote = remote_net.clone();
    let server = tokio::spawn(async move {
        while let Some(msg) = remote_inbox.recv().await {
            match msg.kind {
                MessageKind::BlockHashQuery => {
                    let query = codec::deserialize_hash_query(&msg.data).unwrap();
                    let heights: Vec<u64> = match query.kind {
                        QueryKind::Range => (query.start..=query.end).collect(),
                        QueryKind::Numbers => query.numbers.clone(),
                    };
                    let entries: Vec<BlockHashEntry> = heights
                        .into_iter()
                        .filter_map(|number| {
                            remote_blocks.get(number as usize).map(|block| BlockHashEntry {
                                number,
                                hash: block.head.hash().unwrap(),
                            })
                        })
                        .collect();
                    if entries.is_empty() {
                        continue;
                    }
                    let bytes =
                        codec::serialize_hash_response(&BlockHashResponse { entries }).unwrap();
                    remote.send_to_peer(
                        msg.from,
                        bytes,
                        MessageKind::BlockHashResponse,
                        Priority::Normal,
                    );
                }
                MessageKind::BlockRequest => {
                    let req = codec::deserialize_block_request(&msg.data).unwrap();
                    let block = remote_blocks
                        .iter()
                        .find(|block| block.head.hash().unwrap() == req.block_hash);
                    if let Some(block) = block {
                        let bytes = codec::serialize_block(block).unwrap();
                        remote.send_to_peer(
                            msg.from,
                            bytes,
                            MessageKind::BlockResponse,
                            Priority::Normal,
                        );
                    }
                }
                _ => {}
            }
        }
    });

    // Apply fetched blocks in height order, the way the consensus layer
    // links them; out-of-order arrivals are staged until their parent lands.
    let sync_done = async {
        let mut staged = std::collections::HashMap::new();
        let mut next = 1u64;
        while next <= 5 {
            let msg = block_responses.recv().await.expect("hub open");
            let block = codec::deserialize_block(&msg.data).unwrap();
            let hash = block.head.hash().unwrap();
            staged.insert(block.head.number, block);
            sy.on_block_confirmed(&hash, &msg.from);
            while let Some(block) = staged.remove(&next) {
                cache.insert(block).unwrap();
                next += 1;
            }
            sy.check_sync_process();
        }
    };
    timeout(Duration::from_secs(10), sync_done)
        .await
        .expect("node caught up to the tip");

    assert_eq!(cache.head().number(), 5);
    assert_eq!(mode.mode(), SyncMode::Normal);
    assert!(sy.telemetry().done_blocks >= 5);

    server.abort();
    handle.shutdown().await;
}
