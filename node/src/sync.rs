//! Catch-up orchestration: decides when the node is behind, discovers block
//! hashes for the missing range, and feeds them to the download controller.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use network::{IncomingMessage, MessageKind, NetworkService, PeerId, Priority};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::block::BlockHash;
use crate::chain::{BlockCache, BlockChain};
use crate::codec::{self, BlockHashEntry, BlockHashQuery, BlockHashResponse, QueryKind, RequestBlock};
use crate::config::SyncConfig;
use crate::download::{MissionOutcome, MissionScheduler};
use crate::error::{NodeError, NodeResult};
use crate::mode::{ModeFlag, SyncMode};
use crate::telemetry::{SyncTelemetry, TelemetrySnapshot};

pub struct Synchronizer {
    cfg: SyncConfig,
    chain: Arc<dyn BlockChain>,
    cache: Arc<dyn BlockCache>,
    mode: Arc<ModeFlag>,
    net: Arc<dyn NetworkService>,
    scheduler: Arc<MissionScheduler<u64>>,
    /// Heights queried but not yet answered with a hash.
    pending: Mutex<BTreeSet<u64>>,
    last_head: Mutex<Option<BlockHash>>,
    sync_target: AtomicU64,
    telemetry: Arc<SyncTelemetry>,
    shutdown: watch::Sender<bool>,
    inbound: Mutex<Option<mpsc::Receiver<IncomingMessage>>>,
}

/// Handle to the synchronizer's spawned tasks.
pub struct SyncHandle {
    synchronizer: Arc<Synchronizer>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncHandle {
    pub fn synchronizer(&self) -> &Arc<Synchronizer> {
        &self.synchronizer
    }

    pub async fn shutdown(self) {
        self.synchronizer.stop();
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    warn!(?err, "sync task did not shut down cleanly");
                }
            }
        }
    }
}

impl Synchronizer {
    pub fn new(
        cfg: SyncConfig,
        chain: Arc<dyn BlockChain>,
        cache: Arc<dyn BlockCache>,
        mode: Arc<ModeFlag>,
        net: Arc<dyn NetworkService>,
    ) -> Arc<Self> {
        let telemetry = Arc::new(SyncTelemetry::new());
        let scheduler = MissionScheduler::new(cfg.scheduler(), telemetry.clone());
        let inbound = net.register(
            "sync",
            &[
                MessageKind::BlockHashQuery,
                MessageKind::BlockHashResponse,
                MessageKind::BlockRequest,
            ],
        );
        Arc::new(Self {
            cfg,
            chain,
            cache,
            mode,
            net,
            scheduler,
            pending: Mutex::new(BTreeSet::new()),
            last_head: Mutex::new(None),
            sync_target: AtomicU64::new(0),
            telemetry,
            shutdown: watch::channel(false).0,
            inbound: Mutex::new(Some(inbound)),
        })
    }

    /// Spawn the dispatch, inbound-message, and retry loops.
    pub fn start(self: Arc<Self>) -> NodeResult<SyncHandle> {
        let inbound = self
            .inbound
            .lock()
            .take()
            .ok_or(NodeError::Invalid("synchronizer already started"))?;

        let mut tasks = Vec::new();

        let sy = self.clone();
        let scheduler = self.scheduler.clone();
        tasks.push(tokio::spawn(scheduler.run(move |hash, number, peer| {
            sy.request_block(hash, *number, peer)
        })));

        let sy = self.clone();
        tasks.push(tokio::spawn(async move { sy.message_loop(inbound).await }));

        let sy = self.clone();
        tasks.push(tokio::spawn(async move { sy.retry_loop().await }));

        Ok(SyncHandle {
            synchronizer: self,
            tasks,
        })
    }

    pub fn stop(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        self.scheduler.stop();
        info!("synchronizer stopped");
    }

    /// Should the node start catching up, and over which height range?
    ///
    /// `None` while a sync is already running. Triggers on a height gap
    /// larger than `sync_slack`, or on the fork-stall heuristic: when the
    /// cache head changed since the last call and any of its
    /// `confirm_number` ancestors carries the head's witness, the head
    /// branch may be a minority fork and a resync is recommended.
    pub fn need_sync(&self, net_height: u64) -> Option<(u64, u64)> {
        if self.mode.mode() == SyncMode::Sync {
            return None;
        }
        let local = self.chain.length().saturating_sub(1);
        if net_height > local + self.cfg.sync_slack {
            return Some((local + 1, net_height));
        }

        let head = self.cache.head();
        let head_changed = {
            let mut last = self.last_head.lock();
            if last.as_ref() == Some(&head.hash) {
                false
            } else {
                *last = Some(head.hash);
                true
            }
        };
        if !head_changed {
            return None;
        }
        let witness = head.witness();
        let mut repeats = 0u64;
        let mut node = head.parent.clone();
        for _ in 0..self.cfg.confirm_number {
            let Some(current) = node else { break };
            if current.witness() == witness {
                repeats += 1;
            }
            node = current.parent.clone();
        }
        if repeats > 0 {
            debug!(repeats, "possible minority fork stall");
            return Some((local + 1, net_height));
        }
        None
    }

    /// Enter sync mode and query the hash of every height in `[start, end]`,
    /// one broadcast per window of `hash_query_window` heights.
    pub async fn sync_blocks(&self, start: u64, end: u64) {
        info!(start, end, "start syncing blocks");
        self.mode.set_mode(SyncMode::Sync);
        self.sync_target.store(end, Ordering::SeqCst);

        let window = self.cfg.hash_query_window.max(1);
        let mut cursor = start;
        let mut sent = 0u64;
        while end.saturating_sub(cursor) >= window {
            if self.register_pending(cursor, cursor + window - 1) {
                self.query_block_hashes(cursor, cursor + window - 1);
                sent += 1;
                if sent % 10 == 0 {
                    sleep(self.cfg.query_pacing).await;
                }
            }
            cursor += window;
        }
        if cursor <= end && self.register_pending(cursor, end) {
            self.query_block_hashes(cursor, end);
        }
    }

    /// Leave sync mode once the cache head reached the recorded target.
    pub fn check_sync_process(&self) {
        if self.mode.mode() != SyncMode::Sync {
            return;
        }
        let target = self.sync_target.load(Ordering::SeqCst);
        let head = self.cache.head().number();
        if head >= target {
            info!(head, target, "sync target reached");
            self.mode.set_mode(SyncMode::Normal);
            self.scheduler.reset();
        }
    }

    /// Called by the block-insertion path once a fetched block is verified
    /// and absorbed into the cache.
    pub fn on_block_confirmed(&self, hash: &BlockHash, peer: &PeerId) {
        self.scheduler.on_block_confirmed(hash, peer);
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    fn request_block(&self, hash: &BlockHash, number: u64, peer: &PeerId) -> MissionOutcome {
        if self.cache.find(hash).is_some() {
            return MissionOutcome {
                accepted: false,
                completed: true,
            };
        }
        let req = RequestBlock {
            block_hash: *hash,
            block_number: number,
        };
        match codec::serialize_block_request(&req) {
            Ok(bytes) => {
                debug!(number, hash = %short(hash), "request block");
                self.net
                    .send_to_peer(*peer, bytes, MessageKind::BlockRequest, Priority::Urgent);
                MissionOutcome {
                    accepted: true,
                    completed: false,
                }
            }
            Err(err) => {
                warn!(?err, "encode block request failed");
                MissionOutcome::default()
            }
        }
    }

    async fn message_loop(&self, mut inbound: mpsc::Receiver<IncomingMessage>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                msg = inbound.recv() => {
                    let Some(msg) = msg else { return };
                    self.dispatch_message(msg);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    fn dispatch_message(&self, msg: IncomingMessage) {
        match msg.kind {
            MessageKind::BlockHashQuery => match codec::deserialize_hash_query(&msg.data) {
                Ok(query) => self.handle_hash_query(&query, msg.from),
                Err(err) => debug!(?err, "malformed block hash query dropped"),
            },
            MessageKind::BlockHashResponse => match codec::deserialize_hash_response(&msg.data) {
                Ok(resp) => self.handle_hash_resp(resp, msg.from),
                Err(err) => debug!(?err, "malformed block hash response dropped"),
            },
            MessageKind::BlockRequest => match codec::deserialize_block_request(&msg.data) {
                Ok(req) => self.handle_block_query(&req, msg.from),
                Err(err) => debug!(?err, "malformed block request dropped"),
            },
            kind => debug!(?kind, "unexpected message kind"),
        }
    }

    fn handle_hash_query(&self, query: &BlockHashQuery, peer: PeerId) {
        let entries = match query.kind {
            QueryKind::Range => {
                if query.end < query.start {
                    return;
                }
                if query.end.saturating_sub(query.start) >= self.cfg.max_acceptable_length {
                    debug!(start = query.start, end = query.end, "oversized hash query dropped");
                    return;
                }
                self.collect_range(query.start, query.end)
            }
            QueryKind::Numbers => {
                if query.numbers.len() as u64 > self.cfg.max_acceptable_length {
                    debug!(len = query.numbers.len(), "oversized hash query dropped");
                    return;
                }
                self.collect_numbers(&query.numbers)
            }
        };
        if entries.is_empty() {
            return;
        }
        let resp = BlockHashResponse { entries };
        match codec::serialize_hash_response(&resp) {
            Ok(bytes) => {
                self.net
                    .send_to_peer(peer, bytes, MessageKind::BlockHashResponse, Priority::Normal);
                self.telemetry.hash_query_served();
            }
            Err(err) => warn!(?err, "encode block hash response failed"),
        }
    }

    /// Walk the cache tree downward from its head; heights below the linked
    /// root are read from the persisted chain instead.
    fn collect_range(&self, start: u64, end: u64) -> Vec<BlockHashEntry> {
        let linked_root = self.cache.linked_root().number();
        let mut node = Some(self.cache.head());
        let mut entries = Vec::new();
        let mut number = end;
        loop {
            if number < linked_root {
                if let Ok(Some(hash)) = self.chain.get_hash_by_number(number) {
                    entries.push(BlockHashEntry { number, hash });
                }
            } else {
                loop {
                    let next = match node {
                        Some(ref current) if current.number() > number => current.parent.clone(),
                        _ => break,
                    };
                    node = next;
                }
                if let Some(ref current) = node {
                    if current.number() == number {
                        entries.push(BlockHashEntry {
                            number,
                            hash: current.hash,
                        });
                    }
                }
            }
            if number == start {
                break;
            }
            number -= 1;
        }
        entries
    }

    fn collect_numbers(&self, numbers: &[u64]) -> Vec<BlockHashEntry> {
        let mut entries = Vec::new();
        for &number in numbers {
            if let Some(block) = self.cache.get_block_by_number(number) {
                if let Ok(hash) = block.head.hash() {
                    entries.push(BlockHashEntry { number, hash });
                }
            } else if let Ok(Some(hash)) = self.chain.get_hash_by_number(number) {
                entries.push(BlockHashEntry { number, hash });
            }
        }
        entries
    }

    fn handle_hash_resp(&self, resp: BlockHashResponse, peer: PeerId) {
        debug!(len = resp.entries.len(), peer = %short(&peer), "received block hashes");
        for entry in resp.entries {
            self.pending.lock().remove(&entry.number);
            if self.cache.find(&entry.hash).is_none() {
                self.scheduler.on_recv_hash(entry.hash, peer, entry.number);
            }
        }
    }

    fn handle_block_query(&self, req: &RequestBlock, peer: PeerId) {
        let linked_root = self.cache.linked_root().number();
        let bytes = if req.block_number < linked_root {
            match self.chain.get_block_bytes_by_hash(&req.block_hash) {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    debug!(number = req.block_number, "requested block not in chain");
                    return;
                }
                Err(err) => {
                    warn!(?err, number = req.block_number, "chain lookup failed");
                    return;
                }
            }
        } else {
            let Some(node) = self.cache.find(&req.block_hash) else {
                debug!(number = req.block_number, "requested block not in cache");
                return;
            };
            match codec::serialize_block(&node.block) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(?err, "encode block failed");
                    return;
                }
            }
        };
        self.net
            .send_to_peer(peer, bytes, MessageKind::BlockResponse, Priority::Normal);
    }

    async fn retry_loop(&self) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = sleep(self.cfg.retry_interval) => {
                    self.retry_pending();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Re-issue a sparse hash query for every height still unanswered.
    /// Recovers from dropped broadcasts and silent peers.
    fn retry_pending(&self) {
        let linked_root = self.cache.linked_root().number();
        let outstanding: Vec<u64> = {
            let mut pending = self.pending.lock();
            pending.retain(|&number| number > linked_root);
            pending.iter().copied().collect()
        };
        if outstanding.is_empty() {
            return;
        }
        self.telemetry.retry_round();
        debug!(outstanding = outstanding.len(), "retrying block hash queries");
        let chunk_size = (self.cfg.max_acceptable_length as usize).max(1);
        for chunk in outstanding.chunks(chunk_size) {
            let query = BlockHashQuery::numbers(chunk.to_vec());
            match codec::serialize_hash_query(&query) {
                Ok(bytes) => {
                    self.net
                        .broadcast(bytes, MessageKind::BlockHashQuery, Priority::Normal)
                }
                Err(err) => warn!(?err, "encode retry hash query failed"),
            }
        }
    }

    fn register_pending(&self, start: u64, end: u64) -> bool {
        let mut pending = self.pending.lock();
        let mut added = false;
        for number in start..=end {
            added |= pending.insert(number);
        }
        added
    }

    fn query_block_hashes(&self, start: u64, end: u64) {
        let query = BlockHashQuery::range(start, end);
        match codec::serialize_hash_query(&query) {
            Ok(bytes) => {
                debug!(start, end, "query block hashes");
                self.net
                    .broadcast(bytes, MessageKind::BlockHashQuery, Priority::Normal);
            }
            Err(err) => warn!(?err, "encode hash query failed"),
        }
    }
}

fn short(id: &[u8; 32]) -> String {
    hex::encode(&id[..6])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{make_chain, witness, MemoryCache, MemoryChain};
    use network::MemoryHub;

    fn peer(tag: u8) -> PeerId {
        [tag; 32]
    }

    struct Fixture {
        sy: Arc<Synchronizer>,
        mode: Arc<ModeFlag>,
    }

    /// Node with `persisted` blocks on disk and the rest of `blocks` in the
    /// cache tree.
    fn fixture(blocks: &[crate::block::Block], persisted: usize) -> Fixture {
        let hub = MemoryHub::new();
        let net = hub.endpoint(peer(1));
        let chain = Arc::new(MemoryChain::with_blocks(blocks[..persisted].to_vec()));
        let cache = Arc::new(MemoryCache::new(blocks[persisted - 1].clone()).unwrap());
        for block in &blocks[persisted..] {
            cache.insert(block.clone()).unwrap();
        }
        let mode = Arc::new(ModeFlag::default());
        let sy = Synchronizer::new(SyncConfig::default(), chain, cache, mode.clone(), net);
        Fixture { sy, mode }
    }

    #[test]
    fn need_sync_triggers_on_height_gap() {
        let blocks = make_chain(1, witness(1)).unwrap();
        let fx = fixture(&blocks, 1);

        assert_eq!(fx.sy.need_sync(5), Some((1, 5)));
        // Within the slack, and the genesis head has no ancestors to stall on.
        assert_eq!(fx.sy.need_sync(2), None);
    }

    #[test]
    fn need_sync_suppressed_while_syncing() {
        let blocks = make_chain(1, witness(1)).unwrap();
        let fx = fixture(&blocks, 1);
        fx.mode.set_mode(SyncMode::Sync);
        assert_eq!(fx.sy.need_sync(100), None);
    }

    #[test]
    fn fork_stall_triggers_sync_at_equal_height() {
        // Head plus seven ancestors, all produced by the same witness.
        let blocks = make_chain(9, witness(5)).unwrap();
        let fx = fixture(&blocks, 1);

        let local = 0;
        assert!(fx.sy.need_sync(local).is_some());
        // The walk only reruns after the head moves again.
        assert_eq!(fx.sy.need_sync(local), None);
    }

    #[test]
    fn hash_query_served_from_cache_and_chain() {
        let blocks = make_chain(6, witness(2)).unwrap();
        let hub = MemoryHub::new();
        let net = hub.endpoint(peer(1));
        let asker = hub.endpoint(peer(2));
        let mut inbox = asker.register("asker", &[MessageKind::BlockHashResponse]);

        // Heights 0..=2 persisted, cache rooted at 2 holding 2..=5.
        let chain = Arc::new(MemoryChain::with_blocks(blocks[..3].to_vec()));
        let cache = Arc::new(MemoryCache::new(blocks[2].clone()).unwrap());
        for block in &blocks[3..] {
            cache.insert(block.clone()).unwrap();
        }
        let sy = Synchronizer::new(
            SyncConfig::default(),
            chain,
            cache,
            Arc::new(ModeFlag::default()),
            net,
        );

        sy.handle_hash_query(&BlockHashQuery::range(0, 5), peer(2));

        let msg = inbox.try_recv().expect("response sent");
        let resp = codec::deserialize_hash_response(&msg.data).unwrap();
        let mut numbers: Vec<u64> = resp.entries.iter().map(|e| e.number).collect();
        numbers.sort_unstable();
        assert_eq!(numbers, vec![0, 1, 2, 3, 4, 5]);
        for entry in &resp.entries {
            assert_eq!(
                entry.hash,
                blocks[entry.number as usize].head.hash().unwrap()
            );
        }

        // An answer set that comes up empty produces no response at all.
        sy.handle_hash_query(&BlockHashQuery::range(40, 45), peer(2));
        assert!(inbox.try_recv().is_err());
    }

    #[test]
    fn oversized_hash_query_is_dropped() {
        let blocks = make_chain(2, witness(2)).unwrap();
        let hub = MemoryHub::new();
        let net = hub.endpoint(peer(1));
        let asker = hub.endpoint(peer(2));
        let mut inbox = asker.register("asker", &[MessageKind::BlockHashResponse]);

        let chain = Arc::new(MemoryChain::with_blocks(blocks.to_vec()));
        let cache = Arc::new(MemoryCache::new(blocks[1].clone()).unwrap());
        let sy = Synchronizer::new(
            SyncConfig::default(),
            chain,
            cache,
            Arc::new(ModeFlag::default()),
            net,
        );

        sy.handle_hash_query(&BlockHashQuery::range(0, 500), peer(2));
        assert!(inbox.try_recv().is_err());
    }
}
