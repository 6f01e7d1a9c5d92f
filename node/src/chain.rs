//! Facades over the persisted chain and the speculative block cache.
//!
//! Both are owned by other subsystems; the synchronizer only reads through
//! these traits. The cache is a tree of recent blocks rooted at the last
//! linked (persisted) block, so height lookups below the linked root must go
//! to the chain instead.

use std::sync::Arc;

use crate::block::{Block, BlockHash, WitnessId};
use crate::error::NodeResult;

pub trait BlockChain: Send + Sync {
    /// Number of persisted blocks, genesis included.
    fn length(&self) -> u64;

    fn get_hash_by_number(&self, number: u64) -> NodeResult<Option<BlockHash>>;

    fn get_block_by_number(&self, number: u64) -> NodeResult<Option<Block>>;

    fn get_block_bytes_by_hash(&self, hash: &BlockHash) -> NodeResult<Option<Vec<u8>>>;
}

/// One block in the cache tree, linked upward to its parent.
pub struct CacheNode {
    pub block: Block,
    pub hash: BlockHash,
    pub parent: Option<Arc<CacheNode>>,
}

impl CacheNode {
    pub fn number(&self) -> u64 {
        self.block.head.number
    }

    pub fn witness(&self) -> WitnessId {
        self.block.head.witness
    }
}

pub trait BlockCache: Send + Sync {
    fn head(&self) -> Arc<CacheNode>;

    fn linked_root(&self) -> Arc<CacheNode>;

    fn find(&self, hash: &BlockHash) -> Option<Arc<CacheNode>>;

    /// Block at `number` on the head branch, if the cache holds it.
    fn get_block_by_number(&self, number: u64) -> Option<Block>;
}
