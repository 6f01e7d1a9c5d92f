//! In-memory chain and cache doubles for tests.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::block::{Block, BlockHash, BlockHead, WitnessId};
use crate::chain::{BlockCache, BlockChain, CacheNode};
use crate::codec;
use crate::error::NodeResult;

pub fn witness(tag: u8) -> WitnessId {
    [tag; 32]
}

pub fn make_block(number: u64, parent_hash: BlockHash, witness: WitnessId) -> Block {
    Block {
        head: BlockHead {
            version: 1,
            number,
            parent_hash,
            witness,
            timestamp_ms: number * 1_000,
        },
        transactions: Vec::new(),
    }
}

/// Linear chain of `len` blocks starting at genesis, all by one witness.
pub fn make_chain(len: u64, witness_id: WitnessId) -> NodeResult<Vec<Block>> {
    let mut blocks = Vec::with_capacity(len as usize);
    let mut parent = [0u8; 32];
    for number in 0..len {
        let block = make_block(number, parent, witness_id);
        parent = block.head.hash()?;
        blocks.push(block);
    }
    Ok(blocks)
}

pub struct MemoryChain {
    blocks: Mutex<Vec<Block>>,
}

impl MemoryChain {
    pub fn with_blocks(blocks: Vec<Block>) -> Self {
        Self {
            blocks: Mutex::new(blocks),
        }
    }

    pub fn push(&self, block: Block) {
        self.blocks.lock().push(block);
    }
}

impl BlockChain for MemoryChain {
    fn length(&self) -> u64 {
        self.blocks.lock().len() as u64
    }

    fn get_hash_by_number(&self, number: u64) -> NodeResult<Option<BlockHash>> {
        let blocks = self.blocks.lock();
        match blocks.get(number as usize) {
            Some(block) => Ok(Some(block.head.hash()?)),
            None => Ok(None),
        }
    }

    fn get_block_by_number(&self, number: u64) -> NodeResult<Option<Block>> {
        Ok(self.blocks.lock().get(number as usize).cloned())
    }

    fn get_block_bytes_by_hash(&self, hash: &BlockHash) -> NodeResult<Option<Vec<u8>>> {
        for block in self.blocks.lock().iter() {
            if &block.head.hash()? == hash {
                return Ok(Some(codec::serialize_block(block)?));
            }
        }
        Ok(None)
    }
}

struct CacheInner {
    nodes: HashMap<BlockHash, Arc<CacheNode>>,
    head: Arc<CacheNode>,
    linked_root: Arc<CacheNode>,
}

/// Cache tree rooted at a linked block; the head follows the highest insert.
pub struct MemoryCache {
    inner: Mutex<CacheInner>,
}

impl MemoryCache {
    pub fn new(root: Block) -> NodeResult<Self> {
        let hash = root.head.hash()?;
        let node = Arc::new(CacheNode {
            block: root,
            hash,
            parent: None,
        });
        let mut nodes = HashMap::new();
        nodes.insert(hash, node.clone());
        Ok(Self {
            inner: Mutex::new(CacheInner {
                nodes,
                head: node.clone(),
                linked_root: node,
            }),
        })
    }

    pub fn insert(&self, block: Block) -> NodeResult<Arc<CacheNode>> {
        let hash = block.head.hash()?;
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.nodes.get(&hash) {
            return Ok(existing.clone());
        }
        let parent = inner.nodes.get(&block.head.parent_hash).cloned();
        let node = Arc::new(CacheNode {
            block,
            hash,
            parent,
        });
        inner.nodes.insert(hash, node.clone());
        if node.number() > inner.head.number() {
            inner.head = node.clone();
        }
        Ok(node)
    }

    pub fn set_linked_root(&self, hash: &BlockHash) -> bool {
        let mut inner = self.inner.lock();
        match inner.nodes.get(hash).cloned() {
            Some(node) => {
                inner.linked_root = node;
                true
            }
            None => false,
        }
    }
}

impl BlockCache for MemoryCache {
    fn head(&self) -> Arc<CacheNode> {
        self.inner.lock().head.clone()
    }

    fn linked_root(&self) -> Arc<CacheNode> {
        self.inner.lock().linked_root.clone()
    }

    fn find(&self, hash: &BlockHash) -> Option<Arc<CacheNode>> {
        self.inner.lock().nodes.get(hash).cloned()
    }

    fn get_block_by_number(&self, number: u64) -> Option<Block> {
        let inner = self.inner.lock();
        let mut node = Some(inner.head.clone());
        while let Some(current) = node {
            if current.number() == number {
                return Some(current.block.clone());
            }
            if current.number() < number {
                return None;
            }
            node = current.parent.clone();
        }
        None
    }
}
