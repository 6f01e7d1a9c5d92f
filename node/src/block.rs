use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::NodeResult;

pub type BlockHash = [u8; 32];

/// Identity of the block producer, as committed in the block head.
pub type WitnessId = [u8; 32];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHead {
    pub version: u32,
    pub number: u64,
    pub parent_hash: BlockHash,
    pub witness: WitnessId,
    pub timestamp_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub head: BlockHead,
    /// Encoded transactions; opaque to the sync subsystem.
    pub transactions: Vec<Vec<u8>>,
}

impl BlockHead {
    pub fn hash(&self) -> NodeResult<BlockHash> {
        let bytes = bincode::serialize(self)?;
        Ok(sha256(&bytes))
    }
}

impl Block {
    pub fn hash(&self) -> NodeResult<BlockHash> {
        self.head.hash()
    }
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}
