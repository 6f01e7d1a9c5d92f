use serde::{Deserialize, Serialize};

use crate::block::{Block, BlockHash};
use crate::error::NodeResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryKind {
    /// Contiguous `[start, end]` range of heights.
    Range,
    /// Explicit height list; used by the retry path.
    Numbers,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHashQuery {
    pub kind: QueryKind,
    pub start: u64,
    pub end: u64,
    pub numbers: Vec<u64>,
}

impl BlockHashQuery {
    pub fn range(start: u64, end: u64) -> Self {
        Self {
            kind: QueryKind::Range,
            start,
            end,
            numbers: Vec::new(),
        }
    }

    pub fn numbers(numbers: Vec<u64>) -> Self {
        Self {
            kind: QueryKind::Numbers,
            start: 0,
            end: 0,
            numbers,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHashEntry {
    pub number: u64,
    pub hash: BlockHash,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHashResponse {
    pub entries: Vec<BlockHashEntry>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestBlock {
    pub block_hash: BlockHash,
    pub block_number: u64,
}

pub fn serialize_hash_query(query: &BlockHashQuery) -> NodeResult<Vec<u8>> {
    Ok(bincode::serialize(query)?)
}

pub fn deserialize_hash_query(bytes: &[u8]) -> NodeResult<BlockHashQuery> {
    Ok(bincode::deserialize(bytes)?)
}

pub fn serialize_hash_response(resp: &BlockHashResponse) -> NodeResult<Vec<u8>> {
    Ok(bincode::serialize(resp)?)
}

pub fn deserialize_hash_response(bytes: &[u8]) -> NodeResult<BlockHashResponse> {
    Ok(bincode::deserialize(bytes)?)
}

pub fn serialize_block_request(req: &RequestBlock) -> NodeResult<Vec<u8>> {
    Ok(bincode::serialize(req)?)
}

pub fn deserialize_block_request(bytes: &[u8]) -> NodeResult<RequestBlock> {
    Ok(bincode::deserialize(bytes)?)
}

pub fn serialize_block(block: &Block) -> NodeResult<Vec<u8>> {
    Ok(bincode::serialize(block)?)
}

pub fn deserialize_block(bytes: &[u8]) -> NodeResult<Block> {
    Ok(bincode::deserialize(bytes)?)
}
