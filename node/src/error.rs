use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("chain backend error: {0}")]
    Chain(String),
    #[error("invalid input: {0}")]
    Invalid(&'static str),
}

pub type NodeResult<T> = Result<T, NodeError>;
