use tokio::sync::mpsc;

pub mod memory;

pub use memory::{MemoryHub, MemoryNetwork};

pub type PeerId = [u8; 32];

/// Message classes carried by the sync protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    BlockHashQuery,
    BlockHashResponse,
    BlockRequest,
    BlockResponse,
}

/// Delivery priority hint for the transport's send queues.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Priority {
    Normal,
    Urgent,
}

#[derive(Clone, Debug)]
pub struct IncomingMessage {
    pub from: PeerId,
    pub kind: MessageKind,
    pub data: Vec<u8>,
}

/// Surface the p2p service exposes to protocol subsystems.
///
/// Sends are fire-and-forget: an unknown peer or a full inbound queue drops
/// the message. Callers that need delivery recover through their own retry
/// loops, never through transport acknowledgement.
pub trait NetworkService: Send + Sync {
    /// Subscribe a named consumer to a set of message kinds and receive its
    /// inbound queue.
    fn register(&self, name: &str, kinds: &[MessageKind]) -> mpsc::Receiver<IncomingMessage>;

    fn send_to_peer(&self, peer: PeerId, data: Vec<u8>, kind: MessageKind, priority: Priority);

    fn broadcast(&self, data: Vec<u8>, kind: MessageKind, priority: Priority);
}
