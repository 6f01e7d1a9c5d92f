//! In-process message router.
//!
//! Routes `IncomingMessage`s between endpoints registered on a shared hub,
//! keyed by peer id. Node wiring and integration tests plug into this seam;
//! the socket-level transport lives outside this crate.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::{IncomingMessage, MessageKind, NetworkService, PeerId, Priority};

const DEFAULT_QUEUE_DEPTH: usize = 1024;

struct Registration {
    name: String,
    kinds: Vec<MessageKind>,
    tx: mpsc::Sender<IncomingMessage>,
}

#[derive(Default)]
struct Endpoint {
    registrations: Mutex<Vec<Registration>>,
}

impl Endpoint {
    fn deliver(&self, msg: &IncomingMessage) {
        for registration in self.registrations.lock().iter() {
            if !registration.kinds.contains(&msg.kind) {
                continue;
            }
            if registration.tx.try_send(msg.clone()).is_err() {
                debug!(
                    consumer = %registration.name,
                    kind = ?msg.kind,
                    "inbound queue full, message dropped"
                );
            }
        }
    }
}

/// Shared router connecting `MemoryNetwork` endpoints.
#[derive(Clone)]
pub struct MemoryHub {
    peers: Arc<RwLock<HashMap<PeerId, Arc<Endpoint>>>>,
    queue_depth: usize,
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::with_queue_depth(DEFAULT_QUEUE_DEPTH)
    }

    pub fn with_queue_depth(queue_depth: usize) -> Self {
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            queue_depth,
        }
    }

    /// Attach a new endpoint to the hub under the given peer id.
    pub fn endpoint(&self, peer: PeerId) -> Arc<MemoryNetwork> {
        let endpoint = Arc::new(Endpoint::default());
        self.peers.write().insert(peer, endpoint.clone());
        Arc::new(MemoryNetwork {
            peer,
            peers: self.peers.clone(),
            endpoint,
            queue_depth: self.queue_depth,
        })
    }
}

/// One peer's view of the hub.
pub struct MemoryNetwork {
    peer: PeerId,
    peers: Arc<RwLock<HashMap<PeerId, Arc<Endpoint>>>>,
    endpoint: Arc<Endpoint>,
    queue_depth: usize,
}

impl MemoryNetwork {
    pub fn peer_id(&self) -> PeerId {
        self.peer
    }
}

impl NetworkService for MemoryNetwork {
    fn register(&self, name: &str, kinds: &[MessageKind]) -> mpsc::Receiver<IncomingMessage> {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        self.endpoint.registrations.lock().push(Registration {
            name: name.to_string(),
            kinds: kinds.to_vec(),
            tx,
        });
        rx
    }

    fn send_to_peer(&self, peer: PeerId, data: Vec<u8>, kind: MessageKind, priority: Priority) {
        trace!(?kind, ?priority, "send to peer");
        let target = self.peers.read().get(&peer).cloned();
        let Some(target) = target else {
            debug!(?kind, "send to unknown peer dropped");
            return;
        };
        target.deliver(&IncomingMessage {
            from: self.peer,
            kind,
            data,
        });
    }

    fn broadcast(&self, data: Vec<u8>, kind: MessageKind, priority: Priority) {
        trace!(?kind, ?priority, "broadcast");
        let targets: Vec<Arc<Endpoint>> = self
            .peers
            .read()
            .iter()
            .filter(|(peer, _)| **peer != self.peer)
            .map(|(_, endpoint)| endpoint.clone())
            .collect();
        let msg = IncomingMessage {
            from: self.peer,
            kind,
            data,
        };
        for target in targets {
            target.deliver(&msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(tag: u8) -> PeerId {
        [tag; 32]
    }

    #[tokio::test]
    async fn unicast_reaches_matching_registration_only() {
        let hub = MemoryHub::new();
        let a = hub.endpoint(peer(1));
        let b = hub.endpoint(peer(2));
        let mut hashes = b.register("hashes", &[MessageKind::BlockHashQuery]);
        let mut blocks = b.register("blocks", &[MessageKind::BlockRequest]);

        a.send_to_peer(
            peer(2),
            vec![1, 2, 3],
            MessageKind::BlockHashQuery,
            Priority::Normal,
        );

        let msg = hashes.recv().await.expect("delivered");
        assert_eq!(msg.from, peer(1));
        assert_eq!(msg.data, vec![1, 2, 3]);
        assert!(blocks.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_excludes_sender() {
        let hub = MemoryHub::new();
        let a = hub.endpoint(peer(1));
        let b = hub.endpoint(peer(2));
        let c = hub.endpoint(peer(3));
        let mut a_inbox = a.register("a", &[MessageKind::BlockHashQuery]);
        let mut b_inbox = b.register("b", &[MessageKind::BlockHashQuery]);
        let mut c_inbox = c.register("c", &[MessageKind::BlockHashQuery]);

        a.broadcast(vec![9], MessageKind::BlockHashQuery, Priority::Urgent);

        assert!(b_inbox.recv().await.is_some());
        assert!(c_inbox.recv().await.is_some());
        assert!(a_inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let hub = MemoryHub::with_queue_depth(1);
        let a = hub.endpoint(peer(1));
        let b = hub.endpoint(peer(2));
        let mut inbox = b.register("b", &[MessageKind::BlockRequest]);

        a.send_to_peer(peer(2), vec![1], MessageKind::BlockRequest, Priority::Urgent);
        a.send_to_peer(peer(2), vec![2], MessageKind::BlockRequest, Priority::Urgent);

        assert_eq!(inbox.recv().await.expect("first kept").data, vec![1]);
        assert!(inbox.try_recv().is_err());
    }
}
