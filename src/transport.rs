// =============================================================================
// ROMER - Peer Transport
// =============================================================================
//
// The node talks to its peers through `PeerTransport`. The real wire lives
// outside this crate; `InMemoryNetwork` connects nodes inside one process
// over tokio channels:
//
//   node A ── endpoint(A).send(B, msg) ──▶ inbox(B) ──▶ node B
//
// Links can be cut, peers taken offline and single messages dropped, which
// is how timeouts and offline peers are exercised.
//
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::keys::NodeId;
use crate::messages::PeerMessage;

/// Messages delivered to one node, tagged with the sender
pub type Inbox = mpsc::UnboundedReceiver<(NodeId, PeerMessage)>;

type DropFilter = Arc<dyn Fn(&NodeId, &NodeId, &PeerMessage) -> bool + Send + Sync>;

// =============================================================================
// Transport Error
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportError {
    PeerOffline(NodeId),
    UnknownPeer(NodeId),
    /// Receiving side is gone
    Closed,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::PeerOffline(n) => write!(f, "Peer {} is offline", n),
            TransportError::UnknownPeer(n) => write!(f, "Unknown peer {}", n),
            TransportError::Closed => write!(f, "Transport closed"),
        }
    }
}

impl std::error::Error for TransportError {}

// =============================================================================
// Transport Trait
// =============================================================================

pub trait PeerTransport: Send + Sync {
    /// Queue a message for a peer. Does not wait for the peer to handle it.
    fn send(&self, to: &NodeId, message: PeerMessage) -> Result<(), TransportError>;

    fn is_connected(&self, peer: &NodeId) -> bool;
}

// =============================================================================
// In-Memory Network
// =============================================================================

#[derive(Default)]
struct NetworkState {
    inboxes: HashMap<NodeId, mpsc::UnboundedSender<(NodeId, PeerMessage)>>,
    offline: HashSet<NodeId>,
    /// Cut links, smaller id first
    severed: HashSet<(NodeId, NodeId)>,
    drop_filter: Option<DropFilter>,
    delivered: u64,
    dropped: u64,
}

fn link(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    if a <= b { (a, b) } else { (b, a) }
}

impl NetworkState {
    fn reachable(&self, from: &NodeId, to: &NodeId) -> bool {
        !self.offline.contains(from)
            && !self.offline.contains(to)
            && !self.severed.contains(&link(*from, *to))
    }
}

/// A set of nodes wired together in-process
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        InMemoryNetwork::default()
    }

    /// Attach a node; returns its inbox. Re-registering replaces the inbox.
    pub fn register(&self, node: NodeId) -> Inbox {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut state) = self.state.lock() {
            state.inboxes.insert(node, tx);
            state.offline.remove(&node);
        }
        log::debug!("Network: {} registered", node);
        rx
    }

    /// Transport handle used by `node` to reach the others
    pub fn endpoint(&self, node: NodeId) -> Arc<NetworkEndpoint> {
        Arc::new(NetworkEndpoint {
            local: node,
            network: self.clone(),
        })
    }

    pub fn set_online(&self, node: NodeId, online: bool) {
        if let Ok(mut state) = self.state.lock() {
            if online {
                state.offline.remove(&node);
            } else {
                state.offline.insert(node);
            }
        }
        log::info!("Network: {} {}", node, if online { "online" } else { "offline" });
    }

    pub fn disconnect(&self, a: NodeId, b: NodeId) {
        if let Ok(mut state) = self.state.lock() {
            state.severed.insert(link(a, b));
        }
    }

    pub fn reconnect(&self, a: NodeId, b: NodeId) {
        if let Ok(mut state) = self.state.lock() {
            state.severed.remove(&link(a, b));
        }
    }

    /// Silently drop every message for which `filter(from, to, msg)` holds
    pub fn set_drop_filter<F>(&self, filter: F)
    where
        F: Fn(&NodeId, &NodeId, &PeerMessage) -> bool + Send + Sync + 'static,
    {
        if let Ok(mut state) = self.state.lock() {
            state.drop_filter = Some(Arc::new(filter));
        }
    }

    pub fn clear_drop_filter(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.drop_filter = None;
        }
    }

    /// (delivered, dropped) message counts
    pub fn stats(&self) -> (u64, u64) {
        self.state
            .lock()
            .map(|s| (s.delivered, s.dropped))
            .unwrap_or((0, 0))
    }

    fn deliver(&self, from: &NodeId, to: &NodeId, message: PeerMessage) -> Result<(), TransportError> {
        let mut state = self.state.lock().map_err(|_| TransportError::Closed)?;

        if !state.reachable(from, to) {
            return Err(TransportError::PeerOffline(*to));
        }

        let inbox = state.inboxes
            .get(to)
            .cloned()
            .ok_or(TransportError::UnknownPeer(*to))?;

        if let Some(filter) = state.drop_filter.clone() {
            if filter(from, to, &message) {
                log::debug!("Network: dropped {} {} -> {}", message.name(), from, to);
                state.dropped += 1;
                return Ok(());
            }
        }

        log::trace!("Network: {} {} -> {}", message.name(), from, to);
        inbox.send((*from, message)).map_err(|_| TransportError::Closed)?;
        state.delivered += 1;
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (delivered, dropped) = self.stats();
        f.debug_struct("InMemoryNetwork")
            .field("delivered", &delivered)
            .field("dropped", &dropped)
            .finish()
    }
}

/// One node's view of an `InMemoryNetwork`
pub struct NetworkEndpoint {
    local: NodeId,
    network: InMemoryNetwork,
}

impl PeerTransport for NetworkEndpoint {
    fn send(&self, to: &NodeId, message: PeerMessage) -> Result<(), TransportError> {
        self.network.deliver(&self.local, to, message)
    }

    fn is_connected(&self, peer: &NodeId) -> bool {
        self.network
            .state
            .lock()
            .map(|s| s.inboxes.contains_key(peer) && s.reachable(&self.local, peer))
            .unwrap_or(false)
    }
}

// =============================================================================
// Tests
// =============================================================================
