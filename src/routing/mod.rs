// =============================================================================
// ROMER - Routing
// =============================================================================
//
// Network graph and route computation.
//
// ┌──────────────┐  gossip   ┌──────────────┐  candidates  ┌──────────────┐
// │   Gossip /   │──────────▶│   Routing    │─────────────▶│   Payment    │
// │ local chans  │           │    Graph     │              │ Coordinator  │
// └──────────────┘           └──────────────┘              └──────────────┘
//                                                            │ exclude
//                                   ▲────────────────────────┘ failed hop
//
// Nodes live in an arena and are addressed by `NodeIndex`; channels are
// addressed by `ChannelId`. Nothing holds a reference to anything else.
//
// =============================================================================

pub mod graph;
pub mod pathfind;

pub use graph::{ChannelEdge, DirectionalPolicy, FeePolicy, GossipMessage, GraphNode, NodeIndex, RoutingGraph};
pub use pathfind::{build_route, find_path, Exclusions, PathStep, RouteCandidates, RouteCost};

use serde::{Serialize, Deserialize};

use crate::channels::ChannelId;
use crate::keys::NodeId;

// =============================================================================
// Constants
// =============================================================================

/// Hard bound on route length
pub const DEFAULT_MAX_HOPS: usize = 20;

/// Risk cost per sat per block of lock time, in billionths
pub const DEFAULT_RISK_FACTOR: u64 = 15;

/// Candidate routes produced for one payment before giving up
pub const DEFAULT_MAX_CANDIDATES: usize = 32;

/// Largest total expiry delta a route may accumulate
pub const DEFAULT_MAX_TOTAL_CLTV: u32 = crate::channels::MAX_CLTV_EXPIRY_DELTA;

// =============================================================================
// Routing Error
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoutingError {
    UnknownNode(NodeId),
    UnknownChannel(ChannelId),
    /// Source and destination are the same node
    SelfPayment,
    /// Gossip contradicts what the graph already knows
    InvalidGossip(String),
    /// A path can no longer carry the amount
    InsufficientCapacity(ChannelId),
    ExpiryTooFar,
    NoRoute,
}

impl std::fmt::Display for RoutingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoutingError::UnknownNode(n) => write!(f, "Unknown node {}", n),
            RoutingError::UnknownChannel(c) => write!(f, "Unknown channel {}", c),
            RoutingError::SelfPayment => write!(f, "Cannot route to ourselves"),
            RoutingError::InvalidGossip(s) => write!(f, "Invalid gossip: {}", s),
            RoutingError::InsufficientCapacity(c) => {
                write!(f, "Channel {} cannot carry the amount", c)
            }
            RoutingError::ExpiryTooFar => write!(f, "Route expiry too far in the future"),
            RoutingError::NoRoute => write!(f, "No route found"),
        }
    }
}

impl std::error::Error for RoutingError {}

// =============================================================================
// Route
// =============================================================================

/// One hop of a route
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteHop {
    pub channel_id: ChannelId,
    /// Node at the end of this hop
    pub node_id: NodeId,
    /// Amount of the HTLC over this hop
    pub amount: u64,
    /// Fee kept by `node_id` for forwarding (0 at the last hop)
    pub fee: u64,
    /// Absolute expiry of the HTLC over this hop
    pub cltv_expiry: u32,
    /// Expiry delta from the current height, cumulative to the destination
    pub cltv_delta: u32,
}

/// An ordered list of hops from the sender to the destination
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub hops: Vec<RouteHop>,
}

impl Route {
    pub fn first_hop(&self) -> Option<&RouteHop> {
        self.hops.first()
    }

    pub fn destination(&self) -> Option<NodeId> {
        self.hops.last().map(|h| h.node_id)
    }

    /// Amount the sender puts into the first HTLC
    pub fn total_amount(&self) -> u64 {
        self.hops.first().map(|h| h.amount).unwrap_or(0)
    }

    /// Amount delivered to the destination
    pub fn final_amount(&self) -> u64 {
        self.hops.last().map(|h| h.amount).unwrap_or(0)
    }

    pub fn total_fee(&self) -> u64 {
        self.hops.iter().map(|h| h.fee).sum()
    }

    pub fn total_cltv_delta(&self) -> u32 {
        self.hops.first().map(|h| h.cltv_delta).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    pub fn contains_channel(&self, channel_id: &ChannelId) -> bool {
        self.hops.iter().any(|h| h.channel_id == *channel_id)
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.hops.iter().map(|h| h.channel_id).collect()
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let path: Vec<String> = self.hops.iter().map(|h| h.node_id.short()).collect();
        write!(
            f,
            "{} ({} sat, fee {}, {} blocks)",
            path.join(" -> "),
            self.total_amount(),
            self.total_fee(),
            self.total_cltv_delta()
        )
    }
}

// =============================================================================
// Route Parameters
// =============================================================================

/// Knobs for one route search
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteParams {
    pub max_hops: usize,
    /// Billionths of (amount x blocks locked) added to the weight
    pub risk_factor: u64,
    /// Delta the destination requires on its HTLC
    pub final_cltv_delta: u32,
    pub max_total_cltv: u32,
    pub current_height: u32,
    pub max_candidates: usize,
}

impl Default for RouteParams {
    fn default() -> Self {
        RouteParams {
            max_hops: DEFAULT_MAX_HOPS,
            risk_factor: DEFAULT_RISK_FACTOR,
            final_cltv_delta: crate::channels::MIN_FINAL_CLTV_EXPIRY_DELTA,
            max_total_cltv: DEFAULT_MAX_TOTAL_CLTV,
            current_height: 0,
            max_candidates: DEFAULT_MAX_CANDIDATES,
        }
    }
}

impl RouteParams {
    /// Risk cost of locking `amount` for `blocks`
    pub fn risk_cost(&self, amount: u64, blocks: u32) -> u64 {
        let cost = amount as u128 * blocks as u128 * self.risk_factor as u128 / 1_000_000_000;
        cost.min(u64::MAX as u128) as u64
    }
}
