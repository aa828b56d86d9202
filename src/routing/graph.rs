// =============================================================================
// ROMER - Routing Graph
// =============================================================================
//
// Arena of nodes and directed channel policies, fed by gossip and by the
// node's own channels.
//
//   nodes:    Vec<GraphNode>               (indexed by NodeIndex, never shrinks)
//   index:    NodeId    -> NodeIndex
//   channels: ChannelId -> ChannelEdge      (node_one/node_two are indices)
//
// Each edge carries up to two policies, one per direction. A direction
// without a policy cannot be routed over.
//
// =============================================================================

use serde::{Serialize, Deserialize};
use std::collections::HashMap;

use super::RoutingError;
use crate::channels::ChannelId;
use crate::keys::NodeId;

/// Position of a node in the graph arena
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIndex(pub usize);

// =============================================================================
// Fee Policy
// =============================================================================

/// What a node charges to forward over one of its channels
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeePolicy {
    /// Flat fee (sats)
    pub base_fee: u64,
    /// Proportional fee (parts per million)
    pub fee_rate_ppm: u64,
    /// Blocks the forwarding node subtracts from the expiry
    pub cltv_expiry_delta: u32,
}

impl FeePolicy {
    /// Fee for forwarding `amount`
    pub fn fee_for(&self, amount: u64) -> u64 {
        let proportional = amount as u128 * self.fee_rate_ppm as u128 / 1_000_000;
        self.base_fee.saturating_add(proportional.min(u64::MAX as u128) as u64)
    }
}

impl Default for FeePolicy {
    fn default() -> Self {
        FeePolicy {
            base_fee: 1,
            fee_rate_ppm: 1_000,
            cltv_expiry_delta: crate::channels::DEFAULT_CLTV_EXPIRY_DELTA,
        }
    }
}

/// Policy of one direction of a channel
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectionalPolicy {
    pub fee: FeePolicy,
    pub enabled: bool,
    /// Known sendable amount (only for our own channels)
    pub liquidity: Option<u64>,
    pub last_update: u64,
}

// =============================================================================
// Nodes and Edges
// =============================================================================

#[derive(Clone, Debug)]
pub struct GraphNode {
    pub node_id: NodeId,
    pub alias: Option<String>,
    pub channels: Vec<ChannelId>,
}

#[derive(Clone, Debug)]
pub struct ChannelEdge {
    pub channel_id: ChannelId,
    pub node_one: NodeIndex,
    pub node_two: NodeIndex,
    pub capacity: u64,
    pub one_to_two: Option<DirectionalPolicy>,
    pub two_to_one: Option<DirectionalPolicy>,
    /// One of our own channels
    pub is_local: bool,
}

impl ChannelEdge {
    /// Node on the other side from `node`
    pub fn other_end(&self, node: NodeIndex) -> Option<NodeIndex> {
        if node == self.node_one {
            Some(self.node_two)
        } else if node == self.node_two {
            Some(self.node_one)
        } else {
            None
        }
    }

    /// Policy for sending from `from` to the other end
    pub fn policy_from(&self, from: NodeIndex) -> Option<&DirectionalPolicy> {
        if from == self.node_one {
            self.one_to_two.as_ref()
        } else if from == self.node_two {
            self.two_to_one.as_ref()
        } else {
            None
        }
    }

    fn policy_from_mut(&mut self, from: NodeIndex) -> Option<&mut Option<DirectionalPolicy>> {
        if from == self.node_one {
            Some(&mut self.one_to_two)
        } else if from == self.node_two {
            Some(&mut self.two_to_one)
        } else {
            None
        }
    }

    /// Largest HTLC the edge can carry from `from`
    pub fn max_carry(&self, from: NodeIndex) -> u64 {
        match self.policy_from(from) {
            Some(policy) if policy.enabled => {
                policy.liquidity.map_or(self.capacity, |l| l.min(self.capacity))
            }
            _ => 0,
        }
    }
}

// =============================================================================
// Gossip
// =============================================================================

/// Network announcements that shape the graph
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GossipMessage {
    ChannelAnnouncement {
        channel_id: ChannelId,
        node_one: NodeId,
        node_two: NodeId,
        capacity: u64,
    },
    ChannelUpdate {
        channel_id: ChannelId,
        /// Node whose direction this policy describes
        from: NodeId,
        policy: FeePolicy,
        enabled: bool,
        timestamp: u64,
    },
    ChannelRemoval {
        channel_id: ChannelId,
    },
    NodeAnnouncement {
        node_id: NodeId,
        alias: String,
    },
}

// =============================================================================
// Routing Graph
// =============================================================================

#[derive(Clone, Debug, Default)]
pub struct RoutingGraph {
    nodes: Vec<GraphNode>,
    index: HashMap<NodeId, NodeIndex>,
    channels: HashMap<ChannelId, ChannelEdge>,
}

impl RoutingGraph {
    pub fn new() -> Self {
        RoutingGraph::default()
    }

    pub fn node_index(&self, node_id: &NodeId) -> Option<NodeIndex> {
        self.index.get(node_id).copied()
    }

    pub fn node(&self, index: NodeIndex) -> Option<&GraphNode> {
        self.nodes.get(index.0)
    }

    pub fn node_id(&self, index: NodeIndex) -> Option<NodeId> {
        self.nodes.get(index.0).map(|n| n.node_id)
    }

    /// Index of a node, adding it if unknown
    pub fn add_node(&mut self, node_id: NodeId) -> NodeIndex {
        if let Some(index) = self.index.get(&node_id) {
            return *index;
        }

        let index = NodeIndex(self.nodes.len());
        self.nodes.push(GraphNode {
            node_id,
            alias: None,
            channels: Vec::new(),
        });
        self.index.insert(node_id, index);
        index
    }

    pub fn channel(&self, channel_id: &ChannelId) -> Option<&ChannelEdge> {
        self.channels.get(channel_id)
    }

    /// Channels touching a node
    pub fn channels_of(&self, index: NodeIndex) -> impl Iterator<Item = &ChannelEdge> {
        self.nodes
            .get(index.0)
            .into_iter()
            .flat_map(|n| n.channels.iter())
            .filter_map(|id| self.channels.get(id))
    }

    /// Nodes with at least one channel
    pub fn node_count(&self) -> usize {
        self.nodes.iter().filter(|n| !n.channels.is_empty()).count()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    // =========================================================================
    // Gossip
    // =========================================================================

    pub fn apply_gossip(&mut self, msg: &GossipMessage) -> Result<(), RoutingError> {
        match msg {
            GossipMessage::ChannelAnnouncement { channel_id, node_one, node_two, capacity } => {
                self.announce_channel(*channel_id, *node_one, *node_two, *capacity)
            }
            GossipMessage::ChannelUpdate { channel_id, from, policy, enabled, timestamp } => {
                self.update_policy(channel_id, from, *policy, *enabled, *timestamp)
            }
            GossipMessage::ChannelRemoval { channel_id } => {
                self.remove_channel(channel_id);
                Ok(())
            }
            GossipMessage::NodeAnnouncement { node_id, alias } => {
                let index = self.add_node(*node_id);
                self.nodes[index.0].alias = Some(alias.clone());
                Ok(())
            }
        }
    }

    /// Add a channel, or refresh the capacity of a known one
    pub fn announce_channel(
        &mut self,
        channel_id: ChannelId,
        node_one: NodeId,
        node_two: NodeId,
        capacity: u64,
    ) -> Result<(), RoutingError> {
        if node_one == node_two {
            return Err(RoutingError::InvalidGossip(
                format!("Channel {} loops on {}", channel_id, node_one)
            ));
        }

        let one = self.add_node(node_one);
        let two = self.add_node(node_two);

        if let Some(edge) = self.channels.get_mut(&channel_id) {
            let same_ends = (edge.node_one == one && edge.node_two == two)
                || (edge.node_one == two && edge.node_two == one);
            if !same_ends {
                return Err(RoutingError::InvalidGossip(
                    format!("Channel {} re-announced with other endpoints", channel_id)
                ));
            }
            edge.capacity = capacity;
            return Ok(());
        }

        self.channels.insert(channel_id, ChannelEdge {
            channel_id,
            node_one: one,
            node_two: two,
            capacity,
            one_to_two: None,
            two_to_one: None,
            is_local: false,
        });
        self.nodes[one.0].channels.push(channel_id);
        self.nodes[two.0].channels.push(channel_id);

        log::debug!("Graph: channel {} {} <-> {} ({} sat)", channel_id, node_one, node_two, capacity);
        Ok(())
    }

    /// Set the policy of one direction. Older updates are ignored.
    pub fn update_policy(
        &mut self,
        channel_id: &ChannelId,
        from: &NodeId,
        fee: FeePolicy,
        enabled: bool,
        timestamp: u64,
    ) -> Result<(), RoutingError> {
        let from_index = self.node_index(from)
            .ok_or(RoutingError::UnknownNode(*from))?;
        let edge = self.channels.get_mut(channel_id)
            .ok_or(RoutingError::UnknownChannel(*channel_id))?;
        let slot = edge.policy_from_mut(from_index).ok_or_else(|| {
            RoutingError::InvalidGossip(format!("{} is not an endpoint of {}", from, channel_id))
        })?;

        match slot.as_mut() {
            Some(existing) if existing.last_update > timestamp => {
                log::debug!("Graph: stale update for {} from {}", channel_id, from);
            }
            Some(existing) => {
                existing.fee = fee;
                existing.enabled = enabled;
                existing.last_update = timestamp;
            }
            None => {}
        }

        if slot.is_none() {
            *slot = Some(DirectionalPolicy {
                fee,
                enabled,
                liquidity: None,
                last_update: timestamp,
            });
        }
        Ok(())
    }

    pub fn remove_channel(&mut self, channel_id: &ChannelId) -> bool {
        let Some(edge) = self.channels.remove(channel_id) else {
            return false;
        };

        for index in [edge.node_one, edge.node_two] {
            if let Some(node) = self.nodes.get_mut(index.0) {
                node.channels.retain(|c| c != channel_id);
            }
        }
        log::debug!("Graph: channel {} removed", channel_id);
        true
    }

    // =========================================================================
    // Local Channels
    // =========================================================================

    /// Insert or refresh one of our own channels with its known liquidity
    #[allow(clippy::too_many_arguments)]
    pub fn upsert_local_channel(
        &mut self,
        channel_id: ChannelId,
        local: NodeId,
        remote: NodeId,
        capacity: u64,
        policy: FeePolicy,
        can_send: u64,
        can_receive: u64,
        enabled: bool,
    ) -> Result<(), RoutingError> {
        self.announce_channel(channel_id, local, remote, capacity)?;

        let local_index = self.add_node(local);
        let remote_index = self.add_node(remote);
        let now = crate::unix_time();

        let edge = self.channels.get_mut(&channel_id)
            .ok_or(RoutingError::UnknownChannel(channel_id))?;
        edge.is_local = true;

        if let Some(slot) = edge.policy_from_mut(local_index) {
            *slot = Some(DirectionalPolicy {
                fee: policy,
                enabled,
                liquidity: Some(can_send),
                last_update: now,
            });
        }

        // The remote's fees come from its own gossip
        if let Some(Some(theirs)) = edge.policy_from_mut(remote_index) {
            theirs.liquidity = Some(can_receive);
            theirs.enabled = theirs.enabled && enabled;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::NodeKeys;

    fn node() -> NodeId {
        NodeKeys::generate().node_id()
    }

    #[test]
    fn test_fee_for() {
        let policy = FeePolicy { base_fee: 1, fee_rate_ppm: 1_000, cltv_expiry_delta: 40 };
        assert_eq!(policy.fee_for(100_000), 101);
        assert_eq!(policy.fee_for(0), 1);
    }

    #[test]
    fn test_gossip_builds_graph() {
        let (a, b) = (node(), node());
        let channel_id = ChannelId([1; 32]);
        let mut graph = RoutingGraph::new();

        graph.apply_gossip(&GossipMessage::ChannelAnnouncement {
            channel_id,
            node_one: a,
            node_two: b,
            capacity: 50_000,
        }).unwrap();
        graph.apply_gossip(&GossipMessage::ChannelUpdate {
            channel_id,
            from: a,
            policy: FeePolicy::default(),
            enabled: true,
            timestamp: 10,
        }).unwrap();

        let ia = graph.node_index(&a).unwrap();
        let ib = graph.node_index(&b).unwrap();
        let edge = graph.channel(&channel_id).unwrap();
        assert_eq!(edge.max_carry(ia), 50_000);
        // No policy for b -> a yet
        assert_eq!(edge.max_carry(ib), 0);
        assert_eq!(graph.node_count(), 2);

        // Stale update ignored
        graph.update_policy(&channel_id, &a, FeePolicy::default(), false, 5).unwrap();
        assert!(graph.channel(&channel_id).unwrap().policy_from(ia).unwrap().enabled);

        assert!(graph.remove_channel(&channel_id));
        assert_eq!(graph.channel_count(), 0);
        assert_eq!(graph.node_count(), 0);
    }

    #[test]
    fn test_local_channel_liquidity() {
        let (local, remote) = (node(), node());
        let channel_id = ChannelId([2; 32]);
        let mut graph = RoutingGraph::new();

        graph.upsert_local_channel(
            channel_id, local, remote, 100_000, FeePolicy::default(), 59_000, 39_000, true,
        ).unwrap();

        let edge = graph.channel(&channel_id).unwrap();
        assert!(edge.is_local);
        assert_eq!(edge.max_carry(graph.node_index(&local).unwrap()), 59_000);
    }

    #[test]
    fn test_rejects_bad_gossip() {
        let (a, b, c) = (node(), node(), node());
        let channel_id = ChannelId([3; 32]);
        let mut graph = RoutingGraph::new();

        assert!(graph.announce_channel(channel_id, a, a, 1_000).is_err());
        graph.announce_channel(channel_id, a, b, 1_000).unwrap();
        assert!(graph.announce_channel(channel_id, a, c, 1_000).is_err());
        assert!(graph.update_policy(&channel_id, &c, FeePolicy::default(), true, 1).is_err());
        assert!(matches!(
            graph.update_policy(&ChannelId([9; 32]), &a, FeePolicy::default(), true, 1),
            Err(RoutingError::UnknownChannel(_))
        ));
    }
}
