// =============================================================================
// ROMER - Path Finding
// =============================================================================
//
// Dijkstra over (fee + risk), run backwards from the destination so every
// hop knows the exact amount it has to carry. States are keyed by
// (node, hop count), which keeps the max-hop bound exact.
//
// Candidate routes come from Yen's k-shortest loopless paths on top of that
// search. The sequence is lazy and finite; excluding a channel restarts it
// without ever producing a route twice.
//
// Ordering of candidates: weight, then total fee, then hop count.
//
// =============================================================================

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use super::graph::{NodeIndex, RoutingGraph};
use super::{Route, RouteHop, RouteParams, RoutingError};
use crate::channels::ChannelId;
use crate::keys::NodeId;

/// One directed step of a path
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PathStep {
    pub channel_id: ChannelId,
    pub from: NodeIndex,
    pub to: NodeIndex,
}

/// Ranking of a path or route
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct RouteCost {
    pub weight: u64,
    pub fee: u64,
    pub hops: usize,
}

/// Channels and nodes a search must avoid
#[derive(Clone, Debug, Default)]
pub struct Exclusions {
    pub channels: HashSet<ChannelId>,
    pub nodes: HashSet<NodeId>,
}

impl Exclusions {
    fn excludes_node(&self, graph: &RoutingGraph, index: NodeIndex) -> bool {
        !self.nodes.is_empty()
            && graph.node_id(index).map_or(false, |id| self.nodes.contains(&id))
    }
}

// =============================================================================
// Shortest Path
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
struct SearchState {
    cost: RouteCost,
    node: NodeIndex,
    /// Amount `node` must send over its next step
    amount: u64,
    /// Expiry delta of the HTLC `node` sends
    cltv: u32,
    /// Steps from `node` to the destination, last step first
    steps: Vec<PathStep>,
}

impl Ord for SearchState {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap
        other
            .cost
            .cmp(&self.cost)
            .then_with(|| other.node.cmp(&self.node))
    }
}

impl PartialOrd for SearchState {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Cheapest path from `from` to `to` able to deliver `amount`.
///
/// `from_is_sender` is false for Yen spur searches that start at a
/// forwarding node: that node charges its fee like any other hop.
#[allow(clippy::too_many_arguments)]
fn shortest_path(
    graph: &RoutingGraph,
    from: NodeIndex,
    to: NodeIndex,
    amount: u64,
    max_hops: usize,
    exclusions: &Exclusions,
    params: &RouteParams,
    from_is_sender: bool,
) -> Option<Vec<PathStep>> {
    let mut heap = BinaryHeap::new();
    let mut settled: HashSet<(NodeIndex, usize)> = HashSet::new();

    heap.push(SearchState {
        cost: RouteCost::default(),
        node: to,
        amount,
        cltv: params.final_cltv_delta,
        steps: Vec::new(),
    });

    while let Some(state) = heap.pop() {
        let hops = state.steps.len();

        if state.node == from && hops > 0 {
            let mut steps = state.steps;
            steps.reverse();
            return Some(steps);
        }

        if !settled.insert((state.node, hops)) || hops >= max_hops {
            continue;
        }

        for edge in graph.channels_of(state.node) {
            if exclusions.channels.contains(&edge.channel_id) {
                continue;
            }
            let Some(prev) = edge.other_end(state.node) else {
                continue;
            };

            // Loopless
            if prev == to || state.steps.iter().any(|s| s.from == prev) {
                continue;
            }
            if prev != from && exclusions.excludes_node(graph, prev) {
                continue;
            }

            let Some(policy) = edge.policy_from(prev) else {
                continue;
            };
            if !policy.enabled || edge.max_carry(prev) < state.amount {
                continue;
            }

            let risk = params.risk_cost(state.amount, state.cltv);

            // The sender charges itself nothing
            let (next_amount, next_cltv, fee) = if prev == from && from_is_sender {
                (state.amount, state.cltv, 0)
            } else {
                let fee = policy.fee.fee_for(state.amount);
                (
                    state.amount.saturating_add(fee),
                    state.cltv.saturating_add(policy.fee.cltv_expiry_delta),
                    fee,
                )
            };
            if next_cltv > params.max_total_cltv {
                continue;
            }

            let mut steps = state.steps.clone();
            steps.push(PathStep {
                channel_id: edge.channel_id,
                from: prev,
                to: state.node,
            });

            heap.push(SearchState {
                cost: RouteCost {
                    weight: state.cost.weight.saturating_add(fee).saturating_add(risk),
                    fee: state.cost.fee.saturating_add(fee),
                    hops: hops + 1,
                },
                node: prev,
                amount: next_amount,
                cltv: next_cltv,
                steps,
            });
        }
    }

    None
}

/// Cheapest path from `source` to `destination`
pub fn find_path(
    graph: &RoutingGraph,
    source: &NodeId,
    destination: &NodeId,
    amount: u64,
    params: &RouteParams,
    exclusions: &Exclusions,
) -> Result<Vec<PathStep>, RoutingError> {
    let from = graph.node_index(source).ok_or(RoutingError::UnknownNode(*source))?;
    let to = graph.node_index(destination).ok_or(RoutingError::UnknownNode(*destination))?;
    if from == to {
        return Err(RoutingError::SelfPayment);
    }

    shortest_path(graph, from, to, amount, params.max_hops, exclusions, params, true)
        .ok_or(RoutingError::NoRoute)
}

// =============================================================================
// Route Construction
// =============================================================================

/// Turn a path into hop amounts, fees and expiries
pub fn build_route(
    graph: &RoutingGraph,
    steps: &[PathStep],
    amount: u64,
    params: &RouteParams,
) -> Result<Route, RoutingError> {
    if steps.is_empty() {
        return Err(RoutingError::NoRoute);
    }

    let mut hops = Vec::with_capacity(steps.len());
    let mut carried = amount;
    let mut cltv = params.final_cltv_delta;
    let mut forwarding_fee = 0;

    for (i, step) in steps.iter().enumerate().rev() {
        let edge = graph.channel(&step.channel_id)
            .ok_or(RoutingError::UnknownChannel(step.channel_id))?;
        if edge.max_carry(step.from) < carried {
            return Err(RoutingError::InsufficientCapacity(step.channel_id));
        }
        let node_id = graph.node_id(step.to).ok_or(RoutingError::NoRoute)?;

        hops.push(RouteHop {
            channel_id: step.channel_id,
            node_id,
            amount: carried,
            fee: forwarding_fee,
            cltv_expiry: params.current_height.saturating_add(cltv),
            cltv_delta: cltv,
        });

        // Fee and delta of the node sending this step, unless it is us
        if i > 0 {
            let policy = edge.policy_from(step.from).ok_or(RoutingError::NoRoute)?;
            forwarding_fee = policy.fee.fee_for(carried);
            carried = carried.saturating_add(forwarding_fee);
            cltv = cltv.saturating_add(policy.fee.cltv_expiry_delta);
        }
    }

    if cltv > params.max_total_cltv {
        return Err(RoutingError::ExpiryTooFar);
    }

    hops.reverse();
    Ok(Route { hops })
}

/// Rank a built route the same way the search does
pub fn route_cost(route: &Route, params: &RouteParams) -> RouteCost {
    let risk: u64 = route.hops
        .iter()
        .map(|h| params.risk_cost(h.amount, h.cltv_delta))
        .fold(0u64, |acc, r| acc.saturating_add(r));

    RouteCost {
        weight: route.total_fee().saturating_add(risk),
        fee: route.total_fee(),
        hops: route.len(),
    }
}

fn path_key(path: &[PathStep]) -> Vec<ChannelId> {
    path.iter().map(|s| s.channel_id).collect()
}

// =============================================================================
// Route Candidates
// =============================================================================

/// Lazy, finite sequence of distinct routes, cheapest first.
///
/// Works on its own snapshot of the graph.
pub struct RouteCandidates {
    graph: RoutingGraph,
    source: NodeId,
    destination: NodeId,
    amount: u64,
    params: RouteParams,
    exclusions: Exclusions,

    /// Paths already taken from the Yen sequence
    accepted: Vec<Vec<PathStep>>,
    /// Deviations waiting to be ranked
    pending: Vec<(RouteCost, Vec<PathStep>)>,
    seen: HashSet<Vec<ChannelId>>,

    /// Survives restarts
    yielded: HashSet<Vec<ChannelId>>,
    produced: usize,
}

impl RouteCandidates {
    pub fn new(
        graph: RoutingGraph,
        source: NodeId,
        destination: NodeId,
        amount: u64,
        params: RouteParams,
    ) -> Self {
        RouteCandidates {
            graph,
            source,
            destination,
            amount,
            params,
            exclusions: Exclusions::default(),
            accepted: Vec::new(),
            pending: Vec::new(),
            seen: HashSet::new(),
            yielded: HashSet::new(),
            produced: 0,
        }
    }

    /// Never use this channel again for this payment
    pub fn exclude_channel(&mut self, channel_id: ChannelId) {
        if self.exclusions.channels.insert(channel_id) {
            log::debug!("Route search: excluding channel {}", channel_id);
            self.restart();
        }
    }

    pub fn exclude_node(&mut self, node_id: NodeId) {
        if node_id != self.source && node_id != self.destination
            && self.exclusions.nodes.insert(node_id)
        {
            self.restart();
        }
    }

    pub fn excluded_channels(&self) -> &HashSet<ChannelId> {
        &self.exclusions.channels
    }

    /// Swap in a newer graph snapshot (fresh liquidity)
    pub fn refresh(&mut self, graph: RoutingGraph) {
        self.graph = graph;
        self.restart();
    }

    /// Candidates handed out so far
    pub fn produced(&self) -> usize {
        self.produced
    }

    fn restart(&mut self) {
        self.accepted.clear();
        self.pending.clear();
        self.seen.clear();
    }

    /// Next path of the Yen sequence under the current exclusions
    fn next_path(&mut self) -> Option<Vec<PathStep>> {
        let src = self.graph.node_index(&self.source)?;
        let dst = self.graph.node_index(&self.destination)?;
        if src == dst {
            return None;
        }

        if self.accepted.is_empty() {
            let path = shortest_path(
                &self.graph, src, dst, self.amount, self.params.max_hops,
                &self.exclusions, &self.params, true,
            )?;
            self.seen.insert(path_key(&path));
            self.accepted.push(path.clone());
            return Some(path);
        }

        let last = self.accepted.last()?.clone();
        for i in 0..last.len() {
            let spur = last[i].from;
            let root = &last[..i];

            let mut exclusions = self.exclusions.clone();
            for path in &self.accepted {
                if path.len() > i && path[..i] == *root {
                    exclusions.channels.insert(path[i].channel_id);
                }
            }
            for step in root {
                if let Some(id) = self.graph.node_id(step.from) {
                    exclusions.nodes.insert(id);
                }
            }

            let remaining = self.params.max_hops.saturating_sub(i);
            if remaining == 0 {
                continue;
            }
            let Some(spur_path) = shortest_path(
                &self.graph, spur, dst, self.amount, remaining, &exclusions, &self.params,
                spur == src,
            ) else {
                continue;
            };

            let mut path = root.to_vec();
            path.extend(spur_path);
            if !self.seen.insert(path_key(&path)) {
                continue;
            }

            match build_route(&self.graph, &path, self.amount, &self.params) {
                Ok(route) => self.pending.push((route_cost(&route, &self.params), path)),
                Err(e) => log::trace!("Route search: dropping deviation: {}", e),
            }
        }

        let best = self.pending
            .iter()
            .enumerate()
            .min_by_key(|(_, (cost, _))| *cost)
            .map(|(i, _)| i)?;
        let (_, path) = self.pending.remove(best);
        self.accepted.push(path.clone());
        Some(path)
    }
}

impl Iterator for RouteCandidates {
    type Item = Route;

    fn next(&mut self) -> Option<Route> {
        loop {
            if self.produced >= self.params.max_candidates {
                return None;
            }

            let path = self.next_path()?;
            if !self.yielded.insert(path_key(&path)) {
                continue;
            }

            match build_route(&self.graph, &path, self.amount, &self.params) {
                Ok(route) => {
                    self.produced += 1;
                    return Some(route);
                }
                Err(e) => log::trace!("Route search: skipping path: {}", e),
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::NodeKeys;
    use crate::routing::graph::FeePolicy;

    struct TestGraph {
        graph: RoutingGraph,
        nodes: Vec<NodeId>,
        next_channel: u8,
    }

    impl TestGraph {
        fn new(count: usize) -> Self {
            let mut nodes: Vec<NodeId> = (0..count).map(|_| NodeKeys::generate().node_id()).collect();
            nodes.sort();
            TestGraph { graph: RoutingGraph::new(), nodes, next_channel: 1 }
        }

        /// Channel between two nodes with the same policy both ways
        fn connect(&mut self, a: usize, b: usize, capacity: u64, base_fee: u64) -> ChannelId {
            let channel_id = ChannelId([self.next_channel; 32]);
            self.next_channel += 1;

            let policy = FeePolicy { base_fee, fee_rate_ppm: 0, cltv_expiry_delta: 40 };
            self.graph.announce_channel(channel_id, self.nodes[a], self.nodes[b], capacity).unwrap();
            for from in [a, b] {
                self.graph.update_policy(&channel_id, &self.nodes[from], policy, true, 1).unwrap();
            }
            channel_id
        }
    }

    fn params() -> RouteParams {
        RouteParams { risk_factor: 0, current_height: 100, ..RouteParams::default() }
    }

    #[test]
    fn test_route_amounts_and_expiry() {
        let mut t = TestGraph::new(3);
        let ab = t.connect(0, 1, 100_000, 5);
        let bc = t.connect(1, 2, 100_000, 7);
        t.graph.update_policy(
            &bc, &t.nodes[1],
            FeePolicy { base_fee: 1, fee_rate_ppm: 1_000, cltv_expiry_delta: 40 }, true, 2,
        ).unwrap();

        let steps = find_path(&t.graph, &t.nodes[0], &t.nodes[2], 10_000, &params(), &Exclusions::default()).unwrap();
        let route = build_route(&t.graph, &steps, 10_000, &params()).unwrap();

        assert_eq!(route.channel_ids(), vec![ab, bc]);
        // B keeps 1 + 10_000 * 1000 / 1e6 = 11
        assert_eq!(route.hops[0].amount, 10_011);
        assert_eq!(route.hops[0].fee, 11);
        assert_eq!(route.hops[1].amount, 10_000);
        assert_eq!(route.hops[1].fee, 0);
        assert_eq!(route.hops[1].cltv_expiry, 118);
        assert_eq!(route.hops[0].cltv_expiry, 158);
        assert_eq!(route.total_fee(), 11);
        assert_eq!(route.destination(), Some(t.nodes[2]));
    }

    #[test]
    fn test_capacity_and_disabled_filtering() {
        let mut t = TestGraph::new(4);
        t.connect(0, 1, 100_000, 1);
        let small = t.connect(1, 3, 5_000, 1);
        t.connect(0, 2, 100_000, 1);
        let disabled = t.connect(2, 3, 100_000, 1);
        t.graph.update_policy(
            &disabled, &t.nodes[2], FeePolicy { base_fee: 1, fee_rate_ppm: 0, cltv_expiry_delta: 40 }, false, 2,
        ).unwrap();

        let result = find_path(&t.graph, &t.nodes[0], &t.nodes[3], 10_000, &params(), &Exclusions::default());
        assert_eq!(result, Err(RoutingError::NoRoute));

        let steps = find_path(&t.graph, &t.nodes[0], &t.nodes[3], 1_000, &params(), &Exclusions::default()).unwrap();
        assert_eq!(steps[1].channel_id, small);
    }

    #[test]
    fn test_max_hops_bound() {
        let mut t = TestGraph::new(5);
        for i in 0..4 {
            t.connect(i, i + 1, 100_000, 1);
        }

        let mut p = params();
        p.max_hops = 3;
        let result = find_path(&t.graph, &t.nodes[0], &t.nodes[4], 1_000, &p, &Exclusions::default());
        assert_eq!(result, Err(RoutingError::NoRoute));

        p.max_hops = 4;
        assert_eq!(find_path(&t.graph, &t.nodes[0], &t.nodes[4], 1_000, &p, &Exclusions::default()).unwrap().len(), 4);
    }

    #[test]
    fn test_tie_break_fewest_hops() {
        // 0 -> 1 -> 4 costs 2; 0 -> 2 -> 3 -> 4 costs 1 + 1 = 2
        let mut t = TestGraph::new(5);
        t.connect(0, 1, 100_000, 2);
        let short = t.connect(1, 4, 100_000, 2);
        t.connect(0, 2, 100_000, 1);
        t.connect(2, 3, 100_000, 1);
        t.connect(3, 4, 100_000, 1);

        let steps = find_path(&t.graph, &t.nodes[0], &t.nodes[4], 1_000, &params(), &Exclusions::default()).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].channel_id, short);
    }

    #[test]
    fn test_candidates_in_cost_order() {
        // Three disjoint two-hop paths with fees 1, 2, 3
        let mut t = TestGraph::new(5);
        let mut middles = Vec::new();
        for (mid, fee) in [(1, 1), (2, 2), (3, 3)] {
            t.connect(0, mid, 100_000, 1);
            middles.push(t.connect(mid, 4, 100_000, fee));
        }

        let candidates = RouteCandidates::new(t.graph.clone(), t.nodes[0], t.nodes[4], 1_000, params());
        let routes: Vec<Route> = candidates.collect();

        assert_eq!(routes.len(), 3);
        let fees: Vec<u64> = routes.iter().map(|r| r.total_fee()).collect();
        assert_eq!(fees, vec![1, 2, 3]);
        for (route, middle) in routes.iter().zip(&middles) {
            assert_eq!(route.hops[1].channel_id, *middle);
        }
    }

    #[test]
    fn test_candidates_charge_spur_node_fee() {
        // 0 = sender, 1 = shared first hop, 2 and 3 = detours, 4 = destination
        let mut t = TestGraph::new(5);
        t.connect(0, 1, 100_000, 0);
        let direct = t.connect(1, 4, 100_000, 0);
        let pricey = t.connect(1, 2, 100_000, 100);
        t.connect(2, 4, 100_000, 0);
        let cheap = t.connect(1, 3, 100_000, 1);
        t.connect(3, 4, 100_000, 1);

        let candidates = RouteCandidates::new(t.graph.clone(), t.nodes[0], t.nodes[4], 1_000, params());
        let routes: Vec<Route> = candidates.collect();

        let fees: Vec<u64> = routes.iter().map(|r| r.total_fee()).collect();
        assert_eq!(fees, vec![0, 2, 100]);
        assert!(routes[0].contains_channel(&direct));
        assert!(routes[1].contains_channel(&cheap));
        assert!(routes[2].contains_channel(&pricey));
    }

    #[test]
    fn test_exclusion_restarts_without_repeats() {
        let mut t = TestGraph::new(5);
        let mut middles = Vec::new();
        for (mid, fee) in [(1, 1), (2, 2), (3, 3)] {
            t.connect(0, mid, 100_000, 1);
            middles.push(t.connect(mid, 4, 100_000, fee));
        }

        let mut candidates = RouteCandidates::new(t.graph.clone(), t.nodes[0], t.nodes[4], 1_000, params());
        let first = candidates.next().unwrap();
        assert!(first.contains_channel(&middles[0]));

        // First route failed at its second hop
        candidates.exclude_channel(first.hops[1].channel_id);

        let second = candidates.next().unwrap();
        assert!(!second.contains_channel(&middles[0]));
        assert!(second.contains_channel(&middles[1]));

        // Restarting again must not hand out the second route twice
        candidates.exclude_channel(ChannelId([0xEE; 32]));
        let third = candidates.next().unwrap();
        assert!(third.contains_channel(&middles[2]));
        assert!(candidates.next().is_none());
        assert_eq!(candidates.produced(), 3);
    }

    #[test]
    fn test_self_payment_rejected() {
        let mut t = TestGraph::new(2);
        t.connect(0, 1, 100_000, 1);
        let result = find_path(&t.graph, &t.nodes[0], &t.nodes[0], 1_000, &params(), &Exclusions::default());
        assert_eq!(result, Err(RoutingError::SelfPayment));
    }
}
