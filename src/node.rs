// =============================================================================
// ROMER - Node
// =============================================================================
//
// The node context owns every component and is the only public entry point:
//
//   ┌────────────┐  inbox   ┌──────────────────────────────────────────────┐
//   │ Transport  │─────────▶│ Node                                         │
//   └────────────┘          │                                              │
//         ▲                 │  registry: channel id -> Mutex<Machine>      │
//         │ send            │  graph    (RwLock)                           │
//         └─────────────────│  book     (HTLCs we offered or forward)      │
//                           │  invoices, store, event bus, coordinator     │
//                           └──────────────────────────────────────────────┘
//
// Each channel is driven under its own async mutex; different channels run
// concurrently. Outputs of one machine can create work on another (forward an
// HTLC, relay a fulfill upstream). That work goes through a queue drained one
// channel lock at a time, so two machine locks are never held together.
//
// Messages produced by a machine are handed to the transport before its lock
// is released, which keeps per-channel message order.
//
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::channels::machine::UpdateTag;
use crate::channels::{
    Balance, ChannelError, ChannelId, ChannelInfo, ChannelMachine, ChannelParty, ChannelState,
    ChannelUpdate, HtlcFailReason, HtlcId, MachineOutput, PaymentHash, PaymentPreimage,
};
use crate::channels::htlc::{Htlc, HtlcSet};
use crate::config::{Network, NodeConfig};
use crate::error::NodeError;
use crate::events::{EventBus, EventHandler, NodeEvent};
use crate::invoice::{Invoice, InvoiceError, InvoiceRecord};
use crate::keys::{NodeId, NodeKeys};
use crate::messages::{HopPayload, Onion, OpenChannel, PeerMessage};
use crate::payment::{
    AttemptFailure, AttemptOutcome, DispatchFuture, PaymentCoordinator, PaymentRecord,
    PaymentSuccess, RouteDispatcher,
};
use crate::routing::{GossipMessage, Route, RouteCandidates, RouteParams, RoutingError, RoutingGraph};
use crate::store::{ChannelStore, MemoryStore, SledStore};
use crate::transport::{Inbox, PeerTransport};
use crate::unix_time;

type Machine = Arc<AsyncMutex<ChannelMachine>>;

// =============================================================================
// Public Summaries
// =============================================================================

/// Totals over every open channel
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Balances {
    /// Our side of every channel not yet closed
    pub total_lightning_balance: u64,
    /// What active channels can still send
    pub outbound_capacity: u64,
    /// What active channels can still receive
    pub inbound_capacity: u64,
    /// Locked in HTLCs either way
    pub pending_htlcs: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub network: Network,
    pub alias: String,
    pub connected_peers: usize,
    pub usable_channels: usize,
    pub channel_count: usize,
    pub best_block_height: u32,
    pub halted: bool,
    pub graph_nodes: usize,
    pub graph_channels: usize,
}

// =============================================================================
// Internal Bookkeeping
// =============================================================================

/// Cached view of one channel, refreshed after every machine step
#[derive(Clone, Debug)]
struct ChannelView {
    info: ChannelInfo,
    state: ChannelState,
    balance: Balance,
    temporary_id: ChannelId,
}

impl ChannelView {
    fn of(machine: &ChannelMachine) -> Self {
        let channel = machine.channel();
        ChannelView {
            info: channel.info(),
            state: channel.state.clone(),
            balance: channel.balance.clone(),
            temporary_id: channel.temporary_id,
        }
    }

    fn remote(&self) -> NodeId {
        self.info.remote_node
    }
}

/// Upstream side of an HTLC we forward
#[derive(Clone, Copy, Debug)]
struct Incoming {
    channel_id: ChannelId,
    htlc_id: HtlcId,
    amount_in: u64,
    amount_out: u64,
}

/// A payment attempt waiting on its first-hop HTLC
struct Waiter {
    channel_id: ChannelId,
    acked: Option<oneshot::Sender<Result<(), AttemptFailure>>>,
    resolved: Option<oneshot::Sender<AttemptOutcome>>,
}

#[derive(Default)]
struct HtlcBook {
    /// Our HTLCs queued but not yet committed
    own_tags: HashMap<(ChannelId, UpdateTag), PaymentHash>,
    /// Our committed HTLCs
    own_htlcs: HashMap<(ChannelId, HtlcId), PaymentHash>,
    waiters: HashMap<PaymentHash, Waiter>,
    /// Outgoing forwards queued on (outgoing channel, tag)
    pending_forwards: HashMap<(ChannelId, UpdateTag), Incoming>,
    /// Committed forwards on (outgoing channel, htlc id)
    forwards: HashMap<(ChannelId, HtlcId), Incoming>,
    /// Channels we opened, waiting for funding signatures
    openings: HashMap<ChannelId, oneshot::Sender<Result<ChannelId, NodeError>>>,
}

impl HtlcBook {
    fn forget_payment(&mut self, payment_hash: &PaymentHash) {
        self.waiters.remove(payment_hash);
        self.own_tags.retain(|_, h| h != payment_hash);
        self.own_htlcs.retain(|_, h| h != payment_hash);
    }
}

#[derive(Default)]
struct Registry {
    machines: HashMap<ChannelId, Machine>,
    /// Temporary id -> final id
    aliases: HashMap<ChannelId, ChannelId>,
    views: HashMap<ChannelId, ChannelView>,
}

impl Registry {
    fn resolve(&self, channel_id: &ChannelId) -> Option<ChannelId> {
        if self.machines.contains_key(channel_id) {
            Some(*channel_id)
        } else {
            self.aliases.get(channel_id).copied()
        }
    }
}

/// Result of one machine call, processed after the lock is released
struct Step {
    channel_id: ChannelId,
    before: ChannelState,
    view: ChannelView,
    output: MachineOutput,
}

enum Work {
    Step(Step),
    Submit {
        channel_id: ChannelId,
        update: ChannelUpdate,
        forward: Option<Incoming>,
    },
}

struct NodeInner {
    config: NodeConfig,
    keys: NodeKeys,
    node_id: NodeId,
    store: Arc<dyn ChannelStore>,
    transport: Arc<dyn PeerTransport>,
    graph: RwLock<RoutingGraph>,
    registry: RwLock<Registry>,
    book: Mutex<HtlcBook>,
    invoices: Mutex<HashMap<PaymentHash, InvoiceRecord>>,
    events: EventBus,
    coordinator: PaymentCoordinator,
    height: AtomicU32,
    next_key_index: AtomicU64,
    halted: AtomicBool,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

// =============================================================================
// Node
// =============================================================================

/// Handle to a running node. Clones share the same node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

/// Open the store named by the config: sled under `data_dir`, else memory
pub fn open_store(config: &NodeConfig) -> Result<Arc<dyn ChannelStore>, NodeError> {
    let store: Arc<dyn ChannelStore> = match &config.data_dir {
        Some(dir) => Arc::new(SledStore::open(dir)?),
        None => Arc::new(MemoryStore::new()),
    };
    Ok(store)
}

impl Node {
    /// Build a node and restore its channels, invoices and local graph
    pub fn new(
        config: NodeConfig,
        keys: NodeKeys,
        store: Arc<dyn ChannelStore>,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Self, NodeError> {
        config.validate()?;
        let node_id = keys.node_id();
        let events = EventBus::new(config.event_capacity);
        let coordinator = PaymentCoordinator::new(
            store.clone(),
            events.clone(),
            config.max_payment_attempts,
        );

        let height = store.load_height()?.unwrap_or(0);
        let mut registry = Registry::default();
        let mut next_key_index = 0;
        let mut htlc_sets = Vec::new();
        for record in store.load_channels()? {
            next_key_index = next_key_index.max(record.key_index + 1);
            let machine = ChannelMachine::restore(record, &keys, store.clone(), height)?;
            let channel_id = machine.channel_id();
            htlc_sets.push((channel_id, machine.channel().htlcs.clone()));
            registry.views.insert(channel_id, ChannelView::of(&machine));
            registry.aliases.insert(machine.channel().temporary_id, channel_id);
            registry.machines.insert(channel_id, Arc::new(AsyncMutex::new(machine)));
        }

        let invoices = store
            .load_invoices()?
            .into_iter()
            .map(|r| (r.invoice.payment_hash, r))
            .collect::<HashMap<_, _>>();

        let book = HtlcBook {
            forwards: restore_forwards(&htlc_sets),
            ..HtlcBook::default()
        };

        log::info!(
            "Node {} ({}) on {} at height {}: {} channels, {} forwards, {} invoices restored",
            node_id.short(),
            config.alias,
            config.network,
            height,
            registry.machines.len(),
            book.forwards.len(),
            invoices.len()
        );

        let inner = NodeInner {
            node_id,
            keys,
            store,
            transport,
            graph: RwLock::new(RoutingGraph::new()),
            registry: RwLock::new(registry),
            book: Mutex::new(book),
            invoices: Mutex::new(invoices),
            events,
            coordinator,
            height: AtomicU32::new(height),
            next_key_index: AtomicU64::new(next_key_index),
            halted: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            config,
        };

        let views: Vec<ChannelView> = inner.read_registry(|r| r.views.values().cloned().collect());
        for view in &views {
            inner.refresh_graph(view);
        }

        Ok(Node { inner: Arc::new(inner) })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start handling messages from the inbox
    pub fn start(&self, mut inbox: Inbox) {
        let node = self.clone();
        let handle = tokio::spawn(async move {
            while let Some((from, message)) = inbox.recv().await {
                if node.inner.stopped.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = node.handle_message(from, message).await {
                    log::warn!("Message from {} failed: {}", from.short(), e);
                }
            }
            log::debug!("Node {}: inbox closed", node.inner.node_id.short());
        });

        match self.inner.tasks.lock() {
            Ok(mut tasks) => tasks.push(handle),
            Err(_) => log::error!("Task list poisoned"),
        }
        log::info!("Node {} started", self.inner.node_id.short());
    }

    /// Stop background tasks. Every later call returns `Stopped`.
    pub fn shutdown(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        log::info!("Node {} shut down", self.inner.node_id.short());
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn is_halted(&self) -> bool {
        self.inner.halted.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Events
    // =========================================================================

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    pub fn register_handler(&self, handler: Arc<dyn EventHandler>) {
        self.inner.events.register_handler(handler);
    }

    // =========================================================================
    // Chain and Gossip
    // =========================================================================

    /// A new block arrived at `height`
    pub async fn process_block(&self, height: u32) -> Result<(), NodeError> {
        self.inner.check_running()?;
        let previous = self.inner.height.fetch_max(height, Ordering::SeqCst);
        if height > previous {
            if let Err(e) = self.inner.store.persist_height(height) {
                self.inner.halt(&e.to_string());
                return Err(e.into());
            }
        }

        let ids: Vec<ChannelId> = self.inner.read_registry(|r| r.machines.keys().copied().collect());
        for channel_id in ids {
            let (_, step) = self.inner.step(&channel_id, |m| Ok(((), m.on_block(height)?))).await?;
            self.inner.drive(step).await?;
        }
        Ok(())
    }

    /// Announcements for our node and its active channels
    pub fn gossip(&self) -> Vec<GossipMessage> {
        let inner = &self.inner;
        let mut messages = vec![GossipMessage::NodeAnnouncement {
            node_id: inner.node_id,
            alias: inner.config.alias.clone(),
        }];

        let views: Vec<ChannelView> = inner.read_registry(|r| r.views.values().cloned().collect());
        for view in views.iter().filter(|v| v.state.is_active()) {
            messages.push(GossipMessage::ChannelAnnouncement {
                channel_id: view.info.channel_id,
                node_one: inner.node_id,
                node_two: view.remote(),
                capacity: view.info.capacity,
            });
            messages.push(GossipMessage::ChannelUpdate {
                channel_id: view.info.channel_id,
                from: inner.node_id,
                policy: inner.config.forwarding_fee,
                enabled: true,
                timestamp: unix_time(),
            });
        }
        messages
    }

    /// Feed gossip into the routing graph. Returns how many were applied.
    pub fn apply_gossip(&self, messages: &[GossipMessage]) -> usize {
        let Ok(mut graph) = self.inner.graph.write() else {
            log::error!("Routing graph poisoned");
            return 0;
        };

        let mut applied = 0;
        for msg in messages {
            match graph.apply_gossip(msg) {
                Ok(()) => applied += 1,
                Err(e) => log::debug!("Gossip ignored: {}", e),
            }
        }
        applied
    }

    // =========================================================================
    // Channels
    // =========================================================================

    /// Open a channel we fund. Returns the final channel id once both
    /// funding signatures are exchanged; confirmations come from blocks.
    pub async fn open_channel(
        &self,
        remote: NodeId,
        capacity: u64,
        push_amount: u64,
    ) -> Result<ChannelId, NodeError> {
        let inner = &self.inner;
        inner.check_running()?;
        if !inner.transport.is_connected(&remote) {
            return Err(crate::transport::TransportError::PeerOffline(remote).into());
        }

        let key_index = inner.next_key_index.fetch_add(1, Ordering::SeqCst);
        let (machine, open) = ChannelMachine::open_outbound(
            &inner.keys,
            key_index,
            remote,
            capacity,
            push_amount,
            inner.config.channel.clone(),
            inner.store.clone(),
            inner.height(),
        )?;
        let temporary_id = machine.channel_id();

        let (tx, rx) = oneshot::channel();
        inner.with_book(|book| {
            book.openings.insert(temporary_id, tx);
        });
        inner.register_machine(machine);

        inner.events.emit(NodeEvent::ChannelPending {
            channel_id: temporary_id,
            remote_node: remote,
            capacity,
            is_funder: true,
        });

        if let Err(e) = inner.transport.send(&remote, open) {
            inner.forget_opening(&temporary_id);
            return Err(e.into());
        }

        match timeout(inner.config.ack_timeout(), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(NodeError::Channel(ChannelError::FundingError(
                "Channel opening abandoned".to_string(),
            ))),
            Err(_) => {
                log::warn!("Channel {}: no funding signatures from {}", temporary_id, remote.short());
                inner.forget_opening(&temporary_id);
                Err(NodeError::Timeout)
            }
        }
    }

    pub fn list_channels(&self) -> Vec<ChannelInfo> {
        let mut channels: Vec<ChannelInfo> = self.inner.read_registry(|r| {
            r.views.values().map(|v| v.info.clone()).collect()
        });
        channels.sort_by_key(|c| c.channel_id);
        channels
    }

    pub fn channel_balance(&self, channel_id: &ChannelId) -> Result<Balance, NodeError> {
        self.inner
            .view(channel_id)
            .map(|v| v.balance)
            .ok_or(NodeError::UnknownChannel(*channel_id))
    }

    pub fn balances(&self) -> Balances {
        let views: Vec<ChannelView> = self.inner.read_registry(|r| r.views.values().cloned().collect());
        views.iter().fold(Balances::default(), |mut acc, view| {
            if !view.state.is_closed() {
                acc.total_lightning_balance += view.balance.local;
                acc.pending_htlcs += view.balance.pending_offered + view.balance.pending_received;
            }
            if view.state.is_active() {
                acc.outbound_capacity += view.info.can_send;
                acc.inbound_capacity += view.info.can_receive;
            }
            acc
        })
    }

    pub fn status(&self) -> NodeStatus {
        let inner = &self.inner;
        let views: Vec<ChannelView> = inner.read_registry(|r| r.views.values().cloned().collect());

        let mut peers: Vec<NodeId> = views.iter().map(|v| v.remote()).collect();
        peers.sort();
        peers.dedup();
        let connected_peers = peers.iter().filter(|p| inner.transport.is_connected(p)).count();

        let (graph_nodes, graph_channels) = inner
            .graph
            .read()
            .map(|g| (g.node_count(), g.channel_count()))
            .unwrap_or((0, 0));

        NodeStatus {
            node_id: inner.node_id,
            network: inner.config.network,
            alias: inner.config.alias.clone(),
            connected_peers,
            usable_channels: views.iter().filter(|v| v.state.is_active()).count(),
            channel_count: views.len(),
            best_block_height: inner.height(),
            halted: self.is_halted(),
            graph_nodes,
            graph_channels,
        }
    }

    /// Start a cooperative close
    pub async fn close_channel(&self, channel_id: &ChannelId) -> Result<(), NodeError> {
        self.inner.check_running()?;
        let (_, step) = self.inner.step(channel_id, |m| Ok(((), m.shutdown()?))).await?;
        self.inner.drive(step).await
    }

    /// Broadcast our latest commitment
    pub async fn force_close_channel(&self, channel_id: &ChannelId) -> Result<(), NodeError> {
        self.inner.check_running()?;
        self.inner.force_close(channel_id, "requested by user").await
    }

    /// The counterparty broadcast commitment `commitment_number`. Returns
    /// true when it was revoked and all funds were claimed.
    pub async fn handle_remote_broadcast(
        &self,
        channel_id: &ChannelId,
        commitment_number: u64,
    ) -> Result<bool, NodeError> {
        let inner = &self.inner;
        inner.check_running()?;

        let (revoked, step) = inner
            .step(channel_id, |m| {
                let revoked = m.is_revoked(commitment_number);
                let out = m.on_remote_broadcast(commitment_number)?;
                Ok((revoked, out))
            })
            .await?;

        if revoked {
            inner.events.emit(NodeEvent::BreachDetected {
                channel_id: step.channel_id,
                commitment_number,
            });
        }
        inner.drive(step).await?;
        Ok(revoked)
    }

    // =========================================================================
    // Payments
    // =========================================================================

    /// Pay `amount` to `destination` for `payment_hash`
    pub async fn send_payment(
        &self,
        destination: NodeId,
        amount: u64,
        payment_hash: PaymentHash,
    ) -> Result<PaymentSuccess, NodeError> {
        let params = self.inner.config.route_params(self.inner.height());
        self.pay(destination, amount, payment_hash, params).await
    }

    /// Pay an encoded invoice
    pub async fn send(&self, encoded: &str) -> Result<PaymentSuccess, NodeError> {
        let inner = &self.inner;
        inner.check_running()?;

        let invoice = Invoice::decode_for(encoded, inner.config.network)?;
        if invoice.is_expired() {
            return Err(InvoiceError::Expired.into());
        }

        let mut params = inner.config.route_params(inner.height());
        params.final_cltv_delta = params.final_cltv_delta.max(invoice.min_final_cltv);

        log::info!(
            "Paying invoice {} ({} sat, '{}')",
            invoice.payment_hash.short(),
            invoice.amount,
            invoice.description
        );
        self.pay(invoice.payee, invoice.amount, invoice.payment_hash, params).await
    }

    async fn pay(
        &self,
        destination: NodeId,
        amount: u64,
        payment_hash: PaymentHash,
        params: RouteParams,
    ) -> Result<PaymentSuccess, NodeError> {
        let inner = &self.inner;
        inner.check_running()?;

        if destination == inner.node_id {
            return Err(RoutingError::SelfPayment.into());
        }
        if amount == 0 {
            return Err(ChannelError::BelowHtlcMinimum.into());
        }

        let sendable = inner.read_registry(|r| {
            r.views
                .values()
                .filter(|v| v.state.is_active())
                .map(|v| v.info.can_send)
                .max()
                .unwrap_or(0)
        });
        if sendable < amount {
            log::warn!("Payment {}: {} sat exceeds sendable {}", payment_hash.short(), amount, sendable);
            return Err(NodeError::Payment(crate::payment::PaymentFailure::InsufficientBalance));
        }

        let graph = inner.graph.read().map(|g| g.clone()).unwrap_or_default();
        let candidates = RouteCandidates::new(graph, inner.node_id, destination, amount, params);

        let result = inner
            .coordinator
            .pay(inner.as_ref(), payment_hash, destination, amount, candidates)
            .await
            .map_err(NodeError::from);

        if let Err(NodeError::Persistence(e)) = &result {
            inner.halt(e);
        }
        result
    }

    /// Stop retrying a payment; returns once its last attempt resolved
    pub async fn cancel_payment(&self, payment_hash: &PaymentHash) -> Result<(), NodeError> {
        self.inner.check_running()?;
        Ok(self.inner.coordinator.cancel(payment_hash).await?)
    }

    pub fn list_payments(&self) -> Result<Vec<PaymentRecord>, NodeError> {
        Ok(self.inner.coordinator.list_payments()?)
    }

    // =========================================================================
    // Invoices
    // =========================================================================

    /// Create an invoice for `amount` and return its encoded form
    pub fn receive(&self, amount: u64, description: &str) -> Result<String, NodeError> {
        let inner = &self.inner;
        inner.check_running()?;

        let preimage = PaymentPreimage::generate();
        let invoice = Invoice::new(
            inner.config.network,
            preimage.payment_hash(),
            amount,
            description,
            inner.node_id,
            inner.config.invoice_expiry_secs,
            inner.config.final_cltv_delta,
        )?;
        let encoded = invoice.encode(&inner.keys)?;
        let record = InvoiceRecord::new(invoice, encoded.clone(), preimage);

        if let Err(e) = inner.store.persist_invoice(&record) {
            inner.halt(&e.to_string());
            return Err(e.into());
        }

        log::info!("Invoice {} for {} sat", record.invoice.payment_hash.short(), amount);
        if let Ok(mut invoices) = inner.invoices.lock() {
            invoices.insert(record.invoice.payment_hash, record);
        }
        Ok(encoded)
    }

    /// Whether one of our invoices has been settled
    pub fn invoice_paid(&self, encoded: &str) -> Result<bool, NodeError> {
        let invoice = Invoice::decode_for(encoded, self.inner.config.network)?;
        let invoices = self.inner.invoices.lock().map_err(|_| InvoiceError::UnknownInvoice)?;
        let paid = invoices.get(&invoice.payment_hash).map(|r| r.is_paid());
        paid.ok_or_else(|| InvoiceError::UnknownInvoice.into())
    }

    // =========================================================================
    // Peer Messages
    // =========================================================================

    /// Handle one message from a peer
    pub async fn handle_message(&self, from: NodeId, message: PeerMessage) -> Result<(), NodeError> {
        let inner = &self.inner;
        inner.check_running()?;
        log::trace!("Node {}: {} from {}", inner.node_id.short(), message.name(), from.short());

        let message = match message {
            PeerMessage::OpenChannel(open) => return inner.accept_channel(from, &open),
            other => other,
        };

        let channel_id = message.channel_id();
        let Some(view) = inner.view(&channel_id) else {
            log::debug!("Node {}: {} for unknown channel {}", inner.node_id.short(), message.name(), channel_id);
            return Ok(());
        };
        if view.remote() != from {
            log::warn!("Node {}: {} for {} from a stranger {}", inner.node_id.short(), message.name(), channel_id, from.short());
            return Ok(());
        }

        let (_, step) = inner.step(&channel_id, |m| Ok(((), m.handle_message(message)?))).await?;
        inner.drive(step).await
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("node_id", &self.inner.node_id)
            .field("alias", &self.inner.config.alias)
            .field("height", &self.inner.height())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Node Internals
// =============================================================================

impl NodeInner {
    fn height(&self) -> u32 {
        self.height.load(Ordering::SeqCst)
    }

    fn check_running(&self) -> Result<(), NodeError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(NodeError::Stopped);
        }
        if self.halted.load(Ordering::SeqCst) {
            return Err(NodeError::Halted);
        }
        Ok(())
    }

    /// Stop accepting work after a failed write
    fn halt(&self, reason: &str) {
        if !self.halted.swap(true, Ordering::SeqCst) {
            log::error!("Node {} halted: {}", self.node_id.short(), reason);
            self.events.emit(NodeEvent::NodeHalted { reason: reason.to_string() });
        }
    }

    fn read_registry<T>(&self, f: impl FnOnce(&Registry) -> T) -> T
    where
        T: Default,
    {
        match self.registry.read() {
            Ok(registry) => f(&registry),
            Err(_) => {
                log::error!("Channel registry poisoned");
                T::default()
            }
        }
    }

    fn with_book<T>(&self, f: impl FnOnce(&mut HtlcBook) -> T) -> Option<T> {
        match self.book.lock() {
            Ok(mut book) => Some(f(&mut book)),
            Err(_) => {
                log::error!("HTLC book poisoned");
                None
            }
        }
    }

    fn view(&self, channel_id: &ChannelId) -> Option<ChannelView> {
        self.read_registry(|r| r.resolve(channel_id).and_then(|id| r.views.get(&id).cloned()))
    }

    fn machine(&self, channel_id: &ChannelId) -> Result<Machine, NodeError> {
        self.read_registry(|r| r.resolve(channel_id).and_then(|id| r.machines.get(&id).cloned()))
            .ok_or(NodeError::UnknownChannel(*channel_id))
    }

    fn register_machine(&self, machine: ChannelMachine) {
        let channel_id = machine.channel_id();
        let view = ChannelView::of(&machine);
        match self.registry.write() {
            Ok(mut registry) => {
                registry.views.insert(channel_id, view);
                registry.machines.insert(channel_id, Arc::new(AsyncMutex::new(machine)));
            }
            Err(_) => log::error!("Channel registry poisoned"),
        }
    }

    fn forget_opening(&self, temporary_id: &ChannelId) {
        self.with_book(|book| book.openings.remove(temporary_id));
        if let Ok(mut registry) = self.registry.write() {
            registry.machines.remove(temporary_id);
            registry.views.remove(temporary_id);
        }
    }

    fn accept_channel(&self, from: NodeId, open: &OpenChannel) -> Result<(), NodeError> {
        let key_index = self.next_key_index.fetch_add(1, Ordering::SeqCst);
        let accepted = ChannelMachine::accept_inbound(
            &self.keys,
            key_index,
            from,
            open,
            self.store.clone(),
            self.height(),
        );

        let (machine, accept) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                log::warn!("Rejecting channel {} from {}: {}", open.temporary_id, from.short(), e);
                let error = PeerMessage::Error {
                    channel_id: open.temporary_id,
                    message: e.to_string(),
                };
                if let Err(te) = self.transport.send(&from, error) {
                    log::debug!("Could not report rejection: {}", te);
                }
                return Err(e.into());
            }
        };

        self.register_machine(machine);
        self.events.emit(NodeEvent::ChannelPending {
            channel_id: open.temporary_id,
            remote_node: from,
            capacity: open.capacity,
            is_funder: false,
        });
        self.transport.send(&from, accept)?;
        Ok(())
    }

    // =========================================================================
    // Machine Steps
    // =========================================================================

    /// Run `f` on one machine under its lock and send what it produced
    async fn step<T, F>(&self, channel_id: &ChannelId, f: F) -> Result<(T, Step), NodeError>
    where
        F: FnOnce(&mut ChannelMachine) -> Result<(T, MachineOutput), ChannelError>,
    {
        let machine = self.machine(channel_id)?;
        let mut machine = machine.lock().await;
        let key = machine.channel_id();
        let before = machine.channel().state.clone();

        let (value, mut output) = match f(&mut *machine) {
            Ok(done) => done,
            Err(ChannelError::Persistence(e)) => {
                self.halt(&e);
                return Err(NodeError::Persistence(e));
            }
            Err(e) => return Err(e.into()),
        };

        let view = ChannelView::of(&machine);
        let channel_id = view.info.channel_id;

        // Re-key before sending so replies to the new id find the machine
        match self.registry.write() {
            Ok(mut registry) => {
                if channel_id != key {
                    if let Some(m) = registry.machines.remove(&key) {
                        registry.machines.insert(channel_id, m);
                    }
                    registry.views.remove(&key);
                    registry.aliases.insert(key, channel_id);
                }
                registry.views.insert(channel_id, view.clone());
            }
            Err(_) => log::error!("Channel registry poisoned"),
        }

        let remote = machine.remote_node();
        for message in output.messages.drain(..) {
            let name = message.name();
            if let Err(e) = self.transport.send(&remote, message) {
                log::warn!("Channel {}: {} not delivered: {}", channel_id, name, e);
            }
        }
        drop(machine);
        self.refresh_graph(&view);

        Ok((value, Step { channel_id, before, view, output }))
    }

    /// Process a step and everything it causes on other channels
    async fn drive(&self, step: Step) -> Result<(), NodeError> {
        let mut queue = VecDeque::from([Work::Step(step)]);

        while let Some(work) = queue.pop_front() {
            match work {
                Work::Step(step) => self.process_step(step, &mut queue)?,
                Work::Submit { channel_id, update, forward } => {
                    let submitted = self
                        .step(&channel_id, |m| {
                            let (tag, out) = m.submit(update)?;
                            if let Some(incoming) = forward {
                                self.with_book(|book| {
                                    book.pending_forwards.insert((m.channel_id(), tag), incoming)
                                });
                            }
                            Ok((tag, out))
                        })
                        .await;

                    match submitted {
                        Ok((_, step)) => queue.push_back(Work::Step(step)),
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => {
                            log::warn!("Channel {}: update not submitted: {}", channel_id, e);
                            if let Some(incoming) = forward {
                                queue.push_back(fail_upstream(
                                    &incoming,
                                    HtlcFailReason::ChannelDisabled,
                                    Some(channel_id),
                                ));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn process_step(&self, step: Step, queue: &mut VecDeque<Work>) -> Result<(), NodeError> {
        let Step { channel_id, before, view, output } = step;

        if let Some(violation) = &output.violation {
            self.events.emit(NodeEvent::ProtocolViolation {
                channel_id,
                error: violation.to_string(),
            });
        }

        if output.funding_complete {
            self.events.emit(NodeEvent::ChannelFunded {
                channel_id,
                temporary_id: view.temporary_id,
            });
            if let Some(Some(tx)) = self.with_book(|book| book.openings.remove(&view.temporary_id)) {
                let _ = tx.send(Ok(channel_id));
            }
        }

        if output.became_active {
            self.events.emit(NodeEvent::ChannelActive { channel_id });
        }

        if let (ChannelState::Active, ChannelState::ClosingInitiated { initiator }) = (&before, &view.state) {
            self.events.emit(NodeEvent::ChannelClosing { channel_id, initiator: *initiator });
        }

        for (tag, error) in &output.rejected {
            self.on_rejected(channel_id, *tag, error, queue);
        }

        for committed in &output.committed {
            let Some(htlc) = &committed.htlc else { continue };
            match (committed.proposer, &committed.update) {
                (ChannelParty::Local, ChannelUpdate::AddHtlc { .. }) => {
                    if let Some(tag) = committed.tag {
                        self.on_offer_committed(channel_id, tag, htlc);
                    }
                }
                (ChannelParty::Local, ChannelUpdate::FulfillHtlc { preimage, .. }) => {
                    self.on_settled(htlc, *preimage)?;
                }
                (ChannelParty::Remote, ChannelUpdate::AddHtlc { .. }) => {
                    queue.push_back(self.accept_htlc(channel_id, htlc));
                }
                (ChannelParty::Remote, ChannelUpdate::FulfillHtlc { preimage, .. }) => {
                    self.on_resolved(channel_id, htlc.id, Resolution::Fulfilled(*preimage), queue);
                }
                (ChannelParty::Remote, ChannelUpdate::FailHtlc { reason, failing_channel, .. }) => {
                    let resolution = Resolution::Failed(reason.clone(), failing_channel.or(Some(channel_id)));
                    self.on_resolved(channel_id, htlc.id, resolution, queue);
                }
                _ => {}
            }
        }

        for htlc in output.timed_out.iter().filter(|h| h.direction.is_offered()) {
            self.on_resolved(
                channel_id,
                htlc.id,
                Resolution::Failed(HtlcFailReason::Timeout, Some(channel_id)),
                queue,
            );
        }

        if output.force_closed {
            let reason = match (&output.violation, &view.state) {
                (Some(violation), _) => violation.to_string(),
                (None, ChannelState::ForceClosed { initiator: ChannelParty::Remote, .. }) => {
                    "closed by remote".to_string()
                }
                _ => "local force-close".to_string(),
            };
            self.events.emit(NodeEvent::ChannelForceClosed {
                channel_id,
                reason: reason.clone(),
                timed_out_htlcs: output.timed_out.len(),
            });
            if let Some(Some(tx)) = self.with_book(|book| book.openings.remove(&view.temporary_id)) {
                let _ = tx.send(Err(NodeError::ProtocolViolation { channel_id, reason }));
            }
        }

        if let Some(close_type) = &output.closed {
            let (local_balance, remote_balance) = match &view.state {
                ChannelState::Closed { final_balance_local, final_balance_remote, .. } => {
                    (*final_balance_local, *final_balance_remote)
                }
                _ => (view.balance.local, view.balance.remote),
            };
            log::info!("Channel {} closed ({:?})", channel_id, close_type);
            self.events.emit(NodeEvent::ChannelClosed {
                channel_id,
                close_type: close_type.clone(),
                local_balance,
                remote_balance,
            });
        }
        Ok(())
    }

    /// Keep our own channels in the routing graph current
    fn refresh_graph(&self, view: &ChannelView) {
        let Ok(mut graph) = self.graph.write() else {
            log::error!("Routing graph poisoned");
            return;
        };

        let channel_id = view.info.channel_id;
        let enabled = match view.state {
            ChannelState::Opening { .. } => return,
            ChannelState::Active => true,
            ChannelState::ClosingInitiated { .. } => false,
            ChannelState::ForceClosed { .. } | ChannelState::Closed { .. } => {
                graph.remove_channel(&channel_id);
                return;
            }
        };

        let result = graph.upsert_local_channel(
            channel_id,
            self.node_id,
            view.remote(),
            view.info.capacity,
            self.config.forwarding_fee,
            view.info.can_send,
            view.info.can_receive,
            enabled,
        );
        if let Err(e) = result {
            log::warn!("Graph: could not refresh {}: {}", channel_id, e);
        }
    }

    async fn force_close(&self, channel_id: &ChannelId, reason: &str) -> Result<(), NodeError> {
        let (_, step) = self.step(channel_id, |m| Ok(((), m.force_close(reason)?))).await?;
        self.drive(step).await
    }

    // =========================================================================
    // HTLC Bookkeeping
    // =========================================================================

    fn on_rejected(
        &self,
        channel_id: ChannelId,
        tag: UpdateTag,
        error: &ChannelError,
        queue: &mut VecDeque<Work>,
    ) {
        let (own, forward) = self
            .with_book(|book| {
                let own = book.own_tags.remove(&(channel_id, tag)).and_then(|hash| {
                    book.waiters
                        .get_mut(&hash)
                        .filter(|w| w.channel_id == channel_id)
                        .and_then(|w| w.acked.take())
                });
                (own, book.pending_forwards.remove(&(channel_id, tag)))
            })
            .unwrap_or((None, None));

        if let Some(acked) = own {
            let failure = match error {
                ChannelError::InsufficientBalance | ChannelError::ReserveViolation => {
                    AttemptFailure::InsufficientBalance
                }
                other => AttemptFailure::Rejected(other.to_string()),
            };
            let _ = acked.send(Err(failure));
        } else if let Some(incoming) = forward {
            log::info!("Channel {}: forward rejected: {}", channel_id, error);
            queue.push_back(fail_upstream(
                &incoming,
                HtlcFailReason::InsufficientCapacity,
                Some(channel_id),
            ));
        } else {
            log::warn!("Channel {}: update {} rejected: {}", channel_id, tag, error);
        }
    }

    /// One of our offered HTLCs is now irrevocably committed
    fn on_offer_committed(&self, channel_id: ChannelId, tag: UpdateTag, htlc: &Htlc) {
        let forwarded = self.with_book(|book| {
            if let Some(hash) = book.own_tags.remove(&(channel_id, tag)) {
                book.own_htlcs.insert((channel_id, htlc.id), hash);
                if let Some(acked) = book.waiters
                    .get_mut(&hash)
                    .filter(|w| w.channel_id == channel_id)
                    .and_then(|w| w.acked.take())
                {
                    let _ = acked.send(Ok(()));
                }
                return None;
            }
            let incoming = book.pending_forwards.remove(&(channel_id, tag))?;
            book.forwards.insert((channel_id, htlc.id), incoming);
            Some(incoming)
        });

        if let Some(Some(incoming)) = forwarded {
            log::info!(
                "Forwarded {} sat {} -> {} ({} sat in)",
                incoming.amount_out, incoming.channel_id, channel_id, incoming.amount_in
            );
            self.events.emit(NodeEvent::HtlcForwarded {
                incoming_channel: incoming.channel_id,
                outgoing_channel: channel_id,
                amount_in: incoming.amount_in,
                amount_out: incoming.amount_out,
            });
        }
    }

    /// We fulfilled a received HTLC; settle the invoice it pays, if any
    fn on_settled(&self, htlc: &Htlc, preimage: PaymentPreimage) -> Result<(), NodeError> {
        let record = {
            let mut invoices = self.invoices.lock().map_err(|_| InvoiceError::UnknownInvoice)?;
            match invoices.get_mut(&htlc.payment_hash) {
                Some(record) if !record.is_paid() => {
                    record.mark_paid(htlc.amount);
                    record.clone()
                }
                _ => return Ok(()),
            }
        };

        log::info!("Invoice {} paid ({} sat)", htlc.payment_hash.short(), htlc.amount);
        let stored = self
            .store
            .persist_invoice(&record)
            .and_then(|_| self.coordinator.record_received(htlc.payment_hash, htlc.amount, preimage));
        if let Err(e) = stored {
            self.halt(&e.to_string());
            return Err(e.into());
        }
        Ok(())
    }

    /// An HTLC we offered was fulfilled or failed downstream
    fn on_resolved(
        &self,
        channel_id: ChannelId,
        htlc_id: HtlcId,
        resolution: Resolution,
        queue: &mut VecDeque<Work>,
    ) {
        let key = (channel_id, htlc_id);
        let found = self.with_book(|book| {
            if let Some(incoming) = book.forwards.remove(&key) {
                return Some(Ok(incoming));
            }
            let hash = book.own_htlcs.remove(&key)?;
            let waiter = book.waiters.remove(&hash)?;
            if waiter.channel_id != channel_id {
                book.waiters.insert(hash, waiter);
                return None;
            }
            Some(Err(waiter))
        });

        match found {
            Some(Some(Ok(incoming))) => {
                let update = match resolution {
                    Resolution::Fulfilled(preimage) => ChannelUpdate::FulfillHtlc {
                        id: incoming.htlc_id,
                        preimage,
                    },
                    Resolution::Failed(reason, failing_channel) => ChannelUpdate::FailHtlc {
                        id: incoming.htlc_id,
                        reason,
                        failing_channel,
                    },
                };
                queue.push_back(Work::Submit {
                    channel_id: incoming.channel_id,
                    update,
                    forward: None,
                });
            }
            Some(Some(Err(mut waiter))) => {
                let outcome = match resolution {
                    Resolution::Fulfilled(preimage) => AttemptOutcome::Succeeded { preimage },
                    Resolution::Failed(HtlcFailReason::Timeout, failing_channel) => {
                        AttemptOutcome::Failed { failure: AttemptFailure::Timeout, failing_channel }
                    }
                    Resolution::Failed(reason, failing_channel) => AttemptOutcome::Failed {
                        failure: AttemptFailure::Hop(reason),
                        failing_channel,
                    },
                };
                if let Some(resolved) = waiter.resolved.take() {
                    let _ = resolved.send(outcome);
                }
            }
            _ => log::debug!("Channel {}: {} resolved with no one waiting", channel_id, htlc_id),
        }
    }

    /// Decide what to do with an HTLC the remote offered us
    fn accept_htlc(&self, channel_id: ChannelId, htlc: &Htlc) -> Work {
        let fail = |reason: HtlcFailReason, failing_channel: Option<ChannelId>| {
            log::info!("Channel {}: failing received {}: {}", channel_id, htlc.id, reason);
            Work::Submit {
                channel_id,
                update: ChannelUpdate::FailHtlc { id: htlc.id, reason, failing_channel },
                forward: None,
            }
        };

        let peeled = htlc
            .onion_packet
            .as_deref()
            .ok_or(crate::messages::OnionError::Empty)
            .and_then(Onion::decode)
            .and_then(Onion::peel);
        let (payload, rest) = match peeled {
            Ok(peeled) => peeled,
            Err(e) => {
                log::warn!("Channel {}: bad onion on {}: {}", channel_id, htlc.id, e);
                return fail(HtlcFailReason::PermanentFailure, None);
            }
        };

        let Some(next) = payload.next_channel else {
            return match self.check_final(htlc, &payload) {
                Ok(preimage) => Work::Submit {
                    channel_id,
                    update: ChannelUpdate::FulfillHtlc { id: htlc.id, preimage },
                    forward: None,
                },
                Err(reason) => fail(reason, None),
            };
        };

        if let Err(reason) = self.check_forward(htlc, &payload, &next) {
            return fail(reason, Some(next));
        }

        let onion_packet = match rest.map(|onion| onion.encode()).transpose() {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("Channel {}: cannot re-encode onion: {}", channel_id, e);
                return fail(HtlcFailReason::PermanentFailure, None);
            }
        };

        Work::Submit {
            channel_id: next,
            update: ChannelUpdate::AddHtlc {
                id: HtlcId::new(0),
                amount: payload.amount_to_forward,
                payment_hash: htlc.payment_hash,
                cltv_expiry: payload.outgoing_cltv,
                onion_packet,
            },
            forward: Some(Incoming {
                channel_id,
                htlc_id: htlc.id,
                amount_in: htlc.amount,
                amount_out: payload.amount_to_forward,
            }),
        }
    }

    /// We are the final hop: look up the invoice
    fn check_final(&self, htlc: &Htlc, payload: &HopPayload) -> Result<PaymentPreimage, HtlcFailReason> {
        let invoices = self.invoices.lock().map_err(|_| HtlcFailReason::TemporaryFailure)?;
        let record = invoices
            .get(&htlc.payment_hash)
            .filter(|r| !r.is_paid() && !r.invoice.is_expired())
            .ok_or(HtlcFailReason::UnknownPaymentHash)?;

        if htlc.amount < payload.amount_to_forward || !record.accepts(htlc.amount) {
            return Err(HtlcFailReason::IncorrectAmount);
        }
        if htlc.cltv_expiry <= self.height() || htlc.cltv_expiry < payload.outgoing_cltv {
            return Err(HtlcFailReason::ExpiryTooSoon);
        }
        Ok(record.preimage)
    }

    /// We are an intermediate hop: check fee, expiry and the next channel
    fn check_forward(&self, htlc: &Htlc, payload: &HopPayload, next: &ChannelId) -> Result<(), HtlcFailReason> {
        let view = self
            .view(next)
            .filter(|v| v.state.is_active())
            .ok_or(HtlcFailReason::ChannelDisabled)?;

        let policy = &self.config.forwarding_fee;
        let required = payload.amount_to_forward.saturating_add(policy.fee_for(payload.amount_to_forward));
        if htlc.amount < required {
            return Err(HtlcFailReason::FeeInsufficient);
        }
        if htlc.cltv_expiry < payload.outgoing_cltv.saturating_add(policy.cltv_expiry_delta)
            || payload.outgoing_cltv <= self.height()
        {
            return Err(HtlcFailReason::ExpiryTooSoon);
        }
        if !self.transport.is_connected(&view.remote()) {
            return Err(HtlcFailReason::PeerOffline);
        }
        if view.info.can_send < payload.amount_to_forward {
            return Err(HtlcFailReason::InsufficientCapacity);
        }
        Ok(())
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    async fn dispatch_route(&self, payment_hash: PaymentHash, route: &Route) -> AttemptOutcome {
        let failed = |failure: AttemptFailure, failing_channel: Option<ChannelId>| {
            AttemptOutcome::Failed { failure, failing_channel }
        };

        let Some(first) = route.first_hop() else {
            return failed(AttemptFailure::Rejected("empty route".to_string()), None);
        };
        let first_channel = first.channel_id;

        if let Err(e) = self.check_running() {
            return failed(AttemptFailure::Rejected(e.to_string()), None);
        }

        let onion = match build_onion(route).encode() {
            Ok(onion) => onion,
            Err(e) => return failed(AttemptFailure::Rejected(e.to_string()), None),
        };

        let peer = match self.view(&first_channel) {
            Some(view) if view.state.is_active() => view.remote(),
            _ => return failed(AttemptFailure::Hop(HtlcFailReason::ChannelDisabled), Some(first_channel)),
        };
        if !self.transport.is_connected(&peer) {
            return failed(AttemptFailure::PeerOffline, Some(first_channel));
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        let (resolved_tx, resolved_rx) = oneshot::channel();
        self.with_book(|book| {
            book.waiters.insert(payment_hash, Waiter {
                channel_id: first_channel,
                acked: Some(ack_tx),
                resolved: Some(resolved_tx),
            })
        });

        let (amount, cltv_expiry) = (first.amount, first.cltv_expiry);
        let offered = self
            .step(&first_channel, |m| {
                let (tag, out) = m.offer_htlc(amount, payment_hash, cltv_expiry, Some(onion))?;
                self.with_book(|book| book.own_tags.insert((m.channel_id(), tag), payment_hash));
                Ok(((), out))
            })
            .await;

        let driven = match offered {
            Ok((_, step)) => self.drive(step).await,
            Err(e) => Err(e),
        };
        if let Err(e) = driven {
            self.with_book(|book| book.forget_payment(&payment_hash));
            return failed(AttemptFailure::Rejected(e.to_string()), Some(first_channel));
        }

        match timeout(self.config.ack_timeout(), ack_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(failure))) => {
                self.with_book(|book| book.forget_payment(&payment_hash));
                return failed(failure, Some(first_channel));
            }
            Ok(Err(_)) => {
                return failed(AttemptFailure::Rejected("attempt abandoned".to_string()), Some(first_channel));
            }
            Err(_) => return self.abandon_attempt(payment_hash, first_channel, "no acknowledgement").await,
        }

        match timeout(self.config.payment_timeout(), resolved_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => failed(AttemptFailure::Timeout, Some(first_channel)),
            Err(_) => self.abandon_attempt(payment_hash, first_channel, "payment timed out").await,
        }
    }

    /// Give up on an attempt: force-close the first hop so the HTLC can
    /// only time out on chain
    async fn abandon_attempt(
        &self,
        payment_hash: PaymentHash,
        channel_id: ChannelId,
        reason: &str,
    ) -> AttemptOutcome {
        log::warn!("Payment {}: {} on {}", payment_hash.short(), reason, channel_id);
        self.with_book(|book| book.forget_payment(&payment_hash));

        if let Err(e) = self.force_close(&channel_id, reason).await {
            log::error!("Channel {}: force-close after timeout failed: {}", channel_id, e);
        }
        AttemptOutcome::Failed {
            failure: AttemptFailure::Timeout,
            failing_channel: Some(channel_id),
        }
    }
}

impl RouteDispatcher for NodeInner {
    fn dispatch<'a>(&'a self, payment_hash: PaymentHash, route: &'a Route) -> DispatchFuture<'a> {
        Box::pin(self.dispatch_route(payment_hash, route))
    }
}

enum Resolution {
    Fulfilled(PaymentPreimage),
    Failed(HtlcFailReason, Option<ChannelId>),
}

/// Pair every pending HTLC we offered with the received HTLC of the same
/// hash on another channel. Offered HTLCs without a partner are our own
/// payments.
fn restore_forwards(channels: &[(ChannelId, HtlcSet)]) -> HashMap<(ChannelId, HtlcId), Incoming> {
    let mut forwards = HashMap::new();
    for (outgoing, set) in channels {
        for offered in set.offered.iter().filter(|h| h.state.is_pending()) {
            let incoming = channels
                .iter()
                .filter(|(id, _)| id != outgoing)
                .flat_map(|(id, set)| set.received.iter().map(move |h| (*id, h)))
                .find(|(_, h)| {
                    h.state.is_pending()
                        && h.payment_hash == offered.payment_hash
                        && h.amount >= offered.amount
                });

            if let Some((channel_id, received)) = incoming {
                forwards.insert((*outgoing, offered.id), Incoming {
                    channel_id,
                    htlc_id: received.id,
                    amount_in: received.amount,
                    amount_out: offered.amount,
                });
            }
        }
    }
    forwards
}

fn fail_upstream(incoming: &Incoming, reason: HtlcFailReason, failing_channel: Option<ChannelId>) -> Work {
    Work::Submit {
        channel_id: incoming.channel_id,
        update: ChannelUpdate::FailHtlc {
            id: incoming.htlc_id,
            reason,
            failing_channel,
        },
        forward: None,
    }
}

/// Hop payloads for every node after us. Payload i tells hop i's node what
/// to send over hop i+1.
fn build_onion(route: &Route) -> Onion {
    let hops = &route.hops;
    let mut payloads: Vec<HopPayload> = hops
        .windows(2)
        .map(|pair| HopPayload {
            next_channel: Some(pair[1].channel_id),
            amount_to_forward: pair[1].amount,
            outgoing_cltv: pair[1].cltv_expiry,
        })
        .collect();

    if let Some(last) = hops.last() {
        payloads.push(HopPayload {
            next_channel: None,
            amount_to_forward: last.amount,
            outgoing_cltv: last.cltv_expiry,
        });
    }
    Onion::new(payloads)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::CloseType;
    use crate::routing::RouteHop;
    use crate::transport::InMemoryNetwork;
    use std::time::Duration;

    fn test_config(alias: &str) -> NodeConfig {
        NodeConfig {
            alias: alias.to_string(),
            ack_timeout_ms: 2_000,
            payment_timeout_ms: 2_000,
            ..NodeConfig::default()
        }
    }

    fn spawn_node(network: &InMemoryNetwork, alias: &str, store: Arc<MemoryStore>) -> Node {
        let keys = NodeKeys::generate();
        let inbox = network.register(keys.node_id());
        let transport = network.endpoint(keys.node_id());
        let node = Node::new(test_config(alias), keys, store, transport).unwrap();
        node.start(inbox);
        node
    }

    async fn mine(nodes: &[&Node], from: u32, to: u32) {
        for height in from..=to {
            for node in nodes {
                node.process_block(height).await.unwrap();
            }
        }
    }

    async fn wait_for<F>(rx: &mut broadcast::Receiver<NodeEvent>, mut pred: F) -> NodeEvent
    where
        F: FnMut(&NodeEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    #[test]
    fn test_build_onion() {
        let node = NodeKeys::generate().node_id();
        let hop = |id: u8, amount: u64, cltv_expiry: u32| RouteHop {
            channel_id: ChannelId([id; 32]),
            node_id: node,
            amount,
            fee: 0,
            cltv_expiry,
            cltv_delta: 0,
        };
        let route = Route { hops: vec![hop(1, 1_011, 158), hop(2, 1_000, 118)] };

        let onion = build_onion(&route);
        assert_eq!(onion.hops.len(), 2);
        assert_eq!(onion.hops[0].next_channel, Some(ChannelId([2; 32])));
        assert_eq!(onion.hops[0].amount_to_forward, 1_000);
        assert_eq!(onion.hops[0].outgoing_cltv, 118);
        assert_eq!(onion.hops[1].next_channel, None);
    }

    #[tokio::test]
    async fn test_open_pay_and_close() {
        let network = InMemoryNetwork::new();
        let alice = spawn_node(&network, "alice", Arc::new(MemoryStore::new()));
        let bob = spawn_node(&network, "bob", Arc::new(MemoryStore::new()));
        let mut bob_events = bob.subscribe();

        let channel_id = alice.open_channel(bob.node_id(), 100_000, 40_000).await.unwrap();
        mine(&[&alice, &bob], 1, 3).await;
        assert_eq!(alice.status().usable_channels, 1);
        assert_eq!(bob.status().usable_channels, 1);

        let invoice = bob.receive(5_000, "coffee").unwrap();
        let success = alice.send(&invoice).await.unwrap();
        assert_eq!(success.fee_paid, 0);
        assert_eq!(success.attempts, 1);

        wait_for(&mut bob_events, |e| matches!(e, NodeEvent::PaymentReceived { .. })).await;
        assert!(bob.invoice_paid(&invoice).unwrap());

        let balance = alice.channel_balance(&channel_id).unwrap();
        assert_eq!(balance.local, 55_000);
        assert_eq!(balance.remote, 45_000);
        assert_eq!(balance.pending_offered, 0);

        // Paying the same invoice again is refused by the payee
        let again = alice.send(&invoice).await;
        assert_eq!(
            again.unwrap_err(),
            NodeError::Payment(crate::payment::PaymentFailure::RecipientRejected)
        );

        let mut alice_events = alice.subscribe();
        alice.close_channel(&channel_id).await.unwrap();
        let closed = wait_for(&mut alice_events, |e| matches!(e, NodeEvent::ChannelClosed { .. })).await;
        match closed {
            NodeEvent::ChannelClosed { close_type, local_balance, remote_balance, .. } => {
                assert_eq!(close_type, CloseType::Cooperative);
                assert_eq!((local_balance, remote_balance), (55_000, 45_000));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(alice.balances(), Balances::default());
    }

    #[tokio::test]
    async fn test_persistence_failure_halts_node() {
        let network = InMemoryNetwork::new();
        let alice_store = Arc::new(MemoryStore::new());
        let alice = spawn_node(&network, "alice", alice_store.clone());
        let bob = spawn_node(&network, "bob", Arc::new(MemoryStore::new()));

        alice.open_channel(bob.node_id(), 100_000, 0).await.unwrap();
        mine(&[&alice, &bob], 1, 3).await;

        alice_store.set_fail_writes(true);
        let mut events = alice.subscribe();
        let invoice = bob.receive(1_000, "tea").unwrap();
        let result = alice.send(&invoice).await;
        assert!(result.is_err());

        wait_for(&mut events, |e| matches!(e, NodeEvent::NodeHalted { .. })).await;
        assert!(alice.is_halted());
        assert_eq!(alice.receive(1_000, "more").unwrap_err(), NodeError::Halted);
    }

    #[tokio::test]
    async fn test_restart_restores_channels() {
        let network = InMemoryNetwork::new();
        let store = Arc::new(MemoryStore::new());
        let keys = NodeKeys::from_seed([7; 32]).unwrap();
        let inbox = network.register(keys.node_id());
        let alice = Node::new(test_config("alice"), keys.clone(), store.clone(), network.endpoint(keys.node_id())).unwrap();
        alice.start(inbox);
        let bob = spawn_node(&network, "bob", Arc::new(MemoryStore::new()));

        let channel_id = alice.open_channel(bob.node_id(), 50_000, 10_000).await.unwrap();
        mine(&[&alice, &bob], 1, 3).await;
        alice.shutdown();
        assert_eq!(alice.receive(1, "x").unwrap_err(), NodeError::Stopped);

        let restored = Node::new(
            test_config("alice"),
            keys,
            store,
            network.endpoint(alice.node_id()),
        )
        .unwrap();
        let channels = restored.list_channels();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].channel_id, channel_id);
        assert_eq!(channels[0].local_balance, 40_000);
        assert_eq!(restored.status().best_block_height, 3);
    }

    #[tokio::test]
    async fn test_forwarder_restart_relays_fulfill() {
        let network = InMemoryNetwork::new();
        let alice = spawn_node(&network, "alice", Arc::new(MemoryStore::new()));
        let carol = spawn_node(&network, "carol", Arc::new(MemoryStore::new()));

        let bob_store = Arc::new(MemoryStore::new());
        let bob_keys = NodeKeys::from_seed([9; 32]).unwrap();
        let bob_id = bob_keys.node_id();
        let mut bob_inbox = network.register(bob_id);
        let bob = Node::new(test_config("bob"), bob_keys.clone(), bob_store.clone(), network.endpoint(bob_id)).unwrap();

        // Drive bob by hand and stop as soon as carol's fulfill arrives
        let pump = tokio::spawn({
            let bob = bob.clone();
            async move {
                while let Some((from, message)) = bob_inbox.recv().await {
                    if matches!(message, PeerMessage::UpdateFulfillHtlc { .. }) {
                        return Some((bob_inbox, from, message));
                    }
                    let _ = bob.handle_message(from, message).await;
                }
                None
            }
        });

        let ab = alice.open_channel(bob_id, 100_000, 0).await.unwrap();
        let bc = bob.open_channel(carol.node_id(), 100_000, 0).await.unwrap();
        mine(&[&alice, &bob, &carol], 1, 3).await;
        let gossip: Vec<_> = [&alice, &bob, &carol].iter().flat_map(|n| n.gossip()).collect();
        for node in [&alice, &bob, &carol] {
            node.apply_gossip(&gossip);
        }

        let invoice = carol.receive(5_000, "across a restart").unwrap();
        let payer = alice.clone();
        let encoded = invoice.clone();
        let payment = tokio::spawn(async move { payer.send(&encoded).await });

        let (inbox, from, fulfill) = tokio::time::timeout(Duration::from_secs(5), pump)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        bob.shutdown();

        // The new process only knows what bob's store holds
        let restarted = Node::new(test_config("bob"), bob_keys, bob_store, network.endpoint(bob_id)).unwrap();
        assert_eq!(restarted.status().best_block_height, 3);
        restarted.handle_message(from, fulfill).await.unwrap();
        restarted.start(inbox);

        let success = payment.await.unwrap().unwrap();
        assert_eq!(success.route.channel_ids(), vec![ab, bc]);
        assert!(carol.invoice_paid(&invoice).unwrap());

        let fee = crate::routing::FeePolicy::default().fee_for(5_000);
        let upstream = restarted.channel_balance(&ab).unwrap();
        assert_eq!(upstream.local, 5_000 + fee);
        assert_eq!(upstream.pending_received, 0);
    }
}
