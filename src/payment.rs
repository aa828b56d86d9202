// =============================================================================
// ROMER - Payment Coordinator
// =============================================================================
//
// Drives one outgoing payment to a terminal state:
//
//   ┌────────────┐  next()   ┌────────────┐ dispatch  ┌────────────┐
//   │   Route    │──────────▶│  Attempt   │──────────▶│  First-hop │
//   │ Candidates │           │   (one)    │◀──────────│  channel   │
//   └────────────┘           └────────────┘  outcome  └────────────┘
//         ▲                        │
//         └──── exclude failed ────┘
//               channel
//
// At most one attempt is in flight per payment hash; a second payment for
// a hash that is still active is refused.
//
// =============================================================================

use serde::{Serialize, Deserialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use crate::channels::{ChannelId, HtlcFailReason, PaymentHash, PaymentPreimage};
use crate::events::{EventBus, NodeEvent};
use crate::keys::NodeId;
use crate::routing::{Route, RouteCandidates};
use crate::store::{ChannelStore, StoreError};
use crate::unix_time;

/// Attempts per payment before giving up
pub const DEFAULT_MAX_PAYMENT_ATTEMPTS: usize = 10;

// =============================================================================
// Failures
// =============================================================================

/// Why a single attempt failed
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptFailure {
    /// A hop (or the recipient) failed the HTLC
    Hop(HtlcFailReason),
    /// First-hop peer unreachable
    PeerOffline,
    /// First-hop channel cannot carry the amount
    InsufficientBalance,
    /// No acknowledgement or resolution in time
    Timeout,
    /// First-hop channel refused the HTLC
    Rejected(String),
}

impl AttemptFailure {
    /// The recipient refused; other routes will not help
    pub fn is_final(&self) -> bool {
        matches!(self, AttemptFailure::Hop(reason) if reason.is_final())
    }
}

impl std::fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptFailure::Hop(reason) => write!(f, "hop failure: {}", reason),
            AttemptFailure::PeerOffline => write!(f, "peer offline"),
            AttemptFailure::InsufficientBalance => write!(f, "insufficient balance"),
            AttemptFailure::Timeout => write!(f, "timeout"),
            AttemptFailure::Rejected(s) => write!(f, "rejected: {}", s),
        }
    }
}

/// Terminal reason of a failed payment
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentFailure {
    NoRoute,
    InsufficientBalance,
    PeerOffline,
    Timeout,
    /// Unknown payment hash or wrong amount at the destination
    RecipientRejected,
    Cancelled,
}

impl From<&AttemptFailure> for PaymentFailure {
    fn from(failure: &AttemptFailure) -> Self {
        match failure {
            AttemptFailure::Hop(reason) if reason.is_final() => PaymentFailure::RecipientRejected,
            AttemptFailure::Hop(HtlcFailReason::Timeout) => PaymentFailure::Timeout,
            AttemptFailure::Hop(HtlcFailReason::PeerOffline) => PaymentFailure::PeerOffline,
            AttemptFailure::Hop(_) | AttemptFailure::Rejected(_) => PaymentFailure::NoRoute,
            AttemptFailure::PeerOffline => PaymentFailure::PeerOffline,
            AttemptFailure::InsufficientBalance => PaymentFailure::InsufficientBalance,
            AttemptFailure::Timeout => PaymentFailure::Timeout,
        }
    }
}

impl std::fmt::Display for PaymentFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PaymentFailure::NoRoute => "no route",
            PaymentFailure::InsufficientBalance => "insufficient balance",
            PaymentFailure::PeerOffline => "peer offline",
            PaymentFailure::Timeout => "timeout",
            PaymentFailure::RecipientRejected => "recipient rejected",
            PaymentFailure::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PaymentError {
    /// Another payment with this hash is active
    DuplicatePayment(PaymentHash),
    UnknownPayment(PaymentHash),
    Failed(PaymentFailure),
    /// Terminal record could not be archived
    Store(StoreError),
}

impl std::fmt::Display for PaymentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentError::DuplicatePayment(h) => write!(f, "Payment {} already in flight", h.short()),
            PaymentError::UnknownPayment(h) => write!(f, "No active payment {}", h.short()),
            PaymentError::Failed(reason) => write!(f, "Payment failed: {}", reason),
            PaymentError::Store(e) => write!(f, "Payment archive failed: {}", e),
        }
    }
}

impl std::error::Error for PaymentError {}

impl From<StoreError> for PaymentError {
    fn from(e: StoreError) -> Self {
        PaymentError::Store(e)
    }
}

// =============================================================================
// Records
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptState {
    InFlight,
    Succeeded,
    Failed(AttemptFailure),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentAttempt {
    pub route: Route,
    pub state: AttemptState,
    pub started_at: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentDirection {
    Outbound,
    Inbound,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed(PaymentFailure),
}

/// A payment as shown to the user and archived in the store
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub payment_hash: PaymentHash,
    /// Amount delivered to the destination
    pub amount: u64,
    pub destination: Option<NodeId>,
    pub direction: PaymentDirection,
    pub status: PaymentStatus,
    pub attempts: Vec<PaymentAttempt>,
    pub fee_paid: u64,
    pub preimage: Option<PaymentPreimage>,
    pub created_at: u64,
    pub completed_at: Option<u64>,
}

impl PaymentRecord {
    pub fn outbound(payment_hash: PaymentHash, destination: NodeId, amount: u64) -> Self {
        PaymentRecord {
            payment_hash,
            amount,
            destination: Some(destination),
            direction: PaymentDirection::Outbound,
            status: PaymentStatus::Pending,
            attempts: Vec::new(),
            fee_paid: 0,
            preimage: None,
            created_at: unix_time(),
            completed_at: None,
        }
    }

    pub fn inbound(payment_hash: PaymentHash, amount: u64, preimage: PaymentPreimage) -> Self {
        let now = unix_time();
        PaymentRecord {
            payment_hash,
            amount,
            destination: None,
            direction: PaymentDirection::Inbound,
            status: PaymentStatus::Succeeded,
            attempts: Vec::new(),
            fee_paid: 0,
            preimage: Some(preimage),
            created_at: now,
            completed_at: Some(now),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == PaymentStatus::Pending
    }
}

/// Result of a successful payment
#[derive(Clone, Debug)]
pub struct PaymentSuccess {
    pub payment_hash: PaymentHash,
    pub preimage: PaymentPreimage,
    pub fee_paid: u64,
    pub attempts: usize,
    pub route: Route,
}

// =============================================================================
// Dispatch
// =============================================================================

/// How one attempt ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded {
        preimage: PaymentPreimage,
    },
    Failed {
        failure: AttemptFailure,
        /// Channel reported as the point of failure, if known
        failing_channel: Option<ChannelId>,
    },
}

pub type DispatchFuture<'a> = Pin<Box<dyn Future<Output = AttemptOutcome> + Send + 'a>>;

/// Puts a route on the wire and waits until its HTLC is resolved
pub trait RouteDispatcher: Send + Sync {
    fn dispatch<'a>(&'a self, payment_hash: PaymentHash, route: &'a Route) -> DispatchFuture<'a>;
}

// =============================================================================
// Coordinator
// =============================================================================

struct ActivePayment {
    cancelled: Arc<AtomicBool>,
    done: watch::Receiver<bool>,
    record: PaymentRecord,
}

pub struct PaymentCoordinator {
    active: Mutex<HashMap<PaymentHash, ActivePayment>>,
    store: Arc<dyn ChannelStore>,
    events: EventBus,
    max_attempts: usize,
}

/// Unregisters the payment however `pay` exits
struct ActiveGuard<'a> {
    coordinator: &'a PaymentCoordinator,
    payment_hash: PaymentHash,
    done: watch::Sender<bool>,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut active) = self.coordinator.active.lock() {
            active.remove(&self.payment_hash);
        }
        let _ = self.done.send(true);
    }
}

impl PaymentCoordinator {
    pub fn new(store: Arc<dyn ChannelStore>, events: EventBus, max_attempts: usize) -> Self {
        PaymentCoordinator {
            active: Mutex::new(HashMap::new()),
            store,
            events,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn is_active(&self, payment_hash: &PaymentHash) -> bool {
        self.active
            .lock()
            .map(|active| active.contains_key(payment_hash))
            .unwrap_or(false)
    }

    /// Payments still in progress
    pub fn active_payments(&self) -> Vec<PaymentRecord> {
        self.active
            .lock()
            .map(|active| active.values().map(|p| p.record.clone()).collect())
            .unwrap_or_default()
    }

    /// Archived and in-progress payments, oldest first
    pub fn list_payments(&self) -> Result<Vec<PaymentRecord>, StoreError> {
        let mut payments = self.store.load_payments()?;
        payments.extend(self.active_payments());
        payments.sort_by_key(|p| p.created_at);
        Ok(payments)
    }

    fn register(&self, record: &PaymentRecord) -> Result<(ActiveGuard<'_>, Arc<AtomicBool>), PaymentError> {
        let mut active = self.active
            .lock()
            .map_err(|_| PaymentError::Store(StoreError::Database("payment registry poisoned".into())))?;

        if active.contains_key(&record.payment_hash) {
            return Err(PaymentError::DuplicatePayment(record.payment_hash));
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = watch::channel(false);
        active.insert(record.payment_hash, ActivePayment {
            cancelled: cancelled.clone(),
            done: done_rx,
            record: record.clone(),
        });

        let guard = ActiveGuard {
            coordinator: self,
            payment_hash: record.payment_hash,
            done: done_tx,
        };
        Ok((guard, cancelled))
    }

    fn snapshot(&self, record: &PaymentRecord) {
        if let Ok(mut active) = self.active.lock() {
            if let Some(entry) = active.get_mut(&record.payment_hash) {
                entry.record = record.clone();
            }
        }
    }

    /// Run the payment until it succeeds, runs out of routes or attempts,
    /// or is cancelled.
    pub async fn pay<D: RouteDispatcher + ?Sized>(
        &self,
        dispatcher: &D,
        payment_hash: PaymentHash,
        destination: NodeId,
        amount: u64,
        mut candidates: RouteCandidates,
    ) -> Result<PaymentSuccess, PaymentError> {
        let mut record = PaymentRecord::outbound(payment_hash, destination, amount);
        let (_guard, cancelled) = self.register(&record)?;

        log::info!("Payment {}: {} sat to {}", payment_hash.short(), amount, destination.short());

        let mut last_failure: Option<AttemptFailure> = None;

        let outcome: Result<(PaymentPreimage, Route), PaymentFailure> = loop {
            if cancelled.load(Ordering::SeqCst) {
                break Err(PaymentFailure::Cancelled);
            }

            if record.attempts.len() >= self.max_attempts {
                log::warn!("Payment {}: {} attempts exhausted", payment_hash.short(), self.max_attempts);
                break Err(last_failure
                    .as_ref()
                    .map(PaymentFailure::from)
                    .unwrap_or(PaymentFailure::NoRoute));
            }

            let Some(route) = candidates.next() else {
                // Local conditions explain an empty graph better than NoRoute
                let reason = match last_failure.as_ref().map(PaymentFailure::from) {
                    Some(reason @ (PaymentFailure::InsufficientBalance
                        | PaymentFailure::PeerOffline
                        | PaymentFailure::Timeout)) => reason,
                    _ => PaymentFailure::NoRoute,
                };
                break Err(reason);
            };

            let attempt = record.attempts.len() + 1;
            log::debug!("Payment {}: attempt {} via {}", payment_hash.short(), attempt, route);

            record.attempts.push(PaymentAttempt {
                route: route.clone(),
                state: AttemptState::InFlight,
                started_at: unix_time(),
            });
            self.snapshot(&record);
            self.emit_attempt(payment_hash, attempt, &route, AttemptState::InFlight);

            let result = dispatcher.dispatch(payment_hash, &route).await;

            match result {
                AttemptOutcome::Succeeded { preimage } if preimage.verify(&payment_hash) => {
                    self.finish_attempt(&mut record, attempt, &route, AttemptState::Succeeded);
                    break Ok((preimage, route));
                }
                AttemptOutcome::Succeeded { .. } => {
                    // A channel never settles with a bad preimage; treat as a
                    // broken first hop
                    let failure = AttemptFailure::Rejected("preimage mismatch".into());
                    self.finish_attempt(&mut record, attempt, &route, AttemptState::Failed(failure.clone()));
                    if let Some(hop) = route.first_hop() {
                        candidates.exclude_channel(hop.channel_id);
                    }
                    last_failure = Some(failure);
                }
                AttemptOutcome::Failed { failure, failing_channel } => {
                    log::info!(
                        "Payment {}: attempt {} failed: {}",
                        payment_hash.short(),
                        attempt,
                        failure
                    );
                    self.finish_attempt(&mut record, attempt, &route, AttemptState::Failed(failure.clone()));

                    if failure.is_final() {
                        break Err(PaymentFailure::RecipientRejected);
                    }

                    let excluded = failing_channel
                        .filter(|c| route.contains_channel(c))
                        .or_else(|| route.first_hop().map(|h| h.channel_id));
                    if let Some(channel_id) = excluded {
                        candidates.exclude_channel(channel_id);
                    }
                    last_failure = Some(failure);
                }
            }
        };

        record.completed_at = Some(unix_time());
        match outcome {
            Ok((preimage, route)) => {
                let fee_paid = route.total_fee();
                record.status = PaymentStatus::Succeeded;
                record.preimage = Some(preimage);
                record.fee_paid = fee_paid;
                self.store.archive_payment(&record)?;

                log::info!("Payment {} succeeded, fee {} sat", payment_hash.short(), fee_paid);
                self.events.emit(NodeEvent::PaymentSucceeded {
                    payment_hash,
                    amount,
                    fee_paid,
                    preimage,
                });
                Ok(PaymentSuccess {
                    payment_hash,
                    preimage,
                    fee_paid,
                    attempts: record.attempts.len(),
                    route,
                })
            }
            Err(reason) => {
                record.status = PaymentStatus::Failed(reason.clone());
                self.store.archive_payment(&record)?;

                log::warn!("Payment {} failed: {}", payment_hash.short(), reason);
                self.events.emit(NodeEvent::PaymentFailed {
                    payment_hash,
                    reason: reason.clone(),
                });
                Err(PaymentError::Failed(reason))
            }
        }
    }

    fn finish_attempt(&self, record: &mut PaymentRecord, attempt: usize, route: &Route, state: AttemptState) {
        if let Some(entry) = record.attempts.get_mut(attempt - 1) {
            entry.state = state.clone();
        }
        self.snapshot(record);
        self.emit_attempt(record.payment_hash, attempt, route, state);
    }

    fn emit_attempt(&self, payment_hash: PaymentHash, attempt: usize, route: &Route, state: AttemptState) {
        self.events.emit(NodeEvent::PaymentAttempt {
            payment_hash,
            attempt,
            route: route.clone(),
            state,
        });
    }

    /// Stop retrying. Returns once the attempt in flight, if any, has
    /// resolved and the payment reached a terminal state.
    pub async fn cancel(&self, payment_hash: &PaymentHash) -> Result<(), PaymentError> {
        let mut done = {
            let active = self.active
                .lock()
                .map_err(|_| PaymentError::UnknownPayment(*payment_hash))?;
            let entry = active
                .get(payment_hash)
                .ok_or(PaymentError::UnknownPayment(*payment_hash))?;
            entry.cancelled.store(true, Ordering::SeqCst);
            entry.done.clone()
        };

        log::info!("Payment {}: cancel requested", payment_hash.short());

        while !*done.borrow() {
            if done.changed().await.is_err() {
                break;
            }
        }
        Ok(())
    }

    /// Archive a payment settled to one of our invoices
    pub fn record_received(
        &self,
        payment_hash: PaymentHash,
        amount: u64,
        preimage: PaymentPreimage,
    ) -> Result<(), StoreError> {
        self.store.archive_payment(&PaymentRecord::inbound(payment_hash, amount, preimage))?;
        self.events.emit(NodeEvent::PaymentReceived { payment_hash, amount });
        Ok(())
    }
}

impl std::fmt::Debug for PaymentCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentCoordinator")
            .field("active", &self.active_payments().len())
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::NodeKeys;
    use crate::routing::{FeePolicy, RouteParams, RoutingGraph};
    use crate::store::MemoryStore;
    use std::collections::HashSet;
    use tokio::sync::Notify;

    /// Sender, three two-hop paths through m1, m2, m3 to the destination
    struct Fixture {
        graph: RoutingGraph,
        source: NodeId,
        dest: NodeId,
        /// (first hop, second hop) of each path, cheapest first
        paths: Vec<(ChannelId, ChannelId)>,
    }

    fn fixture() -> Fixture {
        let ids: Vec<NodeId> = (0..5).map(|_| NodeKeys::generate().node_id()).collect();
        let (source, dest) = (ids[0], ids[4]);
        let mut graph = RoutingGraph::new();
        let mut paths = Vec::new();

        for (i, mid) in ids[1..4].iter().enumerate() {
            let first = ChannelId([i as u8 * 2 + 1; 32]);
            let second = ChannelId([i as u8 * 2 + 2; 32]);
            let policy = FeePolicy { base_fee: i as u64 + 1, fee_rate_ppm: 0, cltv_expiry_delta: 40 };

            graph.announce_channel(first, source, *mid, 1_000_000).unwrap();
            graph.announce_channel(second, *mid, dest, 1_000_000).unwrap();
            for (channel, from) in [(first, source), (first, *mid), (second, *mid), (second, dest)] {
                graph.update_policy(&channel, &from, policy, true, 1).unwrap();
            }
            paths.push((first, second));
        }

        Fixture { graph, source, dest, paths }
    }

    struct ScriptedDispatcher {
        /// Second-hop channels that fail
        failing: HashSet<ChannelId>,
        reason: HtlcFailReason,
        preimage: PaymentPreimage,
        routes: Mutex<Vec<Route>>,
    }

    impl ScriptedDispatcher {
        fn new(failing: &[ChannelId], reason: HtlcFailReason, preimage: PaymentPreimage) -> Self {
            ScriptedDispatcher {
                failing: failing.iter().copied().collect(),
                reason,
                preimage,
                routes: Mutex::new(Vec::new()),
            }
        }
    }

    impl RouteDispatcher for ScriptedDispatcher {
        fn dispatch<'a>(&'a self, _hash: PaymentHash, route: &'a Route) -> DispatchFuture<'a> {
            Box::pin(async move {
                self.routes.lock().unwrap().push(route.clone());
                match route.hops.iter().find(|h| self.failing.contains(&h.channel_id)) {
                    Some(hop) => AttemptOutcome::Failed {
                        failure: AttemptFailure::Hop(self.reason.clone()),
                        failing_channel: Some(hop.channel_id),
                    },
                    None => AttemptOutcome::Succeeded { preimage: self.preimage },
                }
            })
        }
    }

    fn coordinator(store: Arc<MemoryStore>, max_attempts: usize) -> PaymentCoordinator {
        PaymentCoordinator::new(store, EventBus::new(64), max_attempts)
    }

    fn candidates(f: &Fixture, amount: u64) -> RouteCandidates {
        RouteCandidates::new(f.graph.clone(), f.source, f.dest, amount, RouteParams::default())
    }

    #[tokio::test]
    async fn test_retry_excludes_failed_channel() {
        let f = fixture();
        let store = Arc::new(MemoryStore::new());
        let coordinator = coordinator(store.clone(), 5);
        let mut events = coordinator.events.subscribe();

        let preimage = PaymentPreimage::generate();
        let hash = preimage.payment_hash();
        // Path 1 fails at its second hop
        let dispatcher = ScriptedDispatcher::new(&[f.paths[0].1], HtlcFailReason::TemporaryFailure, preimage);

        let success = coordinator
            .pay(&dispatcher, hash, f.dest, 10_000, candidates(&f, 10_000))
            .await
            .unwrap();

        let routes = dispatcher.routes.lock().unwrap().clone();
        assert_eq!(routes.len(), 2);
        assert!(routes[0].contains_channel(&f.paths[0].1));
        assert_eq!(routes[1].channel_ids(), vec![f.paths[1].0, f.paths[1].1]);
        assert!(!routes[1].contains_channel(&f.paths[0].1));

        assert_eq!(success.preimage, preimage);
        assert_eq!(success.attempts, 2);
        assert_eq!(success.fee_paid, 2);

        let archived = store.load_payments().unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].status, PaymentStatus::Succeeded);
        assert!(matches!(archived[0].attempts[0].state, AttemptState::Failed(_)));
        assert!(!coordinator.is_active(&hash));

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let NodeEvent::PaymentAttempt { attempt, state, .. } = event {
                states.push((attempt, state));
            }
        }
        assert_eq!(states.len(), 4);
        assert_eq!(states[0], (1, AttemptState::InFlight));
        assert_eq!(states[3], (2, AttemptState::Succeeded));
    }

    #[tokio::test]
    async fn test_exhausted_routes_is_no_route() {
        let f = fixture();
        let coordinator = coordinator(Arc::new(MemoryStore::new()), 10);
        let preimage = PaymentPreimage::generate();
        let failing: Vec<ChannelId> = f.paths.iter().map(|p| p.1).collect();
        let dispatcher = ScriptedDispatcher::new(&failing, HtlcFailReason::InsufficientCapacity, preimage);

        let err = coordinator
            .pay(&dispatcher, preimage.payment_hash(), f.dest, 10_000, candidates(&f, 10_000))
            .await
            .unwrap_err();

        assert_eq!(err, PaymentError::Failed(PaymentFailure::NoRoute));
        assert_eq!(dispatcher.routes.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_attempt_bound() {
        let f = fixture();
        let coordinator = coordinator(Arc::new(MemoryStore::new()), 2);
        let preimage = PaymentPreimage::generate();
        let failing: Vec<ChannelId> = f.paths.iter().map(|p| p.1).collect();
        let dispatcher = ScriptedDispatcher::new(&failing, HtlcFailReason::Timeout, preimage);

        let err = coordinator
            .pay(&dispatcher, preimage.payment_hash(), f.dest, 10_000, candidates(&f, 10_000))
            .await
            .unwrap_err();

        assert_eq!(err, PaymentError::Failed(PaymentFailure::Timeout));
        assert_eq!(dispatcher.routes.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_recipient_rejection_not_retried() {
        let f = fixture();
        let coordinator = coordinator(Arc::new(MemoryStore::new()), 10);
        let preimage = PaymentPreimage::generate();
        let dispatcher = ScriptedDispatcher::new(&[f.paths[0].1], HtlcFailReason::UnknownPaymentHash, preimage);

        let err = coordinator
            .pay(&dispatcher, preimage.payment_hash(), f.dest, 10_000, candidates(&f, 10_000))
            .await
            .unwrap_err();

        assert_eq!(err, PaymentError::Failed(PaymentFailure::RecipientRejected));
        assert_eq!(dispatcher.routes.lock().unwrap().len(), 1);
    }

    /// Holds every attempt until released
    struct GatedDispatcher {
        started: Notify,
        release: Notify,
        calls: Mutex<usize>,
    }

    impl RouteDispatcher for GatedDispatcher {
        fn dispatch<'a>(&'a self, _hash: PaymentHash, route: &'a Route) -> DispatchFuture<'a> {
            Box::pin(async move {
                *self.calls.lock().unwrap() += 1;
                self.started.notify_one();
                self.release.notified().await;
                AttemptOutcome::Failed {
                    failure: AttemptFailure::Hop(HtlcFailReason::TemporaryFailure),
                    failing_channel: route.first_hop().map(|h| h.channel_id),
                }
            })
        }
    }

    #[tokio::test]
    async fn test_duplicate_and_cancel() {
        let f = fixture();
        let coordinator = Arc::new(coordinator(Arc::new(MemoryStore::new()), 10));
        let dispatcher = Arc::new(GatedDispatcher {
            started: Notify::new(),
            release: Notify::new(),
            calls: Mutex::new(0),
        });
        let hash = PaymentPreimage::generate().payment_hash();

        let task = {
            let coordinator = coordinator.clone();
            let dispatcher = dispatcher.clone();
            let candidates = candidates(&f, 10_000);
            let dest = f.dest;
            tokio::spawn(async move {
                coordinator.pay(dispatcher.as_ref(), hash, dest, 10_000, candidates).await
            })
        };

        dispatcher.started.notified().await;
        assert!(coordinator.is_active(&hash));

        // Second payment for the same hash while the first is in flight
        let second = coordinator
            .pay(dispatcher.as_ref(), hash, f.dest, 10_000, candidates(&f, 10_000))
            .await;
        assert_eq!(second.unwrap_err(), PaymentError::DuplicatePayment(hash));

        let cancel = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.cancel(&hash).await })
        };
        tokio::task::yield_now().await;
        assert!(!cancel.is_finished());

        dispatcher.release.notify_one();
        cancel.await.unwrap().unwrap();

        let result = task.await.unwrap();
        assert_eq!(result.unwrap_err(), PaymentError::Failed(PaymentFailure::Cancelled));
        assert_eq!(*dispatcher.calls.lock().unwrap(), 1);
        assert!(!coordinator.is_active(&hash));
    }
}
