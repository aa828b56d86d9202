// =============================================================================
// ROMER - Channel State
// =============================================================================
//
// Channel state machine and core types.
//
// Channel Lifecycle:
// ┌─────────────┐     ┌─────────────┐
// │   Opening   │────▶│   Active    │
// └─────────────┘     └─────────────┘
//        │                   │
//        │         ┌─────────┴─────────────────┐
//        │         ▼                           ▼
//        │  ┌──────────────────┐       ┌─────────────┐
//        │  │ ClosingInitiated │       │ ForceClosed │◀──── (any open state)
//        │  │  (cooperative)   │       │ (unilateral)│
//        │  └──────────────────┘       └─────────────┘
//        │         │                           │  to_self_delay blocks
//        ▼         ▼                           ▼
//   ┌─────────────────────────────────────────────────┐
//   │                     CLOSED                      │
//   └─────────────────────────────────────────────────┘
//
// Balances are always seen from the local node. Whatever the state:
//
//   local + remote + pending_offered + pending_received + fee == capacity
//
// =============================================================================

use serde::{Serialize, Deserialize};

use super::htlc::{Htlc, HtlcDirection, HtlcFailReason, HtlcId, HtlcSet, PaymentHash, PaymentPreimage};
use super::{
    calculate_reserve, generate_channel_id, DEFAULT_CSV_DELAY, DEFAULT_FUNDING_CONFIRMATIONS,
    DEFAULT_HTLC_MINIMUM, MAX_HTLCS_PER_CHANNEL,
};
use crate::keys::NodeId;
use crate::unix_time;

// =============================================================================
// Channel Identifier
// =============================================================================

/// Unique channel identifier (32 bytes)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub [u8; 32]);

impl ChannelId {
    /// Create from bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        ChannelId(bytes)
    }

    /// Create temporary ID (before funding)
    pub fn temporary() -> Self {
        ChannelId(rand::random())
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let array: [u8; 32] = bytes.try_into().ok()?;
        Some(ChannelId(array))
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short display (first 8 chars)
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.short())
    }
}

// =============================================================================
// Channel Party (Local vs Remote)
// =============================================================================

/// Which side of the channel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelParty {
    Local,
    Remote,
}

impl ChannelParty {
    pub fn other(&self) -> Self {
        match self {
            ChannelParty::Local => ChannelParty::Remote,
            ChannelParty::Remote => ChannelParty::Local,
        }
    }

    /// Direction of an HTLC offered by this party, seen locally
    pub fn offered_direction(&self) -> HtlcDirection {
        match self {
            ChannelParty::Local => HtlcDirection::Offered,
            ChannelParty::Remote => HtlcDirection::Received,
        }
    }
}

// =============================================================================
// Balance
// =============================================================================

/// Channel balance for both parties
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    /// Our balance in satoshis
    pub local: u64,
    /// Their balance in satoshis
    pub remote: u64,
    /// Locked in HTLCs we offered
    pub pending_offered: u64,
    /// Locked in HTLCs they offered
    pub pending_received: u64,
    /// Commitment fee, paid by the funder
    pub fee: u64,
}

impl Balance {
    pub fn new(local: u64, remote: u64) -> Self {
        Balance {
            local,
            remote,
            pending_offered: 0,
            pending_received: 0,
            fee: 0,
        }
    }

    /// Sum of every bucket; equals the channel capacity
    pub fn total(&self) -> u64 {
        self.local + self.remote + self.pending_offered + self.pending_received + self.fee
    }

    /// Available to send (considering reserve)
    pub fn available_to_send(&self, reserve: u64) -> u64 {
        self.local.saturating_sub(reserve)
    }

    /// Available to receive
    pub fn available_to_receive(&self, reserve: u64) -> u64 {
        self.remote.saturating_sub(reserve)
    }

    fn side_mut(&mut self, party: ChannelParty) -> &mut u64 {
        match party {
            ChannelParty::Local => &mut self.local,
            ChannelParty::Remote => &mut self.remote,
        }
    }

    fn pending_mut(&mut self, offerer: ChannelParty) -> &mut u64 {
        match offerer {
            ChannelParty::Local => &mut self.pending_offered,
            ChannelParty::Remote => &mut self.pending_received,
        }
    }
}

// =============================================================================
// Channel State
// =============================================================================

/// Current state of the channel
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    /// Funding negotiated or waiting for confirmations
    Opening {
        confirmations: u32,
    },

    /// Channel is open and operational
    Active,

    /// Shutdown requested; no new HTLCs, existing ones resolve
    ClosingInitiated {
        initiator: ChannelParty,
    },

    /// Latest commitment broadcast unilaterally
    ForceClosed {
        commitment_number: u64,
        broadcast_height: u32,
        initiator: ChannelParty,
    },

    /// Channel fully closed
    Closed {
        close_type: CloseType,
        final_balance_local: u64,
        final_balance_remote: u64,
    },
}

impl ChannelState {
    /// Is the channel operational?
    pub fn is_active(&self) -> bool {
        matches!(self, ChannelState::Active)
    }

    pub fn is_opening(&self) -> bool {
        matches!(self, ChannelState::Opening { .. })
    }

    /// Is the channel closed or closing?
    pub fn is_closing(&self) -> bool {
        matches!(
            self,
            ChannelState::ClosingInitiated { .. } |
            ChannelState::ForceClosed { .. } |
            ChannelState::Closed { .. }
        )
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ChannelState::Closed { .. })
    }

    /// Can new HTLCs be added?
    pub fn can_transact(&self) -> bool {
        matches!(self, ChannelState::Active)
    }

    /// Can existing HTLCs still be settled off-chain?
    pub fn can_resolve(&self) -> bool {
        matches!(self, ChannelState::Active | ChannelState::ClosingInitiated { .. })
    }
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelState::Opening { confirmations } => {
                write!(f, "Opening ({} confs)", confirmations)
            }
            ChannelState::Active => write!(f, "Active"),
            ChannelState::ClosingInitiated { initiator } => {
                write!(f, "ClosingInitiated ({:?})", initiator)
            }
            ChannelState::ForceClosed { broadcast_height, .. } => {
                write!(f, "ForceClosed (height {})", broadcast_height)
            }
            ChannelState::Closed { close_type, .. } => write!(f, "Closed ({:?})", close_type),
        }
    }
}

/// How the channel was closed
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseType {
    /// Both parties agreed
    Cooperative,
    /// We force closed
    LocalForceClose,
    /// They force closed
    RemoteForceClose,
    /// They broadcast a revoked commitment
    Breach,
}

// =============================================================================
// Channel Configuration
// =============================================================================

/// Channel configuration parameters
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Blocks between a force-close and final settlement
    pub to_self_delay: u32,
    /// Minimum HTLC value we accept
    pub htlc_minimum: u64,
    /// Maximum HTLCs in flight
    pub max_htlcs: usize,
    /// Maximum HTLC value in flight
    pub max_htlc_value_in_flight: u64,
    /// Required confirmations for funding
    pub funding_confirmations: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            to_self_delay: DEFAULT_CSV_DELAY,
            htlc_minimum: DEFAULT_HTLC_MINIMUM,
            max_htlcs: MAX_HTLCS_PER_CHANNEL,
            max_htlc_value_in_flight: u64::MAX,
            funding_confirmations: DEFAULT_FUNDING_CONFIRMATIONS,
        }
    }
}

// =============================================================================
// Channel Error
// =============================================================================

/// Channel-related errors
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelError {
    /// Invalid channel state for operation
    InvalidState(String),
    /// Insufficient balance
    InsufficientBalance,
    /// Amount below HTLC minimum
    BelowHtlcMinimum,
    /// Too many HTLCs
    TooManyHtlcs,
    /// HTLC value exceeds limit
    HtlcValueExceeded,
    /// Invalid signature
    InvalidSignature,
    /// Commitment number is not the next one
    InvalidCommitmentNumber { expected: u64, got: u64 },
    /// Unknown HTLC
    UnknownHtlc,
    /// HTLC id out of sequence
    DuplicateHtlc,
    /// Invalid preimage
    InvalidPreimage,
    /// HTLC expired
    HtlcExpired,
    /// Channel reserve violated
    ReserveViolation,
    /// Funding error
    FundingError(String),
    /// Released secret does not match the published point
    InvalidRevocation,
    /// A local proposal is already awaiting signatures
    UpdateInFlight,
    /// Protocol error
    ProtocolError(String),
    /// Channel record could not be written
    Persistence(String),
}

impl ChannelError {
    /// Errors that mean the counterparty broke the protocol
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            ChannelError::InvalidSignature |
            ChannelError::InvalidCommitmentNumber { .. } |
            ChannelError::InvalidRevocation |
            ChannelError::ProtocolError(_)
        )
    }
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::InvalidState(s) => write!(f, "Invalid state: {}", s),
            ChannelError::InsufficientBalance => write!(f, "Insufficient balance"),
            ChannelError::BelowHtlcMinimum => write!(f, "Amount below HTLC minimum"),
            ChannelError::TooManyHtlcs => write!(f, "Too many HTLCs"),
            ChannelError::HtlcValueExceeded => write!(f, "HTLC value exceeded"),
            ChannelError::InvalidSignature => write!(f, "Invalid signature"),
            ChannelError::InvalidCommitmentNumber { expected, got } => {
                write!(f, "Invalid commitment number: expected {}, got {}", expected, got)
            }
            ChannelError::UnknownHtlc => write!(f, "Unknown HTLC"),
            ChannelError::DuplicateHtlc => write!(f, "Duplicate HTLC"),
            ChannelError::InvalidPreimage => write!(f, "Invalid preimage"),
            ChannelError::HtlcExpired => write!(f, "HTLC expired"),
            ChannelError::ReserveViolation => write!(f, "Channel reserve violated"),
            ChannelError::FundingError(s) => write!(f, "Funding error: {}", s),
            ChannelError::InvalidRevocation => write!(f, "Invalid revocation secret"),
            ChannelError::UpdateInFlight => write!(f, "Update already in flight"),
            ChannelError::ProtocolError(s) => write!(f, "Protocol error: {}", s),
            ChannelError::Persistence(s) => write!(f, "Persistence error: {}", s),
        }
    }
}

impl std::error::Error for ChannelError {}

// =============================================================================
// Channel Updates
// =============================================================================

/// A balance-affecting change proposed by one party
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelUpdate {
    AddHtlc {
        id: HtlcId,
        amount: u64,
        payment_hash: PaymentHash,
        cltv_expiry: u32,
        onion_packet: Option<Vec<u8>>,
    },
    FulfillHtlc {
        id: HtlcId,
        preimage: PaymentPreimage,
    },
    FailHtlc {
        id: HtlcId,
        reason: HtlcFailReason,
        /// Channel where the failure originated, if known
        failing_channel: Option<ChannelId>,
    },
    UpdateFee {
        fee: u64,
    },
}

impl ChannelUpdate {
    pub fn name(&self) -> &'static str {
        match self {
            ChannelUpdate::AddHtlc { .. } => "add_htlc",
            ChannelUpdate::FulfillHtlc { .. } => "fulfill_htlc",
            ChannelUpdate::FailHtlc { .. } => "fail_htlc",
            ChannelUpdate::UpdateFee { .. } => "update_fee",
        }
    }
}

// =============================================================================
// Channel
// =============================================================================

/// A payment channel between two nodes, seen from the local node
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Channel {
    /// Unique channel identifier
    pub channel_id: ChannelId,

    /// ID used during funding negotiation
    pub temporary_id: ChannelId,

    /// Current state
    pub state: ChannelState,

    /// Who funded the channel (pays the commitment fee)
    pub funder: ChannelParty,

    pub local_node: NodeId,
    pub remote_node: NodeId,

    /// Total channel capacity
    pub capacity: u64,

    /// Current balance
    pub balance: Balance,

    /// Channel reserve (each side must maintain)
    pub reserve: u64,

    /// Channel configuration
    pub config: ChannelConfig,

    /// Funding transaction details
    pub funding_txid: Option<[u8; 32]>,
    pub funding_output_index: Option<u32>,
    /// First block seen after funding
    pub funding_height: Option<u32>,

    /// Current commitment number (increases with each update)
    pub commitment_number: u64,

    pub htlcs: HtlcSet,

    /// Next id for an HTLC we offer
    pub next_offered_id: u64,
    /// Next id expected from the remote
    pub next_received_id: u64,

    /// Timestamps
    pub created_at: u64,
    pub last_updated: u64,
}

impl Channel {
    /// Create a new outbound channel (we are funding)
    pub fn new_outbound(
        local_node: NodeId,
        remote_node: NodeId,
        capacity: u64,
        push_amount: u64,
        config: ChannelConfig,
    ) -> Result<Self, ChannelError> {
        Self::validate_capacity(capacity)?;
        if push_amount > capacity {
            return Err(ChannelError::FundingError(
                format!("Push amount {} exceeds capacity {}", push_amount, capacity)
            ));
        }

        let reserve = calculate_reserve(capacity);
        let local_balance = capacity - push_amount;

        // Verify we have enough after reserve
        if local_balance < reserve {
            return Err(ChannelError::ReserveViolation);
        }

        let temporary_id = ChannelId::temporary();
        Ok(Self::build(
            temporary_id,
            ChannelParty::Local,
            local_node,
            remote_node,
            capacity,
            Balance::new(local_balance, push_amount),
            reserve,
            config,
        ))
    }

    /// Create a new inbound channel (they are funding)
    pub fn new_inbound(
        temporary_id: ChannelId,
        local_node: NodeId,
        remote_node: NodeId,
        capacity: u64,
        push_amount: u64,
        config: ChannelConfig,
    ) -> Result<Self, ChannelError> {
        Self::validate_capacity(capacity)?;
        if push_amount > capacity {
            return Err(ChannelError::FundingError(
                format!("Push amount {} exceeds capacity {}", push_amount, capacity)
            ));
        }

        let reserve = calculate_reserve(capacity);
        Ok(Self::build(
            temporary_id,
            ChannelParty::Remote,
            local_node,
            remote_node,
            capacity,
            Balance::new(push_amount, capacity - push_amount),
            reserve,
            config,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        temporary_id: ChannelId,
        funder: ChannelParty,
        local_node: NodeId,
        remote_node: NodeId,
        capacity: u64,
        balance: Balance,
        reserve: u64,
        config: ChannelConfig,
    ) -> Self {
        let now = unix_time();
        Channel {
            channel_id: temporary_id,
            temporary_id,
            state: ChannelState::Opening { confirmations: 0 },
            funder,
            local_node,
            remote_node,
            capacity,
            balance,
            reserve,
            config,
            funding_txid: None,
            funding_output_index: None,
            funding_height: None,
            commitment_number: 0,
            htlcs: HtlcSet::new(),
            next_offered_id: 0,
            next_received_id: 0,
            created_at: now,
            last_updated: now,
        }
    }

    /// Validate channel capacity
    fn validate_capacity(capacity: u64) -> Result<(), ChannelError> {
        if capacity < super::MIN_CHANNEL_CAPACITY {
            return Err(ChannelError::FundingError(
                format!("Capacity {} below minimum {}", capacity, super::MIN_CHANNEL_CAPACITY)
            ));
        }
        if capacity > super::MAX_CHANNEL_CAPACITY {
            return Err(ChannelError::FundingError(
                format!("Capacity {} above maximum {}", capacity, super::MAX_CHANNEL_CAPACITY)
            ));
        }
        Ok(())
    }

    pub fn is_funder(&self) -> bool {
        self.funder == ChannelParty::Local
    }

    /// Set funding outpoint; the channel id is derived from it
    pub fn set_funding(&mut self, txid: [u8; 32], output_index: u32) {
        self.funding_txid = Some(txid);
        self.funding_output_index = Some(output_index);
        self.channel_id = generate_channel_id(&txid, output_index);
        self.update_timestamp();
    }

    /// Count the funding confirmations at `height`. Returns true when the
    /// channel became active. A height seen twice counts once.
    pub fn confirm_funding(&mut self, height: u32) -> Result<bool, ChannelError> {
        if self.funding_txid.is_none() {
            return Err(ChannelError::InvalidState(
                "Funding not negotiated".to_string()
            ));
        }

        let first = *self.funding_height.get_or_insert(height);
        let required = self.config.funding_confirmations;
        match &mut self.state {
            ChannelState::Opening { confirmations } => {
                let seen = height.saturating_sub(first).saturating_add(1);
                if seen <= *confirmations {
                    return Ok(false);
                }
                *confirmations = seen;

                if seen >= required {
                    self.state = ChannelState::Active;
                    self.update_timestamp();
                    return Ok(true);
                }

                self.update_timestamp();
                Ok(false)
            }
            _ => Err(ChannelError::InvalidState(
                "Channel not in funding state".to_string()
            )),
        }
    }

    /// Validate and apply an update proposed by `proposer`.
    ///
    /// On error the channel is left untouched.
    pub fn apply_update(
        &mut self,
        update: &ChannelUpdate,
        proposer: ChannelParty,
    ) -> Result<(), ChannelError> {
        let settles = match update {
            ChannelUpdate::FulfillHtlc { id, .. } | ChannelUpdate::FailHtlc { id, .. } => {
                Some((proposer.other().offered_direction(), *id))
            }
            _ => None,
        };

        match update {
            ChannelUpdate::AddHtlc { id, amount, payment_hash, cltv_expiry, onion_packet } => {
                self.add_htlc(proposer, *id, *amount, *payment_hash, *cltv_expiry, onion_packet.clone())
            }
            ChannelUpdate::FulfillHtlc { id, preimage } => {
                self.fulfill_htlc(proposer, *id, preimage)
            }
            ChannelUpdate::FailHtlc { id, reason, .. } => {
                self.fail_htlc(proposer, *id, reason.clone())
            }
            ChannelUpdate::UpdateFee { fee } => self.update_fee(proposer, *fee),
        }?;

        // HTLCs resolved by earlier updates are dropped once this one lands
        self.htlcs.cleanup_except(settles);
        self.update_timestamp();
        Ok(())
    }

    fn add_htlc(
        &mut self,
        offerer: ChannelParty,
        id: HtlcId,
        amount: u64,
        payment_hash: PaymentHash,
        cltv_expiry: u32,
        onion_packet: Option<Vec<u8>>,
    ) -> Result<(), ChannelError> {
        if !self.state.can_transact() {
            return Err(ChannelError::InvalidState(
                format!("Cannot add HTLC while {}", self.state)
            ));
        }

        let expected_id = match offerer {
            ChannelParty::Local => self.next_offered_id,
            ChannelParty::Remote => self.next_received_id,
        };
        if id.0 != expected_id {
            return Err(ChannelError::DuplicateHtlc);
        }

        if amount < self.config.htlc_minimum {
            return Err(ChannelError::BelowHtlcMinimum);
        }
        if self.htlcs.pending_count() >= self.config.max_htlcs {
            return Err(ChannelError::TooManyHtlcs);
        }
        if self.htlcs.total_in_flight().saturating_add(amount) > self.config.max_htlc_value_in_flight {
            return Err(ChannelError::HtlcValueExceeded);
        }

        let available = match offerer {
            ChannelParty::Local => self.balance.available_to_send(self.reserve),
            ChannelParty::Remote => self.balance.available_to_receive(self.reserve),
        };
        if amount > available {
            return Err(ChannelError::InsufficientBalance);
        }

        *self.balance.side_mut(offerer) -= amount;
        *self.balance.pending_mut(offerer) += amount;

        self.htlcs.insert(Htlc::new(
            id,
            payment_hash,
            amount,
            offerer.offered_direction(),
            cltv_expiry,
            onion_packet,
        ));

        match offerer {
            ChannelParty::Local => self.next_offered_id += 1,
            ChannelParty::Remote => self.next_received_id += 1,
        }
        Ok(())
    }

    fn fulfill_htlc(
        &mut self,
        fulfiller: ChannelParty,
        id: HtlcId,
        preimage: &PaymentPreimage,
    ) -> Result<(), ChannelError> {
        self.require_resolvable()?;

        // The fulfiller settles an HTLC the other party offered
        let offerer = fulfiller.other();
        let htlc = self.htlcs
            .find_mut(offerer.offered_direction(), id)
            .ok_or(ChannelError::UnknownHtlc)?;
        htlc.fulfill(preimage)?;
        let amount = htlc.amount;

        *self.balance.pending_mut(offerer) -= amount;
        *self.balance.side_mut(fulfiller) += amount;
        Ok(())
    }

    fn fail_htlc(
        &mut self,
        failer: ChannelParty,
        id: HtlcId,
        reason: HtlcFailReason,
    ) -> Result<(), ChannelError> {
        self.require_resolvable()?;

        let offerer = failer.other();
        let htlc = self.htlcs
            .find_mut(offerer.offered_direction(), id)
            .ok_or(ChannelError::UnknownHtlc)?;
        htlc.fail(reason)?;
        let amount = htlc.amount;

        *self.balance.pending_mut(offerer) -= amount;
        *self.balance.side_mut(offerer) += amount;
        Ok(())
    }

    fn update_fee(&mut self, proposer: ChannelParty, fee: u64) -> Result<(), ChannelError> {
        self.require_resolvable()?;

        if proposer != self.funder {
            return Err(ChannelError::ProtocolError(
                "Only the funder may update the fee".to_string()
            ));
        }

        let funder_balance = *self.balance.side_mut(self.funder) + self.balance.fee;
        if fee > funder_balance.saturating_sub(self.reserve) {
            return Err(ChannelError::InsufficientBalance);
        }

        *self.balance.side_mut(self.funder) = funder_balance - fee;
        self.balance.fee = fee;
        Ok(())
    }

    fn require_resolvable(&self) -> Result<(), ChannelError> {
        if self.state.can_resolve() {
            Ok(())
        } else {
            Err(ChannelError::InvalidState(
                format!("Cannot settle HTLCs while {}", self.state)
            ))
        }
    }

    /// Check the balance invariant against capacity and the HTLC set
    pub fn check_invariant(&self) -> Result<(), ChannelError> {
        if self.balance.total() != self.capacity {
            return Err(ChannelError::ProtocolError(format!(
                "Balance total {} does not match capacity {}",
                self.balance.total(),
                self.capacity
            )));
        }
        if self.balance.pending_offered != self.htlcs.pending_total(HtlcDirection::Offered)
            || self.balance.pending_received != self.htlcs.pending_total(HtlcDirection::Received)
        {
            return Err(ChannelError::ProtocolError(
                "Pending balance does not match HTLC set".to_string()
            ));
        }
        Ok(())
    }

    /// Pending HTLCs at or past their expiry
    pub fn expired_htlcs(&self, current_height: u32) -> Vec<Htlc> {
        self.htlcs.expired(current_height).into_iter().cloned().collect()
    }

    /// Initiate cooperative close
    pub fn initiate_shutdown(&mut self, initiator: ChannelParty) -> Result<(), ChannelError> {
        match self.state {
            ChannelState::Active => {
                self.state = ChannelState::ClosingInitiated { initiator };
                self.update_timestamp();
                Ok(())
            }
            ChannelState::ClosingInitiated { .. } => Ok(()),
            _ => Err(ChannelError::InvalidState(
                "Can only shutdown active channel".to_string()
            )),
        }
    }

    /// Ready to exchange closing signatures
    pub fn can_complete_shutdown(&self) -> bool {
        matches!(self.state, ChannelState::ClosingInitiated { .. })
            && self.htlcs.pending_count() == 0
    }

    /// Force close (unilateral). Pending HTLCs time out back to their
    /// offerer; the timed-out HTLCs are returned.
    pub fn force_close(
        &mut self,
        current_height: u32,
        initiator: ChannelParty,
    ) -> Result<Vec<Htlc>, ChannelError> {
        if matches!(self.state, ChannelState::Closed { .. } | ChannelState::ForceClosed { .. }) {
            return Err(ChannelError::InvalidState(
                "Channel already closed".to_string()
            ));
        }

        let mut timed_out = Vec::new();
        for direction in [HtlcDirection::Offered, HtlcDirection::Received] {
            let side = match direction {
                HtlcDirection::Offered => &mut self.htlcs.offered,
                HtlcDirection::Received => &mut self.htlcs.received,
            };
            for htlc in side.iter_mut().filter(|h| h.state.is_pending()) {
                htlc.time_out();
                timed_out.push(htlc.clone());
            }
        }

        for htlc in &timed_out {
            match htlc.direction {
                HtlcDirection::Offered => {
                    self.balance.pending_offered -= htlc.amount;
                    self.balance.local += htlc.amount;
                }
                HtlcDirection::Received => {
                    self.balance.pending_received -= htlc.amount;
                    self.balance.remote += htlc.amount;
                }
            }
        }

        self.state = ChannelState::ForceClosed {
            commitment_number: self.commitment_number,
            broadcast_height: current_height,
            initiator,
        };

        self.update_timestamp();
        Ok(timed_out)
    }

    /// Height at which a force-closed channel settles
    pub fn force_close_maturity(&self) -> Option<u32> {
        match self.state {
            ChannelState::ForceClosed { broadcast_height, .. } => {
                Some(broadcast_height.saturating_add(self.config.to_self_delay))
            }
            _ => None,
        }
    }

    /// Mark channel as closed
    pub fn mark_closed(&mut self, close_type: CloseType) {
        self.state = ChannelState::Closed {
            close_type,
            final_balance_local: self.balance.local,
            final_balance_remote: self.balance.remote,
        };
        self.update_timestamp();
    }

    /// Get channel info
    pub fn info(&self) -> ChannelInfo {
        ChannelInfo {
            channel_id: self.channel_id,
            remote_node: self.remote_node,
            state: self.state.to_string(),
            is_funder: self.is_funder(),
            capacity: self.capacity,
            local_balance: self.balance.local,
            remote_balance: self.balance.remote,
            pending_offered: self.balance.pending_offered,
            pending_received: self.balance.pending_received,
            fee: self.balance.fee,
            reserve: self.reserve,
            commitment_number: self.commitment_number,
            htlc_count: self.htlcs.pending_count(),
            can_send: if self.state.can_transact() {
                self.balance.available_to_send(self.reserve)
            } else {
                0
            },
            can_receive: if self.state.can_transact() {
                self.balance.available_to_receive(self.reserve)
            } else {
                0
            },
        }
    }

    fn update_timestamp(&mut self) {
        self.last_updated = unix_time();
    }
}

// =============================================================================
// Channel Info (for display)
// =============================================================================

/// Summary information about a channel
#[derive(Clone, Debug, Serialize)]
pub struct ChannelInfo {
    pub channel_id: ChannelId,
    pub remote_node: NodeId,
    pub state: String,
    pub is_funder: bool,
    pub capacity: u64,
    pub local_balance: u64,
    pub remote_balance: u64,
    pub pending_offered: u64,
    pub pending_received: u64,
    pub fee: u64,
    pub reserve: u64,
    pub commitment_number: u64,
    pub htlc_count: usize,
    pub can_send: u64,
    pub can_receive: u64,
}

impl std::fmt::Display for ChannelInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Channel: {} (peer {})", self.channel_id, self.remote_node)?;
        writeln!(f, "  State: {}", self.state)?;
        writeln!(f, "  Capacity: {} sat", self.capacity)?;
        writeln!(f, "  Local: {} sat", self.local_balance)?;
        writeln!(f, "  Remote: {} sat", self.remote_balance)?;
        writeln!(f, "  Pending: {} out / {} in", self.pending_offered, self.pending_received)?;
        writeln!(f, "  Can Send: {} sat", self.can_send)?;
        writeln!(f, "  Can Receive: {} sat", self.can_receive)?;
        writeln!(f, "  Commitments: {}", self.commitment_number)?;
        writeln!(f, "  HTLCs: {}", self.htlc_count)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::NodeKeys;

    fn active_channel(capacity: u64, push: u64) -> Channel {
        let mut channel = Channel::new_outbound(
            NodeKeys::generate().node_id(),
            NodeKeys::generate().node_id(),
            capacity,
            push,
            ChannelConfig::default(),
        ).unwrap();

        channel.set_funding([0xAB; 32], 0);
        for height in 1..=3 {
            channel.confirm_funding(height).unwrap();
        }
        channel
    }

    fn add(id: u64, amount: u64, preimage: &PaymentPreimage) -> ChannelUpdate {
        ChannelUpdate::AddHtlc {
            id: HtlcId::new(id),
            amount,
            payment_hash: preimage.payment_hash(),
            cltv_expiry: 500,
            onion_packet: None,
        }
    }

    #[test]
    fn test_create_outbound_channel() {
        let channel = Channel::new_outbound(
            NodeKeys::generate().node_id(),
            NodeKeys::generate().node_id(),
            100_000,
            40_000,
            ChannelConfig::default(),
        ).unwrap();

        assert_eq!(channel.balance.local, 60_000);
        assert_eq!(channel.balance.remote, 40_000);
        assert_eq!(channel.funder, ChannelParty::Local);
        assert!(matches!(channel.state, ChannelState::Opening { confirmations: 0 }));
        channel.check_invariant().unwrap();
    }

    #[test]
    fn test_capacity_limits() {
        let a = NodeKeys::generate().node_id();
        let b = NodeKeys::generate().node_id();

        let result = Channel::new_outbound(a, b, 1_000, 0, ChannelConfig::default());
        assert!(matches!(result, Err(ChannelError::FundingError(_))));

        // Pushing everything leaves no reserve
        let result = Channel::new_outbound(a, b, 100_000, 100_000, ChannelConfig::default());
        assert!(matches!(result, Err(ChannelError::ReserveViolation)));
    }

    #[test]
    fn test_channel_funding() {
        let mut channel = Channel::new_outbound(
            NodeKeys::generate().node_id(),
            NodeKeys::generate().node_id(),
            100_000,
            0,
            ChannelConfig::default(),
        ).unwrap();

        // Confirmations before funding are rejected
        assert!(channel.confirm_funding(10).is_err());

        let temp = channel.temporary_id;
        channel.set_funding([0xAB; 32], 0);
        assert_ne!(channel.channel_id, temp);

        for height in [10, 11] {
            let active = channel.confirm_funding(height).unwrap();
            assert!(!active);
        }

        // Third confirmation activates
        let active = channel.confirm_funding(12).unwrap();
        assert!(active);
        assert!(matches!(channel.state, ChannelState::Active));
    }

    #[test]
    fn test_repeated_block_counts_once() {
        let mut channel = Channel::new_outbound(
            NodeKeys::generate().node_id(),
            NodeKeys::generate().node_id(),
            100_000,
            0,
            ChannelConfig::default(),
        ).unwrap();
        channel.set_funding([0xAB; 32], 0);

        for height in [20, 20, 21, 21, 21] {
            assert!(!channel.confirm_funding(height).unwrap());
        }
        assert!(matches!(channel.state, ChannelState::Opening { confirmations: 2 }));

        // A stale height does not move the count back
        assert!(!channel.confirm_funding(19).unwrap());
        assert!(matches!(channel.state, ChannelState::Opening { confirmations: 2 }));

        assert!(channel.confirm_funding(22).unwrap());
        assert_eq!(channel.funding_height, Some(20));
    }

    #[test]
    fn test_add_and_fulfill_htlc() {
        let mut channel = active_channel(100_000, 40_000);
        let preimage = PaymentPreimage::generate();

        channel.apply_update(&add(0, 5_000, &preimage), ChannelParty::Local).unwrap();
        assert_eq!(channel.balance.local, 55_000);
        assert_eq!(channel.balance.remote, 40_000);
        assert_eq!(channel.balance.pending_offered, 5_000);
        channel.check_invariant().unwrap();

        let fulfill = ChannelUpdate::FulfillHtlc { id: HtlcId::new(0), preimage };
        channel.apply_update(&fulfill, ChannelParty::Remote).unwrap();
        assert_eq!(channel.balance.local, 55_000);
        assert_eq!(channel.balance.remote, 45_000);
        assert_eq!(channel.balance.pending_offered, 0);
        channel.check_invariant().unwrap();
    }

    #[test]
    fn test_fail_htlc_returns_funds() {
        let mut channel = active_channel(100_000, 40_000);
        let preimage = PaymentPreimage::generate();

        // Remote offers, we fail it back
        channel.apply_update(&add(0, 7_000, &preimage), ChannelParty::Remote).unwrap();
        assert_eq!(channel.balance.remote, 33_000);
        assert_eq!(channel.balance.pending_received, 7_000);

        let fail = ChannelUpdate::FailHtlc {
            id: HtlcId::new(0),
            reason: HtlcFailReason::UnknownPaymentHash,
            failing_channel: None,
        };
        channel.apply_update(&fail, ChannelParty::Local).unwrap();
        assert_eq!(channel.balance.remote, 40_000);
        assert_eq!(channel.balance.local, 60_000);
        channel.check_invariant().unwrap();
    }

    #[test]
    fn test_insufficient_balance() {
        let mut channel = active_channel(100_000, 40_000);
        let preimage = PaymentPreimage::generate();

        // Must maintain reserve
        let result = channel.apply_update(&add(0, 60_000, &preimage), ChannelParty::Local);
        assert!(matches!(result, Err(ChannelError::InsufficientBalance)));
        assert_eq!(channel.balance.local, 60_000);
        assert_eq!(channel.next_offered_id, 0);
    }

    #[test]
    fn test_rejected_update_keeps_settled_htlcs() {
        let mut channel = active_channel(100_000, 40_000);
        let preimage = PaymentPreimage::generate();

        channel.apply_update(&add(0, 5_000, &preimage), ChannelParty::Local).unwrap();
        let fulfill = ChannelUpdate::FulfillHtlc { id: HtlcId::new(0), preimage };
        channel.apply_update(&fulfill, ChannelParty::Remote).unwrap();
        assert_eq!(channel.htlcs.offered.len(), 1);

        // Fulfilling twice fails and leaves the settled HTLC in place
        assert!(channel.apply_update(&fulfill, ChannelParty::Remote).is_err());
        assert_eq!(channel.htlcs.offered.len(), 1);
        assert!(channel.htlcs.offered[0].preimage().is_some());

        // The next accepted update drops it
        let other = PaymentPreimage::generate();
        channel.apply_update(&add(1, 1_000, &other), ChannelParty::Local).unwrap();
        assert_eq!(channel.htlcs.offered.len(), 1);
        assert_eq!(channel.htlcs.offered[0].id, HtlcId::new(1));
    }

    #[test]
    fn test_htlc_id_sequence() {
        let mut channel = active_channel(100_000, 40_000);
        let preimage = PaymentPreimage::generate();

        let result = channel.apply_update(&add(3, 1_000, &preimage), ChannelParty::Local);
        assert!(matches!(result, Err(ChannelError::DuplicateHtlc)));

        channel.apply_update(&add(0, 1_000, &preimage), ChannelParty::Local).unwrap();
        let result = channel.apply_update(&add(0, 1_000, &preimage), ChannelParty::Local);
        assert!(matches!(result, Err(ChannelError::DuplicateHtlc)));
    }

    #[test]
    fn test_update_fee_only_funder() {
        let mut channel = active_channel(100_000, 40_000);

        let result = channel.apply_update(&ChannelUpdate::UpdateFee { fee: 500 }, ChannelParty::Remote);
        assert!(matches!(result, Err(ChannelError::ProtocolError(_))));

        channel.apply_update(&ChannelUpdate::UpdateFee { fee: 500 }, ChannelParty::Local).unwrap();
        assert_eq!(channel.balance.local, 59_500);
        assert_eq!(channel.balance.fee, 500);

        channel.apply_update(&ChannelUpdate::UpdateFee { fee: 200 }, ChannelParty::Local).unwrap();
        assert_eq!(channel.balance.local, 59_800);
        channel.check_invariant().unwrap();
    }

    #[test]
    fn test_force_close_times_out_htlcs() {
        let mut channel = active_channel(100_000, 40_000);
        let preimage = PaymentPreimage::generate();
        channel.apply_update(&add(0, 5_000, &preimage), ChannelParty::Local).unwrap();

        let timed_out = channel.force_close(700, ChannelParty::Local).unwrap();
        assert_eq!(timed_out.len(), 1);
        assert_eq!(channel.balance.local, 60_000);
        assert!(matches!(
            channel.htlcs.find(HtlcDirection::Offered, HtlcId::new(0)).unwrap().state,
            super::super::HtlcState::TimedOut
        ));
        assert_eq!(channel.force_close_maturity(), Some(700 + DEFAULT_CSV_DELAY));
        channel.check_invariant().unwrap();

        assert!(channel.force_close(701, ChannelParty::Local).is_err());
    }

    #[test]
    fn test_cooperative_close() {
        let mut channel = active_channel(100_000, 0);
        let preimage = PaymentPreimage::generate();
        channel.apply_update(&add(0, 5_000, &preimage), ChannelParty::Local).unwrap();

        channel.initiate_shutdown(ChannelParty::Local).unwrap();
        assert!(matches!(channel.state, ChannelState::ClosingInitiated { .. }));
        assert!(!channel.can_complete_shutdown());

        // No new HTLCs while closing
        let result = channel.apply_update(&add(1, 1_000, &preimage), ChannelParty::Local);
        assert!(matches!(result, Err(ChannelError::InvalidState(_))));

        let fulfill = ChannelUpdate::FulfillHtlc { id: HtlcId::new(0), preimage };
        channel.apply_update(&fulfill, ChannelParty::Remote).unwrap();
        assert!(channel.can_complete_shutdown());

        channel.mark_closed(CloseType::Cooperative);
        assert!(matches!(
            channel.state,
            ChannelState::Closed { final_balance_local: 95_000, final_balance_remote: 5_000, .. }
        ));
    }
}
