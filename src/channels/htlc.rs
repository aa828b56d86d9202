// =============================================================================
// ROMER - HTLC (Hash Time Lock Contracts)
// =============================================================================
//
// HTLCs enable trustless multi-hop payments through the network.
//
// ┌─────────────────────────────────────────────────────────────────────────┐
// │                           HTLC FLOW                                     │
// ├─────────────────────────────────────────────────────────────────────────┤
// │                                                                         │
// │   Alice ──────── HTLC(H) ────────▶ Bob ──────── HTLC(H) ────────▶ Carol │
// │                                                                         │
// │   Alice ◀──────── R ─────────────── Bob ◀─────── R ─────────────── Carol│
// │                                                                         │
// │   Expiry: N                     Expiry: N - delta                       │
// │                                                                         │
// └─────────────────────────────────────────────────────────────────────────┘
//
// An HTLC is owned by exactly one channel. Its id is assigned by the party
// that offers it, so the pair (direction, id) is unique within a channel.
//
// =============================================================================

use serde::{Serialize, Deserialize};
use sha2::{Sha256, Digest};

use super::state::ChannelError;
use crate::unix_time;

// =============================================================================
// Payment Hash & Preimage
// =============================================================================

/// Payment hash (SHA256 of preimage)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PaymentHash(pub [u8; 32]);

impl PaymentHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PaymentHash(bytes)
    }

    /// Create from preimage
    pub fn from_preimage(preimage: &PaymentPreimage) -> Self {
        let result = Sha256::digest(preimage.0);
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&result);
        PaymentHash(hash)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let array: [u8; 32] = bytes.try_into().ok()?;
        Some(PaymentHash(array))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short display
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl std::fmt::Display for PaymentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.short())
    }
}

/// Payment preimage (secret that unlocks HTLC)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentPreimage(pub [u8; 32]);

impl PaymentPreimage {
    /// Generate random preimage
    pub fn generate() -> Self {
        PaymentPreimage(rand::random())
    }

    pub fn payment_hash(&self) -> PaymentHash {
        PaymentHash::from_preimage(self)
    }

    /// Verify this preimage matches a payment hash
    pub fn verify(&self, hash: &PaymentHash) -> bool {
        self.payment_hash() == *hash
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

// =============================================================================
// HTLC Identifier
// =============================================================================

/// HTLC identifier, assigned by the offering party
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HtlcId(pub u64);

impl HtlcId {
    pub fn new(id: u64) -> Self {
        HtlcId(id)
    }
}

impl std::fmt::Display for HtlcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HTLC#{}", self.0)
    }
}

// =============================================================================
// HTLC Direction
// =============================================================================

/// Direction of HTLC from our perspective
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HtlcDirection {
    /// We are offering (sending) this HTLC
    Offered,
    /// We are receiving this HTLC
    Received,
}

impl HtlcDirection {
    pub fn is_offered(&self) -> bool {
        matches!(self, HtlcDirection::Offered)
    }

    pub fn opposite(&self) -> Self {
        match self {
            HtlcDirection::Offered => HtlcDirection::Received,
            HtlcDirection::Received => HtlcDirection::Offered,
        }
    }
}

// =============================================================================
// HTLC State
// =============================================================================

/// State of an HTLC
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HtlcState {
    /// Locked in the channel, awaiting resolution
    Pending,

    /// Preimage revealed, amount moved to the receiver
    Fulfilled {
        preimage: [u8; 32],
    },

    /// Failed back to the offerer
    Failed {
        reason: HtlcFailReason,
    },

    /// Expired or abandoned by a force-close, amount returned to the offerer
    TimedOut,
}

impl HtlcState {
    pub fn is_pending(&self) -> bool {
        matches!(self, HtlcState::Pending)
    }

    pub fn is_resolved(&self) -> bool {
        !self.is_pending()
    }
}

/// Reason for HTLC failure
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HtlcFailReason {
    /// Final node does not know the payment hash
    UnknownPaymentHash,
    /// Final node got the wrong amount
    IncorrectAmount,
    /// Expiry too close to forward safely
    ExpiryTooSoon,
    /// Next channel cannot carry the amount
    InsufficientCapacity,
    /// Fee paid to the forwarding node is too low
    FeeInsufficient,
    /// Next channel unknown or not active
    ChannelDisabled,
    /// Next peer is not connected
    PeerOffline,
    /// Timed out waiting for resolution
    Timeout,
    /// Temporary failure
    TemporaryFailure,
    /// Permanent failure
    PermanentFailure,
}

impl HtlcFailReason {
    /// Failure raised by the final recipient
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            HtlcFailReason::UnknownPaymentHash | HtlcFailReason::IncorrectAmount
        )
    }
}

impl std::fmt::Display for HtlcFailReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HtlcFailReason::UnknownPaymentHash => "unknown payment hash",
            HtlcFailReason::IncorrectAmount => "incorrect amount",
            HtlcFailReason::ExpiryTooSoon => "expiry too soon",
            HtlcFailReason::InsufficientCapacity => "insufficient capacity",
            HtlcFailReason::FeeInsufficient => "fee insufficient",
            HtlcFailReason::ChannelDisabled => "channel disabled",
            HtlcFailReason::PeerOffline => "peer offline",
            HtlcFailReason::Timeout => "timeout",
            HtlcFailReason::TemporaryFailure => "temporary failure",
            HtlcFailReason::PermanentFailure => "permanent failure",
        };
        write!(f, "{}", s)
    }
}

// =============================================================================
// HTLC
// =============================================================================

/// Hash Time Lock Contract
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Htlc {
    /// ID assigned by the offerer
    pub id: HtlcId,

    pub payment_hash: PaymentHash,

    /// Amount in satoshis
    pub amount: u64,

    /// Direction (offered or received)
    pub direction: HtlcDirection,

    /// CLTV expiry (block height)
    pub cltv_expiry: u32,

    pub state: HtlcState,

    /// Forwarding instructions for the receiver
    pub onion_packet: Option<Vec<u8>>,

    pub created_at: u64,
    pub resolved_at: Option<u64>,
}

impl Htlc {
    pub fn new(
        id: HtlcId,
        payment_hash: PaymentHash,
        amount: u64,
        direction: HtlcDirection,
        cltv_expiry: u32,
        onion_packet: Option<Vec<u8>>,
    ) -> Self {
        Htlc {
            id,
            payment_hash,
            amount,
            direction,
            cltv_expiry,
            state: HtlcState::Pending,
            onion_packet,
            created_at: unix_time(),
            resolved_at: None,
        }
    }

    /// Fulfill with preimage
    pub fn fulfill(&mut self, preimage: &PaymentPreimage) -> Result<(), ChannelError> {
        if !self.state.is_pending() {
            return Err(ChannelError::UnknownHtlc);
        }
        if !preimage.verify(&self.payment_hash) {
            return Err(ChannelError::InvalidPreimage);
        }

        self.state = HtlcState::Fulfilled {
            preimage: preimage.0,
        };
        self.resolved_at = Some(unix_time());
        Ok(())
    }

    pub fn fail(&mut self, reason: HtlcFailReason) -> Result<(), ChannelError> {
        if !self.state.is_pending() {
            return Err(ChannelError::UnknownHtlc);
        }
        self.state = HtlcState::Failed { reason };
        self.resolved_at = Some(unix_time());
        Ok(())
    }

    pub fn time_out(&mut self) {
        if self.state.is_pending() {
            self.state = HtlcState::TimedOut;
            self.resolved_at = Some(unix_time());
        }
    }

    /// Check if HTLC has timed out
    pub fn is_expired(&self, current_height: u32) -> bool {
        current_height >= self.cltv_expiry
    }

    /// Get preimage if fulfilled
    pub fn preimage(&self) -> Option<PaymentPreimage> {
        match &self.state {
            HtlcState::Fulfilled { preimage } => Some(PaymentPreimage(*preimage)),
            _ => None,
        }
    }
}

// =============================================================================
// HTLC Set
// =============================================================================

/// HTLCs owned by one channel
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HtlcSet {
    /// Offered by us
    pub offered: Vec<Htlc>,

    /// Received from remote
    pub received: Vec<Htlc>,
}

impl HtlcSet {
    pub fn new() -> Self {
        HtlcSet::default()
    }

    pub fn insert(&mut self, htlc: Htlc) {
        match htlc.direction {
            HtlcDirection::Offered => self.offered.push(htlc),
            HtlcDirection::Received => self.received.push(htlc),
        }
    }

    pub fn find(&self, direction: HtlcDirection, id: HtlcId) -> Option<&Htlc> {
        self.side(direction).iter().find(|h| h.id == id)
    }

    pub fn find_mut(&mut self, direction: HtlcDirection, id: HtlcId) -> Option<&mut Htlc> {
        let side = match direction {
            HtlcDirection::Offered => &mut self.offered,
            HtlcDirection::Received => &mut self.received,
        };
        side.iter_mut().find(|h| h.id == id)
    }

    /// Find HTLC by payment hash
    pub fn find_by_hash(&self, hash: &PaymentHash) -> Option<&Htlc> {
        self.offered.iter()
            .chain(self.received.iter())
            .find(|h| h.payment_hash == *hash)
    }

    /// All unresolved HTLCs
    pub fn pending(&self) -> impl Iterator<Item = &Htlc> {
        self.offered.iter()
            .chain(self.received.iter())
            .filter(|h| h.state.is_pending())
    }

    pub fn pending_count(&self) -> usize {
        self.pending().count()
    }

    /// Sum of unresolved HTLCs in one direction
    pub fn pending_total(&self, direction: HtlcDirection) -> u64 {
        self.side(direction)
            .iter()
            .filter(|h| h.state.is_pending())
            .map(|h| h.amount)
            .sum()
    }

    /// Total value in flight
    pub fn total_in_flight(&self) -> u64 {
        self.pending().map(|h| h.amount).sum()
    }

    /// Unresolved HTLCs past their expiry
    pub fn expired(&self, current_height: u32) -> Vec<&Htlc> {
        self.pending()
            .filter(|h| h.is_expired(current_height))
            .collect()
    }

    /// Drop resolved HTLCs, except `keep` if given
    pub fn cleanup_except(&mut self, keep: Option<(HtlcDirection, HtlcId)>) {
        let kept = |h: &Htlc| h.state.is_pending() || keep == Some((h.direction, h.id));
        self.offered.retain(kept);
        self.received.retain(kept);
    }

    fn side(&self, direction: HtlcDirection) -> &Vec<Htlc> {
        match direction {
            HtlcDirection::Offered => &self.offered,
            HtlcDirection::Received => &self.received,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn offered(id: u64, preimage: &PaymentPreimage, amount: u64) -> Htlc {
        Htlc::new(
            HtlcId::new(id),
            preimage.payment_hash(),
            amount,
            HtlcDirection::Offered,
            1000,
            None,
        )
    }

    #[test]
    fn test_payment_preimage() {
        let preimage = PaymentPreimage::generate();
        let hash = preimage.payment_hash();

        assert!(preimage.verify(&hash));
        assert!(!PaymentPreimage::generate().verify(&hash));
        assert_eq!(PaymentHash::from_hex(&hash.to_hex()), Some(hash));
    }

    #[test]
    fn test_htlc_fulfill() {
        let preimage = PaymentPreimage::generate();
        let mut htlc = offered(0, &preimage, 100_000);
        assert!(htlc.state.is_pending());

        htlc.fulfill(&preimage).unwrap();
        assert!(htlc.state.is_resolved());
        assert_eq!(htlc.preimage(), Some(preimage));

        // Cannot resolve twice
        assert!(matches!(htlc.fail(HtlcFailReason::Timeout), Err(ChannelError::UnknownHtlc)));
    }

    #[test]
    fn test_htlc_wrong_preimage() {
        let preimage = PaymentPreimage::generate();
        let mut htlc = offered(0, &preimage, 100_000);

        let result = htlc.fulfill(&PaymentPreimage::generate());
        assert!(matches!(result, Err(ChannelError::InvalidPreimage)));
        assert!(htlc.state.is_pending());
    }

    #[test]
    fn test_htlc_set_totals() {
        let mut set = HtlcSet::new();
        let p1 = PaymentPreimage::generate();
        let p2 = PaymentPreimage::generate();

        set.insert(offered(0, &p1, 50_000));
        set.insert(Htlc::new(
            HtlcId::new(0),
            p2.payment_hash(),
            30_000,
            HtlcDirection::Received,
            1000,
            None,
        ));

        assert_eq!(set.pending_count(), 2);
        assert_eq!(set.pending_total(HtlcDirection::Offered), 50_000);
        assert_eq!(set.pending_total(HtlcDirection::Received), 30_000);

        // Same id, different direction
        set.find_mut(HtlcDirection::Offered, HtlcId::new(0)).unwrap().fulfill(&p1).unwrap();
        assert_eq!(set.total_in_flight(), 30_000);

        set.cleanup_except(Some((HtlcDirection::Offered, HtlcId::new(0))));
        assert!(set.find(HtlcDirection::Offered, HtlcId::new(0)).is_some());

        set.cleanup_except(None);
        assert!(set.find(HtlcDirection::Offered, HtlcId::new(0)).is_none());
        assert!(set.find_by_hash(&p2.payment_hash()).is_some());
    }

    #[test]
    fn test_htlc_expiry() {
        let preimage = PaymentPreimage::generate();
        let htlc = offered(0, &preimage, 100_000);

        assert!(!htlc.is_expired(999));
        assert!(htlc.is_expired(1000));
        assert!(htlc.is_expired(1001));
    }
}
