// =============================================================================
// ROMER - Payment Channels
// =============================================================================
//
// Per-channel commitment state machine.
//
// Architecture:
// ┌─────────────────────────────────────────────────────────────────────────┐
// │                         PAYMENT CHANNELS                                │
// ├─────────────────────────────────────────────────────────────────────────┤
// │                                                                         │
// │  ┌──────────┐    ┌──────────┐    ┌──────────┐    ┌──────────────────┐  │
// │  │ Channel  │    │  HTLC    │    │ Commit   │    │    Channel       │  │
// │  │  State   │───▶│   Set    │───▶│   TX     │───▶│    Machine       │  │
// │  └──────────┘    └──────────┘    └──────────┘    └──────────────────┘  │
// │                                       │                   │            │
// │                                       ▼                   ▼            │
// │                                 ┌──────────┐      ┌──────────────┐     │
// │                                 │Revocation│      │   Channel    │     │
// │                                 │  Store   │      │    Store     │     │
// │                                 └──────────┘      └──────────────┘     │
// │                                                                         │
// └─────────────────────────────────────────────────────────────────────────┘
//
// Every balance-affecting update (HTLC add/fulfill/fail, fee update) moves
// the channel from commitment N to N+1. The secret for N is released only
// after N+1 carries both signatures and has been written to the store.
//
// =============================================================================

pub mod state;
pub mod commitment;
pub mod htlc;
pub mod machine;

pub use state::{
    Balance, Channel, ChannelConfig, ChannelError, ChannelId, ChannelInfo, ChannelParty,
    ChannelState, ChannelUpdate, CloseType,
};
pub use htlc::{HtlcDirection, HtlcFailReason, HtlcId, HtlcState, PaymentHash, PaymentPreimage};
pub use commitment::{CommitmentSecret, CommitmentTransaction, RevocationStore};
pub use machine::{ChannelMachine, ChannelRecord, CommittedUpdate, MachineOutput};

// =============================================================================
// Constants
// =============================================================================

/// Minimum channel capacity (sats)
pub const MIN_CHANNEL_CAPACITY: u64 = 20_000;

/// Maximum channel capacity (10 BTC)
pub const MAX_CHANNEL_CAPACITY: u64 = 10 * 100_000_000;

/// Default HTLC minimum (sats)
pub const DEFAULT_HTLC_MINIMUM: u64 = 1;

/// Maximum HTLCs per channel
pub const MAX_HTLCS_PER_CHANNEL: usize = 483;

/// Default CSV delay before a force-closed channel settles
pub const DEFAULT_CSV_DELAY: u32 = 144;

/// Channel reserve (1% of capacity, minimum 1000 sat)
pub const CHANNEL_RESERVE_PERCENT: u64 = 1;
pub const MIN_CHANNEL_RESERVE: u64 = 1000;

/// Furthest an HTLC may expire from the current height (2 weeks)
pub const MAX_CLTV_EXPIRY_DELTA: u32 = 2016;

/// Default per-hop expiry delta
pub const DEFAULT_CLTV_EXPIRY_DELTA: u32 = 40;

/// Expiry delta given to the final hop
pub const MIN_FINAL_CLTV_EXPIRY_DELTA: u32 = 18;

/// Confirmations before a channel becomes active
pub const DEFAULT_FUNDING_CONFIRMATIONS: u32 = 3;

// =============================================================================
// Helper Functions
// =============================================================================

/// Calculate channel reserve from capacity
pub fn calculate_reserve(capacity: u64) -> u64 {
    let reserve = capacity * CHANNEL_RESERVE_PERCENT / 100;
    std::cmp::max(reserve, MIN_CHANNEL_RESERVE)
}

/// Generate channel ID from funding outpoint
pub fn generate_channel_id(funding_txid: &[u8; 32], funding_index: u32) -> ChannelId {
    let mut id = *funding_txid;
    // XOR with output index (like Lightning)
    let idx_bytes = funding_index.to_le_bytes();
    id[0] ^= idx_bytes[0];
    id[1] ^= idx_bytes[1];
    id[2] ^= idx_bytes[2];
    id[3] ^= idx_bytes[3];
    ChannelId(id)
}

// =============================================================================
// Tests
// =============================================================================
