// =============================================================================
// ROMER - Payment Channel Node
// Channel state machines, HTLC forwarding and multi-hop payment routing
// =============================================================================

pub mod channels;
pub mod config;
pub mod error;
pub mod events;
pub mod invoice;
pub mod keys;
pub mod messages;
pub mod node;
pub mod payment;
pub mod routing;
pub mod store;
pub mod transport;

pub use channels::{Balance, ChannelId, ChannelInfo, HtlcFailReason, PaymentHash, PaymentPreimage};
pub use config::{Network, NodeConfig};
pub use error::{ErrorKind, NodeError};
pub use events::{EventHandler, NodeEvent};
pub use invoice::Invoice;
pub use keys::{NodeId, NodeKeys};
pub use node::{open_store, Balances, Node, NodeStatus};
pub use payment::{PaymentFailure, PaymentRecord, PaymentSuccess};
pub use transport::{InMemoryNetwork, PeerTransport};

// --- Units ---
pub const SATS_PER_BTC: u64 = 100_000_000;

// --- Utilities ---
pub(crate) fn unix_time() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

pub fn format_sats(satoshis: u64) -> String {
    let whole = satoshis / SATS_PER_BTC;
    let frac = satoshis % SATS_PER_BTC;
    if frac == 0 {
        format!("{} sat ({} BTC)", satoshis, whole)
    } else {
        format!("{} sat ({}.{:08} BTC)", satoshis, whole, frac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_sats() {
        assert_eq!(format_sats(0), "0 sat (0 BTC)");
        assert_eq!(format_sats(SATS_PER_BTC), "100000000 sat (1 BTC)");
        assert_eq!(format_sats(150_000), "150000 sat (0.00150000 BTC)");
    }
}
