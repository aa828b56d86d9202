// =============================================================================
// ROMER - Node Errors
// =============================================================================
//
// Every public node operation returns `NodeError`. Module errors convert
// into it with `From`; the taxonomy decides what happens next:
//
//   ProtocolViolation   channel is force-closed, never retried
//   Routing / Timeout   retried with exclusions up to the attempt bound
//   Persistence         node halts; every later call returns Halted
//
// =============================================================================

use crate::channels::{ChannelError, ChannelId, PaymentHash};
use crate::config::ConfigError;
use crate::invoice::InvoiceError;
use crate::payment::{PaymentError, PaymentFailure};
use crate::routing::RoutingError;
use crate::store::StoreError;
use crate::transport::TransportError;

/// How callers should react to an error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    ProtocolViolation,
    RoutingFailure,
    PersistenceFailure,
    Timeout,
    /// Bad input or unknown object; fix the request
    Invalid,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeError {
    /// Counterparty broke the channel protocol; channel force-closed
    ProtocolViolation { channel_id: ChannelId, reason: String },
    Routing(RoutingError),
    /// A write to the store failed; the node has halted
    Persistence(String),
    Timeout,
    /// The node stopped after a persistence failure
    Halted,
    /// `shutdown` was called
    Stopped,
    Channel(ChannelError),
    Payment(PaymentFailure),
    DuplicatePayment(PaymentHash),
    UnknownChannel(ChannelId),
    UnknownPayment(PaymentHash),
    Transport(TransportError),
    Invoice(InvoiceError),
    Config(ConfigError),
}

impl NodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NodeError::ProtocolViolation { .. } => ErrorKind::ProtocolViolation,
            NodeError::Channel(e) if e.is_protocol_violation() => ErrorKind::ProtocolViolation,
            NodeError::Persistence(_) | NodeError::Halted => ErrorKind::PersistenceFailure,
            NodeError::Channel(ChannelError::Persistence(_)) => ErrorKind::PersistenceFailure,
            NodeError::Timeout | NodeError::Payment(PaymentFailure::Timeout) => ErrorKind::Timeout,
            NodeError::Routing(_) | NodeError::Transport(_) => ErrorKind::RoutingFailure,
            NodeError::Payment(PaymentFailure::NoRoute | PaymentFailure::PeerOffline) => {
                ErrorKind::RoutingFailure
            }
            _ => ErrorKind::Invalid,
        }
    }

    /// Whether trying again (with exclusions) can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::RoutingFailure | ErrorKind::Timeout)
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::PersistenceFailure
    }
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeError::ProtocolViolation { channel_id, reason } => {
                write!(f, "Protocol violation on {}: {}", channel_id, reason)
            }
            NodeError::Routing(e) => write!(f, "Routing failure: {}", e),
            NodeError::Persistence(s) => write!(f, "Persistence failure: {}", s),
            NodeError::Timeout => write!(f, "Timed out"),
            NodeError::Halted => write!(f, "Node halted after a persistence failure"),
            NodeError::Stopped => write!(f, "Node is shut down"),
            NodeError::Channel(e) => write!(f, "Channel error: {}", e),
            NodeError::Payment(reason) => write!(f, "Payment failed: {}", reason),
            NodeError::DuplicatePayment(h) => write!(f, "Payment {} already in flight", h.short()),
            NodeError::UnknownChannel(c) => write!(f, "Unknown channel {}", c),
            NodeError::UnknownPayment(h) => write!(f, "Unknown payment {}", h.short()),
            NodeError::Transport(e) => write!(f, "Transport error: {}", e),
            NodeError::Invoice(e) => write!(f, "{}", e),
            NodeError::Config(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for NodeError {}

impl From<ChannelError> for NodeError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Persistence(s) => NodeError::Persistence(s),
            other => NodeError::Channel(other),
        }
    }
}

impl From<StoreError> for NodeError {
    fn from(e: StoreError) -> Self {
        NodeError::Persistence(e.to_string())
    }
}

impl From<RoutingError> for NodeError {
    fn from(e: RoutingError) -> Self {
        NodeError::Routing(e)
    }
}

impl From<PaymentError> for NodeError {
    fn from(e: PaymentError) -> Self {
        match e {
            PaymentError::DuplicatePayment(h) => NodeError::DuplicatePayment(h),
            PaymentError::UnknownPayment(h) => NodeError::UnknownPayment(h),
            PaymentError::Failed(reason) => NodeError::Payment(reason),
            PaymentError::Store(e) => NodeError::Persistence(e.to_string()),
        }
    }
}

impl From<TransportError> for NodeError {
    fn from(e: TransportError) -> Self {
        NodeError::Transport(e)
    }
}

impl From<InvoiceError> for NodeError {
    fn from(e: InvoiceError) -> Self {
        NodeError::Invoice(e)
    }
}

impl From<ConfigError> for NodeError {
    fn from(e: ConfigError) -> Self {
        NodeError::Config(e)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy() {
        let persistence: NodeError = StoreError::Database("disk full".into()).into();
        assert!(persistence.is_fatal());
        assert!(!persistence.is_retryable());

        let routing: NodeError = RoutingError::NoRoute.into();
        assert!(routing.is_retryable());

        let timeout: NodeError = PaymentError::Failed(PaymentFailure::Timeout).into();
        assert_eq!(timeout.kind(), ErrorKind::Timeout);

        let rejected: NodeError = PaymentError::Failed(PaymentFailure::RecipientRejected).into();
        assert!(!rejected.is_retryable());

        let violation = NodeError::ProtocolViolation {
            channel_id: ChannelId([1; 32]),
            reason: "bad signature".into(),
        };
        assert_eq!(violation.kind(), ErrorKind::ProtocolViolation);
        assert!(!violation.is_retryable());

        let halted: NodeError = ChannelError::Persistence("io".into()).into();
        assert_eq!(halted, NodeError::Persistence("io".into()));
    }
}
