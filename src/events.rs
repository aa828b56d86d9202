// =============================================================================
// ROMER - Event Bus
// =============================================================================
//
// State transitions for external consumers. Two ways in:
//
//   subscribe()         -> tokio broadcast receiver (async consumers)
//   register_handler()  -> callback invoked synchronously on emit
//
// A slow broadcast receiver lags and loses old events; it never blocks the
// node.
//
// =============================================================================

use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

use crate::channels::{ChannelId, ChannelParty, CloseType, PaymentHash, PaymentPreimage};
use crate::keys::NodeId;
use crate::payment::{AttemptState, PaymentFailure};
use crate::routing::Route;

/// Default broadcast buffer
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

// =============================================================================
// Node Events
// =============================================================================

/// Events emitted by the node
#[derive(Clone, Debug)]
pub enum NodeEvent {
    /// Channel negotiated, waiting for funding signatures
    ChannelPending {
        channel_id: ChannelId,
        remote_node: NodeId,
        capacity: u64,
        is_funder: bool,
    },

    /// Commitment 0 signed by both sides
    ChannelFunded {
        channel_id: ChannelId,
        temporary_id: ChannelId,
    },

    /// Funding confirmed, channel usable
    ChannelActive {
        channel_id: ChannelId,
    },

    /// Cooperative close started
    ChannelClosing {
        channel_id: ChannelId,
        initiator: ChannelParty,
    },

    ChannelForceClosed {
        channel_id: ChannelId,
        reason: String,
        timed_out_htlcs: usize,
    },

    ChannelClosed {
        channel_id: ChannelId,
        close_type: CloseType,
        local_balance: u64,
        remote_balance: u64,
    },

    /// Counterparty broadcast a revoked commitment
    BreachDetected {
        channel_id: ChannelId,
        commitment_number: u64,
    },

    ProtocolViolation {
        channel_id: ChannelId,
        error: String,
    },

    HtlcForwarded {
        incoming_channel: ChannelId,
        outgoing_channel: ChannelId,
        amount_in: u64,
        amount_out: u64,
    },

    PaymentAttempt {
        payment_hash: PaymentHash,
        attempt: usize,
        route: Route,
        state: AttemptState,
    },

    PaymentSucceeded {
        payment_hash: PaymentHash,
        amount: u64,
        fee_paid: u64,
        preimage: PaymentPreimage,
    },

    PaymentFailed {
        payment_hash: PaymentHash,
        reason: PaymentFailure,
    },

    PaymentReceived {
        payment_hash: PaymentHash,
        amount: u64,
    },

    /// The node stopped after a persistence failure
    NodeHalted {
        reason: String,
    },
}

impl NodeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            NodeEvent::ChannelPending { .. } => "channel_pending",
            NodeEvent::ChannelFunded { .. } => "channel_funded",
            NodeEvent::ChannelActive { .. } => "channel_active",
            NodeEvent::ChannelClosing { .. } => "channel_closing",
            NodeEvent::ChannelForceClosed { .. } => "channel_force_closed",
            NodeEvent::ChannelClosed { .. } => "channel_closed",
            NodeEvent::BreachDetected { .. } => "breach_detected",
            NodeEvent::ProtocolViolation { .. } => "protocol_violation",
            NodeEvent::HtlcForwarded { .. } => "htlc_forwarded",
            NodeEvent::PaymentAttempt { .. } => "payment_attempt",
            NodeEvent::PaymentSucceeded { .. } => "payment_succeeded",
            NodeEvent::PaymentFailed { .. } => "payment_failed",
            NodeEvent::PaymentReceived { .. } => "payment_received",
            NodeEvent::NodeHalted { .. } => "node_halted",
        }
    }
}

// =============================================================================
// Event Handler
// =============================================================================

/// Callback surface for bindings and UIs
pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: &NodeEvent);
}

// =============================================================================
// Event Bus
// =============================================================================

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<NodeEvent>,
    handlers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        EventBus {
            sender,
            handlers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.sender.subscribe()
    }

    pub fn register_handler(&self, handler: Arc<dyn EventHandler>) {
        match self.handlers.write() {
            Ok(mut handlers) => handlers.push(handler),
            Err(_) => log::error!("Event handler list poisoned; handler not registered"),
        }
    }

    pub fn emit(&self, event: NodeEvent) {
        log::debug!("Event: {}", event.name());

        match self.handlers.read() {
            Ok(handlers) => {
                for handler in handlers.iter() {
                    handler.handle_event(&event);
                }
            }
            Err(_) => log::error!("Event handler list poisoned"),
        }

        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        names: Mutex<Vec<&'static str>>,
    }

    impl EventHandler for Recorder {
        fn handle_event(&self, event: &NodeEvent) {
            self.names.lock().unwrap().push(event.name());
        }
    }

    #[tokio::test]
    async fn test_subscribers_and_handlers() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let recorder = Arc::new(Recorder::default());
        bus.register_handler(recorder.clone());

        let channel_id = ChannelId([4; 32]);
        bus.emit(NodeEvent::ChannelActive { channel_id });

        match rx.recv().await.unwrap() {
            NodeEvent::ChannelActive { channel_id: id } => assert_eq!(id, channel_id),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(*recorder.names.lock().unwrap(), vec!["channel_active"]);
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::default();
        bus.emit(NodeEvent::NodeHalted { reason: "test".to_string() });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
