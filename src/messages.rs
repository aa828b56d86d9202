// =============================================================================
// ROMER - Peer Messages
// =============================================================================
//
// Everything two nodes say to each other is one tagged variant. Messages are
// handled with an explicit `match`; there is no wire encoding, the transport
// hands the values over in-process.
//
// Update flow for commitment N → N+1 (P proposes, C co-signs):
//
//   P ── update_* ─────────────────────────────▶ C
//   P ── commitment_signed(N+1, sig_P, point_P) ▶ C   C stores N+1
//   P ◀──────────── revoke_and_ack(N, secret_C, sig_C) ── C
//   P stores N+1
//   P ── revoke_and_ack(N, secret_P) ──────────▶ C
//
// =============================================================================

use secp256k1::ecdsa::Signature;
use secp256k1::PublicKey;
use serde::{Serialize, Deserialize};

use crate::channels::{
    ChannelConfig, ChannelId, ChannelUpdate, CommitmentSecret, HtlcFailReason, HtlcId,
    PaymentHash, PaymentPreimage,
};

// =============================================================================
// Messages
// =============================================================================

/// Channel proposal sent by the funder
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenChannel {
    pub temporary_id: ChannelId,
    pub capacity: u64,
    pub push_amount: u64,
    pub config: ChannelConfig,
    pub funding_pubkey: PublicKey,
    /// Funder's point for commitment 0
    pub first_point: PublicKey,
}

/// A message between two peers
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    OpenChannel(OpenChannel),

    AcceptChannel {
        temporary_id: ChannelId,
        funding_pubkey: PublicKey,
        first_point: PublicKey,
    },

    /// Funder's signature on commitment 0
    FundingCreated {
        temporary_id: ChannelId,
        funding_txid: [u8; 32],
        funding_output_index: u32,
        signature: Signature,
    },

    /// Fundee's signature on commitment 0
    FundingSigned {
        channel_id: ChannelId,
        signature: Signature,
    },

    UpdateAddHtlc {
        channel_id: ChannelId,
        id: HtlcId,
        amount: u64,
        payment_hash: PaymentHash,
        cltv_expiry: u32,
        onion_packet: Option<Vec<u8>>,
    },

    UpdateFulfillHtlc {
        channel_id: ChannelId,
        id: HtlcId,
        preimage: PaymentPreimage,
    },

    UpdateFailHtlc {
        channel_id: ChannelId,
        id: HtlcId,
        reason: HtlcFailReason,
        failing_channel: Option<ChannelId>,
    },

    UpdateFee {
        channel_id: ChannelId,
        fee: u64,
    },

    /// Proposer's signature on the next commitment
    CommitmentSigned {
        channel_id: ChannelId,
        commitment_number: u64,
        signature: Signature,
        /// Proposer's point for `commitment_number`
        next_point: PublicKey,
    },

    /// Releases the secret for `revoked_number`. The co-signer's reply also
    /// carries its signature on the new commitment.
    RevokeAndAck {
        channel_id: ChannelId,
        revoked_number: u64,
        secret: CommitmentSecret,
        next_point: PublicKey,
        signature: Option<Signature>,
    },

    Shutdown {
        channel_id: ChannelId,
    },

    ClosingSigned {
        channel_id: ChannelId,
        to_funder: u64,
        to_fundee: u64,
        signature: Signature,
    },

    /// Channel failed on the sender's side; it force-closed
    Error {
        channel_id: ChannelId,
        message: String,
    },
}

impl PeerMessage {
    /// Channel (or temporary channel) the message belongs to
    pub fn channel_id(&self) -> ChannelId {
        match self {
            PeerMessage::OpenChannel(open) => open.temporary_id,
            PeerMessage::AcceptChannel { temporary_id, .. } => *temporary_id,
            PeerMessage::FundingCreated { temporary_id, .. } => *temporary_id,
            PeerMessage::FundingSigned { channel_id, .. } |
            PeerMessage::UpdateAddHtlc { channel_id, .. } |
            PeerMessage::UpdateFulfillHtlc { channel_id, .. } |
            PeerMessage::UpdateFailHtlc { channel_id, .. } |
            PeerMessage::UpdateFee { channel_id, .. } |
            PeerMessage::CommitmentSigned { channel_id, .. } |
            PeerMessage::RevokeAndAck { channel_id, .. } |
            PeerMessage::Shutdown { channel_id } |
            PeerMessage::ClosingSigned { channel_id, .. } |
            PeerMessage::Error { channel_id, .. } => *channel_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PeerMessage::OpenChannel(_) => "open_channel",
            PeerMessage::AcceptChannel { .. } => "accept_channel",
            PeerMessage::FundingCreated { .. } => "funding_created",
            PeerMessage::FundingSigned { .. } => "funding_signed",
            PeerMessage::UpdateAddHtlc { .. } => "update_add_htlc",
            PeerMessage::UpdateFulfillHtlc { .. } => "update_fulfill_htlc",
            PeerMessage::UpdateFailHtlc { .. } => "update_fail_htlc",
            PeerMessage::UpdateFee { .. } => "update_fee",
            PeerMessage::CommitmentSigned { .. } => "commitment_signed",
            PeerMessage::RevokeAndAck { .. } => "revoke_and_ack",
            PeerMessage::Shutdown { .. } => "shutdown",
            PeerMessage::ClosingSigned { .. } => "closing_signed",
            PeerMessage::Error { .. } => "error",
        }
    }

    /// Wrap a channel update for the peer
    pub fn from_update(channel_id: ChannelId, update: &ChannelUpdate) -> Self {
        match update.clone() {
            ChannelUpdate::AddHtlc { id, amount, payment_hash, cltv_expiry, onion_packet } => {
                PeerMessage::UpdateAddHtlc {
                    channel_id,
                    id,
                    amount,
                    payment_hash,
                    cltv_expiry,
                    onion_packet,
                }
            }
            ChannelUpdate::FulfillHtlc { id, preimage } => {
                PeerMessage::UpdateFulfillHtlc { channel_id, id, preimage }
            }
            ChannelUpdate::FailHtlc { id, reason, failing_channel } => {
                PeerMessage::UpdateFailHtlc { channel_id, id, reason, failing_channel }
            }
            ChannelUpdate::UpdateFee { fee } => PeerMessage::UpdateFee { channel_id, fee },
        }
    }

    /// The channel update carried by an `update_*` message
    pub fn to_update(&self) -> Option<ChannelUpdate> {
        match self.clone() {
            PeerMessage::UpdateAddHtlc { id, amount, payment_hash, cltv_expiry, onion_packet, .. } => {
                Some(ChannelUpdate::AddHtlc { id, amount, payment_hash, cltv_expiry, onion_packet })
            }
            PeerMessage::UpdateFulfillHtlc { id, preimage, .. } => {
                Some(ChannelUpdate::FulfillHtlc { id, preimage })
            }
            PeerMessage::UpdateFailHtlc { id, reason, failing_channel, .. } => {
                Some(ChannelUpdate::FailHtlc { id, reason, failing_channel })
            }
            PeerMessage::UpdateFee { fee, .. } => Some(ChannelUpdate::UpdateFee { fee }),
            _ => None,
        }
    }
}

// =============================================================================
// Onion (plain hop payloads)
// =============================================================================

/// Instructions for one hop
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopPayload {
    /// Channel to forward over; `None` at the final hop
    pub next_channel: Option<ChannelId>,
    /// Amount the next HTLC must carry (at the final hop, the amount due)
    pub amount_to_forward: u64,
    /// Expiry of the next HTLC (at the final hop, the expected expiry)
    pub outgoing_cltv: u32,
}

/// Remaining hops of a route, first entry addressed to the receiver
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Onion {
    pub hops: Vec<HopPayload>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OnionError {
    Malformed(String),
    Empty,
}

impl std::fmt::Display for OnionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OnionError::Malformed(s) => write!(f, "Malformed onion: {}", s),
            OnionError::Empty => write!(f, "Onion has no hops"),
        }
    }
}

impl std::error::Error for OnionError {}

impl Onion {
    pub fn new(hops: Vec<HopPayload>) -> Self {
        Onion { hops }
    }

    pub fn encode(&self) -> Result<Vec<u8>, OnionError> {
        bincode::serialize(self).map_err(|e| OnionError::Malformed(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, OnionError> {
        let onion: Onion = bincode::deserialize(bytes)
            .map_err(|e| OnionError::Malformed(e.to_string()))?;
        if onion.hops.is_empty() {
            return Err(OnionError::Empty);
        }
        Ok(onion)
    }

    /// Split off our payload and the onion for the next hop
    pub fn peel(mut self) -> Result<(HopPayload, Option<Onion>), OnionError> {
        if self.hops.is_empty() {
            return Err(OnionError::Empty);
        }
        let ours = self.hops.remove(0);
        let rest = if self.hops.is_empty() { None } else { Some(self) };
        Ok((ours, rest))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_message_conversion() {
        let channel_id = ChannelId([0x11; 32]);
        let preimage = PaymentPreimage::generate();
        let update = ChannelUpdate::FulfillHtlc { id: HtlcId::new(4), preimage };

        let msg = PeerMessage::from_update(channel_id, &update);
        assert_eq!(msg.name(), "update_fulfill_htlc");
        assert_eq!(msg.channel_id(), channel_id);
        assert_eq!(msg.to_update(), Some(update));

        let shutdown = PeerMessage::Shutdown { channel_id };
        assert_eq!(shutdown.to_update(), None);
    }

    #[test]
    fn test_onion_peel() {
        let next = ChannelId([0x22; 32]);
        let onion = Onion::new(vec![
            HopPayload { next_channel: Some(next), amount_to_forward: 1_000, outgoing_cltv: 140 },
            HopPayload { next_channel: None, amount_to_forward: 1_000, outgoing_cltv: 140 },
        ]);

        let bytes = onion.encode().unwrap();
        let (ours, rest) = Onion::decode(&bytes).unwrap().peel().unwrap();
        assert_eq!(ours.next_channel, Some(next));

        let (last, rest) = rest.unwrap().peel().unwrap();
        assert_eq!(last.next_channel, None);
        assert!(rest.is_none());

        assert!(Onion::decode(&[0xFF, 0x01]).is_err());
        assert_eq!(Onion::decode(&Onion::new(vec![]).encode().unwrap()), Err(OnionError::Empty));
    }
}
