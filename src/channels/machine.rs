// =============================================================================
// ROMER - Channel Machine
// =============================================================================
//
// Drives one channel through the commitment protocol. The machine is a
// single-writer object: the node wraps it in a per-channel async mutex and
// feeds it peer messages, local requests and blocks. Every call returns a
// `MachineOutput` listing what to send and what became final.
//
// Pending slot (at most one commitment transition at a time):
//
//   None ──propose──▶ Proposed ──revoke_and_ack(sig)──▶ None     (we proposed)
//   None ──update───▶ Received ──commitment_signed────▶ AwaitingRevocation
//                                                          │ revoke_and_ack
//                                                          ▼
//                                                         None    (they proposed)
//
// Both sides proposing at once: the funder keeps its proposal and drops the
// fundee's; the fundee rolls its proposal back and queues it again.
//
// Durability rule: the record holding N+1 is written before the secret for N
// leaves the machine. A failed write surfaces as `ChannelError::Persistence`
// and nothing is released.
//
// =============================================================================

use secp256k1::ecdsa::Signature;
use secp256k1::PublicKey;
use serde::{Serialize, Deserialize};
use sha2::{Sha256, Digest};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use super::commitment::{closing_digest, CommitmentSecret, CommitmentTransaction, RevocationStore};
use super::htlc::{Htlc, HtlcId, PaymentHash};
use super::state::{
    Channel, ChannelConfig, ChannelError, ChannelId, ChannelParty, ChannelState, ChannelUpdate,
    CloseType,
};
use crate::keys::{verify_digest, ChannelSigner, KeyError, NodeId, NodeKeys};
use crate::messages::{OpenChannel, PeerMessage};
use crate::store::ChannelStore;

impl From<KeyError> for ChannelError {
    fn from(e: KeyError) -> Self {
        ChannelError::ProtocolError(format!("Key error: {}", e))
    }
}

/// Handle for a locally submitted update
pub type UpdateTag = u64;

// =============================================================================
// Channel Record (persisted)
// =============================================================================

/// Everything the store keeps for one channel
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub channel: Channel,

    /// Latest fully signed commitment
    pub commitment: Option<CommitmentTransaction>,

    /// Index of our channel keys
    pub key_index: u64,

    pub remote_funding_pubkey: Option<PublicKey>,

    /// Counterparty points for commitments not yet revoked
    pub remote_points: BTreeMap<u64, PublicKey>,

    /// Counterparty secrets for revoked commitments
    pub revocations: RevocationStore,
}

// =============================================================================
// Output
// =============================================================================

/// An update both sides hold irrevocably
#[derive(Clone, Debug)]
pub struct CommittedUpdate {
    pub proposer: ChannelParty,
    pub update: ChannelUpdate,
    /// Set when we proposed it
    pub tag: Option<UpdateTag>,
    /// The HTLC added or resolved by the update
    pub htlc: Option<Htlc>,
}

/// Result of feeding the machine one event
#[derive(Debug, Default)]
pub struct MachineOutput {
    /// Messages for the counterparty, in order
    pub messages: Vec<PeerMessage>,
    pub committed: Vec<CommittedUpdate>,
    /// Local updates that could not be applied
    pub rejected: Vec<(UpdateTag, ChannelError)>,
    /// Local proposals that lost a concurrent proposal (re-queued)
    pub rolled_back: Vec<UpdateTag>,
    /// HTLCs dropped by a force-close
    pub timed_out: Vec<Htlc>,
    /// Counterparty broke the protocol; the channel was force-closed
    pub violation: Option<ChannelError>,
    pub funding_complete: bool,
    pub became_active: bool,
    pub force_closed: bool,
    pub closed: Option<CloseType>,
}

impl MachineOutput {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
            && self.committed.is_empty()
            && self.rejected.is_empty()
            && self.rolled_back.is_empty()
            && self.timed_out.is_empty()
            && self.violation.is_none()
            && !self.funding_complete
            && !self.became_active
            && !self.force_closed
            && self.closed.is_none()
    }
}

// =============================================================================
// Pending Transition
// =============================================================================

#[derive(Debug)]
enum Pending {
    /// We proposed N+1 and signed it
    Proposed {
        tag: UpdateTag,
        update: ChannelUpdate,
        snapshot: Box<Channel>,
        commitment: Box<CommitmentTransaction>,
    },
    /// They sent an update; waiting for their signature
    Received {
        update: ChannelUpdate,
        snapshot: Box<Channel>,
    },
    /// We stored N+1 and revoked N; waiting for them to revoke N
    AwaitingRevocation {
        update: ChannelUpdate,
        revoked_number: u64,
    },
}

// =============================================================================
// Channel Machine
// =============================================================================

pub struct ChannelMachine {
    record: ChannelRecord,
    signer: ChannelSigner,
    store: Arc<dyn ChannelStore>,
    pending: Option<Pending>,
    queue: VecDeque<(UpdateTag, ChannelUpdate)>,
    next_tag: UpdateTag,
    /// Dropping a losing remote proposal until its commitment_signed
    ignore_remote: bool,
    closing_sent: bool,
    height: u32,
}

impl ChannelMachine {
    // =========================================================================
    // Construction
    // =========================================================================

    /// Start a channel we fund. Returns the `open_channel` message.
    #[allow(clippy::too_many_arguments)]
    pub fn open_outbound(
        keys: &NodeKeys,
        key_index: u64,
        remote_node: NodeId,
        capacity: u64,
        push_amount: u64,
        config: ChannelConfig,
        store: Arc<dyn ChannelStore>,
        height: u32,
    ) -> Result<(Self, PeerMessage), ChannelError> {
        let channel = Channel::new_outbound(
            keys.node_id(),
            remote_node,
            capacity,
            push_amount,
            config.clone(),
        )?;
        let signer = keys.channel_signer(key_index)?;

        let open = OpenChannel {
            temporary_id: channel.temporary_id,
            capacity,
            push_amount,
            config,
            funding_pubkey: signer.funding_pubkey,
            first_point: signer.commitment_point(0)?,
        };

        log::info!(
            "Opening channel {} to {} ({} sat, push {})",
            channel.temporary_id, remote_node, capacity, push_amount
        );

        let machine = Self::new(Self::empty_record(channel, key_index), signer, store, height);
        Ok((machine, PeerMessage::OpenChannel(open)))
    }

    /// Accept a channel the remote funds. Returns the `accept_channel` message.
    pub fn accept_inbound(
        keys: &NodeKeys,
        key_index: u64,
        remote_node: NodeId,
        open: &OpenChannel,
        store: Arc<dyn ChannelStore>,
        height: u32,
    ) -> Result<(Self, PeerMessage), ChannelError> {
        let channel = Channel::new_inbound(
            open.temporary_id,
            keys.node_id(),
            remote_node,
            open.capacity,
            open.push_amount,
            open.config.clone(),
        )?;
        let signer = keys.channel_signer(key_index)?;

        let mut record = Self::empty_record(channel, key_index);
        record.remote_funding_pubkey = Some(open.funding_pubkey);
        record.remote_points.insert(0, open.first_point);

        let accept = PeerMessage::AcceptChannel {
            temporary_id: open.temporary_id,
            funding_pubkey: signer.funding_pubkey,
            first_point: signer.commitment_point(0)?,
        };

        log::info!(
            "Accepting channel {} from {} ({} sat)",
            open.temporary_id, remote_node, open.capacity
        );

        Ok((Self::new(record, signer, store, height), accept))
    }

    /// Rebuild a machine from its stored record
    pub fn restore(
        record: ChannelRecord,
        keys: &NodeKeys,
        store: Arc<dyn ChannelStore>,
        height: u32,
    ) -> Result<Self, ChannelError> {
        let signer = keys.channel_signer(record.key_index)?;
        Ok(Self::new(record, signer, store, height))
    }

    fn new(
        record: ChannelRecord,
        signer: ChannelSigner,
        store: Arc<dyn ChannelStore>,
        height: u32,
    ) -> Self {
        ChannelMachine {
            record,
            signer,
            store,
            pending: None,
            queue: VecDeque::new(),
            next_tag: 0,
            ignore_remote: false,
            closing_sent: false,
            height,
        }
    }

    fn empty_record(channel: Channel, key_index: u64) -> ChannelRecord {
        ChannelRecord {
            channel,
            commitment: None,
            key_index,
            remote_funding_pubkey: None,
            remote_points: BTreeMap::new(),
            revocations: RevocationStore::new(),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn channel(&self) -> &Channel {
        &self.record.channel
    }

    pub fn channel_id(&self) -> ChannelId {
        self.record.channel.channel_id
    }

    pub fn record(&self) -> &ChannelRecord {
        &self.record
    }

    pub fn remote_node(&self) -> NodeId {
        self.record.channel.remote_node
    }

    /// No commitment transition in progress
    pub fn is_idle(&self) -> bool {
        self.pending.is_none()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    fn is_funder(&self) -> bool {
        self.record.channel.is_funder()
    }

    fn remote_funding_pubkey(&self) -> Result<PublicKey, ChannelError> {
        self.record.remote_funding_pubkey.ok_or_else(|| {
            ChannelError::InvalidState("Remote funding key unknown".to_string())
        })
    }

    fn persist(&self) -> Result<(), ChannelError> {
        self.store
            .persist_channel(&self.record)
            .map_err(|e| ChannelError::Persistence(e.to_string()))
    }

    // =========================================================================
    // Funding
    // =========================================================================

    fn receive_accept(
        &mut self,
        funding_pubkey: PublicKey,
        first_point: PublicKey,
        out: &mut MachineOutput,
    ) -> Result<(), ChannelError> {
        if !self.is_funder() || self.record.remote_funding_pubkey.is_some() {
            return Err(ChannelError::ProtocolError("Unexpected accept_channel".to_string()));
        }

        self.record.remote_funding_pubkey = Some(funding_pubkey);
        self.record.remote_points.insert(0, first_point);

        let funding_txid = self.funding_txid(&funding_pubkey);
        let temporary_id = self.record.channel.temporary_id;
        self.record.channel.set_funding(funding_txid, 0);

        let mut commitment = CommitmentTransaction::build(&self.record.channel, 0);
        let signature = commitment.sign(&self.signer, true);
        self.record.commitment = Some(commitment);

        out.messages.push(PeerMessage::FundingCreated {
            temporary_id,
            funding_txid,
            funding_output_index: 0,
            signature,
        });
        Ok(())
    }

    /// Funding outpoint both sides can derive
    fn funding_txid(&self, remote_funding_pubkey: &PublicKey) -> [u8; 32] {
        let (funder_key, fundee_key) = if self.is_funder() {
            (self.signer.funding_pubkey, *remote_funding_pubkey)
        } else {
            (*remote_funding_pubkey, self.signer.funding_pubkey)
        };

        let mut hasher = Sha256::new();
        hasher.update(self.record.channel.temporary_id.0);
        hasher.update(funder_key.serialize());
        hasher.update(fundee_key.serialize());
        hasher.update(self.record.channel.capacity.to_le_bytes());

        let result = hasher.finalize();
        let mut txid = [0u8; 32];
        txid.copy_from_slice(&result);
        txid
    }

    fn receive_funding_created(
        &mut self,
        funding_txid: [u8; 32],
        funding_output_index: u32,
        signature: Signature,
        out: &mut MachineOutput,
    ) -> Result<(), ChannelError> {
        if self.is_funder() || self.record.commitment.is_some() {
            return Err(ChannelError::ProtocolError("Unexpected funding_created".to_string()));
        }

        let remote_key = self.remote_funding_pubkey()?;
        if funding_txid != self.funding_txid(&remote_key) {
            return Err(ChannelError::FundingError("Funding outpoint mismatch".to_string()));
        }

        self.record.channel.set_funding(funding_txid, funding_output_index);

        let mut commitment = CommitmentTransaction::build(&self.record.channel, 0);
        commitment.verify_signature(&signature, &remote_key)?;
        commitment.add_signature(signature, true);
        let our_sig = commitment.sign(&self.signer, false);
        self.record.commitment = Some(commitment);

        self.persist()?;

        log::info!(
            "Channel {} funded (temporary {})",
            self.channel_id(),
            self.record.channel.temporary_id
        );

        out.messages.push(PeerMessage::FundingSigned {
            channel_id: self.channel_id(),
            signature: our_sig,
        });
        out.funding_complete = true;
        Ok(())
    }

    fn receive_funding_signed(
        &mut self,
        signature: Signature,
        out: &mut MachineOutput,
    ) -> Result<(), ChannelError> {
        let remote_key = self.remote_funding_pubkey()?;
        let commitment = self.record.commitment.as_mut().ok_or_else(|| {
            ChannelError::ProtocolError("Unexpected funding_signed".to_string())
        })?;
        if !self.record.channel.is_funder() || commitment.is_fully_signed() {
            return Err(ChannelError::ProtocolError("Unexpected funding_signed".to_string()));
        }

        commitment.verify_signature(&signature, &remote_key)?;
        commitment.add_signature(signature, false);

        self.persist()?;

        log::info!("Channel {} funded", self.channel_id());
        out.funding_complete = true;
        Ok(())
    }

    fn funding_signed(&self) -> bool {
        self.record
            .commitment
            .as_ref()
            .map(|c| c.is_fully_signed())
            .unwrap_or(false)
    }

    // =========================================================================
    // Local Updates
    // =========================================================================

    /// Propose an update now. Fails with `UpdateInFlight` while another
    /// transition is pending.
    pub fn propose(
        &mut self,
        update: ChannelUpdate,
    ) -> Result<(UpdateTag, MachineOutput), ChannelError> {
        if self.pending.is_some() {
            return Err(ChannelError::UpdateInFlight);
        }

        let tag = self.allocate_tag();
        let mut out = MachineOutput::default();
        self.propose_now(tag, update, &mut out)?;
        Ok((tag, out))
    }

    /// Queue an update; it is proposed as soon as the channel is idle.
    /// Failures show up later in `MachineOutput::rejected`.
    pub fn submit(
        &mut self,
        update: ChannelUpdate,
    ) -> Result<(UpdateTag, MachineOutput), ChannelError> {
        let tag = self.allocate_tag();
        self.queue.push_back((tag, update));

        let mut out = MachineOutput::default();
        self.after_step(&mut out)?;
        Ok((tag, out))
    }

    /// Queue a new outgoing HTLC. The id is assigned at proposal time.
    pub fn offer_htlc(
        &mut self,
        amount: u64,
        payment_hash: PaymentHash,
        cltv_expiry: u32,
        onion_packet: Option<Vec<u8>>,
    ) -> Result<(UpdateTag, MachineOutput), ChannelError> {
        self.submit(ChannelUpdate::AddHtlc {
            id: HtlcId::new(self.record.channel.next_offered_id),
            amount,
            payment_hash,
            cltv_expiry,
            onion_packet,
        })
    }

    fn allocate_tag(&mut self) -> UpdateTag {
        let tag = self.next_tag;
        self.next_tag += 1;
        tag
    }

    fn propose_now(
        &mut self,
        tag: UpdateTag,
        mut update: ChannelUpdate,
        out: &mut MachineOutput,
    ) -> Result<(), ChannelError> {
        if self.closing_sent {
            return Err(ChannelError::InvalidState("Closing signatures sent".to_string()));
        }
        if !self.funding_signed() {
            return Err(ChannelError::InvalidState("Channel not funded".to_string()));
        }

        if let ChannelUpdate::AddHtlc { id, .. } = &mut update {
            *id = HtlcId::new(self.record.channel.next_offered_id);
        }

        let snapshot = self.record.channel.clone();
        if let Err(e) = self.record.channel.apply_update(&update, ChannelParty::Local) {
            self.record.channel = snapshot;
            return Err(e);
        }

        let n = self.record.channel.commitment_number + 1;
        let next_point = self.signer.commitment_point(n)?;
        let mut commitment = CommitmentTransaction::build(&self.record.channel, n);
        let signature = commitment.sign(&self.signer, self.is_funder());

        log::debug!(
            "Channel {}: proposing {} as commitment {}",
            self.channel_id(), update.name(), n
        );

        let channel_id = self.channel_id();
        out.messages.push(PeerMessage::from_update(channel_id, &update));
        out.messages.push(PeerMessage::CommitmentSigned {
            channel_id,
            commitment_number: n,
            signature,
            next_point,
        });

        self.pending = Some(Pending::Proposed {
            tag,
            update,
            snapshot: Box::new(snapshot),
            commitment: Box::new(commitment),
        });
        Ok(())
    }

    /// Propose queued updates while the channel is idle, then see whether a
    /// cooperative close can complete.
    fn after_step(&mut self, out: &mut MachineOutput) -> Result<(), ChannelError> {
        while self.pending.is_none() {
            let Some((tag, update)) = self.queue.pop_front() else {
                break;
            };

            if let Err(e) = self.propose_now(tag, update, out) {
                log::debug!("Channel {}: update {} rejected: {}", self.channel_id(), tag, e);
                out.rejected.push((tag, e));
            }
        }

        self.maybe_send_closing(out)
    }

    // =========================================================================
    // Remote Messages
    // =========================================================================

    /// Feed a message from the counterparty.
    ///
    /// Protocol violations force-close the channel and are reported in the
    /// output; only persistence failures come back as `Err`.
    pub fn handle_message(&mut self, msg: PeerMessage) -> Result<MachineOutput, ChannelError> {
        let mut out = MachineOutput::default();

        let closed = matches!(
            self.record.channel.state,
            ChannelState::ForceClosed { .. } | ChannelState::Closed { .. }
        );
        if closed {
            log::debug!("Channel {}: ignoring {} after close", self.channel_id(), msg.name());
            return Ok(out);
        }

        let result = match msg {
            PeerMessage::AcceptChannel { funding_pubkey, first_point, .. } => {
                self.receive_accept(funding_pubkey, first_point, &mut out)
            }
            PeerMessage::FundingCreated { funding_txid, funding_output_index, signature, .. } => {
                self.receive_funding_created(funding_txid, funding_output_index, signature, &mut out)
            }
            PeerMessage::FundingSigned { signature, .. } => {
                self.receive_funding_signed(signature, &mut out)
            }
            PeerMessage::UpdateAddHtlc { .. } |
            PeerMessage::UpdateFulfillHtlc { .. } |
            PeerMessage::UpdateFailHtlc { .. } |
            PeerMessage::UpdateFee { .. } => match msg.to_update() {
                Some(update) => self.receive_update(update, &mut out),
                None => Ok(()),
            },
            PeerMessage::CommitmentSigned { commitment_number, signature, next_point, .. } => {
                self.receive_commitment_signed(commitment_number, signature, next_point, &mut out)
            }
            PeerMessage::RevokeAndAck { revoked_number, secret, next_point, signature, .. } => {
                self.receive_revoke_and_ack(revoked_number, secret, next_point, signature, &mut out)
            }
            PeerMessage::Shutdown { .. } => self.receive_shutdown(&mut out),
            PeerMessage::ClosingSigned { to_funder, to_fundee, signature, .. } => {
                self.receive_closing_signed(to_funder, to_fundee, signature, &mut out)
            }
            PeerMessage::Error { message, .. } => self.receive_error(message, &mut out),
            PeerMessage::OpenChannel(_) => {
                Err(ChannelError::ProtocolError("Unexpected open_channel".to_string()))
            }
        };

        match result {
            Ok(()) => {}
            Err(ChannelError::Persistence(e)) => return Err(ChannelError::Persistence(e)),
            Err(e) => self.fail_channel(e, &mut out)?,
        }

        let open = !matches!(
            self.record.channel.state,
            ChannelState::ForceClosed { .. } | ChannelState::Closed { .. }
        );
        if open {
            self.after_step(&mut out)?;
        }
        Ok(out)
    }

    fn receive_update(
        &mut self,
        update: ChannelUpdate,
        out: &mut MachineOutput,
    ) -> Result<(), ChannelError> {
        match self.pending.take() {
            Some(Pending::Proposed { tag, update: ours, snapshot, commitment }) => {
                if self.is_funder() {
                    // Our proposal wins; theirs is dropped with its signature
                    log::debug!(
                        "Channel {}: ignoring concurrent {} from fundee",
                        self.channel_id(), update.name()
                    );
                    self.pending = Some(Pending::Proposed { tag, update: ours, snapshot, commitment });
                    self.ignore_remote = true;
                    return Ok(());
                }

                log::debug!(
                    "Channel {}: rolling back {} in favour of funder's {}",
                    self.channel_id(), ours.name(), update.name()
                );
                self.record.channel = *snapshot;
                self.queue.push_front((tag, ours));
                out.rolled_back.push(tag);
            }
            Some(other) => {
                self.pending = Some(other);
                return Err(ChannelError::ProtocolError(
                    format!("{} while a commitment is in flight", update.name())
                ));
            }
            None => {
                if self.closing_sent {
                    self.ignore_remote = true;
                    return Ok(());
                }
            }
        }

        let snapshot = self.record.channel.clone();
        if let Err(e) = self.record.channel.apply_update(&update, ChannelParty::Remote) {
            self.record.channel = snapshot;
            return Err(ChannelError::ProtocolError(
                format!("Invalid {}: {}", update.name(), e)
            ));
        }

        self.pending = Some(Pending::Received {
            update,
            snapshot: Box::new(snapshot),
        });
        Ok(())
    }

    fn receive_commitment_signed(
        &mut self,
        commitment_number: u64,
        signature: Signature,
        next_point: PublicKey,
        out: &mut MachineOutput,
    ) -> Result<(), ChannelError> {
        if self.ignore_remote {
            self.ignore_remote = false;
            return Ok(());
        }

        let (update, snapshot) = match self.pending.take() {
            Some(Pending::Received { update, snapshot }) => (update, snapshot),
            other => {
                self.pending = other;
                return Err(ChannelError::ProtocolError(
                    "commitment_signed without update".to_string()
                ));
            }
        };

        let prepared = self.cosign(commitment_number, &signature);
        let (commitment, our_sig) = match prepared {
            Ok(signed) => signed,
            Err(e) => {
                self.pending = Some(Pending::Received { update, snapshot });
                return Err(e);
            }
        };

        let revoked_number = self.record.channel.commitment_number;
        let mut previous = self.record.clone();
        previous.channel = (*snapshot).clone();

        self.record.channel.commitment_number = commitment_number;
        self.record.commitment = Some(commitment);
        self.record.remote_points.insert(commitment_number, next_point);

        // N+1 must be durable before N is revoked
        if let Err(e) = self.persist() {
            self.record = previous;
            self.pending = Some(Pending::Received { update, snapshot });
            return Err(e);
        }

        out.messages.push(PeerMessage::RevokeAndAck {
            channel_id: self.channel_id(),
            revoked_number,
            secret: self.signer.commitment_secret(revoked_number),
            next_point: self.signer.commitment_point(commitment_number)?,
            signature: Some(our_sig),
        });

        self.pending = Some(Pending::AwaitingRevocation { update, revoked_number });
        Ok(())
    }

    /// Check and countersign the remote's commitment N+1
    fn cosign(
        &self,
        commitment_number: u64,
        signature: &Signature,
    ) -> Result<(CommitmentTransaction, Signature), ChannelError> {
        let expected = self.record.channel.commitment_number + 1;
        if commitment_number != expected {
            return Err(ChannelError::InvalidCommitmentNumber {
                expected,
                got: commitment_number,
            });
        }

        let remote_key = self.remote_funding_pubkey()?;
        let mut commitment = CommitmentTransaction::build(&self.record.channel, commitment_number);
        commitment.verify_signature(signature, &remote_key)?;
        commitment.add_signature(*signature, !self.is_funder());
        let our_sig = commitment.sign(&self.signer, self.is_funder());

        Ok((commitment, our_sig))
    }

    fn receive_revoke_and_ack(
        &mut self,
        revoked_number: u64,
        secret: CommitmentSecret,
        next_point: PublicKey,
        signature: Option<Signature>,
        out: &mut MachineOutput,
    ) -> Result<(), ChannelError> {
        match self.pending.take() {
            Some(Pending::Proposed { tag, update, snapshot, commitment }) => {
                let result = self.complete_proposal(
                    revoked_number, secret, next_point, signature, &commitment,
                );
                match result {
                    Ok(()) => {
                        let htlc = self.htlc_for(&update, ChannelParty::Local);
                        out.messages.push(PeerMessage::RevokeAndAck {
                            channel_id: self.channel_id(),
                            revoked_number,
                            secret: self.signer.commitment_secret(revoked_number),
                            next_point: self.signer.commitment_point(revoked_number + 1)?,
                            signature: None,
                        });
                        out.committed.push(CommittedUpdate {
                            proposer: ChannelParty::Local,
                            update,
                            tag: Some(tag),
                            htlc,
                        });
                        Ok(())
                    }
                    Err(e) => {
                        self.pending = Some(Pending::Proposed { tag, update, snapshot, commitment });
                        Err(e)
                    }
                }
            }
            Some(Pending::AwaitingRevocation { update, revoked_number: expected }) => {
                let result = self.complete_cosign(expected, revoked_number, secret, signature);
                match result {
                    Ok(()) => {
                        let htlc = self.htlc_for(&update, ChannelParty::Remote);
                        out.committed.push(CommittedUpdate {
                            proposer: ChannelParty::Remote,
                            update,
                            tag: None,
                            htlc,
                        });
                        Ok(())
                    }
                    Err(e) => {
                        self.pending = Some(Pending::AwaitingRevocation {
                            update,
                            revoked_number: expected,
                        });
                        Err(e)
                    }
                }
            }
            other => {
                self.pending = other;
                Err(ChannelError::ProtocolError("Unexpected revoke_and_ack".to_string()))
            }
        }
    }

    /// Proposer side: they co-signed N+1 and revoked N
    fn complete_proposal(
        &mut self,
        revoked_number: u64,
        secret: CommitmentSecret,
        next_point: PublicKey,
        signature: Option<Signature>,
        commitment: &CommitmentTransaction,
    ) -> Result<(), ChannelError> {
        let current = self.record.channel.commitment_number;
        if revoked_number != current {
            return Err(ChannelError::InvalidCommitmentNumber {
                expected: current,
                got: revoked_number,
            });
        }

        let signature = signature.ok_or_else(|| {
            ChannelError::ProtocolError("revoke_and_ack without signature".to_string())
        })?;
        let remote_key = self.remote_funding_pubkey()?;
        commitment.verify_signature(&signature, &remote_key)?;

        let point = *self.record.remote_points.get(&current).ok_or_else(|| {
            ChannelError::ProtocolError(format!("No point for commitment {}", current))
        })?;

        let previous = self.record.clone();

        self.record.revocations.insert(current, secret, &point)?;

        let mut signed = commitment.clone();
        signed.add_signature(signature, !self.is_funder());
        let n = current + 1;
        self.record.channel.commitment_number = n;
        self.record.commitment = Some(signed);
        self.record.remote_points.insert(n, next_point);
        self.record.remote_points.retain(|k, _| *k > current);

        if let Err(e) = self.persist() {
            self.record = previous;
            return Err(e);
        }

        log::debug!("Channel {}: commitment {} locked in", self.channel_id(), n);
        Ok(())
    }

    /// Co-signer side: the proposer revoked N
    fn complete_cosign(
        &mut self,
        expected: u64,
        revoked_number: u64,
        secret: CommitmentSecret,
        signature: Option<Signature>,
    ) -> Result<(), ChannelError> {
        if revoked_number != expected {
            return Err(ChannelError::InvalidCommitmentNumber {
                expected,
                got: revoked_number,
            });
        }
        if signature.is_some() {
            return Err(ChannelError::ProtocolError(
                "Unexpected signature in final revoke_and_ack".to_string()
            ));
        }

        let point = *self.record.remote_points.get(&expected).ok_or_else(|| {
            ChannelError::ProtocolError(format!("No point for commitment {}", expected))
        })?;

        let previous = self.record.clone();
        self.record.revocations.insert(expected, secret, &point)?;
        self.record.remote_points.retain(|k, _| *k > expected);

        if let Err(e) = self.persist() {
            self.record = previous;
            return Err(e);
        }

        log::debug!(
            "Channel {}: commitment {} locked in",
            self.channel_id(),
            self.record.channel.commitment_number
        );
        Ok(())
    }

    /// Snapshot of the HTLC an update touched
    fn htlc_for(&self, update: &ChannelUpdate, proposer: ChannelParty) -> Option<Htlc> {
        let htlcs = &self.record.channel.htlcs;
        match update {
            ChannelUpdate::AddHtlc { id, .. } => {
                htlcs.find(proposer.offered_direction(), *id).cloned()
            }
            ChannelUpdate::FulfillHtlc { id, .. } | ChannelUpdate::FailHtlc { id, .. } => {
                htlcs.find(proposer.other().offered_direction(), *id).cloned()
            }
            ChannelUpdate::UpdateFee { .. } => None,
        }
    }

    // =========================================================================
    // Cooperative Close
    // =========================================================================

    /// Start a cooperative close. Pending HTLCs still settle; no new ones
    /// are accepted.
    pub fn shutdown(&mut self) -> Result<MachineOutput, ChannelError> {
        let mut out = MachineOutput::default();

        self.record.channel.initiate_shutdown(ChannelParty::Local)?;
        self.persist()?;

        log::info!("Channel {}: shutdown initiated", self.channel_id());
        out.messages.push(PeerMessage::Shutdown { channel_id: self.channel_id() });

        self.maybe_send_closing(&mut out)?;
        Ok(out)
    }

    fn receive_shutdown(&mut self, out: &mut MachineOutput) -> Result<(), ChannelError> {
        match self.record.channel.state {
            ChannelState::Active => {
                self.record.channel.initiate_shutdown(ChannelParty::Remote)?;
                self.persist()?;
                log::info!("Channel {}: remote requested shutdown", self.channel_id());
                out.messages.push(PeerMessage::Shutdown { channel_id: self.channel_id() });
                Ok(())
            }
            ChannelState::ClosingInitiated { .. } => Ok(()),
            _ => Err(ChannelError::ProtocolError("Shutdown on inactive channel".to_string())),
        }
    }

    /// Final balances in funder/fundee orientation
    fn closing_amounts(&self) -> (u64, u64) {
        let balance = &self.record.channel.balance;
        if self.is_funder() {
            (balance.local, balance.remote)
        } else {
            (balance.remote, balance.local)
        }
    }

    fn maybe_send_closing(&mut self, out: &mut MachineOutput) -> Result<(), ChannelError> {
        let ready = self.is_funder()
            && !self.closing_sent
            && self.pending.is_none()
            && self.queue.is_empty()
            && self.record.channel.can_complete_shutdown();
        if !ready {
            return Ok(());
        }

        let (to_funder, to_fundee) = self.closing_amounts();
        let digest = closing_digest(&self.channel_id(), to_funder, to_fundee);
        let signature = self.signer.sign_digest(&digest);

        self.closing_sent = true;
        out.messages.push(PeerMessage::ClosingSigned {
            channel_id: self.channel_id(),
            to_funder,
            to_fundee,
            signature,
        });
        Ok(())
    }

    fn receive_closing_signed(
        &mut self,
        to_funder: u64,
        to_fundee: u64,
        signature: Signature,
        out: &mut MachineOutput,
    ) -> Result<(), ChannelError> {
        if self.is_funder() && !self.closing_sent {
            return Err(ChannelError::ProtocolError("Unexpected closing_signed".to_string()));
        }

        if !self.is_funder() {
            // The funder only signs when idle; our own proposal loses
            if let Some(Pending::Proposed { tag, update, snapshot, .. }) = self.pending.take() {
                self.record.channel = *snapshot;
                out.rejected.push((tag, ChannelError::InvalidState(
                    format!("{} dropped by cooperative close", update.name())
                )));
            }
        }

        if !self.record.channel.can_complete_shutdown() || self.pending.is_some() {
            return Err(ChannelError::ProtocolError(
                "closing_signed with pending HTLCs".to_string()
            ));
        }

        if (to_funder, to_fundee) != self.closing_amounts() {
            return Err(ChannelError::ProtocolError(
                "closing_signed balances mismatch".to_string()
            ));
        }

        let digest = closing_digest(&self.channel_id(), to_funder, to_fundee);
        if !verify_digest(&digest, &signature, &self.remote_funding_pubkey()?) {
            return Err(ChannelError::InvalidSignature);
        }

        if !self.is_funder() {
            out.messages.push(PeerMessage::ClosingSigned {
                channel_id: self.channel_id(),
                to_funder,
                to_fundee,
                signature: self.signer.sign_digest(&digest),
            });
        }

        self.record.channel.mark_closed(CloseType::Cooperative);
        self.persist()?;
        self.reject_queue(out, "channel closed");

        log::info!("Channel {} closed cooperatively", self.channel_id());
        out.closed = Some(CloseType::Cooperative);
        Ok(())
    }

    // =========================================================================
    // Unilateral Close
    // =========================================================================

    /// Broadcast our latest commitment
    pub fn force_close(&mut self, reason: &str) -> Result<MachineOutput, ChannelError> {
        let mut out = MachineOutput::default();
        log::warn!("Channel {}: force-closing ({})", self.channel_id(), reason);
        self.close_unilaterally(ChannelParty::Local, reason, &mut out)?;
        Ok(out)
    }

    fn close_unilaterally(
        &mut self,
        initiator: ChannelParty,
        reason: &str,
        out: &mut MachineOutput,
    ) -> Result<(), ChannelError> {
        self.abandon_pending(out);

        let timed_out = self.record.channel.force_close(self.height, initiator)?;
        self.persist()?;

        for htlc in &timed_out {
            log::warn!(
                "Channel {}: {} ({} sat) timed out",
                self.channel_id(), htlc.id, htlc.amount
            );
        }
        out.timed_out.extend(timed_out);
        out.force_closed = true;
        self.reject_queue(out, "channel force-closed");

        if initiator == ChannelParty::Local {
            out.messages.push(PeerMessage::Error {
                channel_id: self.channel_id(),
                message: reason.to_string(),
            });
        }
        Ok(())
    }

    /// Drop the in-flight transition before a unilateral close
    fn abandon_pending(&mut self, out: &mut MachineOutput) {
        match self.pending.take() {
            Some(Pending::Proposed { tag, update, snapshot, .. }) => {
                self.record.channel = *snapshot;
                out.rejected.push((tag, ChannelError::InvalidState(
                    format!("{} abandoned by force-close", update.name())
                )));
            }
            Some(Pending::Received { snapshot, .. }) => {
                self.record.channel = *snapshot;
            }
            Some(Pending::AwaitingRevocation { update, .. }) => {
                // Already in our signed commitment
                let htlc = self.htlc_for(&update, ChannelParty::Remote);
                out.committed.push(CommittedUpdate {
                    proposer: ChannelParty::Remote,
                    update,
                    tag: None,
                    htlc,
                });
            }
            None => {}
        }
        self.ignore_remote = false;
    }

    fn reject_queue(&mut self, out: &mut MachineOutput, reason: &str) {
        for (tag, _) in self.queue.drain(..) {
            out.rejected.push((tag, ChannelError::InvalidState(reason.to_string())));
        }
    }

    fn fail_channel(
        &mut self,
        error: ChannelError,
        out: &mut MachineOutput,
    ) -> Result<(), ChannelError> {
        log::warn!("Channel {}: protocol violation: {}", self.channel_id(), error);
        let reason = error.to_string();
        out.violation = Some(error);

        let open = !matches!(
            self.record.channel.state,
            ChannelState::ForceClosed { .. } | ChannelState::Closed { .. }
        );
        if open {
            self.close_unilaterally(ChannelParty::Local, &reason, out)?;
        }
        Ok(())
    }

    fn receive_error(&mut self, message: String, out: &mut MachineOutput) -> Result<(), ChannelError> {
        log::warn!("Channel {}: remote force-closed: {}", self.channel_id(), message);
        self.close_unilaterally(ChannelParty::Remote, &message, out)
    }

    // =========================================================================
    // Chain Events
    // =========================================================================

    /// Process a new block height
    pub fn on_block(&mut self, height: u32) -> Result<MachineOutput, ChannelError> {
        self.height = height;
        let mut out = MachineOutput::default();

        match self.record.channel.state.clone() {
            ChannelState::Opening { .. } => {
                if self.funding_signed() {
                    if self.record.channel.confirm_funding(height)? {
                        log::info!("Channel {} is now active", self.channel_id());
                        out.became_active = true;
                    }
                    self.persist()?;
                }
            }
            ChannelState::Active | ChannelState::ClosingInitiated { .. } => {
                let expired = self.record.channel.expired_htlcs(height);
                if let Some(htlc) = expired.first() {
                    let reason = format!("{} expired at height {}", htlc.id, htlc.cltv_expiry);
                    log::warn!("Channel {}: {}", self.channel_id(), reason);
                    self.close_unilaterally(ChannelParty::Local, &reason, &mut out)?;
                }
            }
            ChannelState::ForceClosed { initiator, .. } => {
                let matured = self.record.channel
                    .force_close_maturity()
                    .map(|h| height >= h)
                    .unwrap_or(false);
                if matured {
                    let close_type = match initiator {
                        ChannelParty::Local => CloseType::LocalForceClose,
                        ChannelParty::Remote => CloseType::RemoteForceClose,
                    };
                    self.record.channel.mark_closed(close_type.clone());
                    self.persist()?;
                    log::info!("Channel {} settled after force-close", self.channel_id());
                    out.closed = Some(close_type);
                }
            }
            ChannelState::Closed { .. } => {}
        }

        Ok(out)
    }

    /// Has the counterparty revoked this commitment?
    pub fn is_revoked(&self, commitment_number: u64) -> bool {
        self.record.revocations.is_revoked(commitment_number)
    }

    /// The counterparty broadcast a commitment
    pub fn on_remote_broadcast(
        &mut self,
        commitment_number: u64,
    ) -> Result<MachineOutput, ChannelError> {
        let mut out = MachineOutput::default();

        if self.is_revoked(commitment_number) {
            log::warn!(
                "Channel {}: revoked commitment {} broadcast, claiming all funds",
                self.channel_id(), commitment_number
            );
            self.abandon_pending(&mut out);
            let channel = &mut self.record.channel;
            channel.state = ChannelState::Closed {
                close_type: CloseType::Breach,
                final_balance_local: channel.capacity - channel.balance.fee,
                final_balance_remote: 0,
            };
            self.persist()?;
            self.reject_queue(&mut out, "channel breached");
            out.closed = Some(CloseType::Breach);
            return Ok(out);
        }

        if commitment_number > self.record.channel.commitment_number {
            return Err(ChannelError::InvalidCommitmentNumber {
                expected: self.record.channel.commitment_number,
                got: commitment_number,
            });
        }

        self.close_unilaterally(ChannelParty::Remote, "remote commitment broadcast", &mut out)?;
        Ok(out)
    }
}

impl std::fmt::Debug for ChannelMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelMachine")
            .field("channel_id", &self.channel_id())
            .field("state", &self.record.channel.state)
            .field("commitment_number", &self.record.channel.commitment_number)
            .field("pending", &self.pending.is_some())
            .field("queued", &self.queue.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::htlc::{HtlcDirection, HtlcFailReason, HtlcState, PaymentPreimage};
    use crate::store::MemoryStore;

    struct Pair {
        a: ChannelMachine,
        b: ChannelMachine,
        store_a: Arc<MemoryStore>,
        store_b: Arc<MemoryStore>,
    }

    /// Deliver messages back and forth until both sides are quiet
    fn deliver(pair: &mut Pair, from_a: Vec<PeerMessage>) -> (Vec<MachineOutput>, Vec<MachineOutput>) {
        let mut to_b: VecDeque<PeerMessage> = from_a.into();
        let mut to_a: VecDeque<PeerMessage> = VecDeque::new();
        let mut outs_a = Vec::new();
        let mut outs_b = Vec::new();

        while !to_a.is_empty() || !to_b.is_empty() {
            if let Some(msg) = to_b.pop_front() {
                let out = pair.b.handle_message(msg).unwrap();
                to_a.extend(out.messages.iter().cloned());
                outs_b.push(out);
            }
            if let Some(msg) = to_a.pop_front() {
                let out = pair.a.handle_message(msg).unwrap();
                to_b.extend(out.messages.iter().cloned());
                outs_a.push(out);
            }
        }
        (outs_a, outs_b)
    }

    fn open_pair(capacity: u64, push: u64) -> Pair {
        let keys_a = NodeKeys::generate();
        let keys_b = NodeKeys::generate();
        let store_a = Arc::new(MemoryStore::new());
        let store_b = Arc::new(MemoryStore::new());

        let (a, open) = ChannelMachine::open_outbound(
            &keys_a, 0, keys_b.node_id(), capacity, push,
            ChannelConfig::default(), store_a.clone(), 100,
        ).unwrap();
        let PeerMessage::OpenChannel(open) = open else { panic!("expected open_channel") };
        let (b, accept) = ChannelMachine::accept_inbound(
            &keys_b, 0, keys_a.node_id(), &open, store_b.clone(), 100,
        ).unwrap();

        let mut pair = Pair { a, b, store_a, store_b };
        let out = pair.a.handle_message(accept).unwrap();
        let (outs_a, outs_b) = deliver(&mut pair, out.messages);
        assert!(outs_b.iter().any(|o| o.funding_complete));
        assert!(outs_a.iter().any(|o| o.funding_complete));
        assert_eq!(pair.a.channel_id(), pair.b.channel_id());

        for h in 101..104 {
            pair.a.on_block(h).unwrap();
            pair.b.on_block(h).unwrap();
        }
        assert!(pair.a.channel().state.is_active());
        assert!(pair.b.channel().state.is_active());
        pair
    }

    fn add_update(amount: u64, preimage: &PaymentPreimage) -> ChannelUpdate {
        ChannelUpdate::AddHtlc {
            id: HtlcId::new(0),
            amount,
            payment_hash: preimage.payment_hash(),
            cltv_expiry: 500,
            onion_packet: None,
        }
    }

    #[test]
    fn test_add_and_fulfill_roundtrip() {
        let mut pair = open_pair(100_000, 40_000);
        let preimage = PaymentPreimage::generate();

        let (tag, out) = pair.a.propose(add_update(5_000, &preimage)).unwrap();
        let (outs_a, outs_b) = deliver(&mut pair, out.messages);

        let committed = outs_a.iter().flat_map(|o| o.committed.iter()).next().unwrap();
        assert_eq!(committed.tag, Some(tag));
        assert!(outs_b.iter().any(|o| !o.committed.is_empty()));

        assert_eq!(pair.a.channel().balance.local, 55_000);
        assert_eq!(pair.a.channel().balance.remote, 40_000);
        assert_eq!(pair.a.channel().balance.pending_offered, 5_000);
        assert_eq!(pair.b.channel().balance.pending_received, 5_000);
        assert_eq!(pair.a.channel().commitment_number, 1);
        assert_eq!(pair.b.channel().commitment_number, 1);
        assert!(pair.a.is_revoked(0));
        assert!(pair.b.is_revoked(0));

        let fulfill = ChannelUpdate::FulfillHtlc { id: HtlcId::new(0), preimage };
        let (_, out) = pair.b.propose(fulfill).unwrap();
        let mut swapped = Pair { a: pair.b, b: pair.a, store_a: pair.store_b, store_b: pair.store_a };
        deliver(&mut swapped, out.messages);

        let (b, a) = (swapped.a, swapped.b);
        assert_eq!(a.channel().balance.local, 55_000);
        assert_eq!(a.channel().balance.remote, 45_000);
        assert_eq!(a.channel().balance.pending_offered, 0);
        assert_eq!(b.channel().balance.local, 45_000);
        a.channel().check_invariant().unwrap();
        b.channel().check_invariant().unwrap();
        assert_eq!(a.channel().commitment_number, 2);

        // Stored record matches the committed state
        let stored = swapped.store_b.get_channel(&a.channel_id()).unwrap().unwrap();
        assert_eq!(stored.channel.commitment_number, 2);
        assert!(stored.commitment.unwrap().is_fully_signed());
    }

    #[test]
    fn test_second_proposal_rejected() {
        let mut pair = open_pair(100_000, 40_000);
        let preimage = PaymentPreimage::generate();

        pair.a.propose(add_update(1_000, &preimage)).unwrap();
        let result = pair.a.propose(add_update(1_000, &preimage));
        assert!(matches!(result, Err(ChannelError::UpdateInFlight)));
    }

    #[test]
    fn test_queued_updates_run_in_order() {
        let mut pair = open_pair(100_000, 40_000);
        let p1 = PaymentPreimage::generate();
        let p2 = PaymentPreimage::generate();

        let (_, out1) = pair.a.offer_htlc(1_000, p1.payment_hash(), 500, None).unwrap();
        let (tag2, out2) = pair.a.offer_htlc(2_000, p2.payment_hash(), 500, None).unwrap();
        assert!(out2.messages.is_empty());
        assert_eq!(pair.a.queued(), 1);

        let (outs_a, _) = deliver(&mut pair, out1.messages);
        let second = outs_a
            .iter()
            .flat_map(|o| o.committed.iter())
            .find(|c| c.tag == Some(tag2))
            .unwrap();
        assert_eq!(second.htlc.as_ref().unwrap().id, HtlcId::new(1));
        assert_eq!(pair.b.channel().balance.pending_received, 3_000);
    }

    #[test]
    fn test_concurrent_proposals_funder_wins() {
        let mut pair = open_pair(100_000, 40_000);
        let pa = PaymentPreimage::generate();
        let pb = PaymentPreimage::generate();

        let (tag_a, out_a) = pair.a.propose(add_update(3_000, &pa)).unwrap();
        let (tag_b, out_b) = pair.b.propose(add_update(2_000, &pb)).unwrap();

        // Cross-deliver both proposals before any reply
        let mut replies_from_a = Vec::new();
        for msg in out_b.messages {
            let out = pair.a.handle_message(msg).unwrap();
            assert!(out.violation.is_none());
            replies_from_a.extend(out.messages);
        }
        let mut replies_from_b = Vec::new();
        let mut rolled_back = Vec::new();
        for msg in out_a.messages {
            let out = pair.b.handle_message(msg).unwrap();
            assert!(out.violation.is_none());
            rolled_back.extend(out.rolled_back);
            replies_from_b.extend(out.messages);
        }
        assert_eq!(rolled_back, vec![tag_b]);
        assert!(replies_from_a.is_empty());

        // A completes, then B re-proposes automatically
        let mut swapped = Pair { a: pair.b, b: pair.a, store_a: pair.store_b, store_b: pair.store_a };
        let (outs_b, outs_a) = deliver(&mut swapped, replies_from_b);

        assert!(outs_a.iter().flat_map(|o| o.committed.iter()).any(|c| c.tag == Some(tag_a)));
        assert!(outs_b.iter().flat_map(|o| o.committed.iter()).any(|c| c.tag == Some(tag_b)));

        let (b, a) = (swapped.a, swapped.b);
        assert_eq!(a.channel().balance.pending_offered, 3_000);
        assert_eq!(a.channel().balance.pending_received, 2_000);
        assert_eq!(b.channel().balance.pending_offered, 2_000);
        assert_eq!(a.channel().commitment_number, 2);
        assert_eq!(b.channel().commitment_number, 2);
        a.channel().check_invariant().unwrap();
        b.channel().check_invariant().unwrap();
    }

    #[test]
    fn test_bad_signature_force_closes() {
        let mut pair = open_pair(100_000, 40_000);
        let preimage = PaymentPreimage::generate();

        let (_, out) = pair.a.propose(add_update(5_000, &preimage)).unwrap();
        let mut messages = out.messages;
        if let PeerMessage::CommitmentSigned { commitment_number, .. } = &mut messages[1] {
            *commitment_number = 7;
        }

        pair.b.handle_message(messages.remove(0)).unwrap();
        let out = pair.b.handle_message(messages.remove(0)).unwrap();
        assert!(matches!(
            out.violation,
            Some(ChannelError::InvalidCommitmentNumber { expected: 1, got: 7 })
        ));
        assert!(out.force_closed);
        assert!(out.messages.iter().all(|m| !matches!(m, PeerMessage::RevokeAndAck { .. })));
        assert!(matches!(pair.b.channel().state, ChannelState::ForceClosed { .. }));

        // Remote learns about it through the error message
        let err = out.messages.into_iter().find(|m| matches!(m, PeerMessage::Error { .. })).unwrap();
        let out = pair.a.handle_message(err).unwrap();
        assert!(out.force_closed);
        assert_eq!(out.rejected.len(), 1);
        assert_eq!(pair.a.channel().balance.local, 60_000);
    }

    #[test]
    fn test_no_revocation_before_persist() {
        let mut pair = open_pair(100_000, 40_000);
        let preimage = PaymentPreimage::generate();

        let (_, out) = pair.a.propose(add_update(5_000, &preimage)).unwrap();
        pair.store_b.set_fail_writes(true);

        let mut messages = out.messages.into_iter();
        pair.b.handle_message(messages.next().unwrap()).unwrap();
        let result = pair.b.handle_message(messages.next().unwrap());
        assert!(matches!(result, Err(ChannelError::Persistence(_))));

        // Nothing revoked, still at commitment 0
        assert_eq!(pair.b.channel().commitment_number, 0);
        let stored = pair.store_b.get_channel(&pair.b.channel_id()).unwrap().unwrap();
        assert_eq!(stored.channel.commitment_number, 0);
        assert!(!pair.a.is_revoked(0));
    }

    #[test]
    fn test_proposer_keeps_secret_until_persisted() {
        let mut pair = open_pair(100_000, 40_000);
        let preimage = PaymentPreimage::generate();

        let (_, out) = pair.a.propose(add_update(5_000, &preimage)).unwrap();
        let mut replies = Vec::new();
        for msg in out.messages {
            replies.extend(pair.b.handle_message(msg).unwrap().messages);
        }
        let revoke = replies
            .into_iter()
            .find(|m| matches!(m, PeerMessage::RevokeAndAck { .. }))
            .unwrap();

        pair.store_a.set_fail_writes(true);
        let result = pair.a.handle_message(revoke.clone());
        assert!(matches!(result, Err(ChannelError::Persistence(_))));

        // Still at commitment 0, nothing of ours released
        assert_eq!(pair.a.channel().commitment_number, 0);
        assert!(!pair.a.is_revoked(0));
        let stored = pair.store_a.get_channel(&pair.a.channel_id()).unwrap().unwrap();
        assert_eq!(stored.channel.commitment_number, 0);
        assert!(!pair.b.is_revoked(0));

        // Same message goes through once writes work again
        pair.store_a.set_fail_writes(false);
        let out = pair.a.handle_message(revoke).unwrap();
        assert_eq!(pair.a.channel().commitment_number, 1);
        let own = out
            .messages
            .into_iter()
            .find(|m| matches!(m, PeerMessage::RevokeAndAck { .. }))
            .unwrap();
        pair.b.handle_message(own).unwrap();
        assert!(pair.b.is_revoked(0));
    }

    #[test]
    fn test_repeated_block_does_not_activate_early() {
        let keys_a = NodeKeys::generate();
        let keys_b = NodeKeys::generate();
        let (mut a, open) = ChannelMachine::open_outbound(
            &keys_a, 0, keys_b.node_id(), 100_000, 0,
            ChannelConfig::default(), Arc::new(MemoryStore::new()), 100,
        ).unwrap();
        let PeerMessage::OpenChannel(open) = open else { panic!("expected open_channel") };
        let (mut b, accept) = ChannelMachine::accept_inbound(
            &keys_b, 0, keys_a.node_id(), &open, Arc::new(MemoryStore::new()), 100,
        ).unwrap();

        let created = a.handle_message(accept).unwrap().messages.remove(0);
        let signed = b.handle_message(created).unwrap().messages.remove(0);
        a.handle_message(signed).unwrap();

        for height in [101, 101, 102, 102] {
            assert!(!a.on_block(height).unwrap().became_active);
        }
        assert!(a.on_block(103).unwrap().became_active);
    }

    #[test]
    fn test_expired_htlc_force_closes() {
        let mut pair = open_pair(100_000, 40_000);
        let preimage = PaymentPreimage::generate();

        let (_, out) = pair.a.propose(add_update(5_000, &preimage)).unwrap();
        deliver(&mut pair, out.messages);

        let out = pair.a.on_block(499).unwrap();
        assert!(out.is_empty());

        let out = pair.a.on_block(500).unwrap();
        assert!(out.force_closed);
        assert_eq!(out.timed_out.len(), 1);
        let htlc = pair.a.channel().htlcs.find(HtlcDirection::Offered, HtlcId::new(0)).unwrap();
        assert_eq!(htlc.state, HtlcState::TimedOut);

        // Settles after to_self_delay
        let delay = pair.a.channel().config.to_self_delay;
        assert!(pair.a.on_block(500 + delay - 1).unwrap().closed.is_none());
        assert_eq!(pair.a.on_block(500 + delay).unwrap().closed, Some(CloseType::LocalForceClose));
    }

    #[test]
    fn test_cooperative_close_waits_for_htlcs() {
        let mut pair = open_pair(100_000, 40_000);
        let preimage = PaymentPreimage::generate();

        let (_, out) = pair.a.propose(add_update(5_000, &preimage)).unwrap();
        deliver(&mut pair, out.messages);

        let out = pair.a.shutdown().unwrap();
        let (outs_a, _) = deliver(&mut pair, out.messages);
        assert!(outs_a.iter().all(|o| o.closed.is_none()));
        assert!(matches!(pair.b.channel().state, ChannelState::ClosingInitiated { .. }));

        // Fail the HTLC back; closing follows automatically
        let fail = ChannelUpdate::FailHtlc {
            id: HtlcId::new(0),
            reason: HtlcFailReason::TemporaryFailure,
            failing_channel: None,
        };
        let (_, out) = pair.b.propose(fail).unwrap();
        let mut swapped = Pair { a: pair.b, b: pair.a, store_a: pair.store_b, store_b: pair.store_a };
        deliver(&mut swapped, out.messages);

        assert!(matches!(
            swapped.a.channel().state,
            ChannelState::Closed { close_type: CloseType::Cooperative, final_balance_local: 40_000, .. }
        ));
        assert!(matches!(
            swapped.b.channel().state,
            ChannelState::Closed { close_type: CloseType::Cooperative, final_balance_local: 60_000, .. }
        ));
    }

    #[test]
    fn test_breach_detection() {
        let mut pair = open_pair(100_000, 40_000);
        let preimage = PaymentPreimage::generate();

        let (_, out) = pair.a.propose(add_update(5_000, &preimage)).unwrap();
        deliver(&mut pair, out.messages);

        assert!(pair.a.is_revoked(0));
        assert!(!pair.a.is_revoked(1));

        let out = pair.a.on_remote_broadcast(0).unwrap();
        assert_eq!(out.closed, Some(CloseType::Breach));
        assert!(matches!(
            pair.a.channel().state,
            ChannelState::Closed { final_balance_local: 100_000, .. }
        ));
    }
}
