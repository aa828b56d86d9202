// =============================================================================
// ROMER - Commitment Transactions
// =============================================================================
//
// A commitment is a snapshot of the channel's balances at one commitment
// number, co-signed by both funding keys. Both parties build exactly the same
// commitment (funder / fundee orientation) so one digest covers it.
//
// Structure:
// ┌─────────────────────────────────────────────────────────────────────────┐
// │                     COMMITMENT TRANSACTION #N                           │
// ├─────────────────────────────────────────────────────────────────────────┤
// │  Outputs:                                                               │
// │    1. To funder   (balance minus commitment fee)                        │
// │    2. To fundee                                                         │
// │    3+ HTLC outputs, sorted by (offerer, id)                             │
// │                                                                         │
// │  Signatures: funder funding key, fundee funding key                     │
// └─────────────────────────────────────────────────────────────────────────┘
//
// Revocation:
//
//   secret(N) = SHA256(commitment_seed || N || "commitment_secret")
//   point(N)  = secret(N) · G
//
// point(N+1) is published when N+1 is proposed; releasing secret(N) proves
// commitment N is dead. Whoever holds secret(N) can punish a broadcast of N.
//
// =============================================================================

use secp256k1::ecdsa::Signature;
use secp256k1::PublicKey;
use serde::{Serialize, Deserialize};
use sha2::{Sha256, Digest};
use std::collections::BTreeMap;

use super::htlc::{HtlcDirection, PaymentHash};
use super::state::{Channel, ChannelError, ChannelId};
use crate::keys::{point_from_secret, verify_digest, ChannelSigner, KeyError};

// =============================================================================
// Commitment Secret
// =============================================================================

/// Per-commitment secret (32 bytes)
/// Each commitment has a secret that, when revealed, revokes it
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitmentSecret(pub [u8; 32]);

impl CommitmentSecret {
    /// Generate from seed and commitment number
    pub fn derive(seed: &[u8; 32], commitment_number: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(seed);
        hasher.update(commitment_number.to_le_bytes());
        hasher.update(b"commitment_secret");

        let result = hasher.finalize();
        let mut secret = [0u8; 32];
        secret.copy_from_slice(&result);
        CommitmentSecret(secret)
    }

    /// Per-commitment point for this secret
    pub fn to_point(&self) -> Result<PublicKey, KeyError> {
        point_from_secret(&self.0)
    }

    /// Verify this is the correct secret for a commitment point
    pub fn verify(&self, commitment_point: &PublicKey) -> bool {
        match self.to_point() {
            Ok(point) => point == *commitment_point,
            Err(_) => false,
        }
    }
}

impl std::fmt::Debug for CommitmentSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CommitmentSecret({}..)", hex::encode(&self.0[..4]))
    }
}

// =============================================================================
// Commitment Transaction
// =============================================================================

/// HTLC output in a commitment
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtlcOutput {
    /// Offered by the funder (otherwise by the fundee)
    pub offered_by_funder: bool,
    pub htlc_id: u64,
    pub amount: u64,
    pub payment_hash: PaymentHash,
    pub cltv_expiry: u32,
}

/// A commitment transaction
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitmentTransaction {
    pub channel_id: ChannelId,

    pub commitment_number: u64,

    pub to_funder: u64,
    pub to_fundee: u64,

    /// Fee for this commitment (paid by the funder)
    pub fee: u64,

    pub htlc_outputs: Vec<HtlcOutput>,

    pub funder_signature: Option<Signature>,
    pub fundee_signature: Option<Signature>,
}

impl CommitmentTransaction {
    /// Build the commitment for the channel's current balances
    pub fn build(channel: &Channel, commitment_number: u64) -> Self {
        let (to_funder, to_fundee) = if channel.is_funder() {
            (channel.balance.local, channel.balance.remote)
        } else {
            (channel.balance.remote, channel.balance.local)
        };

        let mut htlc_outputs: Vec<HtlcOutput> = channel.htlcs
            .pending()
            .map(|h| {
                let offered_locally = h.direction == HtlcDirection::Offered;
                HtlcOutput {
                    offered_by_funder: offered_locally == channel.is_funder(),
                    htlc_id: h.id.0,
                    amount: h.amount,
                    payment_hash: h.payment_hash,
                    cltv_expiry: h.cltv_expiry,
                }
            })
            .collect();
        htlc_outputs.sort_by_key(|o| (!o.offered_by_funder, o.htlc_id));

        CommitmentTransaction {
            channel_id: channel.channel_id,
            commitment_number,
            to_funder,
            to_fundee,
            fee: channel.balance.fee,
            htlc_outputs,
            funder_signature: None,
            fundee_signature: None,
        }
    }

    /// Digest both parties sign (signatures excluded)
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"commitment");
        hasher.update(self.channel_id.0);
        hasher.update(self.commitment_number.to_le_bytes());
        hasher.update(self.to_funder.to_le_bytes());
        hasher.update(self.to_fundee.to_le_bytes());
        hasher.update(self.fee.to_le_bytes());

        for output in &self.htlc_outputs {
            hasher.update([output.offered_by_funder as u8]);
            hasher.update(output.htlc_id.to_le_bytes());
            hasher.update(output.amount.to_le_bytes());
            hasher.update(output.payment_hash.0);
            hasher.update(output.cltv_expiry.to_le_bytes());
        }

        let result = hasher.finalize();
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&result);
        digest
    }

    /// Sign as the given local role
    pub fn sign(&mut self, signer: &ChannelSigner, as_funder: bool) -> Signature {
        let sig = signer.sign_digest(&self.digest());
        self.add_signature(sig, as_funder);
        sig
    }

    pub fn add_signature(&mut self, signature: Signature, from_funder: bool) {
        if from_funder {
            self.funder_signature = Some(signature);
        } else {
            self.fundee_signature = Some(signature);
        }
    }

    /// Verify a signature from one side against its funding key
    pub fn verify_signature(
        &self,
        signature: &Signature,
        pubkey: &PublicKey,
    ) -> Result<(), ChannelError> {
        if verify_digest(&self.digest(), signature, pubkey) {
            Ok(())
        } else {
            Err(ChannelError::InvalidSignature)
        }
    }

    /// Is fully signed?
    pub fn is_fully_signed(&self) -> bool {
        self.funder_signature.is_some() && self.fundee_signature.is_some()
    }

    /// Total output value
    pub fn total_output_value(&self) -> u64 {
        self.to_funder
            + self.to_fundee
            + self.htlc_outputs.iter().map(|o| o.amount).sum::<u64>()
    }
}

/// Digest of a cooperative close paying the final balances
pub fn closing_digest(channel_id: &ChannelId, to_funder: u64, to_fundee: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"closing");
    hasher.update(channel_id.0);
    hasher.update(to_funder.to_le_bytes());
    hasher.update(to_fundee.to_le_bytes());

    let result = hasher.finalize();
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&result);
    digest
}

// =============================================================================
// Revocation Store
// =============================================================================

/// Secrets the counterparty released for its revoked commitments
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RevocationStore {
    secrets: BTreeMap<u64, CommitmentSecret>,
}

impl RevocationStore {
    pub fn new() -> Self {
        RevocationStore::default()
    }

    /// Store a released secret after checking it against its point
    pub fn insert(
        &mut self,
        commitment_number: u64,
        secret: CommitmentSecret,
        expected_point: &PublicKey,
    ) -> Result<(), ChannelError> {
        if !secret.verify(expected_point) {
            return Err(ChannelError::InvalidRevocation);
        }
        self.secrets.insert(commitment_number, secret);
        Ok(())
    }

    /// Has the counterparty revoked this commitment?
    pub fn is_revoked(&self, commitment_number: u64) -> bool {
        self.secrets.contains_key(&commitment_number)
    }

    pub fn get(&self, commitment_number: u64) -> Option<&CommitmentSecret> {
        self.secrets.get(&commitment_number)
    }

    /// Highest revoked commitment number
    pub fn latest(&self) -> Option<u64> {
        self.secrets.keys().next_back().copied()
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::htlc::{HtlcId, PaymentPreimage};
    use crate::channels::state::{ChannelConfig, ChannelParty, ChannelUpdate};
    use crate::keys::NodeKeys;

    fn channel_pair() -> (Channel, Channel) {
        let a = NodeKeys::generate().node_id();
        let b = NodeKeys::generate().node_id();

        let mut funder = Channel::new_outbound(a, b, 100_000, 40_000, ChannelConfig::default()).unwrap();
        let mut fundee = Channel::new_inbound(
            funder.temporary_id, b, a, 100_000, 40_000, ChannelConfig::default(),
        ).unwrap();

        for channel in [&mut funder, &mut fundee] {
            channel.set_funding([0xCD; 32], 0);
            for height in 1..=3 {
                channel.confirm_funding(height).unwrap();
            }
        }
        (funder, fundee)
    }

    #[test]
    fn test_commitment_secret() {
        let seed = [0x42; 32];
        let secret1 = CommitmentSecret::derive(&seed, 0);
        let secret2 = CommitmentSecret::derive(&seed, 1);

        // Different commitment numbers = different secrets
        assert_ne!(secret1, secret2);

        // Same inputs = same secret
        assert_eq!(secret1, CommitmentSecret::derive(&seed, 0));

        let point = secret1.to_point().unwrap();
        assert!(secret1.verify(&point));
        assert!(!secret2.verify(&point));
    }

    #[test]
    fn test_both_sides_build_same_commitment() {
        let (mut funder, mut fundee) = channel_pair();
        let preimage = PaymentPreimage::generate();
        let update = ChannelUpdate::AddHtlc {
            id: HtlcId::new(0),
            amount: 5_000,
            payment_hash: preimage.payment_hash(),
            cltv_expiry: 500,
            onion_packet: None,
        };

        funder.apply_update(&update, ChannelParty::Local).unwrap();
        fundee.apply_update(&update, ChannelParty::Remote).unwrap();

        let c1 = CommitmentTransaction::build(&funder, 1);
        let c2 = CommitmentTransaction::build(&fundee, 1);
        assert_eq!(c1.digest(), c2.digest());
        assert_eq!(c1.to_funder, 55_000);
        assert_eq!(c1.to_fundee, 40_000);
        assert_eq!(c1.total_output_value() + c1.fee, 100_000);

        // Different number, different digest
        assert_ne!(c1.digest(), CommitmentTransaction::build(&funder, 2).digest());
    }

    #[test]
    fn test_commitment_signatures() {
        let (funder, _) = channel_pair();
        let keys = NodeKeys::generate();
        let signer = keys.channel_signer(0).unwrap();
        let other = keys.channel_signer(1).unwrap();

        let mut commitment = CommitmentTransaction::build(&funder, 0);
        let sig = commitment.sign(&signer, true);
        assert!(!commitment.is_fully_signed());

        commitment.verify_signature(&sig, &signer.funding_pubkey).unwrap();
        assert_eq!(
            commitment.verify_signature(&sig, &other.funding_pubkey),
            Err(ChannelError::InvalidSignature)
        );

        let sig2 = commitment.sign(&other, false);
        commitment.verify_signature(&sig2, &other.funding_pubkey).unwrap();
        assert!(commitment.is_fully_signed());
    }

    #[test]
    fn test_revocation_store() {
        let seed = [0x07; 32];
        let mut store = RevocationStore::new();

        let secret0 = CommitmentSecret::derive(&seed, 0);
        let point0 = secret0.to_point().unwrap();
        let point1 = CommitmentSecret::derive(&seed, 1).to_point().unwrap();

        // Wrong point is rejected
        assert_eq!(store.insert(0, secret0, &point1), Err(ChannelError::InvalidRevocation));
        assert!(store.is_empty());

        store.insert(0, secret0, &point0).unwrap();
        assert!(store.is_revoked(0));
        assert!(!store.is_revoked(1));
        assert_eq!(store.latest(), Some(0));
    }
}
