// =============================================================================
// ROMER - Node & Channel Keys
// =============================================================================
//
// Every key the node uses is derived from a single 32-byte seed:
//
//   node secret        = SHA256(seed || "node"       || 0)
//   funding secret(i)  = SHA256(seed || "funding"    || i)
//   commitment seed(i) = SHA256(seed || "commitment" || i)
//
// `i` is the channel key index, persisted with the channel record so that a
// restarted node re-derives the same signer.
//
// =============================================================================

use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::str::FromStr;

use crate::channels::commitment::CommitmentSecret;

// =============================================================================
// Key Error
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyError {
    /// Derived bytes are not a valid secp256k1 secret key
    InvalidKey,
    /// Hex string could not be decoded into a public key
    InvalidHex(String),
}

impl std::fmt::Display for KeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyError::InvalidKey => write!(f, "Invalid secret key"),
            KeyError::InvalidHex(s) => write!(f, "Invalid public key hex: {}", s),
        }
    }
}

impl std::error::Error for KeyError {}

// =============================================================================
// Node Identifier
// =============================================================================

/// Public identity of a node (compressed secp256k1 public key)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub PublicKey);

impl NodeId {
    pub fn from_secret(secret: &SecretKey) -> Self {
        let secp = Secp256k1::new();
        NodeId(PublicKey::from_secret_key(&secp, secret))
    }

    pub fn serialize(&self) -> [u8; 33] {
        self.0.serialize()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.serialize())
    }

    /// Short display (first 8 hex chars)
    pub fn short(&self) -> String {
        hex::encode(&self.serialize()[..4])
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.serialize().cmp(&other.serialize())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.short())
    }
}

impl FromStr for NodeId {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| KeyError::InvalidHex(s.to_string()))?;
        PublicKey::from_slice(&bytes)
            .map(NodeId)
            .map_err(|_| KeyError::InvalidHex(s.to_string()))
    }
}

// =============================================================================
// Derivation
// =============================================================================

fn derive_bytes(seed: &[u8; 32], label: &[u8], index: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(seed);
    hasher.update(label);
    hasher.update(index.to_le_bytes());

    let result = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&result);
    out
}

fn derive_secret(seed: &[u8; 32], label: &[u8], index: u64) -> Result<SecretKey, KeyError> {
    SecretKey::from_slice(&derive_bytes(seed, label, index)).map_err(|_| KeyError::InvalidKey)
}

/// Public key for a 32-byte secret
pub fn point_from_secret(secret: &[u8; 32]) -> Result<PublicKey, KeyError> {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(secret).map_err(|_| KeyError::InvalidKey)?;
    Ok(PublicKey::from_secret_key(&secp, &sk))
}

/// Verify an ECDSA signature over a 32-byte digest
pub fn verify_digest(digest: &[u8; 32], signature: &Signature, pubkey: &PublicKey) -> bool {
    let secp = Secp256k1::verification_only();
    let msg = Message::from_digest(*digest);
    secp.verify_ecdsa(&msg, signature, pubkey).is_ok()
}

// =============================================================================
// Node Keys
// =============================================================================

/// Root key material of a node
#[derive(Clone)]
pub struct NodeKeys {
    seed: [u8; 32],
    node_secret: SecretKey,
    node_id: NodeId,
}

impl NodeKeys {
    pub fn from_seed(seed: [u8; 32]) -> Result<Self, KeyError> {
        let node_secret = derive_secret(&seed, b"node", 0)?;
        let node_id = NodeId::from_secret(&node_secret);
        Ok(NodeKeys {
            seed,
            node_secret,
            node_id,
        })
    }

    /// Fresh random keys
    pub fn generate() -> Self {
        loop {
            let seed: [u8; 32] = rand::random();
            if let Ok(keys) = Self::from_seed(seed) {
                return keys;
            }
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Sign a digest with the node identity key
    pub fn sign_digest(&self, digest: &[u8; 32]) -> Signature {
        let secp = Secp256k1::new();
        secp.sign_ecdsa(&Message::from_digest(*digest), &self.node_secret)
    }

    /// Signer for the channel with the given key index
    pub fn channel_signer(&self, key_index: u64) -> Result<ChannelSigner, KeyError> {
        let funding_secret = derive_secret(&self.seed, b"funding", key_index)?;
        let secp = Secp256k1::new();
        let funding_pubkey = PublicKey::from_secret_key(&secp, &funding_secret);

        Ok(ChannelSigner {
            funding_secret,
            funding_pubkey,
            commitment_seed: derive_bytes(&self.seed, b"commitment", key_index),
        })
    }
}

impl std::fmt::Debug for NodeKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeKeys")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Channel Signer
// =============================================================================

/// Per-channel signing keys
#[derive(Clone)]
pub struct ChannelSigner {
    funding_secret: SecretKey,
    pub funding_pubkey: PublicKey,
    commitment_seed: [u8; 32],
}

impl ChannelSigner {
    /// Sign a commitment or closing digest with the funding key
    pub fn sign_digest(&self, digest: &[u8; 32]) -> Signature {
        let secp = Secp256k1::new();
        secp.sign_ecdsa(&Message::from_digest(*digest), &self.funding_secret)
    }

    /// Per-commitment secret for commitment `n`
    pub fn commitment_secret(&self, n: u64) -> CommitmentSecret {
        CommitmentSecret::derive(&self.commitment_seed, n)
    }

    /// Per-commitment point for commitment `n`
    pub fn commitment_point(&self, n: u64) -> Result<PublicKey, KeyError> {
        self.commitment_secret(n).to_point()
    }
}

impl std::fmt::Debug for ChannelSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSigner")
            .field("funding_pubkey", &self.funding_pubkey)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
