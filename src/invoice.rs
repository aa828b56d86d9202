// =============================================================================
// ROMER - Invoices
// =============================================================================
//
// A payment request names the payee, the payment hash and the amount. Text
// form:
//
//   <prefix> "1" <hex(bincode(invoice))> <hex(signature, 64 bytes)>
//
// The prefix names the network (lnbc, lntb, lntbs, lnbcrt). The signature is
// the payee's node key over SHA256(prefix || invoice bytes), so a decoded
// invoice is known to come from `payee`.
//
// =============================================================================

use secp256k1::ecdsa::Signature;
use serde::{Serialize, Deserialize};
use sha2::{Digest, Sha256};

use crate::channels::{PaymentHash, PaymentPreimage};
use crate::config::Network;
use crate::keys::{verify_digest, NodeId, NodeKeys};
use crate::unix_time;

const SEPARATOR: char = '1';
const SIGNATURE_HEX_LEN: usize = 128;

// =============================================================================
// Invoice Error
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InvoiceError {
    InvalidFormat(String),
    UnknownNetwork(String),
    WrongNetwork { expected: Network, found: Network },
    InvalidSignature,
    /// Signing key is not the payee's
    NotPayee,
    Expired,
    ZeroAmount,
    /// Invoice not issued by this node
    UnknownInvoice,
}

impl std::fmt::Display for InvoiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvoiceError::InvalidFormat(s) => write!(f, "Invalid invoice: {}", s),
            InvoiceError::UnknownNetwork(p) => write!(f, "Unknown invoice prefix '{}'", p),
            InvoiceError::WrongNetwork { expected, found } => {
                write!(f, "Invoice is for {}, node runs on {}", found, expected)
            }
            InvoiceError::InvalidSignature => write!(f, "Invoice signature invalid"),
            InvoiceError::NotPayee => write!(f, "Only the payee can sign an invoice"),
            InvoiceError::Expired => write!(f, "Invoice expired"),
            InvoiceError::ZeroAmount => write!(f, "Invoice amount must be positive"),
            InvoiceError::UnknownInvoice => write!(f, "Unknown invoice"),
        }
    }
}

impl std::error::Error for InvoiceError {}

// =============================================================================
// Invoice
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub network: Network,
    pub payment_hash: PaymentHash,
    /// Amount in satoshis
    pub amount: u64,
    pub description: String,
    pub payee: NodeId,
    pub created_at: u64,
    pub expiry_secs: u64,
    /// Expiry delta the payee wants on the final HTLC
    pub min_final_cltv: u32,
}

impl Invoice {
    pub fn new(
        network: Network,
        payment_hash: PaymentHash,
        amount: u64,
        description: &str,
        payee: NodeId,
        expiry_secs: u64,
        min_final_cltv: u32,
    ) -> Result<Self, InvoiceError> {
        if amount == 0 {
            return Err(InvoiceError::ZeroAmount);
        }
        Ok(Invoice {
            network,
            payment_hash,
            amount,
            description: description.to_string(),
            payee,
            created_at: unix_time(),
            expiry_secs,
            min_final_cltv,
        })
    }

    pub fn expires_at(&self) -> u64 {
        self.created_at.saturating_add(self.expiry_secs)
    }

    pub fn is_expired_at(&self, now: u64) -> bool {
        now >= self.expires_at()
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(unix_time())
    }

    fn digest(prefix: &str, body: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(prefix.as_bytes());
        hasher.update(body);

        let mut digest = [0u8; 32];
        digest.copy_from_slice(&hasher.finalize());
        digest
    }

    /// Text payment request signed by the payee
    pub fn encode(&self, keys: &NodeKeys) -> Result<String, InvoiceError> {
        if keys.node_id() != self.payee {
            return Err(InvoiceError::NotPayee);
        }

        let body = bincode::serialize(self)
            .map_err(|e| InvoiceError::InvalidFormat(e.to_string()))?;
        let prefix = self.network.invoice_prefix();
        let signature = keys.sign_digest(&Self::digest(prefix, &body));

        Ok(format!(
            "{}{}{}{}",
            prefix,
            SEPARATOR,
            hex::encode(body),
            hex::encode(signature.serialize_compact())
        ))
    }

    /// Parse and authenticate a payment request
    pub fn decode(s: &str) -> Result<Self, InvoiceError> {
        let s = s.trim().to_lowercase();
        let (prefix, rest) = s
            .split_once(SEPARATOR)
            .ok_or_else(|| InvoiceError::InvalidFormat("missing separator".into()))?;
        let network = Network::from_invoice_prefix(prefix)
            .ok_or_else(|| InvoiceError::UnknownNetwork(prefix.to_string()))?;

        if rest.len() <= SIGNATURE_HEX_LEN {
            return Err(InvoiceError::InvalidFormat("too short".into()));
        }
        let (body_hex, sig_hex) = rest.split_at(rest.len() - SIGNATURE_HEX_LEN);

        let body = hex::decode(body_hex)
            .map_err(|e| InvoiceError::InvalidFormat(e.to_string()))?;
        let sig_bytes = hex::decode(sig_hex)
            .map_err(|e| InvoiceError::InvalidFormat(e.to_string()))?;
        let signature = Signature::from_compact(&sig_bytes)
            .map_err(|_| InvoiceError::InvalidSignature)?;

        let invoice: Invoice = bincode::deserialize(&body)
            .map_err(|e| InvoiceError::InvalidFormat(e.to_string()))?;

        if invoice.network != network {
            return Err(InvoiceError::InvalidFormat("prefix does not match body".into()));
        }
        if !verify_digest(&Self::digest(prefix, &body), &signature, &invoice.payee.0) {
            return Err(InvoiceError::InvalidSignature);
        }
        if invoice.amount == 0 {
            return Err(InvoiceError::ZeroAmount);
        }
        Ok(invoice)
    }

    /// Decode, requiring the given network
    pub fn decode_for(s: &str, network: Network) -> Result<Self, InvoiceError> {
        let invoice = Self::decode(s)?;
        if invoice.network != network {
            return Err(InvoiceError::WrongNetwork { expected: network, found: invoice.network });
        }
        Ok(invoice)
    }
}

// =============================================================================
// Invoice Record
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceStatus {
    Open,
    Paid { amount_received: u64, paid_at: u64 },
}

/// An invoice we issued, with the preimage that settles it
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InvoiceRecord {
    pub invoice: Invoice,
    pub encoded: String,
    pub preimage: PaymentPreimage,
    pub status: InvoiceStatus,
}

impl InvoiceRecord {
    pub fn new(invoice: Invoice, encoded: String, preimage: PaymentPreimage) -> Self {
        InvoiceRecord {
            invoice,
            encoded,
            preimage,
            status: InvoiceStatus::Open,
        }
    }

    pub fn is_paid(&self) -> bool {
        matches!(self.status, InvoiceStatus::Paid { .. })
    }

    /// Check an incoming final-hop HTLC against this invoice. Overpaying is
    /// accepted, underpaying is not.
    pub fn accepts(&self, amount: u64) -> bool {
        !self.is_paid() && amount >= self.invoice.amount && !self.invoice.is_expired()
    }

    pub fn mark_paid(&mut self, amount_received: u64) {
        self.status = InvoiceStatus::Paid {
            amount_received,
            paid_at: unix_time(),
        };
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn invoice(keys: &NodeKeys, network: Network) -> Invoice {
        let preimage = PaymentPreimage::generate();
        Invoice::new(network, preimage.payment_hash(), 25_000, "coffee", keys.node_id(), 3600, 18)
            .unwrap()
    }

    #[test]
    fn test_encode_decode() {
        let keys = NodeKeys::generate();
        let inv = invoice(&keys, Network::Signet);
        let encoded = inv.encode(&keys).unwrap();
        assert!(encoded.starts_with("lntbs1"));

        let decoded = Invoice::decode(&encoded).unwrap();
        assert_eq!(decoded, inv);
        assert_eq!(
            Invoice::decode_for(&encoded, Network::Bitcoin),
            Err(InvoiceError::WrongNetwork { expected: Network::Bitcoin, found: Network::Signet })
        );
    }

    #[test]
    fn test_tampered_invoice_rejected() {
        let keys = NodeKeys::generate();
        let inv = invoice(&keys, Network::Regtest);
        let encoded = inv.encode(&keys).unwrap();

        let mut forged = inv.clone();
        forged.amount = 1;
        let forged_body = hex::encode(bincode::serialize(&forged).unwrap());
        let sig = &encoded[encoded.len() - SIGNATURE_HEX_LEN..];
        let tampered = format!("lnbcrt1{}{}", forged_body, sig);
        assert_eq!(Invoice::decode(&tampered), Err(InvoiceError::InvalidSignature));

        let other = NodeKeys::generate();
        assert_eq!(inv.encode(&other), Err(InvoiceError::NotPayee));
        assert!(matches!(Invoice::decode("lnxx1abcd"), Err(InvoiceError::UnknownNetwork(_))));
        assert!(matches!(Invoice::decode("garbage"), Err(InvoiceError::InvalidFormat(_))));
    }

    #[test]
    fn test_expiry_and_acceptance() {
        let keys = NodeKeys::generate();
        let inv = invoice(&keys, Network::Regtest);
        assert!(!inv.is_expired_at(inv.created_at + 3599));
        assert!(inv.is_expired_at(inv.created_at + 3600));

        let mut record = InvoiceRecord::new(inv.clone(), String::new(), PaymentPreimage::generate());
        assert!(!record.accepts(24_999));
        assert!(record.accepts(25_000));
        record.mark_paid(25_000);
        assert!(record.is_paid());
        assert!(!record.accepts(25_000));

        assert_eq!(
            Invoice::new(Network::Regtest, inv.payment_hash, 0, "", keys.node_id(), 60, 18),
            Err(InvoiceError::ZeroAmount)
        );
    }
}
