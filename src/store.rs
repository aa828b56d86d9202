// =============================================================================
// ROMER - Channel Store (Sled Database)
// =============================================================================
//
// Durable state of the node:
//
//   channels  channel_id  -> ChannelRecord   (one write per commitment step)
//   payments  hash||seq   -> PaymentRecord   (terminal payments)
//   invoices  hash        -> InvoiceRecord
//   meta      best_height -> u32              (last block handed to the node)
//
// Every write is flushed before it returns; the state machine releases a
// revocation secret only after `persist_channel` returned Ok.
//
// =============================================================================

use sled::{Db, Tree};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::channels::{ChannelId, ChannelRecord, PaymentHash};
use crate::invoice::InvoiceRecord;
use crate::payment::PaymentRecord;

// =============================================================================
// Store Error
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreError {
    /// Database could not be opened or written
    Database(String),
    /// Record could not be encoded or decoded
    Serialization(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(s) => write!(f, "Database error: {}", s),
            StoreError::Serialization(s) => write!(f, "Serialization error: {}", s),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sled::Error> for StoreError {
    fn from(e: sled::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<bincode::Error> for StoreError {
    fn from(e: bincode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

// =============================================================================
// Store Trait
// =============================================================================

/// Persistent state shared by the channel machines and the node
pub trait ChannelStore: Send + Sync {
    /// Atomically replace the record of one channel
    fn persist_channel(&self, record: &ChannelRecord) -> Result<(), StoreError>;

    fn get_channel(&self, channel_id: &ChannelId) -> Result<Option<ChannelRecord>, StoreError>;

    fn load_channels(&self) -> Result<Vec<ChannelRecord>, StoreError>;

    /// Archive a payment that reached a terminal state
    fn archive_payment(&self, record: &PaymentRecord) -> Result<(), StoreError>;

    fn load_payments(&self) -> Result<Vec<PaymentRecord>, StoreError>;

    fn persist_invoice(&self, record: &InvoiceRecord) -> Result<(), StoreError>;

    fn load_invoices(&self) -> Result<Vec<InvoiceRecord>, StoreError>;

    /// Remember the best block height seen
    fn persist_height(&self, height: u32) -> Result<(), StoreError>;

    fn load_height(&self) -> Result<Option<u32>, StoreError>;
}

const BEST_HEIGHT_KEY: &[u8] = b"best_height";

fn payment_key(hash: &PaymentHash, created_at: u64) -> Vec<u8> {
    let mut key = hash.0.to_vec();
    key.extend_from_slice(&created_at.to_be_bytes());
    key
}

// =============================================================================
// Sled Store
// =============================================================================

/// Store backed by a sled database
pub struct SledStore {
    db: Db,

    // Trees (tables)
    channels: Tree, // channel_id -> ChannelRecord
    payments: Tree, // hash || created_at -> PaymentRecord
    invoices: Tree, // hash -> InvoiceRecord
    meta: Tree,     // best_height -> u32
}

impl SledStore {
    /// Open or create the database at a path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Throwaway database (tests, demo)
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self, StoreError> {
        let channels = db.open_tree("channels")?;
        let payments = db.open_tree("payments")?;
        let invoices = db.open_tree("invoices")?;
        let meta = db.open_tree("meta")?;

        Ok(SledStore {
            db,
            channels,
            payments,
            invoices,
            meta,
        })
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

impl ChannelStore for SledStore {
    fn persist_channel(&self, record: &ChannelRecord) -> Result<(), StoreError> {
        let data = bincode::serialize(record)?;
        self.channels.insert(record.channel.channel_id.0, data)?;
        self.flush()?;

        log::debug!(
            "Persisted channel {} at commitment {}",
            record.channel.channel_id,
            record.channel.commitment_number
        );
        Ok(())
    }

    fn get_channel(&self, channel_id: &ChannelId) -> Result<Option<ChannelRecord>, StoreError> {
        match self.channels.get(channel_id.0)? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    fn load_channels(&self) -> Result<Vec<ChannelRecord>, StoreError> {
        self.channels
            .iter()
            .map(|item| -> Result<ChannelRecord, StoreError> {
                let (_, value) = item?;
                Ok(bincode::deserialize(&value)?)
            })
            .collect()
    }

    fn archive_payment(&self, record: &PaymentRecord) -> Result<(), StoreError> {
        let data = bincode::serialize(record)?;
        self.payments.insert(payment_key(&record.payment_hash, record.created_at), data)?;
        self.flush()
    }

    fn load_payments(&self) -> Result<Vec<PaymentRecord>, StoreError> {
        self.payments
            .iter()
            .map(|item| -> Result<PaymentRecord, StoreError> {
                let (_, value) = item?;
                Ok(bincode::deserialize(&value)?)
            })
            .collect()
    }

    fn persist_invoice(&self, record: &InvoiceRecord) -> Result<(), StoreError> {
        let data = bincode::serialize(record)?;
        self.invoices.insert(record.invoice.payment_hash.0, data)?;
        self.flush()
    }

    fn load_invoices(&self) -> Result<Vec<InvoiceRecord>, StoreError> {
        self.invoices
            .iter()
            .map(|item| -> Result<InvoiceRecord, StoreError> {
                let (_, value) = item?;
                Ok(bincode::deserialize(&value)?)
            })
            .collect()
    }

    fn persist_height(&self, height: u32) -> Result<(), StoreError> {
        self.meta.insert(BEST_HEIGHT_KEY, bincode::serialize(&height)?)?;
        self.flush()
    }

    fn load_height(&self) -> Result<Option<u32>, StoreError> {
        match self.meta.get(BEST_HEIGHT_KEY)? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }
}

// =============================================================================
// Memory Store
// =============================================================================

/// In-memory store. Records still go through bincode so that both
/// implementations accept exactly the same values.
#[derive(Default)]
pub struct MemoryStore {
    channels: Mutex<HashMap<ChannelId, Vec<u8>>>,
    payments: Mutex<Vec<Vec<u8>>>,
    invoices: Mutex<HashMap<PaymentHash, Vec<u8>>>,
    height: Mutex<Option<u32>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Make every following write fail (simulates a dead disk)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Database("write failed".to_string()));
        }
        Ok(())
    }

    fn lock_err<T>(_: T) -> StoreError {
        StoreError::Database("store lock poisoned".to_string())
    }
}

impl ChannelStore for MemoryStore {
    fn persist_channel(&self, record: &ChannelRecord) -> Result<(), StoreError> {
        self.check_writable()?;
        let data = bincode::serialize(record)?;
        self.channels
            .lock()
            .map_err(Self::lock_err)?
            .insert(record.channel.channel_id, data);
        Ok(())
    }

    fn get_channel(&self, channel_id: &ChannelId) -> Result<Option<ChannelRecord>, StoreError> {
        let channels = self.channels.lock().map_err(Self::lock_err)?;
        match channels.get(channel_id) {
            Some(data) => Ok(Some(bincode::deserialize(data)?)),
            None => Ok(None),
        }
    }

    fn load_channels(&self) -> Result<Vec<ChannelRecord>, StoreError> {
        let channels = self.channels.lock().map_err(Self::lock_err)?;
        channels
            .values()
            .map(|data| Ok(bincode::deserialize::<ChannelRecord>(data)?))
            .collect()
    }

    fn archive_payment(&self, record: &PaymentRecord) -> Result<(), StoreError> {
        self.check_writable()?;
        let data = bincode::serialize(record)?;
        self.payments.lock().map_err(Self::lock_err)?.push(data);
        Ok(())
    }

    fn load_payments(&self) -> Result<Vec<PaymentRecord>, StoreError> {
        let payments = self.payments.lock().map_err(Self::lock_err)?;
        payments
            .iter()
            .map(|data| Ok(bincode::deserialize::<PaymentRecord>(data)?))
            .collect()
    }

    fn persist_invoice(&self, record: &InvoiceRecord) -> Result<(), StoreError> {
        self.check_writable()?;
        let data = bincode::serialize(record)?;
        self.invoices
            .lock()
            .map_err(Self::lock_err)?
            .insert(record.invoice.payment_hash, data);
        Ok(())
    }

    fn load_invoices(&self) -> Result<Vec<InvoiceRecord>, StoreError> {
        let invoices = self.invoices.lock().map_err(Self::lock_err)?;
        invoices
            .values()
            .map(|data| Ok(bincode::deserialize::<InvoiceRecord>(data)?))
            .collect()
    }

    fn persist_height(&self, height: u32) -> Result<(), StoreError> {
        self.check_writable()?;
        *self.height.lock().map_err(Self::lock_err)? = Some(height);
        Ok(())
    }

    fn load_height(&self) -> Result<Option<u32>, StoreError> {
        Ok(*self.height.lock().map_err(Self::lock_err)?)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{Channel, ChannelConfig, RevocationStore};
    use crate::keys::NodeKeys;
    use std::collections::BTreeMap;

    fn record() -> ChannelRecord {
        let mut channel = Channel::new_outbound(
            NodeKeys::generate().node_id(),
            NodeKeys::generate().node_id(),
            100_000,
            40_000,
            ChannelConfig::default(),
        ).unwrap();
        channel.set_funding([0x55; 32], 0);

        ChannelRecord {
            channel,
            commitment: None,
            key_index: 7,
            remote_funding_pubkey: None,
            remote_points: BTreeMap::new(),
            revocations: RevocationStore::new(),
        }
    }

    fn roundtrip(store: &dyn ChannelStore) {
        let mut rec = record();
        store.persist_channel(&rec).unwrap();

        rec.channel.commitment_number = 5;
        store.persist_channel(&rec).unwrap();

        let loaded = store.get_channel(&rec.channel.channel_id).unwrap().unwrap();
        assert_eq!(loaded.channel.commitment_number, 5);
        assert_eq!(loaded.key_index, 7);
        assert_eq!(store.load_channels().unwrap().len(), 1);
        assert!(store.get_channel(&ChannelId([0; 32])).unwrap().is_none());

        assert_eq!(store.load_height().unwrap(), None);
        store.persist_height(812).unwrap();
        assert_eq!(store.load_height().unwrap(), Some(812));
    }

    #[test]
    fn test_memory_store() {
        roundtrip(&MemoryStore::new());
    }

    #[test]
    fn test_sled_store() {
        roundtrip(&SledStore::temporary().unwrap());
    }

    #[test]
    fn test_failing_writes() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(store.persist_channel(&record()).is_err());
        assert!(store.load_channels().unwrap().is_empty());

        store.set_fail_writes(false);
        store.persist_channel(&record()).unwrap();
    }
}
