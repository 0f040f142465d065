//! Local transactions and their interaction with incoming state.
//!
//! While a transaction holds a key in its write set, entries for that key
//! arriving through state transfer are held back. Commit makes the
//! transaction's value win and drops the held entry; rollback applies it.

use crate::error::{Error, Result};
use crate::storage::DataContainer;
use crate::types::{CacheEntry, SegmentId};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

/// Transaction identifier.
pub type TxId = u64;

#[derive(Debug, Clone)]
enum TxWrite {
    Put(CacheEntry),
    Remove,
}

#[derive(Debug, Default)]
struct OpenTx {
    writes: BTreeMap<Bytes, (SegmentId, TxWrite)>,
}

#[derive(Debug, Default)]
struct TxState {
    open: HashMap<TxId, OpenTx>,
    locks: HashMap<Bytes, TxId>,
    deferred: HashMap<Bytes, (SegmentId, CacheEntry)>,
}

/// Open transactions of one node.
#[derive(Debug)]
pub struct TransactionTable {
    next_id: AtomicU64,
    state: Mutex<TxState>,
}

impl Default for TransactionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            state: Mutex::new(TxState::default()),
        }
    }

    /// Start a transaction.
    pub fn begin(&self) -> TxId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.state.lock().open.insert(id, OpenTx::default());
        trace!(tx_id = id, "Transaction started");
        id
    }

    /// Add a put to the transaction's write set, locking the key.
    pub fn write(&self, tx: TxId, segment: SegmentId, entry: CacheEntry) -> Result<()> {
        let key = entry.key.clone();
        self.record(tx, segment, key, TxWrite::Put(entry))
    }

    /// Add a removal to the transaction's write set, locking the key.
    pub fn remove(&self, tx: TxId, segment: SegmentId, key: Bytes) -> Result<()> {
        self.record(tx, segment, key, TxWrite::Remove)
    }

    fn record(&self, tx: TxId, segment: SegmentId, key: Bytes, write: TxWrite) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(owner) = state.locks.get(&key) {
            if *owner != tx {
                return Err(Error::Internal(format!(
                    "key locked by transaction {}",
                    owner
                )));
            }
        }
        let open = state
            .open
            .get_mut(&tx)
            .ok_or_else(|| Error::Internal(format!("unknown transaction {}", tx)))?;
        open.writes.insert(key.clone(), (segment, write));
        state.locks.insert(key, tx);
        Ok(())
    }

    /// Hold back an incoming entry if a transaction has its key locked.
    /// Returns true when the entry was held back. Only the newest held entry
    /// per key is kept.
    pub fn defer_if_locked(&self, segment: SegmentId, entry: &CacheEntry) -> bool {
        let mut state = self.state.lock();
        if !state.locks.contains_key(&entry.key) {
            return false;
        }
        let newer = state
            .deferred
            .get(&entry.key)
            .map_or(true, |(_, held)| entry.version() >= held.version());
        if newer {
            state
                .deferred
                .insert(entry.key.clone(), (segment, entry.clone()));
        }
        true
    }

    /// Whether a transaction holds the key.
    pub fn is_locked(&self, key: &[u8]) -> bool {
        self.state.lock().locks.contains_key(key)
    }

    /// Number of entries currently held back.
    pub fn deferred_len(&self) -> usize {
        self.state.lock().deferred.len()
    }

    /// Apply the transaction's writes and release its keys. Entries held
    /// back for those keys are dropped.
    pub fn commit(&self, tx: TxId, container: &dyn DataContainer) -> Result<usize> {
        let open = self.finish(tx)?;
        let mut state = self.state.lock();
        let mut dropped = 0;
        for (key, (segment, write)) in open.writes {
            match write {
                TxWrite::Put(entry) => container.write(segment, entry),
                TxWrite::Remove => {
                    container.remove(segment, &key);
                }
            }
            if state.deferred.remove(&key).is_some() {
                dropped += 1;
            }
        }
        debug!(tx_id = tx, dropped, "Transaction committed");
        Ok(dropped)
    }

    /// Discard the transaction and apply entries held back for its keys.
    pub fn rollback(&self, tx: TxId, container: &dyn DataContainer) -> Result<usize> {
        let open = self.finish(tx)?;
        let mut state = self.state.lock();
        let mut applied = 0;
        for key in open.writes.keys() {
            if let Some((segment, entry)) = state.deferred.remove(key) {
                container.write(segment, entry);
                applied += 1;
            }
        }
        debug!(tx_id = tx, applied, "Transaction rolled back");
        Ok(applied)
    }

    fn finish(&self, tx: TxId) -> Result<OpenTx> {
        let mut state = self.state.lock();
        let open = state
            .open
            .remove(&tx)
            .ok_or_else(|| Error::Internal(format!("unknown transaction {}", tx)))?;
        for key in open.writes.keys() {
            state.locks.remove(key);
        }
        Ok(open)
    }
}
