//! The storage contract the engine persists through, and the in-memory
//! implementation used in tests.
//!
//! Two operations: a read-only snapshot returning by key, and a
//! read-write transaction running a callback whose puts and deletes are
//! applied atomically. The callback observes its own writes; concurrent
//! read-write transactions may interleave but each applies as a unit.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use cairn_core::{TxnId, VarUuid};

#[derive(Debug)]
pub enum StorageError {
    Backend(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Backend(e) => write!(f, "storage backend: {e}"),
        }
    }
}

impl std::error::Error for StorageError {}

/// Read-only view of the two keyspaces.
pub trait Snapshot {
    fn txn_bytes(&self, txn_id: &TxnId) -> Option<Bytes>;
    fn var_record(&self, var: &VarUuid) -> Option<Bytes>;
}

/// The puts and deletes of one read-write transaction. Reads through the
/// batch see its own writes.
#[derive(Debug, Default)]
pub struct WriteBatch {
    pub(crate) txn_puts: BTreeMap<TxnId, Bytes>,
    pub(crate) txn_deletes: BTreeSet<TxnId>,
    pub(crate) var_puts: BTreeMap<VarUuid, Bytes>,
}

impl WriteBatch {
    pub fn put_txn(&mut self, txn_id: TxnId, bytes: Bytes) {
        self.txn_deletes.remove(&txn_id);
        self.txn_puts.insert(txn_id, bytes);
    }

    pub fn delete_txn(&mut self, txn_id: TxnId) {
        self.txn_puts.remove(&txn_id);
        self.txn_deletes.insert(txn_id);
    }

    pub fn put_var(&mut self, var: VarUuid, bytes: Bytes) {
        self.var_puts.insert(var, bytes);
    }

    #[must_use]
    pub fn txn_bytes(&self, txn_id: &TxnId) -> Option<&Bytes> {
        if self.txn_deletes.contains(txn_id) {
            return None;
        }
        self.txn_puts.get(txn_id)
    }

    #[must_use]
    pub fn var_record(&self, var: &VarUuid) -> Option<&Bytes> {
        self.var_puts.get(var)
    }
}

/// The engine's storage seam. Shared across every variable of a replica
/// manager.
pub trait Storage: Send + Sync + 'static {
    fn snapshot<R>(&self, f: impl FnOnce(&dyn Snapshot) -> R) -> Result<R, StorageError>;

    fn read_write(
        &self,
        f: impl FnOnce(&mut WriteBatch) + Send + 'static,
    ) -> impl Future<Output = Result<(), StorageError>> + Send + 'static;
}

/// Heap-backed store for tests and ephemeral replicas.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Default)]
struct MemoryInner {
    txns: BTreeMap<TxnId, Bytes>,
    vars: BTreeMap<VarUuid, Bytes>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemorySnapshot<'a>(&'a MemoryInner);

impl Snapshot for MemorySnapshot<'_> {
    fn txn_bytes(&self, txn_id: &TxnId) -> Option<Bytes> {
        self.0.txns.get(txn_id).cloned()
    }

    fn var_record(&self, var: &VarUuid) -> Option<Bytes> {
        self.0.vars.get(var).cloned()
    }
}

impl Storage for MemoryStorage {
    fn snapshot<R>(&self, f: impl FnOnce(&dyn Snapshot) -> R) -> Result<R, StorageError> {
        let guard = self.inner.lock().unwrap();
        Ok(f(&MemorySnapshot(&guard)))
    }

    fn read_write(
        &self,
        f: impl FnOnce(&mut WriteBatch) + Send + 'static,
    ) -> impl Future<Output = Result<(), StorageError>> + Send + 'static {
        let inner = self.inner.clone();
        async move {
            let mut batch = WriteBatch::default();
            f(&mut batch);
            let mut guard = inner.lock().unwrap();
            for (txn_id, bytes) in batch.txn_puts {
                guard.txns.insert(txn_id, bytes);
            }
            for txn_id in batch.txn_deletes {
                guard.txns.remove(&txn_id);
            }
            for (var, bytes) in batch.var_puts {
                guard.vars.insert(var, bytes);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::RmId;

    fn txn(n: u64) -> TxnId {
        TxnId::new(n, 0, RmId(1))
    }

    #[test]
    fn batch_reads_see_own_writes_and_deletes() {
        let mut batch = WriteBatch::default();
        batch.put_txn(txn(1), Bytes::from_static(b"a"));
        assert!(batch.txn_bytes(&txn(1)).is_some());
        batch.delete_txn(txn(1));
        assert!(batch.txn_bytes(&txn(1)).is_none());
        batch.put_txn(txn(1), Bytes::from_static(b"b"));
        assert_eq!(batch.txn_bytes(&txn(1)).unwrap().as_ref(), b"b");
    }

    #[tokio::test]
    async fn memory_store_applies_batches_atomically_in_order() {
        let store = MemoryStorage::new();
        store
            .read_write(|batch| {
                batch.put_txn(txn(1), Bytes::from_static(b"one"));
                batch.put_var(VarUuid::from_bytes([1; 16]), Bytes::from_static(b"var"));
            })
            .await
            .unwrap();
        store
            .read_write(|batch| batch.delete_txn(txn(1)))
            .await
            .unwrap();

        let (txn_bytes, var_bytes) = store
            .snapshot(|snap| {
                (
                    snap.txn_bytes(&txn(1)),
                    snap.var_record(&VarUuid::from_bytes([1; 16])),
                )
            })
            .unwrap();
        assert!(txn_bytes.is_none());
        assert_eq!(var_bytes.unwrap().as_ref(), b"var");
    }
}
