//! Persistent storage backed by fjall.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use cairn_core::{TxnId, VarUuid};
use fjall::{Database, Keyspace, KeyspaceCreateOptions, PersistMode};

use crate::storage::{Snapshot, Storage, StorageError, WriteBatch};

/// Log-structured store with a keyspace per record family: transaction
/// bytes under `TxnId`, Var records under `VarUuid`.
#[derive(Clone)]
pub struct FjallStorage {
    inner: Arc<FjallInner>,
}

struct FjallInner {
    db: Database,
    txns: Keyspace,
    vars: Keyspace,
}

fn backend(e: fjall::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

impl FjallStorage {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_owned();
        tokio::task::spawn_blocking(move || Self::open_sync(&path))
            .await
            .expect("spawn_blocking panicked")
    }

    fn open_sync(path: &Path) -> Result<Self, StorageError> {
        let db = Database::builder(path).open().map_err(backend)?;
        let txns = db
            .keyspace("txns", KeyspaceCreateOptions::default)
            .map_err(backend)?;
        let vars = db
            .keyspace("vars", KeyspaceCreateOptions::default)
            .map_err(backend)?;
        Ok(Self {
            inner: Arc::new(FjallInner { db, txns, vars }),
        })
    }
}

struct FjallSnapshot<'a>(&'a FjallInner);

impl Snapshot for FjallSnapshot<'_> {
    fn txn_bytes(&self, txn_id: &TxnId) -> Option<Bytes> {
        self.0
            .txns
            .get(txn_id.as_bytes())
            .ok()
            .flatten()
            .map(|slice| Bytes::copy_from_slice(&slice))
    }

    fn var_record(&self, var: &VarUuid) -> Option<Bytes> {
        self.0
            .vars
            .get(var.as_bytes())
            .ok()
            .flatten()
            .map(|slice| Bytes::copy_from_slice(&slice))
    }
}

fn apply_sync(inner: &FjallInner, batch: WriteBatch) -> Result<(), StorageError> {
    for (txn_id, bytes) in batch.txn_puts {
        inner.txns.insert(txn_id.as_bytes(), &*bytes).map_err(backend)?;
    }
    for txn_id in batch.txn_deletes {
        inner.txns.remove(txn_id.as_bytes()).map_err(backend)?;
    }
    for (var, bytes) in batch.var_puts {
        inner.vars.insert(var.as_bytes(), &*bytes).map_err(backend)?;
    }
    inner.db.persist(PersistMode::SyncAll).map_err(backend)?;
    Ok(())
}

impl Storage for FjallStorage {
    fn snapshot<R>(&self, f: impl FnOnce(&dyn Snapshot) -> R) -> Result<R, StorageError> {
        Ok(f(&FjallSnapshot(&self.inner)))
    }

    fn read_write(
        &self,
        f: impl FnOnce(&mut WriteBatch) + Send + 'static,
    ) -> impl Future<Output = Result<(), StorageError>> + Send + 'static {
        let inner = self.inner.clone();
        async move {
            let mut batch = WriteBatch::default();
            f(&mut batch);
            tokio::task::spawn_blocking(move || apply_sync(&inner, batch))
                .await
                .expect("spawn_blocking panicked")
        }
    }
}
