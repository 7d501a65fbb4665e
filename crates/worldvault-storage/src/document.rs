//! Embedded document store backend (redb)
//!
//! Each world has a document with its size, timestamps and lease record,
//! and a separate blob entry. Every mutation is a single write transaction,
//! and redb runs write transactions one at a time, which makes the lease
//! compare-and-swap and the guarded write atomic.
//!
//! redb holds an exclusive lock on the database file, so only one process
//! can open a given store at a time.

use crate::backend::{StorageBackend, blocking, check_lease};
use crate::tables;
use async_trait::async_trait;
use redb::{Database, ReadableTable, WriteTransaction};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use worldvault_common::config::{BackendKind, DocumentConfig};
use worldvault_common::{Error, Lease, LeaseToken, Result, Timestamp, WorldName};

const LEASE_EPOCH_COUNTER: &str = "lease_epoch";

/// Error type for document store operations
#[derive(Debug, thiserror::Error)]
enum DocumentError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error(transparent)]
    Vault(#[from] Error),
}

impl From<redb::TransactionError> for DocumentError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<DocumentError> for Error {
    fn from(e: DocumentError) -> Self {
        match e {
            DocumentError::Vault(e) => e,
            DocumentError::Bincode(e) => Self::serialization(format!("invalid world document: {e}")),
            other => Self::backend(other.to_string()),
        }
    }
}

type DocumentResult<T> = std::result::Result<T, DocumentError>;

/// Per-world metadata document
#[derive(Clone, Debug, Serialize, Deserialize)]
struct WorldDocument {
    name: String,
    size: u64,
    created_at: Timestamp,
    updated_at: Timestamp,
    lease: Option<Lease>,
}

impl WorldDocument {
    fn new(name: &WorldName) -> Self {
        let now = Timestamp::now();
        Self {
            name: name.to_string(),
            size: 0,
            created_at: now,
            updated_at: now,
            lease: None,
        }
    }
}

/// Backend over an embedded redb database
///
/// The database file is locked by the opening process, so leases kept here
/// only exclude sessions of that process. Clone the handle to share it.
#[derive(Clone)]
pub struct DocumentBackend {
    inner: Arc<DocumentStore>,
}

impl DocumentBackend {
    /// Open (or create) the database from configuration
    pub fn open(config: &DocumentConfig) -> Result<Self> {
        Self::open_path(&config.path)
    }

    /// Open (or create) the database at the given path
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        let store = DocumentStore::open(path.as_ref())?;
        info!("Document backend at {}", path.as_ref().display());
        Ok(Self {
            inner: Arc::new(store),
        })
    }
}

struct DocumentStore {
    db: Database,
}

impl DocumentStore {
    fn open(path: &Path) -> DocumentResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::backend(format!("failed to create {}: {e}", parent.display())))?;
        }
        let db = Database::create(path)?;

        // Create all tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::WORLD_DOCUMENTS)?;
            let _t = write_txn.open_table(tables::WORLD_BLOBS)?;
            let _t = write_txn.open_table(tables::VAULT_COUNTERS)?;
        }
        write_txn.commit()?;
        Ok(Self { db })
    }

    fn load_document(txn: &WriteTransaction, name: &WorldName) -> DocumentResult<Option<WorldDocument>> {
        let table = txn.open_table(tables::WORLD_DOCUMENTS)?;
        let doc = table
            .get(name.as_str())?
            .map(|v| bincode::deserialize(v.value()))
            .transpose()?;
        Ok(doc)
    }

    fn store_document(txn: &WriteTransaction, doc: &WorldDocument) -> DocumentResult<()> {
        let bytes = bincode::serialize(doc)?;
        let mut table = txn.open_table(tables::WORLD_DOCUMENTS)?;
        table.insert(doc.name.as_str(), bytes.as_slice())?;
        Ok(())
    }

    fn put_blob(txn: &WriteTransaction, name: &WorldName, blob: &[u8]) -> DocumentResult<()> {
        let mut doc = Self::load_document(txn, name)?.unwrap_or_else(|| WorldDocument::new(name));
        doc.size = blob.len() as u64;
        doc.updated_at = Timestamp::now();
        Self::store_document(txn, &doc)?;
        let mut blobs = txn.open_table(tables::WORLD_BLOBS)?;
        blobs.insert(name.as_str(), blob)?;
        Ok(())
    }

    fn exists(&self, name: &WorldName) -> DocumentResult<bool> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::WORLD_BLOBS)?;
        Ok(table.get(name.as_str())?.is_some())
    }

    fn read(&self, name: &WorldName) -> DocumentResult<Vec<u8>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::WORLD_BLOBS)?;
        let blob = table.get(name.as_str())?.map(|v| v.value().to_vec());
        blob.ok_or_else(|| Error::NotFound(name.to_string()).into())
    }

    fn write(&self, name: &WorldName, blob: &[u8]) -> DocumentResult<()> {
        let write_txn = self.db.begin_write()?;
        Self::put_blob(&write_txn, name, blob)?;
        write_txn.commit()?;
        Ok(())
    }

    fn delete(&self, name: &WorldName) -> DocumentResult<()> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut blobs = write_txn.open_table(tables::WORLD_BLOBS)?;
            let removed = blobs.remove(name.as_str())?.is_some();
            removed
        };
        if !removed {
            write_txn.abort()?;
            return Err(Error::NotFound(name.to_string()).into());
        }
        {
            let mut docs = write_txn.open_table(tables::WORLD_DOCUMENTS)?;
            docs.remove(name.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn list(&self, leased_only: bool) -> DocumentResult<Vec<WorldName>> {
        let read_txn = self.db.begin_read()?;
        let mut names = Vec::new();
        if leased_only {
            let table = read_txn.open_table(tables::WORLD_DOCUMENTS)?;
            for entry in table.iter()? {
                let entry = entry?;
                let doc: WorldDocument = bincode::deserialize(entry.1.value())?;
                if doc.lease.is_some() {
                    names.extend(WorldName::new(doc.name).ok());
                }
            }
        } else {
            let table = read_txn.open_table(tables::WORLD_BLOBS)?;
            for entry in table.iter()? {
                let entry = entry?;
                names.extend(WorldName::new(entry.0.value()).ok());
            }
        }
        Ok(names)
    }

    fn read_lease(&self, name: &WorldName) -> DocumentResult<Option<Lease>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::WORLD_DOCUMENTS)?;
        let doc: Option<WorldDocument> = table
            .get(name.as_str())?
            .map(|v| bincode::deserialize(v.value()))
            .transpose()?;
        Ok(doc.and_then(|d| d.lease))
    }

    fn swap_lease(&self, name: &WorldName, expected: Option<Lease>, new: Lease) -> DocumentResult<bool> {
        let write_txn = self.db.begin_write()?;
        let mut doc = Self::load_document(&write_txn, name)?.unwrap_or_else(|| WorldDocument::new(name));
        if doc.lease != expected {
            write_txn.abort()?;
            return Ok(false);
        }
        doc.lease = Some(new);
        Self::store_document(&write_txn, &doc)?;
        write_txn.commit()?;
        Ok(true)
    }

    fn delete_lease(&self, name: &WorldName, expected: Lease) -> DocumentResult<bool> {
        let write_txn = self.db.begin_write()?;
        let Some(mut doc) = Self::load_document(&write_txn, name)? else {
            write_txn.abort()?;
            return Ok(false);
        };
        if doc.lease != Some(expected) {
            write_txn.abort()?;
            return Ok(false);
        }
        let has_blob = {
            let blobs = write_txn.open_table(tables::WORLD_BLOBS)?;
            let found = blobs.get(name.as_str())?.is_some();
            found
        };
        if has_blob {
            doc.lease = None;
            Self::store_document(&write_txn, &doc)?;
        } else {
            let mut docs = write_txn.open_table(tables::WORLD_DOCUMENTS)?;
            docs.remove(name.as_str())?;
        }
        write_txn.commit()?;
        Ok(true)
    }

    fn next_epoch(&self) -> DocumentResult<u64> {
        let write_txn = self.db.begin_write()?;
        let next = {
            let mut counters = write_txn.open_table(tables::VAULT_COUNTERS)?;
            let stored = counters.get(LEASE_EPOCH_COUNTER)?.map(|v| v.value());
            let last = match stored {
                Some(last) => last,
                // stores created before the counter existed
                None => Self::highest_lease_epoch(&write_txn)?,
            };
            let next = last
                .checked_add(1)
                .ok_or_else(|| Error::backend("lease epoch counter exhausted"))?;
            counters.insert(LEASE_EPOCH_COUNTER, next)?;
            next
        };
        write_txn.commit()?;
        Ok(next)
    }

    fn highest_lease_epoch(txn: &WriteTransaction) -> DocumentResult<u64> {
        let table = txn.open_table(tables::WORLD_DOCUMENTS)?;
        let mut highest = 0;
        for entry in table.iter()? {
            let (_, value) = entry?;
            let doc: WorldDocument = bincode::deserialize(value.value())?;
            if let Some(lease) = doc.lease {
                highest = highest.max(lease.epoch);
            }
        }
        Ok(highest)
    }

    fn write_if_lease_valid(
        &self,
        name: &WorldName,
        token: LeaseToken,
        now: Timestamp,
        blob: &[u8],
    ) -> DocumentResult<()> {
        let write_txn = self.db.begin_write()?;
        let lease = Self::load_document(&write_txn, name)?.and_then(|d| d.lease);
        if let Err(e) = check_lease(name, lease.as_ref(), token, now) {
            write_txn.abort()?;
            return Err(e.into());
        }
        Self::put_blob(&write_txn, name, blob)?;
        write_txn.commit()?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for DocumentBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Document
    }

    async fn exists(&self, name: &WorldName) -> Result<bool> {
        let (inner, name) = (Arc::clone(&self.inner), name.clone());
        blocking(move || Ok(inner.exists(&name)?)).await
    }

    async fn read(&self, name: &WorldName) -> Result<Vec<u8>> {
        let (inner, name) = (Arc::clone(&self.inner), name.clone());
        blocking(move || Ok(inner.read(&name)?)).await
    }

    async fn write(&self, name: &WorldName, blob: &[u8]) -> Result<()> {
        let (inner, name, blob) = (Arc::clone(&self.inner), name.clone(), blob.to_vec());
        blocking(move || Ok(inner.write(&name, &blob)?)).await
    }

    async fn delete(&self, name: &WorldName) -> Result<()> {
        let (inner, name) = (Arc::clone(&self.inner), name.clone());
        blocking(move || Ok(inner.delete(&name)?)).await
    }

    async fn list(&self) -> Result<Vec<WorldName>> {
        let inner = Arc::clone(&self.inner);
        blocking(move || Ok(inner.list(false)?)).await
    }

    async fn read_lease(&self, name: &WorldName) -> Result<Option<Lease>> {
        let (inner, name) = (Arc::clone(&self.inner), name.clone());
        blocking(move || Ok(inner.read_lease(&name)?)).await
    }

    async fn swap_lease(
        &self,
        name: &WorldName,
        expected: Option<Lease>,
        new: Lease,
    ) -> Result<bool> {
        let (inner, name) = (Arc::clone(&self.inner), name.clone());
        blocking(move || Ok(inner.swap_lease(&name, expected, new)?)).await
    }

    async fn delete_lease(&self, name: &WorldName, expected: Lease) -> Result<bool> {
        let (inner, name) = (Arc::clone(&self.inner), name.clone());
        blocking(move || Ok(inner.delete_lease(&name, expected)?)).await
    }

    async fn list_leases(&self) -> Result<Vec<WorldName>> {
        let inner = Arc::clone(&self.inner);
        blocking(move || Ok(inner.list(true)?)).await
    }

    async fn next_epoch(&self) -> Result<u64> {
        let inner = Arc::clone(&self.inner);
        blocking(move || Ok(inner.next_epoch()?)).await
    }

    async fn write_if_lease_valid(
        &self,
        name: &WorldName,
        token: LeaseToken,
        now: Timestamp,
        blob: &[u8],
    ) -> Result<()> {
        let (inner, name, blob) = (Arc::clone(&self.inner), name.clone(), blob.to_vec());
        blocking(move || Ok(inner.write_if_lease_valid(&name, token, now, &blob)?)).await
    }
}
