//! Storage backend trait and factory

use crate::coordination::CoordinationBackend;
use crate::document::DocumentBackend;
use crate::file::FileBackend;
use crate::memory::MemoryBackend;
use crate::relational::RelationalBackend;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;
use worldvault_common::config::{BackendKind, StorageConfig};
use worldvault_common::{Error, Lease, LeaseToken, Result, Timestamp, WorldName};

/// Persistence for world blobs and their lease records
///
/// Blobs are opaque. `write` replaces a blob atomically: a reader sees
/// either the previous blob or the new one, never a mix. A write is visible
/// to every subsequent read through any handle on the same store.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Which variant this is
    fn kind(&self) -> BackendKind;

    /// Whether a blob is stored under `name`
    async fn exists(&self, name: &WorldName) -> Result<bool>;

    /// Stored blob, or `NotFound`
    async fn read(&self, name: &WorldName) -> Result<Vec<u8>>;

    /// Store `blob` under `name`, replacing any previous blob
    async fn write(&self, name: &WorldName, blob: &[u8]) -> Result<()>;

    /// Remove the blob and the lease record, or `NotFound` if no blob exists
    async fn delete(&self, name: &WorldName) -> Result<()>;

    /// Names of all stored blobs
    async fn list(&self) -> Result<Vec<WorldName>>;

    /// Current lease record, expired or not
    async fn read_lease(&self, name: &WorldName) -> Result<Option<Lease>>;

    /// Replace the lease record with `new` if it currently equals `expected`
    ///
    /// `expected == None` means no record may exist. Returns whether the
    /// swap happened.
    async fn swap_lease(&self, name: &WorldName, expected: Option<Lease>, new: Lease)
    -> Result<bool>;

    /// Remove the lease record if it currently equals `expected`
    async fn delete_lease(&self, name: &WorldName, expected: Lease) -> Result<bool>;

    /// Names of all worlds that have a lease record
    async fn list_leases(&self) -> Result<Vec<WorldName>>;

    /// Allocate a lease epoch
    ///
    /// Values are strictly increasing across the whole store and never
    /// handed out twice, so removing a lease record cannot bring an old
    /// epoch back.
    async fn next_epoch(&self) -> Result<u64>;

    /// Store `blob` only if `token` still matches a lease that is live at `now`
    ///
    /// The check and the write are one atomic step. Fails with `LeaseLost`
    /// when the check does not pass.
    async fn write_if_lease_valid(
        &self,
        name: &WorldName,
        token: LeaseToken,
        now: Timestamp,
        blob: &[u8],
    ) -> Result<()>;
}

/// Build the backend of the given kind from its configuration section
pub fn open_backend(config: &StorageConfig, kind: BackendKind) -> Result<Arc<dyn StorageBackend>> {
    let backend: Arc<dyn StorageBackend> = match kind {
        BackendKind::File => Arc::new(FileBackend::open(&config.file)?),
        BackendKind::Relational => Arc::new(RelationalBackend::open(&config.relational)?),
        BackendKind::Document => Arc::new(DocumentBackend::open(&config.document)?),
        BackendKind::Coordination => Arc::new(CoordinationBackend::open(&config.coordination)?),
        BackendKind::None => Arc::new(MemoryBackend::new()),
    };
    info!("Opened {} storage backend", kind);
    Ok(backend)
}

/// Run a blocking driver call on the blocking thread pool
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::backend(format!("blocking task failed: {e}")))?
}

/// Apply the lease check shared by every `write_if_lease_valid`
pub(crate) fn check_lease(
    name: &WorldName,
    current: Option<&Lease>,
    token: LeaseToken,
    now: Timestamp,
) -> Result<()> {
    match current {
        Some(lease) if token.is_valid_for(lease, now) => Ok(()),
        _ => Err(Error::LeaseLost {
            world: name.to_string(),
        }),
    }
}

/// Behaviour every backend must share, run against each variant's tests
#[cfg(test)]
pub(crate) mod conformance {
    use super::*;
    use worldvault_common::InstanceId;
    use worldvault_format::{BlockState, Chunk, CompressionAlgorithm, World, WorldCodec};

    fn name(s: &str) -> WorldName {
        WorldName::new(s).unwrap()
    }

    pub async fn blob_lifecycle(backend: &dyn StorageBackend) {
        let w = name("lifecycle");
        assert!(!backend.exists(&w).await.unwrap());
        assert!(backend.read(&w).await.unwrap_err().is_not_found());
        assert!(backend.delete(&w).await.unwrap_err().is_not_found());

        backend.write(&w, b"first").await.unwrap();
        assert!(backend.exists(&w).await.unwrap());
        assert_eq!(backend.read(&w).await.unwrap(), b"first");

        backend.write(&w, b"second, longer blob").await.unwrap();
        assert_eq!(backend.read(&w).await.unwrap(), b"second, longer blob");

        backend.write(&name("other"), b"").await.unwrap();
        assert_eq!(backend.read(&name("other")).await.unwrap(), b"");
        let mut names = backend.list().await.unwrap();
        names.sort();
        assert_eq!(names, vec![w.clone(), name("other")]);

        backend.delete(&w).await.unwrap();
        assert!(!backend.exists(&w).await.unwrap());
        assert_eq!(backend.list().await.unwrap(), vec![name("other")]);
    }

    pub async fn lease_cas(backend: &dyn StorageBackend) {
        let w = name("leased");
        let a = InstanceId::new();
        let b = InstanceId::new();
        assert_eq!(backend.read_lease(&w).await.unwrap(), None);

        let first = Lease::new(a, 1, Timestamp::from_millis(10_000));
        assert!(backend.swap_lease(&w, None, first).await.unwrap());
        assert_eq!(backend.read_lease(&w).await.unwrap(), Some(first));

        // a second creation attempt loses
        let rival = Lease::new(b, 1, Timestamp::from_millis(10_000));
        assert!(!backend.swap_lease(&w, None, rival).await.unwrap());

        // stale expectation loses
        let stale = Lease::new(a, 1, Timestamp::from_millis(9_999));
        assert!(!backend.swap_lease(&w, Some(stale), rival).await.unwrap());

        let second = Lease::new(b, 2, Timestamp::from_millis(20_000));
        assert!(backend.swap_lease(&w, Some(first), second).await.unwrap());
        assert_eq!(backend.read_lease(&w).await.unwrap(), Some(second));
        assert_eq!(backend.list_leases().await.unwrap(), vec![w.clone()]);

        assert!(!backend.delete_lease(&w, first).await.unwrap());
        assert!(backend.delete_lease(&w, second).await.unwrap());
        assert_eq!(backend.read_lease(&w).await.unwrap(), None);
        assert!(backend.list_leases().await.unwrap().is_empty());
    }

    pub async fn conditional_write(backend: &dyn StorageBackend) {
        let w = name("guarded");
        let a = InstanceId::new();
        let lease = Lease::new(a, 3, Timestamp::from_millis(5_000));
        let token = LeaseToken::from(&lease);

        // no lease at all
        let err = backend
            .write_if_lease_valid(&w, token, Timestamp::from_millis(1), b"x")
            .await
            .unwrap_err();
        assert!(err.is_lease_lost());
        assert!(!backend.exists(&w).await.unwrap());

        assert!(backend.swap_lease(&w, None, lease).await.unwrap());
        backend
            .write_if_lease_valid(&w, token, Timestamp::from_millis(4_999), b"v1")
            .await
            .unwrap();
        assert_eq!(backend.read(&w).await.unwrap(), b"v1");

        // expired
        let err = backend
            .write_if_lease_valid(&w, token, Timestamp::from_millis(5_000), b"v2")
            .await
            .unwrap_err();
        assert!(err.is_lease_lost());

        // stolen
        let thief = Lease::new(InstanceId::new(), 4, Timestamp::from_millis(50_000));
        assert!(backend.swap_lease(&w, Some(lease), thief).await.unwrap());
        let err = backend
            .write_if_lease_valid(&w, token, Timestamp::from_millis(10), b"v3")
            .await
            .unwrap_err();
        assert!(err.is_lease_lost());
        assert_eq!(backend.read(&w).await.unwrap(), b"v1");

        // delete drops the lease record with the blob
        backend.delete(&w).await.unwrap();
        assert_eq!(backend.read_lease(&w).await.unwrap(), None);
    }

    pub async fn epoch_counter(backend: &dyn StorageBackend) {
        let w = name("counted");
        let first = backend.next_epoch().await.unwrap();
        let second = backend.next_epoch().await.unwrap();
        assert!(second > first);

        let lease = Lease::new(InstanceId::new(), second, Timestamp::from_millis(1));
        assert!(backend.swap_lease(&w, None, lease).await.unwrap());
        assert!(backend.delete_lease(&w, lease).await.unwrap());
        assert!(backend.next_epoch().await.unwrap() > second);
    }

    /// Two 16×16×256 chunks of one block type survive a full round trip
    pub async fn world_roundtrip(backend: &dyn StorageBackend) {
        let stone = BlockState::new("minecraft:stone");
        let mut world = World::new(256).unwrap();
        world.insert_chunk(Chunk::filled(0, 0, 256, &stone).unwrap()).unwrap();
        world.insert_chunk(Chunk::filled(1, 0, 256, &stone).unwrap()).unwrap();

        let encoded = WorldCodec::encode(&world).unwrap();
        let blob = worldvault_format::compress(&encoded, CompressionAlgorithm::Zstd).unwrap();
        let w = name("example");
        backend.write(&w, &blob).await.unwrap();

        let stored = backend.read(&w).await.unwrap();
        let decoded = WorldCodec::decode(&worldvault_format::decompress(&stored).unwrap())
            .unwrap()
            .into_complete()
            .unwrap();
        assert_eq!(decoded, world);
        for chunk in decoded.chunks.values() {
            for section in &chunk.sections {
                assert!(section.blocks.iter().all(|i| section.palette[usize::from(*i)] == stone));
            }
        }
    }

    pub async fn run_all(backend: &dyn StorageBackend) {
        blob_lifecycle(backend).await;
        lease_cas(backend).await;
        conditional_write(backend).await;
        epoch_counter(backend).await;
        world_roundtrip(backend).await;
    }
}
