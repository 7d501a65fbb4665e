//! Shared handles used by sessions and the world manager

use crate::clock::{Clock, SystemClock};
use crate::lock::LockManager;
use std::sync::Arc;
use tracing::info;
use worldvault_common::config::{CompressionConfig, LeaseConfig};
use worldvault_common::{Config, InstanceId, Result};
use worldvault_format::{DecodedWorld, World, WorldCodec};
use worldvault_storage::{StorageBackend, open_backend};

/// Blob store, lock manager and save settings for one instance
pub struct SessionContext {
    backend: Arc<dyn StorageBackend>,
    locks: Arc<LockManager>,
    owner: InstanceId,
    compression: CompressionConfig,
    lease: LeaseConfig,
}

impl SessionContext {
    /// Combine a blob backend with a lock manager
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        locks: Arc<LockManager>,
        owner: InstanceId,
    ) -> Self {
        Self {
            backend,
            locks,
            owner,
            compression: CompressionConfig::default(),
            lease: LeaseConfig::default(),
        }
    }

    /// Open the backends named by `config` using the system clock
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::from_config_with_clock(config, Arc::new(SystemClock))
    }

    /// Open the backends named by `config`
    ///
    /// When leases and blobs use the same backend kind they share one
    /// handle, which also lets saves use the backend's guarded write.
    pub fn from_config_with_clock(config: &Config, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let storage = &config.storage;
        let backend = open_backend(storage, storage.backend)?;
        let lock_backend = if storage.lock_backend() == storage.backend {
            Arc::clone(&backend)
        } else {
            open_backend(storage, storage.lock_backend())?
        };

        let owner = config.node.instance_id();
        info!(
            "Instance {} using {} for worlds and {} for leases",
            owner,
            storage.backend,
            storage.lock_backend()
        );

        Ok(Self::new(backend, Arc::new(LockManager::new(lock_backend, clock)), owner)
            .with_compression(config.compression.clone())
            .with_lease_config(config.lease.clone()))
    }

    #[must_use]
    pub fn with_compression(mut self, compression: CompressionConfig) -> Self {
        self.compression = compression;
        self
    }

    #[must_use]
    pub fn with_lease_config(mut self, lease: LeaseConfig) -> Self {
        self.lease = lease;
        self
    }

    /// Backend holding world blobs
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Identity used as lease owner
    pub fn owner(&self) -> InstanceId {
        self.owner
    }

    pub fn compression(&self) -> &CompressionConfig {
        &self.compression
    }

    pub fn lease_config(&self) -> &LeaseConfig {
        &self.lease
    }

    /// Whether leases live in the blob backend itself
    pub(crate) fn leases_colocated(&self) -> bool {
        same_backend(&self.backend, self.locks.backend())
    }

    pub(crate) fn encode(&self, world: &World) -> Result<Vec<u8>> {
        let raw = WorldCodec::encode(world)?;
        worldvault_format::compress_with_level(
            &raw,
            self.compression.algorithm,
            self.compression.level,
        )
    }

    pub(crate) fn decode(blob: &[u8]) -> Result<DecodedWorld> {
        let raw = worldvault_format::decompress(blob)?;
        WorldCodec::decode(&raw)
    }
}

fn same_backend(a: &Arc<dyn StorageBackend>, b: &Arc<dyn StorageBackend>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
