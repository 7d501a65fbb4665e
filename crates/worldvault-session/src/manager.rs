//! World lifecycle operations above single sessions

use crate::context::SessionContext;
use crate::session::{OpenMode, WorldSession};
use crate::sweeper::{LeaseSweeper, SweeperHandle};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use worldvault_common::config::{BackendKind, StorageConfig};
use worldvault_common::{Config, Error, Lease, LeaseToken, Result, WorldName};
use worldvault_format::World;
use worldvault_storage::{StorageBackend, open_backend};

/// Creates, copies, moves and deletes worlds
///
/// Every operation that changes a stored world takes that world's lease
/// first, so it fails with [`Error::WorldLocked`] while a session holds it.
pub struct WorldManager {
    ctx: Arc<SessionContext>,
    storage: Option<StorageConfig>,
    backends: Mutex<HashMap<BackendKind, Arc<dyn StorageBackend>>>,
}

impl WorldManager {
    pub fn new(ctx: Arc<SessionContext>) -> Self {
        let mut backends = HashMap::new();
        backends.insert(ctx.backend().kind(), Arc::clone(ctx.backend()));
        Self {
            ctx,
            storage: None,
            backends: Mutex::new(backends),
        }
    }

    /// Open the configured backends; others are opened on first use
    pub fn from_config(config: &Config) -> Result<Self> {
        let ctx = Arc::new(SessionContext::from_config(config)?);
        let mut manager = Self::new(ctx);
        manager.storage = Some(config.storage.clone());
        Ok(manager)
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    /// Make `backend` the migration endpoint for its kind
    pub fn register_backend(&self, backend: Arc<dyn StorageBackend>) {
        self.backends.lock().insert(backend.kind(), backend);
    }

    fn backend_for(&self, kind: BackendKind) -> Result<Arc<dyn StorageBackend>> {
        if let Some(backend) = self.backends.lock().get(&kind) {
            return Ok(Arc::clone(backend));
        }
        let Some(storage) = &self.storage else {
            return Err(Error::Configuration(format!("no {kind} backend registered")));
        };
        let backend = open_backend(storage, kind)?;
        Ok(Arc::clone(
            self.backends.lock().entry(kind).or_insert(backend),
        ))
    }

    /// Create and open an empty world
    pub async fn create_empty(
        &self,
        name: &WorldName,
        height: u16,
        mode: OpenMode,
    ) -> Result<WorldSession> {
        WorldSession::create(Arc::clone(&self.ctx), name, World::new(height)?, mode).await
    }

    pub async fn open(&self, name: &WorldName, mode: OpenMode) -> Result<WorldSession> {
        WorldSession::open(Arc::clone(&self.ctx), name, mode).await
    }

    /// Copy `source` to a new world named `target`
    ///
    /// The source is read without locking; saves replace whole blobs, so
    /// the copy is some complete saved state.
    pub async fn clone_world(&self, source: &WorldName, target: &WorldName) -> Result<()> {
        let original = WorldSession::open(Arc::clone(&self.ctx), source, OpenMode::ReadOnly).await?;
        WorldSession::create(
            Arc::clone(&self.ctx),
            target,
            original.world().clone(),
            OpenMode::ReadOnly,
        )
        .await?;
        info!("Cloned world {} to {}", source, target);
        Ok(())
    }

    /// Move `name` from one backend to another
    ///
    /// Refused while the world is locked or already present at `to`. The
    /// source copy is deleted only after the destination write succeeded.
    pub async fn migrate(
        &self,
        name: &WorldName,
        from: BackendKind,
        to: BackendKind,
    ) -> Result<()> {
        if from == to {
            return Err(Error::Configuration(format!(
                "cannot migrate {name} from {from} to itself"
            )));
        }
        let source = self.backend_for(from)?;
        let target = self.backend_for(to)?;

        let token = self.acquire(name).await?;
        let result = async {
            if target.exists(name).await? {
                return Err(Error::WorldAlreadyExists(name.to_string()));
            }
            let blob = source.read(name).await?;
            SessionContext::decode(&blob)?.into_complete()?;

            self.ctx.locks().verify(name, token).await?;
            target.write(name, &blob).await?;
            source.delete(name).await
        }
        .await;
        self.release(name, token).await;

        result?;
        info!("Migrated world {} from {} to {}", name, from, to);
        Ok(())
    }

    /// Delete a world that nobody holds
    pub async fn delete(&self, name: &WorldName) -> Result<()> {
        let token = self.acquire(name).await?;
        let result = self.ctx.backend().delete(name).await;
        self.release(name, token).await;

        result?;
        info!("Deleted world {}", name);
        Ok(())
    }

    /// Stored world names, sorted
    pub async fn list(&self) -> Result<Vec<WorldName>> {
        let mut names = self.ctx.backend().list().await?;
        names.sort();
        Ok(names)
    }

    pub async fn exists(&self, name: &WorldName) -> Result<bool> {
        self.ctx.backend().exists(name).await
    }

    pub async fn is_locked(&self, name: &WorldName) -> Result<bool> {
        self.ctx.locks().is_locked(name).await
    }

    /// The live lease on `name`, if any
    pub async fn lock_holder(&self, name: &WorldName) -> Result<Option<Lease>> {
        self.ctx.locks().current(name).await
    }

    /// Break the lease on `name` regardless of holder
    pub async fn unlock(&self, name: &WorldName) -> Result<Option<Lease>> {
        let broken = self.ctx.locks().force_release(name).await?;
        if let Some(lease) = &broken {
            warn!("Broke lease on {} held by {} (epoch {})", name, lease.owner, lease.epoch);
        }
        Ok(broken)
    }

    /// Start the lease sweeper if `lease.sweep_interval_ms` enables it
    pub fn start_sweeper(&self) -> Option<SweeperHandle> {
        let interval = self.ctx.lease_config().sweep_interval()?;
        info!("Sweeping orphaned leases every {:?}", interval);
        Some(LeaseSweeper::from_context(&self.ctx).spawn(interval))
    }

    async fn acquire(&self, name: &WorldName) -> Result<LeaseToken> {
        let ttl = self.ctx.lease_config().ttl();
        let lease = self.ctx.locks().acquire(name, self.ctx.owner(), ttl).await?;
        Ok(LeaseToken::from(&lease))
    }

    async fn release(&self, name: &WorldName, token: LeaseToken) {
        if let Err(e) = self.ctx.locks().release(name, token).await {
            warn!("Failed to release lease on {name}: {e}");
        }
    }
}
