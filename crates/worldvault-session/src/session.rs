//! World sessions
//!
//! A session is one loaded world plus, in exclusive mode, the lease that
//! allows saving it. Exclusive sessions keep their lease alive with a
//! background renewal task until [`WorldSession::close`].

use crate::context::SessionContext;
use crate::renewal::{LeaseState, Renewal};
use std::sync::Arc;
use tracing::{info, warn};
use worldvault_common::{Error, Lease, Result, WorldName};
use worldvault_format::{CompoundTag, World};

/// How a world is opened
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// Load without locking; saving is refused
    ReadOnly,
    /// Hold the world's lease for the session's lifetime
    Exclusive,
}

/// Options for [`WorldSession::open_with`]
#[derive(Clone, Debug)]
pub struct OpenOptions {
    pub mode: OpenMode,
    /// Accept a world with undecodable chunks, leaving them out
    pub allow_partial: bool,
    /// Properties merged over the stored ones once the world is loaded
    pub properties: Option<CompoundTag>,
}

impl OpenOptions {
    #[must_use]
    pub const fn new(mode: OpenMode) -> Self {
        Self {
            mode,
            allow_partial: false,
            properties: None,
        }
    }

    #[must_use]
    pub fn allow_partial(mut self, allow: bool) -> Self {
        self.allow_partial = allow;
        self
    }

    /// Override world properties for this session
    ///
    /// Entries replace stored ones with the same key; a later save keeps
    /// them.
    #[must_use]
    pub fn with_properties(mut self, properties: CompoundTag) -> Self {
        self.properties = Some(properties);
        self
    }
}

/// An open world
pub struct WorldSession {
    ctx: Arc<SessionContext>,
    name: WorldName,
    mode: OpenMode,
    world: World,
    load_errors: Vec<Error>,
    renewal: Option<Renewal>,
}

impl WorldSession {
    /// Load an existing world
    ///
    /// Any damaged chunk fails the open. In exclusive mode the lease is
    /// released again when loading fails.
    pub async fn open(ctx: Arc<SessionContext>, name: &WorldName, mode: OpenMode) -> Result<Self> {
        Self::open_with(ctx, name, OpenOptions::new(mode)).await
    }

    pub async fn open_with(
        ctx: Arc<SessionContext>,
        name: &WorldName,
        options: OpenOptions,
    ) -> Result<Self> {
        let mut renewal = match options.mode {
            OpenMode::Exclusive => Some(lock(&ctx, name).await?),
            OpenMode::ReadOnly => None,
        };

        let (mut world, load_errors) = match load(&ctx, name, options.allow_partial).await {
            Ok(loaded) => loaded,
            Err(e) => {
                if let Some(renewal) = renewal.as_mut() {
                    unlock_quietly(&ctx, name, renewal).await;
                }
                return Err(e);
            }
        };

        if let Some(overrides) = &options.properties {
            world.metadata.properties.merge(overrides);
        }

        info!(
            "Opened world {} ({:?}, {} chunks)",
            name,
            options.mode,
            world.chunk_count()
        );
        Ok(Self {
            ctx,
            name: name.clone(),
            mode: options.mode,
            world,
            load_errors,
            renewal,
        })
    }

    /// Store `world` under a new name and open it
    ///
    /// The lease is taken for the initial write in either mode; a
    /// read-only session gives it back straight away.
    pub async fn create(
        ctx: Arc<SessionContext>,
        name: &WorldName,
        world: World,
        mode: OpenMode,
    ) -> Result<Self> {
        world.validate()?;
        let blob = ctx.encode(&world)?;

        let mut renewal = lock(&ctx, name).await?;
        let written = match ctx.backend().exists(name).await {
            Ok(true) => Err(Error::WorldAlreadyExists(name.to_string())),
            Ok(false) => write_guarded(&ctx, name, &blob, renewal.state()).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            unlock_quietly(&ctx, name, &mut renewal).await;
            return Err(e);
        }

        let renewal = match mode {
            OpenMode::Exclusive => Some(renewal),
            OpenMode::ReadOnly => {
                unlock_quietly(&ctx, name, &mut renewal).await;
                None
            }
        };

        info!("Created world {} ({} bytes)", name, blob.len());
        Ok(Self {
            ctx,
            name: name.clone(),
            mode,
            world,
            load_errors: Vec::new(),
            renewal,
        })
    }

    /// Persist the current world
    ///
    /// Refused in read-only mode. Fails with [`Error::LeaseLost`] once the
    /// lease has gone, without touching the stored world.
    pub async fn save(&self) -> Result<()> {
        let renewal = match (self.mode, &self.renewal) {
            (OpenMode::ReadOnly, _) => return Err(Error::ReadOnly(self.name.to_string())),
            (OpenMode::Exclusive, Some(renewal)) => renewal,
            (OpenMode::Exclusive, None) => {
                return Err(Error::LeaseLost {
                    world: self.name.to_string(),
                });
            }
        };

        let blob = self.ctx.encode(&self.world)?;
        write_guarded(&self.ctx, &self.name, &blob, renewal.state()).await?;
        info!(
            "Saved world {} ({} chunks, {} bytes)",
            self.name,
            self.world.chunk_count(),
            blob.len()
        );
        Ok(())
    }

    /// Stop renewal and release the lease
    ///
    /// Waits for any renewal in flight before releasing.
    pub async fn close(mut self) -> Result<()> {
        if let Some(mut renewal) = self.renewal.take() {
            renewal.stop().await;
            self.ctx
                .locks()
                .release(&self.name, renewal.state().token())
                .await?;
        }
        info!("Closed world {}", self.name);
        Ok(())
    }

    pub fn name(&self) -> &WorldName {
        &self.name
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    /// Chunks left out when opened with `allow_partial`
    pub fn load_errors(&self) -> &[Error] {
        &self.load_errors
    }

    /// The lease as last written by this session
    pub fn lease(&self) -> Option<Lease> {
        self.renewal.as_ref().map(|r| r.state().lease())
    }

    /// Whether the lease was found taken away
    pub fn is_lease_lost(&self) -> bool {
        self.renewal.as_ref().is_some_and(|r| r.state().is_lost())
    }
}

impl Drop for WorldSession {
    fn drop(&mut self) {
        if self.renewal.is_some() {
            warn!(
                "World session {} dropped without close, lease will expire on its own",
                self.name
            );
        }
    }
}

impl std::fmt::Debug for WorldSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldSession")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("chunks", &self.world.chunk_count())
            .field("lease", &self.lease())
            .finish_non_exhaustive()
    }
}

async fn lock(ctx: &SessionContext, name: &WorldName) -> Result<Renewal> {
    let config = ctx.lease_config();
    let lease = ctx.locks().acquire(name, ctx.owner(), config.ttl()).await?;
    Ok(Renewal::spawn(
        Arc::clone(ctx.locks()),
        name.clone(),
        lease,
        config.ttl(),
        config.renew_interval(),
    ))
}

async fn unlock_quietly(ctx: &SessionContext, name: &WorldName, renewal: &mut Renewal) {
    renewal.stop().await;
    if let Err(e) = ctx.locks().release(name, renewal.state().token()).await {
        warn!("Failed to release lease on {name}: {e}");
    }
}

async fn load(
    ctx: &SessionContext,
    name: &WorldName,
    allow_partial: bool,
) -> Result<(World, Vec<Error>)> {
    let blob = ctx.backend().read(name).await?;
    let decoded = SessionContext::decode(&blob)?;
    if !allow_partial {
        return Ok((decoded.into_complete()?, Vec::new()));
    }
    for e in &decoded.errors {
        warn!("Skipping damaged chunk in {name}: {e}");
    }
    Ok((decoded.world, decoded.errors))
}

/// Write `blob` only while the lease in `state` is valid
async fn write_guarded(
    ctx: &SessionContext,
    name: &WorldName,
    blob: &[u8],
    state: &LeaseState,
) -> Result<()> {
    if state.is_lost() {
        return Err(Error::LeaseLost {
            world: name.to_string(),
        });
    }

    let token = state.token();
    let result = if ctx.leases_colocated() {
        let now = ctx.locks().clock().now();
        ctx.backend()
            .write_if_lease_valid(name, token, now, blob)
            .await
    } else {
        // Leases elsewhere: check on both sides of the write so a lease lost
        // while it ran is still reported.
        match ctx.locks().verify(name, token).await {
            Ok(_) => match ctx.backend().write(name, blob).await {
                Ok(()) => ctx.locks().verify(name, token).await.map(|_| ()),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        }
    };

    if let Err(e) = &result
        && e.is_lease_lost()
    {
        warn!("Lease on {name} lost, refusing to save");
        state.mark_lost();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::lock::LockManager;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use worldvault_common::config::{BackendKind, LeaseConfig};
    use worldvault_common::{InstanceId, Lease, LeaseToken, Timestamp};
    use worldvault_format::{
        BlockState, Chunk, CompressionAlgorithm, Tag, WorldCodec, compress,
    };
    use worldvault_storage::{MemoryBackend, StorageBackend};

    struct Fixture {
        backend: Arc<MemoryBackend>,
        clock: Arc<ManualClock>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                backend: Arc::new(MemoryBackend::new()),
                clock: Arc::new(ManualClock::new(Timestamp::from_millis(5_000_000))),
            }
        }

        /// A fresh instance sharing the same store and clock
        fn instance(&self) -> Arc<SessionContext> {
            let locks = Arc::new(LockManager::new(self.backend.clone(), self.clock.clone()));
            Arc::new(SessionContext::new(self.backend.clone(), locks, InstanceId::new()))
        }

        /// An instance whose leases live in a separate store
        fn split_instance(&self, leases: &Arc<MemoryBackend>) -> Arc<SessionContext> {
            let locks = Arc::new(LockManager::new(leases.clone(), self.clock.clone()));
            Arc::new(SessionContext::new(self.backend.clone(), locks, InstanceId::new()))
        }
    }

    fn name(s: &str) -> WorldName {
        WorldName::new(s).unwrap()
    }

    fn stone_world(chunks: i32) -> World {
        let mut world = World::new(64).unwrap();
        let stone = BlockState::new("minecraft:stone");
        for x in 0..chunks {
            world.insert_chunk(Chunk::filled(x, 0, 64, &stone).unwrap()).unwrap();
        }
        world
    }

    #[tokio::test]
    async fn test_exclusive_open_excludes_other_instances() {
        let f = Fixture::new();
        let a = f.instance();
        let b = f.instance();
        let world = name("survival");

        let session = WorldSession::create(a.clone(), &world, stone_world(2), OpenMode::Exclusive)
            .await
            .unwrap();

        match WorldSession::open(b.clone(), &world, OpenMode::Exclusive).await {
            Err(Error::WorldLocked { owner, .. }) => assert_eq!(owner, a.owner()),
            other => panic!("expected WorldLocked, got {other:?}"),
        }
        // Read-only access is still allowed
        let reader = WorldSession::open(b.clone(), &world, OpenMode::ReadOnly).await.unwrap();
        assert_eq!(reader.world().chunk_count(), 2);
        assert!(reader.lease().is_none());

        session.close().await.unwrap();
        let reopened = WorldSession::open(b, &world, OpenMode::Exclusive).await.unwrap();
        assert_eq!(reopened.lease().unwrap().epoch, 2);
        reopened.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_save_roundtrip() {
        let f = Fixture::new();
        let ctx = f.instance();
        let world = name("build");

        let mut session = WorldSession::create(ctx.clone(), &world, stone_world(1), OpenMode::Exclusive)
            .await
            .unwrap();
        session
            .world_mut()
            .insert_chunk(Chunk::filled(5, 5, 64, &BlockState::new("minecraft:dirt")).unwrap())
            .unwrap();
        session.save().await.unwrap();
        let saved = session.world().clone();
        session.close().await.unwrap();

        let reopened = WorldSession::open(ctx, &world, OpenMode::ReadOnly).await.unwrap();
        assert_eq!(reopened.world().chunk_count(), 2);
        assert_eq!(reopened.world().chunks, saved.chunks);
    }

    #[tokio::test]
    async fn test_read_only_save_refused() {
        let f = Fixture::new();
        let ctx = f.instance();
        let world = name("museum");

        let session = WorldSession::create(ctx.clone(), &world, stone_world(1), OpenMode::ReadOnly)
            .await
            .unwrap();
        assert!(!ctx.locks().is_locked(&world).await.unwrap());
        assert!(matches!(session.save().await, Err(Error::ReadOnly(_))));
    }

    #[tokio::test]
    async fn test_create_existing_fails_and_unlocks() {
        let f = Fixture::new();
        let ctx = f.instance();
        let world = name("taken");

        WorldSession::create(ctx.clone(), &world, stone_world(1), OpenMode::ReadOnly)
            .await
            .unwrap();
        let err = WorldSession::create(ctx.clone(), &world, stone_world(3), OpenMode::Exclusive)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WorldAlreadyExists(_)));
        assert!(!ctx.locks().is_locked(&world).await.unwrap());
        assert_eq!(
            WorldSession::open(ctx, &world, OpenMode::ReadOnly)
                .await
                .unwrap()
                .world()
                .chunk_count(),
            1
        );
    }

    #[tokio::test]
    async fn test_failed_open_releases_lease() {
        let f = Fixture::new();
        let ctx = f.instance();

        let missing = name("missing");
        assert!(
            WorldSession::open(ctx.clone(), &missing, OpenMode::Exclusive)
                .await
                .unwrap_err()
                .is_not_found()
        );
        assert!(!ctx.locks().is_locked(&missing).await.unwrap());

        let garbage = name("garbage");
        f.backend.write(&garbage, b"\x00not a world").await.unwrap();
        assert!(
            WorldSession::open(ctx.clone(), &garbage, OpenMode::Exclusive)
                .await
                .is_err()
        );
        assert!(!ctx.locks().is_locked(&garbage).await.unwrap());
    }

    #[tokio::test]
    async fn test_partial_open() {
        let f = Fixture::new();
        let ctx = f.instance();
        let world = name("damaged");

        let mut raw = WorldCodec::encode(&stone_world(3)).unwrap();
        // Last payload byte of the final chunk, just before the empty extra block
        let victim = raw.len() - 5;
        raw[victim] ^= 0xFF;
        f.backend
            .write(&world, &compress(&raw, CompressionAlgorithm::None).unwrap())
            .await
            .unwrap();

        let err = WorldSession::open(ctx.clone(), &world, OpenMode::ReadOnly)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CorruptChunk { .. }));

        let session = WorldSession::open_with(
            ctx,
            &world,
            OpenOptions::new(OpenMode::ReadOnly).allow_partial(true),
        )
        .await
        .unwrap();
        assert_eq!(session.world().chunk_count(), 2);
        assert_eq!(session.load_errors().len(), 1);
    }

    #[tokio::test]
    async fn test_open_with_property_overrides() {
        let f = Fixture::new();
        let ctx = f.instance();
        let world = name("arena");
        WorldSession::create(ctx.clone(), &world, stone_world(1), OpenMode::ReadOnly)
            .await
            .unwrap()
            .close()
            .await
            .unwrap();

        let overrides = CompoundTag::new().with("difficulty", "hard").with("pvp", 0i8);
        let session = WorldSession::open_with(
            ctx.clone(),
            &world,
            OpenOptions::new(OpenMode::Exclusive).with_properties(overrides),
        )
        .await
        .unwrap();
        let properties = &session.world().metadata.properties;
        assert_eq!(properties.get_str("difficulty"), Some("hard"));
        assert_eq!(properties.get("pvp"), Some(&Tag::Byte(0)));
        assert_eq!(properties.get_str("environment"), Some("normal"));
        session.save().await.unwrap();
        session.close().await.unwrap();

        let reopened = WorldSession::open(ctx, &world, OpenMode::ReadOnly).await.unwrap();
        assert_eq!(
            reopened.world().metadata.properties.get_str("difficulty"),
            Some("hard")
        );
    }

    #[tokio::test]
    async fn test_save_after_lease_loss_fails() {
        let f = Fixture::new();
        let a = f.instance();
        let b = f.instance();
        let world = name("contested");

        let mut session = WorldSession::create(a.clone(), &world, stone_world(1), OpenMode::Exclusive)
            .await
            .unwrap();

        // The lease runs out and another instance takes over
        f.clock.advance(a.lease_config().ttl() + Duration::from_secs(1));
        let usurper = WorldSession::open(b, &world, OpenMode::Exclusive).await.unwrap();

        session.world_mut().remove_chunk(worldvault_common::ChunkPos::new(0, 0));
        assert!(session.save().await.unwrap_err().is_lease_lost());
        assert!(session.is_lease_lost());
        assert!(session.save().await.unwrap_err().is_lease_lost());

        let stored = SessionContext::decode(&f.backend.read(&world).await.unwrap())
            .unwrap()
            .into_complete()
            .unwrap();
        assert_eq!(stored.chunk_count(), 1);

        // Closing the stale session must not release the new holder's lease
        session.close().await.unwrap();
        assert_eq!(a.locks().current(&world).await.unwrap(), usurper.lease());
        usurper.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_separate_lock_backend() {
        let f = Fixture::new();
        let leases = Arc::new(MemoryBackend::new());
        let ctx = f.split_instance(&leases);
        let world = name("split");

        let session = WorldSession::create(ctx.clone(), &world, stone_world(1), OpenMode::Exclusive)
            .await
            .unwrap();
        assert!(leases.read_lease(&world).await.unwrap().is_some());
        assert!(f.backend.read_lease(&world).await.unwrap().is_none());
        session.save().await.unwrap();

        ctx.locks().force_release(&world).await.unwrap();
        assert!(session.save().await.unwrap_err().is_lease_lost());
        session.close().await.unwrap();
    }

    /// Blob store that breaks the lease held in `leases` while writing
    struct LeaseBreakingBlobs {
        blobs: Arc<MemoryBackend>,
        leases: Arc<MemoryBackend>,
        armed: AtomicBool,
    }

    #[async_trait::async_trait]
    impl StorageBackend for LeaseBreakingBlobs {
        fn kind(&self) -> BackendKind {
            self.blobs.kind()
        }

        async fn exists(&self, name: &WorldName) -> Result<bool> {
            self.blobs.exists(name).await
        }

        async fn read(&self, name: &WorldName) -> Result<Vec<u8>> {
            self.blobs.read(name).await
        }

        async fn write(&self, name: &WorldName, blob: &[u8]) -> Result<()> {
            if self.armed.load(Ordering::SeqCst)
                && let Some(lease) = self.leases.read_lease(name).await?
            {
                self.leases.swap_lease(name, Some(lease), lease.tombstone()).await?;
            }
            self.blobs.write(name, blob).await
        }

        async fn delete(&self, name: &WorldName) -> Result<()> {
            self.blobs.delete(name).await
        }

        async fn list(&self) -> Result<Vec<WorldName>> {
            self.blobs.list().await
        }

        async fn read_lease(&self, name: &WorldName) -> Result<Option<Lease>> {
            self.blobs.read_lease(name).await
        }

        async fn swap_lease(
            &self,
            name: &WorldName,
            expected: Option<Lease>,
            new: Lease,
        ) -> Result<bool> {
            self.blobs.swap_lease(name, expected, new).await
        }

        async fn delete_lease(&self, name: &WorldName, expected: Lease) -> Result<bool> {
            self.blobs.delete_lease(name, expected).await
        }

        async fn list_leases(&self) -> Result<Vec<WorldName>> {
            self.blobs.list_leases().await
        }

        async fn next_epoch(&self) -> Result<u64> {
            self.blobs.next_epoch().await
        }

        async fn write_if_lease_valid(
            &self,
            name: &WorldName,
            token: LeaseToken,
            now: Timestamp,
            blob: &[u8],
        ) -> Result<()> {
            self.blobs.write_if_lease_valid(name, token, now, blob).await
        }
    }

    #[tokio::test]
    async fn test_lease_lost_during_separate_write_is_reported() {
        let f = Fixture::new();
        let leases = Arc::new(MemoryBackend::new());
        let blobs = Arc::new(LeaseBreakingBlobs {
            blobs: f.backend.clone(),
            leases: leases.clone(),
            armed: AtomicBool::new(false),
        });
        let locks = Arc::new(LockManager::new(leases.clone(), f.clock.clone()));
        let ctx = Arc::new(SessionContext::new(blobs.clone(), locks, InstanceId::new()));
        let world = name("window");

        let session = WorldSession::create(ctx.clone(), &world, stone_world(1), OpenMode::Exclusive)
            .await
            .unwrap();
        session.save().await.unwrap();
        assert!(!session.is_lease_lost());

        blobs.armed.store(true, Ordering::SeqCst);
        assert!(session.save().await.unwrap_err().is_lease_lost());
        assert!(session.is_lease_lost());
        assert!(!ctx.locks().is_locked(&world).await.unwrap());
        session.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_renews_in_background() {
        let f = Fixture::new();
        let ctx = f.instance();
        let world = name("long");
        let config = LeaseConfig::default();

        let session = WorldSession::create(ctx.clone(), &world, stone_world(1), OpenMode::Exclusive)
            .await
            .unwrap();
        let first = session.lease().unwrap();

        // Well past the original expiry, with renewals in between
        for _ in 0..10 {
            f.clock.advance(config.renew_interval());
            tokio::time::sleep(config.renew_interval()).await;
        }
        assert!(session.lease().unwrap().expires_at > first.expires_at);
        session.save().await.unwrap();
        session.close().await.unwrap();
        assert!(!ctx.locks().is_locked(&world).await.unwrap());
    }
}
