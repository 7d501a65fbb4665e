//! Cleanup of orphaned lease records
//!
//! Expiry is decided lazily when a lease is read, so nothing has to run
//! for locking to work. The sweeper only removes expired records whose
//! world no longer exists, which would otherwise pile up in the lock
//! backend. Epochs come from the backend's counter rather than the record,
//! so removing one never lets an epoch be reused.

use crate::clock::Clock;
use crate::context::SessionContext;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use worldvault_common::{Result, WorldName};
use worldvault_storage::StorageBackend;

/// Removes expired lease records of deleted worlds
#[derive(Clone)]
pub struct LeaseSweeper {
    blobs: Arc<dyn StorageBackend>,
    leases: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
}

impl LeaseSweeper {
    pub fn new(
        blobs: Arc<dyn StorageBackend>,
        leases: Arc<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            blobs,
            leases,
            clock,
        }
    }

    pub fn from_context(ctx: &SessionContext) -> Self {
        Self::new(
            Arc::clone(ctx.backend()),
            Arc::clone(ctx.locks().backend()),
            Arc::clone(ctx.locks().clock()),
        )
    }

    /// One pass over the lease records; returns how many were removed
    pub async fn sweep_once(&self) -> Result<usize> {
        let names = self.leases.list_leases().await?;
        let mut removed = 0;
        for name in names {
            match self.sweep_one(&name).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => warn!("Failed to sweep lease on {name}: {e}"),
            }
        }
        if removed > 0 {
            info!("Swept {} orphaned lease records", removed);
        }
        Ok(removed)
    }

    async fn sweep_one(&self, name: &WorldName) -> Result<bool> {
        let Some(lease) = self.leases.read_lease(name).await? else {
            return Ok(false);
        };
        if !lease.is_expired(self.clock.now()) || self.blobs.exists(name).await? {
            return Ok(false);
        }
        // Compare-and-delete: a concurrent acquire wins over the sweep
        self.leases.delete_lease(name, lease).await
    }

    /// Sweep every `interval` until the handle is stopped or dropped
    pub fn spawn(self, interval: Duration) -> SweeperHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = self.sweep_once().await {
                    warn!("Lease sweep failed: {e}");
                }
            }
            debug!("Lease sweeper stopped");
        });
        SweeperHandle {
            stop: Some(stop_tx),
            task: Some(task),
        }
    }
}

/// Handle to a running sweeper task
pub struct SweeperHandle {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            error!("Lease sweeper task failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::lock::LockManager;
    use worldvault_common::{InstanceId, LeaseToken, Timestamp};
    use worldvault_storage::MemoryBackend;

    const TTL: Duration = Duration::from_secs(30);

    struct Fixture {
        blobs: Arc<MemoryBackend>,
        leases: Arc<MemoryBackend>,
        clock: Arc<ManualClock>,
        locks: LockManager,
        sweeper: LeaseSweeper,
    }

    fn fixture() -> Fixture {
        let blobs = Arc::new(MemoryBackend::new());
        let leases = Arc::new(MemoryBackend::new());
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(10_000)));
        Fixture {
            locks: LockManager::new(leases.clone(), clock.clone()),
            sweeper: LeaseSweeper::new(blobs.clone(), leases.clone(), clock.clone()),
            blobs,
            leases,
            clock,
        }
    }

    fn name(s: &str) -> WorldName {
        WorldName::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_sweeps_only_expired_orphans() {
        let f = fixture();
        let owner = InstanceId::new();

        // Orphan, released
        let orphan = f.locks.acquire(&name("orphan"), owner, TTL).await.unwrap();
        f.locks
            .release(&name("orphan"), LeaseToken::from(&orphan))
            .await
            .unwrap();
        // Existing world, expired lease
        f.blobs.write(&name("kept"), b"world").await.unwrap();
        f.locks.acquire(&name("kept"), owner, TTL).await.unwrap();
        // Orphan, still live
        f.locks.acquire(&name("creating"), owner, TTL * 10).await.unwrap();

        f.clock.advance(TTL);
        assert_eq!(f.sweeper.sweep_once().await.unwrap(), 1);

        let mut remaining = f.leases.list_leases().await.unwrap();
        remaining.sort();
        assert_eq!(remaining, vec![name("creating"), name("kept")]);
        assert_eq!(f.sweeper.sweep_once().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweeper() {
        let f = fixture();
        f.locks
            .acquire(&name("gone"), InstanceId::new(), TTL)
            .await
            .unwrap();
        f.clock.advance(TTL);

        let handle = f.sweeper.clone().spawn(Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(f.leases.list_leases().await.unwrap().is_empty());
        handle.stop().await;
    }
}
