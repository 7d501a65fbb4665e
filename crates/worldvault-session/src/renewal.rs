//! Background lease renewal
//!
//! One task per exclusive session. It extends the lease every renew
//! interval until stopped, and flags the session as lost when the lease
//! was taken away. Transient backend errors are logged and retried on the
//! next tick; the lease simply runs out if they persist past the TTL.

use crate::lock::LockManager;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, warn};
use worldvault_common::{Lease, LeaseToken, WorldName};

/// Lease view shared between a session and its renewal task
#[derive(Debug)]
pub struct LeaseState {
    lease: Mutex<Lease>,
    lost: AtomicBool,
}

impl LeaseState {
    pub fn new(lease: Lease) -> Self {
        Self {
            lease: Mutex::new(lease),
            lost: AtomicBool::new(false),
        }
    }

    /// Latest lease record written by this holder
    pub fn lease(&self) -> Lease {
        *self.lease.lock()
    }

    pub fn token(&self) -> LeaseToken {
        LeaseToken::from(&self.lease())
    }

    /// Whether renewal or a guarded write found the lease gone
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    pub fn mark_lost(&self) {
        self.lost.store(true, Ordering::Release);
    }

    fn update(&self, lease: Lease) {
        *self.lease.lock() = lease;
    }
}

/// Handle to a running renewal task
pub struct Renewal {
    state: Arc<LeaseState>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Renewal {
    /// Start renewing `lease` on `name` every `interval`
    pub fn spawn(
        locks: Arc<LockManager>,
        name: WorldName,
        lease: Lease,
        ttl: Duration,
        interval: Duration,
    ) -> Self {
        let state = Arc::new(LeaseState::new(lease));
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(renew_loop(
            locks,
            name,
            Arc::clone(&state),
            ttl,
            interval,
            stop_rx,
        ));
        Self {
            state,
            stop: Some(stop_tx),
            task: Some(task),
        }
    }

    pub fn state(&self) -> &Arc<LeaseState> {
        &self.state
    }

    /// Whether the task has exited on its own
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stop the task and wait for it, including any renewal in flight
    pub async fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            error!("Lease renewal task failed: {e}");
        }
    }
}

impl Drop for Renewal {
    fn drop(&mut self) {
        // Dropping the sender wakes the loop, which exits on its own
        self.stop.take();
    }
}

async fn renew_loop(
    locks: Arc<LockManager>,
    name: WorldName,
    state: Arc<LeaseState>,
    ttl: Duration,
    interval: Duration,
    mut stop: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            _ = ticker.tick() => {}
        }

        match locks.renew(&name, state.token(), ttl).await {
            Ok(lease) => state.update(lease),
            Err(e) if e.is_lease_lost() => {
                warn!("Lease on {name} was lost, stopping renewal");
                state.mark_lost();
                break;
            }
            Err(e) => {
                warn!("Failed to renew lease on {name}: {e}");
            }
        }
    }
    debug!("Lease renewal for {name} stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use worldvault_common::{InstanceId, Timestamp};
    use worldvault_storage::{MemoryBackend, StorageBackend};

    const TTL: Duration = Duration::from_secs(30);
    const INTERVAL: Duration = Duration::from_secs(10);

    struct Fixture {
        locks: Arc<LockManager>,
        clock: Arc<ManualClock>,
        backend: Arc<MemoryBackend>,
        name: WorldName,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000_000)));
        let backend = Arc::new(MemoryBackend::new());
        Fixture {
            locks: Arc::new(LockManager::new(backend.clone(), clock.clone())),
            clock,
            backend,
            name: WorldName::new("spawn").unwrap(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_extends_lease() {
        let f = fixture();
        let lease = f.locks.acquire(&f.name, InstanceId::new(), TTL).await.unwrap();
        let renewal = Renewal::spawn(f.locks.clone(), f.name.clone(), lease, TTL, INTERVAL);

        f.clock.advance(Duration::from_secs(25));
        tokio::time::sleep(INTERVAL + Duration::from_millis(1)).await;

        let record = f.backend.read_lease(&f.name).await.unwrap().unwrap();
        assert!(record.expires_at > lease.expires_at);
        assert_eq!(renewal.state().lease(), record);
        assert!(!renewal.state().is_lost());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_detects_lost_lease() {
        let f = fixture();
        let lease = f.locks.acquire(&f.name, InstanceId::new(), TTL).await.unwrap();
        let renewal = Renewal::spawn(f.locks.clone(), f.name.clone(), lease, TTL, INTERVAL);

        f.locks.force_release(&f.name).await.unwrap();
        f.locks.acquire(&f.name, InstanceId::new(), TTL).await.unwrap();
        tokio::time::sleep(INTERVAL * 2).await;

        assert!(renewal.state().is_lost());
        assert!(renewal.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_renewal() {
        let f = fixture();
        let lease = f.locks.acquire(&f.name, InstanceId::new(), TTL).await.unwrap();
        let mut renewal = Renewal::spawn(f.locks.clone(), f.name.clone(), lease, TTL, INTERVAL);

        renewal.stop().await;
        assert!(renewal.is_finished());

        f.clock.advance(Duration::from_secs(20));
        tokio::time::sleep(INTERVAL * 3).await;
        let record = f.backend.read_lease(&f.name).await.unwrap().unwrap();
        assert_eq!(record, lease);
    }
}
