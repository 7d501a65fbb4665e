//! Lease-based world locking
//!
//! A world is locked while its lease record names an owner and has not
//! expired. Every transition is a compare-and-swap on the whole record,
//! so two instances racing for the same world cannot both win. Epochs come
//! from the backend's store-wide counter, so a new lease always carries an
//! epoch no earlier holder of the world ever had, even after its record was
//! deleted.

use crate::clock::Clock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use worldvault_common::{Error, InstanceId, Lease, LeaseToken, Result, Timestamp, WorldName};
use worldvault_storage::StorageBackend;

/// Bound on re-reads when a concurrent writer keeps changing the record
const MAX_CAS_ATTEMPTS: usize = 16;

/// Acquires, renews and releases world leases
pub struct LockManager {
    backend: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
}

impl LockManager {
    /// Create a lock manager storing leases in `backend`
    pub fn new(backend: Arc<dyn StorageBackend>, clock: Arc<dyn Clock>) -> Self {
        Self { backend, clock }
    }

    /// Backend holding the lease records
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Clock used for expiry decisions
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Take the lease on `name` for `owner`
    ///
    /// Fails with [`Error::WorldLocked`] while another unexpired lease
    /// exists, including one held by `owner` itself.
    pub async fn acquire(
        &self,
        name: &WorldName,
        owner: InstanceId,
        ttl: Duration,
    ) -> Result<Lease> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.backend.read_lease(name).await?;
            let now = self.clock.now();
            if let Some(lease) = current
                && !lease.is_expired(now)
            {
                return Err(Error::WorldLocked {
                    world: name.to_string(),
                    owner: lease.owner,
                });
            }

            let epoch = self.next_epoch(name, current).await?;
            let lease = Lease::new(owner, epoch, now.saturating_add(ttl));
            if self.backend.swap_lease(name, current, lease).await? {
                info!("Acquired lease on {} (owner {}, epoch {})", name, owner, epoch);
                return Ok(lease);
            }
            debug!("Lease on {} changed during acquire, retrying", name);
        }
        Err(contention(name))
    }

    /// Store-wide epoch, never below the one following `current`
    async fn next_epoch(&self, name: &WorldName, current: Option<Lease>) -> Result<u64> {
        let allocated = self.backend.next_epoch().await?;
        let floor = match current {
            Some(lease) => lease
                .epoch
                .checked_add(1)
                .ok_or_else(|| Error::backend(format!("lease epoch on {name} exhausted")))?,
            None => 1,
        };
        Ok(allocated.max(floor))
    }

    /// Extend the lease described by `token` to `now + ttl`
    ///
    /// Succeeds while the record still carries the token's owner and
    /// epoch, even when it has already expired. Fails with
    /// [`Error::LeaseLost`] once the record was released or re-acquired.
    pub async fn renew(
        &self,
        name: &WorldName,
        token: LeaseToken,
        ttl: Duration,
    ) -> Result<Lease> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = match self.backend.read_lease(name).await? {
                Some(lease) if is_live_record(&lease, token) => lease,
                _ => return Err(lease_lost(name)),
            };
            let renewed = Lease::new(
                token.owner,
                token.epoch,
                self.clock.now().saturating_add(ttl),
            );
            if self.backend.swap_lease(name, Some(current), renewed).await? {
                debug!("Renewed lease on {} until {}", name, renewed.expires_at.as_millis());
                return Ok(renewed);
            }
        }
        Err(contention(name))
    }

    /// Give up the lease described by `token`
    ///
    /// A no-op when the record no longer matches, so releasing twice is
    /// harmless.
    pub async fn release(&self, name: &WorldName, token: LeaseToken) -> Result<()> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = match self.backend.read_lease(name).await? {
                Some(lease) if is_live_record(&lease, token) => lease,
                _ => return Ok(()),
            };
            if self
                .backend
                .swap_lease(name, Some(current), current.tombstone())
                .await?
            {
                info!("Released lease on {} (epoch {})", name, token.epoch);
                return Ok(());
            }
        }
        Err(contention(name))
    }

    /// Check that `token` still holds an unexpired lease on `name`
    pub async fn verify(&self, name: &WorldName, token: LeaseToken) -> Result<Lease> {
        match self.backend.read_lease(name).await? {
            Some(lease) if token.is_valid_for(&lease, self.clock.now()) => Ok(lease),
            _ => Err(lease_lost(name)),
        }
    }

    /// The unexpired lease on `name`, if any
    pub async fn current(&self, name: &WorldName) -> Result<Option<Lease>> {
        let now = self.clock.now();
        Ok(self
            .backend
            .read_lease(name)
            .await?
            .filter(|lease| !lease.is_expired(now)))
    }

    /// Whether `name` is currently locked by anyone
    pub async fn is_locked(&self, name: &WorldName) -> Result<bool> {
        Ok(self.current(name).await?.is_some())
    }

    /// Break whatever lease is live on `name`, returning it
    ///
    /// The holder finds out on its next renewal or guarded save.
    pub async fn force_release(&self, name: &WorldName) -> Result<Option<Lease>> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(current) = self.current(name).await? else {
                return Ok(None);
            };
            if self
                .backend
                .swap_lease(name, Some(current), current.tombstone())
                .await?
            {
                info!("Force-released lease on {} held by {}", name, current.owner);
                return Ok(Some(current));
            }
        }
        Err(contention(name))
    }
}

/// Record still carries the token and has not been tombstoned
fn is_live_record(lease: &Lease, token: LeaseToken) -> bool {
    lease.is_held_by(token.owner, token.epoch) && lease.expires_at != Timestamp::ZERO
}

fn lease_lost(name: &WorldName) -> Error {
    Error::LeaseLost {
        world: name.to_string(),
    }
}

fn contention(name: &WorldName) -> Error {
    Error::backend(format!("lease record for {name} kept changing"))
}
