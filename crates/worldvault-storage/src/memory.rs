//! In-memory backend
//!
//! Nothing survives the process. Clones share the same maps, so every
//! handle cloned from one instance sees the same worlds and leases.

use crate::backend::{StorageBackend, check_lease};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use worldvault_common::config::BackendKind;
use worldvault_common::{Error, Lease, LeaseToken, Result, Timestamp, WorldName};

#[derive(Default)]
struct State {
    blobs: HashMap<WorldName, Vec<u8>>,
    leases: HashMap<WorldName, Lease>,
    last_epoch: u64,
}

/// Ephemeral backend
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl MemoryBackend {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::None
    }

    async fn exists(&self, name: &WorldName) -> Result<bool> {
        Ok(self.state.lock().blobs.contains_key(name))
    }

    async fn read(&self, name: &WorldName) -> Result<Vec<u8>> {
        self.state
            .lock()
            .blobs
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    async fn write(&self, name: &WorldName, blob: &[u8]) -> Result<()> {
        self.state.lock().blobs.insert(name.clone(), blob.to_vec());
        Ok(())
    }

    async fn delete(&self, name: &WorldName) -> Result<()> {
        let mut state = self.state.lock();
        if state.blobs.remove(name).is_none() {
            return Err(Error::NotFound(name.to_string()));
        }
        state.leases.remove(name);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<WorldName>> {
        Ok(self.state.lock().blobs.keys().cloned().collect())
    }

    async fn read_lease(&self, name: &WorldName) -> Result<Option<Lease>> {
        Ok(self.state.lock().leases.get(name).copied())
    }

    async fn swap_lease(
        &self,
        name: &WorldName,
        expected: Option<Lease>,
        new: Lease,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        if state.leases.get(name).copied() != expected {
            return Ok(false);
        }
        state.leases.insert(name.clone(), new);
        Ok(true)
    }

    async fn delete_lease(&self, name: &WorldName, expected: Lease) -> Result<bool> {
        let mut state = self.state.lock();
        if state.leases.get(name) != Some(&expected) {
            return Ok(false);
        }
        state.leases.remove(name);
        Ok(true)
    }

    async fn list_leases(&self) -> Result<Vec<WorldName>> {
        Ok(self.state.lock().leases.keys().cloned().collect())
    }

    async fn next_epoch(&self) -> Result<u64> {
        let mut state = self.state.lock();
        state.last_epoch = state
            .last_epoch
            .checked_add(1)
            .ok_or_else(|| Error::backend("lease epoch counter exhausted"))?;
        Ok(state.last_epoch)
    }

    async fn write_if_lease_valid(
        &self,
        name: &WorldName,
        token: LeaseToken,
        now: Timestamp,
        blob: &[u8],
    ) -> Result<()> {
        let mut state = self.state.lock();
        check_lease(name, state.leases.get(name), token, now)?;
        state.blobs.insert(name.clone(), blob.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::conformance;

    #[tokio::test]
    async fn test_conformance() {
        conformance::run_all(&MemoryBackend::new()).await;
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let a = MemoryBackend::new();
        let b = a.clone();
        let name = WorldName::new("shared").unwrap();
        a.write(&name, b"data").await.unwrap();
        assert_eq!(b.read(&name).await.unwrap(), b"data");
        assert!(MemoryBackend::new().read(&name).await.is_err());
    }
}
