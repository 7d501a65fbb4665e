//! Core type definitions for WorldVault
//!
//! This module defines the identifiers shared by the codec, the storage
//! backends and the lock manager, together with the lease record.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Coordinates of a chunk within a world
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkPos {
    pub x: i32,
    pub z: i32,
}

impl ChunkPos {
    /// Create a new chunk position
    #[must_use]
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }
}

impl fmt::Display for ChunkPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.z)
    }
}

/// Name of a world, unique per backend
///
/// Names double as file names, table keys and cache keys, so the accepted
/// alphabet is deliberately narrow.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
#[serde(try_from = "String", into = "String")]
pub struct WorldName(String);

impl WorldName {
    /// Maximum length of a world name
    pub const MAX_LEN: usize = 64;

    /// Create a new world name (validates naming rules)
    pub fn new(name: impl Into<String>) -> Result<Self, WorldNameError> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    /// Get the world name as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(name: &str) -> Result<(), WorldNameError> {
        if name.is_empty() {
            return Err(WorldNameError::Empty);
        }
        if name.len() > Self::MAX_LEN {
            return Err(WorldNameError::TooLong);
        }
        if name.starts_with('.') {
            return Err(WorldNameError::LeadingDot);
        }
        for c in name.chars() {
            if !c.is_ascii_alphanumeric() && c != '_' && c != '-' && c != '.' {
                return Err(WorldNameError::InvalidChar(c));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for WorldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorldName({:?})", self.0)
    }
}

impl AsRef<str> for WorldName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for WorldName {
    type Err = WorldNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for WorldName {
    type Error = WorldNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<WorldName> for String {
    fn from(name: WorldName) -> Self {
        name.0
    }
}

/// Errors that can occur when creating a world name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorldNameError {
    #[error("world name must not be empty")]
    Empty,
    #[error("world name must be at most 64 characters")]
    TooLong,
    #[error("world name must not start with '.'")]
    LeadingDot,
    #[error("invalid character in world name: {0:?}")]
    InvalidChar(char),
}

/// Unique identifier for a process or server instance holding leases
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, From, Into)]
pub struct InstanceId(Uuid);

impl InstanceId {
    /// Generate a new random instance ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceId({})", self.0)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for InstanceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Wall-clock instant in milliseconds since the Unix epoch
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
#[display("{_0}ms")]
pub struct Timestamp(u64);

impl Timestamp {
    /// The Unix epoch; used as the expiry of released leases
    pub const ZERO: Self = Self(0);

    /// Current system time
    #[must_use]
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Create from milliseconds since the Unix epoch
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Milliseconds since the Unix epoch
    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// This instant shifted forward by `duration`, saturating
    #[must_use]
    pub fn saturating_add(self, duration: Duration) -> Self {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(millis))
    }
}

/// Time-bounded exclusive ownership record for one world
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Instance holding (or last holding) the world
    pub owner: InstanceId,
    /// Acquisition counter from the store-wide epoch sequence
    pub epoch: u64,
    /// Instant after which the lease no longer counts
    pub expires_at: Timestamp,
}

impl Lease {
    /// Create a new lease record
    #[must_use]
    pub const fn new(owner: InstanceId, epoch: u64, expires_at: Timestamp) -> Self {
        Self {
            owner,
            epoch,
            expires_at,
        }
    }

    /// Whether the lease has run out at `now`
    #[must_use]
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }

    /// Whether the lease is held by `owner` at `epoch`
    #[must_use]
    pub fn is_held_by(&self, owner: InstanceId, epoch: u64) -> bool {
        self.owner == owner && self.epoch == epoch
    }

    /// Released form of this lease: same owner and epoch, already expired
    #[must_use]
    pub const fn tombstone(&self) -> Self {
        Self {
            owner: self.owner,
            epoch: self.epoch,
            expires_at: Timestamp::ZERO,
        }
    }
}

/// Proof of lease ownership carried by a session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseToken {
    pub owner: InstanceId,
    pub epoch: u64,
}

impl LeaseToken {
    /// Whether `lease` is the lease this token was issued for and is still live at `now`
    #[must_use]
    pub fn is_valid_for(&self, lease: &Lease, now: Timestamp) -> bool {
        lease.is_held_by(self.owner, self.epoch) && !lease.is_expired(now)
    }
}

impl From<&Lease> for LeaseToken {
    fn from(lease: &Lease) -> Self {
        Self {
            owner: lease.owner,
            epoch: lease.epoch,
        }
    }
}
