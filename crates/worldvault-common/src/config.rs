//! Configuration types for WorldVault
//!
//! This module defines the configuration consumed by the storage backends,
//! the compression layer and the lock manager. Every section has a
//! `Default` so a partial TOML file is enough.

use crate::error::{Error, Result};
use crate::types::InstanceId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration for WorldVault
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node configuration
    pub node: NodeConfig,
    /// Storage configuration
    pub storage: StorageConfig,
    /// Compression configuration
    pub compression: CompressionConfig,
    /// Lease configuration
    pub lease: LeaseConfig,
}

impl Config {
    /// Parse a configuration from TOML text and validate it
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        self.lease.validate()?;
        self.compression.validate()?;
        self.storage.validate()
    }
}

/// Node identity configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Fixed instance identifier; a random one is generated when absent
    pub instance_id: Option<InstanceId>,
}

impl NodeConfig {
    /// Configured instance ID, or a fresh random one
    #[must_use]
    pub fn instance_id(&self) -> InstanceId {
        self.instance_id.unwrap_or_default()
    }
}

/// Storage backend selector
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// One file per world in a local directory
    #[default]
    File,
    /// SQL database with pooled connections
    Relational,
    /// Embedded transactional document store, usable by one process only
    Document,
    /// Fast key-value coordination store (Redis)
    Coordination,
    /// Ephemeral in-memory store
    None,
}

impl BackendKind {
    /// Name used in configuration files and logs
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Relational => "relational",
            Self::Document => "document",
            Self::Coordination => "coordination",
            Self::None => "none",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "relational" | "sql" | "sqlite" => Ok(Self::Relational),
            "document" | "redb" => Ok(Self::Document),
            "coordination" | "redis" => Ok(Self::Coordination),
            "none" | "memory" => Ok(Self::None),
            other => Err(Error::Configuration(format!("unknown backend kind: {other}"))),
        }
    }
}

/// Storage configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend holding world blobs
    pub backend: BackendKind,
    /// Backend holding lease records; defaults to `backend`
    pub lock_backend: Option<BackendKind>,
    /// Local file backend settings
    pub file: FileConfig,
    /// Relational backend settings
    pub relational: RelationalConfig,
    /// Document backend settings
    pub document: DocumentConfig,
    /// Coordination store settings
    pub coordination: CoordinationConfig,
}

impl StorageConfig {
    /// Backend used for lease records
    #[must_use]
    pub fn lock_backend(&self) -> BackendKind {
        self.lock_backend.unwrap_or(self.backend)
    }

    fn validate(&self) -> Result<()> {
        if self.relational.pool_size == 0 {
            return Err(Error::Configuration(
                "storage.relational.pool_size must be at least 1".into(),
            ));
        }
        if self.coordination.pool_size == 0 {
            return Err(Error::Configuration(
                "storage.coordination.pool_size must be at least 1".into(),
            ));
        }
        if self.lock_backend() == BackendKind::None && self.backend != BackendKind::None {
            return Err(Error::Configuration(
                "an in-memory lock backend cannot guard a persistent blob backend".into(),
            ));
        }
        if self.lock_backend() == BackendKind::Document && self.backend != BackendKind::Document {
            return Err(Error::Configuration(
                "a document lock backend is single-process and can only guard its own blobs"
                    .into(),
            ));
        }
        Ok(())
    }
}

/// Local file backend configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Directory holding world files
    pub path: PathBuf,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("worlds"),
        }
    }
}

/// Relational backend configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RelationalConfig {
    /// Database file
    pub path: PathBuf,
    /// Maximum number of pooled connections
    pub pool_size: usize,
    /// How long a statement waits on a locked database (milliseconds)
    pub busy_timeout_ms: u64,
    /// How long a caller waits for a free pooled connection (milliseconds)
    pub checkout_timeout_ms: u64,
}

impl Default for RelationalConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("worldvault.sqlite3"),
            pool_size: 4,
            busy_timeout_ms: 5_000,
            checkout_timeout_ms: 10_000,
        }
    }
}

/// Document backend configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentConfig {
    /// Database file
    pub path: PathBuf,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("worldvault.redb"),
        }
    }
}

/// Coordination store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Connection URI
    pub uri: String,
    /// Prefix for every key written by WorldVault
    pub key_prefix: String,
    /// Maximum number of pooled connections
    pub pool_size: usize,
    /// Connect timeout (milliseconds)
    pub connect_timeout_ms: u64,
    /// How long a caller waits for a free pooled connection (milliseconds)
    pub checkout_timeout_ms: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            uri: "redis://127.0.0.1/".to_string(),
            key_prefix: "worldvault".to_string(),
            pool_size: 4,
            connect_timeout_ms: 2_000,
            checkout_timeout_ms: 10_000,
        }
    }
}

/// Compression algorithm selector
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// Store bytes as-is
    None,
    /// Zstandard
    #[default]
    Zstd,
    /// LZ4 block format
    Lz4,
}

/// Compression configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Algorithm used when saving
    pub algorithm: CompressionAlgorithm,
    /// Zstd compression level
    pub level: i32,
}

impl CompressionConfig {
    /// Highest zstd level accepted
    pub const MAX_ZSTD_LEVEL: i32 = 22;

    fn validate(&self) -> Result<()> {
        if self.algorithm == CompressionAlgorithm::Zstd
            && !(1..=Self::MAX_ZSTD_LEVEL).contains(&self.level)
        {
            return Err(Error::Configuration(format!(
                "compression.level must be within 1..={}, got {}",
                Self::MAX_ZSTD_LEVEL,
                self.level
            )));
        }
        Ok(())
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::Zstd,
            level: 3,
        }
    }
}

/// Lease timing configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Lease time-to-live (milliseconds)
    pub ttl_ms: u64,
    /// Renewal interval (milliseconds); must be under half the TTL
    pub renew_interval_ms: u64,
    /// Sweeper interval (milliseconds); 0 disables the sweeper
    pub sweep_interval_ms: u64,
}

impl LeaseConfig {
    /// Lease time-to-live
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Renewal interval
    #[must_use]
    pub const fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.renew_interval_ms)
    }

    /// Sweeper interval, if enabled
    #[must_use]
    pub const fn sweep_interval(&self) -> Option<Duration> {
        if self.sweep_interval_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.sweep_interval_ms))
        }
    }

    fn validate(&self) -> Result<()> {
        if self.ttl_ms == 0 || self.renew_interval_ms == 0 {
            return Err(Error::Configuration(
                "lease.ttl_ms and lease.renew_interval_ms must be positive".into(),
            ));
        }
        if self.renew_interval_ms.saturating_mul(2) >= self.ttl_ms {
            return Err(Error::Configuration(format!(
                "lease.renew_interval_ms ({}) must be under half of lease.ttl_ms ({})",
                self.renew_interval_ms, self.ttl_ms
            )));
        }
        Ok(())
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 60_000,
            renew_interval_ms: 10_000,
            sweep_interval_ms: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.storage.backend, BackendKind::File);
        assert_eq!(config.storage.lock_backend(), BackendKind::File);
        assert_eq!(config.compression.algorithm, CompressionAlgorithm::Zstd);
        assert_eq!(config.lease.ttl(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = Config::from_toml_str(
            r#"
            [storage]
            backend = "relational"
            lock_backend = "coordination"

            [storage.relational]
            path = "/tmp/vault.sqlite3"

            [compression]
            algorithm = "lz4"

            [lease]
            ttl_ms = 30000
            renew_interval_ms = 5000
            "#,
        )
        .unwrap();

        assert_eq!(config.storage.backend, BackendKind::Relational);
        assert_eq!(config.storage.lock_backend(), BackendKind::Coordination);
        assert_eq!(config.storage.relational.path, PathBuf::from("/tmp/vault.sqlite3"));
        assert_eq!(config.storage.relational.pool_size, 4);
        assert_eq!(config.compression.algorithm, CompressionAlgorithm::Lz4);
        assert_eq!(config.lease.renew_interval(), Duration::from_secs(5));
        assert_eq!(config.lease.sweep_interval(), None);
    }

    #[test]
    fn test_renew_interval_must_be_well_under_ttl() {
        let err = Config::from_toml_str(
            r#"
            [lease]
            ttl_ms = 10000
            renew_interval_ms = 5000
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_memory_locks_cannot_guard_persistent_blobs() {
        let mut config = Config::default();
        config.storage.lock_backend = Some(BackendKind::None);
        assert!(config.validate().is_err());

        config.storage.backend = BackendKind::None;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_document_locks_only_guard_document_blobs() {
        let mut config = Config::default();
        config.storage.lock_backend = Some(BackendKind::Document);
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        config.storage.backend = BackendKind::Relational;
        assert!(config.validate().is_err());

        config.storage.backend = BackendKind::Document;
        assert!(config.validate().is_ok());
        config.storage.lock_backend = None;
        assert!(config.validate().is_ok());

        // document blobs may still take their leases from a shared store
        config.storage.lock_backend = Some(BackendKind::Coordination);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backend_kind_from_str() {
        assert_eq!("redis".parse::<BackendKind>().unwrap(), BackendKind::Coordination);
        assert_eq!("Document".parse::<BackendKind>().unwrap(), BackendKind::Document);
        assert!("cassandra".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_zstd_level_range() {
        let mut config = Config::default();
        config.compression.level = 0;
        assert!(config.validate().is_err());
        config.compression.algorithm = CompressionAlgorithm::None;
        assert!(config.validate().is_ok());
    }
}
