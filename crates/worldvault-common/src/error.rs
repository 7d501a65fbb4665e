//! Error types for WorldVault
//!
//! This module defines the common error type used throughout the system.

use crate::types::{ChunkPos, InstanceId, WorldNameError};
use thiserror::Error;

/// Common result type for WorldVault operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for WorldVault
#[derive(Debug, Error)]
pub enum Error {
    // Data integrity errors
    #[error("corrupt chunk{}: {reason}", .pos.map(|p| format!(" at {p}")).unwrap_or_default())]
    CorruptChunk {
        pos: Option<ChunkPos>,
        reason: String,
    },

    #[error("corrupt world: {0}")]
    CorruptWorld(String),

    #[error("corrupt compressed stream: {0}")]
    CorruptStream(String),

    #[error("unsupported format version {version} (supported: {oldest}..={newest})")]
    UnsupportedVersion { version: u8, oldest: u8, newest: u8 },

    #[error("unknown compression tag: {0:#04x}")]
    UnknownCompression(u8),

    #[error("invalid chunk: {0}")]
    InvalidChunk(String),

    // Contention / absence errors
    #[error("world not found: {0}")]
    NotFound(String),

    #[error("world already exists: {0}")]
    WorldAlreadyExists(String),

    #[error("world {world} is locked by {owner}")]
    WorldLocked { world: String, owner: InstanceId },

    #[error("lease lost for world {world}")]
    LeaseLost { world: String },

    #[error("world {0} is open read-only")]
    ReadOnly(String),

    #[error("invalid world name: {0}")]
    InvalidWorldName(#[from] WorldNameError),

    // Backend errors
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("database schema is newer than supported: current {current}, database {database}")]
    NewerDatabase { current: u32, database: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Broad error class used by callers to pick a recovery policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The data itself is damaged or unreadable; never silently recovered
    DataIntegrity,
    /// Expected contention or absence; recoverable by caller policy
    Contention,
    /// Transient I/O or connectivity failure; the caller may retry with backoff
    Transient,
    /// Caller or configuration mistake
    Usage,
}

impl Error {
    /// Create a corrupt chunk error without a known position
    pub fn corrupt_chunk(reason: impl Into<String>) -> Self {
        Self::CorruptChunk {
            pos: None,
            reason: reason.into(),
        }
    }

    /// Create a corrupt world error
    pub fn corrupt_world(reason: impl Into<String>) -> Self {
        Self::CorruptWorld(reason.into())
    }

    /// Create a corrupt stream error
    pub fn corrupt_stream(reason: impl Into<String>) -> Self {
        Self::CorruptStream(reason.into())
    }

    /// Create a backend unavailable error
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::BackendUnavailable(msg.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Attach a chunk position to a corrupt chunk error
    ///
    /// Errors of any other kind are turned into a corrupt chunk error for
    /// that position, since they were raised while decoding it.
    #[must_use]
    pub fn at_chunk(self, pos: ChunkPos) -> Self {
        match self {
            Self::CorruptChunk { reason, .. } => Self::CorruptChunk {
                pos: Some(pos),
                reason,
            },
            other => Self::CorruptChunk {
                pos: Some(pos),
                reason: other.to_string(),
            },
        }
    }

    /// Error class of this error
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::CorruptChunk { .. }
            | Self::CorruptWorld(_)
            | Self::CorruptStream(_)
            | Self::UnsupportedVersion { .. }
            | Self::UnknownCompression(_) => ErrorClass::DataIntegrity,

            Self::NotFound(_)
            | Self::WorldAlreadyExists(_)
            | Self::WorldLocked { .. }
            | Self::LeaseLost { .. } => ErrorClass::Contention,

            Self::BackendUnavailable(_) | Self::Io(_) => ErrorClass::Transient,

            Self::InvalidChunk(_)
            | Self::ReadOnly(_)
            | Self::InvalidWorldName(_)
            | Self::NewerDatabase { .. }
            | Self::Configuration(_)
            | Self::Serialization(_) => ErrorClass::Usage,
        }
    }

    /// Check if this is a retryable error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient)
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this error means the caller no longer owns the world
    #[must_use]
    pub const fn is_lease_lost(&self) -> bool {
        matches!(self, Self::LeaseLost { .. })
    }
}
