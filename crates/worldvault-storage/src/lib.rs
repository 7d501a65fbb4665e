//! WorldVault Storage - Pluggable world persistence
//!
//! This crate implements the storage backends:
//! - Local files with advisory locks and atomic rename
//! - Relational store (SQLite) behind a connection pool
//! - Embedded document store (redb)
//! - Coordination store (Redis) with server-side scripts
//! - In-memory store for ephemeral worlds and tests
//!
//! Every backend stores one opaque blob per world plus the world's lease
//! record, and offers compare-and-swap on that record.

pub mod backend;
pub mod coordination;
pub mod document;
pub mod file;
pub mod memory;
pub mod pool;
pub mod relational;
mod tables;

// Re-exports
pub use backend::{StorageBackend, open_backend};
pub use coordination::CoordinationBackend;
pub use document::DocumentBackend;
pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use pool::{Pool, PooledConnection};
pub use relational::RelationalBackend;
