//! Redb table definitions for the document backend.

use redb::TableDefinition;

// Key: world name, Value: bincode-encoded WorldDocument
pub const WORLD_DOCUMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("world_documents");
// Key: world name, Value: compressed world blob
pub const WORLD_BLOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("world_blobs");
// Key: counter name, Value: last value handed out
pub const VAULT_COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("vault_counters");
