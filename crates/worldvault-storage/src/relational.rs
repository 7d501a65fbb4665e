//! Relational backend (SQLite)
//!
//! Connections come from a shared pool and use WAL journaling with a busy
//! timeout. Conditional operations run in `BEGIN IMMEDIATE` transactions,
//! which take the database write lock up front so the check and the write
//! cannot interleave with another writer.

use crate::backend::{StorageBackend, blocking, check_lease};
use crate::pool::Pool;
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use worldvault_common::config::{BackendKind, RelationalConfig};
use worldvault_common::{Error, InstanceId, Lease, LeaseToken, Result, Timestamp, WorldName};

/// Schema version written by this build
pub const SCHEMA_VERSION: u32 = 2;

/// Statements that bring schema version `i` to `i + 1`
const MIGRATIONS: &[&str] = &[
    "CREATE TABLE worlds (
        name       TEXT PRIMARY KEY,
        data       BLOB NOT NULL,
        size       INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );
    CREATE TABLE world_leases (
        name       TEXT PRIMARY KEY,
        owner      TEXT NOT NULL,
        epoch      INTEGER NOT NULL,
        expires_at INTEGER NOT NULL
    );",
    "CREATE TABLE lease_epochs (
        id   INTEGER PRIMARY KEY CHECK (id = 1),
        last INTEGER NOT NULL
    );
    INSERT INTO lease_epochs (id, last)
        SELECT 1, COALESCE(MAX(epoch), 0) FROM world_leases;",
];

/// Backend over a SQLite database
#[derive(Clone)]
pub struct RelationalBackend {
    inner: Arc<RelationalStore>,
}

impl RelationalBackend {
    /// Open the database, creating and migrating the schema as needed
    pub fn open(config: &RelationalConfig) -> Result<Self> {
        let path = config.path.clone();
        let busy_timeout = Duration::from_millis(config.busy_timeout_ms);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::backend(format!("failed to create {}: {e}", parent.display())))?;
        }

        let pool = Pool::new(
            "sqlite",
            config.pool_size,
            Duration::from_millis(config.checkout_timeout_ms),
            move || open_connection(&path, busy_timeout),
        )?;
        {
            let mut conn = pool.get()?;
            migrate(&mut conn)?;
        }
        info!(
            "Relational backend at {} (pool of {})",
            config.path.display(),
            pool.size()
        );
        Ok(Self {
            inner: Arc::new(RelationalStore { pool }),
        })
    }
}

fn open_connection(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path).map_err(db_error)?;
    conn.busy_timeout(busy_timeout).map_err(db_error)?;
    let mode: String = conn
        .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
        .map_err(db_error)?;
    debug!("Opened SQLite connection (journal_mode={mode})");
    Ok(conn)
}

/// Bring the schema up to [`SCHEMA_VERSION`]
fn migrate(conn: &mut Connection) -> Result<()> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(db_error)?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS vault_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);",
    )
    .map_err(db_error)?;
    let stored: Option<String> = tx
        .query_row(
            "SELECT value FROM vault_meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_error)?;
    let current = match stored {
        Some(v) => v
            .parse::<u32>()
            .map_err(|_| Error::serialization(format!("invalid schema version {v:?}")))?,
        None => 0,
    };
    if current > SCHEMA_VERSION {
        return Err(Error::NewerDatabase {
            current: SCHEMA_VERSION,
            database: current,
        });
    }
    for (from, statements) in MIGRATIONS.iter().enumerate().skip(current as usize) {
        info!("Migrating SQLite schema from version {} to {}", from, from + 1);
        tx.execute_batch(statements).map_err(db_error)?;
    }
    tx.execute(
        "INSERT INTO vault_meta (key, value) VALUES ('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![SCHEMA_VERSION.to_string()],
    )
    .map_err(db_error)?;
    tx.commit().map_err(db_error)
}

struct RelationalStore {
    pool: Pool<Connection>,
}

impl RelationalStore {
    fn exists(&self, name: &WorldName) -> Result<bool> {
        let conn = self.pool.get()?;
        conn.query_row(
            "SELECT 1 FROM worlds WHERE name = ?1",
            params![name.as_str()],
            |_| Ok(()),
        )
        .optional()
        .map(|row| row.is_some())
        .map_err(db_error)
    }

    fn read(&self, name: &WorldName) -> Result<Vec<u8>> {
        let conn = self.pool.get()?;
        conn.query_row(
            "SELECT data FROM worlds WHERE name = ?1",
            params![name.as_str()],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_error)?
        .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    fn write(&self, name: &WorldName, blob: &[u8]) -> Result<()> {
        let conn = self.pool.get()?;
        upsert_world(&conn, name, blob)
    }

    fn delete(&self, name: &WorldName) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_error)?;
        let removed = tx
            .execute("DELETE FROM worlds WHERE name = ?1", params![name.as_str()])
            .map_err(db_error)?;
        if removed == 0 {
            return Err(Error::NotFound(name.to_string()));
        }
        tx.execute("DELETE FROM world_leases WHERE name = ?1", params![name.as_str()])
            .map_err(db_error)?;
        tx.commit().map_err(db_error)
    }

    fn list(&self, table: &str) -> Result<Vec<WorldName>> {
        let conn = self.pool.get()?;
        let mut stmt = conn
            .prepare(&format!("SELECT name FROM {table} ORDER BY name"))
            .map_err(db_error)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_error)?;
        let mut names = Vec::new();
        for row in rows {
            names.extend(WorldName::new(row.map_err(db_error)?).ok());
        }
        Ok(names)
    }

    fn read_lease(&self, name: &WorldName) -> Result<Option<Lease>> {
        let conn = self.pool.get()?;
        select_lease(&conn, name)
    }

    fn swap_lease(&self, name: &WorldName, expected: Option<Lease>, new: Lease) -> Result<bool> {
        let mut conn = self.pool.get()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_error)?;
        if select_lease(&tx, name)? != expected {
            return Ok(false);
        }
        tx.execute(
            "INSERT INTO world_leases (name, owner, epoch, expires_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET
                 owner = excluded.owner,
                 epoch = excluded.epoch,
                 expires_at = excluded.expires_at",
            params![
                name.as_str(),
                new.owner.to_string(),
                to_sql(new.epoch)?,
                to_sql(new.expires_at.as_millis())?
            ],
        )
        .map_err(db_error)?;
        tx.commit().map_err(db_error)?;
        Ok(true)
    }

    fn delete_lease(&self, name: &WorldName, expected: Lease) -> Result<bool> {
        let mut conn = self.pool.get()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_error)?;
        if select_lease(&tx, name)? != Some(expected) {
            return Ok(false);
        }
        tx.execute("DELETE FROM world_leases WHERE name = ?1", params![name.as_str()])
            .map_err(db_error)?;
        tx.commit().map_err(db_error)?;
        Ok(true)
    }

    fn next_epoch(&self) -> Result<u64> {
        let mut conn = self.pool.get()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_error)?;
        let last: i64 = tx
            .query_row(
                "UPDATE lease_epochs SET last = last + 1 WHERE id = 1 RETURNING last",
                [],
                |row| row.get(0),
            )
            .map_err(db_error)?;
        tx.commit().map_err(db_error)?;
        from_sql(last)
    }

    fn write_if_lease_valid(
        &self,
        name: &WorldName,
        token: LeaseToken,
        now: Timestamp,
        blob: &[u8],
    ) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_error)?;
        check_lease(name, select_lease(&tx, name)?.as_ref(), token, now)?;
        upsert_world(&tx, name, blob)?;
        tx.commit().map_err(db_error)
    }
}

fn upsert_world(conn: &Connection, name: &WorldName, blob: &[u8]) -> Result<()> {
    conn.execute(
        "INSERT INTO worlds (name, data, size, updated_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(name) DO UPDATE SET
             data = excluded.data,
             size = excluded.size,
             updated_at = excluded.updated_at",
        params![
            name.as_str(),
            blob,
            to_sql(blob.len() as u64)?,
            to_sql(Timestamp::now().as_millis())?
        ],
    )
    .map_err(db_error)?;
    Ok(())
}

fn select_lease(conn: &Connection, name: &WorldName) -> Result<Option<Lease>> {
    let row: Option<(String, i64, i64)> = conn
        .query_row(
            "SELECT owner, epoch, expires_at FROM world_leases WHERE name = ?1",
            params![name.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .map_err(db_error)?;
    let Some((owner, epoch, expires_at)) = row else {
        return Ok(None);
    };
    let owner: InstanceId = owner
        .parse()
        .map_err(|e| Error::serialization(format!("invalid lease owner for {name}: {e}")))?;
    Ok(Some(Lease::new(
        owner,
        from_sql(epoch)?,
        Timestamp::from_millis(from_sql(expires_at)?),
    )))
}

fn to_sql(v: u64) -> Result<i64> {
    i64::try_from(v).map_err(|_| Error::serialization(format!("{v} does not fit in INTEGER")))
}

fn from_sql(v: i64) -> Result<u64> {
    u64::try_from(v).map_err(|_| Error::serialization(format!("negative value {v} in lease record")))
}

fn db_error(e: rusqlite::Error) -> Error {
    Error::backend(format!("sqlite: {e}"))
}

#[async_trait]
impl StorageBackend for RelationalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Relational
    }

    async fn exists(&self, name: &WorldName) -> Result<bool> {
        let (inner, name) = (Arc::clone(&self.inner), name.clone());
        blocking(move || inner.exists(&name)).await
    }

    async fn read(&self, name: &WorldName) -> Result<Vec<u8>> {
        let (inner, name) = (Arc::clone(&self.inner), name.clone());
        blocking(move || inner.read(&name)).await
    }

    async fn write(&self, name: &WorldName, blob: &[u8]) -> Result<()> {
        let (inner, name, blob) = (Arc::clone(&self.inner), name.clone(), blob.to_vec());
        blocking(move || inner.write(&name, &blob)).await
    }

    async fn delete(&self, name: &WorldName) -> Result<()> {
        let (inner, name) = (Arc::clone(&self.inner), name.clone());
        blocking(move || inner.delete(&name)).await
    }

    async fn list(&self) -> Result<Vec<WorldName>> {
        let inner = Arc::clone(&self.inner);
        blocking(move || inner.list("worlds")).await
    }

    async fn read_lease(&self, name: &WorldName) -> Result<Option<Lease>> {
        let (inner, name) = (Arc::clone(&self.inner), name.clone());
        blocking(move || inner.read_lease(&name)).await
    }

    async fn swap_lease(
        &self,
        name: &WorldName,
        expected: Option<Lease>,
        new: Lease,
    ) -> Result<bool> {
        let (inner, name) = (Arc::clone(&self.inner), name.clone());
        blocking(move || inner.swap_lease(&name, expected, new)).await
    }

    async fn delete_lease(&self, name: &WorldName, expected: Lease) -> Result<bool> {
        let (inner, name) = (Arc::clone(&self.inner), name.clone());
        blocking(move || inner.delete_lease(&name, expected)).await
    }

    async fn list_leases(&self) -> Result<Vec<WorldName>> {
        let inner = Arc::clone(&self.inner);
        blocking(move || inner.list("world_leases")).await
    }

    async fn next_epoch(&self) -> Result<u64> {
        let inner = Arc::clone(&self.inner);
        blocking(move || inner.next_epoch()).await
    }

    async fn write_if_lease_valid(
        &self,
        name: &WorldName,
        token: LeaseToken,
        now: Timestamp,
        blob: &[u8],
    ) -> Result<()> {
        let (inner, name, blob) = (Arc::clone(&self.inner), name.clone(), blob.to_vec());
        blocking(move || inner.write_if_lease_valid(&name, token, now, &blob)).await
    }
}
