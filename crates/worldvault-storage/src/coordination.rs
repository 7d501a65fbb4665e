//! Coordination store backend (Redis)
//!
//! Keys, all under the configured prefix:
//!
//! ```text
//! <prefix>:data:<name>    world blob (string)
//! <prefix>:lease:<name>   lease record (hash: owner, epoch, expires_at)
//! <prefix>:worlds         set of stored world names
//! <prefix>:epoch          last allocated lease epoch (INCR counter)
//! ```
//!
//! Conditional operations are Lua scripts, which Redis runs atomically.

use crate::backend::{StorageBackend, blocking};
use crate::pool::Pool;
use async_trait::async_trait;
use redis::{Commands, Connection, RedisResult, Script};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::info;
use worldvault_common::config::{BackendKind, CoordinationConfig};
use worldvault_common::{Error, InstanceId, Lease, LeaseToken, Result, Timestamp, WorldName};

/// ARGV: has_expected, expected owner, epoch, expires_at, new owner, epoch, expires_at
static SWAP_LEASE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local cur = redis.call('HMGET', KEYS[1], 'owner', 'epoch', 'expires_at')
if ARGV[1] == '0' then
    if cur[1] then return 0 end
elseif (not cur[1]) or cur[1] ~= ARGV[2] or cur[2] ~= ARGV[3] or cur[3] ~= ARGV[4] then
    return 0
end
redis.call('HSET', KEYS[1], 'owner', ARGV[5], 'epoch', ARGV[6], 'expires_at', ARGV[7])
return 1
",
    )
});

/// ARGV: owner, epoch, expires_at
static DELETE_LEASE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local cur = redis.call('HMGET', KEYS[1], 'owner', 'epoch', 'expires_at')
if (not cur[1]) or cur[1] ~= ARGV[1] or cur[2] ~= ARGV[2] or cur[3] ~= ARGV[3] then
    return 0
end
redis.call('DEL', KEYS[1])
return 1
",
    )
});

/// KEYS: lease, data, index. ARGV: owner, epoch, now, blob, name
static WRITE_IF_LEASE_VALID: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local cur = redis.call('HMGET', KEYS[1], 'owner', 'epoch', 'expires_at')
if (not cur[1]) or cur[1] ~= ARGV[1] or cur[2] ~= ARGV[2]
    or tonumber(cur[3]) <= tonumber(ARGV[3]) then
    return 0
end
redis.call('SET', KEYS[2], ARGV[4])
redis.call('SADD', KEYS[3], ARGV[5])
return 1
",
    )
});

/// Key layout under one prefix
#[derive(Clone, Debug)]
struct KeySpace {
    prefix: String,
}

impl KeySpace {
    fn data(&self, name: &WorldName) -> String {
        format!("{}:data:{name}", self.prefix)
    }

    fn lease(&self, name: &WorldName) -> String {
        format!("{}:lease:{name}", self.prefix)
    }

    fn index(&self) -> String {
        format!("{}:worlds", self.prefix)
    }

    fn epoch(&self) -> String {
        format!("{}:epoch", self.prefix)
    }

    fn lease_pattern(&self) -> String {
        format!("{}:lease:*", self.prefix)
    }

    fn name_from_lease_key(&self, key: &str) -> Option<WorldName> {
        let rest = key.strip_prefix(&self.prefix)?.strip_prefix(":lease:")?;
        WorldName::new(rest).ok()
    }
}

/// Backend over a Redis server
#[derive(Clone)]
pub struct CoordinationBackend {
    inner: Arc<CoordinationStore>,
}

impl CoordinationBackend {
    /// Connect to the configured server
    ///
    /// One connection is opened and pinged up front so a bad URI or an
    /// unreachable server fails here rather than on first use.
    pub fn open(config: &CoordinationConfig) -> Result<Self> {
        let client = redis::Client::open(config.uri.as_str())
            .map_err(|e| Error::Configuration(format!("invalid coordination uri: {e}")))?;
        let connect_timeout = Duration::from_millis(config.connect_timeout_ms);
        let pool = Pool::new(
            "redis",
            config.pool_size,
            Duration::from_millis(config.checkout_timeout_ms),
            move || {
                client
                    .get_connection_with_timeout(connect_timeout)
                    .map_err(|e| Error::backend(format!("redis connect failed: {e}")))
            },
        )?;
        let store = CoordinationStore {
            pool,
            keys: KeySpace {
                prefix: config.key_prefix.clone(),
            },
        };
        store.with_conn(|conn| redis::cmd("PING").query::<String>(conn))?;
        info!(
            "Coordination backend at {} (prefix {:?}, pool of {})",
            config.uri, config.key_prefix, config.pool_size
        );
        Ok(Self {
            inner: Arc::new(store),
        })
    }
}

struct CoordinationStore {
    pool: Pool<Connection>,
    keys: KeySpace,
}

impl CoordinationStore {
    /// Run `f` on a pooled connection, dropping the connection if it broke
    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> RedisResult<T>) -> Result<T> {
        let mut conn = self.pool.get()?;
        match f(&mut *conn) {
            Ok(v) => Ok(v),
            Err(e) => {
                if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
                    conn.discard();
                }
                Err(Error::backend(format!("redis: {e}")))
            }
        }
    }

    fn exists(&self, name: &WorldName) -> Result<bool> {
        let key = self.keys.data(name);
        self.with_conn(|conn| conn.exists(&key))
    }

    fn read(&self, name: &WorldName) -> Result<Vec<u8>> {
        let key = self.keys.data(name);
        let blob: Option<Vec<u8>> = self.with_conn(|conn| conn.get(&key))?;
        blob.ok_or_else(|| Error::NotFound(name.to_string()))
    }

    fn write(&self, name: &WorldName, blob: &[u8]) -> Result<()> {
        let (data, index) = (self.keys.data(name), self.keys.index());
        self.with_conn(|conn| {
            redis::pipe()
                .atomic()
                .set(&data, blob)
                .ignore()
                .sadd(&index, name.as_str())
                .ignore()
                .query(conn)
        })
    }

    fn delete(&self, name: &WorldName) -> Result<()> {
        let (data, lease, index) = (self.keys.data(name), self.keys.lease(name), self.keys.index());
        let (removed, _, _): (u64, u64, u64) = self.with_conn(|conn| {
            redis::pipe()
                .atomic()
                .del(&data)
                .del(&lease)
                .srem(&index, name.as_str())
                .query(conn)
        })?;
        if removed == 0 {
            return Err(Error::NotFound(name.to_string()));
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<WorldName>> {
        let index = self.keys.index();
        let names: Vec<String> = self.with_conn(|conn| conn.smembers(&index))?;
        Ok(names
            .into_iter()
            .filter_map(|n| WorldName::new(n).ok())
            .collect())
    }

    fn read_lease(&self, name: &WorldName) -> Result<Option<Lease>> {
        let key = self.keys.lease(name);
        let (owner, epoch, expires_at): (Option<String>, Option<u64>, Option<u64>) = self
            .with_conn(|conn| {
                redis::cmd("HMGET")
                    .arg(&key)
                    .arg("owner")
                    .arg("epoch")
                    .arg("expires_at")
                    .query(conn)
            })?;
        let (Some(owner), Some(epoch), Some(expires_at)) = (owner, epoch, expires_at) else {
            return Ok(None);
        };
        let owner: InstanceId = owner
            .parse()
            .map_err(|e| Error::serialization(format!("invalid lease owner for {name}: {e}")))?;
        Ok(Some(Lease::new(owner, epoch, Timestamp::from_millis(expires_at))))
    }

    fn swap_lease(&self, name: &WorldName, expected: Option<Lease>, new: Lease) -> Result<bool> {
        let key = self.keys.lease(name);
        let mut invocation = SWAP_LEASE.key(&key);
        match expected {
            Some(lease) => invocation
                .arg("1")
                .arg(lease.owner.to_string())
                .arg(lease.epoch)
                .arg(lease.expires_at.as_millis()),
            None => invocation.arg("0").arg("").arg("").arg(""),
        };
        invocation
            .arg(new.owner.to_string())
            .arg(new.epoch)
            .arg(new.expires_at.as_millis());
        let swapped: i64 = self.with_conn(|conn| invocation.invoke(conn))?;
        Ok(swapped == 1)
    }

    fn delete_lease(&self, name: &WorldName, expected: Lease) -> Result<bool> {
        let key = self.keys.lease(name);
        let deleted: i64 = self.with_conn(|conn| {
            DELETE_LEASE
                .key(&key)
                .arg(expected.owner.to_string())
                .arg(expected.epoch)
                .arg(expected.expires_at.as_millis())
                .invoke(conn)
        })?;
        Ok(deleted == 1)
    }

    fn list_leases(&self) -> Result<Vec<WorldName>> {
        let pattern = self.keys.lease_pattern();
        let keys: Vec<String> =
            self.with_conn(|conn| Ok(conn.scan_match::<_, String>(&pattern)?.collect()))?;
        Ok(keys
            .iter()
            .filter_map(|k| self.keys.name_from_lease_key(k))
            .collect())
    }

    fn next_epoch(&self) -> Result<u64> {
        let key = self.keys.epoch();
        self.with_conn(|conn| conn.incr(&key, 1u64))
    }

    fn write_if_lease_valid(
        &self,
        name: &WorldName,
        token: LeaseToken,
        now: Timestamp,
        blob: &[u8],
    ) -> Result<()> {
        let written: i64 = self.with_conn(|conn| {
            WRITE_IF_LEASE_VALID
                .key(self.keys.lease(name))
                .key(self.keys.data(name))
                .key(self.keys.index())
                .arg(token.owner.to_string())
                .arg(token.epoch)
                .arg(now.as_millis())
                .arg(blob)
                .arg(name.as_str())
                .invoke(conn)
        })?;
        if written == 1 {
            Ok(())
        } else {
            Err(Error::LeaseLost {
                world: name.to_string(),
            })
        }
    }
}

#[async_trait]
impl StorageBackend for CoordinationBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Coordination
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
        blocking(move || inner.list()).await
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
        blocking(move || inner.list_leases()).await
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
