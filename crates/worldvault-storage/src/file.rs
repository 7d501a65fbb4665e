//! Local file backend
//!
//! Layout inside the configured directory:
//!
//! ```text
//! <name>.world   blob
//! <name>.lease   lease record (JSON)
//! <name>.lock    advisory lock file, held with flock(2) around every
//!                lease check and blob replacement
//! .epoch         last allocated lease epoch
//! .epoch.lock    advisory lock file for the epoch counter
//! ```
//!
//! Writes go to a hidden temp file that is fsynced, renamed over the target
//! and followed by an fsync of the directory, so a crash leaves either the
//! previous file or the new one.

use crate::backend::{StorageBackend, blocking, check_lease};
use async_trait::async_trait;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;
use worldvault_common::config::{BackendKind, FileConfig};
use worldvault_common::{Error, Lease, LeaseToken, Result, Timestamp, WorldName};

const BLOB_EXT: &str = "world";
const LEASE_EXT: &str = "lease";
const LOCK_EXT: &str = "lock";
const EPOCH_FILE: &str = ".epoch";

/// Backend storing each world as files in one directory
#[derive(Clone)]
pub struct FileBackend {
    inner: Arc<FileStore>,
}

impl FileBackend {
    /// Open the directory, creating it if needed
    pub fn open(config: &FileConfig) -> Result<Self> {
        Self::open_dir(&config.path)
    }

    /// Open a specific directory
    pub fn open_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| io_error("failed to create world directory", &e))?;
        info!("File backend at {}", dir.display());
        Ok(Self {
            inner: Arc::new(FileStore { dir }),
        })
    }

    /// Directory holding the world files
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }
}

struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    fn path(&self, name: &WorldName, ext: &str) -> PathBuf {
        self.dir.join(format!("{name}.{ext}"))
    }

    /// Run `f` while holding the world's advisory lock
    fn locked<T>(&self, name: &WorldName, f: impl FnOnce() -> Result<T>) -> Result<T> {
        with_flock(&self.path(name, LOCK_EXT), f)
    }

    /// Stage `data` in a temp file and rename it over `target`
    fn replace(&self, target: &Path, data: &[u8]) -> Result<()> {
        let file_name = target
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::backend(format!("invalid target path {}", target.display())))?;
        let temp_path = self
            .dir
            .join(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));

        let staged = (|| -> io::Result<()> {
            let mut file = OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)?;
            file.write_all(data)?;
            file.sync_all()
        })();
        if let Err(e) = staged {
            let _ = fs::remove_file(&temp_path);
            return Err(io_error("failed to stage file", &e));
        }

        if let Err(e) = fs::rename(&temp_path, target) {
            let _ = fs::remove_file(&temp_path);
            return Err(io_error("failed to rename staged file", &e));
        }
        self.sync_dir()
    }

    fn sync_dir(&self) -> Result<()> {
        File::open(&self.dir)
            .and_then(|d| d.sync_all())
            .map_err(|e| io_error("failed to sync world directory", &e))
    }

    fn exists(&self, name: &WorldName) -> Result<bool> {
        self.path(name, BLOB_EXT)
            .try_exists()
            .map_err(|e| io_error("failed to stat world", &e))
    }

    fn read(&self, name: &WorldName) -> Result<Vec<u8>> {
        match fs::read(self.path(name, BLOB_EXT)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::NotFound(name.to_string())),
            Err(e) => Err(io_error("failed to read world", &e)),
        }
    }

    fn write(&self, name: &WorldName, blob: &[u8]) -> Result<()> {
        self.locked(name, || self.replace(&self.path(name, BLOB_EXT), blob))
    }

    fn delete(&self, name: &WorldName) -> Result<()> {
        self.locked(name, || {
            match fs::remove_file(self.path(name, BLOB_EXT)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(Error::NotFound(name.to_string()));
                }
                Err(e) => return Err(io_error("failed to delete world", &e)),
            }
            remove_if_exists(&self.path(name, LEASE_EXT))?;
            self.sync_dir()
        })
    }

    fn list(&self, ext: &str) -> Result<Vec<WorldName>> {
        let entries =
            fs::read_dir(&self.dir).map_err(|e| io_error("failed to list world directory", &e))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_error("failed to list world directory", &e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ext) {
                continue;
            }
            // Staged temp files start with '.', which no world name does.
            if let Some(name) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| WorldName::new(s).ok())
            {
                names.push(name);
            }
        }
        Ok(names)
    }

    fn read_lease(&self, name: &WorldName) -> Result<Option<Lease>> {
        let data = match fs::read(self.path(name, LEASE_EXT)) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error("failed to read lease", &e)),
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| Error::serialization(format!("invalid lease record for {name}: {e}")))
    }

    fn write_lease(&self, name: &WorldName, lease: &Lease) -> Result<()> {
        let data = serde_json::to_vec(lease)
            .map_err(|e| Error::serialization(format!("failed to encode lease: {e}")))?;
        self.replace(&self.path(name, LEASE_EXT), &data)
    }

    fn swap_lease(&self, name: &WorldName, expected: Option<Lease>, new: Lease) -> Result<bool> {
        self.locked(name, || {
            if self.read_lease(name)? != expected {
                return Ok(false);
            }
            self.write_lease(name, &new)?;
            Ok(true)
        })
    }

    fn delete_lease(&self, name: &WorldName, expected: Lease) -> Result<bool> {
        self.locked(name, || {
            if self.read_lease(name)? != Some(expected) {
                return Ok(false);
            }
            remove_if_exists(&self.path(name, LEASE_EXT))?;
            self.sync_dir()?;
            Ok(true)
        })
    }

    fn next_epoch(&self) -> Result<u64> {
        let lock = self.dir.join(format!("{EPOCH_FILE}.{LOCK_EXT}"));
        with_flock(&lock, || {
            let path = self.dir.join(EPOCH_FILE);
            let last = match fs::read_to_string(&path) {
                Ok(text) => text.trim().parse::<u64>().map_err(|e| {
                    Error::serialization(format!("invalid epoch counter {text:?}: {e}"))
                })?,
                Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
                Err(e) => return Err(io_error("failed to read epoch counter", &e)),
            };
            let next = last
                .checked_add(1)
                .ok_or_else(|| Error::backend("lease epoch counter exhausted"))?;
            self.replace(&path, next.to_string().as_bytes())?;
            Ok(next)
        })
    }

    fn write_if_lease_valid(
        &self,
        name: &WorldName,
        token: LeaseToken,
        now: Timestamp,
        blob: &[u8],
    ) -> Result<()> {
        self.locked(name, || {
            check_lease(name, self.read_lease(name)?.as_ref(), token, now)?;
            self.replace(&self.path(name, BLOB_EXT), blob)
        })
    }
}

/// Run `f` while holding an exclusive flock on `path`
fn with_flock<T>(path: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .map_err(|e| io_error("failed to open lock file", &e))?;
    let _guard = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
        Error::backend(format!("failed to lock {}: {errno}", path.display()))
    })?;
    f()
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_error("failed to remove file", &e)),
    }
}

fn io_error(context: &str, e: &io::Error) -> Error {
    Error::backend(format!("{context}: {e}"))
}

#[async_trait]
impl StorageBackend for FileBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::File
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
        debug!("Writing {} bytes for world {}", blob.len(), name);
        blocking(move || inner.write(&name, &blob)).await
    }

    async fn delete(&self, name: &WorldName) -> Result<()> {
        let (inner, name) = (Arc::clone(&self.inner), name.clone());
        blocking(move || inner.delete(&name)).await
    }

    async fn list(&self) -> Result<Vec<WorldName>> {
        let inner = Arc::clone(&self.inner);
        blocking(move || inner.list(BLOB_EXT)).await
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
        blocking(move || inner.list(LEASE_EXT)).await
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
