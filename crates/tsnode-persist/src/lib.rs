//! Lock-guarded JSON documents for tsnode local state.
//!
//! Provides [`FileLock`], an exclusive cross-process lock scoped to a single
//! path, and [`JsonDocument`], a typed JSON file that is only ever replaced
//! atomically (write to a sibling temp file, then rename over the target).
//!
//! A lock for `{path}` lives next to it at `{path}.lock`. Locks are advisory
//! `flock(2)` locks: every tsnode process takes them, nothing else has to.

#![forbid(unsafe_code)]

use nix::fcntl::{Flock, FlockArg};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to lock {}: {source}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("{} is not a valid document: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode {}: {source}", path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl PersistError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub type PersistResult<T> = Result<T, PersistError>;

// ─── FileLock ────────────────────────────────────────────────────────────────

/// Exclusive lock on `{path}.lock`, released when dropped.
///
/// Dropping the guard closes the descriptor, so the lock is released on every
/// exit path including early returns through `?` and unwinding.
pub struct FileLock {
    path: PathBuf,
    _flock: Flock<File>,
}

impl FileLock {
    /// Block until the exclusive lock for `path` is held.
    pub fn acquire(path: &Path) -> PersistResult<Self> {
        let lock_path = lock_path_for(path);
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PersistError::io(parent, e))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| PersistError::io(&lock_path, e))?;

        let flock = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
            PersistError::Lock {
                path: lock_path.clone(),
                source: errno,
            }
        })?;

        trace!(path = %lock_path.display(), "lock acquired");
        Ok(Self {
            path: lock_path,
            _flock: flock,
        })
    }

    /// Path of the lock file itself.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for FileLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLock").field("path", &self.path).finish()
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        trace!(path = %self.path.display(), "lock released");
    }
}

/// `{path}.lock`, keeping the full file name (`state.json` → `state.json.lock`).
pub fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

// ─── JsonDocument ────────────────────────────────────────────────────────────

/// A single JSON document on disk.
///
/// `read`/`write` do no locking of their own; they are meant to run while the
/// caller holds [`JsonDocument::lock`]. `load`, `save`, `update` and `remove`
/// take the lock themselves and perform one complete unit of work under it.
pub struct JsonDocument<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for JsonDocument<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonDocument")
            .field("path", &self.path)
            .finish()
    }
}

impl<T> Clone for JsonDocument<T> {
    fn clone(&self) -> Self {
        Self::new(self.path.clone())
    }
}

impl<T> JsonDocument<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the document's exclusive lock.
    pub fn lock(&self) -> PersistResult<FileLock> {
        FileLock::acquire(&self.path)
    }

    /// Delete the document under its lock. Returns whether a file was removed.
    pub fn remove(&self) -> PersistResult<bool> {
        let _guard = self.lock()?;
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "document removed");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(PersistError::io(&self.path, e)),
        }
    }
}

impl<T: Serialize + DeserializeOwned> JsonDocument<T> {
    /// Read the document without locking.
    ///
    /// A missing or zero-length file reads as `None`; anything else that does
    /// not decode is a [`PersistError::Decode`].
    pub fn read(&self) -> PersistResult<Option<T>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no document yet");
                return Ok(None);
            }
            Err(e) => return Err(PersistError::io(&self.path, e)),
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| PersistError::Decode {
                path: self.path.clone(),
                source,
            })
    }

    /// Replace the document atomically without locking.
    ///
    /// The new content is written to a temp file in the same directory and
    /// renamed over the target, so readers see either the old or the new
    /// document, never a partial one. The file ends up owner-read/write only.
    pub fn write(&self, value: &T) -> PersistResult<()> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent).map_err(|e| PersistError::io(&parent, e))?;

        let content =
            serde_json::to_vec_pretty(value).map_err(|source| PersistError::Encode {
                path: self.path.clone(),
                source,
            })?;

        let mut tmp =
            tempfile::NamedTempFile::new_in(&parent).map_err(|e| PersistError::io(&parent, e))?;
        tmp.write_all(&content)
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| PersistError::io(tmp.path(), e))?;
        tmp.persist(&self.path)
            .map_err(|e| PersistError::io(&self.path, e.error))?;

        debug!(path = %self.path.display(), bytes = content.len(), "document written");
        Ok(())
    }

    /// Locked read.
    pub fn load(&self) -> PersistResult<Option<T>> {
        let _guard = self.lock()?;
        self.read()
    }

    /// Locked write.
    pub fn save(&self, value: &T) -> PersistResult<()> {
        let _guard = self.lock()?;
        self.write(value)
    }

    /// Load, mutate and save as one unit under the document's lock.
    ///
    /// A missing document starts from `T::default()`. Nothing is written when
    /// `f` returns an error.
    pub fn update<R, E>(&self, f: impl FnOnce(&mut T) -> Result<R, E>) -> Result<R, E>
    where
        T: Default,
        E: From<PersistError>,
    {
        let _guard = self.lock()?;
        let mut value = self.read()?.unwrap_or_default();
        let out = f(&mut value)?;
        self.write(&value)?;
        Ok(out)
    }
}
