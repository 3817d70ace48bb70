//! Self-identifying filesystem locks.
//!
//! A lock is a plain file whose content names the descriptor that holds it,
//! in the form `/proc/<pid>/fd/<fd>`. A contender proves the holder is still
//! alive by `stat()`ing both the lock path and that `/proc` symlink: when the
//! inode and device agree, the descriptor is still open on this very file
//! and the lock is live. Anything else (garbage content, an unreadable or
//! dangling symlink, a descriptor now pointing at some other file) is a
//! stale lock left behind by a dead holder and may be claimed.
//!
//! # Invariants
//!
//! - [INV-LK-001] A held [`Lockfile`] owns exactly one open descriptor; a
//!   second [`Lockfile::lock`] on a held lock is a no-op.
//! - [INV-LK-002] Release unlinks the path *before* closing the descriptor,
//!   so a contender never opens a file that is about to vanish.
//! - [INV-LK-003] Empty content is never treated as stale: it is a contender
//!   between `create` and `write`, and the caller observes
//!   [`LockError::LockHeld`] once the read retries are exhausted.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

/// Number of extra reads when a lock file is found empty.
const EMPTY_READ_RETRIES: u32 = 3;

/// Pause between reads of an empty lock file.
const EMPTY_READ_PAUSE: Duration = Duration::from_millis(10);

/// Permissions of a freshly created lock file.
const LOCK_FILE_MODE: u32 = 0o664;

/// Lock errors.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Another live descriptor holds the lock.
    #[error("lock {} is held by another process", .0.display())]
    LockHeld(PathBuf),

    /// `unlock` was called on a lock this handle does not hold.
    #[error("lock {} is not held", .0.display())]
    LockNotHeld(PathBuf),

    /// Unexpected I/O failure.
    #[error("lock I/O error on {}: {source}", path.display())]
    Io {
        /// Lock path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

impl LockError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Returns `true` if the error is contention rather than a failure.
    #[must_use]
    pub const fn is_held(&self) -> bool {
        matches!(self, Self::LockHeld(_))
    }
}

/// Outcome of inspecting an existing lock file.
#[derive(Debug, PartialEq, Eq)]
enum Probe {
    /// The holder's descriptor is still open on this file.
    Live,
    /// Left behind by a dead holder; may be overwritten.
    Stale,
    /// The file disappeared while we looked at it.
    Vanished,
}

/// A filesystem lock scoped to a single path.
///
/// Dropping a held `Lockfile` releases it, which gives the scoped
/// acquisition pattern for free: every early return and every `?` releases
/// the lock.
#[derive(Debug)]
pub struct Lockfile {
    path: PathBuf,
    file: Option<File>,
}

impl Lockfile {
    /// Creates an unlocked handle for `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    /// Creates a handle and locks it without retrying.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        let mut lock = Self::new(path);
        lock.lock()?;
        Ok(lock)
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this handle currently holds the lock.
    #[must_use]
    pub const fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Raw descriptor backing a held lock.
    #[must_use]
    pub fn raw_fd(&self) -> Option<i32> {
        self.file.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Attempts to take the lock once.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::LockHeld`] if a live holder exists, or
    /// [`LockError::Io`] on unexpected filesystem errors.
    pub fn lock(&mut self) -> Result<(), LockError> {
        if self.file.is_some() {
            return Ok(());
        }

        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(LOCK_FILE_MODE)
                .open(&self.path)
            {
                Ok(file) => {
                    self.claim(file)?;
                    return Ok(());
                },
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {},
                Err(e) => return Err(LockError::io(&self.path, e)),
            }

            match self.probe()? {
                Probe::Live => return Err(LockError::LockHeld(self.path.clone())),
                Probe::Vanished => continue,
                Probe::Stale => {},
            }

            debug!(path = %self.path.display(), "reclaiming stale lock");
            let file = match OpenOptions::new()
                .write(true)
                .truncate(true)
                .open(&self.path)
            {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(LockError::io(&self.path, e)),
            };
            self.claim(file)?;

            // Two contenders may both decide the lock is stale. Whoever wrote
            // last owns the content; the other backs off and starts over.
            if self.probe_own()? {
                return Ok(());
            }
            self.file = None;
        }
    }

    /// Releases the lock.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::LockNotHeld`] if the handle does not hold the
    /// lock.
    pub fn unlock(&mut self) -> Result<(), LockError> {
        let Some(file) = self.file.take() else {
            return Err(LockError::LockNotHeld(self.path.clone()));
        };
        let removed = fs::remove_file(&self.path);
        drop(file);
        match removed {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LockError::io(&self.path, e)),
        }
    }

    fn identity(file: &File) -> String {
        format!("/proc/{}/fd/{}", std::process::id(), file.as_raw_fd())
    }

    fn claim(&mut self, mut file: File) -> Result<(), LockError> {
        let identity = Self::identity(&file);
        file.write_all(identity.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|e| LockError::io(&self.path, e))?;
        self.file = Some(file);
        Ok(())
    }

    fn read_content(&self) -> Result<Option<String>, LockError> {
        for attempt in 0..=EMPTY_READ_RETRIES {
            let mut content = Vec::new();
            match File::open(&self.path) {
                Ok(mut file) => {
                    file.read_to_end(&mut content)
                        .map_err(|e| LockError::io(&self.path, e))?;
                },
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(LockError::io(&self.path, e)),
            }
            if !content.is_empty() {
                return Ok(Some(String::from_utf8_lossy(&content).into_owned()));
            }
            if attempt < EMPTY_READ_RETRIES {
                std::thread::sleep(EMPTY_READ_PAUSE);
            }
        }
        Ok(Some(String::new()))
    }

    fn probe(&self) -> Result<Probe, LockError> {
        let Some(content) = self.read_content()? else {
            return Ok(Probe::Vanished);
        };
        if content.is_empty() {
            // A contender is between create and write.
            return Ok(Probe::Live);
        }
        if !content.starts_with("/proc/") || !content.contains("/fd/") {
            warn!(path = %self.path.display(), "lock file has foreign content, treating as stale");
            return Ok(Probe::Stale);
        }

        let ours = match fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Probe::Vanished),
            Err(e) => return Err(LockError::io(&self.path, e)),
        };
        let theirs = match fs::metadata(content.trim_end()) {
            Ok(meta) => meta,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
                ) =>
            {
                return Ok(Probe::Stale);
            },
            Err(e) => return Err(LockError::io(&self.path, e)),
        };

        if ours.ino() == theirs.ino() && ours.dev() == theirs.dev() {
            Ok(Probe::Live)
        } else {
            Ok(Probe::Stale)
        }
    }

    fn probe_own(&self) -> Result<bool, LockError> {
        let Some(file) = self.file.as_ref() else {
            return Ok(false);
        };
        let expected = Self::identity(file);
        Ok(self.read_content()?.is_some_and(|c| c == expected))
    }
}

impl Drop for Lockfile {
    fn drop(&mut self) {
        if self.file.is_some() {
            if let Err(e) = self.unlock() {
                warn!("failed to release lock: {e}");
            }
        }
    }
}

/// Polls a [`Lockfile`] until it is acquired or the attempts run out.
#[derive(Debug)]
pub struct LockRetry {
    lock: Lockfile,
    attempts: u32,
    delay: Duration,
}

impl LockRetry {
    /// Wraps `lock` with a retry budget.
    #[must_use]
    pub const fn new(lock: Lockfile, attempts: u32, delay: Duration) -> Self {
        Self {
            lock,
            attempts,
            delay,
        }
    }

    /// Acquires the lock, sleeping `delay` between attempts.
    ///
    /// # Errors
    ///
    /// Surfaces [`LockError::LockHeld`] only after every attempt failed.
    pub async fn lock(mut self) -> Result<Lockfile, LockError> {
        let attempts = self.attempts.max(1);
        for attempt in 1..=attempts {
            match self.lock.lock() {
                Ok(()) => return Ok(self.lock),
                Err(LockError::LockHeld(path)) if attempt < attempts => {
                    debug!(path = %path.display(), attempt, "lock held, retrying");
                    tokio::time::sleep(self.delay).await;
                },
                Err(e) => return Err(e),
            }
        }
        Err(LockError::LockHeld(self.lock.path.clone()))
    }
}
