//! Three-state staging filesystem.
//!
//! Artifacts move through a fixed directory hierarchy rooted at the
//! configured base path:
//!
//! ```text
//! <base>/
//!   pending/<category>/{.lock, .staging-*, <artifact>}
//!   uploaded/<category>/<artifact>
//!   failed/<category>/<artifact>
//!   data/<module>.json
//! ```
//!
//! Writers never create a visible artifact directly. A [`StagingFile`] is
//! written as `.staging-<name>` next to its final location and renamed into
//! place on [`StagingFile::commit`], so any name a reader sees in
//! `pending/<category>` is complete. Dotfiles are never submitted.
//!
//! # Invariants
//!
//! - [INV-ST-001] `pending -> uploaded` and `pending -> failed` are single
//!   `rename()` calls on the same filesystem.
//! - [INV-ST-002] An uncommitted [`StagingFile`] is removed when dropped.

use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::unistd::{Gid, Uid};
use tracing::{debug, warn};

use crate::lockfile::Lockfile;

/// Default staging root.
pub const DEFAULT_BASE: &str = "/var/lib/steamos-log-submitter";

/// Account the daemon runs as; hooks hand artifacts over to it.
pub const SERVICE_USER: &str = "steamos-log-submitter";

/// Mode of every category directory.
const CATEGORY_DIR_MODE: u32 = 0o750;

/// Name of the per-category lock file.
pub const LOCK_NAME: &str = ".lock";

/// Prefix of in-progress artifacts.
pub const STAGING_PREFIX: &str = ".staging-";

/// Staging errors.
#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    /// Filesystem failure.
    #[error("staging I/O error on {}: {source}", path.display())]
    Io {
        /// Path being operated on.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Artifact names must be plain, visible file names.
    #[error("invalid artifact name: {0:?}")]
    InvalidName(String),

    /// Ownership change failed.
    #[error("failed to chown {}: {source}", path.display())]
    Chown {
        /// Path being operated on.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: nix::Error,
    },
}

impl StagingError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Where an artifact currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactState {
    /// Waiting for submission.
    Pending,
    /// Accepted by the remote endpoint.
    Uploaded,
    /// Permanently rejected.
    Failed,
}

impl ArtifactState {
    /// Directory name for this state.
    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploaded => "uploaded",
            Self::Failed => "failed",
        }
    }

    /// All states, in lifecycle order.
    pub const ALL: [Self; 3] = [Self::Pending, Self::Uploaded, Self::Failed];
}

/// Numeric owner applied to staged files and category directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    /// User id.
    pub uid: u32,
    /// Group id.
    pub gid: u32,
}

impl Owner {
    /// Looks up a user account by name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match nix::unistd::User::from_name(name) {
            Ok(Some(user)) => Some(Self {
                uid: user.uid.as_raw(),
                gid: user.gid.as_raw(),
            }),
            Ok(None) => None,
            Err(e) => {
                warn!(user = name, "failed to look up user: {e}");
                None
            },
        }
    }

    /// Looks up a user account by uid.
    #[must_use]
    pub fn from_uid(uid: u32) -> Option<Self> {
        match nix::unistd::User::from_uid(Uid::from_raw(uid)) {
            Ok(Some(user)) => Some(Self {
                uid,
                gid: user.gid.as_raw(),
            }),
            Ok(None) => None,
            Err(e) => {
                warn!(uid, "failed to look up user: {e}");
                None
            },
        }
    }

    /// The service account, if it exists on this system.
    #[must_use]
    pub fn service_user() -> Option<Self> {
        Self::from_name(SERVICE_USER)
    }

    /// Applies this owner to `path`.
    pub fn apply(self, path: &Path) -> Result<(), StagingError> {
        nix::unistd::chown(
            path,
            Some(Uid::from_raw(self.uid)),
            Some(Gid::from_raw(self.gid)),
        )
        .map_err(|source| StagingError::Chown {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Path arithmetic and state transitions for the staging hierarchy.
#[derive(Debug, Clone)]
pub struct Staging {
    base: PathBuf,
}

impl Staging {
    /// Creates a view of the hierarchy rooted at `base`.
    #[must_use]
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Root directory.
    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// `<base>/<state>/<category>`.
    #[must_use]
    pub fn dir(&self, state: ArtifactState, category: &str) -> PathBuf {
        self.base.join(state.dir_name()).join(category)
    }

    /// `<base>/pending/<category>`.
    #[must_use]
    pub fn pending(&self, category: &str) -> PathBuf {
        self.dir(ArtifactState::Pending, category)
    }

    /// `<base>/uploaded/<category>`.
    #[must_use]
    pub fn uploaded(&self, category: &str) -> PathBuf {
        self.dir(ArtifactState::Uploaded, category)
    }

    /// `<base>/failed/<category>`.
    #[must_use]
    pub fn failed(&self, category: &str) -> PathBuf {
        self.dir(ArtifactState::Failed, category)
    }

    /// `<base>/data`.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.base.join("data")
    }

    /// Lock file guarding `category`.
    #[must_use]
    pub fn lock_path(&self, category: &str) -> PathBuf {
        self.pending(category).join(LOCK_NAME)
    }

    /// Unlocked handle on the category lock.
    #[must_use]
    pub fn lockfile(&self, category: &str) -> Lockfile {
        Lockfile::new(self.lock_path(category))
    }

    /// Creates the three state directories of `category`.
    ///
    /// Missing directories are created with mode 0750 and, if `owner` is
    /// given, handed to that owner. Existing directories are left alone.
    pub fn ensure_category(&self, category: &str, owner: Option<Owner>) -> Result<(), StagingError> {
        for state in ArtifactState::ALL {
            let dir = self.dir(state, category);
            if dir.is_dir() {
                continue;
            }
            DirBuilder::new()
                .recursive(true)
                .mode(CATEGORY_DIR_MODE)
                .create(&dir)
                .map_err(|e| StagingError::io(&dir, e))?;
            // The umask may have masked bits off.
            fs::set_permissions(&dir, fs::Permissions::from_mode(CATEGORY_DIR_MODE))
                .map_err(|e| StagingError::io(&dir, e))?;
            if let Some(owner) = owner {
                owner.apply(&dir)?;
            }
            debug!(dir = %dir.display(), "created staging directory");
        }
        Ok(())
    }

    /// Names in `pending/<category>`, sorted, dotfiles included.
    ///
    /// A missing directory is created on demand and yields an empty list.
    /// Entries whose names are not UTF-8 can never be submitted and are
    /// moved to `failed/<category>` instead.
    pub fn list_pending(&self, category: &str) -> Result<Vec<String>, StagingError> {
        let dir = self.pending(category);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.ensure_category(category, None)?;
                return Ok(Vec::new());
            },
            Err(e) => return Err(StagingError::io(&dir, e)),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StagingError::io(&dir, e))?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            } else {
                self.quarantine(category, &entry.path());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Moves a pending entry that cannot be named as a `&str` to `failed/`.
    fn quarantine(&self, category: &str, from: &Path) {
        let Some(name) = from.file_name() else {
            return;
        };
        let dest = self.failed(category).join(name);
        let moved = self
            .ensure_category(category, None)
            .and_then(|()| fs::rename(from, &dest).map_err(|e| StagingError::io(from, e)));
        match moved {
            Ok(()) => warn!(path = %dest.display(), "moved non-UTF-8 file name to failed"),
            Err(e) => warn!(path = %from.display(), "cannot move non-UTF-8 file name: {e}"),
        }
    }

    /// Moves `pending/<category>/<name>` to `uploaded/<category>/<name>`.
    pub fn mark_uploaded(&self, category: &str, name: &str) -> Result<PathBuf, StagingError> {
        self.transition(category, name, ArtifactState::Uploaded)
    }

    /// Moves `pending/<category>/<name>` to `failed/<category>/<name>`.
    pub fn mark_failed(&self, category: &str, name: &str) -> Result<PathBuf, StagingError> {
        self.transition(category, name, ArtifactState::Failed)
    }

    fn transition(
        &self,
        category: &str,
        name: &str,
        to: ArtifactState,
    ) -> Result<PathBuf, StagingError> {
        validate_name(name)?;
        let from = self.pending(category).join(name);
        let dir = self.dir(to, category);
        if !dir.is_dir() {
            self.ensure_category(category, None)?;
        }
        let dest = dir.join(name);
        fs::rename(&from, &dest).map_err(|e| StagingError::io(&from, e))?;
        debug!(from = %from.display(), to = %dest.display(), "artifact transitioned");
        Ok(dest)
    }

    /// Which state directory currently holds `name`, if any.
    #[must_use]
    pub fn state_of(&self, category: &str, name: &str) -> Option<ArtifactState> {
        ArtifactState::ALL
            .into_iter()
            .find(|state| self.dir(*state, category).join(name).exists())
    }
}

fn validate_name(name: &str) -> Result<(), StagingError> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(StagingError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// An artifact being written under a hidden name.
///
/// The file is visible only as `.staging-<name>` until [`commit`] renames
/// it. Dropping an uncommitted file deletes it.
///
/// [`commit`]: StagingFile::commit
#[derive(Debug)]
pub struct StagingFile {
    staging_path: PathBuf,
    final_path: PathBuf,
    file: File,
    committed: bool,
}

impl StagingFile {
    /// Opens `<dir>/.staging-<name>` for writing.
    pub fn create(dir: &Path, name: &str) -> Result<Self, StagingError> {
        validate_name(name)?;
        if name.starts_with('.') {
            return Err(StagingError::InvalidName(name.to_string()));
        }
        let staging_path = dir.join(format!("{STAGING_PREFIX}{name}"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&staging_path)
            .map_err(|e| StagingError::io(&staging_path, e))?;
        Ok(Self {
            staging_path,
            final_path: dir.join(name),
            file,
            committed: false,
        })
    }

    /// Hidden path being written.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.staging_path
    }

    /// Path the artifact will have after commit.
    #[must_use]
    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    /// Underlying file handle.
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// Sets a `user.*` extended attribute on the staged file.
    pub fn set_xattr(&self, key: &str, value: &str) -> Result<(), StagingError> {
        xattr::set(&self.staging_path, key, value.as_bytes())
            .map_err(|e| StagingError::io(&self.staging_path, e))
    }

    /// Hands the staged file to `owner`.
    pub fn chown(&self, owner: Owner) -> Result<(), StagingError> {
        owner.apply(&self.staging_path)
    }

    /// Flushes and renames the file into place.
    pub fn commit(mut self) -> Result<PathBuf, StagingError> {
        self.file
            .flush()
            .and_then(|()| self.file.sync_all())
            .map_err(|e| StagingError::io(&self.staging_path, e))?;
        fs::rename(&self.staging_path, &self.final_path)
            .map_err(|e| StagingError::io(&self.staging_path, e))?;
        self.committed = true;
        Ok(self.final_path.clone())
    }
}

impl Write for StagingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for StagingFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl Drop for StagingFile {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = fs::remove_file(&self.staging_path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %self.staging_path.display(), "failed to remove staging file: {e}");
                }
            }
        }
    }
}

/// Reads a `user.*` extended attribute as UTF-8, if present.
#[must_use]
pub fn get_xattr(path: &Path, key: &str) -> Option<String> {
    match xattr::get(path, key) {
        Ok(Some(value)) => String::from_utf8(value).ok(),
        Ok(None) => None,
        Err(e) => {
            debug!(path = %path.display(), key, "failed to read xattr: {e}");
            None
        },
    }
}
