//! Submission helpers.
//!
//! A helper owns one staging category. It declares which file extensions
//! it accepts, may collect new artifacts on its own, and decides what
//! happens to each pending artifact through [`Helper::submit`]. Helpers
//! that expose extra control methods over the object IPC list them in
//! [`Helper::methods`] and implement [`Helper::call`].
//!
//! The set of helpers is fixed at build time; see [`Registry`].

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

use crate::config::{ConfigSection, SharedConfig};
use crate::data::{DataSection, DataStore, SharedData};
use crate::lockfile::LockError;
use crate::process::ProcTree;
use crate::remote::{DEFAULT_TIMEOUT, NetworkProbe, RemoteError, http_client};
use crate::staging::{DEFAULT_BASE, Staging, StagingError};

pub mod devcoredump;
pub mod gpu;
pub mod journal;
pub mod kdump;
pub mod minidump;
pub mod sysinfo;
pub mod sysreport;
pub mod trace;

/// Outcome of one submission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HelperResult {
    /// Submitted; move to `uploaded/`.
    Ok,
    /// Try again next cycle; leave in `pending/`.
    TransientError,
    /// Will never succeed; move to `failed/`.
    PermanentError,
    /// The whole category should back off; leave in `pending/` and stop
    /// submitting this category for the cycle.
    ClassError,
}

impl HelperResult {
    /// Classifies an HTTP status.
    #[must_use]
    pub fn from_status(status: StatusCode) -> Self {
        if status.is_success() {
            Self::Ok
        } else if status == StatusCode::TOO_MANY_REQUESTS {
            Self::ClassError
        } else if status.is_client_error() {
            Self::PermanentError
        } else {
            Self::TransientError
        }
    }

    /// Classifies a local I/O error.
    ///
    /// Conditions that can clear up on their own (EIO, EAGAIN, ENOSPC,
    /// EBUSY, interrupted or refused connections) are transient. Anything
    /// else means the artifact itself is unusable.
    #[must_use]
    pub fn from_io(e: &io::Error) -> Self {
        if let Some(errno) = e.raw_os_error() {
            if [libc::EIO, libc::EAGAIN, libc::ENOSPC, libc::EBUSY, libc::EINTR].contains(&errno) {
                return Self::TransientError;
            }
        }
        match e.kind() {
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock => Self::TransientError,
            _ => Self::PermanentError,
        }
    }

    /// Lower-case name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::TransientError => "transient",
            Self::PermanentError => "permanent",
            Self::ClassError => "class",
        }
    }
}

impl From<&RemoteError> for HelperResult {
    fn from(e: &RemoteError) -> Self {
        e.classify()
    }
}

/// Errors raised while collecting or serving object methods.
#[derive(Debug, Error)]
pub enum HelperError {
    /// Filesystem error.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Staging error.
    #[error(transparent)]
    Staging(#[from] StagingError),

    /// Lock error.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Remote error.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// An external command failed.
    #[error("command `{command}` failed: {reason}")]
    Command {
        /// Program name.
        command: String,
        /// Failure description.
        reason: String,
    },
}

impl HelperError {
    /// Wraps an I/O error with its path.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failures of an object IPC method.
#[derive(Debug, Error)]
pub enum MethodError {
    /// The helper has no such method.
    #[error("unknown method {0}")]
    UnknownMethod(String),

    /// Arguments missing or of the wrong type.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// A path argument does not exist.
    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    /// The method ran a submission that did not succeed.
    #[error("submission failed ({})", .0.as_str())]
    Submission(HelperResult),

    /// Anything else.
    #[error("{0}")]
    Failed(String),
}

impl From<HelperError> for MethodError {
    fn from(e: HelperError) -> Self {
        match e {
            HelperError::Io { path, source } if source.kind() == io::ErrorKind::NotFound => {
                Self::FileNotFound(path)
            },
            other => Self::Failed(other.to_string()),
        }
    }
}

/// Process-wide resources shared by every helper.
#[derive(Debug, Clone)]
pub struct Services {
    /// Layered configuration.
    pub config: SharedConfig,
    /// Persistent per-module state.
    pub data: SharedData,
    /// Staging hierarchy.
    pub staging: Staging,
    /// HTTP client for remote back-ends.
    pub http: reqwest::Client,
    /// Connectivity probe.
    pub probe: NetworkProbe,
    /// `/proc` view.
    pub proc: ProcTree,
    /// `/sys` root.
    pub sysfs: PathBuf,
}

impl Services {
    /// Services for the system, rooted at `sls.base`.
    pub fn from_config(config: SharedConfig) -> Result<Self, RemoteError> {
        let base = config
            .lock()
            .expect("config lock poisoned")
            .get("sls", "base")
            .map_or_else(|| PathBuf::from(DEFAULT_BASE), PathBuf::from);
        let staging = Staging::new(base);
        let data = DataStore::new(staging.data_dir()).into_shared();
        Ok(Self {
            config,
            data,
            staging,
            http: http_client(DEFAULT_TIMEOUT)?,
            probe: NetworkProbe::default(),
            proc: ProcTree::default(),
            sysfs: PathBuf::from("/sys"),
        })
    }

    /// Context scoped to helper `name`.
    #[must_use]
    pub fn context(&self, name: &str) -> HelperContext {
        let section = format!("helpers.{name}");
        HelperContext {
            name: name.to_string(),
            config: ConfigSection::new(Arc::clone(&self.config), section.clone()),
            data: DataSection::new(Arc::clone(&self.data), section),
            services: self.clone(),
        }
    }
}

/// What a helper sees of the world.
#[derive(Debug, Clone)]
pub struct HelperContext {
    /// Helper (and category) name.
    pub name: String,
    /// `helpers.<name>` configuration.
    pub config: ConfigSection,
    /// `helpers.<name>` persistent data.
    pub data: DataSection,
    /// Shared resources.
    pub services: Services,
}

impl HelperContext {
    /// Staging hierarchy.
    #[must_use]
    pub fn staging(&self) -> &Staging {
        &self.services.staging
    }

    /// HTTP client.
    #[must_use]
    pub fn http(&self) -> &reqwest::Client {
        &self.services.http
    }

    /// `pending/<name>`.
    #[must_use]
    pub fn pending_dir(&self) -> PathBuf {
        self.services.staging.pending(&self.name)
    }

    /// Reads a global configuration key.
    #[must_use]
    pub fn global(&self, section: &str, key: &str) -> Option<String> {
        self.services
            .config
            .lock()
            .expect("config lock poisoned")
            .get(section, key)
    }

    /// The configured DSN, if any.
    #[must_use]
    pub fn dsn(&self) -> Option<String> {
        self.config.get("dsn").filter(|dsn| !dsn.is_empty())
    }
}

/// A submission plugin.
#[async_trait]
pub trait Helper: Send + Sync {
    /// Category name.
    fn name(&self) -> &'static str;

    /// Accepted extensions, with the leading dot. Empty accepts anything.
    fn valid_extensions(&self) -> &'static [&'static str] {
        &[]
    }

    /// Whether [`collect`](Self::collect) does anything.
    fn has_collector(&self) -> bool {
        false
    }

    /// Whether the runner enforces `interval` before collecting.
    fn runner_paced(&self) -> bool {
        true
    }

    /// Produces new artifacts; true iff anything was staged.
    async fn collect(&self, _ctx: &HelperContext) -> Result<bool, HelperError> {
        Ok(false)
    }

    /// Submits one artifact.
    async fn submit(&self, ctx: &HelperContext, path: &Path) -> HelperResult;

    /// Object IPC methods this helper exports.
    fn methods(&self) -> &'static [&'static str] {
        &[]
    }

    /// Invokes an object IPC method.
    async fn call(
        &self,
        _ctx: &HelperContext,
        method: &str,
        _args: &[Value],
    ) -> Result<Value, MethodError> {
        Err(MethodError::UnknownMethod(method.to_string()))
    }
}

/// Whether `filename` should be handed to `helper`.
#[must_use]
pub fn filter_log(helper: &dyn Helper, filename: &str) -> bool {
    extension_allowed(helper.valid_extensions(), filename)
}

/// [`filter_log`] over a bare extension set.
#[must_use]
pub fn extension_allowed(valid: &[&str], filename: &str) -> bool {
    if filename.starts_with('.') {
        return false;
    }
    if valid.is_empty() {
        return true;
    }
    match filename.rfind('.') {
        Some(dot) => valid.contains(&&filename[dot..]),
        None => false,
    }
}

/// The fixed, ordered set of helpers.
#[derive(Clone)]
pub struct Registry {
    helpers: Vec<Arc<dyn Helper>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(vec![
            Arc::new(devcoredump::DevcoredumpHelper),
            Arc::new(gpu::GpuHelper),
            Arc::new(journal::JournalHelper::default()),
            Arc::new(kdump::KdumpHelper),
            Arc::new(minidump::MinidumpHelper::default()),
            Arc::new(sysinfo::SysinfoHelper),
            Arc::new(sysreport::SysreportHelper),
            Arc::new(trace::TraceHelper),
        ])
    }
}

impl Registry {
    /// A registry over an explicit helper list.
    #[must_use]
    pub fn new(helpers: Vec<Arc<dyn Helper>>) -> Self {
        Self { helpers }
    }

    /// Names, in registry order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.helpers.iter().map(|h| h.name()).collect()
    }

    /// Looks a helper up by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Helper>> {
        self.helpers.iter().find(|h| h.name() == name).cloned()
    }

    /// Whether `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.helpers.iter().any(|h| h.name() == name)
    }

    /// Helpers in registry order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Helper>> {
        self.helpers.iter()
    }
}

/// Reads a file for submission, classifying failures.
pub async fn read_artifact(path: &Path) -> Result<Vec<u8>, HelperResult> {
    tokio::fs::read(path).await.map_err(|e| {
        tracing::warn!(path = %path.display(), "cannot read artifact: {e}");
        HelperResult::from_io(&e)
    })
}

/// Parses a JSON artifact, classifying failures.
pub async fn read_json_artifact(path: &Path) -> Result<Value, HelperResult> {
    let bytes = read_artifact(path).await?;
    serde_json::from_slice(&bytes).map_err(|e| {
        tracing::warn!(path = %path.display(), "malformed JSON artifact: {e}");
        HelperResult::PermanentError
    })
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fixtures shared by helper tests.

    use std::time::Duration;

    use super::*;
    use crate::config::ConfigStore;

    /// Services rooted in a temporary directory.
    pub struct Fixture {
        pub dir: tempfile::TempDir,
        pub services: Services,
    }

    impl Fixture {
        pub fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let local = dir.path().join("local.toml");
            let config = ConfigStore::from_paths(None, None, Some(&local)).into_shared();
            let staging = Staging::new(dir.path().join("base"));
            let data = DataStore::new(staging.data_dir()).into_shared();
            let services = Services {
                config,
                data,
                staging,
                http: crate::remote::http_client(Duration::from_secs(5)).unwrap(),
                probe: NetworkProbe::default(),
                proc: ProcTree::new(dir.path().join("proc")),
                sysfs: dir.path().join("sys"),
            };
            Self { dir, services }
        }

        pub fn context(&self, name: &str) -> HelperContext {
            self.services.staging.ensure_category(name, None).unwrap();
            self.services.context(name)
        }

        pub fn set(&self, section: &str, key: &str, value: &str) {
            self.services
                .config
                .lock()
                .unwrap()
                .set(section, key, value);
        }
    }
}
