//! Control socket lifecycle.
//!
//! # Security Considerations
//!
//! - Socket permissions are set after binding
//! - The socket is handed to the service account's group so unprivileged
//!   clients in that group can connect
//! - Stale socket files are removed before binding; anything else at the
//!   path is left alone and binding fails
//! - Parent directories created here get mode 0755; existing ones are not
//!   touched

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sls_core::ipc::default_socket_path;
use sls_core::staging::Owner;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use super::{ProtocolError, ProtocolResult};

/// Maximum concurrent connections.
const MAX_CONNECTIONS: usize = 32;

/// Socket permissions (owner + group read/write).
const SOCKET_MODE: u32 = 0o660;

/// Mode for directories created for the socket.
const DIRECTORY_MODE: u32 = 0o755;

/// Configuration for the socket manager.
#[derive(Debug, Clone)]
pub struct SocketManagerConfig {
    /// Socket path.
    pub socket_path: PathBuf,

    /// Maximum concurrent connections.
    pub max_connections: usize,

    /// Group given access to the socket; `None` leaves the default group.
    pub group: Option<u32>,
}

impl Default for SocketManagerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            max_connections: MAX_CONNECTIONS,
            group: Owner::service_user().map(|owner| owner.gid),
        }
    }
}

impl SocketManagerConfig {
    /// Config for `socket_path` with no group change.
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            max_connections: MAX_CONNECTIONS,
            group: None,
        }
    }

    /// Set the maximum concurrent connections.
    #[must_use]
    pub const fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the socket group.
    #[must_use]
    pub const fn with_group(mut self, gid: u32) -> Self {
        self.group = Some(gid);
        self
    }
}

/// Owns the listening socket.
///
/// Dropping the manager unlinks the socket file.
#[derive(Debug)]
pub struct SocketManager {
    config: SocketManagerConfig,
    listener: UnixListener,
    connection_sem: Arc<Semaphore>,
}

impl SocketManager {
    /// Creates the parent directory if needed, removes a stale socket,
    /// binds, and applies mode and group.
    pub fn bind(config: SocketManagerConfig) -> ProtocolResult<Self> {
        if let Some(parent) = config.socket_path.parent() {
            Self::ensure_directory(parent)?;
        }
        Self::cleanup_socket(&config.socket_path)?;

        let listener = UnixListener::bind(&config.socket_path).map_err(|e| {
            ProtocolError::Io(io::Error::new(
                e.kind(),
                format!(
                    "failed to bind socket to {}: {e}",
                    config.socket_path.display()
                ),
            ))
        })?;
        Self::set_socket_permissions(&config.socket_path, SOCKET_MODE)?;
        if let Some(gid) = config.group {
            if let Err(e) =
                nix::unistd::chown(&config.socket_path, None, Some(nix::unistd::Gid::from_raw(gid)))
            {
                warn!(gid, "failed to set socket group: {e}");
            }
        }

        info!(
            socket = %config.socket_path.display(),
            max_connections = config.max_connections,
            "control socket bound"
        );
        Ok(Self {
            connection_sem: Arc::new(Semaphore::new(config.max_connections)),
            config,
            listener,
        })
    }

    /// Socket path.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    fn ensure_directory(path: &Path) -> ProtocolResult<()> {
        match std::fs::symlink_metadata(path) {
            Ok(metadata) if metadata.is_dir() => Ok(()),
            Ok(_) => Err(ProtocolError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} exists but is not a directory", path.display()),
            ))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                use std::os::unix::fs::DirBuilderExt;
                std::fs::DirBuilder::new()
                    .recursive(true)
                    .mode(DIRECTORY_MODE)
                    .create(path)
                    .map_err(|e| {
                        ProtocolError::Io(io::Error::new(
                            e.kind(),
                            format!("failed to create directory {}: {e}", path.display()),
                        ))
                    })
            },
            Err(e) => Err(ProtocolError::Io(io::Error::new(
                e.kind(),
                format!("failed to stat {}: {e}", path.display()),
            ))),
        }
    }

    fn set_socket_permissions(path: &Path, mode: u32) -> ProtocolResult<()> {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|e| {
            ProtocolError::Io(io::Error::new(
                e.kind(),
                format!(
                    "failed to set socket permissions on {}: {e}",
                    path.display()
                ),
            ))
        })
    }

    /// Remove a stale socket file if it exists.
    fn cleanup_socket(path: &Path) -> ProtocolResult<()> {
        use std::os::unix::fs::FileTypeExt;

        let metadata = match std::fs::symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(ProtocolError::Io(io::Error::new(
                    e.kind(),
                    format!("failed to stat {}: {e}", path.display()),
                )));
            },
        };
        if !metadata.file_type().is_socket() {
            return Err(ProtocolError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("path {} exists but is not a socket", path.display()),
            )));
        }
        std::fs::remove_file(path).map_err(|e| {
            ProtocolError::Io(io::Error::new(
                e.kind(),
                format!("failed to remove stale socket {}: {e}", path.display()),
            ))
        })?;
        debug!(path = %path.display(), "removed stale socket file");
        Ok(())
    }

    /// Waits for a connection slot, then for a connection.
    ///
    /// The permit must be held for as long as the connection is served.
    pub async fn accept(&self) -> ProtocolResult<(UnixStream, OwnedSemaphorePermit)> {
        let permit = self
            .connection_sem
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ProtocolError::Io(io::Error::other("connection semaphore closed")))?;
        let (stream, _addr) = self.listener.accept().await?;
        Ok((stream, permit))
    }
}

impl Drop for SocketManager {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.config.socket_path) {
            Ok(()) => debug!(path = %self.config.socket_path.display(), "socket removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {},
            Err(e) => warn!(path = %self.config.socket_path.display(), "failed to remove socket: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::{FileTypeExt, PermissionsExt};

    use super::*;

    #[tokio::test]
    async fn bind_sets_mode_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("sls.socket");

        let manager = SocketManager::bind(SocketManagerConfig::new(&path)).unwrap();
        let metadata = std::fs::metadata(&path).unwrap();
        assert!(metadata.file_type().is_socket());
        assert_eq!(metadata.permissions().mode() & 0o777, SOCKET_MODE);

        drop(manager);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn stale_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sls.socket");
        let stale = std::os::unix::net::UnixListener::bind(&path).unwrap();
        drop(stale);
        assert!(path.exists());

        let _manager = SocketManager::bind(SocketManagerConfig::new(&path)).unwrap();
        assert!(std::os::unix::net::UnixStream::connect(&path).is_ok());
    }

    #[tokio::test]
    async fn regular_file_is_not_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sls.socket");
        std::fs::write(&path, b"keep").unwrap();

        assert!(SocketManager::bind(SocketManagerConfig::new(&path)).is_err());
        assert_eq!(std::fs::read(&path).unwrap(), b"keep");
    }
}
