//! Control socket server.
//!
//! The daemon listens on a single Unix stream socket. Each connection
//! carries line-delimited JSON [`Command`](sls_core::ipc::Command)s and gets
//! one [`Reply`](sls_core::ipc::Reply) line per command, in order.
//!
//! # Modules
//!
//! - [`socket_manager`]: binding, permissions and connection limits
//! - [`connection_handler`]: line framing for one connection
//! - [`dispatch`]: command handlers

pub mod connection_handler;
pub mod dispatch;
pub mod socket_manager;

use std::io;

use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub use self::socket_manager::{SocketManager, SocketManagerConfig};
use crate::state::SharedState;

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Socket I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A request line exceeded the size limit.
    #[error("request of {size} bytes exceeds limit of {limit}")]
    TooLong {
        /// Bytes read before giving up.
        size: usize,
        /// Configured limit.
        limit: usize,
    },
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Accepts connections until shutdown is requested.
///
/// Open connections are dropped without waiting for them once shutdown
/// begins; the socket file is removed when `manager` is dropped.
pub async fn serve(manager: SocketManager, state: SharedState) -> ProtocolResult<()> {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            () = state.shutdown_requested() => break,
            accepted = manager.accept() => {
                let (stream, permit) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("failed to accept connection: {e}");
                        continue;
                    },
                };
                let state = state.clone();
                connections.spawn(async move {
                    if let Err(e) = connection_handler::handle_connection(stream, state).await {
                        debug!("connection closed with error: {e}");
                    }
                    drop(permit);
                });
            },
            Some(done) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = done {
                    warn!("connection task failed: {e}");
                }
            },
        }
    }
    info!(open = connections.len(), "closing control socket");
    connections.abort_all();
    Ok(())
}
