#![allow(clippy::doc_markdown)]

//! sls-daemon - SteamOS log submitter daemon library
//!
//! The daemon owns the configuration and data stores, serves the control
//! socket and runs collect/submit cycles on a timer or on request. It runs
//! on a single-threaded tokio runtime; every connection, the scheduler and
//! triggered cycles are tasks on it.
//!
//! # Modules
//!
//! - [`protocol`]: control socket, framing and command handlers
//! - [`scheduler`]: periodic cycles with startup delay and interval
//! - [`state`]: state shared by all tasks

pub mod protocol;
pub mod scheduler;
pub mod state;

use std::sync::Arc;

use sls_core::Registry;
use sls_core::staging::{Owner, Staging};
use tracing::warn;

/// Creates the staging directories of every helper.
///
/// Failures are logged; the affected helper will retry when it next needs
/// its category.
pub fn prepare_staging(staging: &Staging, registry: &Registry, owner: Option<Owner>) {
    for name in registry.names() {
        if let Err(e) = staging.ensure_category(name, owner) {
            warn!(helper = name, "cannot create staging directories: {e}");
        }
    }
}

/// Runs the socket server and the scheduler until shutdown is requested.
pub async fn run(
    manager: protocol::SocketManager,
    state: state::SharedState,
) -> protocol::ProtocolResult<()> {
    let scheduler = tokio::spawn(scheduler::run(Arc::clone(&state)));
    let served = protocol::serve(manager, Arc::clone(&state)).await;
    state.request_shutdown();
    state.abort_cycles();
    if let Err(e) = scheduler.await {
        warn!("scheduler task failed: {e}");
    }
    state.flush();
    served
}
