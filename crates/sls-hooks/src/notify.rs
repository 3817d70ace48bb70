//! Best-effort daemon notification after an artifact is staged.

use nix::unistd::{Gid, Uid, geteuid, setgid, setgroups, setuid};
use sls_core::client::Client;
use sls_core::staging::Owner;
use tracing::{debug, info, warn};

/// Permanently switches the process to `owner`.
pub fn drop_privileges(owner: Owner) -> nix::Result<()> {
    let gid = Gid::from_raw(owner.gid);
    setgroups(&[gid])?;
    setgid(gid)?;
    setuid(Uid::from_raw(owner.uid))
}

/// Asks the daemon to run a cycle without waiting for it.
///
/// When running as root the process first becomes the service user; if
/// that is impossible the daemon is not contacted at all.
pub fn notify_daemon() {
    if geteuid().is_root() {
        let Some(owner) = Owner::service_user() else {
            warn!("service user missing, not notifying the daemon");
            return;
        };
        if let Err(e) = drop_privileges(owner) {
            warn!("failed to drop privileges: {e}");
            return;
        }
    }

    match Client::connect_default().and_then(|mut client| client.trigger(false)) {
        Ok(()) => debug!("daemon notified"),
        Err(e) => info!("daemon not notified: {e}"),
    }
}
