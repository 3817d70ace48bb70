//! Collect and submit cycles over every registered helper.
//!
//! Both phases walk the registry in order and never let one helper's
//! failure affect another. Each helper's category is guarded by its
//! lockfile, taken without retry: a contended category is simply skipped
//! for this cycle.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::helpers::{Helper, HelperContext, HelperResult, Registry, Services, filter_log};
use crate::lockfile::{LockError, Lockfile};
use crate::util::epoch_secs;

/// Per-cycle submission counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitSummary {
    /// Artifacts moved to `uploaded/`.
    pub uploaded: usize,
    /// Artifacts moved to `failed/`.
    pub failed: usize,
    /// Artifacts left in `pending/`.
    pub deferred: usize,
    /// Helpers skipped because their lock was held.
    pub contended: usize,
    /// The phase was abandoned because the network probe failed.
    pub offline: bool,
}

impl SubmitSummary {
    fn record(&mut self, result: HelperResult) {
        match result {
            HelperResult::Ok => self.uploaded += 1,
            HelperResult::PermanentError => self.failed += 1,
            HelperResult::TransientError | HelperResult::ClassError => self.deferred += 1,
        }
    }
}

/// Drives helpers through collect and submit phases.
#[derive(Debug, Clone)]
pub struct Runner {
    services: Services,
    registry: Registry,
}

impl Runner {
    /// Creates a runner over `registry`.
    #[must_use]
    pub const fn new(services: Services, registry: Registry) -> Self {
        Self { services, registry }
    }

    /// Shared services.
    #[must_use]
    pub const fn services(&self) -> &Services {
        &self.services
    }

    /// Helper registry.
    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    fn lock_category(&self, name: &str) -> Result<Lockfile, LockError> {
        if let Err(e) = self.services.staging.ensure_category(name, None) {
            warn!(helper = name, "cannot create staging directories: {e}");
        }
        Lockfile::acquire(self.services.staging.lock_path(name))
    }

    /// Runs the collect phase.
    ///
    /// Returns the names of helpers that staged something.
    pub async fn collect(&self) -> Vec<&'static str> {
        let mut collected = Vec::new();
        for helper in self.registry.iter() {
            let name = helper.name();
            let ctx = self.services.context(name);
            if !ctx.config.get_bool("enable", true) || !ctx.config.get_bool("collect", true) {
                debug!(helper = name, "collection disabled");
                continue;
            }
            if !helper.has_collector() {
                continue;
            }
            if helper.runner_paced() && !interval_elapsed(&ctx) {
                debug!(helper = name, "collection interval not yet elapsed");
                continue;
            }
            let _lock = match self.lock_category(name) {
                Ok(lock) => lock,
                Err(e) if e.is_held() => {
                    info!(helper = name, "category locked, skipping collection");
                    continue;
                },
                Err(e) => {
                    warn!(helper = name, "cannot lock category: {e}");
                    continue;
                },
            };
            match helper.collect(&ctx).await {
                Ok(staged) => {
                    if helper.runner_paced() {
                        ctx.data.set("timestamp", epoch_secs());
                        ctx.data.write();
                    }
                    if staged {
                        info!(helper = name, "new artifacts collected");
                        collected.push(name);
                    }
                },
                Err(e) => error!(helper = name, "collection failed: {e}"),
            }
        }
        collected
    }

    /// Runs the submit phase.
    pub async fn submit(&self) -> SubmitSummary {
        let mut summary = SubmitSummary::default();
        if !self.services.probe.check(&self.services.http).await {
            info!("offline, skipping submission");
            summary.offline = true;
            return summary;
        }
        for helper in self.registry.iter() {
            let name = helper.name();
            let ctx = self.services.context(name);
            if !ctx.config.get_bool("enable", true) || !ctx.config.get_bool("submit", true) {
                debug!(helper = name, "submission disabled");
                continue;
            }
            let pending = match self.services.staging.list_pending(name) {
                Ok(pending) => pending,
                Err(e) => {
                    error!(helper = name, "cannot list pending artifacts: {e}");
                    continue;
                },
            };
            if pending.iter().all(|entry| entry.starts_with('.')) {
                continue;
            }
            let _lock = match self.lock_category(name) {
                Ok(lock) => lock,
                Err(e) if e.is_held() => {
                    info!(helper = name, "category locked, skipping submission");
                    summary.contended += 1;
                    continue;
                },
                Err(e) => {
                    warn!(helper = name, "cannot lock category: {e}");
                    continue;
                },
            };
            submit_category(helper, &ctx, &pending, &mut summary).await;
        }
        info!(
            uploaded = summary.uploaded,
            failed = summary.failed,
            deferred = summary.deferred,
            "submission finished"
        );
        summary
    }

    /// Collect, then submit.
    pub async fn trigger(&self) -> SubmitSummary {
        self.collect().await;
        self.submit().await
    }
}

fn interval_elapsed(ctx: &HelperContext) -> bool {
    let Some(interval) = ctx.config.get_f64("interval") else {
        return true;
    };
    ctx.data
        .get_f64("timestamp")
        .map_or(true, |last| epoch_secs() - last >= interval)
}

async fn submit_category(
    helper: &Arc<dyn Helper>,
    ctx: &HelperContext,
    pending: &[String],
    summary: &mut SubmitSummary,
) {
    let staging = ctx.staging();
    for entry in pending {
        if entry.starts_with('.') {
            continue;
        }
        let result = if filter_log(helper.as_ref(), entry) {
            helper.submit(ctx, &ctx.pending_dir().join(entry)).await
        } else {
            warn!(helper = %ctx.name, entry = %entry, "unexpected file in pending");
            HelperResult::PermanentError
        };
        summary.record(result);
        let moved = match result {
            HelperResult::Ok => staging.mark_uploaded(&ctx.name, entry).map(|_| ()),
            HelperResult::PermanentError => staging.mark_failed(&ctx.name, entry).map(|_| ()),
            HelperResult::TransientError => Ok(()),
            HelperResult::ClassError => {
                info!(helper = %ctx.name, "helper backing off for this cycle");
                break;
            },
        };
        match moved {
            Ok(()) => debug!(helper = %ctx.name, entry = %entry, result = result.as_str(), "artifact processed"),
            Err(e) => error!(helper = %ctx.name, entry = %entry, "cannot move artifact: {e}"),
        }
    }
}
