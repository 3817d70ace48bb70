//! Shared daemon state.
//!
//! One [`DaemonStateHandle`] is shared between the socket server, every
//! connection task and the scheduler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use sls_core::config::{ConfigStore, SharedConfig};
use sls_core::data::DataSection;
use sls_core::log::{DEFAULT_LEVEL, LogControl, LogError, filter_for};
use sls_core::runner::SubmitSummary;
use sls_core::util::epoch_secs;
use sls_core::{Registry, Runner, Services};
use tokio::sync::{Notify, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Shared daemon state.
pub type SharedState = Arc<DaemonStateHandle>;

/// Data module holding the scheduler's bookkeeping.
pub const DAEMON_MODULE: &str = "daemon";

/// Outcome of a requested cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The cycle ran.
    Ran(SubmitSummary),
    /// `sls.enable` is off.
    Disabled,
    /// Submission is inhibited.
    Inhibited,
    /// Shutdown was requested before the cycle finished.
    Cancelled,
}

/// Handle to daemon state with interior mutability.
pub struct DaemonStateHandle {
    runner: Runner,
    log: Option<LogControl>,
    /// Level reported when no subscriber is attached.
    fallback_level: Mutex<String>,
    /// Transient; never written to the configuration.
    inhibited: AtomicBool,
    /// Serializes collect/submit cycles.
    cycle: tokio::sync::Mutex<()>,
    /// Cycles started by non-waiting triggers.
    tasks: Mutex<JoinSet<()>>,
    /// Wakes the scheduler so it re-anchors its timer.
    reanchor: Notify,
    shutdown: watch::Sender<bool>,
    started_at: Instant,
}

impl std::fmt::Debug for DaemonStateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonStateHandle")
            .field("registry", self.runner.registry())
            .field("shutdown", &self.is_shutdown_requested())
            .finish_non_exhaustive()
    }
}

impl DaemonStateHandle {
    /// Creates the state around `runner`.
    ///
    /// `log` is `None` when the caller did not install a subscriber (tests).
    #[must_use]
    pub fn new(runner: Runner, log: Option<LogControl>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            runner,
            log,
            fallback_level: Mutex::new(DEFAULT_LEVEL.to_string()),
            inhibited: AtomicBool::new(false),
            cycle: tokio::sync::Mutex::new(()),
            tasks: Mutex::new(JoinSet::new()),
            reanchor: Notify::new(),
            shutdown,
            started_at: Instant::now(),
        }
    }

    /// Wraps the state for sharing.
    #[must_use]
    pub fn into_shared(self) -> SharedState {
        Arc::new(self)
    }

    /// The runner.
    #[must_use]
    pub const fn runner(&self) -> &Runner {
        &self.runner
    }

    /// Shared services.
    #[must_use]
    pub const fn services(&self) -> &Services {
        self.runner.services()
    }

    /// The helper registry.
    #[must_use]
    pub const fn registry(&self) -> &Registry {
        self.runner.registry()
    }

    /// Shared configuration.
    #[must_use]
    pub const fn config(&self) -> &SharedConfig {
        &self.runner.services().config
    }

    /// Runs `f` with the configuration locked.
    pub fn with_config<T>(&self, f: impl FnOnce(&mut ConfigStore) -> T) -> T {
        let mut config = self.config().lock().expect("config lock poisoned");
        f(&mut config)
    }

    /// Scheduler bookkeeping section.
    #[must_use]
    pub fn daemon_data(&self) -> DataSection {
        DataSection::new(self.services().data.clone(), DAEMON_MODULE)
    }

    /// `sls.enable`.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.with_config(|c| c.get_bool("sls", "enable", false))
    }

    /// Whether submission is inhibited.
    #[must_use]
    pub fn is_inhibited(&self) -> bool {
        self.inhibited.load(Ordering::SeqCst)
    }

    /// Sets the inhibit flag. It lasts until the daemon exits.
    pub fn set_inhibited(&self, inhibited: bool) {
        self.inhibited.store(inhibited, Ordering::SeqCst);
    }

    /// Current logging level name.
    #[must_use]
    pub fn log_level(&self) -> String {
        self.log.as_ref().map_or_else(
            || {
                self.fallback_level
                    .lock()
                    .expect("log level lock poisoned")
                    .clone()
            },
            LogControl::level,
        )
    }

    /// Changes the logging level.
    pub fn set_log_level(&self, level: &str) -> Result<(), LogError> {
        if filter_for(level).is_none() {
            return Err(LogError::InvalidLevel(level.to_string()));
        }
        if let Some(log) = &self.log {
            log.set_level(level)?;
        } else {
            *self.fallback_level.lock().expect("log level lock poisoned") =
                level.to_ascii_uppercase();
        }
        info!(level, "log level changed");
        Ok(())
    }

    /// Runs one collect/submit cycle unless disabled or inhibited.
    ///
    /// Cycles never overlap; a second request waits for the first. On
    /// completion `daemon.last_trigger` is persisted. A shutdown request
    /// abandons the cycle wherever it is.
    pub async fn run_cycle(&self) -> CycleOutcome {
        if self.is_shutdown_requested() {
            return CycleOutcome::Cancelled;
        }
        if self.is_inhibited() {
            info!("submission inhibited, skipping cycle");
            return CycleOutcome::Inhibited;
        }
        if !self.is_enabled() {
            info!("submission disabled, skipping cycle");
            return CycleOutcome::Disabled;
        }
        let _guard = tokio::select! {
            guard = self.cycle.lock() => guard,
            () = self.shutdown_requested() => return CycleOutcome::Cancelled,
        };
        let summary = tokio::select! {
            summary = self.runner.trigger() => summary,
            () = self.shutdown_requested() => {
                info!("shutdown requested, abandoning cycle");
                return CycleOutcome::Cancelled;
            },
        };

        let data = self.daemon_data();
        data.set("last_trigger", epoch_secs());
        data.write();
        CycleOutcome::Ran(summary)
    }

    /// Runs a cycle in the background, re-anchoring the scheduler if it ran.
    pub fn spawn_cycle(self: &Arc<Self>) {
        let state = Arc::clone(self);
        let mut tasks = self.tasks.lock().expect("task set lock poisoned");
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            if let CycleOutcome::Ran(summary) = state.run_cycle().await {
                state.reanchor();
                debug!(?summary, "triggered cycle finished");
            }
        });
    }

    /// Aborts every background cycle still running.
    pub fn abort_cycles(&self) {
        let mut tasks = self.tasks.lock().expect("task set lock poisoned");
        if !tasks.is_empty() {
            debug!(running = tasks.len(), "aborting background cycles");
        }
        tasks.abort_all();
    }

    /// Asks the scheduler to restart its interval from now.
    pub fn reanchor(&self) {
        self.reanchor.notify_one();
    }

    /// Resolves when [`reanchor`](Self::reanchor) is called.
    pub async fn reanchored(&self) {
        self.reanchor.notified().await;
    }

    /// Check if shutdown has been requested.
    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Request shutdown.
    pub fn request_shutdown(&self) {
        if !self.shutdown.send_replace(true) {
            info!("shutdown requested");
        }
    }

    /// Resolves once shutdown has been requested.
    pub async fn shutdown_requested(&self) {
        let mut rx = self.shutdown.subscribe();
        if rx.wait_for(|requested| *requested).await.is_err() {
            warn!("shutdown channel closed");
        }
    }

    /// Flushes persistent state.
    pub fn flush(&self) {
        self.services()
            .data
            .lock()
            .expect("data lock poisoned")
            .write_all();
    }

    /// Seconds since the state was created.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::time::Duration;

    use sls_core::config::ConfigStore;
    use sls_core::data::DataStore;
    use sls_core::process::ProcTree;
    use sls_core::remote::{NetworkProbe, http_client};
    use sls_core::staging::Staging;

    use super::*;

    /// State rooted in a temporary directory, offline.
    pub struct Fixture {
        pub dir: tempfile::TempDir,
        pub state: SharedState,
    }

    impl Fixture {
        pub fn new() -> Self {
            Self::with_probe(NetworkProbe {
                attempts: 0,
                ..NetworkProbe::default()
            })
        }

        pub fn with_probe(probe: NetworkProbe) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let config =
                ConfigStore::from_paths(None, None, Some(&dir.path().join("local.toml"))).into_shared();
            {
                let mut config = config.lock().unwrap();
                // Keep host probes out of test cycles.
                config.set_bool("helpers.journal", "collect", false);
                config.set_bool("helpers.sysinfo", "collect", false);
            }
            let staging = Staging::new(dir.path().join("base"));
            let data = DataStore::new(staging.data_dir()).into_shared();
            let services = Services {
                config,
                data,
                staging,
                http: http_client(Duration::from_secs(1)).unwrap(),
                probe,
                proc: ProcTree::new(dir.path().join("proc")),
                sysfs: dir.path().join("sys"),
            };
            let runner = Runner::new(services, Registry::default());
            let state = DaemonStateHandle::new(runner, None).into_shared();
            Self { dir, state }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sls_core::remote::NetworkProbe;

    use super::testing::Fixture;
    use super::*;

    #[tokio::test]
    async fn cycle_gating() {
        let fixture = Fixture::new();
        let state = &fixture.state;
        assert_eq!(state.run_cycle().await, CycleOutcome::Disabled);

        state.with_config(|c| c.set_bool("sls", "enable", true));
        state.set_inhibited(true);
        assert_eq!(state.run_cycle().await, CycleOutcome::Inhibited);
        assert!(state.daemon_data().get_f64("last_trigger").is_none());

        state.set_inhibited(false);
        let CycleOutcome::Ran(summary) = state.run_cycle().await else {
            panic!("cycle did not run");
        };
        assert!(summary.offline);
        assert!(state.daemon_data().get_f64("last_trigger").is_some());
    }

    #[test]
    fn log_level_without_subscriber() {
        let fixture = Fixture::new();
        let state = &fixture.state;
        assert_eq!(state.log_level(), "INFO");
        state.set_log_level("warning").unwrap();
        assert_eq!(state.log_level(), "WARNING");
        assert!(state.set_log_level("LOUD").is_err());
        assert_eq!(state.log_level(), "WARNING");
    }

    #[tokio::test]
    async fn shutdown_wakes_waiters() {
        let fixture = Fixture::new();
        let state = Arc::clone(&fixture.state);
        let waiter = tokio::spawn(async move { state.shutdown_requested().await });
        fixture.state.request_shutdown();
        waiter.await.unwrap();
        assert!(fixture.state.is_shutdown_requested());
    }

    /// Offline probe that keeps a cycle busy for tens of seconds.
    fn slow_fixture() -> Fixture {
        let fixture = Fixture::with_probe(NetworkProbe {
            url: String::from("http://127.0.0.1:1/204"),
            attempts: 3,
            pause: Duration::from_secs(10),
            timeout: Duration::from_secs(1),
        });
        fixture
            .state
            .with_config(|c| c.set_bool("sls", "enable", true));
        fixture
    }

    #[tokio::test]
    async fn shutdown_abandons_running_cycle() {
        let fixture = slow_fixture();
        let state = Arc::clone(&fixture.state);
        let cycle = tokio::spawn(async move { state.run_cycle().await });

        tokio::time::sleep(Duration::from_millis(200)).await;
        fixture.state.request_shutdown();
        let outcome = tokio::time::timeout(Duration::from_secs(2), cycle)
            .await
            .expect("cycle kept running after shutdown")
            .unwrap();
        assert_eq!(outcome, CycleOutcome::Cancelled);
        assert!(fixture.state.daemon_data().get_f64("last_trigger").is_none());
        assert_eq!(fixture.state.run_cycle().await, CycleOutcome::Cancelled);
    }

    #[tokio::test]
    async fn background_cycles_are_aborted() {
        let fixture = slow_fixture();
        fixture.state.spawn_cycle();
        tokio::time::sleep(Duration::from_millis(200)).await;
        fixture.state.abort_cycles();

        let mut tasks = std::mem::take(&mut *fixture.state.tasks.lock().unwrap());
        let joined = tokio::time::timeout(Duration::from_secs(2), tasks.join_next())
            .await
            .expect("background cycle was not aborted")
            .unwrap();
        assert!(joined.unwrap_err().is_cancelled());
    }
}
