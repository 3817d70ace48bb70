//! Periodic collect/submit scheduling.
//!
//! The first run happens at `max(now + startup, last_trigger + interval)`
//! so a restart neither fires immediately nor postpones a run that is
//! already overdue by more than the startup delay. Every completed cycle,
//! periodic or triggered, restarts the interval.

use std::time::Duration;

use sls_core::config::ConfigStore;
use sls_core::util::epoch_secs;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::state::{CycleOutcome, SharedState};

/// Delay before the first run after startup, in seconds.
pub const DEFAULT_STARTUP: f64 = 600.0;

/// Delay between runs, in seconds.
pub const DEFAULT_INTERVAL: f64 = 3600.0;

/// Scheduler timing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Schedule {
    /// Delay before the first run.
    pub startup: Duration,
    /// Delay between runs.
    pub interval: Duration,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            startup: Duration::from_secs_f64(DEFAULT_STARTUP),
            interval: Duration::from_secs_f64(DEFAULT_INTERVAL),
        }
    }
}

impl Schedule {
    /// Reads `daemon.startup` and `daemon.interval`.
    #[must_use]
    pub fn from_config(config: &ConfigStore) -> Self {
        let seconds = |key: &str, default: f64| {
            let value = config.get_f64("daemon", key).unwrap_or(default);
            Duration::try_from_secs_f64(value).unwrap_or_else(|_| Duration::from_secs_f64(default))
        };
        Self {
            startup: seconds("startup", DEFAULT_STARTUP),
            interval: seconds("interval", DEFAULT_INTERVAL),
        }
    }

    /// Delay until the first run, given the last run's epoch time.
    #[must_use]
    pub fn first_delay(&self, now: f64, last_trigger: Option<f64>) -> Duration {
        let startup = self.startup.as_secs_f64();
        let Some(last) = last_trigger else {
            return self.startup;
        };
        let due = (last + self.interval.as_secs_f64() - now).max(startup);
        Duration::try_from_secs_f64(due).unwrap_or(self.startup)
    }
}

/// Runs periodic cycles until shutdown.
pub async fn run(state: SharedState) {
    let schedule = state.with_config(|config| Schedule::from_config(config));
    let last = state.daemon_data().get_f64("last_trigger");
    let delay = schedule.first_delay(epoch_secs(), last);
    info!(
        first_run_secs = delay.as_secs(),
        interval_secs = schedule.interval.as_secs(),
        "scheduler started"
    );
    let mut next = Instant::now() + delay;

    loop {
        tokio::select! {
            () = state.shutdown_requested() => break,
            () = state.reanchored() => {
                debug!("cycle triggered, restarting interval");
                next = Instant::now() + schedule.interval;
            },
            () = tokio::time::sleep_until(next) => {
                match state.run_cycle().await {
                    CycleOutcome::Ran(summary) => debug!(?summary, "periodic cycle finished"),
                    outcome => debug!(?outcome, "periodic cycle skipped"),
                }
                next = Instant::now() + schedule.interval;
            },
        }
    }
    debug!("scheduler stopped");
}
