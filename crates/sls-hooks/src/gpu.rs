//! GPU reset handler.
//!
//! Run by udev when the kernel reports a GPU reset. Snapshots the process
//! that was rendering and the state of the graphics stack into a JSON
//! report under the `gpu` staging category.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::{Map, Value, json};
use sls_core::process::{ProcTree, REAPER_COMM};
use sls_core::staging::{Owner, Staging, StagingFile};
use sls_core::{system, util};
use tracing::{debug, info};

/// Where GPU reset reports are staged.
pub const CATEGORY: &str = "gpu";

/// Kernel journal lines kept in the report.
const JOURNAL_LINES: usize = 50;

/// System facts gathered at reset time.
#[derive(Debug, Clone, Default)]
pub struct Probes {
    /// Kernel release.
    pub kernel: String,
    /// Distribution branch.
    pub branch: String,
    /// Installed Mesa version.
    pub mesa: Option<String>,
    /// Recent GPU driver lines from the kernel journal.
    pub journal: Vec<String>,
}

impl Probes {
    /// Queries the running system.
    pub async fn gather() -> Self {
        Self {
            kernel: util::kernel_release(),
            branch: system::distro_branch().await,
            mesa: system::mesa_version().await,
            journal: system::kernel_journal(system::GPU_DRIVERS, JOURNAL_LINES).await,
        }
    }
}

/// The process the reset is attributed to.
///
/// udev passes `PID` when the kernel knows it; otherwise the Steam game
/// reaper is the best guess.
#[must_use]
pub fn find_pid(env: &BTreeMap<String, String>, proc: &ProcTree) -> Option<u32> {
    env.get("PID")
        .and_then(|pid| pid.parse().ok())
        .or_else(|| proc.find_by_comm(REAPER_COMM))
}

/// Assembles the report consumed by the `gpu` helper.
#[must_use]
pub fn build_report(
    env: &BTreeMap<String, String>,
    proc: &ProcTree,
    probes: &Probes,
    timestamp: f64,
) -> Value {
    let mut report = Map::new();
    report.insert(String::from("timestamp"), json!(timestamp));
    report.insert(String::from("kernel"), json!(probes.kernel));
    report.insert(String::from("branch"), json!(probes.branch));
    if let Some(mesa) = &probes.mesa {
        report.insert(String::from("mesa"), json!(mesa));
    }
    report.insert(String::from("journal"), json!(probes.journal));
    report.insert(String::from("env"), json!(env));

    match find_pid(env, proc) {
        Some(pid) => {
            report.insert(String::from("pid"), json!(pid));
            if let Some(appid) = proc.appid(pid) {
                report.insert(String::from("appid"), json!(appid));
            }
            if let Some(exe) = proc.exe_basename(pid) {
                report.insert(String::from("executable"), json!(exe));
            }
            match proc.comm(pid) {
                Ok(comm) => {
                    report.insert(String::from("comm"), json!(comm));
                },
                Err(e) => debug!(pid, "cannot read comm: {e}"),
            }
        },
        None => debug!("no process to attribute the reset to"),
    }
    Value::Object(report)
}

/// Writes `report` to `pending/gpu/<ns>.json`.
pub fn stage(staging: &Staging, report: &Value, owner: Option<Owner>) -> Result<PathBuf> {
    staging
        .ensure_category(CATEGORY, owner)
        .context("failed to prepare staging directory")?;
    let mut file = StagingFile::create(
        &staging.pending(CATEGORY),
        &format!("{}.json", util::epoch_nanos()),
    )?;
    serde_json::to_writer(&mut file, report)?;
    file.flush()?;
    if let Some(owner) = owner {
        file.chown(owner)?;
    }
    Ok(file.commit()?)
}

/// Handles one GPU reset.
pub async fn run(staging: &Staging, proc: &ProcTree) -> Result<PathBuf> {
    let env: BTreeMap<String, String> = std::env::vars().collect();
    let probes = Probes::gather().await;
    let report = build_report(&env, proc, &probes, util::epoch_secs());
    let path = stage(staging, &report, Owner::service_user())?;
    info!(path = %path.display(), "GPU reset staged");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::fs::symlink;
    use std::path::Path;

    use super::*;

    fn fake_process(root: &Path, pid: u32, ppid: u32, comm: &str, environ: &[u8]) {
        let dir = root.join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("comm"), format!("{comm}\n")).unwrap();
        fs::write(
            dir.join("stat"),
            format!("{pid} ({comm}) S {ppid} 1 1 0 -1 4194560"),
        )
        .unwrap();
        fs::write(dir.join("environ"), environ).unwrap();
        fs::write(dir.join("cmdline"), b"").unwrap();
    }

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn pid_comes_from_env_then_reaper() {
        let root = tempfile::tempdir().unwrap();
        fake_process(root.path(), 10, 1, "steam", b"");
        fake_process(root.path(), 20, 10, "reaper", b"");
        let proc = ProcTree::new(root.path());

        assert_eq!(find_pid(&env(&[("PID", "1234")]), &proc), Some(1234));
        assert_eq!(find_pid(&env(&[("PID", "abc")]), &proc), Some(20));
        assert_eq!(find_pid(&env(&[]), &proc), Some(20));
        assert_eq!(find_pid(&env(&[]), &ProcTree::new(root.path().join("none"))), None);
    }

    #[test]
    fn report_describes_the_process() {
        let root = tempfile::tempdir().unwrap();
        fake_process(root.path(), 30, 1, "game", b"HOME=/home/deck\0SteamGameId=1234\0");
        symlink("/opt/game/bin/game.x86_64", root.path().join("30/exe")).unwrap();
        let proc = ProcTree::new(root.path());
        let probes = Probes {
            kernel: String::from("6.1.52"),
            branch: String::from("main"),
            mesa: Some(String::from("23.1.3")),
            journal: vec![String::from("amdgpu: GPU reset begin!")],
        };

        let report = build_report(&env(&[("PID", "30")]), &proc, &probes, 1_700_000_000.0);
        assert_eq!(report["pid"], 30);
        assert_eq!(report["appid"], 1234);
        assert_eq!(report["executable"], "game.x86_64");
        assert_eq!(report["comm"], "game");
        assert_eq!(report["mesa"], "23.1.3");
        assert_eq!(report["kernel"], "6.1.52");
        assert_eq!(report["env"]["PID"], "30");
        assert_eq!(report["journal"][0], "amdgpu: GPU reset begin!");
    }

    #[test]
    fn unattributed_report_is_still_staged() {
        let root = tempfile::tempdir().unwrap();
        let proc = ProcTree::new(root.path().join("proc"));
        let report = build_report(&env(&[]), &proc, &Probes::default(), 1.0);
        assert!(report.get("pid").is_none());
        assert!(report.get("mesa").is_none());

        let staging = Staging::new(root.path().join("base"));
        let path = stage(&staging, &report, None).unwrap();
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("json"));
        let written: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(written, report);
    }
}
