//! Facts about the running system gathered from external tools.
//!
//! Every probe degrades gracefully: a missing tool yields `None` or a
//! placeholder rather than an error, since the reports they feed are
//! useful without them.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::helpers::HelperError;

/// Upper bound on any probe subprocess.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Placeholder for facts that could not be determined.
pub const UNKNOWN: &str = "unknown";

/// Drivers whose kernel messages are included in GPU reports.
pub const GPU_DRIVERS: &[&str] = &["amdgpu", "drm", "i915", "nouveau"];

/// Runs `program args...` and returns its stdout.
pub async fn run_command(program: &str, args: &[&str]) -> Result<String, HelperError> {
    let failed = |reason: String| HelperError::Command {
        command: program.to_string(),
        reason,
    };
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| failed(e.to_string()))?;
    let output = tokio::time::timeout(COMMAND_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| failed(String::from("timed out")))?
        .map_err(|e| failed(e.to_string()))?;
    if !output.status.success() {
        return Err(failed(format!("exited with {}", output.status)));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// The OS update branch, e.g. `stable` or `main`.
pub async fn distro_branch() -> String {
    match run_command("steamos-select-branch", &["-c"]).await {
        Ok(out) if !out.trim().is_empty() => out.trim().to_string(),
        Ok(_) => String::from(UNKNOWN),
        Err(e) => {
            debug!("cannot determine branch: {e}");
            String::from(UNKNOWN)
        },
    }
}

/// Installed Mesa version, from the package database.
pub async fn mesa_version() -> Option<String> {
    let out = run_command("pacman", &["-Q", "mesa"]).await.ok()?;
    out.split_whitespace().nth(1).map(str::to_string)
}

/// Parses `os-release` style `KEY=value` content.
#[must_use]
pub fn parse_os_release(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| {
            let v = v.trim();
            let v = v
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(v);
            (k.trim().to_string(), v.to_string())
        })
        .collect()
}

/// Reads `/etc/os-release` (or the file at `path`).
#[must_use]
pub fn os_release(path: &Path) -> BTreeMap<String, String> {
    std::fs::read_to_string(path)
        .map(|content| parse_os_release(&content))
        .unwrap_or_default()
}

/// Keeps the last `limit` lines of `text` mentioning any of `needles`.
#[must_use]
pub fn matching_lines(text: &str, needles: &[&str], limit: usize) -> Vec<String> {
    let matching: Vec<&str> = text
        .lines()
        .filter(|line| needles.iter().any(|n| line.contains(n)))
        .collect();
    let start = matching.len().saturating_sub(limit);
    matching[start..].iter().map(|l| (*l).to_string()).collect()
}

/// Recent kernel-journal lines mentioning any of `needles`.
pub async fn kernel_journal(needles: &[&str], limit: usize) -> Vec<String> {
    match run_command("journalctl", &["-k", "-o", "cat", "-n", "500", "--no-pager"]).await {
        Ok(out) => matching_lines(&out, needles, limit),
        Err(e) => {
            debug!("cannot read kernel journal: {e}");
            Vec::new()
        },
    }
}
