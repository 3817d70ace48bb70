//! Process-tree inspection through `/proc`.
//!
//! Games launched by Steam run under a `reaper` process whose command line
//! carries the application id, and most of them also inherit
//! `SteamGameId=<n>` in their environment. [`ProcTree::appid`] walks from a
//! process towards init and returns the nearest id found.
//!
//! The `/proc` root is injectable so the walk can be exercised against a
//! fabricated tree.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Command name of Steam's game launcher wrapper.
pub const REAPER_COMM: &str = "reaper";

/// Parsed head of `/proc/<pid>/stat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcStat {
    /// Process id.
    pub pid: u32,
    /// Command name (without the surrounding parentheses).
    pub comm: String,
    /// State character.
    pub state: char,
    /// Parent process id.
    pub ppid: u32,
}

impl ProcStat {
    /// Parses `<pid> (<comm>) <state> <ppid> ...`.
    ///
    /// `comm` may itself contain spaces and parentheses, so the command
    /// name runs up to the *last* closing parenthesis.
    #[must_use]
    pub fn parse(content: &str) -> Option<Self> {
        let open = content.find('(')?;
        let close = content.rfind(')')?;
        if close < open {
            return None;
        }
        let pid = content[..open].trim().parse().ok()?;
        let comm = content[open + 1..close].to_string();
        let mut rest = content[close + 1..].split_whitespace();
        let state = rest.next()?.chars().next()?;
        let ppid = rest.next()?.parse().ok()?;
        Some(Self {
            pid,
            comm,
            state,
            ppid,
        })
    }
}

/// Extracts the appid from a reaper command line.
///
/// Arguments are scanned for `SteamLaunch`, after which the first
/// `AppId=<n>` wins. Scanning stops at `--`, which separates the
/// launcher's own arguments from the game's.
#[must_use]
pub fn appid_from_reaper_cmdline<S: AsRef<str>>(args: &[S]) -> Option<u32> {
    let mut launched = false;
    for arg in args {
        let arg = arg.as_ref();
        if arg == "--" {
            break;
        }
        if arg == "SteamLaunch" {
            launched = true;
            continue;
        }
        if launched {
            if let Some(id) = arg.strip_prefix("AppId=") {
                return id.parse().ok();
            }
        }
    }
    None
}

/// Extracts `SteamGameId` from a NUL-separated environment block.
#[must_use]
pub fn appid_from_environ(environ: &[u8]) -> Option<u32> {
    environ
        .split(|b| *b == 0)
        .filter_map(|entry| entry.strip_prefix(b"SteamGameId="))
        .find_map(|value| std::str::from_utf8(value).ok()?.parse().ok())
}

/// A view of a `/proc` hierarchy.
#[derive(Debug, Clone)]
pub struct ProcTree {
    root: PathBuf,
}

impl Default for ProcTree {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcTree {
    /// Uses `root` in place of `/proc`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root of the tree.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry(&self, pid: u32, name: &str) -> PathBuf {
        self.root.join(pid.to_string()).join(name)
    }

    /// Reads and parses `/proc/<pid>/stat`.
    pub fn stat(&self, pid: u32) -> io::Result<ProcStat> {
        let content = std::fs::read_to_string(self.entry(pid, "stat"))?;
        ProcStat::parse(&content).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, format!("malformed stat for {pid}"))
        })
    }

    /// Reads `/proc/<pid>/cmdline` as a list of arguments.
    pub fn cmdline(&self, pid: u32) -> io::Result<Vec<String>> {
        let raw = std::fs::read(self.entry(pid, "cmdline"))?;
        Ok(raw
            .split(|b| *b == 0)
            .filter(|arg| !arg.is_empty())
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .collect())
    }

    /// Reads `/proc/<pid>/environ`.
    pub fn environ(&self, pid: u32) -> io::Result<Vec<u8>> {
        std::fs::read(self.entry(pid, "environ"))
    }

    /// Reads `/proc/<pid>/comm`, trimmed.
    pub fn comm(&self, pid: u32) -> io::Result<String> {
        Ok(std::fs::read_to_string(self.entry(pid, "comm"))?
            .trim_end()
            .to_string())
    }

    /// Basename of the `/proc/<pid>/exe` link target.
    #[must_use]
    pub fn exe_basename(&self, pid: u32) -> Option<String> {
        let target = std::fs::read_link(self.entry(pid, "exe")).ok()?;
        target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }

    /// Numeric entries of the tree.
    #[must_use]
    pub fn pids(&self) -> Vec<u32> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut pids: Vec<u32> = entries
            .filter_map(Result::ok)
            .filter_map(|e| e.file_name().to_str()?.parse().ok())
            .collect();
        pids.sort_unstable();
        pids
    }

    /// First process whose `comm` equals `name`.
    #[must_use]
    pub fn find_by_comm(&self, name: &str) -> Option<u32> {
        self.pids()
            .into_iter()
            .find(|pid| self.comm(*pid).is_ok_and(|comm| comm == name))
    }

    /// Finds the Steam appid of `pid` by walking its ancestors.
    ///
    /// At each level the environment is checked for `SteamGameId`, then a
    /// `reaper` ancestor's command line for `AppId=`. The walk stops at
    /// pid 1. Permission errors on `environ` are expected for foreign
    /// processes and skipped silently; any other error ends the walk.
    #[must_use]
    pub fn appid(&self, pid: u32) -> Option<u32> {
        let mut pid = pid;
        while pid > 1 {
            match self.environ(pid) {
                Ok(environ) => {
                    if let Some(appid) = appid_from_environ(&environ) {
                        return Some(appid);
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {},
                Err(e) => {
                    debug!(pid, "cannot read environ: {e}");
                    return None;
                },
            }

            let stat = match self.stat(pid) {
                Ok(stat) => stat,
                Err(e) => {
                    warn!(pid, "cannot read stat: {e}");
                    return None;
                },
            };

            if stat.comm == REAPER_COMM {
                match self.cmdline(pid) {
                    Ok(args) => {
                        if let Some(appid) = appid_from_reaper_cmdline(&args) {
                            return Some(appid);
                        }
                    },
                    Err(e) => {
                        warn!(pid, "cannot read reaper cmdline: {e}");
                        return None;
                    },
                }
            }

            // Pid wraparound can give a parent a larger pid; only a
            // self-loop ends the walk early.
            if stat.ppid == pid {
                return None;
            }
            pid = stat.ppid;
        }
        None
    }
}
