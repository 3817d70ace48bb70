//! Kernel coredump pipe handler.
//!
//! Installed as the `core_pattern` pipe target. The core is always passed
//! on to `systemd-coredump`; for processes that are not sandboxed or
//! managed by Steam it is also teed into breakpad's `core_handler`, which
//! writes a minidump into the `minidump` staging category.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use sls_core::process::ProcTree;
use sls_core::staging::{Owner, Staging, StagingFile};
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

/// Where minidumps are staged.
pub const CATEGORY: &str = "minidump";

/// systemd's own core handler.
pub const SYSTEMD_COREDUMP: &str = "/usr/lib/systemd/systemd-coredump";

/// Breakpad's core-to-minidump converter.
pub const CORE_HANDLER: &str = "/usr/lib/steamos-log-submitter/breakpad/core_handler";

/// Tee block size.
const BLOCK_SIZE: usize = 4096;

/// How long each child gets to finish after the core has been written.
const CHILD_TIMEOUT: Duration = Duration::from_secs(5);

/// Path prefixes and fragments of executables that are not collected.
const APPIMAGE: &str = "/tmp/.mount_";
const FLATPAK: &str = "/app";
const STEAM_MANAGED: &str = "/.local/share/Steam/";

/// Positional arguments from `core_pattern`.
#[derive(Debug, Clone, Args)]
pub struct CoredumpArgs {
    /// Crashing process id.
    pub pid: u32,
    /// Process name.
    pub comm: String,
    /// Real uid.
    pub uid: String,
    /// Real gid.
    pub gid: String,
    /// Signal number.
    pub signal: String,
    /// Dump time, epoch seconds.
    pub timestamp: String,
    /// `RLIMIT_CORE`.
    pub core_limit: String,
    /// Hostname.
    pub hostname: String,
    /// Executable basename.
    pub exe_basename: String,
    /// Executable path with `!` in place of `/`.
    pub exe_path_escaped: String,
}

impl CoredumpArgs {
    /// The executable path with the `core_pattern` escaping undone.
    #[must_use]
    pub fn exe_path(&self) -> String {
        self.exe_path_escaped.replace('!', "/")
    }

    /// Arguments handed on to `systemd-coredump`.
    #[must_use]
    pub fn systemd_args(&self) -> Vec<String> {
        vec![
            self.pid.to_string(),
            self.comm.clone(),
            self.uid.clone(),
            self.gid.clone(),
            self.signal.clone(),
            self.timestamp.clone(),
            self.core_limit.clone(),
            self.hostname.clone(),
        ]
    }

    /// `<ts>-<comm>-<pid>-<appid>.dmp`.
    #[must_use]
    pub fn artifact_name(&self, appid: Option<u32>) -> String {
        let appid = appid.map_or_else(|| String::from("None"), |appid| appid.to_string());
        let comm = self.comm.replace('/', "_");
        format!("{}-{comm}-{}-{appid}.dmp", self.timestamp, self.pid)
    }
}

/// Child programs the core is fed to.
#[derive(Debug, Clone)]
pub struct Programs {
    /// Always receives the core.
    pub systemd_coredump: PathBuf,
    /// Receives the core when collecting; called as `<handler> <pid> <output>`.
    pub core_handler: PathBuf,
}

impl Default for Programs {
    fn default() -> Self {
        Self {
            systemd_coredump: PathBuf::from(SYSTEMD_COREDUMP),
            core_handler: PathBuf::from(CORE_HANDLER),
        }
    }
}

/// Whether a crash of the executable at `path` should become a minidump.
#[must_use]
pub fn should_collect(path: &str) -> bool {
    !(path.starts_with(APPIMAGE) || path.starts_with(FLATPAK) || path.contains(STEAM_MANAGED))
}

/// Copies `input` to every live sink in [`BLOCK_SIZE`] blocks.
///
/// A sink that fails to accept a write is closed and skipped from then on;
/// the copy continues for the others. Returns the number of bytes read.
pub fn tee<R: Read, W: Write>(mut input: R, sinks: &mut [Option<W>]) -> io::Result<u64> {
    let mut block = [0u8; BLOCK_SIZE];
    let mut total = 0u64;
    loop {
        let read = match input.read(&mut block) {
            Ok(0) => break,
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        total += read as u64;
        for (index, slot) in sinks.iter_mut().enumerate() {
            if let Some(sink) = slot {
                if let Err(e) = sink.write_all(&block[..read]) {
                    debug!(sink = index, "closing tee output: {e}");
                    *slot = None;
                }
            }
        }
    }
    for slot in sinks.iter_mut() {
        *slot = None;
    }
    Ok(total)
}

fn spawn(program: &Path, args: &[String]) -> Option<Child> {
    match Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .spawn()
    {
        Ok(child) => Some(child),
        Err(e) => {
            warn!(program = %program.display(), "failed to spawn: {e}");
            None
        },
    }
}

fn wait(program: &Path, child: &mut Child) -> Option<ExitStatus> {
    let program = program.display().to_string();
    let program = program.as_str();
    match child.wait_timeout(CHILD_TIMEOUT) {
        Ok(Some(status)) => {
            if !status.success() {
                warn!(program, status = %status, "child exited unsuccessfully");
            }
            Some(status)
        },
        Ok(None) => {
            warn!(program, "child did not finish in time");
            None
        },
        Err(e) => {
            warn!(program, "failed to wait for child: {e}");
            None
        },
    }
}

fn stage(staging: &Staging, name: &str, owner: Option<Owner>) -> Result<StagingFile> {
    staging
        .ensure_category(CATEGORY, owner)
        .context("failed to prepare staging directory")?;
    StagingFile::create(&staging.pending(CATEGORY), name).context("failed to create staging file")
}

fn finish(file: StagingFile, args: &CoredumpArgs, exe_path: &str, owner: Option<Owner>) -> Result<()> {
    file.set_xattr("user.executable", &args.exe_basename)?;
    file.set_xattr("user.comm", &args.comm)?;
    file.set_xattr("user.path", exe_path)?;
    if let Some(owner) = owner {
        file.chown(owner)?;
    }
    let path = file.commit()?;
    info!(path = %path.display(), "minidump staged");
    Ok(())
}

/// Handles one core: feeds `input` to systemd-coredump and, when
/// collecting, to breakpad.
///
/// Returns true if a minidump was staged.
pub fn run<R: Read>(
    args: &CoredumpArgs,
    input: R,
    staging: &Staging,
    proc: &ProcTree,
    programs: &Programs,
) -> Result<bool> {
    let exe_path = args.exe_path();
    let owner = Owner::service_user();

    let mut staged = None;
    if should_collect(&exe_path) {
        let name = args.artifact_name(proc.appid(args.pid));
        match stage(staging, &name, owner) {
            Ok(file) => staged = Some(file),
            Err(e) => warn!("not collecting minidump: {e:#}"),
        }
    } else {
        debug!(path = %exe_path, "executable excluded from collection");
    }

    let mut systemd = spawn(&programs.systemd_coredump, &args.systemd_args());
    let mut handler = staged.as_ref().and_then(|file| {
        spawn(
            &programs.core_handler,
            &[args.pid.to_string(), file.path().display().to_string()],
        )
    });

    let mut sinks = [
        systemd.as_mut().and_then(|child| child.stdin.take()),
        handler.as_mut().and_then(|child| child.stdin.take()),
    ];
    let copied = tee(input, &mut sinks).context("failed to read core")?;
    debug!(bytes = copied, "core copied");

    if let Some(child) = systemd.as_mut() {
        wait(&programs.systemd_coredump, child);
    }
    let converted = handler
        .as_mut()
        .and_then(|child| wait(&programs.core_handler, child))
        .is_some_and(|status| status.success());

    match staged {
        Some(file) if converted => {
            finish(file, args, &exe_path, owner)?;
            Ok(true)
        },
        Some(file) => {
            warn!(path = %file.path().display(), "discarding incomplete minidump");
            Ok(false)
        },
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(exe: &str) -> CoredumpArgs {
        CoredumpArgs {
            pid: 42,
            comm: String::from("sh"),
            uid: String::from("1"),
            gid: String::from("1"),
            signal: String::from("11"),
            timestamp: String::from("1700000000"),
            core_limit: String::from("unlim"),
            hostname: String::from("host"),
            exe_basename: String::from("sh"),
            exe_path_escaped: exe.replace('/', "!"),
        }
    }

    #[test]
    fn collection_filter() {
        assert!(should_collect("/usr/bin/sh"));
        assert!(should_collect("/home/deck/game/bin"));
        assert!(!should_collect("/tmp/.mount_abc123/AppRun"));
        assert!(!should_collect("/app/bin/thing"));
        assert!(!should_collect(
            "/home/deck/.local/share/Steam/ubuntu12_32/steam"
        ));
    }

    #[test]
    fn naming_and_argument_forwarding() {
        let args = args("/usr/bin/sh");
        assert_eq!(args.exe_path(), "/usr/bin/sh");
        assert_eq!(args.artifact_name(Some(100)), "1700000000-sh-42-100.dmp");
        assert_eq!(args.artifact_name(None), "1700000000-sh-42-None.dmp");
        assert_eq!(
            args.systemd_args(),
            ["42", "sh", "1", "1", "11", "1700000000", "unlim", "host"]
        );
    }

    struct Sink {
        data: Vec<u8>,
        fail_after: Option<usize>,
    }

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.fail_after.is_some_and(|limit| self.data.len() >= limit) {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe));
            }
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn broken_sink_does_not_stop_the_tee() {
        let input = vec![7u8; BLOCK_SIZE * 3 + 10];
        let mut broken = Sink {
            data: Vec::new(),
            fail_after: Some(BLOCK_SIZE),
        };
        let mut healthy = Sink {
            data: Vec::new(),
            fail_after: None,
        };
        {
            let mut sinks = [Some(&mut broken), Some(&mut healthy)];
            let copied = tee(input.as_slice(), &mut sinks).unwrap();
            assert_eq!(copied, input.len() as u64);
            assert!(sinks.iter().all(Option::is_none));
        }
        assert_eq!(broken.data.len(), BLOCK_SIZE);
        assert_eq!(healthy.data, input);
    }

    #[test]
    fn tee_delivers_everything() {
        let input = b"core bytes".repeat(1000);
        let mut first = Vec::new();
        let mut second = Vec::new();
        {
            let mut sinks = [Some(&mut first), Some(&mut second)];
            tee(input.as_slice(), &mut sinks).unwrap();
        }
        assert_eq!(first, input);
        assert_eq!(second, input);
    }

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn fake_programs(dir: &Path) -> Programs {
        Programs {
            systemd_coredump: script(dir, "systemd-coredump", "cat > /dev/null"),
            core_handler: script(dir, "core_handler", "cat > \"$2\""),
        }
    }

    #[test]
    fn excluded_executable_is_not_staged() {
        let dir = tempfile::tempdir().unwrap();
        let staging = Staging::new(dir.path().join("base"));
        let proc = ProcTree::new(dir.path().join("proc"));
        let programs = fake_programs(dir.path());
        let args = args("/home/deck/.local/share/Steam/ubuntu12_32/steam");
        let staged = run(&args, &b"core"[..], &staging, &proc, &programs).unwrap();
        assert!(!staged);
        assert!(!staging.pending(CATEGORY).exists());
    }

    #[test]
    fn collected_core_is_staged_with_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let probe = dir.path().join("probe");
        std::fs::write(&probe, b"").unwrap();
        if xattr::set(&probe, "user.test", b"1").is_err() {
            // Filesystem without user xattrs.
            return;
        }
        let staging = Staging::new(dir.path().join("base"));
        let proc = ProcTree::new(dir.path().join("proc"));
        let programs = fake_programs(dir.path());
        let args = args("/usr/bin/sh");

        let staged = run(&args, &b"core bytes"[..], &staging, &proc, &programs).unwrap();
        assert!(staged);
        let path = staging.pending(CATEGORY).join("1700000000-sh-42-None.dmp");
        assert_eq!(std::fs::read(&path).unwrap(), b"core bytes");
        assert_eq!(
            xattr::get(&path, "user.path").unwrap().as_deref(),
            Some(&b"/usr/bin/sh"[..])
        );
        assert_eq!(
            xattr::get(&path, "user.comm").unwrap().as_deref(),
            Some(&b"sh"[..])
        );
    }

    #[test]
    fn missing_core_handler_discards_the_staging_file() {
        let dir = tempfile::tempdir().unwrap();
        let staging = Staging::new(dir.path().join("base"));
        let proc = ProcTree::new(dir.path().join("proc"));
        let programs = Programs {
            core_handler: dir.path().join("missing"),
            ..fake_programs(dir.path())
        };
        let staged = run(&args("/usr/bin/sh"), &b"core"[..], &staging, &proc, &programs).unwrap();
        assert!(!staged);
        let leftovers = std::fs::read_dir(staging.pending(CATEGORY))
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name() != ".lock")
            .count();
        assert_eq!(leftovers, 0);
    }
}
