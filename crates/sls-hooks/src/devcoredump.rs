//! Device coredump handler.
//!
//! Invoked by udev with the `devcd` directory of a freshly created device
//! coredump. The dump and a small metadata document are zipped into the
//! `devcoredump` staging category.

use std::fs;
use std::io::{self, Read, Seek, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::{Value, json};
use sls_core::helpers::devcoredump::{DUMP_ENTRY, METADATA_ENTRY};
use sls_core::staging::{Owner, Staging, StagingFile};
use sls_core::{system, util};
use tracing::{debug, info};

/// Where device coredumps are staged.
pub const CATEGORY: &str = "devcoredump";

/// Drivers whose dumps are collected through another path.
pub const BLOCKED_DRIVERS: &[&str] = &["amdgpu"];

/// Default directory of per-driver `<driver>.block` / `<driver>.clear` files.
pub const DEFAULT_POLICY_DIR: &str = "/etc/steamos-log-submitter/devcoredump";

/// Kernel journal lines kept in the metadata.
const JOURNAL_LINES: usize = 50;

/// What to do with a dump from a given driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Stage it and leave the device core in place.
    Submit,
    /// Ignore it.
    Block,
    /// Stage it, then clear the device core.
    Clear,
}

impl Policy {
    /// Looks up the policy for `driver`. A block file wins over a clear file.
    #[must_use]
    pub fn for_driver(policy_dir: &Path, driver: &str) -> Self {
        if BLOCKED_DRIVERS.contains(&driver) || policy_dir.join(format!("{driver}.block")).exists() {
            Self::Block
        } else if policy_dir.join(format!("{driver}.clear")).exists() {
            Self::Clear
        } else {
            Self::Submit
        }
    }
}

/// The device behind a devcoredump directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDump {
    /// The `devcd` directory.
    pub dir: PathBuf,
    /// Canonical sysfs path of the failing device.
    pub failing_device: PathBuf,
    /// Bound driver name.
    pub driver: String,
}

impl DeviceDump {
    /// Resolves the failing device and its driver.
    pub fn inspect(dir: &Path) -> Result<Self> {
        let device_link = dir.join("failing_device");
        let failing_device = fs::canonicalize(&device_link)
            .with_context(|| format!("failed to resolve {}", device_link.display()))?;
        let driver_link = device_link.join("driver");
        let driver = fs::read_link(&driver_link)
            .with_context(|| format!("failed to read {}", driver_link.display()))?
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .context("driver link has no name")?;
        Ok(Self {
            dir: dir.to_path_buf(),
            failing_device,
            driver,
        })
    }

    /// Path of the raw dump.
    #[must_use]
    pub fn data_path(&self) -> PathBuf {
        self.dir.join("data")
    }

    /// Writes `0` to the dump, telling the kernel to discard it.
    pub fn clear(&self) -> io::Result<()> {
        fs::write(self.data_path(), b"0\n")
    }

    /// Archive name for a dump taken at `nanos`.
    #[must_use]
    pub fn artifact_name(&self, nanos: u128) -> String {
        format!("{nanos}-{}.zip", self.driver.replace('/', "_"))
    }
}

/// Metadata stored beside the dump.
#[must_use]
pub fn metadata(dump: &DeviceDump, timestamp: f64, kernel: &str, branch: &str, journal: &[String]) -> Value {
    json!({
        "timestamp": timestamp,
        "kernel": kernel,
        "branch": branch,
        "failing_device": dump.failing_device.display().to_string(),
        "driver": dump.driver,
        "journal": journal,
    })
}

/// Zips `metadata` and the dump bytes from `data` into `out`.
pub fn write_archive<W, R>(out: W, metadata: &Value, mut data: R) -> Result<W>
where
    W: Write + Seek,
    R: Read,
{
    let options = zip::write::SimpleFileOptions::default();
    let mut writer = zip::ZipWriter::new(out);
    writer.start_file(METADATA_ENTRY, options)?;
    writer.write_all(&serde_json::to_vec(metadata)?)?;
    writer.start_file(DUMP_ENTRY, options)?;
    io::copy(&mut data, &mut writer).context("failed to copy device dump")?;
    Ok(writer.finish()?)
}

/// Stages the archive for `dump`. Returns its final path.
pub fn stage(staging: &Staging, dump: &DeviceDump, metadata: &Value, owner: Option<Owner>) -> Result<PathBuf> {
    staging
        .ensure_category(CATEGORY, owner)
        .context("failed to prepare staging directory")?;
    let data = fs::File::open(dump.data_path())
        .with_context(|| format!("failed to open {}", dump.data_path().display()))?;
    let file = StagingFile::create(
        &staging.pending(CATEGORY),
        &dump.artifact_name(util::epoch_nanos()),
    )?;
    let file = write_archive(file, metadata, data)?;
    if let Some(owner) = owner {
        file.chown(owner)?;
    }
    Ok(file.commit()?)
}

/// Handles one device coredump. Returns the staged archive, if any.
pub async fn run(dir: &Path, staging: &Staging, policy_dir: &Path) -> Result<Option<PathBuf>> {
    let dump = DeviceDump::inspect(dir)?;
    let policy = Policy::for_driver(policy_dir, &dump.driver);
    if policy == Policy::Block {
        debug!(driver = %dump.driver, "device coredump blocked");
        return Ok(None);
    }

    let branch = system::distro_branch().await;
    let journal = system::kernel_journal(&[dump.driver.as_str()], JOURNAL_LINES).await;
    let metadata = metadata(
        &dump,
        util::epoch_secs(),
        &util::kernel_release(),
        &branch,
        &journal,
    );
    let path = stage(staging, &dump, &metadata, Owner::service_user())?;
    info!(path = %path.display(), driver = %dump.driver, "device coredump staged");

    if policy == Policy::Clear {
        dump.clear()
            .with_context(|| format!("failed to clear {}", dump.data_path().display()))?;
    }
    Ok(Some(path))
}
