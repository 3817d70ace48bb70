//! Application crash dumps produced by the coredump hook.
//!
//! Artifacts are named `<ts>-<comm>-<pid>-<appid>.dmp` and carry the
//! executable, comm and path as extended attributes. The dump's Linux
//! environment stream is forwarded as extra data.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{Helper, HelperContext, HelperResult, read_artifact};
use crate::remote::sentry::{self, Dsn, Event};
use crate::remote::steam::{CrashInfo, CrashUploader, DEFAULT_BASE_URL};
use crate::staging::get_xattr;

/// `MDMP`, little-endian.
pub const MINIDUMP_SIGNATURE: u32 = 0x504d_444d;

/// Breakpad's Linux environment stream.
pub const LINUX_ENVIRON_STREAM: u32 = 0x4767_0007;

/// Extended attributes copied into event tags.
pub const XATTR_TAGS: &[(&str, &str)] = &[
    ("user.executable", "executable"),
    ("user.comm", "comm"),
    ("user.path", "path"),
    ("user.build_id", "build_id"),
    ("user.pkgname", "pkgname"),
    ("user.pkgver", "pkgver"),
];

/// Base of individual 64-bit Steam ids.
const STEAMID64_BASE: u64 = 76_561_197_960_265_728;

/// Fields encoded in a minidump's file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpName {
    /// Crash time (epoch seconds).
    pub timestamp: Option<u64>,
    /// Process comm.
    pub comm: String,
    /// Process id.
    pub pid: Option<u32>,
    /// Steam appid, when one was found.
    pub appid: Option<u32>,
}

impl DumpName {
    /// Parses `<ts>-<comm>-<pid>-<appid>.dmp`. `comm` may contain dashes.
    #[must_use]
    pub fn parse(filename: &str) -> Option<Self> {
        let stem = filename.strip_suffix(".dmp")?;
        let mut tail = stem.rsplitn(3, '-');
        let appid = tail.next()?;
        let pid = tail.next()?;
        let head = tail.next()?;
        let (timestamp, comm) = head.split_once('-')?;
        Some(Self {
            timestamp: timestamp.parse().ok(),
            comm: comm.to_string(),
            pid: pid.parse().ok(),
            appid: appid.parse().ok(),
        })
    }
}

/// Minidump structure errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MinidumpError {
    /// Too short or wrong magic.
    #[error("not a minidump")]
    BadHeader,
    /// A directory entry points outside the file.
    #[error("stream {0:#x} is out of bounds")]
    OutOfBounds(u32),
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let slice = bytes.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

/// Returns the raw contents of stream `kind`, if present.
pub fn find_stream(bytes: &[u8], kind: u32) -> Result<Option<&[u8]>, MinidumpError> {
    if read_u32(bytes, 0) != Some(MINIDUMP_SIGNATURE) {
        return Err(MinidumpError::BadHeader);
    }
    let count = read_u32(bytes, 8).ok_or(MinidumpError::BadHeader)? as usize;
    let directory = read_u32(bytes, 12).ok_or(MinidumpError::BadHeader)? as usize;
    for i in 0..count {
        let entry = directory + i * 12;
        let (Some(stream_type), Some(size), Some(rva)) = (
            read_u32(bytes, entry),
            read_u32(bytes, entry + 4),
            read_u32(bytes, entry + 8),
        ) else {
            return Err(MinidumpError::BadHeader);
        };
        if stream_type != kind {
            continue;
        }
        let start = rva as usize;
        let end = start + size as usize;
        return bytes
            .get(start..end)
            .map(Some)
            .ok_or(MinidumpError::OutOfBounds(kind));
    }
    Ok(None)
}

/// Decodes a NUL-separated `KEY=value` block.
#[must_use]
pub fn parse_environ(block: &[u8]) -> BTreeMap<String, String> {
    block
        .split(|b| *b == 0)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let entry = String::from_utf8_lossy(entry);
            let (k, v) = entry.split_once('=')?;
            Some((k.to_string(), v.to_string()))
        })
        .collect()
}

/// Uploads application minidumps.
#[derive(Debug, Clone, Default)]
pub struct MinidumpHelper {
    steam: Option<CrashUploader>,
}

impl MinidumpHelper {
    /// Uses `uploader` for the `steam` back-end instead of the default API.
    #[must_use]
    pub fn with_uploader(uploader: CrashUploader) -> Self {
        Self {
            steam: Some(uploader),
        }
    }

    fn build_event(path: &Path, name: Option<&DumpName>, dump: &[u8]) -> Result<Event, HelperResult> {
        let mut event = Event::new();
        for (attr, tag) in XATTR_TAGS {
            if let Some(value) = get_xattr(path, attr) {
                event.tag(tag, value);
            }
        }
        if let Some(name) = name {
            event.appid = name.appid;
            event.timestamp = name.timestamp.map(|ts| ts as f64);
            if !event.tags.contains_key("comm") {
                event.tag("comm", name.comm.clone());
            }
        }
        match find_stream(dump, LINUX_ENVIRON_STREAM) {
            Ok(Some(block)) => {
                event.extra("environ", json!(parse_environ(block)));
            },
            Ok(None) => debug!(path = %path.display(), "no environment stream"),
            Err(e) => {
                warn!(path = %path.display(), "rejecting dump: {e}");
                return Err(HelperResult::PermanentError);
            },
        }
        Ok(event)
    }

    async fn submit_steam(
        &self,
        ctx: &HelperContext,
        event: &Event,
        dump: Vec<u8>,
    ) -> HelperResult {
        let uploader = self.steam.clone().unwrap_or_else(|| {
            CrashUploader::new(
                ctx.config
                    .get("steam-api")
                    .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            )
        });
        let steamid = ctx
            .global("steam", "account_id")
            .and_then(|id| id.trim().parse::<u64>().ok())
            .map(|id| (STEAMID64_BASE + id).to_string());
        let release = crate::system::os_release(Path::new("/etc/os-release"));
        let info = CrashInfo {
            steamid,
            appid: event.appid,
            product: String::from("holo"),
            build: crate::system::distro_branch().await,
            version: release
                .get("VERSION_ID")
                .cloned()
                .unwrap_or_else(|| crate::system::UNKNOWN.to_string()),
            platform: String::from("linux"),
            executable: event
                .tags
                .get("executable")
                .and_then(Value::as_str)
                .map(str::to_string),
            dump_size: dump.len() as u64,
        };
        match uploader.upload(ctx.http(), &info, dump).await {
            Ok(()) => HelperResult::Ok,
            Err(e) => {
                warn!(helper = %ctx.name, "crash upload failed: {e}");
                e.classify()
            },
        }
    }
}

#[async_trait]
impl Helper for MinidumpHelper {
    fn name(&self) -> &'static str {
        "minidump"
    }

    fn valid_extensions(&self) -> &'static [&'static str] {
        &[".dmp"]
    }

    async fn submit(&self, ctx: &HelperContext, path: &Path) -> HelperResult {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = DumpName::parse(&filename);
        if name.is_none() {
            debug!(filename = %filename, "dump name does not follow the usual pattern");
        }
        let dump = match read_artifact(path).await {
            Ok(dump) => dump,
            Err(result) => return result,
        };
        if dump.is_empty() {
            return HelperResult::PermanentError;
        }
        let event = match Self::build_event(path, name.as_ref(), &dump) {
            Ok(event) => event,
            Err(result) => return result,
        };

        let backend = ctx.config.get("backend").unwrap_or_default();
        if backend == "steam" {
            return self.submit_steam(ctx, &event, dump).await;
        }

        let Some(dsn) = ctx.dsn() else {
            warn!(helper = %ctx.name, "no DSN configured");
            return HelperResult::TransientError;
        };
        let dsn = match Dsn::parse(&dsn) {
            Ok(dsn) => dsn,
            Err(e) => {
                warn!(helper = %ctx.name, "{e}");
                return HelperResult::TransientError;
            },
        };
        match sentry::send_minidump(ctx.http(), &dsn, &filename, dump, &event).await {
            Ok(()) => {
                info!(filename = %filename, "minidump uploaded");
                HelperResult::Ok
            },
            Err(e) => {
                warn!(filename = %filename, "minidump upload failed: {e}");
                e.classify()
            },
        }
    }
}
