//! Periodic inventory of attached hardware and system facts.
//!
//! Every collect pass enumerates each [`Kind`] and merges entries not yet
//! seen into a cache kept in the helper's data section. Once `interval`
//! seconds have passed since the data `timestamp`, the cache is written to
//! `pending/sysinfo/<ts>.json` and cleared. The helper paces itself, so the
//! runner's interval check does not apply.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use super::{Helper, HelperContext, HelperError, HelperResult, MethodError, read_json_artifact};
use crate::remote::sentry::{self, Attachment, Dsn, Event};
use crate::staging::StagingFile;
use crate::system::{self, run_command};
use crate::util::epoch_secs;

/// Default rotation period: one week.
pub const DEFAULT_INTERVAL: f64 = 7.0 * 24.0 * 3600.0;

/// EDID block header.
const EDID_HEADER: [u8; 8] = [0x00, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00];

/// Inventory categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Kind {
    /// USB devices.
    Usb,
    /// Paired Bluetooth devices.
    Bluetooth,
    /// Connected displays.
    Monitors,
    /// Mounted block-device filesystems.
    Filesystems,
    /// Batteries.
    Batteries,
    /// Network interfaces.
    Network,
    /// OS and memory summary.
    System,
}

impl Kind {
    /// Every kind, in report order.
    pub const ALL: [Self; 7] = [
        Self::Usb,
        Self::Bluetooth,
        Self::Monitors,
        Self::Filesystems,
        Self::Batteries,
        Self::Network,
        Self::System,
    ];

    /// Key used in the cache and report.
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            Self::Usb => "usb",
            Self::Bluetooth => "bluetooth",
            Self::Monitors => "monitors",
            Self::Filesystems => "filesystems",
            Self::Batteries => "batteries",
            Self::Network => "network",
            Self::System => "system",
        }
    }

    /// Object IPC method returning this kind.
    #[must_use]
    pub const fn method(self) -> &'static str {
        match self {
            Self::Usb => "GetUsb",
            Self::Bluetooth => "GetBluetooth",
            Self::Monitors => "GetMonitors",
            Self::Filesystems => "GetFilesystems",
            Self::Batteries => "GetBatteries",
            Self::Network => "GetNetwork",
            Self::System => "GetSystem",
        }
    }

    fn from_method(method: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.method() == method)
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    let value = std::fs::read_to_string(path).ok()?;
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn sorted_dir(path: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(path) else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = entries.filter_map(Result::ok).map(|e| e.path()).collect();
    paths.sort();
    paths
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn attributes(dir: &Path, keys: &[&str]) -> Map<String, Value> {
    keys.iter()
        .filter_map(|key| read_trimmed(&dir.join(key)).map(|v| ((*key).to_string(), json!(v))))
        .collect()
}

/// USB devices under `<sys>/bus/usb/devices`.
#[must_use]
pub fn usb_devices(sysfs: &Path) -> Vec<Value> {
    sorted_dir(&sysfs.join("bus/usb/devices"))
        .into_iter()
        .filter(|dev| dev.join("idVendor").exists())
        .map(|dev| {
            let mut entry = attributes(&dev, &["manufacturer", "product"]);
            if let Some(vid) = read_trimmed(&dev.join("idVendor")) {
                entry.insert("vid".into(), json!(vid));
            }
            if let Some(pid) = read_trimmed(&dev.join("idProduct")) {
                entry.insert("pid".into(), json!(pid));
            }
            Value::Object(entry)
        })
        .collect()
}

/// Parses `bluetoothctl devices` output.
#[must_use]
pub fn parse_bluetooth(output: &str) -> Vec<Value> {
    output
        .lines()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix("Device ")?;
            let (address, name) = rest.split_once(' ').unwrap_or((rest, ""));
            // Only the OUI identifies hardware; the rest is per-device.
            let oui: String = address.split(':').take(3).collect::<Vec<_>>().join(":");
            Some(json!({ "oui": oui, "name": name.trim() }))
        })
        .collect()
}

async fn bluetooth_devices() -> Vec<Value> {
    match run_command("bluetoothctl", &["devices", "Paired"]).await {
        Ok(out) => parse_bluetooth(&out),
        Err(e) => {
            debug!("cannot list bluetooth devices: {e}");
            Vec::new()
        },
    }
}

/// Decodes the identifying fields of a base EDID block.
#[must_use]
pub fn parse_edid(edid: &[u8]) -> Option<Map<String, Value>> {
    if edid.len() < 128 || edid[..8] != EDID_HEADER {
        return None;
    }
    let mut out = Map::new();
    let id = u16::from_be_bytes([edid[8], edid[9]]);
    let vendor: String = [10u16, 5, 0]
        .into_iter()
        .map(|shift| char::from(b'A' - 1 + u8::try_from((id >> shift) & 0x1f).unwrap_or(0)))
        .collect();
    out.insert("vendor".into(), json!(vendor));
    out.insert(
        "product".into(),
        json!(format!("{:04x}", u16::from_le_bytes([edid[10], edid[11]]))),
    );
    out.insert("year".into(), json!(1990 + u32::from(edid[17])));
    for offset in [54, 72, 90, 108] {
        let block = &edid[offset..offset + 18];
        if block[..3] == [0, 0, 0] && block[3] == 0xfc {
            let name: String = block[5..]
                .iter()
                .take_while(|b| **b != 0x0a)
                .map(|b| char::from(*b))
                .collect();
            out.insert("name".into(), json!(name.trim_end()));
        }
    }
    Some(out)
}

/// Displays with a readable EDID under `<sys>/class/drm`.
#[must_use]
pub fn monitors(sysfs: &Path) -> Vec<Value> {
    sorted_dir(&sysfs.join("class/drm"))
        .into_iter()
        .filter_map(|connector| {
            let edid = std::fs::read(connector.join("edid")).ok()?;
            let mut entry = parse_edid(&edid)?;
            let name = file_name(&connector);
            let port = name.split_once('-').map_or(name.as_str(), |(_, port)| port);
            entry.insert("connector".into(), json!(port));
            Some(Value::Object(entry))
        })
        .collect()
}

/// Block-device filesystems listed in `<proc>/mounts`.
#[must_use]
pub fn filesystems(proc_root: &Path) -> Vec<Value> {
    let Ok(mounts) = std::fs::read_to_string(proc_root.join("mounts")) else {
        return Vec::new();
    };
    mounts
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mountpoint = fields.next()?;
            let fstype = fields.next()?;
            device.starts_with("/dev/").then(|| {
                json!({ "device": device, "mountpoint": mountpoint, "fstype": fstype })
            })
        })
        .collect()
}

/// Batteries under `<sys>/class/power_supply`.
#[must_use]
pub fn batteries(sysfs: &Path) -> Vec<Value> {
    sorted_dir(&sysfs.join("class/power_supply"))
        .into_iter()
        .filter(|supply| read_trimmed(&supply.join("type")).as_deref() == Some("Battery"))
        .map(|supply| {
            let mut entry = attributes(
                &supply,
                &[
                    "manufacturer",
                    "model_name",
                    "technology",
                    "charge_full_design",
                    "energy_full_design",
                    "cycle_count",
                ],
            );
            entry.insert("name".into(), json!(file_name(&supply)));
            Value::Object(entry)
        })
        .collect()
}

/// Network interfaces under `<sys>/class/net`, excluding loopback.
#[must_use]
pub fn network(sysfs: &Path) -> Vec<Value> {
    sorted_dir(&sysfs.join("class/net"))
        .into_iter()
        .filter(|iface| file_name(iface) != "lo")
        .map(|iface| {
            let driver = std::fs::read_link(iface.join("device/driver"))
                .ok()
                .map(|target| file_name(&target));
            let kind = if iface.join("wireless").exists() {
                "wireless"
            } else {
                "wired"
            };
            json!({ "name": file_name(&iface), "type": kind, "driver": driver })
        })
        .collect()
}

/// Parses `/proc/meminfo` into kilobyte totals.
#[must_use]
pub fn parse_meminfo(content: &str) -> BTreeMap<String, u64> {
    content
        .lines()
        .filter_map(|line| {
            let (key, rest) = line.split_once(':')?;
            let value = rest.split_whitespace().next()?.parse().ok()?;
            Some((key.to_string(), value))
        })
        .collect()
}

async fn system_summary(ctx: &HelperContext) -> Value {
    let proc_root = ctx.services.proc.root();
    let meminfo = std::fs::read_to_string(proc_root.join("meminfo"))
        .map(|content| parse_meminfo(&content))
        .unwrap_or_default();
    let release = system::os_release(Path::new("/etc/os-release"));
    let devmode = match run_command("steamos-readonly", &["status"]).await {
        Ok(out) => Some(out.trim() == "disabled"),
        Err(_) => None,
    };
    let vram = read_trimmed(
        &ctx.services
            .sysfs
            .join("class/drm/card0/device/mem_info_vram_total"),
    )
    .and_then(|v| v.parse::<u64>().ok());
    json!({
        "branch": system::distro_branch().await,
        "release": release.get("VERSION_ID"),
        "build": release.get("BUILD_ID"),
        "devmode": devmode,
        "ram": meminfo.get("MemTotal"),
        "swap": meminfo.get("SwapTotal"),
        "vram": vram,
    })
}

async fn enumerate(ctx: &HelperContext, kind: Kind) -> Vec<Value> {
    let sysfs = &ctx.services.sysfs;
    match kind {
        Kind::Usb => usb_devices(sysfs),
        Kind::Bluetooth => bluetooth_devices().await,
        Kind::Monitors => monitors(sysfs),
        Kind::Filesystems => filesystems(ctx.services.proc.root()),
        Kind::Batteries => batteries(sysfs),
        Kind::Network => network(sysfs),
        Kind::System => vec![system_summary(ctx).await],
    }
}

/// Appends entries of `fresh` not already present in `cached`.
///
/// Returns the number added.
pub fn merge(cached: &mut Vec<Value>, fresh: Vec<Value>) -> usize {
    let mut added = 0;
    for entry in fresh {
        if !cached.contains(&entry) {
            cached.push(entry);
            added += 1;
        }
    }
    added
}

/// Whether a cache started at `timestamp` is due for rotation.
#[must_use]
pub fn rotation_due(timestamp: Option<f64>, interval: f64, now: f64) -> bool {
    timestamp.is_some_and(|ts| now - ts >= interval)
}

/// Collects and uploads hardware inventories.
#[derive(Debug, Clone, Copy, Default)]
pub struct SysinfoHelper;

impl SysinfoHelper {
    fn rotate(ctx: &HelperContext, cache: &Map<String, Value>, now: f64) -> Result<PathBuf, HelperError> {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let name = format!("{}.json", now as u64);
        let mut file = StagingFile::create(&ctx.pending_dir(), &name)?;
        serde_json::to_writer(&mut file, cache)?;
        Ok(file.commit()?)
    }
}

#[async_trait]
impl Helper for SysinfoHelper {
    fn name(&self) -> &'static str {
        "sysinfo"
    }

    fn valid_extensions(&self) -> &'static [&'static str] {
        &[".json"]
    }

    fn has_collector(&self) -> bool {
        true
    }

    fn runner_paced(&self) -> bool {
        false
    }

    async fn collect(&self, ctx: &HelperContext) -> Result<bool, HelperError> {
        let mut cache = match ctx.data.get("cache") {
            Some(Value::Object(cache)) => cache,
            _ => Map::new(),
        };
        let mut added = 0;
        for kind in Kind::ALL {
            let fresh = enumerate(ctx, kind).await;
            let slot = cache
                .entry(kind.key())
                .or_insert_with(|| Value::Array(Vec::new()));
            if !slot.is_array() {
                *slot = Value::Array(Vec::new());
            }
            if let Value::Array(cached) = slot {
                added += merge(cached, fresh);
            }
        }
        debug!(added, "sysinfo cache updated");

        let now = epoch_secs();
        let interval = ctx.config.get_f64("interval").unwrap_or(DEFAULT_INTERVAL);
        let timestamp = ctx.data.get_f64("timestamp");
        let rotated = if rotation_due(timestamp, interval, now) {
            let path = Self::rotate(ctx, &cache, now)?;
            info!(path = %path.display(), "sysinfo report staged");
            cache = Map::new();
            ctx.data.set("timestamp", now);
            true
        } else {
            if timestamp.is_none() {
                ctx.data.set("timestamp", now);
            }
            false
        };
        ctx.data.set("cache", Value::Object(cache));
        ctx.data.write();
        Ok(rotated)
    }

    async fn submit(&self, ctx: &HelperContext, path: &Path) -> HelperResult {
        let report = match read_json_artifact(path).await {
            Ok(report @ Value::Object(_)) => report,
            Ok(_) => return HelperResult::PermanentError,
            Err(result) => return result,
        };
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
        let mut event = Event::new();
        event.message = Some(String::from("System information"));
        event.fingerprint = vec![String::from("sysinfo")];
        event
            .attachments
            .push(Attachment::json("sysinfo.json", report.to_string().into_bytes()));
        match sentry::send_event(ctx.http(), &dsn, &event).await {
            Ok(_) => HelperResult::Ok,
            Err(e) => {
                warn!(path = %path.display(), "sysinfo submission failed: {e}");
                e.classify()
            },
        }
    }

    fn methods(&self) -> &'static [&'static str] {
        &[
            "GetUsb",
            "GetBluetooth",
            "GetMonitors",
            "GetFilesystems",
            "GetBatteries",
            "GetNetwork",
            "GetSystem",
        ]
    }

    async fn call(
        &self,
        ctx: &HelperContext,
        method: &str,
        _args: &[Value],
    ) -> Result<Value, MethodError> {
        let kind =
            Kind::from_method(method).ok_or_else(|| MethodError::UnknownMethod(method.to_string()))?;
        let entries = enumerate(ctx, kind).await;
        let body = if kind == Kind::System {
            entries.into_iter().next().unwrap_or(Value::Null)
        } else {
            Value::Array(entries)
        };
        Ok(Value::String(body.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::helpers::testing::Fixture;

    fn write(path: &Path, content: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn edid(name: &str) -> Vec<u8> {
        let mut edid = vec![0u8; 128];
        edid[..8].copy_from_slice(&EDID_HEADER);
        // "VLV"
        let id: u16 = (22 << 10) | (12 << 5) | 22;
        edid[8..10].copy_from_slice(&id.to_be_bytes());
        edid[10..12].copy_from_slice(&0x3003u16.to_le_bytes());
        edid[17] = 32;
        edid[108..111].copy_from_slice(&[0, 0, 0]);
        edid[111] = 0xfc;
        let mut text = name.as_bytes().to_vec();
        text.push(0x0a);
        edid[113..113 + text.len()].copy_from_slice(&text);
        edid
    }

    #[test]
    fn edid_fields() {
        let parsed = parse_edid(&edid("ANX7530 U")).unwrap();
        assert_eq!(parsed["vendor"], "VLV");
        assert_eq!(parsed["product"], "3003");
        assert_eq!(parsed["year"], 2022);
        assert_eq!(parsed["name"], "ANX7530 U");
        assert!(parse_edid(&[0u8; 128]).is_none());
        assert!(parse_edid(&EDID_HEADER).is_none());
    }

    #[test]
    fn sysfs_enumeration() {
        let dir = tempfile::tempdir().unwrap();
        let sys = dir.path();
        write(&sys.join("bus/usb/devices/1-1/idVendor"), b"28de\n");
        write(&sys.join("bus/usb/devices/1-1/idProduct"), b"1205\n");
        write(&sys.join("bus/usb/devices/1-1/product"), b"Steam Controller\n");
        write(&sys.join("bus/usb/devices/1-1:1.0/bInterfaceClass"), b"03\n");
        write(&sys.join("class/drm/card0-eDP-1/edid"), &edid("Panel"));
        write(&sys.join("class/drm/card0-DP-1/edid"), b"");
        write(&sys.join("class/power_supply/BAT1/type"), b"Battery\n");
        write(&sys.join("class/power_supply/BAT1/cycle_count"), b"12\n");
        write(&sys.join("class/power_supply/ACAD/type"), b"Mains\n");
        write(&sys.join("class/net/lo/mtu"), b"65536\n");
        write(&sys.join("class/net/wlan0/wireless/.keep"), b"");

        let usb = usb_devices(sys);
        assert_eq!(usb.len(), 1);
        assert_eq!(usb[0]["vid"], "28de");
        assert_eq!(usb[0]["product"], "Steam Controller");

        let displays = monitors(sys);
        assert_eq!(displays.len(), 1);
        assert_eq!(displays[0]["connector"], "eDP-1");

        let bats = batteries(sys);
        assert_eq!(bats.len(), 1);
        assert_eq!(bats[0]["name"], "BAT1");
        assert_eq!(bats[0]["cycle_count"], "12");

        let nets = network(sys);
        assert_eq!(nets.len(), 1);
        assert_eq!(nets[0]["type"], "wireless");
    }

    #[test]
    fn mounts_and_meminfo() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join("mounts"),
            b"proc /proc proc rw 0 0\n/dev/nvme0n1p8 /home ext4 rw 0 0\n",
        );
        let mounted = filesystems(dir.path());
        assert_eq!(mounted.len(), 1);
        assert_eq!(mounted[0]["mountpoint"], "/home");

        let mem = parse_meminfo("MemTotal:       16252928 kB\nSwapTotal: 1048572 kB\n");
        assert_eq!(mem["MemTotal"], 16_252_928);
        assert_eq!(mem["SwapTotal"], 1_048_572);
    }

    #[test]
    fn bluetooth_keeps_oui_only() {
        let parsed = parse_bluetooth("Device 12:34:56:78:9A:BC Controller\ngarbage\n");
        assert_eq!(parsed, vec![json!({ "oui": "12:34:56", "name": "Controller" })]);
    }

    #[test]
    fn merge_dedupes() {
        let mut cached = vec![json!({ "vid": "1" })];
        let added = merge(&mut cached, vec![json!({ "vid": "1" }), json!({ "vid": "2" })]);
        assert_eq!(added, 1);
        assert_eq!(cached.len(), 2);
    }

    #[tokio::test]
    async fn rotates_after_interval() {
        let fixture = Fixture::new();
        fixture.set("helpers.sysinfo", "interval", "1");
        let ctx = fixture.context("sysinfo");

        ctx.data.set("timestamp", epoch_secs() - 0.5);
        assert!(!SysinfoHelper.collect(&ctx).await.unwrap());
        assert!(fixture.services.staging.list_pending("sysinfo").unwrap().is_empty());

        ctx.data.set("timestamp", epoch_secs() - 2.0);
        assert!(SysinfoHelper.collect(&ctx).await.unwrap());
        let pending = fixture.services.staging.list_pending("sysinfo").unwrap();
        assert_eq!(pending.len(), 1);
        assert!(
            std::path::Path::new(&pending[0])
                .extension()
                .is_some_and(|ext| ext == "json")
        );
        assert_eq!(ctx.data.get("cache"), Some(json!({})));
    }

    #[test]
    fn rotation_boundaries() {
        assert!(rotation_due(Some(100.0), 1.0, 102.0));
        assert!(!rotation_due(Some(100.0), 1.0, 100.5));
        assert!(!rotation_due(None, 1.0, 100.0));
    }

    #[tokio::test]
    async fn unknown_method() {
        let fixture = Fixture::new();
        let ctx = fixture.context("sysinfo");
        let err = SysinfoHelper.call(&ctx, "GetNothing", &[]).await.unwrap_err();
        assert!(matches!(err, MethodError::UnknownMethod(_)));
        let usb = SysinfoHelper.call(&ctx, "GetUsb", &[]).await.unwrap();
        assert_eq!(usb, json!("[]"));
    }
}
