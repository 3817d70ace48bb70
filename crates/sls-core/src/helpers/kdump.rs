//! Kernel panic reports captured by kdump.
//!
//! Each artifact is a zip holding at least one `dmesg*` entry. The panic
//! note and the `<TASK>` call trace are extracted from that log and sent as
//! a structured event with the raw log attached.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use super::{Helper, HelperContext, HelperResult, read_artifact};
use crate::remote::sentry::{self, Attachment, Dsn, Event};

static TIMESTAMP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[\s*\d+\.\d+\]\s?").expect("static regex"));

static FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\? )?([A-Za-z0-9_.$]+)\+0x([0-9a-f]+)/0x([0-9a-f]+)(?: \[(\S+)\])?")
        .expect("static regex")
});

static REGISTER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([A-Z][A-Z0-9]{1,5}): (?:[0-9a-f]{4}:)?([0-9a-f]{4,16})(?:\s|$)")
        .expect("static regex")
});

/// Registers reported in the event.
const REGISTERS: &[&str] = &[
    "RSP", "RAX", "RBX", "RCX", "RDX", "RSI", "RDI", "RBP", "R08", "R09", "R10", "R11", "R12",
    "R13", "R14", "R15",
];

/// One call-trace entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Frame {
    /// Symbol name.
    pub function: String,
    /// Offset into the symbol.
    pub offset: u64,
    /// Symbol size.
    pub size: u64,
    /// Owning module, for out-of-tree or loadable code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    /// Whether the unwinder marked the frame with `?`.
    pub unreliable: bool,
}

/// What was recovered from a dmesg log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PanicReport {
    /// Lines from `Kernel panic -` up to the terminator.
    pub note: Vec<String>,
    /// Call trace, innermost first.
    pub frames: Vec<Frame>,
    /// Register values, hex strings.
    pub registers: BTreeMap<String, String>,
}

fn strip_timestamp(line: &str) -> &str {
    TIMESTAMP
        .find(line)
        .map_or(line, |m| &line[m.end()..])
}

/// Parses one `symbol+0xoff/0xsize [module]` line.
#[must_use]
pub fn parse_frame(line: &str) -> Option<Frame> {
    let caps = FRAME.captures(line)?;
    Some(Frame {
        function: caps[2].to_string(),
        offset: u64::from_str_radix(&caps[3], 16).ok()?,
        size: u64::from_str_radix(&caps[4], 16).ok()?,
        module: caps.get(5).map(|m| m.as_str().to_string()),
        unreliable: caps.get(1).is_some(),
    })
}

/// Parses a dmesg log.
#[must_use]
pub fn parse_dmesg(log: &str) -> PanicReport {
    let mut report = PanicReport::default();
    let mut in_note = false;
    let mut note_done = false;
    let mut in_task = false;
    let mut trace_done = false;

    for raw in log.lines() {
        let line = strip_timestamp(raw);

        if !note_done {
            if !in_note && line.contains("Kernel panic -") {
                in_note = true;
            }
            if in_note {
                if line.contains("Kernel Offset:") || line.contains("Sending NMI") {
                    in_note = false;
                    note_done = true;
                } else {
                    report.note.push(line.to_string());
                }
            }
        }

        if !trace_done {
            if line.starts_with(" <TASK>") || line.trim() == "<TASK>" {
                in_task = true;
                continue;
            }
            if in_task {
                if line.starts_with(" </TASK>") || line.trim() == "</TASK>" {
                    in_task = false;
                    trace_done = true;
                } else if let Some(frame) = parse_frame(line) {
                    report.frames.push(frame);
                }
            }
        }

        let first = line.split_whitespace().next().unwrap_or_default();
        if REGISTERS.iter().any(|r| first.strip_suffix(':') == Some(*r)) {
            for caps in REGISTER.captures_iter(line) {
                let name = &caps[1];
                if REGISTERS.contains(&name) {
                    report
                        .registers
                        .entry(name.to_string())
                        .or_insert_with(|| caps[2].to_string());
                }
            }
        }
    }
    report
}

/// Extracts the first `dmesg*` entry of a kdump zip.
pub fn dmesg_from_zip(bytes: &[u8]) -> Option<(String, String)> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).ok()?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).ok()?;
        let name = entry.name().to_string();
        let base = name.rsplit('/').next().unwrap_or(&name);
        if !base.starts_with("dmesg") {
            continue;
        }
        let mut content = Vec::new();
        entry.read_to_end(&mut content).ok()?;
        return Some((base.to_string(), String::from_utf8_lossy(&content).into_owned()));
    }
    None
}

/// Builds the event for a parsed report.
#[must_use]
pub fn build_event(report: &PanicReport, dmesg_name: &str, dmesg: &str) -> Event {
    let mut event = Event::new();
    let headline = report
        .note
        .first()
        .map_or_else(|| String::from("Kernel panic"), |l| l.trim().to_string());
    event.message = Some(headline.clone());
    event.extra("note", report.note.join("\n"));

    // Sentry orders frames outermost first.
    let frames: Vec<_> = report
        .frames
        .iter()
        .rev()
        .map(|f| {
            let mut frame = json!({
                "function": f.function,
                "instruction_addr": format!("{:#x}", f.offset),
                "symbol": format!("{}+{:#x}/{:#x}", f.function, f.offset, f.size),
                "in_app": !f.unreliable,
            });
            if let Some(module) = &f.module {
                frame["package"] = json!(module);
            }
            frame
        })
        .collect();
    let mut exception = json!({ "type": "Kernel panic", "value": headline });
    if !frames.is_empty() {
        exception["stacktrace"] = json!({ "frames": frames, "registers": report.registers });
    }
    event.exceptions.push(exception);
    if let Some(top) = report.frames.first() {
        event.fingerprint = vec![String::from("kdump"), top.function.clone()];
    }
    event
        .attachments
        .push(Attachment::binary(dmesg_name, dmesg.as_bytes().to_vec()));
    event
}

/// Uploads kernel panic logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct KdumpHelper;

#[async_trait]
impl Helper for KdumpHelper {
    fn name(&self) -> &'static str {
        "kdump"
    }

    fn valid_extensions(&self) -> &'static [&'static str] {
        &[".zip"]
    }

    async fn submit(&self, ctx: &HelperContext, path: &Path) -> HelperResult {
        let bytes = match read_artifact(path).await {
            Ok(bytes) => bytes,
            Err(result) => return result,
        };
        let Some((dmesg_name, dmesg)) = dmesg_from_zip(&bytes) else {
            warn!(path = %path.display(), "no dmesg log in archive");
            return HelperResult::PermanentError;
        };
        let report = parse_dmesg(&dmesg);
        let event = build_event(&report, &dmesg_name, &dmesg);

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
        match sentry::send_event(ctx.http(), &dsn, &event).await {
            Ok(id) => {
                info!(event_id = %id, frames = report.frames.len(), "kernel panic submitted");
                HelperResult::Ok
            },
            Err(e) => {
                warn!(path = %path.display(), "kdump submission failed: {e}");
                e.classify()
            },
        }
    }
}
