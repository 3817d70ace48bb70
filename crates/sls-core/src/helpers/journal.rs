//! Journals of failed systemd units.
//!
//! For each unit listed in `helpers.journal.units` whose `ActiveState` is
//! `failed`, the entries logged since the stored cursor are grouped into
//! invocations and appended to `pending/journal/<escaped-unit>.json`.
//! Invocations that have not finished (their last entry carries no
//! `UNIT_RESULT`) are left for a later pass.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use super::{Helper, HelperContext, HelperError, HelperResult, read_json_artifact};
use crate::remote::sentry::{self, Attachment, Dsn, Event};
use crate::staging::StagingFile;
use crate::system::run_command;
use crate::util::{escape, unescape};

/// One journal entry as emitted by `journalctl -o json`.
pub type Entry = Map<String, Value>;

/// Where unit state and journal entries come from.
#[async_trait]
pub trait JournalSource: Send + Sync {
    /// The unit's `ActiveState`.
    async fn active_state(&self, unit: &str) -> Result<String, HelperError>;

    /// Entries for `unit` logged after `cursor`, oldest first.
    async fn entries(&self, unit: &str, cursor: Option<&str>) -> Result<Vec<Entry>, HelperError>;
}

/// [`JournalSource`] backed by `systemctl` and `journalctl`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemdJournal;

#[async_trait]
impl JournalSource for SystemdJournal {
    async fn active_state(&self, unit: &str) -> Result<String, HelperError> {
        let out = run_command(
            "systemctl",
            &["show", "--property=ActiveState", "--value", unit],
        )
        .await?;
        Ok(out.trim().to_string())
    }

    async fn entries(&self, unit: &str, cursor: Option<&str>) -> Result<Vec<Entry>, HelperError> {
        let mut args = vec!["-o", "json", "--no-pager", "-u", unit];
        if let Some(cursor) = cursor {
            args.push("--after-cursor");
            args.push(cursor);
        }
        let out = run_command("journalctl", &args).await?;
        Ok(parse_entries(&out))
    }
}

/// Parses `journalctl -o json` output, skipping unparsable lines.
#[must_use]
pub fn parse_entries(output: &str) -> Vec<Entry> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(Value::Object(entry)) => Some(entry),
            _ => {
                debug!("skipping malformed journal line");
                None
            },
        })
        .collect()
}

/// Groups entries by `INVOCATION_ID`, in order of first appearance.
///
/// Entries without an invocation id are dropped, as are invocations whose
/// last entry lacks `UNIT_RESULT`.
#[must_use]
pub fn group_invocations(entries: Vec<Entry>) -> Vec<Vec<Entry>> {
    let mut groups: Vec<(String, Vec<Entry>)> = Vec::new();
    for entry in entries {
        let Some(id) = entry.get("INVOCATION_ID").and_then(Value::as_str) else {
            continue;
        };
        let id = id.to_string();
        match groups.iter_mut().find(|(gid, _)| *gid == id) {
            Some((_, group)) => group.push(entry),
            None => groups.push((id, vec![entry])),
        }
    }
    groups
        .into_iter()
        .map(|(_, group)| group)
        .filter(|group| group.last().is_some_and(|e| e.contains_key("UNIT_RESULT")))
        .collect()
}

/// Collects and uploads failed-unit journals.
#[derive(Clone)]
pub struct JournalHelper {
    source: Arc<dyn JournalSource>,
}

impl std::fmt::Debug for JournalHelper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalHelper").finish_non_exhaustive()
    }
}

impl Default for JournalHelper {
    fn default() -> Self {
        Self::with_source(Arc::new(SystemdJournal))
    }
}

impl JournalHelper {
    /// Uses `source` instead of the system journal.
    #[must_use]
    pub fn with_source(source: Arc<dyn JournalSource>) -> Self {
        Self { source }
    }

    async fn collect_unit(&self, ctx: &HelperContext, unit: &str) -> Result<bool, HelperError> {
        let state = self.source.active_state(unit).await?;
        if state != "failed" {
            debug!(unit, state = %state, "unit not failed");
            return Ok(false);
        }
        let cursor_key = format!("cursor.{}", escape(unit));
        let cursor = ctx.data.get_str(&cursor_key);
        let entries = self.source.entries(unit, cursor.as_deref()).await?;
        let invocations = group_invocations(entries);
        let Some(last_cursor) = invocations
            .last()
            .and_then(|group| group.last())
            .and_then(|e| e.get("__CURSOR"))
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            return Ok(false);
        };

        let name = format!("{}.json", escape(unit));
        let dir = ctx.pending_dir();
        let existing = dir.join(&name);
        let mut all: Vec<Value> = match std::fs::read(&existing) {
            Ok(raw) => match serde_json::from_slice(&raw) {
                Ok(Value::Array(items)) => items,
                _ => {
                    warn!(path = %existing.display(), "replacing malformed journal artifact");
                    Vec::new()
                },
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(HelperError::io(existing, e)),
        };
        let added = invocations.len();
        all.extend(
            invocations
                .into_iter()
                .map(|group| Value::Array(group.into_iter().map(Value::Object).collect())),
        );

        write_invocations(&dir, &name, &all)?;

        ctx.data.set(&cursor_key, last_cursor);
        ctx.data.write();
        info!(unit, invocations = added, "staged unit journal");
        Ok(true)
    }
}

/// Atomically replaces `dir/name` with `invocations`.
fn write_invocations(dir: &Path, name: &str, invocations: &[Value]) -> Result<(), HelperError> {
    let mut file = StagingFile::create(dir, name)?;
    serde_json::to_writer(&mut file, invocations)?;
    file.flush()
        .map_err(|e| HelperError::io(file.path().to_path_buf(), e))?;
    file.commit()?;
    Ok(())
}

/// Keeps only the invocations from `sent` onwards in the artifact at `path`.
fn retain_unsent(path: &Path, invocations: &[Value], sent: usize) {
    if sent == 0 {
        return;
    }
    let (Some(dir), Some(name)) = (path.parent(), path.file_name().and_then(|n| n.to_str())) else {
        return;
    };
    match write_invocations(dir, name, &invocations[sent..]) {
        Ok(()) => debug!(path = %path.display(), sent, "dropped submitted invocations"),
        Err(e) => warn!(path = %path.display(), "failed to rewrite journal artifact: {e}"),
    }
}

/// Builds the event for one invocation of `unit`.
#[must_use]
pub fn build_event(unit: &str, invocation: &[Value]) -> Event {
    let last = invocation.last().and_then(Value::as_object);
    let field = |key: &str| last.and_then(|e| e.get(key)).and_then(Value::as_str);
    let result = field("UNIT_RESULT").unwrap_or("unknown");

    let mut event = Event::new();
    event.message = Some(format!("{unit} failed ({result})"));
    event.tag("unit", unit);
    event.tag("unit_result", result);
    if let Some(id) = field("INVOCATION_ID") {
        event.tag("invocation_id", id);
    }
    if let Some(boot) = field("_BOOT_ID") {
        event.extra("boot_id", boot);
    }
    event.fingerprint = vec![String::from("journal"), unit.to_string(), result.to_string()];

    let text: String = invocation
        .iter()
        .filter_map(|e| e.get("MESSAGE").and_then(Value::as_str))
        .fold(String::new(), |mut acc, line| {
            acc.push_str(line);
            acc.push('\n');
            acc
        });
    event
        .attachments
        .push(Attachment::binary("journal.txt", text.into_bytes()));
    event
        .attachments
        .push(Attachment::json("journal.json", json!(invocation).to_string().into_bytes()));
    event
}

#[async_trait]
impl Helper for JournalHelper {
    fn name(&self) -> &'static str {
        "journal"
    }

    fn valid_extensions(&self) -> &'static [&'static str] {
        &[".json"]
    }

    fn has_collector(&self) -> bool {
        true
    }

    async fn collect(&self, ctx: &HelperContext) -> Result<bool, HelperError> {
        let mut staged = false;
        for unit in ctx.config.get_list("units") {
            match self.collect_unit(ctx, &unit).await {
                Ok(new) => staged |= new,
                Err(e) => warn!(unit = %unit, "failed to collect journal: {e}"),
            }
        }
        Ok(staged)
    }

    async fn submit(&self, ctx: &HelperContext, path: &Path) -> HelperResult {
        let invocations = match read_json_artifact(path).await {
            Ok(Value::Array(items)) => items,
            Ok(_) => return HelperResult::PermanentError,
            Err(result) => return result,
        };
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let unit = unescape(&stem);

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
        for (sent, invocation) in invocations.iter().enumerate() {
            let Some(entries) = invocation.as_array() else {
                retain_unsent(path, &invocations, sent);
                return HelperResult::PermanentError;
            };
            let event = build_event(&unit, entries);
            if let Err(e) = sentry::send_event(ctx.http(), &dsn, &event).await {
                warn!(unit = %unit, "journal submission failed: {e}");
                retain_unsent(path, &invocations, sent);
                return e.classify();
            }
        }
        HelperResult::Ok
    }
}
