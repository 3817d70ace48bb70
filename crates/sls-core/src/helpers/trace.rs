//! Kernel tracing events forwarded by the ftrace reader.
//!
//! The reader calls `LogEvent(line, data)` on this helper's object for
//! every event it is subscribed to. Recognised events are staged as
//! `pending/trace/<ns>-<kind>.json` and uploaded on the next cycle.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::{Helper, HelperContext, HelperError, HelperResult, MethodError, read_json_artifact};
use crate::remote::sentry::{self, Dsn, Event};
use crate::staging::StagingFile;
use crate::util::epoch_nanos;

static TRACE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?P<task>.+)-(?P<pid>\d+)\s+(?:\(\s*\S+\)\s+)?\[(?P<cpu>\d+)\]\s+(?:(?P<flags>\S+)\s+)?(?P<ts>\d+\.\d+):\s+(?P<function>[^:\s]+):\s*(?P<args>.*)$",
    )
    .expect("static regex")
});

/// Event categories worth reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    /// The OOM killer picked a victim.
    Oom,
    /// A task took a split-lock trap.
    SplitLock,
}

impl TraceKind {
    /// Classifies a trace function name.
    #[must_use]
    pub fn from_function(function: &str) -> Option<Self> {
        match function {
            "mark_victim" | "oom_kill" => Some(Self::Oom),
            f if f.contains("split_lock") => Some(Self::SplitLock),
            _ => None,
        }
    }

    /// Name used in file names and tags.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Oom => "oom",
            Self::SplitLock => "split_lock",
        }
    }
}

/// One parsed trace line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Category.
    pub kind: TraceKind,
    /// Task comm as printed by ftrace.
    pub task: String,
    /// Task pid.
    pub pid: u32,
    /// CPU the event fired on.
    pub cpu: u32,
    /// Trace flags column, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<String>,
    /// Trace clock timestamp, in seconds.
    pub timestamp: f64,
    /// Trace function.
    pub function: String,
    /// `key=value` arguments.
    pub args: BTreeMap<String, String>,
    /// Application id, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appid: Option<u32>,
    /// Extra data supplied by the reader.
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl TraceEvent {
    /// Parses a line; `None` for malformed or uninteresting events.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let caps = TRACE_LINE.captures(line.trim_end())?;
        let function = caps["function"].to_string();
        let kind = TraceKind::from_function(&function)?;
        Some(Self {
            kind,
            task: caps["task"].trim().to_string(),
            pid: caps["pid"].parse().ok()?,
            cpu: caps["cpu"].parse().ok()?,
            flags: caps.name("flags").map(|m| m.as_str().to_string()),
            timestamp: caps["ts"].parse().ok()?,
            function,
            args: parse_args(&caps["args"]),
            appid: None,
            data: Map::new(),
        })
    }

    /// Pid the event is about: the OOM victim if named, else the task.
    #[must_use]
    pub fn subject_pid(&self) -> u32 {
        self.args
            .get("pid")
            .and_then(|p| p.parse().ok())
            .unwrap_or(self.pid)
    }
}

/// Splits `a=1 b=two` into pairs; bare words are ignored.
#[must_use]
pub fn parse_args(args: &str) -> BTreeMap<String, String> {
    args.split_whitespace()
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.trim_end_matches(',').to_string()))
        .collect()
}

fn appid_value(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Stages and uploads trace events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceHelper;

impl TraceHelper {
    /// Parses, enriches and stages one event.
    pub fn log_event(
        &self,
        ctx: &HelperContext,
        line: &str,
        data: Map<String, Value>,
    ) -> Result<TraceEvent, MethodError> {
        let mut event = TraceEvent::parse(line).ok_or_else(|| {
            MethodError::InvalidArguments(format!("unrecognised trace line: {line}"))
        })?;
        event.appid = data
            .get("appid")
            .and_then(appid_value)
            .or_else(|| ctx.services.proc.appid(event.subject_pid()));
        event.data = data;

        let name = format!("{}-{}.json", epoch_nanos(), event.kind.as_str());
        let dir = ctx.pending_dir();
        if !dir.is_dir() {
            ctx.staging()
                .ensure_category(&ctx.name, None)
                .map_err(HelperError::from)?;
        }
        let mut file = StagingFile::create(&dir, &name).map_err(HelperError::from)?;
        serde_json::to_writer(&mut file, &event).map_err(HelperError::from)?;
        file.flush()
            .map_err(|e| HelperError::io(file.path().to_path_buf(), e))?;
        let path = file.commit().map_err(HelperError::from)?;
        info!(kind = event.kind.as_str(), task = %event.task, path = %path.display(), "trace event staged");
        Ok(event)
    }
}

/// Builds the event for a staged trace record.
#[must_use]
pub fn build_event(trace: &TraceEvent) -> Event {
    let mut event = Event::new();
    let label = match trace.kind {
        TraceKind::Oom => "OOM kill",
        TraceKind::SplitLock => "Split lock",
    };
    let subject = trace
        .args
        .get("comm")
        .cloned()
        .unwrap_or_else(|| trace.task.clone());
    event.message = Some(format!("{label} ({subject})"));
    event.appid = trace.appid;
    event.tag("kind", trace.kind.as_str());
    event.tag("task", subject.clone());
    event.tag("function", trace.function.clone());
    event.fingerprint = vec![
        String::from("trace"),
        trace.kind.as_str().to_string(),
        subject,
    ];
    for (key, value) in &trace.args {
        event.extra(key, value.clone());
    }
    if !trace.data.is_empty() {
        event.extra("data", Value::Object(trace.data.clone()));
    }
    event
}

#[async_trait]
impl Helper for TraceHelper {
    fn name(&self) -> &'static str {
        "trace"
    }

    fn valid_extensions(&self) -> &'static [&'static str] {
        &[".json"]
    }

    async fn submit(&self, ctx: &HelperContext, path: &Path) -> HelperResult {
        let value = match read_json_artifact(path).await {
            Ok(value) => value,
            Err(result) => return result,
        };
        let trace: TraceEvent = match serde_json::from_value(value) {
            Ok(trace) => trace,
            Err(e) => {
                warn!(path = %path.display(), "malformed trace record: {e}");
                return HelperResult::PermanentError;
            },
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
        match sentry::send_event(ctx.http(), &dsn, &build_event(&trace)).await {
            Ok(id) => {
                debug!(event_id = %id, "trace event submitted");
                HelperResult::Ok
            },
            Err(e) => {
                warn!(path = %path.display(), "trace submission failed: {e}");
                e.classify()
            },
        }
    }

    fn methods(&self) -> &'static [&'static str] {
        &["LogEvent"]
    }

    async fn call(
        &self,
        ctx: &HelperContext,
        method: &str,
        args: &[Value],
    ) -> Result<Value, MethodError> {
        if method != "LogEvent" {
            return Err(MethodError::UnknownMethod(method.to_string()));
        }
        let Some(line) = args.first().and_then(Value::as_str) else {
            return Err(MethodError::InvalidArguments(String::from(
                "LogEvent expects a trace line",
            )));
        };
        let data = match args.get(1) {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(data)) => data.clone(),
            Some(_) => {
                return Err(MethodError::InvalidArguments(String::from(
                    "LogEvent data must be an object",
                )));
            },
        };
        self.log_event(ctx, line, data)?;
        Ok(Value::Null)
    }
}
