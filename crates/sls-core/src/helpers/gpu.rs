//! GPU reset reports written by the `gpu` hook.

use std::path::Path;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{info, warn};

use super::{Helper, HelperContext, HelperResult, read_json_artifact};
use crate::remote::sentry::{self, Dsn, Event};

/// Keys copied verbatim from the report into event tags.
const TAG_KEYS: &[&str] = &["executable", "comm", "kernel", "branch", "mesa"];

fn string_field(report: &Map<String, Value>, key: &str) -> Option<String> {
    match report.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn appid_field(report: &Map<String, Value>) -> Option<u32> {
    match report.get("appid")? {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Builds the event for a hook report.
#[must_use]
pub fn build_event(report: &Map<String, Value>) -> Event {
    let mut event = Event::new();
    for key in TAG_KEYS {
        if let Some(value) = string_field(report, key) {
            event.tag(key, value);
        }
    }
    event.appid = appid_field(report);

    let culprit = string_field(report, "executable")
        .or_else(|| string_field(report, "comm"))
        .or_else(|| event.appid.map(|a| a.to_string()));
    event.message = Some(culprit.as_ref().map_or_else(
        || String::from("GPU reset"),
        |c| format!("GPU reset ({c})"),
    ));

    event.fingerprint.push(String::from("gpu-reset"));
    if let Some(appid) = event.appid {
        event.fingerprint.push(format!("appid:{appid}"));
    }
    if let Some(exe) = string_field(report, "executable") {
        event.fingerprint.push(format!("executable:{exe}"));
    }
    if let Some(ts) = report.get("timestamp").and_then(Value::as_f64) {
        event.timestamp = Some(ts);
    }
    for key in ["journal", "env", "pid"] {
        if let Some(value) = report.get(key) {
            event.extra(key, value.clone());
        }
    }
    event
}

/// Uploads GPU reset reports.
#[derive(Debug, Clone, Copy, Default)]
pub struct GpuHelper;

#[async_trait]
impl Helper for GpuHelper {
    fn name(&self) -> &'static str {
        "gpu"
    }

    fn valid_extensions(&self) -> &'static [&'static str] {
        &[".json"]
    }

    async fn submit(&self, ctx: &HelperContext, path: &Path) -> HelperResult {
        let report = match read_json_artifact(path).await {
            Ok(Value::Object(report)) => report,
            Ok(_) => {
                warn!(path = %path.display(), "GPU report is not an object");
                return HelperResult::PermanentError;
            },
            Err(result) => return result,
        };
        let event = build_event(&report);

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
                info!(event_id = %id, "GPU reset submitted");
                HelperResult::Ok
            },
            Err(e) => {
                warn!(path = %path.display(), "GPU report submission failed: {e}");
                e.classify()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::helpers::testing::Fixture;
    use crate::remote::testing;

    fn report(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn message_prefers_executable() {
        let event = build_event(&report(json!({
            "appid": 1234,
            "executable": "game.exe",
            "comm": "game",
            "kernel": "6.1.52",
            "mesa": "23.1.3",
        })));
        assert_eq!(event.message.as_deref(), Some("GPU reset (game.exe)"));
        assert_eq!(event.appid, Some(1234));
        assert_eq!(event.tags["kernel"], "6.1.52");
        assert_eq!(event.tags["mesa"], "23.1.3");
        assert!(event.fingerprint.contains(&"appid:1234".to_string()));
        assert!(event.fingerprint.contains(&"executable:game.exe".to_string()));
    }

    #[test]
    fn message_fallbacks() {
        let comm = build_event(&report(json!({ "comm": "game", "appid": 7 })));
        assert_eq!(comm.message.as_deref(), Some("GPU reset (game)"));
        let appid = build_event(&report(json!({ "appid": "7" })));
        assert_eq!(appid.message.as_deref(), Some("GPU reset (7)"));
        let bare = build_event(&report(json!({ "executable": "" })));
        assert_eq!(bare.message.as_deref(), Some("GPU reset"));
        assert_eq!(bare.fingerprint, vec!["gpu-reset"]);
    }

    #[tokio::test]
    async fn malformed_json_is_permanent() {
        let fixture = Fixture::new();
        let ctx = fixture.context("gpu");
        let path = ctx.pending_dir().join("1.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert_eq!(GpuHelper.submit(&ctx, &path).await, HelperResult::PermanentError);
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let (base, _) = testing::serve(vec![(500, String::new())]).await;
        let fixture = Fixture::new();
        let dsn = base.replacen("http://", "http://key@", 1) + "/1";
        fixture.set("helpers.gpu", "dsn", &dsn);
        let ctx = fixture.context("gpu");
        let path = ctx.pending_dir().join("1.json");
        std::fs::write(&path, br#"{"comm":"game"}"#).unwrap();
        assert_eq!(GpuHelper.submit(&ctx, &path).await, HelperResult::TransientError);
    }
}
