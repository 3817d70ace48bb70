//! Device coredumps packaged by the `devcoredump` hook.
//!
//! The archives are kept for local inspection only: every artifact ends up
//! in `failed/` after its metadata has been logged.

use std::io::{Cursor, Read};
use std::path::Path;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{info, warn};

use super::{Helper, HelperContext, HelperResult, read_artifact};
use crate::remote::sentry::Event;

/// Name of the metadata entry inside the archive.
pub const METADATA_ENTRY: &str = "metadata.json";

/// Name of the raw dump entry inside the archive.
pub const DUMP_ENTRY: &str = "dump";

/// Reads `metadata.json` out of a devcoredump archive.
pub fn read_metadata(bytes: &[u8]) -> Option<Map<String, Value>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).ok()?;
    let mut entry = archive.by_name(METADATA_ENTRY).ok()?;
    let mut raw = Vec::new();
    entry.read_to_end(&mut raw).ok()?;
    match serde_json::from_slice(&raw).ok()? {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// Builds the event describing one device coredump.
#[must_use]
pub fn build_event(metadata: &Map<String, Value>) -> Event {
    let mut event = Event::new();
    for key in ["kernel", "branch", "failing_device", "driver"] {
        if let Some(value) = metadata.get(key).and_then(Value::as_str) {
            event.tag(key, value);
        }
    }
    let driver = metadata
        .get("driver")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    event.message = Some(format!("Device coredump ({driver})"));
    event.fingerprint = vec![String::from("devcoredump"), format!("driver:{driver}")];
    if let Some(journal) = metadata.get("journal") {
        event.extra("journal", journal.clone());
    }
    event.timestamp = metadata.get("timestamp").and_then(Value::as_f64);
    event
}

/// Files device coredumps away.
#[derive(Debug, Clone, Copy, Default)]
pub struct DevcoredumpHelper;

#[async_trait]
impl Helper for DevcoredumpHelper {
    fn name(&self) -> &'static str {
        "devcoredump"
    }

    fn valid_extensions(&self) -> &'static [&'static str] {
        &[".zip"]
    }

    async fn submit(&self, ctx: &HelperContext, path: &Path) -> HelperResult {
        let bytes = match read_artifact(path).await {
            Ok(bytes) => bytes,
            Err(result) => return result,
        };
        match read_metadata(&bytes) {
            Some(metadata) => {
                let event = build_event(&metadata);
                let tags = Value::Object(event.tags.clone());
                info!(
                    helper = %ctx.name,
                    path = %path.display(),
                    tags = %tags,
                    "device coredump recorded"
                );
            },
            None => warn!(path = %path.display(), "device coredump has no readable metadata"),
        }
        HelperResult::PermanentError
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serde_json::json;

    use super::*;
    use crate::helpers::testing::Fixture;

    fn archive(metadata: &Value) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default();
        writer.start_file(METADATA_ENTRY, options).unwrap();
        writer
            .write_all(serde_json::to_vec(metadata).unwrap().as_slice())
            .unwrap();
        writer.start_file(DUMP_ENTRY, options).unwrap();
        writer.write_all(b"\x00\x01").unwrap();
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn tags_and_fingerprint() {
        let zip = archive(&json!({
            "kernel": "6.1.52",
            "branch": "main",
            "failing_device": "/sys/devices/pci0000:00/0000:00:08.1/0000:04:00.0",
            "driver": "ath11k_pci",
            "journal": ["ath11k_pci: firmware crashed"],
        }));
        let metadata = read_metadata(&zip).unwrap();
        let event = build_event(&metadata);
        assert_eq!(event.tags["driver"], "ath11k_pci");
        assert_eq!(event.tags["branch"], "main");
        assert_eq!(event.tags.len(), 4);
        assert_eq!(event.fingerprint, vec!["devcoredump", "driver:ath11k_pci"]);
    }

    #[tokio::test]
    async fn always_permanent() {
        let fixture = Fixture::new();
        let ctx = fixture.context("devcoredump");
        let good = ctx.pending_dir().join("good.zip");
        std::fs::write(&good, archive(&json!({ "driver": "mt7921e" }))).unwrap();
        let bad = ctx.pending_dir().join("bad.zip");
        std::fs::write(&bad, b"").unwrap();
        assert_eq!(
            DevcoredumpHelper.submit(&ctx, &good).await,
            HelperResult::PermanentError
        );
        assert_eq!(
            DevcoredumpHelper.submit(&ctx, &bad).await,
            HelperResult::PermanentError
        );
    }
}
