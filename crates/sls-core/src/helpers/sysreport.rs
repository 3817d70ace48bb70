//! User-generated system reports.
//!
//! Reports arrive through the `SendReport` object method rather than from a
//! collector. The caller's zip is copied under a friendly identifier that
//! the user can quote to support, then submitted straight away.

use std::io::{Cursor, Write};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use super::{Helper, HelperContext, HelperError, HelperResult, MethodError, read_artifact};
use crate::lockfile::LockRetry;
use crate::remote::sentry::{self, Attachment, Dsn, Event};
use crate::staging::StagingFile;
use crate::util::friendly_id;

const LOCK_ATTEMPTS: u32 = 5;
const LOCK_DELAY: Duration = Duration::from_secs(1);

/// Uploads system reports.
#[derive(Debug, Clone, Copy, Default)]
pub struct SysreportHelper;

impl SysreportHelper {
    /// Copies `source` into pending and submits it.
    ///
    /// Returns the report id when the upload succeeded. A failed upload
    /// leaves the copy in `failed/`.
    pub async fn send_report(&self, ctx: &HelperContext, source: &Path) -> Result<String, MethodError> {
        let bytes = std::fs::read(source).map_err(|e| HelperError::io(source, e))?;
        let id = friendly_id();
        let name = format!("{id}.zip");

        let _lock = LockRetry::new(ctx.staging().lockfile(&ctx.name), LOCK_ATTEMPTS, LOCK_DELAY)
            .lock()
            .await
            .map_err(HelperError::from)?;
        let dir = ctx.pending_dir();
        if !dir.is_dir() {
            ctx.staging()
                .ensure_category(&ctx.name, None)
                .map_err(HelperError::from)?;
        }
        let mut file = StagingFile::create(&dir, &name).map_err(HelperError::from)?;
        file.write_all(&bytes)
            .map_err(|e| HelperError::io(file.path().to_path_buf(), e))?;
        let path = file.commit().map_err(HelperError::from)?;

        let result = self.submit(ctx, &path).await;
        if result == HelperResult::Ok {
            ctx.staging()
                .mark_uploaded(&ctx.name, &name)
                .map_err(HelperError::from)?;
            info!(id = %id, "system report submitted");
            Ok(id)
        } else {
            ctx.staging()
                .mark_failed(&ctx.name, &name)
                .map_err(HelperError::from)?;
            warn!(id = %id, result = result.as_str(), "system report not submitted");
            Err(MethodError::Submission(result))
        }
    }
}

#[async_trait]
impl Helper for SysreportHelper {
    fn name(&self) -> &'static str {
        "sysreport"
    }

    fn valid_extensions(&self) -> &'static [&'static str] {
        &[".zip"]
    }

    async fn submit(&self, ctx: &HelperContext, path: &Path) -> HelperResult {
        let bytes = match read_artifact(path).await {
            Ok(bytes) => bytes,
            Err(result) => return result,
        };
        if zip::ZipArchive::new(Cursor::new(bytes.as_slice())).is_err() {
            warn!(path = %path.display(), "system report is not a zip archive");
            return HelperResult::PermanentError;
        }
        let id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

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
        event.message = Some(format!("System report {id}"));
        event.tag("report_id", id.clone());
        if let Some(account) = ctx.global("steam", "account_id") {
            event.tag("steam_account_id", account);
        }
        event
            .attachments
            .push(Attachment::binary(format!("{id}.zip"), bytes));
        match sentry::send_event(ctx.http(), &dsn, &event).await {
            Ok(_) => HelperResult::Ok,
            Err(e) => {
                warn!(path = %path.display(), "system report submission failed: {e}");
                e.classify()
            },
        }
    }

    fn methods(&self) -> &'static [&'static str] {
        &["SendReport"]
    }

    async fn call(
        &self,
        ctx: &HelperContext,
        method: &str,
        args: &[Value],
    ) -> Result<Value, MethodError> {
        if method != "SendReport" {
            return Err(MethodError::UnknownMethod(method.to_string()));
        }
        let Some(path) = args.first().and_then(Value::as_str) else {
            return Err(MethodError::InvalidArguments(String::from(
                "SendReport expects a path",
            )));
        };
        self.send_report(ctx, Path::new(path)).await.map(Value::String)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::helpers::testing::Fixture;
    use crate::remote::testing;
    use crate::staging::ArtifactState;

    fn report_zip() -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file("report.txt", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"all good").unwrap();
        writer.finish().unwrap().into_inner()
    }

    #[tokio::test]
    async fn missing_file_is_reported() {
        let fixture = Fixture::new();
        let ctx = fixture.context("sysreport");
        let err = SysreportHelper
            .call(&ctx, "SendReport", &[json!("/nonexistent/report.zip")])
            .await
            .unwrap_err();
        assert!(matches!(err, MethodError::FileNotFound(_)));
    }

    #[tokio::test]
    async fn bad_arguments() {
        let fixture = Fixture::new();
        let ctx = fixture.context("sysreport");
        let err = SysreportHelper.call(&ctx, "SendReport", &[]).await.unwrap_err();
        assert!(matches!(err, MethodError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn successful_report_returns_id() {
        let (base, seen) = testing::serve(vec![(200, "{}".into()), (200, "{}".into())]).await;
        let fixture = Fixture::new();
        fixture.set(
            "helpers.sysreport",
            "dsn",
            &(base.replacen("http://", "http://key@", 1) + "/3"),
        );
        let ctx = fixture.context("sysreport");
        let source = fixture.dir.path().join("report.zip");
        std::fs::write(&source, report_zip()).unwrap();

        let id = SysreportHelper
            .call(&ctx, "SendReport", &[json!(source.to_str().unwrap())])
            .await
            .unwrap();
        let id = id.as_str().unwrap();
        assert_eq!(id.len(), 9);
        assert_eq!(
            fixture
                .services
                .staging
                .state_of("sysreport", &format!("{id}.zip")),
            Some(ArtifactState::Uploaded)
        );
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn invalid_archive_lands_in_failed() {
        let fixture = Fixture::new();
        let ctx = fixture.context("sysreport");
        let source = fixture.dir.path().join("report.zip");
        std::fs::write(&source, b"not a zip").unwrap();

        let err = SysreportHelper.send_report(&ctx, &source).await.unwrap_err();
        assert!(matches!(
            err,
            MethodError::Submission(HelperResult::PermanentError)
        ));
        let failed = std::fs::read_dir(fixture.services.staging.failed("sysreport"))
            .unwrap()
            .count();
        assert_eq!(failed, 1);
    }
}
