//! Two-phase crash upload through the Steam web API.
//!
//! 1. `StartCrashUpload` returns a presigned URL, the headers to send with
//!    it and a `gid` identifying the upload.
//! 2. The dump is `PUT` to that URL.
//! 3. `FinishCrashUpload` is called with the `gid`.
//!
//! An empty `response` object from the start call means the account is
//! being rate limited.

use serde::Deserialize;
use tracing::{debug, info};

use super::{RemoteError, check_response};

/// Default API root.
pub const DEFAULT_BASE_URL: &str = "https://api.steampowered.com";

const START_PATH: &str = "/ICrashReportService/StartCrashUpload/v1";
const FINISH_PATH: &str = "/ICrashReportService/FinishCrashUpload/v1";

/// Description of the crash sent with the start call.
#[derive(Debug, Clone, Default)]
pub struct CrashInfo {
    /// Steam account the device is signed in with.
    pub steamid: Option<String>,
    /// Crashed application, if known.
    pub appid: Option<u32>,
    /// Product name.
    pub product: String,
    /// OS build (branch).
    pub build: String,
    /// OS version.
    pub version: String,
    /// Platform string.
    pub platform: String,
    /// Executable basename.
    pub executable: Option<String>,
    /// Size of the dump in bytes.
    pub dump_size: u64,
}

impl CrashInfo {
    fn form(&self) -> Vec<(&'static str, String)> {
        let mut form = vec![
            ("product", self.product.clone()),
            ("build", self.build.clone()),
            ("version", self.version.clone()),
            ("platform", self.platform.clone()),
            ("format", String::from("json")),
            ("have_dump_file", String::from("1")),
            ("dump_file_size", self.dump_size.to_string()),
        ];
        if let Some(steamid) = &self.steamid {
            form.push(("steamid", steamid.clone()));
        }
        if let Some(appid) = self.appid {
            form.push(("appid", appid.to_string()));
        }
        if let Some(executable) = &self.executable {
            form.push(("executable", executable.clone()));
        }
        form
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    response: Option<T>,
}

#[derive(Debug, Default, Deserialize)]
struct StartResponse {
    url: Option<String>,
    gid: Option<serde_json::Value>,
    #[serde(default)]
    headers: Headers,
}

#[derive(Debug, Default, Deserialize)]
struct Headers {
    #[serde(default)]
    pairs: Vec<HeaderPair>,
}

#[derive(Debug, Deserialize)]
struct HeaderPair {
    name: String,
    value: String,
}

/// Steam crash upload endpoint.
#[derive(Debug, Clone)]
pub struct CrashUploader {
    base_url: String,
}

impl Default for CrashUploader {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

impl CrashUploader {
    /// Uses `base_url` as the API root.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Runs all three phases.
    pub async fn upload(
        &self,
        client: &reqwest::Client,
        info: &CrashInfo,
        dump: Vec<u8>,
    ) -> Result<(), RemoteError> {
        let response = client
            .post(format!("{}{START_PATH}", self.base_url))
            .form(&info.form())
            .send()
            .await?;
        let start: Envelope<StartResponse> = check_response(response).await?.json().await?;
        let start = start.response.unwrap_or_default();
        let (Some(url), Some(gid)) = (start.url, start.gid) else {
            debug!("start call returned an empty response");
            return Err(RemoteError::RateLimited);
        };
        let gid = match gid {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };

        let mut put = client.put(&url).body(dump);
        for pair in &start.headers.pairs {
            put = put.header(pair.name.as_str(), pair.value.as_str());
        }
        check_response(put.send().await?).await?;
        debug!(gid = %gid, "dump uploaded");

        let response = client
            .post(format!("{}{FINISH_PATH}", self.base_url))
            .form(&[("gid", gid.as_str())])
            .send()
            .await?;
        check_response(response).await?;
        info!(gid = %gid, "crash upload finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::{http_client, testing};
    use super::*;
    use crate::helpers::HelperResult;

    fn info() -> CrashInfo {
        CrashInfo {
            steamid: Some("76561197960265728".into()),
            appid: Some(100),
            product: "holo".into(),
            build: "main".into(),
            version: "3.5".into(),
            platform: "linux".into(),
            executable: Some("game".into()),
            dump_size: 3,
        }
    }

    #[tokio::test]
    async fn three_phases() {
        // The presigned URL points back at the stub.
        let (base, seen) = testing::serve_with(|base| {
            let start = format!(
                r#"{{"response":{{"url":"{base}/put","gid":"77","headers":{{"pairs":[{{"name":"x-upload","value":"yes"}}]}}}}}}"#
            );
            vec![(200, start), (200, String::new()), (200, r#"{"response":{}}"#.into())]
        })
        .await;
        let client = http_client(Duration::from_secs(5)).unwrap();
        CrashUploader::new(&base)
            .upload(&client, &info(), vec![1, 2, 3])
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].path, "/ICrashReportService/StartCrashUpload/v1");
        assert_eq!(seen[1].method, "PUT");
        assert_eq!(seen[1].path, "/put");
        assert_eq!(seen[1].header("x-upload"), Some("yes"));
        assert_eq!(seen[1].body, vec![1, 2, 3]);
        assert_eq!(seen[2].path, "/ICrashReportService/FinishCrashUpload/v1");
        assert_eq!(String::from_utf8_lossy(&seen[2].body), "gid=77");
    }

    #[tokio::test]
    async fn empty_start_response_is_rate_limited() {
        let (base, seen) = testing::serve(vec![(200, r#"{"response":{}}"#.into())]).await;
        let client = http_client(Duration::from_secs(5)).unwrap();
        let err = CrashUploader::new(&base)
            .upload(&client, &info(), vec![1, 2, 3])
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::RateLimited));
        assert_eq!(err.classify(), HelperResult::ClassError);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let body = String::from_utf8_lossy(&seen[0].body).into_owned();
        assert!(body.contains("appid=100"));
        assert!(body.contains("dump_file_size=3"));
    }
}
