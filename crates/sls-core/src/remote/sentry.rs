//! Sentry-compatible event submission.
//!
//! A DSN has the form `<scheme>://<key>@<host>[/<prefix>]/<project>`.
//! Events are POSTed to `<prefix>/api/<project>/store/`; attachments
//! follow in a gzipped envelope sent to `.../envelope/`. Minidumps go to
//! the dedicated multipart endpoint instead.

use std::io::Write;

use flate2::Compression;
use flate2::write::GzEncoder;
use rand::Rng;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use super::{RemoteError, check_response};

/// Protocol version advertised in the auth header.
pub const SENTRY_VERSION: u32 = 7;

/// A parsed DSN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dsn {
    scheme: String,
    key: String,
    host: String,
    prefix: String,
    project: String,
}

impl Dsn {
    /// Parses a DSN string.
    pub fn parse(dsn: &str) -> Result<Self, RemoteError> {
        let invalid = || RemoteError::InvalidDsn(dsn.to_string());
        let (scheme, rest) = dsn.split_once("://").ok_or_else(invalid)?;
        if scheme != "http" && scheme != "https" {
            return Err(invalid());
        }
        let (key, rest) = rest.split_once('@').ok_or_else(invalid)?;
        // A `key:secret` pair is tolerated; only the public key is used.
        let key = key.split(':').next().unwrap_or_default();
        let (host, path) = rest.split_once('/').ok_or_else(invalid)?;
        let path = path.trim_end_matches('/');
        let (prefix, project) = path.rsplit_once('/').unwrap_or(("", path));
        if key.is_empty() || host.is_empty() || project.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            scheme: scheme.to_string(),
            key: key.to_string(),
            host: host.to_string(),
            prefix: prefix.to_string(),
            project: project.to_string(),
        })
    }

    /// Public key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Project id.
    #[must_use]
    pub fn project(&self) -> &str {
        &self.project
    }

    fn api_url(&self, endpoint: &str) -> String {
        let prefix = if self.prefix.is_empty() {
            String::new()
        } else {
            format!("/{}", self.prefix)
        };
        format!(
            "{}://{}{}/api/{}/{}/",
            self.scheme, self.host, prefix, self.project, endpoint
        )
    }

    /// Event store endpoint.
    #[must_use]
    pub fn store_url(&self) -> String {
        self.api_url("store")
    }

    /// Envelope endpoint.
    #[must_use]
    pub fn envelope_url(&self) -> String {
        self.api_url("envelope")
    }

    /// Minidump endpoint, authenticated through the query string.
    #[must_use]
    pub fn minidump_url(&self) -> String {
        format!("{}?sentry_key={}", self.api_url("minidump"), self.key)
    }

    /// Value of the `X-Sentry-Auth` header.
    #[must_use]
    pub fn auth_header(&self) -> String {
        format!(
            "Sentry sentry_version={SENTRY_VERSION}, sentry_key={}",
            self.key
        )
    }
}

/// A file attached to an event.
#[derive(Debug, Clone)]
pub struct Attachment {
    /// Name shown in the UI.
    pub filename: String,
    /// MIME type.
    pub content_type: String,
    /// Contents.
    pub data: Vec<u8>,
}

impl Attachment {
    /// A JSON attachment.
    #[must_use]
    pub fn json(filename: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            content_type: String::from("application/json"),
            data,
        }
    }

    /// An opaque binary attachment.
    #[must_use]
    pub fn binary(filename: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            content_type: String::from("application/octet-stream"),
            data,
        }
    }
}

/// Random 32-hex-digit event id.
#[must_use]
pub fn new_event_id() -> String {
    let id: u128 = rand::thread_rng().gen();
    format!("{id:032x}")
}

/// Accumulates the fields of one event.
#[derive(Debug, Clone, Default)]
pub struct Event {
    /// Free-form message.
    pub message: Option<String>,
    /// Searchable tags.
    pub tags: Map<String, Value>,
    /// Unindexed extra data.
    pub extra: Map<String, Value>,
    /// Grouping fingerprint.
    pub fingerprint: Vec<String>,
    /// Application id, reported as the release-like `appid` tag.
    pub appid: Option<u32>,
    /// Event timestamp (epoch seconds).
    pub timestamp: Option<f64>,
    /// Exception entries (`type`, `value`, optional `stacktrace`).
    pub exceptions: Vec<Value>,
    /// Files uploaded alongside the event.
    pub attachments: Vec<Attachment>,
    /// Environment tag.
    pub environment: Option<String>,
}

impl Event {
    /// An empty event.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a tag.
    pub fn tag(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.tags.insert(key.to_string(), value.into());
        self
    }

    /// Sets an extra field.
    pub fn extra(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }

    /// Builds the store payload.
    #[must_use]
    pub fn to_json(&self, event_id: &str) -> Value {
        let mut obj = Map::new();
        obj.insert("event_id".into(), json!(event_id));
        obj.insert("platform".into(), json!("native"));
        obj.insert("level".into(), json!("error"));
        if let Some(message) = &self.message {
            obj.insert("message".into(), json!({ "message": message }));
        }
        if let Some(ts) = self.timestamp {
            obj.insert("timestamp".into(), json!(ts));
        }
        if let Some(env) = &self.environment {
            obj.insert("environment".into(), json!(env));
        }
        let mut tags = self.tags.clone();
        if let Some(appid) = self.appid {
            tags.insert("appid".into(), json!(appid.to_string()));
        }
        if !tags.is_empty() {
            obj.insert("tags".into(), Value::Object(tags));
        }
        if !self.extra.is_empty() {
            obj.insert("extra".into(), Value::Object(self.extra.clone()));
        }
        if !self.fingerprint.is_empty() {
            obj.insert("fingerprint".into(), json!(self.fingerprint));
        }
        if !self.exceptions.is_empty() {
            obj.insert("exception".into(), json!({ "values": self.exceptions }));
        }
        Value::Object(obj)
    }
}

/// Serializes and gzips an envelope carrying `attachments`.
pub fn build_envelope(event_id: &str, attachments: &[Attachment]) -> Result<Vec<u8>, RemoteError> {
    let mut raw = Vec::new();
    serde_json::to_writer(&mut raw, &json!({ "event_id": event_id }))?;
    raw.push(b'\n');
    for attachment in attachments {
        let header = json!({
            "type": "attachment",
            "length": attachment.data.len(),
            "filename": attachment.filename,
            "content_type": attachment.content_type,
        });
        serde_json::to_writer(&mut raw, &header)?;
        raw.push(b'\n');
        raw.extend_from_slice(&attachment.data);
        raw.push(b'\n');
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&raw)?;
    Ok(encoder.finish()?)
}

/// Sends `event` and then its attachments.
///
/// Returns the event id on success.
pub async fn send_event(
    client: &reqwest::Client,
    dsn: &Dsn,
    event: &Event,
) -> Result<String, RemoteError> {
    let event_id = new_event_id();
    let payload = event.to_json(&event_id);

    let response = client
        .post(dsn.store_url())
        .header("X-Sentry-Auth", dsn.auth_header())
        .json(&payload)
        .send()
        .await?;
    check_response(response).await?;
    debug!(event_id = %event_id, "event stored");

    if !event.attachments.is_empty() {
        let body = build_envelope(&event_id, &event.attachments)?;
        let response = client
            .post(dsn.envelope_url())
            .header("X-Sentry-Auth", dsn.auth_header())
            .header(CONTENT_TYPE, "application/x-sentry-envelope")
            .header(CONTENT_ENCODING, "gzip")
            .body(body)
            .send()
            .await?;
        check_response(response).await?;
        debug!(event_id = %event_id, count = event.attachments.len(), "attachments sent");
    }
    info!(event_id = %event_id, "event submitted");
    Ok(event_id)
}

/// Uploads a minidump as a multipart form.
///
/// Tags and extra fields of `event` are flattened into
/// `sentry[tags][k]` / `sentry[extra][k]` form fields.
pub async fn send_minidump(
    client: &reqwest::Client,
    dsn: &Dsn,
    filename: &str,
    dump: Vec<u8>,
    event: &Event,
) -> Result<(), RemoteError> {
    let part = reqwest::multipart::Part::bytes(dump)
        .file_name(filename.to_string())
        .mime_str("application/octet-stream")?;
    let mut form = reqwest::multipart::Form::new().part("upload_file_minidump", part);
    let mut tags = event.tags.clone();
    if let Some(appid) = event.appid {
        tags.insert("appid".into(), json!(appid.to_string()));
    }
    for (key, value) in &tags {
        form = form.text(format!("sentry[tags][{key}]"), form_value(value));
    }
    for (key, value) in &event.extra {
        form = form.text(format!("sentry[extra][{key}]"), form_value(value));
    }
    if let Some(env) = &event.environment {
        form = form.text("sentry[environment]", env.clone());
    }
    for (i, entry) in event.fingerprint.iter().enumerate() {
        form = form.text(format!("sentry[fingerprint][{i}]"), entry.clone());
    }

    let response = client
        .post(dsn.minidump_url())
        .multipart(form)
        .send()
        .await?;
    check_response(response).await?;
    info!(filename, "minidump submitted");
    Ok(())
}

fn form_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::GzDecoder;

    use super::super::testing;
    use super::*;

    fn stub_dsn(base: &str) -> Dsn {
        Dsn::parse(&format!("{}/5", base.replacen("http://", "http://key@", 1))).unwrap()
    }

    #[test]
    fn dsn_parsing() {
        let dsn = Dsn::parse("https://abc123@sentry.example.com/42").unwrap();
        assert_eq!(dsn.key(), "abc123");
        assert_eq!(dsn.project(), "42");
        assert_eq!(dsn.store_url(), "https://sentry.example.com/api/42/store/");
        assert_eq!(
            dsn.envelope_url(),
            "https://sentry.example.com/api/42/envelope/"
        );
        assert_eq!(
            dsn.auth_header(),
            "Sentry sentry_version=7, sentry_key=abc123"
        );

        let prefixed = Dsn::parse("http://k:s@host:9000/sub/path/7").unwrap();
        assert_eq!(prefixed.key(), "k");
        assert_eq!(prefixed.store_url(), "http://host:9000/sub/path/api/7/store/");
        assert_eq!(
            prefixed.minidump_url(),
            "http://host:9000/sub/path/api/7/minidump/?sentry_key=k"
        );

        for bad in ["", "ftp://k@h/1", "https://h/1", "https://k@h", "https://k@h/"] {
            assert!(Dsn::parse(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn event_json_shape() {
        let mut event = Event::new();
        event.message = Some("GPU reset".into());
        event.appid = Some(100);
        event.tag("kernel", "6.1.52");
        event.fingerprint = vec!["driver:amdgpu".into()];
        let json = event.to_json("0123");
        assert_eq!(json["event_id"], "0123");
        assert_eq!(json["message"]["message"], "GPU reset");
        assert_eq!(json["tags"]["appid"], "100");
        assert_eq!(json["tags"]["kernel"], "6.1.52");
        assert_eq!(json["fingerprint"][0], "driver:amdgpu");
        assert!(json.get("extra").is_none());
    }

    #[test]
    fn envelope_layout() {
        let attachments = vec![Attachment::json("a.json", b"{}".to_vec())];
        let gz = build_envelope("e1", &attachments).unwrap();
        let mut raw = String::new();
        GzDecoder::new(&gz[..]).read_to_string(&mut raw).unwrap();
        let lines: Vec<&str> = raw.split('\n').collect();
        assert_eq!(lines[0], r#"{"event_id":"e1"}"#);
        let header: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(header["type"], "attachment");
        assert_eq!(header["length"], 2);
        assert_eq!(header["filename"], "a.json");
        assert_eq!(lines[2], "{}");
    }

    #[tokio::test]
    async fn event_then_envelope() {
        let (base, seen) =
            testing::serve(vec![(200, "{}".into()), (200, "{}".into())]).await;
        let dsn = stub_dsn(&base);
        let client = super::super::http_client(std::time::Duration::from_secs(5)).unwrap();
        let mut event = Event::new();
        event.attachments.push(Attachment::binary("dump", vec![1, 2, 3]));
        send_event(&client, &dsn, &event).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].path, "/api/5/store/");
        assert_eq!(
            seen[0].header("x-sentry-auth"),
            Some("Sentry sentry_version=7, sentry_key=key")
        );
        assert_eq!(seen[1].path, "/api/5/envelope/");
        assert_eq!(seen[1].header("content-encoding"), Some("gzip"));
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let (base, seen) = testing::serve(vec![(500, String::new())]).await;
        let dsn = stub_dsn(&base);
        let client = super::super::http_client(std::time::Duration::from_secs(5)).unwrap();
        let err = send_event(&client, &dsn, &Event::new()).await.unwrap_err();
        assert_eq!(err.classify(), crate::helpers::HelperResult::TransientError);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
