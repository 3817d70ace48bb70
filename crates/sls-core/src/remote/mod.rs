//! Remote submission back-ends.
//!
//! - [`sentry`]: event store plus gzipped envelope attachments, and the
//!   minidump endpoint.
//! - [`steam`]: the two-phase crash upload (start, presigned PUT, finish).
//!
//! Every failure funnels into [`RemoteError`], whose
//! [`classify`](RemoteError::classify) decides what happens to the artifact.

use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, warn};

use crate::helpers::HelperResult;

pub mod sentry;
pub mod steam;

/// User agent sent with every request.
pub const USER_AGENT: &str = concat!("steamos-log-submitter/", env!("CARGO_PKG_VERSION"));

/// Default overall request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors emitted by remote back-ends.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The request never produced a response.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The endpoint answered with an unsuccessful status.
    #[error("endpoint returned {status}: {body}")]
    Status {
        /// HTTP status.
        status: StatusCode,
        /// Response body, possibly truncated.
        body: String,
    },

    /// The endpoint explicitly asked us to back off.
    #[error("rate limited")]
    RateLimited,

    /// The configured DSN is unusable.
    #[error("invalid DSN: {0}")]
    InvalidDsn(String),

    /// The response could not be understood.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// A payload could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Local I/O while preparing the payload.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    /// Maps this failure onto the artifact's fate.
    #[must_use]
    pub fn classify(&self) -> HelperResult {
        match self {
            Self::Transport(e) => match e.status() {
                Some(status) => HelperResult::from_status(status),
                None if e.is_builder() => HelperResult::PermanentError,
                None => HelperResult::TransientError,
            },
            Self::Status { status, .. } => HelperResult::from_status(*status),
            Self::RateLimited => HelperResult::ClassError,
            Self::InvalidDsn(_) | Self::Serialization(_) => HelperResult::PermanentError,
            Self::InvalidResponse(_) => HelperResult::TransientError,
            Self::Io(e) => HelperResult::from_io(e),
        }
    }
}

/// Turns a non-2xx response into a [`RemoteError`].
pub async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(RemoteError::RateLimited);
    }
    let mut body = response.text().await.unwrap_or_default();
    body.truncate(512);
    Err(RemoteError::Status { status, body })
}

/// Builds the shared HTTP client.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client, RemoteError> {
    Ok(reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()?)
}

/// Connectivity probe run before every submit phase.
#[derive(Debug, Clone)]
pub struct NetworkProbe {
    /// URL expected to answer `204 No Content`.
    pub url: String,
    /// Number of attempts.
    pub attempts: u32,
    /// Pause between attempts.
    pub pause: Duration,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for NetworkProbe {
    fn default() -> Self {
        Self {
            url: String::from("http://test.steampowered.com/204"),
            attempts: 5,
            pause: Duration::from_secs(4),
            timeout: Duration::from_secs(1),
        }
    }
}

impl NetworkProbe {
    /// Probes `url`; true as soon as one attempt gets a 204.
    pub async fn check(&self, client: &reqwest::Client) -> bool {
        for attempt in 1..=self.attempts {
            match client
                .head(&self.url)
                .timeout(self.timeout)
                .send()
                .await
            {
                Ok(response) if response.status() == StatusCode::NO_CONTENT => return true,
                Ok(response) => {
                    debug!(attempt, status = %response.status(), "network probe got unexpected status");
                },
                Err(e) => debug!(attempt, "network probe failed: {e}"),
            }
            if attempt < self.attempts {
                tokio::time::sleep(self.pause).await;
            }
        }
        warn!(url = %self.url, "network appears to be offline");
        false
    }
}
