//! IPC (Inter-Process Communication) module.
//!
//! Control-plane messages exchanged between clients and the daemon over a
//! Unix stream socket. Each message is one line of UTF-8 JSON terminated by
//! `\n`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default control socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/run/steamos-log-submitter/steamos-log-submitter.socket";

/// Root under which per-helper objects are exported.
pub const OBJECT_ROOT: &str = "/com/valvesoftware/SteamOSLogSubmitter";

/// Upper bound on a single request line.
pub const MAX_LINE_LENGTH: usize = 1 << 20;

/// Request from client to daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Command name, e.g. `trigger`.
    pub command: String,

    /// Command arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
}

impl Command {
    /// A command with no arguments.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: None,
        }
    }

    /// A command with an argument object.
    #[must_use]
    pub fn with_args(command: impl Into<String>, args: Value) -> Self {
        Self {
            command: command.into(),
            args: Some(args),
        }
    }

    /// Looks up a named argument.
    #[must_use]
    pub fn arg(&self, name: &str) -> Option<&Value> {
        self.args.as_ref()?.get(name)
    }
}

/// Reply status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplyStatus {
    /// Success.
    #[serde(rename = "OK")]
    Ok,
    /// The request line was not valid JSON or not a command object.
    InvalidData,
    /// Unknown command.
    InvalidCommand,
    /// Arguments missing or malformed.
    InvalidArguments,
    /// A handler failed unexpectedly.
    UnknownError,
    /// The remote endpoint asked us to back off.
    RateLimiting,
    /// A category lock is held by someone else.
    LockHeld,
    /// A lock release was attempted without holding it.
    LockNotHeld,
    /// An object method was given a path that does not exist.
    FileNotFound,
    /// An object method failed with a retryable helper result.
    TransientError,
    /// An object method failed with a non-retryable helper result.
    PermanentError,
    /// An object method failed for another reason.
    Failed,
}

impl ReplyStatus {
    /// Whether this is [`ReplyStatus::Ok`].
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl std::fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Ok => "OK",
            Self::InvalidData => "InvalidData",
            Self::InvalidCommand => "InvalidCommand",
            Self::InvalidArguments => "InvalidArguments",
            Self::UnknownError => "UnknownError",
            Self::RateLimiting => "RateLimiting",
            Self::LockHeld => "LockHeld",
            Self::LockNotHeld => "LockNotHeld",
            Self::FileNotFound => "FileNotFound",
            Self::TransientError => "TransientError",
            Self::PermanentError => "PermanentError",
            Self::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Reply from daemon to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Outcome.
    pub status: ReplyStatus,

    /// Payload, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Reply {
    /// An empty success reply.
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            status: ReplyStatus::Ok,
            data: None,
        }
    }

    /// A success reply carrying `data`.
    #[must_use]
    pub const fn ok_with(data: Value) -> Self {
        Self {
            status: ReplyStatus::Ok,
            data: Some(data),
        }
    }

    /// An error reply with no payload.
    #[must_use]
    pub const fn error(status: ReplyStatus) -> Self {
        Self { status, data: None }
    }

    /// An error reply carrying `data`.
    #[must_use]
    pub const fn error_with(status: ReplyStatus, data: Value) -> Self {
        Self {
            status,
            data: Some(data),
        }
    }
}

/// Serializes a message as a single `\n`-terminated line.
pub fn encode_line<T: Serialize>(message: &T) -> Result<Vec<u8>, IpcError> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(line)
}

/// Parses one request line (with or without its trailing newline).
///
/// Anything that is not a JSON object with a string `command` is
/// [`ReplyStatus::InvalidData`].
pub fn decode_command(line: &[u8]) -> Result<Command, Reply> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let value: Value =
        serde_json::from_slice(line).map_err(|_| Reply::error(ReplyStatus::InvalidData))?;
    if !value.is_object() {
        return Err(Reply::error(ReplyStatus::InvalidData));
    }
    let command: Command =
        serde_json::from_value(value).map_err(|_| Reply::error(ReplyStatus::InvalidData))?;
    match &command.args {
        None | Some(Value::Object(_)) => Ok(command),
        Some(_) => Err(Reply::error(ReplyStatus::InvalidArguments)),
    }
}

/// Parses one reply line.
pub fn decode_reply(line: &[u8]) -> Result<Reply, IpcError> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    Ok(serde_json::from_slice(line)?)
}

/// Object path of a helper's exported interface.
#[must_use]
pub fn helper_object_path(camel_name: &str) -> String {
    format!("{OBJECT_ROOT}/helpers/{camel_name}")
}

/// Control socket path, honouring `STEAMOS_LOG_SUBMITTER_SOCKET`.
#[must_use]
pub fn default_socket_path() -> PathBuf {
    std::env::var_os("STEAMOS_LOG_SUBMITTER_SOCKET")
        .map_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH), PathBuf::from)
}

/// IPC errors.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Line exceeded [`MAX_LINE_LENGTH`].
    #[error("message too long")]
    TooLong,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn command_wire_shape() {
        let bare = encode_line(&Command::new("list")).unwrap();
        assert_eq!(bare, b"{\"command\":\"list\"}\n");

        let with = Command::with_args("trigger", json!({"wait": true}));
        let parsed = decode_command(&encode_line(&with).unwrap()).unwrap();
        assert_eq!(parsed, with);
        assert_eq!(parsed.arg("wait"), Some(&json!(true)));
        assert_eq!(parsed.arg("missing"), None);
    }

    #[test]
    fn reply_wire_shape() {
        let line = encode_line(&Reply::ok()).unwrap();
        assert_eq!(line, b"{\"status\":\"OK\"}\n");

        let err = Reply::error_with(ReplyStatus::InvalidArguments, json!({"invalid-helper": ["x"]}));
        let text = String::from_utf8(encode_line(&err).unwrap()).unwrap();
        assert!(text.contains("\"InvalidArguments\""));
        assert_eq!(decode_reply(text.as_bytes()).unwrap(), err);
    }

    #[test]
    fn malformed_requests_are_invalid_data() {
        for line in [&b"not json"[..], b"[1,2]", b"{\"args\":{}}", b"{\"command\":3}"] {
            let reply = decode_command(line).unwrap_err();
            assert_eq!(reply.status, ReplyStatus::InvalidData, "{line:?}");
        }
    }

    #[test]
    fn non_object_args_are_invalid_arguments() {
        let reply = decode_command(b"{\"command\":\"enable\",\"args\":true}").unwrap_err();
        assert_eq!(reply.status, ReplyStatus::InvalidArguments);
    }

    #[test]
    fn status_display_matches_wire() {
        for status in [ReplyStatus::Ok, ReplyStatus::LockHeld, ReplyStatus::FileNotFound] {
            let wire = serde_json::to_value(status).unwrap();
            assert_eq!(wire, json!(status.to_string()));
        }
    }

    #[test]
    fn object_paths() {
        assert_eq!(
            helper_object_path("Sysinfo"),
            "/com/valvesoftware/SteamOSLogSubmitter/helpers/Sysinfo"
        );
    }
}
