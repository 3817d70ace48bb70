//! Synchronous client for the daemon's control socket.
//!
//! Used by the hooks and by command-line front-ends. Each method sends one
//! command and blocks for its reply.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};

use crate::ipc::{self, Command, IpcError, Reply, ReplyStatus};

/// Read/write timeout applied to ordinary commands.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The socket could not be reached.
    #[error("failed to connect to {path}: {source}")]
    Connect {
        /// Socket path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Transport failure after connecting.
    #[error(transparent)]
    Ipc(#[from] IpcError),

    /// The daemon closed the connection without replying.
    #[error("daemon closed the connection")]
    Closed,

    /// The daemon answered with a non-OK status.
    #[error("daemon returned {status}")]
    Status {
        /// Reply status.
        status: ReplyStatus,
        /// Reply payload.
        data: Option<Value>,
    },

    /// The reply payload did not have the expected shape.
    #[error("unexpected reply payload: {0}")]
    UnexpectedPayload(String),
}

impl ClientError {
    /// Status code, if the daemon replied with one.
    #[must_use]
    pub const fn status(&self) -> Option<ReplyStatus> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        Self::Ipc(IpcError::Io(e))
    }
}

/// Per-helper switches reported by `helper-status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct HelperStatus {
    /// `helpers.<name>.enable`.
    pub enabled: bool,
    /// `helpers.<name>.collect`.
    pub collection: bool,
    /// `helpers.<name>.submit`.
    pub submission: bool,
}

/// A connected control-socket client.
#[derive(Debug)]
pub struct Client {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
}

impl Client {
    /// Connects to the default socket.
    pub fn connect_default() -> Result<Self, ClientError> {
        Self::connect(ipc::default_socket_path())
    }

    /// Connects to `path`.
    pub fn connect(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).map_err(|source| ClientError::Connect {
            path: path.to_path_buf(),
            source,
        })?;
        stream.set_read_timeout(Some(DEFAULT_TIMEOUT))?;
        stream.set_write_timeout(Some(DEFAULT_TIMEOUT))?;
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
        })
    }

    /// Sends a raw command and returns its payload on `OK`.
    pub fn send(&mut self, command: &Command) -> Result<Option<Value>, ClientError> {
        self.writer.write_all(&ipc::encode_line(command)?)?;
        self.writer.flush()?;

        let mut line = Vec::new();
        let read = self.reader.read_until(b'\n', &mut line)?;
        if read == 0 {
            return Err(ClientError::Closed);
        }
        let Reply { status, data } = ipc::decode_reply(&line)?;
        if status.is_ok() {
            Ok(data)
        } else {
            Err(ClientError::Status { status, data })
        }
    }

    fn send_unit(&mut self, command: &Command) -> Result<(), ClientError> {
        self.send(command).map(|_| ())
    }

    /// Asks the daemon to exit.
    pub fn shutdown(&mut self) -> Result<(), ClientError> {
        self.send_unit(&Command::new("shutdown"))
    }

    /// Names of all registered helpers.
    pub fn list(&mut self) -> Result<Vec<String>, ClientError> {
        let data = self.send(&Command::new("list"))?;
        decode(data)
    }

    /// Current logging level.
    pub fn log_level(&mut self) -> Result<String, ClientError> {
        let data = self.send(&Command::new("log-level"))?;
        decode(data)
    }

    /// Changes the logging level.
    pub fn set_log_level(&mut self, level: &str) -> Result<(), ClientError> {
        self.send_unit(&Command::with_args("log-level", json!({ "level": level })))
    }

    /// Whether submission is enabled.
    pub fn status(&mut self) -> Result<bool, ClientError> {
        let data = self.send(&Command::new("status"))?;
        let value: Value = decode(data)?;
        value
            .get("enabled")
            .and_then(Value::as_bool)
            .ok_or_else(|| ClientError::UnexpectedPayload(value.to_string()))
    }

    /// Per-helper switches; `None` means every helper.
    pub fn helper_status(
        &mut self,
        helpers: Option<&[&str]>,
    ) -> Result<BTreeMap<String, HelperStatus>, ClientError> {
        let command = match helpers {
            Some(names) => Command::with_args("helper-status", json!({ "helpers": names })),
            None => Command::new("helper-status"),
        };
        let data = self.send(&command)?;
        decode(data)
    }

    /// Sets `sls.enable`.
    pub fn enable(&mut self, state: bool) -> Result<(), ClientError> {
        self.send_unit(&Command::with_args("enable", json!({ "state": state })))
    }

    /// Sets `helpers.<name>.enable` for each entry.
    pub fn enable_helpers(&mut self, helpers: &BTreeMap<String, bool>) -> Result<(), ClientError> {
        self.send_unit(&Command::with_args(
            "enable-helpers",
            json!({ "helpers": helpers }),
        ))
    }

    /// Sets `sls.inhibit`.
    pub fn inhibit(&mut self, state: bool) -> Result<(), ClientError> {
        self.send_unit(&Command::with_args("inhibit", json!({ "state": state })))
    }

    /// Stores one of the Steam account fields.
    pub fn set_steam_info(&mut self, key: &str, value: Value) -> Result<(), ClientError> {
        self.send_unit(&Command::with_args(
            "set-steam-info",
            json!({ "key": key, "value": value }),
        ))
    }

    /// Starts a cycle; with `wait`, returns once it has finished.
    pub fn trigger(&mut self, wait: bool) -> Result<(), ClientError> {
        if wait {
            // A full cycle can include several network round trips.
            self.reader.get_ref().set_read_timeout(None)?;
        }
        let result = self.send_unit(&Command::with_args("trigger", json!({ "wait": wait })));
        self.reader
            .get_ref()
            .set_read_timeout(Some(DEFAULT_TIMEOUT))?;
        result
    }

    /// Calls `method` on an exported helper object.
    pub fn call(
        &mut self,
        object: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Option<Value>, ClientError> {
        self.reader.get_ref().set_read_timeout(None)?;
        let result = self.send(&Command::with_args(
            "call",
            json!({ "object": object, "method": method, "args": args }),
        ));
        self.reader
            .get_ref()
            .set_read_timeout(Some(DEFAULT_TIMEOUT))?;
        result
    }

    /// Object paths the daemon exports.
    pub fn list_objects(&mut self) -> Result<Vec<String>, ClientError> {
        let data = self.send(&Command::new("list-objects"))?;
        decode(data)
    }
}

fn decode<T: serde::de::DeserializeOwned>(data: Option<Value>) -> Result<T, ClientError> {
    let value = data.unwrap_or(Value::Null);
    serde_json::from_value(value.clone())
        .map_err(|_| ClientError::UnexpectedPayload(value.to_string()))
}
