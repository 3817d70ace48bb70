//! Per-connection line framing.
//!
//! Requests are processed strictly in order: the reply to one line is
//! written before the next line is read. Each command runs in its own task
//! so a panicking handler costs the client an `UnknownError` reply rather
//! than the connection. A `shutdown` request takes effect once its reply
//! has been written.

use sls_core::ipc::{self, Command, MAX_LINE_LENGTH, Reply, ReplyStatus};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{debug, error};

use super::dispatch::dispatch;
use super::{ProtocolError, ProtocolResult};
use crate::state::SharedState;

/// Reads one line of at most [`MAX_LINE_LENGTH`] bytes.
///
/// Returns `Ok(None)` at end of stream. The trailing newline is kept if
/// present; a final unterminated line is returned as is.
pub async fn read_line<R>(reader: &mut R) -> ProtocolResult<Option<Vec<u8>>>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let limit = u64::try_from(MAX_LINE_LENGTH).unwrap_or(u64::MAX);
    let read = reader.take(limit + 1).read_until(b'\n', &mut line).await?;
    if read == 0 {
        return Ok(None);
    }
    if line.len() > MAX_LINE_LENGTH && line.last() != Some(&b'\n') {
        return Err(ProtocolError::TooLong {
            size: line.len(),
            limit: MAX_LINE_LENGTH,
        });
    }
    Ok(Some(line))
}

/// Serves one client until it disconnects.
pub async fn handle_connection(stream: UnixStream, state: SharedState) -> ProtocolResult<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    debug!("client connected");

    loop {
        let line = match read_line(&mut reader).await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(ProtocolError::TooLong { size, limit }) => {
                debug!(size, limit, "request too long");
                write_reply(&mut write_half, &Reply::error(ReplyStatus::InvalidData)).await?;
                break;
            },
            Err(e) => return Err(e),
        };
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let (reply, shutdown) = match ipc::decode_command(&line) {
            Ok(command) => {
                let shutdown = command.command == "shutdown";
                (run(command, &state).await, shutdown)
            },
            Err(reply) => (reply, false),
        };
        write_reply(&mut write_half, &reply).await?;
        if shutdown && reply.status.is_ok() {
            // Only after the reply is out; the server drops open connections.
            state.request_shutdown();
            break;
        }
    }
    debug!("client disconnected");
    Ok(())
}

async fn run(command: Command, state: &SharedState) -> Reply {
    let name = command.command.clone();
    let state = state.clone();
    match tokio::spawn(async move { dispatch(&state, command).await }).await {
        Ok(reply) => reply,
        Err(e) => {
            error!(command = %name, "command handler failed: {e}");
            Reply::error(ReplyStatus::UnknownError)
        },
    }
}

async fn write_reply<W>(writer: &mut W, reply: &Reply) -> ProtocolResult<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let line = ipc::encode_line(reply).map_err(|e| std::io::Error::other(e.to_string()))?;
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}
