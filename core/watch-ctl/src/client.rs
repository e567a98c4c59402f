//! One-shot request client for the stagewatch daemon.
//!
//! Each call opens a fresh connection, consumes the `config` greeting, sends
//! one line and waits for its reply. Any pushed stream message that arrives
//! first is skipped.

use serde_json::Value;
use stagewatch_daemon_protocol::{Inbound, MAX_MESSAGE_BYTES};
use std::env;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const SOCKET_ENV: &str = "STAGEWATCH_SOCKET";
const SOCKET_NAME: &str = "daemon.sock";
const READ_TIMEOUT_MS: u64 = 3000;
const WRITE_TIMEOUT_MS: u64 = 600;

/// Replies that answer a request, as opposed to pushed stream messages.
const REPLY_TYPES: &[&str] = &[
    "ack",
    "pong",
    "error",
    "health",
    "settings",
    "events",
    "observations",
];

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to connect to daemon socket {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Daemon I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Daemon closed the connection before replying")]
    Closed,

    #[error("Daemon sent an oversized line")]
    TooLarge,

    #[error("Daemon sent invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Daemon greeting was {0}, expected config")]
    UnexpectedGreeting(String),
}

pub fn socket_path() -> Result<PathBuf, ClientError> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    let home = dirs::home_dir().ok_or(ClientError::HomeDirNotFound)?;
    Ok(home.join(".stagewatch").join(SOCKET_NAME))
}

pub fn request(message: &Inbound) -> Result<Value, ClientError> {
    let path = socket_path()?;
    let stream = UnixStream::connect(&path).map_err(|source| ClientError::Connect {
        path: path.clone(),
        source,
    })?;
    let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));
    tracing::debug!(path = %path.display(), "Connected to daemon");

    let mut reader = BufReader::new(stream.try_clone()?);
    let greeting = read_message(&mut reader)?;
    let greeting_type = message_type(&greeting);
    if greeting_type != "config" {
        return Err(ClientError::UnexpectedGreeting(greeting_type.to_string()));
    }

    let mut writer = stream;
    let mut line = serde_json::to_vec(&message.to_json())?;
    line.push(b'\n');
    writer.write_all(&line)?;
    writer.flush()?;

    loop {
        let reply = read_message(&mut reader)?;
        let reply_type = message_type(&reply);
        if REPLY_TYPES.contains(&reply_type) {
            return Ok(reply);
        }
        tracing::debug!(reply_type, "Skipping pushed message");
    }
}

pub fn message_type(message: &Value) -> &str {
    message.get("type").and_then(Value::as_str).unwrap_or("unknown")
}

fn read_message<R: Read>(reader: &mut BufReader<R>) -> Result<Value, ClientError> {
    let mut line = Vec::new();
    let read = reader
        .by_ref()
        .take(MAX_MESSAGE_BYTES as u64 + 1)
        .read_until(b'\n', &mut line)?;
    if read == 0 {
        return Err(ClientError::Closed);
    }
    if line.last() != Some(&b'\n') && line.len() > MAX_MESSAGE_BYTES {
        return Err(ClientError::TooLarge);
    }
    Ok(serde_json::from_slice(trim_newline(&line))?)
}

fn trim_newline(line: &[u8]) -> &[u8] {
    match line {
        [rest @ .., b'\r', b'\n'] | [rest @ .., b'\n'] => rest,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn reads_one_line_at_a_time() {
        let mut reader = BufReader::new(Cursor::new(
            b"{\"type\":\"config\"}\n{\"type\":\"ack\",\"ok\":true}\n".to_vec(),
        ));
        assert_eq!(message_type(&read_message(&mut reader).unwrap()), "config");
        let ack = read_message(&mut reader).unwrap();
        assert_eq!(ack["ok"], true);
        assert!(matches!(read_message(&mut reader), Err(ClientError::Closed)));
    }

    #[test]
    fn rejects_garbage_lines() {
        let mut reader = BufReader::new(Cursor::new(b"not json\n".to_vec()));
        assert!(matches!(
            read_message(&mut reader),
            Err(ClientError::InvalidJson(_))
        ));
    }

    #[test]
    fn missing_type_is_unknown() {
        assert_eq!(message_type(&serde_json::json!({"ok": true})), "unknown");
    }

    #[test]
    fn pushed_messages_are_not_replies() {
        assert!(!REPLY_TYPES.contains(&"agent_decision"));
        assert!(!REPLY_TYPES.contains(&"status"));
        assert!(REPLY_TYPES.contains(&"settings"));
    }
}
