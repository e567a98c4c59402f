use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

struct DaemonGuard {
    child: Child,
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn spawn_daemon(home: &Path) -> Child {
    Command::new(env!("CARGO_BIN_EXE_stagewatch-daemon"))
        .env("HOME", home)
        .env_remove("STAGEWATCH_SOCKET")
        .env_remove("STAGEWATCH_CONFIG")
        .env_remove("SQLITE_PATH")
        .env("AGENT_ENABLED", "0")
        .env("OLLAMA_BASE_URL", "http://127.0.0.1:9")
        .env("OLLAMA_TIMEOUT_SEC", "0.5")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn stagewatch-daemon")
}

fn socket_path(home: &Path) -> PathBuf {
    home.join(".stagewatch").join("daemon.sock")
}

fn can_bind_socket(home: &Path) -> bool {
    let probe_path = home.join("probe.sock");
    match UnixListener::bind(&probe_path) {
        Ok(listener) => {
            drop(listener);
            let _ = std::fs::remove_file(&probe_path);
            true
        }
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => false,
        Err(_) => true,
    }
}

fn wait_for_socket(path: &Path, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if path.exists() && UnixStream::connect(path).is_ok() {
            return;
        }
        sleep(Duration::from_millis(25));
    }
    panic!("timed out waiting for daemon socket at {}", path.display());
}

fn start() -> Option<(tempfile::TempDir, DaemonGuard, PathBuf)> {
    let home = tempfile::tempdir().expect("temp HOME");
    if !can_bind_socket(home.path()) {
        eprintln!("skipping: unix socket bind not permitted");
        return None;
    }
    let socket = socket_path(home.path());
    let guard = DaemonGuard {
        child: spawn_daemon(home.path()),
    };
    wait_for_socket(&socket, Duration::from_secs(5));
    Some((home, guard, socket))
}

fn connect(socket: &Path) -> (UnixStream, BufReader<UnixStream>) {
    let stream = UnixStream::connect(socket).expect("failed to connect to daemon socket");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("set read timeout");
    let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
    let greeting = read_message(&mut reader);
    assert_eq!(greeting["type"], "config");
    (stream, reader)
}

fn write_raw(stream: &mut UnixStream, payload: &[u8]) {
    stream.write_all(payload).expect("failed to write payload");
    stream.flush().expect("failed to flush payload");
}

fn read_message(reader: &mut BufReader<UnixStream>) -> Value {
    let mut line = String::new();
    reader.read_line(&mut line).expect("failed to read line");
    serde_json::from_str(line.trim_end()).expect("failed to parse message JSON")
}

fn assert_error(message: &Value, code: &str) {
    assert_eq!(message["type"], "error", "unexpected message: {}", message);
    assert_eq!(message["code"], code, "unexpected message: {}", message);
}

#[test]
fn malformed_messages_are_answered_and_connection_survives() {
    let Some((_home, _guard, socket)) = start() else {
        return;
    };
    let (mut stream, mut reader) = connect(&socket);

    write_raw(&mut stream, b"{not json\n");
    assert_error(&read_message(&mut reader), "invalid_json");

    write_raw(&mut stream, b"[1,2,3]\n");
    assert_error(&read_message(&mut reader), "invalid_message");

    write_raw(&mut stream, b"{\"type\":\"teleport\"}\n");
    let unknown = read_message(&mut reader);
    assert_error(&unknown, "unknown_type");
    assert_eq!(unknown["message"], "Unknown type: teleport");

    write_raw(&mut stream, b"{\"type\":\"command\",\"command\":\"explode\"}\n");
    let unknown = read_message(&mut reader);
    assert_error(&unknown, "unknown_command");
    assert_eq!(unknown["message"], "Unknown command: explode");

    write_raw(&mut stream, b"{\"type\":\"frame\"}\n");
    assert_error(&read_message(&mut reader), "missing_field");

    // Blank keep-alive lines get no reply; the next real message does.
    write_raw(&mut stream, b"\n\n{\"type\":\"command\",\"command\":\"ping\"}\n");
    assert_eq!(read_message(&mut reader)["type"], "pong");
}

#[test]
fn invalid_frames_change_nothing() {
    let Some((_home, _guard, socket)) = start() else {
        return;
    };
    let (mut stream, mut reader) = connect(&socket);

    write_raw(&mut stream, b"{\"type\":\"command\",\"command\":\"set_baseline\"}\n");
    let refused = read_message(&mut reader);
    assert_error(&refused, "no_observation");
    assert_eq!(refused["message"], "No observation available yet.");

    let bad = json!({
        "type": "frame",
        "detections": [{"label": "cup", "confidence": 7.5}]
    });
    write_raw(&mut stream, format!("{}\n", bad).as_bytes());
    assert_error(&read_message(&mut reader), "invalid_frame");

    write_raw(&mut stream, b"{\"type\":\"query\",\"query\":\"health\"}\n");
    let health = read_message(&mut reader);
    assert_eq!(health["state"], "IDLE");
    assert_eq!(health["last_observed"], Value::Null);
}

#[test]
fn oversized_message_is_rejected_without_dropping_connection() {
    let Some((_home, _guard, socket)) = start() else {
        return;
    };
    let (mut stream, mut reader) = connect(&socket);

    let mut payload = vec![b'x'; MAX_MESSAGE_BYTES + 1024];
    payload.push(b'\n');
    write_raw(&mut stream, &payload);
    assert_error(&read_message(&mut reader), "message_too_large");

    write_raw(&mut stream, b"{\"type\":\"command\",\"command\":\"ping\"}\n");
    assert_eq!(read_message(&mut reader)["type"], "pong");
}

#[test]
fn each_connection_gets_a_greeting() {
    let Some((_home, _guard, socket)) = start() else {
        return;
    };
    let (_first, _first_reader) = connect(&socket);
    let (mut second, mut second_reader) = connect(&socket);
    write_raw(&mut second, b"{\"type\":\"command\",\"command\":\"ping\"}\n");
    assert_eq!(read_message(&mut second_reader)["type"], "pong");
}
