//! Stagewatch daemon entrypoint.
//!
//! A socket listener that feeds newline-delimited JSON frames through the
//! orchestrator and streams status and alerts back on the same connection.
//! One orchestrator is shared by every connection; the frame loop for a given
//! message runs under its lock. Advisory decisions go to every connection
//! that streams frames, never to command-only clients.

use fs_err as fs;
use std::env;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use stagewatch_core::{
    load_config, AdvisoryAgent, AlertTextGenerator, DetectionCounter, OllamaClient,
    OllamaReasoner, OllamaTextGenerator, Orchestrator, WatchConfig,
};
use stagewatch_daemon_protocol::{parse_inbound, Inbound, Outbound, Query, MAX_MESSAGE_BYTES};

mod advisory_hub;
mod db;

use advisory_hub::{route, AdvisoryHub, Subscription};
use db::Db;

const SOCKET_NAME: &str = "daemon.sock";
const SOCKET_ENV: &str = "STAGEWATCH_SOCKET";
const CONFIG_ENV: &str = "STAGEWATCH_CONFIG";
/// How often an idle connection checks for finished advisory decisions.
const ADVISORY_POLL_INTERVAL: Duration = Duration::from_millis(250);
const READ_CHUNK_SIZE: usize = 4096;
const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_millis(2500);

fn main() {
    init_logging();

    let config_path = env::var_os(CONFIG_ENV).map(PathBuf::from);
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config; using defaults");
            let mut config = WatchConfig::default();
            config.apply_env_overrides(|key| env::var(key).ok());
            config
        }
    };

    let socket_path = match daemon_socket_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon socket path");
            std::process::exit(1);
        }
    };

    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let db_path = match config.sqlite_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve database path");
            std::process::exit(1);
        }
    };

    let db = match Db::new(db_path.clone()) {
        Ok(db) => db,
        Err(err) => {
            error!(error = %err, path = %db_path.display(), "Failed to initialize database");
            std::process::exit(1);
        }
    };

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    info!(
        path = %socket_path.display(),
        tracked_class = %config.detection.tracked_class,
        debounce_k = config.session.debounce_k,
        cooldown_sec = config.session.cooldown_sec,
        agent_enabled = config.agent.enabled,
        "Stagewatch daemon started"
    );

    let shared = Arc::new(Shared {
        orchestrator: Mutex::new(build_orchestrator(config, &db)),
        hub: Arc::new(AdvisoryHub::default()),
        db,
    });

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let shared = Arc::clone(&shared);
                thread::spawn(move || handle_connection(stream, shared));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

fn init_logging() {
    let debug_enabled = env::var("STAGEWATCH_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_orchestrator(config: WatchConfig, db: &Db) -> Orchestrator {
    let source = DetectionCounter::new(
        config.detection.tracked_class.clone(),
        config.detection.conf_threshold,
    );

    let llm_timeout = seconds(config.llm.timeout_sec);
    let alert_text = match OllamaClient::new(&config.llm.base_url, llm_timeout) {
        Ok(client) => AlertTextGenerator::new(
            &config.alert,
            Some(Box::new(OllamaTextGenerator::new(
                client,
                config.llm.model.clone(),
            ))),
        ),
        Err(err) => {
            warn!(error = %err, "Alert text model unavailable; using templates only");
            AlertTextGenerator::deterministic(&config.alert)
        }
    };

    let agent = if config.agent.enabled {
        match OllamaClient::new(&config.llm.base_url, seconds(config.agent.timeout_sec)) {
            Ok(client) => {
                let agent = AdvisoryAgent::new(Box::new(OllamaReasoner::new(
                    client,
                    config.agent.model.clone(),
                )));
                // Loads in the background; frames flow while the model warms up.
                let _ = agent.load_async();
                Some(agent)
            }
            Err(err) => {
                warn!(error = %err, "Advisory agent disabled");
                None
            }
        }
    } else {
        None
    };

    Orchestrator::new(
        config,
        Box::new(source),
        Box::new(db.clone()),
        alert_text,
        agent,
    )
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(DEFAULT_LLM_TIMEOUT)
}

fn daemon_socket_path() -> Result<PathBuf, String> {
    if let Ok(value) = env::var(SOCKET_ENV) {
        if !value.trim().is_empty() {
            return Ok(PathBuf::from(value));
        }
    }
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".stagewatch").join(SOCKET_NAME))
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(stream: UnixStream, shared: Arc<Shared>) {
    if let Err(err) = stream.set_read_timeout(Some(ADVISORY_POLL_INTERVAL)) {
        warn!(error = %err, "Failed to set read timeout; advisory decisions will wait for frames");
    }
    tracing::debug!("Client connected");

    let greeting = match shared.orchestrator.lock() {
        Ok(orchestrator) => orchestrator.connection_config(),
        Err(_) => {
            error!("Orchestrator lock poisoned");
            return;
        }
    };
    let mut connection = Connection {
        stream,
        shared,
        subscription: None,
    };
    if connection.send(vec![greeting]).is_err() {
        return;
    }

    let mut reader = LineReader::default();
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    'read: loop {
        match connection.stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                for line in reader.push(&chunk[..n]) {
                    let replies = connection.handle_line(&line);
                    if connection.send(replies).is_err() {
                        break 'read;
                    }
                }
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                if connection.poll_advisories().is_err() || connection.send(Vec::new()).is_err() {
                    break;
                }
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!(error = %err, "Failed to read from client");
                break;
            }
        }
    }
    let hub = Arc::clone(&connection.shared.hub);
    drop(connection);
    tracing::debug!(
        streaming_connections = hub.subscriber_count(),
        "Client disconnected"
    );
}

/// State shared by every connection thread.
struct Shared {
    orchestrator: Mutex<Orchestrator>,
    hub: Arc<AdvisoryHub>,
    db: Db,
}

struct Connection {
    stream: UnixStream,
    shared: Arc<Shared>,
    /// Set once the peer sends its first frame; only streaming connections
    /// receive advisory decisions.
    subscription: Option<Subscription>,
}

impl Connection {
    fn handle_line(&mut self, line: &Line) -> Vec<Outbound> {
        let bytes = match line {
            Line::Complete(bytes) => bytes,
            Line::Oversized => {
                warn!("Dropped oversized message");
                return vec![Outbound::error(
                    "message_too_large",
                    "message exceeded maximum size",
                )];
            }
        };
        // Blank lines are keep-alives.
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Vec::new();
        }

        let inbound = match parse_inbound(bytes) {
            Ok(inbound) => inbound,
            Err(err) => {
                warn!(code = %err.code, message = %err.message, "Rejected message");
                return vec![Outbound::Error(err)];
            }
        };

        if matches!(inbound, Inbound::Frame(_)) && self.subscription.is_none() {
            self.subscription = Some(AdvisoryHub::subscribe(&self.shared.hub));
        }

        let shared = Arc::clone(&self.shared);
        let Ok(mut orchestrator) = shared.orchestrator.lock() else {
            return vec![Outbound::error("internal_error", "orchestrator unavailable")];
        };
        match inbound {
            Inbound::Frame(frame) => route(&shared.hub, orchestrator.process_frame(&frame)),
            Inbound::Command(command) => {
                tracing::debug!(command = command.as_str(), "Command received");
                vec![orchestrator.handle_command(command)]
            }
            Inbound::Query(query) => vec![handle_query(query, &orchestrator, &shared.db)],
        }
    }

    /// Drains finished advisory decisions into the hub. Connections that
    /// never streamed leave them queued for one that does.
    fn poll_advisories(&self) -> Result<(), String> {
        if self.subscription.is_none() {
            return Ok(());
        }
        let decisions = self
            .shared
            .orchestrator
            .lock()
            .map_err(|_| "Orchestrator lock poisoned".to_string())?
            .poll_advisories();
        self.shared.hub.publish(&decisions);
        Ok(())
    }

    /// Writes published decisions first, then the replies to the last line.
    fn send(&mut self, replies: Vec<Outbound>) -> Result<(), String> {
        let mut messages = self
            .subscription
            .as_ref()
            .map(Subscription::drain)
            .unwrap_or_default();
        messages.extend(replies);
        write_messages(&mut self.stream, &messages)
    }
}

enum Line {
    Complete(Vec<u8>),
    Oversized,
}

/// Splits a byte stream into lines, refusing to buffer more than one
/// message's worth of bytes.
#[derive(Default)]
struct LineReader {
    buffer: Vec<u8>,
    discarding: bool,
}

impl LineReader {
    fn push(&mut self, bytes: &[u8]) -> Vec<Line> {
        let mut lines = Vec::new();
        for &byte in bytes {
            if byte == b'\n' {
                if self.discarding {
                    self.discarding = false;
                } else {
                    lines.push(Line::Complete(std::mem::take(&mut self.buffer)));
                }
                continue;
            }
            if self.discarding {
                continue;
            }
            self.buffer.push(byte);
            if self.buffer.len() > MAX_MESSAGE_BYTES {
                self.buffer.clear();
                self.discarding = true;
                lines.push(Line::Oversized);
            }
        }
        lines
    }
}

fn handle_query(query: Query, orchestrator: &Orchestrator, db: &Db) -> Outbound {
    match query {
        Query::Health => Outbound::Health(orchestrator.health()),
        Query::Config => Outbound::Settings {
            settings: orchestrator.settings(),
        },
        Query::Events { limit } => match db.recent_events(limit) {
            Ok(events) => Outbound::Events { events },
            Err(err) => Outbound::error("storage_error", format!("Failed to fetch events: {}", err)),
        },
        Query::Observations { limit } => match db.recent_observations(limit) {
            Ok(observations) => Outbound::Observations { observations },
            Err(err) => Outbound::error(
                "storage_error",
                format!("Failed to fetch observations: {}", err),
            ),
        },
    }
}

fn write_messages(stream: &mut UnixStream, messages: &[Outbound]) -> Result<(), String> {
    if messages.is_empty() {
        return Ok(());
    }
    let mut payload = Vec::new();
    for message in messages {
        let line = serde_json::to_vec(message)
            .map_err(|err| format!("Failed to serialize {}: {}", message.type_name(), err))?;
        payload.extend_from_slice(&line);
        payload.push(b'\n');
    }
    stream.write_all(&payload).map_err(|err| {
        tracing::debug!(error = %err, "Failed to write to client");
        format!("Failed to write response: {}", err)
    })
}
