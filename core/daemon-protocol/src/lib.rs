//! Wire protocol types and validation for stagewatch-daemon.
//!
//! Every message is one JSON object per line. Inbound lines carry frames
//! (detections from the external detector), session commands, or read-only
//! queries. Outbound lines are tagged by `type` so a consumer can always tell
//! the deterministic `alert` apart from an advisory `agent_decision`.
//!
//! We fail fast on malformed input here so the frame loop never sees a
//! half-parsed message.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024; // 1MB

pub const DEFAULT_EVENTS_LIMIT: usize = 50;
pub const MAX_EVENTS_LIMIT: usize = 200;
pub const DEFAULT_OBSERVATIONS_LIMIT: usize = 100;
pub const MAX_OBSERVATIONS_LIMIT: usize = 500;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound
// ─────────────────────────────────────────────────────────────────────────────

/// One box reported by the external detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    /// Normalized `[x1, y1, x2, y2]`, informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[f32; 4]>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FramePayload {
    #[serde(default)]
    pub timestamp_ms: Option<u64>,
    pub detections: Vec<Detection>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    SetBaseline,
    Arm,
    Disarm,
    Reset,
    Ping,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::SetBaseline => "set_baseline",
            Command::Arm => "arm",
            Command::Disarm => "disarm",
            Command::Reset => "reset",
            Command::Ping => "ping",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "set_baseline" => Some(Command::SetBaseline),
            "arm" => Some(Command::Arm),
            "disarm" => Some(Command::Disarm),
            "reset" => Some(Command::Reset),
            "ping" => Some(Command::Ping),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    Health,
    Config,
    Events { limit: usize },
    Observations { limit: usize },
}

impl Query {
    pub fn as_str(&self) -> &'static str {
        match self {
            Query::Health => "health",
            Query::Config => "config",
            Query::Events { .. } => "events",
            Query::Observations { .. } => "observations",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Frame(FramePayload),
    Command(Command),
    Query(Query),
}

impl Inbound {
    /// Encodes the message as a single JSON value, ready to be written as a line.
    pub fn to_json(&self) -> Value {
        match self {
            Inbound::Frame(frame) => {
                let mut value = serde_json::to_value(frame).unwrap_or(Value::Null);
                if let Some(object) = value.as_object_mut() {
                    object.insert("type".to_string(), Value::String("frame".to_string()));
                }
                value
            }
            Inbound::Command(command) => serde_json::json!({
                "type": "command",
                "command": command.as_str(),
            }),
            Inbound::Query(query) => {
                let mut value = serde_json::json!({
                    "type": "query",
                    "query": query.as_str(),
                });
                if let Query::Events { limit } | Query::Observations { limit } = query {
                    value["limit"] = Value::from(*limit as u64);
                }
                value
            }
        }
    }
}

/// Parses one inbound line.
///
/// Unknown `type`, `command`, and `query` values are reported with explicit
/// errors rather than being ignored; the caller replies and keeps the
/// connection open.
pub fn parse_inbound(line: &[u8]) -> Result<Inbound, ErrorInfo> {
    if line.len() > MAX_MESSAGE_BYTES {
        return Err(ErrorInfo::new(
            "message_too_large",
            "message exceeded maximum size",
        ));
    }
    if line.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_message", "message body was empty"));
    }

    let value: Value = serde_json::from_slice(line).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("message was not valid JSON: {}", err),
        )
    })?;
    let object = value
        .as_object()
        .ok_or_else(|| ErrorInfo::new("invalid_message", "message must be a JSON object"))?;

    let msg_type = object.get("type").and_then(Value::as_str);
    match msg_type {
        Some("frame") => parse_frame(value.clone()).map(Inbound::Frame),
        Some("command") => {
            let command = object.get("command").and_then(Value::as_str);
            match command.and_then(Command::parse) {
                Some(command) => Ok(Inbound::Command(command)),
                None => Err(ErrorInfo::new(
                    "unknown_command",
                    format!("Unknown command: {}", command.unwrap_or("null")),
                )),
            }
        }
        Some("query") => parse_query(object).map(Inbound::Query),
        other => Err(ErrorInfo::new(
            "unknown_type",
            format!("Unknown type: {}", other.unwrap_or("null")),
        )),
    }
}

fn parse_frame(mut value: Value) -> Result<FramePayload, ErrorInfo> {
    let object = value
        .as_object_mut()
        .ok_or_else(|| ErrorInfo::new("invalid_message", "message must be a JSON object"))?;
    if !object.contains_key("detections") {
        return Err(ErrorInfo::new("missing_field", "Missing detections"));
    }
    object.remove("type");
    serde_json::from_value(value)
        .map_err(|err| ErrorInfo::new("invalid_frame", format!("Bad frame payload: {}", err)))
}

fn parse_query(object: &serde_json::Map<String, Value>) -> Result<Query, ErrorInfo> {
    let limit = object
        .get("limit")
        .and_then(Value::as_u64)
        .map(|value| value as usize);
    match object.get("query").and_then(Value::as_str) {
        Some("health") => Ok(Query::Health),
        Some("config") => Ok(Query::Config),
        Some("events") => Ok(Query::Events {
            limit: limit
                .unwrap_or(DEFAULT_EVENTS_LIMIT)
                .min(MAX_EVENTS_LIMIT),
        }),
        Some("observations") => Ok(Query::Observations {
            limit: limit
                .unwrap_or(DEFAULT_OBSERVATIONS_LIMIT)
                .min(MAX_OBSERVATIONS_LIMIT),
        }),
        other => Err(ErrorInfo::new(
            "unknown_query",
            format!("Unknown query: {}", other.unwrap_or("null")),
        )),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    Config(ConnectionConfig),
    Status(StatusMessage),
    Alert(AlertMessage),
    AgentDecision(AgentDecisionMessage),
    Error(ErrorInfo),
    Ack { command: String, ok: bool },
    Pong { timestamp_ms: u64 },
    Health(HealthMessage),
    Settings { settings: Value },
    Events { events: Vec<EventRecord> },
    Observations { observations: Vec<ObservationRecord> },
}

impl Outbound {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Outbound::Error(ErrorInfo::new(code, message))
    }

    pub fn ack(command: Command) -> Self {
        Outbound::Ack {
            command: command.as_str().to_string(),
            ok: true,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Outbound::Config(_) => "config",
            Outbound::Status(_) => "status",
            Outbound::Alert(_) => "alert",
            Outbound::AgentDecision(_) => "agent_decision",
            Outbound::Error(_) => "error",
            Outbound::Ack { .. } => "ack",
            Outbound::Pong { .. } => "pong",
            Outbound::Health(_) => "health",
            Outbound::Settings { .. } => "settings",
            Outbound::Events { .. } => "events",
            Outbound::Observations { .. } => "observations",
        }
    }
}

/// Sent once when a connection opens so the client knows what is tracked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub protocol_version: u32,
    pub tracked_class: String,
    pub agent_ready: bool,
}

/// Per-frame heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub timestamp_ms: u64,
    pub state: String,
    pub item_count: Option<u32>,
    pub baseline_count: Option<u32>,
    pub diff: i64,
    pub discrepancy_streak: u32,
    pub cooldown_remaining_sec: f64,
    pub average_conf: f64,
    pub k: u32,
    pub t_sec: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertMessage {
    pub baseline_count: u32,
    pub observed_count: u32,
    pub diff: i64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DecisionPayload {
    TriggerAlert { severity: String, message: String },
    Rebaseline { new_count: u32 },
    IgnoreEvent { reason: String },
}

/// The facts an advisory decision was computed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionBasis {
    pub state: String,
    pub item_count: u32,
    pub baseline_count: u32,
    pub discrepancy_streak: u32,
    pub average_conf: f64,
    pub history: Vec<u32>,
    pub epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDecisionMessage {
    #[serde(flatten)]
    pub decision: DecisionPayload,
    pub raw_output: String,
    pub basis: DecisionBasis,
    /// True when the session was reset or rebaselined after dispatch.
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthMessage {
    pub ok: bool,
    pub version: String,
    pub state: String,
    pub baseline: Option<u32>,
    pub last_observed: Option<u32>,
    pub discrepancy_streak: u32,
    pub cooldown_remaining_sec: f64,
    pub agent_enabled: bool,
    pub agent_ready: bool,
    pub epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    pub ts_utc: String,
    pub event_type: String,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationRecord {
    pub id: i64,
    pub ts_utc: String,
    pub state: String,
    pub item_count: u32,
    pub baseline_count: Option<u32>,
    pub diff: i64,
    pub avg_conf: f64,
    pub streak: u32,
}
