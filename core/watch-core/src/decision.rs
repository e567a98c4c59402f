//! Function-call grammar for advisory decisions.
//!
//! The reasoning model answers with exactly one call:
//! `trigger_alert(severity="..", message="..")`, `rebaseline(new_count=N)`, or
//! `ignore_event(reason="..")`. Parsing never fails; anything unrecognized is
//! an `IgnoreEvent` and each missing argument falls back to its default.

use once_cell::sync::Lazy;
use regex::Regex;
use stagewatch_daemon_protocol::DecisionPayload;

pub const DEFAULT_SEVERITY: &str = "medium";
pub const DEFAULT_ALERT_MESSAGE: &str = "Inventory change detected.";
pub const DEFAULT_IGNORE_REASON: &str = "No significant change.";

static SEVERITY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"severity=["']([^"']+)["']"#).unwrap());
static MESSAGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"message=["']([^"']+)["']"#).unwrap());
static REASON_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"reason=["']([^"']+)["']"#).unwrap());
static NEW_COUNT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"new_count=(\d+)").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    TriggerAlert { severity: String, message: String },
    Rebaseline { new_count: u32 },
    IgnoreEvent { reason: String },
}

impl Decision {
    pub fn action(&self) -> &'static str {
        match self {
            Decision::TriggerAlert { .. } => "trigger_alert",
            Decision::Rebaseline { .. } => "rebaseline",
            Decision::IgnoreEvent { .. } => "ignore_event",
        }
    }

    /// Event-log type used when the decision is persisted.
    pub fn event_type(&self) -> &'static str {
        match self {
            Decision::TriggerAlert { .. } => "agent_alert",
            Decision::Rebaseline { .. } => "agent_rebaseline",
            Decision::IgnoreEvent { .. } => "agent_ignore",
        }
    }
}

impl From<&Decision> for DecisionPayload {
    fn from(decision: &Decision) -> Self {
        match decision {
            Decision::TriggerAlert { severity, message } => DecisionPayload::TriggerAlert {
                severity: severity.clone(),
                message: message.clone(),
            },
            Decision::Rebaseline { new_count } => DecisionPayload::Rebaseline {
                new_count: *new_count,
            },
            Decision::IgnoreEvent { reason } => DecisionPayload::IgnoreEvent {
                reason: reason.clone(),
            },
        }
    }
}

/// A decision plus the raw model text it came from (kept for audit).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDecision {
    pub decision: Decision,
    pub raw_output: String,
}

pub fn parse_decision(text: &str, observed_count: u32) -> ParsedDecision {
    let text = text.trim();

    let decision = if text.starts_with("trigger_alert") {
        Decision::TriggerAlert {
            severity: capture(&SEVERITY_RE, text).unwrap_or_else(|| DEFAULT_SEVERITY.to_string()),
            message: capture(&MESSAGE_RE, text)
                .unwrap_or_else(|| DEFAULT_ALERT_MESSAGE.to_string()),
        }
    } else if text.starts_with("rebaseline") {
        Decision::Rebaseline {
            new_count: capture(&NEW_COUNT_RE, text)
                .and_then(|raw| raw.parse::<u32>().ok())
                .unwrap_or(observed_count),
        }
    } else {
        Decision::IgnoreEvent {
            reason: capture(&REASON_RE, text).unwrap_or_else(|| DEFAULT_IGNORE_REASON.to_string()),
        }
    };

    ParsedDecision {
        decision,
        raw_output: text.to_string(),
    }
}

fn capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}
