//! # stagewatch-core
//!
//! Decision logic for Stagewatch, a watcher that counts a tracked object class
//! in a live detection stream and alerts when the count drifts from a
//! captured baseline.
//!
//! ## Design Principles
//!
//! - **Synchronous**: no async runtime. Slow model calls run on plain worker
//!   threads and report back over channels.
//! - **Deterministic first**: the debounced state machine alone decides when
//!   an alert fires. The advisory agent is an opinion, never an actor.
//! - **Graceful degradation**: model failures fall back to templates or are
//!   dropped; nothing on the frame path returns an error to the caller.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stagewatch_core::*;
//!
//! let config = load_config(None)?;
//! let source = DetectionCounter::new(config.detection.tracked_class.clone(), config.detection.conf_threshold);
//! let alert_text = AlertTextGenerator::deterministic(&config.alert);
//! let mut orchestrator = Orchestrator::new(config, Box::new(source), Box::new(sink), alert_text, None);
//! let outbound = orchestrator.process_frame(&frame);
//! ```

pub mod advisory;
pub mod alert_text;
pub mod config;
pub mod decision;
pub mod error;
pub mod history;
pub mod llm;
pub mod machine;
pub mod observation;
pub mod orchestrator;
pub mod sink;

pub use advisory::{AdvisoryAgent, AdvisoryDecision, AdvisoryRequest, ReasoningEngine};
pub use alert_text::{AlertText, AlertTextGenerator, TextGenerator};
pub use config::*;
pub use decision::{parse_decision, Decision, ParsedDecision};
pub use error::{ObservationError, Result, WatchError};
pub use history::{RollingHistory, HISTORY_CAPACITY};
pub use llm::{OllamaClient, OllamaReasoner, OllamaTextGenerator};
pub use machine::{DiscrepancyMachine, Evaluation, SessionState};
pub use observation::{DetectionCounter, Observation, ObservationSource};
pub use orchestrator::Orchestrator;
pub use sink::{EventSink, ObservationSample};
