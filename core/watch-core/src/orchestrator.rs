//! Per-frame orchestration.
//!
//! One frame runs, in order: observe, record history, evaluate, emit status,
//! maybe dispatch an advisory request, maybe sample the observation to
//! storage, and finally the deterministic alert. Status is the stream's
//! heartbeat and is emitted for every accepted frame.
//!
//! Two decision paths stay separate. Only `should_alert` from the state
//! machine produces an `alert` message; advisory results are surfaced as
//! `agent_decision` messages and never change session state. Advisory results
//! come back over a channel and are applied at safe points (the start of the
//! next frame, or [`Orchestrator::poll_advisories`]), so worker threads never
//! touch loop-owned state.

use serde_json::json;
use stagewatch_daemon_protocol::{
    AgentDecisionMessage, AlertMessage, Command, ConnectionConfig, DecisionBasis,
    DecisionPayload, FramePayload, HealthMessage, Outbound, StatusMessage, PROTOCOL_VERSION,
};
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::advisory::{AdvisoryAgent, AdvisoryDecision, AdvisoryRequest};
use crate::alert_text::AlertTextGenerator;
use crate::config::WatchConfig;
use crate::history::RollingHistory;
use crate::machine::{DiscrepancyMachine, Evaluation};
use crate::observation::ObservationSource;
use crate::sink::{EventSink, ObservationSample};

/// Fires on every `every`-th tick.
#[derive(Debug, Clone)]
struct FrameSampler {
    every: u64,
    seen: u64,
}

impl FrameSampler {
    fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
            seen: 0,
        }
    }

    fn tick(&mut self) -> bool {
        self.seen += 1;
        self.seen % self.every == 0
    }
}

pub struct Orchestrator {
    config: WatchConfig,
    machine: DiscrepancyMachine,
    history: RollingHistory,
    source: Box<dyn ObservationSource + Send>,
    sink: Box<dyn EventSink>,
    alert_text: AlertTextGenerator,
    agent: Option<AdvisoryAgent>,
    advisory_tx: Sender<AdvisoryDecision>,
    advisory_rx: Receiver<AdvisoryDecision>,
    advisory_sampler: FrameSampler,
    observation_sampler: FrameSampler,
    /// Bumped on reset and rebaseline; advisory results from an older epoch
    /// are flagged stale.
    epoch: u64,
}

impl Orchestrator {
    pub fn new(
        config: WatchConfig,
        source: Box<dyn ObservationSource + Send>,
        sink: Box<dyn EventSink>,
        alert_text: AlertTextGenerator,
        agent: Option<AdvisoryAgent>,
    ) -> Self {
        let (advisory_tx, advisory_rx) = mpsc::channel();
        let machine = DiscrepancyMachine::new(
            config.session.debounce_k,
            Duration::from_secs(config.session.cooldown_sec),
        );
        let agent = agent.filter(|_| config.agent.enabled);
        Self {
            advisory_sampler: FrameSampler::new(config.sampling.agent_every_n_frames),
            observation_sampler: FrameSampler::new(config.sampling.observation_every),
            config,
            machine,
            history: RollingHistory::default(),
            source,
            sink,
            alert_text,
            agent,
            advisory_tx,
            advisory_rx,
            epoch: 0,
        }
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    pub fn machine(&self) -> &DiscrepancyMachine {
        &self.machine
    }

    pub fn history(&self) -> &RollingHistory {
        &self.history
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn agent_ready(&self) -> bool {
        self.agent.as_ref().map(AdvisoryAgent::is_ready).unwrap_or(false)
    }

    /// First message on every new connection.
    pub fn connection_config(&self) -> Outbound {
        Outbound::Config(ConnectionConfig {
            protocol_version: PROTOCOL_VERSION,
            tracked_class: self.config.detection.tracked_class.clone(),
            agent_ready: self.agent_ready(),
        })
    }

    /// Effective configuration, as returned for the `config` query.
    pub fn settings(&self) -> serde_json::Value {
        serde_json::to_value(&self.config).unwrap_or_else(|_| json!({}))
    }

    pub fn health(&self) -> HealthMessage {
        HealthMessage {
            ok: true,
            version: env!("CARGO_PKG_VERSION").to_string(),
            state: self.machine.state().as_str().to_string(),
            baseline: self.machine.baseline_count(),
            last_observed: self.machine.last_observed_count(),
            discrepancy_streak: self.machine.discrepancy_streak(),
            cooldown_remaining_sec: round_to(
                self.machine.cooldown_remaining(Instant::now()).as_secs_f64(),
                2,
            ),
            agent_enabled: self.agent.is_some(),
            agent_ready: self.agent_ready(),
            epoch: self.epoch,
        }
    }

    pub fn process_frame(&mut self, frame: &FramePayload) -> Vec<Outbound> {
        self.process_frame_at(frame, Instant::now())
    }

    pub fn process_frame_at(&mut self, frame: &FramePayload, now: Instant) -> Vec<Outbound> {
        let mut out = self.poll_advisories();

        let observation = match self.source.observe(frame) {
            Ok(observation) => observation,
            Err(err) => {
                tracing::warn!(error = %err, "Rejected frame");
                out.push(Outbound::error(
                    "invalid_frame",
                    format!("Bad frame payload: {}", err),
                ));
                return out;
            }
        };

        self.machine.on_stream_started();
        self.history.push(observation.count);
        let evaluation = self.machine.evaluate_at(observation.count, now);
        let timestamp_ms = frame.timestamp_ms.unwrap_or_else(unix_millis);

        out.push(Outbound::Status(
            self.status_message(&evaluation, observation.confidence, timestamp_ms),
        ));

        let advisory_due = self.advisory_sampler.tick();
        if advisory_due && evaluation.discrepancy_streak > 0 {
            if let Some(baseline_count) = evaluation.baseline_count {
                self.dispatch_advisory(&evaluation, baseline_count, observation.confidence);
            }
        }

        if self.observation_sampler.tick() {
            self.sink.log_observation(&ObservationSample {
                state: evaluation.state,
                item_count: observation.count,
                baseline_count: evaluation.baseline_count,
                diff: evaluation.diff,
                avg_conf: observation.confidence,
                streak: evaluation.discrepancy_streak,
            });
        }

        if evaluation.should_alert {
            if let Some(baseline_count) = evaluation.baseline_count {
                out.push(self.raise_alert(&evaluation, baseline_count));
            }
        }

        out
    }

    pub fn handle_command(&mut self, command: Command) -> Outbound {
        match command {
            Command::SetBaseline => {
                let Some(observed) = self.machine.last_observed_count() else {
                    return Outbound::error("no_observation", "No observation available yet.");
                };
                self.machine.set_baseline(observed);
                self.epoch += 1;
                self.sink.log_event(
                    "baseline_set",
                    json!({
                        "baseline_count": observed,
                        "observed_count": observed,
                    }),
                );
                tracing::info!(baseline = observed, "Baseline set");
            }
            Command::Arm => {
                self.machine.arm();
                self.log_state_event("armed");
            }
            Command::Disarm => {
                self.machine.disarm();
                self.log_state_event("disarmed");
            }
            Command::Reset => {
                self.machine.reset();
                self.epoch += 1;
                self.sink.log_event("reset", json!({}));
                tracing::info!("Session reset");
            }
            Command::Ping => {
                return Outbound::Pong {
                    timestamp_ms: unix_millis(),
                }
            }
        }
        Outbound::ack(command)
    }

    /// Applies advisory results that finished since the last safe point.
    pub fn poll_advisories(&mut self) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(result) = self.advisory_rx.try_recv() {
            out.push(self.apply_advisory(result));
        }
        out
    }

    fn status_message(
        &self,
        evaluation: &Evaluation,
        confidence: f32,
        timestamp_ms: u64,
    ) -> StatusMessage {
        StatusMessage {
            timestamp_ms,
            state: evaluation.state.as_str().to_string(),
            item_count: Some(evaluation.observed_count),
            baseline_count: evaluation.baseline_count,
            diff: evaluation.diff,
            discrepancy_streak: evaluation.discrepancy_streak,
            cooldown_remaining_sec: round_to(evaluation.cooldown_remaining_secs, 2),
            average_conf: round_to(f64::from(confidence), 3),
            k: self.machine.debounce_k(),
            t_sec: self.config.session.cooldown_sec,
        }
    }

    fn dispatch_advisory(&self, evaluation: &Evaluation, baseline_count: u32, confidence: f32) {
        let Some(agent) = self.agent.as_ref() else {
            return;
        };
        if !agent.is_ready() {
            return;
        }
        let request = AdvisoryRequest {
            state: evaluation.state,
            item_count: evaluation.observed_count,
            baseline_count,
            discrepancy_streak: evaluation.discrepancy_streak,
            average_conf: confidence,
            history: self.history.snapshot(),
            epoch: self.epoch,
        };
        let tx = self.advisory_tx.clone();
        let dispatched = agent.decide_async(request, move |decision| {
            // The receiver only goes away with the orchestrator itself.
            let _ = tx.send(decision);
        });
        tracing::debug!(
            dispatched,
            streak = evaluation.discrepancy_streak,
            "Advisory request"
        );
    }

    fn apply_advisory(&mut self, result: AdvisoryDecision) -> Outbound {
        let stale = result.basis.epoch != self.epoch;
        let AdvisoryDecision { decision, basis } = result;
        let payload = DecisionPayload::from(&decision.decision);

        let mut record = serde_json::to_value(&payload).unwrap_or_else(|_| json!({}));
        record["raw_output"] = json!(decision.raw_output);
        record["streak"] = json!(basis.discrepancy_streak);
        record["stale"] = json!(stale);
        self.sink.log_event(decision.decision.event_type(), record);

        tracing::info!(
            action = decision.decision.action(),
            stale,
            epoch = basis.epoch,
            "Advisory decision"
        );

        Outbound::AgentDecision(AgentDecisionMessage {
            decision: payload,
            raw_output: decision.raw_output,
            basis: DecisionBasis {
                state: basis.state.as_str().to_string(),
                item_count: basis.item_count,
                baseline_count: basis.baseline_count,
                discrepancy_streak: basis.discrepancy_streak,
                average_conf: round_to(f64::from(basis.average_conf), 3),
                history: basis.history,
                epoch: basis.epoch,
            },
            stale,
        })
    }

    fn raise_alert(&self, evaluation: &Evaluation, baseline_count: u32) -> Outbound {
        let text = self
            .alert_text
            .generate(baseline_count, evaluation.observed_count, evaluation.diff);
        let message = AlertMessage {
            baseline_count,
            observed_count: evaluation.observed_count,
            diff: evaluation.diff,
            message: text.into_text(),
        };
        self.sink.log_event(
            "alert",
            json!({
                "baseline_count": message.baseline_count,
                "observed_count": message.observed_count,
                "diff": message.diff,
                "message": message.message,
            }),
        );
        tracing::info!(
            baseline = baseline_count,
            observed = evaluation.observed_count,
            diff = evaluation.diff,
            "Alert raised"
        );
        Outbound::Alert(message)
    }

    fn log_state_event(&self, event_type: &str) {
        self.sink.log_event(
            event_type,
            json!({
                "state": self.machine.state().as_str(),
                "baseline_count": self.machine.baseline_count(),
            }),
        );
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
