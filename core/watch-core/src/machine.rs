//! Discrepancy state machine.
//!
//! Converts noisy per-frame counts into a stable alert signal. A session moves
//! `IDLE -> STREAMING -> BASELINED -> ARMED <-> COOLDOWN`, and `reset` returns
//! to `IDLE` from anywhere. While armed, `debounce_k` consecutive discrepant
//! frames fire one alert and start a cooldown; a single matching frame clears
//! the streak. Cooldown expiry is checked lazily on the next `evaluate`, never
//! by a timer.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionState {
    Idle,
    Streaming,
    Baselined,
    Armed,
    Cooldown,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "IDLE",
            SessionState::Streaming => "STREAMING",
            SessionState::Baselined => "BASELINED",
            SessionState::Armed => "ARMED",
            SessionState::Cooldown => "COOLDOWN",
        }
    }

    pub fn has_baseline(&self) -> bool {
        matches!(
            self,
            SessionState::Baselined | SessionState::Armed | SessionState::Cooldown
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one frame's evaluation. Never mutated after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub state: SessionState,
    pub baseline_count: Option<u32>,
    pub observed_count: u32,
    pub diff: i64,
    pub discrepancy_streak: u32,
    pub cooldown_remaining_secs: f64,
    pub should_alert: bool,
}

#[derive(Debug, Clone)]
pub struct DiscrepancyMachine {
    debounce_k: u32,
    cooldown: Duration,
    state: SessionState,
    baseline_count: Option<u32>,
    last_observed_count: Option<u32>,
    discrepancy_streak: u32,
    cooldown_deadline: Option<Instant>,
}

impl DiscrepancyMachine {
    pub fn new(debounce_k: u32, cooldown: Duration) -> Self {
        Self {
            debounce_k: debounce_k.max(1),
            cooldown,
            state: SessionState::Idle,
            baseline_count: None,
            last_observed_count: None,
            discrepancy_streak: 0,
            cooldown_deadline: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn baseline_count(&self) -> Option<u32> {
        self.baseline_count
    }

    pub fn last_observed_count(&self) -> Option<u32> {
        self.last_observed_count
    }

    pub fn discrepancy_streak(&self) -> u32 {
        self.discrepancy_streak
    }

    pub fn debounce_k(&self) -> u32 {
        self.debounce_k
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn cooldown_remaining(&self, now: Instant) -> Duration {
        self.cooldown_deadline
            .map(|deadline| deadline.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    pub fn on_stream_started(&mut self) {
        if self.state == SessionState::Idle {
            self.state = SessionState::Streaming;
        }
    }

    /// Records `count` as the trusted baseline. The caller must only do this
    /// once an observation exists.
    pub fn set_baseline(&mut self, count: u32) {
        self.baseline_count = Some(count);
        self.discrepancy_streak = 0;
        self.cooldown_deadline = None;
        self.state = SessionState::Baselined;
    }

    /// Starts guarding. Ignored without a baseline; an active cooldown is not
    /// skipped and expires on its own.
    pub fn arm(&mut self) {
        if self.baseline_count.is_none() {
            return;
        }
        self.discrepancy_streak = 0;
        if self.state != SessionState::Cooldown {
            self.state = SessionState::Armed;
        }
    }

    pub fn disarm(&mut self) {
        if self.baseline_count.is_some() {
            self.state = SessionState::Baselined;
            self.discrepancy_streak = 0;
        }
    }

    pub fn reset(&mut self) {
        self.state = SessionState::Idle;
        self.baseline_count = None;
        self.last_observed_count = None;
        self.discrepancy_streak = 0;
        self.cooldown_deadline = None;
    }

    pub fn evaluate(&mut self, observed_count: u32) -> Evaluation {
        self.evaluate_at(observed_count, Instant::now())
    }

    /// Runs the per-frame algorithm against an explicit monotonic `now`.
    pub fn evaluate_at(&mut self, observed_count: u32, now: Instant) -> Evaluation {
        self.last_observed_count = Some(observed_count);
        let diff = match self.baseline_count {
            Some(baseline) => i64::from(observed_count) - i64::from(baseline),
            None => 0,
        };

        let mut cooldown_remaining = self.cooldown_remaining(now);
        if self.state == SessionState::Cooldown && cooldown_remaining.is_zero() {
            self.state = SessionState::Armed;
            self.cooldown_deadline = None;
        }

        let mut should_alert = false;
        match self.state {
            SessionState::Idle | SessionState::Streaming | SessionState::Baselined => {
                self.discrepancy_streak = 0;
            }
            SessionState::Armed => {
                if diff == 0 {
                    self.discrepancy_streak = 0;
                } else {
                    self.discrepancy_streak += 1;
                    if self.discrepancy_streak >= self.debounce_k {
                        should_alert = true;
                        self.discrepancy_streak = 0;
                        self.state = SessionState::Cooldown;
                        self.cooldown_deadline = Some(now + self.cooldown);
                        cooldown_remaining = self.cooldown;
                    }
                }
            }
            SessionState::Cooldown => {
                self.discrepancy_streak = 0;
            }
        }

        Evaluation {
            state: self.state,
            baseline_count: self.baseline_count,
            observed_count,
            diff,
            discrepancy_streak: self.discrepancy_streak,
            cooldown_remaining_secs: cooldown_remaining.as_secs_f64(),
            should_alert,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COOLDOWN: Duration = Duration::from_secs(10);

    fn armed_machine(k: u32, baseline: u32) -> DiscrepancyMachine {
        let mut machine = DiscrepancyMachine::new(k, COOLDOWN);
        machine.on_stream_started();
        machine.evaluate(baseline);
        machine.set_baseline(baseline);
        machine.arm();
        assert_eq!(machine.state(), SessionState::Armed);
        machine
    }

    #[test]
    fn stream_start_only_leaves_idle() {
        let mut machine = DiscrepancyMachine::new(3, COOLDOWN);
        machine.on_stream_started();
        assert_eq!(machine.state(), SessionState::Streaming);

        machine.evaluate(4);
        machine.set_baseline(4);
        machine.on_stream_started();
        assert_eq!(machine.state(), SessionState::Baselined);
    }

    #[test]
    fn alerts_exactly_on_kth_consecutive_discrepancy() {
        let k = 4;
        let mut machine = armed_machine(k, 10);
        let start = Instant::now();

        for call in 1..k {
            let eval = machine.evaluate_at(7, start);
            assert!(!eval.should_alert, "call {} must not alert", call);
            assert_eq!(eval.discrepancy_streak, call);
            assert_eq!(eval.diff, -3);
        }

        let eval = machine.evaluate_at(7, start);
        assert!(eval.should_alert);
        assert_eq!(eval.state, SessionState::Cooldown);
        assert_eq!(eval.discrepancy_streak, 0);
        assert_eq!(eval.cooldown_remaining_secs, COOLDOWN.as_secs_f64());
    }

    #[test]
    fn clean_frame_clears_streak() {
        let mut machine = armed_machine(3, 5);
        let now = Instant::now();

        machine.evaluate_at(6, now);
        machine.evaluate_at(6, now);
        let eval = machine.evaluate_at(5, now);
        assert_eq!(eval.discrepancy_streak, 0);
        assert!(!eval.should_alert);

        // Needs a full run of k again.
        assert!(!machine.evaluate_at(6, now).should_alert);
        assert!(!machine.evaluate_at(6, now).should_alert);
        assert!(machine.evaluate_at(6, now).should_alert);
    }

    #[test]
    fn cooldown_suppresses_until_deadline_then_rearms() {
        let mut machine = armed_machine(2, 5);
        let start = Instant::now();

        machine.evaluate_at(3, start);
        assert!(machine.evaluate_at(3, start).should_alert);

        for offset in [1, 5, 9] {
            let eval = machine.evaluate_at(0, start + Duration::from_secs(offset));
            assert_eq!(eval.state, SessionState::Cooldown);
            assert!(!eval.should_alert);
            assert_eq!(eval.discrepancy_streak, 0);
        }

        let after = start + COOLDOWN + Duration::from_millis(1);
        let eval = machine.evaluate_at(3, after);
        assert_eq!(eval.state, SessionState::Armed);
        assert_eq!(eval.discrepancy_streak, 1);
        assert!(!eval.should_alert);
        assert_eq!(eval.cooldown_remaining_secs, 0.0);

        assert!(machine.evaluate_at(3, after).should_alert);
    }

    #[test]
    fn cooldown_expiry_with_matching_frame_resumes_from_zero() {
        let mut machine = armed_machine(2, 5);
        let start = Instant::now();
        machine.evaluate_at(4, start);
        machine.evaluate_at(4, start);

        let eval = machine.evaluate_at(5, start + COOLDOWN);
        assert_eq!(eval.state, SessionState::Armed);
        assert_eq!(eval.discrepancy_streak, 0);
    }

    #[test]
    fn arm_during_cooldown_is_ignored() {
        let mut machine = armed_machine(1, 5);
        let start = Instant::now();
        assert!(machine.evaluate_at(2, start).should_alert);

        machine.arm();
        assert_eq!(machine.state(), SessionState::Cooldown);
        let eval = machine.evaluate_at(2, start + Duration::from_secs(1));
        assert!(!eval.should_alert);
        assert_eq!(eval.state, SessionState::Cooldown);
    }

    #[test]
    fn arm_without_baseline_is_noop() {
        let mut machine = DiscrepancyMachine::new(1, COOLDOWN);
        machine.arm();
        assert_eq!(machine.state(), SessionState::Idle);

        machine.on_stream_started();
        machine.arm();
        assert_eq!(machine.state(), SessionState::Streaming);
        assert_eq!(machine.baseline_count(), None);
    }

    #[test]
    fn no_baseline_means_zero_diff_and_no_alert() {
        let mut machine = DiscrepancyMachine::new(1, COOLDOWN);
        machine.on_stream_started();
        for count in [0, 3, 9, 1] {
            let eval = machine.evaluate(count);
            assert_eq!(eval.diff, 0);
            assert!(!eval.should_alert);
            assert_eq!(eval.baseline_count, None);
        }
        assert_eq!(machine.last_observed_count(), Some(1));
    }

    #[test]
    fn baselined_observes_without_guarding() {
        let mut machine = DiscrepancyMachine::new(1, COOLDOWN);
        machine.evaluate(5);
        machine.set_baseline(5);
        let eval = machine.evaluate(2);
        assert_eq!(eval.state, SessionState::Baselined);
        assert_eq!(eval.diff, -3);
        assert_eq!(eval.discrepancy_streak, 0);
        assert!(!eval.should_alert);
    }

    #[test]
    fn disarm_returns_to_baselined() {
        let mut machine = armed_machine(5, 5);
        machine.evaluate(4);
        assert_eq!(machine.discrepancy_streak(), 1);

        machine.disarm();
        assert_eq!(machine.state(), SessionState::Baselined);
        assert_eq!(machine.discrepancy_streak(), 0);
    }

    #[test]
    fn set_baseline_clears_cooldown() {
        let mut machine = armed_machine(1, 5);
        let now = Instant::now();
        assert!(machine.evaluate_at(3, now).should_alert);

        machine.set_baseline(3);
        assert_eq!(machine.state(), SessionState::Baselined);
        assert_eq!(machine.cooldown_remaining(now), Duration::ZERO);
        machine.arm();
        assert_eq!(machine.state(), SessionState::Armed);
    }

    #[test]
    fn reset_is_idempotent_from_any_state() {
        let mut machine = armed_machine(1, 5);
        machine.evaluate(2);
        assert_eq!(machine.state(), SessionState::Cooldown);

        machine.reset();
        let once = (
            machine.state(),
            machine.baseline_count(),
            machine.last_observed_count(),
            machine.discrepancy_streak(),
            machine.cooldown_remaining(Instant::now()),
        );
        machine.reset();
        let twice = (
            machine.state(),
            machine.baseline_count(),
            machine.last_observed_count(),
            machine.discrepancy_streak(),
            machine.cooldown_remaining(Instant::now()),
        );

        assert_eq!(once, twice);
        assert_eq!(once.0, SessionState::Idle);
        assert_eq!(once.1, None);
        assert_eq!(once.2, None);
        assert_eq!(once.3, 0);
        assert_eq!(once.4, Duration::ZERO);
    }

    #[test]
    fn baseline_presence_tracks_state() {
        let mut machine = DiscrepancyMachine::new(1, COOLDOWN);
        let check = |machine: &DiscrepancyMachine| {
            assert_eq!(
                machine.baseline_count().is_some(),
                machine.state().has_baseline(),
                "state {}",
                machine.state()
            );
        };
        check(&machine);
        machine.on_stream_started();
        check(&machine);
        machine.evaluate(3);
        machine.set_baseline(3);
        check(&machine);
        machine.arm();
        check(&machine);
        machine.evaluate(1);
        check(&machine);
        machine.reset();
        check(&machine);
    }

    #[test]
    fn debounce_threshold_is_at_least_one() {
        let machine = DiscrepancyMachine::new(0, COOLDOWN);
        assert_eq!(machine.debounce_k(), 1);
    }

    #[test]
    fn state_serializes_upper_case() {
        assert_eq!(
            serde_json::to_string(&SessionState::Cooldown).unwrap(),
            "\"COOLDOWN\""
        );
    }
}
