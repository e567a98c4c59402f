use serde_json::Value;

use crate::machine::SessionState;

/// One sampled raw reading, kept for offline review.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationSample {
    pub state: SessionState,
    pub item_count: u32,
    pub baseline_count: Option<u32>,
    pub diff: i64,
    pub avg_conf: f32,
    pub streak: u32,
}

/// Append-only persistence for events and sampled observations.
///
/// Fire-and-forget from the frame loop's point of view: implementations log
/// their own failures and never report them back.
pub trait EventSink: Send {
    fn log_event(&self, event_type: &str, payload: Value);

    fn log_observation(&self, sample: &ObservationSample);
}
