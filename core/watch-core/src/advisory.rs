//! Secondary (advisory) decision agent.
//!
//! Wraps a slow reasoning engine that classifies a discrepancy into
//! trigger / ignore / rebaseline. It is best-effort and never on the critical
//! path:
//!
//! - the engine is loaded once; a failed load disables the agent for the life
//!   of the process (no retry);
//! - each request runs on its own worker thread and calls back only on
//!   success; inference errors are logged and dropped;
//! - the engine sits behind one mutex, so concurrent requests queue.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::decision::{parse_decision, ParsedDecision};
use crate::error::Result;
use crate::machine::SessionState;

const PROMPT_HISTORY_LEN: usize = 8;

const SYSTEM_PROMPT: &str = "You are an on-device inventory agent monitoring a staging area.\n\
Decision rules:\n\
- If streak >= 6 AND confidence >= 0.40: trigger_alert\n\
- If streak >= 20: rebaseline (scene has been reorganized)\n\
- If streak < 6: ignore_event (too early to be sure)\n\
- If confidence < 0.40: ignore_event (detection unreliable)\n\
Call exactly one function. Reply with ONLY the function call.";

const LOAD_UNLOADED: u8 = 0;
const LOAD_IN_PROGRESS: u8 = 1;
const LOAD_READY: u8 = 2;
const LOAD_FAILED: u8 = 3;

/// Model runtime behind the advisory agent. Not safe for concurrent use;
/// the agent serializes all calls.
pub trait ReasoningEngine: Send {
    /// One-time, potentially slow setup.
    fn load(&mut self) -> Result<()>;

    fn complete(&mut self, prompt: &str) -> Result<String>;
}

/// Facts handed to one advisory request. `history` is an owned copy.
#[derive(Debug, Clone, PartialEq)]
pub struct AdvisoryRequest {
    pub state: SessionState,
    pub item_count: u32,
    pub baseline_count: u32,
    pub discrepancy_streak: u32,
    pub average_conf: f32,
    pub history: Vec<u32>,
    /// Session epoch at dispatch, used to recognize stale results.
    pub epoch: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdvisoryDecision {
    pub decision: ParsedDecision,
    pub basis: AdvisoryRequest,
}

#[derive(Clone)]
pub struct AdvisoryAgent {
    engine: Arc<Mutex<Box<dyn ReasoningEngine>>>,
    load_state: Arc<AtomicU8>,
}

impl AdvisoryAgent {
    pub fn new(engine: Box<dyn ReasoningEngine>) -> Self {
        Self {
            engine: Arc::new(Mutex::new(engine)),
            load_state: Arc::new(AtomicU8::new(LOAD_UNLOADED)),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.load_state.load(Ordering::SeqCst) == LOAD_READY
    }

    pub fn has_failed(&self) -> bool {
        self.load_state.load(Ordering::SeqCst) == LOAD_FAILED
    }

    /// Loads the engine on the calling thread. Only the first call does any
    /// work; later calls report the outcome.
    pub fn load(&self) -> bool {
        if self
            .load_state
            .compare_exchange(
                LOAD_UNLOADED,
                LOAD_IN_PROGRESS,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return self.is_ready();
        }

        let outcome = match self.engine.lock() {
            Ok(mut engine) => engine.load(),
            Err(_) => {
                tracing::warn!("Reasoning engine lock poisoned during load");
                self.load_state.store(LOAD_FAILED, Ordering::SeqCst);
                return false;
            }
        };

        match outcome {
            Ok(()) => {
                self.load_state.store(LOAD_READY, Ordering::SeqCst);
                tracing::info!("Advisory agent ready");
                true
            }
            Err(err) => {
                self.load_state.store(LOAD_FAILED, Ordering::SeqCst);
                tracing::warn!(error = %err, "Advisory agent load failed; advisory path disabled");
                false
            }
        }
    }

    pub fn load_async(&self) -> Option<thread::JoinHandle<bool>> {
        let agent = self.clone();
        match thread::Builder::new()
            .name("advisory-load".to_string())
            .spawn(move || agent.load())
        {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::warn!(error = %err, "Failed to spawn advisory load thread");
                None
            }
        }
    }

    /// Runs one inference on the calling thread, waiting for the engine lock.
    pub fn decide(&self, request: &AdvisoryRequest) -> Option<ParsedDecision> {
        if !self.is_ready() {
            return None;
        }
        let prompt = build_prompt(request);
        let output = match self.engine.lock() {
            Ok(mut engine) => engine.complete(&prompt),
            Err(_) => {
                tracing::warn!("Reasoning engine lock poisoned; dropping advisory request");
                return None;
            }
        };
        match output {
            Ok(text) => Some(parse_decision(&text, request.item_count)),
            Err(err) => {
                tracing::warn!(error = %err, "Advisory inference failed");
                None
            }
        }
    }

    /// Dispatches a request to a worker thread and returns immediately.
    /// `callback` runs on the worker, only when inference succeeded.
    /// Returns false when nothing was dispatched.
    pub fn decide_async<F>(&self, request: AdvisoryRequest, callback: F) -> bool
    where
        F: FnOnce(AdvisoryDecision) + Send + 'static,
    {
        if !self.is_ready() {
            return false;
        }
        let agent = self.clone();
        let spawned = thread::Builder::new()
            .name("advisory-decision".to_string())
            .spawn(move || {
                if let Some(decision) = agent.decide(&request) {
                    callback(AdvisoryDecision {
                        decision,
                        basis: request,
                    });
                }
            });
        match spawned {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(error = %err, "Failed to spawn advisory worker");
                false
            }
        }
    }
}

pub fn build_prompt(request: &AdvisoryRequest) -> String {
    let diff = i64::from(request.item_count) - i64::from(request.baseline_count);
    let tail_start = request.history.len().saturating_sub(PROMPT_HISTORY_LEN);
    let scene = format!(
        "Items visible: {}\nBaseline: {}\nDiff: {:+}\nStreak: {} consecutive discrepant frames\nConfidence: {:.2}\nHistory: {:?}",
        request.item_count,
        request.baseline_count,
        diff,
        request.discrepancy_streak,
        request.average_conf,
        &request.history[tail_start..],
    );
    format!(
        "<start_of_turn>system\n{}<end_of_turn>\n<start_of_turn>user\n{}<end_of_turn>\n<start_of_turn>model\n",
        SYSTEM_PROMPT, scene
    )
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use crate::error::WatchError;
    use std::sync::mpsc;

    /// Engine that replies with a fixed script and records every prompt.
    pub struct ScriptedEngine {
        pub load_ok: bool,
        pub reply: std::result::Result<String, String>,
        pub prompts: Arc<Mutex<Vec<String>>>,
        pub loads: Arc<AtomicU8>,
    }

    impl ScriptedEngine {
        pub fn replying(reply: &str) -> Self {
            Self {
                load_ok: true,
                reply: Ok(reply.to_string()),
                prompts: Arc::new(Mutex::new(Vec::new())),
                loads: Arc::new(AtomicU8::new(0)),
            }
        }
    }

    impl ReasoningEngine for ScriptedEngine {
        fn load(&mut self) -> Result<()> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.load_ok {
                Ok(())
            } else {
                Err(WatchError::LlmResponse("model missing".to_string()))
            }
        }

        fn complete(&mut self, prompt: &str) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.reply.clone().map_err(WatchError::LlmResponse)
        }
    }

    /// Engine that blocks each completion until the test releases it.
    pub struct GatedEngine {
        pub gate: mpsc::Receiver<()>,
        pub reply: String,
    }

    impl ReasoningEngine for GatedEngine {
        fn load(&mut self) -> Result<()> {
            Ok(())
        }

        fn complete(&mut self, _prompt: &str) -> Result<String> {
            self.gate
                .recv()
                .map_err(|_| WatchError::LlmResponse("gate closed".to_string()))?;
            Ok(self.reply.clone())
        }
    }
}
