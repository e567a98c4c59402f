//! Fan-out of advisory decisions to streaming connections.
//!
//! Decisions finish on worker threads and are drained from the orchestrator
//! by whichever connection reaches a safe point first. The drainer publishes
//! them here, and every connection that has sent at least one frame picks
//! them up from its own queue. Connections that only send commands or
//! queries never subscribe and never see `agent_decision` lines.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use stagewatch_daemon_protocol::Outbound;

#[derive(Default)]
pub struct AdvisoryHub {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, Sender<Outbound>>>,
}

/// A connection's queue of published decisions. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    queue: Receiver<Outbound>,
    hub: Arc<AdvisoryHub>,
}

impl AdvisoryHub {
    pub fn subscribe(hub: &Arc<AdvisoryHub>) -> Subscription {
        let id = hub.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, queue) = mpsc::channel();
        match hub.subscribers.lock() {
            Ok(mut subscribers) => {
                subscribers.insert(id, tx);
            }
            Err(_) => tracing::warn!("Advisory hub lock poisoned; subscriber not registered"),
        }
        tracing::debug!(subscriber = id, "Streaming connection subscribed");
        Subscription {
            id,
            queue,
            hub: Arc::clone(hub),
        }
    }

    /// Sends every message to every subscriber. Returns how many subscribers
    /// received them.
    pub fn publish(&self, messages: &[Outbound]) -> usize {
        if messages.is_empty() {
            return 0;
        }
        let Ok(mut subscribers) = self.subscribers.lock() else {
            tracing::warn!("Advisory hub lock poisoned; dropping decisions");
            return 0;
        };
        subscribers.retain(|_, tx| messages.iter().all(|message| tx.send(message.clone()).is_ok()));
        if subscribers.is_empty() {
            tracing::debug!(
                decisions = messages.len(),
                "No streaming connection for advisory decisions"
            );
        }
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }

    fn unsubscribe(&self, id: u64) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.remove(&id);
        }
    }
}

impl Subscription {
    /// Decisions published since the last call.
    pub fn drain(&self) -> Vec<Outbound> {
        self.queue.try_iter().collect()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
        tracing::debug!(subscriber = self.id, "Streaming connection unsubscribed");
    }
}

/// Moves `agent_decision` messages out of a reply batch and publishes them;
/// returns the rest for the requesting connection.
pub fn route(hub: &AdvisoryHub, outbound: Vec<Outbound>) -> Vec<Outbound> {
    let (decisions, replies): (Vec<_>, Vec<_>) = outbound
        .into_iter()
        .partition(|message| matches!(message, Outbound::AgentDecision(_)));
    hub.publish(&decisions);
    replies
}
