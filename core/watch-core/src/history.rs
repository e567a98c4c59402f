use std::collections::VecDeque;

pub const HISTORY_CAPACITY: usize = 20;

/// Bounded window of recent observed counts, oldest evicted first.
///
/// Owned by the frame loop. Background work only ever receives a
/// [`snapshot`](RollingHistory::snapshot).
#[derive(Debug, Clone)]
pub struct RollingHistory {
    capacity: usize,
    counts: VecDeque<u32>,
}

impl RollingHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            counts: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, count: u32) {
        if self.counts.len() == self.capacity {
            self.counts.pop_front();
        }
        self.counts.push_back(count);
    }

    pub fn snapshot(&self) -> Vec<u32> {
        self.counts.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

impl Default for RollingHistory {
    fn default() -> Self {
        Self::new(HISTORY_CAPACITY)
    }
}
