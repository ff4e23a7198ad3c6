//! Per-capability dispatch queue.
//!
//! Ordering within a capability is `(priority desc, created_at asc, seq asc)`.
//! The ordered map gives clean O(log n) insert/remove; `pop_admissible` skips
//! entries whose tenant is at its in-flight cap without disturbing their
//! position, so FIFO holds within every (capability, tenant) pair.

use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Mutex;
use vigil_protocol::JobPriority;

/// A queued dispatch entry.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub job_id: String,
    pub tenant_id: String,
    pub priority: JobPriority,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: Reverse<JobPriority>,
    created_at: DateTime<Utc>,
    seq: u64,
}

#[derive(Default)]
struct QueueState {
    entries: BTreeMap<QueueKey, QueuedJob>,
    next_seq: u64,
}

/// One capability's priority queue.
#[derive(Default)]
pub struct CapabilityQueue {
    state: Mutex<QueueState>,
}

impl CapabilityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, job: QueuedJob) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let key = QueueKey {
            priority: Reverse(job.priority),
            created_at: job.created_at,
            seq: state.next_seq,
        };
        state.next_seq += 1;
        state.entries.insert(key, job);
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove a queued job by id (cancellation path).
    pub fn remove(&self, job_id: &str) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let key = state
            .entries
            .iter()
            .find(|(_, job)| job.job_id == job_id)
            .map(|(key, _)| *key);
        match key {
            Some(key) => state.entries.remove(&key).is_some(),
            None => false,
        }
    }

    /// Pop the best entry whose tenant `admit` accepts.
    ///
    /// `admit` is called under the queue lock, in queue order, once per
    /// distinct candidate until it accepts; rejected candidates keep their
    /// position.
    pub fn pop_admissible<F>(&self, mut admit: F) -> Option<QueuedJob>
    where
        F: FnMut(&str) -> bool,
    {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let key = state
            .entries
            .iter()
            .find(|(_, job)| admit(&job.tenant_id))
            .map(|(key, _)| *key);
        key.and_then(|key| state.entries.remove(&key))
    }
}
