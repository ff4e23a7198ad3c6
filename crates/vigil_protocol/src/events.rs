//! Engine event stream.
//!
//! Event names mirror the WebSocket event vocabulary exposed to clients; the
//! transport itself lives outside the core, which only publishes onto a
//! process-wide broadcast bus.

use crate::types::{Capability, NetworkLogEntry, TunnelVerdict};
use serde::Serialize;
use tokio::sync::broadcast;

/// Default bus capacity. Slow subscribers that fall further behind than this
/// observe `Lagged` and miss events; the engine never blocks on them.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Everything the engine broadcasts. The serialized `event` tag carries the
/// dotted wire name clients subscribe to.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum EngineEvent {
    #[serde(rename = "job.queued")]
    JobQueued {
        job_id: String,
        tenant_id: String,
        capability: Capability,
    },
    #[serde(rename = "job.started")]
    JobStarted {
        job_id: String,
        tenant_id: String,
        capability: Capability,
    },
    #[serde(rename = "job.progress")]
    JobProgress {
        job_id: String,
        progress: u8,
        message: String,
    },
    #[serde(rename = "job.findings")]
    JobFindings {
        job_id: String,
        count: usize,
    },
    #[serde(rename = "job.succeeded")]
    JobSucceeded {
        job_id: String,
    },
    #[serde(rename = "job.failed")]
    JobFailed {
        job_id: String,
        error: String,
    },
    #[serde(rename = "job.cancelled")]
    JobCancelled {
        job_id: String,
    },
    #[serde(rename = "network.log")]
    NetworkLog {
        entry: Box<NetworkLogEntry>,
    },
    #[serde(rename = "network.tunnel_alert")]
    TunnelAlert {
        verdict: TunnelVerdict,
    },
}

impl EngineEvent {
    /// The wire name of this event.
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::JobQueued { .. } => "job.queued",
            EngineEvent::JobStarted { .. } => "job.started",
            EngineEvent::JobProgress { .. } => "job.progress",
            EngineEvent::JobFindings { .. } => "job.findings",
            EngineEvent::JobSucceeded { .. } => "job.succeeded",
            EngineEvent::JobFailed { .. } => "job.failed",
            EngineEvent::JobCancelled { .. } => "job.cancelled",
            EngineEvent::NetworkLog { .. } => "network.log",
            EngineEvent::TunnelAlert { .. } => "network.tunnel_alert",
        }
    }

    /// The job this event concerns, if any.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            EngineEvent::JobQueued { job_id, .. }
            | EngineEvent::JobStarted { job_id, .. }
            | EngineEvent::JobProgress { job_id, .. }
            | EngineEvent::JobFindings { job_id, .. }
            | EngineEvent::JobSucceeded { job_id }
            | EngineEvent::JobFailed { job_id, .. }
            | EngineEvent::JobCancelled { job_id } => Some(job_id),
            _ => None,
        }
    }

    /// Whether this event ends a job's event stream.
    pub fn is_job_terminal(&self) -> bool {
        matches!(
            self,
            EngineEvent::JobSucceeded { .. }
                | EngineEvent::JobFailed { .. }
                | EngineEvent::JobCancelled { .. }
        )
    }
}

/// Process-wide broadcast bus for [`EngineEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. A bus with no subscribers drops events silently.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_match_wire_vocabulary() {
        let event = EngineEvent::JobProgress {
            job_id: "j1".into(),
            progress: 40,
            message: "crawling".into(),
        };
        assert_eq!(event.name(), "job.progress");
        assert_eq!(event.job_id(), Some("j1"));
        assert!(!event.is_job_terminal());
        assert!(EngineEvent::JobCancelled { job_id: "j1".into() }.is_job_terminal());
    }

    #[test]
    fn serialized_tag_is_the_wire_name() {
        let event = EngineEvent::JobSucceeded { job_id: "j".into() };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "job.succeeded");
        assert_eq!(value["job_id"], "j");
    }

    #[tokio::test]
    async fn bus_delivers_to_subscribers() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(EngineEvent::JobSucceeded { job_id: "j".into() });
        let got = rx.recv().await.unwrap();
        assert_eq!(got.name(), "job.succeeded");
    }
}
