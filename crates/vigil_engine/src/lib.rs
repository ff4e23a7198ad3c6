//! Job orchestration and scheduling for the Vigil control plane.
//!
//! The orchestrator owns job lifecycle custody: admission, per-capability
//! priority dispatch under tenant concurrency caps, retry, cooperative
//! cancellation, and the post-execution pipeline that turns executor output
//! into durable findings and positive indicators. The scheduler expands
//! cron-triggered searches into jobs through the same admission path.

pub mod automation;
pub mod metrics;
pub mod orchestrator;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod scorer;

pub use automation::{managed_search_name, sync_company_automation, SyncReport};
pub use metrics::{Metrics, MetricsSnapshot, METRICS};
pub use orchestrator::{EngineStatus, JobSubscription, Orchestrator, ProgressSnapshot};
pub use registry::CapabilityRegistry;
pub use scheduler::{Scheduler, DEFAULT_TICK, MISFIRE_GRACE_SECS};

use thiserror::Error;
use vigil_store::StoreError;

/// Engine error taxonomy. Every kind maps to a caller-visible disposition:
/// validation/configuration/not-found surface, conflicts surface as
/// no-op-or-false, overload carries a retry hint, transient failures are
/// retried internally and never escape the worker loop.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("overloaded: {0}")]
    Overloaded(String),

    #[error(transparent)]
    Store(StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Validation(msg) => EngineError::Validation(msg),
            StoreError::NotFound(msg) => EngineError::NotFound(msg),
            other => EngineError::Store(other),
        }
    }
}
