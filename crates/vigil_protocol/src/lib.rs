//! Canonical types and contracts shared across the Vigil control plane.
//!
//! This crate owns the data model (jobs, findings, indicators, scheduled
//! searches, network records), the executor contract, the engine event
//! vocabulary, cron handling, and environment configuration. It contains no
//! persistence or scheduling logic of its own.

pub mod config;
pub mod events;
pub mod executor;
pub mod schedule;
pub mod types;

pub use config::EngineConfig;
pub use events::{EngineEvent, EventBus};
pub use executor::{
    executor_fn, CancelSignal, ExecError, ExecErrorKind, ExecFuture, ExecOutcome, ExecRequest,
    ExecutorFn, ProgressSink, RawFinding,
};
pub use schedule::{CronSpec, ScheduleError};
pub use types::{
    ActivityEntry, AutomationConfig, AutomationSchedule, Capability, CapabilityAutomation,
    CompanyProfile, Confidence, EndpointBlock, ExecutionLogEntry, Finding, FindingStatus,
    IndicatorType, IpBlock, Job, JobPriority, JobStatus, NetworkLogEntry, PatternBlock,
    PatternType, PositiveIndicator, RateDecision, ScheduledSearch, Severity, TunnelVerdict,
};
