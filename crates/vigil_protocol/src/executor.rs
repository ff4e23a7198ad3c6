//! The executor contract: the boundary between the orchestrator and the
//! individual security collectors.
//!
//! Executors are registered as plain function values; the engine captures the
//! registered value at dispatch time, so replacing an executor never affects
//! jobs already in flight.

use crate::types::{PositiveIndicator, Severity};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag shared between the engine and an executor.
///
/// Executors are expected to check this at I/O boundaries and abandon work
/// when it trips.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    flag: Arc<AtomicBool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the signal. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Bail out with [`ExecError::cancelled`] if the signal has tripped.
    pub fn throw_if_cancelled(&self) -> Result<(), ExecError> {
        if self.is_cancelled() {
            Err(ExecError::cancelled())
        } else {
            Ok(())
        }
    }
}

/// Progress reporting handle handed to executors.
///
/// Reports are clamped to `[0, 100]` and coerced monotonic before they reach
/// the sink, so executors may report freely.
#[derive(Clone)]
pub struct ProgressSink {
    last: Arc<AtomicU8>,
    sink: Arc<dyn Fn(u8, &str) + Send + Sync>,
}

impl ProgressSink {
    pub fn new(sink: Arc<dyn Fn(u8, &str) + Send + Sync>) -> Self {
        Self::starting_at(0, sink)
    }

    /// A sink whose monotonic floor starts at `floor` instead of zero.
    /// Used on retry, where progress resumes from the last reported value.
    pub fn starting_at(floor: u8, sink: Arc<dyn Fn(u8, &str) + Send + Sync>) -> Self {
        Self {
            last: Arc::new(AtomicU8::new(floor.min(100))),
            sink,
        }
    }

    /// A sink that discards reports. Useful in tests.
    pub fn noop() -> Self {
        Self::new(Arc::new(|_, _| {}))
    }

    /// Report progress. Values above 100 are clamped; values below the last
    /// report are coerced upward to keep the stream monotonic.
    pub fn report(&self, percent: u8, message: &str) {
        let clamped = percent.min(100);
        let previous = self.last.fetch_max(clamped, Ordering::SeqCst);
        let effective = clamped.max(previous);
        (self.sink)(effective, message);
    }

    /// The highest percentage reported so far.
    pub fn last_reported(&self) -> u8 {
        self.last.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressSink")
            .field("last", &self.last_reported())
            .finish()
    }
}

/// Everything an executor needs to run one job.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub tenant_id: String,
    pub target: String,
    pub config: Value,
    pub progress: ProgressSink,
    pub cancel: CancelSignal,
}

/// A raw finding emitted by an executor, before the engine stamps identity
/// and tenancy onto it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawFinding {
    pub severity: Severity,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub evidence: Value,
    #[serde(default)]
    pub affected_assets: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    pub risk_score: f64,
}

/// Successful executor output.
#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    pub findings: Vec<RawFinding>,
    /// Indicators the executor wants recorded verbatim, beyond what the
    /// positive scorer derives.
    pub positive_indicators: Vec<PositiveIndicator>,
    pub metadata: Value,
    /// Structured scan results consumed by the positive scorer
    /// (e.g. SPF/DKIM/DMARC statuses for email audits).
    pub scan_results: Option<Value>,
}

impl ExecOutcome {
    pub fn empty() -> Self {
        Self {
            metadata: Value::Object(serde_json::Map::new()),
            ..Default::default()
        }
    }
}

/// Executor failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecErrorKind {
    /// Network timeout, upstream 5xx, resolver failure. Retried with backoff.
    Transient,
    /// Validation or configuration failure. Never retried.
    Fatal,
    /// The executor observed the cancel signal and stopped.
    Cancelled,
}

/// Executor failure.
#[derive(Debug, Clone)]
pub struct ExecError {
    pub kind: ExecErrorKind,
    pub message: String,
}

impl ExecError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ExecErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: ExecErrorKind::Fatal,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: ExecErrorKind::Cancelled,
            message: "execution cancelled".to_string(),
        }
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ExecErrorKind::Transient => write!(f, "transient failure: {}", self.message),
            ExecErrorKind::Fatal => write!(f, "fatal failure: {}", self.message),
            ExecErrorKind::Cancelled => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ExecError {}

/// The future type executors return.
pub type ExecFuture = Pin<Box<dyn Future<Output = Result<ExecOutcome, ExecError>> + Send>>;

/// A registered executor: a function value invoked once per dispatch.
pub type ExecutorFn = Arc<dyn Fn(ExecRequest) -> ExecFuture + Send + Sync>;

/// Convenience for building an [`ExecutorFn`] from an async closure.
pub fn executor_fn<F, Fut>(f: F) -> ExecutorFn
where
    F: Fn(ExecRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ExecOutcome, ExecError>> + Send + 'static,
{
    Arc::new(move |req| Box::pin(f(req)))
}
