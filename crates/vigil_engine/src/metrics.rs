//! In-memory engine metrics.
//!
//! Lock-free atomics, single global instance, snapshot + Prometheus
//! exposition for scraping.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics instance.
pub static METRICS: Metrics = Metrics::new();

/// Engine counters. All fields are atomic for thread-safe access.
pub struct Metrics {
    pub jobs_created: AtomicU64,
    pub jobs_succeeded: AtomicU64,
    pub jobs_failed: AtomicU64,
    pub jobs_cancelled: AtomicU64,
    pub jobs_retried: AtomicU64,
    pub jobs_rejected: AtomicU64,

    pub findings_recorded: AtomicU64,
    pub indicators_recorded: AtomicU64,

    pub scheduler_fires: AtomicU64,
    pub scheduler_misfires: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            jobs_created: AtomicU64::new(0),
            jobs_succeeded: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_cancelled: AtomicU64::new(0),
            jobs_retried: AtomicU64::new(0),
            jobs_rejected: AtomicU64::new(0),
            findings_recorded: AtomicU64::new(0),
            indicators_recorded: AtomicU64::new(0),
            scheduler_fires: AtomicU64::new(0),
            scheduler_misfires: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(&self, counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Get a snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_created: self.jobs_created.load(Ordering::Relaxed),
            jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_cancelled: self.jobs_cancelled.load(Ordering::Relaxed),
            jobs_retried: self.jobs_retried.load(Ordering::Relaxed),
            jobs_rejected: self.jobs_rejected.load(Ordering::Relaxed),
            findings_recorded: self.findings_recorded.load(Ordering::Relaxed),
            indicators_recorded: self.indicators_recorded.load(Ordering::Relaxed),
            scheduler_fires: self.scheduler_fires.load(Ordering::Relaxed),
            scheduler_misfires: self.scheduler_misfires.load(Ordering::Relaxed),
        }
    }

    /// Format as Prometheus exposition format.
    pub fn prometheus_format(&self) -> String {
        let s = self.snapshot();
        format!(
            r#"# HELP vigil_jobs_created_total Total jobs accepted by the orchestrator
# TYPE vigil_jobs_created_total counter
vigil_jobs_created_total {}

# HELP vigil_jobs_succeeded_total Total jobs that reached succeeded
# TYPE vigil_jobs_succeeded_total counter
vigil_jobs_succeeded_total {}

# HELP vigil_jobs_failed_total Total jobs that reached failed
# TYPE vigil_jobs_failed_total counter
vigil_jobs_failed_total {}

# HELP vigil_jobs_cancelled_total Total jobs that reached cancelled
# TYPE vigil_jobs_cancelled_total counter
vigil_jobs_cancelled_total {}

# HELP vigil_jobs_retried_total Total transient-failure retries
# TYPE vigil_jobs_retried_total counter
vigil_jobs_retried_total {}

# HELP vigil_jobs_rejected_total Total jobs rejected at admission
# TYPE vigil_jobs_rejected_total counter
vigil_jobs_rejected_total {}

# HELP vigil_findings_recorded_total Total findings upserted by post-processing
# TYPE vigil_findings_recorded_total counter
vigil_findings_recorded_total {}

# HELP vigil_indicators_recorded_total Total positive indicators recorded
# TYPE vigil_indicators_recorded_total counter
vigil_indicators_recorded_total {}

# HELP vigil_scheduler_fires_total Total scheduled-search materialisations
# TYPE vigil_scheduler_fires_total counter
vigil_scheduler_fires_total {}

# HELP vigil_scheduler_misfires_total Total scheduled fires skipped or coalesced away
# TYPE vigil_scheduler_misfires_total counter
vigil_scheduler_misfires_total {}
"#,
            s.jobs_created,
            s.jobs_succeeded,
            s.jobs_failed,
            s.jobs_cancelled,
            s.jobs_retried,
            s.jobs_rejected,
            s.findings_recorded,
            s.indicators_recorded,
            s.scheduler_fires,
            s.scheduler_misfires,
        )
    }
}

/// Immutable snapshot of counters for reading.
#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    pub jobs_created: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub jobs_retried: u64,
    pub jobs_rejected: u64,
    pub findings_recorded: u64,
    pub indicators_recorded: u64,
    pub scheduler_fires: u64,
    pub scheduler_misfires: u64,
}

impl MetricsSnapshot {
    /// Human-readable one-liner for periodic logging.
    pub fn summary(&self) -> String {
        format!(
            "Jobs: {} created, {} succeeded, {} failed, {} cancelled, {} retried | \
             Findings: {} | Indicators: {} | Scheduler: {} fires, {} misfires",
            self.jobs_created,
            self.jobs_succeeded,
            self.jobs_failed,
            self.jobs_cancelled,
            self.jobs_retried,
            self.findings_recorded,
            self.indicators_recorded,
            self.scheduler_fires,
            self.scheduler_misfires,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increments_show_in_snapshot() {
        let metrics = Metrics::new();
        metrics.inc(&metrics.jobs_created);
        metrics.inc(&metrics.jobs_created);
        metrics.inc(&metrics.jobs_succeeded);
        metrics.add(&metrics.findings_recorded, 3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.jobs_created, 2);
        assert_eq!(snapshot.jobs_succeeded, 1);
        assert_eq!(snapshot.findings_recorded, 3);
    }

    #[test]
    fn prometheus_format_contains_counters() {
        let metrics = Metrics::new();
        metrics.inc(&metrics.scheduler_fires);
        let output = metrics.prometheus_format();
        assert!(output.contains("vigil_scheduler_fires_total 1"));
        assert!(output.contains("# TYPE vigil_jobs_created_total counter"));
    }
}
