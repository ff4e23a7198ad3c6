//! The orchestrator: admission, dispatch, retry, cancellation, and
//! post-processing for jobs.
//!
//! Each capability gets an independent worker pool consuming its own
//! priority queue. A per-tenant in-flight cap gates admission at pop time:
//! a capped tenant's jobs are skipped, not blocked, and re-considered once
//! the tenant frees a slot. Retries for transient executor failures are held
//! by the executing worker (status stays `running`, no repeat lifecycle
//! events), keeping transitions monotonic.

use crate::metrics::METRICS;
use crate::queue::{CapabilityQueue, QueuedJob};
use crate::registry::CapabilityRegistry;
use crate::{scorer, EngineError};
use chrono::Utc;
use rand::Rng;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use vigil_protocol::config::CANCEL_GRACE_SECS;
use vigil_protocol::{
    Capability, CancelSignal, EngineConfig, EngineEvent, EventBus, ExecErrorKind, ExecOutcome,
    ExecRequest, ExecutionLogEntry, ExecutorFn, Finding, FindingStatus, Job, JobPriority,
    JobStatus, ProgressSink,
};
use vigil_store::{JobPatch, NewFinding, Scope, Store};

/// Dispatch backoff when a queue is empty or fully gated (ms).
const DISPATCH_BACKOFF_BASE_MS: u64 = 50;
/// Dispatch backoff cap (ms).
const DISPATCH_BACKOFF_MAX_MS: u64 = 1_000;
/// Dispatch backoff jitter cap (ms).
const DISPATCH_BACKOFF_JITTER_MS: u64 = 50;
/// Retry backoff jitter, as a fraction of the computed delay.
const RETRY_JITTER_FRACTION: f64 = 0.25;
/// How long shutdown waits for a worker before aborting it.
const SHUTDOWN_GRACE_SECS: u64 = 5;

/// Snapshot returned by [`Orchestrator::get_progress`].
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub status: JobStatus,
    pub progress: u8,
    pub last_log: Option<ExecutionLogEntry>,
}

/// Point-in-time view of the engine, for status surfaces and diagnostics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStatus {
    /// Queue depth per capability.
    pub queues: HashMap<Capability, usize>,
    /// Jobs currently running, per tenant.
    pub running: HashMap<String, usize>,
    /// Capabilities with a registered executor.
    pub registered_capabilities: Vec<Capability>,
    pub jobs_created: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
}

/// A filtered view of the event bus covering one job.
pub struct JobSubscription {
    job_id: String,
    rx: broadcast::Receiver<EngineEvent>,
    done: bool,
}

impl JobSubscription {
    /// Next event for this job; `None` once a terminal event has been
    /// delivered or the bus closed.
    pub async fn next(&mut self) -> Option<EngineEvent> {
        if self.done {
            return None;
        }
        loop {
            match self.rx.recv().await {
                Ok(event) if event.job_id() == Some(self.job_id.as_str()) => {
                    if event.is_job_terminal() {
                        self.done = true;
                    }
                    return Some(event);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("subscriber lagged, skipped {} events", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

struct RunningHandle {
    cancel: CancelSignal,
    cancel_tx: watch::Sender<bool>,
}

struct Inner {
    store: Store,
    registry: CapabilityRegistry,
    queues: HashMap<Capability, CapabilityQueue>,
    tenant_load: Mutex<HashMap<String, usize>>,
    running: Mutex<HashMap<String, RunningHandle>>,
    events: EventBus,
    config: EngineConfig,
    shutdown: CancelSignal,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Process-wide job orchestrator. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(store: Store, config: EngineConfig, events: EventBus) -> Self {
        let queues = Capability::ALL
            .into_iter()
            .map(|capability| (capability, CapabilityQueue::new()))
            .collect();
        Self {
            inner: Arc::new(Inner {
                store,
                registry: CapabilityRegistry::new(),
                queues,
                tenant_load: Mutex::new(HashMap::new()),
                running: Mutex::new(HashMap::new()),
                events,
                config,
                shutdown: CancelSignal::new(),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.inner.registry
    }

    /// Delegates to the registry; the usual entry point for wiring executors.
    pub fn register_executor(&self, capability: Capability, executor: ExecutorFn) {
        self.inner.registry.register(capability, executor);
    }

    /// Queue depth for a capability.
    pub fn queue_depth(&self, capability: Capability) -> usize {
        self.inner.queue(capability).len()
    }

    /// Jobs currently running for a tenant.
    pub fn running_for(&self, tenant_id: &str) -> usize {
        let load = self.inner.tenant_load.lock().unwrap_or_else(|e| e.into_inner());
        load.get(tenant_id).copied().unwrap_or(0)
    }

    /// Point-in-time engine status.
    pub fn status(&self) -> EngineStatus {
        let queues = Capability::ALL
            .into_iter()
            .map(|capability| (capability, self.inner.queue(capability).len()))
            .collect();
        let running = {
            let load = self.inner.tenant_load.lock().unwrap_or_else(|e| e.into_inner());
            load.clone()
        };
        let snapshot = METRICS.snapshot();
        EngineStatus {
            queues,
            running,
            registered_capabilities: self.inner.registry.registered(),
            jobs_created: snapshot.jobs_created,
            jobs_succeeded: snapshot.jobs_succeeded,
            jobs_failed: snapshot.jobs_failed,
            jobs_cancelled: snapshot.jobs_cancelled,
        }
    }

    /// Recover persisted queue state and launch the worker pools.
    pub async fn start(&self) -> Result<(), EngineError> {
        self.recover().await?;
        let mut workers = self.inner.workers.lock().unwrap_or_else(|e| e.into_inner());
        for capability in Capability::ALL {
            for index in 0..self.inner.config.workers_for(capability) {
                let inner = self.inner.clone();
                workers.push(tokio::spawn(worker_loop(inner, capability, index)));
            }
        }
        Ok(())
    }

    /// Signal workers to stop and wait briefly for in-flight jobs.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.inner.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.drain(..).collect()
        };
        for handle in handles {
            let abort = handle.abort_handle();
            if tokio::time::timeout(Duration::from_secs(SHUTDOWN_GRACE_SECS), handle)
                .await
                .is_err()
            {
                abort.abort();
            }
        }
        tracing::info!("Orchestrator stopped");
    }

    /// Admit a new job: validate, persist `pending`, move to `queued`,
    /// enqueue.
    pub async fn create_job(
        &self,
        tenant_id: &str,
        capability: Capability,
        target: &str,
        config: Value,
        priority: JobPriority,
    ) -> Result<Job, EngineError> {
        if tenant_id.is_empty() {
            return Err(EngineError::Validation("tenant_id must not be empty".into()));
        }
        if target.is_empty() || target.len() > 500 {
            return Err(EngineError::Validation(
                "target must be 1..=500 characters".into(),
            ));
        }
        if !self.inner.registry.is_registered(capability) {
            METRICS.inc(&METRICS.jobs_rejected);
            return Err(EngineError::Configuration(format!(
                "no executor registered for capability {}",
                capability
            )));
        }

        let queue = self.inner.queue(capability);
        let depth = queue.len();
        if depth >= self.inner.config.queue_hard_limit {
            METRICS.inc(&METRICS.jobs_rejected);
            return Err(EngineError::Overloaded(format!(
                "{} queue at hard limit ({})",
                capability, depth
            )));
        }

        let mut job = Job::new(tenant_id, capability, target, config, priority);
        if depth >= self.inner.config.queue_soft_limit {
            if let Value::Object(map) = &mut job.metadata {
                map.insert(
                    "queue_warning".to_string(),
                    json!(format!("{} queue backlog at {}", capability, depth)),
                );
            }
            tracing::warn!("{} queue backlog at {} (soft limit)", capability, depth);
        }

        let jobs = self.inner.store.jobs();
        jobs.upsert(&job).await?;
        jobs.update_partial(
            &job.id,
            &JobPatch {
                status: Some(JobStatus::Queued),
                ..Default::default()
            },
        )
        .await?;
        job.status = JobStatus::Queued;

        queue.push(QueuedJob {
            job_id: job.id.clone(),
            tenant_id: job.tenant_id.clone(),
            priority: job.priority,
            created_at: job.created_at,
        });
        self.inner.events.emit(EngineEvent::JobQueued {
            job_id: job.id.clone(),
            tenant_id: job.tenant_id.clone(),
            capability,
        });
        METRICS.inc(&METRICS.jobs_created);
        tracing::info!(
            "Job {} created: {} {} for tenant {} (priority {:?})",
            job.id,
            capability,
            job.target,
            job.tenant_id,
            priority
        );
        self.record_activity(&job.tenant_id, "job.create", "job", &job.id, json!({
            "capability": capability.as_str(),
            "target": job.target,
        }))
        .await;
        Ok(job)
    }

    /// Append to the tenant's action trail. Best-effort: the trail never
    /// fails the operation it describes.
    async fn record_activity(
        &self,
        tenant_id: &str,
        action: &str,
        resource_type: &str,
        resource_id: &str,
        metadata: Value,
    ) {
        if let Err(err) = self
            .inner
            .store
            .activity()
            .record(
                tenant_id,
                action,
                Some(resource_type),
                Some(resource_id),
                None,
                None,
                metadata,
            )
            .await
        {
            tracing::warn!("Activity log write failed: {}", err);
        }
    }

    /// Cancel a job. Pending/queued jobs transition immediately; running
    /// jobs get their cancel signal tripped and transition at the next
    /// executor checkpoint (or are abandoned after the grace deadline).
    /// Returns false for jobs already terminal.
    pub async fn cancel_job(&self, id: &str, actor: &str) -> Result<bool, EngineError> {
        let jobs = self.inner.store.jobs();
        let job = jobs
            .get(&Scope::Admin, id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("job {}", id)))?;
        if job.status.is_terminal() {
            return Ok(false);
        }

        // Dequeue first: a job removed here can no longer be claimed.
        if self.inner.queue(job.capability).remove(id) {
            self.finalize_cancel(&job, actor).await?;
            return Ok(true);
        }

        // Running: trip the cooperative signal and stamp intent.
        if self.signal_running(id) {
            self.stamp_cancelling(&job, actor).await?;
            return Ok(true);
        }

        // Race window: between queue pop and the running-map insert, or a
        // pending job not yet enqueued. Re-read and settle.
        let job = jobs
            .get(&Scope::Admin, id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("job {}", id)))?;
        match job.status {
            JobStatus::Pending | JobStatus::Queued => {
                self.finalize_cancel(&job, actor).await?;
                Ok(true)
            }
            JobStatus::Running => {
                if self.signal_running(id) {
                    self.stamp_cancelling(&job, actor).await?;
                } else {
                    // The worker will observe the refused transition.
                    self.finalize_cancel(&job, actor).await?;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn signal_running(&self, id: &str) -> bool {
        let running = self.inner.running.lock().unwrap_or_else(|e| e.into_inner());
        match running.get(id) {
            Some(handle) => {
                handle.cancel.cancel();
                let _ = handle.cancel_tx.send(true);
                true
            }
            None => false,
        }
    }

    async fn stamp_cancelling(&self, job: &Job, actor: &str) -> Result<(), EngineError> {
        let mut metadata = as_object(job.metadata.clone());
        metadata.insert("cancelling".to_string(), json!(true));
        metadata.insert("cancelled_by".to_string(), json!(actor));
        self.inner
            .store
            .jobs()
            .update_partial(
                &job.id,
                &JobPatch {
                    metadata: Some(Value::Object(metadata)),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn finalize_cancel(&self, job: &Job, actor: &str) -> Result<(), EngineError> {
        let mut metadata = as_object(job.metadata.clone());
        metadata.insert("cancelled_by".to_string(), json!(actor));
        self.inner
            .store
            .jobs()
            .update_partial(
                &job.id,
                &JobPatch {
                    status: Some(JobStatus::Cancelled),
                    completed_at: Some(Utc::now()),
                    metadata: Some(Value::Object(metadata)),
                    ..Default::default()
                },
            )
            .await?;
        self.inner.events.emit(EngineEvent::JobCancelled {
            job_id: job.id.clone(),
        });
        METRICS.inc(&METRICS.jobs_cancelled);
        tracing::info!("Job {} cancelled by {}", job.id, actor);
        self.record_activity(
            &job.tenant_id,
            "job.cancel",
            "job",
            &job.id,
            json!({ "actor": actor }),
        )
        .await;
        Ok(())
    }

    /// Current `{status, progress, last log line}` snapshot.
    pub async fn get_progress(
        &self,
        scope: &Scope,
        id: &str,
    ) -> Result<ProgressSnapshot, EngineError> {
        let job = self
            .inner
            .store
            .jobs()
            .get(scope, id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("job {}", id)))?;
        Ok(ProgressSnapshot {
            status: job.status,
            progress: job.progress,
            last_log: job.execution_logs.last().cloned(),
        })
    }

    /// Event stream for one job, ending at its terminal event.
    pub fn subscribe(&self, job_id: &str) -> JobSubscription {
        JobSubscription {
            job_id: job_id.to_string(),
            rx: self.inner.events.subscribe(),
            done: false,
        }
    }

    /// Execute a pending/queued job on the caller's task, bypassing the
    /// queue. Testing and manual-trigger hook.
    pub async fn execute_job_now(&self, id: &str) -> Result<Job, EngineError> {
        let jobs = self.inner.store.jobs();
        let job = jobs
            .get(&Scope::Admin, id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("job {}", id)))?;
        match job.status {
            JobStatus::Pending => {
                jobs.update_partial(
                    &job.id,
                    &JobPatch {
                        status: Some(JobStatus::Queued),
                        ..Default::default()
                    },
                )
                .await?;
            }
            JobStatus::Queued => {}
            other => {
                return Err(EngineError::Conflict(format!(
                    "job {} is {}, not executable",
                    id, other
                )))
            }
        }
        self.inner.queue(job.capability).remove(id);
        self.inner.force_acquire_slot(&job.tenant_id);
        run_job(
            &self.inner,
            job.capability,
            QueuedJob {
                job_id: job.id.clone(),
                tenant_id: job.tenant_id.clone(),
                priority: job.priority,
                created_at: job.created_at,
            },
        )
        .await;
        jobs.get(&Scope::Admin, id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("job {}", id)))
    }

    /// Close out a finding; a `resolved` close awards a remediation
    /// indicator.
    pub async fn resolve_finding(
        &self,
        scope: &Scope,
        id: &str,
        status: FindingStatus,
        actor: &str,
    ) -> Result<Finding, EngineError> {
        let findings = self.inner.store.findings();
        if findings.get(scope, id).await?.is_none() {
            // Distinguish "missing" from "owned by someone else".
            if scope.tenant_id().is_some() && findings.get(&Scope::Admin, id).await?.is_some() {
                return Err(EngineError::PermissionDenied(format!(
                    "finding {} belongs to another tenant",
                    id
                )));
            }
            return Err(EngineError::NotFound(format!("finding {}", id)));
        }
        let finding = findings.resolve(scope, id, status, actor).await?;
        if status == FindingStatus::Resolved {
            let indicator = scorer::remediated_indicator(&finding);
            self.inner.store.findings().insert_indicator(&indicator).await?;
            METRICS.inc(&METRICS.indicators_recorded);
        }
        self.record_activity(
            &finding.tenant_id,
            "finding.resolve",
            "finding",
            &finding.id,
            json!({ "actor": actor, "status": status.as_str() }),
        )
        .await;
        Ok(finding)
    }

    /// Re-arm persisted queue state after a restart: queued/pending jobs are
    /// re-enqueued, jobs caught mid-flight are failed.
    async fn recover(&self) -> Result<(), EngineError> {
        let jobs = self.inner.store.jobs();

        let interrupted = jobs.list_by_statuses(&[JobStatus::Running]).await?;
        for job in interrupted {
            tracing::warn!("Failing job {} interrupted by restart", job.id);
            let patch = JobPatch {
                status: Some(JobStatus::Failed),
                error: Some(Some("interrupted by engine restart".to_string())),
                completed_at: Some(Utc::now()),
                ..Default::default()
            };
            if let Err(err) = jobs.update_partial(&job.id, &patch).await {
                tracing::error!("Could not fail interrupted job {}: {}", job.id, err);
            } else {
                METRICS.inc(&METRICS.jobs_failed);
            }
        }

        let stranded = jobs
            .list_by_statuses(&[JobStatus::Pending, JobStatus::Queued])
            .await?;
        let recovered = stranded.len();
        for job in stranded {
            if job.status == JobStatus::Pending {
                jobs.update_partial(
                    &job.id,
                    &JobPatch {
                        status: Some(JobStatus::Queued),
                        ..Default::default()
                    },
                )
                .await?;
            }
            self.inner.queue(job.capability).push(QueuedJob {
                job_id: job.id.clone(),
                tenant_id: job.tenant_id.clone(),
                priority: job.priority,
                created_at: job.created_at,
            });
        }
        if recovered > 0 {
            tracing::info!("Recovered {} queued jobs from the store", recovered);
        }
        Ok(())
    }
}

impl Inner {
    fn queue(&self, capability: Capability) -> &CapabilityQueue {
        self.queues
            .get(&capability)
            .expect("queues cover every capability")
    }

    fn try_acquire_slot(&self, tenant_id: &str) -> bool {
        let mut load = self.tenant_load.lock().unwrap_or_else(|e| e.into_inner());
        let count = load.entry(tenant_id.to_string()).or_insert(0);
        if *count >= self.config.tenant_inflight_cap {
            false
        } else {
            *count += 1;
            true
        }
    }

    fn force_acquire_slot(&self, tenant_id: &str) {
        let mut load = self.tenant_load.lock().unwrap_or_else(|e| e.into_inner());
        *load.entry(tenant_id.to_string()).or_insert(0) += 1;
    }

    fn release_slot(&self, tenant_id: &str) {
        let mut load = self.tenant_load.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = load.get_mut(tenant_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                load.remove(tenant_id);
            }
        }
    }
}

// ============================================================================
// Worker loop
// ============================================================================

async fn worker_loop(inner: Arc<Inner>, capability: Capability, index: usize) {
    tracing::debug!("{} worker {} started", capability, index);
    let mut backoff_ms = DISPATCH_BACKOFF_BASE_MS;
    while !inner.shutdown.is_cancelled() {
        let popped = inner
            .queue(capability)
            .pop_admissible(|tenant| inner.try_acquire_slot(tenant));
        match popped {
            Some(entry) => {
                backoff_ms = DISPATCH_BACKOFF_BASE_MS;
                run_job(&inner, capability, entry).await;
            }
            None => {
                let jitter = rand::thread_rng().gen_range(0..=DISPATCH_BACKOFF_JITTER_MS);
                tokio::time::sleep(Duration::from_millis(backoff_ms + jitter)).await;
                backoff_ms = (backoff_ms * 2).min(DISPATCH_BACKOFF_MAX_MS);
            }
        }
    }
    tracing::debug!("{} worker {} stopped", capability, index);
}

/// Run one claimed queue entry to a terminal state, then release the tenant
/// slot.
async fn run_job(inner: &Arc<Inner>, capability: Capability, entry: QueuedJob) {
    let tenant_id = entry.tenant_id.clone();
    if let Err(err) = execute_entry(inner, capability, entry).await {
        tracing::error!("Job execution error: {}", err);
    }
    inner.release_slot(&tenant_id);
}

async fn execute_entry(
    inner: &Arc<Inner>,
    capability: Capability,
    entry: QueuedJob,
) -> Result<(), EngineError> {
    let jobs = inner.store.jobs();
    let Some(job) = jobs.get(&Scope::Admin, &entry.job_id).await? else {
        return Ok(());
    };
    if job.status != JobStatus::Queued {
        // Cancelled between enqueue and claim.
        return Ok(());
    }

    // Capture the executor by value: replacement does not affect this run.
    let Some(executor) = inner.registry.get(capability) else {
        fail_undispatchable(inner, &job, "no executor registered at dispatch time").await;
        return Ok(());
    };

    if jobs
        .update_partial(
            &job.id,
            &JobPatch {
                status: Some(JobStatus::Running),
                started_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await
        .is_err()
    {
        // Lost the race with a concurrent cancel; its transition stands.
        tracing::debug!("Job {} was cancelled before dispatch", job.id);
        return Ok(());
    }
    inner.events.emit(EngineEvent::JobStarted {
        job_id: job.id.clone(),
        tenant_id: job.tenant_id.clone(),
        capability,
    });

    let cancel = CancelSignal::new();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    {
        let mut running = inner.running.lock().unwrap_or_else(|e| e.into_inner());
        running.insert(
            job.id.clone(),
            RunningHandle {
                cancel: cancel.clone(),
                cancel_tx,
            },
        );
    }

    let (progress_tx, progress_rx) = mpsc::unbounded_channel::<(u8, String)>();
    let consumer = tokio::spawn(consume_progress(
        inner.clone(),
        job.id.clone(),
        progress_rx,
    ));

    let verdict = run_attempts(
        inner,
        capability,
        &job,
        executor,
        cancel,
        cancel_rx,
        progress_tx,
    )
    .await;

    // All progress senders are gone once the attempts finish; drain the
    // consumer so execution logs are settled before the terminal update.
    let _ = consumer.await;
    {
        let mut running = inner.running.lock().unwrap_or_else(|e| e.into_inner());
        running.remove(&job.id);
    }

    finalize(inner, &job, verdict).await
}

/// Fail a job that cannot be dispatched (configuration error discovered at
/// claim time). Passes through `running` so the lifecycle stays legal.
async fn fail_undispatchable(inner: &Arc<Inner>, job: &Job, message: &str) {
    let jobs = inner.store.jobs();
    let now = Utc::now();
    let through_running = jobs
        .update_partial(
            &job.id,
            &JobPatch {
                status: Some(JobStatus::Running),
                started_at: Some(now),
                ..Default::default()
            },
        )
        .await;
    if through_running.is_err() {
        return;
    }
    let mut logs = job.execution_logs.clone();
    logs.push(ExecutionLogEntry::error(message));
    let _ = jobs
        .update_partial(
            &job.id,
            &JobPatch {
                status: Some(JobStatus::Failed),
                error: Some(Some(message.to_string())),
                completed_at: Some(Utc::now()),
                execution_logs: Some(logs),
                ..Default::default()
            },
        )
        .await;
    inner.events.emit(EngineEvent::JobFailed {
        job_id: job.id.clone(),
        error: message.to_string(),
    });
    METRICS.inc(&METRICS.jobs_failed);
}

enum ExecutionVerdict {
    Succeeded {
        outcome: ExecOutcome,
        attempts: u32,
    },
    Failed {
        message: String,
        attempts: u32,
    },
    Cancelled {
        attempts: u32,
        abandoned: bool,
        note: Option<String>,
    },
}

enum AttemptInterrupt {
    CancelRequested,
    TimedOut,
}

/// Resolves once the external cancel request arrives; pends forever if the
/// sender disappears (it cannot while the job is in the running map).
async fn cancelled_signal(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn retry_backoff(config: &EngineConfig, attempt: u32) -> Duration {
    let base = config.retry_backoff_base_ms as f64 / 1000.0;
    let cap = config.retry_backoff_cap_ms as f64 / 1000.0;
    let exp = base * 2f64.powi(attempt.saturating_sub(1) as i32);
    let capped = exp.min(cap);
    let jitter_span = capped * RETRY_JITTER_FRACTION;
    let jitter = rand::thread_rng().gen_range(-jitter_span..=jitter_span);
    Duration::from_secs_f64((capped + jitter).max(0.001))
}

/// Drive the executor, absorbing transient failures up to the retry budget.
/// The worker holds the job for the whole sequence: status stays `running`
/// and no lifecycle events repeat.
async fn run_attempts(
    inner: &Arc<Inner>,
    capability: Capability,
    job: &Job,
    executor: ExecutorFn,
    cancel: CancelSignal,
    mut cancel_rx: watch::Receiver<bool>,
    progress_tx: mpsc::UnboundedSender<(u8, String)>,
) -> ExecutionVerdict {
    let timeout_secs = inner.config.timeout_for(capability);
    let max_retries = inner.config.max_retries;
    let last_progress = Arc::new(AtomicU8::new(job.progress));
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        let tx = progress_tx.clone();
        let floor = last_progress.load(Ordering::SeqCst);
        let tracker = last_progress.clone();
        let sink = ProgressSink::starting_at(
            floor,
            Arc::new(move |percent, message| {
                tracker.fetch_max(percent, Ordering::SeqCst);
                let _ = tx.send((percent, message.to_string()));
            }),
        );
        let request = ExecRequest {
            tenant_id: job.tenant_id.clone(),
            target: job.target.clone(),
            config: effective_config(&inner.config, capability, &job.config),
            progress: sink,
            cancel: cancel.clone(),
        };

        let mut fut = executor(request);
        let timeout = tokio::time::sleep(Duration::from_secs(timeout_secs));
        tokio::pin!(timeout);

        let attempt = tokio::select! {
            res = &mut fut => Ok(res),
            _ = cancelled_signal(&mut cancel_rx) => Err(AttemptInterrupt::CancelRequested),
            _ = &mut timeout => Err(AttemptInterrupt::TimedOut),
        };

        match attempt {
            Ok(Ok(outcome)) => {
                if cancel.is_cancelled() {
                    // Executor returned normally after the signal tripped;
                    // cancellation wins either way.
                    return ExecutionVerdict::Cancelled {
                        attempts,
                        abandoned: false,
                        note: None,
                    };
                }
                return ExecutionVerdict::Succeeded { outcome, attempts };
            }
            Ok(Err(err)) => match err.kind {
                ExecErrorKind::Cancelled => {
                    return ExecutionVerdict::Cancelled {
                        attempts,
                        abandoned: false,
                        note: None,
                    }
                }
                ExecErrorKind::Transient if attempts <= max_retries => {
                    METRICS.inc(&METRICS.jobs_retried);
                    let backoff = retry_backoff(&inner.config, attempts);
                    tracing::warn!(
                        "Job {} attempt {} transient failure: {} (retrying in {:.1}s)",
                        job.id,
                        attempts,
                        err.message,
                        backoff.as_secs_f64()
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancelled_signal(&mut cancel_rx) => {
                            cancel.cancel();
                            return ExecutionVerdict::Cancelled {
                                attempts,
                                abandoned: false,
                                note: None,
                            };
                        }
                    }
                    continue;
                }
                _ => {
                    return ExecutionVerdict::Failed {
                        message: err.message,
                        attempts,
                    }
                }
            },
            Err(AttemptInterrupt::CancelRequested) => {
                cancel.cancel();
                match tokio::time::timeout(Duration::from_secs(CANCEL_GRACE_SECS), &mut fut).await
                {
                    Ok(_) => {
                        return ExecutionVerdict::Cancelled {
                            attempts,
                            abandoned: false,
                            note: None,
                        }
                    }
                    Err(_) => {
                        return ExecutionVerdict::Cancelled {
                            attempts,
                            abandoned: true,
                            note: Some("cancellation not honoured; abandoned".to_string()),
                        }
                    }
                }
            }
            Err(AttemptInterrupt::TimedOut) => {
                cancel.cancel();
                let note = format!("execution timeout after {}s", timeout_secs);
                match tokio::time::timeout(Duration::from_secs(CANCEL_GRACE_SECS), &mut fut).await
                {
                    Ok(_) => {
                        return ExecutionVerdict::Cancelled {
                            attempts,
                            abandoned: false,
                            note: Some(note),
                        }
                    }
                    Err(_) => {
                        return ExecutionVerdict::Cancelled {
                            attempts,
                            abandoned: true,
                            note: Some(format!("{}; abandoned", note)),
                        }
                    }
                }
            }
        }
    }
}

/// Persist progress reports in order and fan them out as events.
async fn consume_progress(
    inner: Arc<Inner>,
    job_id: String,
    mut rx: mpsc::UnboundedReceiver<(u8, String)>,
) {
    while let Some((percent, message)) = rx.recv().await {
        let jobs = inner.store.jobs();
        match jobs.get(&Scope::Admin, &job_id).await {
            Ok(Some(job)) if job.status == JobStatus::Running => {
                let mut logs = job.execution_logs;
                logs.push(ExecutionLogEntry::info(message.clone()));
                let patch = JobPatch {
                    progress: Some(percent.max(job.progress)),
                    execution_logs: Some(logs),
                    ..Default::default()
                };
                if let Err(err) = jobs.update_partial(&job_id, &patch).await {
                    tracing::warn!("Progress update for job {} failed: {}", job_id, err);
                }
            }
            _ => {}
        }
        inner.events.emit(EngineEvent::JobProgress {
            job_id: job_id.clone(),
            progress: percent,
            message,
        });
    }
}

/// Apply the terminal transition. For success, all post-processing output is
/// durable before the status flips (status-last commit order): a reader sees
/// either `running`, or `succeeded` with every finding and indicator visible.
async fn finalize(
    inner: &Arc<Inner>,
    job: &Job,
    verdict: ExecutionVerdict,
) -> Result<(), EngineError> {
    let jobs = inner.store.jobs();
    let current = jobs
        .get(&Scope::Admin, &job.id)
        .await?
        .unwrap_or_else(|| job.clone());

    match verdict {
        ExecutionVerdict::Succeeded { outcome, attempts } => {
            let findings_count = outcome.findings.len();
            let metadata = post_process(inner, &current, &outcome, attempts).await?;
            let mut logs = current.execution_logs.clone();
            logs.push(ExecutionLogEntry::info(format!(
                "completed with {} findings",
                findings_count
            )));
            jobs.update_partial(
                &job.id,
                &JobPatch {
                    status: Some(JobStatus::Succeeded),
                    progress: Some(100),
                    completed_at: Some(Utc::now()),
                    metadata: Some(metadata),
                    execution_logs: Some(logs),
                    ..Default::default()
                },
            )
            .await?;
            inner.events.emit(EngineEvent::JobFindings {
                job_id: job.id.clone(),
                count: findings_count,
            });
            inner.events.emit(EngineEvent::JobSucceeded {
                job_id: job.id.clone(),
            });
            METRICS.inc(&METRICS.jobs_succeeded);
            tracing::info!(
                "Job {} succeeded with {} findings (attempt {})",
                job.id,
                findings_count,
                attempts
            );
        }
        ExecutionVerdict::Failed { message, attempts } => {
            let mut metadata = as_object(current.metadata.clone());
            metadata.insert("attempts".to_string(), json!(attempts));
            let mut logs = current.execution_logs.clone();
            logs.push(ExecutionLogEntry::error(message.clone()));
            jobs.update_partial(
                &job.id,
                &JobPatch {
                    status: Some(JobStatus::Failed),
                    error: Some(Some(message.clone())),
                    completed_at: Some(Utc::now()),
                    metadata: Some(Value::Object(metadata)),
                    execution_logs: Some(logs),
                    ..Default::default()
                },
            )
            .await?;
            inner.events.emit(EngineEvent::JobFailed {
                job_id: job.id.clone(),
                error: message.clone(),
            });
            METRICS.inc(&METRICS.jobs_failed);
            tracing::warn!("Job {} failed after {} attempts: {}", job.id, attempts, message);
        }
        ExecutionVerdict::Cancelled {
            attempts,
            abandoned,
            note,
        } => {
            let mut metadata = as_object(current.metadata.clone());
            metadata.insert("attempts".to_string(), json!(attempts));
            let mut logs = current.execution_logs.clone();
            if let Some(note) = &note {
                logs.push(ExecutionLogEntry::error(note.clone()));
            }
            jobs.update_partial(
                &job.id,
                &JobPatch {
                    status: Some(JobStatus::Cancelled),
                    completed_at: Some(Utc::now()),
                    error: if abandoned { Some(note.clone()) } else { None },
                    metadata: Some(Value::Object(metadata)),
                    execution_logs: Some(logs),
                    ..Default::default()
                },
            )
            .await?;
            inner.events.emit(EngineEvent::JobCancelled {
                job_id: job.id.clone(),
            });
            METRICS.inc(&METRICS.jobs_cancelled);
            tracing::info!("Job {} cancelled (abandoned: {})", job.id, abandoned);
        }
    }
    Ok(())
}

/// Findings, indicators, posture and metadata for a successful run. Runs
/// before the terminal status update.
async fn post_process(
    inner: &Arc<Inner>,
    job: &Job,
    outcome: &ExecOutcome,
    attempts: u32,
) -> Result<Value, EngineError> {
    let scope = Scope::tenant(&job.tenant_id);
    let findings = inner.store.findings();

    for raw in &outcome.findings {
        findings
            .upsert(&NewFinding {
                tenant_id: job.tenant_id.clone(),
                capability: job.capability,
                target: job.target.clone(),
                severity: raw.severity,
                title: raw.title.clone(),
                description: raw.description.clone(),
                evidence: raw.evidence.clone(),
                affected_assets: raw.affected_assets.clone(),
                recommendations: raw.recommendations.clone(),
                risk_score: raw.risk_score.clamp(0.0, 100.0),
                job_id: Some(job.id.clone()),
            })
            .await?;
    }
    METRICS.add(&METRICS.findings_recorded, outcome.findings.len() as u64);

    let mut indicators = scorer::analyze_scan(
        &job.tenant_id,
        job.capability,
        &job.target,
        &outcome.findings,
        outcome.scan_results.as_ref(),
    );

    let active = findings.active_counts_by_severity(&scope).await?;
    let current_score = scorer::posture_score(&active);
    let previous_score = inner.store.posture().latest(&job.tenant_id).await?;
    if let Some(trend) = scorer::improvement_trend(&job.tenant_id, current_score, previous_score)
    {
        indicators.push(trend);
    }
    inner.store.posture().record(&job.tenant_id, current_score).await?;

    for extra in &outcome.positive_indicators {
        let mut indicator = extra.clone();
        indicator.tenant_id = job.tenant_id.clone();
        findings.insert_indicator(&indicator).await?;
    }
    for indicator in &indicators {
        findings.insert_indicator(indicator).await?;
    }
    METRICS.add(
        &METRICS.indicators_recorded,
        (outcome.positive_indicators.len() + indicators.len()) as u64,
    );

    let mut metadata = as_object(job.metadata.clone());
    if let Value::Object(extra) = &outcome.metadata {
        for (key, value) in extra {
            metadata.insert(key.clone(), value.clone());
        }
    }
    metadata.insert("attempts".to_string(), json!(attempts));
    Ok(Value::Object(metadata))
}

fn as_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// The config document handed to the executor: the job's config, with
/// capability-level defaults (dark-web phase timeouts) filled in when the
/// caller did not set them.
fn effective_config(config: &EngineConfig, capability: Capability, base: &Value) -> Value {
    let mut map = as_object(base.clone());
    if capability == Capability::DarkwebIntelligence {
        map.entry("discovery_timeout_secs".to_string())
            .or_insert_with(|| json!(config.darkweb_discovery_timeout_secs));
        map.entry("crawl_timeout_secs".to_string())
            .or_insert_with(|| json!(config.darkweb_crawl_timeout_secs));
    }
    Value::Object(map)
}
