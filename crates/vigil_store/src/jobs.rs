//! Job persistence.
//!
//! Lifecycle custody lives in the engine; this store enforces that partial
//! updates never violate the job state machine (an illegal transition here is
//! a programming error, not user input) and that a single partial update is
//! atomic against concurrent readers.

use crate::error::{Result, StoreError};
use crate::Scope;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, Pool, QueryBuilder, Sqlite};
use vigil_protocol::{Capability, ExecutionLogEntry, Job, JobPriority, JobStatus};

/// Filters for job listings. All fields are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub capability: Option<Capability>,
    pub status: Option<JobStatus>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

/// Atomic partial update of mutable job fields.
///
/// `error` is doubly optional: `Some(None)` clears the column.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub error: Option<Option<String>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub config: Option<Value>,
    pub metadata: Option<Value>,
    pub execution_logs: Option<Vec<ExecutionLogEntry>>,
}

impl JobPatch {
    fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.progress.is_none()
            && self.error.is_none()
            && self.started_at.is_none()
            && self.completed_at.is_none()
            && self.config.is_none()
            && self.metadata.is_none()
            && self.execution_logs.is_none()
    }
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: String,
    tenant_id: String,
    capability: String,
    target: String,
    status: String,
    priority: i64,
    progress: i64,
    config: String,
    metadata: String,
    error: Option<String>,
    execution_logs: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        Ok(Job {
            capability: self
                .capability
                .parse()
                .map_err(StoreError::decode)?,
            status: self.status.parse().map_err(StoreError::decode)?,
            priority: JobPriority::from_i64(self.priority).map_err(StoreError::decode)?,
            progress: self.progress.clamp(0, 100) as u8,
            config: serde_json::from_str(&self.config)?,
            metadata: serde_json::from_str(&self.metadata)?,
            execution_logs: serde_json::from_str(&self.execution_logs)?,
            id: self.id,
            tenant_id: self.tenant_id,
            target: self.target,
            error: self.error,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

pub struct JobStore {
    pool: Pool<Sqlite>,
}

impl JobStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Insert-or-replace by id.
    pub async fn upsert(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO jobs
                (id, tenant_id, capability, target, status, priority, progress,
                 config, metadata, error, execution_logs, created_at, started_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.tenant_id)
        .bind(job.capability.as_str())
        .bind(&job.target)
        .bind(job.status.as_str())
        .bind(job.priority.as_i64())
        .bind(job.progress as i64)
        .bind(serde_json::to_string(&job.config)?)
        .bind(serde_json::to_string(&job.metadata)?)
        .bind(&job.error)
        .bind(serde_json::to_string(&job.execution_logs)?)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, scope: &Scope, id: &str) -> Result<Option<Job>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM jobs WHERE id = ");
        qb.push_bind(id.to_string());
        if let Some(tenant) = scope.tenant_id() {
            qb.push(" AND tenant_id = ").push_bind(tenant.to_string());
        }
        let row: Option<JobRow> = qb.build_query_as().fetch_optional(&self.pool).await?;
        row.map(JobRow::into_job).transpose()
    }

    /// List jobs ordered by `created_at` descending (id descending as a
    /// tiebreak, keeping pagination stable).
    pub async fn list(
        &self,
        scope: &Scope,
        filter: &JobFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Job>> {
        let mut qb = Self::filtered("SELECT * FROM jobs WHERE 1=1", scope, filter);
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);
        let rows: Vec<JobRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    pub async fn count(&self, scope: &Scope, filter: &JobFilter) -> Result<i64> {
        let mut qb = Self::filtered("SELECT COUNT(*) FROM jobs WHERE 1=1", scope, filter);
        let count: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(count)
    }

    /// Jobs in any of `statuses`, across all tenants. Startup recovery path.
    pub async fn list_by_statuses(&self, statuses: &[JobStatus]) -> Result<Vec<Job>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM jobs WHERE status IN (");
        let mut sep = qb.separated(", ");
        for status in statuses {
            sep.push_bind(status.as_str());
        }
        qb.push(") ORDER BY created_at ASC");
        let rows: Vec<JobRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    /// Atomically apply `patch` to the job.
    ///
    /// Refuses status changes that violate the lifecycle; such a refusal
    /// means the engine has a bug, so it surfaces as `InvalidState` rather
    /// than anything user-facing.
    pub async fn update_partial(&self, id: &str, patch: &JobPatch) -> Result<()> {
        if patch.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        let current: Option<String> = sqlx::query_scalar("SELECT status FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let current: JobStatus = current
            .ok_or_else(|| StoreError::not_found(format!("job {}", id)))?
            .parse()
            .map_err(StoreError::decode)?;

        if let Some(next) = patch.status {
            if !current.can_transition_to(next) {
                return Err(StoreError::invalid_state(format!(
                    "job {}: illegal transition {} -> {}",
                    id, current, next
                )));
            }
        }

        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE jobs SET ");
        {
            let mut set = qb.separated(", ");
            if let Some(status) = patch.status {
                set.push("status = ");
                set.push_bind_unseparated(status.as_str());
            }
            if let Some(progress) = patch.progress {
                set.push("progress = ");
                set.push_bind_unseparated(progress.min(100) as i64);
            }
            if let Some(error) = &patch.error {
                set.push("error = ");
                set.push_bind_unseparated(error.clone());
            }
            if let Some(started_at) = patch.started_at {
                set.push("started_at = ");
                set.push_bind_unseparated(started_at);
            }
            if let Some(completed_at) = patch.completed_at {
                set.push("completed_at = ");
                set.push_bind_unseparated(completed_at);
            }
            if let Some(config) = &patch.config {
                set.push("config = ");
                set.push_bind_unseparated(serde_json::to_string(config)?);
            }
            if let Some(metadata) = &patch.metadata {
                set.push("metadata = ");
                set.push_bind_unseparated(serde_json::to_string(metadata)?);
            }
            if let Some(logs) = &patch.execution_logs {
                set.push("execution_logs = ");
                set.push_bind_unseparated(serde_json::to_string(logs)?);
            }
        }
        qb.push(" WHERE id = ").push_bind(id.to_string());
        qb.build().execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(())
    }

    fn filtered<'a>(
        base: &str,
        scope: &'a Scope,
        filter: &'a JobFilter,
    ) -> QueryBuilder<'a, Sqlite> {
        let mut qb = QueryBuilder::<Sqlite>::new(base);
        if let Some(tenant) = scope.tenant_id() {
            qb.push(" AND tenant_id = ").push_bind(tenant.to_string());
        }
        if let Some(capability) = filter.capability {
            qb.push(" AND capability = ").push_bind(capability.as_str());
        }
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(after) = filter.created_after {
            qb.push(" AND created_at >= ").push_bind(after);
        }
        if let Some(before) = filter.created_before {
            qb.push(" AND created_at <= ").push_bind(before);
        }
        qb
    }
}
