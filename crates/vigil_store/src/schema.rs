//! Schema bootstrap for the control-plane store.
//!
//! JSON payloads (`config`, `metadata`, `evidence`, `execution_logs`,
//! `tunnel_detection`) live in TEXT columns and are (de)serialised at the
//! store boundary. Timestamps are RFC3339 TEXT.

use crate::error::Result;
use sqlx::{Pool, Sqlite};

const DDL: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        capability TEXT NOT NULL,
        target TEXT NOT NULL,
        status TEXT NOT NULL,
        priority INTEGER NOT NULL DEFAULT 2,
        progress INTEGER NOT NULL DEFAULT 0,
        config TEXT NOT NULL DEFAULT '{}',
        metadata TEXT NOT NULL DEFAULT '{}',
        error TEXT,
        execution_logs TEXT NOT NULL DEFAULT '[]',
        created_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_jobs_tenant_created ON jobs (tenant_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs (status)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_capability ON jobs (capability)",
    r#"
    CREATE TABLE IF NOT EXISTS findings (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        capability TEXT NOT NULL,
        severity TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'active',
        title TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        evidence TEXT NOT NULL DEFAULT '{}',
        affected_assets TEXT NOT NULL DEFAULT '[]',
        recommendations TEXT NOT NULL DEFAULT '[]',
        risk_score REAL NOT NULL DEFAULT 0,
        target TEXT NOT NULL DEFAULT '',
        job_id TEXT,
        discovered_at TEXT NOT NULL,
        resolved_at TEXT,
        resolved_by TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_findings_tenant_status ON findings (tenant_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_findings_job ON findings (job_id)",
    "CREATE INDEX IF NOT EXISTS idx_findings_severity ON findings (severity)",
    r#"
    CREATE TABLE IF NOT EXISTS positive_indicators (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        indicator_type TEXT NOT NULL,
        category TEXT NOT NULL,
        points_awarded INTEGER NOT NULL DEFAULT 0,
        description TEXT NOT NULL DEFAULT '',
        evidence TEXT NOT NULL DEFAULT '{}',
        target TEXT,
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_indicators_tenant_created ON positive_indicators (tenant_id, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS scheduled_searches (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        name TEXT NOT NULL,
        description TEXT,
        capabilities TEXT NOT NULL DEFAULT '[]',
        target TEXT NOT NULL,
        config TEXT NOT NULL DEFAULT '{}',
        cron_expression TEXT NOT NULL,
        timezone TEXT NOT NULL DEFAULT 'UTC',
        enabled INTEGER NOT NULL DEFAULT 1,
        last_run_at TEXT,
        next_run_at TEXT,
        run_count INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_scheduled_tenant ON scheduled_searches (tenant_id)",
    "CREATE INDEX IF NOT EXISTS idx_scheduled_enabled_next ON scheduled_searches (enabled, next_run_at)",
    r#"
    CREATE TABLE IF NOT EXISTS company_profiles (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        primary_domain TEXT,
        additional_domains TEXT NOT NULL DEFAULT '[]',
        timezone TEXT NOT NULL DEFAULT 'UTC',
        automation_config TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS network_logs (
        id TEXT PRIMARY KEY,
        request_id TEXT NOT NULL UNIQUE,
        tenant_id TEXT,
        timestamp TEXT NOT NULL,
        ip TEXT NOT NULL,
        method TEXT NOT NULL,
        path TEXT NOT NULL,
        query TEXT,
        status INTEGER NOT NULL,
        response_time_ms REAL NOT NULL,
        request_headers TEXT NOT NULL DEFAULT '{}',
        response_headers TEXT NOT NULL DEFAULT '{}',
        request_body TEXT,
        response_body TEXT,
        body_truncated INTEGER NOT NULL DEFAULT 0,
        tunnel_detection TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_netlogs_tenant_ts ON network_logs (tenant_id, timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_netlogs_ip_ts ON network_logs (ip, timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_netlogs_path_ts ON network_logs (path, timestamp)",
    r#"
    CREATE TABLE IF NOT EXISTS activity_log (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        action TEXT NOT NULL,
        resource_type TEXT,
        resource_id TEXT,
        ip_address TEXT,
        user_agent TEXT,
        metadata TEXT NOT NULL DEFAULT '{}',
        timestamp TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_activity_tenant_ts ON activity_log (tenant_id, timestamp)",
    r#"
    CREATE TABLE IF NOT EXISTS posture_scores (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id TEXT NOT NULL,
        score REAL NOT NULL,
        computed_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_posture_tenant_ts ON posture_scores (tenant_id, computed_at)",
];

/// Create all tables and indices. Idempotent.
pub async fn init_schema(pool: &Pool<Sqlite>) -> Result<()> {
    for statement in DDL {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
