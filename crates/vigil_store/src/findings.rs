//! Finding and positive-indicator persistence.
//!
//! A finding's identity is a content hash of
//! `capability | target | title | canonical evidence`, so re-emission by a
//! later scan is an idempotent upsert. Canonical evidence serialises JSON
//! objects with recursively sorted keys.

use crate::error::{Result, StoreError};
use crate::Scope;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use sqlx::{FromRow, Pool, QueryBuilder, Sqlite};
use std::collections::HashMap;
use vigil_protocol::{
    Capability, Finding, FindingStatus, IndicatorType, PositiveIndicator, Severity,
};

/// Input for an identity-based upsert.
#[derive(Debug, Clone)]
pub struct NewFinding {
    pub tenant_id: String,
    pub capability: Capability,
    pub target: String,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub evidence: Value,
    pub affected_assets: Vec<String>,
    pub recommendations: Vec<String>,
    pub risk_score: f64,
    /// The job that produced this observation; lands in `evidence.job_id`.
    pub job_id: Option<String>,
}

/// Filters for active-finding listings.
#[derive(Debug, Clone, Default)]
pub struct FindingFilter {
    pub capability: Option<Capability>,
    pub severity: Option<Severity>,
    pub target: Option<String>,
    pub min_risk_score: f64,
}

/// Serialise a JSON value with object keys recursively sorted.
fn canonical_json(value: &Value) -> String {
    fn canonicalise(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: std::collections::BTreeMap<_, _> =
                    map.iter().map(|(k, v)| (k.clone(), canonicalise(v))).collect();
                Value::Object(sorted.into_iter().collect())
            }
            Value::Array(items) => Value::Array(items.iter().map(canonicalise).collect()),
            other => other.clone(),
        }
    }
    canonicalise(value).to_string()
}

/// Content-hash identity for a finding.
pub fn finding_identity(
    capability: Capability,
    target: &str,
    title: &str,
    evidence: &Value,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(capability.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(target.as_bytes());
    hasher.update(b"|");
    hasher.update(title.as_bytes());
    hasher.update(b"|");
    hasher.update(canonical_json(evidence).as_bytes());
    format!("f-{:x}", hasher.finalize())
}

#[derive(Debug, FromRow)]
struct FindingRow {
    id: String,
    tenant_id: String,
    capability: String,
    severity: String,
    status: String,
    title: String,
    description: String,
    evidence: String,
    affected_assets: String,
    recommendations: String,
    risk_score: f64,
    target: String,
    discovered_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
    resolved_by: Option<String>,
}

impl FindingRow {
    fn into_finding(self) -> Result<Finding> {
        Ok(Finding {
            capability: self.capability.parse().map_err(StoreError::decode)?,
            severity: self.severity.parse().map_err(StoreError::decode)?,
            status: self.status.parse().map_err(StoreError::decode)?,
            evidence: serde_json::from_str(&self.evidence)?,
            affected_assets: serde_json::from_str(&self.affected_assets)?,
            recommendations: serde_json::from_str(&self.recommendations)?,
            id: self.id,
            tenant_id: self.tenant_id,
            title: self.title,
            description: self.description,
            risk_score: self.risk_score,
            target: self.target,
            discovered_at: self.discovered_at,
            resolved_at: self.resolved_at,
            resolved_by: self.resolved_by,
        })
    }
}

#[derive(Debug, FromRow)]
struct IndicatorRow {
    id: String,
    tenant_id: String,
    indicator_type: String,
    category: String,
    points_awarded: i64,
    description: String,
    evidence: String,
    target: Option<String>,
    created_at: DateTime<Utc>,
}

impl IndicatorRow {
    fn into_indicator(self) -> Result<PositiveIndicator> {
        Ok(PositiveIndicator {
            indicator_type: self.indicator_type.parse().map_err(StoreError::decode)?,
            evidence: serde_json::from_str(&self.evidence)?,
            id: self.id,
            tenant_id: self.tenant_id,
            category: self.category,
            points_awarded: self.points_awarded,
            description: self.description,
            target: self.target,
            created_at: self.created_at,
        })
    }
}

pub struct FindingStore {
    pool: Pool<Sqlite>,
}

impl FindingStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Identity-based idempotent upsert.
    ///
    /// - No finding with this identity: insert it `active`.
    /// - Active finding exists: re-apply severity, risk score, evidence and
    ///   recommendations.
    /// - Resolved finding exists: do not reopen; append a re-observation
    ///   event under `evidence.reobservations` instead.
    ///
    /// Returns the stored finding's id.
    pub async fn upsert(&self, new: &NewFinding) -> Result<String> {
        let mut evidence = new.evidence.clone();
        if !evidence.is_object() {
            evidence = Value::Object(Map::new());
        }
        // The identity hash excludes job_id: the same observation from a
        // later job must collapse onto the same finding.
        let id = finding_identity(new.capability, &new.target, &new.title, &evidence);
        if let (Value::Object(map), Some(job_id)) = (&mut evidence, &new.job_id) {
            map.insert("job_id".to_string(), json!(job_id));
        }

        let mut tx = self.pool.begin().await?;
        let existing: Option<FindingRow> = sqlx::query_as("SELECT * FROM findings WHERE id = ?")
            .bind(&id)
            .fetch_optional(&mut *tx)
            .await?;

        match existing {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO findings
                        (id, tenant_id, capability, severity, status, title, description,
                         evidence, affected_assets, recommendations, risk_score, target,
                         job_id, discovered_at)
                    VALUES (?, ?, ?, ?, 'active', ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&id)
                .bind(&new.tenant_id)
                .bind(new.capability.as_str())
                .bind(new.severity.as_str())
                .bind(&new.title)
                .bind(&new.description)
                .bind(serde_json::to_string(&evidence)?)
                .bind(serde_json::to_string(&new.affected_assets)?)
                .bind(serde_json::to_string(&new.recommendations)?)
                .bind(new.risk_score)
                .bind(&new.target)
                .bind(&new.job_id)
                .bind(Utc::now())
                .execute(&mut *tx)
                .await?;
            }
            Some(row) => {
                let status: FindingStatus = row.status.parse().map_err(StoreError::decode)?;
                if status == FindingStatus::Active {
                    sqlx::query(
                        r#"
                        UPDATE findings
                        SET severity = ?, risk_score = ?, evidence = ?,
                            recommendations = ?, description = ?, job_id = ?
                        WHERE id = ?
                        "#,
                    )
                    .bind(new.severity.as_str())
                    .bind(new.risk_score)
                    .bind(serde_json::to_string(&evidence)?)
                    .bind(serde_json::to_string(&new.recommendations)?)
                    .bind(&new.description)
                    .bind(&new.job_id)
                    .bind(&id)
                    .execute(&mut *tx)
                    .await?;
                } else {
                    // Resolved findings stay resolved; record the sighting.
                    let mut stored: Value = serde_json::from_str(&row.evidence)?;
                    if !stored.is_object() {
                        stored = Value::Object(Map::new());
                    }
                    if let Value::Object(map) = &mut stored {
                        let reobs = map
                            .entry("reobservations".to_string())
                            .or_insert_with(|| Value::Array(Vec::new()));
                        if let Value::Array(items) = reobs {
                            items.push(json!({
                                "at": Utc::now(),
                                "job_id": new.job_id,
                                "severity": new.severity.as_str(),
                                "risk_score": new.risk_score,
                            }));
                        }
                    }
                    sqlx::query("UPDATE findings SET evidence = ? WHERE id = ?")
                        .bind(serde_json::to_string(&stored)?)
                        .bind(&id)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(id)
    }

    pub async fn get(&self, scope: &Scope, id: &str) -> Result<Option<Finding>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM findings WHERE id = ");
        qb.push_bind(id.to_string());
        if let Some(tenant) = scope.tenant_id() {
            qb.push(" AND tenant_id = ").push_bind(tenant.to_string());
        }
        let row: Option<FindingRow> = qb.build_query_as().fetch_optional(&self.pool).await?;
        row.map(FindingRow::into_finding).transpose()
    }

    /// Close out a finding. Idempotent for the same target status.
    pub async fn resolve(
        &self,
        scope: &Scope,
        id: &str,
        status: FindingStatus,
        actor: &str,
    ) -> Result<Finding> {
        if !status.is_resolved() {
            return Err(StoreError::validation(
                "resolve requires a non-active status",
            ));
        }
        let current = self
            .get(scope, id)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("finding {}", id)))?;

        if current.status == status {
            return Ok(current);
        }
        if current.status != FindingStatus::Active {
            return Err(StoreError::invalid_state(format!(
                "finding {} already {}",
                id, current.status
            )));
        }

        sqlx::query(
            "UPDATE findings SET status = ?, resolved_at = ?, resolved_by = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(actor)
        .bind(id)
        .execute(&self.pool)
        .await?;

        self.get(scope, id)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("finding {}", id)))
    }

    /// Active findings ordered by `(risk_score desc, discovered_at desc)`.
    pub async fn list_active(
        &self,
        scope: &Scope,
        filter: &FindingFilter,
        limit: i64,
    ) -> Result<Vec<Finding>> {
        let mut qb =
            QueryBuilder::<Sqlite>::new("SELECT * FROM findings WHERE status = 'active'");
        if let Some(tenant) = scope.tenant_id() {
            qb.push(" AND tenant_id = ").push_bind(tenant.to_string());
        }
        if let Some(capability) = filter.capability {
            qb.push(" AND capability = ").push_bind(capability.as_str());
        }
        if let Some(severity) = filter.severity {
            qb.push(" AND severity = ").push_bind(severity.as_str());
        }
        if let Some(target) = &filter.target {
            qb.push(" AND target = ").push_bind(target.clone());
        }
        if filter.min_risk_score > 0.0 {
            qb.push(" AND risk_score >= ").push_bind(filter.min_risk_score);
        }
        qb.push(" ORDER BY risk_score DESC, discovered_at DESC LIMIT ")
            .push_bind(limit);
        let rows: Vec<FindingRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(FindingRow::into_finding).collect()
    }

    /// Active findings of critical or high severity.
    pub async fn list_critical(&self, scope: &Scope, limit: i64) -> Result<Vec<Finding>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT * FROM findings WHERE status = 'active' AND severity IN ('critical', 'high')",
        );
        if let Some(tenant) = scope.tenant_id() {
            qb.push(" AND tenant_id = ").push_bind(tenant.to_string());
        }
        qb.push(" ORDER BY risk_score DESC, discovered_at DESC LIMIT ")
            .push_bind(limit);
        let rows: Vec<FindingRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(FindingRow::into_finding).collect()
    }

    /// Findings first observed by a given job.
    pub async fn list_by_job(&self, scope: &Scope, job_id: &str) -> Result<Vec<Finding>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM findings WHERE job_id = ");
        qb.push_bind(job_id.to_string());
        if let Some(tenant) = scope.tenant_id() {
            qb.push(" AND tenant_id = ").push_bind(tenant.to_string());
        }
        qb.push(" ORDER BY discovered_at DESC");
        let rows: Vec<FindingRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(FindingRow::into_finding).collect()
    }

    /// Counts of active findings grouped by severity.
    pub async fn active_counts_by_severity(
        &self,
        scope: &Scope,
    ) -> Result<HashMap<Severity, i64>> {
        self.counts_by_severity(scope, "status = 'active'").await
    }

    /// Counts of resolved findings (any non-active status) by severity.
    pub async fn resolved_counts_by_severity(
        &self,
        scope: &Scope,
    ) -> Result<HashMap<Severity, i64>> {
        self.counts_by_severity(scope, "status != 'active'").await
    }

    async fn counts_by_severity(
        &self,
        scope: &Scope,
        predicate: &str,
    ) -> Result<HashMap<Severity, i64>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT severity, COUNT(*) as n FROM findings WHERE {}",
            predicate
        ));
        if let Some(tenant) = scope.tenant_id() {
            qb.push(" AND tenant_id = ").push_bind(tenant.to_string());
        }
        qb.push(" GROUP BY severity");
        let rows: Vec<(String, i64)> = qb.build_query_as().fetch_all(&self.pool).await?;
        let mut counts = HashMap::new();
        for (severity, n) in rows {
            let severity: Severity = severity.parse().map_err(StoreError::decode)?;
            counts.insert(severity, n);
        }
        Ok(counts)
    }

    // ------------------------------------------------------------------
    // Positive indicators (append-only)
    // ------------------------------------------------------------------

    pub async fn insert_indicator(&self, indicator: &PositiveIndicator) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO positive_indicators
                (id, tenant_id, indicator_type, category, points_awarded,
                 description, evidence, target, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&indicator.id)
        .bind(&indicator.tenant_id)
        .bind(indicator.indicator_type.as_str())
        .bind(&indicator.category)
        .bind(indicator.points_awarded)
        .bind(&indicator.description)
        .bind(serde_json::to_string(&indicator.evidence)?)
        .bind(&indicator.target)
        .bind(indicator.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_indicators(
        &self,
        scope: &Scope,
        limit: i64,
    ) -> Result<Vec<PositiveIndicator>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM positive_indicators WHERE 1=1");
        if let Some(tenant) = scope.tenant_id() {
            qb.push(" AND tenant_id = ").push_bind(tenant.to_string());
        }
        qb.push(" ORDER BY created_at DESC LIMIT ").push_bind(limit);
        let rows: Vec<IndicatorRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(IndicatorRow::into_indicator).collect()
    }

    /// Total positive points a tenant has accumulated.
    pub async fn total_points(&self, scope: &Scope) -> Result<i64> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT COALESCE(SUM(points_awarded), 0) FROM positive_indicators WHERE 1=1",
        );
        if let Some(tenant) = scope.tenant_id() {
            qb.push(" AND tenant_id = ").push_bind(tenant.to_string());
        }
        let total: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(total)
    }

    /// Convenience constructor for scorer-produced indicators.
    pub fn new_indicator(
        tenant_id: &str,
        indicator_type: IndicatorType,
        category: &str,
        points: i64,
        description: String,
        evidence: Value,
        target: Option<String>,
    ) -> PositiveIndicator {
        PositiveIndicator {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            indicator_type,
            category: category.to_string(),
            points_awarded: points,
            description,
            evidence,
            target,
            created_at: Utc::now(),
        }
    }
}
