//! Network audit log persistence.
//!
//! Entries arrive already sanitised (header redaction, body truncation happen
//! in the gatekeeper before anything touches this store). Retention is
//! TTL-based; `cleanup_old` deletes expired rows.

use crate::error::{Result, StoreError};
use crate::Scope;
use chrono::{DateTime, Duration, Utc};
use sqlx::{FromRow, Pool, QueryBuilder, Sqlite};
use std::collections::HashMap;
use vigil_protocol::{Confidence, NetworkLogEntry, TunnelVerdict};

/// Filters for audit-log listings. All fields are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct NetworkLogFilter {
    pub ip: Option<String>,
    pub method: Option<String>,
    pub path: Option<String>,
    pub status: Option<u16>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

/// Aggregate statistics over a time range.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct NetworkStats {
    pub total_requests: i64,
    pub unique_ips: i64,
    pub unique_endpoints: i64,
    pub tunnel_detections: i64,
    pub status_counts: HashMap<u16, i64>,
    pub avg_response_time_ms: f64,
    pub p50_response_time_ms: f64,
    pub p95_response_time_ms: f64,
    pub p99_response_time_ms: f64,
}

#[derive(Debug, FromRow)]
struct NetworkLogRow {
    id: String,
    request_id: String,
    tenant_id: Option<String>,
    timestamp: DateTime<Utc>,
    ip: String,
    method: String,
    path: String,
    query: Option<String>,
    status: i64,
    response_time_ms: f64,
    request_headers: String,
    response_headers: String,
    request_body: Option<String>,
    response_body: Option<String>,
    body_truncated: i64,
    tunnel_detection: Option<String>,
}

impl NetworkLogRow {
    fn into_entry(self) -> Result<NetworkLogEntry> {
        let tunnel_detection: Option<TunnelVerdict> = match &self.tunnel_detection {
            Some(raw) => Some(serde_json::from_str(raw)?),
            None => None,
        };
        Ok(NetworkLogEntry {
            request_headers: serde_json::from_str(&self.request_headers)?,
            response_headers: serde_json::from_str(&self.response_headers)?,
            status: self.status as u16,
            body_truncated: self.body_truncated != 0,
            tunnel_detection,
            id: self.id,
            request_id: self.request_id,
            tenant_id: self.tenant_id,
            timestamp: self.timestamp,
            ip: self.ip,
            method: self.method,
            path: self.path,
            query: self.query,
            response_time_ms: self.response_time_ms,
            request_body: self.request_body,
            response_body: self.response_body,
        })
    }
}

pub struct NetworkLogStore {
    pool: Pool<Sqlite>,
}

impl NetworkLogStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Append one entry. `request_id` is unique; a duplicate insert is
    /// ignored (at-least-once capture upstream).
    pub async fn insert(&self, entry: &NetworkLogEntry) -> Result<()> {
        let tunnel = entry
            .tunnel_detection
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO network_logs
                (id, request_id, tenant_id, timestamp, ip, method, path, query,
                 status, response_time_ms, request_headers, response_headers,
                 request_body, response_body, body_truncated, tunnel_detection)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.request_id)
        .bind(&entry.tenant_id)
        .bind(entry.timestamp)
        .bind(&entry.ip)
        .bind(&entry.method)
        .bind(&entry.path)
        .bind(&entry.query)
        .bind(entry.status as i64)
        .bind(entry.response_time_ms)
        .bind(serde_json::to_string(&entry.request_headers)?)
        .bind(serde_json::to_string(&entry.response_headers)?)
        .bind(&entry.request_body)
        .bind(&entry.response_body)
        .bind(entry.body_truncated as i64)
        .bind(tunnel)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Attach a tunnel verdict to an already-captured request.
    pub async fn attach_tunnel_detection(
        &self,
        request_id: &str,
        verdict: &TunnelVerdict,
    ) -> Result<()> {
        sqlx::query("UPDATE network_logs SET tunnel_detection = ? WHERE request_id = ?")
            .bind(serde_json::to_string(verdict)?)
            .bind(request_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get(&self, request_id: &str) -> Result<Option<NetworkLogEntry>> {
        let row: Option<NetworkLogRow> =
            sqlx::query_as("SELECT * FROM network_logs WHERE request_id = ?")
                .bind(request_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(NetworkLogRow::into_entry).transpose()
    }

    pub async fn list(
        &self,
        scope: &Scope,
        filter: &NetworkLogFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<NetworkLogEntry>> {
        let mut qb = Self::filtered("SELECT * FROM network_logs WHERE 1=1", scope, filter);
        qb.push(" ORDER BY timestamp DESC, id DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);
        let rows: Vec<NetworkLogRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(NetworkLogRow::into_entry).collect()
    }

    /// Case-insensitive substring search over path, query and bodies.
    pub async fn search(&self, scope: &Scope, q: &str, limit: i64) -> Result<Vec<NetworkLogEntry>> {
        let needle = format!("%{}%", q.replace('%', "\\%").replace('_', "\\_"));
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT * FROM network_logs WHERE (path LIKE ",
        );
        qb.push_bind(needle.clone());
        qb.push(" ESCAPE '\\' OR query LIKE ").push_bind(needle.clone());
        qb.push(" ESCAPE '\\' OR request_body LIKE ").push_bind(needle.clone());
        qb.push(" ESCAPE '\\' OR response_body LIKE ").push_bind(needle);
        qb.push(" ESCAPE '\\')");
        if let Some(tenant) = scope.tenant_id() {
            qb.push(" AND tenant_id = ").push_bind(tenant.to_string());
        }
        qb.push(" ORDER BY timestamp DESC LIMIT ").push_bind(limit);
        let rows: Vec<NetworkLogRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(NetworkLogRow::into_entry).collect()
    }

    /// Aggregate statistics over `[since, until]`.
    pub async fn stats(
        &self,
        scope: &Scope,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<NetworkStats> {
        let filter = NetworkLogFilter {
            since: Some(since),
            until: Some(until),
            ..Default::default()
        };

        let mut totals_qb = Self::filtered(
            "SELECT COUNT(*), COUNT(DISTINCT ip), COUNT(DISTINCT path), \
             COUNT(tunnel_detection) FROM network_logs WHERE 1=1",
            scope,
            &filter,
        );
        let (total_requests, unique_ips, unique_endpoints, tunnel_detections): (i64, i64, i64, i64) =
            totals_qb.build_query_as().fetch_one(&self.pool).await?;

        let mut status_qb = Self::filtered(
            "SELECT status, COUNT(*) FROM network_logs WHERE 1=1",
            scope,
            &filter,
        );
        status_qb.push(" GROUP BY status");
        let status_rows: Vec<(i64, i64)> =
            status_qb.build_query_as().fetch_all(&self.pool).await?;
        let status_counts = status_rows
            .into_iter()
            .map(|(status, n)| (status as u16, n))
            .collect();

        let mut times_qb = Self::filtered(
            "SELECT response_time_ms FROM network_logs WHERE 1=1",
            scope,
            &filter,
        );
        let mut times: Vec<f64> = times_qb.build_query_scalar().fetch_all(&self.pool).await?;
        times.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let avg = if times.is_empty() {
            0.0
        } else {
            times.iter().sum::<f64>() / times.len() as f64
        };

        Ok(NetworkStats {
            total_requests,
            unique_ips,
            unique_endpoints,
            tunnel_detections,
            status_counts,
            avg_response_time_ms: avg,
            p50_response_time_ms: percentile(&times, 50.0),
            p95_response_time_ms: percentile(&times, 95.0),
            p99_response_time_ms: percentile(&times, 99.0),
        })
    }

    /// Entries carrying a tunnel verdict at or above `min_confidence`.
    pub async fn list_tunnel_detections(
        &self,
        scope: &Scope,
        min_confidence: Confidence,
        limit: i64,
    ) -> Result<Vec<NetworkLogEntry>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT * FROM network_logs WHERE tunnel_detection IS NOT NULL",
        );
        if let Some(tenant) = scope.tenant_id() {
            qb.push(" AND tenant_id = ").push_bind(tenant.to_string());
        }
        qb.push(" ORDER BY timestamp DESC LIMIT ").push_bind(limit * 4);
        let rows: Vec<NetworkLogRow> = qb.build_query_as().fetch_all(&self.pool).await?;

        // Confidence ordering lives in the domain type, so filter after decode.
        let mut entries = Vec::new();
        for row in rows {
            let entry = row.into_entry()?;
            if entry
                .tunnel_detection
                .as_ref()
                .map(|v| v.confidence >= min_confidence)
                .unwrap_or(false)
            {
                entries.push(entry);
                if entries.len() as i64 >= limit {
                    break;
                }
            }
        }
        Ok(entries)
    }

    /// Export matching entries as `json` or `csv`.
    pub async fn export(
        &self,
        scope: &Scope,
        format: &str,
        filter: &NetworkLogFilter,
        limit: i64,
    ) -> Result<String> {
        let entries = self.list(scope, filter, limit, 0).await?;
        match format {
            "json" => Ok(serde_json::to_string_pretty(&entries)?),
            "csv" => {
                let mut out = String::from(
                    "request_id,timestamp,tenant_id,ip,method,path,query,status,response_time_ms,body_truncated\n",
                );
                for e in &entries {
                    out.push_str(&format!(
                        "{},{},{},{},{},{},{},{},{},{}\n",
                        csv_field(&e.request_id),
                        csv_field(&e.timestamp.to_rfc3339()),
                        csv_field(e.tenant_id.as_deref().unwrap_or("")),
                        csv_field(&e.ip),
                        csv_field(&e.method),
                        csv_field(&e.path),
                        csv_field(e.query.as_deref().unwrap_or("")),
                        e.status,
                        e.response_time_ms,
                        e.body_truncated,
                    ));
                }
                Ok(out)
            }
            other => Err(StoreError::validation(format!(
                "unsupported export format: '{}'",
                other
            ))),
        }
    }

    /// Delete entries older than `ttl_days`. Returns the number removed.
    pub async fn cleanup_old(&self, ttl_days: i64) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(ttl_days.max(0));
        let result = sqlx::query("DELETE FROM network_logs WHERE timestamp < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        let removed = result.rows_affected();
        if removed > 0 {
            tracing::info!("Network log retention removed {} entries", removed);
        }
        Ok(removed)
    }

    fn filtered<'a>(
        base: &str,
        scope: &'a Scope,
        filter: &'a NetworkLogFilter,
    ) -> QueryBuilder<'a, Sqlite> {
        let mut qb = QueryBuilder::<Sqlite>::new(base);
        if let Some(tenant) = scope.tenant_id() {
            qb.push(" AND tenant_id = ").push_bind(tenant.to_string());
        }
        if let Some(ip) = &filter.ip {
            qb.push(" AND ip = ").push_bind(ip.clone());
        }
        if let Some(method) = &filter.method {
            qb.push(" AND method = ").push_bind(method.clone());
        }
        if let Some(path) = &filter.path {
            qb.push(" AND path = ").push_bind(path.clone());
        }
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status as i64);
        }
        if let Some(since) = filter.since {
            qb.push(" AND timestamp >= ").push_bind(since);
        }
        if let Some(until) = filter.until {
            qb.push(" AND timestamp <= ").push_bind(until);
        }
        qb
    }
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p / 100.0) * (sorted.len() as f64 - 1.0);
    let low = rank.floor() as usize;
    let high = rank.ceil() as usize;
    if low == high {
        sorted[low]
    } else {
        let weight = rank - low as f64;
        sorted[low] * (1.0 - weight) + sorted[high] * weight
    }
}

fn csv_field(raw: &str) -> String {
    if raw.contains(',') || raw.contains('"') || raw.contains('\n') {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}
