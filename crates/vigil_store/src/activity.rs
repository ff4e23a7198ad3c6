//! Per-user append-only action trail.

use crate::error::Result;
use crate::Scope;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, Pool, QueryBuilder, Sqlite};
use vigil_protocol::ActivityEntry;

#[derive(Debug, FromRow)]
struct ActivityRow {
    id: String,
    tenant_id: String,
    action: String,
    resource_type: Option<String>,
    resource_id: Option<String>,
    ip_address: Option<String>,
    user_agent: Option<String>,
    metadata: String,
    timestamp: DateTime<Utc>,
}

impl ActivityRow {
    fn into_entry(self) -> Result<ActivityEntry> {
        Ok(ActivityEntry {
            metadata: serde_json::from_str(&self.metadata)?,
            id: self.id,
            tenant_id: self.tenant_id,
            action: self.action,
            resource_type: self.resource_type,
            resource_id: self.resource_id,
            ip_address: self.ip_address,
            user_agent: self.user_agent,
            timestamp: self.timestamp,
        })
    }
}

pub struct ActivityLogStore {
    pool: Pool<Sqlite>,
}

impl ActivityLogStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Append one action. Returns the entry id.
    pub async fn record(
        &self,
        tenant_id: &str,
        action: &str,
        resource_type: Option<&str>,
        resource_id: Option<&str>,
        ip_address: Option<&str>,
        user_agent: Option<&str>,
        metadata: Value,
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO activity_log
                (id, tenant_id, action, resource_type, resource_id,
                 ip_address, user_agent, metadata, timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(tenant_id)
        .bind(action)
        .bind(resource_type)
        .bind(resource_id)
        .bind(ip_address)
        .bind(user_agent)
        .bind(serde_json::to_string(&metadata)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn list(
        &self,
        scope: &Scope,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ActivityEntry>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM activity_log WHERE 1=1");
        if let Some(tenant) = scope.tenant_id() {
            qb.push(" AND tenant_id = ").push_bind(tenant.to_string());
        }
        qb.push(" ORDER BY timestamp DESC, id DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);
        let rows: Vec<ActivityRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(ActivityRow::into_entry).collect()
    }
}
