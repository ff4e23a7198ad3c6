//! Scheduled-search persistence.
//!
//! Cron expressions are validated at write time; `next_run_at` is recomputed
//! on every state change and on every fire, always derived in the search's
//! timezone and stored UTC.

use crate::error::{Result, StoreError};
use crate::Scope;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, Pool, QueryBuilder, Sqlite};
use vigil_protocol::{Capability, CronSpec, ScheduledSearch};

/// Input for creating a scheduled search.
#[derive(Debug, Clone)]
pub struct NewScheduledSearch {
    pub tenant_id: String,
    pub name: String,
    pub description: Option<String>,
    pub capabilities: Vec<Capability>,
    pub target: String,
    pub config: Value,
    pub cron_expression: String,
    pub timezone: String,
    pub enabled: bool,
}

#[derive(Debug, FromRow)]
struct ScheduledSearchRow {
    id: String,
    tenant_id: String,
    name: String,
    description: Option<String>,
    capabilities: String,
    target: String,
    config: String,
    cron_expression: String,
    timezone: String,
    enabled: i64,
    last_run_at: Option<DateTime<Utc>>,
    next_run_at: Option<DateTime<Utc>>,
    run_count: i64,
    created_at: DateTime<Utc>,
}

impl ScheduledSearchRow {
    fn into_search(self) -> Result<ScheduledSearch> {
        let names: Vec<String> = serde_json::from_str(&self.capabilities)?;
        let capabilities = names
            .iter()
            .map(|n| n.parse().map_err(StoreError::decode))
            .collect::<Result<Vec<Capability>>>()?;
        Ok(ScheduledSearch {
            capabilities,
            config: serde_json::from_str(&self.config)?,
            enabled: self.enabled != 0,
            id: self.id,
            tenant_id: self.tenant_id,
            name: self.name,
            description: self.description,
            target: self.target,
            cron_expression: self.cron_expression,
            timezone: self.timezone,
            last_run_at: self.last_run_at,
            next_run_at: self.next_run_at,
            run_count: self.run_count,
            created_at: self.created_at,
        })
    }
}

pub struct ScheduledSearchStore {
    pool: Pool<Sqlite>,
}

impl ScheduledSearchStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Validate and insert. `next_run_at` is computed immediately for enabled
    /// searches.
    pub async fn create(&self, new: &NewScheduledSearch) -> Result<ScheduledSearch> {
        if new.capabilities.is_empty() {
            return Err(StoreError::validation(
                "scheduled search needs at least one capability",
            ));
        }
        let spec = CronSpec::parse(&new.cron_expression, &new.timezone)
            .map_err(|e| StoreError::validation(e.to_string()))?;
        let now = Utc::now();
        let next_run_at = if new.enabled { spec.next_after(now) } else { None };

        let id = uuid::Uuid::new_v4().to_string();
        let capability_names: Vec<&str> =
            new.capabilities.iter().map(|c| c.as_str()).collect();
        sqlx::query(
            r#"
            INSERT INTO scheduled_searches
                (id, tenant_id, name, description, capabilities, target, config,
                 cron_expression, timezone, enabled, last_run_at, next_run_at,
                 run_count, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, 0, ?)
            "#,
        )
        .bind(&id)
        .bind(&new.tenant_id)
        .bind(&new.name)
        .bind(&new.description)
        .bind(serde_json::to_string(&capability_names)?)
        .bind(&new.target)
        .bind(serde_json::to_string(&new.config)?)
        .bind(spec.expression())
        .bind(&new.timezone)
        .bind(new.enabled as i64)
        .bind(next_run_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get(&Scope::Admin, &id)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("scheduled search {}", id)))
    }

    pub async fn get(&self, scope: &Scope, id: &str) -> Result<Option<ScheduledSearch>> {
        let mut qb =
            QueryBuilder::<Sqlite>::new("SELECT * FROM scheduled_searches WHERE id = ");
        qb.push_bind(id.to_string());
        if let Some(tenant) = scope.tenant_id() {
            qb.push(" AND tenant_id = ").push_bind(tenant.to_string());
        }
        let row: Option<ScheduledSearchRow> =
            qb.build_query_as().fetch_optional(&self.pool).await?;
        row.map(ScheduledSearchRow::into_search).transpose()
    }

    pub async fn find_by_name(
        &self,
        tenant_id: &str,
        name: &str,
    ) -> Result<Option<ScheduledSearch>> {
        let row: Option<ScheduledSearchRow> = sqlx::query_as(
            "SELECT * FROM scheduled_searches WHERE tenant_id = ? AND name = ? LIMIT 1",
        )
        .bind(tenant_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ScheduledSearchRow::into_search).transpose()
    }

    pub async fn list(&self, scope: &Scope, limit: i64, offset: i64) -> Result<Vec<ScheduledSearch>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM scheduled_searches WHERE 1=1");
        if let Some(tenant) = scope.tenant_id() {
            qb.push(" AND tenant_id = ").push_bind(tenant.to_string());
        }
        qb.push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);
        let rows: Vec<ScheduledSearchRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(ScheduledSearchRow::into_search).collect()
    }

    /// Every enabled search, across all tenants. Scheduler startup/tick path.
    pub async fn list_enabled(&self) -> Result<Vec<ScheduledSearch>> {
        let rows: Vec<ScheduledSearchRow> =
            sqlx::query_as("SELECT * FROM scheduled_searches WHERE enabled = 1")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(ScheduledSearchRow::into_search).collect()
    }

    /// Replace the mutable definition fields. Revalidates cron and recomputes
    /// `next_run_at`.
    pub async fn update_definition(
        &self,
        id: &str,
        update: &NewScheduledSearch,
    ) -> Result<ScheduledSearch> {
        if update.capabilities.is_empty() {
            return Err(StoreError::validation(
                "scheduled search needs at least one capability",
            ));
        }
        let spec = CronSpec::parse(&update.cron_expression, &update.timezone)
            .map_err(|e| StoreError::validation(e.to_string()))?;
        let next_run_at = if update.enabled {
            spec.next_after(Utc::now())
        } else {
            None
        };
        let capability_names: Vec<&str> =
            update.capabilities.iter().map(|c| c.as_str()).collect();

        let result = sqlx::query(
            r#"
            UPDATE scheduled_searches
            SET name = ?, description = ?, capabilities = ?, target = ?, config = ?,
                cron_expression = ?, timezone = ?, enabled = ?, next_run_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&update.name)
        .bind(&update.description)
        .bind(serde_json::to_string(&capability_names)?)
        .bind(&update.target)
        .bind(serde_json::to_string(&update.config)?)
        .bind(spec.expression())
        .bind(&update.timezone)
        .bind(update.enabled as i64)
        .bind(next_run_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(format!("scheduled search {}", id)));
        }

        self.get(&Scope::Admin, id)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("scheduled search {}", id)))
    }

    /// Flip `enabled`; disabling clears `next_run_at`, enabling recomputes it.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let search = self
            .get(&Scope::Admin, id)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("scheduled search {}", id)))?;
        let next_run_at = if enabled {
            let spec = CronSpec::parse(&search.cron_expression, &search.timezone)
                .map_err(|e| StoreError::validation(e.to_string()))?;
            spec.next_after(Utc::now())
        } else {
            None
        };
        sqlx::query("UPDATE scheduled_searches SET enabled = ?, next_run_at = ? WHERE id = ?")
            .bind(enabled as i64)
            .bind(next_run_at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a fire: bump `run_count`, stamp `last_run_at`, advance
    /// `next_run_at`.
    pub async fn record_run(
        &self,
        id: &str,
        fired_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scheduled_searches
            SET last_run_at = ?, next_run_at = ?, run_count = run_count + 1
            WHERE id = ?
            "#,
        )
        .bind(fired_at)
        .bind(next_run_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Advance `next_run_at` without counting a run (skip path).
    pub async fn record_skip(&self, id: &str, next_run_at: Option<DateTime<Utc>>) -> Result<()> {
        sqlx::query("UPDATE scheduled_searches SET next_run_at = ? WHERE id = ?")
            .bind(next_run_at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, scope: &Scope, id: &str) -> Result<bool> {
        let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM scheduled_searches WHERE id = ");
        qb.push_bind(id.to_string());
        if let Some(tenant) = scope.tenant_id() {
            qb.push(" AND tenant_id = ").push_bind(tenant.to_string());
        }
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;
    use serde_json::json;

    fn nightly(tenant: &str, name: &str) -> NewScheduledSearch {
        NewScheduledSearch {
            tenant_id: tenant.to_string(),
            name: name.to_string(),
            description: None,
            capabilities: vec![Capability::EmailAudit, Capability::ExposureDiscovery],
            target: "example.com".to_string(),
            config: json!({}),
            cron_expression: "0 2 * * *".to_string(),
            timezone: "UTC".to_string(),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn create_computes_next_run() {
        let store = Store::connect_in_memory().await.unwrap();
        let searches = store.scheduled_searches();
        let search = searches.create(&nightly("t1", "nightly")).await.unwrap();
        assert!(search.enabled);
        assert!(search.next_run_at.unwrap() > Utc::now());
        assert_eq!(search.run_count, 0);
        assert_eq!(search.capabilities.len(), 2);
    }

    #[tokio::test]
    async fn create_rejects_bad_cron_and_empty_capabilities() {
        let store = Store::connect_in_memory().await.unwrap();
        let searches = store.scheduled_searches();

        let mut bad_cron = nightly("t1", "x");
        bad_cron.cron_expression = "not a cron".to_string();
        assert!(matches!(
            searches.create(&bad_cron).await.unwrap_err(),
            StoreError::Validation(_)
        ));

        let mut no_caps = nightly("t1", "y");
        no_caps.capabilities.clear();
        assert!(matches!(
            searches.create(&no_caps).await.unwrap_err(),
            StoreError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn disabling_clears_next_run() {
        let store = Store::connect_in_memory().await.unwrap();
        let searches = store.scheduled_searches();
        let search = searches.create(&nightly("t1", "nightly")).await.unwrap();

        searches.set_enabled(&search.id, false).await.unwrap();
        let got = searches.get(&Scope::Admin, &search.id).await.unwrap().unwrap();
        assert!(!got.enabled);
        assert!(got.next_run_at.is_none());

        searches.set_enabled(&search.id, true).await.unwrap();
        let got = searches.get(&Scope::Admin, &search.id).await.unwrap().unwrap();
        assert!(got.next_run_at.is_some());
    }

    #[tokio::test]
    async fn record_run_bumps_count_and_advances() {
        let store = Store::connect_in_memory().await.unwrap();
        let searches = store.scheduled_searches();
        let search = searches.create(&nightly("t1", "nightly")).await.unwrap();

        let fired = Utc::now();
        let next = fired + chrono::Duration::hours(24);
        searches.record_run(&search.id, fired, Some(next)).await.unwrap();

        let got = searches.get(&Scope::Admin, &search.id).await.unwrap().unwrap();
        assert_eq!(got.run_count, 1);
        assert_eq!(got.last_run_at.map(|t| t.timestamp()), Some(fired.timestamp()));
        assert!(got.next_run_at.unwrap() > fired);
    }
}
