//! Company profile persistence. At most one profile per tenant.

use crate::error::{Result, StoreError};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, Pool, Sqlite};
use vigil_protocol::{AutomationConfig, CompanyProfile};

#[derive(Debug, FromRow)]
struct CompanyRow {
    id: String,
    tenant_id: String,
    name: String,
    primary_domain: Option<String>,
    additional_domains: String,
    timezone: String,
    automation_config: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl CompanyRow {
    fn into_profile(self) -> Result<CompanyProfile> {
        let automation_config: Option<AutomationConfig> = match &self.automation_config {
            Some(raw) => Some(serde_json::from_str(raw)?),
            None => None,
        };
        Ok(CompanyProfile {
            additional_domains: serde_json::from_str(&self.additional_domains)?,
            automation_config,
            id: self.id,
            tenant_id: self.tenant_id,
            name: self.name,
            primary_domain: self.primary_domain,
            timezone: self.timezone,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

pub struct CompanyStore {
    pool: Pool<Sqlite>,
}

impl CompanyStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Insert or replace the tenant's profile, preserving `created_at` on
    /// replacement.
    pub async fn upsert(&self, profile: &CompanyProfile) -> Result<CompanyProfile> {
        let automation = profile
            .automation_config
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO company_profiles
                (id, tenant_id, name, primary_domain, additional_domains,
                 timezone, automation_config, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (tenant_id) DO UPDATE SET
                name = excluded.name,
                primary_domain = excluded.primary_domain,
                additional_domains = excluded.additional_domains,
                timezone = excluded.timezone,
                automation_config = excluded.automation_config,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&profile.id)
        .bind(&profile.tenant_id)
        .bind(&profile.name)
        .bind(&profile.primary_domain)
        .bind(serde_json::to_string(&profile.additional_domains)?)
        .bind(&profile.timezone)
        .bind(automation)
        .bind(profile.created_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get(&profile.tenant_id)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("profile for {}", profile.tenant_id)))
    }

    pub async fn get(&self, tenant_id: &str) -> Result<Option<CompanyProfile>> {
        let row: Option<CompanyRow> =
            sqlx::query_as("SELECT * FROM company_profiles WHERE tenant_id = ?")
                .bind(tenant_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(CompanyRow::into_profile).transpose()
    }

    pub async fn delete(&self, tenant_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM company_profiles WHERE tenant_id = ?")
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
