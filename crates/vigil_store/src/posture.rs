//! Per-tenant posture score ledger.
//!
//! Post-processing records one score per scan; the positive scorer compares
//! against the previous entry to detect an improvement trend.

use crate::error::Result;
use chrono::Utc;
use sqlx::{Pool, Sqlite};

pub struct PostureStore {
    pool: Pool<Sqlite>,
}

impl PostureStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// The most recently recorded score for a tenant.
    pub async fn latest(&self, tenant_id: &str) -> Result<Option<f64>> {
        let score: Option<f64> = sqlx::query_scalar(
            "SELECT score FROM posture_scores WHERE tenant_id = ? \
             ORDER BY computed_at DESC, id DESC LIMIT 1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(score)
    }

    pub async fn record(&self, tenant_id: &str, score: f64) -> Result<()> {
        sqlx::query(
            "INSERT INTO posture_scores (tenant_id, score, computed_at) VALUES (?, ?, ?)",
        )
        .bind(tenant_id)
        .bind(score)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
