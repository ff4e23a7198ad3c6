//! SQLite persistence for the Vigil control plane.
//!
//! One pool, several focused stores. All tenant-owned tables are read through
//! a [`Scope`]: a tenant scope filters rows to that tenant, the admin scope
//! reads across tenants. Writers always carry an explicit tenant.

pub mod activity;
pub mod company;
pub mod error;
pub mod findings;
pub mod jobs;
pub mod network;
pub mod posture;
pub mod scheduled;
pub mod schema;

pub use activity::ActivityLogStore;
pub use company::CompanyStore;
pub use error::{Result, StoreError};
pub use findings::{FindingFilter, FindingStore, NewFinding};
pub use jobs::{JobFilter, JobPatch, JobStore};
pub use network::{NetworkLogFilter, NetworkLogStore, NetworkStats};
pub use posture::PostureStore;
pub use scheduled::{NewScheduledSearch, ScheduledSearchStore};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;

/// Tenancy boundary applied to reads.
#[derive(Debug, Clone)]
pub enum Scope {
    /// Rows owned by one tenant.
    Tenant(String),
    /// Cross-tenant reads (admin role).
    Admin,
}

impl Scope {
    pub fn tenant(id: impl Into<String>) -> Self {
        Scope::Tenant(id.into())
    }

    /// The tenant filter to apply, or `None` for admin.
    pub fn tenant_id(&self) -> Option<&str> {
        match self {
            Scope::Tenant(id) => Some(id),
            Scope::Admin => None,
        }
    }
}

/// Handle bundling every store over one connection pool.
#[derive(Debug, Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    /// Connect to `url` (e.g. `sqlite:/var/lib/vigil/state.db`) and run the
    /// schema bootstrap.
    pub async fn connect(url: &str) -> Result<Self> {
        // An in-memory database exists per connection; a wider pool would
        // hand out empty databases.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        schema::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory store for tests and ephemeral runs.
    ///
    /// A single pooled connection keeps every handle on the same database.
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        schema::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub fn jobs(&self) -> JobStore {
        JobStore::new(self.pool.clone())
    }

    pub fn findings(&self) -> FindingStore {
        FindingStore::new(self.pool.clone())
    }

    pub fn scheduled_searches(&self) -> ScheduledSearchStore {
        ScheduledSearchStore::new(self.pool.clone())
    }

    pub fn company(&self) -> CompanyStore {
        CompanyStore::new(self.pool.clone())
    }

    pub fn network_logs(&self) -> NetworkLogStore {
        NetworkLogStore::new(self.pool.clone())
    }

    pub fn activity(&self) -> ActivityLogStore {
        ActivityLogStore::new(self.pool.clone())
    }

    pub fn posture(&self) -> PostureStore {
        PostureStore::new(self.pool.clone())
    }
}
