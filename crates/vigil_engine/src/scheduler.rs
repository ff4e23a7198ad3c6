//! Cron-driven expansion of scheduled searches into jobs.
//!
//! A single timer loop polls for due searches and materialises one job per
//! selected capability at background priority. Misfires coalesce: however
//! many fires accumulated while the loop was down or busy, at most one
//! materialisation happens, and fires older than the grace window are
//! skipped outright with a missed-fire log.

use crate::metrics::METRICS;
use crate::orchestrator::Orchestrator;
use crate::EngineError;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use vigil_protocol::{CancelSignal, Capability, CronSpec, JobPriority, ScheduledSearch};
use vigil_store::{NewScheduledSearch, Scope, Store};

/// Fires older than this are skipped instead of coalesced (seconds).
pub const MISFIRE_GRACE_SECS: i64 = 300;
/// Default poll interval.
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    store: Store,
    orchestrator: Orchestrator,
    tick: Duration,
    /// Searches currently materialising; enforces one concurrent
    /// materialisation per search.
    in_flight: Mutex<HashSet<String>>,
    shutdown: CancelSignal,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(store: Store, orchestrator: Orchestrator, tick: Duration) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                orchestrator,
                tick,
                in_flight: Mutex::new(HashSet::new()),
                shutdown: CancelSignal::new(),
                handle: Mutex::new(None),
            }),
        }
    }

    /// Arm triggers for every enabled search and start the timer loop.
    ///
    /// Searches with no stored `next_run_at` get one computed now; stored
    /// values are kept so downtime is visible to the misfire policy.
    pub async fn start(&self) -> Result<(), EngineError> {
        let searches = self.inner.store.scheduled_searches();
        let enabled = searches.list_enabled().await?;
        let count = enabled.len();
        for search in enabled {
            if search.next_run_at.is_none() {
                match CronSpec::parse(&search.cron_expression, &search.timezone) {
                    Ok(spec) => {
                        searches
                            .record_skip(&search.id, spec.next_after(Utc::now()))
                            .await?;
                    }
                    Err(err) => {
                        tracing::error!(
                            "Scheduled search {} has an invalid trigger: {}",
                            search.id,
                            err
                        );
                    }
                }
            }
        }
        tracing::info!("Scheduler armed with {} enabled searches", count);

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(inner.tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            while !inner.shutdown.is_cancelled() {
                interval.tick().await;
                if let Err(err) = tick(&inner).await {
                    tracing::error!("Scheduler tick failed: {}", err);
                }
            }
            tracing::info!("Scheduler stopped");
        });
        *self.inner.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handle = self
            .inner
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                abort.abort();
            }
        }
    }

    /// Create a search and arm it (the loop sees it on the next tick).
    pub async fn add_search(
        &self,
        new: &NewScheduledSearch,
    ) -> Result<ScheduledSearch, EngineError> {
        let search = self.inner.store.scheduled_searches().create(new).await?;
        tracing::info!(
            "Scheduled search '{}' added for tenant {} ({})",
            search.name,
            search.tenant_id,
            search.cron_expression
        );
        Ok(search)
    }

    /// Replace a search's definition. Idempotent: re-applying the same
    /// definition leaves the trigger unchanged apart from the derivable
    /// `next_run_at`.
    pub async fn update_search(
        &self,
        id: &str,
        update: &NewScheduledSearch,
    ) -> Result<ScheduledSearch, EngineError> {
        let search = self
            .inner
            .store
            .scheduled_searches()
            .update_definition(id, update)
            .await?;
        Ok(search)
    }

    /// Remove a search. Returns false when it did not exist.
    pub async fn remove_search(&self, scope: &Scope, id: &str) -> Result<bool, EngineError> {
        Ok(self.inner.store.scheduled_searches().delete(scope, id).await?)
    }

    /// Manually materialise a search now, ignoring its trigger.
    pub async fn trigger(&self, id: &str) -> Result<usize, EngineError> {
        let search = self
            .inner
            .store
            .scheduled_searches()
            .get(&Scope::Admin, id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("scheduled search {}", id)))?;
        materialise(&self.inner, &search, Utc::now(), 0).await
    }
}

async fn tick(inner: &Arc<SchedulerInner>) -> Result<(), EngineError> {
    let now = Utc::now();
    let searches = inner.store.scheduled_searches();
    let enabled = searches.list_enabled().await?;

    for search in enabled {
        let Some(next_run_at) = search.next_run_at else {
            continue;
        };
        if next_run_at > now {
            continue;
        }

        {
            let mut in_flight = inner.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if !in_flight.insert(search.id.clone()) {
                continue;
            }
        }
        let result = fire(inner, &search, next_run_at, now).await;
        {
            let mut in_flight = inner.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            in_flight.remove(&search.id);
        }
        if let Err(err) = result {
            tracing::error!("Scheduled search {} fire failed: {}", search.id, err);
        }
    }
    Ok(())
}

/// Handle one due search: coalesce accumulated fires, apply the grace
/// window, materialise at most once.
async fn fire(
    inner: &Arc<SchedulerInner>,
    search: &ScheduledSearch,
    next_run_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<(), EngineError> {
    let searches = inner.store.scheduled_searches();
    let spec = match CronSpec::parse(&search.cron_expression, &search.timezone) {
        Ok(spec) => spec,
        Err(err) => {
            tracing::error!(
                "Scheduled search {} has an invalid cron expression: {}",
                search.id,
                err
            );
            searches.record_skip(&search.id, None).await?;
            return Ok(());
        }
    };

    let (due_count, latest_due) = spec.due_in_window(next_run_at, now);
    let latest_due = latest_due.unwrap_or(next_run_at);
    let next = spec.next_after(now);

    let lateness = (now - latest_due).num_seconds();
    if lateness > MISFIRE_GRACE_SECS {
        METRICS.add(&METRICS.scheduler_misfires, due_count.max(1));
        tracing::warn!(
            "Scheduled search '{}' missed {} fires (latest {}s late, grace {}s); skipping",
            search.name,
            due_count.max(1),
            lateness,
            MISFIRE_GRACE_SECS
        );
        searches.record_skip(&search.id, next).await?;
        return Ok(());
    }

    let missed = due_count.saturating_sub(1);
    if missed > 0 {
        METRICS.add(&METRICS.scheduler_misfires, missed);
        tracing::warn!(
            "Scheduled search '{}' coalesced {} fires (missed={})",
            search.name,
            due_count,
            missed
        );
    }

    let created = materialise(inner, search, now, missed).await?;
    if created == 0 {
        tracing::error!("Scheduled search {} created no jobs", search.id);
    }
    searches.record_run(&search.id, now, next).await?;
    METRICS.inc(&METRICS.scheduler_fires);
    Ok(())
}

/// One job per selected capability, at background priority.
async fn materialise(
    inner: &Arc<SchedulerInner>,
    search: &ScheduledSearch,
    fired_at: DateTime<Utc>,
    missed: u64,
) -> Result<usize, EngineError> {
    let mut created = 0usize;
    for capability in &search.capabilities {
        let config = merged_config(search, *capability, fired_at, missed);
        match inner
            .orchestrator
            .create_job(
                &search.tenant_id,
                *capability,
                &search.target,
                config,
                JobPriority::Background,
            )
            .await
        {
            Ok(job) => {
                created += 1;
                tracing::info!(
                    "Scheduled search '{}' materialised job {} ({})",
                    search.name,
                    job.id,
                    capability
                );
            }
            Err(err) => {
                tracing::error!(
                    "Scheduled search '{}' could not create a {} job: {}",
                    search.name,
                    capability,
                    err
                );
            }
        }
    }
    Ok(created)
}

/// The capability-specific slice of the search config, stamped with
/// scheduler metadata.
fn merged_config(
    search: &ScheduledSearch,
    capability: Capability,
    fired_at: DateTime<Utc>,
    missed: u64,
) -> Value {
    let mut config = match &search.config {
        Value::Object(map) => match map.get(capability.as_str()) {
            Some(Value::Object(slice)) => slice.clone(),
            Some(other) => {
                let mut wrapped = Map::new();
                wrapped.insert("value".to_string(), other.clone());
                wrapped
            }
            None => map.clone(),
        },
        _ => Map::new(),
    };

    let mut metadata = Map::new();
    metadata.insert("scheduled_search_id".to_string(), json!(search.id));
    metadata.insert(
        "scheduled_search_name".to_string(),
        json!(search.name),
    );
    metadata.insert("capability".to_string(), json!(capability.as_str()));
    metadata.insert("fired_at".to_string(), json!(fired_at));
    if missed > 0 {
        metadata.insert("missed_fires".to_string(), json!(missed));
    }
    config.insert("metadata".to_string(), Value::Object(metadata));
    Value::Object(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn search_with_config(config: Value) -> ScheduledSearch {
        ScheduledSearch {
            id: "s1".to_string(),
            tenant_id: "t1".to_string(),
            name: "nightly".to_string(),
            description: None,
            capabilities: vec![Capability::EmailAudit],
            target: "example.com".to_string(),
            config,
            cron_expression: "0 2 * * *".to_string(),
            timezone: "UTC".to_string(),
            enabled: true,
            last_run_at: None,
            next_run_at: None,
            run_count: 0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn merged_config_takes_capability_slice() {
        let search = search_with_config(json!({
            "email_audit": {"depth": 2},
            "investigation": {"depth": 9},
        }));
        let merged = merged_config(&search, Capability::EmailAudit, Utc::now(), 0);
        assert_eq!(merged["depth"], 2);
        assert_eq!(merged["metadata"]["scheduled_search_id"], "s1");
        assert_eq!(merged["metadata"]["capability"], "email_audit");
        assert!(merged["metadata"].get("missed_fires").is_none());
    }

    #[test]
    fn merged_config_falls_back_to_whole_config() {
        let search = search_with_config(json!({"keywords": ["acme"]}));
        let merged = merged_config(&search, Capability::EmailAudit, Utc::now(), 3);
        assert_eq!(merged["keywords"][0], "acme");
        assert_eq!(merged["metadata"]["missed_fires"], 3);
    }
}
