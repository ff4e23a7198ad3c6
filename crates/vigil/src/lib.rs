//! Vigil daemon wiring: configuration, store, engine, scheduler, gatekeeper.

pub mod probes;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use vigil_engine::{Orchestrator, Scheduler};
use vigil_netguard::{BlockRegistry, GateConfig, Gatekeeper, RateLimiter, TunnelDetector};
use vigil_protocol::{Capability, EngineConfig, EventBus};
use vigil_store::Store;

/// Command-line arguments. Every flag falls back to the corresponding
/// environment variable, then to the built-in default.
#[derive(clap::Parser, Debug)]
#[command(name = "vigil", about = "Vigil security-intelligence control plane")]
pub struct VigilArgs {
    /// Store URL (sqlite:path or sqlite::memory:)
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite:vigil.db")]
    pub database_url: String,

    /// Scheduler poll interval in seconds
    #[arg(long, default_value_t = 1)]
    pub scheduler_tick_secs: u64,

    /// Disable the cron scheduler
    #[arg(long)]
    pub no_scheduler: bool,

    /// Verbose console logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// How often the janitor sweeps retention and logs counters.
const JANITOR_INTERVAL_SECS: u64 = 60 * 60;

/// Everything a running daemon owns.
pub struct Runtime {
    pub store: Store,
    pub events: EventBus,
    pub orchestrator: Orchestrator,
    pub scheduler: Option<Scheduler>,
    pub gatekeeper: Gatekeeper,
    config: EngineConfig,
    janitor: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Wire the full control plane. Startup is explicit: nothing here spawns
/// workers until [`Runtime::start`].
pub async fn build_runtime(args: &VigilArgs) -> Result<Runtime> {
    let mut config = EngineConfig::from_env();
    config.database_url = args.database_url.clone();

    let store = Store::connect(&config.database_url)
        .await
        .with_context(|| format!("Failed to open store at {}", config.database_url))?;
    let events = EventBus::default();

    let orchestrator = Orchestrator::new(store.clone(), config.clone(), events.clone());
    for capability in Capability::ALL {
        orchestrator.register_executor(capability, probes::probe_executor(capability));
    }

    let scheduler = if args.no_scheduler {
        None
    } else {
        Some(Scheduler::new(
            store.clone(),
            orchestrator.clone(),
            Duration::from_secs(args.scheduler_tick_secs.max(1)),
        ))
    };

    let gatekeeper = Gatekeeper::new(
        Arc::new(BlockRegistry::new()),
        Arc::new(RateLimiter::new(
            config.rate_limit_ip,
            config.rate_limit_endpoint,
        )),
        Arc::new(TunnelDetector::default()),
        store.clone(),
        events.clone(),
        GateConfig::from_engine(&config),
    );

    Ok(Runtime {
        store,
        events,
        orchestrator,
        scheduler,
        gatekeeper,
        config,
        janitor: std::sync::Mutex::new(None),
    })
}

impl Runtime {
    /// Launch worker pools, the scheduler loop, and the retention janitor.
    pub async fn start(&self) -> Result<()> {
        self.orchestrator
            .start()
            .await
            .context("Failed to start orchestrator")?;
        if let Some(scheduler) = &self.scheduler {
            scheduler.start().await.context("Failed to start scheduler")?;
        }

        let store = self.store.clone();
        let ttl_days = self.config.network_log_ttl_days;
        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(JANITOR_INTERVAL_SECS));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match store.network_logs().cleanup_old(ttl_days).await {
                    Ok(removed) if removed > 0 => {
                        tracing::info!("Janitor removed {} expired network logs", removed);
                    }
                    Ok(_) => {}
                    Err(err) => tracing::warn!("Network log cleanup failed: {}", err),
                }
                tracing::info!("{}", vigil_engine::METRICS.snapshot().summary());
            }
        });
        *self.janitor.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        tracing::info!("Vigil control plane started");
        Ok(())
    }

    /// Stop the scheduler, drain workers, log final counters.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.janitor.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        if let Some(scheduler) = &self.scheduler {
            scheduler.shutdown().await;
        }
        self.orchestrator.shutdown().await;
        tracing::info!("{}", vigil_engine::METRICS.snapshot().summary());
    }
}
