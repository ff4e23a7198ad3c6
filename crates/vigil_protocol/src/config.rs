//! Engine configuration, resolved from the environment.

use crate::types::{Capability, Confidence};
use std::collections::HashMap;

/// Default worker pool size per capability.
pub const DEFAULT_WORKERS_PER_CAPABILITY: usize = 4;
/// Default per-tenant in-flight job cap.
pub const DEFAULT_TENANT_INFLIGHT_CAP: usize = 8;
/// Default retry budget for transient executor failures.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Queue length at which created jobs are stamped with a backlog warning.
pub const DEFAULT_QUEUE_SOFT_LIMIT: usize = 1_000;
/// Queue length at which job creation is refused as overloaded.
pub const DEFAULT_QUEUE_HARD_LIMIT: usize = 10_000;
/// Default executor timeout (seconds).
pub const DEFAULT_EXECUTION_TIMEOUT_SECS: u64 = 30 * 60;
/// Grace period after a cancel trip before a job is abandoned (seconds).
pub const CANCEL_GRACE_SECS: u64 = 5;

/// Resolved engine + gatekeeper configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Store connection URL (`sqlite:...`).
    pub database_url: String,
    /// Worker pool size per capability; capabilities absent here use
    /// [`DEFAULT_WORKERS_PER_CAPABILITY`]. Minimum 1.
    pub workers: HashMap<Capability, usize>,
    pub tenant_inflight_cap: usize,
    pub max_retries: u32,
    /// Exponential retry backoff base (milliseconds). Doubles per attempt,
    /// jittered ±25%, capped below.
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_cap_ms: u64,
    pub queue_soft_limit: usize,
    pub queue_hard_limit: usize,
    /// Executor timeout per capability (seconds); default applies otherwise.
    pub execution_timeout_secs: HashMap<Capability, u64>,
    pub default_execution_timeout_secs: u64,
    /// Per-phase dark-web executor timeouts, passed through to the executor
    /// via its config document.
    pub darkweb_discovery_timeout_secs: u64,
    pub darkweb_crawl_timeout_secs: u64,

    // Network gatekeeping.
    pub rate_limit_ip: usize,
    pub rate_limit_endpoint: usize,
    pub network_log_ttl_days: i64,
    pub enable_blocking: bool,
    pub enable_logging: bool,
    pub enable_tunnel_detection: bool,
    pub tunnel_confidence_threshold: Confidence,
    pub max_body_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            workers: HashMap::new(),
            tenant_inflight_cap: DEFAULT_TENANT_INFLIGHT_CAP,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_base_ms: 2_000,
            retry_backoff_cap_ms: 120_000,
            queue_soft_limit: DEFAULT_QUEUE_SOFT_LIMIT,
            queue_hard_limit: DEFAULT_QUEUE_HARD_LIMIT,
            execution_timeout_secs: HashMap::new(),
            default_execution_timeout_secs: DEFAULT_EXECUTION_TIMEOUT_SECS,
            darkweb_discovery_timeout_secs: 300,
            darkweb_crawl_timeout_secs: 600,
            rate_limit_ip: 100,
            rate_limit_endpoint: 60,
            network_log_ttl_days: 30,
            enable_blocking: true,
            enable_logging: true,
            enable_tunnel_detection: true,
            tunnel_confidence_threshold: Confidence::Medium,
            max_body_size: 1024 * 1024,
        }
    }
}

impl EngineConfig {
    /// Resolve configuration from the process environment, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(url) = std::env::var("DATABASE_URL") {
            if !url.is_empty() {
                cfg.database_url = url;
            }
        }
        if let Some(n) = env_usize("DARKWEB_MAX_WORKERS") {
            cfg.workers
                .insert(Capability::DarkwebIntelligence, n.max(1));
        }
        if let Some(n) = env_u64("DARKWEB_DISCOVERY_TIMEOUT") {
            cfg.darkweb_discovery_timeout_secs = n;
        }
        if let Some(n) = env_u64("DARKWEB_CRAWL_TIMEOUT") {
            cfg.darkweb_crawl_timeout_secs = n;
        }
        if let Some(n) = env_usize("NETWORK_RATE_LIMIT_IP") {
            cfg.rate_limit_ip = n;
        }
        if let Some(n) = env_usize("NETWORK_RATE_LIMIT_ENDPOINT") {
            cfg.rate_limit_endpoint = n;
        }
        if let Some(n) = env_u64("NETWORK_LOG_TTL_DAYS") {
            cfg.network_log_ttl_days = n as i64;
        }
        if let Some(b) = env_bool("NETWORK_ENABLE_BLOCKING") {
            cfg.enable_blocking = b;
        }
        if let Some(b) = env_bool("NETWORK_ENABLE_LOGGING") {
            cfg.enable_logging = b;
        }
        if let Some(b) = env_bool("NETWORK_ENABLE_TUNNEL_DETECTION") {
            cfg.enable_tunnel_detection = b;
        }
        if let Ok(raw) = std::env::var("NETWORK_TUNNEL_CONFIDENCE_THRESHOLD") {
            if let Ok(level) = raw.parse() {
                cfg.tunnel_confidence_threshold = level;
            }
        }
        if let Some(n) = env_usize("NETWORK_MAX_BODY_SIZE") {
            cfg.max_body_size = n;
        }

        cfg
    }

    /// Worker pool size for a capability (minimum 1).
    pub fn workers_for(&self, capability: Capability) -> usize {
        self.workers
            .get(&capability)
            .copied()
            .unwrap_or(DEFAULT_WORKERS_PER_CAPABILITY)
            .max(1)
    }

    /// Executor timeout for a capability (seconds).
    pub fn timeout_for(&self, capability: Capability) -> u64 {
        self.execution_timeout_secs
            .get(&capability)
            .copied()
            .unwrap_or(self.default_execution_timeout_secs)
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok()?.trim().parse().ok()
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.trim().parse().ok()
}

fn env_bool(key: &str) -> Option<bool> {
    match std::env::var(key).ok()?.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
