//! Sliding-window rate limiting, per IP and per (IP, endpoint).
//!
//! Windows are in-memory and lost on restart, which is acceptable: limits
//! re-establish within one window. Idle keys are swept so the key space stays
//! bounded.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use vigil_protocol::RateDecision;

/// Window length.
pub const WINDOW: Duration = Duration::from_secs(60);
/// Keys untouched for this long are evicted.
const IDLE_EVICTION: Duration = Duration::from_secs(10 * 60);
/// Sweep idle keys at most this often.
const GC_INTERVAL: Duration = Duration::from_secs(60);

struct Window {
    samples: VecDeque<Instant>,
    last_seen: Instant,
}

impl Window {
    fn new(now: Instant) -> Self {
        Self {
            samples: VecDeque::new(),
            last_seen: now,
        }
    }

    /// Drop samples older than the window and return the surviving count.
    fn evict_and_count(&mut self, now: Instant) -> usize {
        while let Some(front) = self.samples.front() {
            if now.duration_since(*front) > WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        self.samples.len()
    }
}

struct LimiterState {
    ip_windows: HashMap<String, Window>,
    endpoint_windows: HashMap<String, Window>,
    last_gc: Instant,
}

/// Process-wide sliding-window rate limiter.
pub struct RateLimiter {
    state: Mutex<LimiterState>,
    ip_limit: usize,
    endpoint_limit: usize,
}

impl RateLimiter {
    pub fn new(ip_limit: usize, endpoint_limit: usize) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                ip_windows: HashMap::new(),
                endpoint_windows: HashMap::new(),
                last_gc: Instant::now(),
            }),
            ip_limit,
            endpoint_limit,
        }
    }

    /// Check and account for one request.
    ///
    /// The IP window is evaluated first, then the (IP, endpoint) window;
    /// only an allowed request is appended to both.
    pub fn check(&self, ip: &str, endpoint: &str) -> RateDecision {
        self.check_at(ip, endpoint, Instant::now())
    }

    /// Clock-injected variant used by tests.
    pub fn check_at(&self, ip: &str, endpoint: &str, now: Instant) -> RateDecision {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.maybe_gc(now);

        let endpoint_key = format!("{}:{}", ip, endpoint);

        let ip_current = state
            .ip_windows
            .entry(ip.to_string())
            .or_insert_with(|| Window::new(now))
            .evict_and_count(now);
        if ip_current >= self.ip_limit {
            return RateDecision {
                allowed: false,
                current: ip_current,
                limit: self.ip_limit,
                retry_after: Some(WINDOW.as_secs()),
                reason: Some(format!(
                    "IP rate limit exceeded ({}/{} requests per minute)",
                    ip_current, self.ip_limit
                )),
            };
        }

        let endpoint_current = state
            .endpoint_windows
            .entry(endpoint_key.clone())
            .or_insert_with(|| Window::new(now))
            .evict_and_count(now);
        if endpoint_current >= self.endpoint_limit {
            return RateDecision {
                allowed: false,
                current: endpoint_current,
                limit: self.endpoint_limit,
                retry_after: Some(WINDOW.as_secs()),
                reason: Some(format!(
                    "Endpoint rate limit exceeded ({}/{} requests per minute)",
                    endpoint_current, self.endpoint_limit
                )),
            };
        }

        let ip_window = state
            .ip_windows
            .get_mut(ip)
            .expect("ip window inserted above");
        ip_window.samples.push_back(now);
        ip_window.last_seen = now;
        let endpoint_window = state
            .endpoint_windows
            .get_mut(&endpoint_key)
            .expect("endpoint window inserted above");
        endpoint_window.samples.push_back(now);
        endpoint_window.last_seen = now;

        RateDecision {
            allowed: true,
            current: (ip_current + 1).max(endpoint_current + 1),
            limit: self.ip_limit.max(self.endpoint_limit),
            retry_after: None,
            reason: None,
        }
    }

    /// Current usage snapshot without accounting a request.
    pub fn status(&self, ip: &str, endpoint: Option<&str>) -> (usize, usize, Option<usize>) {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let ip_current = state
            .ip_windows
            .get_mut(ip)
            .map(|w| w.evict_and_count(now))
            .unwrap_or(0);
        let endpoint_current = endpoint.map(|e| {
            let key = format!("{}:{}", ip, e);
            state
                .endpoint_windows
                .get_mut(&key)
                .map(|w| w.evict_and_count(now))
                .unwrap_or(0)
        });
        (ip_current, self.ip_limit, endpoint_current)
    }

    /// Number of live keys; observability hook.
    pub fn tracked_keys(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.ip_windows.len() + state.endpoint_windows.len()
    }
}

impl LimiterState {
    fn maybe_gc(&mut self, now: Instant) {
        if now.duration_since(self.last_gc) < GC_INTERVAL {
            return;
        }
        self.last_gc = now;
        self.ip_windows
            .retain(|_, w| now.duration_since(w.last_seen) < IDLE_EVICTION);
        self.endpoint_windows
            .retain(|_, w| now.duration_since(w.last_seen) < IDLE_EVICTION);
    }
}
