//! The inline request pipeline: block evaluation, rate limiting, audit
//! capture, tunnel analysis, event broadcast.
//!
//! Ordering per request: health bypass, IP block, endpoint block, pattern
//! block, rate limit, inner handler, then deferred capture + analysis. The
//! pipeline is observational: internal failures log and fail open rather
//! than failing the request.

use crate::block::{BlockRegistry, RequestShape};
use crate::ratelimit::RateLimiter;
use crate::sanitize::{sanitize_headers, truncate_body};
use crate::tunnel::{RequestSample, TunnelDetector};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use vigil_protocol::{Confidence, EngineEvent, EventBus, NetworkLogEntry};
use vigil_store::Store;

/// Paths that bypass the entire pipeline.
const HEALTH_PATHS: &[&str] = &["/health", "/api/health"];

/// Gatekeeper behaviour toggles.
#[derive(Debug, Clone)]
pub struct GateConfig {
    pub enable_blocking: bool,
    pub enable_logging: bool,
    pub enable_tunnel_detection: bool,
    pub min_confidence: Confidence,
    pub max_body_size: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            enable_blocking: true,
            enable_logging: true,
            enable_tunnel_detection: true,
            min_confidence: Confidence::Medium,
            max_body_size: 1024 * 1024,
        }
    }
}

impl GateConfig {
    pub fn from_engine(config: &vigil_protocol::EngineConfig) -> Self {
        Self {
            enable_blocking: config.enable_blocking,
            enable_logging: config.enable_logging,
            enable_tunnel_detection: config.enable_tunnel_detection,
            min_confidence: config.tunnel_confidence_threshold,
            max_body_size: config.max_body_size,
        }
    }
}

/// An inbound request, transport-agnostic.
#[derive(Debug, Clone)]
pub struct GateRequest {
    pub request_id: String,
    pub tenant_id: Option<String>,
    pub ip: String,
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl GateRequest {
    pub fn new(ip: impl Into<String>, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            tenant_id: None,
            ip: ip.into(),
            method: method.into(),
            path: path.into(),
            query: None,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    fn user_agent(&self) -> Option<String> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("user-agent"))
            .map(|(_, value)| value.clone())
    }

    fn header_bytes(&self) -> usize {
        self.headers
            .iter()
            .map(|(name, value)| name.len() + value.len())
            .sum()
    }
}

/// The response shape captured into the audit log.
#[derive(Debug, Clone)]
pub struct GateResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl GateResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: String::new(),
        }
    }
}

/// Outcome of the pre-handler stages.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Allow,
    Deny {
        status: u16,
        reason: String,
        retry_after: Option<u64>,
    },
}

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GateDecision::Allow)
    }

    fn into_response(self) -> GateResponse {
        match self {
            GateDecision::Allow => GateResponse::new(200),
            GateDecision::Deny {
                status,
                reason,
                retry_after,
            } => {
                let mut response = GateResponse::new(status);
                if let Some(secs) = retry_after {
                    response
                        .headers
                        .push(("Retry-After".to_string(), secs.to_string()));
                }
                response.body = reason;
                response
            }
        }
    }
}

/// The composed pipeline.
#[derive(Clone)]
pub struct Gatekeeper {
    blocks: Arc<BlockRegistry>,
    limiter: Arc<RateLimiter>,
    detector: Arc<TunnelDetector>,
    store: Store,
    events: EventBus,
    config: GateConfig,
}

impl Gatekeeper {
    pub fn new(
        blocks: Arc<BlockRegistry>,
        limiter: Arc<RateLimiter>,
        detector: Arc<TunnelDetector>,
        store: Store,
        events: EventBus,
        config: GateConfig,
    ) -> Self {
        Self {
            blocks,
            limiter,
            detector,
            store,
            events,
            config,
        }
    }

    pub fn blocks(&self) -> &BlockRegistry {
        &self.blocks
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn detector(&self) -> &TunnelDetector {
        &self.detector
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Run the pre-handler stages for one request.
    pub fn check(&self, request: &GateRequest) -> GateDecision {
        if HEALTH_PATHS.contains(&request.path.as_str()) {
            return GateDecision::Allow;
        }

        if self.config.enable_blocking {
            if self.blocks.is_ip_blocked(&request.ip) {
                tracing::warn!("Blocked IP {} -> {} {}", request.ip, request.method, request.path);
                return GateDecision::Deny {
                    status: 403,
                    reason: "Access denied: IP blocked".to_string(),
                    retry_after: None,
                };
            }
            if let Some(rule) = self.blocks.is_endpoint_blocked(&request.path, &request.method) {
                tracing::warn!(
                    "Blocked endpoint {} {} (rule '{}')",
                    request.method,
                    request.path,
                    rule.pattern
                );
                return GateDecision::Deny {
                    status: 403,
                    reason: "Access denied: endpoint blocked".to_string(),
                    retry_after: None,
                };
            }
            let shape = RequestShape {
                path: &request.path,
                query: request.query.as_deref(),
                headers: &request.headers,
            };
            if let Some(rule) = self.blocks.matches_any_pattern(&shape) {
                tracing::warn!(
                    "Blocked request pattern {} '{}' from {}",
                    rule.pattern_type.as_str(),
                    rule.pattern,
                    request.ip
                );
                return GateDecision::Deny {
                    status: 403,
                    reason: "Access denied: request pattern blocked".to_string(),
                    retry_after: None,
                };
            }
        }

        let rate = self.limiter.check(&request.ip, &request.path);
        if !rate.allowed {
            return GateDecision::Deny {
                status: 429,
                reason: rate
                    .reason
                    .unwrap_or_else(|| "Too many requests".to_string()),
                retry_after: rate.retry_after,
            };
        }

        GateDecision::Allow
    }

    /// Full pipeline: gate, run the inner handler, defer capture.
    pub async fn handle<F, Fut>(&self, request: GateRequest, inner: F) -> GateResponse
    where
        F: FnOnce(GateRequest) -> Fut,
        Fut: Future<Output = GateResponse> + Send,
    {
        if HEALTH_PATHS.contains(&request.path.as_str()) {
            return inner(request).await;
        }

        let started = Instant::now();
        let decision = self.check(&request);
        let response = match decision {
            GateDecision::Allow => inner(request.clone()).await,
            deny => deny.into_response(),
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let this = self.clone();
        let captured_response = response.clone();
        tokio::spawn(async move {
            this.record(&request, &captured_response, elapsed_ms).await;
        });

        response
    }

    /// Capture one request/response pair: sanitise, analyse, persist,
    /// broadcast. Never fails the caller.
    pub async fn record(&self, request: &GateRequest, response: &GateResponse, elapsed_ms: f64) {
        let (request_body, request_truncated) =
            truncate_body(&request.body, self.config.max_body_size);
        let (response_body, response_truncated) =
            truncate_body(&response.body, self.config.max_body_size);

        let mut entry = NetworkLogEntry {
            id: uuid::Uuid::new_v4().to_string(),
            request_id: request.request_id.clone(),
            tenant_id: request.tenant_id.clone(),
            timestamp: Utc::now(),
            ip: request.ip.clone(),
            method: request.method.clone(),
            path: request.path.clone(),
            query: request.query.clone(),
            status: response.status,
            response_time_ms: elapsed_ms,
            request_headers: sanitize_headers(&request.headers),
            response_headers: sanitize_headers(&response.headers),
            request_body: Some(request_body),
            response_body: Some(response_body),
            body_truncated: request_truncated || response_truncated,
            tunnel_detection: None,
        };

        if self.config.enable_tunnel_detection {
            let sample = RequestSample {
                timestamp: entry.timestamp,
                source_ip: request.ip.clone(),
                method: request.method.clone(),
                path: request.path.clone(),
                body: request.body.as_bytes().to_vec(),
                header_bytes: request.header_bytes(),
                user_agent: request.user_agent(),
            };
            if let Some(verdict) = self.detector.analyze(&sample) {
                if verdict.confidence >= self.config.min_confidence {
                    self.detector.record_alert();
                    entry.tunnel_detection = Some(verdict.clone());
                    self.events.emit(EngineEvent::TunnelAlert { verdict });
                }
            }
        }

        if self.config.enable_logging {
            if let Err(err) = self.store.network_logs().insert(&entry).await {
                tracing::warn!("Network log write failed (continuing): {}", err);
            }
        }

        self.events.emit(EngineEvent::NetworkLog {
            entry: Box::new(entry),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn gatekeeper(config: GateConfig) -> Gatekeeper {
        let store = Store::connect_in_memory().await.unwrap();
        Gatekeeper::new(
            Arc::new(BlockRegistry::new()),
            Arc::new(RateLimiter::new(100, 60)),
            Arc::new(TunnelDetector::new(256)),
            store,
            EventBus::default(),
            config,
        )
    }

    #[tokio::test]
    async fn health_paths_bypass_even_blocked_ips() {
        let gate = gatekeeper(GateConfig::default()).await;
        gate.blocks().block_ip("1.2.3.4", "abuse", "admin");

        let health = GateRequest::new("1.2.3.4", "GET", "/api/health");
        assert!(gate.check(&health).is_allowed());

        let api = GateRequest::new("1.2.3.4", "GET", "/api/jobs");
        match gate.check(&api) {
            GateDecision::Deny { status, reason, .. } => {
                assert_eq!(status, 403);
                assert!(reason.contains("IP blocked"));
            }
            other => panic!("expected deny, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn rate_limit_denies_with_retry_after() {
        let store = Store::connect_in_memory().await.unwrap();
        let gate = Gatekeeper::new(
            Arc::new(BlockRegistry::new()),
            Arc::new(RateLimiter::new(3, 100)),
            Arc::new(TunnelDetector::new(256)),
            store,
            EventBus::default(),
            GateConfig::default(),
        );

        let request = GateRequest::new("5.6.7.8", "GET", "/api/jobs");
        for _ in 0..3 {
            assert!(gate.check(&request).is_allowed());
        }
        match gate.check(&request) {
            GateDecision::Deny {
                status,
                retry_after,
                ..
            } => {
                assert_eq!(status, 429);
                assert_eq!(retry_after, Some(60));
            }
            other => panic!("expected 429, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn blocking_toggle_fails_open() {
        let gate = gatekeeper(GateConfig {
            enable_blocking: false,
            ..Default::default()
        })
        .await;
        gate.blocks().block_ip("1.2.3.4", "abuse", "admin");
        let request = GateRequest::new("1.2.3.4", "GET", "/api/jobs");
        assert!(gate.check(&request).is_allowed());
    }

    #[tokio::test]
    async fn record_sanitises_and_persists() {
        let gate = gatekeeper(GateConfig::default()).await;
        let mut request = GateRequest::new("9.9.9.9", "POST", "/api/login");
        request.headers = vec![
            ("Authorization".to_string(), "Bearer secret".to_string()),
            ("Content-Type".to_string(), "application/json".to_string()),
        ];
        request.body = "{\"user\":\"a\"}".to_string();

        let response = GateResponse::new(200);
        gate.record(&request, &response, 4.2).await;

        let entry = gate
            .store
            .network_logs()
            .get(&request.request_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.request_headers["Authorization"], "[REDACTED]");
        assert_eq!(entry.request_headers["Content-Type"], "application/json");
        assert_eq!(entry.status, 200);
    }

    #[tokio::test]
    async fn handle_runs_inner_and_defers_capture() {
        let gate = gatekeeper(GateConfig::default()).await;
        let mut events = gate.events.subscribe();

        let request = GateRequest::new("7.7.7.7", "GET", "/api/findings");
        let request_id = request.request_id.clone();
        let response = gate
            .handle(request, |_| async {
                let mut r = GateResponse::new(200);
                r.body = "[]".to_string();
                r
            })
            .await;
        assert_eq!(response.status, 200);

        // Capture is asynchronous; the broadcast marks its completion.
        let event = events.recv().await.unwrap();
        assert_eq!(event.name(), "network.log");
        let entry = gate.store.network_logs().get(&request_id).await.unwrap();
        assert!(entry.is_some());
    }

    #[tokio::test]
    async fn beaconing_traffic_raises_a_tunnel_alert() {
        let gate = gatekeeper(GateConfig::default()).await;
        let mut events = gate.events.subscribe();

        // Prime the detector with a strict 30s cadence ending 30s ago; the
        // captured request below lands on the same beat.
        let now = Utc::now();
        for i in 1..=24i64 {
            let sample = crate::tunnel::RequestSample {
                timestamp: now - chrono::Duration::seconds(30 * (25 - i)),
                source_ip: "3.3.3.3".to_string(),
                method: "GET".to_string(),
                path: "/c2/checkin".to_string(),
                body: Vec::new(),
                header_bytes: 64,
                user_agent: Some("implant/1.0".to_string()),
            };
            gate.detector.analyze(&sample);
        }

        let mut request = GateRequest::new("3.3.3.3", "GET", "/c2/checkin");
        request
            .headers
            .push(("User-Agent".to_string(), "implant/1.0".to_string()));
        let response = GateResponse::new(200);
        gate.record(&request, &response, 1.0).await;

        let mut saw_alert = false;
        let mut saw_log_with_verdict = false;
        for _ in 0..3 {
            match events.recv().await {
                Ok(EngineEvent::TunnelAlert { verdict }) => {
                    assert_eq!(verdict.tunnel_type, "beacon");
                    assert!(verdict.confidence >= Confidence::Medium);
                    saw_alert = true;
                }
                Ok(EngineEvent::NetworkLog { entry }) => {
                    saw_log_with_verdict = entry.tunnel_detection.is_some();
                    break;
                }
                _ => break,
            }
        }
        assert!(saw_alert);
        assert!(saw_log_with_verdict);
        assert!(gate.detector.stats().alerts_generated >= 1);
    }

    #[tokio::test]
    async fn denied_requests_are_captured_too() {
        let gate = gatekeeper(GateConfig::default()).await;
        gate.blocks().block_ip("6.6.6.6", "abuse", "admin");
        let mut events = gate.events.subscribe();

        let request = GateRequest::new("6.6.6.6", "GET", "/api/jobs");
        let request_id = request.request_id.clone();
        let response = gate
            .handle(request, |_| async { GateResponse::new(200) })
            .await;
        assert_eq!(response.status, 403);

        events.recv().await.unwrap();
        let entry = gate
            .store
            .network_logs()
            .get(&request_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.status, 403);
    }
}
