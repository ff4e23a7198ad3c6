//! End-to-end gatekeeper flow against default limits.

use std::sync::Arc;
use vigil_netguard::{
    BlockRegistry, GateConfig, GateDecision, GateRequest, GateResponse, Gatekeeper, RateLimiter,
    TunnelDetector,
};
use vigil_protocol::EventBus;
use vigil_store::{Scope, Store};

async fn default_gatekeeper() -> Gatekeeper {
    let store = Store::connect_in_memory().await.unwrap();
    Gatekeeper::new(
        Arc::new(BlockRegistry::new()),
        Arc::new(RateLimiter::new(100, 60)),
        Arc::new(TunnelDetector::default()),
        store,
        EventBus::default(),
        GateConfig::default(),
    )
}

#[tokio::test]
async fn blocked_ip_flow_with_health_bypass() {
    let gate = default_gatekeeper().await;
    gate.blocks().block_ip("1.2.3.4", "known scanner", "admin");

    // Health endpoints bypass the entire pipeline, block included.
    for path in ["/health", "/api/health"] {
        let request = GateRequest::new("1.2.3.4", "GET", path);
        assert!(gate.check(&request).is_allowed(), "{} must bypass", path);
    }

    let request = GateRequest::new("1.2.3.4", "GET", "/api/jobs");
    match gate.check(&request) {
        GateDecision::Deny { status, .. } => assert_eq!(status, 403),
        other => panic!("expected 403, got {:?}", other),
    }

    // Unblocking restores access.
    assert!(gate.blocks().unblock_ip("1.2.3.4"));
    let request = GateRequest::new("1.2.3.4", "GET", "/api/jobs");
    assert!(gate.check(&request).is_allowed());
}

#[tokio::test]
async fn hundred_first_request_in_a_minute_is_limited() {
    let gate = default_gatekeeper().await;

    // Spread over several endpoints so only the per-IP window can trip:
    // 25 requests each to 4 endpoints stays below the per-endpoint limit.
    let endpoints = ["/api/jobs", "/api/findings", "/api/logs", "/api/search"];
    for i in 0..100 {
        let request = GateRequest::new("5.6.7.8", "GET", endpoints[i % endpoints.len()]);
        assert!(gate.check(&request).is_allowed(), "request {} denied early", i);
    }

    let request = GateRequest::new("5.6.7.8", "GET", "/api/jobs");
    match gate.check(&request) {
        GateDecision::Deny {
            status,
            reason,
            retry_after,
        } => {
            assert_eq!(status, 429);
            assert_eq!(retry_after, Some(60));
            assert!(reason.contains("IP rate limit"));
        }
        other => panic!("expected 429, got {:?}", other),
    }

    // Other clients are unaffected.
    let request = GateRequest::new("9.9.9.9", "GET", "/api/jobs");
    assert!(gate.check(&request).is_allowed());
}

#[tokio::test]
async fn per_endpoint_limit_trips_before_ip_limit() {
    let gate = default_gatekeeper().await;

    for i in 0..60 {
        let request = GateRequest::new("5.6.7.8", "GET", "/api/export");
        assert!(gate.check(&request).is_allowed(), "request {} denied early", i);
    }
    let request = GateRequest::new("5.6.7.8", "GET", "/api/export");
    match gate.check(&request) {
        GateDecision::Deny { status, reason, .. } => {
            assert_eq!(status, 429);
            assert!(reason.contains("Endpoint rate limit"));
        }
        other => panic!("expected 429, got {:?}", other),
    }

    // The same IP can still hit other endpoints.
    let request = GateRequest::new("5.6.7.8", "GET", "/api/jobs");
    assert!(gate.check(&request).is_allowed());
}

#[tokio::test]
async fn full_pipeline_captures_allowed_and_denied_traffic() {
    let gate = default_gatekeeper().await;
    gate.blocks()
        .block_endpoint("/internal/*", "ALL", "not public", "admin")
        .unwrap();

    let allowed = GateRequest::new("7.7.7.7", "GET", "/api/findings");
    let allowed_id = allowed.request_id.clone();
    let response = gate
        .handle(allowed, |_| async {
            let mut r = GateResponse::new(200);
            r.body = "[]".to_string();
            r
        })
        .await;
    assert_eq!(response.status, 200);

    let denied = GateRequest::new("7.7.7.7", "GET", "/internal/metrics");
    let denied_id = denied.request_id.clone();
    let response = gate
        .handle(denied, |_| async { GateResponse::new(200) })
        .await;
    assert_eq!(response.status, 403);

    // Capture is deferred; wait for both entries to land.
    let store = gate.store().clone();
    for id in [&allowed_id, &denied_id] {
        let mut found = false;
        for _ in 0..100 {
            if store.network_logs().get(id).await.unwrap().is_some() {
                found = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(found, "capture for {} never landed", id);
    }

    let listed = store
        .network_logs()
        .list(&Scope::Admin, &Default::default(), 10, 0)
        .await
        .unwrap();
    assert_eq!(listed.len(), 2);
    let statuses: Vec<u16> = listed.iter().map(|e| e.status).collect();
    assert!(statuses.contains(&200));
    assert!(statuses.contains(&403));
}
