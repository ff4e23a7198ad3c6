//! Daemon smoke test: wire the full runtime and push one job through it.

use clap::Parser;
use std::time::{Duration, Instant};
use vigil::{build_runtime, VigilArgs};
use vigil_protocol::{Capability, JobPriority, JobStatus};
use vigil_store::Scope;

#[tokio::test]
async fn runtime_executes_a_probe_job_end_to_end() {
    let args = VigilArgs::parse_from([
        "vigil",
        "--database-url",
        "sqlite::memory:",
        "--no-scheduler",
    ]);
    let runtime = build_runtime(&args).await.unwrap();
    runtime.start().await.unwrap();

    let job = runtime
        .orchestrator
        .create_job(
            "tenant-1",
            Capability::EmailAudit,
            "example.com",
            serde_json::json!({}),
            JobPriority::Normal,
        )
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let current = runtime
            .store
            .jobs()
            .get(&Scope::Admin, &job.id)
            .await
            .unwrap()
            .unwrap();
        if current.status == JobStatus::Succeeded {
            assert_eq!(current.progress, 100);
            assert_eq!(current.metadata["probe"], true);
            break;
        }
        assert!(
            Instant::now() < deadline,
            "probe job stuck in {}",
            current.status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // A clean probe run awards the no-vulnerabilities indicator.
    let indicators = runtime
        .store
        .findings()
        .list_indicators(&Scope::tenant("tenant-1"), 10)
        .await
        .unwrap();
    assert!(!indicators.is_empty());

    // The gatekeeper shares the same store and event bus.
    let request = vigil_netguard::GateRequest::new("192.0.2.9", "GET", "/api/jobs");
    assert!(runtime.gatekeeper.check(&request).is_allowed());

    runtime.shutdown().await;
}

#[tokio::test]
async fn bad_targets_fail_fast_through_the_probe() {
    let args = VigilArgs::parse_from([
        "vigil",
        "--database-url",
        "sqlite::memory:",
        "--no-scheduler",
    ]);
    let runtime = build_runtime(&args).await.unwrap();
    runtime.start().await.unwrap();

    let job = runtime
        .orchestrator
        .create_job(
            "tenant-1",
            Capability::EmailAudit,
            "not a domain",
            serde_json::json!({}),
            JobPriority::Normal,
        )
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let current = runtime
            .store
            .jobs()
            .get(&Scope::Admin, &job.id)
            .await
            .unwrap()
            .unwrap();
        if current.status == JobStatus::Failed {
            assert!(current.error.unwrap().contains("not a domain"));
            break;
        }
        assert!(Instant::now() < deadline, "job never failed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    runtime.shutdown().await;
}
