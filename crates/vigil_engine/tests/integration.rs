//! Integration tests for the orchestration core: admission, priority
//! dispatch, tenant caps, retry, cancellation, scheduling.

use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use vigil_engine::{EngineError, Orchestrator, Scheduler};
use vigil_protocol::{
    executor_fn, Capability, CronSpec, EngineConfig, EventBus, ExecError, ExecOutcome, Job,
    JobPriority, JobStatus, RawFinding, Severity,
};
use vigil_store::{NewScheduledSearch, Scope, Store};

fn quiet_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    for capability in Capability::ALL {
        config.workers.insert(capability, 1);
    }
    config.retry_backoff_base_ms = 20;
    config.retry_backoff_cap_ms = 100;
    config
}

async fn engine_with(config: EngineConfig) -> Orchestrator {
    let store = Store::connect_in_memory().await.unwrap();
    Orchestrator::new(store, config, EventBus::default())
}

async fn wait_for_status(
    orchestrator: &Orchestrator,
    id: &str,
    status: JobStatus,
    timeout: Duration,
) -> Job {
    let deadline = Instant::now() + timeout;
    loop {
        let job = orchestrator
            .store()
            .jobs()
            .get(&Scope::Admin, id)
            .await
            .unwrap()
            .unwrap();
        if job.status == status {
            return job;
        }
        assert!(
            Instant::now() < deadline,
            "job {} stuck in {} waiting for {}",
            id,
            job.status,
            status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn priority_ordering_with_single_worker() {
    let orchestrator = engine_with(quiet_config()).await;
    let order = Arc::new(Mutex::new(Vec::<String>::new()));
    let captured = order.clone();
    orchestrator.register_executor(
        Capability::EmailAudit,
        executor_fn(move |req| {
            let order = captured.clone();
            async move {
                let label = req.config["label"].as_str().unwrap_or("?").to_string();
                order.lock().unwrap().push(label);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(ExecOutcome::empty())
            }
        }),
    );

    // Enqueue in creation order J1..J4 before any worker runs.
    let mut ids = Vec::new();
    for (label, priority) in [
        ("j1", JobPriority::Normal),
        ("j2", JobPriority::Critical),
        ("j3", JobPriority::Low),
        ("j4", JobPriority::High),
    ] {
        let job = orchestrator
            .create_job(
                "t1",
                Capability::EmailAudit,
                "example.com",
                json!({ "label": label }),
                priority,
            )
            .await
            .unwrap();
        ids.push(job.id);
    }

    orchestrator.start().await.unwrap();
    for id in &ids {
        wait_for_status(&orchestrator, id, JobStatus::Succeeded, Duration::from_secs(10)).await;
    }
    orchestrator.shutdown().await;

    assert_eq!(*order.lock().unwrap(), vec!["j2", "j4", "j1", "j3"]);
}

#[tokio::test]
async fn tenant_cap_gates_admission_without_blocking_other_tenants() {
    let mut config = quiet_config();
    config.workers.insert(Capability::Investigation, 4);
    config.tenant_inflight_cap = 2;
    let orchestrator = engine_with(config).await;

    // Track peak concurrency per tenant.
    let peaks = Arc::new(Mutex::new(HashMap::<String, (usize, usize)>::new()));
    let captured = peaks.clone();
    orchestrator.register_executor(
        Capability::Investigation,
        executor_fn(move |req| {
            let peaks = captured.clone();
            async move {
                {
                    let mut peaks = peaks.lock().unwrap();
                    let entry = peaks.entry(req.tenant_id.clone()).or_insert((0, 0));
                    entry.0 += 1;
                    entry.1 = entry.1.max(entry.0);
                }
                tokio::time::sleep(Duration::from_millis(300)).await;
                peaks.lock().unwrap().get_mut(&req.tenant_id).unwrap().0 -= 1;
                Ok(ExecOutcome::empty())
            }
        }),
    );

    let mut ids = Vec::new();
    for i in 0..5 {
        let job = orchestrator
            .create_job(
                "t1",
                Capability::Investigation,
                &format!("t1-target-{}", i),
                json!({}),
                JobPriority::Normal,
            )
            .await
            .unwrap();
        ids.push(job.id);
    }
    for i in 0..2 {
        let job = orchestrator
            .create_job(
                "t2",
                Capability::Investigation,
                &format!("t2-target-{}", i),
                json!({}),
                JobPriority::Normal,
            )
            .await
            .unwrap();
        ids.push(job.id);
    }

    orchestrator.start().await.unwrap();
    for id in &ids {
        wait_for_status(&orchestrator, id, JobStatus::Succeeded, Duration::from_secs(10)).await;
    }
    orchestrator.shutdown().await;

    let peaks = peaks.lock().unwrap();
    assert_eq!(peaks["t1"].1, 2, "t1 must peak exactly at its cap");
    assert_eq!(peaks["t2"].1, 2, "t2 runs both jobs despite t1's backlog");
}

#[tokio::test]
async fn transient_failures_retry_internally_then_succeed() {
    let orchestrator = engine_with(quiet_config()).await;
    let calls = Arc::new(AtomicU32::new(0));
    let captured = calls.clone();
    orchestrator.register_executor(
        Capability::ExposureDiscovery,
        executor_fn(move |_req| {
            let calls = captured.clone();
            async move {
                let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt <= 2 {
                    return Err(ExecError::transient("upstream 503"));
                }
                let mut outcome = ExecOutcome::empty();
                outcome.findings.push(RawFinding {
                    severity: Severity::Medium,
                    title: "Exposed service banner".to_string(),
                    description: "Version banner reveals software release".to_string(),
                    evidence: json!({"port": 443}),
                    affected_assets: vec!["example.com".to_string()],
                    recommendations: vec!["Strip the banner".to_string()],
                    risk_score: 35.0,
                });
                Ok(outcome)
            }
        }),
    );

    let job = orchestrator
        .create_job(
            "t1",
            Capability::ExposureDiscovery,
            "example.com",
            json!({}),
            JobPriority::Normal,
        )
        .await
        .unwrap();
    let mut subscription = orchestrator.subscribe(&job.id);

    orchestrator.start().await.unwrap();
    let done =
        wait_for_status(&orchestrator, &job.id, JobStatus::Succeeded, Duration::from_secs(10))
            .await;
    orchestrator.shutdown().await;

    assert_eq!(done.metadata["attempts"], 3);
    assert_eq!(done.progress, 100);
    assert!(done.error.is_none());
    assert!(done.completed_at.is_some());

    // Retries are internal: exactly one started and one terminal event.
    let mut started = 0;
    let mut succeeded = 0;
    let mut findings_count = None;
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_secs(1), subscription.next()).await
    {
        match event.name() {
            "job.started" => started += 1,
            "job.succeeded" => succeeded += 1,
            "job.findings" => {
                if let vigil_protocol::EngineEvent::JobFindings { count, .. } = event {
                    findings_count = Some(count);
                }
            }
            _ => {}
        }
    }
    assert_eq!(started, 1);
    assert_eq!(succeeded, 1);
    assert_eq!(findings_count, Some(1));

    // The finding is durable and carries the producing job's id.
    let findings = orchestrator
        .store()
        .findings()
        .list_by_job(&Scope::tenant("t1"), &job.id)
        .await
        .unwrap();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].evidence["job_id"], job.id.as_str());
}

#[tokio::test]
async fn fatal_failures_do_not_retry() {
    let orchestrator = engine_with(quiet_config()).await;
    let calls = Arc::new(AtomicU32::new(0));
    let captured = calls.clone();
    orchestrator.register_executor(
        Capability::NetworkSecurity,
        executor_fn(move |_req| {
            let calls = captured.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ExecError::fatal("bad scanner config"))
            }
        }),
    );

    let job = orchestrator
        .create_job(
            "t1",
            Capability::NetworkSecurity,
            "10.0.0.0/24",
            json!({}),
            JobPriority::Normal,
        )
        .await
        .unwrap();
    orchestrator.start().await.unwrap();
    let done =
        wait_for_status(&orchestrator, &job.id, JobStatus::Failed, Duration::from_secs(10)).await;
    orchestrator.shutdown().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(done.error.as_deref(), Some("bad scanner config"));
    assert!(done.completed_at.is_some());
    assert!(done
        .execution_logs
        .iter()
        .any(|l| l.message.contains("bad scanner config")));
}

#[tokio::test]
async fn cooperative_cancel_lands_quickly() {
    let orchestrator = engine_with(quiet_config()).await;
    orchestrator.register_executor(
        Capability::DarkwebIntelligence,
        executor_fn(|req| async move {
            // Checks the signal every 50ms for up to 30s.
            for _ in 0..600 {
                req.cancel.throw_if_cancelled()?;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Ok(ExecOutcome::empty())
        }),
    );

    let job = orchestrator
        .create_job(
            "t1",
            Capability::DarkwebIntelligence,
            "acme",
            json!({}),
            JobPriority::Normal,
        )
        .await
        .unwrap();
    orchestrator.start().await.unwrap();
    wait_for_status(&orchestrator, &job.id, JobStatus::Running, Duration::from_secs(5)).await;

    let cancelled_at = Instant::now();
    assert!(orchestrator.cancel_job(&job.id, "analyst").await.unwrap());
    let done =
        wait_for_status(&orchestrator, &job.id, JobStatus::Cancelled, Duration::from_secs(2))
            .await;
    assert!(
        cancelled_at.elapsed() < Duration::from_millis(600),
        "cooperative cancel took {:?}",
        cancelled_at.elapsed()
    );
    assert!(done.completed_at.is_some());
    assert!(done.error.is_none());

    // A second cancel on a terminal job is a no-op returning false.
    assert!(!orchestrator.cancel_job(&job.id, "analyst").await.unwrap());
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn uncooperative_executor_is_abandoned_after_grace() {
    let orchestrator = engine_with(quiet_config()).await;
    orchestrator.register_executor(
        Capability::InfrastructureTesting,
        executor_fn(|_req| async move {
            // Ignores the cancel signal entirely.
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ExecOutcome::empty())
        }),
    );

    let job = orchestrator
        .create_job(
            "t1",
            Capability::InfrastructureTesting,
            "198.51.100.7",
            json!({}),
            JobPriority::High,
        )
        .await
        .unwrap();
    orchestrator.start().await.unwrap();
    wait_for_status(&orchestrator, &job.id, JobStatus::Running, Duration::from_secs(5)).await;

    assert!(orchestrator.cancel_job(&job.id, "analyst").await.unwrap());
    let done =
        wait_for_status(&orchestrator, &job.id, JobStatus::Cancelled, Duration::from_secs(8))
            .await;
    assert!(done
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("abandoned"));
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn cancel_queued_job_without_workers() {
    let orchestrator = engine_with(quiet_config()).await;
    orchestrator.register_executor(
        Capability::EmailAudit,
        executor_fn(|_req| async { Ok(ExecOutcome::empty()) }),
    );

    let job = orchestrator
        .create_job(
            "t1",
            Capability::EmailAudit,
            "example.com",
            json!({}),
            JobPriority::Normal,
        )
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Queued);

    assert!(orchestrator.cancel_job(&job.id, "analyst").await.unwrap());
    let done = orchestrator
        .store()
        .jobs()
        .get(&Scope::Admin, &job.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.status, JobStatus::Cancelled);
    assert!(done.completed_at.is_some());
    assert!(!orchestrator.cancel_job(&job.id, "analyst").await.unwrap());
    assert_eq!(orchestrator.queue_depth(Capability::EmailAudit), 0);

    // Both operations left an action trail.
    let trail = orchestrator
        .store()
        .activity()
        .list(&Scope::tenant("t1"), 10, 0)
        .await
        .unwrap();
    let actions: Vec<&str> = trail.iter().map(|e| e.action.as_str()).collect();
    assert!(actions.contains(&"job.create"));
    assert!(actions.contains(&"job.cancel"));

    // Engine status reflects the drained queue.
    let status = orchestrator.status();
    assert_eq!(status.queues[&Capability::EmailAudit], 0);
    assert!(status
        .registered_capabilities
        .contains(&Capability::EmailAudit));
}

#[tokio::test]
async fn admission_rejects_unknown_capability_and_overload() {
    let mut config = quiet_config();
    config.queue_soft_limit = 1;
    config.queue_hard_limit = 2;
    let orchestrator = engine_with(config).await;
    orchestrator.register_executor(
        Capability::EmailAudit,
        executor_fn(|_req| async { Ok(ExecOutcome::empty()) }),
    );

    // No executor for investigation.
    let err = orchestrator
        .create_job("t1", Capability::Investigation, "x", json!({}), JobPriority::Normal)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Configuration(_)));

    // Target bounds.
    let err = orchestrator
        .create_job(
            "t1",
            Capability::EmailAudit,
            &"a".repeat(501),
            json!({}),
            JobPriority::Normal,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    // Workers are not started: jobs pile up in the queue.
    let first = orchestrator
        .create_job("t1", Capability::EmailAudit, "a.com", json!({}), JobPriority::Normal)
        .await
        .unwrap();
    assert!(first.metadata.get("queue_warning").is_none());

    let second = orchestrator
        .create_job("t1", Capability::EmailAudit, "b.com", json!({}), JobPriority::Normal)
        .await
        .unwrap();
    assert!(second.metadata.get("queue_warning").is_some());

    let err = orchestrator
        .create_job("t1", Capability::EmailAudit, "c.com", json!({}), JobPriority::Normal)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Overloaded(_)));
}

#[tokio::test]
async fn execute_job_now_bypasses_queue() {
    let orchestrator = engine_with(quiet_config()).await;
    orchestrator.register_executor(
        Capability::EmailAudit,
        executor_fn(|req| async move {
            req.progress.report(40, "checking SPF");
            let mut outcome = ExecOutcome::empty();
            outcome.scan_results = Some(json!({
                "spf": {"status": "pass"},
                "dkim": {"status": "pass"},
                "dmarc": {"status": "pass"},
            }));
            Ok(outcome)
        }),
    );

    let job = orchestrator
        .create_job(
            "t1",
            Capability::EmailAudit,
            "example.com",
            json!({}),
            JobPriority::Normal,
        )
        .await
        .unwrap();

    // No workers running: direct execution drives it to terminal state.
    let done = orchestrator.execute_job_now(&job.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Succeeded);
    assert_eq!(done.progress, 100);

    // Scorer output from post-processing: clean scan + strong email config.
    let indicators = orchestrator
        .store()
        .findings()
        .list_indicators(&Scope::tenant("t1"), 10)
        .await
        .unwrap();
    let types: Vec<_> = indicators
        .iter()
        .map(|i| i.indicator_type.as_str())
        .collect();
    assert!(types.contains(&"no_vulnerabilities"));
    assert!(types.contains(&"strong_email_config"));

    // Progress snapshot reflects the final state and last log line.
    let snapshot = orchestrator
        .get_progress(&Scope::tenant("t1"), &job.id)
        .await
        .unwrap();
    assert_eq!(snapshot.status, JobStatus::Succeeded);
    assert_eq!(snapshot.progress, 100);
    assert!(snapshot.last_log.is_some());
}

#[tokio::test]
async fn subscriber_sees_events_in_lifecycle_order() {
    let orchestrator = engine_with(quiet_config()).await;
    orchestrator.register_executor(
        Capability::EmailAudit,
        executor_fn(|req| async move {
            req.progress.report(30, "resolving DNS");
            req.progress.report(70, "checking DMARC");
            Ok(ExecOutcome::empty())
        }),
    );

    let job = orchestrator
        .create_job(
            "t1",
            Capability::EmailAudit,
            "example.com",
            json!({}),
            JobPriority::Normal,
        )
        .await
        .unwrap();
    // Subscribed after the queued event, before dispatch: the stream starts
    // at job.started.
    let mut subscription = orchestrator.subscribe(&job.id);
    orchestrator.start().await.unwrap();
    wait_for_status(&orchestrator, &job.id, JobStatus::Succeeded, Duration::from_secs(10)).await;
    orchestrator.shutdown().await;

    let mut names = Vec::new();
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_secs(1), subscription.next()).await
    {
        names.push(event.name().to_string());
    }
    let progress_count = names.iter().filter(|n| *n == "job.progress").count();
    assert_eq!(progress_count, 2);
    assert_eq!(names.first().map(String::as_str), Some("job.started"));
    let findings_idx = names.iter().position(|n| n == "job.findings").unwrap();
    let succeeded_idx = names.iter().position(|n| n == "job.succeeded").unwrap();
    assert!(findings_idx < succeeded_idx);
    assert_eq!(names.last().map(String::as_str), Some("job.succeeded"));

    // Progress is monotonic in the persisted record too.
    let job = orchestrator
        .store()
        .jobs()
        .get(&Scope::Admin, &job.id)
        .await
        .unwrap()
        .unwrap();
    assert!(job
        .execution_logs
        .iter()
        .any(|l| l.message.contains("DMARC")));
}

#[tokio::test]
async fn restart_recovery_requeues_and_fails_interrupted() {
    let store = Store::connect_in_memory().await.unwrap();
    let events = EventBus::default();

    // First engine: accept a job, then stop without running it.
    let first = Orchestrator::new(store.clone(), quiet_config(), events.clone());
    first.register_executor(
        Capability::EmailAudit,
        executor_fn(|_req| async { Ok(ExecOutcome::empty()) }),
    );
    let queued = first
        .create_job("t1", Capability::EmailAudit, "example.com", json!({}), JobPriority::Normal)
        .await
        .unwrap();

    // Simulate a crash mid-flight for another job.
    let mut crashed = Job::new(
        "t1",
        Capability::EmailAudit,
        "crashed.example.com",
        json!({}),
        JobPriority::Normal,
    );
    crashed.status = JobStatus::Running;
    crashed.started_at = Some(chrono::Utc::now());
    store.jobs().upsert(&crashed).await.unwrap();

    // Second engine over the same store.
    let second = Orchestrator::new(store.clone(), quiet_config(), events);
    second.register_executor(
        Capability::EmailAudit,
        executor_fn(|_req| async { Ok(ExecOutcome::empty()) }),
    );
    second.start().await.unwrap();

    let recovered =
        wait_for_status(&second, &queued.id, JobStatus::Succeeded, Duration::from_secs(10)).await;
    assert_eq!(recovered.status, JobStatus::Succeeded);

    let failed = store
        .jobs()
        .get(&Scope::Admin, &crashed.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.error.unwrap().contains("restart"));
    second.shutdown().await;
}

#[tokio::test]
async fn scheduler_coalesces_missed_fires_into_one_run() {
    let store = Store::connect_in_memory().await.unwrap();
    let orchestrator = Orchestrator::new(store.clone(), quiet_config(), EventBus::default());
    orchestrator.register_executor(
        Capability::EmailAudit,
        executor_fn(|_req| async { Ok(ExecOutcome::empty()) }),
    );
    orchestrator.start().await.unwrap();

    let search = store
        .scheduled_searches()
        .create(&NewScheduledSearch {
            tenant_id: "t1".to_string(),
            name: "minutely".to_string(),
            description: None,
            capabilities: vec![Capability::EmailAudit],
            target: "example.com".to_string(),
            config: json!({}),
            cron_expression: "* * * * *".to_string(),
            timezone: "UTC".to_string(),
            enabled: true,
        })
        .await
        .unwrap();

    // Rewind the trigger ten fires into the past: a 10-minute outage.
    let spec = CronSpec::parse("* * * * *", "UTC").unwrap();
    let now = chrono::Utc::now();
    let last_boundary = spec.next_after(now).unwrap() - chrono::Duration::minutes(1);
    let stale = last_boundary - chrono::Duration::minutes(9);
    sqlx::query("UPDATE scheduled_searches SET next_run_at = ? WHERE id = ?")
        .bind(stale)
        .bind(&search.id)
        .execute(store.pool())
        .await
        .unwrap();

    let scheduler = Scheduler::new(
        store.clone(),
        orchestrator.clone(),
        Duration::from_millis(50),
    );
    scheduler.start().await.unwrap();

    // Exactly one coalesced materialisation.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let current = store
            .scheduled_searches()
            .get(&Scope::Admin, &search.id)
            .await
            .unwrap()
            .unwrap();
        if current.run_count == 1 {
            assert!(current.last_run_at.is_some());
            assert!(current.next_run_at.unwrap() > now);
            break;
        }
        assert!(Instant::now() < deadline, "scheduler never fired");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Freeze the trigger, then confirm the backlog produced no burst.
    store
        .scheduled_searches()
        .set_enabled(&search.id, false)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let settled = store
        .scheduled_searches()
        .get(&Scope::Admin, &search.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(settled.run_count, 1);

    let jobs = store
        .jobs()
        .list(&Scope::tenant("t1"), &Default::default(), 10, 0)
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    let missed = jobs[0].config["metadata"]["missed_fires"].as_u64().unwrap();
    // Nine missed fires; scheduler startup crossing a minute boundary can
    // add one more.
    assert!((9..=10).contains(&missed), "missed = {}", missed);
    assert_eq!(
        jobs[0].config["metadata"]["scheduled_search_id"],
        search.id.as_str()
    );
    assert_eq!(jobs[0].priority, JobPriority::Background);

    scheduler.shutdown().await;
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn scheduler_skips_fires_older_than_grace() {
    let store = Store::connect_in_memory().await.unwrap();
    let orchestrator = Orchestrator::new(store.clone(), quiet_config(), EventBus::default());
    orchestrator.register_executor(
        Capability::EmailAudit,
        executor_fn(|_req| async { Ok(ExecOutcome::empty()) }),
    );

    // Fires once a year; the stored trigger is 20 minutes stale, far past
    // the 300s grace window.
    let search = store
        .scheduled_searches()
        .create(&NewScheduledSearch {
            tenant_id: "t1".to_string(),
            name: "annual".to_string(),
            description: None,
            capabilities: vec![Capability::EmailAudit],
            target: "example.com".to_string(),
            config: json!({}),
            cron_expression: "30 2 1 1 *".to_string(),
            timezone: "UTC".to_string(),
            enabled: true,
        })
        .await
        .unwrap();
    let stale = chrono::Utc::now() - chrono::Duration::minutes(20);
    sqlx::query("UPDATE scheduled_searches SET next_run_at = ? WHERE id = ?")
        .bind(stale)
        .bind(&search.id)
        .execute(store.pool())
        .await
        .unwrap();

    let scheduler = Scheduler::new(
        store.clone(),
        orchestrator.clone(),
        Duration::from_millis(50),
    );
    scheduler.start().await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let current = store
            .scheduled_searches()
            .get(&Scope::Admin, &search.id)
            .await
            .unwrap()
            .unwrap();
        if current.next_run_at.map(|t| t > chrono::Utc::now()).unwrap_or(false) {
            // Trigger advanced without a run.
            assert_eq!(current.run_count, 0);
            assert!(current.last_run_at.is_none());
            break;
        }
        assert!(Instant::now() < deadline, "scheduler never advanced the trigger");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let jobs = store
        .jobs()
        .list(&Scope::tenant("t1"), &Default::default(), 10, 0)
        .await
        .unwrap();
    assert!(jobs.is_empty(), "skip must not materialise jobs");

    scheduler.shutdown().await;
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn resolving_a_finding_awards_remediation_points() {
    let orchestrator = engine_with(quiet_config()).await;
    orchestrator.register_executor(
        Capability::InfrastructureTesting,
        executor_fn(|_req| async {
            let mut outcome = ExecOutcome::empty();
            outcome.findings.push(RawFinding {
                severity: Severity::Critical,
                title: "Database reachable from the internet".to_string(),
                description: "Port 5432 open to 0.0.0.0/0".to_string(),
                evidence: json!({"port": 5432}),
                affected_assets: vec!["db.example.com".to_string()],
                recommendations: vec!["Restrict ingress".to_string()],
                risk_score: 92.0,
            });
            Ok(outcome)
        }),
    );

    let job = orchestrator
        .create_job(
            "t1",
            Capability::InfrastructureTesting,
            "db.example.com",
            json!({}),
            JobPriority::High,
        )
        .await
        .unwrap();
    orchestrator.execute_job_now(&job.id).await.unwrap();

    let scope = Scope::tenant("t1");
    let findings = orchestrator
        .store()
        .findings()
        .list_by_job(&scope, &job.id)
        .await
        .unwrap();
    assert_eq!(findings.len(), 1);

    // Another tenant cannot touch it.
    let err = orchestrator
        .resolve_finding(
            &Scope::tenant("t2"),
            &findings[0].id,
            vigil_protocol::FindingStatus::Resolved,
            "intruder",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PermissionDenied(_)));

    let resolved = orchestrator
        .resolve_finding(
            &scope,
            &findings[0].id,
            vigil_protocol::FindingStatus::Resolved,
            "analyst",
        )
        .await
        .unwrap();
    assert_eq!(resolved.resolved_by.as_deref(), Some("analyst"));

    let indicators = orchestrator
        .store()
        .findings()
        .list_indicators(&scope, 20)
        .await
        .unwrap();
    let remediated = indicators
        .iter()
        .find(|i| i.indicator_type == vigil_protocol::IndicatorType::Remediated)
        .expect("remediation indicator");
    assert_eq!(remediated.points_awarded, 25);
}
