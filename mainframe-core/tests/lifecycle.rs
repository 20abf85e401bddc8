use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use mainframe_core::{
    Allocation, CoreError, InMemoryLedgerStore, InProcStatusEventBus,
    JobRequest, LedgerStore, MAX_LEASE_SECS, Mainframe, MainframeConfig,
    ManualClock,
    MetadataEnricher, QueueOutcome, RulesCatalog, StoreError, SubmitOutcome,
    enrichment::EnrichmentError,
};
use mainframe_model::{
    Enrichment, Findings, Job, PackageKey, PackageStatus, Verdict,
};

struct Harness {
    mainframe: Mainframe,
    store: Arc<InMemoryLedgerStore>,
    clock: ManualClock,
    events: Arc<InProcStatusEventBus>,
}

fn start() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

fn harness_with(config: MainframeConfig) -> Harness {
    let store = Arc::new(InMemoryLedgerStore::new());
    let clock = ManualClock::new(start());
    let events = Arc::new(InProcStatusEventBus::new(64));
    let mainframe = Mainframe::builder(store.clone())
        .with_clock(Arc::new(clock.clone()))
        .with_event_publisher(events.clone())
        .with_rules(RulesCatalog::new(Some("4f2a9c1".into())))
        .with_config(config)
        .build()
        .unwrap();
    Harness {
        mainframe,
        store,
        clock,
        events,
    }
}

fn harness() -> Harness {
    harness_with(MainframeConfig::default())
}

fn worker(name: &str) -> JobRequest {
    JobRequest::new(name).unwrap()
}

async fn take_job(harness: &Harness, request: &JobRequest) -> Job {
    harness
        .mainframe
        .request_job(request)
        .await
        .unwrap()
        .into_job()
        .expect("expected a job")
}

fn key(name: &str, version: &str) -> PackageKey {
    PackageKey::new(name, version).unwrap()
}

#[tokio::test]
async fn malicious_verdict_end_to_end() {
    let h = harness();
    h.mainframe
        .queue_package(
            "evil-pkg",
            "1.0.0",
            ["https://files.pythonhosted.org/evil_pkg-1.0.0.tar.gz"],
        )
        .await
        .unwrap();
    let mut events = h.events.subscribe();

    let worker_a = worker("worker-a").with_lease_duration(Duration::from_secs(60));
    let job = take_job(&h, &worker_a).await;
    assert_eq!(job.package, key("evil-pkg", "1.0.0"));
    assert_eq!(job.lease.duration(), chrono::Duration::seconds(60));
    assert_eq!(job.rules_commit.as_deref(), Some("4f2a9c1"));
    assert_eq!(job.distributions.len(), 1);
    assert!(!job.enrichment_failed);

    h.clock.advance(chrono::Duration::seconds(30));
    let outcome = h
        .mainframe
        .submit_result(
            job.lease.token,
            "worker-a",
            Verdict::Malicious(Findings::new(["R1"], 95)),
        )
        .await
        .unwrap();
    let SubmitOutcome::Ack(ack) = outcome else {
        panic!("expected ack, got {outcome:?}");
    };
    assert_eq!(ack.status, PackageStatus::Malicious);

    let package = h
        .mainframe
        .package_status("evil-pkg", "1.0.0")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(package.status, PackageStatus::Malicious);
    let findings = package.findings.unwrap();
    assert_eq!(findings.rules, vec!["R1".to_string()]);
    assert_eq!(findings.score, 95);
    assert_eq!(package.finished_by.as_deref(), Some("worker-a"));
    assert_eq!(package.updated_at, start() + chrono::Duration::seconds(30));
    assert!(h.store.active_lease(&package.key).await.unwrap().is_none());
    assert_eq!(h.store.rules_for(&package.key), vec!["R1".to_string()]);

    let event = events.recv().await.unwrap();
    assert_eq!(event.old_status, PackageStatus::Leased);
    assert_eq!(event.new_status, PackageStatus::Malicious);
    assert_eq!(event.findings.map(|f| f.score), Some(95));

    // Terminal packages are never handed out again.
    h.clock.advance(chrono::Duration::hours(2));
    assert!(h.mainframe.request_job(&worker("worker-b")).await.unwrap().is_empty());
    h.store.check_invariants().unwrap();
}

#[tokio::test]
async fn expired_lease_is_reaped_and_reallocated() {
    let h = harness();
    h.mainframe
        .queue_package("slow-pkg", "0.1", Vec::<String>::new())
        .await
        .unwrap();
    let mut events = h.events.subscribe();

    let first = take_job(&h, &worker("worker-a").with_lease_duration(Duration::from_secs(1))).await;
    assert_eq!(first.lease.duration(), chrono::Duration::seconds(1));

    h.clock.advance(chrono::Duration::seconds(2));
    assert_eq!(h.mainframe.reap_expired().await.unwrap(), 1);

    let package = h.mainframe.package_status("slow-pkg", "0.1").await.unwrap().unwrap();
    assert_eq!(package.status, PackageStatus::Unscanned);
    let event = events.recv().await.unwrap();
    assert_eq!(
        (event.old_status, event.new_status),
        (PackageStatus::Leased, PackageStatus::Unscanned)
    );

    let second = take_job(&h, &worker("worker-b")).await;
    assert_eq!(second.package, first.package);
    assert_ne!(second.lease.token, first.lease.token);

    // The reaped token is gone for good.
    let late = h
        .mainframe
        .submit_result(first.lease.token, "worker-a", Verdict::Clean)
        .await
        .unwrap();
    assert_eq!(late, SubmitOutcome::LeaseInvalid);
    h.store.check_invariants().unwrap();
}

#[tokio::test]
async fn expired_lease_is_reclaimed_lazily_without_reaper() {
    let h = harness();
    h.mainframe
        .queue_package("lazy", "2.0", Vec::<String>::new())
        .await
        .unwrap();

    let first = take_job(&h, &worker("worker-a").with_lease_duration(Duration::from_secs(5))).await;
    assert!(h.mainframe.request_job(&worker("worker-b")).await.unwrap().is_empty());

    h.clock.advance(chrono::Duration::seconds(5));
    let second = take_job(&h, &worker("worker-b")).await;
    assert_eq!(second.package, first.package);
    assert_eq!(second.lease.owner.as_str(), "worker-b");

    let counts = h.mainframe.status_counts().await.unwrap();
    assert_eq!(counts.leased, 1);
    assert_eq!(counts.active_leases, 1);
    h.store.check_invariants().unwrap();
}

#[tokio::test]
async fn late_submission_reports_expiry_and_changes_nothing() {
    let h = harness();
    h.mainframe
        .queue_package("late", "1.0", Vec::<String>::new())
        .await
        .unwrap();
    let job = take_job(&h, &worker("worker-a").with_lease_duration(Duration::from_secs(10))).await;

    h.clock.advance(chrono::Duration::seconds(25));
    let outcome = h
        .mainframe
        .submit_result(job.lease.token, "worker-a", Verdict::Clean)
        .await
        .unwrap();
    match outcome {
        SubmitOutcome::LeaseExpired { package, overrun, .. } => {
            assert_eq!(package, key("late", "1.0"));
            assert_eq!(overrun, chrono::Duration::seconds(15));
        }
        other => panic!("expected LeaseExpired, got {other:?}"),
    }
    let package = h.mainframe.package_status("late", "1.0").await.unwrap().unwrap();
    assert_eq!(package.status, PackageStatus::Leased);
    assert!(package.findings.is_none());
}

#[tokio::test]
async fn resubmission_is_lease_invalid_and_keeps_findings() {
    let h = harness();
    h.mainframe
        .queue_package("twice", "1.0", Vec::<String>::new())
        .await
        .unwrap();
    let job = take_job(&h, &worker("worker-a")).await;

    let first = h
        .mainframe
        .submit_result(
            job.lease.token,
            "worker-a",
            Verdict::Malicious(Findings::new(["R1", "R2"], 80)),
        )
        .await
        .unwrap();
    assert!(first.is_ack());

    let again = h
        .mainframe
        .submit_result(job.lease.token, "worker-a", Verdict::Clean)
        .await
        .unwrap();
    assert_eq!(again, SubmitOutcome::LeaseInvalid);

    let package = h.mainframe.package_status("twice", "1.0").await.unwrap().unwrap();
    assert_eq!(package.status, PackageStatus::Malicious);
    assert_eq!(package.findings.unwrap().score, 80);
}

#[tokio::test]
async fn foreign_worker_cannot_submit() {
    let h = harness();
    h.mainframe
        .queue_package("owned", "3.1", Vec::<String>::new())
        .await
        .unwrap();
    let job = take_job(&h, &worker("worker-a")).await;

    let outcome = h
        .mainframe
        .submit_result(job.lease.token, "worker-b", Verdict::Clean)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        SubmitOutcome::LeaseOwnerMismatch {
            package: key("owned", "3.1")
        }
    );

    let lease = h.store.active_lease(&key("owned", "3.1")).await.unwrap().unwrap();
    assert_eq!(lease.token, job.lease.token);
    assert_eq!(lease.owner.as_str(), "worker-a");

    // The rightful owner can still finish.
    let outcome = h
        .mainframe
        .submit_result(job.lease.token, "worker-a", Verdict::Clean)
        .await
        .unwrap();
    assert!(outcome.is_ack());
}

#[tokio::test]
async fn oldest_updated_package_is_allocated_first() {
    let h = harness();
    for name in ["alpha", "beta", "gamma"] {
        h.mainframe
            .queue_package(name, "1.0", Vec::<String>::new())
            .await
            .unwrap();
    }
    assert!(h.store.set_updated_at(&key("alpha", "1.0"), start() + chrono::Duration::minutes(10)));
    assert!(h.store.set_updated_at(&key("beta", "1.0"), start() + chrono::Duration::minutes(5)));
    assert!(h.store.set_updated_at(&key("gamma", "1.0"), start() - chrono::Duration::minutes(5)));

    let order: Vec<String> = {
        let mut names = Vec::new();
        for _ in 0..3 {
            names.push(take_job(&h, &worker("worker-a")).await.package.name);
        }
        names
    };
    assert_eq!(order, vec!["gamma", "beta", "alpha"]);
}

#[tokio::test]
async fn versions_are_independent() {
    let h = harness();
    h.mainframe.queue_package("dual", "1.0", Vec::<String>::new()).await.unwrap();
    h.mainframe.queue_package("dual", "2.0", Vec::<String>::new()).await.unwrap();

    let job = take_job(&h, &worker("worker-a")).await;
    h.mainframe
        .submit_result(
            job.lease.token,
            "worker-a",
            Verdict::Malicious(Findings::new(["R7"], 50)),
        )
        .await
        .unwrap();

    let other_version = if job.package.version == "1.0" { "2.0" } else { "1.0" };
    let other = h.mainframe.package_status("dual", other_version).await.unwrap().unwrap();
    assert_eq!(other.status, PackageStatus::Unscanned);
    assert!(other.findings.is_none());
}

#[tokio::test]
async fn queueing_is_idempotent() {
    let h = harness();
    let first = h
        .mainframe
        .queue_package("dup", "1.0", Vec::<String>::new())
        .await
        .unwrap();
    assert!(matches!(first, QueueOutcome::Queued(_)));

    let job = take_job(&h, &worker("worker-a")).await;
    let again = h
        .mainframe
        .queue_package("dup", "1.0", ["https://example.invalid/dup.whl"])
        .await
        .unwrap();
    assert_eq!(again, QueueOutcome::AlreadyKnown(PackageStatus::Leased));

    // Re-queueing did not disturb the lease.
    let outcome = h
        .mainframe
        .submit_result(job.lease.token, "worker-a", Verdict::Clean)
        .await
        .unwrap();
    assert!(outcome.is_ack());
    let package = h.mainframe.package_status("dup", "1.0").await.unwrap().unwrap();
    assert!(package.distributions.is_empty());
}

#[tokio::test]
async fn malformed_input_is_rejected_before_the_store() {
    let h = harness();
    assert!(matches!(
        h.mainframe.queue_package("", "1.0", Vec::<String>::new()).await,
        Err(CoreError::InvalidRequest(_))
    ));
    assert!(matches!(
        h.mainframe.queue_package("pkg", "1.0", ["not a url"]).await,
        Err(CoreError::InvalidRequest(_))
    ));
    assert!(JobRequest::new("   ").is_err());

    h.mainframe.queue_package("pkg", "1.0", Vec::<String>::new()).await.unwrap();
    let job = take_job(&h, &worker("worker-a")).await;
    let err = h
        .mainframe
        .submit_result(job.lease.token, "worker-a", Verdict::Errored("  ".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidVerdict(_)));

    // The lease survives a rejected verdict.
    assert!(h.store.active_lease(&job.package).await.unwrap().is_some());
}

#[tokio::test]
async fn error_verdict_records_truncated_summary() {
    let mut config = MainframeConfig::default();
    config.reconciler.max_error_summary_len = 8;
    let h = harness_with(config);
    h.mainframe.queue_package("broken", "1.0", Vec::<String>::new()).await.unwrap();
    let job = take_job(&h, &worker("worker-a")).await;

    h.mainframe
        .submit_result(
            job.lease.token,
            "worker-a",
            Verdict::Errored("archive could not be extracted".into()),
        )
        .await
        .unwrap();

    let package = h.mainframe.package_status("broken", "1.0").await.unwrap().unwrap();
    assert_eq!(package.status, PackageStatus::Errored);
    assert_eq!(package.error_summary.as_deref(), Some("archive "));
}

#[tokio::test]
async fn lease_durations_are_clamped_per_job_class() {
    let mut config = MainframeConfig::default();
    config.lease.bounds.min_secs = 30;
    config.lease.bounds.max_secs = 600;
    config.lease.bounds.default_secs = 120;
    config.lease.classes.insert(
        "large".into(),
        mainframe_core::LeaseBounds {
            default_secs: 1_800,
            min_secs: 600,
            max_secs: 3_600,
        },
    );
    let h = harness_with(config);
    for i in 0..4 {
        h.mainframe
            .queue_package(&format!("pkg-{i}"), "1.0", Vec::<String>::new())
            .await
            .unwrap();
    }

    let short = take_job(&h, &worker("a").with_lease_duration(Duration::from_secs(1))).await;
    assert_eq!(short.lease.duration(), chrono::Duration::seconds(30));

    let long = take_job(&h, &worker("a").with_lease_duration(Duration::from_secs(86_400))).await;
    assert_eq!(long.lease.duration(), chrono::Duration::seconds(600));

    let large = take_job(&h, &worker("a").with_job_class("large")).await;
    assert_eq!(large.lease.duration(), chrono::Duration::seconds(1_800));

    let unknown = take_job(&h, &worker("a").with_job_class("nonexistent")).await;
    assert_eq!(unknown.lease.duration(), chrono::Duration::seconds(120));
}

#[tokio::test]
async fn oversized_lease_bounds_are_capped() {
    let mut config = MainframeConfig::default();
    config.lease.bounds.max_secs = 1_000_000_000_000_000;
    let h = harness_with(config);
    h.mainframe.queue_package("huge", "1.0", Vec::<String>::new()).await.unwrap();

    let request =
        worker("a").with_lease_duration(Duration::from_secs(1_000_000_000_000_000));
    let job = take_job(&h, &request).await;
    assert_eq!(
        job.lease.duration(),
        chrono::Duration::seconds(MAX_LEASE_SECS as i64)
    );
}

#[tokio::test]
async fn lease_past_the_end_of_time_is_rejected() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let clock = ManualClock::new(chrono::DateTime::<Utc>::MAX_UTC - chrono::Duration::seconds(10));
    let mainframe = Mainframe::builder(store.clone())
        .with_clock(Arc::new(clock))
        .build()
        .unwrap();
    mainframe.queue_package("late", "1.0", Vec::<String>::new()).await.unwrap();

    let err = mainframe.request_job(&worker("a")).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidRequest(_)));
    let package = mainframe.package_status("late", "1.0").await.unwrap().unwrap();
    assert_eq!(package.status, PackageStatus::Unscanned);
    store.check_invariants().unwrap();
}

#[tokio::test]
async fn batch_allocation_stops_when_queue_drains() {
    let mut config = MainframeConfig::default();
    config.allocator.max_batch = 3;
    let h = harness_with(config);
    for i in 0..5 {
        h.mainframe
            .queue_package(&format!("batch-{i}"), "1.0", Vec::<String>::new())
            .await
            .unwrap();
    }

    let request = worker("worker-a");
    let first = h.mainframe.request_jobs(&request, 10).await.unwrap();
    assert_eq!(first.len(), 3);
    let second = h.mainframe.request_jobs(&request, 10).await.unwrap();
    assert_eq!(second.len(), 2);
    assert!(h.mainframe.request_jobs(&request, 10).await.unwrap().is_empty());
    assert!(matches!(
        h.mainframe.request_jobs(&request, 0).await,
        Err(CoreError::InvalidRequest(_))
    ));
}

#[tokio::test]
async fn transient_conflicts_are_retried() {
    let h = harness();
    h.mainframe.queue_package("retry", "1.0", Vec::<String>::new()).await.unwrap();
    h.store.inject_failure(StoreError::Conflict("could not serialize access".into()));
    h.store.inject_failure(StoreError::Conflict("deadlock detected".into()));

    let job = take_job(&h, &worker("worker-a")).await;
    assert_eq!(job.package, key("retry", "1.0"));
}

#[tokio::test]
async fn unavailable_store_is_surfaced() {
    let h = harness();
    h.store.inject_failure(StoreError::Unavailable("connection refused".into()));
    let err = h.mainframe.request_job(&worker("worker-a")).await.unwrap_err();
    assert!(err.is_unavailable());
    assert!(!matches!(err, CoreError::StoreConflictExhausted { .. }));
}

#[derive(Debug)]
struct FailingEnricher;

#[async_trait]
impl MetadataEnricher for FailingEnricher {
    async fn enrich(&self, package: &PackageKey) -> Result<Option<Enrichment>, EnrichmentError> {
        Err(EnrichmentError::NotFound(package.to_string()))
    }
}

#[derive(Debug)]
struct SlowEnricher;

#[async_trait]
impl MetadataEnricher for SlowEnricher {
    async fn enrich(&self, _package: &PackageKey) -> Result<Option<Enrichment>, EnrichmentError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Some(Enrichment::default()))
    }
}

#[tokio::test]
async fn enrichment_failure_does_not_block_allocation() {
    let store = Arc::new(InMemoryLedgerStore::new());
    let mut config = MainframeConfig::default();
    config.allocator.enrichment_timeout_ms = 20;

    for (enricher, name) in [
        (Arc::new(FailingEnricher) as Arc<dyn MetadataEnricher>, "fails"),
        (Arc::new(SlowEnricher) as Arc<dyn MetadataEnricher>, "slow"),
    ] {
        let mainframe = Mainframe::builder(store.clone())
            .with_enricher(enricher)
            .with_config(config.clone())
            .build()
            .unwrap();
        mainframe.queue_package(name, "1.0", Vec::<String>::new()).await.unwrap();
        let job = mainframe
            .request_job(&worker("worker-a"))
            .await
            .unwrap()
            .into_job()
            .unwrap();
        assert_eq!(job.package.name, name);
        assert!(job.enrichment.is_none());
        assert!(job.enrichment_failed);
    }
    store.check_invariants().unwrap();
}

#[tokio::test]
async fn empty_ledger_reports_no_work() {
    let h = harness();
    let allocation = h.mainframe.request_job(&worker("worker-a")).await.unwrap();
    assert_eq!(allocation, Allocation::NoWorkAvailable);
    assert_eq!(h.mainframe.reap_expired().await.unwrap(), 0);
}
