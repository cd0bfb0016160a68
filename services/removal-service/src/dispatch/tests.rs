use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};

use super::*;
use crate::providers::{BackgroundRemover, ProviderError, ProviderErrorKind};
use crate::quota::{ManualClock, PacingPolicy, QuotaStore, UsageStats};
use crate::storage::MemoryUsageBackend;

struct ScriptedRemover {
    outcome: Result<Bytes, ProviderError>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedRemover {
    fn succeeding(output: &'static [u8]) -> Arc<Self> {
        Arc::new(Self {
            outcome: Ok(Bytes::from_static(output)),
            delay: None,
            calls: AtomicUsize::new(0),
        })
    }

    fn failing(err: ProviderError) -> Arc<Self> {
        Arc::new(Self {
            outcome: Err(err),
            delay: None,
            calls: AtomicUsize::new(0),
        })
    }

    fn slow(output: &'static [u8], delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            outcome: Ok(Bytes::from_static(output)),
            delay: Some(delay),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackgroundRemover for ScriptedRemover {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn process(&self, _image: Bytes) -> Result<Bytes, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.outcome.clone()
    }
}

struct Harness {
    dispatcher: Dispatcher,
    local: Arc<ScriptedRemover>,
    remote: Arc<ScriptedRemover>,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn stats(&self) -> UsageStats {
        self.dispatcher.quota().snapshot()
    }
}

fn april_first() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 4, 1, 10, 0, 0).unwrap()
}

fn harness(
    limit: u64,
    used: u64,
    local: Arc<ScriptedRemover>,
    remote: Arc<ScriptedRemover>,
) -> Harness {
    let mut stats = UsageStats::new(limit, "2024-04");
    stats.api_calls_used = used;
    stats.total_processed = used;

    let clock = Arc::new(ManualClock::new(april_first()));
    let backend = Arc::new(MemoryUsageBackend::with_stats(stats));
    let quota = Arc::new(QuotaStore::open(backend, clock.clone(), limit).unwrap());
    let dispatcher = Dispatcher::new(
        quota,
        PacingPolicy::default(),
        local.clone(),
        remote.clone(),
    );

    Harness {
        dispatcher,
        local,
        remote,
        clock,
    }
}

fn image() -> Bytes {
    Bytes::from_static(b"\x89PNG input")
}

#[tokio::test]
async fn local_success_counts_local_only() {
    let h = harness(
        50,
        0,
        ScriptedRemover::succeeding(b"local-out"),
        ScriptedRemover::succeeding(b"remote-out"),
    );

    let result = h
        .dispatcher
        .remove_background(image(), RemovalOptions::default())
        .await;

    assert!(result.success);
    assert_eq!(result.method, Some(RemovalMethod::Local));
    assert_eq!(result.processed_image, Some(Bytes::from_static(b"local-out")));
    assert!(result.api_usage.is_none());
    assert_eq!(h.remote.calls(), 0);

    let stats = h.stats();
    assert_eq!(stats.local_processed, 1);
    assert_eq!(stats.total_processed, 1);
    assert_eq!(stats.api_calls_used, 0);
}

#[tokio::test]
async fn local_failure_falls_back_to_last_api_call() {
    let h = harness(
        50,
        49,
        ScriptedRemover::failing(ProviderError::generic("model not installed")),
        ScriptedRemover::succeeding(b"remote-out"),
    );

    let result = h
        .dispatcher
        .remove_background(image(), RemovalOptions::default())
        .await;

    assert!(result.success);
    assert_eq!(result.method, Some(RemovalMethod::Remote));
    assert_eq!(h.local.calls(), 1);
    assert_eq!(h.remote.calls(), 1);
    assert_eq!(
        result.api_usage,
        Some(ApiUsage {
            remaining: 0,
            total: 50
        })
    );

    let stats = h.stats();
    assert_eq!(stats.api_calls_used, 50);
    assert_eq!(stats.total_processed, 50);
    assert_eq!(stats.local_processed, 0);
}

#[tokio::test]
async fn exhausted_quota_never_calls_remote() {
    let h = harness(
        50,
        50,
        ScriptedRemover::failing(ProviderError::generic("model not installed")),
        ScriptedRemover::succeeding(b"remote-out"),
    );

    let result = h
        .dispatcher
        .remove_background(image(), RemovalOptions::default())
        .await;

    assert!(!result.success);
    assert_eq!(result.method, Some(RemovalMethod::Local));
    assert_eq!(h.remote.calls(), 0);
    let error = result.error.unwrap();
    assert!(error.contains("model not installed"));
    assert!(error.contains("API limit exceeded (50/50)"));
    assert!(matches!(
        result.failure,
        Some(RemovalFailure::QuotaExhausted { local: Some(_), .. })
    ));
    assert_eq!(h.stats().total_processed, 50);
}

#[tokio::test]
async fn remote_only_with_exhausted_quota_reports_no_method() {
    let h = harness(
        10,
        10,
        ScriptedRemover::succeeding(b"local-out"),
        ScriptedRemover::succeeding(b"remote-out"),
    );

    let options = RemovalOptions {
        force_remote: false,
        use_local: false,
    };
    let result = h.dispatcher.remove_background(image(), options).await;

    assert!(!result.success);
    assert_eq!(result.method, None);
    assert_eq!(h.local.calls(), 0);
    assert_eq!(h.remote.calls(), 0);
    assert_eq!(result.error.as_deref(), Some("API limit exceeded (10/10)"));
}

#[tokio::test]
async fn force_remote_skips_local() {
    let h = harness(
        50,
        5,
        ScriptedRemover::succeeding(b"local-out"),
        ScriptedRemover::succeeding(b"remote-out"),
    );

    let options = RemovalOptions {
        force_remote: true,
        use_local: true,
    };
    let result = h.dispatcher.remove_background(image(), options).await;

    assert!(result.success);
    assert_eq!(result.method, Some(RemovalMethod::Remote));
    assert_eq!(h.local.calls(), 0);
    assert_eq!(result.api_usage.unwrap().remaining, 44);
}

#[tokio::test]
async fn both_failures_are_combined_without_mutation() {
    let h = harness(
        50,
        3,
        ScriptedRemover::failing(ProviderError::generic("out of memory")),
        ScriptedRemover::failing(ProviderError::rate_limit("slow down")),
    );

    let result = h
        .dispatcher
        .remove_background(image(), RemovalOptions::default())
        .await;

    assert!(!result.success);
    assert_eq!(result.method, Some(RemovalMethod::Remote));
    assert_eq!(
        result.failure,
        Some(RemovalFailure::Combined {
            local: "out of memory".into(),
            remote_kind: ProviderErrorKind::RateLimit,
            remote: "slow down".into(),
        })
    );

    let stats = h.stats();
    assert_eq!(stats.api_calls_used, 3);
    assert_eq!(stats.total_processed, 3);
    assert_eq!(h.dispatcher.quota().in_flight(), 0);
}

#[tokio::test]
async fn remote_only_failure_is_not_retried() {
    let h = harness(
        50,
        0,
        ScriptedRemover::succeeding(b"local-out"),
        ScriptedRemover::failing(ProviderError::auth("bad key")),
    );

    let options = RemovalOptions {
        force_remote: false,
        use_local: false,
    };
    let result = h.dispatcher.remove_background(image(), options).await;

    assert!(!result.success);
    assert_eq!(h.remote.calls(), 1);
    assert_eq!(h.local.calls(), 0);
    assert_eq!(
        result.failure.and_then(|failure| failure.remote_kind()),
        Some(ProviderErrorKind::Auth)
    );
}

#[tokio::test]
async fn mixed_sequence_keeps_totals_consistent() {
    let local = ScriptedRemover::succeeding(b"local-out");
    let remote = ScriptedRemover::succeeding(b"remote-out");
    let h = harness(5, 0, local, remote);

    for _ in 0..7 {
        let result = h
            .dispatcher
            .remove_background(image(), RemovalOptions::default())
            .await;
        assert!(result.success);
    }
    let forced = RemovalOptions {
        force_remote: true,
        use_local: true,
    };
    for _ in 0..5 {
        let result = h.dispatcher.remove_background(image(), forced).await;
        assert!(result.success);
    }

    let stats = h.stats();
    assert_eq!(stats.local_processed, 7);
    assert_eq!(stats.api_calls_used, 5);
    assert_eq!(stats.total_processed, 12);

    let result = h.dispatcher.remove_background(image(), forced).await;
    assert!(!result.success);
    assert_eq!(h.remote.calls(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_forced_requests_never_oversubscribe() {
    let h = harness(
        10,
        0,
        ScriptedRemover::succeeding(b"local-out"),
        ScriptedRemover::slow(b"remote-out", Duration::from_millis(20)),
    );
    let forced = RemovalOptions {
        force_remote: true,
        use_local: true,
    };

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..40 {
        let dispatcher = h.dispatcher.clone();
        tasks.spawn(async move { dispatcher.remove_background(image(), forced).await });
    }

    let mut successes = 0;
    let mut remaining_seen = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let result = joined.unwrap();
        if result.success {
            successes += 1;
            remaining_seen.push(result.api_usage.unwrap().remaining);
        }
    }

    assert_eq!(successes, 10);
    assert_eq!(h.remote.calls(), 10);
    assert_eq!(h.stats().api_calls_used, 10);
    remaining_seen.sort_unstable();
    assert_eq!(remaining_seen, (0..10).collect::<Vec<u64>>());
}

#[tokio::test]
async fn dropped_caller_still_completes_and_counts() {
    let h = harness(
        50,
        0,
        ScriptedRemover::succeeding(b"local-out"),
        ScriptedRemover::slow(b"remote-out", Duration::from_millis(50)),
    );
    let forced = RemovalOptions {
        force_remote: true,
        use_local: true,
    };

    let cancelled = tokio::time::timeout(
        Duration::from_millis(5),
        h.dispatcher.remove_background(image(), forced),
    )
    .await;
    assert!(cancelled.is_err());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.remote.calls(), 1);
    assert_eq!(h.stats().api_calls_used, 1);
    assert_eq!(h.dispatcher.quota().in_flight(), 0);
}

#[tokio::test]
async fn paced_prefers_remote_when_allowance_is_ahead() {
    // April 1st: 29 days left, 50 calls left.
    let h = harness(
        50,
        0,
        ScriptedRemover::succeeding(b"local-out"),
        ScriptedRemover::succeeding(b"remote-out"),
    );

    let result = h.dispatcher.remove_background_paced(image(), false).await;

    assert!(result.success);
    assert_eq!(result.method, Some(RemovalMethod::Remote));
    assert_eq!(h.local.calls(), 0);
    assert_eq!(result.api_usage.unwrap().remaining, 49);
}

#[tokio::test]
async fn paced_keeps_reserve_near_month_end() {
    let h = harness(
        50,
        48,
        ScriptedRemover::succeeding(b"local-out"),
        ScriptedRemover::succeeding(b"remote-out"),
    );
    h.clock
        .set(Utc.with_ymd_and_hms(2024, 4, 28, 10, 0, 0).unwrap());

    let result = h.dispatcher.remove_background_paced(image(), false).await;

    assert!(result.success);
    assert_eq!(result.method, Some(RemovalMethod::Local));
    assert_eq!(h.remote.calls(), 0);
    assert_eq!(h.stats().api_calls_used, 48);
}

#[tokio::test]
async fn paced_remote_failure_falls_back_to_local_once() {
    let h = harness(
        50,
        0,
        ScriptedRemover::failing(ProviderError::generic("no model")),
        ScriptedRemover::failing(ProviderError::timeout("too slow")),
    );

    let result = h.dispatcher.remove_background_paced(image(), false).await;

    assert!(!result.success);
    assert_eq!(result.method, Some(RemovalMethod::Local));
    assert_eq!(h.remote.calls(), 1);
    assert_eq!(h.local.calls(), 1);
    assert_eq!(
        result.failure,
        Some(RemovalFailure::Combined {
            local: "no model".into(),
            remote_kind: ProviderErrorKind::Timeout,
            remote: "too slow".into(),
        })
    );
    assert_eq!(h.stats().total_processed, 0);
}

#[tokio::test]
async fn usage_stats_reads_are_stable() {
    let h = harness(
        50,
        2,
        ScriptedRemover::succeeding(b"local-out"),
        ScriptedRemover::succeeding(b"remote-out"),
    );

    let first = h.dispatcher.usage_stats();
    let second = h.dispatcher.usage_stats();
    assert_eq!(first, second);
    assert_eq!(first.used, 2);
    assert_eq!(first.remaining, 48);
}

struct PanickingRemover {
    calls: AtomicUsize,
}

impl PanickingRemover {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl BackgroundRemover for PanickingRemover {
    fn name(&self) -> &'static str {
        "panicking"
    }

    async fn process(&self, _image: Bytes) -> Result<Bytes, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        panic!("provider blew up");
    }
}

fn quota_at_april_first(limit: u64) -> Arc<QuotaStore> {
    let clock = Arc::new(ManualClock::new(april_first()));
    let backend = Arc::new(MemoryUsageBackend::new());
    Arc::new(QuotaStore::open(backend, clock, limit).unwrap())
}

#[tokio::test]
async fn local_panic_falls_back_to_remote() {
    let quota = quota_at_april_first(50);
    let local = PanickingRemover::new();
    let remote = ScriptedRemover::succeeding(b"remote-out");
    let dispatcher = Dispatcher::new(
        Arc::clone(&quota),
        PacingPolicy::default(),
        local.clone(),
        remote.clone(),
    );

    let result = dispatcher
        .remove_background(image(), RemovalOptions::default())
        .await;

    assert!(result.success);
    assert_eq!(result.method, Some(RemovalMethod::Remote));
    assert_eq!(local.calls.load(Ordering::SeqCst), 1);
    assert_eq!(remote.calls(), 1);
    assert_eq!(result.api_usage.unwrap().remaining, 49);
    assert_eq!(quota.snapshot().api_calls_used, 1);
}

#[tokio::test]
async fn remote_panic_is_combined_failure_and_releases_slot() {
    let quota = quota_at_april_first(50);
    let dispatcher = Dispatcher::new(
        Arc::clone(&quota),
        PacingPolicy::default(),
        ScriptedRemover::failing(ProviderError::generic("no model")),
        PanickingRemover::new(),
    );

    let result = dispatcher
        .remove_background(image(), RemovalOptions::default())
        .await;

    assert!(!result.success);
    assert_eq!(result.method, Some(RemovalMethod::Remote));
    match result.failure {
        Some(RemovalFailure::Combined {
            local,
            remote_kind,
            remote,
        }) => {
            assert_eq!(local, "no model");
            assert_eq!(remote_kind, ProviderErrorKind::Generic);
            assert!(remote.contains("provider blew up"));
        }
        other => panic!("expected combined failure, got {other:?}"),
    }
    assert_eq!(quota.snapshot().api_calls_used, 0);
    assert_eq!(quota.in_flight(), 0);
}

#[tokio::test]
async fn paced_lost_reservation_reports_exhaustion_and_local_error() {
    let h = harness(
        10,
        0,
        ScriptedRemover::failing(ProviderError::generic("no model")),
        ScriptedRemover::succeeding(b"remote-out"),
    );
    // Another caller holds every slot, but the committed counters still
    // look roomy to the pacing check.
    let quota = Arc::clone(h.dispatcher.quota());
    h.clock
        .set(Utc.with_ymd_and_hms(2024, 4, 28, 10, 0, 0).unwrap());
    let holds: Vec<_> = (0..10).map(|_| quota.try_reserve_api().unwrap()).collect();

    let result = h.dispatcher.remove_background_paced(image(), false).await;
    drop(holds);

    assert!(!result.success);
    assert_eq!(result.method, Some(RemovalMethod::Local));
    assert_eq!(h.remote.calls(), 0);
    assert_eq!(h.local.calls(), 1);
    assert_eq!(
        result.failure,
        Some(RemovalFailure::QuotaExhausted {
            used: 0,
            limit: 10,
            local: Some("no model".into()),
        })
    );
    let error = result.error.unwrap();
    assert!(error.contains("no model"));
    assert!(error.contains("API limit exceeded (0/10)"));
    assert_eq!(quota.in_flight(), 0);
}
