//! Behaviour tests for the request pipeline: retries, cancellation, quota
//! protection and how outcomes feed back into the shared components.

use std::time::Duration;

use shopwire_core::Origin;
use shopwire_tests::*;
use tokio_util::sync::CancellationToken;

fn orchestrator_with(source: Arc<ScriptedSource>) -> Orchestrator {
    Orchestrator::builder()
        .with_source(source)
        .with_rate_limit(lenient_limits())
        .build()
}

// =============================================================================
// Retries
// =============================================================================

#[tokio::test(start_paused = true)]
async fn transient_failure_is_retried_until_the_provider_recovers() {
    // Given: a provider that is unavailable twice before answering
    let source = ScriptedSource::new("shopapi")
        .then(Reply::Fail(unavailable()))
        .then(Reply::Fail(unavailable()))
        .always(Reply::Products(4))
        .shared();
    let orchestrator = Orchestrator::builder()
        .with_source(source.clone())
        .with_rate_limit(lenient_limits())
        .with_retry(RetryConfig::fixed(Duration::from_millis(250), 3))
        .build();

    // When: a search runs
    let fetched = orchestrator
        .search(&provider("shopapi"), &search("kettle"), &RequestOptions::default())
        .await
        .expect("third attempt succeeds");

    // Then: the answer comes from the network after three attempts
    assert_eq!(fetched.origin, Origin::Network);
    assert_eq!(fetched.attempts, 3);
    assert_eq!(fetched.value.len(), 4);
    assert_eq!(source.calls(), 3);

    // And: every attempt that reached the provider counts against the budget
    assert_eq!(orchestrator.quota().status().daily_used, 3);
    let shopapi = provider("shopapi");
    assert_eq!(orchestrator.breakers().get(&shopapi).consecutive_failures(), 0);
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_is_not_retried() {
    let source = ScriptedSource::new("shopapi")
        .always(Reply::Fail(SourceError::authentication("bad key")))
        .shared();
    let orchestrator = orchestrator_with(source.clone());

    let error = orchestrator
        .search(&provider("shopapi"), &search("kettle"), &RequestOptions::default())
        .await
        .expect_err("authentication fails");

    assert_eq!(error.kind(), SourceErrorKind::AuthenticationFailed);
    assert_eq!(error.provider(), Some(&provider("shopapi")));
    assert_eq!(source.calls(), 1);
    assert_eq!(
        orchestrator.breakers().get(&provider("shopapi")).consecutive_failures(),
        1
    );
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_backoff_wait() {
    // Given: a provider that keeps failing and a long backoff between retries
    let source = ScriptedSource::new("shopapi")
        .always(Reply::Fail(unavailable()))
        .shared();
    let orchestrator = Orchestrator::builder()
        .with_source(source.clone())
        .with_rate_limit(lenient_limits())
        .with_retry(RetryConfig::fixed(Duration::from_secs(10), 5))
        .build();
    let cancel = CancellationToken::new();
    let options = RequestOptions::default().with_cancellation(cancel.clone());
    let shopapi = provider("shopapi");
    let request = search("kettle");

    // When: the caller cancels while the pipeline waits to retry
    let (result, ()) = tokio::join!(
        orchestrator.search(&shopapi, &request, &options),
        async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        }
    );

    // Then: no further attempt is made
    let error = result.expect_err("cancelled");
    assert_eq!(error.kind(), SourceErrorKind::Cancelled);
    assert_eq!(source.calls(), 1);

    // And: the completed attempt stays recorded while cancellation itself is not a failure
    assert_eq!(orchestrator.quota().status().daily_used, 1);
    assert_eq!(
        orchestrator.breakers().get(&provider("shopapi")).consecutive_failures(),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_in_flight_call() {
    // Given: a provider that never answers and a generous call timeout
    let source = ScriptedSource::new("shopapi").always(Reply::Hang).shared();
    let orchestrator = Orchestrator::builder()
        .with_source(source.clone())
        .with_rate_limit(lenient_limits())
        .with_call_timeout(Duration::from_secs(60))
        .build();
    let cancel = CancellationToken::new();
    let options = RequestOptions::default().with_cancellation(cancel.clone());

    let shopapi = provider("shopapi");
    let request = search("kettle");

    // When: the caller gives up after one second
    let started = tokio::time::Instant::now();
    let (result, ()) = tokio::join!(
        orchestrator.search(&shopapi, &request, &options),
        async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        }
    );

    // Then: the call ends promptly without charging the breaker
    assert_eq!(result.expect_err("cancelled").kind(), SourceErrorKind::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(60));
    let breaker = orchestrator.breakers().get(&shopapi);
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.consecutive_failures(), 0);
}

#[tokio::test]
async fn cancelled_token_prevents_any_call() {
    let source = ScriptedSource::new("shopapi").shared();
    let orchestrator = orchestrator_with(source.clone());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let error = orchestrator
        .search(
            &provider("shopapi"),
            &search("kettle"),
            &RequestOptions::default().with_cancellation(cancel),
        )
        .await
        .expect_err("already cancelled");

    assert_eq!(error.kind(), SourceErrorKind::Cancelled);
    assert_eq!(source.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_fan_out_reports_every_provider_cancelled() {
    let first = ScriptedSource::new("alpha").always(Reply::Hang).shared();
    let second = ScriptedSource::new("bravo").always(Reply::Hang).shared();
    let orchestrator = Orchestrator::builder()
        .with_source(first)
        .with_source(second)
        .with_rate_limit(lenient_limits())
        .with_call_timeout(Duration::from_secs(60))
        .build();
    let cancel = CancellationToken::new();
    let options = RequestOptions::default().with_cancellation(cancel.clone());
    let request = search("kettle");

    let (result, ()) = tokio::join!(orchestrator.search_all(&request, &options), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let failure = result.expect_err("nothing answered");
    assert_eq!(failure.providers.len(), 2);
    assert!(failure
        .providers
        .iter()
        .all(|report| report.error.as_ref().map(|error| error.kind) == Some(SourceErrorKind::Cancelled)));
}

// =============================================================================
// Circuit breaking through the pipeline
// =============================================================================

#[tokio::test(start_paused = true)]
async fn open_circuit_short_circuits_until_a_probe_succeeds() {
    // Given: a breaker that opens on the first failure and probes once after 30s
    let source = ScriptedSource::new("shopapi")
        .then(Reply::Fail(not_found()))
        .always(Reply::Products(1))
        .shared();
    let orchestrator = Orchestrator::builder()
        .with_source(source.clone())
        .with_rate_limit(lenient_limits())
        .with_circuit_breaker(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_requests: 1,
        })
        .build();
    let shopapi = provider("shopapi");
    let bypass = RequestOptions::default().with_cache_mode(CacheMode::Bypass);

    // When: the first call fails
    assert!(orchestrator
        .search(&shopapi, &search("kettle"), &bypass)
        .await
        .is_err());

    // Then: the next call is refused without reaching the provider
    let refused = orchestrator
        .search(&shopapi, &search("kettle"), &bypass)
        .await
        .expect_err("circuit open");
    assert_eq!(refused.kind(), SourceErrorKind::CircuitOpen);
    assert_eq!(source.calls(), 1);

    // When: the recovery timeout passes and the probe succeeds
    tokio::time::advance(Duration::from_secs(30)).await;
    orchestrator
        .search(&shopapi, &search("kettle"), &bypass)
        .await
        .expect("probe admitted");

    // Then: the circuit is closed again
    assert_eq!(orchestrator.breakers().get(&shopapi).state(), CircuitState::Closed);
    assert_eq!(source.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_call_never_reaches_provider_nor_trips_breaker() {
    let source = ScriptedSource::new("shopapi").shared();
    let shopapi = provider("shopapi");
    let orchestrator = Orchestrator::builder()
        .with_source(source.clone())
        .with_provider_rate_limit(
            shopapi.clone(),
            RateLimitConfig {
                requests_per_minute: 2,
                ..RateLimitConfig::default()
            },
        )
        .build();
    let bypass = RequestOptions::default().with_cache_mode(CacheMode::Bypass);

    for _ in 0..2 {
        orchestrator
            .search(&shopapi, &search("kettle"), &bypass)
            .await
            .expect("within limit");
    }
    let error = orchestrator
        .search(&shopapi, &search("kettle"), &bypass)
        .await
        .expect_err("limit reached");

    assert_eq!(error.kind(), SourceErrorKind::RateLimitExceeded);
    assert!(error.kind().is_local());
    assert_eq!(source.calls(), 2);
    assert_eq!(orchestrator.breakers().get(&shopapi).consecutive_failures(), 0);
}

// =============================================================================
// Quota protection and caching
// =============================================================================

#[tokio::test]
async fn quota_block_serves_cached_answers_and_refuses_new_ones() {
    // Given: a daily budget of 4 requests with a 50% safety margin
    let source = ScriptedSource::new("shopapi").always(Reply::Products(2)).shared();
    let orchestrator = Orchestrator::builder()
        .with_source(source.clone())
        .with_rate_limit(lenient_limits())
        .with_quota(QuotaConfig {
            daily_limit: 4,
            safety_margin: 0.5,
            ..QuotaConfig::default()
        })
        .build();
    let shopapi = provider("shopapi");
    let options = RequestOptions::default();

    // When: two distinct searches use up the margin
    orchestrator
        .search(&shopapi, &search("kettle"), &options)
        .await
        .expect("first search");
    orchestrator
        .search(&shopapi, &search("toaster"), &options)
        .await
        .expect("second search");
    assert!(orchestrator.quota().status().blocking);

    // Then: a cached query is still answered from the cache
    let cached = orchestrator
        .search(&shopapi, &search("  Kettle "), &options)
        .await
        .expect("served from cache");
    assert_eq!(cached.origin, Origin::Cache);
    assert_eq!(cached.attempts, 0);

    // And: a new query is refused without a provider call
    let refused = orchestrator
        .search(&shopapi, &search("blender"), &options)
        .await
        .expect_err("quota exhausted");
    assert_eq!(refused.kind(), SourceErrorKind::QuotaExceeded);
    assert_eq!(source.calls(), 2);

    // When: the daily counter is reset
    orchestrator.reset_daily_counter();

    // Then: the network is open again
    assert!(orchestrator
        .search(&shopapi, &search("blender"), &options)
        .await
        .is_ok());
}

#[tokio::test]
async fn demo_mode_blocks_the_network_until_disabled() {
    let source = ScriptedSource::new("shopapi").shared();
    let orchestrator = orchestrator_with(source.clone());
    let shopapi = provider("shopapi");

    orchestrator.enable_demo_mode();
    let error = orchestrator
        .details(
            &shopapi,
            &DetailsRequest::new("shopapi-0").expect("valid id"),
            &RequestOptions::default(),
        )
        .await
        .expect_err("demo mode");
    assert_eq!(error.kind(), SourceErrorKind::DemoModeActive);
    assert_eq!(source.calls(), 0);

    orchestrator.disable_demo_mode();
    let fetched = orchestrator
        .details(
            &shopapi,
            &DetailsRequest::new("shopapi-0").expect("valid id"),
            &RequestOptions::default(),
        )
        .await
        .expect("network allowed");
    assert_eq!(fetched.value.id, "shopapi-0");
}

#[tokio::test(start_paused = true)]
async fn demo_mode_enabled_during_backoff_stops_the_retry() {
    // Given: a provider that fails once, then recovers, behind a 10s backoff
    let source = ScriptedSource::new("shopapi")
        .then(Reply::Fail(unavailable()))
        .always(Reply::Products(1))
        .shared();
    let orchestrator = Orchestrator::builder()
        .with_source(source.clone())
        .with_rate_limit(lenient_limits())
        .with_retry(RetryConfig::fixed(Duration::from_secs(10), 3))
        .build();
    let shopapi = provider("shopapi");
    let request = search("kettle");
    let options = RequestOptions::default();

    // When: demo mode is switched on while the pipeline waits to retry
    let (result, ()) = tokio::join!(orchestrator.search(&shopapi, &request, &options), async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        orchestrator.enable_demo_mode();
    });

    // Then: the retry never reaches the provider
    let error = result.expect_err("demo mode");
    assert_eq!(error.kind(), SourceErrorKind::DemoModeActive);
    assert_eq!(source.calls(), 1);

    // And: switching demo mode off opens the network again
    orchestrator.disable_demo_mode();
    let recovered = orchestrator
        .search(&shopapi, &request, &options)
        .await
        .expect("provider recovered");
    assert_eq!(recovered.origin, Origin::Network);
}

#[tokio::test(start_paused = true)]
async fn quota_margin_reached_by_a_failed_attempt_stops_the_retry() {
    // Given: a daily budget of 2 with a 50% margin and a provider that is unavailable
    let source = ScriptedSource::new("shopapi")
        .always(Reply::Fail(unavailable()))
        .shared();
    let orchestrator = Orchestrator::builder()
        .with_source(source.clone())
        .with_rate_limit(lenient_limits())
        .with_retry(RetryConfig::fixed(Duration::from_secs(1), 3))
        .with_quota(QuotaConfig {
            daily_limit: 2,
            safety_margin: 0.5,
            ..QuotaConfig::default()
        })
        .build();

    // When: the first 503 spends the usable budget
    let error = orchestrator
        .search(&provider("shopapi"), &search("kettle"), &RequestOptions::default())
        .await
        .expect_err("budget spent");

    // Then: the pipeline stops before a second call
    assert_eq!(error.kind(), SourceErrorKind::QuotaExceeded);
    assert_eq!(source.calls(), 1);
    assert_eq!(orchestrator.quota().status().daily_used, 1);
}

#[tokio::test]
async fn high_priority_option_reaches_the_global_reserve() {
    let source = ScriptedSource::new("shopapi").shared();
    let orchestrator = Orchestrator::builder()
        .with_source(source.clone())
        .with_rate_limit(lenient_limits())
        .with_global_rate_limit(shopwire_core::GlobalRateLimitConfig {
            requests_per_minute: 2,
            high_priority_reserve: 0.5,
        })
        .build();
    let shopapi = provider("shopapi");
    let normal = RequestOptions::default().with_cache_mode(CacheMode::Bypass);
    let high = normal.clone().with_priority(RequestPriority::High);

    orchestrator
        .search(&shopapi, &search("kettle"), &normal)
        .await
        .expect("normal share");
    let refused = orchestrator
        .search(&shopapi, &search("kettle"), &normal)
        .await
        .expect_err("normal share used up");
    assert_eq!(refused.kind(), SourceErrorKind::RateLimitExceeded);

    orchestrator
        .search(&shopapi, &search("kettle"), &high)
        .await
        .expect("reserved share");
    assert_eq!(source.calls(), 2);
}
