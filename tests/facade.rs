//! End-to-end behavior of the resilient client facade.

use coursegen_resilience::cache::MemoryCache;
use coursegen_resilience::resilience::{
    BreakerState, CircuitBreakerConfig, RateLimiterConfig, RetryConfig,
};
use coursegen_resilience::telemetry::InMemoryMetricsSink;
use coursegen_resilience::{
    CallOptions, Error, ErrorKind, OperationError, ResilienceConfig, ResilientClient, ServiceId,
    ServicePolicy,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn quick_retry(attempts: u32) -> RetryConfig {
    RetryConfig::new()
        .with_max_attempts(attempts)
        .with_base_delay(Duration::from_millis(5))
        .with_jitter(false)
}

fn client_with(policy: ServicePolicy) -> ResilientClient {
    ResilientClient::builder()
        .cache_backend(Arc::new(MemoryCache::new(128)))
        .service_policy(ServiceId::llm(), policy)
        .build()
        .unwrap()
}

#[tokio::test]
async fn cached_result_is_served_even_when_guards_would_reject() {
    let client = client_with(
        ServicePolicy::default()
            .with_breaker(CircuitBreakerConfig::new().with_failure_threshold(1))
            .with_rate_limit(RateLimiterConfig::per_minute(2))
            .with_retry(RetryConfig::no_retry()),
    );
    let llm = client.service(ServiceId::llm());
    let key = client.keys().completion("m", None, "define RAG", None);
    let calls = Arc::new(AtomicU32::new(0));

    let first: String = llm
        .call(Some(&key), &CallOptions::default(), || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("retrieval-augmented generation".to_string())
            }
        })
        .await
        .unwrap();

    // Uses the last unit of quota and opens the breaker.
    let _ = llm
        .call::<String, _, _>(None, &CallOptions::default(), || async {
            Err(OperationError::server("boom"))
        })
        .await;
    assert!(llm.signals().would_reject());

    let (second, stats) = llm
        .call_with_stats(Some(&key), &CallOptions::default(), || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("fresh".to_string())
            }
        })
        .await
        .unwrap();

    assert_eq!(first, second);
    assert!(stats.cache_hit);
    assert_eq!(stats.attempts, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn open_breaker_rejects_without_invoking_the_operation() {
    let client = client_with(
        ServicePolicy::default()
            .with_breaker(
                CircuitBreakerConfig::new()
                    .with_failure_threshold(3)
                    .with_reset_timeout(Duration::from_secs(60)),
            )
            .with_retry(RetryConfig::no_retry()),
    );
    let llm = client.service(ServiceId::llm());
    let calls = Arc::new(AtomicU32::new(0));
    let failing = || {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<String, _>(OperationError::from_status(502, "bad gateway"))
        }
    };

    for _ in 0..3 {
        let err = llm.call(None, &CallOptions::default(), failing).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OperationFailedRetryable);
    }
    assert_eq!(llm.signals().circuit_breaker.state, BreakerState::Open);

    let err = llm.call(None, &CallOptions::default(), failing).await.unwrap_err();
    match err {
        Error::BreakerOpen {
            service,
            open_remaining,
        } => {
            assert_eq!(service, ServiceId::llm());
            assert!(open_remaining.is_some());
        }
        other => panic!("expected BreakerOpen, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let snap = client.metrics();
    assert_eq!(snap.counter("calls{outcome=failure,service=llm}"), 3);
    assert_eq!(snap.counter("calls{outcome=rejected_by_breaker,service=llm}"), 1);
    assert_eq!(
        snap.counter("breaker.transitions{from=closed,service=llm,to=open}"),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn half_open_admits_one_probe_among_concurrent_callers() {
    let client = client_with(
        ServicePolicy::default()
            .with_breaker(
                CircuitBreakerConfig::new()
                    .with_failure_threshold(1)
                    .with_reset_timeout(Duration::from_millis(50)),
            )
            .with_retry(RetryConfig::no_retry()),
    );
    let llm = client.service(ServiceId::llm());
    let _ = llm
        .call::<String, _, _>(None, &CallOptions::default(), || async {
            Err(OperationError::server("down"))
        })
        .await;
    assert_eq!(llm.signals().circuit_breaker.state, BreakerState::Open);
    tokio::time::sleep(Duration::from_millis(80)).await;

    let invoked = Arc::new(AtomicU32::new(0));
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let llm = llm.clone();
        let invoked = invoked.clone();
        tasks.push(tokio::spawn(async move {
            llm.call(None, &CallOptions::default(), || {
                let invoked = invoked.clone();
                async move {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<_, OperationError>(1u32)
                }
            })
            .await
        }));
    }

    let mut ok = 0;
    let mut rejected = 0;
    for t in tasks {
        match t.await.unwrap() {
            Ok(_) => ok += 1,
            Err(Error::BreakerOpen { .. }) => rejected += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(rejected, 7);
    assert_eq!(invoked.load(Ordering::SeqCst), 1);
    assert_eq!(llm.signals().circuit_breaker.state, BreakerState::Closed);
}

#[tokio::test]
async fn limiter_rejects_beyond_quota_and_waits_when_asked() {
    let client = client_with(
        ServicePolicy::default()
            .with_rate_limit(RateLimiterConfig::new(2, Duration::from_millis(200)))
            .with_retry(RetryConfig::no_retry()),
    );
    let llm = client.service(ServiceId::llm());
    let ok = || async { Ok::<_, OperationError>(7u8) };

    assert_eq!(llm.call(None, &CallOptions::default(), ok).await.unwrap(), 7);
    assert_eq!(llm.call(None, &CallOptions::default(), ok).await.unwrap(), 7);

    let err = llm.call(None, &CallOptions::default(), ok).await.unwrap_err();
    match err {
        Error::RateLimited { retry_after, .. } => {
            let wait = retry_after.expect("a full window reports its wait");
            assert!(wait <= Duration::from_millis(200));
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }

    let patient = CallOptions::default().wait_for_quota(Duration::from_secs(1));
    let (v, stats) = llm.call_with_stats(None, &patient, ok).await.unwrap();
    assert_eq!(v, 7);
    assert!(stats.latency >= Duration::from_millis(100));

    let snap = client.metrics();
    assert_eq!(snap.counter("calls{outcome=rejected_by_limiter,service=llm}"), 1);
    assert_eq!(snap.counter("calls{outcome=success,service=llm}"), 3);
}

#[tokio::test]
async fn quota_wait_times_out() {
    let client = client_with(
        ServicePolicy::default()
            .with_rate_limit(RateLimiterConfig::per_minute(1))
            .with_retry(RetryConfig::no_retry()),
    );
    let llm = client.service(ServiceId::llm());
    let ok = || async { Ok::<_, OperationError>(()) };
    llm.call(None, &CallOptions::default(), ok).await.unwrap();

    let patient = CallOptions::default().wait_for_quota(Duration::from_millis(50));
    let err = llm.call(None, &patient, ok).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[tokio::test]
async fn huge_retry_after_hint_blocks_without_crashing() {
    let client = client_with(
        ServicePolicy::default()
            .with_rate_limit(RateLimiterConfig::per_minute(10))
            .with_retry(RetryConfig::no_retry()),
    );
    let llm = client.service(ServiceId::llm());

    let err = llm
        .call::<String, _, _>(None, &CallOptions::default(), || async {
            Err(OperationError::from_status(429, "slow down")
                .with_retry_after(Duration::from_secs(u64::MAX)))
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OperationFailedRetryable);

    let err = llm
        .call(None, &CallOptions::default(), || async {
            Ok::<_, OperationError>("too soon".to_string())
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RateLimited);
    assert!(llm.signals().rate_limiter.estimated_wait_ms.is_some());
}

#[tokio::test]
async fn retries_transient_failures_then_succeeds() {
    let client = client_with(ServicePolicy::default().with_retry(quick_retry(4)));
    let llm = client.service(ServiceId::llm());
    let calls = Arc::new(AtomicU32::new(0));

    let (value, stats) = llm
        .call_with_stats(None, &CallOptions::default(), || {
            let calls = calls.clone();
            async move {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 => Err(OperationError::timeout("slow")),
                    1 => Err(OperationError::network("reset")),
                    _ => Ok("done".to_string()),
                }
            }
        })
        .await
        .unwrap();

    assert_eq!(value, "done");
    assert_eq!(stats.attempts, 3);
    assert!(!stats.cache_hit);
    // Retries inside one call report a single success to the breaker.
    assert_eq!(llm.signals().circuit_breaker.consecutive_failures, 0);
}

#[tokio::test]
async fn permanent_failures_are_not_retried() {
    let client = client_with(ServicePolicy::default().with_retry(quick_retry(5)));
    let llm = client.service(ServiceId::llm());
    let calls = Arc::new(AtomicU32::new(0));

    let err = llm
        .call::<String, _, _>(None, &CallOptions::default(), || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(OperationError::authentication("bad key"))
            }
        })
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(err.kind(), ErrorKind::OperationFailedPermanent);
    assert_eq!(err.attempts(), Some(1));
}

#[tokio::test]
async fn exhausted_retries_report_attempt_count() {
    let client = client_with(ServicePolicy::default().with_retry(quick_retry(3)));
    let llm = client.service(ServiceId::llm());

    let err = llm
        .call::<String, _, _>(None, &CallOptions::default(), || async {
            Err(OperationError::server("still down"))
        })
        .await
        .unwrap_err();

    assert_eq!(err.attempts(), Some(3));
    assert_eq!(err.kind(), ErrorKind::OperationFailedRetryable);
    assert_eq!(err.service(), Some(&ServiceId::llm()));
}

#[tokio::test]
async fn services_are_isolated() {
    let client = ResilientClient::builder()
        .cache_backend(Arc::new(MemoryCache::new(16)))
        .default_policy(
            ServicePolicy::default()
                .with_breaker(CircuitBreakerConfig::new().with_failure_threshold(1))
                .with_retry(RetryConfig::no_retry()),
        )
        .build()
        .unwrap();
    let images = client.service("images-b");
    let voice = client.service("voice-b");

    let _ = images
        .call::<String, _, _>(None, &CallOptions::default(), || async {
            Err(OperationError::server("gpu pool empty"))
        })
        .await;

    assert_eq!(images.signals().circuit_breaker.state, BreakerState::Open);
    assert_eq!(voice.signals().circuit_breaker.state, BreakerState::Closed);
    let v: u8 = voice
        .call(None, &CallOptions::default(), || async { Ok(1) })
        .await
        .unwrap();
    assert_eq!(v, 1);
}

#[tokio::test]
async fn cache_metrics_are_tagged_by_service() {
    let client = client_with(ServicePolicy::default());
    let llm = client.service(ServiceId::llm());
    let key = client.keys().completion("m", None, "tag me", None);

    for _ in 0..3 {
        let _: String = llm
            .call(Some(&key), &CallOptions::default(), || async {
                Ok("v".to_string())
            })
            .await
            .unwrap();
    }

    let snap = client.metrics();
    assert_eq!(snap.counter("cache.lookups{outcome=miss,service=llm}"), 1);
    assert_eq!(snap.counter("cache.lookups{outcome=hit,service=llm}"), 2);
    assert_eq!(snap.counter("cache.writes{service=llm}"), 1);
    assert_eq!(client.cache().stats().hit_ratio(), 2.0 / 3.0);
}

#[tokio::test]
async fn health_reports_open_breakers() {
    let client = client_with(
        ServicePolicy::default()
            .with_breaker(CircuitBreakerConfig::new().with_failure_threshold(1))
            .with_retry(RetryConfig::no_retry()),
    );
    let before = client.check_health();
    assert!(before.healthy);
    assert!(before.probes.contains_key("cache"));
    assert!(before.probes.contains_key("breaker.llm"));

    let _ = client
        .call::<String, _, _>(&ServiceId::llm(), None, &CallOptions::default(), || async {
            Err(OperationError::server("down"))
        })
        .await;

    let after = client.check_health();
    assert!(!after.healthy);
    assert!(!after.probes["breaker.llm"].healthy);
    assert!(after.probes["cache"].healthy);
}

#[tokio::test]
async fn health_covers_services_first_seen_at_call_time() {
    let client = ResilientClient::builder()
        .cache_backend(Arc::new(MemoryCache::new(16)))
        .default_policy(
            ServicePolicy::default()
                .with_breaker(CircuitBreakerConfig::new().with_failure_threshold(1))
                .with_retry(RetryConfig::no_retry()),
        )
        .build()
        .unwrap();
    let embeddings = ServiceId::new("embeddings");
    assert!(!client.check_health().probes.contains_key("breaker.embeddings"));

    let _ = client
        .call::<String, _, _>(&embeddings, None, &CallOptions::default(), || async {
            Err(OperationError::server("down"))
        })
        .await;

    let health = client.check_health();
    assert!(!health.healthy);
    assert!(!health.probes["breaker.embeddings"].healthy);
}

#[tokio::test]
async fn export_pushes_samples_to_the_sink_when_enabled() {
    let mut config = ResilienceConfig::default();
    config.metrics.export_enabled = true;
    let sink = Arc::new(InMemoryMetricsSink::new(4));
    let client = ResilientClient::builder()
        .config(config)
        .cache_backend(Arc::new(MemoryCache::new(16)))
        .metrics_sink(sink.clone())
        .build()
        .unwrap();

    let _: u8 = client
        .call(&ServiceId::tts(), None, &CallOptions::default(), || async { Ok(3) })
        .await
        .unwrap();

    let exported = client.export_metrics().await.unwrap();
    assert!(exported > 0);
    let batch = sink.latest().unwrap();
    assert_eq!(batch.len(), exported);
    assert!(batch
        .iter()
        .any(|s| s.name == "calls" && s.tags.get("outcome").map(String::as_str) == Some("success")));
}
