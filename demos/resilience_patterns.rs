//! Resilience patterns walk-through
//!
//! Runs a simulated flaky provider through the resilient client and prints
//! what each guard did:
//!
//! 1. retry with backoff recovering from transient 503s
//! 2. the cache answering a repeated request without calling the provider
//! 3. the circuit breaker opening after consecutive failures, then probing
//! 4. the rate limiter rejecting a burst, and a caller waiting for quota
//!
//! Run with:
//!   cargo run --example resilience_patterns
//!
//! Set `RUST_LOG=coursegen_resilience=debug` to see the guards' own logs.

use coursegen_resilience::resilience::{CircuitBreakerConfig, RateLimiterConfig, RetryConfig};
use coursegen_resilience::{
    CallOptions, OperationError, ResilientClient, ServiceId, ServicePolicy,
};
use futures::future::join_all;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A provider that fails its first `failures` calls with a 503.
struct FlakyProvider {
    calls: AtomicU32,
    failures: u32,
}

impl FlakyProvider {
    fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            failures,
        })
    }

    async fn generate(&self, prompt: &str) -> Result<String, OperationError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(Duration::from_millis(20)).await;
        if n <= self.failures {
            return Err(OperationError::from_status(503, "provider overloaded"));
        }
        Ok(format!("[call {n}] lesson text for: {prompt}"))
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let fast_retry = RetryConfig::new()
        .with_max_attempts(3)
        .with_base_delay(Duration::from_millis(50));
    let client = ResilientClient::builder()
        .service_policy(
            ServiceId::llm(),
            ServicePolicy::default()
                .with_retry(fast_retry)
                .with_breaker(
                    CircuitBreakerConfig::new()
                        .with_failure_threshold(2)
                        .with_reset_timeout(Duration::from_millis(500)),
                ),
        )
        .service_policy(
            ServiceId::tts(),
            ServicePolicy::default()
                .with_retry(RetryConfig::no_retry())
                .with_rate_limit(RateLimiterConfig::per_second(3)),
        )
        .build()?;

    // --- retry ---
    println!("== retry ==");
    let provider = FlakyProvider::new(2);
    let llm = client.service(ServiceId::llm());
    let key = client
        .keys()
        .completion("demo-model", None, "What is a vector index?", None);
    let (text, stats) = llm
        .call_with_stats(Some(&key), &CallOptions::default(), || {
            let p = provider.clone();
            async move { p.generate("What is a vector index?").await }
        })
        .await?;
    println!("{text}");
    println!("attempts={} latency={:?}", stats.attempts, stats.latency);

    // --- cache ---
    println!("\n== cache ==");
    let (text, stats) = llm
        .call_with_stats(Some(&key), &CallOptions::default(), || {
            let p = provider.clone();
            async move { p.generate("What is a vector index?").await }
        })
        .await?;
    println!("{text}");
    println!(
        "cache_hit={} provider calls so far={}",
        stats.cache_hit,
        provider.calls()
    );

    // --- circuit breaker ---
    println!("\n== circuit breaker ==");
    let down = FlakyProvider::new(u32::MAX);
    let once = CallOptions::default().with_retry(RetryConfig::no_retry());
    for i in 1..=4 {
        let result: coursegen_resilience::Result<String> = llm
            .call(None, &once, || {
                let p = down.clone();
                async move { p.generate("quiz").await }
            })
            .await;
        match result {
            Ok(_) => println!("call {i}: ok"),
            Err(e) => println!("call {i}: {} ({})", e.kind(), e),
        }
    }
    println!(
        "breaker={} provider calls={}",
        llm.signals().circuit_breaker.state,
        down.calls()
    );

    tokio::time::sleep(Duration::from_millis(550)).await;
    let healed = FlakyProvider::new(0);
    let probe: String = llm
        .call(None, &once, || {
            let p = healed.clone();
            async move { p.generate("quiz").await }
        })
        .await?;
    println!("probe after cooldown: {probe}");
    println!("breaker={}", llm.signals().circuit_breaker.state);

    // --- rate limiter ---
    println!("\n== rate limiter ==");
    let tts = client.service(ServiceId::tts());
    let voice = FlakyProvider::new(0);
    let burst = (0..5).map(|i| {
        let tts = tts.clone();
        let voice = voice.clone();
        async move {
            let opts = CallOptions::default().no_cache();
            let r: coursegen_resilience::Result<String> = tts
                .call(None, &opts, || {
                    let v = voice.clone();
                    async move { v.generate("narration").await }
                })
                .await;
            (i, r)
        }
    });
    for (i, r) in join_all(burst).await {
        match r {
            Ok(_) => println!("burst {i}: admitted"),
            Err(e) => println!("burst {i}: {}", e.kind()),
        }
    }

    let patient = CallOptions::default()
        .no_cache()
        .wait_for_quota(Duration::from_secs(2));
    let (_, stats) = tts
        .call_with_stats(None, &patient, || {
            let v = voice.clone();
            async move { v.generate("narration").await }
        })
        .await?;
    println!("waited for quota: latency={:?}", stats.latency);

    // --- telemetry ---
    println!("\n== metrics ==");
    for (series, value) in &client.metrics().counters {
        println!("{series}: {value}");
    }
    let health = client.check_health();
    println!("healthy={}", health.healthy);

    Ok(())
}
