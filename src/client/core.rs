use crate::cache::{CacheKey, CacheKeyGenerator, CacheStore};
use crate::client::builder::ResilientClientBuilder;
use crate::client::handle::ServiceHandle;
use crate::client::signals::SignalsSnapshot;
use crate::client::types::{CallOptions, CallStats};
use crate::config::ResilienceConfig;
use crate::error::OperationError;
use crate::registry::{ServiceGuards, ServiceRegistry};
use crate::resilience::RetryPolicy;
use crate::service::ServiceId;
use crate::telemetry::{
    names, HealthRegistry, HealthSnapshot, MetricsRegistry, MetricsSink, MetricsSnapshot, Outcome,
};
use crate::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub(crate) struct Inner {
    pub(crate) config: ResilienceConfig,
    pub(crate) cache: CacheStore,
    pub(crate) keys: CacheKeyGenerator,
    pub(crate) registry: ServiceRegistry,
    pub(crate) metrics: Arc<MetricsRegistry>,
    pub(crate) health: Arc<HealthRegistry>,
    pub(crate) sink: Arc<dyn MetricsSink>,
}

/// Process-wide resilience context.
///
/// Cheap to clone; all clones share the same cache, guards and registries.
#[derive(Clone)]
pub struct ResilientClient {
    pub(crate) inner: Arc<Inner>,
}

impl ResilientClient {
    pub fn builder() -> ResilientClientBuilder {
        ResilientClientBuilder::new()
    }

    /// Builds a client from configuration with the default backends and sinks.
    pub fn from_config(config: ResilienceConfig) -> Result<Self> {
        ResilientClientBuilder::from_config(config).build()
    }

    /// Calls `operation` against `service` behind cache, breaker, limiter and retry.
    ///
    /// - a cached value for `cache_key` is returned without touching the upstream
    /// - breaker and limiter rejections fail fast and are never retried
    /// - a successful result is cached under `cache_key`
    pub async fn call<T, F, Fut>(
        &self,
        service: &ServiceId,
        cache_key: Option<&CacheKey>,
        options: &CallOptions,
        operation: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, OperationError>>,
    {
        Ok(self
            .call_with_stats(service, cache_key, options, operation)
            .await?
            .0)
    }

    /// Like [`call`](Self::call), also returning per-call stats.
    pub async fn call_with_stats<T, F, Fut>(
        &self,
        service: &ServiceId,
        cache_key: Option<&CacheKey>,
        options: &CallOptions,
        operation: F,
    ) -> Result<(T, CallStats)>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, OperationError>>,
    {
        let started = Instant::now();
        let inner = &self.inner;
        let cache_key = cache_key.filter(|_| options.use_cache && inner.cache.is_enabled());

        if let Some(key) = cache_key {
            if let Some(hit) = inner.cache.get::<T>(key).await {
                debug!(service = %service, key = %key, "served from cache");
                let stats = CallStats {
                    service: service.clone(),
                    cache_hit: true,
                    attempts: 0,
                    latency: started.elapsed(),
                };
                return Ok((hit, stats));
            }
        }

        let guards = inner.registry.guards(service);

        let permit = match guards.breaker.try_acquire() {
            Ok(p) => p,
            Err(e) => {
                debug!(service = %service, "rejected by open circuit");
                self.record_call(service, Outcome::RejectedByBreaker, None);
                return Err(e);
            }
        };

        if let Err(e) = Self::admit(&guards, options).await {
            // Unresolved permit: frees a half-open probe slot without an outcome.
            drop(permit);
            debug!(service = %service, error = %e, "rejected by rate limiter");
            self.record_call(service, Outcome::RejectedByLimiter, None);
            return Err(e);
        }

        let custom;
        let policy = match options.retry {
            Some(ref cfg) => {
                custom = RetryPolicy::new(cfg.clone()).with_metrics(inner.metrics.clone());
                &custom
            }
            None => &guards.retry,
        };

        match policy.execute(service, operation).await {
            Ok(outcome) => {
                permit.record_success();
                let latency = started.elapsed();
                self.record_call(service, Outcome::Success, Some(latency));
                if let Some(key) = cache_key {
                    let ttl = options.ttl.unwrap_or(inner.cache.config().default_ttl);
                    if let Err(e) = inner.cache.put_with_ttl(key, &outcome.value, ttl).await {
                        warn!(service = %service, key = %key, error = %e, "failed to cache result");
                    }
                }
                let stats = CallStats {
                    service: service.clone(),
                    cache_hit: false,
                    attempts: outcome.attempts,
                    latency,
                };
                Ok((outcome.value, stats))
            }
            Err(e) => {
                let upstream_fault = e
                    .operation_error()
                    .map_or(true, |op| op.code.counts_against_upstream());
                if upstream_fault {
                    permit.record_failure();
                } else {
                    drop(permit);
                }
                if let Some(after) = e.operation_error().and_then(|op| op.retry_after) {
                    guards.limiter.block_for(after);
                }
                self.record_call(service, Outcome::Failure, Some(started.elapsed()));
                Err(e)
            }
        }
    }

    async fn admit(guards: &ServiceGuards, options: &CallOptions) -> Result<()> {
        match options.wait_for_quota {
            Some(max_wait) => guards.limiter.acquire_blocking(max_wait).await,
            None if guards.limiter.try_acquire() => Ok(()),
            None => Err(Error::RateLimited {
                service: guards.service.clone(),
                retry_after: guards.limiter.estimated_wait(),
            }),
        }
    }

    fn record_call(&self, service: &ServiceId, outcome: Outcome, latency: Option<Duration>) {
        let m = &self.inner.metrics;
        m.increment(
            names::CALLS,
            &[("service", service.as_str()), ("outcome", outcome.as_str())],
        );
        if let Some(l) = latency {
            m.observe(
                names::CALL_LATENCY_MS,
                l.as_secs_f64() * 1000.0,
                &[("service", service.as_str())],
            );
        }
    }

    /// A handle bound to one service.
    pub fn service(&self, service: impl Into<ServiceId>) -> ServiceHandle {
        ServiceHandle::new(self.clone(), service.into())
    }

    /// Key generator configured for this client (salt included).
    pub fn keys(&self) -> &CacheKeyGenerator {
        &self.inner.keys
    }

    pub fn cache(&self) -> &CacheStore {
        &self.inner.cache
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.inner.config
    }

    /// Services with live guards, sorted by name.
    pub fn services(&self) -> Vec<ServiceId> {
        self.inner.registry.services()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn metrics_registry(&self) -> &Arc<MetricsRegistry> {
        &self.inner.metrics
    }

    /// Registry for additional application probes.
    pub fn health(&self) -> &HealthRegistry {
        &self.inner.health
    }

    pub fn check_health(&self) -> HealthSnapshot {
        self.inner.health.check_health()
    }

    /// Pushes current samples to the configured sink.
    ///
    /// Returns the number of samples exported; 0 when export is disabled.
    pub async fn export_metrics(&self) -> Result<usize> {
        if !self.inner.config.metrics.export_enabled {
            return Ok(0);
        }
        let samples = self.inner.metrics.samples();
        self.inner.sink.export(&samples).await?;
        Ok(samples.len())
    }

    /// Starts periodic export when enabled in configuration.
    pub fn spawn_metrics_export(&self) -> Option<JoinHandle<()>> {
        let m = &self.inner.config.metrics;
        m.export_enabled.then(|| {
            crate::telemetry::spawn_periodic_export(
                self.inner.metrics.clone(),
                self.inner.sink.clone(),
                m.export_interval,
            )
        })
    }

    pub async fn clear_cache(&self) -> Result<()> {
        self.inner.cache.clear().await
    }

    /// Breaker and limiter facts for `service`.
    pub fn signals(&self, service: &ServiceId) -> SignalsSnapshot {
        let guards = self.inner.registry.guards(service);
        SignalsSnapshot {
            service: service.clone(),
            circuit_breaker: guards.breaker.snapshot(),
            rate_limiter: guards.limiter.snapshot(),
        }
    }
}
