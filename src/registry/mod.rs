//! Per-service guard registry.
//!
//! Holds exactly one circuit breaker, rate limiter and retry policy per
//! [`ServiceId`]. Declared services are created up front from configuration;
//! any other service is created lazily with the default policy on first use.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use crate::config::ServicePolicy;
use crate::resilience::{BreakerState, CircuitBreaker, RateLimiter, RetryPolicy};
use crate::service::ServiceId;
use crate::telemetry::{HealthRegistry, MetricsRegistry, ProbeReport};
use tracing::debug;

/// The guards protecting one upstream service.
pub struct ServiceGuards {
    pub service: ServiceId,
    pub breaker: CircuitBreaker,
    pub limiter: RateLimiter,
    pub retry: RetryPolicy,
}

impl ServiceGuards {
    pub fn new(service: ServiceId, policy: &ServicePolicy, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            breaker: CircuitBreaker::new(service.clone(), policy.breaker.clone())
                .with_metrics(metrics.clone()),
            limiter: RateLimiter::new(service.clone(), policy.rate_limit.clone())
                .with_metrics(metrics.clone()),
            retry: RetryPolicy::new(policy.retry.clone()).with_metrics(metrics),
            service,
        }
    }
}

pub struct ServiceRegistry {
    defaults: ServicePolicy,
    guards: RwLock<HashMap<ServiceId, Arc<ServiceGuards>>>,
    metrics: Arc<MetricsRegistry>,
    /// Receives a `breaker.<service>` probe for every service, declared or lazy.
    health: Option<Arc<HealthRegistry>>,
}

impl ServiceRegistry {
    pub fn new(
        defaults: ServicePolicy,
        declared: &BTreeMap<ServiceId, ServicePolicy>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let guards = declared
            .iter()
            .map(|(id, policy)| {
                (
                    id.clone(),
                    Arc::new(ServiceGuards::new(id.clone(), policy, metrics.clone())),
                )
            })
            .collect();
        Self {
            defaults,
            guards: RwLock::new(guards),
            metrics,
            health: None,
        }
    }

    /// Registers breaker probes for the current services and any created later.
    pub fn with_health(mut self, health: Arc<HealthRegistry>) -> Self {
        for service in self.services() {
            if let Some(guards) = self.get(&service) {
                register_breaker_probe(&health, guards);
            }
        }
        self.health = Some(health);
        self
    }

    /// Guards for `service`, creating them with the default policy if needed.
    pub fn guards(&self, service: &ServiceId) -> Arc<ServiceGuards> {
        if let Some(g) = self.get(service) {
            return g;
        }
        let mut map = self.guards.write().unwrap_or_else(PoisonError::into_inner);
        // Re-check under the write lock: another task may have won the race.
        if let Some(g) = map.get(service) {
            return g.clone();
        }
        debug!(service = %service, "registering undeclared service with default policy");
        let created = Arc::new(ServiceGuards::new(
            service.clone(),
            &self.defaults,
            self.metrics.clone(),
        ));
        map.insert(service.clone(), created.clone());
        drop(map);
        if let Some(ref health) = self.health {
            register_breaker_probe(health, created.clone());
        }
        created
    }

    pub fn get(&self, service: &ServiceId) -> Option<Arc<ServiceGuards>> {
        self.guards
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .cloned()
    }

    /// Known services, sorted by name.
    pub fn services(&self) -> Vec<ServiceId> {
        let mut ids: Vec<ServiceId> = self
            .guards
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

/// An open breaker reports its service unhealthy.
fn register_breaker_probe(health: &HealthRegistry, guards: Arc<ServiceGuards>) {
    health.register_probe(format!("breaker.{}", guards.service), move || {
        let snap = guards.breaker.snapshot();
        Ok(match snap.state {
            BreakerState::Open => ProbeReport::unhealthy(format!(
                "open after {} consecutive failures, {}ms until probe",
                snap.consecutive_failures,
                snap.open_remaining_ms.unwrap_or(0)
            )),
            state => ProbeReport::healthy(state.as_str()),
        })
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{CircuitBreakerConfig, RateLimiterConfig};

    fn registry() -> ServiceRegistry {
        let mut declared = BTreeMap::new();
        declared.insert(
            ServiceId::image(),
            ServicePolicy::default().with_rate_limit(RateLimiterConfig::per_minute(2)),
        );
        ServiceRegistry::new(
            ServicePolicy::default()
                .with_breaker(CircuitBreakerConfig::new().with_failure_threshold(7)),
            &declared,
            Arc::new(MetricsRegistry::new()),
        )
    }

    #[test]
    fn declared_services_use_their_policy() {
        let reg = registry();
        let image = reg.guards(&ServiceId::image());
        assert_eq!(image.limiter.config().max_requests, 2);
        assert_eq!(image.breaker.config().failure_threshold, 5);
    }

    #[test]
    fn undeclared_services_get_defaults_once() {
        let reg = registry();
        assert!(reg.get(&ServiceId::llm()).is_none());
        let a = reg.guards(&ServiceId::llm());
        let b = reg.guards(&ServiceId::llm());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.breaker.config().failure_threshold, 7);
        assert_eq!(reg.services(), vec![ServiceId::image(), ServiceId::llm()]);
    }

    #[test]
    fn lazily_created_services_get_a_breaker_probe() {
        let health = Arc::new(HealthRegistry::new());
        let reg = registry().with_health(health.clone());
        assert_eq!(health.probe_names(), vec!["breaker.image"]);

        let embeddings = ServiceId::new("embeddings");
        let guards = reg.guards(&embeddings);
        assert_eq!(
            health.probe_names(),
            vec!["breaker.embeddings", "breaker.image"]
        );
        for _ in 0..7 {
            guards.breaker.try_acquire().unwrap().record_failure();
        }
        let snapshot = health.check_health();
        assert!(!snapshot.healthy);
        assert!(!snapshot.probes["breaker.embeddings"].healthy);
        assert!(snapshot.probes["breaker.image"].healthy);
    }

    #[test]
    fn concurrent_first_use_yields_one_instance() {
        let reg = Arc::new(registry());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = Arc::clone(&reg);
                std::thread::spawn(move || reg.guards(&ServiceId::tts()))
            })
            .collect();
        let all: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(all.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }
}
