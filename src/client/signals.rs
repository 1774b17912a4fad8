use crate::resilience::circuit_breaker::CircuitBreakerSnapshot;
use crate::resilience::rate_limiter::RateLimiterSnapshot;
use crate::service::ServiceId;
use serde::Serialize;

/// A snapshot of one service's runtime "signals".
///
/// Facts only (no policy). Orchestration code can use these to defer work
/// against a service that is open or out of quota.
#[derive(Debug, Clone, Serialize)]
pub struct SignalsSnapshot {
    pub service: ServiceId,
    pub circuit_breaker: CircuitBreakerSnapshot,
    pub rate_limiter: RateLimiterSnapshot,
}

impl SignalsSnapshot {
    /// True when a call made now would be rejected before reaching the upstream.
    pub fn would_reject(&self) -> bool {
        self.circuit_breaker.open_remaining_ms.is_some()
            || self.circuit_breaker.probe_in_flight
            || self.rate_limiter.estimated_wait_ms.is_some()
    }
}
