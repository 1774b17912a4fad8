use crate::service::ServiceId;
use crate::telemetry::{names, MetricsRegistry};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub state: BreakerState,
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub consecutive_failures: u32,
    pub probe_in_flight: bool,
    /// Remaining open time in ms, if currently open.
    pub open_remaining_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    #[serde(with = "crate::config::duration_secs")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// How long the breaker stays open before admitting a probe.
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(Error::configuration(
                "circuit breaker failure_threshold must be at least 1",
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct State {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Per-service circuit breaker.
///
/// - Counts consecutive failures; reaching the threshold opens the circuit
/// - Open rejects without invoking the operation
/// - After `reset_timeout` the next admission becomes the single half-open probe
/// - The probe's outcome closes or re-opens the circuit
pub struct CircuitBreaker {
    service: ServiceId,
    cfg: CircuitBreakerConfig,
    state: Mutex<State>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl CircuitBreaker {
    pub fn new(service: ServiceId, cfg: CircuitBreakerConfig) -> Self {
        Self {
            service,
            cfg,
            state: Mutex::new(State {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn service(&self) -> &ServiceId {
        &self.service
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.cfg
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admits one call, or fails with [`Error::BreakerOpen`].
    ///
    /// The returned permit must be resolved with the call's outcome. A permit
    /// dropped unresolved leaves the failure streak untouched and frees the
    /// half-open probe slot.
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>> {
        let mut st = self.lock();
        let now = Instant::now();
        match st.state {
            BreakerState::Closed => Ok(BreakerPermit::new(self, false)),
            BreakerState::Open => {
                let opened_at = st.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= self.cfg.reset_timeout {
                    self.transition(&mut st, BreakerState::HalfOpen);
                    st.probe_in_flight = true;
                    Ok(BreakerPermit::new(self, true))
                } else {
                    Err(self.rejected(Some(self.cfg.reset_timeout - elapsed)))
                }
            }
            BreakerState::HalfOpen => {
                if st.probe_in_flight {
                    Err(self.rejected(None))
                } else {
                    st.probe_in_flight = true;
                    Ok(BreakerPermit::new(self, true))
                }
            }
        }
    }

    /// Current state, without triggering the lazy open to half-open move.
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let now = Instant::now();
        let st = self.lock();
        let open_remaining_ms = match (st.state, st.opened_at) {
            (BreakerState::Open, Some(at)) => {
                let remaining = self
                    .cfg
                    .reset_timeout
                    .saturating_sub(now.saturating_duration_since(at));
                (!remaining.is_zero()).then(|| remaining.as_millis() as u64)
            }
            _ => None,
        };
        CircuitBreakerSnapshot {
            state: st.state,
            failure_threshold: self.cfg.failure_threshold,
            reset_timeout_ms: self.cfg.reset_timeout.as_millis() as u64,
            consecutive_failures: st.consecutive_failures,
            probe_in_flight: st.probe_in_flight,
            open_remaining_ms,
        }
    }

    fn rejected(&self, open_remaining: Option<Duration>) -> Error {
        Error::BreakerOpen {
            service: self.service.clone(),
            open_remaining,
        }
    }

    fn on_success(&self, probe: bool) {
        let mut st = self.lock();
        match st.state {
            BreakerState::HalfOpen if probe => {
                st.probe_in_flight = false;
                st.consecutive_failures = 0;
                st.opened_at = None;
                self.transition(&mut st, BreakerState::Closed);
            }
            BreakerState::Closed => st.consecutive_failures = 0,
            // Late result from a call admitted before the circuit opened.
            _ => {}
        }
    }

    fn on_failure(&self, probe: bool) {
        let mut st = self.lock();
        st.consecutive_failures = st.consecutive_failures.saturating_add(1);
        match st.state {
            BreakerState::HalfOpen if probe => {
                st.probe_in_flight = false;
                st.opened_at = Some(Instant::now());
                self.transition(&mut st, BreakerState::Open);
            }
            BreakerState::Closed if st.consecutive_failures >= self.cfg.failure_threshold => {
                st.opened_at = Some(Instant::now());
                self.transition(&mut st, BreakerState::Open);
            }
            _ => {}
        }
    }

    fn release_probe(&self) {
        let mut st = self.lock();
        if st.state == BreakerState::HalfOpen {
            st.probe_in_flight = false;
        }
    }

    fn transition(&self, st: &mut State, to: BreakerState) {
        let from = st.state;
        if from == to {
            return;
        }
        st.state = to;
        match to {
            BreakerState::Open => warn!(
                service = %self.service,
                from = from.as_str(),
                consecutive_failures = st.consecutive_failures,
                reset_timeout_ms = self.cfg.reset_timeout.as_millis() as u64,
                "circuit breaker opened"
            ),
            _ => info!(
                service = %self.service,
                from = from.as_str(),
                to = to.as_str(),
                "circuit breaker transition"
            ),
        }
        if let Some(ref m) = self.metrics {
            m.increment(
                names::BREAKER_TRANSITIONS,
                &[
                    ("service", self.service.as_str()),
                    ("from", from.as_str()),
                    ("to", to.as_str()),
                ],
            );
        }
    }
}

/// Admission granted by [`CircuitBreaker::try_acquire`].
#[must_use = "resolve the permit with record_success or record_failure"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    resolved: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            resolved: false,
        }
    }

    /// Whether this permit is the half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn record_success(mut self) {
        self.resolved = true;
        self.breaker.on_success(self.probe);
    }

    pub fn record_failure(mut self) {
        self.resolved = true;
        self.breaker.on_failure(self.probe);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved && self.probe {
            self.breaker.release_probe();
        }
    }
}
