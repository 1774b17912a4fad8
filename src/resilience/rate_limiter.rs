use crate::service::ServiceId;
use crate::telemetry::{names, MetricsRegistry};
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    /// Counter reset when the window rolls over.
    #[default]
    Fixed,
    /// Trailing window over a log of admission instants.
    Sliding,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterSnapshot {
    pub max_requests: u32,
    pub window_ms: u64,
    pub kind: WindowKind,
    /// Admissions counted in the current window.
    pub in_window: u32,
    /// Estimated wait until a request would be admitted (ms), if currently exhausted.
    pub estimated_wait_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Requests admitted per window; 0 disables limiting.
    pub max_requests: u32,
    #[serde(with = "crate::config::duration_secs")]
    pub window: Duration,
    #[serde(default)]
    pub kind: WindowKind,
}

impl RateLimiterConfig {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            kind: WindowKind::Fixed,
        }
    }

    pub fn per_second(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(1))
    }

    pub fn per_minute(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }

    pub fn unlimited() -> Self {
        Self::per_minute(0)
    }

    pub fn with_kind(mut self, kind: WindowKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn is_unlimited(&self) -> bool {
        self.max_requests == 0
    }

    pub fn validate(&self) -> Result<()> {
        if !self.is_unlimited() && self.window.is_zero() {
            return Err(Error::configuration("rate limit window must be non-zero"));
        }
        Ok(())
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// Ceiling on upstream-requested blocking.
const MAX_BLOCK: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug)]
struct State {
    window_start: Instant,
    count: u32,
    admitted: VecDeque<Instant>,
    /// Set from upstream throttling feedback.
    blocked_until: Option<Instant>,
}

/// Per-service request-rate limiter.
///
/// A request is admitted iff fewer than `max_requests` were admitted in the
/// current (fixed) or trailing (sliding) window; the check and the increment
/// happen under one lock.
pub struct RateLimiter {
    service: ServiceId,
    cfg: RateLimiterConfig,
    state: Mutex<State>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl RateLimiter {
    pub fn new(service: ServiceId, cfg: RateLimiterConfig) -> Self {
        let state = Mutex::new(State {
            window_start: Instant::now(),
            count: 0,
            admitted: VecDeque::new(),
            blocked_until: None,
        });
        Self {
            service,
            cfg,
            state,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.cfg
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn roll_locked(cfg: &RateLimiterConfig, st: &mut State, now: Instant) {
        match cfg.kind {
            WindowKind::Fixed => {
                if now.saturating_duration_since(st.window_start) >= cfg.window {
                    st.window_start = now;
                    st.count = 0;
                }
            }
            WindowKind::Sliding => {
                while let Some(front) = st.admitted.front() {
                    if now.saturating_duration_since(*front) >= cfg.window {
                        st.admitted.pop_front();
                    } else {
                        break;
                    }
                }
            }
        }
        if matches!(st.blocked_until, Some(until) if until <= now) {
            st.blocked_until = None;
        }
    }

    fn in_window(cfg: &RateLimiterConfig, st: &State) -> u32 {
        match cfg.kind {
            WindowKind::Fixed => st.count,
            WindowKind::Sliding => st.admitted.len() as u32,
        }
    }

    /// Time until capacity frees, or `None` when a request would be admitted now.
    fn wait_locked(cfg: &RateLimiterConfig, st: &State, now: Instant) -> Option<Duration> {
        let blocked = st
            .blocked_until
            .filter(|until| *until > now)
            .map(|until| until - now);
        let window = if Self::in_window(cfg, st) < cfg.max_requests {
            None
        } else {
            let oldest = match cfg.kind {
                WindowKind::Fixed => Some(st.window_start),
                WindowKind::Sliding => st.admitted.front().copied(),
            };
            oldest.map(|t| cfg.window.saturating_sub(now.saturating_duration_since(t)))
        };
        match (blocked, window) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// Admits now, or returns how long until capacity frees.
    fn admit(&self) -> std::result::Result<(), Duration> {
        if self.cfg.is_unlimited() {
            return Ok(());
        }
        let mut st = self.lock();
        let now = Instant::now();
        Self::roll_locked(&self.cfg, &mut st, now);
        if let Some(wait) = Self::wait_locked(&self.cfg, &st, now) {
            return Err(wait);
        }
        match self.cfg.kind {
            WindowKind::Fixed => st.count += 1,
            WindowKind::Sliding => st.admitted.push_back(now),
        }
        Ok(())
    }

    /// Admits one request without waiting; `false` means the window is exhausted.
    pub fn try_acquire(&self) -> bool {
        self.admit().is_ok()
    }

    /// Waits for capacity, failing with [`Error::Timeout`] once `timeout` elapses.
    ///
    /// Suspends until the computed instant at which the window frees rather than
    /// polling. Dropping the returned future abandons the wait.
    pub async fn acquire_blocking(&self, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        let wait = async {
            loop {
                match self.admit() {
                    Ok(()) => return,
                    Err(d) => {
                        debug!(service = %self.service, wait_ms = d.as_millis() as u64, "waiting for quota");
                        tokio::time::sleep(d.max(Duration::from_millis(1))).await;
                    }
                }
            }
        };
        let res = tokio::time::timeout(timeout, wait).await;
        let waited = started.elapsed();
        if let Some(ref m) = self.metrics {
            m.observe(
                names::LIMITER_WAIT_MS,
                waited.as_secs_f64() * 1000.0,
                &[("service", self.service.as_str())],
            );
        }
        res.map_err(|_| Error::Timeout {
            service: self.service.clone(),
            waited,
            context: ErrorContext::new()
                .with_source("rate_limiter")
                .with_details(format!(
                    "no quota within {:?} ({} per {:?})",
                    timeout, self.cfg.max_requests, self.cfg.window
                )),
        })
    }

    /// Treats the service as exhausted for `duration`, e.g. after an upstream 429
    /// that carried a retry-after hint. Hints longer than a day are clamped.
    pub fn block_for(&self, duration: Duration) {
        if self.cfg.is_unlimited() {
            return;
        }
        let Some(until) = Instant::now().checked_add(duration.min(MAX_BLOCK)) else {
            return;
        };
        let mut st = self.lock();
        if st.blocked_until.map_or(true, |cur| cur < until) {
            st.blocked_until = Some(until);
        }
    }

    /// Estimated wait before the next admission, if any.
    pub fn estimated_wait(&self) -> Option<Duration> {
        if self.cfg.is_unlimited() {
            return None;
        }
        let mut st = self.lock();
        let now = Instant::now();
        Self::roll_locked(&self.cfg, &mut st, now);
        Self::wait_locked(&self.cfg, &st, now)
    }

    pub fn snapshot(&self) -> RateLimiterSnapshot {
        let mut st = self.lock();
        let now = Instant::now();
        Self::roll_locked(&self.cfg, &mut st, now);
        let estimated_wait_ms = if self.cfg.is_unlimited() {
            None
        } else {
            Self::wait_locked(&self.cfg, &st, now).map(|d| d.as_millis() as u64)
        };
        RateLimiterSnapshot {
            max_requests: self.cfg.max_requests,
            window_ms: self.cfg.window.as_millis() as u64,
            kind: self.cfg.kind,
            in_window: Self::in_window(&self.cfg, &st),
            estimated_wait_ms,
        }
    }
}
