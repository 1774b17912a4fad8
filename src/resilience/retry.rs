//! Retry with exponential backoff.
//!
//! Retries happen at the request-execution level: the policy owns the attempt
//! loop around a caller-supplied operation and decides after each failure
//! whether to try again and how long to wait.

use crate::error::OperationError;
use crate::service::ServiceId;
use crate::telemetry::{names, MetricsRegistry};
use crate::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first; 1 disables retries.
    pub max_attempts: u32,
    #[serde(with = "crate::config::duration_ms")]
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    #[serde(with = "crate::config::duration_ms")]
    pub max_delay: Duration,
    pub jitter: bool,
    /// Upper bound for a single attempt. A timed-out attempt is a retryable failure.
    #[serde(default, with = "crate::config::option_duration_ms")]
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: true,
            attempt_timeout: None,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single attempt, never retried.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn with_base_delay(mut self, d: Duration) -> Self {
        self.base_delay = d;
        self
    }

    pub fn with_backoff_multiplier(mut self, m: f64) -> Self {
        self.backoff_multiplier = m;
        self
    }

    pub fn with_max_delay(mut self, d: Duration) -> Self {
        self.max_delay = d;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_attempt_timeout(mut self, t: Duration) -> Self {
        self.attempt_timeout = Some(t);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::configuration("retry max_attempts must be at least 1"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(Error::configuration(format!(
                "retry backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if matches!(self.attempt_timeout, Some(t) if t.is_zero()) {
            return Err(Error::configuration("retry attempt_timeout must be non-zero"));
        }
        Ok(())
    }
}

/// Decides whether a failed attempt is worth repeating.
pub trait RetryClassifier: Send + Sync {
    fn is_retryable(&self, err: &OperationError) -> bool;
}

/// Classifies by the failure's [`StandardErrorCode`](crate::error_code::StandardErrorCode).
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardClassifier;

impl RetryClassifier for StandardClassifier {
    fn is_retryable(&self, err: &OperationError) -> bool {
        err.retryable()
    }
}

impl<F> RetryClassifier for F
where
    F: Fn(&OperationError) -> bool + Send + Sync,
{
    fn is_retryable(&self, err: &OperationError) -> bool {
        self(err)
    }
}

/// Successful result of [`RetryPolicy::execute`].
#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub value: T,
    pub attempts: u32,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Retry { delay: Duration },
    Fail { retryable: bool },
}

pub struct RetryPolicy {
    config: RetryConfig,
    classifier: Arc<dyn RetryClassifier>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl Clone for RetryPolicy {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            classifier: Arc::clone(&self.classifier),
            metrics: self.metrics.clone(),
        }
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            classifier: Arc::new(StandardClassifier),
            metrics: None,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn RetryClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay after the `attempt`-th failure (1-based), before jitter.
    ///
    /// An upstream retry-after hint replaces the computed backoff; both are capped.
    pub fn backoff_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let cap = self.config.max_delay;
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let computed = self.config.base_delay.as_secs_f64() * self.config.backoff_multiplier.powi(exp);
        let computed = if computed.is_finite() {
            Duration::from_secs_f64(computed.min(cap.as_secs_f64()))
        } else {
            cap
        };
        retry_after.unwrap_or(computed).min(cap)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.config.jitter || delay.is_zero() {
            return delay;
        }
        let mut rng = rand::thread_rng();
        let factor = rng.gen_range(0.0..0.3);
        let extra = Duration::from_secs_f64(delay.as_secs_f64() * factor);
        delay.saturating_add(extra).min(self.config.max_delay)
    }

    fn decide(&self, err: &OperationError, attempt: u32) -> Decision {
        let retryable = self.classifier.is_retryable(err);
        if retryable && attempt < self.config.max_attempts {
            Decision::Retry {
                delay: self.jittered(self.backoff_delay(attempt, err.retry_after)),
            }
        } else {
            Decision::Fail { retryable }
        }
    }

    /// Runs `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Failures surface as [`Error::OperationFailed`] carrying the last
    /// [`OperationError`] and the number of attempts made.
    pub async fn execute<T, F, Fut>(&self, service: &ServiceId, mut op: F) -> Result<RetryOutcome<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, OperationError>>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let result = match self.config.attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, op()).await {
                    Ok(r) => r,
                    Err(_) => Err(OperationError::timeout(format!(
                        "attempt {} exceeded {:?}",
                        attempt, limit
                    ))),
                },
                None => op().await,
            };

            let err = match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(service = %service, attempts = attempt, "operation succeeded after retry");
                    }
                    self.record_attempts(service, attempt);
                    return Ok(RetryOutcome {
                        value,
                        attempts: attempt,
                        elapsed: started.elapsed(),
                    });
                }
                Err(e) => e,
            };

            match self.decide(&err, attempt) {
                Decision::Retry { delay } => {
                    warn!(
                        service = %service,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Decision::Fail { retryable } => {
                    if retryable {
                        warn!(service = %service, attempts = attempt, error = %err, "retry attempts exhausted");
                    } else {
                        debug!(service = %service, attempt, error = %err, "non-retryable failure");
                    }
                    self.record_attempts(service, attempt);
                    return Err(Error::OperationFailed {
                        service: service.clone(),
                        attempts: attempt,
                        retryable,
                        source: err,
                    });
                }
            }
        }
    }

    fn record_attempts(&self, service: &ServiceId, attempts: u32) {
        if let Some(ref m) = self.metrics {
            m.observe(names::RETRY_ATTEMPTS, attempts as f64, &[("service", service.as_str())]);
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_code::StandardErrorCode;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            RetryConfig::new()
                .with_max_attempts(max_attempts)
                .with_base_delay(Duration::from_millis(1))
                .with_max_delay(Duration::from_millis(5))
                .with_jitter(false),
        )
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let p = RetryPolicy::new(
            RetryConfig::new()
                .with_base_delay(Duration::from_millis(100))
                .with_backoff_multiplier(2.0)
                .with_max_delay(Duration::from_millis(350)),
        );
        assert_eq!(p.backoff_delay(1, None), Duration::from_millis(100));
        assert_eq!(p.backoff_delay(2, None), Duration::from_millis(200));
        assert_eq!(p.backoff_delay(3, None), Duration::from_millis(350));
        assert_eq!(p.backoff_delay(60, None), Duration::from_millis(350));
    }

    #[test]
    fn test_retry_after_replaces_backoff_but_is_capped() {
        let p = RetryPolicy::new(RetryConfig::new().with_max_delay(Duration::from_secs(2)));
        assert_eq!(
            p.backoff_delay(1, Some(Duration::from_millis(1200))),
            Duration::from_millis(1200)
        );
        assert_eq!(
            p.backoff_delay(1, Some(Duration::from_secs(60))),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let p = RetryPolicy::new(
            RetryConfig::new()
                .with_base_delay(Duration::from_millis(100))
                .with_max_delay(Duration::from_millis(120)),
        );
        for _ in 0..100 {
            let d = p.jittered(Duration::from_millis(100));
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(120));
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(RetryConfig::default().validate().is_ok());
        assert!(RetryConfig::new().with_max_attempts(0).validate().is_err());
        assert!(RetryConfig::new().with_backoff_multiplier(0.5).validate().is_err());
    }

    #[tokio::test]
    async fn test_two_failures_then_success_takes_three_attempts() {
        let calls = AtomicU32::new(0);
        let out = fast(3)
            .execute(&ServiceId::llm(), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(OperationError::server("upstream 500"))
                    } else {
                        Ok("outline")
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(out.value, "outline");
        assert_eq!(out.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_surfaces_retryable_failure() {
        let metrics = Arc::new(MetricsRegistry::new());
        let calls = AtomicU32::new(0);
        let err = fast(3)
            .with_metrics(metrics.clone())
            .execute(&ServiceId::image(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(OperationError::timeout("slow")) }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            Error::OperationFailed {
                attempts,
                retryable,
                ref source,
                ..
            } => {
                assert_eq!(attempts, 3);
                assert!(retryable);
                assert_eq!(source.code, StandardErrorCode::Timeout);
            }
            other => panic!("unexpected {:?}", other),
        }
        let h = metrics.snapshot();
        assert_eq!(
            h.histogram("retry.attempts{service=image}").map(|s| s.max),
            Some(3.0)
        );
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let calls = AtomicU32::new(0);
        let err = fast(5)
            .execute(&ServiceId::llm(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(OperationError::invalid_input("prompt too long")) }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.attempts(), Some(1));
        assert!(matches!(err, Error::OperationFailed { retryable: false, .. }));
    }

    #[tokio::test]
    async fn test_attempt_timeout_counts_as_retryable() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(
            RetryConfig::new()
                .with_max_attempts(2)
                .with_base_delay(Duration::from_millis(1))
                .with_jitter(false)
                .with_attempt_timeout(Duration::from_millis(20)),
        );
        let out = policy
            .execute(&ServiceId::tts(), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                    Ok::<_, OperationError>(n)
                }
            })
            .await
            .unwrap();
        assert_eq!(out.attempts, 2);
        assert_eq!(out.value, 1);
    }

    #[tokio::test]
    async fn test_custom_classifier() {
        let calls = AtomicU32::new(0);
        let never: Arc<dyn RetryClassifier> = Arc::new(|_: &OperationError| false);
        let err = fast(3)
            .with_classifier(never)
            .execute(&ServiceId::llm(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(OperationError::server("boom")) }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, Error::OperationFailed { retryable: false, .. }));
    }
}
