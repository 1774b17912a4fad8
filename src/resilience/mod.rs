//! Resilience primitives: circuit breaker, rate limiter and retry policy.
//!
//! ## Overview
//!
//! Every outbound call to an LLM, image or speech service passes through these
//! guards so that a degraded or throttled upstream costs little:
//! - a failing service is cut off instead of being hammered
//! - request rates stay inside the provider's quota
//! - transient failures are retried with bounded, jittered backoff
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`circuit_breaker`] | Closed / open / half-open breaker with a single probe |
//! | [`rate_limiter`] | Fixed or sliding window request limiter |
//! | [`retry`] | Attempt loop with exponential backoff and classification |
//!
//! All state is per service and guarded by a `std::sync::Mutex` that is never
//! held across an `.await`.
//!
//! ## Circuit Breaker
//!
//! ```rust
//! use coursegen_resilience::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use coursegen_resilience::ServiceId;
//! use std::time::Duration;
//!
//! let breaker = CircuitBreaker::new(
//!     ServiceId::llm(),
//!     CircuitBreakerConfig::new()
//!         .with_failure_threshold(5)
//!         .with_reset_timeout(Duration::from_secs(30)),
//! );
//!
//! if let Ok(permit) = breaker.try_acquire() {
//!     // Make the remote call...
//!     permit.record_success();
//! };
//! ```
//!
//! ## Rate Limiter
//!
//! ```rust
//! use coursegen_resilience::resilience::rate_limiter::{RateLimiter, RateLimiterConfig};
//! use coursegen_resilience::ServiceId;
//!
//! let limiter = RateLimiter::new(ServiceId::image(), RateLimiterConfig::per_minute(50));
//! if limiter.try_acquire() {
//!     // Proceed with request...
//! }
//! ```

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{
    BreakerPermit, BreakerState, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot,
};
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterSnapshot, WindowKind};
pub use retry::{RetryClassifier, RetryConfig, RetryOutcome, RetryPolicy, StandardClassifier};
