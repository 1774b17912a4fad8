use crate::resilience::RetryConfig;
use crate::service::ServiceId;
use std::time::Duration;

/// Per-call knobs for [`ResilientClient::call`](crate::client::ResilientClient::call).
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Consult and populate the cache (when a key is supplied and caching is enabled).
    pub use_cache: bool,
    /// TTL for the stored result; the cache default when `None`.
    pub ttl: Option<Duration>,
    /// Wait up to this long for rate-limit quota instead of failing immediately.
    pub wait_for_quota: Option<Duration>,
    /// Replaces the service's retry policy for this call.
    pub retry: Option<RetryConfig>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            ttl: None,
            wait_for_quota: None,
            retry: None,
        }
    }
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn no_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn wait_for_quota(mut self, max_wait: Duration) -> Self {
        self.wait_for_quota = Some(max_wait);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// Per-call facts, for callers that track cost and latency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallStats {
    pub service: ServiceId,
    pub cache_hit: bool,
    /// Attempts made against the upstream; 0 on a cache hit.
    pub attempts: u32,
    pub latency: Duration,
}
