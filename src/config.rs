//! Resilience configuration.
//!
//! Read once at startup: a YAML file (optional) overlaid with `COURSEGEN_*`
//! environment knobs. The resulting [`ResilienceConfig`] is immutable for the
//! lifetime of the client built from it.
//!
//! ```yaml
//! cache:
//!   enabled: true
//!   dir: .coursegen/cache
//!   default_ttl_secs: 1800
//! defaults:
//!   breaker:
//!     failure_threshold: 5
//!     reset_timeout: 30
//!   retry:
//!     max_attempts: 3
//!     base_delay: 500
//! services:
//!   image:
//!     rate_limit:
//!       max_requests: 50
//!       window: 60
//! metrics:
//!   export_enabled: true
//! ```

use crate::resilience::{CircuitBreakerConfig, RateLimiterConfig, RetryConfig};
use crate::service::ServiceId;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const CONFIG_PATH_ENV: &str = "COURSEGEN_RESILIENCE_CONFIG";

/// Breaker, limiter and retry settings for one service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicePolicy {
    pub breaker: CircuitBreakerConfig,
    pub rate_limit: RateLimiterConfig,
    pub retry: RetryConfig,
}

impl ServicePolicy {
    pub fn with_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimiterConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.breaker.validate()?;
        self.rate_limit.validate()?;
        self.retry.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    /// Directory of the persistent cache; `None` keeps entries in memory only.
    pub dir: Option<PathBuf>,
    #[serde(rename = "default_ttl_secs", with = "duration_secs")]
    pub default_ttl: Duration,
    /// Capacity of the in-memory backend.
    pub max_entries: usize,
    pub max_entry_size: usize,
    pub key_prefix: Option<String>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            default_ttl: Duration::from_secs(1800),
            max_entries: 10_000,
            max_entry_size: 10 * 1024 * 1024,
            key_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub export_enabled: bool,
    #[serde(rename = "export_interval_secs", with = "duration_secs")]
    pub export_interval: Duration,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            export_enabled: false,
            export_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub cache: CacheSettings,
    /// Policy for services without an entry in `services`.
    pub defaults: ServicePolicy,
    /// Declared services. Missing sections of an entry take their built-in defaults.
    pub services: BTreeMap<ServiceId, ServicePolicy>,
    pub metrics: MetricsSettings,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        let services = [ServiceId::llm(), ServiceId::image(), ServiceId::tts()]
            .into_iter()
            .map(|s| (s, ServicePolicy::default()))
            .collect();
        Self {
            cache: CacheSettings::default(),
            defaults: ServicePolicy::default(),
            services,
            metrics: MetricsSettings::default(),
        }
    }
}

impl ResilienceConfig {
    /// Loads from `$COURSEGEN_RESILIENCE_CONFIG` when set, otherwise starts from
    /// defaults; environment overrides are applied in both cases.
    pub fn load() -> Result<Self> {
        let base = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_yaml_file(path.trim())?,
            _ => Self::default(),
        };
        let mut cfg = base;
        cfg.apply_env(|k| std::env::var(k).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration_with_context(
                format!("cannot read config file: {}", e),
                ErrorContext::new()
                    .with_source("config")
                    .with_details(path.display().to_string()),
            )
        })?;
        debug!(path = %path.display(), "loaded resilience config");
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let cfg: Self = serde_yaml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Overlays `COURSEGEN_*` knobs read through `lookup`.
    ///
    /// Service-wide knobs (breaker, rate, retry) apply to `defaults` and to every
    /// declared service.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("COURSEGEN_CACHE_ENABLED") {
            self.cache.enabled = parse_bool("COURSEGEN_CACHE_ENABLED", &v)?;
        }
        if let Some(v) = lookup("COURSEGEN_CACHE_DIR") {
            let v = v.trim();
            self.cache.dir = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        if let Some(v) = lookup("COURSEGEN_CACHE_TTL_SECS") {
            self.cache.default_ttl = Duration::from_secs(parse_num("COURSEGEN_CACHE_TTL_SECS", &v)?);
        }
        if let Some(v) = lookup("COURSEGEN_METRICS_EXPORT") {
            self.metrics.export_enabled = parse_bool("COURSEGEN_METRICS_EXPORT", &v)?;
        }

        let threshold = lookup("COURSEGEN_BREAKER_FAILURE_THRESHOLD")
            .map(|v| parse_num::<u32>("COURSEGEN_BREAKER_FAILURE_THRESHOLD", &v))
            .transpose()?;
        let cooldown = lookup("COURSEGEN_BREAKER_COOLDOWN_SECS")
            .map(|v| parse_num::<u64>("COURSEGEN_BREAKER_COOLDOWN_SECS", &v))
            .transpose()?;
        let rpm = lookup("COURSEGEN_RPM")
            .map(|v| parse_num::<u32>("COURSEGEN_RPM", &v))
            .transpose()?;
        let attempts = lookup("COURSEGEN_RETRY_MAX_ATTEMPTS")
            .map(|v| parse_num::<u32>("COURSEGEN_RETRY_MAX_ATTEMPTS", &v))
            .transpose()?;

        for policy in std::iter::once(&mut self.defaults).chain(self.services.values_mut()) {
            if let Some(t) = threshold {
                policy.breaker.failure_threshold = t;
            }
            if let Some(secs) = cooldown {
                policy.breaker.reset_timeout = Duration::from_secs(secs);
            }
            if let Some(n) = rpm {
                policy.rate_limit = RateLimiterConfig::per_minute(n).with_kind(policy.rate_limit.kind);
            }
            if let Some(n) = attempts {
                policy.retry.max_attempts = n;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.defaults.validate().map_err(|e| scoped(e, "defaults"))?;
        for (service, policy) in &self.services {
            policy
                .validate()
                .map_err(|e| scoped(e, &format!("services.{}", service)))?;
        }
        if self.cache.max_entries == 0 {
            return Err(Error::configuration("cache.max_entries must be at least 1"));
        }
        if self.metrics.export_enabled && self.metrics.export_interval.is_zero() {
            return Err(Error::configuration(
                "metrics.export_interval_secs must be non-zero when export is enabled",
            ));
        }
        Ok(())
    }

    /// Effective policy for `service`.
    pub fn policy_for(&self, service: &ServiceId) -> &ServicePolicy {
        self.services.get(service).unwrap_or(&self.defaults)
    }
}

fn scoped(err: Error, section: &str) -> Error {
    match err {
        Error::Configuration { message, .. } => Error::configuration_with_context(
            message,
            ErrorContext::new().with_source("config").with_details(section),
        ),
        other => other,
    }
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::configuration(format!(
            "{} must be a boolean, got '{}'",
            name, other
        ))),
    }
}

fn parse_num<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim().parse::<T>().map_err(|_| {
        Error::configuration(format!("{} must be a non-negative integer, got '{}'", name, raw))
    })
}

/// Serde adapter: `Duration` as seconds. Whole values are written as integers,
/// sub-second precision as a float (`0.5`).
pub mod duration_secs {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Secs {
        Whole(u64),
        Fractional(f64),
    }

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        if d.subsec_nanos() == 0 {
            s.serialize_u64(d.as_secs())
        } else {
            s.serialize_f64(d.as_secs_f64())
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        match Secs::deserialize(d)? {
            Secs::Whole(n) => Ok(Duration::from_secs(n)),
            Secs::Fractional(f) => Duration::try_from_secs_f64(f)
                .map_err(|e| D::Error::custom(format!("invalid duration {}: {}", f, e))),
        }
    }
}

/// Serde adapter: `Duration` as milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

pub mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|o| o.map(Duration::from_millis))
    }
}
