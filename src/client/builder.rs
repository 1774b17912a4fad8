use crate::cache::{
    CacheBackend, CacheConfig, CacheKeyGenerator, CacheStore, FileCache, MemoryCache, NullCache,
};
use crate::client::core::{Inner, ResilientClient};
use crate::config::{ResilienceConfig, ServicePolicy};
use crate::registry::ServiceRegistry;
use crate::service::ServiceId;
use crate::telemetry::{
    noop_sink, HealthRegistry, MetricsRegistry, MetricsSink, ProbeReport, TracingMetricsSink,
};
use crate::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Builder for creating clients with custom configuration.
///
/// Keep this surface area small and predictable: most deployments only need
/// [`from_env`](Self::from_env) followed by [`build`](Self::build).
pub struct ResilientClientBuilder {
    config: ResilienceConfig,
    backend: Option<Arc<dyn CacheBackend>>,
    sink: Option<Arc<dyn MetricsSink>>,
    metrics: Option<Arc<MetricsRegistry>>,
    key_salt: Option<String>,
}

impl ResilientClientBuilder {
    pub fn new() -> Self {
        Self::from_config(ResilienceConfig::default())
    }

    pub fn from_config(config: ResilienceConfig) -> Self {
        Self {
            config,
            backend: None,
            sink: None,
            metrics: None,
            key_salt: None,
        }
    }

    /// Starts from [`ResilienceConfig::load`]: the YAML file named by
    /// `COURSEGEN_RESILIENCE_CONFIG` (if any) plus `COURSEGEN_*` overrides.
    pub fn from_env() -> Result<Self> {
        Ok(Self::from_config(ResilienceConfig::load()?))
    }

    pub fn config(mut self, config: ResilienceConfig) -> Self {
        self.config = config;
        self
    }

    /// Overrides the backend chosen from configuration.
    pub fn cache_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn cache_enabled(mut self, enabled: bool) -> Self {
        self.config.cache.enabled = enabled;
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache.dir = Some(dir.into());
        self
    }

    /// Salt mixed into every cache key (bump it to invalidate all entries).
    pub fn key_salt(mut self, salt: impl Into<String>) -> Self {
        self.key_salt = Some(salt.into());
        self
    }

    /// Inject a metrics sink. Default is a tracing sink when export is enabled.
    pub fn metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Share a metrics registry with other components.
    pub fn metrics_registry(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Declares `service` with its own policy.
    pub fn service_policy(mut self, service: impl Into<ServiceId>, policy: ServicePolicy) -> Self {
        self.config.services.insert(service.into(), policy);
        self
    }

    /// Policy for services that are not declared.
    pub fn default_policy(mut self, policy: ServicePolicy) -> Self {
        self.config.defaults = policy;
        self
    }

    fn backend_from_config(&self) -> Arc<dyn CacheBackend> {
        let settings = &self.config.cache;
        if !settings.enabled {
            return Arc::new(NullCache::new());
        }
        match settings.dir {
            Some(ref dir) => match FileCache::open(dir) {
                Ok(fc) => Arc::new(fc),
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "persistent cache unavailable; using memory cache");
                    Arc::new(MemoryCache::new(settings.max_entries))
                }
            },
            None => Arc::new(MemoryCache::new(settings.max_entries)),
        }
    }

    /// Build the client.
    pub fn build(self) -> Result<ResilientClient> {
        self.config.validate()?;

        let backend = self
            .backend
            .clone()
            .unwrap_or_else(|| self.backend_from_config());
        let metrics = self
            .metrics
            .clone()
            .unwrap_or_else(|| Arc::new(MetricsRegistry::new()));
        let sink = match self.sink.clone() {
            Some(s) => s,
            None if self.config.metrics.export_enabled => Arc::new(TracingMetricsSink),
            None => noop_sink(),
        };

        let settings = &self.config.cache;
        let mut cache_cfg = CacheConfig::new()
            .with_enabled(settings.enabled)
            .with_ttl(settings.default_ttl)
            .with_max_entry_size(settings.max_entry_size);
        if let Some(ref p) = settings.key_prefix {
            cache_cfg = cache_cfg.with_key_prefix(p.clone());
        }
        let cache = CacheStore::new(cache_cfg, backend.clone(), metrics.clone());

        let health = Arc::new(HealthRegistry::new());
        health.register_probe("cache", move || backend.probe().map(ProbeReport::healthy));
        let registry = ServiceRegistry::new(
            self.config.defaults.clone(),
            &self.config.services,
            metrics.clone(),
        )
        .with_health(health.clone());

        let keys = match self.key_salt {
            Some(ref salt) => CacheKeyGenerator::new().with_salt(salt.clone()),
            None => CacheKeyGenerator::new(),
        };

        info!(
            cache_enabled = settings.enabled,
            cache_backend = cache.backend_name(),
            services = registry.services().len(),
            metrics_export = self.config.metrics.export_enabled,
            "resilient client ready"
        );

        Ok(ResilientClient {
            inner: Arc::new(Inner {
                config: self.config,
                cache,
                keys,
                registry,
                metrics,
                health,
                sink,
            }),
        })
    }
}

impl Default for ResilientClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
