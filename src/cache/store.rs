//! Cache store: typed, metered access to a [`CacheBackend`].

use super::backend::CacheBackend;
use super::key::CacheKey;
use crate::telemetry::{names, MetricsRegistry, Outcome};
use crate::Result;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub default_ttl: Duration,
    pub enabled: bool,
    pub max_entry_size: usize,
    pub key_prefix: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(1800),
            enabled: true,
            max_entry_size: 10 * 1024 * 1024,
            key_prefix: None,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }
    pub fn with_max_entry_size(mut self, bytes: usize) -> Self {
        self.max_entry_size = bytes;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct AtomicStats {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
}

impl AtomicStats {
    fn to_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Memoizes remote-call results.
///
/// Reads never fail: an unreachable backend or an undecodable value is logged,
/// counted under `cache.errors` and reported as a miss.
pub struct CacheStore {
    config: CacheConfig,
    backend: Arc<dyn CacheBackend>,
    metrics: Arc<MetricsRegistry>,
    stats: AtomicStats,
}

impl CacheStore {
    pub fn new(
        config: CacheConfig,
        backend: Arc<dyn CacheBackend>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            config,
            backend,
            metrics,
            stats: AtomicStats::default(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        if !self.config.enabled {
            return None;
        }
        let prefixed = self.prefix_key(key);
        let found = match self.backend.get(&prefixed).await {
            Ok(Some(entry)) => match serde_json::from_slice::<T>(&entry.value) {
                Ok(val) => Some(val),
                Err(e) => {
                    warn!(key = %key, error = %e, "cached value does not decode; treating as miss");
                    self.record_error(key);
                    let _ = self.backend.delete(&prefixed).await;
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(key = %key, backend = self.backend.name(), error = %e, "cache read failed; treating as miss");
                self.record_error(key);
                None
            }
        };
        let outcome = if found.is_some() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            Outcome::Hit
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            Outcome::Miss
        };
        self.emit(names::CACHE_LOOKUPS, key, Some(outcome));
        found
    }

    pub async fn put<T: Serialize>(&self, key: &CacheKey, value: &T) -> Result<()> {
        self.put_with_ttl(key, value, self.config.default_ttl).await
    }

    /// Stores `value`, replacing any existing entry for `key`.
    pub async fn put_with_ttl<T: Serialize>(
        &self,
        key: &CacheKey,
        value: &T,
        ttl: Duration,
    ) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let data = serde_json::to_vec(value)?;
        if data.len() > self.config.max_entry_size {
            debug!(key = %key, size = data.len(), "value exceeds max_entry_size; not cached");
            return Ok(());
        }
        let prefixed = self.prefix_key(key);
        match self.backend.set(&prefixed, &data, ttl).await {
            Ok(()) => {
                self.stats.sets.fetch_add(1, Ordering::Relaxed);
                self.emit(names::CACHE_WRITES, key, None);
                Ok(())
            }
            Err(e) => {
                self.record_error(key);
                Err(e)
            }
        }
    }

    pub async fn invalidate(&self, key: &CacheKey) -> Result<bool> {
        let prefixed = self.prefix_key(key);
        match self.backend.delete(&prefixed).await {
            Ok(d) => {
                if d {
                    self.stats.deletes.fetch_add(1, Ordering::Relaxed);
                    self.emit(names::CACHE_INVALIDATIONS, key, None);
                }
                Ok(d)
            }
            Err(e) => {
                self.record_error(key);
                Err(e)
            }
        }
    }

    /// Invalidates every entry.
    pub async fn clear(&self) -> Result<()> {
        self.backend.clear().await.map_err(|e| {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            self.metrics.increment(names::CACHE_ERRORS, &[]);
            e
        })
    }

    pub async fn purge_expired(&self) -> Result<usize> {
        self.backend.purge_expired().await
    }

    pub async fn len(&self) -> Result<usize> {
        self.backend.len().await
    }

    pub fn probe(&self) -> Result<String> {
        self.backend.probe()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.to_stats()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    fn prefix_key(&self, key: &CacheKey) -> CacheKey {
        match self.config.key_prefix {
            Some(ref p) => CacheKey {
                hash: format!("{}:{}", p, key.hash),
                ..key.clone()
            },
            None => key.clone(),
        }
    }

    fn record_error(&self, key: &CacheKey) {
        self.stats.errors.fetch_add(1, Ordering::Relaxed);
        self.emit(names::CACHE_ERRORS, key, None);
    }

    fn emit(&self, name: &str, key: &CacheKey, outcome: Option<Outcome>) {
        let mut tags: Vec<(&str, &str)> = Vec::with_capacity(2);
        if let Some(ref s) = key.service {
            tags.push(("service", s.as_str()));
        }
        if let Some(o) = outcome {
            tags.push(("outcome", o.as_str()));
        }
        self.metrics.increment(name, &tags);
    }
}
