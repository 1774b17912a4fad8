//! Response caching: memoizes expensive remote-call results.
//!
//! ## Overview
//!
//! Generating course material repeats many identical requests (re-running a
//! stage, regenerating a deck after a layout change). Caching them:
//! - avoids paying twice for the same completion or image
//! - makes re-runs fast and independent of upstream availability
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`CacheStore`] | Typed get/put/invalidate with TTL, metrics and failure absorption |
//! | [`CacheConfig`] | Enabled flag, default TTL, size limit, key namespace |
//! | [`CacheBackend`] | Trait for storage media |
//! | [`FileCache`] | Persistent directory-backed cache (survives restarts) |
//! | [`MemoryCache`] | In-memory LRU cache |
//! | [`NullCache`] | No-op cache for disabling caching |
//! | [`CacheKeyGenerator`] | Deterministic keys from request inputs |
//!
//! ## Example
//!
//! ```rust
//! use coursegen_resilience::cache::{CacheConfig, CacheKeyGenerator, CacheStore, MemoryCache};
//! use coursegen_resilience::telemetry::MetricsRegistry;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let store = CacheStore::new(
//!     CacheConfig::new().with_ttl(Duration::from_secs(1800)),
//!     Arc::new(MemoryCache::new(1000)),
//!     Arc::new(MetricsRegistry::new()),
//! );
//! let key = CacheKeyGenerator::new().completion("gpt-4o", None, "Outline a course on RAG", None);
//! store.put(&key, &"1. Embeddings\n2. Retrieval".to_string()).await.unwrap();
//! assert!(store.get::<String>(&key).await.is_some());
//! # });
//! ```
//!
//! ## Cache Key Generation
//!
//! Keys hash every named input that affects the output (prompt text, system
//! prompt, model, sampling parameters, image dimensions), so identical requests
//! share an entry while any difference produces a new one.

mod backend;
mod key;
mod store;

pub use backend::{CacheBackend, CacheEntry, FileCache, MemoryCache, NullCache};
pub use key::{CacheKey, CacheKeyGenerator, Fingerprint};
pub use store::{CacheConfig, CacheStats, CacheStore};
