//! Cache backend implementations.

use super::key::{sha256_hex, CacheKey};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A stored value and its bookkeeping.
///
/// `created_at_ms` is wall-clock so that persisted entries keep their age
/// across process restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub created_at_ms: u64,
    pub ttl: Duration,
    pub hit_count: u64,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, value: Vec<u8>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            value,
            created_at_ms: now_ms(),
            ttl,
            hit_count: 0,
        }
    }

    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_at_ms) >= self.ttl.as_millis() as u64
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_ms())
    }
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Returns the live entry for `key`. Expired entries are removed and reported absent.
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>>;
    async fn set(&self, key: &CacheKey, value: &[u8], ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &CacheKey) -> Result<bool>;
    async fn exists(&self, key: &CacheKey) -> Result<bool>;
    async fn clear(&self) -> Result<()>;
    async fn len(&self) -> Result<usize>;
    /// Removes every expired entry, returning how many were dropped.
    async fn purge_expired(&self) -> Result<usize>;
    /// Synchronous reachability check used by health probes.
    fn probe(&self) -> Result<String> {
        Ok(format!("{} backend ready", self.name()))
    }
    fn name(&self) -> &'static str;
}

/// Bounded in-process LRU cache.
pub struct MemoryCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let mut entries = self.lock();
        match entries.get_mut(&key.hash) {
            None => return Ok(None),
            Some(entry) if !entry.is_expired() => {
                entry.hit_count += 1;
                return Ok(Some(entry.clone()));
            }
            Some(_) => {}
        }
        entries.pop(&key.hash);
        Ok(None)
    }
    async fn set(&self, key: &CacheKey, value: &[u8], ttl: Duration) -> Result<()> {
        let entry = CacheEntry::new(key.hash.clone(), value.to_vec(), ttl);
        self.lock().put(key.hash.clone(), entry);
        Ok(())
    }
    async fn delete(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.lock().pop(&key.hash).is_some())
    }
    async fn exists(&self, key: &CacheKey) -> Result<bool> {
        Ok(self
            .lock()
            .peek(&key.hash)
            .map(|e| !e.is_expired())
            .unwrap_or(false))
    }
    async fn clear(&self) -> Result<()> {
        self.lock().clear();
        Ok(())
    }
    async fn len(&self) -> Result<usize> {
        Ok(self.lock().iter().filter(|(_, e)| !e.is_expired()).count())
    }
    async fn purge_expired(&self) -> Result<usize> {
        let mut entries = self.lock();
        let now = now_ms();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.is_expired_at(now))
            .map(|(k, _)| k.clone())
            .collect();
        for k in &expired {
            entries.pop(k);
        }
        Ok(expired.len())
    }
    fn name(&self) -> &'static str {
        "memory"
    }
}

const ENVELOPE_VERSION: u32 = 1;

/// A temp file older than this was left by an interrupted write.
const STALE_TEMP_AGE: Duration = Duration::from_secs(10 * 60);

/// On-disk format of one [`FileCache`] entry.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    key: String,
    created_at_ms: u64,
    ttl_ms: u64,
    value_b64: String,
}

enum Loaded {
    Missing,
    Live(CacheEntry),
    /// Carries the stored key.
    Expired(String),
    Corrupt(String),
}

/// Persistent cache: one JSON envelope per key in a directory.
///
/// Writes go to a temporary file that is renamed into place, so a reader sees
/// either the previous or the new entry. Envelopes that fail to parse are
/// treated as misses and removed.
pub struct FileCache {
    dir: PathBuf,
    // Hits are counted in-process; persisted entries stay immutable.
    hits: Mutex<HashMap<String, u64>>,
}

impl FileCache {
    /// Opens (creating if needed) a cache directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| io_unavailable("create cache dir", &dir, e))?;
        Ok(Self {
            dir,
            hits: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &CacheKey) -> PathBuf {
        // Keys may carry a namespace prefix, so the file name is a hash of the full key.
        self.dir.join(format!("{}.json", sha256_hex(key.hash.as_bytes())))
    }

    async fn load(path: &Path, expected_key: Option<&str>) -> Result<Loaded> {
        let bytes = match tokio::fs::read(path).await {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Loaded::Missing),
            Err(e) => return Err(io_unavailable("read cache entry", path, e)),
        };
        let env: Envelope = match serde_json::from_slice(&bytes) {
            Ok(env) => env,
            Err(e) => return Ok(Loaded::Corrupt(e.to_string())),
        };
        if env.version != ENVELOPE_VERSION {
            return Ok(Loaded::Corrupt(format!("unsupported version {}", env.version)));
        }
        if let Some(expected) = expected_key {
            if env.key != expected {
                return Ok(Loaded::Corrupt("key mismatch".into()));
            }
        }
        let value = match BASE64.decode(env.value_b64.as_bytes()) {
            Ok(v) => v,
            Err(e) => return Ok(Loaded::Corrupt(e.to_string())),
        };
        let entry = CacheEntry {
            key: env.key,
            value,
            created_at_ms: env.created_at_ms,
            ttl: Duration::from_millis(env.ttl_ms),
            hit_count: 0,
        };
        if entry.is_expired() {
            Ok(Loaded::Expired(entry.key))
        } else {
            Ok(Loaded::Live(entry))
        }
    }

    async fn remove_quietly(path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != ErrorKind::NotFound {
                debug!(path = %path.display(), error = %e, "could not remove cache file");
            }
        }
    }

    async fn entry_files(&self) -> Result<Vec<PathBuf>> {
        self.files_with_extension("json").await
    }

    async fn files_with_extension(&self, ext: &str) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        let mut rd = match tokio::fs::read_dir(&self.dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(io_unavailable("list cache dir", &self.dir, e)),
        };
        while let Some(ent) = rd
            .next_entry()
            .await
            .map_err(|e| io_unavailable("list cache dir", &self.dir, e))?
        {
            let path = ent.path();
            if path.extension().and_then(|e| e.to_str()) == Some(ext) {
                out.push(path);
            }
        }
        Ok(out)
    }

    /// Removes temp files older than `max_age`; returns how many were removed.
    async fn sweep_temp_files(&self, max_age: Duration) -> Result<usize> {
        let mut removed = 0;
        for path in self.files_with_extension("tmp").await? {
            let age = match tokio::fs::metadata(&path).await.and_then(|m| m.modified()) {
                Ok(modified) => modified.elapsed().unwrap_or_default(),
                Err(_) => continue,
            };
            if age >= max_age {
                Self::remove_quietly(&path).await;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(dir = %self.dir.display(), removed, "swept abandoned temp files");
        }
        Ok(removed)
    }

    fn hits(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        self.hits.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn io_unavailable(what: &str, path: &Path, e: std::io::Error) -> Error {
    Error::cache_unavailable(
        format!("{}: {}", what, e),
        ErrorContext::new()
            .with_source("file_cache")
            .with_details(path.display().to_string()),
    )
}

#[async_trait]
impl CacheBackend for FileCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let path = self.path_for(key);
        match Self::load(&path, Some(key.hash.as_str())).await? {
            Loaded::Missing => Ok(None),
            Loaded::Live(mut entry) => {
                let mut hits = self.hits();
                let count = hits.entry(key.hash.clone()).or_insert(0);
                *count += 1;
                entry.hit_count = *count;
                Ok(Some(entry))
            }
            Loaded::Expired(_) => {
                Self::remove_quietly(&path).await;
                self.hits().remove(&key.hash);
                Ok(None)
            }
            Loaded::Corrupt(reason) => {
                warn!(path = %path.display(), reason = reason.as_str(), "discarding corrupt cache entry");
                Self::remove_quietly(&path).await;
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &CacheKey, value: &[u8], ttl: Duration) -> Result<()> {
        let env = Envelope {
            version: ENVELOPE_VERSION,
            key: key.hash.clone(),
            created_at_ms: now_ms(),
            ttl_ms: ttl.as_millis() as u64,
            value_b64: BASE64.encode(value),
        };
        let bytes = serde_json::to_vec(&env)?;
        let path = self.path_for(key);
        let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_unavailable("create cache dir", &self.dir, e))?;
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| io_unavailable("write cache entry", &tmp, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            Self::remove_quietly(&tmp).await;
            return Err(io_unavailable("commit cache entry", &path, e));
        }
        self.hits().remove(&key.hash);
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool> {
        let path = self.path_for(key);
        self.hits().remove(&key.hash);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_unavailable("delete cache entry", &path, e)),
        }
    }

    async fn exists(&self, key: &CacheKey) -> Result<bool> {
        Ok(matches!(
            Self::load(&self.path_for(key), Some(key.hash.as_str())).await?,
            Loaded::Live(_)
        ))
    }

    async fn clear(&self) -> Result<()> {
        for path in self.entry_files().await? {
            tokio::fs::remove_file(&path)
                .await
                .or_else(|e| if e.kind() == ErrorKind::NotFound { Ok(()) } else { Err(e) })
                .map_err(|e| io_unavailable("clear cache", &path, e))?;
        }
        self.sweep_temp_files(STALE_TEMP_AGE).await?;
        self.hits().clear();
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        let mut n = 0;
        for path in self.entry_files().await? {
            if let Loaded::Live(_) = Self::load(&path, None).await? {
                n += 1;
            }
        }
        Ok(n)
    }

    async fn purge_expired(&self) -> Result<usize> {
        let mut removed = 0;
        for path in self.entry_files().await? {
            match Self::load(&path, None).await? {
                Loaded::Expired(key) => {
                    Self::remove_quietly(&path).await;
                    self.hits().remove(&key);
                    removed += 1;
                }
                Loaded::Corrupt(_) => {
                    Self::remove_quietly(&path).await;
                    removed += 1;
                }
                Loaded::Live(_) | Loaded::Missing => {}
            }
        }
        self.sweep_temp_files(STALE_TEMP_AGE).await?;
        Ok(removed)
    }

    fn probe(&self) -> Result<String> {
        let meta = std::fs::metadata(&self.dir)
            .map_err(|e| io_unavailable("stat cache dir", &self.dir, e))?;
        if !meta.is_dir() {
            return Err(Error::cache_unavailable(
                "cache path is not a directory",
                ErrorContext::new()
                    .with_source("file_cache")
                    .with_details(self.dir.display().to_string()),
            ));
        }
        if meta.permissions().readonly() {
            return Err(Error::cache_unavailable(
                "cache directory is read-only",
                ErrorContext::new()
                    .with_source("file_cache")
                    .with_details(self.dir.display().to_string()),
            ));
        }
        Ok(format!("file cache at {}", self.dir.display()))
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

pub struct NullCache;
impl NullCache {
    pub fn new() -> Self {
        Self
    }
}
impl Default for NullCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for NullCache {
    async fn get(&self, _: &CacheKey) -> Result<Option<CacheEntry>> {
        Ok(None)
    }
    async fn set(&self, _: &CacheKey, _: &[u8], _: Duration) -> Result<()> {
        Ok(())
    }
    async fn delete(&self, _: &CacheKey) -> Result<bool> {
        Ok(false)
    }
    async fn exists(&self, _: &CacheKey) -> Result<bool> {
        Ok(false)
    }
    async fn clear(&self) -> Result<()> {
        Ok(())
    }
    async fn len(&self) -> Result<usize> {
        Ok(0)
    }
    async fn purge_expired(&self) -> Result<usize> {
        Ok(0)
    }
    fn name(&self) -> &'static str {
        "null"
    }
}
