//! KernelCache: concurrent, version-keyed, LRU-evicting store of compiled
//! kernels.
//!
//! Grounded on `emu_core`'s `cache.rs` (`GlobalCache`, the `Cache` trait,
//! the `lazy_static` `RwLock<HashMap<..>>` + `VecDeque` LRU bookkeeping) —
//! generalized from a single global `RwLock<HashMap>` to a sharded
//! [`dashmap::DashMap`] so lookups on distinct keys do not serialize (spec
//! §4.4/§5's concurrency requirement), with atomic hit/miss/eviction
//! counters and a short-held-lock latency ring rather than the teacher's
//! single coarse lock.

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Canonical string identity of a cache entry. Collisions are treated as
/// identity per spec §3 — we carry it as an owned `String` rather than a
/// numeric hash, matching the `"<id>|<backend>|<fingerprint>|..."` shape
/// `crate::loader` constructs.
pub type CacheKey = String;

/// Free-form metadata carried alongside a cache entry.
pub type Metadata = HashMap<String, String>;

#[derive(Clone)]
struct CacheEntry<T> {
    value: Arc<T>,
    version: String,
    created: Instant,
    last_access: AtomicArcTime,
    access_count: Arc<AtomicU64>,
    metadata: Metadata,
}

/// `Instant` has no atomic form; we store elapsed-since-`created` nanos
/// atomically instead so `try_get` can bump `last_access` without taking a
/// lock on the hot path.
#[derive(Clone)]
struct AtomicArcTime(Arc<AtomicU64>, Instant);

impl AtomicArcTime {
    fn new(base: Instant) -> Self {
        Self(Arc::new(AtomicU64::new(0)), base)
    }
    fn touch(&self, base: Instant) {
        self.0.store(base.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }
    fn get(&self) -> Instant {
        self.1 + Duration::from_nanos(self.0.load(Ordering::Relaxed))
    }
}

impl<T> CacheEntry<T> {
    fn new(value: T, version: String, metadata: Metadata) -> Self {
        Self::with_created(value, version, metadata, Instant::now())
    }

    /// Builds an entry with an explicit `created` instant, used by
    /// `preload` to restore an entry's real age across a process
    /// restart rather than stamping a fresh TTL window (spec §3's
    /// `now - created > ttl` invariant must survive persistence).
    fn with_created(value: T, version: String, metadata: Metadata, created: Instant) -> Self {
        Self {
            value: Arc::new(value),
            version,
            created,
            last_access: AtomicArcTime::new(created),
            access_count: Arc::new(AtomicU64::new(0)),
            metadata,
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.created.elapsed() > ttl
    }

    fn touch(&self) {
        self.last_access.touch(self.created);
        self.access_count.fetch_add(1, Ordering::Relaxed);
    }

    fn last_access(&self) -> Instant {
        self.last_access.get()
    }

    fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }
}

/// A snapshot of cache-wide bookkeeping.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStatistics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub current_size: usize,
    pub max_size: usize,
    pub avg_lookup_latency: Duration,
}

const LATENCY_RING_CAPACITY: usize = 1000;

struct LatencyRing {
    samples: Mutex<VecDeque<Duration>>,
}

impl LatencyRing {
    fn new() -> Self {
        Self { samples: Mutex::new(VecDeque::with_capacity(LATENCY_RING_CAPACITY)) }
    }
    fn record(&self, d: Duration) {
        let mut g = self.samples.lock();
        if g.len() == LATENCY_RING_CAPACITY {
            g.pop_front();
        }
        g.push_back(d);
    }
    fn average(&self) -> Duration {
        let g = self.samples.lock();
        if g.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = g.iter().sum();
        total / g.len() as u32
    }
}

/// A shared, thread-safe store of compiled kernels keyed by [`CacheKey`].
pub struct KernelCache<T> {
    config: CacheConfig,
    entries: DashMap<CacheKey, CacheEntry<T>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    latency: LatencyRing,
    disposed: AtomicBool,
}

impl<T> KernelCache<T> {
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    pub fn with_config(config: CacheConfig) -> Self {
        let config = config.normalized();
        Self {
            config,
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            latency: LatencyRing::new(),
            disposed: AtomicBool::new(false),
        }
    }

    fn check_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(Error::CacheDisposed)
        } else {
            Ok(())
        }
    }

    /// Version mismatch or expiry both remove the stale entry and count
    /// as a miss (spec §4.4).
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn try_get(&self, key: &str, expected_version: &str) -> Result<Option<Arc<T>>> {
        self.check_disposed()?;
        let start = Instant::now();
        let result = match self.entries.get(key) {
            Some(entry) => {
                if entry.version != expected_version || entry.is_expired(self.config.default_ttl) {
                    drop(entry);
                    self.entries.remove(key);
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(key, "cache entry stale, removed");
                    None
                } else {
                    entry.touch();
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    Some(entry.value.clone())
                }
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        };
        self.latency.record(start.elapsed());
        Ok(result)
    }

    /// If current size >= `max_size * eviction_threshold`, runs LRU
    /// eviction before insertion. Insertion overwrites any existing entry
    /// atomically.
    #[tracing::instrument(level = "trace", skip_all)]
    pub fn put(&self, key: impl Into<CacheKey>, value: T, version: impl Into<String>, metadata: Metadata) -> Result<()> {
        self.check_disposed()?;
        let key = key.into();
        let threshold = (self.config.max_size as f64 * self.config.eviction_threshold).ceil() as usize;
        if self.entries.len() >= threshold && !self.entries.contains_key(&key) {
            // Evict to one below the 70%-of-max target so that the
            // insertion this eviction guards lands the cache exactly at
            // that target, rather than one over it.
            let target = target_size(self.config.max_size, 0.7).saturating_sub(1);
            self.evict_to(target);
        }
        self.entries.insert(key, CacheEntry::new(value, version.into(), metadata));
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<bool> {
        self.check_disposed()?;
        Ok(self.entries.remove(key).is_some())
    }

    pub fn clear(&self) -> Result<()> {
        self.check_disposed()?;
        self.entries.clear();
        Ok(())
    }

    /// Removes all entries whose version equals `v`; returns count.
    pub fn invalidate_version(&self, version: &str) -> Result<usize> {
        self.check_disposed()?;
        let to_remove: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|kv| kv.value().version == version)
            .map(|kv| kv.key().clone())
            .collect();
        for k in &to_remove {
            self.entries.remove(k);
        }
        Ok(to_remove.len())
    }

    /// Removes expired entries; if still over `max_size`, runs LRU
    /// eviction down to 70% of max. Returns the count removed.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn perform_maintenance(&self) -> Result<usize> {
        self.check_disposed()?;
        let ttl = self.config.default_ttl;
        let expired: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|kv| kv.value().is_expired(ttl))
            .map(|kv| kv.key().clone())
            .collect();
        let mut removed = 0usize;
        for k in &expired {
            if self.entries.remove(k).is_some() {
                removed += 1;
            }
        }
        if self.entries.len() > self.config.max_size {
            removed += self.evict_to(target_size(self.config.max_size, 0.7));
        }
        tracing::info!(removed, "maintenance complete");
        Ok(removed)
    }

    /// Sorts known entries by `last_access` ascending, removes the oldest
    /// until `size == target`. Tie-break by `access_count` ascending, then
    /// insertion order (here: key order, since DashMap iteration order is
    /// otherwise unspecified and stable key ordering is the only
    /// deterministic tie-break available without tracking insertion
    /// sequence separately).
    fn evict_to(&self, target: usize) -> usize {
        if self.entries.len() <= target {
            return 0;
        }
        let mut ranked: Vec<(CacheKey, Instant, u64)> = self
            .entries
            .iter()
            .map(|kv| (kv.key().clone(), kv.value().last_access(), kv.value().access_count()))
            .collect();
        ranked.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)).then(a.0.cmp(&b.0)));
        let to_remove = self.entries.len() - target;
        let mut evicted = 0usize;
        for (key, _, _) in ranked.into_iter().take(to_remove) {
            if self.entries.remove(&key).is_some() {
                evicted += 1;
            }
        }
        self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    pub fn get_statistics(&self) -> CacheStatistics {
        CacheStatistics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            current_size: self.entries.len(),
            max_size: self.config.max_size,
            avg_lookup_latency: self.latency.average(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Marks the cache disposed; subsequent operations return
    /// `Error::CacheDisposed`.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    /// Non-erroring disposal check for collaborators (the maintenance
    /// timer) that want to stop quietly rather than surface
    /// `Error::CacheDisposed`.
    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }
}

fn target_size(max_size: usize, fraction: f64) -> usize {
    (max_size as f64 * fraction).ceil() as usize
}

impl<T> Default for KernelCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// On-disk record for one persisted entry; `version` gates validity on
/// reload per spec §6/§9 (implementers version the format explicitly and
/// reject unrecognized versions).
#[derive(serde::Serialize, serde::Deserialize)]
struct PersistedEntry {
    format_version: u32,
    version: String,
    /// The entry's age (`created.elapsed()`) in milliseconds at persist
    /// time, not a Unix-epoch timestamp — `Instant` has no epoch mapping,
    /// so age is what `preload` needs to reconstruct an equivalent
    /// `created` instant on the other side of a process restart.
    created_age_millis: u64,
    metadata: Metadata,
    #[serde(with = "serde_bytes_vec")]
    payload: Vec<u8>,
}

const PERSISTED_FORMAT_VERSION: u32 = 2;

mod serde_bytes_vec {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        bytes.to_vec().serialize(s)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        Vec::<u8>::deserialize(d)
    }
}

impl<T> KernelCache<T>
where
    T: serde::Serialize + for<'de> serde::Deserialize<'de>,
{
    fn sanitize_key(key: &str) -> String {
        key.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect()
    }

    /// Best-effort; failures are logged, never propagated.
    pub fn persist(&self) -> Result<()> {
        self.check_disposed()?;
        let Some(dir) = self.config.cache_directory.as_ref() else {
            return Ok(());
        };
        if !self.config.enable_persistent_cache {
            return Ok(());
        }
        if let Err(e) = std::fs::create_dir_all(dir).map_err(crate::error::PersistenceError::from) {
            tracing::warn!(error = %e, "persist: failed to create cache directory");
            return Ok(());
        }
        for kv in self.entries.iter() {
            let key = kv.key();
            let entry = kv.value();
            let payload = match serde_json::to_vec(entry.value.as_ref()).map_err(crate::error::PersistenceError::from) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(key, error = %e, "persist: failed to serialize entry payload");
                    continue;
                }
            };
            let record = PersistedEntry {
                format_version: PERSISTED_FORMAT_VERSION,
                version: entry.version.clone(),
                created_age_millis: entry
                    .created
                    .elapsed()
                    .as_millis()
                    .try_into()
                    .unwrap_or(u64::MAX),
                metadata: entry.metadata.clone(),
                payload,
            };
            let path: PathBuf = dir.join(format!("{}.cache", Self::sanitize_key(key)));
            match serde_json::to_vec(&record).map_err(crate::error::PersistenceError::from) {
                Ok(bytes) => {
                    if let Err(e) = std::fs::write(&path, bytes).map_err(crate::error::PersistenceError::from) {
                        tracing::warn!(error = %e, path = %path.display(), "persist: write failed");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "persist: failed to serialize record"),
            }
        }
        Ok(())
    }

    /// Best-effort; failures (including corrupt/truncated files) are
    /// skipped silently.
    pub fn preload(&self) -> Result<usize> {
        self.check_disposed()?;
        let Some(dir) = self.config.cache_directory.as_ref() else {
            return Ok(0);
        };
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(_) => return Ok(0),
        };
        let mut loaded = 0usize;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("cache") {
                continue;
            }
            let Ok(bytes) = std::fs::read(&path) else { continue };
            let Ok(record) = serde_json::from_slice::<PersistedEntry>(&bytes) else {
                tracing::debug!(path = %path.display(), "preload: corrupt/truncated, skipped");
                continue;
            };
            if record.format_version != PERSISTED_FORMAT_VERSION {
                tracing::debug!(path = %path.display(), "preload: unrecognized format version, skipped");
                continue;
            }
            let Ok(value) = serde_json::from_slice::<T>(&record.payload) else {
                continue;
            };
            let key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            let created = Instant::now()
                .checked_sub(Duration::from_millis(record.created_age_millis))
                .unwrap_or_else(Instant::now);
            self.entries.insert(key, CacheEntry::with_created(value, record.version, record.metadata, created));
            loaded += 1;
        }
        Ok(loaded)
    }
}
