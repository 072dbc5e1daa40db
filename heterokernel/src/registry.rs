//! AcceleratorKernelCache: process-wide registry mapping an accelerator to
//! its kernel cache.
//!
//! Grounded on `emu_core`'s `pool.rs` (`lazy_static! DEVICE_POOL`, the
//! once-initialized global plus an explicit `shutdown`-style escape for
//! test isolation) — generalized from a `Vec<DevicePoolMember>` keyed by
//! thread-local index to a `DashMap<u64, Arc<KernelCache<CompiledKernel>>>`
//! keyed by accelerator id, since ownership here is registry-owns-caches
//! with a weak back-reference rather than thread-local device selection
//! (spec §9's "cyclic accelerator/cache ownership" redesign note).

use crate::accelerator::Accelerator;
use crate::cache::{CacheStatistics, KernelCache};
use crate::config::CacheConfig;
use crate::kernel::CompiledKernel;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// The budget `shutdown()` gives each contained cache's `persist()` before
/// forcing teardown regardless (spec §4.5).
pub const TEARDOWN_BUDGET: Duration = Duration::from_secs(10);

/// How often a maintenance timer wakes to check whether its cache has been
/// disposed, independent of `maintenance_interval`. Keeps `shutdown()`
/// latency bounded well below an hour-long `maintenance_interval` rather
/// than tying timer responsiveness to the maintenance period itself (spec
/// §5: "Cache-maintenance timers accept a shutdown signal and drain within
/// a bounded interval").
const MAINTENANCE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Spawns the background timer backing `perform_maintenance` for one cache
/// (spec §4.4: "May run on a timer"). Holds only a `Weak` reference so the
/// timer never keeps a cache alive past the last strong reference, and
/// polls in small increments so it notices disposal quickly even when
/// `interval` is long.
fn spawn_maintenance_timer(cache: Weak<KernelCache<CompiledKernel>>, interval: Duration) {
    std::thread::spawn(move || {
        let poll = MAINTENANCE_POLL_INTERVAL.min(interval);
        let mut elapsed = Duration::ZERO;
        loop {
            std::thread::sleep(poll);
            let Some(cache) = cache.upgrade() else { break };
            if cache.is_disposed() {
                break;
            }
            elapsed += poll;
            if elapsed >= interval {
                elapsed = Duration::ZERO;
                if let Err(e) = cache.perform_maintenance() {
                    tracing::debug!(error = ?e, "maintenance timer stopping");
                    break;
                }
            }
        }
    });
}

/// Process-wide registry mapping `Accelerator -> KernelCache`. The
/// registry exclusively owns caches; each cache only needs the
/// accelerator's id to key by, avoiding the accelerator/cache ownership
/// cycle the source exhibits (spec §9).
pub struct AcceleratorKernelCache {
    caches: DashMap<u64, Arc<KernelCache<CompiledKernel>>>,
}

impl AcceleratorKernelCache {
    pub fn new() -> Self {
        Self { caches: DashMap::new() }
    }

    /// Returns the shared cache for `accelerator`, creating it with
    /// `config` on first call. Subsequent calls ignore `config` and return
    /// the existing cache, matching a lazily-initialized-singleton-per-key
    /// model. If `config.enable_automatic_maintenance` is set, a timer is
    /// started for a newly-created cache (spec §4.4/§6).
    pub fn get_or_create_cache(&self, accelerator: &Accelerator, config: CacheConfig) -> Arc<KernelCache<CompiledKernel>> {
        let mut just_created = None;
        let cache = self
            .caches
            .entry(accelerator.id())
            .or_insert_with(|| {
                tracing::info!(accelerator_id = accelerator.id(), backend = %accelerator.backend(), "creating kernel cache for accelerator");
                let cache = Arc::new(KernelCache::with_config(config.clone()));
                just_created = Some(cache.clone());
                cache
            })
            .clone();
        if let Some(cache) = just_created {
            if config.enable_automatic_maintenance {
                spawn_maintenance_timer(Arc::downgrade(&cache), config.maintenance_interval);
            }
        }
        cache
    }

    pub fn get_cache(&self, accelerator: &Accelerator) -> Option<Arc<KernelCache<CompiledKernel>>> {
        self.caches.get(&accelerator.id()).map(|e| e.clone())
    }

    /// Clears every contained cache.
    pub fn clear_all(&self) {
        for entry in self.caches.iter() {
            let _ = entry.value().clear();
        }
    }

    /// Aggregates statistics across every contained cache.
    pub fn aggregate_statistics(&self) -> CacheStatistics {
        let mut agg = CacheStatistics::default();
        for entry in self.caches.iter() {
            let s = entry.value().get_statistics();
            agg.hits += s.hits;
            agg.misses += s.misses;
            agg.evictions += s.evictions;
            agg.current_size += s.current_size;
            agg.max_size += s.max_size;
        }
        agg
    }

    /// Disposal: best-effort `persist()` on each contained cache within a
    /// 10-second budget, then forced shutdown regardless of whether
    /// persistence completed.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn shutdown(&self) {
        let deadline = Instant::now() + TEARDOWN_BUDGET;
        let mut forced = false;
        for entry in self.caches.iter() {
            if Instant::now() >= deadline {
                forced = true;
                break;
            }
            if let Err(e) = entry.value().persist() {
                tracing::warn!(error = ?e, "best-effort persist failed during teardown");
            }
        }
        for entry in self.caches.iter() {
            entry.value().dispose();
        }
        tracing::info!(forced, "accelerator kernel cache registry shut down");
        self.caches.clear();
    }

    pub fn len(&self) -> usize {
        self.caches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }
}

impl Default for AcceleratorKernelCache {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static::lazy_static! {
    static ref GLOBAL_REGISTRY: AcceleratorKernelCache = AcceleratorKernelCache::new();
}

/// The process-wide instance. Provided as a function (rather than a bare
/// `static`) so call sites read like an explicit API, matching the
/// teacher's `pool()`/`take()` style of wrapping `lazy_static` globals.
pub fn global() -> &'static AcceleratorKernelCache {
    &GLOBAL_REGISTRY
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accelerator::Accelerator;

    #[test]
    fn get_or_create_is_idempotent_per_accelerator() {
        let registry = AcceleratorKernelCache::new();
        let acc = Accelerator::cpu(42);
        let c1 = registry.get_or_create_cache(&acc, CacheConfig::default());
        let c2 = registry.get_or_create_cache(&acc, CacheConfig::default());
        assert!(Arc::ptr_eq(&c1, &c2));
    }

    #[test]
    fn shutdown_disposes_all_contained_caches() {
        let registry = AcceleratorKernelCache::new();
        let acc = Accelerator::cpu(1);
        let cache = registry.get_or_create_cache(&acc, CacheConfig::default());
        registry.shutdown();
        assert!(matches!(
            cache.put("k", sample_kernel("x"), "v1", crate::cache::Metadata::new()),
            Err(crate::error::Error::CacheDisposed)
        ));
    }

    fn sample_kernel(name: &str) -> CompiledKernel {
        CompiledKernel {
            backend: crate::accelerator::BackendTag::Cpu,
            blob: crate::kernel::KernelBlob::CpuEntryToken(name.into()),
            entry_point: crate::kernel::EntryPoint {
                name: name.into(), parameter_offsets: vec![], total_size: 0,
                uses_dynamic_shared_memory: false, kernel_index_type: None,
            },
            info: None,
            language_version: "native".into(),
        }
    }

    #[test]
    fn automatic_maintenance_timer_expires_entries() {
        let registry = AcceleratorKernelCache::new();
        let acc = Accelerator::cpu(7);
        let config = CacheConfig {
            default_ttl: Duration::from_millis(20),
            maintenance_interval: Duration::from_millis(50),
            enable_automatic_maintenance: true,
            ..CacheConfig::default()
        };
        let cache = registry.get_or_create_cache(&acc, config);
        cache.put("k", sample_kernel("x"), "v1", crate::cache::Metadata::new()).unwrap();
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn maintenance_timer_stops_promptly_after_dispose() {
        let registry = AcceleratorKernelCache::new();
        let acc = Accelerator::cpu(8);
        let config = CacheConfig {
            maintenance_interval: Duration::from_secs(3600),
            enable_automatic_maintenance: true,
            ..CacheConfig::default()
        };
        let cache = registry.get_or_create_cache(&acc, config);
        cache.dispose();
        // The timer polls every 200ms regardless of the hour-long
        // maintenance_interval and exits as soon as it observes disposal;
        // this would hang for up to an hour if the poll were tied to the
        // interval instead.
        std::thread::sleep(Duration::from_millis(500));
    }
}
