//! Typed configuration data. Loading these from a file or CLI is an
//! out-of-scope collaborator; the data model itself is core.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a [`crate::cache::KernelCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_size: usize,
    pub default_ttl: Duration,
    pub enable_persistent_cache: bool,
    pub cache_directory: Option<PathBuf>,
    pub maintenance_interval: Duration,
    pub enable_automatic_maintenance: bool,
    pub eviction_threshold: f64,
    pub enable_compression: bool,
    pub enable_encryption: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            default_ttl: Duration::from_secs(24 * 60 * 60),
            enable_persistent_cache: true,
            cache_directory: None,
            maintenance_interval: Duration::from_secs(60 * 60),
            enable_automatic_maintenance: true,
            eviction_threshold: 0.8,
            enable_compression: true,
            enable_encryption: false,
        }
    }
}

impl CacheConfig {
    /// Normalizes caller-supplied values rather than panicking on a bad
    /// config: an out-of-range `eviction_threshold` is clamped and logged.
    pub fn normalized(mut self) -> Self {
        if !(self.eviction_threshold > 0.0 && self.eviction_threshold <= 1.0) {
            tracing::warn!(
                given = self.eviction_threshold,
                "eviction_threshold out of (0, 1], clamping to default"
            );
            self.eviction_threshold = 0.8;
        }
        if self.max_size == 0 {
            tracing::warn!("max_size of 0 is not useful, clamping to 1");
            self.max_size = 1;
        }
        self
    }
}

/// Preferences governing accelerator discovery.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub probe_ptx: bool,
    pub probe_opencl: bool,
    pub probe_cpu: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            probe_ptx: true,
            probe_opencl: true,
            probe_cpu: true,
        }
    }
}

impl RuntimeConfig {
    /// A pool restricted to the CPU backend, useful for tests that want
    /// deterministic behavior without real accelerator hardware present.
    pub fn cpu_only() -> Self {
        Self {
            probe_ptx: false,
            probe_opencl: false,
            probe_cpu: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let c = CacheConfig::default();
        assert_eq!(c.max_size, 1000);
        assert_eq!(c.default_ttl, Duration::from_secs(86400));
        assert!(c.enable_persistent_cache);
        assert_eq!(c.cache_directory, None);
        assert_eq!(c.maintenance_interval, Duration::from_secs(3600));
        assert!(c.enable_automatic_maintenance);
        assert_eq!(c.eviction_threshold, 0.8);
        assert!(c.enable_compression);
        assert!(!c.enable_encryption);
    }

    #[test]
    fn normalizes_bad_eviction_threshold() {
        let c = CacheConfig { eviction_threshold: 3.0, ..CacheConfig::default() };
        let c = c.normalized();
        assert_eq!(c.eviction_threshold, 0.8);
    }
}
