//! Platform and isolate configuration
//!
//! Configuration is plain data with sensible defaults. Every struct derives
//! `Serialize`/`Deserialize` so hosts can load it from JSON alongside the rest
//! of their settings; missing fields fall back to the defaults.
//!
//! # Heap policy
//! The ratchet constants (pressure headroom and near-heap-limit grant) are
//! tuned against observed engine behavior and are exposed as policy rather
//! than hard-coded.

use crate::error::{IsolateError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Smallest memory limit a sandboxed isolate may be created with.
pub const MIN_MEMORY_LIMIT_MB: usize = 8;

/// Largest memory limit accepted. Anything above is a configuration mistake
/// rather than a budget.
pub const MAX_MEMORY_LIMIT_MB: usize = 1024 * 1024;

/// Memory limit used when none is configured.
pub const DEFAULT_MEMORY_LIMIT_MB: usize = 128;

const MIB: usize = 1024 * 1024;
const GIB: usize = 1024 * MIB;

/// Process-level settings for the shared worker pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Number of pool threads running non-privileged isolates
    pub worker_threads: usize,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get() + 1,
        }
    }
}

impl PlatformConfig {
    /// Parse a platform configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        debug!(worker_threads = config.worker_threads, "Loaded platform config");
        Ok(config)
    }

    /// Pool size actually used; zero is treated as one thread.
    pub fn effective_worker_threads(&self) -> usize {
        self.worker_threads.max(1)
    }
}

/// Heuristics for the heap-limit ratchet and pre-emptive collection
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapPolicy {
    /// Moderate pressure is requested once `usage * (1 + pressure_headroom)`
    /// would exceed the limit.
    pub pressure_headroom: f64,
    /// Bytes temporarily added to the engine heap ceiling when it nears its limit.
    pub near_heap_limit_grant: usize,
}

impl Default for HeapPolicy {
    fn default() -> Self {
        Self {
            pressure_headroom: 0.25,
            near_heap_limit_grant: GIB,
        }
    }
}

impl HeapPolicy {
    /// Returns `true` when `total` plus the headroom band would exceed `limit`.
    pub fn exceeds_headroom(&self, total: usize, limit: usize) -> bool {
        let band = (total as f64 * self.pressure_headroom) as usize;
        total.saturating_add(band) > limit
    }
}

/// Settings for a single sandboxed isolate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolateConfig {
    /// Memory budget in MiB (managed heap plus external allocations)
    pub memory_limit_mb: usize,
    /// Optional precompiled startup snapshot handed to the engine
    #[serde(skip)]
    pub snapshot: Option<Arc<[u8]>>,
    /// Ratchet and pressure heuristics
    pub heap_policy: HeapPolicy,
}

impl Default for IsolateConfig {
    fn default() -> Self {
        Self {
            memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
            snapshot: None,
            heap_policy: HeapPolicy::default(),
        }
    }
}

impl IsolateConfig {
    /// Default configuration with the given memory limit.
    pub fn with_memory_limit(memory_limit_mb: usize) -> Self {
        Self {
            memory_limit_mb,
            ..Self::default()
        }
    }

    /// Attach a startup snapshot.
    pub fn with_snapshot(mut self, snapshot: impl Into<Arc<[u8]>>) -> Self {
        self.snapshot = Some(snapshot.into());
        self
    }

    /// Memory limit in bytes, saturating at `usize::MAX`.
    pub fn memory_limit_bytes(&self) -> usize {
        self.memory_limit_mb.saturating_mul(MIB)
    }

    /// Largest limit in MiB this platform can express in bytes.
    pub fn max_memory_limit_mb() -> usize {
        MAX_MEMORY_LIMIT_MB.min(usize::MAX / MIB)
    }

    /// Reject limits too small for the engine to boot in, or too large to
    /// account for.
    pub fn validate(&self) -> Result<()> {
        let max = Self::max_memory_limit_mb();
        let in_range = self.memory_limit_mb >= MIN_MEMORY_LIMIT_MB
            && self.memory_limit_mb <= max
            && self.memory_limit_mb.checked_mul(MIB).is_some();
        if !in_range {
            return Err(IsolateError::InvalidMemoryLimit {
                min: MIN_MEMORY_LIMIT_MB,
                max,
                requested: self.memory_limit_mb,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_default_uses_cpu_count() {
        let config = PlatformConfig::default();
        assert_eq!(config.worker_threads, num_cpus::get() + 1);
    }

    #[test]
    fn test_platform_from_json() {
        let config = PlatformConfig::from_json(r#"{ "worker_threads": 3 }"#).unwrap();
        assert_eq!(config.worker_threads, 3);

        let config = PlatformConfig::from_json("{}").unwrap();
        assert_eq!(config, PlatformConfig::default());

        assert!(PlatformConfig::from_json("not json").is_err());
    }

    #[test]
    fn test_zero_workers_clamped() {
        let config = PlatformConfig { worker_threads: 0 };
        assert_eq!(config.effective_worker_threads(), 1);
    }

    #[test]
    fn test_headroom_band() {
        let policy = HeapPolicy::default();
        // 80 + 20 == 100, not over
        assert!(!policy.exceeds_headroom(80, 100));
        // 84 + 21 > 100
        assert!(policy.exceeds_headroom(84, 100));
        assert!(!policy.exceeds_headroom(0, 0));
    }

    #[test]
    fn test_isolate_config_validation() {
        assert!(IsolateConfig::default().validate().is_ok());
        assert!(IsolateConfig::with_memory_limit(MIN_MEMORY_LIMIT_MB).validate().is_ok());
        let err = IsolateConfig::with_memory_limit(4).validate().unwrap_err();
        assert!(matches!(
            err,
            IsolateError::InvalidMemoryLimit { min: 8, requested: 4, .. }
        ));
    }

    #[test]
    fn test_isolate_config_rejects_unaccountable_limit() {
        let max = IsolateConfig::max_memory_limit_mb();
        assert!(IsolateConfig::with_memory_limit(max).validate().is_ok());

        for requested in [max + 1, usize::MAX / 1024, usize::MAX] {
            let config = IsolateConfig::with_memory_limit(requested);
            let err = config.validate().unwrap_err();
            assert!(matches!(
                err,
                IsolateError::InvalidMemoryLimit { requested: r, .. } if r == requested
            ));
            // Byte conversion saturates instead of overflowing
            assert!(config.memory_limit_bytes() >= max * 1024 * 1024);
        }
        assert_eq!(
            IsolateConfig::with_memory_limit(usize::MAX).memory_limit_bytes(),
            usize::MAX
        );
    }

    #[test]
    fn test_isolate_config_bytes_and_snapshot() {
        let config = IsolateConfig::with_memory_limit(16).with_snapshot(vec![1u8, 2, 3]);
        assert_eq!(config.memory_limit_bytes(), 16 * 1024 * 1024);
        assert_eq!(config.snapshot.as_deref(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn test_isolate_config_json_defaults() {
        let config: IsolateConfig =
            serde_json::from_str(r#"{ "memory_limit_mb": 32 }"#).unwrap();
        assert_eq!(config.memory_limit_mb, 32);
        assert_eq!(config.heap_policy, HeapPolicy::default());
        assert!(config.snapshot.is_none());
    }
}
