//! Engine module - the embedded script engine seen through a narrow interface
//!
//! The script engine itself is an external collaborator. This module defines
//! exactly what the isolate core consumes from it:
//! - create/dispose an engine instance with a memory-bounded allocator and
//!   its default context
//! - query heap statistics
//! - callbacks for OOM, promise rejection, GC epilogue and near-heap-limit
//! - interrupt requests, memory-pressure notifications and termination
//!
//! Callbacks flow back through [`EngineHooks`], which the isolate installs
//! after construction as a weak reference so the engine never keeps its owner
//! alive.

pub mod allocator;
pub mod simulated;

pub use allocator::{LimitedAllocator, MemoryAccount};
pub use simulated::{ExecutionTerminated, SimulatedEngine, SimulatedEngineFactory};

use crate::error::Result;
use std::fmt;
use std::sync::{Arc, Weak};

/// Identity of one engine instance, used for reverse lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EngineId(pub u64);

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine-{}", self.0)
    }
}

/// Snapshot of the engine's managed heap
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStatistics {
    pub total_heap_size: usize,
    pub total_heap_size_executable: usize,
    pub total_physical_size: usize,
    pub total_available_size: usize,
    pub used_heap_size: usize,
    pub heap_size_limit: usize,
    pub malloced_memory: usize,
    pub peak_malloced_memory: usize,
}

/// Severity of a memory-pressure notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryPressureLevel {
    #[default]
    None,
    /// Collect ahead of hard enforcement
    Moderate,
    /// Force a full collection now
    Critical,
}

impl fmt::Display for MemoryPressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Moderate => write!(f, "moderate"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Flags describing the collection that just finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GcFlags {
    /// The collection was explicitly forced
    pub forced: bool,
    /// The collection tried to reclaim every reachable byte
    pub collect_all_available_garbage: bool,
}

impl GcFlags {
    /// A regular, engine-initiated collection.
    pub const NORMAL: Self = Self {
        forced: false,
        collect_all_available_garbage: false,
    };

    /// A collection forced by a critical pressure notification.
    pub const FORCED: Self = Self {
        forced: true,
        collect_all_available_garbage: false,
    };

    /// A last-resort collection of all available garbage.
    pub const COLLECT_ALL: Self = Self {
        forced: false,
        collect_all_available_garbage: true,
    };

    /// Returns `true` if the engine already tried as hard as it can.
    pub fn is_full(&self) -> bool {
        self.forced || self.collect_all_available_garbage
    }
}

/// Heap sizing passed to the engine at creation time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceConstraints {
    /// Upper bound of a single young-generation semi-space, in KiB
    pub max_semi_space_size_kb: usize,
    /// Upper bound of the old generation, in MiB
    pub max_old_space_size_mb: usize,
}

impl ResourceConstraints {
    /// Derive heap sizing from a memory limit.
    ///
    /// The semi-space grows exponentially with the limit (1 MiB at 0 MiB,
    /// doubling every 128 MiB) and the old generation gets the whole limit.
    /// Sizes too large to represent saturate at `usize::MAX`.
    pub fn for_memory_limit(memory_limit_mb: usize) -> Self {
        let exponent = memory_limit_mb as f64 / 128.0 + 10.0;
        Self {
            max_semi_space_size_kb: 2f64.powf(exponent) as usize,
            max_old_space_size_mb: memory_limit_mb,
        }
    }
}

/// Everything an [`EngineFactory`] needs to build a sandboxed engine
#[derive(Debug, Clone)]
pub struct CreateParams {
    pub constraints: ResourceConstraints,
    /// Bounded allocator for memory living outside the managed heap
    pub allocator: Arc<LimitedAllocator>,
    /// Precompiled startup snapshot
    pub snapshot: Option<Arc<[u8]>>,
}

/// Deferred work the engine runs at its next safe point
pub type InterruptCallback = Box<dyn FnOnce() + Send>;

/// Callbacks the engine raises into its owning isolate
pub trait EngineHooks: Send + Sync {
    /// A full mark-sweep-compact collection just finished.
    fn on_gc_epilogue(&self, flags: GcFlags);

    /// The managed heap is about to hit `current_heap_limit`; returns the new limit.
    fn on_near_heap_limit(&self, current_heap_limit: usize, initial_heap_limit: usize) -> usize;

    /// A promise was rejected with no handler attached.
    fn on_promise_rejected(&self, reason: String);

    /// The engine itself ran out of memory. There is no way to continue.
    fn on_out_of_memory(&self, location: &str, is_heap_oom: bool) -> !;
}

/// The embedded script engine
///
/// Implementations must tolerate calls from any thread for `request_interrupt`,
/// `terminate_execution` and `heap_statistics`; everything else is called while
/// the isolate's executor lock is held.
pub trait Engine: Send + Sync {
    /// Stable identity of this engine instance.
    fn id(&self) -> EngineId;

    /// Install the callbacks for GC, heap limit, promise rejection and OOM.
    fn install_hooks(&self, hooks: Weak<dyn EngineHooks>);

    /// Create the context script runs in when no other is entered.
    /// Called once per sandboxed engine, under the executor lock.
    fn create_default_context(&self);

    fn heap_statistics(&self) -> HeapStatistics;

    /// Best-effort reclamation pass before giving up on an allocation.
    fn low_memory_notification(&self);

    fn memory_pressure_notification(&self, level: MemoryPressureLevel);

    /// Walk back a temporary heap-limit increase to `heap_limit` bytes.
    fn restore_heap_limit(&self, heap_limit: usize);

    /// Run `callback` at the next safe point of running script.
    fn request_interrupt(&self, callback: InterruptCallback);

    /// Abort running script at the next safe point.
    fn terminate_execution(&self);

    /// Throw `reason` into the engine's current context.
    fn throw_exception(&self, reason: String);

    fn run_microtasks(&self);

    /// Release the engine instance. Called once, without the executor lock.
    fn dispose(&self);
}

/// Creates sandboxed engine instances
pub trait EngineFactory: Send + Sync {
    fn create(&self, params: CreateParams) -> Result<Arc<dyn Engine>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraints_scale_with_limit() {
        let small = ResourceConstraints::for_memory_limit(0);
        assert_eq!(small.max_semi_space_size_kb, 1024);

        let standard = ResourceConstraints::for_memory_limit(128);
        assert_eq!(standard.max_semi_space_size_kb, 2048);
        assert_eq!(standard.max_old_space_size_mb, 128);

        let large = ResourceConstraints::for_memory_limit(256);
        assert_eq!(large.max_semi_space_size_kb, 4096);

        let huge = ResourceConstraints::for_memory_limit(usize::MAX / 1024);
        assert_eq!(huge.max_semi_space_size_kb, usize::MAX);
        assert_eq!(huge.max_old_space_size_mb, usize::MAX / 1024);
    }

    #[test]
    fn test_gc_flags() {
        assert!(!GcFlags::NORMAL.is_full());
        assert!(GcFlags::FORCED.is_full());
        assert!(GcFlags::COLLECT_ALL.is_full());
    }

    #[test]
    fn test_display() {
        assert_eq!(EngineId(7).to_string(), "engine-7");
        assert_eq!(MemoryPressureLevel::Critical.to_string(), "critical");
    }
}
