//! Simulated Engine - an in-process stand-in for a real script engine
//!
//! `SimulatedEngine` models just enough engine behavior to exercise the
//! isolate core end to end: a managed heap with live and garbage bytes, an
//! old-generation ceiling that raises near-heap-limit callbacks, GC epilogue
//! callbacks, interrupts delivered at explicit safe points, and cooperative
//! termination. "Script" is ordinary Rust code calling [`SimulatedEngine::allocate`]
//! and [`SimulatedEngine::safe_point`].
//!
//! Hooks are always invoked with no internal lock held, so they may call
//! straight back into the engine.

use super::{
    CreateParams, Engine, EngineFactory, EngineHooks, EngineId, GcFlags, HeapStatistics,
    InterruptCallback, MemoryPressureLevel,
};
use crate::error::Result;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::{debug, trace, warn};

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

/// Returned from a safe point once termination was requested
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("execution terminated")]
pub struct ExecutionTerminated;

#[derive(Debug, Default)]
struct SimulatedHeap {
    live: usize,
    garbage: usize,
    old_space_limit: usize,
    young_size: usize,
}

impl SimulatedHeap {
    fn used(&self) -> usize {
        self.live + self.garbage
    }

    fn heap_size_limit(&self) -> usize {
        self.old_space_limit.saturating_add(self.young_size)
    }
}

/// In-process engine used by the demo binary and the tests
pub struct SimulatedEngine {
    id: EngineId,
    hooks: RwLock<Option<Weak<dyn EngineHooks>>>,
    heap: Mutex<SimulatedHeap>,
    interrupts: Mutex<Vec<InterruptCallback>>,
    pressure_log: Mutex<Vec<MemoryPressureLevel>>,
    thrown: Mutex<Vec<String>>,
    terminating: AtomicBool,
    disposed: AtomicBool,
    default_context: AtomicBool,
    gc_depth: AtomicUsize,
    snapshot_len: usize,
}

impl SimulatedEngine {
    /// An engine sized by explicit old-generation and young-generation bytes.
    pub fn with_heap(old_space_limit: usize, young_size: usize) -> Self {
        let id = EngineId(NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed));
        debug!(engine = %id, old_space_limit, young_size, "Creating simulated engine");
        Self {
            id,
            hooks: RwLock::new(None),
            heap: Mutex::new(SimulatedHeap {
                old_space_limit,
                young_size,
                ..SimulatedHeap::default()
            }),
            interrupts: Mutex::new(Vec::new()),
            pressure_log: Mutex::new(Vec::new()),
            thrown: Mutex::new(Vec::new()),
            terminating: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            default_context: AtomicBool::new(false),
            gc_depth: AtomicUsize::new(0),
            snapshot_len: 0,
        }
    }

    /// A large engine like the one a host process boots with.
    pub fn unconstrained() -> Self {
        Self::with_heap(4096 * MIB, 16 * MIB)
    }

    fn from_params(params: &CreateParams) -> Self {
        let young = params
            .constraints
            .max_semi_space_size_kb
            .saturating_mul(3 * KIB);
        let old = params.constraints.max_old_space_size_mb.saturating_mul(MIB);
        let mut engine = Self::with_heap(old, young);
        engine.snapshot_len = params.snapshot.as_ref().map_or(0, |blob| blob.len());
        engine
    }

    fn hooks(&self) -> Option<Arc<dyn EngineHooks>> {
        self.hooks.read().as_ref().and_then(Weak::upgrade)
    }

    /// Allocate `bytes` of live heap, collecting and raising the heap limit as
    /// a real engine would when the old generation fills up.
    pub fn allocate(&self, bytes: usize) -> std::result::Result<(), ExecutionTerminated> {
        self.check_terminating()?;
        let needs_gc = {
            let mut heap = self.heap.lock();
            heap.live += bytes;
            heap.used() > heap.old_space_limit
        };
        if !needs_gc {
            return Ok(());
        }

        self.collect_garbage(GcFlags::NORMAL);

        let (used, limit) = {
            let heap = self.heap.lock();
            (heap.used(), heap.heap_size_limit())
        };
        if used <= self.heap.lock().old_space_limit {
            return Ok(());
        }

        let initial = limit;
        let Some(hooks) = self.hooks() else {
            return Ok(());
        };
        let granted = hooks.on_near_heap_limit(limit, initial);
        let still_over = {
            let mut heap = self.heap.lock();
            if granted > limit {
                heap.old_space_limit = heap.old_space_limit.saturating_add(granted - limit);
            }
            heap.used() > heap.old_space_limit
        };
        if still_over {
            hooks.on_out_of_memory("SimulatedEngine::allocate", true);
        }
        Ok(())
    }

    /// Turn `bytes` of live heap into garbage.
    pub fn release(&self, bytes: usize) {
        let mut heap = self.heap.lock();
        let freed = bytes.min(heap.live);
        heap.live -= freed;
        heap.garbage += freed;
    }

    /// Run a mark-sweep-compact collection and raise the GC epilogue.
    pub fn collect_garbage(&self, flags: GcFlags) {
        {
            let mut heap = self.heap.lock();
            trace!(engine = %self.id, reclaimed = heap.garbage, "Collecting garbage");
            heap.garbage = 0;
        }
        if let Some(hooks) = self.hooks() {
            self.gc_depth.fetch_add(1, Ordering::AcqRel);
            hooks.on_gc_epilogue(flags);
            self.gc_depth.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Reject a promise without a handler.
    pub fn reject_promise(&self, reason: impl Into<String>) {
        if let Some(hooks) = self.hooks() {
            hooks.on_promise_rejected(reason.into());
        }
    }

    /// Deliver pending interrupts, then report termination if requested.
    pub fn safe_point(&self) -> std::result::Result<(), ExecutionTerminated> {
        loop {
            let pending = std::mem::take(&mut *self.interrupts.lock());
            if pending.is_empty() {
                break;
            }
            for interrupt in pending {
                interrupt();
            }
        }
        self.check_terminating()
    }

    fn check_terminating(&self) -> std::result::Result<(), ExecutionTerminated> {
        if self.terminating.load(Ordering::Acquire) {
            Err(ExecutionTerminated)
        } else {
            Ok(())
        }
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Number of interrupts waiting for a safe point.
    pub fn pending_interrupts(&self) -> usize {
        self.interrupts.lock().len()
    }

    /// Every pressure notification received so far, oldest first.
    pub fn pressure_notifications(&self) -> Vec<MemoryPressureLevel> {
        self.pressure_log.lock().clone()
    }

    /// Every exception thrown into the engine so far.
    pub fn thrown_exceptions(&self) -> Vec<String> {
        self.thrown.lock().clone()
    }

    /// Size of the startup snapshot this engine booted from.
    pub fn snapshot_len(&self) -> usize {
        self.snapshot_len
    }

    pub fn has_default_context(&self) -> bool {
        self.default_context.load(Ordering::Acquire)
    }
}

impl Engine for SimulatedEngine {
    fn id(&self) -> EngineId {
        self.id
    }

    fn install_hooks(&self, hooks: Weak<dyn EngineHooks>) {
        *self.hooks.write() = Some(hooks);
    }

    fn create_default_context(&self) {
        if !self.default_context.swap(true, Ordering::AcqRel) {
            trace!(engine = %self.id, "Default context created");
        }
    }

    fn heap_statistics(&self) -> HeapStatistics {
        let heap = self.heap.lock();
        let used = heap.used();
        let limit = heap.heap_size_limit();
        HeapStatistics {
            total_heap_size: used,
            total_heap_size_executable: 0,
            total_physical_size: used,
            total_available_size: limit.saturating_sub(used),
            used_heap_size: used,
            heap_size_limit: limit,
            malloced_memory: 0,
            peak_malloced_memory: 0,
        }
    }

    fn low_memory_notification(&self) {
        self.heap.lock().garbage = 0;
    }

    fn memory_pressure_notification(&self, level: MemoryPressureLevel) {
        self.pressure_log.lock().push(level);
        {
            let mut heap = self.heap.lock();
            match level {
                MemoryPressureLevel::Critical => heap.garbage = 0,
                MemoryPressureLevel::Moderate => heap.garbage /= 2,
                MemoryPressureLevel::None => {}
            }
        }
        // A critical notification is a full collection. From inside an
        // epilogue it collects silently.
        if level == MemoryPressureLevel::Critical && self.gc_depth.load(Ordering::Acquire) == 0 {
            if let Some(hooks) = self.hooks() {
                self.gc_depth.fetch_add(1, Ordering::AcqRel);
                hooks.on_gc_epilogue(GcFlags::COLLECT_ALL);
                self.gc_depth.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    fn restore_heap_limit(&self, heap_limit: usize) {
        let mut heap = self.heap.lock();
        let used = heap.used();
        let floor = used + used / 4;
        heap.old_space_limit = heap.old_space_limit.min(heap_limit.max(floor));
    }

    fn request_interrupt(&self, callback: InterruptCallback) {
        if self.is_disposed() {
            warn!(engine = %self.id, "Interrupt requested on disposed engine");
            return;
        }
        self.interrupts.lock().push(callback);
    }

    fn terminate_execution(&self) {
        self.terminating.store(true, Ordering::Release);
    }

    fn throw_exception(&self, reason: String) {
        self.thrown.lock().push(reason);
    }

    fn run_microtasks(&self) {
        // Microtasks are script too, so they pass through a safe point.
        let _ = self.safe_point();
    }

    fn dispose(&self) {
        debug!(engine = %self.id, "Disposing simulated engine");
        self.disposed.store(true, Ordering::Release);
        self.interrupts.lock().clear();
    }
}

/// Factory that remembers the engines it created
#[derive(Default)]
pub struct SimulatedEngineFactory {
    created: Mutex<Vec<Weak<SimulatedEngine>>>,
}

impl SimulatedEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently created engine, if it is still alive.
    pub fn last_created(&self) -> Option<Arc<SimulatedEngine>> {
        self.created.lock().last().and_then(Weak::upgrade)
    }
}

impl EngineFactory for SimulatedEngineFactory {
    fn create(&self, params: CreateParams) -> Result<Arc<dyn Engine>> {
        let engine = Arc::new(SimulatedEngine::from_params(&params));
        let mut created = self.created.lock();
        created.retain(|weak| weak.strong_count() > 0);
        created.push(Arc::downgrade(&engine));
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{LimitedAllocator, MemoryAccount, ResourceConstraints};

    fn params(limit_mb: usize) -> CreateParams {
        CreateParams {
            constraints: ResourceConstraints::for_memory_limit(limit_mb),
            allocator: Arc::new(LimitedAllocator::new(Arc::new(MemoryAccount::new(
                limit_mb * MIB,
            )))),
            snapshot: None,
        }
    }

    #[derive(Default)]
    struct CountingHooks {
        epilogues: AtomicUsize,
        near_limit: AtomicUsize,
        rejections: Mutex<Vec<String>>,
    }

    impl EngineHooks for CountingHooks {
        fn on_gc_epilogue(&self, _flags: GcFlags) {
            self.epilogues.fetch_add(1, Ordering::SeqCst);
        }

        fn on_near_heap_limit(&self, current: usize, _initial: usize) -> usize {
            self.near_limit.fetch_add(1, Ordering::SeqCst);
            current + 64 * MIB
        }

        fn on_promise_rejected(&self, reason: String) {
            self.rejections.lock().push(reason);
        }

        fn on_out_of_memory(&self, location: &str, _is_heap_oom: bool) -> ! {
            panic!("unexpected OOM at {location}");
        }
    }

    #[test]
    fn test_factory_sizes_heap_from_constraints() {
        let factory = SimulatedEngineFactory::new();
        let engine = factory.create(params(128)).unwrap();
        let stats = engine.heap_statistics();
        // 128 MiB old space + 3 * 2 MiB semi-space
        assert_eq!(stats.heap_size_limit, 134 * MIB);
        assert_eq!(stats.used_heap_size, 0);
        assert_eq!(factory.last_created().unwrap().id(), engine.id());
    }

    #[test]
    fn test_oversized_constraints_saturate() {
        let engine = SimulatedEngine::from_params(&CreateParams {
            constraints: ResourceConstraints::for_memory_limit(usize::MAX / 1024),
            allocator: Arc::new(LimitedAllocator::new(Arc::new(MemoryAccount::new(usize::MAX)))),
            snapshot: None,
        });
        assert_eq!(engine.heap_statistics().heap_size_limit, usize::MAX);
        engine.allocate(MIB).unwrap();
        assert_eq!(engine.heap_statistics().used_heap_size, MIB);
    }

    #[test]
    fn test_engine_ids_are_unique() {
        let a = SimulatedEngine::unconstrained();
        let b = SimulatedEngine::unconstrained();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_interrupts_run_at_safe_point() {
        let engine = SimulatedEngine::unconstrained();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        engine.request_interrupt(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(engine.pending_interrupts(), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        engine.safe_point().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(engine.pending_interrupts(), 0);
    }

    #[test]
    fn test_termination_observed_at_safe_point() {
        let engine = SimulatedEngine::unconstrained();
        engine.terminate_execution();
        assert_eq!(engine.safe_point(), Err(ExecutionTerminated));
        assert_eq!(engine.allocate(16), Err(ExecutionTerminated));
    }

    #[test]
    fn test_hooks_fire_on_gc_and_near_limit() {
        let engine = SimulatedEngine::with_heap(MIB, 0);
        let hooks = Arc::new(CountingHooks::default());
        let weak: Weak<CountingHooks> = Arc::downgrade(&hooks);
        engine.install_hooks(weak);

        engine.allocate(2 * MIB).unwrap();
        assert_eq!(hooks.epilogues.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.near_limit.load(Ordering::SeqCst), 1);
        assert_eq!(engine.heap_statistics().heap_size_limit, 65 * MIB);

        engine.reject_promise("nope");
        assert_eq!(hooks.rejections.lock().as_slice(), ["nope".to_string()]);
    }

    #[test]
    fn test_garbage_is_reclaimed() {
        let engine = SimulatedEngine::unconstrained();
        engine.allocate(4 * MIB).unwrap();
        engine.release(3 * MIB);
        assert_eq!(engine.heap_statistics().used_heap_size, 4 * MIB);
        engine.low_memory_notification();
        assert_eq!(engine.heap_statistics().used_heap_size, MIB);
    }

    #[test]
    fn test_critical_pressure_raises_full_epilogue() {
        let engine = SimulatedEngine::unconstrained();
        let hooks = Arc::new(CountingHooks::default());
        let weak: Weak<CountingHooks> = Arc::downgrade(&hooks);
        engine.install_hooks(weak);

        engine.memory_pressure_notification(MemoryPressureLevel::Moderate);
        assert_eq!(hooks.epilogues.load(Ordering::SeqCst), 0);
        engine.memory_pressure_notification(MemoryPressureLevel::Critical);
        assert_eq!(hooks.epilogues.load(Ordering::SeqCst), 1);
        assert_eq!(
            engine.pressure_notifications(),
            vec![MemoryPressureLevel::Moderate, MemoryPressureLevel::Critical]
        );
    }

    #[test]
    fn test_restore_heap_limit_respects_usage_floor() {
        let engine = SimulatedEngine::with_heap(8 * MIB, 0);
        {
            let mut heap = engine.heap.lock();
            heap.old_space_limit += 1024 * MIB;
            heap.live = 10 * MIB;
        }
        engine.restore_heap_limit(8 * MIB);
        // Cannot drop below 125% of usage
        assert_eq!(engine.heap_statistics().heap_size_limit, 12 * MIB + 512 * KIB);

        engine.heap.lock().live = 0;
        engine.restore_heap_limit(8 * MIB);
        assert_eq!(engine.heap_statistics().heap_size_limit, 8 * MIB);
    }
}
