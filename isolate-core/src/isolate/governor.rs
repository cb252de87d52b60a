//! Heap governor - enforcing an isolate's memory budget
//!
//! The budget covers the engine's managed heap plus memory allocated outside
//! it (`extra_allocated_memory`). Enforcement happens at three points:
//!
//! - [`HeapCheck`] after native operations that grew external memory,
//! - the GC epilogue, after every mark-sweep-compact collection,
//! - the near-heap-limit callback, right before the engine would abort.
//!
//! # Heap-limit ratchet
//! When the engine nears its own heap ceiling, the governor grants a
//! temporary increase ([`HeapPolicy::near_heap_limit_grant`]) so the host
//! process survives, and asks for pressure so the next collection decides
//! whether the isolate is really over budget. Once usage drops back, the GC
//! epilogue walks the ceiling back down.
//!
//! # Re-entrancy
//! Pressure is applied in place only when this thread holds the isolate's
//! engine lock; otherwise it is stored and applied from an engine interrupt
//! or after the next task. A critical notification applied in place from
//! the GC epilogue collects again without raising callbacks, so the
//! epilogue re-evaluates itself as a forced collection in a bounded loop.

use super::IsolateEnvironment;
use crate::engine::{EngineHooks, GcFlags, MemoryPressureLevel};
use crate::error::{IsolateError, Result};
use crate::executor::Executor;
use std::sync::atomic::Ordering;
use tracing::{debug, error, warn};

/// An epilogue can at most escalate once from a regular to a forced collection.
const MAX_EPILOGUE_PASSES: usize = 2;

/// Checks the memory budget after an operation that may grow external memory
pub struct HeapCheck<'a> {
    env: &'a IsolateEnvironment,
    extra_size_before: usize,
    force: bool,
}

impl<'a> HeapCheck<'a> {
    /// Snapshot external memory before the operation.
    pub fn new(env: &'a IsolateEnvironment, force: bool) -> Self {
        Self {
            env,
            extra_size_before: env.extra_allocated_memory(),
            force,
        }
    }

    /// Enforce the budget. Terminates the isolate and fails if it is exceeded
    /// even after a reclamation pass.
    pub fn epilogue(self) -> Result<()> {
        let env = self.env;
        if env.is_privileged() {
            return Ok(());
        }
        if !self.force && env.extra_allocated_memory() == self.extra_size_before {
            return Ok(());
        }

        if env.usage_exceeds(env.memory_limit()) {
            env.engine().low_memory_notification();
            if env.usage_exceeds(env.memory_limit()) {
                env.mark_memory_limit_hit();
                env.terminate_internal();
                return Err(IsolateError::MemoryLimit);
            }
        }
        Ok(())
    }
}

impl IsolateEnvironment {
    /// Managed heap usage plus external allocations, in bytes.
    pub fn total_memory_usage(&self) -> usize {
        self.engine
            .heap_statistics()
            .used_heap_size
            .saturating_add(self.extra_allocated_memory())
    }

    fn usage_exceeds(&self, limit: usize) -> bool {
        self.total_memory_usage() > limit
    }

    fn enforced_limit(&self) -> usize {
        self.memory_limit().saturating_add(self.misc_memory_size)
    }

    /// Record external memory growth or shrinkage. Returns the new total.
    pub fn adjust_extra_allocated_memory(&self, delta: isize) -> usize {
        self.memory.adjust(delta)
    }

    pub fn did_adjust_heap_limit(&self) -> bool {
        self.did_adjust_heap_limit.load(Ordering::Acquire)
    }

    /// Pressure waiting for the next safe point or task boundary.
    pub fn pending_memory_pressure(&self) -> MemoryPressureLevel {
        *self.memory_pressure.lock()
    }

    pub(crate) fn mark_memory_limit_hit(&self) {
        if !self.hit_memory_limit.swap(true, Ordering::AcqRel) {
            self.platform.metrics().record_memory_limit_hit();
            warn!(
                isolate = %self.engine_id,
                memory_limit = self.memory_limit(),
                usage = self.total_memory_usage(),
                "Isolate hit its memory limit"
            );
        }
    }

    /// Ask the engine for a pressure notification.
    ///
    /// Returns `true` if it was applied in place, `false` if deferred to the
    /// next safe point.
    pub fn request_memory_pressure_notification(
        &self,
        level: MemoryPressureLevel,
        as_interrupt: bool,
    ) -> bool {
        self.platform.metrics().record_pressure_notification();
        if !as_interrupt && Executor::is_locked_by_current_thread(self.engine_id) {
            *self.memory_pressure.lock() = MemoryPressureLevel::None;
            debug!(isolate = %self.engine_id, %level, "Applying memory pressure");
            self.engine.memory_pressure_notification(level);
            return true;
        }

        *self.memory_pressure.lock() = level;
        debug!(isolate = %self.engine_id, %level, "Deferring memory pressure to safe point");
        let weak = self.self_ref.clone();
        self.engine.request_interrupt(Box::new(move || {
            if let Some(env) = weak.upgrade() {
                env.check_memory_pressure();
            }
        }));
        false
    }

    /// Apply any stored pressure level.
    pub fn check_memory_pressure(&self) {
        let pressure = std::mem::take(&mut *self.memory_pressure.lock());
        if pressure != MemoryPressureLevel::None {
            self.engine.memory_pressure_notification(pressure);
        }
    }

    /// Finish a task: run microtasks, apply pressure, surface fatal and script errors.
    pub fn task_epilogue(&self) -> Result<()> {
        self.engine.run_microtasks();
        self.check_memory_pressure();
        if self.hit_memory_limit() {
            return Err(IsolateError::MemoryLimit);
        }
        let rejected = self.rejected_promise_error.lock().take();
        if let Some(reason) = rejected {
            self.engine.throw_exception(reason.clone());
            return Err(IsolateError::Script(reason));
        }
        Ok(())
    }

    /// Decide what a finished collection means for the budget.
    fn evaluate_collection(&self, flags: GcFlags) -> Option<MemoryPressureLevel> {
        let total = self.total_memory_usage();
        let limit = self.enforced_limit();

        if total > limit {
            if flags.is_full() {
                self.mark_memory_limit_hit();
                self.terminate_internal();
                return None;
            }
            return Some(MemoryPressureLevel::Critical);
        }

        if flags.collect_all_available_garbage {
            return None;
        }

        if self.did_adjust_heap_limit() {
            self.engine.restore_heap_limit(self.memory_limit());
            if self.engine.heap_statistics().heap_size_limit == self.initial_heap_size_limit {
                self.did_adjust_heap_limit.store(false, Ordering::Release);
                debug!(isolate = %self.engine_id, "Heap limit restored");
            }
        }

        if self.heap_policy.exceeds_headroom(total, limit) {
            return Some(MemoryPressureLevel::Moderate);
        }
        None
    }
}

impl EngineHooks for IsolateEnvironment {
    fn on_gc_epilogue(&self, flags: GcFlags) {
        let mut flags = flags;
        for _ in 0..MAX_EPILOGUE_PASSES {
            match self.evaluate_collection(flags) {
                Some(MemoryPressureLevel::Critical) => {
                    if !self.request_memory_pressure_notification(MemoryPressureLevel::Critical, false)
                    {
                        break;
                    }
                    flags = GcFlags::FORCED;
                }
                Some(level) => {
                    self.request_memory_pressure_notification(level, false);
                    break;
                }
                None => break,
            }
        }
    }

    fn on_near_heap_limit(&self, current_heap_limit: usize, _initial_heap_limit: usize) -> usize {
        self.did_adjust_heap_limit.store(true, Ordering::Release);
        let level = if self.usage_exceeds(self.enforced_limit()) {
            MemoryPressureLevel::Critical
        } else {
            MemoryPressureLevel::Moderate
        };
        self.request_memory_pressure_notification(level, true);
        self.platform.metrics().record_heap_limit_grant();
        let granted = current_heap_limit.saturating_add(self.heap_policy.near_heap_limit_grant);
        debug!(
            isolate = %self.engine_id,
            current_heap_limit,
            granted,
            %level,
            "Near heap limit, granting temporary headroom"
        );
        granted
    }

    fn on_promise_rejected(&self, reason: String) {
        *self.rejected_promise_error.lock() = Some(reason);
    }

    fn on_out_of_memory(&self, location: &str, is_heap_oom: bool) -> ! {
        let heap = self.engine.heap_statistics();
        error!(
            isolate = %self.engine_id,
            location,
            is_heap_oom,
            total_heap_size = heap.total_heap_size,
            total_heap_size_executable = heap.total_heap_size_executable,
            total_physical_size = heap.total_physical_size,
            total_available_size = heap.total_available_size,
            used_heap_size = heap.used_heap_size,
            heap_size_limit = heap.heap_size_limit,
            malloced_memory = heap.malloced_memory,
            peak_malloced_memory = heap.peak_malloced_memory,
            "Engine out of memory"
        );
        std::process::abort()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IsolateConfig, PlatformConfig};
    use crate::engine::{Engine, SimulatedEngine, SimulatedEngineFactory};
    use crate::executor::Lock;
    use crate::host_loop;
    use crate::isolate::IsolateHolder;
    use crate::platform::Platform;
    use std::sync::Arc;

    const MIB: usize = 1024 * 1024;

    struct Fixture {
        platform: Arc<Platform>,
        holder: Arc<IsolateHolder>,
        engine: Arc<SimulatedEngine>,
    }

    fn fixture(limit_mb: usize) -> Fixture {
        let (handle, _driver) = host_loop::channel();
        let platform = Platform::new(PlatformConfig { worker_threads: 1 }, handle).unwrap();
        let factory = SimulatedEngineFactory::new();
        let holder =
            IsolateEnvironment::new(&platform, &factory, IsolateConfig::with_memory_limit(limit_mb))
                .unwrap();
        let engine = factory.last_created().unwrap();
        Fixture {
            platform,
            holder,
            engine,
        }
    }

    #[test]
    fn test_heap_check_within_budget() {
        let fx = fixture(16);
        let env = fx.holder.get().unwrap();
        let check = HeapCheck::new(&env, false);
        env.adjust_extra_allocated_memory(MIB as isize);
        assert!(check.epilogue().is_ok());
        assert!(!env.hit_memory_limit());
    }

    #[test]
    fn test_heap_check_skipped_without_change() {
        let fx = fixture(16);
        let env = fx.holder.get().unwrap();
        env.adjust_extra_allocated_memory(32 * MIB as isize);
        // Counter unchanged since the snapshot and not forced
        assert!(HeapCheck::new(&env, false).epilogue().is_ok());
        assert!(!env.hit_memory_limit());
        // Forced check enforces regardless
        assert!(matches!(
            HeapCheck::new(&env, true).epilogue(),
            Err(IsolateError::MemoryLimit)
        ));
    }

    #[test]
    fn test_heap_check_reclaims_before_failing() {
        let fx = fixture(16);
        let env = fx.holder.get().unwrap();
        fx.engine.allocate(10 * MIB).unwrap();
        fx.engine.release(8 * MIB);
        let check = HeapCheck::new(&env, false);
        env.adjust_extra_allocated_memory(8 * MIB as isize);
        // 10 MiB heap + 8 MiB external is over, but 8 MiB of the heap is garbage.
        assert!(check.epilogue().is_ok());
        assert_eq!(env.total_memory_usage(), 10 * MIB);
    }

    #[test]
    fn test_gc_epilogue_over_limit_after_full_collection_terminates() {
        let fx = fixture(16);
        let env = fx.holder.get().unwrap();
        env.adjust_extra_allocated_memory(64 * MIB as isize);
        env.on_gc_epilogue(GcFlags::COLLECT_ALL);
        assert!(env.hit_memory_limit());
        assert!(env.is_terminated());
        assert!(fx.engine.is_terminating());
        assert!(fx.holder.get().is_none());
        assert_eq!(fx.platform.metrics().snapshot().memory_limit_hits, 1);
    }

    #[test]
    fn test_gc_epilogue_over_limit_defers_critical_without_lock() {
        let fx = fixture(16);
        let env = fx.holder.get().unwrap();
        env.adjust_extra_allocated_memory(64 * MIB as isize);
        env.on_gc_epilogue(GcFlags::NORMAL);
        assert!(!env.hit_memory_limit());
        assert_eq!(env.pending_memory_pressure(), MemoryPressureLevel::Critical);
        assert_eq!(fx.engine.pending_interrupts(), 1);
    }

    #[test]
    fn test_gc_epilogue_reentrant_critical_escalates_to_forced() {
        let fx = fixture(16);
        let env = fx.holder.get().unwrap();
        env.adjust_extra_allocated_memory(64 * MIB as isize);
        {
            let _lock = Lock::new(&env);
            fx.engine.collect_garbage(GcFlags::NORMAL);
        }
        // Critical applied in place, then the forced re-evaluation terminates.
        assert_eq!(
            fx.engine.pressure_notifications(),
            vec![MemoryPressureLevel::Critical]
        );
        assert!(env.hit_memory_limit());
        assert!(env.is_terminated());
    }

    #[test]
    fn test_gc_epilogue_moderate_pressure_in_headroom_band() {
        let fx = fixture(16);
        let env = fx.holder.get().unwrap();
        // Enforced limit is 16 MiB + engine overhead; sit just under it.
        let target = env.memory_limit() + env.misc_memory_size() - MIB;
        env.adjust_extra_allocated_memory(target as isize);
        {
            let _lock = Lock::new(&env);
            env.on_gc_epilogue(GcFlags::NORMAL);
        }
        assert_eq!(
            fx.engine.pressure_notifications(),
            vec![MemoryPressureLevel::Moderate]
        );
        assert!(!env.hit_memory_limit());
    }

    #[test]
    fn test_near_heap_limit_grants_and_ratchets_back() {
        let fx = fixture(16);
        let env = fx.holder.get().unwrap();
        let initial = env.initial_heap_size_limit();

        // Grow live heap past the old generation to trigger the callback.
        fx.engine.allocate(20 * MIB).unwrap();
        assert!(env.did_adjust_heap_limit());
        assert!(fx.engine.heap_statistics().heap_size_limit > initial);
        assert_eq!(env.pending_memory_pressure(), MemoryPressureLevel::Critical);
        assert_eq!(fx.platform.metrics().snapshot().heap_limit_grants, 1);

        // Usage drops back; the next regular collection walks the limit back.
        fx.engine.release(20 * MIB);
        fx.engine.collect_garbage(GcFlags::NORMAL);
        assert!(!env.did_adjust_heap_limit());
        assert_eq!(fx.engine.heap_statistics().heap_size_limit, initial);
    }

    #[test]
    fn test_task_epilogue_rethrows_rejection() {
        let fx = fixture(16);
        let env = fx.holder.get().unwrap();
        fx.engine.reject_promise("boom");
        match env.task_epilogue() {
            Err(IsolateError::Script(reason)) => assert_eq!(reason, "boom"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(fx.engine.thrown_exceptions(), vec!["boom".to_string()]);
        // The slot is cleared once re-raised
        assert!(env.task_epilogue().is_ok());
    }

    #[test]
    fn test_task_epilogue_applies_pending_pressure() {
        let fx = fixture(16);
        let env = fx.holder.get().unwrap();
        assert!(!env.request_memory_pressure_notification(MemoryPressureLevel::Moderate, true));
        assert_eq!(env.pending_memory_pressure(), MemoryPressureLevel::Moderate);
        env.task_epilogue().unwrap();
        assert_eq!(env.pending_memory_pressure(), MemoryPressureLevel::None);
        assert!(fx
            .engine
            .pressure_notifications()
            .contains(&MemoryPressureLevel::Moderate));
    }

    #[test]
    fn test_privileged_immune_to_heap_check() {
        let (handle, _driver) = host_loop::channel();
        let platform = Platform::new(PlatformConfig { worker_threads: 1 }, handle).unwrap();
        let holder =
            IsolateEnvironment::new_privileged(&platform, Arc::new(SimulatedEngine::unconstrained()))
                .unwrap();
        let env = holder.get().unwrap();
        env.adjust_extra_allocated_memory(isize::MAX);
        assert!(HeapCheck::new(&env, true).epilogue().is_ok());
        assert!(!env.hit_memory_limit());
        assert!(!env.is_terminated());
    }
}
