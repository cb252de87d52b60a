//! Executor - which isolate owns this thread right now
//!
//! The engine is not thread-safe, so every isolate carries an [`Executor`]:
//! an engine lock plus the isolate's CPU/wall accumulators. Code touches an
//! isolate's engine only through a [`Lock`], which
//! - marks the isolate as current for this thread ([`Scope`]),
//! - starts a wall timer (pausing any other isolate's CPU timer),
//! - takes the engine lock, reentrantly so interrupts can nest,
//! - starts the CPU timer.
//!
//! [`Lock::unlocked`] is the inverse: it pauses the CPU timer and gives up
//! one level of the engine lock while external code runs.
//!
//! # Nesting
//! Locks nest freely across isolates (a task on A may lock B on the same
//! thread). Guards are `!Send` and restore the previous state in reverse
//! order on drop.

pub mod timer;

pub use timer::{CpuTimer, PauseScope, TimerState, UnpauseScope, WallTimer};

use crate::engine::{Engine, EngineId};
use crate::isolate::IsolateEnvironment;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

thread_local! {
    static CURRENT_ISOLATE: Cell<Option<EngineId>> = const { Cell::new(None) };
    /// One entry per live `Lock`; `None` while that lock is inside `unlocked`
    static LOCK_STACK: RefCell<Vec<Option<EngineId>>> = const { RefCell::new(Vec::new()) };
}

/// Per-isolate engine lock and timer accumulators
#[derive(Debug, Default)]
pub struct Executor {
    timers: Arc<TimerState>,
    engine_lock: ReentrantMutex<()>,
}

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timers(&self) -> &Arc<TimerState> {
        &self.timers
    }

    pub fn cpu_time(&self) -> Duration {
        self.timers.cpu_time()
    }

    pub fn wall_time(&self) -> Duration {
        self.timers.wall_time()
    }

    /// Identity of the isolate bound to this thread, if any.
    pub fn current_isolate() -> Option<EngineId> {
        CURRENT_ISOLATE.with(Cell::get)
    }

    /// Returns `true` if the innermost active lock on this thread holds `id`'s engine.
    pub fn is_locked_by_current_thread(id: EngineId) -> bool {
        LOCK_STACK.with(|stack| stack.borrow().last().copied().flatten() == Some(id))
    }
}

/// Binds an isolate as current for this thread without locking its engine
///
/// Used where native teardown needs to resolve "its" isolate while the
/// engine itself must not be entered, e.g. around engine disposal.
pub struct Scope {
    last: Option<EngineId>,
    _not_send: PhantomData<*const ()>,
}

impl Scope {
    pub fn new(id: EngineId) -> Self {
        let last = CURRENT_ISOLATE.with(|current| current.replace(Some(id)));
        Self {
            last,
            _not_send: PhantomData,
        }
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        CURRENT_ISOLATE.with(|current| current.set(self.last));
    }
}

struct LockStackEntry(PhantomData<*const ()>);

impl LockStackEntry {
    fn push(entry: Option<EngineId>) -> Self {
        LOCK_STACK.with(|stack| stack.borrow_mut().push(entry));
        Self(PhantomData)
    }
}

impl Drop for LockStackEntry {
    fn drop(&mut self) {
        LOCK_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Full acquisition of an isolate on the current thread
///
/// Fields drop in declaration order: CPU timer, engine lock, wall timer, scope.
pub struct Lock<'a> {
    _stack_entry: LockStackEntry,
    cpu_timer: CpuTimer,
    guard: ReentrantMutexGuard<'a, ()>,
    _wall_timer: WallTimer,
    _scope: Scope,
    env: &'a IsolateEnvironment,
}

impl<'a> Lock<'a> {
    pub fn new(env: &'a IsolateEnvironment) -> Self {
        let executor = env.executor();
        let scope = Scope::new(env.engine_id());
        let wall_timer = WallTimer::start(executor.timers());
        let guard = executor.engine_lock.lock();
        let cpu_timer = CpuTimer::start(executor.timers());
        Self {
            _stack_entry: LockStackEntry::push(Some(env.engine_id())),
            cpu_timer,
            guard,
            _wall_timer: wall_timer,
            _scope: scope,
            env,
        }
    }

    /// The isolate this lock holds.
    pub fn env(&self) -> &'a IsolateEnvironment {
        self.env
    }

    pub fn engine(&self) -> &'a Arc<dyn Engine> {
        self.env.engine()
    }

    /// Run `f` with the CPU timer paused and the engine lock released.
    ///
    /// For callbacks into external code that may block or take a long time.
    pub fn unlocked<F, R>(&mut self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _pause = self.cpu_timer.pause();
        let _entry = LockStackEntry::push(None);
        ReentrantMutexGuard::unlocked(&mut self.guard, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_restores_previous() {
        assert_eq!(Executor::current_isolate(), None);
        {
            let _outer = Scope::new(EngineId(1));
            assert_eq!(Executor::current_isolate(), Some(EngineId(1)));
            {
                let _inner = Scope::new(EngineId(2));
                assert_eq!(Executor::current_isolate(), Some(EngineId(2)));
            }
            assert_eq!(Executor::current_isolate(), Some(EngineId(1)));
        }
        assert_eq!(Executor::current_isolate(), None);
    }

    #[test]
    fn test_lock_stack_tracks_innermost() {
        let id = EngineId(42);
        assert!(!Executor::is_locked_by_current_thread(id));
        let _held = LockStackEntry::push(Some(id));
        assert!(Executor::is_locked_by_current_thread(id));
        {
            let _released = LockStackEntry::push(None);
            assert!(!Executor::is_locked_by_current_thread(id));
        }
        assert!(Executor::is_locked_by_current_thread(id));
    }

    #[test]
    fn test_executor_starts_at_zero() {
        let executor = Executor::new();
        assert_eq!(executor.cpu_time(), Duration::ZERO);
        assert_eq!(executor.wall_time(), Duration::ZERO);
    }
}
