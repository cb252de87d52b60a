//! CPU and wall-clock accounting per isolate
//!
//! Each isolate owns one [`TimerState`] holding its accumulated CPU and wall
//! time. Guards started on a thread feed those accumulators:
//!
//! - [`CpuTimer`] accrues while its isolate holds the engine on this thread.
//!   At most one CPU timer accrues per OS thread at a time; the others on the
//!   thread-local stack are paused.
//! - [`WallTimer`] accrues from the first nested acquisition of an isolate to
//!   the last. Starting one pauses whichever CPU timer is live on this thread,
//!   even one belonging to another isolate, so interleaved isolates never
//!   charge each other.
//! - [`PauseScope`] / [`UnpauseScope`] suspend and resume a CPU timer without
//!   ending it. Pauses nest by depth.
//!
//! All guards are `!Send`; they must be dropped on the thread that created them.

use parking_lot::Mutex;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

#[derive(Debug, Default)]
struct Accumulators {
    cpu_time: Duration,
    wall_time: Duration,
    /// Set while a CPU timer for this isolate is accruing
    cpu_started: Option<Instant>,
    /// Set while the outermost wall timer for this isolate is running
    wall_started: Option<Instant>,
}

/// Accumulated CPU and wall time of one isolate
#[derive(Debug, Default)]
pub struct TimerState {
    inner: Mutex<Accumulators>,
}

impl TimerState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// CPU time so far, including the live delta of a running timer.
    pub fn cpu_time(&self) -> Duration {
        let inner = self.inner.lock();
        inner.cpu_time + inner.cpu_started.map_or(Duration::ZERO, |start| start.elapsed())
    }

    /// Wall time so far, including the live delta of a running timer.
    pub fn wall_time(&self) -> Duration {
        let inner = self.inner.lock();
        inner.wall_time + inner.wall_started.map_or(Duration::ZERO, |start| start.elapsed())
    }

    /// Returns `true` while a CPU timer is accruing for this isolate.
    pub fn is_cpu_timer_running(&self) -> bool {
        self.inner.lock().cpu_started.is_some()
    }

    fn start_cpu(&self) {
        let mut inner = self.inner.lock();
        debug_assert!(
            inner.cpu_started.is_none(),
            "CPU timer already running for this isolate"
        );
        inner.cpu_started = Some(Instant::now());
    }

    fn stop_cpu(&self) {
        let mut inner = self.inner.lock();
        if let Some(start) = inner.cpu_started.take() {
            inner.cpu_time += start.elapsed();
        }
    }
}

/// One entry of the thread-local CPU timer stack
struct CpuTimerEntry {
    state: Arc<TimerState>,
    pause_depth: Cell<u32>,
    /// Cleared when the owning `CpuTimer` drops; a stray pause scope must not restart it
    alive: Cell<bool>,
}

impl CpuTimerEntry {
    fn pause(&self) {
        let depth = self.pause_depth.get();
        if depth == 0 && self.alive.get() {
            self.state.stop_cpu();
        }
        self.pause_depth.set(depth + 1);
    }

    fn resume(&self) {
        let depth = self.pause_depth.get();
        debug_assert!(depth > 0, "CPU timer resumed more often than paused");
        let depth = depth.saturating_sub(1);
        self.pause_depth.set(depth);
        if depth == 0 && self.alive.get() {
            self.state.start_cpu();
        }
    }
}

thread_local! {
    static CPU_TIMERS: RefCell<Vec<Rc<CpuTimerEntry>>> = const { RefCell::new(Vec::new()) };
}

fn top_cpu_timer() -> Option<Rc<CpuTimerEntry>> {
    CPU_TIMERS.with(|timers| timers.borrow().last().cloned())
}

/// Accrues CPU time for one isolate until dropped
pub struct CpuTimer {
    entry: Rc<CpuTimerEntry>,
}

impl CpuTimer {
    /// Start accruing for `state`. Whatever timer was live on this thread
    /// must already be paused, normally by a [`WallTimer`].
    pub fn start(state: &Arc<TimerState>) -> Self {
        debug_assert!(
            top_cpu_timer().map_or(true, |top| top.pause_depth.get() > 0 || !top.alive.get()),
            "CPU timer started while another one is accruing on this thread"
        );
        let entry = Rc::new(CpuTimerEntry {
            state: state.clone(),
            pause_depth: Cell::new(0),
            alive: Cell::new(true),
        });
        entry.state.start_cpu();
        CPU_TIMERS.with(|timers| timers.borrow_mut().push(entry.clone()));
        Self { entry }
    }

    /// Suspend this timer until the returned scope is dropped.
    pub fn pause(&self) -> PauseScope {
        PauseScope::new(self.entry.clone())
    }

    pub fn is_paused(&self) -> bool {
        self.entry.pause_depth.get() > 0
    }
}

impl Drop for CpuTimer {
    fn drop(&mut self) {
        CPU_TIMERS.with(|timers| {
            let popped = timers.borrow_mut().pop();
            debug_assert!(
                popped.is_some_and(|entry| Rc::ptr_eq(&entry, &self.entry)),
                "CPU timers dropped out of order"
            );
        });
        if self.entry.pause_depth.get() == 0 {
            self.entry.state.stop_cpu();
        }
        self.entry.alive.set(false);
    }
}

/// Keeps a CPU timer suspended while alive
pub struct PauseScope {
    entry: Rc<CpuTimerEntry>,
}

impl PauseScope {
    fn new(entry: Rc<CpuTimerEntry>) -> Self {
        entry.pause();
        Self { entry }
    }

    /// Pause whatever CPU timer is live on this thread, if any.
    pub fn current() -> Option<Self> {
        top_cpu_timer().map(Self::new)
    }

    /// Temporarily resume the paused timer for the returned scope's lifetime.
    pub fn unpause(&self) -> UnpauseScope<'_> {
        self.entry.resume();
        UnpauseScope { pause: self }
    }
}

impl Drop for PauseScope {
    fn drop(&mut self) {
        self.entry.resume();
    }
}

/// Re-enables a paused CPU timer inside a [`PauseScope`]
pub struct UnpauseScope<'a> {
    pause: &'a PauseScope,
}

impl Drop for UnpauseScope<'_> {
    fn drop(&mut self) {
        self.pause.entry.pause();
    }
}

/// Accrues wall time for one isolate; pauses the thread's live CPU timer
pub struct WallTimer {
    state: Arc<TimerState>,
    owns_accumulator: bool,
    _paused: Option<PauseScope>,
}

impl WallTimer {
    pub fn start(state: &Arc<TimerState>) -> Self {
        let paused = PauseScope::current();
        let owns_accumulator = {
            let mut inner = state.inner.lock();
            if inner.wall_started.is_none() {
                inner.wall_started = Some(Instant::now());
                true
            } else {
                false
            }
        };
        trace!(owns_accumulator, paused_cpu = paused.is_some(), "Wall timer started");
        Self {
            state: state.clone(),
            owns_accumulator,
            _paused: paused,
        }
    }
}

impl Drop for WallTimer {
    fn drop(&mut self) {
        if self.owns_accumulator {
            let mut inner = self.state.inner.lock();
            if let Some(start) = inner.wall_started.take() {
                inner.wall_time += start.elapsed();
            }
        }
        // `_paused` drops after this body, resuming the interrupted CPU timer.
    }
}
