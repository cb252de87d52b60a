//! Scheduler - per-isolate work queues and the Running/Waiting state machine
//!
//! Every isolate owns one [`Scheduler`] with four FIFO queues, each with its
//! own work type so drain order stays explicit:
//!
//! | Queue | Type | Drained |
//! |---|---|---|
//! | interrupts | [`Interrupt`] | first, and from engine safe points |
//! | sync interrupts | [`SyncInterrupt`] | first, and from engine safe points |
//! | handle tasks | [`HandleTask`] | after interrupts |
//! | tasks | [`Task`] | last, with a memory check after each |
//!
//! All queue and status access goes through a [`SchedulerLock`]. Pushing never
//! runs work inline. [`SchedulerLock::wake_isolate`] moves `Waiting -> Running`
//! and dispatches exactly one execution episode; while `Running` it is a
//! no-op, so an isolate is never drained by two threads at once.

pub mod async_wait;
pub mod pool;

pub use async_wait::{AsyncWait, WaitBarrier};
pub use pool::{ThreadAffinity, WorkerPool};

use crate::executor::Lock;
use crate::isolate::IsolateEnvironment;
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// A unit of work run with the isolate locked
pub trait Runnable: Send + 'static {
    fn run(self: Box<Self>, lock: &mut Lock<'_>);
}

struct FnRunnable<F>(F);

impl<F> Runnable for FnRunnable<F>
where
    F: FnOnce(&mut Lock<'_>) + Send + 'static,
{
    fn run(self: Box<Self>, lock: &mut Lock<'_>) {
        (self.0)(lock)
    }
}

macro_rules! work_item {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        pub struct $name(Box<dyn Runnable>);

        impl $name {
            pub fn new<F>(f: F) -> Self
            where
                F: FnOnce(&mut Lock<'_>) + Send + 'static,
            {
                Self(Box::new(FnRunnable(f)))
            }

            pub fn from_runnable(runnable: Box<dyn Runnable>) -> Self {
                Self(runnable)
            }

            pub fn run(self, lock: &mut Lock<'_>) {
                self.0.run(lock)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(stringify!($name))
            }
        }
    };
}

work_item!(
    /// Regular work, drained after interrupts and handle tasks
    Task
);
work_item!(
    /// Cleanup work for native handles
    HandleTask
);
work_item!(
    /// Work that may run at an engine safe point while the isolate is busy
    Interrupt
);
work_item!(
    /// Interrupt requested by a caller blocked on the result
    SyncInterrupt
);

/// Which interrupt queue an engine safe point should drain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptQueue {
    Async,
    Sync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Waiting,
    Running,
}

/// Debugger attached to an isolate
pub trait InspectorAgent: Send {
    /// Abort any in-flight debugging session.
    fn terminate(&mut self);
}

/// Everything taken from the queues in one atomic swap
#[derive(Debug, Default)]
pub struct WorkBatch {
    pub interrupts: VecDeque<Interrupt>,
    pub sync_interrupts: VecDeque<SyncInterrupt>,
    pub handle_tasks: VecDeque<HandleTask>,
    pub tasks: VecDeque<Task>,
}

impl WorkBatch {
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        self.interrupts.len()
            + self.sync_interrupts.len()
            + self.handle_tasks.len()
            + self.tasks.len()
    }
}

#[derive(Default)]
struct SchedulerState {
    status: Status,
    tasks: VecDeque<Task>,
    handle_tasks: VecDeque<HandleTask>,
    interrupts: VecDeque<Interrupt>,
    sync_interrupts: VecDeque<SyncInterrupt>,
    async_wait: Option<Arc<WaitBarrier>>,
    inspector_agent: Option<Box<dyn InspectorAgent>>,
}

/// Per-isolate queues and run state
#[derive(Default)]
pub struct Scheduler {
    state: Mutex<SchedulerState>,
    affinity: ThreadAffinity,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> SchedulerLock<'_> {
        SchedulerLock {
            scheduler: self,
            state: self.state.lock(),
        }
    }

    pub fn affinity(&self) -> &ThreadAffinity {
        &self.affinity
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("affinity", &self.affinity)
            .finish_non_exhaustive()
    }
}

/// Exclusive access to a scheduler's queues and status
pub struct SchedulerLock<'a> {
    scheduler: &'a Scheduler,
    state: MutexGuard<'a, SchedulerState>,
}

impl SchedulerLock<'_> {
    pub fn status(&self) -> Status {
        self.state.status
    }

    pub fn push_task(&mut self, task: Task) {
        self.state.tasks.push_back(task);
    }

    pub fn push_handle_task(&mut self, task: HandleTask) {
        self.state.handle_tasks.push_back(task);
    }

    pub fn push_interrupt(&mut self, interrupt: Interrupt) {
        self.state.interrupts.push_back(interrupt);
    }

    pub fn push_sync_interrupt(&mut self, interrupt: SyncInterrupt) {
        self.state.sync_interrupts.push_back(interrupt);
    }

    pub fn take_tasks(&mut self) -> VecDeque<Task> {
        std::mem::take(&mut self.state.tasks)
    }

    pub fn take_handle_tasks(&mut self) -> VecDeque<HandleTask> {
        std::mem::take(&mut self.state.handle_tasks)
    }

    pub fn take_interrupts(&mut self) -> VecDeque<Interrupt> {
        std::mem::take(&mut self.state.interrupts)
    }

    pub fn take_sync_interrupts(&mut self) -> VecDeque<SyncInterrupt> {
        std::mem::take(&mut self.state.sync_interrupts)
    }

    /// Swap out all four queues at once.
    pub fn take_all(&mut self) -> WorkBatch {
        WorkBatch {
            interrupts: self.take_interrupts(),
            sync_interrupts: self.take_sync_interrupts(),
            handle_tasks: self.take_handle_tasks(),
            tasks: self.take_tasks(),
        }
    }

    /// Number of queued items across all queues.
    pub fn pending(&self) -> usize {
        self.state.tasks.len()
            + self.state.handle_tasks.len()
            + self.state.interrupts.len()
            + self.state.sync_interrupts.len()
    }

    /// End the current episode. Only valid when all queues were just seen empty.
    pub fn done_running(&mut self) {
        debug_assert_eq!(self.state.status, Status::Running);
        self.state.status = Status::Waiting;
    }

    /// Start an episode for `env` unless one is already in flight.
    ///
    /// The strong reference travels with the episode, so the isolate cannot
    /// be destroyed before a thread picks it up.
    pub fn wake_isolate(&mut self, env: Arc<IsolateEnvironment>) -> bool {
        if self.state.status != Status::Waiting {
            return false;
        }
        self.state.status = Status::Running;
        trace!(isolate = %env.engine_id(), "Waking isolate");
        let platform = env.platform().clone();
        platform.dispatch(env, &self.scheduler.affinity);
        true
    }

    /// Ask the engine to drain the interrupt queue at its next safe point.
    pub fn interrupt_isolate(&self, env: &Arc<IsolateEnvironment>) {
        debug_assert_eq!(self.state.status, Status::Running);
        request_interrupt_entry(env, InterruptQueue::Async);
    }

    /// Ask the engine to drain the sync-interrupt queue at its next safe point.
    pub fn interrupt_sync_isolate(&self, env: &Arc<IsolateEnvironment>) {
        request_interrupt_entry(env, InterruptQueue::Sync);
    }

    pub fn async_wait(&self) -> Option<Arc<WaitBarrier>> {
        self.state.async_wait.clone()
    }

    pub(crate) fn set_async_wait(&mut self, barrier: Option<Arc<WaitBarrier>>) {
        self.state.async_wait = barrier;
    }

    pub fn set_inspector_agent(&mut self, agent: Box<dyn InspectorAgent>) {
        self.state.inspector_agent = Some(agent);
    }

    pub fn inspector_agent_mut(&mut self) -> Option<&mut (dyn InspectorAgent + 'static)> {
        self.state.inspector_agent.as_deref_mut()
    }

    pub fn take_inspector_agent(&mut self) -> Option<Box<dyn InspectorAgent>> {
        self.state.inspector_agent.take()
    }
}

fn request_interrupt_entry(env: &Arc<IsolateEnvironment>, queue: InterruptQueue) {
    let weak = Arc::downgrade(env);
    env.engine().request_interrupt(Box::new(move || {
        if let Some(env) = weak.upgrade() {
            env.interrupt_entry(queue);
        }
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queues_are_fifo_and_swapped_out() {
        let scheduler = Scheduler::new();
        let mut lock = scheduler.lock();
        lock.push_task(Task::new(|_| {}));
        lock.push_task(Task::new(|_| {}));
        lock.push_handle_task(HandleTask::new(|_| {}));
        lock.push_interrupt(Interrupt::new(|_| {}));
        lock.push_sync_interrupt(SyncInterrupt::new(|_| {}));
        assert_eq!(lock.pending(), 5);

        let batch = lock.take_all();
        assert_eq!(batch.len(), 5);
        assert_eq!(batch.tasks.len(), 2);
        assert_eq!(lock.pending(), 0);
        assert!(lock.take_all().is_empty());
    }

    #[test]
    fn test_status_starts_waiting() {
        let scheduler = Scheduler::new();
        assert_eq!(scheduler.lock().status(), Status::Waiting);
    }

    #[test]
    fn test_inspector_agent_slot() {
        struct Agent(Arc<std::sync::atomic::AtomicBool>);
        impl InspectorAgent for Agent {
            fn terminate(&mut self) {
                self.0.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        }

        let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let scheduler = Scheduler::new();
        let mut lock = scheduler.lock();
        assert!(lock.inspector_agent_mut().is_none());
        lock.set_inspector_agent(Box::new(Agent(flag.clone())));
        if let Some(agent) = lock.inspector_agent_mut() {
            agent.terminate();
        }
        assert!(flag.load(std::sync::atomic::Ordering::SeqCst));
        assert!(lock.take_inspector_agent().is_some());
        assert!(lock.take_inspector_agent().is_none());
    }
}
