//! Isolate - one sandboxed, memory- and time-accounted execution context
//!
//! [`IsolateEnvironment`] aggregates an engine instance with its executor,
//! scheduler and heap governor state. Callers never own it directly: they
//! hold an [`IsolateHolder`], which resolves to the live isolate until
//! termination. In-flight episodes hold their own strong reference, so an
//! isolate is destroyed only after the last episode finishes.
//!
//! # Lifecycle
//! `Constructing -> Active -> Terminated -> Disposed`. The privileged isolate
//! wraps an engine the host already created; it stays `Active` and is never
//! terminated or disposed here.
//!
//! # Destruction
//! 1. detach the inspector agent under the scheduler lock,
//! 2. under the executor lock: drop the agent, run every weak callback,
//!    discard all queued work,
//! 3. with only a [`Scope`] bound, dispose the engine,
//! 4. leave the registry.

pub mod governor;
pub mod holder;

pub use governor::HeapCheck;
pub use holder::IsolateHolder;

use crate::config::{HeapPolicy, IsolateConfig};
use crate::engine::{
    CreateParams, Engine, EngineFactory, EngineHooks, EngineId, LimitedAllocator, MemoryAccount,
    MemoryPressureLevel, ResourceConstraints,
};
use crate::error::{HandleId, IsolateError, Result};
use crate::executor::{Executor, Lock, Scope};
use crate::platform::Platform;
use crate::registry::registry;
use crate::scheduler::{
    HandleTask, InspectorAgent, Interrupt, InterruptQueue, Scheduler, Status, SyncInterrupt, Task,
    WorkBatch,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tracing::{debug, error, info};

/// Cleanup hook tied to a native handle; must remove itself when invoked
pub type WeakCallback = Arc<dyn Fn(&IsolateEnvironment) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Constructing,
    Active,
    Terminated,
    Disposed,
}

pub struct IsolateEnvironment {
    self_ref: Weak<IsolateEnvironment>,
    engine: Arc<dyn Engine>,
    engine_id: EngineId,
    platform: Arc<Platform>,
    executor: Executor,
    scheduler: Scheduler,

    // Heap governor state
    memory: Arc<MemoryAccount>,
    allocator: Option<Arc<LimitedAllocator>>,
    misc_memory_size: usize,
    initial_heap_size_limit: usize,
    did_adjust_heap_limit: AtomicBool,
    memory_pressure: Mutex<MemoryPressureLevel>,
    heap_policy: HeapPolicy,

    privileged: bool,
    terminated: AtomicBool,
    hit_memory_limit: AtomicBool,
    state: Mutex<LifecycleState>,
    holder: OnceLock<Weak<IsolateHolder>>,
    weak_callbacks: Mutex<HashMap<HandleId, WeakCallback>>,
    rejected_promise_error: Mutex<Option<String>>,
    snapshot: Option<Arc<[u8]>>,
}

impl IsolateEnvironment {
    /// Create a sandboxed isolate with its own engine instance.
    pub fn new(
        platform: &Arc<Platform>,
        factory: &dyn EngineFactory,
        config: IsolateConfig,
    ) -> Result<Arc<IsolateHolder>> {
        config.validate()?;
        let memory_limit = config.memory_limit_bytes();
        let memory = Arc::new(MemoryAccount::new(memory_limit));
        let allocator = Arc::new(LimitedAllocator::new(memory.clone()));

        let engine = factory.create(CreateParams {
            constraints: ResourceConstraints::for_memory_limit(config.memory_limit_mb),
            allocator: allocator.clone(),
            snapshot: config.snapshot.clone(),
        })?;

        // Heap statistics fold several engine spaces into one number; the
        // difference from the requested limit is engine overhead.
        let initial_heap_size_limit = engine.heap_statistics().heap_size_limit;
        let misc_memory_size = initial_heap_size_limit.saturating_sub(memory_limit);

        let env = Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            engine_id: engine.id(),
            engine,
            platform: platform.clone(),
            executor: Executor::new(),
            scheduler: Scheduler::new(),
            memory,
            allocator: Some(allocator),
            misc_memory_size,
            initial_heap_size_limit,
            did_adjust_heap_limit: AtomicBool::new(false),
            memory_pressure: Mutex::new(MemoryPressureLevel::None),
            heap_policy: config.heap_policy,
            privileged: false,
            terminated: AtomicBool::new(false),
            hit_memory_limit: AtomicBool::new(false),
            state: Mutex::new(LifecycleState::Constructing),
            holder: OnceLock::new(),
            weak_callbacks: Mutex::new(HashMap::new()),
            rejected_promise_error: Mutex::new(None),
            snapshot: config.snapshot,
        });

        let weak: Weak<IsolateEnvironment> = Arc::downgrade(&env);
        let hooks: Weak<dyn EngineHooks> = weak;
        env.engine.install_hooks(hooks);
        {
            let lock = Lock::new(&env);
            lock.engine().create_default_context();
        }
        Ok(env.activate())
    }

    /// Wrap the host's own engine as the privileged isolate.
    pub fn new_privileged(
        platform: &Arc<Platform>,
        engine: Arc<dyn Engine>,
    ) -> Result<Arc<IsolateHolder>> {
        platform.claim_privileged()?;
        let initial_heap_size_limit = engine.heap_statistics().heap_size_limit;

        let env = Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            engine_id: engine.id(),
            engine,
            platform: platform.clone(),
            executor: Executor::new(),
            scheduler: Scheduler::new(),
            memory: Arc::new(MemoryAccount::new(usize::MAX)),
            allocator: None,
            misc_memory_size: 0,
            initial_heap_size_limit,
            did_adjust_heap_limit: AtomicBool::new(false),
            memory_pressure: Mutex::new(MemoryPressureLevel::None),
            heap_policy: HeapPolicy::default(),
            privileged: true,
            terminated: AtomicBool::new(false),
            hit_memory_limit: AtomicBool::new(false),
            state: Mutex::new(LifecycleState::Constructing),
            holder: OnceLock::new(),
            weak_callbacks: Mutex::new(HashMap::new()),
            rejected_promise_error: Mutex::new(None),
            snapshot: None,
        });
        Ok(env.activate())
    }

    fn activate(self: Arc<Self>) -> Arc<IsolateHolder> {
        registry().insert(self.engine_id, &self);
        let holder = IsolateHolder::new(self.clone());
        let _ = self.holder.set(Arc::downgrade(&holder));
        *self.state.lock() = LifecycleState::Active;
        self.platform.metrics().record_isolate_created();
        info!(
            isolate = %self.engine_id,
            privileged = self.privileged,
            memory_limit = self.memory.limit(),
            misc_memory_size = self.misc_memory_size,
            "Isolate created"
        );
        holder
    }

    // ── accessors ──

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub fn engine_id(&self) -> EngineId {
        self.engine_id
    }

    pub fn platform(&self) -> &Arc<Platform> {
        &self.platform
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    pub fn hit_memory_limit(&self) -> bool {
        self.hit_memory_limit.load(Ordering::Acquire)
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        *self.state.lock()
    }

    /// Configured memory limit in bytes.
    pub fn memory_limit(&self) -> usize {
        self.memory.limit()
    }

    pub fn misc_memory_size(&self) -> usize {
        self.misc_memory_size
    }

    pub fn initial_heap_size_limit(&self) -> usize {
        self.initial_heap_size_limit
    }

    pub fn extra_allocated_memory(&self) -> usize {
        self.memory.extra_allocated()
    }

    /// Allocator for memory outside the managed heap; `None` on the privileged isolate.
    pub fn allocator(&self) -> Option<&Arc<LimitedAllocator>> {
        self.allocator.as_ref()
    }

    pub fn snapshot(&self) -> Option<&Arc<[u8]>> {
        self.snapshot.as_ref()
    }

    pub fn holder(&self) -> Option<Arc<IsolateHolder>> {
        self.holder.get().and_then(Weak::upgrade)
    }

    pub fn cpu_time(&self) -> Duration {
        self.executor.cpu_time()
    }

    pub fn wall_time(&self) -> Duration {
        self.executor.wall_time()
    }

    /// The isolate bound to this thread, if it is still alive.
    pub fn current() -> Option<Arc<IsolateEnvironment>> {
        registry().lookup_environment(Executor::current_isolate()?)
    }

    /// Reverse lookup from an engine instance to its isolate's holder.
    pub fn lookup(id: EngineId) -> Option<Arc<IsolateHolder>> {
        registry().lookup(id)
    }

    // ── scheduling ──

    fn ensure_runnable(&self) -> Result<()> {
        if self.hit_memory_limit() {
            return Err(IsolateError::MemoryLimit);
        }
        if self.is_terminated() {
            return Err(IsolateError::Terminated);
        }
        Ok(())
    }

    /// Queue a task and wake the isolate.
    pub fn schedule_task(self: &Arc<Self>, task: Task) -> Result<()> {
        self.ensure_runnable()?;
        let mut scheduler = self.scheduler.lock();
        scheduler.push_task(task);
        scheduler.wake_isolate(self.clone());
        Ok(())
    }

    /// Queue a handle-cleanup task and wake the isolate.
    pub fn schedule_handle_task(self: &Arc<Self>, task: HandleTask) -> Result<()> {
        self.ensure_runnable()?;
        let mut scheduler = self.scheduler.lock();
        scheduler.push_handle_task(task);
        scheduler.wake_isolate(self.clone());
        Ok(())
    }

    /// Queue an interrupt. If the isolate is already running, the engine is
    /// asked to deliver it at the next safe point.
    pub fn schedule_interrupt(self: &Arc<Self>, interrupt: Interrupt) -> Result<()> {
        self.ensure_runnable()?;
        let mut scheduler = self.scheduler.lock();
        scheduler.push_interrupt(interrupt);
        if !scheduler.wake_isolate(self.clone()) {
            scheduler.interrupt_isolate(self);
        }
        Ok(())
    }

    /// Queue a sync interrupt for a caller blocked on the result.
    pub fn schedule_sync_interrupt(self: &Arc<Self>, interrupt: SyncInterrupt) -> Result<()> {
        self.ensure_runnable()?;
        let mut scheduler = self.scheduler.lock();
        scheduler.push_sync_interrupt(interrupt);
        if !scheduler.wake_isolate(self.clone()) {
            scheduler.interrupt_sync_isolate(self);
        }
        Ok(())
    }

    /// One execution episode: drain until all queues are seen empty.
    pub(crate) fn async_entry(&self) {
        let metrics = self.platform.metrics().clone();
        let mut lock = Lock::new(self);
        loop {
            let batch = {
                let mut scheduler = self.scheduler.lock();
                let batch = scheduler.take_all();
                if batch.is_empty() {
                    scheduler.done_running();
                    return;
                }
                batch
            };
            let WorkBatch {
                interrupts,
                sync_interrupts,
                handle_tasks,
                mut tasks,
            } = batch;

            metrics.record_interrupts(interrupts.len() + sync_interrupts.len());
            for interrupt in interrupts {
                interrupt.run(&mut lock);
            }
            for interrupt in sync_interrupts {
                interrupt.run(&mut lock);
            }

            metrics.record_handle_tasks(handle_tasks.len());
            for task in handle_tasks {
                task.run(&mut lock);
            }

            while let Some(task) = tasks.pop_front() {
                task.run(&mut lock);
                metrics.record_tasks(1);
                if self.hit_memory_limit() {
                    debug!(
                        isolate = %self.engine_id,
                        dropped = tasks.len(),
                        "Memory limit hit, ending episode"
                    );
                    metrics.record_discarded(tasks.len());
                    return;
                }
                self.check_memory_pressure();
            }
        }
    }

    /// Drain one interrupt queue from an engine safe point.
    pub(crate) fn interrupt_entry(&self, queue: InterruptQueue) {
        let metrics = self.platform.metrics().clone();
        let mut lock = Lock::new(self);
        loop {
            let ran = match queue {
                InterruptQueue::Async => {
                    let interrupts = self.scheduler.lock().take_interrupts();
                    let count = interrupts.len();
                    for interrupt in interrupts {
                        interrupt.run(&mut lock);
                    }
                    count
                }
                InterruptQueue::Sync => {
                    let interrupts = self.scheduler.lock().take_sync_interrupts();
                    let count = interrupts.len();
                    for interrupt in interrupts {
                        interrupt.run(&mut lock);
                    }
                    count
                }
            };
            if ran == 0 {
                return;
            }
            metrics.record_interrupts(ran);
        }
    }

    /// Reset the run state after an episode unwound.
    pub(crate) fn abandon_episode(&self) {
        let mut scheduler = self.scheduler.lock();
        if scheduler.status() == Status::Running {
            scheduler.done_running();
        }
    }

    // ── termination ──

    /// Abort running script and stop accepting work. Not valid on the privileged isolate.
    pub fn terminate(&self) -> Result<()> {
        if self.privileged {
            return Err(IsolateError::Privileged);
        }
        self.terminate_internal();
        Ok(())
    }

    pub(crate) fn terminate_internal(&self) {
        debug_assert!(!self.privileged);
        let first = !self.terminated.swap(true, Ordering::AcqRel);
        {
            let mut state = self.state.lock();
            if *state == LifecycleState::Active {
                *state = LifecycleState::Terminated;
            }
        }
        {
            let mut scheduler = self.scheduler.lock();
            if let Some(agent) = scheduler.inspector_agent_mut() {
                agent.terminate();
            }
        }
        self.engine.terminate_execution();
        if let Some(holder) = self.holder() {
            holder.release();
        }
        if first {
            self.platform.metrics().record_termination();
            info!(isolate = %self.engine_id, "Isolate terminated");
        }
    }

    pub fn enable_inspector_agent(&self, agent: Box<dyn InspectorAgent>) {
        self.scheduler.lock().set_inspector_agent(agent);
    }

    // ── weak callbacks ──

    /// Register cleanup for `handle`. No-op on the privileged isolate.
    pub fn add_weak_callback<F>(&self, handle: HandleId, callback: F) -> Result<()>
    where
        F: Fn(&IsolateEnvironment) + Send + Sync + 'static,
    {
        if self.privileged {
            return Ok(());
        }
        let mut callbacks = self.weak_callbacks.lock();
        if callbacks.contains_key(&handle) {
            return Err(IsolateError::WeakCallbackExists(handle));
        }
        callbacks.insert(handle, Arc::new(callback));
        Ok(())
    }

    /// Unregister cleanup for `handle`. No-op on the privileged isolate.
    pub fn remove_weak_callback(&self, handle: HandleId) -> Result<()> {
        if self.privileged {
            return Ok(());
        }
        self.weak_callbacks
            .lock()
            .remove(&handle)
            .map(|_| ())
            .ok_or(IsolateError::WeakCallbackMissing(handle))
    }

    pub fn weak_callback_count(&self) -> usize {
        self.weak_callbacks.lock().len()
    }

    fn run_weak_callbacks(&self) {
        let handles: Vec<HandleId> = self.weak_callbacks.lock().keys().copied().collect();
        for handle in handles {
            let callback = self.weak_callbacks.lock().get(&handle).cloned();
            if let Some(callback) = callback {
                callback(self);
            }
        }

        let mut leftover = self.weak_callbacks.lock();
        if !leftover.is_empty() {
            error!(
                isolate = %self.engine_id,
                remaining = leftover.len(),
                "Weak callbacks did not unregister themselves"
            );
            debug_assert!(leftover.is_empty(), "weak callbacks left after destruction");
            leftover.clear();
        }
    }
}

impl fmt::Debug for IsolateEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolateEnvironment")
            .field("engine_id", &self.engine_id)
            .field("privileged", &self.privileged)
            .field("state", &self.lifecycle_state())
            .field("memory_limit", &self.memory.limit())
            .finish_non_exhaustive()
    }
}

impl Drop for IsolateEnvironment {
    fn drop(&mut self) {
        if self.privileged {
            registry().remove(self.engine_id);
            return;
        }

        let agent = self.scheduler.lock().take_inspector_agent();
        let discarded = {
            let _lock = Lock::new(self);
            drop(agent);
            self.run_weak_callbacks();
            let outstanding = self.scheduler.lock().take_all();
            let count = outstanding.len();
            drop(outstanding);
            count
        };

        {
            let _scope = Scope::new(self.engine_id);
            self.engine.dispose();
        }
        *self.state.lock() = LifecycleState::Disposed;
        registry().remove(self.engine_id);

        let metrics = self.platform.metrics();
        metrics.record_discarded(discarded);
        metrics.record_isolate_disposed();
        info!(isolate = %self.engine_id, discarded, "Isolate disposed");
    }
}
