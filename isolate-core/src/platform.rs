//! Platform - the process context shared by every isolate
//!
//! A [`Platform`] owns what the isolates share:
//! - the worker pool running sandboxed isolates,
//! - the host loop handle that runs the privileged isolate,
//! - a count of in-flight episodes that keeps the host loop alive,
//! - the slot holding the privileged isolate's pending episode,
//! - metrics.
//!
//! It is passed explicitly to every isolate at construction; there is no
//! global platform.
//!
//! # Host loop reference count
//! Every dispatched episode holds one reference, the privileged isolate's
//! episodes included, so the loop stays alive while any isolate has work in
//! flight, not only while the loop itself has an episode to run. The count
//! itself is atomic
//! and may change on any thread, but only the loop thread toggles the
//! handle's active flag. Other threads crossing 0 <-> 1 send a wake-up
//! instead and [`Platform::on_host_wake`] reconciles the flag.

use crate::config::PlatformConfig;
use crate::error::{IsolateError, Result};
use crate::host_loop::HostLoop;
use crate::isolate::IsolateEnvironment;
use crate::metrics::{EpisodeTimer, PlatformMetrics};
use crate::scheduler::{ThreadAffinity, WorkerPool};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

pub struct Platform {
    config: PlatformConfig,
    pool: WorkerPool,
    host: Arc<dyn HostLoop>,
    host_refs: AtomicUsize,
    root_slot: Mutex<Option<Arc<IsolateEnvironment>>>,
    privileged: AtomicBool,
    metrics: Arc<PlatformMetrics>,
}

impl Platform {
    pub fn new(config: PlatformConfig, host: Arc<dyn HostLoop>) -> Result<Arc<Self>> {
        let pool = WorkerPool::new(config.effective_worker_threads())?;
        info!(worker_threads = pool.size(), "Platform initialized");
        Ok(Arc::new(Self {
            config,
            pool,
            host,
            host_refs: AtomicUsize::new(0),
            root_slot: Mutex::new(None),
            privileged: AtomicBool::new(false),
            metrics: Arc::new(PlatformMetrics::new()),
        }))
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<PlatformMetrics> {
        &self.metrics
    }

    pub fn host(&self) -> &Arc<dyn HostLoop> {
        &self.host
    }

    /// Episodes dispatched but not yet finished, pool and host loop alike.
    pub fn in_flight(&self) -> usize {
        self.host_refs.load(Ordering::Acquire)
    }

    /// Reserve the single privileged isolate slot.
    pub(crate) fn claim_privileged(&self) -> Result<()> {
        self.privileged
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| IsolateError::PrivilegedExists)
    }

    /// Run one execution episode for `env` on its thread of choice.
    pub(crate) fn dispatch(&self, env: Arc<IsolateEnvironment>, affinity: &ThreadAffinity) {
        self.metrics.record_episode_dispatched();
        self.acquire_host_ref();

        if env.is_privileged() {
            {
                let mut slot = self.root_slot.lock();
                debug_assert!(slot.is_none(), "privileged episode already pending");
                *slot = Some(env);
            }
            self.host.send();
            return;
        }

        self.pool.exec(
            affinity,
            Box::new(move || {
                let platform = env.platform().clone();
                platform.run_episode(&env);
                drop(env);
                platform.release_host_ref();
            }),
        );
    }

    /// Called by the host loop, on its own thread, after [`HostLoop::send`].
    pub fn on_host_wake(&self) {
        let root = self.root_slot.lock().take();
        if let Some(env) = root {
            self.run_episode(&env);
            drop(env);
            self.release_host_ref();
        }
        self.host.set_active(self.in_flight() > 0);
    }

    fn run_episode(&self, env: &Arc<IsolateEnvironment>) {
        let _timer = EpisodeTimer::new(&self.metrics);
        if catch_unwind(AssertUnwindSafe(|| env.async_entry())).is_err() {
            error!(isolate = %env.engine_id(), "Execution episode panicked");
            env.abandon_episode();
        }
    }

    fn acquire_host_ref(&self) {
        if self.host_refs.fetch_add(1, Ordering::AcqRel) == 0 {
            if self.host.is_loop_thread() {
                self.host.set_active(true);
            } else {
                self.host.send();
            }
        }
    }

    fn release_host_ref(&self) {
        if self.host_refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            if self.host.is_loop_thread() {
                self.host.set_active(false);
            } else {
                debug!("Last episode finished off the loop thread, waking host");
                self.host.send();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host_loop;

    #[test]
    fn test_single_privileged_slot() {
        let (handle, _driver) = host_loop::channel();
        let platform = Platform::new(PlatformConfig { worker_threads: 1 }, handle).unwrap();
        assert!(platform.claim_privileged().is_ok());
        assert!(matches!(
            platform.claim_privileged(),
            Err(IsolateError::PrivilegedExists)
        ));
    }

    #[test]
    fn test_host_refs_toggle_on_loop_thread() {
        let (handle, _driver) = host_loop::channel();
        let platform =
            Platform::new(PlatformConfig { worker_threads: 1 }, handle.clone()).unwrap();
        platform.acquire_host_ref();
        assert!(handle.is_active());
        platform.acquire_host_ref();
        platform.release_host_ref();
        assert!(handle.is_active());
        platform.release_host_ref();
        assert!(!handle.is_active());
        assert_eq!(platform.in_flight(), 0);
    }

    #[test]
    fn test_privileged_episode_holds_host_ref() {
        use crate::engine::SimulatedEngine;
        use crate::scheduler::Task;
        use std::sync::atomic::AtomicUsize;

        let (handle, _driver) = host_loop::channel();
        let platform =
            Platform::new(PlatformConfig { worker_threads: 1 }, handle.clone()).unwrap();
        let holder =
            IsolateEnvironment::new_privileged(&platform, Arc::new(SimulatedEngine::unconstrained()))
                .unwrap();
        let env = holder.get().unwrap();

        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        env.schedule_task(Task::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        // Queued for the loop thread, counted like any pool episode
        assert_eq!(platform.in_flight(), 1);
        assert!(handle.is_active());
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        platform.on_host_wake();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(platform.in_flight(), 0);
        assert!(!handle.is_active());
    }
}
