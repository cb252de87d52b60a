//! Fixed-size worker pool shared by all sandboxed isolates
//!
//! Every worker listens on two channels: its own local queue and a shared
//! injector. A job submitted with a [`ThreadAffinity`] goes to the worker that
//! last ran that isolate if it is idle right now, otherwise to the injector
//! where any worker picks it up. Repeat episodes of a busy isolate therefore
//! tend to stay on one warm thread.

use crate::error::Result;
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, trace};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

const NO_AFFINITY: usize = usize::MAX;

thread_local! {
    static WORKER_INDEX: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Sticky scheduling hint: the index of the worker that last ran an isolate
#[derive(Debug, Clone)]
pub struct ThreadAffinity(Arc<AtomicUsize>);

impl Default for ThreadAffinity {
    fn default() -> Self {
        Self(Arc::new(AtomicUsize::new(NO_AFFINITY)))
    }
}

impl ThreadAffinity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn preferred(&self) -> Option<usize> {
        match self.0.load(Ordering::Relaxed) {
            NO_AFFINITY => None,
            index => Some(index),
        }
    }

    fn record(&self, index: usize) {
        self.0.store(index, Ordering::Relaxed);
    }
}

struct Worker {
    local: Sender<Job>,
    idle: Arc<AtomicBool>,
}

pub struct WorkerPool {
    injector: Sender<Job>,
    workers: Vec<Worker>,
}

impl WorkerPool {
    /// Spawn `size` worker threads.
    pub fn new(size: usize) -> Result<Self> {
        let size = size.max(1);
        let (injector, shared) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(size);

        for index in 0..size {
            let (local, own) = unbounded::<Job>();
            let idle = Arc::new(AtomicBool::new(true));
            let shared = shared.clone();
            let worker_idle = idle.clone();
            thread::Builder::new()
                .name(format!("isolate-worker-{index}"))
                .spawn(move || run_worker(index, own, shared, worker_idle))?;
            workers.push(Worker { local, idle });
        }

        debug!(size, "Worker pool started");
        Ok(Self { injector, workers })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Index of the pool worker running on this thread, if any.
    pub fn current_worker() -> Option<usize> {
        WORKER_INDEX.with(Cell::get)
    }

    /// Queue `job`, preferring the idle worker named by `affinity`.
    pub fn exec(&self, affinity: &ThreadAffinity, job: Job) {
        let recorder = affinity.clone();
        let job: Job = Box::new(move || {
            if let Some(index) = Self::current_worker() {
                recorder.record(index);
            }
            job();
        });

        let job = match affinity_target(&self.workers, affinity) {
            Some(worker) => match worker.local.send(job) {
                Ok(()) => return,
                Err(err) => err.into_inner(),
            },
            None => job,
        };
        if self.injector.send(job).is_err() {
            debug!("Worker pool shut down, dropping job");
        }
    }
}

fn affinity_target<'w>(workers: &'w [Worker], affinity: &ThreadAffinity) -> Option<&'w Worker> {
    let worker = workers.get(affinity.preferred()?)?;
    worker
        .idle
        .compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
        .ok()
        .map(|_| worker)
}

fn run_worker(index: usize, own: Receiver<Job>, shared: Receiver<Job>, idle: Arc<AtomicBool>) {
    WORKER_INDEX.with(|slot| slot.set(Some(index)));
    trace!(worker = index, "Worker starting");

    loop {
        let job = select! {
            recv(own) -> msg => msg,
            recv(shared) -> msg => msg,
        };
        let Ok(job) = job else {
            break;
        };
        idle.store(false, Ordering::Release);
        job();
        idle.store(own.is_empty(), Ordering::Release);
    }

    trace!(worker = index, "Worker stopped");
}
