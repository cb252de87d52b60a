//! Two-flag barrier for bridging a blocked caller to another thread
//!
//! A caller that must block until both the isolate produced a result
//! (`ready`) and a cross-thread acknowledgment arrived (`wake`) registers an
//! [`AsyncWait`] with the isolate's scheduler and waits on it. The two
//! signals may arrive in either order.

use super::Scheduler;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
struct Flags {
    ready: bool,
    done: bool,
}

impl Flags {
    fn complete(&self) -> bool {
        self.ready && self.done
    }
}

/// The shared half of an [`AsyncWait`]
#[derive(Debug, Default)]
pub struct WaitBarrier {
    flags: Mutex<Flags>,
    cv: Condvar,
}

impl WaitBarrier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The result is available.
    pub fn ready(&self) {
        let mut flags = self.flags.lock();
        flags.ready = true;
        if flags.done {
            self.cv.notify_one();
        }
    }

    /// The acknowledgment arrived.
    pub fn wake(&self) {
        let mut flags = self.flags.lock();
        flags.done = true;
        if flags.ready {
            self.cv.notify_one();
        }
    }

    /// Block until both flags are set.
    pub fn wait(&self) {
        let mut flags = self.flags.lock();
        while !flags.complete() {
            self.cv.wait(&mut flags);
        }
    }

    /// Like [`wait`](Self::wait) with an upper bound. Returns `true` if both flags were set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut flags = self.flags.lock();
        if flags.complete() {
            return true;
        }
        // wait_while_for rechecks the predicate on spurious wakeups
        let _ = self
            .cv
            .wait_while_for(&mut flags, |flags| !flags.complete(), timeout);
        flags.complete()
    }

    pub fn is_complete(&self) -> bool {
        self.flags.lock().complete()
    }
}

/// A [`WaitBarrier`] registered with a scheduler for its lifetime
pub struct AsyncWait<'a> {
    scheduler: &'a Scheduler,
    barrier: Arc<WaitBarrier>,
}

impl<'a> AsyncWait<'a> {
    pub fn new(scheduler: &'a Scheduler) -> Self {
        let barrier = WaitBarrier::new();
        scheduler.lock().set_async_wait(Some(barrier.clone()));
        Self { scheduler, barrier }
    }

    pub fn barrier(&self) -> &Arc<WaitBarrier> {
        &self.barrier
    }

    pub fn ready(&self) {
        self.barrier.ready();
    }

    pub fn wake(&self) {
        self.barrier.wake();
    }

    pub fn wait(&self) {
        self.barrier.wait();
    }
}

impl Drop for AsyncWait<'_> {
    fn drop(&mut self) {
        self.scheduler.lock().set_async_wait(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_wait_needs_both_flags() {
        let barrier = WaitBarrier::new();
        barrier.ready();
        assert!(!barrier.wait_timeout(Duration::from_millis(20)));
        barrier.wake();
        assert!(barrier.wait_timeout(Duration::from_millis(20)));
        barrier.wait();
    }

    #[test]
    fn test_signals_in_either_order() {
        for wake_first in [true, false] {
            let barrier = WaitBarrier::new();
            let remote = barrier.clone();
            let signaller = thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                if wake_first {
                    remote.wake();
                    remote.ready();
                } else {
                    remote.ready();
                    remote.wake();
                }
            });
            barrier.wait();
            assert!(barrier.is_complete());
            signaller.join().unwrap();
        }
    }

    #[test]
    fn test_registration_lifetime() {
        let scheduler = Scheduler::new();
        {
            let wait = AsyncWait::new(&scheduler);
            let registered = scheduler.lock().async_wait().unwrap();
            assert!(Arc::ptr_eq(&registered, wait.barrier()));
            registered.ready();
            registered.wake();
            wait.wait();
        }
        assert!(scheduler.lock().async_wait().is_none());
    }
}
