//! Host event loop - the thread that drives the privileged isolate
//!
//! The host loop is an external collaborator; the core only needs a
//! cross-thread wake primitive whose callback runs on the loop's own thread,
//! and a way to say whether pending work should keep the loop alive.
//! [`HostLoop`] is that seam. [`LoopHandle`]/[`LoopDriver`] implement it on a
//! tokio runtime: the driver is awaited on the owning thread and calls back
//! into the [`Platform`] whenever the handle is signalled.
//!
//! `send` may be called from any thread. `set_active` may only be called on
//! the loop thread; other threads signal instead and let the loop reconcile.

use crate::error::{IsolateError, Result};
use crate::platform::Platform;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Cross-thread notification handle registered with the host loop
pub trait HostLoop: Send + Sync {
    /// Wake the loop; it calls [`Platform::on_host_wake`] on its own thread.
    fn send(&self);

    /// Keep the loop alive (`true`) or let it exit once idle. Loop thread only.
    fn set_active(&self, active: bool);

    /// Returns `true` when called on the thread that owns the loop.
    fn is_loop_thread(&self) -> bool;
}

/// Tokio-backed [`HostLoop`]
#[derive(Debug)]
pub struct LoopHandle {
    notify: Notify,
    pending: AtomicBool,
    active: AtomicBool,
    owner: ThreadId,
}

impl LoopHandle {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl HostLoop for LoopHandle {
    fn send(&self) {
        self.pending.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn set_active(&self, active: bool) {
        debug_assert!(self.is_loop_thread(), "set_active called off the loop thread");
        trace!(active, "Host loop handle toggled");
        self.active.store(active, Ordering::Release);
    }

    fn is_loop_thread(&self) -> bool {
        thread::current().id() == self.owner
    }
}

/// Drives a [`LoopHandle`] from the thread that created it
#[derive(Debug)]
pub struct LoopDriver {
    handle: Arc<LoopHandle>,
}

/// Create a loop handle owned by the calling thread, plus its driver.
pub fn channel() -> (Arc<LoopHandle>, LoopDriver) {
    let handle = Arc::new(LoopHandle {
        notify: Notify::new(),
        pending: AtomicBool::new(false),
        active: AtomicBool::new(false),
        owner: thread::current().id(),
    });
    let driver = LoopDriver {
        handle: handle.clone(),
    };
    (handle, driver)
}

impl LoopDriver {
    pub fn handle(&self) -> &Arc<LoopHandle> {
        &self.handle
    }

    /// Service wake-ups until the handle is inactive and nothing is pending.
    ///
    /// Must be awaited on the owning thread, e.g. from a current-thread runtime.
    pub async fn run(&self, platform: &Platform) -> Result<()> {
        if !self.handle.is_loop_thread() {
            return Err(IsolateError::ForeignThread);
        }
        debug!("Host loop running");
        loop {
            if self.handle.pending.swap(false, Ordering::AcqRel) {
                platform.on_host_wake();
                continue;
            }
            if !self.handle.is_active() {
                break;
            }
            self.handle.notify.notified().await;
        }
        debug!("Host loop idle, exiting");
        Ok(())
    }
}
