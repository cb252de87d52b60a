//! The handle callers keep to an isolate
//!
//! An [`IsolateHolder`] owns one strong reference to its isolate until the
//! isolate is terminated, after which [`IsolateHolder::get`] yields `None`.
//! Dropping the reference happens outside the holder's lock, since it may
//! run the isolate's destructor.

use super::IsolateEnvironment;
use crate::error::{IsolateError, Result};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

pub struct IsolateHolder {
    env: RwLock<Option<Arc<IsolateEnvironment>>>,
}

impl IsolateHolder {
    pub(crate) fn new(env: Arc<IsolateEnvironment>) -> Arc<Self> {
        Arc::new(Self {
            env: RwLock::new(Some(env)),
        })
    }

    /// The live isolate, or `None` once it was terminated.
    pub fn get(&self) -> Option<Arc<IsolateEnvironment>> {
        self.env.read().clone()
    }

    pub fn is_released(&self) -> bool {
        self.env.read().is_none()
    }

    /// Terminate the isolate this holder refers to.
    ///
    /// Releasing an already-released holder is a no-op.
    pub fn dispose(&self) -> Result<()> {
        match self.get() {
            Some(env) => env.terminate(),
            None => Ok(()),
        }
    }

    /// Give up the holder's reference.
    pub(crate) fn release(&self) {
        let env = self.env.write().take();
        drop(env);
    }

    /// Like [`get`](Self::get) but as an error for callers that need a live isolate.
    pub fn require(&self) -> Result<Arc<IsolateEnvironment>> {
        self.get().ok_or(IsolateError::Terminated)
    }
}

impl fmt::Debug for IsolateHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolateHolder")
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IsolateConfig, PlatformConfig};
    use crate::engine::{SimulatedEngine, SimulatedEngineFactory};
    use crate::host_loop;
    use crate::platform::Platform;

    #[test]
    fn test_dispose_terminates_and_releases() {
        let (handle, _driver) = host_loop::channel();
        let platform = Platform::new(PlatformConfig { worker_threads: 1 }, handle).unwrap();
        let factory = SimulatedEngineFactory::new();
        let holder =
            IsolateEnvironment::new(&platform, &factory, IsolateConfig::with_memory_limit(8))
                .unwrap();
        let engine = factory.last_created().unwrap();
        assert!(!holder.is_released());

        holder.dispose().unwrap();
        assert!(holder.is_released());
        assert!(holder.get().is_none());
        assert!(matches!(holder.require(), Err(IsolateError::Terminated)));
        // Last strong reference went with the holder
        assert!(engine.is_disposed());

        // Second dispose is a no-op
        holder.dispose().unwrap();
    }

    #[test]
    fn test_privileged_holder_cannot_dispose() {
        let (handle, _driver) = host_loop::channel();
        let platform = Platform::new(PlatformConfig { worker_threads: 1 }, handle).unwrap();
        let holder =
            IsolateEnvironment::new_privileged(&platform, Arc::new(SimulatedEngine::unconstrained()))
                .unwrap();
        assert!(matches!(holder.dispose(), Err(IsolateError::Privileged)));
        assert!(holder.require().is_ok());
    }
}
