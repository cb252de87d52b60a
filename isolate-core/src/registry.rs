//! Isolate registry - reverse lookup from engine instance to isolate
//!
//! Engine callbacks only know which engine they fired on. The registry maps
//! an [`EngineId`] back to the isolate that owns it. It is process-wide and
//! lazily initialized on first use.
//!
//! # Performance Pattern: Read-Heavy RwLock
//! Lookups happen on every callback and every [`IsolateEnvironment::current`]
//! call; writes only at isolate creation and disposal.
//!
//! Entries hold weak references; an isolate is never kept alive by being
//! registered.

use crate::engine::EngineId;
use crate::isolate::{IsolateEnvironment, IsolateHolder};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock, Weak};
use tracing::trace;

static REGISTRY: OnceLock<IsolateRegistry> = OnceLock::new();

/// The process-wide registry.
pub fn registry() -> &'static IsolateRegistry {
    REGISTRY.get_or_init(IsolateRegistry::new)
}

#[derive(Debug, Default)]
pub struct IsolateRegistry {
    isolates: RwLock<HashMap<EngineId, Weak<IsolateEnvironment>>>,
}

impl IsolateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `env` under its engine id.
    pub fn insert(&self, id: EngineId, env: &Arc<IsolateEnvironment>) {
        let previous = self
            .isolates
            .write()
            .expect("registry lock poisoned during insert")
            .insert(id, Arc::downgrade(env));
        debug_assert!(
            previous.map_or(true, |weak| weak.strong_count() == 0),
            "engine registered twice"
        );
        trace!(isolate = %id, "Isolate registered");
    }

    pub fn remove(&self, id: EngineId) {
        self.isolates
            .write()
            .expect("registry lock poisoned during remove")
            .remove(&id);
        trace!(isolate = %id, "Isolate unregistered");
    }

    /// Holder of the isolate owning `id`. `None` once it was terminated or destroyed.
    pub fn lookup(&self, id: EngineId) -> Option<Arc<IsolateHolder>> {
        self.lookup_environment(id)?.holder()
    }

    /// The isolate owning `id`, while any strong reference to it remains.
    pub fn lookup_environment(&self, id: EngineId) -> Option<Arc<IsolateEnvironment>> {
        self.isolates
            .read()
            .expect("registry lock poisoned during lookup")
            .get(&id)
            .and_then(Weak::upgrade)
    }

    pub fn contains(&self, id: EngineId) -> bool {
        self.isolates
            .read()
            .expect("registry lock poisoned during contains")
            .contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.isolates
            .read()
            .expect("registry lock poisoned during len")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
