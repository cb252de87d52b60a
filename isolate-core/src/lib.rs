//! Isolate Core - resource-bounded script isolates
//!
//! This crate hosts many independent script-engine instances ("isolates") in
//! one process. It owns the parts around the engine:
//!
//! - isolate lifecycle, termination and destruction ([`isolate`]),
//! - per-isolate scheduling of tasks and interrupts onto a shared worker
//!   pool or the host event loop ([`scheduler`], [`platform`]),
//! - the engine lock and CPU/wall-time accounting ([`executor`]),
//! - the memory governor enforcing each isolate's budget ([`isolate::governor`]),
//! - reverse lookup from engine instance to isolate ([`registry`]).
//!
//! The engine itself sits behind the [`engine::Engine`] trait.
//! [`engine::SimulatedEngine`] implements it in-process for the demo binary
//! and the tests.
//!
//! # Design Goals:
//! - At most one thread runs an isolate at a time, and queued work is never lost
//! - CPU time excludes time an isolate spent waiting or yielding
//! - A sandboxed isolate can never take down the host process by exhausting memory
//! - No global platform; every isolate is handed its [`Platform`] explicitly

pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod host_loop;
pub mod isolate;
pub mod metrics;
pub mod platform;
pub mod registry;
pub mod scheduler;

pub use config::{HeapPolicy, IsolateConfig, PlatformConfig};
pub use engine::{Engine, EngineFactory, EngineHooks, EngineId, SimulatedEngine, SimulatedEngineFactory};
pub use error::{HandleId, IsolateError};
pub use executor::{Executor, Lock, Scope};
pub use isolate::{HeapCheck, IsolateEnvironment, IsolateHolder, LifecycleState};
pub use metrics::{MetricsSnapshot, PlatformMetrics};
pub use platform::Platform;
pub use scheduler::{HandleTask, Interrupt, Scheduler, SyncInterrupt, Task};

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Install the tracing subscriber. `RUST_LOG` overrides the default `info` filter.
pub fn init() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    info!("Initializing isolate core v{}", env!("CARGO_PKG_VERSION"));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_once() {
        assert!(init().is_ok());
        // A second subscriber cannot be installed
        assert!(init().is_err());
    }
}
