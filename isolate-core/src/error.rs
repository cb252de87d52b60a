//! Error types for isolate-core
//!
//! Errors are scoped to the isolate that produced them. Resource and script
//! errors never leak into sibling isolates or the host loop; contract
//! violations are surfaced synchronously to the calling code path.

use std::fmt;
use thiserror::Error;

/// Identity of a native handle that owns a weak-cleanup callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub usize);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Errors that can occur while running or managing an isolate
#[derive(Error, Debug)]
pub enum IsolateError {
    /// The isolate exceeded its memory budget and was terminated
    #[error("Isolate was disposed during execution due to memory limit")]
    MemoryLimit,

    /// The isolate was terminated and no longer accepts work
    #[error("Isolate is disposed")]
    Terminated,

    /// An unhandled promise rejection was re-raised into the isolate
    #[error("Uncaught promise rejection: {0}")]
    Script(String),

    /// `add_weak_callback` was called twice for the same handle
    #[error("Weak callback already added for handle {0}")]
    WeakCallbackExists(HandleId),

    /// `remove_weak_callback` was called for a handle that was never added
    #[error("Weak callback doesn't exist for handle {0}")]
    WeakCallbackMissing(HandleId),

    /// The operation is not permitted on the privileged isolate
    #[error("Operation is not permitted on the privileged isolate")]
    Privileged,

    /// A privileged isolate was already installed on this platform
    #[error("A privileged isolate is already installed on this platform")]
    PrivilegedExists,

    /// The requested memory limit is outside the supported range
    #[error("Memory limit must be between {min} and {max} MB, got {requested} MB")]
    InvalidMemoryLimit {
        min: usize,
        max: usize,
        requested: usize,
    },

    /// The embedded engine failed to create an execution context
    #[error("Engine error: {0}")]
    Engine(String),

    /// The host loop was driven from a thread other than its owner
    #[error("Host loop must be driven from the thread that created it")]
    ForeignThread,

    /// A worker thread could not be spawned
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// Configuration could not be parsed
    #[error("Invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}

impl IsolateError {
    /// Create an engine error from any message
    pub fn engine(message: impl Into<String>) -> Self {
        Self::Engine(message.into())
    }

    /// Returns `true` for errors that end the isolate for good.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::MemoryLimit | Self::Terminated)
    }

    /// Returns `true` for bugs in the integrating code rather than runtime conditions.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::WeakCallbackExists(_)
                | Self::WeakCallbackMissing(_)
                | Self::Privileged
                | Self::PrivilegedExists
                | Self::ForeignThread
        )
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, IsolateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_limit_message() {
        assert_eq!(
            IsolateError::MemoryLimit.to_string(),
            "Isolate was disposed during execution due to memory limit"
        );
    }

    #[test]
    fn test_classification() {
        assert!(IsolateError::MemoryLimit.is_fatal());
        assert!(!IsolateError::Script("boom".into()).is_fatal());
        assert!(IsolateError::WeakCallbackExists(HandleId(1)).is_contract_violation());
        assert!(IsolateError::WeakCallbackMissing(HandleId(1)).is_contract_violation());
        assert!(!IsolateError::Terminated.is_contract_violation());
    }

    #[test]
    fn test_handle_id_display() {
        assert_eq!(HandleId(255).to_string(), "0xff");
    }
}
