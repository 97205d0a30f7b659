//! Error types for the async command manager.

use uuid::Uuid;

use crate::plugin::PluginKind;

/// Errors raised by the registry, the scheduler and the plugins.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Script engine not registered: {0}")]
    NotRegistered(String),

    #[error("{kind} check failed: {reason}")]
    CheckFailed { kind: PluginKind, reason: String },

    #[error("Malformed persisted data at index {index}: {reason}")]
    MalformedData { index: usize, reason: String },

    #[error("Timed out acquiring registry lock")]
    LockTimeout,

    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("Scene module not available: {0}")]
    ModuleUnavailable(&'static str),

    #[error("Scene module error: {0}")]
    Module(#[from] ModuleError),

    #[error("Script engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Failed to spawn scheduler thread: {0}")]
    SpawnFailed(#[from] std::io::Error),

    #[error("Scheduler thread panicked")]
    ThreadPanic,
}

impl Error {
    pub(crate) fn malformed(index: usize, reason: impl Into<String>) -> Self {
        Self::MalformedData {
            index,
            reason: reason.into(),
        }
    }

    pub(crate) fn check_failed(kind: PluginKind, reason: impl ToString) -> Self {
        Self::CheckFailed {
            kind,
            reason: reason.to_string(),
        }
    }
}

/// Errors a script engine reports when it cannot accept an event.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("Script not found: {0}")]
    ScriptNotFound(Uuid),

    #[error("Event queue full for script {0}")]
    QueueFull(Uuid),

    #[error("Event rejected: {0}")]
    Rejected(String),
}

/// Errors reported by scene modules (HTTP, XML-RPC, world comms).
#[derive(Debug, Clone, thiserror::Error)]
pub enum ModuleError {
    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Module shut down")]
    ShutDown,
}

/// Result type for async command operations
pub type Result<T> = std::result::Result<T, Error>;
