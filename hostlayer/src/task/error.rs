//! Error type for task lifecycle violations.

use thiserror::Error;

/// Errors from driving an [`crate::task::AsyncTask`] out of order.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// `init` was called twice.
    #[error("task is already initialized")]
    AlreadyInitialized,

    /// `start` was called before `init`.
    #[error("task has not been initialized")]
    NotInitialized,

    /// `start` was called twice.
    #[error("task was already started")]
    AlreadyStarted,

    /// The task thread could not be spawned.
    #[error("failed to spawn task thread: {0}")]
    Spawn(String),
}
