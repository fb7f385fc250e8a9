//! Worker pool error types.

use crate::script::ScriptError;
use crate::worker::WorkerId;
use thiserror::Error;

/// Errors surfaced by worker pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool has begun shutting down and accepts no new work.
    #[error("worker pool is shutting down")]
    ShuttingDown,

    /// The OS refused to spawn a worker thread.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),

    /// A worker's script host could not be created, or its initial
    /// script failed to run.
    #[error("worker {0} failed to initialize")]
    WorkerInit(WorkerId),

    /// A URL could not be reduced to an http(s) security origin.
    #[error("invalid origin URL: {0}")]
    BadOrigin(String),

    /// The script host rejected an operation.
    #[error(transparent)]
    Script(#[from] ScriptError),

    /// The calling thread is not registered with the pool.
    #[error("calling thread is not a pool worker")]
    NotAWorkerThread,

    /// Only child workers may install an error handler.
    #[error("the owning worker cannot set an error handler")]
    OwnerErrorHandler,
}
