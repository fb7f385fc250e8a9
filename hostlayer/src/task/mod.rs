//! Abortable background tasks with pumped HTTP fetches.
//!
//! An [`AsyncTask`] runs a [`TaskBody`] on its own thread. The body performs
//! blocking work and issues HTTP fetches through its [`TaskContext`]; every
//! fetch is pumped against an abort latch, so [`AsyncTask::abort`] from any
//! thread interrupts an in-flight request promptly.
//!
//! Lifecycle: `new` → `init(listener)` → `start(body)` → (`abort`) →
//! `wait` or `detach`. `detach` consumes the handle and severs the listener
//! synchronously; the thread finishes on its own and nobody is notified.

mod context;
mod error;
mod runner;

pub use context::{AbortHandle, FetchOptions, TaskContext};
pub use error::TaskError;
pub use runner::{AsyncTask, TaskBody, TaskListener, TaskState};
