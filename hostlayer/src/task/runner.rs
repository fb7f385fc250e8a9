//! Abortable background task runner.
//!
//! An [`AsyncTask`] owns one worker thread and one [`TaskContext`]. The body
//! runs on the worker thread and reports success by return value; the
//! listener hears about completion exactly once, after the task has reached
//! [`TaskState::Finished`]. Abort is a latch: it interrupts any in-flight
//! fetch and is visible to the body through the context, but the body itself
//! decides when to return.

use crate::http::{CookieSource, HttpTransportFactory};
use crate::task::{AbortHandle, TaskContext, TaskError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

static TASK_THREAD_SEQ: AtomicU64 = AtomicU64::new(0);

/// The work an [`AsyncTask`] performs on its thread.
///
/// Returns `true` on success. Implemented for any `FnMut(&TaskContext) ->
/// bool` closure.
pub trait TaskBody: Send + 'static {
    fn run(&mut self, ctx: &TaskContext) -> bool;
}

impl<F> TaskBody for F
where
    F: FnMut(&TaskContext) -> bool + Send + 'static,
{
    fn run(&mut self, ctx: &TaskContext) -> bool {
        self(ctx)
    }
}

/// Receives the completion notification for a task.
pub trait TaskListener: Send + Sync {
    fn task_complete(&self, success: bool);
}

/// Lifecycle phase of an [`AsyncTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskState {
    /// Constructed, not yet initialized.
    #[default]
    Created,
    /// Listener installed, ready to start.
    Initialized,
    /// Body running on the worker thread.
    Running,
    /// Body returned; the listener has been or is being notified.
    Finished,
}

struct TaskShared {
    state: Mutex<TaskState>,
    listener: Mutex<Option<Arc<dyn TaskListener>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// A single-use background task with an abort latch.
///
/// Lifecycle is strictly `new` then [`init`](AsyncTask::init) then
/// [`start`](AsyncTask::start); each transition is guarded and misuse
/// returns a [`TaskError`]. After start the owner either
/// [`wait`](AsyncTask::wait)s, or [`detach`](AsyncTask::detach)es to let the
/// body finish unobserved.
pub struct AsyncTask {
    shared: Arc<TaskShared>,
    context: Arc<TaskContext>,
}

impl AsyncTask {
    /// Creates a task whose fetches use the given transport factory and
    /// cookie source.
    pub fn new(
        transport_factory: Arc<dyn HttpTransportFactory>,
        cookies: Arc<dyn CookieSource>,
    ) -> Self {
        Self {
            shared: Arc::new(TaskShared {
                state: Mutex::new(TaskState::Created),
                listener: Mutex::new(None),
                thread: Mutex::new(None),
            }),
            context: Arc::new(TaskContext::new(transport_factory, cookies)),
        }
    }

    /// Installs the completion listener. Must be called exactly once, before
    /// [`start`](AsyncTask::start).
    pub fn init(&self, listener: Arc<dyn TaskListener>) -> Result<(), TaskError> {
        let mut state = self.shared.state.lock().unwrap();
        if *state != TaskState::Created {
            return Err(TaskError::AlreadyInitialized);
        }
        *self.shared.listener.lock().unwrap() = Some(listener);
        *state = TaskState::Initialized;
        Ok(())
    }

    /// Spawns the worker thread and runs `body` on it.
    ///
    /// The listener's `task_complete` fires on the worker thread after the
    /// state has moved to [`TaskState::Finished`], unless the task was
    /// detached first.
    pub fn start(&self, mut body: impl TaskBody) -> Result<(), TaskError> {
        {
            let mut state = self.shared.state.lock().unwrap();
            match *state {
                TaskState::Created => return Err(TaskError::NotInitialized),
                TaskState::Initialized => {}
                TaskState::Running | TaskState::Finished => {
                    return Err(TaskError::AlreadyStarted)
                }
            }
            *state = TaskState::Running;
        }

        let shared = Arc::clone(&self.shared);
        let context = Arc::clone(&self.context);
        let seq = TASK_THREAD_SEQ.fetch_add(1, Ordering::Relaxed);
        let handle = thread::Builder::new()
            .name(format!("async-task-{seq}"))
            .spawn(move || {
                let success = body.run(&context);
                *shared.state.lock().unwrap() = TaskState::Finished;
                debug!(success, "task body finished");
                // Clone out so a detach racing this notification sees either
                // the listener or nothing, never a poisoned lock.
                let listener = shared.listener.lock().unwrap().clone();
                if let Some(listener) = listener {
                    listener.task_complete(success);
                }
            })
            .map_err(|e| {
                *self.shared.state.lock().unwrap() = TaskState::Initialized;
                TaskError::Spawn(e.to_string())
            })?;
        *self.shared.thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Latches the abort flag and interrupts any in-flight fetch. Idempotent
    /// and non-blocking; safe to call from any thread, including before
    /// start.
    pub fn abort(&self) {
        self.context.abort_handle().abort();
    }

    /// Returns a handle that aborts this task from another thread.
    pub fn abort_handle(&self) -> AbortHandle {
        self.context.abort_handle()
    }

    /// Current lifecycle phase.
    pub fn state(&self) -> TaskState {
        *self.shared.state.lock().unwrap()
    }

    /// Whether the abort latch is set.
    pub fn is_aborted(&self) -> bool {
        self.context.is_aborted()
    }

    /// Blocks until the worker thread exits. Returns immediately if the task
    /// never started or was already waited on.
    pub fn wait(&self) {
        let handle = self.shared.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("task thread panicked");
            }
        }
    }

    /// Severs the listener and releases the thread handle, letting the body
    /// run to completion unobserved. No completion notification is delivered
    /// after this returns.
    pub fn detach(self) {
        self.shared.listener.lock().unwrap().take();
        self.shared.thread.lock().unwrap().take();
    }
}
