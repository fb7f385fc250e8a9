//! Script worker pool with cross-worker messaging.
//!
//! A [`WorkerPool`] hosts isolated script workers, each with its own thread
//! and its own [`crate::script::ScriptHost`]. The thread that creates the
//! pool is registered as worker 0, the owning worker; further workers are
//! created from script source or from a URL fetched on the new worker's own
//! thread.
//!
//! Messaging is send-only and queued: [`WorkerPool::send_message`] enqueues
//! for the destination, whose thread invokes its `onmessage` callback with
//! the text, the sender id, and a message envelope carrying the sender's
//! [`SecurityOrigin`]. Workers never share state; everything crosses as
//! values.
//!
//! Errors follow a two-stage chain. An error in a child worker goes to that
//! worker's `onerror` callback first; if there is none, or it returns a
//! falsy verdict, the error is queued for the owning worker and surfaces
//! through its host's `report_error`, prefixed with the source worker's id.

mod error;
mod message;
mod origin;
mod pool;

pub use error::PoolError;
pub use message::{WorkerId, WorkerMessage, OWNING_WORKER_ID};
pub use origin::SecurityOrigin;
pub use pool::{ScriptHostFactory, WorkerPool, WorkerScope, WorkerSource};
