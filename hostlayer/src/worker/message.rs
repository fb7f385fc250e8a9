//! Message values passed between pool workers.

use crate::worker::SecurityOrigin;
use serde_json::{json, Value};

/// Index of a worker within its pool.
///
/// Ids are assigned in creation order and never reused for the lifetime
/// of the pool.
pub type WorkerId = usize;

/// The worker that created the pool. It is registered implicitly and is
/// the destination for unhandled child errors.
pub const OWNING_WORKER_ID: WorkerId = 0;

/// A queued cross-worker message.
#[derive(Debug, Clone)]
pub struct WorkerMessage {
    /// Message text supplied by the sender.
    pub text: String,
    /// Id of the sending worker.
    pub sender: WorkerId,
    /// Origin of the sending worker at the time of sending.
    pub origin: SecurityOrigin,
    /// Optional structured payload travelling alongside the text.
    pub body: Option<Value>,
}

impl WorkerMessage {
    /// The object form handed to message handlers as their third
    /// argument. `body` appears only when the sender supplied one.
    pub fn envelope(&self) -> Value {
        let mut envelope = json!({
            "text": self.text,
            "sender": self.sender,
            "origin": self.origin.as_url_string(),
        });
        if let Some(body) = &self.body {
            envelope["body"] = body.clone();
        }
        envelope
    }
}
