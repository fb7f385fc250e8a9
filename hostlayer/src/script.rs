//! Host-side scripting surface.
//!
//! The library never embeds a script engine of its own. Instead it drives the
//! embedder's engine through [`ScriptHost`]: worker bodies are evaluated with
//! [`ScriptHost::run`], and registered callbacks are invoked by reference with
//! [`ScriptHost::invoke`]. Values crossing the boundary are plain
//! [`serde_json::Value`]s.
//!
//! Each worker owns exactly one host instance, created on the worker's thread,
//! and all calls into a given host happen on that thread.

use serde_json::Value;
use thiserror::Error;

/// Errors surfaced by a script host.
#[derive(Debug, Clone, Error)]
pub enum ScriptError {
    /// Evaluating script source failed (syntax error or uncaught exception).
    #[error("script evaluation failed: {0}")]
    Evaluation(String),

    /// Invoking a registered callback failed.
    #[error("callback invocation failed: {0}")]
    Callback(String),

    /// The callback reference does not name a live callback.
    #[error("unknown callback reference")]
    UnknownCallback,

    /// The host could not be created for this worker.
    #[error("script host creation failed: {0}")]
    Creation(String),
}

/// Opaque reference to a callback registered inside a script host.
///
/// The embedder mints these when script code hands it a function (an
/// `onmessage` handler, a position callback) and resolves them again in
/// [`ScriptHost::invoke`]. The library only stores and compares them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackRef(u64);

impl CallbackRef {
    /// Creates a callback reference from an embedder-assigned id.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the embedder-assigned id.
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for CallbackRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "callback#{}", self.0)
    }
}

/// A script engine instance owned by one worker.
///
/// Implementations wrap whatever engine the embedder uses. The library calls
/// `run` once per worker to evaluate the worker body, then `invoke` for each
/// message or position callback. `report_error` receives errors that no
/// script-level handler consumed.
pub trait ScriptHost: Send + Sync {
    /// Evaluates worker source code.
    ///
    /// Returns an error when the source fails to compile or throws an
    /// uncaught exception at top level.
    fn run(&self, source: &str) -> Result<(), ScriptError>;

    /// Invokes a registered callback with the given arguments.
    ///
    /// The returned value is used where the caller cares about the handler's
    /// verdict (an error handler returning a truthy value marks the error
    /// handled).
    fn invoke(&self, callback: &CallbackRef, args: &[Value]) -> Result<Value, ScriptError>;

    /// Surfaces an error that no handler consumed.
    ///
    /// For the owning worker this is the end of the error chain; the
    /// embedder typically raises it as a global script error.
    fn report_error(&self, message: &str);
}

/// Truthiness of a script value, following script-language conventions.
///
/// `null`, `false`, numeric zero, and `""` are falsy; every other value,
/// including empty arrays and objects, is truthy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
