//! Error type for HTTP transports and fetches.

use thiserror::Error;

/// Errors produced while performing an HTTP fetch.
#[derive(Debug, Clone, Error)]
pub enum HttpError {
    /// The underlying HTTP client could not be created.
    #[error("Failed to create HTTP client: {0}")]
    Client(String),

    /// A transport-level failure: connection refused, DNS, timeout.
    #[error("request failed: {0}")]
    Transport(String),

    /// The transport was driven out of order (e.g. send before open).
    #[error("invalid request state: {0}")]
    InvalidState(&'static str),

    /// The fetch was aborted before completion.
    #[error("request was aborted")]
    Aborted,

    /// A required-cookie precondition was not met.
    #[error("Required cookie is not present")]
    CookieMissing,
}
