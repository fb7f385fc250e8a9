//! Synchronous errors from the geolocation surface.

use thiserror::Error;

/// Failures reported directly from `get_current_position`, `watch_position`,
/// and friends. Anything that goes wrong later reaches script as a position
/// error callback instead.
#[derive(Debug, Error)]
pub enum GeolocationError {
    /// A fix option failed validation; the message names the option.
    #[error("{0}")]
    InvalidOptions(String),

    /// The id space for this kind of fix request is exhausted.
    #[error("Exceeded maximum number of fix requests.")]
    TooManyRequests,

    /// A live fix was required but no provider could be arranged.
    #[error("Fix request has no location providers.")]
    NoProviders,
}
