//! Tunables for the fix arbitrator.

use std::time::Duration;

/// Network provider used when a request does not name its own.
pub const DEFAULT_PROVIDER_URL: &str = "https://www.google.com/loc/json";

/// Behavior knobs for [`Geolocation`](super::Geolocation).
#[derive(Debug, Clone)]
pub struct GeolocationConfig {
    /// Network provider URL applied when a request leaves the list unset.
    pub default_provider_url: String,
    /// Floor on the spacing between success callbacks of a watch.
    pub minimum_callback_interval: Duration,
    /// Age beyond which a known fix no longer beats a fresh one on recency.
    pub maximum_fix_age: Duration,
}

impl Default for GeolocationConfig {
    fn default() -> Self {
        Self {
            default_provider_url: DEFAULT_PROVIDER_URL.to_string(),
            minimum_callback_interval: Duration::from_secs(1),
            maximum_fix_age: Duration::from_secs(60),
        }
    }
}

impl GeolocationConfig {
    pub fn with_default_provider_url(mut self, url: impl Into<String>) -> Self {
        self.default_provider_url = url.into();
        self
    }

    pub fn with_minimum_callback_interval(mut self, interval: Duration) -> Self {
        self.minimum_callback_interval = interval;
        self
    }

    pub fn with_maximum_fix_age(mut self, age: Duration) -> Self {
        self.maximum_fix_age = age;
        self
    }
}
