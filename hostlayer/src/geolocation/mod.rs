//! Position fixes for script callers.
//!
//! The entry point is [`Geolocation`]: scripts ask it for a one-off fix with
//! [`get_current_position`](Geolocation::get_current_position) or a standing
//! one with [`watch_position`](Geolocation::watch_position), and results come
//! back through script callbacks as JSON values. Providers that can produce
//! fixes live behind [`LocationProvider`]; the only concrete one here is
//! [`NetworkLocationProvider`], which posts requests to a web service over a
//! JSON location protocol. Identical provider configurations are
//! shared across requests through a [`LocationProviderPool`].
//!
//! The arbitrator between requests and providers is single-threaded: provider
//! daemons and timers hand it events over a message bus, and the owning
//! thread drains them with [`pump`](Geolocation::pump). The best position
//! seen survives restarts through a [`PositionStore`].

mod arbitrator;
mod config;
mod error;
mod network;
mod options;
mod pool;
mod position;
mod provider;
mod request;
mod store;

pub use arbitrator::{FixId, Geolocation};
pub use config::{GeolocationConfig, DEFAULT_PROVIDER_URL};
pub use error::GeolocationError;
pub use network::NetworkLocationProvider;
pub use options::{FixOptions, MaximumAge};
pub use pool::{DefaultProviderFactory, LocationProviderPool, ProviderFactory, ProviderKey};
pub use position::{
    is_more_accurate, is_more_timely, is_movement, now_ms, Address, Position, PositionError,
    PositionErrorCode, PositionResult,
};
pub use provider::{ListenerSet, LocationProvider, ProviderId, ProviderListener};
pub use request::{LocationResponseListener, NetworkLocationRequest};
pub use store::{
    FilePositionStore, MemoryPositionStore, PositionStore, StoreError, LAST_POSITION_KEY,
};

#[cfg(test)]
pub use provider::tests::MockProvider;
