//! Provider abstraction and listener plumbing.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::position::PositionResult;

static NEXT_PROVIDER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a provider instance, stable for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProviderId(u64);

impl ProviderId {
    /// Mints a fresh id.
    pub fn next() -> Self {
        Self(NEXT_PROVIDER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value, for thread names and logs.
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Receives fix notifications from a provider.
///
/// Calls arrive on provider-internal threads; implementations forward to
/// wherever the receiving component drains its events.
pub trait ProviderListener: Send + Sync {
    /// The provider has a new result; fetch it with
    /// [`LocationProvider::last_result`].
    fn location_updated(&self, provider: ProviderId);

    /// The device moved far enough to matter.
    fn movement_detected(&self, provider: ProviderId);
}

/// A source of position fixes.
pub trait LocationProvider: Send + Sync {
    fn id(&self) -> ProviderId;

    /// Attaches a listener. Repeated adds of the same listener nest and must
    /// be matched by removes.
    fn add_listener(&self, listener: Arc<dyn ProviderListener>);

    /// Detaches one nesting level; true when the listener was found.
    fn remove_listener(&self, listener: &Arc<dyn ProviderListener>) -> bool;

    /// Hints that a fresh fix would be welcome soon.
    fn request_refresh(&self);

    /// Most recent result, if any attempt has completed yet.
    fn last_result(&self) -> Option<PositionResult>;

    /// Stops background work; no notifications may be delivered afterwards.
    fn stop(&self);
}

/// Reference-counted listener registry shared by provider implementations.
///
/// Each distinct listener is notified once per event no matter how many
/// registrations it holds.
#[derive(Default)]
pub struct ListenerSet {
    entries: Mutex<Vec<(Arc<dyn ProviderListener>, usize)>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn ProviderListener>) {
        let mut entries = self.entries.lock().unwrap();
        if let Some((_, count)) = entries
            .iter_mut()
            .find(|(existing, _)| Arc::ptr_eq(existing, &listener))
        {
            *count += 1;
        } else {
            entries.push((listener, 1));
        }
    }

    pub fn remove(&self, listener: &Arc<dyn ProviderListener>) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let Some(index) = entries
            .iter()
            .position(|(existing, _)| Arc::ptr_eq(existing, listener))
        else {
            return false;
        };
        entries[index].1 -= 1;
        if entries[index].1 == 0 {
            entries.remove(index);
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    pub fn notify_update(&self, provider: ProviderId) {
        for listener in self.snapshot() {
            listener.location_updated(provider);
        }
    }

    pub fn notify_movement(&self, provider: ProviderId) {
        for listener in self.snapshot() {
            listener.movement_detected(provider);
        }
    }

    // Callbacks run outside the entries lock.
    fn snapshot(&self) -> Vec<Arc<dyn ProviderListener>> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|(listener, _)| Arc::clone(listener))
            .collect()
    }
}
