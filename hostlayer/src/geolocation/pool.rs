//! Provider sharing across concurrent fix requests.
//!
//! Providers are expensive (each network provider runs a daemon thread), so
//! requests that resolve to the same [`ProviderKey`] share one instance. The
//! pool counts registrations per key and stops the provider when the last
//! one goes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use super::network::NetworkLocationProvider;
use super::provider::{LocationProvider, ProviderListener};
use crate::http::{CookieSource, HttpTransportFactory};

/// Identity of a provider in the pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProviderKey {
    /// Device GPS.
    Gps,
    /// Network lookup against `url`, on behalf of `host`, with addresses in
    /// `language`.
    Network {
        url: String,
        host: String,
        language: String,
    },
    /// Test double.
    Mock,
}

/// Creates providers on first registration.
///
/// `None` means the key is unavailable in this embedding; registration then
/// simply yields no provider.
pub trait ProviderFactory: Send + Sync {
    fn create(
        &self,
        key: &ProviderKey,
        request_address: bool,
    ) -> Option<Arc<dyn LocationProvider>>;
}

struct PoolEntry {
    provider: Arc<dyn LocationProvider>,
    registrations: usize,
}

/// Refcounted registry of live providers, keyed by [`ProviderKey`].
pub struct LocationProviderPool {
    factory: Arc<dyn ProviderFactory>,
    entries: Mutex<HashMap<ProviderKey, PoolEntry>>,
}

impl LocationProviderPool {
    pub fn new(factory: Arc<dyn ProviderFactory>) -> Self {
        Self {
            factory,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Attaches `listener` to the provider for `key`, creating the provider
    /// on first use. `request_address` only influences creation; later
    /// registrants share whatever the first one asked for.
    pub fn register(
        &self,
        key: ProviderKey,
        request_address: bool,
        listener: Arc<dyn ProviderListener>,
    ) -> Option<Arc<dyn LocationProvider>> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&key) {
            entry.registrations += 1;
            entry.provider.add_listener(listener);
            return Some(Arc::clone(&entry.provider));
        }
        let provider = self.factory.create(&key, request_address)?;
        debug!(?key, provider = %provider.id(), "provider created");
        provider.add_listener(listener);
        entries.insert(
            key,
            PoolEntry {
                provider: Arc::clone(&provider),
                registrations: 1,
            },
        );
        Some(provider)
    }

    /// Detaches `listener` from `provider`, stopping and dropping the
    /// provider when its last registration goes. False when the provider is
    /// not pooled here.
    pub fn unregister(
        &self,
        provider: &Arc<dyn LocationProvider>,
        listener: &Arc<dyn ProviderListener>,
    ) -> bool {
        let released = {
            let mut entries = self.entries.lock().unwrap();
            let Some(key) = entries
                .iter()
                .find(|(_, entry)| Arc::ptr_eq(&entry.provider, provider))
                .map(|(key, _)| key.clone())
            else {
                return false;
            };
            provider.remove_listener(listener);
            let Some(entry) = entries.get_mut(&key) else {
                return false;
            };
            entry.registrations -= 1;
            if entry.registrations == 0 {
                debug!(?key, "provider released");
                entries.remove(&key).map(|entry| entry.provider)
            } else {
                None
            }
        };
        // Stopping joins provider threads, so it happens outside the lock.
        if let Some(provider) = released {
            provider.stop();
        }
        true
    }

    /// Number of live providers.
    pub fn provider_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

/// Factory for real providers. Network keys spawn
/// [`NetworkLocationProvider`]s; GPS and mock keys are unavailable.
pub struct DefaultProviderFactory {
    transport_factory: Arc<dyn HttpTransportFactory>,
    cookies: Arc<dyn CookieSource>,
}

impl DefaultProviderFactory {
    pub fn new(
        transport_factory: Arc<dyn HttpTransportFactory>,
        cookies: Arc<dyn CookieSource>,
    ) -> Self {
        Self {
            transport_factory,
            cookies,
        }
    }
}

impl ProviderFactory for DefaultProviderFactory {
    fn create(
        &self,
        key: &ProviderKey,
        request_address: bool,
    ) -> Option<Arc<dyn LocationProvider>> {
        let ProviderKey::Network {
            url,
            host,
            language,
        } = key
        else {
            return None;
        };
        match NetworkLocationProvider::start(
            Arc::clone(&self.transport_factory),
            Arc::clone(&self.cookies),
            url.clone(),
            host.clone(),
            language.clone(),
            request_address,
        ) {
            Ok(provider) => {
                let provider: Arc<dyn LocationProvider> = provider;
                Some(provider)
            }
            Err(error) => {
                warn!(url = %url, %error, "network provider failed to start");
                None
            }
        }
    }
}
