//! Network location provider daemon.
//!
//! One worker thread per provider owns the request lifecycle: it fires a
//! lookup as soon as the thread starts, fires again on refresh hints or for
//! a listener that arrives before any result exists, and keeps the most
//! recent outcome cached for [`LocationProvider::last_result`]. Listeners
//! hear about every completed lookup, failures included.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use super::position::{Position, PositionResult};
use super::provider::{ListenerSet, LocationProvider, ProviderId, ProviderListener};
use super::request::{LocationResponseListener, NetworkLocationRequest};
use crate::http::{CookieSource, HttpTransportFactory};
use crate::sync::Event;

/// Upper bound on one wait cycle of the provider thread.
const IDLE_WAIT: Duration = Duration::from_millis(500);

#[derive(Default)]
struct DaemonFlags {
    shutdown: bool,
    refresh_requested: bool,
    request_complete: bool,
    listener_waiting: bool,
}

struct Shared {
    id: ProviderId,
    listeners: ListenerSet,
    wakeup: Event,
    flags: Mutex<DaemonFlags>,
    last_result: Mutex<Option<PositionResult>>,
    transport_factory: Arc<dyn HttpTransportFactory>,
    cookies: Arc<dyn CookieSource>,
    url: String,
    host: String,
    address_language: String,
    request_address: bool,
}

/// Bridges request outcomes back into the provider.
struct ResponseBridge {
    shared: Arc<Shared>,
}

impl LocationResponseListener for ResponseBridge {
    fn response_available(&self, result: PositionResult) {
        *self.shared.last_result.lock().unwrap() = Some(result);
        self.shared.flags.lock().unwrap().request_complete = true;
        self.shared.wakeup.signal();
        self.shared.listeners.notify_update(self.shared.id);
    }
}

/// Fix source backed by a network location server.
pub struct NetworkLocationProvider {
    id: ProviderId,
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkLocationProvider {
    /// Spawns the provider daemon; the initial lookup fires immediately.
    pub fn start(
        transport_factory: Arc<dyn HttpTransportFactory>,
        cookies: Arc<dyn CookieSource>,
        url: String,
        host: String,
        address_language: String,
        request_address: bool,
    ) -> std::io::Result<Arc<Self>> {
        let id = ProviderId::next();
        let shared = Arc::new(Shared {
            id,
            listeners: ListenerSet::new(),
            wakeup: Event::new(),
            flags: Mutex::new(DaemonFlags::default()),
            last_result: Mutex::new(None),
            transport_factory,
            cookies,
            url,
            host,
            address_language,
            request_address,
        });
        let daemon = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(format!("net-location-{id}"))
            .spawn(move || provider_main(daemon))?;
        debug!(provider = %id, url = %shared.url, "network location provider started");
        Ok(Arc::new(Self {
            id,
            shared,
            thread: Mutex::new(Some(thread)),
        }))
    }
}

impl LocationProvider for NetworkLocationProvider {
    fn id(&self) -> ProviderId {
        self.id
    }

    fn add_listener(&self, listener: Arc<dyn ProviderListener>) {
        let cached = self.shared.last_result.lock().unwrap().is_some();
        self.shared.listeners.add(Arc::clone(&listener));
        if cached {
            // A late registrant hears about the cached result right away.
            listener.location_updated(self.id);
        } else {
            self.shared.flags.lock().unwrap().listener_waiting = true;
            self.shared.wakeup.signal();
        }
    }

    fn remove_listener(&self, listener: &Arc<dyn ProviderListener>) -> bool {
        self.shared.listeners.remove(listener)
    }

    fn request_refresh(&self) {
        self.shared.flags.lock().unwrap().refresh_requested = true;
        self.shared.wakeup.signal();
    }

    fn last_result(&self) -> Option<PositionResult> {
        self.shared.last_result.lock().unwrap().clone()
    }

    fn stop(&self) {
        self.shared.flags.lock().unwrap().shutdown = true;
        self.shared.wakeup.signal();
        let handle = self.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(provider = %self.id, "network location provider thread panicked");
            }
            debug!(provider = %self.id, "network location provider stopped");
        }
    }
}

impl Drop for NetworkLocationProvider {
    fn drop(&mut self) {
        self.stop();
    }
}

enum Step {
    Fetch,
    Reap,
    Stop,
    Wait,
}

fn provider_main(shared: Arc<Shared>) {
    let mut in_flight: Option<NetworkLocationRequest> = None;
    // The first fix is fetched without being asked.
    let mut fetch_wanted = true;

    loop {
        let step = {
            let mut flags = shared.flags.lock().unwrap();
            if flags.shutdown {
                Step::Stop
            } else if flags.request_complete {
                flags.request_complete = false;
                Step::Reap
            } else if in_flight.is_none()
                && (fetch_wanted || flags.refresh_requested || flags.listener_waiting)
            {
                flags.refresh_requested = false;
                flags.listener_waiting = false;
                Step::Fetch
            } else {
                Step::Wait
            }
        };

        match step {
            Step::Stop => {
                if let Some(request) = in_flight.take() {
                    request.stop_and_detach();
                }
                break;
            }
            Step::Reap => {
                // The request already delivered; this just winds its thread
                // down.
                if let Some(request) = in_flight.take() {
                    request.stop_and_detach();
                }
            }
            Step::Fetch => {
                fetch_wanted = false;
                let mut request = NetworkLocationRequest::new(
                    Arc::clone(&shared.transport_factory),
                    Arc::clone(&shared.cookies),
                    shared.url.clone(),
                    shared.host.clone(),
                    shared.address_language.clone(),
                    shared.request_address,
                );
                let bridge = Arc::new(ResponseBridge {
                    shared: Arc::clone(&shared),
                });
                match request.start(last_good(&shared).as_ref(), bridge) {
                    Ok(()) => in_flight = Some(request),
                    Err(error) => {
                        warn!(provider = %shared.id, %error, "location request failed to start")
                    }
                }
            }
            Step::Wait => {
                shared.wakeup.wait_timeout(IDLE_WAIT);
            }
        }
    }
    debug!(provider = %shared.id, "provider daemon exiting");
}

/// Last good fix, used to seed the next lookup.
fn last_good(shared: &Shared) -> Option<Position> {
    match shared.last_result.lock().unwrap().as_ref() {
        Some(Ok(position)) => Some(position.clone()),
        _ => None,
    }
}
