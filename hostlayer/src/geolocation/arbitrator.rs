//! Fix request arbitration.
//!
//! [`Geolocation`] owns every live fix request, shares providers between
//! them through the [`LocationProviderPool`], and decides which provider
//! updates become script callbacks. Providers and timers report from their
//! own threads onto an internal event bus; the owning thread drains it with
//! [`pump`](Geolocation::pump), so callbacks only ever run there and never
//! synchronously inside a request call.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::config::GeolocationConfig;
use super::error::GeolocationError;
use super::options::{FixOptions, MaximumAge};
use super::pool::{LocationProviderPool, ProviderKey};
use super::position::{
    is_more_accurate, is_more_timely, is_movement, Position, PositionError, PositionErrorCode,
    PositionResult,
};
use super::provider::{LocationProvider, ProviderId, ProviderListener};
use super::store::{PositionStore, LAST_POSITION_KEY};
use crate::bus::{MessageBus, Subscriber, TimerHandle, TimerId, TimerScheduler};
use crate::script::{CallbackRef, ScriptHost};

const GEO_TOPIC: &str = "geolocation";

/// Identifier of a fix request: positive for watches, negative for
/// one-shots.
pub type FixId = i32;

#[derive(Debug, Clone)]
enum GeoEvent {
    LocationUpdate { provider: ProviderId },
    MovementDetected { provider: ProviderId },
    TimeoutExpired { fix: FixId, timer: TimerId },
    CallbackDue { fix: FixId, timer: TimerId },
}

/// Forwards provider callbacks onto the event bus. Providers call from
/// their own threads; the arbitrator drains on its own.
struct ProviderBridge {
    bus: Arc<MessageBus<GeoEvent>>,
}

impl ProviderListener for ProviderBridge {
    fn location_updated(&self, provider: ProviderId) {
        self.bus
            .publish(GEO_TOPIC, GeoEvent::LocationUpdate { provider });
    }

    fn movement_detected(&self, provider: ProviderId) {
        self.bus
            .publish(GEO_TOPIC, GeoEvent::MovementDetected { provider });
    }
}

struct FixRequest {
    repeats: bool,
    providers: Vec<Arc<dyn LocationProvider>>,
    success_callback: CallbackRef,
    error_callback: Option<CallbackRef>,
    maximum_age: MaximumAge,
    timeout: Option<u32>,
    request_address: bool,
    /// Result held back until its zero-delay or cadence timer fires.
    pending_result: Option<PositionResult>,
    /// Last position this fix delivered through its success callback.
    last_delivered: Option<Position>,
    last_callback_at: Option<Instant>,
    timeout_timer: Option<TimerHandle<GeoEvent>>,
    callback_timer: Option<TimerHandle<GeoEvent>>,
}

struct GeoState {
    fixes: HashMap<FixId, FixRequest>,
    next_watch_id: i32,
    next_single_shot_id: i32,
    last_position: Option<Position>,
}

/// A script callback ready to be invoked, assembled while the state borrow
/// was still held.
enum Delivery {
    Success {
        callback: CallbackRef,
        position: Position,
        include_address: bool,
    },
    Failure {
        callback: Option<CallbackRef>,
        error: PositionError,
    },
}

/// The fix request arbitrator.
///
/// Bound to the thread that created it: every public method must be called
/// there, and script callbacks fire from inside [`pump`](Geolocation::pump)
/// on that thread.
pub struct Geolocation {
    config: GeolocationConfig,
    host: Arc<dyn ScriptHost>,
    page_host: String,
    providers: Arc<LocationProviderPool>,
    store: Arc<dyn PositionStore>,
    scheduler: TimerScheduler<GeoEvent>,
    events: Subscriber<GeoEvent>,
    listener: Arc<dyn ProviderListener>,
    bound_thread: ThreadId,
    state: RefCell<GeoState>,
}

impl Geolocation {
    /// Builds an arbitrator bound to the calling thread.
    ///
    /// `page_host` names the requesting site to network providers. The last
    /// known position is seeded from `store` when a previous session saved
    /// one.
    pub fn new(
        config: GeolocationConfig,
        page_host: impl Into<String>,
        host: Arc<dyn ScriptHost>,
        providers: Arc<LocationProviderPool>,
        store: Arc<dyn PositionStore>,
    ) -> std::io::Result<Self> {
        let bus = Arc::new(MessageBus::new());
        let events = bus.subscribe(GEO_TOPIC);
        let scheduler = TimerScheduler::start(Arc::clone(&bus))?;
        let listener: Arc<dyn ProviderListener> = Arc::new(ProviderBridge { bus });
        let last_position = store.retrieve(LAST_POSITION_KEY);
        if let Some(position) = &last_position {
            debug!(
                latitude = position.latitude,
                longitude = position.longitude,
                "seeded last known position"
            );
        }
        Ok(Self {
            config,
            host,
            page_host: page_host.into(),
            providers,
            store,
            scheduler,
            events,
            listener,
            bound_thread: thread::current().id(),
            state: RefCell::new(GeoState {
                fixes: HashMap::new(),
                next_watch_id: 1,
                next_single_shot_id: -1,
                last_position,
            }),
        })
    }

    /// One-off fix request; the returned id is negative. The result arrives
    /// through the callbacks, never synchronously.
    pub fn get_current_position(
        &self,
        options: &FixOptions,
        success: CallbackRef,
        error: Option<CallbackRef>,
    ) -> Result<FixId, GeolocationError> {
        self.start_fix(false, options, success, error)
    }

    /// Repeating fix request; the returned id is positive and stays live
    /// until [`clear_watch`](Geolocation::clear_watch).
    pub fn watch_position(
        &self,
        options: &FixOptions,
        success: CallbackRef,
        error: Option<CallbackRef>,
    ) -> Result<FixId, GeolocationError> {
        self.start_fix(true, options, success, error)
    }

    /// Cancels a watch. False for unknown ids and for one-shot ids.
    pub fn clear_watch(&self, id: FixId) -> bool {
        self.check_thread();
        if id <= 0 {
            return false;
        }
        self.remove_fix(id)
    }

    /// Best position seen so far, if any.
    pub fn last_position(&self) -> Option<Position> {
        self.check_thread();
        self.state.borrow().last_position.clone()
    }

    /// Number of live fix requests.
    pub fn active_fix_count(&self) -> usize {
        self.check_thread();
        self.state.borrow().fixes.len()
    }

    /// Handles every queued event; returns how many were handled.
    pub fn pump(&self) -> usize {
        self.check_thread();
        let mut handled = 0;
        while let Some(event) = self.events.try_recv() {
            self.dispatch(event);
            handled += 1;
        }
        handled
    }

    /// Waits up to `timeout` for a first event, then drains the queue.
    pub fn pump_timeout(&self, timeout: Duration) -> usize {
        self.check_thread();
        match self.events.recv_timeout(timeout) {
            Some(event) => {
                self.dispatch(event);
                1 + self.pump()
            }
            None => 0,
        }
    }

    fn check_thread(&self) {
        debug_assert_eq!(
            thread::current().id(),
            self.bound_thread,
            "geolocation used off its owning thread"
        );
    }

    fn start_fix(
        &self,
        repeats: bool,
        options: &FixOptions,
        success: CallbackRef,
        error: Option<CallbackRef>,
    ) -> Result<FixId, GeolocationError> {
        self.check_thread();
        let id = self.allocate_id(repeats)?;

        let mut fix = FixRequest {
            repeats,
            providers: Vec::new(),
            success_callback: success,
            error_callback: error,
            maximum_age: options.maximum_age,
            timeout: options.timeout,
            request_address: options.request_address,
            pending_result: None,
            last_delivered: None,
            last_callback_at: None,
            timeout_timer: None,
            callback_timer: None,
        };

        // A zero timeout combined with any cache tolerance can only ever be
        // served from the cache, so providers are not even set up.
        let cache_only =
            options.timeout == Some(0) && options.maximum_age != MaximumAge::LiveOnly;
        if !cache_only {
            self.attach_providers(&mut fix, options);
        }
        if options.maximum_age == MaximumAge::LiveOnly && fix.providers.is_empty() {
            return Err(GeolocationError::NoProviders);
        }

        let cached = self.state.borrow().last_position.clone();
        let suitable = cached
            .as_ref()
            .map(|position| fix.maximum_age.accepts(position.age_ms()))
            .unwrap_or(false);
        if suitable {
            fix.pending_result = cached.map(Ok);
            self.schedule_callback(id, &mut fix, Duration::ZERO);
        } else if fix.providers.is_empty() && options.timeout != Some(0) {
            fix.pending_result = Some(Err(PositionError::new(
                PositionErrorCode::PositionUnavailable,
                "No suitable cached position available.",
            )));
            self.schedule_callback(id, &mut fix, Duration::ZERO);
        }

        if options.timeout == Some(0) {
            // Nothing beyond the cache may ever serve this request.
            self.detach_providers(&mut fix);
            if fix.pending_result.is_none() {
                fix.pending_result = Some(Err(PositionError::new(
                    PositionErrorCode::PositionUnavailable,
                    "Fix request has no location providers.",
                )));
                self.schedule_callback(id, &mut fix, Duration::ZERO);
            }
        } else {
            self.arm_timeout(id, &mut fix);
        }

        if !repeats {
            for provider in &fix.providers {
                provider.request_refresh();
            }
        }

        debug!(
            fix = id,
            repeats,
            providers = fix.providers.len(),
            "fix request started"
        );
        self.state.borrow_mut().fixes.insert(id, fix);
        Ok(id)
    }

    fn allocate_id(&self, repeats: bool) -> Result<FixId, GeolocationError> {
        let mut state = self.state.borrow_mut();
        if repeats {
            if state.next_watch_id == i32::MAX {
                return Err(GeolocationError::TooManyRequests);
            }
            let id = state.next_watch_id;
            state.next_watch_id += 1;
            Ok(id)
        } else {
            if state.next_single_shot_id == i32::MIN {
                return Err(GeolocationError::TooManyRequests);
            }
            let id = state.next_single_shot_id;
            state.next_single_shot_id -= 1;
            Ok(id)
        }
    }

    fn attach_providers(&self, fix: &mut FixRequest, options: &FixOptions) {
        if let Some(provider) = self.providers.register(
            ProviderKey::Mock,
            options.request_address,
            Arc::clone(&self.listener),
        ) {
            fix.providers.push(provider);
        }
        if options.enable_high_accuracy {
            if let Some(provider) = self.providers.register(
                ProviderKey::Gps,
                options.request_address,
                Arc::clone(&self.listener),
            ) {
                fix.providers.push(provider);
            }
        }
        let urls = options
            .provider_urls
            .clone()
            .unwrap_or_else(|| vec![self.config.default_provider_url.clone()]);
        for url in urls {
            let key = ProviderKey::Network {
                url,
                host: self.page_host.clone(),
                language: options.address_language.clone(),
            };
            if let Some(provider) =
                self.providers
                    .register(key, options.request_address, Arc::clone(&self.listener))
            {
                fix.providers.push(provider);
            }
        }
    }

    fn detach_providers(&self, fix: &mut FixRequest) {
        for provider in fix.providers.drain(..) {
            self.providers.unregister(&provider, &self.listener);
        }
    }

    fn remove_fix(&self, id: FixId) -> bool {
        let fix = self.state.borrow_mut().fixes.remove(&id);
        match fix {
            Some(mut fix) => {
                self.detach_providers(&mut fix);
                debug!(fix = id, "fix request removed");
                true
            }
            None => false,
        }
    }

    fn schedule_callback(&self, id: FixId, fix: &mut FixRequest, delay: Duration) {
        fix.callback_timer = Some(self.scheduler.schedule(delay, GEO_TOPIC, move |timer| {
            GeoEvent::CallbackDue { fix: id, timer }
        }));
    }

    /// Arms the fix's timeout clock unless one is already running.
    fn arm_timeout(&self, id: FixId, fix: &mut FixRequest) {
        let Some(ms) = fix.timeout else { return };
        if ms == 0 || fix.timeout_timer.is_some() {
            return;
        }
        fix.timeout_timer = Some(self.scheduler.schedule(
            Duration::from_millis(u64::from(ms)),
            GEO_TOPIC,
            move |timer| GeoEvent::TimeoutExpired { fix: id, timer },
        ));
    }

    fn dispatch(&self, event: GeoEvent) {
        match event {
            GeoEvent::LocationUpdate { provider } => self.on_location_update(provider),
            GeoEvent::MovementDetected { provider } => self.on_movement_detected(provider),
            GeoEvent::TimeoutExpired { fix, timer } => self.on_timeout_expired(fix, timer),
            GeoEvent::CallbackDue { fix, timer } => self.on_callback_due(fix, timer),
        }
    }

    fn on_location_update(&self, provider_id: ProviderId) {
        // The provider may have been released since the event was queued.
        let Some(provider) = self.find_provider(provider_id) else {
            return;
        };
        let Some(result) = provider.last_result() else {
            return;
        };

        if let Ok(position) = &result {
            self.update_last_position(position);
        }

        // One-shots attached to this provider. Each is resolved before the
        // next is examined because callbacks can remove fixes.
        let mut one_shots: Vec<FixId> = {
            let state = self.state.borrow();
            state
                .fixes
                .iter()
                .filter(|(id, fix)| {
                    **id < 0 && fix.providers.iter().any(|p| p.id() == provider_id)
                })
                .map(|(id, _)| *id)
                .collect()
        };
        one_shots.sort_unstable();
        for id in one_shots {
            if let Some(delivery) = self.resolve_one_shot(id, provider_id, &result) {
                self.deliver(delivery);
            }
        }

        // Every watch hears about every update, whichever provider made it.
        let mut watches: Vec<FixId> = {
            let state = self.state.borrow();
            state.fixes.keys().copied().filter(|id| *id > 0).collect()
        };
        watches.sort_unstable();
        for id in watches {
            if let Some(delivery) = self.advance_watch(id, &result) {
                self.deliver(delivery);
            }
        }
    }

    fn on_movement_detected(&self, provider_id: ProviderId) {
        let mut state = self.state.borrow_mut();
        let ids: Vec<FixId> = state
            .fixes
            .iter()
            .filter(|(_, fix)| fix.providers.iter().any(|p| p.id() == provider_id))
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            if let Some(fix) = state.fixes.get_mut(&id) {
                self.arm_timeout(id, fix);
            }
        }
    }

    fn on_timeout_expired(&self, id: FixId, timer: TimerId) {
        let delivery = {
            let mut state = self.state.borrow_mut();
            let Some(fix) = state.fixes.get_mut(&id) else { return };
            // Only the clock this fix armed counts; a stale timer must not
            // fire the callbacks.
            match &fix.timeout_timer {
                Some(handle) if handle.id() == timer => {}
                _ => return,
            }
            fix.timeout_timer = None;
            let error = PositionError::new(
                PositionErrorCode::Timeout,
                "A position fix was not obtained within the specified time limit.",
            );
            if fix.repeats {
                Delivery::Failure {
                    callback: fix.error_callback,
                    error,
                }
            } else {
                let Some(mut fix) = state.fixes.remove(&id) else { return };
                drop(state);
                self.detach_providers(&mut fix);
                debug!(fix = id, "one-shot timed out");
                Delivery::Failure {
                    callback: fix.error_callback,
                    error,
                }
            }
        };
        self.deliver(delivery);
    }

    fn on_callback_due(&self, id: FixId, timer: TimerId) {
        let delivery = {
            let mut state = self.state.borrow_mut();
            let Some(fix) = state.fixes.get_mut(&id) else { return };
            match &fix.callback_timer {
                Some(handle) if handle.id() == timer => {}
                _ => return,
            }
            fix.callback_timer = None;
            let Some(result) = fix.pending_result.take() else { return };
            if fix.repeats {
                match result {
                    Ok(position) => {
                        fix.last_delivered = Some(position.clone());
                        fix.last_callback_at = Some(Instant::now());
                        Delivery::Success {
                            callback: fix.success_callback,
                            position,
                            include_address: fix.request_address,
                        }
                    }
                    Err(error) => Delivery::Failure {
                        callback: fix.error_callback,
                        error,
                    },
                }
            } else {
                let Some(mut fix) = state.fixes.remove(&id) else { return };
                drop(state);
                self.detach_providers(&mut fix);
                debug!(fix = id, "one-shot served");
                match result {
                    Ok(position) => Delivery::Success {
                        callback: fix.success_callback,
                        position,
                        include_address: fix.request_address,
                    },
                    Err(error) => Delivery::Failure {
                        callback: fix.error_callback,
                        error,
                    },
                }
            }
        };
        self.deliver(delivery);
    }

    fn find_provider(&self, provider_id: ProviderId) -> Option<Arc<dyn LocationProvider>> {
        let state = self.state.borrow();
        state
            .fixes
            .values()
            .flat_map(|fix| fix.providers.iter())
            .find(|provider| provider.id() == provider_id)
            .map(Arc::clone)
    }

    fn update_last_position(&self, new: &Position) {
        let mut state = self.state.borrow_mut();
        let old = state.last_position.as_ref();
        if is_movement(old, new)
            || is_more_accurate(old, new)
            || is_more_timely(old, self.config.maximum_fix_age)
        {
            state.last_position = Some(new.clone());
        }
    }

    fn resolve_one_shot(
        &self,
        id: FixId,
        provider_id: ProviderId,
        result: &PositionResult,
    ) -> Option<Delivery> {
        let mut state = self.state.borrow_mut();
        match result {
            Ok(position) => {
                // A good fix completes the request. It leaves the map before
                // the callback runs so re-entrant calls see consistent state.
                let mut fix = state.fixes.remove(&id)?;
                drop(state);
                self.detach_providers(&mut fix);
                debug!(fix = id, "one-shot completed");
                Some(Delivery::Success {
                    callback: fix.success_callback,
                    position: position.clone(),
                    include_address: fix.request_address,
                })
            }
            Err(error) => {
                let fix = state.fixes.get_mut(&id)?;
                // This provider is done for the request; others may still
                // answer.
                let index = fix
                    .providers
                    .iter()
                    .position(|provider| provider.id() == provider_id)?;
                let provider = fix.providers.remove(index);
                let exhausted = fix.providers.is_empty();
                drop(state);
                self.providers.unregister(&provider, &self.listener);
                if !exhausted {
                    return None;
                }
                let mut state = self.state.borrow_mut();
                let fix = state.fixes.remove(&id)?;
                drop(state);
                debug!(fix = id, "one-shot failed");
                Some(Delivery::Failure {
                    callback: fix.error_callback,
                    error: error.clone(),
                })
            }
        }
    }

    fn advance_watch(&self, id: FixId, result: &PositionResult) -> Option<Delivery> {
        match result {
            Err(error) => {
                let state = self.state.borrow();
                let fix = state.fixes.get(&id)?;
                // Watches report every failure and keep running.
                Some(Delivery::Failure {
                    callback: fix.error_callback,
                    error: error.clone(),
                })
            }
            Ok(position) => {
                let mut state = self.state.borrow_mut();
                let fix = state.fixes.get_mut(&id)?;
                // A good fix satisfies any armed timeout.
                fix.timeout_timer = None;
                let last = fix.last_delivered.as_ref();
                if !(is_movement(last, position) || is_more_accurate(last, position)) {
                    return None;
                }
                let now = Instant::now();
                let due = match fix.last_callback_at {
                    None => true,
                    Some(at) => {
                        now.duration_since(at) >= self.config.minimum_callback_interval
                    }
                };
                if due {
                    fix.last_delivered = Some(position.clone());
                    fix.last_callback_at = Some(now);
                    return Some(Delivery::Success {
                        callback: fix.success_callback,
                        position: position.clone(),
                        include_address: fix.request_address,
                    });
                }
                // Too soon since the last callback: hold the fix for the
                // rest of the interval. A held fix is only replaced by one
                // that beats it.
                let beats_pending = match &fix.pending_result {
                    Some(Ok(pending)) => {
                        is_movement(Some(pending), position)
                            || is_more_accurate(Some(pending), position)
                    }
                    Some(Err(_)) | None => true,
                };
                if beats_pending {
                    fix.pending_result = Some(Ok(position.clone()));
                }
                if fix.callback_timer.is_none() {
                    let since = fix
                        .last_callback_at
                        .map(|at| now.duration_since(at))
                        .unwrap_or_default();
                    let remaining = self
                        .config
                        .minimum_callback_interval
                        .saturating_sub(since);
                    self.schedule_callback(id, fix, remaining);
                }
                None
            }
        }
    }

    fn deliver(&self, delivery: Delivery) {
        match delivery {
            Delivery::Success {
                callback,
                position,
                include_address,
            } => {
                let value = position.to_script_value(include_address);
                if let Err(error) = self.host.invoke(&callback, &[value]) {
                    warn!(%callback, %error, "position callback failed");
                }
            }
            Delivery::Failure { callback, error } => {
                // No error callback registered counts as handled.
                let Some(callback) = callback else { return };
                let value = error.to_script_value();
                if let Err(invoke_error) = self.host.invoke(&callback, &[value]) {
                    warn!(%callback, %invoke_error, "position error callback failed");
                }
            }
        }
    }
}

impl Drop for Geolocation {
    fn drop(&mut self) {
        let ids: Vec<FixId> = self.state.borrow().fixes.keys().copied().collect();
        for id in ids {
            self.remove_fix(id);
        }
        let last = self.state.borrow_mut().last_position.take();
        if let Some(position) = last {
            if !self.store.store(LAST_POSITION_KEY, &position) {
                warn!("failed to persist last known position");
            }
        }
        // The timer daemon stops when the scheduler field drops.
    }
}
