//! One POST to a network location server.
//!
//! The request body is JSON: `version`, the requesting `host`,
//! `request_address`, an `address_language` tag when one is set, and the
//! last known `location` when one exists to seed the server's search. The
//! response carries a `location` object whose `latitude`, `longitude`, and
//! `accuracy` are required for a good fix; anything else comes back as a
//! POSITION_UNAVAILABLE result.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::position::{now_ms, Address, Position, PositionError, PositionResult};
use crate::http::{CookieSource, HttpError, HttpTransportFactory};
use crate::sync::Event;
use crate::task::{AsyncTask, FetchOptions, TaskContext, TaskError, TaskListener};

/// Protocol revision spoken to the fix server.
const PROTOCOL_VERSION: &str = "1.0";

/// Receives the parsed outcome of one lookup.
pub trait LocationResponseListener: Send + Sync {
    fn response_available(&self, result: PositionResult);
}

#[derive(Deserialize)]
struct ResponseBody {
    location: Option<ResponseLocation>,
}

#[derive(Deserialize)]
struct ResponseLocation {
    latitude: Option<f64>,
    longitude: Option<f64>,
    accuracy: Option<f64>,
    altitude: Option<f64>,
    altitude_accuracy: Option<f64>,
    address: Option<ResponseAddress>,
}

#[derive(Deserialize)]
struct ResponseAddress {
    street_number: Option<String>,
    street: Option<String>,
    premises: Option<String>,
    city: Option<String>,
    county: Option<String>,
    region: Option<String>,
    country: Option<String>,
    country_code: Option<String>,
    postal_code: Option<String>,
}

impl From<ResponseAddress> for Address {
    fn from(address: ResponseAddress) -> Self {
        Self {
            street_number: address.street_number,
            street: address.street,
            premises: address.premises,
            city: address.city,
            county: address.county,
            region: address.region,
            country: address.country,
            country_code: address.country_code,
            postal_code: address.postal_code,
        }
    }
}

fn build_request_body(
    host: &str,
    request_address: bool,
    address_language: &str,
    last_known: Option<&Position>,
) -> Vec<u8> {
    let mut body = json!({
        "version": PROTOCOL_VERSION,
        "host": host,
        "request_address": request_address,
    });
    if !address_language.is_empty() {
        body["address_language"] = Value::String(address_language.to_string());
    }
    if let Some(position) = last_known {
        body["location"] = json!({
            "latitude": position.latitude,
            "longitude": position.longitude,
        });
    }
    body.to_string().into_bytes()
}

fn parse_response(body: &[u8]) -> PositionResult {
    if body.is_empty() {
        return Err(PositionError::unavailable());
    }
    let parsed: ResponseBody = match serde_json::from_slice(body) {
        Ok(parsed) => parsed,
        Err(error) => {
            debug!(%error, "malformed location response");
            return Err(PositionError::unavailable());
        }
    };
    let Some(location) = parsed.location else {
        return Err(PositionError::unavailable());
    };
    let (Some(latitude), Some(longitude), Some(accuracy)) =
        (location.latitude, location.longitude, location.accuracy)
    else {
        return Err(PositionError::unavailable());
    };
    Ok(Position {
        latitude,
        longitude,
        accuracy,
        altitude: location.altitude,
        altitude_accuracy: location.altitude_accuracy,
        timestamp_ms: now_ms(),
        address: location.address.map(Address::from),
    })
}

struct NullTaskListener;

impl TaskListener for NullTaskListener {
    fn task_complete(&self, _success: bool) {}
}

/// A single lookup against a network location server, run on an
/// [`AsyncTask`].
///
/// The task signals run-completion before handing the result to the
/// listener, so [`stop_and_detach`](NetworkLocationRequest::stop_and_detach)
/// never blocks on a listener that is itself tearing the request down.
pub struct NetworkLocationRequest {
    task: AsyncTask,
    run_complete: Arc<Event>,
    url: String,
    host: String,
    address_language: String,
    request_address: bool,
    started: bool,
}

impl NetworkLocationRequest {
    pub fn new(
        transport_factory: Arc<dyn HttpTransportFactory>,
        cookies: Arc<dyn CookieSource>,
        url: String,
        host: String,
        address_language: String,
        request_address: bool,
    ) -> Self {
        Self {
            task: AsyncTask::new(transport_factory, cookies),
            run_complete: Arc::new(Event::new()),
            url,
            host,
            address_language,
            request_address,
            started: false,
        }
    }

    /// Fires the lookup; single-use. `last_known` seeds the server's search.
    ///
    /// An aborted fetch completes silently; every other outcome reaches the
    /// listener, failures as POSITION_UNAVAILABLE results.
    pub fn start(
        &mut self,
        last_known: Option<&Position>,
        listener: Arc<dyn LocationResponseListener>,
    ) -> Result<(), TaskError> {
        let body = build_request_body(
            &self.host,
            self.request_address,
            &self.address_language,
            last_known,
        );
        let url = self.url.clone();
        let run_complete = Arc::clone(&self.run_complete);

        self.task.init(Arc::new(NullTaskListener))?;
        self.task.start(move |ctx: &TaskContext| {
            let outcome = match ctx.http_post(&url, &body, &FetchOptions::default()) {
                Ok(payload) if payload.status == 200 => Some(parse_response(&payload.body)),
                Ok(payload) => {
                    debug!(url = %url, status = payload.status, "location server returned bad status");
                    Some(Err(PositionError::unavailable()))
                }
                Err(HttpError::Aborted) => None,
                Err(error) => {
                    warn!(url = %url, %error, "location request failed");
                    Some(Err(PositionError::unavailable()))
                }
            };
            // Completion is signaled before the listener runs; the listener
            // may tear this request down.
            run_complete.signal();
            let delivered = outcome.is_some();
            if let Some(result) = outcome {
                listener.response_available(result);
            }
            delivered
        })?;
        self.started = true;
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Aborts any in-flight fetch, waits for the body to wind down, and lets
    /// the worker thread finish unobserved.
    pub fn stop_and_detach(self) {
        self.task.abort();
        if self.started {
            self.run_complete.wait();
        }
        self.task.detach();
    }
}
