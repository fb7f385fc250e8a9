//! Position model shared by providers, the arbitrator, and script callbacks.
//!
//! A [`Position`] always carries latitude, longitude, and a horizontal
//! accuracy; an attempt that cannot produce all three is represented as a
//! [`PositionError`] instead. [`PositionResult`] is the `Result` alias that
//! moves between the two.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// An arc minute of latitude, in meters.
const METERS_PER_ARC_MINUTE: f64 = 1852.0;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

/// Reverse-geocoded civic address, filled in by network providers when the
/// lookup asked for one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub street_number: Option<String>,
    pub street: Option<String>,
    pub premises: Option<String>,
    pub city: Option<String>,
    pub county: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
    pub country_code: Option<String>,
    pub postal_code: Option<String>,
}

impl Address {
    /// True when no field is populated.
    pub fn is_empty(&self) -> bool {
        self.street_number.is_none()
            && self.street.is_none()
            && self.premises.is_none()
            && self.city.is_none()
            && self.county.is_none()
            && self.region.is_none()
            && self.country.is_none()
            && self.country_code.is_none()
            && self.postal_code.is_none()
    }

    fn to_script_value(&self) -> Value {
        let mut object = serde_json::Map::new();
        let mut put = |key: &str, field: &Option<String>| {
            if let Some(value) = field {
                object.insert(key.to_string(), Value::String(value.clone()));
            }
        };
        put("streetNumber", &self.street_number);
        put("street", &self.street);
        put("premises", &self.premises);
        put("city", &self.city);
        put("county", &self.county);
        put("region", &self.region);
        put("country", &self.country);
        put("countryCode", &self.country_code);
        put("postalCode", &self.postal_code);
        Value::Object(object)
    }
}

/// A good position fix.
///
/// `timestamp_ms` is milliseconds since the Unix epoch, stamped when the fix
/// was obtained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy radius in meters.
    pub accuracy: f64,
    #[serde(default)]
    pub altitude: Option<f64>,
    #[serde(default)]
    pub altitude_accuracy: Option<f64>,
    pub timestamp_ms: i64,
    #[serde(default)]
    pub address: Option<Address>,
}

impl Position {
    /// Builds a fix stamped with the current time.
    pub fn new(latitude: f64, longitude: f64, accuracy: f64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy,
            altitude: None,
            altitude_accuracy: None,
            timestamp_ms: now_ms(),
            address: None,
        }
    }

    /// Age of the fix against the current clock, in milliseconds. Clock
    /// adjustments can make this negative.
    pub fn age_ms(&self) -> i64 {
        now_ms() - self.timestamp_ms
    }

    /// Script-facing object: the W3C `coords` member plus the same readings
    /// flat on the top level, a millisecond `timestamp`, and the address
    /// only when `include_address` is set and one is populated.
    pub fn to_script_value(&self, include_address: bool) -> Value {
        let mut coords = serde_json::Map::new();
        coords.insert("latitude".to_string(), json!(self.latitude));
        coords.insert("longitude".to_string(), json!(self.longitude));
        coords.insert("accuracy".to_string(), json!(self.accuracy));
        if let Some(altitude) = self.altitude {
            coords.insert("altitude".to_string(), json!(altitude));
        }
        if let Some(accuracy) = self.altitude_accuracy {
            coords.insert("altitudeAccuracy".to_string(), json!(accuracy));
        }

        let mut object = coords.clone();
        object.insert("coords".to_string(), Value::Object(coords));
        object.insert("timestamp".to_string(), json!(self.timestamp_ms));
        if include_address {
            if let Some(address) = &self.address {
                if !address.is_empty() {
                    object.insert("address".to_string(), address.to_script_value());
                }
            }
        }
        Value::Object(object)
    }
}

/// W3C position error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionErrorCode {
    PermissionDenied,
    PositionUnavailable,
    Timeout,
}

impl PositionErrorCode {
    /// Numeric value exposed to script.
    pub fn as_int(self) -> i64 {
        match self {
            PositionErrorCode::PermissionDenied => 1,
            PositionErrorCode::PositionUnavailable => 2,
            PositionErrorCode::Timeout => 3,
        }
    }
}

/// Why a fix could not be produced.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionError {
    pub code: PositionErrorCode,
    pub message: Option<String>,
}

impl PositionError {
    pub fn new(code: PositionErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    /// A POSITION_UNAVAILABLE without further explanation.
    pub fn unavailable() -> Self {
        Self {
            code: PositionErrorCode::PositionUnavailable,
            message: None,
        }
    }

    /// Script-facing object. The W3C code constants ride along so script can
    /// compare against `error.POSITION_UNAVAILABLE` and friends.
    pub fn to_script_value(&self) -> Value {
        let mut object = serde_json::Map::new();
        object.insert("code".to_string(), json!(self.code.as_int()));
        if let Some(message) = &self.message {
            object.insert("message".to_string(), Value::String(message.clone()));
        }
        object.insert("UNKNOWN_ERROR".to_string(), json!(0));
        object.insert("PERMISSION_DENIED".to_string(), json!(1));
        object.insert("POSITION_UNAVAILABLE".to_string(), json!(2));
        object.insert("TIMEOUT".to_string(), json!(3));
        Value::Object(object)
    }
}

/// Outcome of one fix attempt. `Ok` always holds a good fix.
pub type PositionResult = Result<Position, PositionError>;

/// True when `new` sits more than the larger of the two accuracy radii away
/// from `old`. Degrees are converted at 60 arc minutes of 1852 m each;
/// longitude is not corrected for latitude.
pub fn is_movement(old: Option<&Position>, new: &Position) -> bool {
    let Some(old) = old else { return true };
    let delta = (new.latitude - old.latitude).abs() + (new.longitude - old.longitude).abs();
    delta * 60.0 * METERS_PER_ARC_MINUTE > old.accuracy.max(new.accuracy)
}

/// True when `new` reports a smaller accuracy radius than `old`.
pub fn is_more_accurate(old: Option<&Position>, new: &Position) -> bool {
    let Some(old) = old else { return true };
    new.accuracy < old.accuracy
}

/// True when `old` has outlived `maximum_age`; a fresh fix then wins on
/// recency alone.
pub fn is_more_timely(old: Option<&Position>, maximum_age: Duration) -> bool {
    let Some(old) = old else { return true };
    old.age_ms() > maximum_age.as_millis() as i64
}
