//! Fix request options and their validation.
//!
//! Options arrive from script as a JSON object; [`FixOptions::from_value`]
//! applies the documented key names and validation messages. Embedders that
//! already hold typed values can build a [`FixOptions`] directly.

use serde_json::Value;

use super::error::GeolocationError;

/// How stale a cached position may be and still satisfy a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaximumAge {
    /// Only a live fix will do (`maximumAge` 0).
    #[default]
    LiveOnly,
    /// Any cached fix is acceptable (`maximumAge` Infinity).
    Unlimited,
    /// Cached fixes up to this many milliseconds old are acceptable.
    Millis(u32),
}

impl MaximumAge {
    /// Whether a fix aged `age_ms` falls inside this window. `LiveOnly`
    /// accepts nothing.
    pub fn accepts(self, age_ms: i64) -> bool {
        match self {
            MaximumAge::LiveOnly => false,
            MaximumAge::Unlimited => true,
            MaximumAge::Millis(limit) => age_ms <= i64::from(limit),
        }
    }
}

/// Parsed options for one fix request.
#[derive(Debug, Clone, PartialEq)]
pub struct FixOptions {
    /// Ask for device providers capable of high accuracy.
    pub enable_high_accuracy: bool,
    pub maximum_age: MaximumAge,
    /// Time limit in milliseconds. `None` means no limit; `Some(0)` means
    /// the cache is the only acceptable source.
    pub timeout: Option<u32>,
    /// Ask network providers to reverse-geocode a civic address.
    pub request_address: bool,
    /// Language tag for the address; empty selects the server default.
    pub address_language: String,
    /// Network provider URLs. `None` selects the configured default; an
    /// empty list selects no network providers at all.
    pub provider_urls: Option<Vec<String>>,
}

impl Default for FixOptions {
    fn default() -> Self {
        Self {
            enable_high_accuracy: false,
            maximum_age: MaximumAge::LiveOnly,
            timeout: None,
            request_address: false,
            address_language: String::new(),
            provider_urls: None,
        }
    }
}

impl FixOptions {
    /// Parses a script-side options object.
    ///
    /// `Null` and missing keys fall back to the defaults. JSON cannot carry
    /// Infinity, so the string `"Infinity"` stands in for it on `maximumAge`.
    pub fn from_value(options: &Value) -> Result<Self, GeolocationError> {
        let mut parsed = FixOptions::default();
        let object = match options {
            Value::Null => return Ok(parsed),
            Value::Object(object) => object,
            _ => {
                return Err(GeolocationError::InvalidOptions(
                    "options should be an object.".to_string(),
                ))
            }
        };

        if let Some(value) = object.get("enableHighAccuracy") {
            parsed.enable_high_accuracy = value.as_bool().ok_or_else(|| {
                GeolocationError::InvalidOptions(
                    "options.enableHighAccuracy should be a boolean.".to_string(),
                )
            })?;
        }
        if let Some(value) = object.get("maximumAge") {
            parsed.maximum_age = parse_maximum_age(value)?;
        }
        if let Some(value) = object.get("timeout") {
            let Some(timeout) = non_negative_int(value) else {
                return Err(GeolocationError::InvalidOptions(
                    "options.timeout should be a non-negative 32 bit signed integer.".to_string(),
                ));
            };
            parsed.timeout = Some(timeout);
        }
        if let Some(value) = object.get("requestAddress") {
            parsed.request_address = value.as_bool().ok_or_else(|| {
                GeolocationError::InvalidOptions(
                    "options.requestAddress should be a boolean.".to_string(),
                )
            })?;
        }
        if let Some(value) = object.get("addressLanguage") {
            match value.as_str() {
                Some(language) if !language.is_empty() => {
                    parsed.address_language = language.to_string();
                }
                _ => {
                    return Err(GeolocationError::InvalidOptions(
                        "options.addressLanguage should be a non-empty string.".to_string(),
                    ))
                }
            }
        }
        if let Some(value) = object.get("locationProviderUrls") {
            parsed.provider_urls = Some(parse_provider_urls(value)?);
        }
        Ok(parsed)
    }
}

fn parse_maximum_age(value: &Value) -> Result<MaximumAge, GeolocationError> {
    if value.as_str() == Some("Infinity") {
        return Ok(MaximumAge::Unlimited);
    }
    match non_negative_int(value) {
        Some(0) => Ok(MaximumAge::LiveOnly),
        Some(age) => Ok(MaximumAge::Millis(age)),
        None => Err(GeolocationError::InvalidOptions(
            "options.maximumAge should be a non-negative 32 bit signed integer or Infinity."
                .to_string(),
        )),
    }
}

/// Accepts integral JSON numbers in `0..=i32::MAX`.
fn non_negative_int(value: &Value) -> Option<u32> {
    let number = value.as_i64()?;
    if (0..=i64::from(i32::MAX)).contains(&number) {
        Some(number as u32)
    } else {
        None
    }
}

fn parse_provider_urls(value: &Value) -> Result<Vec<String>, GeolocationError> {
    let invalid = || {
        GeolocationError::InvalidOptions(
            "options.locationProviderUrls should be null or an array of strings.".to_string(),
        )
    };
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(entries) => entries
            .iter()
            .map(|entry| entry.as_str().map(str::to_string).ok_or_else(invalid))
            .collect(),
        _ => Err(invalid()),
    }
}
