//! Cookie access for required-cookie preconditions.
//!
//! The crate never stores cookies itself. Fetches that carry a
//! required-cookie precondition ask a [`CookieSource`] for the cookie string
//! that would accompany a request to the target URL and match against it with
//! [`has_required_cookie`].

use std::collections::HashMap;
use std::sync::Mutex;

/// Supplies the cookie string the embedder would send with a request.
pub trait CookieSource: Send + Sync {
    /// Returns the `name=value; name2=value2` cookie string for `url`, or
    /// `None` when no cookies apply.
    fn cookie_string(&self, url: &str) -> Option<String>;
}

/// In-memory cookie source keyed by URL prefix.
///
/// The longest configured prefix matching the request URL wins. An empty
/// source reports no cookies for any URL, which is also the right default for
/// embedders without a cookie jar.
#[derive(Default)]
pub struct MemoryCookieSource {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryCookieSource {
    /// Creates an empty cookie source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Associates a cookie string with a URL prefix.
    pub fn set_cookies(&self, url_prefix: &str, cookie_string: &str) {
        self.entries
            .lock()
            .unwrap()
            .insert(url_prefix.to_string(), cookie_string.to_string());
    }

    /// Removes the cookie string for a URL prefix.
    pub fn clear_cookies(&self, url_prefix: &str) {
        self.entries.lock().unwrap().remove(url_prefix);
    }
}

impl CookieSource for MemoryCookieSource {
    fn cookie_string(&self, url: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .filter(|(prefix, _)| url.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, cookies)| cookies.clone())
    }
}

/// Checks a required-cookie precondition against a cookie string.
///
/// `required` is either a bare cookie name, satisfied by any cookie with that
/// name, or `name=value`, satisfied only by an exact pair match.
pub fn has_required_cookie(cookie_string: Option<&str>, required: &str) -> bool {
    if required.is_empty() {
        return true;
    }
    let Some(cookies) = cookie_string else {
        return false;
    };

    let (required_name, required_value) = match required.split_once('=') {
        Some((name, value)) => (name.trim(), Some(value.trim())),
        None => (required.trim(), None),
    };

    cookies.split(';').any(|entry| {
        let entry = entry.trim();
        let (name, value) = match entry.split_once('=') {
            Some((name, value)) => (name.trim(), Some(value.trim())),
            None => (entry, None),
        };
        if name != required_name {
            return false;
        }
        match required_value {
            Some(expected) => value == Some(expected),
            None => true,
        }
    })
}
