//! Security origins for pool workers.

use crate::worker::PoolError;
use std::fmt;

/// The (scheme, host, port) triple identifying where a worker's code came
/// from.
///
/// Literal-script workers inherit the pool's page origin; workers created
/// from a URL take their origin from the fetched script's final URL, after
/// redirects. Message envelopes carry the sender's origin in URL form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityOrigin {
    scheme: String,
    host: String,
    port: u16,
}

impl SecurityOrigin {
    /// Parses an origin from an absolute http or https URL.
    ///
    /// The path, query, and fragment are ignored. Scheme and host are
    /// lowercased; an absent port takes the scheme default.
    pub fn parse(url: &str) -> Result<Self, PoolError> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| PoolError::BadOrigin(url.to_string()))?;
        let scheme = scheme.to_ascii_lowercase();
        let default_port = match scheme.as_str() {
            "http" => 80,
            "https" => 443,
            _ => return Err(PoolError::BadOrigin(url.to_string())),
        };

        let authority = rest
            .split(['/', '?', '#'])
            .next()
            .unwrap_or(rest);
        if authority.is_empty() || authority.contains('@') {
            return Err(PoolError::BadOrigin(url.to_string()));
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port_str)) => match port_str.parse::<u16>() {
                Ok(port) => (host, port),
                // No parseable port, the colon belongs to the host
                Err(_) => (authority, default_port),
            },
            None => (authority, default_port),
        };
        if host.is_empty() {
            return Err(PoolError::BadOrigin(url.to_string()));
        }

        Ok(Self {
            scheme,
            host: host.to_ascii_lowercase(),
            port,
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The origin in URL form, with default ports elided.
    pub fn as_url_string(&self) -> String {
        self.to_string()
    }

    fn is_default_port(&self) -> bool {
        matches!(
            (self.scheme.as_str(), self.port),
            ("http", 80) | ("https", 443)
        )
    }
}

impl fmt::Display for SecurityOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_default_port() {
            write!(f, "{}://{}", self.scheme, self.host)
        } else {
            write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
        }
    }
}
