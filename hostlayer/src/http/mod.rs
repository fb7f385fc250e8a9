//! HTTP plumbing for background fetches.
//!
//! Everything that touches the network goes through [`HttpTransport`], an
//! XHR-shaped request object: open, set headers, send, then poll ready state
//! until complete. The pumping logic in [`crate::task`] drives a transport
//! while watching its abort flag; [`ReqwestTransport`] is the production
//! implementation, and tests substitute scripted transports through
//! [`HttpTransportFactory`].
//!
//! Cookie access is behind [`CookieSource`] so the embedder's cookie jar can
//! satisfy required-cookie preconditions without this crate owning cookies.

mod cookies;
mod error;
mod transport;

pub use cookies::{has_required_cookie, CookieSource, MemoryCookieSource};
pub use error::HttpError;
pub use transport::{
    HttpMethod, HttpPayload, HttpTransport, HttpTransportFactory, ReadyState, ReqwestTransport,
    ReqwestTransportFactory, TransportConfig,
};

#[cfg(test)]
pub use transport::tests::{MockBehavior, MockTransport, MockTransportFactory};
