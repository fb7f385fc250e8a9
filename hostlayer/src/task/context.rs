//! Fetch context shared between a task body and its controller.
//!
//! The context owns the abort latch and the ready event a fetch pump blocks
//! on. [`AbortHandle`]s are cheap clones that flip the latch, abort whatever
//! transport is in flight, and wake the pump; they are safe to call from any
//! thread and never block.

use crate::http::{
    has_required_cookie, CookieSource, HttpError, HttpMethod, HttpPayload, HttpTransport,
    HttpTransportFactory,
};
use crate::sync::Event;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// Per-fetch options.
///
/// `capture` marks a resource-capture fetch: redirects are not followed, so a
/// server redirect surfaces as its own 3xx response rather than being chased.
/// All fetches bypass intermediate caches via no-cache request headers.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Capture semantics: do not follow redirects.
    pub capture: bool,
    /// Precondition: `name` or `name=value` that must be present in the
    /// cookie jar for the target URL. The fetch fails without touching the
    /// network when the cookie is missing.
    pub required_cookie: Option<String>,
    /// If-Modified-Since header value; a 304 response then counts as success
    /// with an empty payload.
    pub if_modified_since: Option<String>,
    /// Additional request headers.
    pub headers: Vec<(String, String)>,
}

struct ContextShared {
    aborted: AtomicBool,
    ready: Arc<Event>,
    transport: Mutex<Option<Arc<dyn HttpTransport>>>,
}

/// Flips a context's abort latch.
///
/// Cloneable and callable from any thread. Aborting twice is a no-op.
#[derive(Clone)]
pub struct AbortHandle {
    shared: Arc<ContextShared>,
}

impl AbortHandle {
    /// Aborts the context: latches the flag, aborts the in-flight transport
    /// if any, and wakes the pump. Never blocks.
    pub fn abort(&self) {
        if self.shared.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("task abort requested");
        let transport = self.shared.transport.lock().unwrap().clone();
        if let Some(transport) = transport {
            transport.abort();
        }
        self.shared.ready.signal();
    }

    /// Whether the abort latch is set.
    pub fn is_aborted(&self) -> bool {
        self.shared.aborted.load(Ordering::SeqCst)
    }
}

/// The environment a task body runs in.
///
/// Fetches block the calling thread but remain interruptible: the pump
/// re-checks the abort latch on every transport wakeup.
pub struct TaskContext {
    shared: Arc<ContextShared>,
    transport_factory: Arc<dyn HttpTransportFactory>,
    cookies: Arc<dyn CookieSource>,
}

impl TaskContext {
    /// Creates a context around the given transport factory and cookie
    /// source.
    pub fn new(
        transport_factory: Arc<dyn HttpTransportFactory>,
        cookies: Arc<dyn CookieSource>,
    ) -> Self {
        Self {
            shared: Arc::new(ContextShared {
                aborted: AtomicBool::new(false),
                ready: Arc::new(Event::new()),
                transport: Mutex::new(None),
            }),
            transport_factory,
            cookies,
        }
    }

    /// Returns a handle that can abort this context from another thread.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Whether the abort latch is set.
    pub fn is_aborted(&self) -> bool {
        self.shared.aborted.load(Ordering::SeqCst)
    }

    /// Performs a GET request, pumping until completion or abort.
    pub fn http_get(&self, url: &str, options: &FetchOptions) -> Result<HttpPayload, HttpError> {
        self.fetch(HttpMethod::Get, url, None, options)
    }

    /// Performs a POST request, pumping until completion or abort.
    pub fn http_post(
        &self,
        url: &str,
        body: &[u8],
        options: &FetchOptions,
    ) -> Result<HttpPayload, HttpError> {
        self.fetch(HttpMethod::Post, url, Some(body), options)
    }

    fn fetch(
        &self,
        method: HttpMethod,
        url: &str,
        body: Option<&[u8]>,
        options: &FetchOptions,
    ) -> Result<HttpPayload, HttpError> {
        if let Some(required) = options.required_cookie.as_deref() {
            if !required.is_empty() {
                let cookies = self.cookies.cookie_string(url);
                if !has_required_cookie(cookies.as_deref(), required) {
                    debug!(url = %url, "fetch blocked on missing required cookie");
                    return Err(HttpError::CookieMissing);
                }
            }
        }

        if self.is_aborted() {
            return Err(HttpError::Aborted);
        }

        let transport = self.transport_factory.create()?;
        transport.set_ready_event(Arc::clone(&self.shared.ready));
        *self.shared.transport.lock().unwrap() = Some(Arc::clone(&transport));

        // Close the install/abort race: an abort that ran before the slot was
        // filled never saw this transport.
        if self.is_aborted() {
            transport.abort();
            self.shared.transport.lock().unwrap().take();
            return Err(HttpError::Aborted);
        }

        let result = self.drive(transport.as_ref(), method, url, body, options);
        self.shared.transport.lock().unwrap().take();
        result
    }

    fn drive(
        &self,
        transport: &dyn HttpTransport,
        method: HttpMethod,
        url: &str,
        body: Option<&[u8]>,
        options: &FetchOptions,
    ) -> Result<HttpPayload, HttpError> {
        trace!(method = %method, url = %url, capture = options.capture, "fetch starting");

        transport.open(method, url)?;
        if options.capture {
            transport.set_follow_redirects(false);
        }
        // Intermediate caches never satisfy these fetches
        transport.set_request_header("Cache-Control", "no-cache")?;
        transport.set_request_header("Pragma", "no-cache")?;
        if let Some(date) = options.if_modified_since.as_deref() {
            transport.set_request_header("If-Modified-Since", date)?;
        }
        for (name, value) in &options.headers {
            transport.set_request_header(name, value)?;
        }

        transport.send(body)?;

        loop {
            if self.is_aborted() {
                transport.abort();
                return Err(HttpError::Aborted);
            }
            if transport.ready_state().is_complete() {
                break;
            }
            self.shared.ready.wait();
        }

        if self.is_aborted() {
            return Err(HttpError::Aborted);
        }
        if let Some(error) = transport.error() {
            return Err(HttpError::Transport(error));
        }
        let status = transport
            .status()
            .ok_or_else(|| HttpError::Transport("request produced no response".to_string()))?;

        let payload = HttpPayload {
            status,
            body: transport.response_body().unwrap_or_default(),
            final_url: transport.final_url().unwrap_or_else(|| url.to_string()),
            was_redirected: transport.was_redirected(),
        };
        trace!(url = %url, status, bytes = payload.body.len(), "fetch complete");
        Ok(payload)
    }
}
