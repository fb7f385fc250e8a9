//! XHR-shaped HTTP transport over a blocking client.
//!
//! A transport models one request: `open`, optional headers, `send`, then
//! observation of [`ReadyState`] until `Complete`. Completion is announced
//! through an [`Event`] registered with [`HttpTransport::set_ready_event`],
//! which lets a caller block on the event rather than poll.
//!
//! [`ReqwestTransport`] performs the I/O on a short-lived thread so the
//! caller's pump loop stays interruptible: an abort wakes the pump
//! immediately, and the late response from the I/O thread is discarded.

use super::error::HttpError;
use crate::sync::Event;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace};

/// Request method accepted by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    /// Canonical request-line spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a transport, in request order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ReadyState {
    /// Created, not yet opened.
    #[default]
    Uninitialized,
    /// `open` succeeded; headers may be set.
    Open,
    /// `send` accepted the request.
    Sent,
    /// Response headers available, body still streaming.
    Interactive,
    /// Response fully received or the request failed.
    Complete,
}

impl ReadyState {
    /// Returns true once the request has finished, successfully or not.
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

/// The observable outcome of a completed fetch.
///
/// Present for any completed response regardless of status code; callers
/// decide what counts as success for their purposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpPayload {
    /// HTTP status code.
    pub status: u16,
    /// Response body, possibly empty (304 responses carry no body).
    pub body: Vec<u8>,
    /// URL the response was served from, after any redirects.
    pub final_url: String,
    /// Whether any redirect was followed.
    pub was_redirected: bool,
}

impl HttpPayload {
    /// Returns true for 2xx responses and 304 Not Modified.
    pub fn is_success(&self) -> bool {
        matches!(self.status, 200..=299) || self.status == 304
    }
}

/// Configuration for the production transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Per-request timeout.
    pub timeout: Duration,
    /// User-Agent header value.
    pub user_agent: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: format!("hostlayer/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// One in-flight HTTP request.
///
/// Implementations must tolerate `abort` at any point and from any thread;
/// after an abort the response, whenever it arrives, is discarded.
pub trait HttpTransport: Send + Sync {
    /// Binds the method and URL. Valid only in `Uninitialized` state.
    fn open(&self, method: HttpMethod, url: &str) -> Result<(), HttpError>;

    /// Adds a request header. Valid after `open`, before `send`.
    fn set_request_header(&self, name: &str, value: &str) -> Result<(), HttpError>;

    /// Controls redirect following for this request. Defaults to following.
    fn set_follow_redirects(&self, follow: bool);

    /// Registers the event signalled on every ready-state change.
    fn set_ready_event(&self, event: Arc<Event>);

    /// Dispatches the request. Returns immediately; completion is observed
    /// via [`HttpTransport::ready_state`] and the ready event.
    fn send(&self, body: Option<&[u8]>) -> Result<(), HttpError>;

    /// Abandons the request. Idempotent and non-blocking.
    fn abort(&self);

    /// Current lifecycle state.
    fn ready_state(&self) -> ReadyState;

    /// Status code, once complete. `None` if the request never produced a
    /// response.
    fn status(&self) -> Option<u16>;

    /// Response body, once complete.
    fn response_body(&self) -> Option<Vec<u8>>;

    /// URL the response came from, after redirects.
    fn final_url(&self) -> Option<String>;

    /// Whether a redirect was followed.
    fn was_redirected(&self) -> bool;

    /// Transport-level failure, if the request completed without a response.
    fn error(&self) -> Option<String>;
}

/// Creates transports, one per request.
pub trait HttpTransportFactory: Send + Sync {
    fn create(&self) -> Result<Arc<dyn HttpTransport>, HttpError>;
}

/// Sequence for I/O thread names.
static IO_THREAD_SEQ: AtomicU64 = AtomicU64::new(0);

struct RequestState {
    method: Option<HttpMethod>,
    url: String,
    headers: Vec<(String, String)>,
    follow_redirects: bool,
    ready_state: ReadyState,
    status: Option<u16>,
    body: Option<Vec<u8>>,
    final_url: Option<String>,
    was_redirected: bool,
    error: Option<String>,
}

impl Default for RequestState {
    fn default() -> Self {
        Self {
            method: None,
            url: String::new(),
            headers: Vec::new(),
            follow_redirects: true,
            ready_state: ReadyState::Uninitialized,
            status: None,
            body: None,
            final_url: None,
            was_redirected: false,
            error: None,
        }
    }
}

struct TransportInner {
    config: TransportConfig,
    state: Mutex<RequestState>,
    aborted: AtomicBool,
    ready_event: Mutex<Option<Arc<Event>>>,
}

impl TransportInner {
    fn signal_ready(&self) {
        if let Some(event) = self.ready_event.lock().unwrap().as_ref() {
            event.signal();
        }
    }

    fn complete_with(&self, apply: impl FnOnce(&mut RequestState)) {
        {
            let mut state = self.state.lock().unwrap();
            apply(&mut state);
            state.ready_state = ReadyState::Complete;
        }
        self.signal_ready();
    }
}

/// Production transport backed by `reqwest::blocking`.
pub struct ReqwestTransport {
    inner: Arc<TransportInner>,
}

impl ReqwestTransport {
    /// Creates a transport with the given configuration.
    pub fn new(config: TransportConfig) -> Self {
        Self {
            inner: Arc::new(TransportInner {
                config,
                state: Mutex::new(RequestState::default()),
                aborted: AtomicBool::new(false),
                ready_event: Mutex::new(None),
            }),
        }
    }
}

impl HttpTransport for ReqwestTransport {
    fn open(&self, method: HttpMethod, url: &str) -> Result<(), HttpError> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.ready_state != ReadyState::Uninitialized {
                return Err(HttpError::InvalidState("open after request started"));
            }
            state.method = Some(method);
            state.url = url.to_string();
            state.ready_state = ReadyState::Open;
        }
        self.inner.signal_ready();
        Ok(())
    }

    fn set_request_header(&self, name: &str, value: &str) -> Result<(), HttpError> {
        let mut state = self.inner.state.lock().unwrap();
        if state.ready_state != ReadyState::Open {
            return Err(HttpError::InvalidState("header outside open state"));
        }
        state.headers.push((name.to_string(), value.to_string()));
        Ok(())
    }

    fn set_follow_redirects(&self, follow: bool) {
        self.inner.state.lock().unwrap().follow_redirects = follow;
    }

    fn set_ready_event(&self, event: Arc<Event>) {
        *self.inner.ready_event.lock().unwrap() = Some(event);
    }

    fn send(&self, body: Option<&[u8]>) -> Result<(), HttpError> {
        let (method, url, headers, follow_redirects) = {
            let mut state = self.inner.state.lock().unwrap();
            if state.ready_state != ReadyState::Open {
                return Err(HttpError::InvalidState("send before open"));
            }
            let method = state
                .method
                .ok_or(HttpError::InvalidState("send before open"))?;
            state.ready_state = ReadyState::Sent;
            (
                method,
                state.url.clone(),
                state.headers.clone(),
                state.follow_redirects,
            )
        };
        self.inner.signal_ready();

        if self.inner.aborted.load(Ordering::SeqCst) {
            self.inner.complete_with(|_| {});
            return Err(HttpError::Aborted);
        }

        let inner = Arc::clone(&self.inner);
        let request_body = body.map(|b| b.to_vec());
        let seq = IO_THREAD_SEQ.fetch_add(1, Ordering::Relaxed);
        let spawned = thread::Builder::new()
            .name(format!("http-io-{}", seq))
            .spawn(move || {
                run_blocking_request(inner, method, url, headers, follow_redirects, request_body);
            });

        if let Err(e) = spawned {
            let message = format!("failed to spawn I/O thread: {}", e);
            self.inner.complete_with(|state| {
                state.error = Some(message.clone());
            });
            return Err(HttpError::Transport(message));
        }
        Ok(())
    }

    fn abort(&self) {
        if self.inner.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("HTTP transport aborted");
        self.inner.complete_with(|_| {});
    }

    fn ready_state(&self) -> ReadyState {
        self.inner.state.lock().unwrap().ready_state
    }

    fn status(&self) -> Option<u16> {
        self.inner.state.lock().unwrap().status
    }

    fn response_body(&self) -> Option<Vec<u8>> {
        self.inner.state.lock().unwrap().body.clone()
    }

    fn final_url(&self) -> Option<String> {
        self.inner.state.lock().unwrap().final_url.clone()
    }

    fn was_redirected(&self) -> bool {
        self.inner.state.lock().unwrap().was_redirected
    }

    fn error(&self) -> Option<String> {
        self.inner.state.lock().unwrap().error.clone()
    }
}

/// Runs the blocking request on the I/O thread and publishes the outcome.
///
/// An abort that lands while the request is in flight wins: whatever the
/// server eventually returns is dropped on the floor.
fn run_blocking_request(
    inner: Arc<TransportInner>,
    method: HttpMethod,
    url: String,
    headers: Vec<(String, String)>,
    follow_redirects: bool,
    body: Option<Vec<u8>>,
) {
    trace!(method = %method, url = %url, "HTTP request starting");

    let redirect_policy = if follow_redirects {
        reqwest::redirect::Policy::limited(10)
    } else {
        reqwest::redirect::Policy::none()
    };

    let client = match reqwest::blocking::Client::builder()
        .timeout(inner.config.timeout)
        .user_agent(inner.config.user_agent.clone())
        .redirect(redirect_policy)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            inner.complete_with(|state| {
                state.error = Some(format!("Failed to create HTTP client: {}", e));
            });
            return;
        }
    };

    let mut request = match method {
        HttpMethod::Get => client.get(&url),
        HttpMethod::Post => client.post(&url),
    };
    for (name, value) in &headers {
        request = request.header(name, value);
    }
    if let Some(bytes) = body {
        request = request.body(bytes);
    }

    let outcome = request.send();

    if inner.aborted.load(Ordering::SeqCst) {
        trace!(url = %url, "response discarded after abort");
        return;
    }

    match outcome {
        Ok(response) => {
            let status = response.status().as_u16();
            let final_url = response.url().to_string();
            let was_redirected = final_url != url;
            debug!(url = %url, status, "HTTP response received");

            let body = match response.bytes() {
                Ok(bytes) => bytes.to_vec(),
                Err(e) => {
                    inner.complete_with(|state| {
                        state.error = Some(format!("failed to read response: {}", e));
                    });
                    return;
                }
            };

            inner.complete_with(|state| {
                state.status = Some(status);
                state.final_url = Some(final_url);
                state.was_redirected = was_redirected;
                state.body = Some(body);
            });
        }
        Err(e) => {
            debug!(url = %url, error = %e, "HTTP request failed");
            inner.complete_with(|state| {
                state.error = Some(format!("request failed: {}", e));
            });
        }
    }
}

/// Factory for [`ReqwestTransport`] instances.
#[derive(Clone, Default)]
pub struct ReqwestTransportFactory {
    config: TransportConfig,
}

impl ReqwestTransportFactory {
    /// Creates a factory producing transports with the given configuration.
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

impl HttpTransportFactory for ReqwestTransportFactory {
    fn create(&self) -> Result<Arc<dyn HttpTransport>, HttpError> {
        Ok(Arc::new(ReqwestTransport::new(self.config.clone())))
    }
}
