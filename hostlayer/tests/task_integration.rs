//! Integration tests for the async task runner.
//!
//! These tests verify the complete task flow including:
//! - Lifecycle transitions (new, init, start) and their guards
//! - Fetches performed by a task body through its context
//! - Abort interrupting an in-flight fetch from another thread
//! - Cookie preconditions, capture fetches, and If-Modified-Since
//! - Listener notification and detach semantics
//!
//! Run with: `cargo test --test task_integration`

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use hostlayer::http::{
    HttpError, HttpMethod, HttpTransport, HttpTransportFactory, MemoryCookieSource, ReadyState,
};
use hostlayer::sync::Event;
use hostlayer::task::{AsyncTask, FetchOptions, TaskContext, TaskError, TaskListener, TaskState};

// ============================================================================
// Mock Implementations
// ============================================================================

/// What a scripted transport does when `send` is called.
#[derive(Clone)]
enum Reply {
    /// Complete immediately with this response.
    Respond {
        status: u16,
        body: Vec<u8>,
        was_redirected: bool,
    },
    /// Stay in flight until aborted.
    Hang,
}

/// Transport double that records the request and plays back its [`Reply`],
/// signalling the ready event the fetch pump blocks on.
struct ScriptedTransport {
    reply: Reply,
    state: Mutex<ReadyState>,
    ready: Mutex<Option<Arc<Event>>>,
    seen_method: Mutex<Option<String>>,
    seen_url: Mutex<Option<String>>,
    seen_headers: Mutex<Vec<(String, String)>>,
    seen_body: Mutex<Option<Vec<u8>>>,
    follow_redirects: Mutex<Option<bool>>,
    aborted: AtomicBool,
}

impl ScriptedTransport {
    fn new(reply: Reply) -> Arc<Self> {
        Arc::new(Self {
            reply,
            state: Mutex::new(ReadyState::Uninitialized),
            ready: Mutex::new(None),
            seen_method: Mutex::new(None),
            seen_url: Mutex::new(None),
            seen_headers: Mutex::new(Vec::new()),
            seen_body: Mutex::new(None),
            follow_redirects: Mutex::new(None),
            aborted: AtomicBool::new(false),
        })
    }

    fn respond(status: u16, body: &[u8]) -> Arc<Self> {
        Self::new(Reply::Respond {
            status,
            body: body.to_vec(),
            was_redirected: false,
        })
    }

    fn redirect(status: u16) -> Arc<Self> {
        Self::new(Reply::Respond {
            status,
            body: Vec::new(),
            was_redirected: true,
        })
    }

    fn hang() -> Arc<Self> {
        Self::new(Reply::Hang)
    }

    fn header(&self, name: &str) -> Option<String> {
        self.seen_headers
            .lock()
            .unwrap()
            .iter()
            .find(|(seen, _)| seen.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone())
    }

    fn seen_url(&self) -> Option<String> {
        self.seen_url.lock().unwrap().clone()
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn complete(&self) {
        *self.state.lock().unwrap() = ReadyState::Complete;
        if let Some(event) = self.ready.lock().unwrap().as_ref() {
            event.signal();
        }
    }
}

impl HttpTransport for ScriptedTransport {
    fn open(&self, method: HttpMethod, url: &str) -> Result<(), HttpError> {
        *self.seen_method.lock().unwrap() = Some(method.to_string());
        *self.seen_url.lock().unwrap() = Some(url.to_string());
        *self.state.lock().unwrap() = ReadyState::Open;
        Ok(())
    }

    fn set_request_header(&self, name: &str, value: &str) -> Result<(), HttpError> {
        self.seen_headers
            .lock()
            .unwrap()
            .push((name.to_string(), value.to_string()));
        Ok(())
    }

    fn set_follow_redirects(&self, follow: bool) {
        *self.follow_redirects.lock().unwrap() = Some(follow);
    }

    fn set_ready_event(&self, event: Arc<Event>) {
        *self.ready.lock().unwrap() = Some(event);
    }

    fn send(&self, body: Option<&[u8]>) -> Result<(), HttpError> {
        *self.seen_body.lock().unwrap() = body.map(<[u8]>::to_vec);
        *self.state.lock().unwrap() = ReadyState::Sent;
        match &self.reply {
            Reply::Respond { .. } => self.complete(),
            Reply::Hang => {}
        }
        Ok(())
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.complete();
    }

    fn ready_state(&self) -> ReadyState {
        *self.state.lock().unwrap()
    }

    fn status(&self) -> Option<u16> {
        match &self.reply {
            Reply::Respond { status, .. } if self.ready_state().is_complete() => Some(*status),
            _ => None,
        }
    }

    fn response_body(&self) -> Option<Vec<u8>> {
        match &self.reply {
            Reply::Respond { body, .. } => Some(body.clone()),
            Reply::Hang => None,
        }
    }

    fn final_url(&self) -> Option<String> {
        None
    }

    fn was_redirected(&self) -> bool {
        matches!(
            &self.reply,
            Reply::Respond {
                was_redirected: true,
                ..
            }
        )
    }

    fn error(&self) -> Option<String> {
        None
    }
}

/// Hands out scripted transports in creation order.
struct ScriptedFactory {
    transports: Mutex<Vec<Arc<ScriptedTransport>>>,
}

impl ScriptedFactory {
    fn new(transports: Vec<Arc<ScriptedTransport>>) -> Arc<Self> {
        Arc::new(Self {
            transports: Mutex::new(transports),
        })
    }

    fn single(transport: Arc<ScriptedTransport>) -> Arc<Self> {
        Self::new(vec![transport])
    }

    fn remaining(&self) -> usize {
        self.transports.lock().unwrap().len()
    }
}

impl HttpTransportFactory for ScriptedFactory {
    fn create(&self) -> Result<Arc<dyn HttpTransport>, HttpError> {
        let mut transports = self.transports.lock().unwrap();
        if transports.is_empty() {
            return Err(HttpError::Client("no scripted transport left".to_string()));
        }
        Ok(transports.remove(0))
    }
}

/// Listener that records completions and wakes waiters.
struct CompletionListener {
    completions: Mutex<Vec<bool>>,
    signal: Event,
}

impl CompletionListener {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            completions: Mutex::new(Vec::new()),
            signal: Event::new(),
        })
    }

    fn completions(&self) -> Vec<bool> {
        self.completions.lock().unwrap().clone()
    }

    /// Blocks until the next completion arrives, returning its verdict.
    fn wait_for_completion(&self) -> bool {
        assert!(
            self.signal.wait_timeout(Duration::from_secs(5)),
            "task did not complete in time"
        );
        *self
            .completions
            .lock()
            .unwrap()
            .last()
            .expect("completion recorded before signal")
    }
}

impl TaskListener for CompletionListener {
    fn task_complete(&self, success: bool) {
        self.completions.lock().unwrap().push(success);
        self.signal.signal();
    }
}

// ============================================================================
// Test Helpers
// ============================================================================

fn no_cookies() -> Arc<MemoryCookieSource> {
    Arc::new(MemoryCookieSource::new())
}

fn task_over(factory: &Arc<ScriptedFactory>) -> AsyncTask {
    AsyncTask::new(Arc::clone(factory) as Arc<dyn HttpTransportFactory>, no_cookies())
}

/// Polls until `predicate` holds; fails the test after five seconds.
fn wait_until(what: &str, mut predicate: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !predicate() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

// ============================================================================
// Integration Tests
// ============================================================================

#[test]
fn test_task_delivers_fetch_payload_to_its_body() {
    let transport = ScriptedTransport::respond(200, b"feed body");
    let factory = ScriptedFactory::single(Arc::clone(&transport));
    let listener = CompletionListener::new();
    let payload = Arc::new(Mutex::new(None));

    let task = task_over(&factory);
    task.init(Arc::clone(&listener) as Arc<dyn TaskListener>)
        .unwrap();
    let sink = Arc::clone(&payload);
    task.start(move |ctx: &TaskContext| {
        let fetched = ctx.http_get("http://api.example.com/feed", &FetchOptions::default());
        let success = fetched.is_ok();
        *sink.lock().unwrap() = Some(fetched);
        success
    })
    .unwrap();

    assert!(listener.wait_for_completion());
    task.wait();
    assert_eq!(task.state(), TaskState::Finished);

    let payload = payload.lock().unwrap().take().unwrap().unwrap();
    assert_eq!(payload.status, 200);
    assert_eq!(payload.body, b"feed body");
    assert_eq!(payload.final_url, "http://api.example.com/feed");
    assert!(payload.is_success());
    assert!(!payload.was_redirected);

    assert_eq!(transport.seen_method.lock().unwrap().as_deref(), Some("GET"));
    // Intermediate caches are always bypassed.
    assert_eq!(transport.header("Cache-Control").as_deref(), Some("no-cache"));
    assert_eq!(transport.header("Pragma").as_deref(), Some("no-cache"));
}

#[test]
fn test_post_carries_the_request_body() {
    let transport = ScriptedTransport::respond(200, b"{}");
    let factory = ScriptedFactory::single(Arc::clone(&transport));
    let listener = CompletionListener::new();

    let task = task_over(&factory);
    task.init(Arc::clone(&listener) as Arc<dyn TaskListener>)
        .unwrap();
    task.start(move |ctx: &TaskContext| {
        ctx.http_post(
            "http://api.example.com/submit",
            b"name=value",
            &FetchOptions::default(),
        )
        .is_ok()
    })
    .unwrap();

    assert!(listener.wait_for_completion());
    assert_eq!(transport.seen_method.lock().unwrap().as_deref(), Some("POST"));
    assert_eq!(
        transport.seen_body.lock().unwrap().as_deref(),
        Some(b"name=value".as_slice())
    );
}

#[test]
fn test_lifecycle_transitions_are_guarded() {
    let factory = ScriptedFactory::new(Vec::new());
    let listener = CompletionListener::new();
    let task = task_over(&factory);

    assert!(matches!(
        task.start(|_: &TaskContext| true),
        Err(TaskError::NotInitialized)
    ));
    assert_eq!(task.state(), TaskState::Created);

    task.init(Arc::clone(&listener) as Arc<dyn TaskListener>)
        .unwrap();
    assert!(matches!(
        task.init(Arc::clone(&listener) as Arc<dyn TaskListener>),
        Err(TaskError::AlreadyInitialized)
    ));
    assert_eq!(task.state(), TaskState::Initialized);

    task.start(|_: &TaskContext| true).unwrap();
    assert!(matches!(
        task.start(|_: &TaskContext| true),
        Err(TaskError::AlreadyStarted)
    ));

    assert!(listener.wait_for_completion());
    task.wait();
    assert_eq!(task.state(), TaskState::Finished);
}

#[test]
fn test_failure_verdict_reaches_the_listener() {
    let factory = ScriptedFactory::new(Vec::new());
    let listener = CompletionListener::new();
    let task = task_over(&factory);

    task.init(Arc::clone(&listener) as Arc<dyn TaskListener>)
        .unwrap();
    task.start(|_: &TaskContext| false).unwrap();

    assert!(!listener.wait_for_completion());
    assert_eq!(listener.completions(), vec![false]);
}

#[test]
fn test_abort_interrupts_a_hanging_fetch() {
    let transport = ScriptedTransport::hang();
    let factory = ScriptedFactory::single(Arc::clone(&transport));
    let listener = CompletionListener::new();
    let saw_abort = Arc::new(AtomicBool::new(false));

    let task = task_over(&factory);
    task.init(Arc::clone(&listener) as Arc<dyn TaskListener>)
        .unwrap();
    let flag = Arc::clone(&saw_abort);
    task.start(move |ctx: &TaskContext| {
        let result = ctx.http_get("http://slow.example.com/feed", &FetchOptions::default());
        if matches!(result, Err(HttpError::Aborted)) {
            flag.store(true, Ordering::SeqCst);
        }
        result.is_ok()
    })
    .unwrap();

    // Let the fetch reach the transport before pulling the plug.
    wait_until("the fetch to go out", || transport.seen_url().is_some());
    assert!(!task.is_aborted());
    task.abort();

    assert!(!listener.wait_for_completion());
    task.wait();
    assert!(task.is_aborted());
    assert!(transport.is_aborted());
    assert!(saw_abort.load(Ordering::SeqCst));
}

#[test]
fn test_required_cookie_gates_the_fetch() {
    // Missing cookie: the fetch fails before any transport is created.
    let factory = ScriptedFactory::single(ScriptedTransport::respond(200, b""));
    let listener = CompletionListener::new();
    let failure = Arc::new(Mutex::new(None));

    let task = AsyncTask::new(
        Arc::clone(&factory) as Arc<dyn HttpTransportFactory>,
        no_cookies(),
    );
    task.init(Arc::clone(&listener) as Arc<dyn TaskListener>)
        .unwrap();
    let sink = Arc::clone(&failure);
    let options = FetchOptions {
        required_cookie: Some("session".to_string()),
        ..FetchOptions::default()
    };
    let gated = options.clone();
    task.start(move |ctx: &TaskContext| {
        match ctx.http_get("http://api.example.com/private", &gated) {
            Ok(_) => true,
            Err(error) => {
                *sink.lock().unwrap() = Some(error.to_string());
                false
            }
        }
    })
    .unwrap();

    assert!(!listener.wait_for_completion());
    assert_eq!(
        failure.lock().unwrap().as_deref(),
        Some("Required cookie is not present")
    );
    assert_eq!(factory.remaining(), 1);

    // With the cookie in the jar the same fetch goes through.
    let cookies = MemoryCookieSource::new();
    cookies.set_cookies("http://api.example.com", "session=abc; theme=dark");
    let transport = ScriptedTransport::respond(200, b"private");
    let factory = ScriptedFactory::single(Arc::clone(&transport));
    let listener = CompletionListener::new();

    let task = AsyncTask::new(
        Arc::clone(&factory) as Arc<dyn HttpTransportFactory>,
        Arc::new(cookies),
    );
    task.init(Arc::clone(&listener) as Arc<dyn TaskListener>)
        .unwrap();
    task.start(move |ctx: &TaskContext| {
        ctx.http_get("http://api.example.com/private", &options)
            .is_ok()
    })
    .unwrap();

    assert!(listener.wait_for_completion());
    assert_eq!(
        transport.seen_url().as_deref(),
        Some("http://api.example.com/private")
    );
}

#[test]
fn test_capture_fetch_surfaces_redirects_unfollowed() {
    let transport = ScriptedTransport::redirect(302);
    let factory = ScriptedFactory::single(Arc::clone(&transport));
    let listener = CompletionListener::new();
    let payload = Arc::new(Mutex::new(None));

    let task = task_over(&factory);
    task.init(Arc::clone(&listener) as Arc<dyn TaskListener>)
        .unwrap();
    let sink = Arc::clone(&payload);
    task.start(move |ctx: &TaskContext| {
        let options = FetchOptions {
            capture: true,
            ..FetchOptions::default()
        };
        match ctx.http_get("http://cdn.example.com/resource", &options) {
            Ok(fetched) => {
                *sink.lock().unwrap() = Some(fetched);
                true
            }
            Err(_) => false,
        }
    })
    .unwrap();

    assert!(listener.wait_for_completion());
    assert_eq!(*transport.follow_redirects.lock().unwrap(), Some(false));

    let payload = payload.lock().unwrap().take().unwrap();
    assert_eq!(payload.status, 302);
    assert!(payload.was_redirected);
    assert!(!payload.is_success());
}

#[test]
fn test_not_modified_counts_as_success() {
    let transport = ScriptedTransport::respond(304, b"");
    let factory = ScriptedFactory::single(Arc::clone(&transport));
    let listener = CompletionListener::new();

    let task = task_over(&factory);
    task.init(Arc::clone(&listener) as Arc<dyn TaskListener>)
        .unwrap();
    task.start(move |ctx: &TaskContext| {
        let options = FetchOptions {
            if_modified_since: Some("Tue, 19 Aug 2025 08:00:00 GMT".to_string()),
            ..FetchOptions::default()
        };
        match ctx.http_get("http://api.example.com/feed", &options) {
            Ok(fetched) => fetched.is_success() && fetched.body.is_empty(),
            Err(_) => false,
        }
    })
    .unwrap();

    assert!(listener.wait_for_completion());
    assert_eq!(
        transport.header("If-Modified-Since").as_deref(),
        Some("Tue, 19 Aug 2025 08:00:00 GMT")
    );
}

#[test]
fn test_detach_severs_the_listener() {
    let transport = ScriptedTransport::hang();
    let factory = ScriptedFactory::single(Arc::clone(&transport));
    let listener = CompletionListener::new();

    let task = task_over(&factory);
    task.init(Arc::clone(&listener) as Arc<dyn TaskListener>)
        .unwrap();
    task.start(move |ctx: &TaskContext| {
        ctx.http_get("http://slow.example.com/feed", &FetchOptions::default())
            .is_ok()
    })
    .unwrap();

    wait_until("the fetch to go out", || transport.seen_url().is_some());
    let abort = task.abort_handle();
    task.detach();
    abort.abort();

    // The body finishes on its own thread; nobody is told about it.
    wait_until("the transport to be aborted", || transport.is_aborted());
    thread::sleep(Duration::from_millis(100));
    assert!(listener.completions().is_empty());
}
