//! Integration tests for the worker pool.
//!
//! These tests verify the complete worker lifecycle including:
//! - Pool creation with the owning worker on the calling thread
//! - Script and URL worker bring-up through a host factory
//! - Cross-worker messaging, envelopes, and FIFO ordering
//! - Error routing through worker handlers up to the owning worker
//! - Send-time validation and shutdown behavior
//!
//! Run with: `cargo test --test worker_pool_integration`

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use hostlayer::http::{
    HttpError, HttpMethod, HttpTransport, HttpTransportFactory, MemoryCookieSource, ReadyState,
};
use hostlayer::script::{CallbackRef, ScriptError, ScriptHost};
use hostlayer::sync::Event;
use hostlayer::worker::{
    PoolError, ScriptHostFactory, SecurityOrigin, WorkerId, WorkerPool, WorkerScope, WorkerSource,
    OWNING_WORKER_ID,
};

// ============================================================================
// Mock Implementations
// ============================================================================

/// Script host that records everything the pool asks of it and answers
/// callback invocations with a fixed verdict.
struct RecordingHost {
    ran: Mutex<Vec<String>>,
    invocations: Mutex<Vec<(CallbackRef, Vec<Value>)>>,
    reported: Mutex<Vec<String>>,
    invoke_result: Value,
}

impl RecordingHost {
    fn new() -> Arc<Self> {
        Self::with_verdict(Value::Null)
    }

    fn with_verdict(invoke_result: Value) -> Arc<Self> {
        Arc::new(Self {
            ran: Mutex::new(Vec::new()),
            invocations: Mutex::new(Vec::new()),
            reported: Mutex::new(Vec::new()),
            invoke_result,
        })
    }

    fn ran_sources(&self) -> Vec<String> {
        self.ran.lock().unwrap().clone()
    }

    fn reported_errors(&self) -> Vec<String> {
        self.reported.lock().unwrap().clone()
    }

    /// Argument lists passed to `handler`, in invocation order.
    fn calls_to(&self, handler: CallbackRef) -> Vec<Vec<Value>> {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|(callback, _)| *callback == handler)
            .map(|(_, args)| args.clone())
            .collect()
    }
}

impl ScriptHost for RecordingHost {
    fn run(&self, source: &str) -> Result<(), ScriptError> {
        self.ran.lock().unwrap().push(source.to_string());
        Ok(())
    }

    fn invoke(&self, callback: &CallbackRef, args: &[Value]) -> Result<Value, ScriptError> {
        self.invocations
            .lock()
            .unwrap()
            .push((*callback, args.to_vec()));
        Ok(self.invoke_result.clone())
    }

    fn report_error(&self, message: &str) {
        self.reported.lock().unwrap().push(message.to_string());
    }
}

/// Builds a [`RecordingHost`] per worker and installs the configured
/// handlers from inside `create`, the way an engine binding would while
/// evaluating the worker preamble.
struct RecordingFactory {
    message_handler: Option<CallbackRef>,
    error_handler: Option<CallbackRef>,
    handler_verdict: Value,
    created: Mutex<Vec<(WorkerId, Arc<RecordingHost>, WorkerScope)>>,
}

impl RecordingFactory {
    fn new() -> Arc<Self> {
        Self::configured(None, None, Value::Null)
    }

    fn with_message_handler(handler: CallbackRef) -> Arc<Self> {
        Self::configured(Some(handler), None, Value::Null)
    }

    fn with_error_handler(handler: CallbackRef, verdict: Value) -> Arc<Self> {
        Self::configured(None, Some(handler), verdict)
    }

    fn configured(
        message_handler: Option<CallbackRef>,
        error_handler: Option<CallbackRef>,
        handler_verdict: Value,
    ) -> Arc<Self> {
        Arc::new(Self {
            message_handler,
            error_handler,
            handler_verdict,
            created: Mutex::new(Vec::new()),
        })
    }

    fn host_for(&self, worker: WorkerId) -> Arc<RecordingHost> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .find(|(id, _, _)| *id == worker)
            .map(|(_, host, _)| Arc::clone(host))
            .expect("no host created for worker")
    }

    fn scope_for(&self, worker: WorkerId) -> WorkerScope {
        self.created
            .lock()
            .unwrap()
            .iter()
            .find(|(id, _, _)| *id == worker)
            .map(|(_, _, scope)| scope.clone())
            .expect("no scope created for worker")
    }
}

impl ScriptHostFactory for RecordingFactory {
    fn create(&self, scope: WorkerScope) -> Result<Arc<dyn ScriptHost>, ScriptError> {
        let host = RecordingHost::with_verdict(self.handler_verdict.clone());
        if let Some(handler) = self.message_handler {
            scope
                .set_message_handler(handler)
                .expect("message handler install");
        }
        if let Some(handler) = self.error_handler {
            scope
                .set_error_handler(handler)
                .expect("error handler install");
        }
        self.created
            .lock()
            .unwrap()
            .push((scope.worker_id(), Arc::clone(&host), scope));
        Ok(host)
    }
}

/// One pre-scripted HTTP exchange. `send` fills in the response immediately
/// and signals the ready event the fetch pump blocks on.
struct CannedTransport {
    response_status: u16,
    response_body: Vec<u8>,
    response_final_url: Option<String>,
    state: Mutex<ReadyState>,
    opened_url: Mutex<Option<String>>,
    ready: Mutex<Option<Arc<Event>>>,
}

impl CannedTransport {
    fn respond(status: u16, body: &[u8], final_url: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            response_status: status,
            response_body: body.to_vec(),
            response_final_url: final_url.map(str::to_string),
            state: Mutex::new(ReadyState::Uninitialized),
            opened_url: Mutex::new(None),
            ready: Mutex::new(None),
        })
    }

    fn opened_url(&self) -> Option<String> {
        self.opened_url.lock().unwrap().clone()
    }

    fn complete(&self) {
        *self.state.lock().unwrap() = ReadyState::Complete;
        if let Some(event) = self.ready.lock().unwrap().as_ref() {
            event.signal();
        }
    }
}

impl HttpTransport for CannedTransport {
    fn open(&self, _method: HttpMethod, url: &str) -> Result<(), HttpError> {
        *self.opened_url.lock().unwrap() = Some(url.to_string());
        *self.state.lock().unwrap() = ReadyState::Open;
        Ok(())
    }

    fn set_request_header(&self, _name: &str, _value: &str) -> Result<(), HttpError> {
        Ok(())
    }

    fn set_follow_redirects(&self, _follow: bool) {}

    fn set_ready_event(&self, event: Arc<Event>) {
        *self.ready.lock().unwrap() = Some(event);
    }

    fn send(&self, _body: Option<&[u8]>) -> Result<(), HttpError> {
        self.complete();
        Ok(())
    }

    fn abort(&self) {
        self.complete();
    }

    fn ready_state(&self) -> ReadyState {
        *self.state.lock().unwrap()
    }

    fn status(&self) -> Option<u16> {
        self.ready_state()
            .is_complete()
            .then_some(self.response_status)
    }

    fn response_body(&self) -> Option<Vec<u8>> {
        Some(self.response_body.clone())
    }

    fn final_url(&self) -> Option<String> {
        self.response_final_url.clone()
    }

    fn was_redirected(&self) -> bool {
        self.response_final_url.is_some()
    }

    fn error(&self) -> Option<String> {
        None
    }
}

/// Hands out canned transports in creation order.
struct CannedFactory {
    transports: Mutex<Vec<Arc<CannedTransport>>>,
}

impl CannedFactory {
    fn new(transports: Vec<Arc<CannedTransport>>) -> Arc<Self> {
        Arc::new(Self {
            transports: Mutex::new(transports),
        })
    }
}

impl HttpTransportFactory for CannedFactory {
    fn create(&self) -> Result<Arc<dyn HttpTransport>, HttpError> {
        let mut transports = self.transports.lock().unwrap();
        if transports.is_empty() {
            return Err(HttpError::Client("no canned transport left".to_string()));
        }
        Ok(transports.remove(0))
    }
}

// ============================================================================
// Test Helpers
// ============================================================================

const PAGE_URL: &str = "http://app.example.com/main.html";

fn page_origin() -> SecurityOrigin {
    SecurityOrigin::parse(PAGE_URL).unwrap()
}

fn no_network() -> Arc<CannedFactory> {
    CannedFactory::new(Vec::new())
}

struct Harness {
    pool: Arc<WorkerPool>,
    owner: Arc<RecordingHost>,
    factory: Arc<RecordingFactory>,
}

fn pool_with(factory: Arc<RecordingFactory>, transports: Arc<CannedFactory>) -> Harness {
    let owner = RecordingHost::new();
    let pool = WorkerPool::new(
        page_origin(),
        Arc::clone(&owner) as Arc<dyn ScriptHost>,
        Arc::clone(&factory) as Arc<dyn ScriptHostFactory>,
        transports,
        Arc::new(MemoryCookieSource::new()),
    );
    Harness {
        pool,
        owner,
        factory,
    }
}

fn script(source: &str) -> WorkerSource {
    WorkerSource::Script(source.to_string())
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
fn test_owner_is_worker_zero_on_the_creating_thread() {
    let h = pool_with(RecordingFactory::new(), no_network());

    assert_eq!(h.pool.current_worker_id(), Some(OWNING_WORKER_ID));
    assert_eq!(h.pool.worker_count(), 1);
    assert_eq!(h.pool.page_origin().to_string(), "http://app.example.com");
    assert!(!h.pool.is_shutting_down());

    let pool = Arc::clone(&h.pool);
    let foreign = thread::spawn(move || pool.current_worker_id())
        .join()
        .unwrap();
    assert_eq!(foreign, None);
}

#[test]
fn test_script_worker_runs_its_body_with_the_page_origin() {
    let h = pool_with(RecordingFactory::new(), no_network());

    let worker = h.pool.create_worker(script("worker body")).unwrap();
    assert_eq!(worker, 1);
    assert_eq!(h.pool.worker_count(), 2);
    assert_eq!(h.pool.worker_origin(worker), Some(page_origin()));

    // The body is evaluated on the worker's thread after creation returns.
    let host = h.factory.host_for(worker);
    wait_until("worker body to run", || !host.ran_sources().is_empty());
    assert_eq!(host.ran_sources(), vec!["worker body".to_string()]);
}

#[test]
fn test_messages_deliver_in_order_with_envelope() {
    let handler = CallbackRef::new(11);
    let h = pool_with(RecordingFactory::with_message_handler(handler), no_network());
    let worker = h.pool.create_worker(script("")).unwrap();

    assert!(h.pool.send_message("first", None, worker));
    assert!(h.pool.send_message("second", Some(json!({"n": 2})), worker));

    let host = h.factory.host_for(worker);
    wait_until("both messages to arrive", || {
        host.calls_to(handler).len() == 2
    });

    let calls = host.calls_to(handler);
    assert_eq!(calls[0][0], json!("first"));
    assert_eq!(calls[0][1], json!(OWNING_WORKER_ID));
    assert_eq!(calls[0][2]["text"], json!("first"));
    assert_eq!(calls[0][2]["sender"], json!(OWNING_WORKER_ID));
    assert_eq!(calls[0][2]["origin"], json!("http://app.example.com"));
    assert!(calls[0][2].get("body").is_none());

    assert_eq!(calls[1][0], json!("second"));
    assert_eq!(calls[1][2]["body"], json!({"n": 2}));
}

#[test]
fn test_worker_replies_reach_the_owner_via_pump() {
    let owner_handler = CallbackRef::new(21);
    let h = pool_with(RecordingFactory::new(), no_network());
    h.pool.set_message_handler(owner_handler).unwrap();
    let worker = h.pool.create_worker(script("")).unwrap();

    // A reply sent through the worker's scope is queued for worker 0 and
    // stays there until the owning thread pumps.
    let scope = h.factory.scope_for(worker);
    assert!(scope.send_message("done", Some(json!([1, 2, 3])), OWNING_WORKER_ID));
    assert!(h.owner.calls_to(owner_handler).is_empty());

    assert_eq!(h.pool.pump_timeout(Duration::from_secs(5)), 1);
    let calls = h.owner.calls_to(owner_handler);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0][0], json!("done"));
    assert_eq!(calls[0][1], json!(worker));
    assert_eq!(calls[0][2]["origin"], json!("http://app.example.com"));
    assert_eq!(calls[0][2]["body"], json!([1, 2, 3]));
}

#[test]
fn test_missing_onmessage_handler_bubbles_to_owner() {
    let h = pool_with(RecordingFactory::new(), no_network());
    let worker = h.pool.create_worker(script("")).unwrap();

    assert!(h.pool.send_message("hello", None, worker));

    assert_eq!(h.pool.pump_timeout(Duration::from_secs(5)), 1);
    assert_eq!(
        h.owner.reported_errors(),
        vec![format!(
            "Error in worker {worker}. Could not process message because worker \
             does not have an onmessage handler."
        )]
    );
}

#[test]
fn test_error_handler_verdict_controls_bubbling() {
    let error_handler = CallbackRef::new(31);

    // A truthy verdict consumes the error inside the worker.
    let h = pool_with(
        RecordingFactory::with_error_handler(error_handler, json!(true)),
        no_network(),
    );
    let worker = h.pool.create_worker(script("")).unwrap();
    h.factory.scope_for(worker).report_error("worker blew up");

    let handled = h.factory.host_for(worker).calls_to(error_handler);
    assert_eq!(handled.len(), 1);
    assert_eq!(handled[0][0]["message"], json!("worker blew up"));
    assert_eq!(h.pool.pump_timeout(Duration::from_millis(100)), 0);
    assert!(h.owner.reported_errors().is_empty());

    // A falsy verdict leaves the error unhandled; it still bubbles.
    let h = pool_with(
        RecordingFactory::with_error_handler(error_handler, Value::Null),
        no_network(),
    );
    let worker = h.pool.create_worker(script("")).unwrap();
    h.factory.scope_for(worker).report_error("worker blew up");

    assert_eq!(h.pool.pump_timeout(Duration::from_secs(5)), 1);
    assert_eq!(
        h.owner.reported_errors(),
        vec![format!("Error in worker {worker}. worker blew up")]
    );
    assert_eq!(
        h.factory.host_for(worker).calls_to(error_handler).len(),
        1
    );
}

#[test]
fn test_owner_error_handler_is_refused() {
    let h = pool_with(RecordingFactory::new(), no_network());

    assert!(matches!(
        h.pool.set_error_handler(CallbackRef::new(40)),
        Err(PoolError::OwnerErrorHandler)
    ));
    // The owner's message handler is fine.
    h.pool.set_message_handler(CallbackRef::new(41)).unwrap();
}

#[test]
fn test_send_validation() {
    let handler = CallbackRef::new(50);
    let h = pool_with(RecordingFactory::with_message_handler(handler), no_network());
    let worker = h.pool.create_worker(script("")).unwrap();

    // Unknown destination.
    assert!(!h.pool.send_message("x", None, 99));

    // Threads outside the pool cannot send.
    let pool = Arc::clone(&h.pool);
    let sent = thread::spawn(move || pool.send_message("x", None, OWNING_WORKER_ID))
        .join()
        .unwrap();
    assert!(!sent);

    assert!(h.pool.send_message("x", None, worker));
}

#[test]
fn test_shutdown_rejects_new_work_and_is_idempotent() {
    let h = pool_with(RecordingFactory::new(), no_network());
    let worker = h.pool.create_worker(script("")).unwrap();

    h.pool.shutdown();
    assert!(h.pool.is_shutting_down());
    assert!(!h.pool.send_message("late", None, worker));
    assert!(matches!(
        h.pool.create_worker(script("")),
        Err(PoolError::ShuttingDown)
    ));

    h.pool.shutdown();
    h.pool.join();
}

#[test]
fn test_url_worker_takes_origin_from_final_url() {
    let script_url = "http://scripts.example.com/worker.js";
    let transport =
        CannedTransport::respond(200, b"fetched body", Some("http://cdn.example.net/worker.js"));
    let h = pool_with(
        RecordingFactory::new(),
        CannedFactory::new(vec![Arc::clone(&transport)]),
    );

    let worker = h
        .pool
        .create_worker(WorkerSource::Url(script_url.to_string()))
        .unwrap();

    let host = h.factory.host_for(worker);
    wait_until("fetched body to run", || !host.ran_sources().is_empty());
    assert_eq!(host.ran_sources(), vec!["fetched body".to_string()]);
    assert_eq!(transport.opened_url().as_deref(), Some(script_url));

    // The redirect moved the script, and the worker's origin moved with it.
    assert_eq!(
        h.pool.worker_origin(worker).unwrap().to_string(),
        "http://cdn.example.net"
    );
}

#[test]
fn test_url_worker_fetch_failure_reports_and_leaves_worker_alive() {
    let url = "http://scripts.example.com/missing.js";
    let handler = CallbackRef::new(60);
    let h = pool_with(
        RecordingFactory::with_message_handler(handler),
        CannedFactory::new(vec![CannedTransport::respond(404, b"", None)]),
    );

    let worker = h
        .pool
        .create_worker(WorkerSource::Url(url.to_string()))
        .unwrap();

    assert_eq!(h.pool.pump_timeout(Duration::from_secs(5)), 1);
    assert_eq!(
        h.owner.reported_errors(),
        vec![format!(
            "Error in worker {worker}. Failed to load script. Status: 404 URL: {url}"
        )]
    );

    // The worker never got a body but still receives messages.
    assert!(h.pool.send_message("still there?", None, worker));
    let host = h.factory.host_for(worker);
    wait_until("message delivery to the empty worker", || {
        !host.calls_to(handler).is_empty()
    });
    assert!(host.ran_sources().is_empty());
}

#[test]
fn test_worker_scope_can_spawn_siblings() {
    let h = pool_with(RecordingFactory::new(), no_network());
    let first = h.pool.create_worker(script("")).unwrap();

    let sibling = h
        .factory
        .scope_for(first)
        .create_worker(script("sibling"))
        .unwrap();
    assert_eq!(sibling, 2);
    assert_eq!(h.pool.worker_count(), 3);

    let host = h.factory.host_for(sibling);
    wait_until("sibling body to run", || !host.ran_sources().is_empty());
    assert_eq!(h.pool.worker_origin(sibling), Some(page_origin()));
}
