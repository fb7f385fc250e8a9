//! The worker pool: thread management and message dispatch.

use crate::http::{CookieSource, HttpError, HttpTransportFactory};
use crate::script::{is_truthy, CallbackRef, ScriptError, ScriptHost};
use crate::sync::Event;
use crate::task::{AbortHandle, FetchOptions, TaskContext};
use crate::worker::{PoolError, SecurityOrigin, WorkerId, WorkerMessage, OWNING_WORKER_ID};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Upper bound on how long a worker sleeps between queue checks. Workers are
/// notified on enqueue and shutdown, so this only bounds lost-wakeup latency.
const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Creates one script host per worker, on that worker's thread.
///
/// `create` runs on the new worker's thread before the creating call
/// unblocks, and the scope it receives is already registered: handlers may
/// be installed from inside `create`. Return an error rather than panicking
/// when the engine cannot be brought up; the failure is reported to the
/// caller of [`WorkerPool::create_worker`].
pub trait ScriptHostFactory: Send + Sync {
    fn create(&self, scope: WorkerScope) -> Result<Arc<dyn ScriptHost>, ScriptError>;
}

/// Where a new worker's body comes from.
#[derive(Debug, Clone)]
pub enum WorkerSource {
    /// Script source evaluated directly. The worker inherits the pool's
    /// page origin.
    Script(String),
    /// Absolute http(s) URL fetched on the worker's own thread. The worker
    /// takes its origin from the final URL after redirects.
    Url(String),
}

/// A worker's view of its own pool, handed to [`ScriptHostFactory::create`].
///
/// The scope holds a weak pool reference, so a stashed clone never keeps the
/// pool alive. Operations on a dropped or shut-down pool fail soft: sends
/// return `false`, the rest report [`PoolError::ShuttingDown`].
#[derive(Clone)]
pub struct WorkerScope {
    pool: Weak<WorkerPool>,
    worker_id: WorkerId,
}

impl WorkerScope {
    /// Id of the worker this scope belongs to.
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Sends a message from this worker. Returns false when the pool is
    /// gone, shutting down, or `dest` cannot receive.
    pub fn send_message(&self, text: &str, body: Option<Value>, dest: WorkerId) -> bool {
        match self.pool.upgrade() {
            Some(pool) => pool.send_message_from(self.worker_id, text, body, dest),
            None => false,
        }
    }

    /// Installs this worker's message handler.
    pub fn set_message_handler(&self, handler: CallbackRef) -> Result<(), PoolError> {
        let pool = self.pool.upgrade().ok_or(PoolError::ShuttingDown)?;
        pool.set_message_handler_for(self.worker_id, handler)
    }

    /// Installs this worker's error handler. The owning worker has none;
    /// unhandled errors terminate at its host instead.
    pub fn set_error_handler(&self, handler: CallbackRef) -> Result<(), PoolError> {
        let pool = self.pool.upgrade().ok_or(PoolError::ShuttingDown)?;
        pool.set_error_handler_for(self.worker_id, handler)
    }

    /// Creates a sibling worker. Must be called from a pool thread.
    pub fn create_worker(&self, source: WorkerSource) -> Result<WorkerId, PoolError> {
        let pool = self.pool.upgrade().ok_or(PoolError::ShuttingDown)?;
        pool.create_worker(source)
    }

    /// Runs an error through this worker's handler chain, as for an
    /// uncaught script error. Intended to be called on the worker's own
    /// thread by the embedder's engine.
    pub fn report_error(&self, message: &str) {
        if let Some(pool) = self.pool.upgrade() {
            pool.handle_error_for(self.worker_id, message);
        }
    }

    /// This worker's current security origin.
    pub fn origin(&self) -> Option<SecurityOrigin> {
        let pool = self.pool.upgrade()?;
        pool.worker_origin(self.worker_id)
    }
}

/// An item queued for delivery on a worker's thread.
enum QueueItem {
    /// A cross-worker message for the destination's message handler.
    Message(WorkerMessage),
    /// An unhandled child error bubbling to the owning worker's host.
    Error(WorkerMessage),
}

/// Outcome of one bounded dequeue attempt.
enum Dequeued {
    Item(QueueItem),
    Idle,
    ShuttingDown,
}

struct WorkerEntry {
    /// Set by the worker thread once it starts; identifies the current
    /// worker for calls made on pool threads.
    thread_id: Option<ThreadId>,
    origin: SecurityOrigin,
    queue: VecDeque<QueueItem>,
    queue_cond: Arc<Condvar>,
    message_handler: Option<CallbackRef>,
    error_handler: Option<CallbackRef>,
    script_host: Option<Arc<dyn ScriptHost>>,
    /// Guards against an error handler's own errors re-entering it.
    in_error_handler: bool,
    /// True once the worker's script host exists. Messages to a worker
    /// whose initialization failed are refused.
    init_ok: bool,
    init_event: Arc<Event>,
    /// Abort handle for an in-flight worker script fetch.
    fetch_abort: Option<AbortHandle>,
    thread_handle: Option<JoinHandle<()>>,
}

impl WorkerEntry {
    fn new(origin: SecurityOrigin) -> Self {
        Self {
            thread_id: None,
            origin,
            queue: VecDeque::new(),
            queue_cond: Arc::new(Condvar::new()),
            message_handler: None,
            error_handler: None,
            script_host: None,
            in_error_handler: false,
            init_ok: false,
            init_event: Arc::new(Event::new()),
            fetch_abort: None,
            thread_handle: None,
        }
    }
}

struct PoolState {
    workers: Vec<WorkerEntry>,
    shutting_down: bool,
}

/// A pool of script workers with cross-worker messaging.
///
/// The creating thread is registered as worker 0, the owning worker. It has
/// no dispatch loop of its own; it collects deliveries by calling [`pump`]
/// or [`pump_timeout`]. Every other worker runs a dedicated thread that
/// evaluates its body and then loops delivering queued items.
///
/// Shutdown flips a flag under the state lock and wakes everything; worker
/// threads notice and exit without being joined. [`join`] waits for them,
/// and dropping the pool shuts down and joins implicitly.
///
/// [`pump`]: WorkerPool::pump
/// [`pump_timeout`]: WorkerPool::pump_timeout
/// [`join`]: WorkerPool::join
pub struct WorkerPool {
    state: Mutex<PoolState>,
    page_origin: SecurityOrigin,
    script_factory: Arc<dyn ScriptHostFactory>,
    transport_factory: Arc<dyn HttpTransportFactory>,
    cookies: Arc<dyn CookieSource>,
    weak: Weak<WorkerPool>,
}

impl WorkerPool {
    /// Creates a pool owned by the calling thread.
    ///
    /// `owner_host` is worker 0's script host; unhandled child errors end
    /// up at its `report_error`.
    pub fn new(
        page_origin: SecurityOrigin,
        owner_host: Arc<dyn ScriptHost>,
        script_factory: Arc<dyn ScriptHostFactory>,
        transport_factory: Arc<dyn HttpTransportFactory>,
        cookies: Arc<dyn CookieSource>,
    ) -> Arc<Self> {
        let pool = Arc::new_cyclic(|weak| {
            let mut owner = WorkerEntry::new(page_origin.clone());
            owner.thread_id = Some(thread::current().id());
            owner.script_host = Some(owner_host);
            owner.init_ok = true;
            owner.init_event.signal();
            Self {
                state: Mutex::new(PoolState {
                    workers: vec![owner],
                    shutting_down: false,
                }),
                page_origin,
                script_factory,
                transport_factory,
                cookies,
                weak: weak.clone(),
            }
        });
        info!(origin = %pool.page_origin, "worker pool created");
        pool
    }

    /// The origin of the page that created the pool.
    pub fn page_origin(&self) -> &SecurityOrigin {
        &self.page_origin
    }

    /// Number of workers ever registered, including worker 0 and workers
    /// whose initialization failed. Ids are never reused.
    pub fn worker_count(&self) -> usize {
        self.state.lock().unwrap().workers.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().unwrap().shutting_down
    }

    /// Id of the pool worker running on the calling thread, if any.
    pub fn current_worker_id(&self) -> Option<WorkerId> {
        let current = thread::current().id();
        let state = self.state.lock().unwrap();
        state
            .workers
            .iter()
            .position(|entry| entry.thread_id == Some(current))
    }

    /// The current security origin of a worker. For URL workers this
    /// changes once the script fetch resolves redirects.
    pub fn worker_origin(&self, id: WorkerId) -> Option<SecurityOrigin> {
        let state = self.state.lock().unwrap();
        state.workers.get(id).map(|entry| entry.origin.clone())
    }

    /// Spawns a new worker and blocks until its script host exists.
    ///
    /// Must be called from a pool thread; the new worker's body runs
    /// concurrently with the caller once this returns. For
    /// [`WorkerSource::Url`] the URL must parse as an http(s) origin and
    /// the fetch happens on the new worker's thread, so a slow script
    /// server never stalls the creator.
    pub fn create_worker(&self, source: WorkerSource) -> Result<WorkerId, PoolError> {
        if self.current_worker_id().is_none() {
            return Err(PoolError::NotAWorkerThread);
        }
        let origin = match &source {
            WorkerSource::Script(_) => self.page_origin.clone(),
            WorkerSource::Url(url) => SecurityOrigin::parse(url)?,
        };

        let (id, init_event) = {
            let mut state = self.state.lock().unwrap();
            if state.shutting_down {
                return Err(PoolError::ShuttingDown);
            }
            let id = state.workers.len();
            let entry = WorkerEntry::new(origin);
            let init_event = entry.init_event.clone();
            state.workers.push(entry);
            (id, init_event)
        };

        let weak = self.weak.clone();
        let handle = thread::Builder::new()
            .name(format!("worker-{id}"))
            .spawn(move || worker_main(weak, id, source))
            .map_err(|e| PoolError::Spawn(e.to_string()))?;
        self.state.lock().unwrap().workers[id].thread_handle = Some(handle);

        init_event.wait();
        let initialized = self.state.lock().unwrap().workers[id].init_ok;
        if initialized {
            debug!(worker = id, "worker created");
            Ok(id)
        } else {
            Err(PoolError::WorkerInit(id))
        }
    }

    /// Queues a message from the calling worker to `dest`.
    ///
    /// Returns false when the pool is shutting down, the calling thread is
    /// not a pool worker, `dest` is unknown, or `dest` never initialized.
    /// Delivery order between one sender and one destination is FIFO.
    pub fn send_message(&self, text: &str, body: Option<Value>, dest: WorkerId) -> bool {
        match self.current_worker_id() {
            Some(src) => self.send_message_from(src, text, body, dest),
            None => false,
        }
    }

    fn send_message_from(
        &self,
        src: WorkerId,
        text: &str,
        body: Option<Value>,
        dest: WorkerId,
    ) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.shutting_down {
            return false;
        }
        let origin = match state.workers.get(src) {
            Some(entry) => entry.origin.clone(),
            None => return false,
        };
        let Some(entry) = state.workers.get_mut(dest) else {
            return false;
        };
        if !entry.init_ok {
            return false;
        }
        entry.queue.push_back(QueueItem::Message(WorkerMessage {
            text: text.to_string(),
            sender: src,
            origin,
            body,
        }));
        entry.queue_cond.notify_all();
        true
    }

    /// Installs the message handler for the worker on the calling thread.
    pub fn set_message_handler(&self, handler: CallbackRef) -> Result<(), PoolError> {
        let id = self
            .current_worker_id()
            .ok_or(PoolError::NotAWorkerThread)?;
        self.set_message_handler_for(id, handler)
    }

    /// Installs the error handler for the worker on the calling thread.
    pub fn set_error_handler(&self, handler: CallbackRef) -> Result<(), PoolError> {
        let id = self
            .current_worker_id()
            .ok_or(PoolError::NotAWorkerThread)?;
        self.set_error_handler_for(id, handler)
    }

    fn set_message_handler_for(&self, id: WorkerId, handler: CallbackRef) -> Result<(), PoolError> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .workers
            .get_mut(id)
            .ok_or(PoolError::NotAWorkerThread)?;
        entry.message_handler = Some(handler);
        Ok(())
    }

    fn set_error_handler_for(&self, id: WorkerId, handler: CallbackRef) -> Result<(), PoolError> {
        if id == OWNING_WORKER_ID {
            return Err(PoolError::OwnerErrorHandler);
        }
        let mut state = self.state.lock().unwrap();
        let entry = state
            .workers
            .get_mut(id)
            .ok_or(PoolError::NotAWorkerThread)?;
        entry.error_handler = Some(handler);
        Ok(())
    }

    /// Delivers everything currently queued for the calling worker.
    ///
    /// Worker 0 has no dispatch loop, so its deliveries happen here, on the
    /// owning thread. Returns the number of items delivered; stops early
    /// once the pool is shutting down, leaving remaining items undelivered.
    pub fn pump(&self) -> usize {
        let Some(id) = self.current_worker_id() else {
            return 0;
        };
        let mut delivered = 0;
        loop {
            let item = {
                let mut state = self.state.lock().unwrap();
                if state.shutting_down {
                    return delivered;
                }
                state.workers[id].queue.pop_front()
            };
            match item {
                Some(item) => {
                    self.deliver(id, item);
                    delivered += 1;
                }
                None => return delivered,
            }
        }
    }

    /// Like [`pump`](WorkerPool::pump), but waits up to `timeout` for the
    /// first item before draining. Returns 0 on timeout or shutdown.
    pub fn pump_timeout(&self, timeout: Duration) -> usize {
        let Some(id) = self.current_worker_id() else {
            return 0;
        };
        let deadline = Instant::now() + timeout;
        loop {
            let drained = self.pump();
            if drained > 0 {
                return drained;
            }
            let now = Instant::now();
            if now >= deadline {
                return 0;
            }
            let state = self.state.lock().unwrap();
            if state.shutting_down {
                return 0;
            }
            if !state.workers[id].queue.is_empty() {
                continue;
            }
            let cond = state.workers[id].queue_cond.clone();
            let (guard, _) = cond.wait_timeout(state, deadline - now).unwrap();
            drop(guard);
        }
    }

    /// Begins shutdown: rejects new work, aborts in-flight script fetches,
    /// and wakes every worker so its thread can exit. Idempotent. Worker
    /// threads are not joined here; see [`join`](WorkerPool::join).
    ///
    /// Only the owning worker shuts the pool down.
    pub fn shutdown(&self) {
        debug_assert_eq!(self.current_worker_id(), Some(OWNING_WORKER_ID));
        self.shutdown_inner();
    }

    fn shutdown_inner(&self) {
        let (aborts, conds, events) = {
            let mut state = self.state.lock().unwrap();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            let owner = &mut state.workers[OWNING_WORKER_ID];
            owner.message_handler = None;
            owner.error_handler = None;

            let mut aborts = Vec::new();
            let mut conds = Vec::new();
            let mut events = Vec::new();
            for entry in &mut state.workers {
                if let Some(abort) = entry.fetch_abort.take() {
                    aborts.push(abort);
                }
                conds.push(entry.queue_cond.clone());
                events.push(entry.init_event.clone());
            }
            (aborts, conds, events)
        };
        info!(workers = conds.len(), "worker pool shutting down");
        for abort in aborts {
            abort.abort();
        }
        for event in events {
            event.signal();
        }
        for cond in conds {
            cond.notify_all();
        }
    }

    /// Waits for worker threads to exit. Call after
    /// [`shutdown`](WorkerPool::shutdown); skips the calling thread's own
    /// handle so a worker holding the last pool reference can still drop it.
    pub fn join(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut state = self.state.lock().unwrap();
            state
                .workers
                .iter_mut()
                .filter_map(|entry| entry.thread_handle.take())
                .collect()
        };
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("worker thread panicked during shutdown");
            }
        }
    }

    /// Registers the worker's thread and brings up its script host.
    /// Returns false when the worker thread should exit immediately.
    fn initialize_worker(&self, id: WorkerId, source: WorkerSource) -> bool {
        let init_event = {
            let mut state = self.state.lock().unwrap();
            let entry = &mut state.workers[id];
            entry.thread_id = Some(thread::current().id());
            let event = entry.init_event.clone();
            if state.shutting_down {
                event.signal();
                return false;
            }
            event
        };
        debug!(worker = id, "worker thread started");

        let scope = WorkerScope {
            pool: self.weak.clone(),
            worker_id: id,
        };
        let host = match self.script_factory.create(scope) {
            Ok(host) => {
                let mut state = self.state.lock().unwrap();
                let entry = &mut state.workers[id];
                entry.script_host = Some(host.clone());
                entry.init_ok = true;
                Some(host)
            }
            Err(error) => {
                warn!(worker = id, %error, "script host creation failed");
                None
            }
        };
        // Single signal point, success or failure; the creator is blocked
        // on this event.
        init_event.signal();
        let Some(host) = host else {
            return false;
        };

        let script = match source {
            WorkerSource::Script(text) => Some(text),
            WorkerSource::Url(url) => match self.fetch_worker_script(id, &url) {
                Ok(text) => text,
                Err(message) => {
                    self.handle_error_for(id, &message);
                    None
                }
            },
        };
        // A failed body load leaves the worker alive and able to receive
        // messages; the failure was already routed through the error chain.
        if let Some(text) = script {
            if let Err(error) = host.run(&text) {
                self.handle_error_for(id, &error.to_string());
            }
        }
        true
    }

    /// Fetches a URL worker's body on the worker's own thread.
    ///
    /// `Ok(None)` means the fetch was aborted by shutdown and the worker
    /// should idle. On success the worker's origin is rewritten from the
    /// final URL, so redirected workers are attributed to where the script
    /// actually lives.
    fn fetch_worker_script(&self, id: WorkerId, url: &str) -> Result<Option<String>, String> {
        let context = TaskContext::new(self.transport_factory.clone(), self.cookies.clone());
        {
            let mut state = self.state.lock().unwrap();
            if state.shutting_down {
                return Ok(None);
            }
            state.workers[id].fetch_abort = Some(context.abort_handle());
        }
        let outcome = context.http_get(url, &FetchOptions::default());
        self.state.lock().unwrap().workers[id].fetch_abort = None;

        match outcome {
            Err(HttpError::Aborted) => Ok(None),
            Err(_) => Err(format!("Failed to load script. URL: {url}")),
            Ok(payload) if payload.status != 200 => Err(format!(
                "Failed to load script. Status: {} URL: {url}",
                payload.status
            )),
            Ok(payload) => {
                match SecurityOrigin::parse(&payload.final_url) {
                    Ok(origin) => {
                        self.state.lock().unwrap().workers[id].origin = origin;
                    }
                    Err(_) => {
                        debug!(worker = id, "script final URL is not a valid origin");
                    }
                }
                Ok(Some(String::from_utf8_lossy(&payload.body).into_owned()))
            }
        }
    }

    /// One bounded wait on the worker's queue.
    fn dequeue_step(&self, id: WorkerId) -> Dequeued {
        let mut state = self.state.lock().unwrap();
        if state.shutting_down {
            return Dequeued::ShuttingDown;
        }
        if let Some(item) = state.workers[id].queue.pop_front() {
            return Dequeued::Item(item);
        }
        let cond = state.workers[id].queue_cond.clone();
        let (mut state, _) = cond.wait_timeout(state, QUEUE_POLL_INTERVAL).unwrap();
        // Re-check after waking; shutdown may have raced the notify.
        if state.shutting_down {
            return Dequeued::ShuttingDown;
        }
        match state.workers[id].queue.pop_front() {
            Some(item) => Dequeued::Item(item),
            None => Dequeued::Idle,
        }
    }

    fn deliver(&self, id: WorkerId, item: QueueItem) {
        match item {
            QueueItem::Message(message) => self.deliver_message(id, message),
            QueueItem::Error(report) => self.deliver_error_report(id, report),
        }
    }

    fn deliver_message(&self, id: WorkerId, message: WorkerMessage) {
        let (handler, host) = {
            let state = self.state.lock().unwrap();
            let entry = &state.workers[id];
            (entry.message_handler, entry.script_host.clone())
        };
        let Some(host) = host else {
            return;
        };
        let Some(handler) = handler else {
            self.handle_error_for(
                id,
                "Could not process message because worker does not have an onmessage handler.",
            );
            return;
        };
        let args = [
            Value::String(message.text.clone()),
            json!(message.sender),
            message.envelope(),
        ];
        if let Err(error) = host.invoke(&handler, &args) {
            self.handle_error_for(id, &error.to_string());
        }
    }

    fn deliver_error_report(&self, id: WorkerId, report: WorkerMessage) {
        // Error reports are only ever queued for the owning worker.
        debug_assert_eq!(id, OWNING_WORKER_ID);
        let host = {
            let state = self.state.lock().unwrap();
            state.workers[id].script_host.clone()
        };
        if let Some(host) = host {
            host.report_error(&report.text);
        }
    }

    /// Runs an error through a worker's handler chain.
    ///
    /// The worker's error handler gets first refusal; a truthy return marks
    /// the error handled. Errors raised while the handler itself is running
    /// skip it. Anything unhandled is queued for the owning worker with the
    /// source worker's id stamped into the text.
    fn handle_error_for(&self, id: WorkerId, message: &str) {
        let attempt = {
            let mut state = self.state.lock().unwrap();
            let entry = &mut state.workers[id];
            match (entry.in_error_handler, entry.error_handler, entry.script_host.clone()) {
                (false, Some(handler), Some(host)) => {
                    entry.in_error_handler = true;
                    Some((handler, host))
                }
                _ => None,
            }
        };
        let mut handled = false;
        if let Some((handler, host)) = attempt {
            let outcome = host.invoke(&handler, &[json!({ "message": message })]);
            self.state.lock().unwrap().workers[id].in_error_handler = false;
            handled = matches!(&outcome, Ok(value) if is_truthy(value));
        }
        if !handled {
            self.bubble_error_to_owner(id, message);
        }
    }

    fn bubble_error_to_owner(&self, source: WorkerId, message: &str) {
        let mut state = self.state.lock().unwrap();
        if state.shutting_down {
            return;
        }
        warn!(worker = source, "unhandled worker error: {message}");
        let origin = state.workers[source].origin.clone();
        let owner = &mut state.workers[OWNING_WORKER_ID];
        owner.queue.push_back(QueueItem::Error(WorkerMessage {
            text: format!("Error in worker {source}. {message}"),
            sender: source,
            origin,
            body: None,
        }));
        owner.queue_cond.notify_all();
    }

    fn clear_worker(&self, id: WorkerId) {
        let mut state = self.state.lock().unwrap();
        let entry = &mut state.workers[id];
        entry.message_handler = None;
        entry.error_handler = None;
        entry.script_host = None;
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown_inner();
        self.join();
    }
}

/// Body of every worker thread.
///
/// Holds the pool only weakly and re-acquires it per step, so the last
/// strong reference can die anywhere, including on a worker thread, and the
/// pool's drop still runs.
fn worker_main(weak: Weak<WorkerPool>, id: WorkerId, source: WorkerSource) {
    {
        let Some(pool) = weak.upgrade() else {
            return;
        };
        if !pool.initialize_worker(id, source) {
            return;
        }
    }
    loop {
        let Some(pool) = weak.upgrade() else {
            break;
        };
        match pool.dequeue_step(id) {
            Dequeued::Item(item) => pool.deliver(id, item),
            Dequeued::Idle => {}
            Dequeued::ShuttingDown => break,
        }
    }
    if let Some(pool) = weak.upgrade() {
        pool.clear_worker(id);
    }
    debug!(worker = id, "worker thread exiting");
}
