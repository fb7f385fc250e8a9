//! Delayed message posting.

use crate::bus::MessageBus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Upper bound on one scheduler sleep; schedule and shutdown notify, so this
/// only bounds lost-wakeup latency.
const IDLE_WAIT: Duration = Duration::from_millis(500);

/// Identity of one scheduled timer. Ids are unique per scheduler and are
/// embedded in the payload by the schedule-time closure, so receivers can
/// recognize a stale firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

struct TimerEntry<T> {
    id: TimerId,
    due: Instant,
    topic: String,
    payload: T,
}

struct SchedulerState<T> {
    entries: Vec<TimerEntry<T>>,
    shutting_down: bool,
}

struct SchedulerShared<T> {
    state: Mutex<SchedulerState<T>>,
    cond: Condvar,
}

/// Cancels its timer when dropped.
///
/// Cancellation removes the pending entry; a timer that already fired is
/// unaffected, so a receiver that must not observe it compares the
/// [`TimerId`] in the payload against the handle it kept.
pub struct TimerHandle<T> {
    id: TimerId,
    shared: Weak<SchedulerShared<T>>,
}

impl<T> TimerHandle<T> {
    pub fn id(&self) -> TimerId {
        self.id
    }

    /// Removes the pending timer. No-op once fired or after scheduler
    /// shutdown.
    pub fn cancel(&self) {
        if let Some(shared) = self.shared.upgrade() {
            let mut state = shared.state.lock().unwrap();
            state.entries.retain(|entry| entry.id != self.id);
        }
    }
}

impl<T> Drop for TimerHandle<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Posts payloads to bus topics after a delay.
///
/// One daemon thread serves all timers. A zero delay is legal and common:
/// the payload is published on the scheduler thread's next pass, never
/// synchronously from [`schedule`](TimerScheduler::schedule), which keeps
/// delivery asynchronous for the receiver. Due timers publish in schedule
/// order.
pub struct TimerScheduler<T> {
    shared: Arc<SchedulerShared<T>>,
    next_id: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Clone + Send + 'static> TimerScheduler<T> {
    /// Spawns the scheduler daemon publishing into `bus`.
    pub fn start(bus: Arc<MessageBus<T>>) -> std::io::Result<Self> {
        let shared = Arc::new(SchedulerShared {
            state: Mutex::new(SchedulerState {
                entries: Vec::new(),
                shutting_down: false,
            }),
            cond: Condvar::new(),
        });
        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("timer-scheduler".to_string())
            .spawn(move || scheduler_main(thread_shared, bus))?;
        Ok(Self {
            shared,
            next_id: AtomicU64::new(1),
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Schedules a payload for `topic` after `delay`.
    ///
    /// `make` receives the new timer's id so the payload can carry it.
    /// Dropping the returned handle cancels the timer; keep it alive for as
    /// long as the firing is wanted.
    pub fn schedule(
        &self,
        delay: Duration,
        topic: &str,
        make: impl FnOnce(TimerId) -> T,
    ) -> TimerHandle<T> {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let entry = TimerEntry {
            id,
            due: Instant::now() + delay,
            topic: topic.to_string(),
            payload: make(id),
        };
        {
            let mut state = self.shared.state.lock().unwrap();
            if !state.shutting_down {
                state.entries.push(entry);
            }
        }
        self.shared.cond.notify_all();
        TimerHandle {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }
}

impl<T> TimerScheduler<T> {
    /// Number of timers waiting to fire.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().unwrap().entries.len()
    }

    /// Discards pending timers and stops the daemon. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            state.entries.clear();
        }
        self.shared.cond.notify_all();
        debug!("timer scheduler shutting down");
    }

    /// Waits for the daemon thread to exit.
    pub fn join(&self) {
        let handle = self.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("timer scheduler thread panicked");
            }
        }
    }
}

impl<T> Drop for TimerScheduler<T> {
    fn drop(&mut self) {
        self.shutdown();
        self.join();
    }
}

fn scheduler_main<T: Clone + Send + 'static>(
    shared: Arc<SchedulerShared<T>>,
    bus: Arc<MessageBus<T>>,
) {
    debug!("timer scheduler started");
    loop {
        let due = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if state.shutting_down {
                    return;
                }
                let now = Instant::now();
                let mut due: Vec<TimerEntry<T>> = Vec::new();
                let mut index = 0;
                while index < state.entries.len() {
                    if state.entries[index].due <= now {
                        due.push(state.entries.remove(index));
                    } else {
                        index += 1;
                    }
                }
                if !due.is_empty() {
                    break due;
                }
                let until_next = state
                    .entries
                    .iter()
                    .map(|entry| entry.due.saturating_duration_since(now))
                    .min()
                    .unwrap_or(IDLE_WAIT);
                let (next_state, _) = shared
                    .cond
                    .wait_timeout(state, until_next.min(IDLE_WAIT))
                    .unwrap();
                state = next_state;
            }
        };
        // Publish outside the lock; receivers may schedule further timers.
        for entry in due {
            bus.publish(&entry.topic, entry.payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (Arc<MessageBus<TimerId>>, TimerScheduler<TimerId>) {
        let bus = Arc::new(MessageBus::new());
        let scheduler = TimerScheduler::start(bus.clone()).unwrap();
        (bus, scheduler)
    }

    #[test]
    fn test_timer_fires_with_its_id() {
        let (bus, scheduler) = fixture();
        let sub = bus.subscribe("ticks");

        let handle = scheduler.schedule(Duration::from_millis(10), "ticks", |id| id);
        let fired = sub.recv_timeout(Duration::from_secs(5));
        assert_eq!(fired, Some(handle.id()));
    }

    #[test]
    fn test_zero_delay_timers_fire_in_schedule_order() {
        let (bus, scheduler) = fixture();
        let sub = bus.subscribe("ticks");

        let first = scheduler.schedule(Duration::ZERO, "ticks", |id| id);
        let second = scheduler.schedule(Duration::ZERO, "ticks", |id| id);

        assert_eq!(sub.recv_timeout(Duration::from_secs(5)), Some(first.id()));
        assert_eq!(sub.recv_timeout(Duration::from_secs(5)), Some(second.id()));
    }

    #[test]
    fn test_cancel_prevents_firing() {
        let (bus, scheduler) = fixture();
        let sub = bus.subscribe("ticks");

        let handle = scheduler.schedule(Duration::from_millis(200), "ticks", |id| id);
        handle.cancel();
        assert_eq!(scheduler.pending(), 0);
        assert_eq!(sub.recv_timeout(Duration::from_millis(400)), None);
    }

    #[test]
    fn test_dropping_handle_cancels() {
        let (bus, scheduler) = fixture();
        let sub = bus.subscribe("ticks");

        drop(scheduler.schedule(Duration::from_millis(200), "ticks", |id| id));
        assert_eq!(sub.recv_timeout(Duration::from_millis(400)), None);
    }

    #[test]
    fn test_cancel_after_fire_is_noop() {
        let (bus, scheduler) = fixture();
        let sub = bus.subscribe("ticks");

        let handle = scheduler.schedule(Duration::ZERO, "ticks", |id| id);
        assert!(sub.recv_timeout(Duration::from_secs(5)).is_some());
        handle.cancel();
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_shutdown_discards_pending_timers() {
        let (bus, scheduler) = fixture();
        let sub = bus.subscribe("ticks");

        let _held = scheduler.schedule(Duration::from_millis(50), "ticks", |id| id);
        scheduler.shutdown();
        scheduler.join();
        assert_eq!(sub.recv_timeout(Duration::from_millis(200)), None);
        // Scheduling after shutdown is a quiet no-op.
        let _late = scheduler.schedule(Duration::ZERO, "ticks", |id| id);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_timers_for_different_topics_stay_separate() {
        let (bus, scheduler) = fixture();
        let ticks = bus.subscribe("ticks");
        let tocks = bus.subscribe("tocks");

        let _a = scheduler.schedule(Duration::ZERO, "ticks", |id| id);
        assert!(ticks.recv_timeout(Duration::from_secs(5)).is_some());
        assert_eq!(tocks.try_recv(), None);
    }
}
