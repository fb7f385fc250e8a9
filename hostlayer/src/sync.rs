//! Cross-thread signalling primitives.
//!
//! Provides [`Event`], a latched auto-reset signal used for handshakes and
//! wakeups between threads: worker init handshakes, HTTP transport
//! completion, and provider thread wakeups all block on one.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A latched, auto-reset signal.
///
/// `signal()` latches the event; a subsequent `wait()` returns immediately
/// and consumes the latch. A signal delivered while a waiter is blocked
/// wakes it. Designed for a single consumer: when several threads wait on
/// the same event, exactly one of them consumes each signal.
pub struct Event {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    /// Creates a new unsignaled event.
    pub fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Latches the event and wakes waiters.
    ///
    /// Signalling an already-signaled event is a no-op; signals do not
    /// accumulate.
    pub fn signal(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        *signaled = true;
        self.cond.notify_all();
    }

    /// Blocks until the event is signaled, then consumes the signal.
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        while !*signaled {
            signaled = self.cond.wait(signaled).unwrap();
        }
        *signaled = false;
    }

    /// Blocks until the event is signaled or the timeout elapses.
    ///
    /// Returns `true` if the event was signaled (the signal is consumed),
    /// `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut signaled = self.signaled.lock().unwrap();
        while !*signaled {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, result) = self.cond.wait_timeout(signaled, deadline - now).unwrap();
            signaled = guard;
            if result.timed_out() && !*signaled {
                return false;
            }
        }
        *signaled = false;
        true
    }

    /// Returns whether the event is currently latched, without consuming it.
    pub fn is_signaled(&self) -> bool {
        *self.signaled.lock().unwrap()
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}
