//! Notification plumbing: a topic-keyed message bus and delayed posting.
//!
//! [`MessageBus`] is a broadcast channel keyed by topic string: publishing
//! clones the value to every live subscriber, in order per subscriber.
//! [`TimerScheduler`] posts a payload to a topic after a delay from a single
//! daemon thread; a zero delay means "on the receiver's next drain", which
//! turns synchronous triggers into asynchronous deliveries.
//!
//! Components that must run on one thread (the geolocation arbitrator)
//! receive cross-thread work exclusively as bus messages and drain them on
//! their own thread.

mod channel;
mod timer;

pub use channel::{MessageBus, Subscriber, SubscriberId};
pub use timer::{TimerHandle, TimerId, TimerScheduler};
