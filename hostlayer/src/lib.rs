//! HostLayer - background machinery for script hosts
//!
//! This library provides the concurrency core a script host needs: worker
//! threads with cross-worker messaging ([`worker`]), single-use abortable
//! HTTP tasks ([`task`] over [`http`]), and a geolocation arbitrator that
//! turns provider fixes into script callbacks ([`geolocation`]).
//!
//! # High-Level API
//!
//! Workers are managed through [`worker::WorkerPool`]:
//!
//! ```ignore
//! use hostlayer::worker::{WorkerPool, WorkerSource};
//!
//! let pool = WorkerPool::new(origin, owner_host, script_factory, transports, cookies);
//! let id = pool.create_worker(WorkerSource::Script(source))?;
//! pool.send_message("ping", None, id);
//! pool.pump_timeout(Duration::from_millis(100));
//! ```
//!
//! Position fixes go through [`geolocation::Geolocation`], which shares
//! location providers across requests and delivers results on the owning
//! thread's [`pump`](geolocation::Geolocation::pump).

pub mod bus;
pub mod geolocation;
pub mod http;
pub mod logging;
pub mod script;
pub mod sync;
pub mod task;
pub mod worker;

/// Version of the HostLayer library.
///
/// The version is defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
