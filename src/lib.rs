//! Queue-based asynchronous mutual exclusion for cooperative event-loop
//! workers.
//!
//! Spinqueue coordinates strictly single-threaded components that live on
//! [`Worker`] event loops and talk to each other only by posting callables.
//! Shared data is guarded by the [`Qutex`]: an asynchronous mutex whose
//! waiters are queue entries, not blocked threads.
//!
//! # How acquisition works
//!
//! A serialized step declares the qutexes it needs as a
//! [`Continuation::serialized`] and spawns a [`Lockvoker`] for it. The
//! lockvoker registers in every qutex's FIFO and posts itself to its target
//! worker. Each run is one atomic attempt:
//!
//! - all qutexes acquired → the step's work runs, and completing the
//!   continuation releases the locks and wakes the next waiters;
//! - any qutex refused → everything acquired in the attempt is backed off
//!   and the lockvoker returns, leaving the worker free. It stays in the
//!   qutex queues and is re-posted by the next `release` or `backoff` on
//!   any of them ("spinqueueing").
//!
//! Admission is fair-share rather than strictly FIFO: a waiter needing `N`
//! qutexes is admitted once it is outside the rearmost `1/N` of a queue,
//! which lets multi-lock acquirers interleave with single-lock ones without
//! starving either. A queue rotation on backoff breaks the symmetric
//! arrangements where admission alone would stall forever.
//!
//! # Diagnostics
//!
//! With [`config::DetectConfig::debug_lock_tracking`] enabled, the crate
//! diagnoses the two circular-wait shapes: same-sequence re-acquisition
//! (fatal at lockvoker construction) and cross-sequence gridlock (detected
//! after a configurable timeout and reported through a pluggable
//! [`detect::ReportSink`]).
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use spinqueue::{Continuation, Lockvoker, Qutex, Worker};
//!
//! let worker = Worker::spawn("db");
//! let caller = Worker::spawn("ui");
//! let accounts = Qutex::new("accounts");
//! let journal = Qutex::new("journal");
//!
//! let step = Continuation::serialized(
//!     None,
//!     caller.handle(),
//!     vec![Arc::clone(&accounts), Arc::clone(&journal)],
//!     || println!("transfer visible to the UI"),
//! );
//! let work_step = Arc::clone(&step);
//! Lockvoker::spawn(step, worker.handle(), move || {
//!     // both qutexes are held here
//!     work_step.complete(); // releases and notifies the caller
//! });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod continuation;
pub mod detect;
pub mod error;
pub mod runtime;
pub mod sync;
pub mod test_utils;

pub(crate) mod tracing_compat;

pub use continuation::{Continuation, FanIn, Lockvoker, StepId};
pub use detect::DetectorReport;
pub use error::{Violation, ViolationCategory};
pub use runtime::{Worker, WorkerHandle, WorkerId};
pub use sync::{LockSet, Qutex, SpinLock};
