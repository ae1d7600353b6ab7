//! The lockvoker: a posted callable that acquires a lock set or goes dormant.
//!
//! A lockvoker is the runnable form of a pending serialized step. Spawning
//! one registers the step in every qutex queue of its lock set and posts the
//! lockvoker to its target worker. When the worker runs it:
//!
//! - on full acquisition it unregisters from all queues and runs the
//!   wrapped work synchronously;
//! - on failure it backs off whatever it acquired and simply returns; the
//!   worker is never blocked. The lockvoker is now dormant: absent from the
//!   worker's FIFO but still present in every qutex queue, where the next
//!   `release`/`backoff` on any of those qutexes re-posts it.
//!
//! This re-posting pattern ("spinqueueing") replaces blocking: contention
//! costs queue round-trips instead of a stalled thread.
//!
//! Shared copies of the handle live in each qutex queue and in the posting
//! queue; the `awake` flag on the serialized step suppresses duplicate posts
//! when several qutexes wake the same step at once.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config;
use crate::continuation::{Continuation, SerializedStep, StepId, Thunk};
use crate::detect;
use crate::error::{die, Violation};
use crate::runtime::WorkerHandle;
use crate::sync::SpinLock;
use crate::tracing_compat::trace;

/// A pending serialized step's runnable handle.
///
/// Identity is the step id of the serialized continuation the lockvoker
/// serves; every clone of the handle shares it.
pub struct Lockvoker {
    continuation: Arc<Continuation>,
    target: WorkerHandle,
    work: SpinLock<Option<Thunk>>,
    created_at: Instant,
}

impl Lockvoker {
    /// Registers `continuation`'s lock set in its qutex queues and posts the
    /// new lockvoker to `target` for its first acquisition attempt.
    ///
    /// `work` runs on `target` once the full lock set is acquired. It is
    /// responsible for eventually completing the continuation (directly or
    /// at the end of a longer asynchronous sequence), which releases the
    /// lock set and wakes downstream waiters.
    ///
    /// # Panics
    ///
    /// If `continuation` is not a serialized step, or (with
    /// `debug_lock_tracking` enabled) if the step's lock set intersects a
    /// lock set already held along its ancestor chain. The latter is a
    /// diagnosed deadlock: the same in-flight sequence would wait on a qutex
    /// it already holds, and no release can ever come.
    pub fn spawn(
        continuation: Arc<Continuation>,
        target: &WorkerHandle,
        work: impl FnOnce() + Send + 'static,
    ) -> Arc<Self> {
        if continuation.serialized_step().is_none() {
            die(Violation::NotSerialized);
        }
        if config::current().debug_lock_tracking {
            detect::check_construction_deadlock(&continuation);
        }

        let lockvoker = Arc::new(Self {
            continuation,
            target: target.clone(),
            work: SpinLock::new(Some(Box::new(work))),
            created_at: Instant::now(),
        });

        // First wake: set the awake flag before registering so that none of
        // the queues being joined can observe a release and post a duplicate
        // copy, then force the one real post.
        let step = lockvoker.serialized_step();
        step.awake.store(true, Ordering::Release);
        step.locks.register_in_queues(&lockvoker);
        lockvoker.awaken(true);
        lockvoker
    }

    /// Returns the step id this lockvoker serves. Handle equality is id
    /// equality.
    #[inline]
    #[must_use]
    pub fn id(&self) -> StepId {
        self.continuation.id()
    }

    /// Returns the serialized continuation this lockvoker serves.
    #[must_use]
    pub fn continuation(&self) -> &Arc<Continuation> {
        &self.continuation
    }

    /// Time since this lockvoker was created.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Schedules this lockvoker on its target worker.
    ///
    /// If the step is already awake (posted and not yet run), the call is a
    /// no-op unless `force` is set; the existing posted copy will perform
    /// the attempt. `force` is used exactly once, by the first-wake path,
    /// which pre-sets the flag to shut out racing queue wakes and must
    /// therefore post unconditionally.
    pub fn awaken(self: &Arc<Self>, force: bool) {
        let step = self.serialized_step();
        let was_awake = step.awake.swap(true, Ordering::AcqRel);
        if was_awake && !force {
            return;
        }
        let lockvoker = Arc::clone(self);
        self.target.post(move || lockvoker.run());
    }

    /// One acquisition attempt, run on the target worker.
    pub(crate) fn run(self: &Arc<Self>) {
        if !self.target.is_current() {
            die(Violation::WrongWorker {
                expected: self.target.name().to_string(),
                actual: WorkerHandle::current().map(|w| w.name().to_string()),
            });
        }

        let step = self.serialized_step();
        let cfg = config::current();
        let timed_out = cfg.debug_lock_tracking && self.age() >= cfg.gridlock_timeout;

        match step.locks.try_acquire_or_backoff(self.id()) {
            Err(first_failed) => {
                // Dormant: clear the awake flag first, so a release that
                // lands right after re-posts us instead of being swallowed.
                // We stay registered in every qutex queue; the wake chain
                // depends on those entries.
                step.awake.store(false, Ordering::Release);
                trace!(
                    step = %self.id(),
                    qutex = first_failed.name(),
                    "acquisition failed, going dormant"
                );
                if timed_out {
                    detect::on_timed_out_backoff(&self.continuation, &first_failed, self.age());
                }
            }
            Ok(()) => {
                // Queue slots only matter to other contenders' admission
                // windows; ownership already excludes them. Free the slots
                // before running work that may hold the locks across real
                // I/O.
                step.locks.unregister_from_queues(self.id());
                if timed_out {
                    detect::on_suspect_acquired(self.id());
                }
                if let Some(work) = self.work.lock().take() {
                    work();
                }
            }
        }
    }

    fn serialized_step(&self) -> &SerializedStep {
        self.continuation
            .serialized_step()
            .expect("lockvoker continuation is serialized")
    }

    /// Builds a lockvoker without registering or posting it, for driving
    /// queue mechanics by hand in tests.
    #[cfg(test)]
    pub(crate) fn detached(continuation: Arc<Continuation>, target: &WorkerHandle) -> Arc<Self> {
        assert!(continuation.is_serialized());
        Arc::new(Self {
            continuation,
            target: target.clone(),
            work: SpinLock::new(None),
            created_at: Instant::now(),
        })
    }
}

impl core::fmt::Debug for Lockvoker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Lockvoker")
            .field("step", &self.id())
            .field("target", &self.target.name())
            .finish()
    }
}
