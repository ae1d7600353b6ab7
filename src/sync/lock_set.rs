//! Ordered qutex collections acquired all-or-nothing.
//!
//! A serialized step declares every qutex it needs up front; the lock set
//! registers the step's lockvoker in each queue, then attempts acquisition
//! in declaration order. A single failure backs off every qutex acquired in
//! that attempt: the step either holds all of its qutexes or none of them.
//!
//! Registration strictly precedes acquisition: admission is computed from
//! the acquirer's queue position, so the acquirer must be present in the
//! queue to be admissible at all.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::continuation::{Lockvoker, StepId};
use crate::error::{die, Violation};
use crate::sync::qutex::Qutex;
use crate::sync::SpinLock;

/// The ordered collection of qutexes one serialized step needs.
///
/// State transitions: `initial → registered → all-acquired →
/// (some-released)* → fully-released`. The set belongs to exactly one step
/// and is never reused after its final release.
pub struct LockSet {
    state: SpinLock<LockSetState>,
}

struct LockSetState {
    locks: SmallVec<[LockUsage; 4]>,
    registered: bool,
    all_acquired: bool,
}

struct LockUsage {
    qutex: Arc<Qutex>,
    released_early: bool,
}

impl LockSet {
    /// Creates a lock set over `qutexes` in declaration order.
    pub(crate) fn new(qutexes: Vec<Arc<Qutex>>) -> Self {
        Self {
            state: SpinLock::new(LockSetState {
                locks: qutexes
                    .into_iter()
                    .map(|qutex| LockUsage {
                        qutex,
                        released_early: false,
                    })
                    .collect(),
                registered: false,
                all_acquired: false,
            }),
        }
    }

    /// Number of qutexes in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().locks.len()
    }

    /// Returns true if the set lists no qutexes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if `qutex` is one of the set's members.
    pub(crate) fn contains(&self, qutex: &Arc<Qutex>) -> bool {
        self.state
            .lock()
            .locks
            .iter()
            .any(|usage| Arc::ptr_eq(&usage.qutex, qutex))
    }

    /// Snapshot of the member qutexes in declaration order.
    pub(crate) fn qutexes(&self) -> Vec<Arc<Qutex>> {
        self.state
            .lock()
            .locks
            .iter()
            .map(|usage| Arc::clone(&usage.qutex))
            .collect()
    }

    /// Registers `handle` at the tail of every member qutex's queue, in
    /// declaration order.
    pub(crate) fn register_in_queues(&self, handle: &Arc<Lockvoker>) {
        let qutexes = {
            let mut state = self.state.lock();
            if state.registered {
                die(Violation::LockSetAlreadyRegistered);
            }
            state.registered = true;
            snapshot(&state)
        };
        for qutex in &qutexes {
            qutex.register(handle);
        }
    }

    /// Attempts to acquire every member qutex in declaration order.
    ///
    /// On the first failure, every qutex acquired in this attempt is backed
    /// off in reverse order and the failing qutex is returned. On full
    /// success the set transitions to all-acquired.
    pub(crate) fn try_acquire_or_backoff(&self, step: StepId) -> Result<(), Arc<Qutex>> {
        let qutexes = {
            let state = self.state.lock();
            if !state.registered {
                die(Violation::LockSetNotRegistered {
                    op: "try_acquire_or_backoff",
                });
            }
            if state.all_acquired {
                die(Violation::LockSetAlreadyAcquired);
            }
            snapshot(&state)
        };

        let n_required = qutexes.len();
        let mut first_failed = None;
        let mut acquired = 0usize;
        for qutex in &qutexes {
            if !qutex.try_acquire(step, n_required) {
                first_failed = Some(Arc::clone(qutex));
                break;
            }
            acquired += 1;
        }

        match first_failed {
            Some(failed) => {
                for qutex in qutexes[..acquired].iter().rev() {
                    qutex.backoff(step, n_required);
                }
                Err(failed)
            }
            None => {
                self.state.lock().all_acquired = true;
                Ok(())
            }
        }
    }

    /// Removes `step` from every member qutex's queue.
    ///
    /// Called immediately after the all-acquired transition: the step's
    /// queue slots only matter to other contenders' admission windows, and
    /// ownership already excludes them from acquiring.
    pub(crate) fn unregister_from_queues(&self, step: StepId) {
        let qutexes = {
            let state = self.state.lock();
            if !state.registered {
                die(Violation::LockSetNotRegistered {
                    op: "unregister_from_queues",
                });
            }
            snapshot(&state)
        };
        for qutex in &qutexes {
            qutex.unregister(step);
        }
    }

    /// Releases every member qutex not already released early, in
    /// declaration order, and leaves the all-acquired state.
    pub(crate) fn release(&self) {
        let qutexes = {
            let mut state = self.state.lock();
            if !state.registered {
                die(Violation::LockSetNotRegistered { op: "release" });
            }
            if !state.all_acquired {
                die(Violation::LockSetNotAcquired { op: "release" });
            }
            state.all_acquired = false;
            state
                .locks
                .iter()
                .filter(|usage| !usage.released_early)
                .map(|usage| Arc::clone(&usage.qutex))
                .collect::<Vec<_>>()
        };
        for qutex in &qutexes {
            qutex.release();
        }
    }

    /// Releases one member qutex ahead of the final release and marks it so
    /// [`release`](Self::release) skips it. Releasing the same qutex early
    /// twice is a no-op.
    pub(crate) fn release_qutex_early(&self, qutex: &Arc<Qutex>) {
        let release = {
            let mut state = self.state.lock();
            if !state.all_acquired {
                die(Violation::LockSetNotAcquired {
                    op: "release_qutex_early",
                });
            }
            let Some(usage) = state
                .locks
                .iter_mut()
                .find(|usage| Arc::ptr_eq(&usage.qutex, qutex))
            else {
                die(Violation::QutexNotInSet {
                    qutex: qutex.name().to_string(),
                });
            };
            if usage.released_early {
                false
            } else {
                usage.released_early = true;
                true
            }
        };
        if release {
            qutex.release();
        }
    }
}

/// Member qutexes in declaration order. Qutex operations run outside the
/// set's spinlock; the set is only ever driven by one logical actor at a
/// time (registration by the spawning thread, everything else by the target
/// worker), so a snapshot cannot go stale mid-operation.
fn snapshot(state: &LockSetState) -> Vec<Arc<Qutex>> {
    state
        .locks
        .iter()
        .map(|usage| Arc::clone(&usage.qutex))
        .collect()
}

impl core::fmt::Debug for LockSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LockSet")
            .field("len", &state.locks.len())
            .field("registered", &state.registered)
            .field("all_acquired", &state.all_acquired)
            .finish()
    }
}
