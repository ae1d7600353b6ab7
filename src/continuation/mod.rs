//! Continuation chain links for in-flight asynchronous sequences.
//!
//! Every asynchronous step is represented by a [`Continuation`]: a
//! reference-counted node that knows which step called it. The chain of
//! parent pointers is what lets the detectors reconstruct "which qutexes
//! does this in-flight sequence already hold" without any global bookkeeping
//! on the hot path.
//!
//! Three step kinds exist:
//!
//! - **Non-posted**: completion invokes the stored callback synchronously on
//!   whatever thread called [`Continuation::complete`]. Only valid when the
//!   caller tolerates synchronous completion on an arbitrary thread.
//! - **Posted**: completion posts the callback to the caller's worker, so
//!   the callback always runs on the thread that started the sequence.
//! - **Serialized**: posted, plus an ordered [`LockSet`] of qutexes the step
//!   needs. Completion releases the lock set before posting.
//!
//! There is intentionally no locked non-posted variant: locking without
//! posting could only be implemented by spinning the worker, which is the
//! exact thing the qutex protocol exists to avoid.

mod fan_in;
mod lockvoker;

pub use fan_in::FanIn;
pub use lockvoker::Lockvoker;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::error::{die, Violation};
use crate::runtime::WorkerHandle;
use crate::sync::lock_set::LockSet;
use crate::sync::qutex::Qutex;
use crate::sync::SpinLock;

/// A boxed callable carried by continuations and posted to workers.
pub type Thunk = Box<dyn FnOnce() + Send + 'static>;

/// Process-unique identity of one asynchronous step.
///
/// Lockvoker handles are cloned into every qutex queue they register with,
/// so handle equality cannot mean object identity. Instead each step is
/// assigned a monotonic id at creation and every copy of its handle carries
/// it. Comparing ids is lock-free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct StepId(u64);

static NEXT_STEP_ID: AtomicU64 = AtomicU64::new(1);

impl StepId {
    fn next() -> Self {
        Self(NEXT_STEP_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Builds a step id from a raw value. Test helper; real ids are assigned
    /// by continuation construction.
    #[cfg(test)]
    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl core::fmt::Display for StepId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "step#{}", self.0)
    }
}

/// One link in a continuation chain.
///
/// The chain forms a DAG rooted at application-entry continuations: each
/// child holds a strong reference to its caller step, so history walks are
/// always safe for as long as any descendant is alive. Acyclicity holds by
/// construction: the parent is fixed at creation and never reassigned.
pub struct Continuation {
    id: StepId,
    parent: Option<Arc<Continuation>>,
    kind: ContinuationKind,
}

enum ContinuationKind {
    NonPosted {
        callback: SpinLock<Option<Thunk>>,
    },
    Posted {
        caller: WorkerHandle,
        callback: SpinLock<Option<Thunk>>,
    },
    Serialized(SerializedStep),
}

/// State specific to a serialized (lock-carrying) step.
pub(crate) struct SerializedStep {
    pub(crate) caller: WorkerHandle,
    pub(crate) callback: SpinLock<Option<Thunk>>,
    /// The ordered qutex collection this step acquires all-or-nothing.
    pub(crate) locks: LockSet,
    /// Suppresses duplicate posts when several qutexes wake the step's
    /// lockvoker at the same time. The only atomic visible to user code.
    pub(crate) awake: AtomicBool,
}

impl Continuation {
    /// Creates a non-posted step: completion runs the callback synchronously.
    pub fn non_posted(
        parent: Option<Arc<Continuation>>,
        callback: impl FnOnce() + Send + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: StepId::next(),
            parent,
            kind: ContinuationKind::NonPosted {
                callback: SpinLock::new(Some(Box::new(callback))),
            },
        })
    }

    /// Creates a posted step: completion posts the callback to `caller`.
    pub fn posted(
        parent: Option<Arc<Continuation>>,
        caller: &WorkerHandle,
        callback: impl FnOnce() + Send + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: StepId::next(),
            parent,
            kind: ContinuationKind::Posted {
                caller: caller.clone(),
                callback: SpinLock::new(Some(Box::new(callback))),
            },
        })
    }

    /// Creates a serialized step needing `qutexes`, in declaration order.
    ///
    /// The step does nothing until a [`Lockvoker`] is spawned for it; the
    /// lockvoker registers the step in every qutex queue and schedules the
    /// first acquisition attempt on its target worker.
    pub fn serialized(
        parent: Option<Arc<Continuation>>,
        caller: &WorkerHandle,
        qutexes: Vec<Arc<Qutex>>,
        callback: impl FnOnce() + Send + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: StepId::next(),
            parent,
            kind: ContinuationKind::Serialized(SerializedStep {
                caller: caller.clone(),
                callback: SpinLock::new(Some(Box::new(callback))),
                locks: LockSet::new(qutexes),
                awake: AtomicBool::new(false),
            }),
        })
    }

    /// Returns this step's process-unique id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> StepId {
        self.id
    }

    /// Returns the caller-step link, if this is not a root step.
    #[must_use]
    pub fn parent_link(&self) -> Option<&Arc<Continuation>> {
        self.parent.as_ref()
    }

    /// Returns true if this step carries a lock set.
    #[must_use]
    pub fn is_serialized(&self) -> bool {
        matches!(self.kind, ContinuationKind::Serialized(_))
    }

    /// Completes the step by invoking its original callback.
    ///
    /// For a serialized step the lock set is released first, so the callback
    /// (and everything downstream of it) observes consistent state; the
    /// release wakes the next waiter on each qutex. Posted and serialized
    /// callbacks run on the caller's worker; non-posted callbacks run
    /// directly on the current thread.
    ///
    /// Completing a non-serialized step twice is a no-op. Completing a
    /// serialized step twice is a protocol violation (its release would fire
    /// twice) and panics.
    pub fn complete(&self) {
        match &self.kind {
            ContinuationKind::NonPosted { callback } => {
                if let Some(callback) = callback.lock().take() {
                    callback();
                }
            }
            ContinuationKind::Posted { caller, callback } => {
                if let Some(callback) = callback.lock().take() {
                    caller.post(callback);
                }
            }
            ContinuationKind::Serialized(step) => {
                step.locks.release();
                if let Some(callback) = step.callback.lock().take() {
                    step.caller.post(callback);
                }
            }
        }
    }

    /// Releases one qutex of this serialized step ahead of completion.
    ///
    /// The final release at completion skips it. Panics if the step carries
    /// no lock set, the set is not all-acquired, or the qutex is not in the
    /// set.
    pub fn release_qutex_early(&self, qutex: &Arc<Qutex>) {
        match self.serialized_step() {
            Some(step) => step.locks.release_qutex_early(qutex),
            None => die(Violation::NotSerialized),
        }
    }

    pub(crate) fn serialized_step(&self) -> Option<&SerializedStep> {
        match &self.kind {
            ContinuationKind::Serialized(step) => Some(step),
            _ => None,
        }
    }

    /// Collects the qutexes held along this step's ancestor chain: every
    /// serialized ancestor contributes its full lock set. The step's own
    /// locks are excluded; it is the one failing to acquire them.
    pub(crate) fn held_ancestor_qutexes(&self) -> Vec<Arc<Qutex>> {
        let mut held = Vec::new();
        let mut cursor = self.parent.clone();
        while let Some(link) = cursor {
            if let Some(step) = link.serialized_step() {
                held.extend(step.locks.qutexes());
            }
            cursor = link.parent.clone();
        }
        held
    }
}

impl core::fmt::Debug for Continuation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let kind = match &self.kind {
            ContinuationKind::NonPosted { .. } => "NonPosted",
            ContinuationKind::Posted { .. } => "Posted",
            ContinuationKind::Serialized(_) => "Serialized",
        };
        f.debug_struct("Continuation")
            .field("id", &self.id)
            .field("kind", &kind)
            .field("parent", &self.parent.as_ref().map(|p| p.id))
            .finish()
    }
}
