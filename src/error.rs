//! Fatal violation types and the fail-fast reporting path.
//!
//! The coordination core has no recoverable errors: every condition described
//! here indicates a bug in the core itself or in a caller that broke the
//! protocol (acquiring without registering, releasing an unowned qutex,
//! running a lockvoker on the wrong worker). Such states cannot be repaired
//! in place, so they terminate the offending thread via [`die`], which
//! renders the violation and panics.
//!
//! Violations are typed rather than stringly built so call sites stay terse
//! and messages stay uniform (every message names the qutex or worker
//! involved and the invariant that broke).

use core::fmt;

use crate::continuation::StepId;

/// A broken invariant observed by the coordination core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// `try_acquire` ran against a qutex with an empty queue. Acquirers must
    /// register in the queue before trying.
    TryAcquireOnEmptyQueue {
        /// Name of the qutex involved.
        qutex: String,
    },
    /// `try_acquire` ran for a step that is not present in the queue.
    TryAcquireUnregistered {
        /// Name of the qutex involved.
        qutex: String,
        /// The step that attempted acquisition.
        step: StepId,
    },
    /// `backoff` ran against a qutex with an empty queue.
    BackoffOnEmptyQueue {
        /// Name of the qutex involved.
        qutex: String,
    },
    /// A single-lock acquirer backed off while at the head of the queue.
    /// An acquirer at the head with a required-set size of one always
    /// succeeds, so this state is unreachable through the protocol.
    BackoffSingleLockAtFront {
        /// Name of the qutex involved.
        qutex: String,
    },
    /// After rotation the failed acquirer is still at the head of a queue
    /// that holds more than one entry.
    BackoffCallerStillAtFront {
        /// Name of the qutex involved.
        qutex: String,
    },
    /// `release` ran against a qutex that is not owned.
    ReleaseUnowned {
        /// Name of the qutex involved.
        qutex: String,
    },
    /// `unregister` could not find the step in the queue.
    UnregisterMissing {
        /// Name of the qutex involved.
        qutex: String,
        /// The step that should have been present.
        step: StepId,
    },
    /// A lock-set operation ran before `register_in_queues`.
    LockSetNotRegistered {
        /// The operation that was attempted.
        op: &'static str,
    },
    /// `register_in_queues` ran twice for the same lock set.
    LockSetAlreadyRegistered,
    /// An operation that requires the all-acquired state ran without it.
    LockSetNotAcquired {
        /// The operation that was attempted.
        op: &'static str,
    },
    /// `try_acquire_or_backoff` ran while the set was already all-acquired.
    LockSetAlreadyAcquired,
    /// An early release named a qutex that is not part of the lock set.
    QutexNotInSet {
        /// Name of the qutex involved.
        qutex: String,
    },
    /// A lockvoker executed on a worker other than its target.
    WrongWorker {
        /// Name of the worker the lockvoker was bound to.
        expected: String,
        /// Name of the worker that actually ran it, if any.
        actual: Option<String>,
    },
    /// A lockvoker was spawned for a continuation that carries no lock set.
    NotSerialized,
    /// A descendant step tried to re-acquire a qutex already held along its
    /// own continuation chain. Detected at lockvoker construction.
    DeadlockAtConstruction {
        /// The step being constructed.
        step: StepId,
        /// The ancestor step whose lock set already lists the qutex.
        ancestor: StepId,
        /// Name of the re-acquired qutex.
        qutex: String,
    },
}

/// Coarse classification of a violation, mirroring the error surface split
/// between protocol misuse, threading misuse, and diagnosed deadlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViolationCategory {
    /// Queue or lock-set state machine misuse.
    Protocol,
    /// Execution on the wrong worker thread.
    ThreadSafety,
    /// Same-sequence re-acquisition caught by the deadlock detector.
    Deadlock,
}

impl Violation {
    /// Returns the category of this violation.
    #[must_use]
    pub const fn category(&self) -> ViolationCategory {
        match self {
            Self::WrongWorker { .. } => ViolationCategory::ThreadSafety,
            Self::DeadlockAtConstruction { .. } => ViolationCategory::Deadlock,
            _ => ViolationCategory::Protocol,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TryAcquireOnEmptyQueue { qutex } => write!(
                f,
                "try_acquire on qutex '{qutex}' with an empty queue - acquirers must register before trying"
            ),
            Self::TryAcquireUnregistered { qutex, step } => write!(
                f,
                "try_acquire on qutex '{qutex}' by {step} which is not in the queue"
            ),
            Self::BackoffOnEmptyQueue { qutex } => {
                write!(f, "backoff on qutex '{qutex}' with an empty queue")
            }
            Self::BackoffSingleLockAtFront { qutex } => write!(
                f,
                "backoff on qutex '{qutex}' by a single-lock acquirer at the head of the queue - \
                 a single-lock acquirer at the head always succeeds"
            ),
            Self::BackoffCallerStillAtFront { qutex } => write!(
                f,
                "backoff on qutex '{qutex}' left the failed acquirer at the head of a non-trivial queue"
            ),
            Self::ReleaseUnowned { qutex } => {
                write!(f, "release on unowned qutex '{qutex}'")
            }
            Self::UnregisterMissing { qutex, step } => {
                write!(f, "unregister on qutex '{qutex}' found no entry for {step}")
            }
            Self::LockSetNotRegistered { op } => {
                write!(f, "lock set {op} before register_in_queues")
            }
            Self::LockSetAlreadyRegistered => {
                write!(f, "lock set registered into its qutex queues twice")
            }
            Self::LockSetNotAcquired { op } => {
                write!(f, "lock set {op} without the all-acquired state")
            }
            Self::LockSetAlreadyAcquired => {
                write!(f, "lock set acquisition attempted while already all-acquired")
            }
            Self::QutexNotInSet { qutex } => {
                write!(f, "qutex '{qutex}' is not part of this lock set")
            }
            Self::WrongWorker { expected, actual } => match actual {
                Some(actual) => write!(
                    f,
                    "lockvoker bound to worker '{expected}' executed on worker '{actual}'"
                ),
                None => write!(
                    f,
                    "lockvoker bound to worker '{expected}' executed outside any worker"
                ),
            },
            Self::NotSerialized => {
                write!(f, "lockvoker spawned for a continuation without a lock set")
            }
            Self::DeadlockAtConstruction {
                step,
                ancestor,
                qutex,
            } => write!(
                f,
                "deadlock: {step} would re-acquire qutex '{qutex}' already held by its ancestor {ancestor}"
            ),
        }
    }
}

impl std::error::Error for Violation {}

/// Renders the violation, emits it to the diagnostic log, and panics.
///
/// The core holds no state that unwinding would corrupt: every internal lock
/// is released through a scoped guard, so the panic propagates cleanly to
/// the worker's top-level handler.
#[cold]
pub(crate) fn die(violation: Violation) -> ! {
    crate::tracing_compat::error!(
        category = ?violation.category(),
        "fatal violation: {violation}"
    );
    panic!("{violation}");
}
