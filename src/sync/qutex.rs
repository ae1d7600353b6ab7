//! Queue-based asynchronous mutex.
//!
//! A qutex never blocks a worker thread. Would-be owners register a
//! lockvoker handle in the qutex's FIFO and attempt acquisition when their
//! worker runs them; a failed attempt simply returns, leaving the handle in
//! the queue to be woken by a later `release` or `backoff`.
//!
//! # Admission rule
//!
//! Acquisition is not strictly FIFO. Given queue length `L` and the
//! acquirer's required-set size `N`, the acquirer is admitted iff it sits
//! outside the rearmost `L / N` entries (and a single-lock acquirer must be
//! exactly at the head). A waiter that needs `N` qutexes only has to climb
//! into the top `(N-1)/N` window of each queue: wider admission to offset
//! the lower probability that all of its queues align at once.
//!
//! # Rotation
//!
//! When a multi-lock acquirer fails its overall acquisition while sitting at
//! the head of some queue, that queue rotates the head back by up to `N`
//! positions. Without this, a symmetric NxN arrangement (every participant
//! heads one queue while sitting in the rear window of another) reproduces
//! itself on every wake and no one progresses.
//!
//! # Wake invariant
//!
//! Every `release` and every `backoff` that leaves the queue non-empty wakes
//! the current front entry. Skipping the wake loses wakeups when a
//! single-lock waiter was passed over by a multi-lock waiter admitted
//! through the top-1/N window.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::continuation::{Lockvoker, StepId};
use crate::error::{die, Violation};
use crate::sync::SpinLock;
use crate::tracing_compat::trace;

/// A queue-based asynchronous mutex.
///
/// Handles registered in the queue are retained until their step acquires
/// the full lock set (which unregisters them) or the qutex itself is
/// dropped. A dormant lockvoker deliberately stays queued: the wake chain
/// depends on its presence.
pub struct Qutex {
    name: String,
    state: SpinLock<QutexState>,
}

struct QutexState {
    queue: VecDeque<QueueEntry>,
    owned: bool,
    owner: Option<StepId>,
}

struct QueueEntry {
    id: StepId,
    handle: Arc<Lockvoker>,
}

impl Qutex {
    /// Creates a new unowned qutex with a diagnostic name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: SpinLock::new(QutexState {
                queue: VecDeque::new(),
                owned: false,
                owner: None,
            }),
        })
    }

    /// Returns the qutex's diagnostic name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true if some step currently owns the qutex.
    #[must_use]
    pub fn is_owned(&self) -> bool {
        self.state.lock().owned
    }

    /// Returns the owning step, if any.
    #[must_use]
    pub fn owner(&self) -> Option<StepId> {
        self.state.lock().owner
    }

    /// Returns the number of registered waiters.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Appends a lockvoker handle to the queue tail.
    ///
    /// The entry's position is identified by the handle's step id, which
    /// stays valid across rotations.
    pub(crate) fn register(&self, handle: &Arc<Lockvoker>) {
        let mut state = self.state.lock();
        debug_assert!(
            !state.queue.iter().any(|e| e.id == handle.id()),
            "duplicate registration of {} in qutex '{}'",
            handle.id(),
            self.name
        );
        state.queue.push_back(QueueEntry {
            id: handle.id(),
            handle: Arc::clone(handle),
        });
    }

    /// Removes the entry for `step` from the queue.
    pub(crate) fn unregister(&self, step: StepId) {
        let mut state = self.state.lock();
        match state.queue.iter().position(|e| e.id == step) {
            Some(at) => {
                state.queue.remove(at);
            }
            None => die(Violation::UnregisterMissing {
                qutex: self.name.clone(),
                step,
            }),
        }
    }

    /// Attempts to acquire the qutex for `step`, whose lock set requires
    /// `n_required` qutexes in total.
    ///
    /// Returns false when the qutex is already owned or the step sits in the
    /// rearmost `L / n_required` window of the queue.
    ///
    /// # Panics
    ///
    /// If the queue is empty or does not contain `step`: registration must
    /// precede every acquisition attempt, because admission is computed
    /// against the caller's queue position.
    pub(crate) fn try_acquire(&self, step: StepId, n_required: usize) -> bool {
        let mut state = self.state.lock();

        let len = state.queue.len();
        if len == 0 {
            die(Violation::TryAcquireOnEmptyQueue {
                qutex: self.name.clone(),
            });
        }
        let Some(position) = state.queue.iter().position(|e| e.id == step) else {
            die(Violation::TryAcquireUnregistered {
                qutex: self.name.clone(),
                step,
            });
        };

        if state.owned {
            return false;
        }

        // Rearmost window that is NOT admissible. For n_required == 1 the
        // window spans everything behind the head; a sole waiter or a
        // window that rounds to zero admits unconditionally.
        let rear_window = len / n_required;
        let admitted = if len == 1 || rear_window < 1 {
            true
        } else if n_required == 1 {
            position == 0
        } else {
            position < len - rear_window
        };

        if admitted {
            state.owned = true;
            state.owner = Some(step);
        }
        admitted
    }

    /// Handles `step` abandoning an acquisition attempt in which it had
    /// acquired this qutex but failed to acquire its full lock set.
    ///
    /// Rotates the queue when the failed acquirer is at the head (the
    /// anti-stall measure described in the module docs), clears ownership,
    /// and wakes the new front entry.
    ///
    /// # Panics
    ///
    /// If the queue is empty, or the caller heads the queue with
    /// `n_required == 1` (an acquirer at the head needing one lock always
    /// succeeds), or rotation somehow left the caller at the head of a
    /// multi-entry queue.
    pub(crate) fn backoff(&self, step: StepId, n_required: usize) {
        let wake = {
            let mut state = self.state.lock();

            let len = state.queue.len();
            if len == 0 {
                die(Violation::BackoffOnEmptyQueue {
                    qutex: self.name.clone(),
                });
            }

            let front_is_caller = state.queue.front().map(|e| e.id) == Some(step);
            if front_is_caller && n_required == 1 {
                die(Violation::BackoffSingleLockAtFront {
                    qutex: self.name.clone(),
                });
            }

            if front_is_caller && len > 1 {
                // Move the failed head back: before the entry originally at
                // index n_required when the queue is longer than the lock
                // set, else to the absolute tail. Entries keep their step-id
                // position tokens across the move.
                let entry = state.queue.pop_front().expect("front exists");
                let at = if len > n_required {
                    n_required - 1
                } else {
                    len - 1
                };
                state.queue.insert(at, entry);
                trace!(
                    qutex = %self.name,
                    %step,
                    at,
                    "rotated failed head backward"
                );
            }

            state.owned = false;
            state.owner = None;

            let front = state.queue.front().expect("non-empty after rotation");
            if front.id == step && len > 1 {
                die(Violation::BackoffCallerStillAtFront {
                    qutex: self.name.clone(),
                });
            }

            // Always wake the new front, even without rotation: the caller
            // may have acquired through the top-1/N window while a
            // single-lock waiter slept at the head, and that waiter is only
            // ever woken by queue events on this qutex. The sole exception
            // is a single-entry queue, where the front is the caller itself.
            (len > 1).then(|| Arc::clone(&front.handle))
        };

        if let Some(handle) = wake {
            handle.awaken(false);
        }
    }

    /// Releases the qutex and wakes the front waiter, if any.
    ///
    /// # Panics
    ///
    /// If the qutex is not owned.
    pub(crate) fn release(&self) {
        let wake = {
            let mut state = self.state.lock();
            if !state.owned {
                die(Violation::ReleaseUnowned {
                    qutex: self.name.clone(),
                });
            }
            state.owned = false;
            state.owner = None;

            // The owner unregistered itself at acquisition, so the queue may
            // be empty here. Otherwise the front must be woken
            // unconditionally; releasing only "if we were at the front"
            // loses wakeups for single-lock waiters bypassed through the
            // top-1/N window.
            state.queue.front().map(|e| Arc::clone(&e.handle))
        };

        if let Some(handle) = wake {
            handle.awaken(false);
        }
    }

    /// Queue contents by step id, front first. Test observability.
    #[cfg(test)]
    pub(crate) fn queue_ids(&self) -> Vec<StepId> {
        self.state.lock().queue.iter().map(|e| e.id).collect()
    }
}

impl core::fmt::Debug for Qutex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Qutex")
            .field("name", &self.name)
            .field("owned", &state.owned)
            .field("owner", &state.owner)
            .field("queue_len", &state.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::continuation::Continuation;
    use crate::runtime::Worker;
    use crate::test_utils::init_test_logging;

    /// A lockvoker that is registered nowhere and posted nowhere, for
    /// driving queue mechanics by hand. The worker is stopped so stray
    /// wakeups are discarded instead of racing the test.
    fn sim() -> (Worker, impl Fn(&[Arc<Qutex>]) -> Arc<Lockvoker>) {
        let worker = Worker::spawn("qutex-sim");
        worker.handle().stop();
        let handle = worker.handle().clone();
        let make = move |qutexes: &[Arc<Qutex>]| {
            let step = Continuation::serialized(
                None,
                &handle,
                qutexes.to_vec(),
                || {},
            );
            Lockvoker::detached(step, &handle)
        };
        (worker, make)
    }

    #[test]
    fn sole_waiter_is_admitted() {
        init_test_logging();
        crate::test_phase!("sole_waiter_is_admitted");
        let (_worker, make) = sim();
        let q = Qutex::new("sole");
        let lv = make(&[Arc::clone(&q)]);

        q.register(&lv);
        let ok = q.try_acquire(lv.id(), 1);
        crate::assert_with_log!(ok, "sole waiter acquires", true, ok);
        crate::assert_with_log!(q.is_owned(), "owned after acquire", true, q.is_owned());
        let owner = q.owner();
        crate::assert_with_log!(owner == Some(lv.id()), "owner recorded", Some(lv.id()), owner);
        crate::test_complete!("sole_waiter_is_admitted");
    }

    #[test]
    fn owned_qutex_rejects_everyone() {
        init_test_logging();
        crate::test_phase!("owned_qutex_rejects_everyone");
        let (_worker, make) = sim();
        let q = Qutex::new("held");
        let a = make(&[Arc::clone(&q)]);
        let b = make(&[Arc::clone(&q)]);

        q.register(&a);
        q.register(&b);
        assert!(q.try_acquire(a.id(), 1));

        let rejected = !q.try_acquire(b.id(), 1);
        crate::assert_with_log!(rejected, "second acquirer rejected", true, rejected);
        crate::test_complete!("owned_qutex_rejects_everyone");
    }

    #[test]
    fn single_lock_acquirer_must_head_the_queue() {
        init_test_logging();
        crate::test_phase!("single_lock_acquirer_must_head_the_queue");
        let (_worker, make) = sim();
        let q = Qutex::new("fifo");
        let a = make(&[Arc::clone(&q)]);
        let b = make(&[Arc::clone(&q)]);

        q.register(&a);
        q.register(&b);

        let b_fails = !q.try_acquire(b.id(), 1);
        crate::assert_with_log!(b_fails, "non-head single-lock fails", true, b_fails);
        let a_wins = q.try_acquire(a.id(), 1);
        crate::assert_with_log!(a_wins, "head single-lock succeeds", true, a_wins);
        crate::test_complete!("single_lock_acquirer_must_head_the_queue");
    }

    #[test]
    fn admission_window_by_position() {
        init_test_logging();
        crate::test_phase!("admission_window_by_position");
        let (_worker, make) = sim();

        // Queue of 4; an N=2 acquirer is admitted in the top 2 positions
        // (rear window = 4 / 2 = 2) and rejected in the rear 2.
        for (position, expected) in [(0usize, true), (1, true), (2, false), (3, false)] {
            let q = Qutex::new(format!("window-{position}"));
            let lvs: Vec<_> = (0..4).map(|_| make(&[Arc::clone(&q)])).collect();
            for lv in &lvs {
                q.register(lv);
            }
            let verdict = q.try_acquire(lvs[position].id(), 2);
            crate::assert_with_log!(
                verdict == expected,
                "admission at position",
                (position, expected),
                (position, verdict)
            );
        }
        crate::test_complete!("admission_window_by_position");
    }

    #[test]
    fn tiny_rear_window_admits_everyone() {
        init_test_logging();
        crate::test_phase!("tiny_rear_window_admits_everyone");
        let (_worker, make) = sim();

        // Queue of 2, N=3: rear window = 2 / 3 = 0, so even the tail entry
        // is admitted.
        let q = Qutex::new("tiny-window");
        let a = make(&[Arc::clone(&q)]);
        let b = make(&[Arc::clone(&q)]);
        q.register(&a);
        q.register(&b);

        let tail_admitted = q.try_acquire(b.id(), 3);
        crate::assert_with_log!(tail_admitted, "tail admitted when window is 0", true, tail_admitted);
        crate::test_complete!("tiny_rear_window_admits_everyone");
    }

    #[test]
    fn release_clears_owner_and_keeps_queue() {
        init_test_logging();
        crate::test_phase!("release_clears_owner_and_keeps_queue");
        let (_worker, make) = sim();
        let q = Qutex::new("release");
        let a = make(&[Arc::clone(&q)]);
        let b = make(&[Arc::clone(&q)]);

        q.register(&a);
        q.register(&b);
        assert!(q.try_acquire(a.id(), 1));

        // The winner unregisters, then later releases.
        q.unregister(a.id());
        q.release();

        crate::assert_with_log!(!q.is_owned(), "unowned after release", false, q.is_owned());
        let remaining = q.queue_len();
        crate::assert_with_log!(remaining == 1, "loser still queued", 1usize, remaining);
        crate::test_complete!("release_clears_owner_and_keeps_queue");
    }

    #[test]
    fn backoff_rotates_head_to_lock_set_depth() {
        init_test_logging();
        crate::test_phase!("backoff_rotates_head_to_lock_set_depth");
        let (_worker, make) = sim();

        // Five waiters, N=2: the failed head is spliced before the entry
        // originally at index 2, landing at index 1.
        let q = Qutex::new("rotate-deep");
        let lvs: Vec<_> = (0..5).map(|_| make(&[Arc::clone(&q)])).collect();
        for lv in &lvs {
            q.register(lv);
        }

        assert!(q.try_acquire(lvs[0].id(), 2));
        q.backoff(lvs[0].id(), 2);

        let ids = q.queue_ids();
        let expected = vec![
            lvs[1].id(),
            lvs[0].id(),
            lvs[2].id(),
            lvs[3].id(),
            lvs[4].id(),
        ];
        crate::assert_with_log!(ids == expected, "head rotated to index 1", expected, ids);
        crate::assert_with_log!(!q.is_owned(), "ownership cleared", false, q.is_owned());
        crate::test_complete!("backoff_rotates_head_to_lock_set_depth");
    }

    #[test]
    fn backoff_rotates_to_tail_when_queue_is_short() {
        init_test_logging();
        crate::test_phase!("backoff_rotates_to_tail_when_queue_is_short");
        let (_worker, make) = sim();

        // Three waiters, N=5: queue is shorter than the lock set, so the
        // failed head goes to the absolute tail.
        let q = Qutex::new("rotate-short");
        let lvs: Vec<_> = (0..3).map(|_| make(&[Arc::clone(&q)])).collect();
        for lv in &lvs {
            q.register(lv);
        }

        assert!(q.try_acquire(lvs[0].id(), 5));
        q.backoff(lvs[0].id(), 5);

        let ids = q.queue_ids();
        let expected = vec![lvs[1].id(), lvs[2].id(), lvs[0].id()];
        crate::assert_with_log!(ids == expected, "head moved to tail", expected, ids);
        crate::test_complete!("backoff_rotates_to_tail_when_queue_is_short");
    }

    #[test]
    fn backoff_from_mid_queue_does_not_rotate() {
        init_test_logging();
        crate::test_phase!("backoff_from_mid_queue_does_not_rotate");
        let (_worker, make) = sim();

        let q = Qutex::new("no-rotate");
        let lvs: Vec<_> = (0..3).map(|_| make(&[Arc::clone(&q)])).collect();
        for lv in &lvs {
            q.register(lv);
        }

        // Position 1 of 3 with N=3: rear window = 1, admitted.
        assert!(q.try_acquire(lvs[1].id(), 3));
        q.backoff(lvs[1].id(), 3);

        let ids = q.queue_ids();
        let expected = vec![lvs[0].id(), lvs[1].id(), lvs[2].id()];
        crate::assert_with_log!(ids == expected, "order unchanged", expected, ids);
        crate::test_complete!("backoff_from_mid_queue_does_not_rotate");
    }

    #[test]
    fn symmetric_two_by_two_stall_breaks_after_one_rotation() {
        init_test_logging();
        crate::test_phase!("symmetric_two_by_two_stall_breaks_after_one_rotation");
        let (_worker, make) = sim();

        // The degenerate arrangement the rotation exists for: A heads q1
        // but sits in q2's rear window, B heads q2 but sits in q1's rear
        // window. Without rotation every wake reproduces this state.
        let q1 = Qutex::new("grid-a");
        let q2 = Qutex::new("grid-b");
        let a = make(&[Arc::clone(&q1), Arc::clone(&q2)]);
        let b = make(&[Arc::clone(&q2), Arc::clone(&q1)]);

        q1.register(&a);
        q1.register(&b);
        q2.register(&b);
        q2.register(&a);

        // A's attempt: wins q1 from the head, loses q2 from the rear.
        assert!(q1.try_acquire(a.id(), 2));
        let a_fails_q2 = !q2.try_acquire(a.id(), 2);
        crate::assert_with_log!(a_fails_q2, "A rejected from q2 rear", true, a_fails_q2);
        q1.backoff(a.id(), 2);

        let q1_ids = q1.queue_ids();
        crate::assert_with_log!(
            q1_ids == vec![b.id(), a.id()],
            "q1 rotated to [B, A]",
            vec![b.id(), a.id()],
            q1_ids
        );

        // B's attempt now wins both: it heads q2, and after the rotation it
        // also heads q1.
        assert!(q2.try_acquire(b.id(), 2));
        let b_wins_q1 = q1.try_acquire(b.id(), 2);
        crate::assert_with_log!(b_wins_q1, "B admitted to q1 after rotation", true, b_wins_q1);

        // B completes: unregister everywhere, release both.
        q1.unregister(b.id());
        q2.unregister(b.id());
        q1.release();
        q2.release();

        // A retries as the sole waiter in both queues and wins.
        assert!(q1.try_acquire(a.id(), 2));
        assert!(q2.try_acquire(a.id(), 2));
        crate::test_complete!("symmetric_two_by_two_stall_breaks_after_one_rotation");
    }

    mod properties {
        use super::*;
        use crate::runtime::WorkerHandle;
        use proptest::prelude::*;
        use std::sync::OnceLock;

        /// One stopped worker shared by every proptest case; stray wakeups
        /// are discarded instead of racing the assertions.
        fn prop_worker() -> &'static WorkerHandle {
            static WORKER: OnceLock<Worker> = OnceLock::new();
            let worker = WORKER.get_or_init(|| {
                let worker = Worker::spawn("qutex-props");
                worker.handle().stop();
                worker
            });
            worker.handle()
        }

        fn waiters(qutex: &Arc<Qutex>, count: usize) -> Vec<Arc<Lockvoker>> {
            let handle = prop_worker();
            (0..count)
                .map(|_| {
                    let step = Continuation::serialized(
                        None,
                        handle,
                        vec![Arc::clone(qutex)],
                        || {},
                    );
                    let lv = Lockvoker::detached(step, handle);
                    qutex.register(&lv);
                    lv
                })
                .collect()
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            /// The admissible positions always form a non-empty prefix of
            /// the queue: the head can always make progress, and admission
            /// deepens with the acquirer's lock-set size.
            #[test]
            fn admission_forms_a_nonempty_prefix(len in 1usize..12, n in 1usize..6) {
                let q = Qutex::new("prop-admission");
                let lvs = waiters(&q, len);

                let mut verdicts = Vec::with_capacity(len);
                for lv in &lvs {
                    let admitted = q.try_acquire(lv.id(), n);
                    if admitted {
                        q.release();
                    }
                    verdicts.push(admitted);
                }

                prop_assert!(verdicts[0], "head must always be admissible");
                let prefix_len = verdicts.iter().take_while(|&&v| v).count();
                prop_assert!(
                    verdicts[prefix_len..].iter().all(|&v| !v),
                    "admission must be a prefix: {verdicts:?}"
                );
                let expected_prefix = if len == 1 || len / n < 1 {
                    len
                } else if n == 1 {
                    1
                } else {
                    len - len / n
                };
                prop_assert_eq!(prefix_len, expected_prefix);
            }

            /// Rotation keeps every waiter queued, preserves the relative
            /// order of the others, and lands the failed head at the
            /// documented depth.
            #[test]
            fn rotation_preserves_membership(len in 2usize..12, n in 2usize..6) {
                let q = Qutex::new("prop-rotation");
                let lvs = waiters(&q, len);
                let before = q.queue_ids();

                prop_assert!(q.try_acquire(lvs[0].id(), n));
                q.backoff(lvs[0].id(), n);

                let after = q.queue_ids();
                prop_assert_eq!(after.len(), before.len());

                let expected_at = if len > n { n - 1 } else { len - 1 };
                prop_assert_eq!(after[expected_at], before[0]);

                let mut others_after = after.clone();
                others_after.remove(expected_at);
                prop_assert_eq!(&others_after[..], &before[1..]);

                prop_assert!(!q.is_owned(), "backoff must clear ownership");
            }
        }
    }

    #[test]
    #[should_panic(expected = "empty queue")]
    fn try_acquire_on_empty_queue_is_fatal() {
        let (_worker, make) = sim();
        let q = Qutex::new("empty-try");
        let lv = make(&[Arc::clone(&q)]);
        q.try_acquire(lv.id(), 1);
    }

    #[test]
    #[should_panic(expected = "not in the queue")]
    fn try_acquire_without_registration_is_fatal() {
        let (_worker, make) = sim();
        let q = Qutex::new("unregistered-try");
        let registered = make(&[Arc::clone(&q)]);
        let stranger = make(&[Arc::clone(&q)]);
        q.register(&registered);
        q.try_acquire(stranger.id(), 1);
    }

    #[test]
    #[should_panic(expected = "empty queue")]
    fn backoff_on_empty_queue_is_fatal() {
        let (_worker, make) = sim();
        let q = Qutex::new("empty-backoff");
        let lv = make(&[Arc::clone(&q)]);
        q.backoff(lv.id(), 2);
    }

    #[test]
    #[should_panic(expected = "always succeeds")]
    fn backoff_at_head_with_single_lock_is_fatal() {
        let (_worker, make) = sim();
        let q = Qutex::new("head-backoff");
        let lv = make(&[Arc::clone(&q)]);
        q.register(&lv);
        q.backoff(lv.id(), 1);
    }

    #[test]
    #[should_panic(expected = "unowned qutex")]
    fn release_unowned_is_fatal() {
        let q = Qutex::new("unowned-release");
        q.release();
    }
}
