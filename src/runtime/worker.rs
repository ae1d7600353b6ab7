//! Single-threaded event-loop workers with FIFO posting.
//!
//! Each worker drains a queue of boxed callables on its own OS thread.
//! Posting is thread-safe; execution is strictly serial and runs every
//! callable to completion before the next. There is no preemption and no
//! suspension inside a callable; the qutex protocol depends on failed
//! acquirers returning promptly instead of blocking the loop.
//!
//! Posts from one source thread to one worker preserve their order.
//! `stop()` discards both queued and subsequently posted callables.
//!
//! When `trace_callables` is enabled, every callable logs the source
//! location it was posted from before running, the breadcrumb for "what
//! was this closure and who queued it" debugging.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::config;
use crate::continuation::Thunk;
use crate::tracing_compat::{debug, trace};

/// Process-unique worker identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(u64);

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

impl core::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "worker#{}", self.0)
    }
}

struct PostedJob {
    thunk: Thunk,
    origin: &'static Location<'static>,
}

struct JobQueue {
    jobs: VecDeque<PostedJob>,
    stopped: bool,
}

struct WorkerShared {
    id: WorkerId,
    name: String,
    queue: Mutex<JobQueue>,
    jobs_available: Condvar,
}

thread_local! {
    static CURRENT: RefCell<Option<WorkerHandle>> = const { RefCell::new(None) };
}

/// A cloneable, thread-safe reference to a worker's posting queue.
///
/// Equality is worker identity: two handles compare equal iff they refer to
/// the same worker.
#[derive(Clone)]
pub struct WorkerHandle {
    shared: Arc<WorkerShared>,
}

impl WorkerHandle {
    /// Returns the worker's process-unique id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> WorkerId {
        self.shared.id
    }

    /// Returns the worker's name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Returns a handle to the worker currently running this thread, if the
    /// calling thread is a worker thread.
    #[must_use]
    pub fn current() -> Option<WorkerHandle> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Returns true if the calling thread is this worker's thread.
    #[must_use]
    pub fn is_current(&self) -> bool {
        Self::current().is_some_and(|w| w == *self)
    }

    /// Enqueues a callable at the tail of the worker's FIFO.
    ///
    /// Callables posted after [`stop`](Self::stop) are discarded. The
    /// creation site is captured for `trace_callables` diagnostics.
    #[track_caller]
    pub fn post(&self, job: impl FnOnce() + Send + 'static) {
        let origin = Location::caller();
        let mut queue = self.shared.queue.lock();
        if queue.stopped {
            trace!(
                worker = %self.shared.name,
                origin = %origin,
                "discarding post to stopped worker"
            );
            return;
        }
        queue.jobs.push_back(PostedJob {
            thunk: Box::new(job),
            origin,
        });
        self.shared.jobs_available.notify_one();
    }

    /// Signals termination: queued callables are discarded and subsequent
    /// posts are dropped. The worker thread exits once it observes the stop.
    pub fn stop(&self) {
        let mut queue = self.shared.queue.lock();
        queue.stopped = true;
        queue.jobs.clear();
        self.shared.jobs_available.notify_all();
        debug!(worker = %self.shared.name, "worker stopped");
    }

    /// Returns true if the worker has been stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shared.queue.lock().stopped
    }

    /// Number of callables waiting in the FIFO. Diagnostic only; the value
    /// is stale the moment it is returned.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.shared.queue.lock().jobs.len()
    }
}

impl PartialEq for WorkerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id
    }
}

impl Eq for WorkerHandle {}

impl core::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .finish()
    }
}

/// An owned worker thread. Stops and joins on drop.
pub struct Worker {
    handle: WorkerHandle,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawns a named worker thread and starts its event loop.
    #[must_use]
    pub fn spawn(name: impl Into<String>) -> Self {
        let name = name.into();
        let shared = Arc::new(WorkerShared {
            id: WorkerId(NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed)),
            name: name.clone(),
            queue: Mutex::new(JobQueue {
                jobs: VecDeque::new(),
                stopped: false,
            }),
            jobs_available: Condvar::new(),
        });
        let handle = WorkerHandle {
            shared: Arc::clone(&shared),
        };
        let loop_handle = handle.clone();
        let thread = std::thread::Builder::new()
            .name(name)
            .spawn(move || run_loop(&loop_handle))
            .expect("failed to spawn worker thread");
        Self {
            handle,
            thread: Some(thread),
        }
    }

    /// Returns the posting handle for this worker.
    #[inline]
    #[must_use]
    pub fn handle(&self) -> &WorkerHandle {
        &self.handle
    }

    /// Stops the worker and waits for its thread to exit.
    pub fn join(mut self) {
        self.handle.stop();
        if let Some(thread) = self.thread.take() {
            thread.join().expect("worker thread panicked");
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.handle.stop();
        if let Some(thread) = self.thread.take() {
            // A panic on the worker already reported itself; do not
            // double-panic out of drop.
            let _ = thread.join();
        }
    }
}

impl core::fmt::Debug for Worker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.handle.id())
            .field("name", &self.handle.name())
            .finish()
    }
}

fn run_loop(handle: &WorkerHandle) {
    CURRENT.with(|current| {
        *current.borrow_mut() = Some(handle.clone());
    });

    loop {
        let job = {
            let mut queue = handle.shared.queue.lock();
            loop {
                if queue.stopped {
                    return;
                }
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                handle.shared.jobs_available.wait(&mut queue);
            }
        };

        if config::current().trace_callables {
            let _origin = job.origin;
            trace!(
                worker = %handle.shared.name,
                origin = %_origin,
                "running posted callable"
            );
        }
        (job.thunk)();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn posted_callables_run_in_fifo_order() {
        init_test_logging();
        crate::test_phase!("posted_callables_run_in_fifo_order");
        let worker = Worker::spawn("fifo");
        let (tx, rx) = mpsc::channel();

        for i in 0..16 {
            let tx = tx.clone();
            worker.handle().post(move || {
                tx.send(i).expect("send order");
            });
        }

        let received: Vec<i32> = (0..16)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).expect("recv"))
            .collect();
        let expected: Vec<i32> = (0..16).collect();
        crate::assert_with_log!(received == expected, "FIFO order preserved", expected, received);
        crate::test_complete!("posted_callables_run_in_fifo_order");
    }

    #[test]
    fn current_identifies_the_running_worker() {
        init_test_logging();
        crate::test_phase!("current_identifies_the_running_worker");
        let worker = Worker::spawn("identity");
        let (tx, rx) = mpsc::channel();

        let expected = worker.handle().clone();
        worker.handle().post(move || {
            let current = WorkerHandle::current();
            tx.send(current.is_some_and(|w| w == expected))
                .expect("send identity");
        });

        let matched = rx.recv_timeout(Duration::from_secs(5)).expect("recv");
        crate::assert_with_log!(matched, "current() matches handle", true, matched);

        // The test thread is not a worker.
        let outside = WorkerHandle::current().is_none();
        crate::assert_with_log!(outside, "no current outside workers", true, outside);
        crate::test_complete!("current_identifies_the_running_worker");
    }

    #[test]
    fn posts_after_stop_are_discarded() {
        init_test_logging();
        crate::test_phase!("posts_after_stop_are_discarded");
        let worker = Worker::spawn("stopper");
        let hits = Arc::new(AtomicUsize::new(0));

        worker.handle().stop();
        let observed = Arc::clone(&hits);
        worker.handle().post(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });

        worker.join();
        let count = hits.load(Ordering::SeqCst);
        crate::assert_with_log!(count == 0, "discarded post never ran", 0usize, count);
        crate::test_complete!("posts_after_stop_are_discarded");
    }

    #[test]
    fn handles_compare_by_worker_identity() {
        init_test_logging();
        crate::test_phase!("handles_compare_by_worker_identity");
        let a = Worker::spawn("ident-a");
        let b = Worker::spawn("ident-b");

        let same = a.handle().clone() == a.handle().clone();
        crate::assert_with_log!(same, "clones compare equal", true, same);
        let different = a.handle() != b.handle();
        crate::assert_with_log!(different, "distinct workers differ", true, different);
        crate::test_complete!("handles_compare_by_worker_identity");
    }

    #[test]
    fn cross_worker_posting_round_trip() {
        init_test_logging();
        crate::test_phase!("cross_worker_posting_round_trip");
        let first = Worker::spawn("pong-a");
        let second = Worker::spawn("pong-b");
        let (tx, rx) = mpsc::channel();

        let reply_to = first.handle().clone();
        let target = second.handle().clone();
        first.handle().post(move || {
            let tx = tx.clone();
            let reply_to = reply_to.clone();
            target.post(move || {
                let here = WorkerHandle::current().map(|w| w.name().to_string());
                reply_to.post(move || {
                    let back = WorkerHandle::current().map(|w| w.name().to_string());
                    tx.send((here, back)).expect("send trip");
                });
            });
        });

        let (there, back) = rx.recv_timeout(Duration::from_secs(5)).expect("recv");
        crate::assert_with_log!(
            there.as_deref() == Some("pong-b"),
            "hop ran on second worker",
            Some("pong-b"),
            there.as_deref()
        );
        crate::assert_with_log!(
            back.as_deref() == Some("pong-a"),
            "reply ran on first worker",
            Some("pong-a"),
            back.as_deref()
        );
        crate::test_complete!("cross_worker_posting_round_trip");
    }
}
