//! Liveness under symmetric cross-ordered lock sets.
//!
//! Two steps on different workers each need the same two qutexes, declared
//! in opposite orders. Admission alone can wedge this shape (each step
//! heads one queue while sitting in the other's rear window); the backoff
//! rotation must always let one of them through, after which the other
//! follows.

mod common;

use std::sync::{mpsc, Arc};
use std::time::Duration;

use spinqueue::{Continuation, Lockvoker, Qutex, Worker};

#[test]
fn opposed_two_lock_steps_both_complete() {
    common::init("opposed_two_lock_steps_both_complete");
    let caller = Worker::spawn("opposed-caller");

    for round in 0..50 {
        let w1 = Worker::spawn(format!("opposed-a-{round}"));
        let w2 = Worker::spawn(format!("opposed-b-{round}"));
        let q1 = Qutex::new(format!("opposed-first-{round}"));
        let q2 = Qutex::new(format!("opposed-second-{round}"));
        let (done_tx, done_rx) = mpsc::channel();

        let step_a = Continuation::serialized(
            None,
            caller.handle(),
            vec![Arc::clone(&q1), Arc::clone(&q2)],
            || {},
        );
        let work_a = Arc::clone(&step_a);
        let a_tx = done_tx.clone();
        Lockvoker::spawn(step_a, w1.handle(), move || {
            work_a.complete();
            a_tx.send("a").expect("A done");
        });

        let step_b = Continuation::serialized(
            None,
            caller.handle(),
            vec![Arc::clone(&q2), Arc::clone(&q1)],
            || {},
        );
        let work_b = Arc::clone(&step_b);
        let b_tx = done_tx.clone();
        Lockvoker::spawn(step_b, w2.handle(), move || {
            work_b.complete();
            b_tx.send("b").expect("B done");
        });

        // Bounded progress: both steps finish, in either order.
        let first = done_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("one step completed");
        let second = done_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("the other step completed");
        let both = (first == "a" && second == "b") || (first == "b" && second == "a");
        spinqueue::assert_with_log!(both, "both steps completed", true, both);

        spinqueue::assert_with_log!(!q1.is_owned(), "first qutex free", false, q1.is_owned());
        spinqueue::assert_with_log!(!q2.is_owned(), "second qutex free", false, q2.is_owned());
        spinqueue::assert_with_log!(q1.queue_len() == 0, "first queue empty", 0usize, q1.queue_len());
        spinqueue::assert_with_log!(q2.queue_len() == 0, "second queue empty", 0usize, q2.queue_len());

        w1.join();
        w2.join();
    }
    spinqueue::test_complete!("opposed_two_lock_steps_both_complete");
}

#[test]
fn many_single_lock_steps_on_one_qutex_all_complete() {
    common::init("many_single_lock_steps_on_one_qutex_all_complete");
    let worker = Worker::spawn("swarm-target");
    let caller = Worker::spawn("swarm-caller");
    let q = Qutex::new("swarm");
    let (done_tx, done_rx) = mpsc::channel();

    let total = 32;
    for _ in 0..total {
        let step = Continuation::serialized(None, caller.handle(), vec![Arc::clone(&q)], || {});
        let work_step = Arc::clone(&step);
        let tx = done_tx.clone();
        Lockvoker::spawn(step, worker.handle(), move || {
            work_step.complete();
            tx.send(()).expect("step done");
        });
    }

    for _ in 0..total {
        done_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("every step completed");
    }
    spinqueue::assert_with_log!(!q.is_owned(), "qutex free", false, q.is_owned());
    spinqueue::assert_with_log!(q.queue_len() == 0, "queue drained", 0usize, q.queue_len());
    spinqueue::test_complete!("many_single_lock_steps_on_one_qutex_all_complete");
}
