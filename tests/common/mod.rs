//! Shared harness for the end-to-end scenarios.

#![allow(dead_code)]

use std::sync::mpsc;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use spinqueue::config::{self, DetectConfig};
use spinqueue::detect::{set_report_sink, CollectorSink, ReportSink};
use spinqueue::test_utils::init_test_logging;
use spinqueue::WorkerHandle;

/// Per-test setup: logging only.
pub fn init(test_name: &str) {
    init_test_logging();
    spinqueue::test_phase!(test_name);
}

/// Enables lock tracking with the given gridlock timeout and returns the
/// process-wide collector sink.
///
/// Config and sink are global, and tests in one binary run concurrently, so
/// the sink is installed exactly once and shared; callers filter the
/// collected reports by their own step ids.
pub fn install_detection(timeout: Duration) -> Arc<CollectorSink> {
    static COLLECTOR: OnceLock<Arc<CollectorSink>> = OnceLock::new();
    let collector = COLLECTOR.get_or_init(|| {
        config::install(DetectConfig {
            debug_lock_tracking: true,
            gridlock_timeout: timeout,
            trace_callables: false,
        })
        .expect("valid detection config");
        let collector = Arc::new(CollectorSink::new());
        set_report_sink(Arc::clone(&collector) as Arc<dyn ReportSink>);
        collector
    });
    Arc::clone(collector)
}

/// Posts a marker to `worker` and waits for it to run, guaranteeing every
/// callable posted from this thread beforehand has finished.
pub fn drain(worker: &WorkerHandle) {
    let (tx, rx) = mpsc::channel();
    worker.post(move || {
        tx.send(()).expect("drain marker");
    });
    rx.recv_timeout(Duration::from_secs(5))
        .expect("worker drained within timeout");
}

/// Polls `predicate` until it holds or the deadline passes.
pub fn eventually(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    predicate()
}
