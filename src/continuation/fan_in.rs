//! Join counter for fanned-out asynchronous sub-operations.
//!
//! A sequence that posts N sub-operations and continues when the last one
//! reports back needs a completion count that is safe to bump from any
//! worker. [`FanIn`] tracks successes and failures separately so the
//! continuation can tell a clean sweep from a partial one, and guarantees a
//! single completion winner even when outcomes land concurrently.
//!
//! ```ignore
//! let progress = Arc::new(FanIn::new(chunks.len() as u32));
//! for chunk in chunks {
//!     let progress = Arc::clone(&progress);
//!     worker.post(move || {
//!         let ok = flush(chunk);
//!         if progress.record(ok) {
//!             // last one out completes the sequence
//!         }
//!     });
//! }
//! ```

use std::sync::atomic::{AtomicU32, Ordering};

/// Success/failure counter joining `total` sub-operations.
#[derive(Debug)]
pub struct FanIn {
    total: u32,
    remaining: AtomicU32,
    succeeded: AtomicU32,
    failed: AtomicU32,
}

impl FanIn {
    /// Creates a counter expecting `total` outcomes.
    #[must_use]
    pub fn new(total: u32) -> Self {
        Self {
            total,
            remaining: AtomicU32::new(total),
            succeeded: AtomicU32::new(0),
            failed: AtomicU32::new(0),
        }
    }

    /// Records one outcome and returns true if this was the final one.
    ///
    /// The countdown is a single atomic, so exactly one caller observes
    /// true and the completion hand-off has an unambiguous winner. Must be
    /// called at most `total` times.
    pub fn record(&self, success: bool) -> bool {
        if success {
            self.succeeded.fetch_add(1, Ordering::AcqRel);
        } else {
            self.failed.fetch_add(1, Ordering::AcqRel);
        }
        let before = self.remaining.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(before > 0, "more outcomes recorded than expected");
        before == 1
    }

    /// Returns true once every expected outcome has been recorded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.remaining.load(Ordering::Acquire) == 0
    }

    /// Marks every not-yet-recorded slot as failed. Used when an error makes
    /// the remaining sub-operations moot. Returns true if this call
    /// completed the counter.
    pub fn fail_remaining(&self) -> bool {
        let remaining = self.remaining.swap(0, Ordering::AcqRel);
        if remaining > 0 {
            self.failed.fetch_add(remaining, Ordering::AcqRel);
        }
        remaining > 0
    }

    /// Number of expected outcomes.
    #[must_use]
    pub fn total(&self) -> u32 {
        self.total
    }

    /// Outcomes recorded as successful so far.
    #[must_use]
    pub fn succeeded(&self) -> u32 {
        self.succeeded.load(Ordering::Acquire)
    }

    /// Outcomes recorded as failed so far.
    #[must_use]
    pub fn failed(&self) -> u32 {
        self.failed.load(Ordering::Acquire)
    }

    /// Returns true for the degenerate zero-iteration loop, which has no
    /// final outcome to hand completion to.
    #[must_use]
    pub fn is_empty_total(&self) -> bool {
        self.total == 0
    }
}

impl Clone for FanIn {
    fn clone(&self) -> Self {
        Self {
            total: self.total,
            remaining: AtomicU32::new(self.remaining.load(Ordering::Acquire)),
            succeeded: AtomicU32::new(self.succeeded.load(Ordering::Acquire)),
            failed: AtomicU32::new(self.failed.load(Ordering::Acquire)),
        }
    }
}
