//! Deadlock and gridlock detection.
//!
//! Two distinct failure shapes are diagnosed, both opt-in through
//! [`DetectConfig::debug_lock_tracking`](crate::config::DetectConfig):
//!
//! - **Deadlock** — a single in-flight sequence re-acquiring a qutex it
//!   already holds. A descendant step whose lock set intersects an
//!   ancestor's can never be satisfied: the ancestor's release waits on the
//!   descendant's completion. Checked by walking the continuation chain at
//!   lockvoker construction, where it is a fatal error.
//! - **Gridlock** — several sequences in a circular wait, each wanting a
//!   qutex another holds. No single chain is inconsistent, so this can only
//!   be seen globally: timed-out steps register in the
//!   [`AcquisitionHistory`], a cheap heuristic scan flags likely cycles, and
//!   a [`DependencyGraph`] pass confirms and renders them.
//!
//! Findings are emitted as [`DetectorReport`] values through the installed
//! [`ReportSink`](sink::ReportSink).

pub mod graph;
pub mod sink;
pub mod tracker;

pub use graph::DependencyGraph;
pub use sink::{set_report_sink, CollectorSink, JsonlSink, LogSink, ReportSink};
pub use tracker::AcquisitionHistory;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::continuation::{Continuation, StepId};
use crate::error::{die, Violation};
use crate::sync::qutex::Qutex;

/// A detector finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DetectorReport {
    /// A step would wait on a qutex its own ancestor chain already holds.
    Deadlock {
        /// The waiting step.
        step: StepId,
        /// The ancestor whose lock set lists the qutex.
        ancestor: StepId,
        /// Name of the re-acquired qutex.
        qutex: String,
    },
    /// The heuristic stage found another tracked step holding the qutex
    /// this one wants.
    GridlockSuspected {
        /// The waiting step.
        step: StepId,
        /// The tracked step holding the wanted qutex.
        holder: StepId,
        /// Name of the wanted qutex.
        wanted: String,
        /// How long the waiting step has been pending.
        waited_ms: u64,
    },
    /// The complete stage found circular waiting among tracked steps.
    GridlockConfirmed {
        /// Every cycle in the dependency graph.
        cycles: Vec<CycleReport>,
    },
    /// A tracked suspect later acquired its lock set; the stall was delay,
    /// not circular waiting.
    FalsePositive {
        /// The previously suspected step.
        step: StepId,
    },
}

/// One confirmed cycle, edge by edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// The cycle's edges in order; the last edge closes back on the first
    /// step.
    pub edges: Vec<EdgeReport>,
}

/// One wants-lock-held-by edge of a confirmed cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EdgeReport {
    /// The waiting step.
    pub from: StepId,
    /// The step holding what `from` wants.
    pub to: StepId,
    /// Name of the wanted qutex.
    pub wanted: String,
}

impl core::fmt::Display for DetectorReport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Deadlock {
                step,
                ancestor,
                qutex,
            } => write!(
                f,
                "deadlock: {step} wants qutex '{qutex}' already held by its ancestor {ancestor}"
            ),
            Self::GridlockSuspected {
                step,
                holder,
                wanted,
                waited_ms,
            } => write!(
                f,
                "likely gridlock: {step} has waited {waited_ms}ms for qutex '{wanted}' held by {holder}"
            ),
            Self::GridlockConfirmed { cycles } => {
                write!(
                    f,
                    "gridlock: {} cycle(s) in the lock dependency graph",
                    cycles.len()
                )?;
                for (i, cycle) in cycles.iter().enumerate() {
                    write!(f, "\n  cycle {}:", i + 1)?;
                    for edge in &cycle.edges {
                        write!(
                            f,
                            "\n    {} wants '{}' held by {}",
                            edge.from, edge.wanted, edge.to
                        )?;
                    }
                }
                Ok(())
            }
            Self::FalsePositive { step } => write!(
                f,
                "false-positive gridlock suspect: {step} acquired its lock set; the stall was \
                 delay, not circular waiting"
            ),
        }
    }
}

/// Construction-time deadlock check: walks the new step's ancestor chain
/// and dies if any serialized ancestor's lock set intersects the new step's.
///
/// The walk starts at the parent, since the new step's own lock set necessarily
/// contains its own qutexes.
pub(crate) fn check_construction_deadlock(continuation: &Arc<Continuation>) {
    let Some(step) = continuation.serialized_step() else {
        return;
    };
    for qutex in step.locks.qutexes() {
        let mut cursor = continuation.parent_link().cloned();
        while let Some(link) = cursor {
            if let Some(ancestor) = link.serialized_step() {
                if ancestor.locks.contains(&qutex) {
                    let report = DetectorReport::Deadlock {
                        step: continuation.id(),
                        ancestor: link.id(),
                        qutex: qutex.name().to_string(),
                    };
                    sink::emit(&report);
                    die(Violation::DeadlockAtConstruction {
                        step: continuation.id(),
                        ancestor: link.id(),
                        qutex: qutex.name().to_string(),
                    });
                }
            }
            cursor = link.parent_link().cloned();
        }
    }
}

/// Detection pipeline for a failed attempt that has outlived the gridlock
/// timeout.
///
/// Re-checks the same-sequence shape against the qutex that actually failed
/// (report-only at this point; the fatal check ran at construction), then
/// registers the step as a gridlock suspect and runs the two-stage cycle
/// check.
pub(crate) fn on_timed_out_backoff(
    continuation: &Arc<Continuation>,
    first_failed: &Arc<Qutex>,
    waited: Duration,
) {
    let step = continuation.id();

    let mut cursor = continuation.parent_link().cloned();
    while let Some(link) = cursor {
        if let Some(ancestor) = link.serialized_step() {
            if ancestor.locks.contains(first_failed) {
                sink::emit(&DetectorReport::Deadlock {
                    step,
                    ancestor: link.id(),
                    qutex: first_failed.name().to_string(),
                });
                break;
            }
        }
        cursor = link.parent_link().cloned();
    }

    let tracker = AcquisitionHistory::global();
    let held = continuation.held_ancestor_qutexes();
    tracker.add_if_not_exists(step, Arc::clone(first_failed), held);

    // Heuristic stage: cheap scan for any tracked holder of the wanted
    // qutex. Only when it flags do we pay for the full graph construction.
    if let Some(holder) = tracker.find_holder_of(first_failed, step) {
        sink::emit(&DetectorReport::GridlockSuspected {
            step,
            holder,
            wanted: first_failed.name().to_string(),
            waited_ms: waited.as_millis() as u64,
        });
        let cycles = tracker.confirmed_cycles();
        if !cycles.is_empty() {
            sink::emit(&DetectorReport::GridlockConfirmed { cycles });
        }
    }
}

/// A tracked suspect acquired its lock set after all: drop the entry and
/// record the false positive.
pub(crate) fn on_suspect_acquired(step: StepId) {
    if AcquisitionHistory::global().remove(step) {
        sink::emit(&DetectorReport::FalsePositive { step });
    }
}
