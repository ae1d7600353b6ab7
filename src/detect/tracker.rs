//! Global acquisition history for gridlock suspects.
//!
//! When a lockvoker outlives the gridlock timeout without acquiring its lock
//! set, it records itself here: the qutex it wants (the first one that
//! failed this attempt) and the qutexes its ancestor chain already holds.
//! Later suspects consult these entries to decide whether the stall looks
//! circular.
//!
//! The table is guarded by a [`SpinLock`] and deliberately not by a qutex:
//! it is reached from inside the lockvoker's own acquisition path, and
//! coordinating it with the primitive under construction would close a
//! cycle in the protocol's bootstrap.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use crate::continuation::StepId;
use crate::detect::graph::DependencyGraph;
use crate::detect::{CycleReport, EdgeReport};
use crate::sync::qutex::Qutex;
use crate::sync::SpinLock;

/// Spinlock-guarded table of suspected-gridlocked steps.
pub struct AcquisitionHistory {
    entries: SpinLock<BTreeMap<StepId, HistoryEntry>>,
}

struct HistoryEntry {
    /// The qutex this step wants but could not acquire.
    wanted: Arc<Qutex>,
    /// Every qutex held along the step's ancestor chain at registration.
    held: Vec<Arc<Qutex>>,
}

static GLOBAL: OnceLock<AcquisitionHistory> = OnceLock::new();

impl AcquisitionHistory {
    /// Creates an empty history. Detection uses [`global`](Self::global);
    /// standalone instances exist for tests.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: SpinLock::new(BTreeMap::new()),
        }
    }

    /// The process-wide history consulted by the detectors.
    #[must_use]
    pub fn global() -> &'static Self {
        GLOBAL.get_or_init(Self::new)
    }

    /// Number of tracked suspects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if no suspects are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records a suspect. A step already present keeps its original entry:
    /// the first timed-out attempt fixed what it wants and holds.
    ///
    /// Returns true if the entry was inserted.
    pub(crate) fn add_if_not_exists(
        &self,
        step: StepId,
        wanted: Arc<Qutex>,
        held: Vec<Arc<Qutex>>,
    ) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(&step) {
            return false;
        }
        entries.insert(step, HistoryEntry { wanted, held });
        true
    }

    /// Removes a suspect, returning whether it was present. Called when a
    /// tracked step later acquires its lock set, meaning the suspicion was a false
    /// positive caused by delay rather than circular waiting.
    pub(crate) fn remove(&self, step: StepId) -> bool {
        self.entries.lock().remove(&step).is_some()
    }

    /// Heuristic gridlock scan: does any other tracked step hold `wanted`?
    ///
    /// This is the cheap first stage, `O(entries * average held)`, and
    /// catches the common two-sequence cycle. A hit only means "likely";
    /// the dependency-graph stage decides whether the wait is truly
    /// circular rather than one long-running holder.
    pub(crate) fn find_holder_of(&self, wanted: &Arc<Qutex>, current: StepId) -> Option<StepId> {
        let entries = self.entries.lock();
        for (&step, entry) in entries.iter() {
            if step == current {
                continue;
            }
            if entry.held.iter().any(|held| Arc::ptr_eq(held, wanted)) {
                return Some(step);
            }
        }
        None
    }

    /// Builds the wants-lock-held-by graph over the current entries.
    #[must_use]
    pub fn generate_graph(&self) -> DependencyGraph {
        build_graph(&self.entries.lock())
    }

    /// Complete gridlock check: builds the dependency graph and renders
    /// every cycle with the qutex names along its edges.
    pub(crate) fn confirmed_cycles(&self) -> Vec<CycleReport> {
        let entries = self.entries.lock();
        let graph = build_graph(&entries);
        graph
            .find_cycles()
            .into_iter()
            .map(|cycle| CycleReport {
                edges: (0..cycle.len())
                    .map(|i| {
                        let from = cycle[i];
                        let to = cycle[(i + 1) % cycle.len()];
                        EdgeReport {
                            from,
                            to,
                            wanted: entries
                                .get(&from)
                                .map(|entry| entry.wanted.name().to_string())
                                .unwrap_or_default(),
                        }
                    })
                    .collect(),
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Default for AcquisitionHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// Edge construction shared by the one-shot and hold-the-lock callers: an
/// edge runs from each step to every other step holding its wanted qutex.
fn build_graph(entries: &BTreeMap<StepId, HistoryEntry>) -> DependencyGraph {
    let mut graph = DependencyGraph::new();
    for &step in entries.keys() {
        graph.add_node(step);
    }
    for (&step, entry) in entries.iter() {
        for (&other, other_entry) in entries.iter() {
            if step == other {
                continue;
            }
            if other_entry
                .held
                .iter()
                .any(|held| Arc::ptr_eq(held, &entry.wanted))
            {
                graph.add_edge(step, other);
            }
        }
    }
    graph
}

impl core::fmt::Debug for AcquisitionHistory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AcquisitionHistory")
            .field("suspects", &self.len())
            .finish()
    }
}
