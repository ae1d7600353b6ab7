//! Report sinks for detector diagnostics.
//!
//! Detector findings are structured values, not log lines: a sink decides
//! what to do with them. The process-wide default renders through the
//! logging facade; tests install a [`CollectorSink`] and assert on the
//! reports directly; long-running deployments can append JSON lines with
//! [`JsonlSink`].

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::detect::DetectorReport;
use crate::tracing_compat::{error, warn};

/// Sink for detector reports.
///
/// Implementations must not panic: detection runs inside the acquisition
/// path, and a sink failure must never take the protocol down with it.
pub trait ReportSink: Send + Sync + fmt::Debug {
    /// Consumes a single report.
    fn emit(&self, report: &DetectorReport);
}

/// Default sink: renders reports through the logging facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl ReportSink for LogSink {
    fn emit(&self, report: &DetectorReport) {
        match report {
            DetectorReport::FalsePositive { .. } | DetectorReport::GridlockSuspected { .. } => {
                warn!("{report}");
            }
            DetectorReport::Deadlock { .. } | DetectorReport::GridlockConfirmed { .. } => {
                error!("{report}");
            }
        }
    }
}

/// In-memory sink retaining every report, for tests.
#[derive(Debug, Default)]
pub struct CollectorSink {
    reports: Mutex<Vec<DetectorReport>>,
}

impl CollectorSink {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies out every report seen so far.
    #[must_use]
    pub fn snapshot(&self) -> Vec<DetectorReport> {
        self.reports.lock().clone()
    }

    /// Removes and returns every report seen so far.
    #[must_use]
    pub fn take(&self) -> Vec<DetectorReport> {
        std::mem::take(&mut *self.reports.lock())
    }

    /// Number of reports retained.
    #[must_use]
    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    /// Returns true if no reports were emitted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReportSink for CollectorSink {
    fn emit(&self, report: &DetectorReport) {
        self.reports.lock().push(report.clone());
    }
}

/// JSONL file sink: one serialized report per line, flushed per write.
pub struct JsonlSink {
    file: Mutex<File>,
    path: PathBuf,
}

impl JsonlSink {
    /// Opens (or creates) the file at `path` for appending.
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            file: Mutex::new(file),
            path,
        })
    }

    /// Path of the output file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Debug for JsonlSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonlSink").field("path", &self.path).finish()
    }
}

impl ReportSink for JsonlSink {
    fn emit(&self, report: &DetectorReport) {
        // Best-effort: report loss is acceptable, protocol failure is not.
        match serde_json::to_string(report) {
            Ok(line) => {
                let mut file = self.file.lock();
                if writeln!(file, "{line}").and_then(|()| file.flush()).is_err() {
                    error!(path = ?self.path, "failed to write detector report");
                }
            }
            Err(_) => error!("failed to serialize detector report"),
        }
    }
}

static SINK: RwLock<Option<Arc<dyn ReportSink>>> = RwLock::new(None);

/// Installs the process-wide report sink, replacing the default
/// [`LogSink`]. Returns the previously installed sink, if any.
pub fn set_report_sink(sink: Arc<dyn ReportSink>) -> Option<Arc<dyn ReportSink>> {
    SINK.write().replace(sink)
}

/// Routes a report to the installed sink, or [`LogSink`] if none is set.
pub(crate) fn emit(report: &DetectorReport) {
    let sink = SINK.read().clone();
    match sink {
        Some(sink) => sink.emit(report),
        None => LogSink.emit(report),
    }
}
