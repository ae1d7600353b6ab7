//! Test logging infrastructure.
//!
//! Tests narrate their progress through three macros backed by this module:
//!
//! - [`test_phase!`](crate::test_phase): marks the start of a named phase.
//! - [`assert_with_log!`](crate::assert_with_log): logs expected/actual
//!   values before asserting, so failures carry context without rerunning.
//! - [`test_complete!`](crate::test_complete): marks successful completion.
//!
//! Verbosity is controlled by the `TEST_LOG_LEVEL` environment variable
//! (`error`, `warn`, `info`, `debug`, `trace`). Call [`init_test_logging`]
//! once at the top of each test.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Once, OnceLock};
use std::time::Instant;

/// Logging verbosity level for tests.
///
/// Levels are ordered from least to most verbose:
/// `Error < Warn < Info < Debug < Trace`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum TestLogLevel {
    /// Only errors and failures.
    Error,
    /// Warnings and above.
    Warn,
    /// General test progress.
    #[default]
    Info,
    /// Detailed per-operation output.
    Debug,
    /// Everything, including per-assertion records.
    Trace,
}

impl TestLogLevel {
    /// Returns a human-readable name for the level.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    /// Returns the level from the `TEST_LOG_LEVEL` environment variable.
    #[must_use]
    pub fn from_env() -> Self {
        std::env::var("TEST_LOG_LEVEL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }
}

impl std::fmt::Display for TestLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for TestLogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            _ => Err(()),
        }
    }
}

static INIT: Once = Once::new();
static LEVEL: AtomicU8 = AtomicU8::new(TestLogLevel::Info as u8);
static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Initializes test logging. Safe to call from every test; only the first
/// call in the process takes effect.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let level = TestLogLevel::from_env();
        LEVEL.store(level as u8, Ordering::Relaxed);
        EPOCH.get_or_init(Instant::now);
        eprintln!("[spinqueue test log: level {level}]");
    });
}

fn enabled(level: TestLogLevel) -> bool {
    LEVEL.load(Ordering::Relaxed) >= level as u8
}

fn stamp() -> f64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}

/// Logs the start of a named test phase at `Info` level.
pub fn log_phase(name: &str) {
    if enabled(TestLogLevel::Info) {
        eprintln!("[{:>9.4}s] ───── {name} ─────", stamp());
    }
}

/// Logs successful completion of a test at `Info` level.
pub fn log_complete(name: &str) {
    if enabled(TestLogLevel::Info) {
        eprintln!("[{:>9.4}s] ✓ {name}", stamp());
    }
}

/// Records an assertion. Failures always print; successes print at `Trace`.
pub fn log_assertion(message: &str, expected: &dyn Debug, actual: &dyn Debug, ok: bool) {
    if !ok {
        eprintln!(
            "[{:>9.4}s] ✗ ASSERT FAILED: {message}: expected {expected:?}, got {actual:?}",
            stamp()
        );
    } else if enabled(TestLogLevel::Trace) {
        eprintln!("[{:>9.4}s]   assert ok: {message} = {actual:?}", stamp());
    }
}

/// Marks the start of a named test phase.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        $crate::test_utils::log_phase($name)
    };
}

/// Marks successful completion of a test.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        $crate::test_utils::log_complete($name)
    };
}

/// Logs expected/actual values for an assertion, then asserts.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $message:expr, $expected:expr, $actual:expr) => {{
        let ok = $cond;
        $crate::test_utils::log_assertion($message, &$expected, &$actual, ok);
        assert!(ok, "{}: expected {:?}, got {:?}", $message, $expected, $actual);
    }};
}
