//! Configuration for the coordination core's diagnostic machinery.
//!
//! The core itself is configuration-free: admission, rotation, and wake
//! rules are fixed. What is configurable is the debugging surface:
//!
//! - `debug_lock_tracking`: owner recording plus the deadlock and gridlock
//!   detectors.
//! - `gridlock_timeout`: minimum lockvoker age before a failed attempt is
//!   treated as a gridlock suspect.
//! - `trace_callables`: origin logging for every posted callable.
//!
//! The advisory timeout only decides whether detection runs; it never
//! affects acquisition correctness.
//!
//! Configuration is process-global and installed once at startup:
//!
//! ```ignore
//! use spinqueue::config::{self, DetectConfig};
//!
//! let cfg = DetectConfig {
//!     debug_lock_tracking: true,
//!     ..DetectConfig::default()
//! };
//! config::install(cfg).expect("valid config");
//! ```

use std::time::Duration;

use parking_lot::RwLock;

/// Environment variable enabling or disabling lock tracking.
pub const ENV_DEBUG_LOCK_TRACKING: &str = "SPINQUEUE_DEBUG_LOCK_TRACKING";
/// Environment variable overriding the gridlock timeout in milliseconds.
pub const ENV_GRIDLOCK_TIMEOUT_MS: &str = "SPINQUEUE_GRIDLOCK_TIMEOUT_MS";
/// Environment variable enabling or disabling posted-callable tracing.
pub const ENV_TRACE_CALLABLES: &str = "SPINQUEUE_TRACE_CALLABLES";

/// Diagnostic configuration for qutex coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectConfig {
    /// Record qutex owners and run the deadlock/gridlock detectors.
    pub debug_lock_tracking: bool,
    /// Minimum lockvoker age before gridlock detection runs on a failed
    /// acquisition attempt. Must be non-zero.
    pub gridlock_timeout: Duration,
    /// Log the creation site of every posted callable when it runs.
    pub trace_callables: bool,
}

impl DetectConfig {
    const DEFAULT: Self = Self {
        debug_lock_tracking: cfg!(debug_assertions),
        gridlock_timeout: Duration::from_millis(2000),
        trace_callables: false,
    };

    /// Validates the configuration for basic sanity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gridlock_timeout.is_zero() {
            return Err(ConfigError::ZeroGridlockTimeout);
        }
        Ok(())
    }

    /// Returns the default configuration overlaid with any environment
    /// overrides (`SPINQUEUE_DEBUG_LOCK_TRACKING`,
    /// `SPINQUEUE_GRIDLOCK_TIMEOUT_MS`, `SPINQUEUE_TRACE_CALLABLES`).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(ENV_DEBUG_LOCK_TRACKING) {
            config.debug_lock_tracking = parse_flag(ENV_DEBUG_LOCK_TRACKING, &raw)?;
        }
        if let Ok(raw) = std::env::var(ENV_GRIDLOCK_TIMEOUT_MS) {
            let millis: u64 = raw.parse().map_err(|_| ConfigError::InvalidTimeout {
                value: raw.clone(),
            })?;
            config.gridlock_timeout = Duration::from_millis(millis);
        }
        if let Ok(raw) = std::env::var(ENV_TRACE_CALLABLES) {
            config.trace_callables = parse_flag(ENV_TRACE_CALLABLES, &raw)?;
        }
        config.validate()?;
        Ok(config)
    }
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

fn parse_flag(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidFlag {
            var,
            value: raw.to_string(),
        }),
    }
}

/// Error returned when a configuration fails validation or parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The gridlock timeout was zero; the detector needs a positive age
    /// threshold to distinguish slow progress from no progress.
    ZeroGridlockTimeout,
    /// A boolean environment flag held an unrecognised value.
    InvalidFlag {
        /// The variable that failed to parse.
        var: &'static str,
        /// The raw value found in the environment.
        value: String,
    },
    /// The timeout environment variable was not a number of milliseconds.
    InvalidTimeout {
        /// The raw value found in the environment.
        value: String,
    },
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::ZeroGridlockTimeout => write!(f, "gridlock timeout must be non-zero"),
            Self::InvalidFlag { var, value } => {
                write!(f, "{var}={value}: expected one of 1/0/true/false/on/off/yes/no")
            }
            Self::InvalidTimeout { value } => {
                write!(f, "invalid gridlock timeout '{value}': expected milliseconds")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

static CURRENT: RwLock<DetectConfig> = RwLock::new(DetectConfig::DEFAULT);

/// Installs a new process-wide configuration.
///
/// Later lockvoker spawns and worker callable dispatches observe the new
/// values; in-flight attempts keep the snapshot they read at entry.
pub fn install(config: DetectConfig) -> Result<(), ConfigError> {
    config.validate()?;
    *CURRENT.write() = config;
    Ok(())
}

/// Returns a snapshot of the current process-wide configuration.
#[must_use]
pub fn current() -> DetectConfig {
    *CURRENT.read()
}
