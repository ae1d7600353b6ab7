//! Logging facade: `tracing` when the feature is enabled, no-ops otherwise.
//!
//! All internal diagnostics go through this module so the crate compiles
//! without the `tracing` dependency while keeping call sites identical.

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, trace, warn};

#[cfg(not(feature = "tracing"))]
mod noop {
    macro_rules! trace {
        ($($arg:tt)*) => {
            ()
        };
    }
    macro_rules! debug {
        ($($arg:tt)*) => {
            ()
        };
    }
    macro_rules! warn_ {
        ($($arg:tt)*) => {
            ()
        };
    }
    macro_rules! error {
        ($($arg:tt)*) => {
            ()
        };
    }

    pub(crate) use {debug, error, trace, warn_ as warn};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use noop::{debug, error, trace, warn};
