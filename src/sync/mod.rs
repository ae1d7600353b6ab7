//! Coordination primitives: spinlock, qutex, and lock set.
//!
//! - [`SpinLock`]: the test-and-set lock guarding all core bookkeeping.
//! - [`Qutex`]: the queue-based asynchronous mutex. Never blocks a worker;
//!   admits waiters through the top-1/N window and wakes by posting.
//! - [`LockSet`]: the ordered qutex collection a serialized step acquires
//!   all-or-nothing.

pub mod lock_set;
pub mod qutex;
pub mod spin;

pub use lock_set::LockSet;
pub use qutex::Qutex;
pub use spin::{SpinGuard, SpinLock};
