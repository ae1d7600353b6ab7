//! Cooperative worker threads.
//!
//! A [`Worker`] owns one OS thread and a FIFO of posted callables; callables
//! run serially to completion, so everything executed on a worker is
//! single-threaded by construction. Workers interact only by posting to
//! each other's queues.

pub mod worker;

pub use worker::{Worker, WorkerHandle, WorkerId};
