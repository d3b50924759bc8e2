//! Run-scoped execution context.
//!
//! Replaces process-wide settings: every executor call receives the run's
//! context explicitly.

mod run;

pub use run::{ExecutionLimits, RunContext};
