//! Core domain model types for cadflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Stage kind, attempt status and run status enums
//! - The per-attempt execution record
//! - Status events delivered to sinks

mod event;
mod execution;
mod status;

pub use event::{EventStatus, OutputStream, StatusEvent};
pub use execution::StageExecution;
pub use status::{ExecutionStatus, RunStatus, StageKind};
