//! Pipeline orchestration.
//!
//! [`Orchestrator::submit`] validates a request, prepares the run directory
//! and spawns the run. Stages execute strictly in order; each failed attempt
//! is recorded and retried within the stage's budget when its error class
//! allows it. Many runs may be in flight at once, each with its own
//! directory, cancellation token and history.

mod engine;
mod run;

pub use engine::Orchestrator;
pub use run::{PipelineRun, RunHandle, SubmitRequest, TargetSelection};
