//! # Cadflow
//!
//! Orchestrates the CAD → geometry export → mesh → solve → postprocess chain
//! for a design parameter set, running each stage locally or on a remote
//! host over SSH.
//!
//! Cadflow provides:
//!
//! - **Expression codec**: design parameters encoded into the CAD tool's
//!   expression interchange file, written atomically
//! - **Declarative stages**: command templates, required inputs, expected
//!   outputs, timeouts, retry budgets and cleanup hooks
//! - **Local execution**: subprocesses with timeouts, process-group
//!   termination and output-file verification
//! - **Remote dispatch**: pooled SSH sessions with reconnect, checksummed
//!   file staging, foreground or batch-queue jobs that survive dropped links
//! - **Orchestration**: sequential runs with per-stage retry, cooperative
//!   cancellation and an ordered status event stream
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use cadflow::prelude::*;
//!
//! let config = CadflowConfig::load("cadflow.json")?;
//! let orchestrator = Orchestrator::new(config, Arc::new(LoggingStatusSink::default()))?;
//!
//! let params = ParameterSet::from_json_str(r#"[{"name": "L4", "type": "number", "value": 2.0, "unit": "mm"}]"#)?;
//! let handle = orchestrator
//!     .submit(SubmitRequest::new(params).with_target("hpc".parse()?))
//!     .await?;
//! let run = handle.wait().await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod codec;
pub mod config;
pub mod context;
pub mod core;
pub mod errors;
pub mod events;
pub mod executor;
pub mod orchestrator;
pub mod remote;
pub mod retry;
pub mod stages;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::codec::{
        encode, render_expression_file, write_expression_file, ParamType, Parameter,
        ParameterSet,
    };
    pub use crate::config::{CadflowConfig, OrchestratorConfig};
    pub use crate::context::RunContext;
    pub use crate::core::{
        ExecutionStatus, OutputStream, RunStatus, StageExecution, StageKind, StatusEvent,
    };
    pub use crate::errors::{CadflowError, ErrorDetail, ErrorKind, ValidationError};
    pub use crate::events::{
        ChannelStatusSink, CollectingStatusSink, FanoutStatusSink, LoggingStatusSink,
        NoOpStatusSink, StatusSink,
    };
    pub use crate::executor::LocalExecutor;
    pub use crate::orchestrator::{
        Orchestrator, PipelineRun, RunHandle, SubmitRequest, TargetSelection,
    };
    pub use crate::remote::{RemoteDispatcher, RemoteProfile, SchedulerKind};
    pub use crate::retry::RetryConfig;
    pub use crate::stages::{InputRef, Pipeline, Stage, StageTarget};
    pub use std::sync::Arc;
}
