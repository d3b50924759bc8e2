//! Testing utilities for cadflow pipelines.
//!
//! This module provides:
//! - A scripted in-memory remote host and connector
//! - Scenario parameters and pipelines
//! - Tunables scaled down for fast tests

mod fixtures;
mod remote;

pub use fixtures::{
    fast_orchestrator_config, flaky_command, scenario_parameters, ScenarioPipeline,
};
pub use remote::{JobScript, ScriptedConnector, ScriptedHost, ScriptedShell};
