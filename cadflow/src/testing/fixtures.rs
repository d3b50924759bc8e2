//! Test fixtures for pipeline runs.

use crate::codec::{ParamType, Parameter, ParameterSet};
use crate::config::OrchestratorConfig;
use crate::core::StageKind;
use crate::stages::{InputRef, Pipeline, Stage};
use serde_json::json;
use std::time::Duration;

/// Tunables scaled down so tests finish in milliseconds.
#[must_use]
pub fn fast_orchestrator_config() -> OrchestratorConfig {
    OrchestratorConfig {
        retry_base_delay_ms: 10,
        retry_max_delay_ms: 50,
        cancel_grace_ms: 1000,
        kill_grace_ms: 200,
        poll_interval_ms: 10,
        reconnect_attempts: 3,
        reconnect_base_delay_ms: 5,
        ..OrchestratorConfig::default()
    }
}

/// `L4 = 2.0 mm` and `shape = point(0, 0, 0)`.
#[must_use]
pub fn scenario_parameters() -> ParameterSet {
    let mut params = ParameterSet::new();
    for param in [
        Parameter::number("L4", 2.0).map(|p| p.with_unit("mm")),
        Parameter::new("shape", ParamType::Point, json!([0, 0, 0])),
    ] {
        if let Err(e) = param.and_then(|p| params.insert(p)) {
            unreachable!("scenario parameters are valid: {e}");
        }
    }
    params
}

/// A shell snippet that fails `failures` times, counting invocations in
/// `counter` under the working directory, then runs `then`.
#[must_use]
pub fn flaky_command(counter: &str, failures: u32, then: &str) -> String {
    format!(
        "n=$(cat {counter} 2>/dev/null || echo 0); n=$((n + 1)); echo $n > {counter}; \
         if [ $n -le {failures} ]; then echo 'attempt '$n' failed' >&2; exit 1; fi; {then}"
    )
}

/// Builder for the CAD → export → mesh → solve scenario.
///
/// Every stage copies its input to its output, so the run directory ends up
/// with `model.prt`, `model.step`, `model.msh` and `result.frd`.
#[derive(Debug, Clone, Default)]
pub struct ScenarioPipeline {
    mesh_failures: u32,
    mesh_retry_budget: u32,
    remote_solve: Option<Option<String>>,
    solve_command: Option<String>,
    solve_timeout: Option<Duration>,
}

impl ScenarioPipeline {
    /// Creates the all-local scenario with no failures.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `mesh` fail this many times before succeeding.
    #[must_use]
    pub fn with_mesh_failures(mut self, failures: u32, retry_budget: u32) -> Self {
        self.mesh_failures = failures;
        self.mesh_retry_budget = retry_budget;
        self
    }

    /// Marks `solve` remote, optionally pinned to a profile.
    #[must_use]
    pub fn with_remote_solve(mut self, profile: Option<&str>) -> Self {
        self.remote_solve = Some(profile.map(str::to_string));
        self
    }

    /// Replaces the `solve` command.
    #[must_use]
    pub fn with_solve_command(mut self, command: impl Into<String>) -> Self {
        self.solve_command = Some(command.into());
        self
    }

    /// Sets the `solve` timeout.
    #[must_use]
    pub fn with_solve_timeout(mut self, timeout: Duration) -> Self {
        self.solve_timeout = Some(timeout);
        self
    }

    /// Builds the pipeline.
    #[must_use]
    pub fn build(self) -> Pipeline {
        let cad = Stage::new("cad", StageKind::CadUpdate, "cp {expressions} {output.model}")
            .with_output("model", "model.prt");
        let export = Stage::new(
            "export",
            StageKind::ExportGeometry,
            "cp {input.model} {output.step}",
        )
        .with_input(InputRef::file("model", "model.prt"))
        .with_output("step", "model.step");
        let mesh = Stage::new(
            "mesh",
            StageKind::Mesh,
            flaky_command("mesh.count", self.mesh_failures, "cp {input.step} {output.mesh}"),
        )
        .with_input(InputRef::file("step", "model.step"))
        .with_output("mesh", "model.msh")
        .with_retry_budget(self.mesh_retry_budget);

        let mut solve = Stage::new(
            "solve",
            StageKind::Solve,
            self.solve_command
                .unwrap_or_else(|| "cp {input.mesh} {output.result}".to_string()),
        )
        .with_input(InputRef::file("mesh", "model.msh"))
        .with_output("result", "result.frd");
        if let Some(profile) = &self.remote_solve {
            solve = solve.remote(profile.as_deref());
        }
        if let Some(timeout) = self.solve_timeout {
            solve = solve.with_timeout(timeout);
        }

        Pipeline::new(vec![cad, export, mesh, solve]).with_name("scenario")
    }
}
