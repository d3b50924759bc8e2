//! Run-scoped execution context.

use crate::cancellation::CancellationToken;
use crate::codec::ParameterSet;
use crate::events::StatusSink;
use crate::stages::{env_name, Stage, TemplateContext, EXPRESSIONS_FILE};
use crate::utils::DEFAULT_TAIL_LINES;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Bounds applied by the executors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionLimits {
    /// Time between a graceful termination request and a forced kill.
    pub kill_grace: Duration,
    /// Remote job polling interval.
    pub poll_interval: Duration,
    /// Output lines kept per attempt.
    pub tail_lines: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            kill_grace: Duration::from_secs(5),
            poll_interval: Duration::from_secs(5),
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }
}

/// Everything a stage execution needs to know about its run.
///
/// Built once per run by the orchestrator and passed by reference to every
/// executor call. Nothing in it is global.
#[derive(Clone)]
pub struct RunContext {
    /// The run id.
    pub run_id: Uuid,
    /// Run-scoped working directory (unique per run).
    pub workdir: PathBuf,
    /// Parameter snapshot taken at submission.
    pub params: Arc<ParameterSet>,
    /// Progress sink.
    pub sink: Arc<dyn StatusSink>,
    /// Run cancellation flag.
    pub cancel: Arc<CancellationToken>,
    /// Executor bounds.
    pub limits: ExecutionLimits,
}

impl RunContext {
    /// Creates a context with default limits.
    #[must_use]
    pub fn new(
        run_id: Uuid,
        workdir: impl Into<PathBuf>,
        params: Arc<ParameterSet>,
        sink: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            run_id,
            workdir: workdir.into(),
            params,
            sink,
            cancel: Arc::new(CancellationToken::new()),
            limits: ExecutionLimits::default(),
        }
    }

    /// Sets the executor limits.
    #[must_use]
    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Path of the interchange file inside the working directory.
    #[must_use]
    pub fn expressions_path(&self) -> PathBuf {
        self.workdir.join(EXPRESSIONS_FILE)
    }

    /// Template values for a stage attempt, with paths rooted at `root`.
    ///
    /// `root` is the local working directory for local stages and the
    /// remote run directory for dispatched ones.
    #[must_use]
    pub fn template_context(&self, stage: &Stage, attempt: u32, root: &str) -> TemplateContext {
        let mut ctx = TemplateContext::new()
            .with_scalar("workdir", root)
            .with_scalar("run_id", self.run_id.to_string())
            .with_scalar("stage_id", stage.id.clone())
            .with_scalar("attempt", attempt.to_string())
            .with_scalar("expressions", join(root, EXPRESSIONS_FILE))
            .with_params(&self.params);
        for input in stage.file_inputs() {
            ctx = ctx.with_input(&input.name, join(root, &input.path));
        }
        for output in &stage.expected_outputs {
            ctx = ctx.with_output(&output.name, join(root, &output.path));
        }
        ctx
    }

    /// Environment variables for a stage attempt, with paths rooted at `root`.
    #[must_use]
    pub fn stage_env(&self, stage: &Stage, attempt: u32, root: &str) -> Vec<(String, String)> {
        let mut env = vec![
            ("CADFLOW_RUN_ID".to_string(), self.run_id.to_string()),
            ("CADFLOW_STAGE_ID".to_string(), stage.id.clone()),
            ("CADFLOW_ATTEMPT".to_string(), attempt.to_string()),
            ("CADFLOW_WORKDIR".to_string(), root.to_string()),
            ("CADFLOW_EXPRESSIONS".to_string(), join(root, EXPRESSIONS_FILE)),
        ];
        for input in stage.file_inputs() {
            env.push((env_name("CADFLOW_INPUT_", &input.name), join(root, &input.path)));
        }
        for output in &stage.expected_outputs {
            env.push((env_name("CADFLOW_OUTPUT_", &output.name), join(root, &output.path)));
        }
        if let Some(export) = &stage.export {
            env.extend(export.env());
        }
        env.extend(stage.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("workdir", &self.workdir)
            .field("params", &self.params.len())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

fn join(root: &str, path: &str) -> String {
    if Path::new(path).is_absolute() {
        return path.to_string();
    }
    let separator = if root.contains('\\') && !root.contains('/') { '\\' } else { '/' };
    format!("{}{separator}{}", root.trim_end_matches(['/', '\\']), path)
}
