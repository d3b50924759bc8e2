//! Run records and handles.

use crate::cancellation::CancellationToken;
use crate::codec::ParameterSet;
use crate::core::{RunStatus, StageExecution};
use crate::errors::{CadflowError, ErrorDetail};
use crate::stages::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

/// Where a run's remote stages execute.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetSelection {
    /// Every stage runs on this machine.
    #[default]
    Local,
    /// Remote stages run on the named profile unless they pin their own.
    Profile(String),
}

impl fmt::Display for TargetSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Profile(name) => write!(f, "{name}"),
        }
    }
}

impl FromStr for TargetSelection {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "" | "local" => Self::Local,
            name => Self::Profile(name.to_string()),
        })
    }
}

/// What a caller hands to [`Orchestrator::submit`](super::Orchestrator::submit).
#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    /// Design parameters for the CAD update.
    pub params: ParameterSet,
    /// Target selection for remote stages.
    pub target: TargetSelection,
    /// Files copied into the run directory before the first stage.
    pub inputs: Vec<PathBuf>,
}

impl SubmitRequest {
    /// Creates a local request.
    #[must_use]
    pub fn new(params: ParameterSet) -> Self {
        Self {
            params,
            target: TargetSelection::Local,
            inputs: Vec::new(),
        }
    }

    /// Selects the target.
    #[must_use]
    pub fn with_target(mut self, target: TargetSelection) -> Self {
        self.target = target;
        self
    }

    /// Adds a run input file.
    #[must_use]
    pub fn with_input(mut self, path: impl Into<PathBuf>) -> Self {
        self.inputs.push(path.into());
        self
    }
}

/// One pipeline run and its append-only attempt history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Run id.
    pub id: Uuid,
    /// Parameter snapshot taken at submission.
    pub params: ParameterSet,
    /// The stages, in execution order.
    pub stages: Vec<Stage>,
    /// Target selection used for the run.
    pub target: TargetSelection,
    /// Run working directory.
    pub workdir: PathBuf,
    status: RunStatus,
    /// Every attempt of every stage, in execution order.
    pub history: Vec<StageExecution>,
    /// Stage that failed the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<String>,
    /// Why the run did not complete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// When the run reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub(crate) fn new(
        id: Uuid,
        params: ParameterSet,
        stages: Vec<Stage>,
        target: TargetSelection,
        workdir: PathBuf,
    ) -> Self {
        Self {
            id,
            params,
            stages,
            target,
            workdir,
            status: RunStatus::Created,
            history: Vec::new(),
            failed_stage: None,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// Attempts of one stage, oldest first.
    #[must_use]
    pub fn attempts(&self, stage_id: &str) -> Vec<&StageExecution> {
        self.history.iter().filter(|e| e.stage_id == stage_id).collect()
    }

    /// The last attempt of one stage.
    #[must_use]
    pub fn final_attempt(&self, stage_id: &str) -> Option<&StageExecution> {
        self.history.iter().rev().find(|e| e.stage_id == stage_id)
    }

    pub(crate) fn record(&mut self, exec: StageExecution) {
        self.history.push(exec);
    }

    /// Moves the run forward; regressions are ignored and logged.
    pub(crate) fn transition(&mut self, next: RunStatus) -> bool {
        if !self.status.can_transition_to(next) {
            warn!(run_id = %self.id, from = %self.status, to = %next, "Ignored run transition");
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        true
    }
}

/// Returned by submission: observe, cancel or await a running run.
#[derive(Debug)]
pub struct RunHandle {
    id: Uuid,
    workdir: PathBuf,
    cancel: Arc<CancellationToken>,
    status: watch::Receiver<RunStatus>,
    task: JoinHandle<PipelineRun>,
}

impl RunHandle {
    pub(crate) fn new(
        id: Uuid,
        workdir: PathBuf,
        cancel: Arc<CancellationToken>,
        status: watch::Receiver<RunStatus>,
        task: JoinHandle<PipelineRun>,
    ) -> Self {
        Self {
            id,
            workdir,
            cancel,
            status,
            task,
        }
    }

    /// The run id.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The run working directory.
    #[must_use]
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Requests cancellation. Returns false if already requested.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        self.cancel.cancel(reason)
    }

    /// Latest run status.
    #[must_use]
    pub fn status(&self) -> RunStatus {
        *self.status.borrow()
    }

    /// A receiver that observes every status change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RunStatus> {
        self.status.clone()
    }

    /// Waits for the run to reach a terminal status.
    pub async fn wait(self) -> Result<PipelineRun, CadflowError> {
        self.task
            .await
            .map_err(|e| CadflowError::Internal(format!("Run task failed: {e}")))
    }
}
