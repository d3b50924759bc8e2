//! Submission and the per-run stage state machine.

use super::run::{PipelineRun, RunHandle, SubmitRequest, TargetSelection};
use crate::codec::{render_expression_file, write_expression_file};
use crate::config::CadflowConfig;
use crate::context::RunContext;
use crate::core::{ExecutionStatus, RunStatus, StageExecution, StatusEvent};
use crate::errors::{CadflowError, ErrorDetail, ErrorKind, ValidationCode, ValidationError};
use crate::events::StatusSink;
use crate::executor::{finish, LocalExecutor};
use crate::remote::{OpenSshConnector, RemoteDispatcher, RemoteProfile, SessionPool, ShellConnector};
use crate::retry::{RetryDecision, RetryState};
use crate::stages::{validate, AvailableInputs, Stage, StageTarget};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Where one stage of a run executes, fixed at submission.
#[derive(Debug, Clone)]
enum ResolvedTarget {
    Local,
    Remote(RemoteProfile),
}

/// Drives pipeline runs.
///
/// Cheap to clone; clones share the configuration, sink and session pool.
/// Each submitted run is a tokio task with its own working directory.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<CadflowConfig>,
    sink: Arc<dyn StatusSink>,
    local: LocalExecutor,
    dispatcher: RemoteDispatcher,
}

impl Orchestrator {
    /// Creates an orchestrator using the system OpenSSH client.
    pub fn new(config: CadflowConfig, sink: Arc<dyn StatusSink>) -> Result<Self, ValidationError> {
        Self::with_connector(config, sink, Arc::new(OpenSshConnector::new()))
    }

    /// Creates an orchestrator with a custom transport.
    pub fn with_connector(
        config: CadflowConfig,
        sink: Arc<dyn StatusSink>,
        connector: Arc<dyn ShellConnector>,
    ) -> Result<Self, ValidationError> {
        config.validate()?;
        let pool = Arc::new(SessionPool::new(connector, config.orchestrator.reconnect()));
        Ok(Self {
            config: Arc::new(config),
            sink,
            local: LocalExecutor::new(),
            dispatcher: RemoteDispatcher::new(pool),
        })
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &CadflowConfig {
        &self.config
    }

    /// The remote dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> &RemoteDispatcher {
        &self.dispatcher
    }

    /// Validates a request, prepares the run directory and starts the run.
    ///
    /// Returns as soon as the run task is spawned. Validation failures are
    /// reported before any directory, process or job is created.
    pub async fn submit(&self, request: SubmitRequest) -> Result<RunHandle, CadflowError> {
        let pipeline = &self.config.pipeline;
        let targets = self.resolve_targets(&request.target)?;
        let expressions = render_expression_file(&request.params)?;

        let mut run_inputs = Vec::with_capacity(request.inputs.len());
        for input in &request.inputs {
            run_inputs.push(input_name(input)?);
            if !tokio::fs::try_exists(input).await.unwrap_or(false) {
                return Err(ValidationError::new(
                    ValidationCode::MissingInput,
                    format!("Run input {} does not exist", input.display()),
                )
                .with_subjects(vec![input.display().to_string()])
                .into());
            }
        }
        pipeline.validate_inputs(&request.params, &run_inputs)?;

        let run_id = Uuid::new_v4();
        let workdir = self.config.workspace_root.join(run_id.to_string());
        tokio::fs::create_dir_all(&workdir).await?;
        // Stage commands run inside the workdir, so every path handed to them
        // must be absolute.
        let workdir = tokio::fs::canonicalize(&workdir).await?;
        for (input, name) in request.inputs.iter().zip(&run_inputs) {
            tokio::fs::copy(input, workdir.join(name)).await?;
        }
        let ctx = RunContext::new(
            run_id,
            workdir.clone(),
            Arc::new(request.params.clone()),
            self.sink.clone(),
        )
        .with_limits(self.config.orchestrator.limits());
        write_expression_file(ctx.expressions_path(), &request.params).await?;
        debug!(run_id = %run_id, bytes = expressions.len(), "Prepared run directory");

        let run = PipelineRun::new(
            run_id,
            request.params,
            pipeline.stages.clone(),
            request.target,
            workdir.clone(),
        );
        let (status_tx, status_rx) = watch::channel(RunStatus::Created);
        let cancel = ctx.cancel.clone();

        info!(
            run_id = %run_id,
            target = %run.target,
            stages = run.stages.len(),
            workdir = %workdir.display(),
            "Submitted run"
        );
        let this = self.clone();
        let task = tokio::spawn(async move { this.drive(run, ctx, targets, status_tx).await });

        Ok(RunHandle::new(run_id, workdir, cancel, status_rx, task))
    }

    /// Closes pooled remote sessions.
    pub async fn shutdown(&self) {
        self.dispatcher.pool().close_all().await;
    }

    fn resolve_targets(&self, selection: &TargetSelection) -> Result<Vec<ResolvedTarget>, ValidationError> {
        let lookup = |name: &str| {
            self.config.profile(name).cloned().ok_or_else(|| {
                ValidationError::config(format!("Unknown profile '{name}'"))
                    .with_subjects(vec![name.to_string()])
            })
        };
        if let TargetSelection::Profile(name) = selection {
            lookup(name)?;
        }

        self.config
            .pipeline
            .stages
            .iter()
            .map(|stage| match (stage.target, selection) {
                (StageTarget::Local, _) | (StageTarget::Remote, TargetSelection::Local) => {
                    Ok(ResolvedTarget::Local)
                }
                (StageTarget::Remote, TargetSelection::Profile(name)) => {
                    let name = stage.profile.as_deref().unwrap_or(name);
                    lookup(name).map(ResolvedTarget::Remote)
                }
            })
            .collect()
    }

    async fn drive(
        &self,
        mut run: PipelineRun,
        ctx: RunContext,
        targets: Vec<ResolvedTarget>,
        status_tx: watch::Sender<RunStatus>,
    ) -> PipelineRun {
        self.set_status(&mut run, RunStatus::Running, "", &status_tx).await;

        let stages = run.stages.clone();
        for (stage, target) in stages.iter().zip(&targets) {
            if ctx.cancel.is_cancelled() {
                self.cancel_run(&mut run, &ctx, &status_tx).await;
                return run;
            }

            // Inputs may have been consumed or never produced upstream.
            let available = AvailableInputs::probe(&ctx.workdir, &ctx.params, stage).await;
            if let Err(e) = validate(stage, &available) {
                run.failed_stage = Some(stage.id.clone());
                run.error = Some(CadflowError::from(e).to_detail());
                self.set_status(&mut run, RunStatus::Failed, &stage.id, &status_tx).await;
                return run;
            }

            match self.run_stage(&mut run, stage, target, &ctx).await {
                StageOutcome::Succeeded => {}
                StageOutcome::Cancelled => {
                    self.cancel_run(&mut run, &ctx, &status_tx).await;
                    return run;
                }
                StageOutcome::Failed(detail) => {
                    run.failed_stage = Some(stage.id.clone());
                    run.error = Some(detail);
                    self.set_status(&mut run, RunStatus::Failed, &stage.id, &status_tx).await;
                    return run;
                }
            }
        }

        self.set_status(&mut run, RunStatus::Completed, "", &status_tx).await;
        run
    }

    /// Runs every attempt of one stage, applying its retry budget.
    async fn run_stage(
        &self,
        run: &mut PipelineRun,
        stage: &Stage,
        target: &ResolvedTarget,
        ctx: &RunContext,
    ) -> StageOutcome {
        let policy = self.config.orchestrator.stage_retry(stage.retry_budget);
        let mut retries = RetryState::new();

        loop {
            let attempt = retries.attempts + 1;
            ctx.sink
                .emit(StatusEvent::stage(
                    run.id,
                    &stage.id,
                    attempt,
                    ExecutionStatus::Pending,
                    format!("attempt {attempt} of {}", policy.max_attempts),
                ))
                .await;

            let exec = self.execute_attempt(stage, target, ctx, attempt).await;
            let status = exec.status();
            let error = exec.error.clone();
            ctx.sink
                .emit(StatusEvent::stage(
                    run.id,
                    &stage.id,
                    attempt,
                    status,
                    error.as_ref().map(|e| e.message.clone()).unwrap_or_default(),
                ))
                .await;
            info!(
                run_id = %run.id,
                stage_id = %stage.id,
                attempt,
                status = %status,
                duration_ms = exec.duration_ms(),
                "Stage attempt finished"
            );
            run.record(exec);

            let detail = match status {
                ExecutionStatus::Succeeded => return StageOutcome::Succeeded,
                ExecutionStatus::Cancelled => return StageOutcome::Cancelled,
                _ => error.unwrap_or_else(|| {
                    ErrorDetail::new(ErrorKind::Internal, format!("Attempt ended {status} without detail"))
                }),
            };

            if ctx.cancel.is_cancelled() {
                return StageOutcome::Cancelled;
            }
            match retries.record_failure(&policy, detail.kind.is_retryable()) {
                RetryDecision::Retry(delay) => {
                    warn!(
                        run_id = %run.id,
                        stage_id = %stage.id,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %detail.message,
                        "Retrying stage"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = ctx.cancel.cancelled() => return StageOutcome::Cancelled,
                    }
                }
                RetryDecision::GiveUp | RetryDecision::NotRetryable => {
                    return StageOutcome::Failed(detail);
                }
            }
        }
    }

    /// Runs one attempt. Once cancellation is requested the executor gets the
    /// cancel grace period to wind down; after that the attempt is recorded as
    /// cancelled with its remote outcome unreconciled.
    async fn execute_attempt(
        &self,
        stage: &Stage,
        target: &ResolvedTarget,
        ctx: &RunContext,
        attempt: u32,
    ) -> StageExecution {
        let work = async {
            match target {
                ResolvedTarget::Local => self.local.run(stage, ctx, attempt).await,
                ResolvedTarget::Remote(profile) => {
                    self.dispatcher.run(stage, ctx, profile, attempt).await
                }
            }
        };
        tokio::pin!(work);

        tokio::select! {
            exec = &mut work => return exec,
            () = ctx.cancel.cancelled() => {}
        }

        let grace = self.config.orchestrator.cancel_grace();
        if let Ok(exec) = tokio::time::timeout(grace, &mut work).await {
            return exec;
        }
        warn!(
            run_id = %ctx.run_id,
            stage_id = %stage.id,
            attempt,
            grace_ms = self.config.orchestrator.cancel_grace_ms,
            "Stage did not stop within the cancel grace period"
        );
        let mut exec = StageExecution::new(&stage.id, stage.kind, attempt);
        exec.reconciliation_pending = matches!(target, ResolvedTarget::Remote(_));
        exec.note("stage did not acknowledge cancellation within the grace period");
        finish(
            &mut exec,
            Err(ErrorDetail::new(
                ErrorKind::Cancelled,
                ctx.cancel.reason().unwrap_or_else(|| "Run cancelled".to_string()),
            )),
        );
        exec
    }

    async fn cancel_run(&self, run: &mut PipelineRun, ctx: &RunContext, status_tx: &watch::Sender<RunStatus>) {
        let reason = ctx.cancel.reason().unwrap_or_else(|| "Run cancelled".to_string());
        run.error = Some(ErrorDetail::new(ErrorKind::Cancelled, reason.clone()));
        self.set_status(run, RunStatus::Cancelled, &reason, status_tx).await;
    }

    async fn set_status(
        &self,
        run: &mut PipelineRun,
        status: RunStatus,
        message: &str,
        status_tx: &watch::Sender<RunStatus>,
    ) {
        if !run.transition(status) {
            return;
        }
        // Receivers may all be gone; the run carries on regardless.
        let _ = status_tx.send(status);
        let message = match (&run.error, status) {
            (Some(error), RunStatus::Failed) => format!("{message}: {}", error.message),
            _ => message.to_string(),
        };
        if status.is_terminal() {
            info!(run_id = %run.id, status = %status, failed_stage = ?run.failed_stage, "Run finished");
        }
        self.sink.emit(StatusEvent::run(run.id, status, message)).await;
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("workspace_root", &self.config.workspace_root)
            .field("stages", &self.config.pipeline.stages.len())
            .field("profiles", &self.config.profiles.len())
            .finish()
    }
}

enum StageOutcome {
    Succeeded,
    Cancelled,
    Failed(ErrorDetail),
}

/// The file name a run input is copied to.
fn input_name(path: &Path) -> Result<String, ValidationError> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            ValidationError::invalid_value(&path.display().to_string(), "run input has no file name")
        })
}
