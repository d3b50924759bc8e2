//! Remote stage execution: stage files, submit, poll, collect.

use super::job::{Job, JobHandle, JobRegistry, JobState};
use super::pool::SessionPool;
use super::profile::RemoteProfile;
use super::scheduler::{
    cancel_command, in_workdir_command, job_script, launch_command, left_queue_without_marker,
    logs_command, parse_logs, parse_process_status, parse_queue_status, parse_submit_output,
    parse_verify_output, prepare_command, process_status_command, queue_status_command,
    submit_command, verify_command, write_file_command,
};
use super::shell::ShellOutput;
use crate::context::RunContext;
use crate::core::{ExecutionStatus, OutputStream, StageExecution, StatusEvent};
use crate::errors::{CadflowError, ErrorDetail, ErrorKind};
use crate::executor::{finish, transition};
use crate::stages::{Stage, EXPRESSIONS_FILE};
use crate::utils::{remote_join, OutputTail};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Size and SHA-256 of a transferred file.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FileDigest {
    size: u64,
    sha256: String,
}

async fn local_digest(path: &Path) -> Result<FileDigest, CadflowError> {
    let bytes = tokio::fs::read(path).await?;
    Ok(FileDigest {
        size: bytes.len() as u64,
        sha256: hex::encode(Sha256::digest(&bytes)),
    })
}

/// Where a dispatched attempt lives on the remote host.
struct RemoteLayout {
    /// Resolved run directory.
    root: String,
    /// Job script, logs and markers for this attempt.
    job_dir: String,
}

/// Runs stages on remote hosts through pooled sessions.
///
/// The dispatcher owns the remote [`Job`] records. A job survives dropped
/// sessions: polling resumes against the same record after a reconnect and
/// the job is never submitted twice.
#[derive(Debug, Clone)]
pub struct RemoteDispatcher {
    pool: Arc<SessionPool>,
    jobs: Arc<JobRegistry>,
}

impl RemoteDispatcher {
    /// Creates a dispatcher over a session pool.
    #[must_use]
    pub fn new(pool: Arc<SessionPool>) -> Self {
        Self {
            pool,
            jobs: Arc::new(JobRegistry::new()),
        }
    }

    /// The session pool.
    #[must_use]
    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    /// Jobs submitted so far.
    #[must_use]
    pub fn jobs(&self) -> &Arc<JobRegistry> {
        &self.jobs
    }

    /// Runs one attempt of `stage` on the profile's host.
    ///
    /// Never returns an error: transport, transfer and job failures are all
    /// recorded on the returned execution record.
    pub async fn run(
        &self,
        stage: &Stage,
        ctx: &RunContext,
        profile: &RemoteProfile,
        attempt: u32,
    ) -> StageExecution {
        let mut exec = StageExecution::new(&stage.id, stage.kind, attempt);
        if ctx.cancel.is_cancelled() {
            finish(&mut exec, Err(cancelled_detail(ctx)));
            return exec;
        }
        let result = self.dispatch(stage, ctx, profile, attempt, &mut exec).await;
        finish(&mut exec, result);
        exec
    }

    async fn dispatch(
        &self,
        stage: &Stage,
        ctx: &RunContext,
        profile: &RemoteProfile,
        attempt: u32,
        exec: &mut StageExecution,
    ) -> Result<(), ErrorDetail> {
        let patterns = stage
            .compiled_failure_patterns()
            .map_err(|e| ErrorDetail::new(ErrorKind::Validation, e.to_string()))?;

        let layout = self
            .prepare(stage, ctx, profile, attempt)
            .await
            .map_err(|e| e.to_detail())?;
        self.stage_inputs(stage, ctx, profile, &layout.root)
            .await
            .map_err(|e| match e {
                CadflowError::Cancelled(_) => cancelled_detail(ctx),
                e => e.to_detail(),
            })?;

        let command = stage
            .command
            .render(&ctx.template_context(stage, attempt, &layout.root))
            .map_err(|e| ErrorDetail::new(ErrorKind::Validation, e.to_string()))?;
        let env = ctx.stage_env(stage, attempt, &layout.root);

        if ctx.cancel.is_cancelled() {
            return Err(cancelled_detail(ctx));
        }
        let job = self
            .submit(stage, ctx, profile, attempt, &layout, &env, &command)
            .await
            .map_err(|e| e.to_detail())?;
        exec.job_id = Some(job.id);
        transition(exec, ExecutionStatus::Running);
        ctx.sink
            .emit(StatusEvent::stage(
                ctx.run_id,
                &stage.id,
                attempt,
                ExecutionStatus::Running,
                format!("{} on {}", job.handle, profile.name),
            ))
            .await;

        let state = match self.wait(stage, ctx, profile, &job, exec).await {
            Ok(state) => state,
            Err(detail) => {
                self.cleanup(stage, ctx, profile, attempt, &layout.root, &env, exec)
                    .await;
                return Err(detail);
            }
        };

        let (stdout, stderr) = self.fetch_logs(ctx, profile, &layout.job_dir, exec).await;
        let mut combined = OutputTail::new(ctx.limits.tail_lines);
        let mut failure_line = None;
        for (stream, lines) in [(OutputStream::Stdout, &stdout), (OutputStream::Stderr, &stderr)] {
            for line in lines {
                if failure_line.is_none() && patterns.iter().any(|p| p.is_match(line)) {
                    failure_line = Some(line.clone());
                }
                combined.push(line.clone());
                ctx.sink.try_emit(StatusEvent::output(
                    ctx.run_id,
                    &stage.id,
                    attempt,
                    stream,
                    line.clone(),
                ));
            }
        }
        exec.output_tail = combined.to_vec();

        self.cleanup(stage, ctx, profile, attempt, &layout.root, &env, exec)
            .await;

        let with_code = |detail: ErrorDetail, code: Option<i32>| match code {
            Some(code) => detail.with_exit_code(code),
            None => detail,
        };
        match state {
            JobState::Completed { exit_code } => {
                if let Some(line) = failure_line {
                    return Err(with_code(
                        ErrorDetail::new(ErrorKind::Execution, line).with_stderr_tail(stderr),
                        exit_code,
                    ));
                }
                self.collect_outputs(stage, ctx, profile, &layout.root)
                    .await
                    .map_err(|detail| detail.with_stderr_tail(stderr))
            }
            JobState::Failed { exit_code, reason } => {
                let message = match (failure_line, exit_code) {
                    (Some(line), _) => line,
                    (None, Some(code)) => format!("Command exited with code {code}"),
                    (None, None) => format!("Remote job failed: {reason}"),
                };
                Err(with_code(
                    ErrorDetail::new(ErrorKind::Execution, message).with_stderr_tail(stderr),
                    exit_code,
                ))
            }
            other => Err(ErrorDetail::new(
                ErrorKind::Internal,
                format!("Job left polling in a non-terminal state: {other}"),
            )),
        }
    }

    /// Creates the run and job directories, returning the resolved layout.
    async fn prepare(
        &self,
        stage: &Stage,
        ctx: &RunContext,
        profile: &RemoteProfile,
        attempt: u32,
    ) -> Result<RemoteLayout, CadflowError> {
        let run_dir = remote_join(&profile.remote_base_dir, &ctx.run_id.to_string());
        let job_rel = format!(".cadflow/{}-{attempt}", stage.id);

        let mut parents: Vec<String> = stage
            .file_inputs()
            .map(|f| f.path.as_str())
            .chain(stage.expected_outputs.iter().map(|f| f.path.as_str()))
            .filter_map(|p| p.rsplit_once('/').map(|(dir, _)| dir))
            .filter(|dir| !dir.is_empty() && !dir.starts_with('/'))
            .map(|dir| remote_join(&run_dir, dir))
            .collect();
        parents.sort();
        parents.dedup();

        let command = prepare_command(&run_dir, &remote_join(&run_dir, &job_rel), &parents);
        let output = self.exec_checked(profile, &command, "Preparing remote directories").await?;
        let root = output
            .stdout
            .lines()
            .map(str::trim)
            .rfind(|l| !l.is_empty())
            .map(ToString::to_string)
            .ok_or_else(|| {
                CadflowError::Execution(format!("Remote host did not report the run directory {run_dir}"))
            })?;

        debug!(run_id = %ctx.run_id, stage_id = %stage.id, root = %root, "Prepared remote run directory");
        Ok(RemoteLayout {
            job_dir: remote_join(&root, &job_rel),
            root,
        })
    }

    /// Uploads file inputs and the expression file, verifying each copy.
    async fn stage_inputs(
        &self,
        stage: &Stage,
        ctx: &RunContext,
        profile: &RemoteProfile,
        root: &str,
    ) -> Result<(), CadflowError> {
        let mut files: Vec<String> = stage.file_inputs().map(|f| f.path.clone()).collect();
        if !files.iter().any(|f| f == EXPRESSIONS_FILE)
            && tokio::fs::try_exists(ctx.expressions_path()).await.unwrap_or(false)
        {
            files.push(EXPRESSIONS_FILE.to_string());
        }

        for path in files {
            if ctx.cancel.is_cancelled() {
                return Err(CadflowError::Cancelled(
                    ctx.cancel
                        .reason()
                        .unwrap_or_else(|| "Run cancelled".to_string()),
                ));
            }
            let local = ctx.workdir.join(&path);
            let remote = remote_join(root, &path);
            let expected = local_digest(&local).await.map_err(|e| {
                CadflowError::Transfer(format!("Cannot read input {}: {e}", local.display()))
            })?;

            let (local_ref, remote_ref) = (local.as_path(), remote.as_str());
            self.pool
                .run(profile, |shell| async move { shell.upload(local_ref, remote_ref).await })
                .await?;

            let (size, sha256) = self.remote_digest(profile, &remote).await?.ok_or_else(|| {
                CadflowError::Transfer(format!("Uploaded file {remote} is missing on the remote host"))
            })?;
            verify_copy(&path, &expected, size, sha256.as_deref())?;
            debug!(run_id = %ctx.run_id, stage_id = %stage.id, path, bytes = size, "Staged input");
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn submit(
        &self,
        stage: &Stage,
        ctx: &RunContext,
        profile: &RemoteProfile,
        attempt: u32,
        layout: &RemoteLayout,
        env: &[(String, String)],
        command: &str,
    ) -> Result<Job, CadflowError> {
        let job_name = format!("cadflow-{}", stage.id);
        let script = job_script(
            profile,
            &job_name,
            &layout.root,
            &layout.job_dir,
            env,
            command,
            stage.timeout(),
        );
        let script_path = remote_join(&layout.job_dir, "job.sh");
        self.exec_checked(profile, &write_file_command(&script_path, &script), "Writing job script")
            .await?;

        // Both launch commands are idempotent: a retried submission after a
        // dropped session returns the original pid or queue id.
        let handle = if profile.uses_queue() {
            let command = submit_command(profile, &layout.root, &layout.job_dir, &job_name);
            let output = self.exec_checked(profile, &command, "Queue submission").await?;
            JobHandle::Queue {
                scheduler: profile.scheduler,
                job_id: parse_submit_output(profile.scheduler, &output.stdout)?,
            }
        } else {
            let output = self
                .exec_checked(profile, &launch_command(&layout.job_dir), "Launching job")
                .await?;
            let pid = output.stdout.trim().parse().map_err(|_| {
                CadflowError::Execution(format!(
                    "Could not parse remote pid from '{}'",
                    output.stdout.trim()
                ))
            })?;
            JobHandle::Process { pid }
        };

        let job = Job {
            id: Uuid::new_v4(),
            run_id: ctx.run_id,
            stage_id: stage.id.clone(),
            attempt,
            profile: profile.name.clone(),
            handle,
            remote_workdir: layout.root.clone(),
            job_dir: layout.job_dir.clone(),
            state: JobState::Submitted,
            submitted_at: Utc::now(),
            last_polled_at: None,
            polls: 0,
        };
        info!(
            run_id = %ctx.run_id,
            stage_id = %stage.id,
            attempt,
            job_id = %job.id,
            handle = %job.handle,
            profile = %profile.name,
            "Submitted remote job"
        );
        self.jobs.insert(job.clone());
        Ok(job)
    }

    /// Polls until the job is terminal, the stage times out or the run is
    /// cancelled.
    async fn wait(
        &self,
        stage: &Stage,
        ctx: &RunContext,
        profile: &RemoteProfile,
        job: &Job,
        exec: &mut StageExecution,
    ) -> Result<JobState, ErrorDetail> {
        let deadline = Instant::now() + stage.timeout();
        let status_command = match &job.handle {
            JobHandle::Process { .. } => process_status_command(&job.job_dir),
            JobHandle::Queue { job_id, .. } => queue_status_command(profile, job_id, &job.job_dir),
        };

        let mut vanished_polls = 0u32;
        loop {
            let now = Instant::now();
            if now >= deadline {
                self.request_cancel(ctx, profile, job, exec).await;
                return Err(ErrorDetail::new(
                    ErrorKind::Timeout,
                    format!("Stage exceeded its timeout of {:.1}s", stage.timeout_secs),
                ));
            }

            let cancelled = tokio::select! {
                () = tokio::time::sleep(ctx.limits.poll_interval.min(deadline - now)) => false,
                () = ctx.cancel.cancelled() => true,
            };
            if cancelled {
                exec.reconciliation_pending = true;
                self.request_cancel(ctx, profile, job, exec).await;
                return Err(cancelled_detail(ctx));
            }
            if Instant::now() >= deadline {
                continue;
            }

            let command = status_command.as_str();
            let output = match self
                .pool
                .run(profile, |shell| async move { shell.exec(command).await })
                .await
            {
                Ok(output) => output,
                Err(e) => {
                    // The job may still be running out of reach.
                    exec.reconciliation_pending = true;
                    warn!(
                        run_id = %ctx.run_id,
                        stage_id = %stage.id,
                        job_id = %job.id,
                        error = %e,
                        "Lost contact with remote job"
                    );
                    return Err(e.to_detail());
                }
            };

            let state = match &job.handle {
                JobHandle::Process { .. } => parse_process_status(&output.stdout),
                JobHandle::Queue { scheduler, .. } => {
                    let state = parse_queue_status(*scheduler, &output.stdout);
                    if left_queue_without_marker(&state) {
                        vanished_polls += 1;
                    } else {
                        vanished_polls = 0;
                    }
                    // One extra poll gives a late exit marker time to land.
                    if vanished_polls > 1 {
                        JobState::Failed {
                            exit_code: None,
                            reason: "job left the queue without writing an exit code".to_string(),
                        }
                    } else {
                        state
                    }
                }
            };
            debug!(job_id = %job.id, state = %state, "Polled remote job");
            self.jobs.record_state(&job.id, state.clone());
            if state.is_terminal() {
                return Ok(state);
            }
        }
    }

    /// Best-effort remote cancel, bounded by the kill grace period.
    async fn request_cancel(
        &self,
        ctx: &RunContext,
        profile: &RemoteProfile,
        job: &Job,
        exec: &mut StageExecution,
    ) {
        self.jobs.mark_cancel_requested(&job.id);
        let command = cancel_command(profile, &job.handle);
        let command = command.as_str();
        let sent = tokio::time::timeout(
            ctx.limits.kill_grace,
            self.pool
                .run(profile, |shell| async move { shell.exec(command).await }),
        )
        .await;

        let note = match sent {
            Ok(Ok(output)) if output.success() => format!("remote cancel sent for {}", job.handle),
            Ok(Ok(output)) => format!(
                "remote cancel for {} exited with code {}: {}",
                job.handle,
                output.exit_code,
                output.stderr.trim()
            ),
            Ok(Err(e)) => format!("remote cancel for {} failed: {e}", job.handle),
            Err(_) => format!("remote cancel for {} timed out", job.handle),
        };
        info!(run_id = %ctx.run_id, job_id = %job.id, "{note}");
        exec.note(note);
    }

    async fn fetch_logs(
        &self,
        ctx: &RunContext,
        profile: &RemoteProfile,
        job_dir: &str,
        exec: &mut StageExecution,
    ) -> (Vec<String>, Vec<String>) {
        let command = logs_command(job_dir, ctx.limits.tail_lines);
        let command = command.as_str();
        match self
            .pool
            .run(profile, |shell| async move { shell.exec(command).await })
            .await
        {
            Ok(output) => parse_logs(&output.stdout),
            Err(e) => {
                exec.note(format!("could not fetch job logs: {e}"));
                (Vec::new(), Vec::new())
            }
        }
    }

    /// Downloads declared outputs, verifying each copy.
    async fn collect_outputs(
        &self,
        stage: &Stage,
        ctx: &RunContext,
        profile: &RemoteProfile,
        root: &str,
    ) -> Result<(), ErrorDetail> {
        let mut missing = Vec::new();
        for output in &stage.expected_outputs {
            let remote = remote_join(root, &output.path);
            let Some((size, sha256)) = self
                .remote_digest(profile, &remote)
                .await
                .map_err(|e| e.to_detail())?
            else {
                missing.push(output.path.clone());
                continue;
            };

            let local: PathBuf = ctx.workdir.join(&output.path);
            if let Some(parent) = local.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| CadflowError::from(e).to_detail())?;
            }
            let (local_ref, remote_ref) = (local.as_path(), remote.as_str());
            self.pool
                .run(profile, |shell| async move { shell.download(remote_ref, local_ref).await })
                .await
                .map_err(|e| e.to_detail())?;

            let actual = local_digest(&local).await.map_err(|e| e.to_detail())?;
            verify_copy(&output.path, &actual, size, sha256.as_deref()).map_err(|e| e.to_detail())?;
            debug!(run_id = %ctx.run_id, stage_id = %stage.id, path = %output.path, bytes = size, "Collected output");
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ErrorDetail::new(
                ErrorKind::Execution,
                format!("Missing declared outputs: {}", missing.join(", ")),
            )
            .with_exit_code(0))
        }
    }

    /// Runs the stage's cleanup command remotely. Failures become notes.
    #[allow(clippy::too_many_arguments)]
    async fn cleanup(
        &self,
        stage: &Stage,
        ctx: &RunContext,
        profile: &RemoteProfile,
        attempt: u32,
        root: &str,
        env: &[(String, String)],
        exec: &mut StageExecution,
    ) {
        let Some(template) = &stage.cleanup else {
            return;
        };
        let rendered = match template.render(&ctx.template_context(stage, attempt, root)) {
            Ok(rendered) => rendered,
            Err(e) => {
                exec.note(format!("cleanup skipped: {e}"));
                return;
            }
        };
        let command = in_workdir_command(root, env, &rendered);
        let command = command.as_str();
        let result = tokio::time::timeout(
            ctx.limits.kill_grace,
            self.pool
                .run(profile, |shell| async move { shell.exec(command).await }),
        )
        .await;

        let note = match result {
            Ok(Ok(output)) if output.success() => None,
            Ok(Ok(output)) => Some(format!(
                "cleanup failed (exit {}): {}",
                output.exit_code,
                output.stderr.trim()
            )),
            Ok(Err(e)) => Some(format!("cleanup failed: {e}")),
            Err(_) => Some("cleanup timed out".to_string()),
        };
        if let Some(note) = note {
            warn!(run_id = %ctx.run_id, stage_id = %stage.id, attempt, "{note}");
            exec.note(note);
        }
    }

    /// Size and optional digest of a remote file; `None` if it does not exist.
    async fn remote_digest(
        &self,
        profile: &RemoteProfile,
        path: &str,
    ) -> Result<Option<(u64, Option<String>)>, CadflowError> {
        let command = verify_command(path);
        let command = command.as_str();
        let output = self
            .pool
            .run(profile, |shell| async move { shell.exec(command).await })
            .await?;
        if !output.success() {
            return Ok(None);
        }
        parse_verify_output(&output.stdout).map(Some).ok_or_else(|| {
            CadflowError::Transfer(format!(
                "Unreadable verification output for {path}: {}",
                output.stdout.trim()
            ))
        })
    }

    /// Runs a command, turning a non-zero exit into an execution error.
    async fn exec_checked(
        &self,
        profile: &RemoteProfile,
        command: &str,
        what: &str,
    ) -> Result<ShellOutput, CadflowError> {
        let output = self
            .pool
            .run(profile, |shell| async move { shell.exec(command).await })
            .await?;
        if output.success() {
            Ok(output)
        } else {
            let detail = if output.stderr.trim().is_empty() {
                output.stdout.trim()
            } else {
                output.stderr.trim()
            };
            Err(CadflowError::Execution(format!(
                "{what} failed on {} (exit {}): {detail}",
                profile.host, output.exit_code
            )))
        }
    }
}

fn verify_copy(
    path: &str,
    local: &FileDigest,
    remote_size: u64,
    remote_sha256: Option<&str>,
) -> Result<(), CadflowError> {
    if local.size != remote_size {
        return Err(CadflowError::Transfer(format!(
            "Size mismatch for {path}: local {} bytes, remote {remote_size} bytes",
            local.size
        )));
    }
    if let Some(remote) = remote_sha256 {
        if !remote.eq_ignore_ascii_case(&local.sha256) {
            return Err(CadflowError::Transfer(format!(
                "Checksum mismatch for {path}"
            )));
        }
    }
    Ok(())
}

fn cancelled_detail(ctx: &RunContext) -> ErrorDetail {
    ErrorDetail::new(
        ErrorKind::Cancelled,
        ctx.cancel
            .reason()
            .unwrap_or_else(|| "Run cancelled".to_string()),
    )
}
