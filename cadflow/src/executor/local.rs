//! Runs a stage as a child process on this machine.

use crate::context::RunContext;
use crate::core::{ExecutionStatus, OutputStream, StageExecution, StatusEvent};
use crate::errors::{ErrorDetail, ErrorKind};
use crate::stages::Stage;
use crate::utils::OutputTail;
use regex::Regex;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Builds a shell invocation for a command line.
fn shell_command(command: &str) -> Command {
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", command]);
        cmd
    }
    #[cfg(not(windows))]
    {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]);
        cmd
    }
}

/// Why the wait loop stopped.
enum Outcome {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
    WaitFailed(std::io::Error),
}

/// Captured output of one attempt.
struct Captured {
    combined: OutputTail,
    stderr: OutputTail,
    failure_line: Option<String>,
}

/// Executes stages as local child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalExecutor;

impl LocalExecutor {
    /// Creates a local executor.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Runs one attempt of `stage` in the run's working directory.
    ///
    /// Never returns an error: every failure is recorded on the returned
    /// execution record.
    pub async fn run(&self, stage: &Stage, ctx: &RunContext, attempt: u32) -> StageExecution {
        let mut exec = StageExecution::new(&stage.id, stage.kind, attempt);
        let root = ctx.workdir.to_string_lossy().into_owned();

        let prepared = stage
            .command
            .render(&ctx.template_context(stage, attempt, &root))
            .and_then(|command| Ok((command, stage.compiled_failure_patterns()?)));
        let (command, patterns) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                finish(&mut exec, Err(ErrorDetail::new(ErrorKind::Validation, e.to_string())));
                return exec;
            }
        };
        let env = ctx.stage_env(stage, attempt, &root);

        let mut cmd = shell_command(&command);
        cmd.current_dir(&ctx.workdir)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                finish(
                    &mut exec,
                    Err(ErrorDetail::new(
                        ErrorKind::Execution,
                        format!("Failed to start command: {e}"),
                    )),
                );
                return exec;
            }
        };

        transition(&mut exec, ExecutionStatus::Running);
        info!(
            run_id = %ctx.run_id,
            stage_id = %stage.id,
            attempt,
            pid = child.id(),
            "Started local stage"
        );
        ctx.sink
            .emit(StatusEvent::stage(
                ctx.run_id,
                &stage.id,
                attempt,
                ExecutionStatus::Running,
                command.clone(),
            ))
            .await;

        let (outcome, captured) = self.wait(&mut child, stage, ctx, attempt, &patterns).await;
        exec.output_tail = captured.combined.to_vec();

        if let Some(cleanup) = &stage.cleanup {
            run_cleanup(cleanup.as_str(), stage, ctx, attempt, &root, &env, &mut exec).await;
        }

        let stderr_tail = captured.stderr.to_vec();
        let result = match outcome {
            Outcome::Exited(status) => {
                check_exit(status, captured.failure_line, stage, &ctx.workdir, stderr_tail).await
            }
            Outcome::TimedOut => Err(ErrorDetail::new(
                ErrorKind::Timeout,
                format!("Stage exceeded its timeout of {:.1}s", stage.timeout_secs),
            )
            .with_stderr_tail(stderr_tail)),
            Outcome::Cancelled => Err(ErrorDetail::new(
                ErrorKind::Cancelled,
                ctx.cancel
                    .reason()
                    .unwrap_or_else(|| "Run cancelled".to_string()),
            )),
            Outcome::WaitFailed(e) => Err(ErrorDetail::new(
                ErrorKind::Execution,
                format!("Failed to wait for command: {e}"),
            )),
        };

        finish(&mut exec, result);
        exec
    }

    async fn wait(
        &self,
        child: &mut Child,
        stage: &Stage,
        ctx: &RunContext,
        attempt: u32,
        patterns: &[Regex],
    ) -> (Outcome, Captured) {
        let (line_tx, mut line_rx) = mpsc::channel::<(OutputStream, String)>(256);
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, OutputStream::Stdout, line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, OutputStream::Stderr, line_tx.clone());
        }
        drop(line_tx);

        let mut captured = Captured {
            combined: OutputTail::new(ctx.limits.tail_lines),
            stderr: OutputTail::new(ctx.limits.tail_lines),
            failure_line: None,
        };

        let deadline = tokio::time::sleep(stage.timeout());
        tokio::pin!(deadline);
        // Set once the process exits; bounds how long orphaned pipes may stay open.
        let drain = tokio::time::sleep(Duration::MAX);
        tokio::pin!(drain);

        let mut exit_status = None;
        let mut lines_open = true;

        let outcome = loop {
            if let (Some(status), false) = (exit_status, lines_open) {
                break Outcome::Exited(status);
            }
            tokio::select! {
                line = line_rx.recv(), if lines_open => match line {
                    Some((stream, line)) => {
                        if captured.failure_line.is_none() && patterns.iter().any(|p| p.is_match(&line)) {
                            captured.failure_line = Some(line.clone());
                        }
                        if stream == OutputStream::Stderr {
                            captured.stderr.push(line.clone());
                        }
                        captured.combined.push(line.clone());
                        ctx.sink.try_emit(StatusEvent::output(ctx.run_id, &stage.id, attempt, stream, line));
                    }
                    None => lines_open = false,
                },
                status = child.wait(), if exit_status.is_none() => match status {
                    Ok(status) => {
                        exit_status = Some(status);
                        drain
                            .as_mut()
                            .reset(tokio::time::Instant::now() + ctx.limits.kill_grace);
                    }
                    Err(e) => break Outcome::WaitFailed(e),
                },
                () = &mut drain, if exit_status.is_some() => {
                    if let Some(status) = exit_status {
                        break Outcome::Exited(status);
                    }
                },
                () = &mut deadline => break Outcome::TimedOut,
                () = ctx.cancel.cancelled() => break Outcome::Cancelled,
            }
        };

        if matches!(outcome, Outcome::TimedOut | Outcome::Cancelled) {
            terminate(child, ctx.limits.kill_grace).await;
        }
        // Whatever was already read is still worth keeping.
        while let Ok((stream, line)) = line_rx.try_recv() {
            if stream == OutputStream::Stderr {
                captured.stderr.push(line.clone());
            }
            captured.combined.push(line);
        }

        (outcome, captured)
    }
}

fn spawn_reader<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<(OutputStream, String)>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send((stream, line)).await.is_err() {
                break;
            }
        }
    });
}

/// Asks the process group to stop, then kills it after `grace`.
async fn terminate(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        return;
    };

    #[cfg(unix)]
    signal_group(pid, "TERM").await;
    #[cfg(not(unix))]
    let _ = child.start_kill();

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => debug!(pid, "Process exited after termination request"),
        Err(_) => {
            warn!(pid, "Process ignored termination request, killing");
            #[cfg(unix)]
            signal_group(pid, "KILL").await;
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

#[cfg(unix)]
async fn signal_group(pid: u32, signal: &str) {
    let result = Command::new("kill")
        .arg(format!("-{signal}"))
        .arg("--")
        .arg(format!("-{pid}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = result {
        warn!(pid, signal, error = %e, "Failed to signal process group");
    }
}

async fn check_exit(
    status: ExitStatus,
    failure_line: Option<String>,
    stage: &Stage,
    workdir: &Path,
    stderr_tail: Vec<String>,
) -> Result<(), ErrorDetail> {
    let code = status.code();
    let with_code = |detail: ErrorDetail| match code {
        Some(code) => detail.with_exit_code(code),
        None => detail,
    };

    if let Some(line) = failure_line {
        return Err(with_code(
            ErrorDetail::new(ErrorKind::Execution, line).with_stderr_tail(stderr_tail),
        ));
    }
    if !status.success() {
        let message = match code {
            Some(code) => format!("Command exited with code {code}"),
            None => "Command terminated by a signal".to_string(),
        };
        return Err(with_code(
            ErrorDetail::new(ErrorKind::Execution, message).with_stderr_tail(stderr_tail),
        ));
    }

    let mut missing = Vec::new();
    for output in &stage.expected_outputs {
        if !tokio::fs::try_exists(workdir.join(&output.path))
            .await
            .unwrap_or(false)
        {
            missing.push(output.path.clone());
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ErrorDetail::new(
            ErrorKind::Execution,
            format!("Missing declared outputs: {}", missing.join(", ")),
        )
        .with_exit_code(0)
        .with_stderr_tail(stderr_tail))
    }
}

async fn run_cleanup(
    template: &str,
    stage: &Stage,
    ctx: &RunContext,
    attempt: u32,
    root: &str,
    env: &[(String, String)],
    exec: &mut StageExecution,
) {
    let rendered = crate::stages::CommandTemplate::new(template)
        .render(&ctx.template_context(stage, attempt, root));
    let command = match rendered {
        Ok(command) => command,
        Err(e) => {
            exec.note(format!("cleanup skipped: {e}"));
            return;
        }
    };

    let mut cmd = shell_command(&command);
    cmd.current_dir(&ctx.workdir)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let note = match tokio::time::timeout(ctx.limits.kill_grace, cmd.output()).await {
        Ok(Ok(output)) if output.status.success() => None,
        Ok(Ok(output)) => Some(format!(
            "cleanup failed ({}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )),
        Ok(Err(e)) => Some(format!("cleanup failed to start: {e}")),
        Err(_) => Some("cleanup timed out".to_string()),
    };
    if let Some(note) = note {
        warn!(run_id = %ctx.run_id, stage_id = %stage.id, attempt, "{note}");
        exec.note(note);
    }
}

pub(crate) fn transition(exec: &mut StageExecution, next: ExecutionStatus) {
    if let Err(e) = exec.transition(next) {
        warn!(error = %e, "Ignored execution transition");
    }
}

/// Applies the final outcome to the record.
pub(crate) fn finish(exec: &mut StageExecution, result: Result<(), ErrorDetail>) {
    let applied = match result {
        Ok(()) => exec.succeed(),
        Err(detail) => exec.fail_with(detail),
    };
    if let Err(e) = applied {
        warn!(error = %e, "Ignored execution transition");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ParameterSet;
    use crate::core::StageKind;
    use crate::events::CollectingStatusSink;
    use crate::stages::InputRef;
    use std::sync::Arc;
    use std::time::Instant;
    use uuid::Uuid;

    fn context(dir: &Path, sink: Arc<CollectingStatusSink>) -> RunContext {
        RunContext::new(Uuid::new_v4(), dir, Arc::new(ParameterSet::new()), sink).with_limits(
            crate::context::ExecutionLimits {
                kill_grace: Duration::from_millis(500),
                ..Default::default()
            },
        )
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_success_requires_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(CollectingStatusSink::new());
        let ctx = context(dir.path(), sink.clone());

        let stage = Stage::new("mesh", StageKind::Mesh, "echo meshing; touch {output.mesh}")
            .with_output("mesh", "model.msh");
        let exec = LocalExecutor::new().run(&stage, &ctx, 1).await;

        assert_eq!(exec.status(), ExecutionStatus::Succeeded);
        assert_eq!(exec.output_tail, vec!["meshing".to_string()]);
        assert_eq!(sink.output_lines("mesh"), vec!["meshing".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_zero_without_output_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), Arc::new(CollectingStatusSink::new()));

        let stage = Stage::new("mesh", StageKind::Mesh, "true").with_output("mesh", "model.msh");
        let exec = LocalExecutor::new().run(&stage, &ctx, 1).await;

        assert_eq!(exec.status(), ExecutionStatus::Failed);
        let error = exec.error.unwrap();
        assert_eq!(error.exit_code, Some(0));
        assert!(error.message.contains("model.msh"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_keeps_stderr_tail() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), Arc::new(CollectingStatusSink::new()));

        let stage = Stage::new("solve", StageKind::Solve, "echo diverged >&2; exit 3");
        let exec = LocalExecutor::new().run(&stage, &ctx, 1).await;

        let error = exec.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Execution);
        assert_eq!(error.exit_code, Some(3));
        assert_eq!(error.stderr_tail, vec!["diverged".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failure_pattern_on_exit_zero() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), Arc::new(CollectingStatusSink::new()));

        let stage = Stage::new(
            "export",
            StageKind::ExportGeometry,
            "echo 'Error exporting STEP file: no solids'",
        )
        .with_failure_pattern("^Error exporting");
        let exec = LocalExecutor::new().run(&stage, &ctx, 1).await;

        assert_eq!(exec.status(), ExecutionStatus::Failed);
        assert_eq!(
            exec.error.unwrap().message,
            "Error exporting STEP file: no solids"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), Arc::new(CollectingStatusSink::new()));

        let stage = Stage::new("solve", StageKind::Solve, "sleep 30; touch late.txt")
            .with_timeout(Duration::from_millis(300));
        let started = Instant::now();
        let exec = LocalExecutor::new().run(&stage, &ctx, 1).await;

        assert_eq!(exec.status(), ExecutionStatus::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!dir.path().join("late.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_stops_process() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), Arc::new(CollectingStatusSink::new()));
        let cancel = ctx.cancel.clone();

        let stage = Stage::new("solve", StageKind::Solve, "sleep 30");
        let handle = tokio::spawn(async move { LocalExecutor::new().run(&stage, &ctx, 1).await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel("user request");

        let exec = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exec.status(), ExecutionStatus::Cancelled);
        assert_eq!(exec.error.unwrap().message, "user request");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cleanup_runs_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), Arc::new(CollectingStatusSink::new()));

        let stage = Stage::new("cad", StageKind::CadUpdate, "exit 1")
            .with_cleanup("touch {workdir}/undo.done");
        let exec = LocalExecutor::new().run(&stage, &ctx, 1).await;

        assert_eq!(exec.status(), ExecutionStatus::Failed);
        assert!(dir.path().join("undo.done").exists());
        assert!(exec.notes.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_env_exposes_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("model.step"), "x").unwrap();
        let ctx = context(dir.path(), Arc::new(CollectingStatusSink::new()));

        let stage = Stage::new("mesh", StageKind::Mesh, "cp \"$CADFLOW_INPUT_STEP\" \"$CADFLOW_OUTPUT_MESH\"")
            .with_input(InputRef::file("step", "model.step"))
            .with_output("mesh", "copy.msh");
        let exec = LocalExecutor::new().run(&stage, &ctx, 1).await;

        assert_eq!(exec.status(), ExecutionStatus::Succeeded);
        assert!(dir.path().join("copy.msh").exists());
    }
}
