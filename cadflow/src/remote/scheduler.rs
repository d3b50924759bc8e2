//! Remote command construction and scheduler output parsing.

use super::job::JobState;
use super::profile::{RemoteProfile, SchedulerKind};
use super::shell::remote_path_arg;
use crate::errors::CadflowError;
use crate::utils::{quote_arg, remote_join};
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;
use uuid::Uuid;

static SLURM_SUBMITTED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Submitted batch job (\d+)").unwrap_or_else(|e| unreachable!("static regex: {e}"))
});

static PBS_JOB_STATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*job_state\s*=\s*(\w)").unwrap_or_else(|e| unreachable!("static regex: {e}"))
});

static FIRST_INTEGER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d+)\b").unwrap_or_else(|e| unreachable!("static regex: {e}")));

/// Prefix of the exit-marker line appended to status output.
pub(crate) const MARKER_PREFIX: &str = "cadflow-exit:";

/// Separates stdout and stderr in fetched logs.
pub(crate) const STDERR_SEPARATOR: &str = "--cadflow-stderr--";

/// Creates the run and job directories and prints the resolved run path.
pub(crate) fn prepare_command(run_dir: &str, job_dir: &str, extra_dirs: &[String]) -> String {
    let mut dirs = vec![remote_path_arg(run_dir), remote_path_arg(job_dir)];
    dirs.extend(extra_dirs.iter().map(|d| remote_path_arg(d)));
    format!(
        "mkdir -p {} && cd {} && pwd",
        dirs.join(" "),
        remote_path_arg(run_dir)
    )
}

/// Prints the size of a file and, when `sha256sum` exists, its digest.
pub(crate) fn verify_command(path: &str) -> String {
    let p = remote_path_arg(path);
    format!(
        "wc -c < {p} && (command -v sha256sum >/dev/null 2>&1 && sha256sum {p} || true)"
    )
}

/// Parses [`verify_command`] output into `(size, sha256)`.
pub(crate) fn parse_verify_output(stdout: &str) -> Option<(u64, Option<String>)> {
    let mut lines = stdout.lines().map(str::trim).filter(|l| !l.is_empty());
    let size = lines.next()?.parse().ok()?;
    let digest = lines
        .next()
        .and_then(|l| l.split_whitespace().next())
        .filter(|d| d.len() == 64 && d.chars().all(|c| c.is_ascii_hexdigit()))
        .map(str::to_ascii_lowercase);
    Some((size, digest))
}

/// Writes `content` to a remote file through a quoted heredoc.
///
/// The terminator carries a fresh uuid so no line of `content` can end the
/// heredoc early.
pub(crate) fn write_file_command(path: &str, content: &str) -> String {
    let mut end = format!("CADFLOW_EOF_{}", Uuid::new_v4().simple());
    while content.lines().any(|line| line == end) {
        end = format!("CADFLOW_EOF_{}", Uuid::new_v4().simple());
    }
    format!(
        "cat > {} <<'{end}'\n{content}\n{end}",
        remote_path_arg(path)
    )
}

/// Builds the job script: run the command in the run directory, capture its
/// output into the job directory and record the exit code.
pub(crate) fn job_script(
    profile: &RemoteProfile,
    job_name: &str,
    run_dir: &str,
    job_dir: &str,
    env: &[(String, String)],
    command: &str,
    timeout: Duration,
) -> String {
    let job = remote_path_arg(job_dir);
    let mut lines = vec!["#!/bin/sh".to_string()];

    if profile.uses_queue() {
        let walltime = format_walltime(timeout);
        let log = remote_join(job_dir, "scheduler.log");
        match profile.scheduler {
            SchedulerKind::Slurm => {
                lines.push(format!("#SBATCH --job-name={job_name}"));
                lines.push(format!("#SBATCH --output={log}"));
                lines.push(format!("#SBATCH --time={walltime}"));
            }
            SchedulerKind::Pbs => {
                lines.push(format!("#PBS -N {job_name}"));
                lines.push(format!("#PBS -o {log}"));
                lines.push("#PBS -j oe".to_string());
                lines.push(format!("#PBS -l walltime={walltime}"));
            }
            SchedulerKind::Custom => {}
        }
    }

    lines.push(format!(
        "cd {} || {{ echo 127 > {job}/exit_code; exit 127; }}",
        remote_path_arg(run_dir)
    ));
    for (key, value) in env {
        lines.push(format!("export {key}={}", quote_arg(value)));
    }
    lines.push(format!(
        "( {command} ) > {job}/stdout.log 2> {job}/stderr.log"
    ));
    lines.push("code=$?".to_string());
    lines.push(format!(
        "echo $code > {job}/exit_code.tmp && mv {job}/exit_code.tmp {job}/exit_code"
    ));
    lines.push("exit $code".to_string());
    lines.join("\n")
}

/// HH:MM:SS, rounded up to whole minutes.
fn format_walltime(timeout: Duration) -> String {
    let minutes = timeout.as_secs().div_ceil(60).max(1);
    format!("{:02}:{:02}:00", minutes / 60, minutes % 60)
}

/// Launches the job script detached, once. Prints the pid.
pub(crate) fn launch_command(job_dir: &str) -> String {
    format!(
        "cd {} && if [ ! -s pid ]; then nohup setsid sh job.sh > /dev/null 2>&1 < /dev/null & echo $! > pid; fi; cat pid",
        remote_path_arg(job_dir)
    )
}

/// Submits the job script to the queue, once. Prints the submit output.
pub(crate) fn submit_command(profile: &RemoteProfile, run_dir: &str, job_dir: &str, job_name: &str) -> String {
    let script = remote_join(job_dir, "job.sh");
    let submit = profile
        .queue_submit_template
        .as_deref()
        .unwrap_or("sbatch {script}")
        .replace("{script}", &remote_path_arg(&script))
        .replace("{workdir}", &remote_path_arg(run_dir))
        .replace("{job_name}", &quote_arg(job_name));
    format!(
        "cd {} && if [ ! -s submit.out ]; then ( {submit} ) > submit.tmp 2>&1 && mv submit.tmp submit.out || {{ cat submit.tmp; exit 1; }}; fi; cat submit.out",
        remote_path_arg(job_dir)
    )
}

/// Extracts the queue job id from submit output.
///
/// # Errors
///
/// Returns an execution error if no id can be found.
pub fn parse_submit_output(scheduler: SchedulerKind, output: &str) -> Result<String, CadflowError> {
    let trimmed = output.trim();
    let id = match scheduler {
        SchedulerKind::Slurm => SLURM_SUBMITTED
            .captures(trimmed)
            .map(|c| c[1].to_string()),
        SchedulerKind::Pbs => trimmed
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(ToString::to_string),
        SchedulerKind::Custom => FIRST_INTEGER
            .captures(trimmed)
            .map(|c| c[1].to_string())
            .or_else(|| (!trimmed.is_empty()).then(|| trimmed.to_string())),
    };
    id.ok_or_else(|| {
        CadflowError::Execution(format!("Could not parse job id from submit output: {trimmed}"))
    })
}

/// Liveness check for a detached process.
pub(crate) fn process_status_command(job_dir: &str) -> String {
    format!(
        "cd {} && if [ -f exit_code ]; then echo \"exited $(cat exit_code)\"; elif kill -0 $(cat pid) 2>/dev/null; then echo running; else echo lost; fi",
        remote_path_arg(job_dir)
    )
}

/// Parses [`process_status_command`] output.
pub(crate) fn parse_process_status(output: &str) -> JobState {
    let line = output.trim();
    if let Some(code) = line.strip_prefix("exited ") {
        return match code.trim().parse::<i32>() {
            Ok(0) => JobState::Completed { exit_code: Some(0) },
            Ok(code) => JobState::Failed {
                exit_code: Some(code),
                reason: format!("exit code {code}"),
            },
            Err(_) => JobState::Unknown { raw: line.to_string() },
        };
    }
    match line {
        "running" => JobState::Running,
        "lost" => JobState::Failed {
            exit_code: None,
            reason: "remote process disappeared without an exit code".to_string(),
        },
        _ => JobState::Unknown { raw: line.to_string() },
    }
}

/// Queue status command, followed by the exit marker line.
pub(crate) fn queue_status_command(profile: &RemoteProfile, job_id: &str, job_dir: &str) -> String {
    let id = quote_arg(job_id);
    let status = match profile.scheduler {
        SchedulerKind::Slurm => format!(
            "S=$(squeue -h -j {id} -o %T 2>/dev/null); if [ -n \"$S\" ]; then echo \"$S\"; else sacct -j {id} -n -P -o State 2>/dev/null | head -n 1; fi"
        ),
        SchedulerKind::Pbs => format!("qstat -f {id} 2>/dev/null"),
        SchedulerKind::Custom => profile
            .queue_status_template
            .as_deref()
            .unwrap_or_default()
            .replace("{job_id}", &id),
    };
    format!(
        "{status}; echo \"{MARKER_PREFIX}$(cat {}/exit_code 2>/dev/null)\"",
        remote_path_arg(job_dir)
    )
}

/// Parses [`queue_status_command`] output.
///
/// When the scheduler no longer knows the job, the exit marker decides.
pub fn parse_queue_status(scheduler: SchedulerKind, output: &str) -> JobState {
    let mut marker = None;
    let mut body = Vec::new();
    for line in output.lines() {
        match line.trim().strip_prefix(MARKER_PREFIX) {
            Some(code) => marker = code.trim().parse::<i32>().ok(),
            None => body.push(line),
        }
    }
    let body = body.join("\n");

    let state = match scheduler {
        SchedulerKind::Slurm => slurm_state(&body),
        SchedulerKind::Pbs => pbs_state(&body),
        SchedulerKind::Custom => keyword_state(&body),
    };

    match (state, marker) {
        (JobState::Completed { .. }, Some(code)) if code != 0 => JobState::Failed {
            exit_code: Some(code),
            reason: format!("exit code {code}"),
        },
        (JobState::Completed { .. }, code) => JobState::Completed { exit_code: code },
        (JobState::Failed { reason, .. }, code) => JobState::Failed { exit_code: code, reason },
        (JobState::Unknown { .. }, Some(0)) => JobState::Completed { exit_code: Some(0) },
        (JobState::Unknown { .. }, Some(code)) => JobState::Failed {
            exit_code: Some(code),
            reason: format!("exit code {code}"),
        },
        (state, _) => state,
    }
}

/// True when the scheduler has no record of the job and no exit marker was
/// written.
pub(crate) fn left_queue_without_marker(state: &JobState) -> bool {
    matches!(state, JobState::Unknown { raw } if raw.is_empty())
}

fn slurm_state(body: &str) -> JobState {
    let raw = body
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default();
    let word = raw
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .trim_end_matches('+')
        .to_ascii_uppercase();
    match word.as_str() {
        "PENDING" | "CONFIGURING" | "REQUEUED" | "SUSPENDED" | "RESV_DEL_HOLD" => JobState::Queued,
        "RUNNING" | "COMPLETING" | "STAGE_OUT" => JobState::Running,
        "COMPLETED" => JobState::Completed { exit_code: None },
        "FAILED" | "TIMEOUT" | "NODE_FAIL" | "OUT_OF_MEMORY" | "BOOT_FAIL" | "DEADLINE"
        | "PREEMPTED" | "CANCELLED" => JobState::Failed {
            exit_code: None,
            reason: raw.to_string(),
        },
        _ => JobState::Unknown { raw: raw.to_string() },
    }
}

fn pbs_state(body: &str) -> JobState {
    let Some(caps) = PBS_JOB_STATE.captures(body) else {
        return JobState::Unknown { raw: body.trim().to_string() };
    };
    match &caps[1] {
        "Q" | "H" | "W" | "T" => JobState::Queued,
        "R" | "E" => JobState::Running,
        "C" | "F" => JobState::Completed { exit_code: None },
        other => JobState::Unknown { raw: format!("job_state = {other}") },
    }
}

fn keyword_state(body: &str) -> JobState {
    let lower = body.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));
    if has(&["fail", "error", "cancel", "timeout", "killed"]) {
        JobState::Failed {
            exit_code: None,
            reason: body.trim().to_string(),
        }
    } else if has(&["complete", "done", "finished", "success"]) {
        JobState::Completed { exit_code: None }
    } else if has(&["running", "active", "executing"]) {
        JobState::Running
    } else if has(&["pending", "queued", "waiting", "held"]) {
        JobState::Queued
    } else {
        JobState::Unknown { raw: body.trim().to_string() }
    }
}

/// Cancel command for a job.
pub(crate) fn cancel_command(profile: &RemoteProfile, handle: &super::job::JobHandle) -> String {
    use super::job::JobHandle;
    match handle {
        JobHandle::Process { pid } => {
            format!("kill -TERM -- -{pid} 2>/dev/null || kill -TERM {pid}")
        }
        JobHandle::Queue { job_id, .. } => {
            let id = quote_arg(job_id);
            match profile.scheduler {
                SchedulerKind::Slurm => format!("scancel {id}"),
                SchedulerKind::Pbs => format!("qdel {id}"),
                SchedulerKind::Custom => profile
                    .queue_cancel_template
                    .as_deref()
                    .unwrap_or_default()
                    .replace("{job_id}", &id),
            }
        }
    }
}

/// Prints the last `lines` of the job's stdout and stderr logs.
pub(crate) fn logs_command(job_dir: &str, lines: usize) -> String {
    format!(
        "cd {} && tail -n {lines} stdout.log 2>/dev/null; echo '{STDERR_SEPARATOR}'; tail -n {lines} stderr.log 2>/dev/null; true",
        remote_path_arg(job_dir)
    )
}

/// Splits [`logs_command`] output into stdout and stderr lines.
pub(crate) fn parse_logs(output: &str) -> (Vec<String>, Vec<String>) {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut in_stderr = false;
    for line in output.lines() {
        if line.trim() == STDERR_SEPARATOR {
            in_stderr = true;
        } else if in_stderr {
            stderr.push(line.to_string());
        } else {
            stdout.push(line.to_string());
        }
    }
    (stdout, stderr)
}

/// Runs a command in the remote run directory with the stage environment.
pub(crate) fn in_workdir_command(run_dir: &str, env: &[(String, String)], command: &str) -> String {
    let exports: String = env
        .iter()
        .map(|(k, v)| format!("export {k}={}; ", quote_arg(v)))
        .collect();
    format!("cd {} && {exports}{command}", remote_path_arg(run_dir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::JobHandle;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_submit_output() {
        assert_eq!(
            parse_submit_output(SchedulerKind::Slurm, "Submitted batch job 4242\n").unwrap(),
            "4242"
        );
        assert_eq!(
            parse_submit_output(SchedulerKind::Pbs, "\n1234.pbs-server\n").unwrap(),
            "1234.pbs-server"
        );
        assert_eq!(
            parse_submit_output(SchedulerKind::Custom, "job <77> accepted").unwrap(),
            "77"
        );
        assert!(parse_submit_output(SchedulerKind::Slurm, "sbatch: error: invalid partition").is_err());
    }

    #[test]
    fn test_slurm_status_mapping() {
        let parse = |out: &str| parse_queue_status(SchedulerKind::Slurm, out);
        assert_eq!(parse("PENDING\ncadflow-exit:\n"), JobState::Queued);
        assert_eq!(parse("RUNNING\ncadflow-exit:\n"), JobState::Running);
        assert_eq!(
            parse("COMPLETED\ncadflow-exit:0\n"),
            JobState::Completed { exit_code: Some(0) }
        );
        assert!(matches!(parse("TIMEOUT\ncadflow-exit:\n"), JobState::Failed { .. }));
        assert!(matches!(
            parse("CANCELLED by 1001\ncadflow-exit:\n"),
            JobState::Failed { .. }
        ));
    }

    #[test]
    fn test_completed_with_nonzero_marker_is_failure() {
        let state = parse_queue_status(SchedulerKind::Slurm, "COMPLETED\ncadflow-exit:2");
        assert_eq!(
            state,
            JobState::Failed {
                exit_code: Some(2),
                reason: "exit code 2".into()
            }
        );
    }

    #[test]
    fn test_pbs_status_mapping() {
        let out = "Job Id: 12.server\n    job_state = R\n    queue = batch\ncadflow-exit:";
        assert_eq!(parse_queue_status(SchedulerKind::Pbs, out), JobState::Running);

        // Job left qstat; the marker decides.
        assert_eq!(
            parse_queue_status(SchedulerKind::Pbs, "cadflow-exit:0"),
            JobState::Completed { exit_code: Some(0) }
        );
        assert!(left_queue_without_marker(&parse_queue_status(
            SchedulerKind::Pbs,
            "cadflow-exit:"
        )));
        assert!(!left_queue_without_marker(&parse_queue_status(SchedulerKind::Pbs, out)));
    }

    #[test]
    fn test_custom_keywords() {
        assert_eq!(parse_queue_status(SchedulerKind::Custom, "state: queued"), JobState::Queued);
        assert_eq!(parse_queue_status(SchedulerKind::Custom, "RUNNING"), JobState::Running);
        assert!(matches!(
            parse_queue_status(SchedulerKind::Custom, "???"),
            JobState::Unknown { .. }
        ));
    }

    #[test]
    fn test_process_status() {
        assert_eq!(parse_process_status("running\n"), JobState::Running);
        assert_eq!(
            parse_process_status("exited 0"),
            JobState::Completed { exit_code: Some(0) }
        );
        assert!(matches!(
            parse_process_status("lost"),
            JobState::Failed { exit_code: None, .. }
        ));
    }

    #[test]
    fn test_verify_output() {
        let digest = "a".repeat(64);
        assert_eq!(
            parse_verify_output(&format!("  12\n{digest}  /r/model.step\n")),
            Some((12, Some(digest)))
        );
        assert_eq!(parse_verify_output("12\n"), Some((12, None)));
        assert_eq!(parse_verify_output(""), None);
    }

    #[test]
    fn test_job_script_slurm_directives() {
        let profile = RemoteProfile::new("hpc", "hpc", "eng").with_queue(SchedulerKind::Slurm, "sbatch {script}");
        let script = job_script(
            &profile,
            "cadflow-solve",
            "/scratch/run",
            "/scratch/run/.cadflow/solve-1",
            &[("CADFLOW_STAGE_ID".into(), "solve".into())],
            "solver input.msh",
            Duration::from_secs(5400),
        );
        assert!(script.contains("#SBATCH --time=01:30:00"));
        assert!(script.contains("export CADFLOW_STAGE_ID=solve"));
        assert!(script.contains("( solver input.msh ) > '/scratch/run/.cadflow/solve-1'/stdout.log"));
    }

    #[test]
    fn test_submit_and_cancel_commands() {
        let profile = RemoteProfile::new("hpc", "hpc", "eng").with_queue(SchedulerKind::Pbs, "qsub -N {job_name} {script}");
        let cmd = submit_command(&profile, "/r", "/r/.cadflow/solve-1", "cadflow-solve");
        assert!(cmd.contains("qsub -N cadflow-solve '/r/.cadflow/solve-1/job.sh'"));

        let handle = JobHandle::Queue {
            scheduler: SchedulerKind::Pbs,
            job_id: "12.server".into(),
        };
        assert_eq!(cancel_command(&profile, &handle), "qdel 12.server");
        assert_eq!(
            cancel_command(&profile, &JobHandle::Process { pid: 99 }),
            "kill -TERM -- -99 2>/dev/null || kill -TERM 99"
        );
    }

    #[test]
    fn test_heredoc_terminator_is_unique() {
        let script = "echo start\nCADFLOW_EOF\necho end";
        let command = write_file_command("/scratch/job.sh", script);
        let (header, rest) = command.split_once('\n').unwrap();
        let end = header.rsplit_once("<<'").unwrap().1.trim_end_matches('\'');
        assert!(end.starts_with("CADFLOW_EOF_"));
        assert_eq!(rest, format!("{script}\n{end}"));
        assert_ne!(command, write_file_command("/scratch/job.sh", script));
    }

    #[test]
    fn test_parse_logs() {
        let (out, err) = parse_logs("a\nb\n--cadflow-stderr--\nwarn\n");
        assert_eq!(out, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(err, vec!["warn".to_string()]);
    }
}
