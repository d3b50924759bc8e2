//! Scenario runs with `solve` dispatched to a scripted remote host.
#![cfg(unix)]

use cadflow::prelude::*;
use cadflow::testing::{
    fast_orchestrator_config, scenario_parameters, JobScript, ScenarioPipeline,
    ScriptedConnector, ScriptedHost,
};
use pretty_assertions::assert_eq;
use std::path::Path;
use std::time::{Duration, Instant};

struct Harness {
    orchestrator: Orchestrator,
    sink: Arc<CollectingStatusSink>,
    host: ScriptedHost,
    connector: Arc<ScriptedConnector>,
}

fn harness(root: &Path, profile: RemoteProfile) -> Harness {
    let host = ScriptedHost::new();
    let connector = Arc::new(ScriptedConnector::new(host.clone()));
    let sink = Arc::new(CollectingStatusSink::new());
    let pipeline = ScenarioPipeline::new().with_remote_solve(None).build();
    let config = CadflowConfig::new(root, pipeline)
        .with_orchestrator(fast_orchestrator_config())
        .with_profile(profile);
    let orchestrator = Orchestrator::with_connector(config, sink.clone(), connector.clone()).unwrap();
    Harness {
        orchestrator,
        sink,
        host,
        connector,
    }
}

fn hpc() -> RemoteProfile {
    RemoteProfile::new("hpc", "hpc.example.org", "eng")
}

async fn submit(h: &Harness) -> RunHandle {
    h.orchestrator
        .submit(
            SubmitRequest::new(scenario_parameters())
                .with_target(TargetSelection::Profile("hpc".into())),
        )
        .await
        .unwrap()
}

async fn finish(handle: RunHandle) -> PipelineRun {
    tokio::time::timeout(Duration::from_secs(30), handle.wait())
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_remote_solve_round_trip() {
    let root = tempfile::tempdir().unwrap();
    let h = harness(root.path(), hpc());
    h.host.script_stage(
        "solve",
        JobScript::succeed()
            .with_stdout("solver converged")
            .with_output("result.frd", b"displacements".to_vec()),
    );

    let run = finish(submit(&h).await).await;

    assert_eq!(run.status(), RunStatus::Completed, "{:?}", run.error);
    assert_eq!(
        std::fs::read(run.workdir.join("result.frd")).unwrap(),
        b"displacements"
    );
    let remote_mesh = format!("{}/cadflow/{}/model.msh", h.host.home(), run.id);
    assert_eq!(
        h.host.file(&remote_mesh).unwrap(),
        std::fs::read(run.workdir.join("model.msh")).unwrap()
    );
    assert_eq!(h.sink.output_lines("solve"), vec!["solver converged".to_string()]);
    assert_eq!(h.host.submissions(), 1);
}

#[tokio::test]
async fn test_dropped_link_during_polling_does_not_resubmit() {
    let root = tempfile::tempdir().unwrap();
    let h = harness(root.path(), hpc());
    h.host.script_stage(
        "solve",
        JobScript::succeed()
            .after_polls(3)
            .with_output("result.frd", b"frd".to_vec()),
    );
    h.host.drop_next_polls(2);

    let run = finish(submit(&h).await).await;

    assert_eq!(run.status(), RunStatus::Completed, "{:?}", run.error);
    assert_eq!(run.attempts("solve").len(), 1);
    assert_eq!(h.host.submissions(), 1);
    assert!(h.connector.attempts() >= 2, "session was not re-established");
}

#[tokio::test]
async fn test_queue_failure_reports_exit_code() {
    let root = tempfile::tempdir().unwrap();
    let h = harness(
        root.path(),
        hpc().with_queue(SchedulerKind::Slurm, "sbatch {script}"),
    );
    h.host.script_stage(
        "solve",
        JobScript::exit(3).with_stderr("*** ERROR: singular matrix"),
    );

    let run = finish(submit(&h).await).await;

    assert_eq!(run.status(), RunStatus::Failed);
    assert_eq!(run.failed_stage.as_deref(), Some("solve"));
    let error = run.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Execution);
    assert_eq!(error.exit_code, Some(3));
    assert!(error
        .stderr_tail
        .iter()
        .any(|line| line.contains("singular matrix")));
    assert_eq!(h.host.command_count("sbatch"), 1);
}

#[tokio::test]
async fn test_cancel_mid_solve_leaves_reconciliation_pending() {
    let root = tempfile::tempdir().unwrap();
    let h = harness(root.path(), hpc());
    h.host.script_stage("solve", JobScript::never_finishes());

    let handle = submit(&h).await;
    let deadline = Instant::now() + Duration::from_secs(10);
    while !h
        .sink
        .stage_transitions("solve")
        .contains(&(1, ExecutionStatus::Running))
    {
        assert!(Instant::now() < deadline, "solve never started");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(handle.cancel("design changed"));
    let run = finish(handle).await;

    assert_eq!(run.status(), RunStatus::Cancelled);
    let solve = run.final_attempt("solve").unwrap();
    assert_eq!(solve.status(), ExecutionStatus::Cancelled);
    assert!(solve.reconciliation_pending);
    assert!(solve.job_id.is_some());
    assert_eq!(h.host.cancels().len(), 1);
    assert_eq!(
        h.sink.run_transitions(),
        vec![RunStatus::Running, RunStatus::Cancelled]
    );

    let job = h.orchestrator.dispatcher().jobs().for_run(&run.id);
    assert_eq!(job.len(), 1);
    assert_eq!(job[0].state, cadflow::remote::JobState::CancelRequested);
}

#[tokio::test]
async fn test_rejected_credentials_fail_without_retry() {
    let root = tempfile::tempdir().unwrap();
    let h = harness(root.path(), hpc());
    h.host.reject_auth();

    let run = finish(submit(&h).await).await;

    assert_eq!(run.status(), RunStatus::Failed);
    assert_eq!(run.attempts("solve").len(), 1);
    assert_eq!(run.error.as_ref().unwrap().kind, ErrorKind::Auth);
    assert_eq!(h.host.submissions(), 0);
    // Local stages before the remote one ran normally.
    assert_eq!(
        run.final_attempt("mesh").unwrap().status(),
        ExecutionStatus::Succeeded
    );
}

#[tokio::test]
async fn test_local_target_keeps_remote_stage_local() {
    let root = tempfile::tempdir().unwrap();
    let h = harness(root.path(), hpc());

    let run = finish(
        h.orchestrator
            .submit(SubmitRequest::new(scenario_parameters()))
            .await
            .unwrap(),
    )
    .await;

    assert_eq!(run.status(), RunStatus::Completed, "{:?}", run.error);
    assert!(h.host.commands().is_empty());
    assert_eq!(h.connector.attempts(), 0);
}
