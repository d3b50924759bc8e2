//! Remote job records.
//!
//! A job outlives the shell session that submitted it: reconnects resume
//! polling against the same record and never resubmit.

use super::profile::SchedulerKind;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// How the remote execution is addressed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobHandle {
    /// A detached foreground process.
    Process {
        /// Process id on the remote host.
        pid: u32,
    },
    /// A batch queue job.
    Queue {
        /// Scheduler flavour.
        scheduler: SchedulerKind,
        /// Queue job id.
        job_id: String,
    },
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process { pid } => write!(f, "pid {pid}"),
            Self::Queue { scheduler, job_id } => write!(f, "{scheduler} job {job_id}"),
        }
    }
}

/// Last observed state of a remote job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    /// Accepted, not yet polled.
    Submitted,
    /// Waiting in the queue.
    Queued,
    /// Executing.
    Running,
    /// Finished successfully.
    Completed {
        /// Exit code, when known.
        exit_code: Option<i32>,
    },
    /// Finished unsuccessfully.
    Failed {
        /// Exit code, when known.
        exit_code: Option<i32>,
        /// Scheduler or host explanation.
        reason: String,
    },
    /// A cancel request was sent; the final state is unconfirmed.
    CancelRequested,
    /// State could not be determined from the status output.
    Unknown {
        /// The raw status text.
        raw: String,
    },
}

impl JobState {
    /// True for completed and failed.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Submitted => write!(f, "submitted"),
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Completed { .. } => write!(f, "completed"),
            Self::Failed { reason, .. } => write!(f, "failed ({reason})"),
            Self::CancelRequested => write!(f, "cancel_requested"),
            Self::Unknown { raw } => write!(f, "unknown ({raw})"),
        }
    }
}

/// One remote execution of one stage attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Job id (local).
    pub id: Uuid,
    /// Owning run.
    pub run_id: Uuid,
    /// Stage id.
    pub stage_id: String,
    /// Attempt number.
    pub attempt: u32,
    /// Profile name.
    pub profile: String,
    /// Remote handle.
    pub handle: JobHandle,
    /// Remote run working directory.
    pub remote_workdir: String,
    /// Remote directory with the job script, logs and markers.
    pub job_dir: String,
    /// Last observed state.
    pub state: JobState,
    /// Submission time.
    pub submitted_at: DateTime<Utc>,
    /// Last successful poll.
    pub last_polled_at: Option<DateTime<Utc>>,
    /// Number of successful polls.
    pub polls: u32,
}

/// Dispatcher-owned job records keyed by job id.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: DashMap<Uuid, Job>,
}

impl JobRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a job.
    pub fn insert(&self, job: Job) {
        self.jobs.insert(job.id, job);
    }

    /// Returns a copy of a job.
    #[must_use]
    pub fn get(&self, id: &Uuid) -> Option<Job> {
        self.jobs.get(id).map(|j| j.clone())
    }

    /// Records a poll result.
    pub fn record_state(&self, id: &Uuid, state: JobState) {
        if let Some(mut job) = self.jobs.get_mut(id) {
            job.state = state;
            job.polls += 1;
            job.last_polled_at = Some(Utc::now());
        }
    }

    /// Marks a job as having a pending cancel request.
    pub fn mark_cancel_requested(&self, id: &Uuid) {
        if let Some(mut job) = self.jobs.get_mut(id) {
            if !job.state.is_terminal() {
                job.state = JobState::CancelRequested;
            }
        }
    }

    /// Jobs belonging to a run, oldest first.
    #[must_use]
    pub fn for_run(&self, run_id: &Uuid) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|j| j.run_id == *run_id)
            .map(|j| j.clone())
            .collect();
        jobs.sort_by_key(|j| j.submitted_at);
        jobs
    }

    /// Number of jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Returns true if no job was ever submitted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(run_id: Uuid) -> Job {
        Job {
            id: Uuid::new_v4(),
            run_id,
            stage_id: "solve".into(),
            attempt: 1,
            profile: "hpc".into(),
            handle: JobHandle::Queue {
                scheduler: SchedulerKind::Slurm,
                job_id: "4242".into(),
            },
            remote_workdir: "/scratch/run".into(),
            job_dir: "/scratch/run/.cadflow/solve-1".into(),
            state: JobState::Submitted,
            submitted_at: Utc::now(),
            last_polled_at: None,
            polls: 0,
        }
    }

    #[test]
    fn test_registry_tracks_polls() {
        let registry = JobRegistry::new();
        let run_id = Uuid::new_v4();
        let j = job(run_id);
        let id = j.id;
        registry.insert(j);

        registry.record_state(&id, JobState::Running);
        registry.record_state(&id, JobState::Completed { exit_code: Some(0) });

        let stored = registry.get(&id).unwrap();
        assert_eq!(stored.polls, 2);
        assert!(stored.state.is_terminal());
        assert_eq!(registry.for_run(&run_id).len(), 1);
    }

    #[test]
    fn test_cancel_does_not_override_terminal() {
        let registry = JobRegistry::new();
        let j = job(Uuid::new_v4());
        let id = j.id;
        registry.insert(j);

        registry.mark_cancel_requested(&id);
        assert_eq!(registry.get(&id).unwrap().state, JobState::CancelRequested);

        registry.record_state(&id, JobState::Completed { exit_code: Some(0) });
        registry.mark_cancel_requested(&id);
        assert!(registry.get(&id).unwrap().state.is_terminal());
    }

    #[test]
    fn test_handle_display() {
        assert_eq!(JobHandle::Process { pid: 12 }.to_string(), "pid 12");
        assert_eq!(
            JobHandle::Queue {
                scheduler: SchedulerKind::Pbs,
                job_id: "7.server".into()
            }
            .to_string(),
            "pbs job 7.server"
        );
    }
}
