//! The per-attempt execution record.

use super::{ExecutionStatus, StageKind};
use crate::errors::{CadflowError, ErrorDetail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One attempt of one stage.
///
/// Status changes go through [`StageExecution::transition`], which refuses
/// to leave a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageExecution {
    /// The stage this attempt belongs to.
    pub stage_id: String,
    /// The stage kind.
    pub kind: StageKind,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Current status.
    status: ExecutionStatus,
    /// When the process or job started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the attempt reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    /// Last captured output lines (stdout and stderr interleaved).
    #[serde(default)]
    pub output_tail: Vec<String>,
    /// Error detail for non-successful attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    /// Remote job id, for dispatched attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    /// True if the attempt was reported before the remote side confirmed it.
    #[serde(default)]
    pub reconciliation_pending: bool,
    /// Extra notes (cleanup results, remote cancel outcome).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl StageExecution {
    /// Creates a pending attempt.
    #[must_use]
    pub fn new(stage_id: impl Into<String>, kind: StageKind, attempt: u32) -> Self {
        Self {
            stage_id: stage_id.into(),
            kind,
            attempt,
            status: ExecutionStatus::Pending,
            started_at: None,
            finished_at: None,
            output_tail: Vec::new(),
            error: None,
            job_id: None,
            reconciliation_pending: false,
            notes: Vec::new(),
        }
    }

    /// Returns the current status.
    #[must_use]
    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    /// Moves the attempt to `next`, stamping timestamps.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the transition would regress the lifecycle.
    pub fn transition(&mut self, next: ExecutionStatus) -> Result<(), CadflowError> {
        if !self.status.can_transition_to(next) {
            return Err(CadflowError::Internal(format!(
                "Illegal transition for stage '{}' attempt {}: {} -> {}",
                self.stage_id, self.attempt, self.status, next
            )));
        }
        let now = Utc::now();
        if next == ExecutionStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    /// Marks the attempt as running.
    pub fn start(&mut self) -> Result<(), CadflowError> {
        self.transition(ExecutionStatus::Running)
    }

    /// Marks the attempt as succeeded.
    pub fn succeed(&mut self) -> Result<(), CadflowError> {
        self.transition(ExecutionStatus::Succeeded)
    }

    /// Marks the attempt as finished with an error, choosing the status from
    /// the error class.
    pub fn fail_with(&mut self, detail: ErrorDetail) -> Result<(), CadflowError> {
        use crate::errors::ErrorKind;
        let status = match detail.kind {
            ErrorKind::Timeout => ExecutionStatus::TimedOut,
            ErrorKind::Cancelled => ExecutionStatus::Cancelled,
            _ => ExecutionStatus::Failed,
        };
        self.transition(status)?;
        self.error = Some(detail);
        Ok(())
    }

    /// Appends a note.
    pub fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    /// Duration in milliseconds, once finished.
    #[must_use]
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn test_lifecycle() {
        let mut exec = StageExecution::new("mesh", StageKind::Mesh, 1);
        assert_eq!(exec.status(), ExecutionStatus::Pending);

        exec.start().unwrap();
        assert!(exec.started_at.is_some());

        exec.succeed().unwrap();
        assert_eq!(exec.status(), ExecutionStatus::Succeeded);
        assert!(exec.duration_ms().is_some());
    }

    #[test]
    fn test_no_regression_from_terminal() {
        let mut exec = StageExecution::new("solve", StageKind::Solve, 1);
        exec.start().unwrap();
        exec.fail_with(ErrorDetail::new(ErrorKind::Execution, "boom"))
            .unwrap();

        assert!(exec.start().is_err());
        assert!(exec.succeed().is_err());
        assert_eq!(exec.status(), ExecutionStatus::Failed);
    }

    #[test]
    fn test_fail_with_maps_kind_to_status() {
        let mut timed_out = StageExecution::new("a", StageKind::Mesh, 1);
        timed_out.start().unwrap();
        timed_out
            .fail_with(ErrorDetail::new(ErrorKind::Timeout, "slow"))
            .unwrap();
        assert_eq!(timed_out.status(), ExecutionStatus::TimedOut);

        let mut cancelled = StageExecution::new("b", StageKind::Mesh, 1);
        cancelled
            .fail_with(ErrorDetail::new(ErrorKind::Cancelled, "stop"))
            .unwrap();
        assert_eq!(cancelled.status(), ExecutionStatus::Cancelled);
        assert!(cancelled.started_at.is_none());
    }
}
