//! Stage kind, attempt status and run status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The engineering phase a stage performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Parametric CAD update from an expression file.
    CadUpdate,
    /// Geometry export (e.g. STEP) from the CAD tool.
    ExportGeometry,
    /// Mesh generation.
    Mesh,
    /// Numerical solve.
    Solve,
    /// Post-processing of solver results.
    Postprocess,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CadUpdate => write!(f, "cad_update"),
            Self::ExportGeometry => write!(f, "export_geometry"),
            Self::Mesh => write!(f, "mesh"),
            Self::Solve => write!(f, "solve"),
            Self::Postprocess => write!(f, "postprocess"),
        }
    }
}

/// The status of one stage attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Not started yet.
    Pending,
    /// Process or job is live.
    Running,
    /// Exit code 0 and every declared output present.
    Succeeded,
    /// Non-zero exit, missing output, or a remote error.
    Failed,
    /// Wall-clock budget exceeded.
    TimedOut,
    /// Cancelled by request.
    Cancelled,
}

impl Default for ExecutionStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl ExecutionStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }

    /// Returns true if the status indicates success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Returns true if moving to `next` keeps the lifecycle monotonic.
    ///
    /// Pending may jump straight to a terminal state (e.g. cancelled before
    /// the process was spawned); nothing leaves a terminal state.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        match self {
            Self::Pending => next != Self::Pending,
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

/// The overall status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Accepted, not started.
    Created,
    /// Stages are executing.
    Running,
    /// Every stage's final attempt succeeded.
    Completed,
    /// A stage exhausted its retry budget or hit a non-retryable error.
    Failed,
    /// Cancelled by request.
    Cancelled,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Created
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl RunStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true if moving to `next` follows Created → Running → terminal.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        match self {
            Self::Created => next != Self::Created,
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_kind_display() {
        assert_eq!(StageKind::CadUpdate.to_string(), "cad_update");
        assert_eq!(StageKind::ExportGeometry.to_string(), "export_geometry");
        assert_eq!(StageKind::Postprocess.to_string(), "postprocess");
    }

    #[test]
    fn test_execution_status_is_terminal() {
        assert!(ExecutionStatus::Succeeded.is_terminal());
        assert!(ExecutionStatus::TimedOut.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
    }

    #[test]
    fn test_execution_status_transitions_are_monotonic() {
        use ExecutionStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Succeeded.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Succeeded));
        assert!(!TimedOut.can_transition_to(Cancelled));
    }

    #[test]
    fn test_run_status_transitions() {
        assert!(RunStatus::Created.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Completed));
        assert!(!RunStatus::Completed.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Created));
    }

    #[test]
    fn test_status_serialize() {
        let json = serde_json::to_string(&ExecutionStatus::TimedOut).unwrap();
        assert_eq!(json, r#""timed_out""#);

        let kind: StageKind = serde_json::from_str(r#""export_geometry""#).unwrap();
        assert_eq!(kind, StageKind::ExportGeometry);
    }
}
