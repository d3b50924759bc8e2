//! Status events delivered to the Status Sink.

use super::{ExecutionStatus, RunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Which output stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// The status carried by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "value", rename_all = "snake_case")]
pub enum EventStatus {
    /// A run-level transition.
    Run(RunStatus),
    /// A stage-attempt transition.
    Stage(ExecutionStatus),
    /// A line of tool output.
    Output(OutputStream),
}

impl EventStatus {
    /// Returns true if this is a terminal run transition.
    #[must_use]
    pub fn is_terminal_run(&self) -> bool {
        matches!(self, Self::Run(status) if status.is_terminal())
    }

    /// Returns true if this event only carries tool output.
    #[must_use]
    pub fn is_output(&self) -> bool {
        matches!(self, Self::Output(_))
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Run(status) => write!(f, "run.{status}"),
            Self::Stage(status) => write!(f, "stage.{status}"),
            Self::Output(OutputStream::Stdout) => write!(f, "output.stdout"),
            Self::Output(OutputStream::Stderr) => write!(f, "output.stderr"),
        }
    }
}

/// One ordered progress event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    /// The run this event belongs to.
    pub run_id: Uuid,
    /// The stage, for stage and output events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_id: Option<String>,
    /// The attempt number (1-based), for stage and output events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    /// What happened.
    pub status: EventStatus,
    /// When it happened.
    pub timestamp: DateTime<Utc>,
    /// Free-form message (error text, output line).
    #[serde(default)]
    pub message: String,
}

impl StatusEvent {
    /// Creates a run-level event.
    #[must_use]
    pub fn run(run_id: Uuid, status: RunStatus, message: impl Into<String>) -> Self {
        Self {
            run_id,
            stage_id: None,
            attempt: None,
            status: EventStatus::Run(status),
            timestamp: Utc::now(),
            message: message.into(),
        }
    }

    /// Creates a stage-attempt event.
    #[must_use]
    pub fn stage(
        run_id: Uuid,
        stage_id: &str,
        attempt: u32,
        status: ExecutionStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            run_id,
            stage_id: Some(stage_id.to_string()),
            attempt: Some(attempt),
            status: EventStatus::Stage(status),
            timestamp: Utc::now(),
            message: message.into(),
        }
    }

    /// Creates an output-line event.
    #[must_use]
    pub fn output(
        run_id: Uuid,
        stage_id: &str,
        attempt: u32,
        stream: OutputStream,
        line: impl Into<String>,
    ) -> Self {
        Self {
            run_id,
            stage_id: Some(stage_id.to_string()),
            attempt: Some(attempt),
            status: EventStatus::Output(stream),
            timestamp: Utc::now(),
            message: line.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_event() {
        let id = Uuid::new_v4();
        let event = StatusEvent::run(id, RunStatus::Completed, "");
        assert_eq!(event.run_id, id);
        assert!(event.stage_id.is_none());
        assert!(event.status.is_terminal_run());
    }

    #[test]
    fn test_stage_event() {
        let event = StatusEvent::stage(Uuid::new_v4(), "mesh", 2, ExecutionStatus::Failed, "exit 1");
        assert_eq!(event.stage_id.as_deref(), Some("mesh"));
        assert_eq!(event.attempt, Some(2));
        assert!(!event.status.is_terminal_run());
        assert_eq!(event.status.to_string(), "stage.failed");
    }

    #[test]
    fn test_event_serialization() {
        let event = StatusEvent::output(Uuid::new_v4(), "solve", 1, OutputStream::Stderr, "warn");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["status"]["scope"], "output");
        assert_eq!(json["status"]["value"], "stderr");

        let back: StatusEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
