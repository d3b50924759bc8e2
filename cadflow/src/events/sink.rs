//! Status sink trait and implementations.

use crate::core::{EventStatus, ExecutionStatus, RunStatus, StatusEvent};
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn, Level};

/// Receives ordered progress events for runs.
///
/// Sinks are handed to the orchestrator at construction and called from run
/// tasks, never from the submitter's thread.
#[async_trait]
pub trait StatusSink: Send + Sync {
    /// Delivers an event, waiting if the sink applies backpressure.
    async fn emit(&self, event: StatusEvent);

    /// Delivers an event without waiting.
    ///
    /// This method never fails. Events a sink cannot accept are dropped.
    fn try_emit(&self, event: StatusEvent);
}

/// A no-op sink that discards all events.
///
/// Used as the default when no sink is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpStatusSink;

#[async_trait]
impl StatusSink for NoOpStatusSink {
    async fn emit(&self, _event: StatusEvent) {}

    fn try_emit(&self, _event: StatusEvent) {}
}

/// A sink that logs events using the tracing framework.
#[derive(Debug, Clone)]
pub struct LoggingStatusSink {
    /// The log level for status transitions. Output lines are always DEBUG.
    level: Level,
}

impl Default for LoggingStatusSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingStatusSink {
    /// Creates a new logging sink with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event: &StatusEvent) {
        let stage = event.stage_id.as_deref().unwrap_or("-");
        let attempt = event.attempt.unwrap_or(0);

        if event.status.is_output() {
            debug!(
                run_id = %event.run_id,
                stage_id = %stage,
                attempt,
                "{}", event.message
            );
            return;
        }

        let failed = matches!(
            event.status,
            EventStatus::Run(RunStatus::Failed)
                | EventStatus::Stage(ExecutionStatus::Failed | ExecutionStatus::TimedOut)
        );
        if failed {
            warn!(
                run_id = %event.run_id,
                stage_id = %stage,
                attempt,
                status = %event.status,
                "{}", event.message
            );
        } else if self.level == Level::DEBUG {
            debug!(
                run_id = %event.run_id,
                stage_id = %stage,
                attempt,
                status = %event.status,
                "{}", event.message
            );
        } else {
            info!(
                run_id = %event.run_id,
                stage_id = %stage,
                attempt,
                status = %event.status,
                "{}", event.message
            );
        }
    }
}

#[async_trait]
impl StatusSink for LoggingStatusSink {
    async fn emit(&self, event: StatusEvent) {
        self.log_event(&event);
    }

    fn try_emit(&self, event: StatusEvent) {
        self.log_event(&event);
    }
}

/// A collecting sink for testing purposes.
#[derive(Debug, Default)]
pub struct CollectingStatusSink {
    events: parking_lot::RwLock<Vec<StatusEvent>>,
}

impl CollectingStatusSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<StatusEvent> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Stage transitions for one stage, as `(attempt, status)` pairs.
    #[must_use]
    pub fn stage_transitions(&self, stage_id: &str) -> Vec<(u32, ExecutionStatus)> {
        self.events
            .read()
            .iter()
            .filter(|e| e.stage_id.as_deref() == Some(stage_id))
            .filter_map(|e| match e.status {
                EventStatus::Stage(status) => Some((e.attempt.unwrap_or(0), status)),
                _ => None,
            })
            .collect()
    }

    /// Run transitions in order.
    #[must_use]
    pub fn run_transitions(&self) -> Vec<RunStatus> {
        self.events
            .read()
            .iter()
            .filter_map(|e| match e.status {
                EventStatus::Run(status) => Some(status),
                _ => None,
            })
            .collect()
    }

    /// Output lines captured for one stage.
    #[must_use]
    pub fn output_lines(&self, stage_id: &str) -> Vec<String> {
        self.events
            .read()
            .iter()
            .filter(|e| e.stage_id.as_deref() == Some(stage_id) && e.status.is_output())
            .map(|e| e.message.clone())
            .collect()
    }
}

#[async_trait]
impl StatusSink for CollectingStatusSink {
    async fn emit(&self, event: StatusEvent) {
        self.events.write().push(event);
    }

    fn try_emit(&self, event: StatusEvent) {
        self.events.write().push(event);
    }
}

/// Forwards every event to several sinks in order.
#[derive(Default, Clone)]
pub struct FanoutStatusSink {
    sinks: Vec<Arc<dyn StatusSink>>,
}

impl FanoutStatusSink {
    /// Creates an empty fan-out.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a downstream sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl std::fmt::Debug for FanoutStatusSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutStatusSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

#[async_trait]
impl StatusSink for FanoutStatusSink {
    async fn emit(&self, event: StatusEvent) {
        join_all(self.sinks.iter().map(|sink| sink.emit(event.clone()))).await;
    }

    fn try_emit(&self, event: StatusEvent) {
        for sink in &self.sinks {
            sink.try_emit(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::OutputStream;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_noop_and_logging_sinks() {
        let run_id = Uuid::new_v4();
        NoOpStatusSink
            .emit(StatusEvent::run(run_id, RunStatus::Running, ""))
            .await;

        let sink = LoggingStatusSink::default();
        sink.emit(StatusEvent::stage(run_id, "mesh", 1, ExecutionStatus::Failed, "exit 1"))
            .await;
        sink.try_emit(StatusEvent::output(run_id, "mesh", 1, OutputStream::Stdout, "line"));
        // Should not panic
    }

    #[tokio::test]
    async fn test_collecting_sink_queries() {
        let run_id = Uuid::new_v4();
        let sink = CollectingStatusSink::new();
        assert!(sink.is_empty());

        sink.emit(StatusEvent::run(run_id, RunStatus::Running, "")).await;
        sink.emit(StatusEvent::stage(run_id, "mesh", 1, ExecutionStatus::Running, ""))
            .await;
        sink.try_emit(StatusEvent::output(run_id, "mesh", 1, OutputStream::Stdout, "meshing"));
        sink.emit(StatusEvent::stage(run_id, "mesh", 1, ExecutionStatus::Succeeded, ""))
            .await;

        assert_eq!(sink.len(), 4);
        assert_eq!(
            sink.stage_transitions("mesh"),
            vec![(1, ExecutionStatus::Running), (1, ExecutionStatus::Succeeded)]
        );
        assert_eq!(sink.run_transitions(), vec![RunStatus::Running]);
        assert_eq!(sink.output_lines("mesh"), vec!["meshing".to_string()]);

        sink.clear();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_fanout_delivers_to_all() {
        let a = Arc::new(CollectingStatusSink::new());
        let b = Arc::new(CollectingStatusSink::new());
        let fanout = FanoutStatusSink::new()
            .with_sink(a.clone())
            .with_sink(b.clone());

        fanout
            .emit(StatusEvent::run(Uuid::new_v4(), RunStatus::Created, ""))
            .await;
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }
}
