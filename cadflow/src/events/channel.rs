//! Bounded channel sink with backpressure metrics.

use super::StatusSink;
use crate::core::StatusEvent;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Delivery counters for a [`ChannelStatusSink`].
#[derive(Debug, Default)]
pub struct ChannelMetrics {
    /// Number of events delivered to the channel.
    delivered: AtomicU64,
    /// Number of events dropped.
    dropped: AtomicU64,
}

impl ChannelMetrics {
    /// Records a delivered event.
    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a dropped event.
    pub fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of delivered events.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Returns the number of dropped events.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Returns the drop rate as a percentage.
    #[must_use]
    pub fn drop_rate(&self) -> f64 {
        let delivered = self.delivered();
        let dropped = self.dropped();
        let total = delivered + dropped;
        if total == 0 {
            0.0
        } else {
            (dropped as f64 / total as f64) * 100.0
        }
    }
}

/// A sink that forwards events into a bounded channel.
///
/// Status transitions wait for room so a consumer never misses one. Output
/// lines are dropped (and counted) while the channel is full, so a slow
/// consumer cannot stall a chatty tool.
#[derive(Debug, Clone)]
pub struct ChannelStatusSink {
    tx: mpsc::Sender<StatusEvent>,
    metrics: Arc<ChannelMetrics>,
}

impl ChannelStatusSink {
    /// Creates a sink and the receiver to consume it.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<StatusEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                metrics: Arc::new(ChannelMetrics::default()),
            },
            rx,
        )
    }

    /// Returns the metrics.
    #[must_use]
    pub fn metrics(&self) -> &ChannelMetrics {
        &self.metrics
    }
}

#[async_trait]
impl StatusSink for ChannelStatusSink {
    async fn emit(&self, event: StatusEvent) {
        if event.status.is_output() {
            self.try_emit(event);
            return;
        }
        if self.tx.send(event).await.is_ok() {
            self.metrics.record_delivered();
        } else {
            self.metrics.record_drop();
        }
    }

    fn try_emit(&self, event: StatusEvent) {
        let status = event.status;
        match self.tx.try_send(event) {
            Ok(()) => self.metrics.record_delivered(),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.record_drop();
                if !status.is_output() {
                    warn!(
                        status = %status,
                        dropped_total = self.metrics.dropped(),
                        "Status event dropped due to backpressure"
                    );
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => self.metrics.record_drop(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EventStatus, ExecutionStatus, OutputStream, RunStatus};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_output_lines_dropped_when_full() {
        let (sink, mut rx) = ChannelStatusSink::new(1);
        let run_id = Uuid::new_v4();

        sink.emit(StatusEvent::output(run_id, "solve", 1, OutputStream::Stdout, "a"))
            .await;
        sink.emit(StatusEvent::output(run_id, "solve", 1, OutputStream::Stdout, "b"))
            .await;

        assert_eq!(sink.metrics().delivered(), 1);
        assert_eq!(sink.metrics().dropped(), 1);
        assert_eq!(rx.recv().await.unwrap().message, "a");
    }

    #[tokio::test]
    async fn test_status_events_wait_for_room() {
        let (sink, mut rx) = ChannelStatusSink::new(1);
        let run_id = Uuid::new_v4();

        sink.emit(StatusEvent::run(run_id, RunStatus::Running, "")).await;
        let producer = {
            let sink = sink.clone();
            tokio::spawn(async move {
                sink.emit(StatusEvent::stage(run_id, "mesh", 1, ExecutionStatus::Running, ""))
                    .await;
            })
        };

        assert_eq!(
            rx.recv().await.unwrap().status,
            EventStatus::Run(RunStatus::Running)
        );
        let second = rx.recv().await.unwrap();
        assert_eq!(second.stage_id.as_deref(), Some("mesh"));
        producer.await.unwrap();
        assert_eq!(sink.metrics().dropped(), 0);
        assert_eq!(sink.metrics().drop_rate(), 0.0);
    }
}
