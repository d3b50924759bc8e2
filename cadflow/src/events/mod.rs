//! Status sinks.
//!
//! Runs report progress as ordered [`StatusEvent`](crate::core::StatusEvent)s
//! through a [`StatusSink`]. The orchestrator holds exactly one sink; combine
//! several with [`FanoutStatusSink`].

mod channel;
mod sink;

pub use channel::{ChannelMetrics, ChannelStatusSink};
pub use sink::{
    CollectingStatusSink, FanoutStatusSink, LoggingStatusSink, NoOpStatusSink, StatusSink,
};
