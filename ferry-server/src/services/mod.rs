//! Tasks of the pipeline and the messages passed between them.
//!
//! Every listener, the processor and every sink runs as a [`Child`](ferry_system::Child) of the
//! [`Supervisor`](supervisor::Supervisor). Listeners and the processor push into an unbounded
//! shared queue, which the supervisor fans out to one bounded channel per sink.

use ferry_metrics::MetricPoint;

pub mod collectd;
pub mod processor;
pub mod sink;
pub mod statsd;
pub mod supervisor;

/// A message passed through the shared queue and the sink channels.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// A point to deliver.
    Point(MetricPoint),
    /// Ends the receiving loop after everything queued before it has been handled.
    Sentinel,
}

/// Returns the current time as fractional unix seconds.
pub(crate) fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}
