use serde::{Deserialize, Serialize};

/// A normalized metric value ready for delivery to a sink.
///
/// Points are created by listeners after naming and rate calculation. The `name` of a point that
/// reaches a sink is never empty.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    /// The host the value originates from, empty if unknown.
    pub host: String,
    /// The full dotted metric name.
    pub name: String,
    /// The value, usually a rate per second or a gauge reading.
    pub value: f64,
    /// Unix timestamp in seconds.
    pub timestamp: f64,
}

impl MetricPoint {
    /// Creates a new point.
    pub fn new(host: impl Into<String>, name: impl Into<String>, value: f64, timestamp: f64) -> Self {
        Self {
            host: host.into(),
            name: name.into(),
            value,
            timestamp,
        }
    }

    /// The timestamp truncated to whole seconds, as expected by Carbon.
    pub fn unix_seconds(&self) -> i64 {
        self.timestamp as i64
    }
}
