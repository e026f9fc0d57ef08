use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{MetricPoint, StatsdMetric, StatsdValue};

/// Percentile reported as `upper_<pct>` for timers.
const PERCENT_THRESHOLD: f64 = 90.0;

/// Options for statsd aggregation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Emit counters as `stats.<name>` and `stats_counts.<name>` instead of
    /// `stats.counters.<name>.{rate,count}`.
    pub legacy_namespace: bool,
    /// Forget counters and gauges that were not updated since the last flush.
    pub delete_idle: bool,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            legacy_namespace: true,
            delete_idle: false,
        }
    }
}

/// Aggregates statsd measurements between flushes.
#[derive(Debug, Default)]
pub struct StatsdAggregator {
    config: AggregatorConfig,
    counters: BTreeMap<String, f64>,
    gauges: BTreeMap<String, f64>,
    timers: BTreeMap<String, Vec<f64>>,
    sets: BTreeMap<String, BTreeSet<String>>,
}

impl StatsdAggregator {
    /// Creates an empty aggregator.
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Adds a measurement.
    pub fn insert(&mut self, metric: StatsdMetric) {
        match metric.value {
            StatsdValue::Counter { value, sample_rate } => {
                *self.counters.entry(metric.name).or_default() += value / sample_rate;
            }
            StatsdValue::Gauge { value, delta: true } => {
                *self.gauges.entry(metric.name).or_default() += value;
            }
            StatsdValue::Gauge { value, delta: false } => {
                self.gauges.insert(metric.name, value);
            }
            StatsdValue::Timer(value) => self.timers.entry(metric.name).or_default().push(value),
            StatsdValue::Set(value) => {
                self.sets.entry(metric.name).or_default().insert(value);
            }
        }
    }

    /// Returns `true` if there is nothing to flush.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
            && self.gauges.is_empty()
            && self.timers.is_empty()
            && self.sets.is_empty()
    }

    /// Emits all aggregates and resets them for the next interval.
    ///
    /// `interval` is the time since the last flush and is used to compute per-second rates.
    /// Aggregates that overflowed to a non-finite value are not emitted.
    pub fn flush(&mut self, timestamp: f64, interval: Duration) -> Vec<MetricPoint> {
        let secs = interval.as_secs_f64().max(f64::MIN_POSITIVE);
        let mut points = Vec::new();
        let mut push = |name: String, value: f64| {
            if value.is_finite() {
                points.push(MetricPoint::new("", name, value, timestamp));
            }
        };

        for (name, count) in &mut self.counters {
            if self.config.legacy_namespace {
                push(format!("stats.{name}"), *count / secs);
                push(format!("stats_counts.{name}"), *count);
            } else {
                push(format!("stats.counters.{name}.rate"), *count / secs);
                push(format!("stats.counters.{name}.count"), *count);
            }
            *count = 0.0;
        }

        for (name, values) in &mut self.timers {
            values.sort_by(f64::total_cmp);
            for (stat, value) in timer_stats(values, secs) {
                push(format!("stats.timers.{name}.{stat}"), value);
            }
        }

        for (name, value) in &self.gauges {
            push(format!("stats.gauges.{name}"), *value);
        }

        for (name, set) in &self.sets {
            push(format!("stats.sets.{name}.count"), set.len() as f64);
        }

        self.timers.clear();
        self.sets.clear();
        if self.config.delete_idle {
            self.counters.clear();
            self.gauges.clear();
        }

        points
    }
}

/// Computes the summary statistics of sorted timer values.
fn timer_stats(sorted: &[f64], secs: f64) -> Vec<(&'static str, f64)> {
    let (Some(&lower), Some(&upper)) = (sorted.first(), sorted.last()) else {
        return Vec::new();
    };

    let count = sorted.len() as f64;
    let sum: f64 = sorted.iter().sum();

    let mut stats = vec![
        ("lower", lower),
        ("upper", upper),
        ("mean", sum / count),
        ("count", count),
        ("count_ps", count / secs),
        ("sum", sum),
    ];

    let in_threshold = (PERCENT_THRESHOLD / 100.0 * count).round() as usize;
    if in_threshold > 0 {
        stats.push(("upper_90", sorted[in_threshold - 1]));
    }

    stats
}
