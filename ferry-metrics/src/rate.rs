use std::collections::HashMap;

use ferry_collectd::{DataSource, RawValue, Sample, ValueKind};

/// The counter width assumed for readings below this value when they wrap around.
const COUNTER_32_RANGE: u64 = 1 << 32;

/// An error that drops a single value during rate calculation.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum RateError {
    /// The reading is not newer than the previous reading of the same metric.
    #[error("reading at {time} is not newer than previous reading at {previous}")]
    OutOfOrder {
        /// Time of the previous reading.
        previous: f64,
        /// Time of the rejected reading.
        time: f64,
    },
    /// The computed value is outside the declared bounds.
    #[error("value {value} out of bounds [{min:?}, {max:?}]")]
    OutOfBounds {
        /// The computed value.
        value: f64,
        /// The declared lower bound.
        min: Option<f64>,
        /// The declared upper bound.
        max: Option<f64>,
    },
    /// The computed value is infinite or NaN.
    #[error("value is not finite")]
    NonFinite,
    /// The value kind differs from the declared kind or from the previous reading.
    #[error("expected {expected} value, got {actual}")]
    KindMismatch {
        /// The expected kind.
        expected: ValueKind,
        /// The actual kind.
        actual: ValueKind,
    },
}

impl RateError {
    /// A short, stable identifier of the error for metric tags.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::OutOfOrder { .. } => "out_of_order",
            Self::OutOfBounds { .. } => "out_of_bounds",
            Self::NonFinite => "non_finite",
            Self::KindMismatch { .. } => "kind_mismatch",
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Previous {
    value: RawValue,
    time: f64,
}

/// Converts cumulative readings into per-second rates.
///
/// The calculator keeps the previous reading per host and metric name for the lifetime of the
/// listener. Gauges are passed through without state. The first reading of any other kind only
/// seeds the state and emits nothing.
///
/// Every reading replaces the stored state, including readings that are rejected for being out of
/// order. A single late packet therefore becomes the new base for the following reading.
#[derive(Debug, Default)]
pub struct RateCalculator {
    previous: HashMap<(String, String), Previous>,
}

impl RateCalculator {
    /// Creates a calculator without any state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Computes the value to emit for a sample, validated against its declared bounds.
    ///
    /// Returns `Ok(None)` when the sample only seeded the state.
    pub fn compute(
        &mut self,
        sample: &Sample,
        name: &str,
        source: &DataSource,
    ) -> Result<Option<f64>, RateError> {
        if sample.kind() != source.kind {
            return Err(RateError::KindMismatch {
                expected: source.kind,
                actual: sample.kind(),
            });
        }

        let value = match sample.value {
            RawValue::Gauge(value) => value,
            _ => match self.rate(sample, name)? {
                Some(rate) => rate,
                None => return Ok(None),
            },
        };

        if !value.is_finite() {
            return Err(RateError::NonFinite);
        }

        if !source.contains(value) {
            return Err(RateError::OutOfBounds {
                value,
                min: source.min,
                max: source.max,
            });
        }

        Ok(Some(value))
    }

    /// The number of tracked metrics.
    pub fn len(&self) -> usize {
        self.previous.len()
    }

    /// Returns `true` if no metric has been seen yet.
    pub fn is_empty(&self) -> bool {
        self.previous.is_empty()
    }

    fn rate(&mut self, sample: &Sample, name: &str) -> Result<Option<f64>, RateError> {
        let current = Previous {
            value: sample.value,
            time: sample.time,
        };

        let key = (sample.host.clone(), name.to_owned());
        let Some(previous) = self.previous.insert(key, current) else {
            return Ok(None);
        };

        if current.time <= previous.time {
            return Err(RateError::OutOfOrder {
                previous: previous.time,
                time: current.time,
            });
        }

        let elapsed = current.time - previous.time;
        let delta = match (previous.value, current.value) {
            (RawValue::Counter(prev), RawValue::Counter(value)) => counter_delta(prev, value) as f64,
            (RawValue::Derive(prev), RawValue::Derive(value)) => {
                (i128::from(value) - i128::from(prev)) as f64
            }
            (RawValue::Absolute(_), RawValue::Absolute(value)) => value as f64,
            (prev, value) => {
                return Err(RateError::KindMismatch {
                    expected: prev.kind(),
                    actual: value.kind(),
                });
            }
        };

        Ok(Some(delta / elapsed))
    }
}

/// Computes the increase of a counter, assuming a wrap around if it decreased.
///
/// The counter width is not transmitted. Counters whose previous value fits into 32 bits are
/// assumed to be 32 bits wide, all others 64 bits.
fn counter_delta(prev: u64, value: u64) -> u64 {
    if value >= prev {
        value - prev
    } else if prev < COUNTER_32_RANGE {
        COUNTER_32_RANGE - prev + value
    } else {
        value.wrapping_sub(prev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(kind: ValueKind, min: Option<f64>, max: Option<f64>) -> DataSource {
        DataSource {
            name: "value".to_owned(),
            kind,
            min,
            max,
        }
    }

    fn sample(value: RawValue, time: f64) -> Sample {
        Sample {
            host: "web01".to_owned(),
            plugin: "test".to_owned(),
            plugin_instance: String::new(),
            type_name: "test".to_owned(),
            type_instance: String::new(),
            value_name: "value".to_owned(),
            value,
            time,
            interval: 10.0,
        }
    }

    fn run(kind: ValueKind, readings: &[(RawValue, f64)]) -> Vec<Result<Option<f64>, RateError>> {
        let mut calculator = RateCalculator::new();
        let source = source(kind, None, None);
        readings
            .iter()
            .map(|&(value, time)| calculator.compute(&sample(value, time), "web01.test", &source))
            .collect()
    }

    #[test]
    fn test_gauge_passthrough() {
        let results = run(
            ValueKind::Gauge,
            &[(RawValue::Gauge(3.5), 10.0), (RawValue::Gauge(-1.0), 10.0)],
        );
        assert_eq!(results, vec![Ok(Some(3.5)), Ok(Some(-1.0))]);
    }

    #[test]
    fn test_counter_rate() {
        let results = run(
            ValueKind::Counter,
            &[
                (RawValue::Counter(100), 0.0),
                (RawValue::Counter(200), 10.0),
                (RawValue::Counter(260), 15.0),
            ],
        );
        assert_eq!(results, vec![Ok(None), Ok(Some(10.0)), Ok(Some(12.0))]);
    }

    #[test]
    fn test_counter_wrap_32() {
        assert_eq!(counter_delta(COUNTER_32_RANGE - 10, 5), 15);

        let results = run(
            ValueKind::Counter,
            &[
                (RawValue::Counter(COUNTER_32_RANGE - 10), 0.0),
                (RawValue::Counter(5), 5.0),
            ],
        );
        assert_eq!(results, vec![Ok(None), Ok(Some(3.0))]);
    }

    #[test]
    fn test_counter_wrap_64() {
        assert_eq!(counter_delta(u64::MAX - 9, 5), 15);
        assert_eq!(counter_delta(COUNTER_32_RANGE, 0), u64::MAX - COUNTER_32_RANGE + 1);
    }

    #[test]
    fn test_derive_negative() {
        let results = run(
            ValueKind::Derive,
            &[(RawValue::Derive(500), 0.0), (RawValue::Derive(0), 10.0)],
        );
        assert_eq!(results, vec![Ok(None), Ok(Some(-50.0))]);
    }

    #[test]
    fn test_derive_extremes() {
        let results = run(
            ValueKind::Derive,
            &[(RawValue::Derive(i64::MIN), 0.0), (RawValue::Derive(i64::MAX), 1.0)],
        );
        assert_eq!(results[1], Ok(Some(u64::MAX as f64)));
    }

    #[test]
    fn test_absolute() {
        let results = run(
            ValueKind::Absolute,
            &[(RawValue::Absolute(100), 0.0), (RawValue::Absolute(50), 10.0)],
        );
        assert_eq!(results, vec![Ok(None), Ok(Some(5.0))]);
    }

    #[test]
    fn test_out_of_order_rebases_state() {
        let results = run(
            ValueKind::Counter,
            &[
                (RawValue::Counter(100), 10.0),
                (RawValue::Counter(50), 5.0),
                (RawValue::Counter(150), 15.0),
            ],
        );

        assert_eq!(
            results,
            vec![
                Ok(None),
                Err(RateError::OutOfOrder {
                    previous: 10.0,
                    time: 5.0,
                }),
                // rate against the rejected reading at t=5, not the accepted one at t=10
                Ok(Some(10.0)),
            ]
        );
    }

    #[test]
    fn test_equal_time_rejected() {
        let results = run(
            ValueKind::Derive,
            &[(RawValue::Derive(1), 10.0), (RawValue::Derive(2), 10.0)],
        );
        assert_eq!(
            results[1],
            Err(RateError::OutOfOrder {
                previous: 10.0,
                time: 10.0,
            })
        );
    }

    #[test]
    fn test_bounds() {
        let mut calculator = RateCalculator::new();
        let source = source(ValueKind::Gauge, Some(0.0), Some(100.0));

        let in_bounds = calculator.compute(&sample(RawValue::Gauge(100.0), 0.0), "a", &source);
        assert_eq!(in_bounds, Ok(Some(100.0)));

        let above = calculator.compute(&sample(RawValue::Gauge(100.5), 0.0), "a", &source);
        assert_eq!(
            above,
            Err(RateError::OutOfBounds {
                value: 100.5,
                min: Some(0.0),
                max: Some(100.0),
            })
        );
    }

    #[test]
    fn test_derive_below_min() {
        let mut calculator = RateCalculator::new();
        let source = source(ValueKind::Derive, Some(0.0), None);

        let first = calculator.compute(&sample(RawValue::Derive(10), 0.0), "a", &source);
        let second = calculator.compute(&sample(RawValue::Derive(0), 1.0), "a", &source);
        assert_eq!(first, Ok(None));
        assert!(matches!(second, Err(RateError::OutOfBounds { .. })));
    }

    #[test]
    fn test_non_finite() {
        let results = run(ValueKind::Gauge, &[(RawValue::Gauge(f64::NAN), 0.0)]);
        assert_eq!(results, vec![Err(RateError::NonFinite)]);
    }

    #[test]
    fn test_state_per_host_and_name() {
        let mut calculator = RateCalculator::new();
        let source = source(ValueKind::Counter, None, None);

        let mut other = sample(RawValue::Counter(0), 0.0);
        other.host = "web02".to_owned();

        calculator.compute(&sample(RawValue::Counter(0), 0.0), "a", &source).unwrap();
        calculator.compute(&other, "a", &source).unwrap();
        calculator.compute(&sample(RawValue::Counter(0), 0.0), "b", &source).unwrap();
        assert_eq!(calculator.len(), 3);

        let rate = calculator.compute(&sample(RawValue::Counter(10), 1.0), "a", &source);
        assert_eq!(rate, Ok(Some(10.0)));
    }

    #[test]
    fn test_kind_mismatch() {
        let results = run(ValueKind::Counter, &[(RawValue::Derive(1), 0.0)]);
        assert_eq!(
            results,
            vec![Err(RateError::KindMismatch {
                expected: ValueKind::Counter,
                actual: ValueKind::Derive,
            })]
        );
    }
}
