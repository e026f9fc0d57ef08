//! Turns decoded telemetry into named metric points.
//!
//! This crate holds the protocol independent half of the pipeline:
//!
//!  - [`ConverterRegistry`] maps collectd samples to name parts, with per-plugin converters.
//!  - [`MetricNamer`] assembles the parts into a sanitized dotted name.
//!  - [`RateCalculator`] derives per-second rates from counter readings.
//!  - [`StatsdMetric`] and [`StatsdAggregator`] parse and aggregate the statsd line protocol.
//!  - [`Transform`] rewrites or drops finished [`MetricPoint`]s before delivery.
#![warn(missing_docs)]

mod aggregator;
mod convert;
mod naming;
mod point;
mod rate;
mod statsd;
mod transform;

pub use self::aggregator::*;
pub use self::convert::*;
pub use self::naming::*;
pub use self::point::*;
pub use self::rate::*;
pub use self::statsd::*;
pub use self::transform::*;
