//! Self-instrumentation of the Ferry pipeline through a statsd client.
//!
//! Listeners, the processor and the sinks report how many packets they receive, why packets and
//! points are dropped, and how long they spend on each datagram or batch. These measurements are
//! sent to a statsd server configured in the `metrics` section of the config. Without that
//! section, every call to [`metric!`] is a no-op and does not even evaluate the value.
//!
//! ## Declaring Metrics
//!
//! Each crate declares its metrics as enums implementing one of [`CounterMetric`],
//! [`GaugeMetric`] and [`TimerMetric`]. The trait decides which form of [`metric!`] accepts the
//! enum, so a counter cannot accidentally be reported as a timer:
//!
//! ```
//! use ferry_statsd::{CounterMetric, metric};
//!
//! enum ListenerCounters {
//!     PacketsReceived,
//! }
//!
//! impl CounterMetric for ListenerCounters {
//!     fn name(&self) -> &'static str {
//!         match self {
//!             Self::PacketsReceived => "packets.received",
//!         }
//!     }
//! }
//!
//! metric!(counter(ListenerCounters::PacketsReceived) += 1, listener = "collectd");
//! ```
//!
//! ## Reporting
//!
//! [`init`] resolves the statsd address once at startup and installs a process-wide client that
//! sends from a background queue:
//!
//! ```no_run
//! use std::collections::BTreeMap;
//!
//! use ferry_statsd::MetricsConfig;
//!
//! ferry_statsd::init(MetricsConfig {
//!     prefix: "ferry".to_owned(),
//!     host: "127.0.0.1:8125".to_owned(),
//!     default_tags: BTreeMap::from([("region".to_owned(), "eu".to_owned())]),
//! })
//! .unwrap();
//! ```
//!
//! Tests use [`with_capturing_test_client`] to observe the lines emitted by a piece of code.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use cadence::prelude::*;
use cadence::{
    BufferedUdpMetricSink, Metric, MetricBuilder, MetricSink, QueuingMetricSink, SpyMetricSink,
    StatsdClient,
};
use parking_lot::RwLock;

/// Number of metrics queued for the sender thread before new ones are dropped.
const QUEUE_CAPACITY: usize = 100_000;

/// Configuration for [`init`].
#[derive(Debug)]
pub struct MetricsConfig {
    /// Prefix prepended to all metric names.
    pub prefix: String,
    /// Address of the statsd server as `host:port`.
    pub host: String,
    /// Tags added to all metrics.
    pub default_tags: BTreeMap<String, String>,
}

/// An error raised by [`init`].
#[derive(Debug, thiserror::Error)]
pub enum MetricsInitError {
    /// The statsd host could not be resolved to a socket address.
    #[error("could not resolve statsd host {0:?}")]
    Resolve(String),
    /// The local socket could not be created.
    #[error("could not create statsd socket")]
    Socket(#[from] std::io::Error),
    /// Creating the statsd sink failed.
    #[error("could not create statsd sink")]
    Sink(#[from] cadence::MetricError),
}

/// A statsd client that adds the configured default tags to every metric.
#[derive(Debug)]
pub struct MetricsClient {
    client: StatsdClient,
    default_tags: BTreeMap<String, String>,
}

impl MetricsClient {
    fn new<S>(prefix: &str, sink: S, default_tags: BTreeMap<String, String>) -> Self
    where
        S: MetricSink + Sync + Send + std::panic::RefUnwindSafe + 'static,
    {
        Self {
            client: StatsdClient::from_sink(prefix, sink),
            default_tags,
        }
    }

    /// Adds `value` to a counter. Zero values are not sent.
    pub fn count<'a>(&'a self, name: &'a str, value: i64, tags: &[(&'a str, &'a str)]) {
        if value != 0 {
            self.send(self.client.count_with_tags(name, value), tags);
        }
    }

    /// Sets a gauge.
    pub fn gauge<'a>(&'a self, name: &'a str, value: u64, tags: &[(&'a str, &'a str)]) {
        self.send(self.client.gauge_with_tags(name, value), tags);
    }

    /// Records a timing.
    pub fn time<'a>(&'a self, name: &'a str, value: Duration, tags: &[(&'a str, &'a str)]) {
        self.send(self.client.time_with_tags(name, value), tags);
    }

    fn send<'a, T>(&'a self, mut builder: MetricBuilder<'a, '_, T>, tags: &[(&'a str, &'a str)])
    where
        T: Metric + From<String>,
    {
        for &(key, value) in tags {
            builder = builder.with_tag(key, value);
        }
        for (key, value) in &self.default_tags {
            builder = builder.with_tag(key, value);
        }

        if let Err(error) = builder.try_send() {
            ferry_log::error!(
                error = &error as &dyn std::error::Error,
                queue_capacity = QUEUE_CAPACITY,
                "failed to send internal metric",
            );
        }
    }
}

static GLOBAL_CLIENT: RwLock<Option<Arc<MetricsClient>>> = RwLock::new(None);

thread_local! {
    /// Overrides the global client on the current thread while capturing in tests.
    static CAPTURE_CLIENT: RefCell<Option<Arc<MetricsClient>>> = const { RefCell::new(None) };
}

/// Starts reporting metrics to the configured statsd server.
///
/// Metrics are sent over UDP from a background thread. When its queue is full, new metrics are
/// dropped and an error is logged.
pub fn init(config: MetricsConfig) -> Result<(), MetricsInitError> {
    let addr = config
        .host
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| MetricsInitError::Resolve(config.host.clone()))?;

    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;

    let sink = QueuingMetricSink::with_capacity(
        BufferedUdpMetricSink::from(addr, socket)?,
        QUEUE_CAPACITY,
    );

    let client = MetricsClient::new(&config.prefix, sink, config.default_tags);
    *GLOBAL_CLIENT.write() = Some(Arc::new(client));

    ferry_log::info!("reporting internal metrics to statsd at {addr}");
    Ok(())
}

/// Runs `f` with a client that records all metrics it emits on the current thread.
///
/// Returns the emitted lines in statsd format, for example `packets.received:1|c|#listener:statsd`.
pub fn with_capturing_test_client(f: impl FnOnce()) -> Vec<String> {
    capture(BTreeMap::new(), f)
}

fn capture(default_tags: BTreeMap<String, String>, f: impl FnOnce()) -> Vec<String> {
    let (rx, sink) = SpyMetricSink::new();
    let client = Arc::new(MetricsClient::new("", sink, default_tags));

    let previous = CAPTURE_CLIENT.replace(Some(client));
    f();
    CAPTURE_CLIENT.set(previous);

    rx.try_iter()
        .map(|line| String::from_utf8_lossy(&line).into_owned())
        .collect()
}

/// Invokes `f` with the active client, or returns the default if metrics are not reported.
///
/// Use the [`metric!`] macro instead of calling this directly.
#[inline(always)]
pub fn with_client<F, R>(f: F) -> R
where
    F: FnOnce(&MetricsClient) -> R,
    R: Default,
{
    let client = CAPTURE_CLIENT
        .with_borrow(Option::clone)
        .or_else(|| GLOBAL_CLIENT.read().clone());

    match client {
        Some(client) => f(&client),
        None => R::default(),
    }
}

/// A counter, such as the number of received packets or dropped points.
pub trait CounterMetric {
    /// The name of the counter without the configured prefix.
    fn name(&self) -> &'static str;
}

/// A gauge, such as the number of points waiting in a sink channel.
pub trait GaugeMetric {
    /// The name of the gauge without the configured prefix.
    fn name(&self) -> &'static str;
}

/// A timing in milliseconds, such as the time to handle one datagram.
pub trait TimerMetric {
    /// The name of the timer without the configured prefix.
    fn name(&self) -> &'static str;
}

/// Emits a metric with optional tags.
///
/// ```
/// # use std::time::{Duration, Instant};
/// # use ferry_statsd::{CounterMetric, GaugeMetric, TimerMetric, metric};
/// # struct Dropped;
/// # impl CounterMetric for Dropped { fn name(&self) -> &'static str { "points.dropped" } }
/// # struct QueueSize;
/// # impl GaugeMetric for QueueSize { fn name(&self) -> &'static str { "sink.queue_size" } }
/// # struct Write;
/// # impl TimerMetric for Write { fn name(&self) -> &'static str { "sink.write_time" } }
/// metric!(counter(Dropped) += 1, reason = "out_of_order");
/// metric!(gauge(QueueSize) = 12, sink = "carbon");
///
/// let start = Instant::now();
/// metric!(timer(Write) = start.elapsed(), sink = "carbon");
///
/// // times the block and returns its value
/// let written = metric!(timer(Write), sink = "carbon", { 300 });
/// ```
#[macro_export]
macro_rules! metric {
    (counter($id:expr) += $value:expr $(, $k:ident = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            client.count(
                $crate::CounterMetric::name(&$id),
                $value,
                &[$((stringify!($k), $v)),*],
            )
        })
    };

    (gauge($id:expr) = $value:expr $(, $k:ident = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            client.gauge(
                $crate::GaugeMetric::name(&$id),
                $value,
                &[$((stringify!($k), $v)),*],
            )
        })
    };

    (timer($id:expr) = $value:expr $(, $k:ident = $v:expr)* $(,)?) => {
        $crate::with_client(|client| {
            client.time(
                $crate::TimerMetric::name(&$id),
                $value,
                &[$((stringify!($k), $v)),*],
            )
        })
    };

    (timer($id:expr), $($k:ident = $v:expr,)* $block:block) => {{
        let start = ::std::time::Instant::now();
        let result = $block;
        $crate::metric!(timer($id) = start.elapsed() $(, $k = $v)*);
        result
    }};
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    enum TestCounters {
        Rejected,
    }

    impl CounterMetric for TestCounters {
        fn name(&self) -> &'static str {
            match self {
                Self::Rejected => "packets.rejected",
            }
        }
    }

    struct QueueSize;

    impl GaugeMetric for QueueSize {
        fn name(&self) -> &'static str {
            "sink.queue_size"
        }
    }

    struct WriteTime;

    impl TimerMetric for WriteTime {
        fn name(&self) -> &'static str {
            "sink.write_time"
        }
    }

    #[test]
    fn test_counter_skips_zero() {
        let captures = with_capturing_test_client(|| {
            metric!(
                counter(TestCounters::Rejected) += 2,
                listener = "collectd",
                reason = "bad_signature",
            );
            metric!(counter(TestCounters::Rejected) += 0, listener = "statsd");
        });

        assert_eq!(
            captures,
            ["packets.rejected:2|c|#listener:collectd,reason:bad_signature"]
        );
    }

    #[test]
    fn test_gauge_and_timer() {
        let captures = with_capturing_test_client(|| {
            metric!(gauge(QueueSize) = 17, sink = "carbon");
            metric!(timer(WriteTime) = Duration::from_millis(40));
        });

        assert_eq!(
            captures,
            ["sink.queue_size:17|g|#sink:carbon", "sink.write_time:40|ms"]
        );
    }

    #[test]
    fn test_timed_block_returns_value() {
        let mut written = 0;
        let captures = with_capturing_test_client(|| {
            written = metric!(timer(WriteTime), sink = "backup", { 300 });
        });

        assert_eq!(written, 300);
        assert_eq!(captures.len(), 1);
        assert!(captures[0].starts_with("sink.write_time:"));
        assert!(captures[0].ends_with("|ms|#sink:backup"));
    }

    #[test]
    fn test_default_tags_follow_call_tags() {
        let tags = BTreeMap::from([("region".to_owned(), "eu".to_owned())]);
        let captures = capture(tags, || {
            metric!(counter(TestCounters::Rejected) += 1, listener = "statsd");
        });

        assert_eq!(
            captures,
            ["packets.rejected:1|c|#listener:statsd,region:eu"]
        );
    }

    #[test]
    fn test_noop_without_client() {
        let mut evaluated = false;
        metric!(counter(TestCounters::Rejected) += {
            evaluated = true;
            1
        });

        assert!(!evaluated);
    }
}
