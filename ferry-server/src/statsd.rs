use ferry_statsd::{CounterMetric, GaugeMetric, TimerMetric};

/// Counter metrics used by the Ferry pipeline.
pub enum ServerCounters {
    /// Number of datagrams received by a listener.
    ///
    /// This metric is tagged with:
    /// - `listener`: `collectd` or `statsd`.
    PacketsReceived,
    /// Number of datagrams, or parts of datagrams, that were rejected.
    ///
    /// For collectd, a rejected packet drops all samples after the faulty part. For statsd, this
    /// counts individual lines.
    ///
    /// This metric is tagged with:
    /// - `listener`: `collectd` or `statsd`.
    /// - `reason`: A short identifier of the error, for instance `bad_signature`.
    PacketsRejected,
    /// Number of samples decoded from collectd packets.
    SamplesDecoded,
    /// Number of points handed from a listener to the pipeline.
    ///
    /// This metric is tagged with:
    /// - `listener`: `collectd` or `statsd`.
    PointsEmitted,
    /// Number of points that were dropped before reaching a sink.
    ///
    /// This metric is tagged with:
    /// - `reason`: For instance `out_of_order`, `empty_name` or `transform`.
    PointsDropped,
    /// Number of failed connection or write attempts of a sink.
    ///
    /// This metric is tagged with:
    /// - `sink`: The configured name of the sink.
    SinkReconnects,
    /// Number of points written to a sink.
    ///
    /// This metric is tagged with:
    /// - `sink`: The configured name of the sink.
    SinkPointsWritten,
}

impl CounterMetric for ServerCounters {
    fn name(&self) -> &'static str {
        match self {
            Self::PacketsReceived => "packets.received",
            Self::PacketsRejected => "packets.rejected",
            Self::SamplesDecoded => "samples.decoded",
            Self::PointsEmitted => "points.emitted",
            Self::PointsDropped => "points.dropped",
            Self::SinkReconnects => "sink.reconnects",
            Self::SinkPointsWritten => "sink.points_written",
        }
    }
}

/// Gauge metrics used by the Ferry pipeline.
pub enum ServerGauges {
    /// Number of points waiting in the channel of a sink.
    ///
    /// Sampled on every liveness check of the supervisor. A full channel blocks delivery to all
    /// other sinks.
    ///
    /// This metric is tagged with:
    /// - `sink`: The configured name of the sink.
    SinkQueueSize,
}

impl GaugeMetric for ServerGauges {
    fn name(&self) -> &'static str {
        match self {
            Self::SinkQueueSize => "sink.queue_size",
        }
    }
}

/// Timer metrics used by the Ferry pipeline.
pub enum ServerTimers {
    /// Time spent to authenticate, decode and convert a single collectd packet.
    PacketProcessing,
    /// Time spent writing one batch to a sink, including reconnects.
    ///
    /// This metric is tagged with:
    /// - `sink`: The configured name of the sink.
    SinkWrite,
}

impl TimerMetric for ServerTimers {
    fn name(&self) -> &'static str {
        match self {
            Self::PacketProcessing => "packet.processing_time",
            Self::SinkWrite => "sink.write_time",
        }
    }
}
