//! Listener for the statsd line protocol.

use std::error::Error;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use ferry_metrics::{AggregatorConfig, StatsdAggregator, StatsdMetric};
use ferry_statsd::metric;
use ferry_system::ShutdownHandle;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::ServerError;
use crate::services::{Message, unix_now};
use crate::statsd::ServerCounters;

/// Maximum size of a statsd datagram.
const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Receives statsd datagrams and flushes aggregates into the queue on a fixed interval.
#[derive(Debug)]
pub struct StatsdListener {
    socket: UdpSocket,
    aggregator: StatsdAggregator,
    flush_interval: Duration,
    output: mpsc::UnboundedSender<Message>,
}

impl StatsdListener {
    /// Binds the listener socket.
    pub async fn bind(
        addr: SocketAddr,
        config: AggregatorConfig,
        flush_interval: Duration,
        output: mpsc::UnboundedSender<Message>,
    ) -> Result<Self, ServerError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| ServerError::Bind {
                listener: "statsd",
                addr,
                source,
            })?;

        Ok(Self {
            socket,
            aggregator: StatsdAggregator::new(config),
            flush_interval,
            output,
        })
    }

    /// Returns the address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receives datagrams until the stop signal, then flushes once more.
    pub async fn run(mut self, mut stop: ShutdownHandle) -> Result<(), ServerError> {
        if let Ok(addr) = self.local_addr() {
            ferry_log::info!("statsd listener receiving on {addr}");
        }

        let start = Instant::now() + self.flush_interval;
        let mut ticker = tokio::time::interval_at(start, self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_flush = Instant::now();

        let mut buf = vec![0; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                biased;

                _ = stop.notified() => break,
                _ = ticker.tick() => {
                    if !self.flush(last_flush.elapsed()) {
                        return Ok(());
                    }
                    last_flush = Instant::now();
                }
                result = self.socket.recv_from(&mut buf) => {
                    let (len, peer) = result.map_err(ServerError::Receive)?;
                    self.handle(&buf[..len], peer);
                }
            }
        }

        self.flush(last_flush.elapsed());
        Ok(())
    }

    fn handle(&mut self, datagram: &[u8], peer: SocketAddr) {
        metric!(counter(ServerCounters::PacketsReceived) += 1, listener = "statsd");

        for result in StatsdMetric::parse_all(datagram) {
            match result {
                Ok(metrics) => metrics
                    .into_iter()
                    .for_each(|metric| self.aggregator.insert(metric)),
                Err(error) => {
                    ferry_log::debug!(
                        error = &error as &dyn Error,
                        %peer,
                        "dropped malformed statsd line",
                    );
                    metric!(
                        counter(ServerCounters::PacketsRejected) += 1,
                        listener = "statsd",
                        reason = "parse_error",
                    );
                }
            }
        }
    }

    /// Pushes all aggregates into the queue. Returns `false` if the queue has been closed.
    fn flush(&mut self, elapsed: Duration) -> bool {
        if self.aggregator.is_empty() {
            return true;
        }

        let points = self.aggregator.flush(unix_now(), elapsed);
        ferry_log::trace!("flushing {} statsd points", points.len());
        metric!(
            counter(ServerCounters::PointsEmitted) += points.len() as i64,
            listener = "statsd",
        );

        points
            .into_iter()
            .all(|point| self.output.send(Message::Point(point)).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use ferry_system::Controller;

    use super::*;

    async fn listener(flush_interval: Duration) -> (StatsdListener, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = StatsdListener::bind(
            "127.0.0.1:0".parse().unwrap(),
            AggregatorConfig::default(),
            flush_interval,
            tx,
        )
        .await
        .unwrap();

        (listener, rx)
    }

    fn names(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<String> {
        let mut names = Vec::new();
        while let Ok(Message::Point(point)) = rx.try_recv() {
            names.push(point.name);
        }
        names
    }

    #[tokio::test]
    async fn test_malformed_lines_isolated() {
        let (mut listener, mut rx) = listener(Duration::from_secs(10)).await;
        let peer = "127.0.0.1:1".parse().unwrap();

        listener.handle(b"good:1|c\nbad line\nqueue:4|g\n", peer);
        assert!(listener.flush(Duration::from_secs(10)));

        assert_eq!(
            names(&mut rx),
            vec!["stats.good", "stats_counts.good", "stats.gauges.queue"]
        );
    }

    #[tokio::test]
    async fn test_flush_on_stop() {
        let (listener, mut rx) = listener(Duration::from_secs(3600)).await;
        let addr = listener.local_addr().unwrap();

        let controller = Controller::new(Duration::from_secs(1));
        let task = tokio::spawn(listener.run(controller.shutdown_handle()));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"latency:12|ms", addr).await.unwrap();

        // the datagram must be received before the stop signal
        tokio::time::sleep(Duration::from_millis(100)).await;
        controller.shutdown(None);
        task.await.unwrap().unwrap();

        assert!(names(&mut rx).contains(&"stats.timers.latency.upper".to_owned()));
    }
}
