//! Delivery of points to a Carbon server over TCP.

use std::error::Error;
use std::fmt::Write as _;
use std::io;
use std::time::Duration;

use ferry_config::{Sink as SinkConfig, SinkProtocol};
use ferry_metrics::MetricPoint;
use ferry_statsd::metric;
use serde_pickle::SerOptions;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::services::Message;
use crate::statsd::{ServerCounters, ServerTimers};

/// Upper bound for establishing a single connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// An error that terminates a sink.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// A batch could not be serialized.
    #[error("could not encode batch")]
    Encode(#[from] serde_pickle::Error),

    /// A serialized batch exceeds the maximum frame size.
    #[error("batch of {0} bytes exceeds the maximum frame size")]
    BatchTooLarge(usize),

    /// Connecting or writing failed more often in a row than allowed.
    #[error("sink {sink} gave up after {attempts} failed attempts")]
    RetriesExhausted {
        /// The configured name of the sink.
        sink: String,
        /// The number of consecutive failures.
        attempts: u32,
        /// The last connection or write error.
        #[source]
        source: io::Error,
    },
}

/// Serializes a batch of points in the wire format of the given protocol.
///
/// `plaintext` writes one `<name> <value> <timestamp>` line per point. `pickle` writes a single
/// frame with a big-endian `u32` length prefix followed by a pickled list of
/// `(name, (timestamp, value))` tuples.
pub fn encode_batch(protocol: SinkProtocol, points: &[MetricPoint]) -> Result<Vec<u8>, SinkError> {
    match protocol {
        SinkProtocol::Plaintext => Ok(encode_plaintext(points)),
        SinkProtocol::Pickle => encode_pickle(points),
    }
}

fn encode_plaintext(points: &[MetricPoint]) -> Vec<u8> {
    let mut buf = String::new();
    for point in points {
        writeln!(buf, "{} {} {}", point.name, point.value, point.unix_seconds()).ok();
    }
    buf.into_bytes()
}

fn encode_pickle(points: &[MetricPoint]) -> Result<Vec<u8>, SinkError> {
    let batch: Vec<(&str, (i64, f64))> = points
        .iter()
        .map(|point| (point.name.as_str(), (point.unix_seconds(), point.value)))
        .collect();

    let body = serde_pickle::to_vec(&batch, SerOptions::new().proto_v2())?;
    let len = u32::try_from(body.len()).map_err(|_| SinkError::BatchTooLarge(body.len()))?;

    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Writes points received from the supervisor to a single Carbon server.
///
/// Points are collected into batches that are written when they reach the configured size, on
/// the flush interval and when the sentinel arrives. A failed connect or write is retried after a
/// fixed delay with the same batch. The sink gives up after `max_reconnects` consecutive failed
/// retries.
#[derive(Debug)]
pub struct SinkClient {
    config: SinkConfig,
    input: mpsc::Receiver<Message>,
    stream: Option<TcpStream>,
    failures: u32,
    batch: Vec<MetricPoint>,
}

impl SinkClient {
    /// Creates a sink and the sender for its bounded channel.
    pub fn new(config: SinkConfig) -> (Self, mpsc::Sender<Message>) {
        let (tx, input) = mpsc::channel(config.channel_capacity.max(1));
        let client = Self {
            batch: Vec::with_capacity(config.batch_size),
            config,
            input,
            stream: None,
            failures: 0,
        };
        (client, tx)
    }

    /// Connects and delivers points until the sentinel arrives or the channel closes.
    pub async fn run(mut self) -> Result<(), SinkError> {
        self.connect().await?;

        let flush_interval = self.config.flush_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + flush_interval, flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                message = self.input.recv() => match message {
                    Some(Message::Point(point)) => {
                        self.batch.push(point);
                        if self.batch.len() >= self.config.batch_size {
                            self.flush().await?;
                        }
                    }
                    Some(Message::Sentinel) | None => break,
                },
                _ = ticker.tick() => self.flush().await?,
            }
        }

        self.flush().await?;
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await.ok();
        }

        ferry_log::debug!("sink {} stopped", self.config.name);
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        if self.batch.is_empty() {
            return Ok(());
        }

        let payload = encode_batch(self.config.protocol, &self.batch)?;
        metric!(timer(ServerTimers::SinkWrite), sink = self.config.name.as_str(), {
            self.send(&payload).await
        })?;

        metric!(
            counter(ServerCounters::SinkPointsWritten) += self.batch.len() as i64,
            sink = self.config.name.as_str(),
        );
        self.batch.clear();
        Ok(())
    }

    async fn send(&mut self, payload: &[u8]) -> Result<(), SinkError> {
        loop {
            self.connect().await?;

            if let Some(stream) = self.stream.as_mut() {
                let timeout = self.config.write_timeout();
                match tokio::time::timeout(timeout, stream.write_all(payload)).await {
                    Ok(Ok(())) => {
                        self.failures = 0;
                        return Ok(());
                    }
                    Ok(Err(error)) => {
                        self.stream = None;
                        self.failed(error).await?;
                    }
                    Err(_) => {
                        // a peer that stops reading leaves the stream in an unknown state
                        self.stream = None;
                        self.failed(io::ErrorKind::TimedOut.into()).await?;
                    }
                }
            }
        }
    }

    async fn connect(&mut self) -> Result<(), SinkError> {
        while self.stream.is_none() {
            let host = self.config.host.clone();
            let port = self.config.port;

            match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host.as_str(), port)))
                .await
            {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true).ok();
                    ferry_log::info!("sink {} connected to {host}:{port}", self.config.name);
                    self.stream = Some(stream);
                }
                Ok(Err(error)) => self.failed(error).await?,
                Err(_) => self.failed(io::ErrorKind::TimedOut.into()).await?,
            }
        }

        Ok(())
    }

    /// Records a failed attempt and waits for the reconnect delay.
    async fn failed(&mut self, error: io::Error) -> Result<(), SinkError> {
        self.failures += 1;
        if self.failures > self.config.max_reconnects {
            return Err(SinkError::RetriesExhausted {
                sink: self.config.name.clone(),
                attempts: self.failures,
                source: error,
            });
        }

        ferry_log::warn!(
            error = &error as &dyn Error,
            sink = %self.config.name,
            attempt = self.failures,
            "sink connection failed, retrying in {}s",
            self.config.reconnect_delay,
        );
        metric!(
            counter(ServerCounters::SinkReconnects) += 1,
            sink = self.config.name.as_str(),
        );

        tokio::time::sleep(self.config.reconnect_delay()).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_pickle::DeOptions;
    use similar_asserts::assert_eq;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use super::*;

    fn points() -> Vec<MetricPoint> {
        vec![
            MetricPoint::new("web01", "web01.load.shortterm", 0.5, 1_700_000_000.7),
            MetricPoint::new("web01", "web01.cpu.0.user", 12.0, 1_700_000_010.0),
        ]
    }

    fn config(port: u16) -> SinkConfig {
        SinkConfig {
            name: "test".to_owned(),
            host: "127.0.0.1".to_owned(),
            port,
            reconnect_delay: 0,
            max_reconnects: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_encode_plaintext() {
        let encoded = encode_batch(SinkProtocol::Plaintext, &points()).unwrap();
        insta::assert_snapshot!(String::from_utf8(encoded).unwrap(), @r"
        web01.load.shortterm 0.5 1700000000
        web01.cpu.0.user 12 1700000010
        ");
    }

    #[test]
    fn test_encode_pickle() {
        let encoded = encode_batch(SinkProtocol::Pickle, &points()).unwrap();

        let (prefix, body) = encoded.split_at(4);
        let len = u32::from_be_bytes(prefix.try_into().unwrap());
        assert_eq!(len as usize, body.len());

        let batch: Vec<(String, (i64, f64))> =
            serde_pickle::from_slice(body, DeOptions::new()).unwrap();
        assert_eq!(
            batch,
            vec![
                ("web01.load.shortterm".to_owned(), (1_700_000_000, 0.5)),
                ("web01.cpu.0.user".to_owned(), (1_700_000_010, 12.0)),
            ]
        );
    }

    #[tokio::test]
    async fn test_flush_on_batch_size_and_sentinel() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();

        let (sink, tx) = SinkClient::new(SinkConfig {
            batch_size: 2,
            flush_interval: 3600,
            ..config(port)
        });
        let task = tokio::spawn(sink.run());

        let (mut conn, _) = server.accept().await.unwrap();
        for point in points() {
            tx.send(Message::Point(point)).await.unwrap();
        }

        let expected = "web01.load.shortterm 0.5 1700000000\nweb01.cpu.0.user 12 1700000010\n";
        let mut buf = vec![0; expected.len()];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(std::str::from_utf8(&buf).unwrap(), expected);

        // a partial batch is written when the sentinel arrives
        tx.send(Message::Point(points().remove(0))).await.unwrap();
        tx.send(Message::Sentinel).await.unwrap();
        task.await.unwrap().unwrap();

        let mut rest = String::new();
        conn.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "web01.load.shortterm 0.5 1700000000\n");
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let port = {
            let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
            server.local_addr().unwrap().port()
        };

        let (sink, _tx) = SinkClient::new(config(port));
        let error = sink.run().await.unwrap_err();

        assert!(matches!(
            error,
            SinkError::RetriesExhausted { attempts: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_write_timeout_counts_as_failure() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();

        let (mut sink, _tx) = SinkClient::new(SinkConfig {
            write_timeout: 1,
            max_reconnects: 0,
            ..config(port)
        });

        // the peer accepts the connection but never reads from it
        let accept = tokio::spawn(async move { server.accept().await.unwrap() });
        let payload = vec![b'x'; 64 << 20];
        let result = tokio::time::timeout(Duration::from_secs(10), sink.send(&payload))
            .await
            .expect("write was not bounded by the write timeout");

        assert!(matches!(
            result,
            Err(SinkError::RetriesExhausted { attempts: 1, ref source, .. })
                if source.kind() == io::ErrorKind::TimedOut
        ));
        drop(accept.await.unwrap());
    }

    #[tokio::test]
    async fn test_reconnect_until_available() {
        let port = {
            let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
            server.local_addr().unwrap().port()
        };

        let (sink, tx) = SinkClient::new(SinkConfig {
            reconnect_delay: 1,
            max_reconnects: 10,
            batch_size: 1,
            ..config(port)
        });
        let task = tokio::spawn(sink.run());

        // the first attempts are refused
        tokio::time::sleep(Duration::from_millis(200)).await;
        let server = TcpListener::bind(("127.0.0.1", port)).await.unwrap();

        tx.send(Message::Point(points().remove(1))).await.unwrap();
        let (mut conn, _) = server.accept().await.unwrap();

        tx.send(Message::Sentinel).await.unwrap();
        task.await.unwrap().unwrap();

        let mut received = String::new();
        conn.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "web01.cpu.0.user 12 1700000010\n");
    }
}
