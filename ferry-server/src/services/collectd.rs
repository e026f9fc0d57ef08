//! Listener for the collectd binary network protocol.

use std::error::Error;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ferry_auth::{AuthStore, CryptoGate};
use ferry_collectd::{Sample, TypeRegistry};
use ferry_metrics::{ConverterRegistry, MetricNamer, MetricPoint, RateCalculator};
use ferry_statsd::metric;
use ferry_system::ShutdownHandle;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::ServerError;
use crate::services::Message;
use crate::statsd::{ServerCounters, ServerTimers};

/// Turns collectd packets into metric points.
///
/// Every packet passes through the crypto gate, the decoder, the converter registry, naming and
/// finally the rate calculator. Errors never escape a packet: a rejected packet or dropped value
/// is logged and counted, and processing continues with the next packet.
#[derive(Debug)]
pub struct PacketHandler {
    types: Arc<TypeRegistry>,
    gate: CryptoGate,
    converters: ConverterRegistry,
    namer: MetricNamer,
    rates: RateCalculator,
}

impl PacketHandler {
    /// Creates a handler with empty rate state.
    pub fn new(
        types: Arc<TypeRegistry>,
        gate: CryptoGate,
        converters: ConverterRegistry,
        namer: MetricNamer,
    ) -> Self {
        Self {
            types,
            gate,
            converters,
            namer,
            rates: RateCalculator::new(),
        }
    }

    /// Processes a single datagram and returns all points it produced.
    pub fn handle(&mut self, packet: &[u8], peer: SocketAddr) -> Vec<MetricPoint> {
        let payload = match self.gate.gate(packet) {
            Ok(payload) => payload,
            Err(error) => {
                ferry_log::warn!(
                    error = &error as &dyn Error,
                    %peer,
                    "rejected collectd packet",
                );
                metric!(
                    counter(ServerCounters::PacketsRejected) += 1,
                    listener = "collectd",
                    reason = error.reason(),
                );
                return Vec::new();
            }
        };

        let types = Arc::clone(&self.types);
        let mut points = Vec::new();

        for result in ferry_collectd::decode(&types, &payload) {
            match result {
                Ok(sample) => {
                    metric!(counter(ServerCounters::SamplesDecoded) += 1);
                    points.extend(self.handle_sample(&types, &sample));
                }
                Err(error) => {
                    ferry_log::debug!(
                        error = &error as &dyn Error,
                        %peer,
                        "dropped remainder of malformed collectd packet",
                    );
                    metric!(
                        counter(ServerCounters::PacketsRejected) += 1,
                        listener = "collectd",
                        reason = error.reason(),
                    );
                }
            }
        }

        points
    }

    fn handle_sample(&mut self, types: &TypeRegistry, sample: &Sample) -> Option<MetricPoint> {
        let parts = match self.converters.convert(sample) {
            Ok(Some(parts)) => parts,
            Ok(None) => {
                metric!(counter(ServerCounters::PointsDropped) += 1, reason = "converter");
                return None;
            }
            Err(error) => {
                ferry_log::debug!(
                    error = &error as &dyn Error,
                    plugin = %sample.plugin,
                    "failed to convert sample",
                );
                metric!(counter(ServerCounters::PointsDropped) += 1, reason = "convert_error");
                return None;
            }
        };

        let Some(name) = self.namer.name(&sample.host, &parts) else {
            metric!(counter(ServerCounters::PointsDropped) += 1, reason = "empty_name");
            return None;
        };

        // The decoder has validated the sample against this definition.
        let source = types
            .get(&sample.type_name)
            .and_then(|definition| definition.source(&sample.value_name))?;

        match self.rates.compute(sample, &name, source) {
            Ok(Some(value)) => Some(MetricPoint::new(
                sample.host.as_str(),
                name,
                value,
                sample.time,
            )),
            Ok(None) => None,
            Err(error) => {
                ferry_log::debug!(
                    error = &error as &dyn Error,
                    host = %sample.host,
                    metric = %name,
                    time = sample.time,
                    "dropped collectd value",
                );
                metric!(
                    counter(ServerCounters::PointsDropped) += 1,
                    reason = error.reason(),
                );
                None
            }
        }
    }
}

/// Receives collectd datagrams on a UDP socket and pushes the resulting points into the queue.
///
/// Each datagram is handled to completion before the next one is received.
#[derive(Debug)]
pub struct CollectdListener {
    socket: UdpSocket,
    handler: PacketHandler,
    auth: Option<(Arc<AuthStore>, Duration)>,
    max_packet_size: usize,
    output: mpsc::UnboundedSender<Message>,
}

impl CollectdListener {
    /// Binds the listener socket.
    pub async fn bind(
        addr: SocketAddr,
        handler: PacketHandler,
        max_packet_size: usize,
        output: mpsc::UnboundedSender<Message>,
    ) -> Result<Self, ServerError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| ServerError::Bind {
                listener: "collectd",
                addr,
                source,
            })?;

        Ok(Self {
            socket,
            handler,
            auth: None,
            max_packet_size: max_packet_size.max(1),
            output,
        })
    }

    /// Polls the given store for changes of the credential file while the listener runs.
    pub fn reload_credentials(mut self, store: Arc<AuthStore>, interval: Duration) -> Self {
        self.auth = Some((store, interval));
        self
    }

    /// Returns the address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receives datagrams until the stop signal.
    pub async fn run(mut self, mut stop: ShutdownHandle) -> Result<(), ServerError> {
        if let Ok(addr) = self.local_addr() {
            ferry_log::info!("collectd listener receiving on {addr}");
        }

        let auth = self.auth.take();
        let reload = async move {
            match auth {
                Some((store, interval)) => store.watch(interval).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(reload);

        let mut buf = vec![0; self.max_packet_size];

        loop {
            tokio::select! {
                biased;

                _ = stop.notified() => break,
                _ = &mut reload => (),
                result = self.socket.recv_from(&mut buf) => {
                    let (len, peer) = result.map_err(ServerError::Receive)?;
                    if !self.handle(&buf[..len], peer) {
                        ferry_log::debug!("pipeline queue closed, stopping collectd listener");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Handles a datagram. Returns `false` if the queue has been closed.
    fn handle(&mut self, packet: &[u8], peer: SocketAddr) -> bool {
        metric!(counter(ServerCounters::PacketsReceived) += 1, listener = "collectd");

        let points = metric!(timer(ServerTimers::PacketProcessing), {
            self.handler.handle(packet, peer)
        });

        metric!(
            counter(ServerCounters::PointsEmitted) += points.len() as i64,
            listener = "collectd",
        );

        points
            .into_iter()
            .all(|point| self.output.send(Message::Point(point)).is_ok())
    }
}
