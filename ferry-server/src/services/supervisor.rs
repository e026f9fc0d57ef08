//! Startup, fan-out and coordinated shutdown of all pipeline tasks.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ferry_auth::{AuthStore, CryptoGate};
use ferry_collectd::TypeRegistry;
use ferry_config::Config;
use ferry_log::LogError;
use ferry_metrics::{MetricNamer, MetricPoint};
use ferry_statsd::metric;
use ferry_system::{Child, ChildExit, Controller, ShutdownHandle};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::ServerError;
use crate::services::Message;
use crate::services::collectd::{CollectdListener, PacketHandler};
use crate::services::processor::Processor;
use crate::services::sink::SinkClient;
use crate::services::statsd::StatsdListener;
use crate::statsd::ServerGauges;

/// Lifecycle of the [`Supervisor`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SupervisorState {
    /// Components are being created and bound.
    Starting,
    /// All children run and points are fanned out to the sinks.
    Running,
    /// The drain loop has exited and children are being stopped.
    Draining,
    /// All children have terminated or were aborted.
    Stopped,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        })
    }
}

#[derive(Debug)]
struct SinkChannel {
    name: String,
    tx: mpsc::Sender<Message>,
}

/// Owns the shared queue and all children of the pipeline.
///
/// Listeners and the processor push points into a single unbounded queue. The supervisor drains
/// it and sends every point to each sink in turn, waiting for space in the sink's bounded
/// channel. A sink that stops consuming therefore blocks delivery to all other sinks.
///
/// A shutdown interrupts a send that is waiting on a full sink channel. Points still queued at that
/// moment are dropped, so a stalled sink cannot delay the shutdown beyond the grace period.
///
/// The liveness of all children is checked on a fixed interval. A child that terminates while the
/// pipeline is running stops the entire pipeline.
#[derive(Debug)]
pub struct Supervisor {
    queue: mpsc::UnboundedReceiver<Message>,
    sinks: Vec<SinkChannel>,
    children: Vec<Child>,
    stop: Controller,
    shutdown: ShutdownHandle,
    sentinel: JoinHandle<()>,
    state: watch::Sender<SupervisorState>,
    poll_interval: Duration,
    grace: Duration,
    collectd_addr: Option<SocketAddr>,
    statsd_addr: Option<SocketAddr>,
}

impl Supervisor {
    /// Creates all components from the configuration and spawns them.
    ///
    /// Loading files and binding sockets happens before any task is spawned, so a failed startup
    /// leaves nothing running. Once `shutdown` is notified, a sentinel is pushed into the shared
    /// queue which ends [`run`](Self::run) after all points queued before it.
    pub async fn start(config: &Config, shutdown: ShutdownHandle) -> Result<Self, ServerError> {
        config.validate()?;

        let (state, _) = watch::channel(SupervisorState::Starting);
        let (queue_tx, queue) = mpsc::unbounded_channel();
        let stop = Controller::new(config.shutdown_grace_period());

        let (processor, input) = if config.processor().enabled {
            let transform = Arc::new(config.regex_transform()?);
            let (processor, input) = Processor::new(transform, queue_tx.clone());
            (Some(processor), input)
        } else {
            (None, queue_tx.clone())
        };

        let collectd = if config.collectd().enabled {
            Some(collectd_listener(config, input.clone()).await?)
        } else {
            None
        };

        let statsd = if config.statsd().enabled {
            let listener = StatsdListener::bind(
                config.statsd_addr(),
                config.statsd().aggregator.clone(),
                config.statsd_flush_interval(),
                input,
            )
            .await?;
            Some(listener)
        } else {
            None
        };

        let mut children = Vec::new();
        let mut sinks = Vec::new();

        for sink_config in config.sinks() {
            let name = sink_config.name.clone();
            let (client, tx) = SinkClient::new(sink_config.clone());
            children.push(Child::spawn(format!("sink {name}"), client.run()));
            sinks.push(SinkChannel { name, tx });
        }

        if let Some(processor) = processor {
            children.push(Child::spawn("processor", processor.run(stop.shutdown_handle())));
        }

        let collectd_addr = collectd.as_ref().and_then(|l| l.local_addr().ok());
        if let Some(listener) = collectd {
            let task = listener.run(stop.shutdown_handle());
            children.push(Child::spawn("collectd listener", task));
        }

        let statsd_addr = statsd.as_ref().and_then(|l| l.local_addr().ok());
        if let Some(listener) = statsd {
            let task = listener.run(stop.shutdown_handle());
            children.push(Child::spawn("statsd listener", task));
        }

        let mut notified = shutdown.clone();
        let sentinel = tokio::spawn(async move {
            notified.notified().await;
            ferry_log::debug!("shutdown requested, enqueueing sentinel");
            queue_tx.send(Message::Sentinel).ok();
        });

        state.send_replace(SupervisorState::Running);
        ferry_log::info!("pipeline running with {} sinks", sinks.len());

        Ok(Self {
            queue,
            sinks,
            children,
            stop,
            shutdown,
            sentinel,
            state,
            poll_interval: config.poll_interval(),
            grace: config.shutdown_grace_period(),
            collectd_addr,
            statsd_addr,
        })
    }

    /// Returns a receiver that observes all state transitions.
    pub fn state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// The bound address of the collectd listener, if enabled.
    pub fn collectd_addr(&self) -> Option<SocketAddr> {
        self.collectd_addr
    }

    /// The bound address of the statsd listener, if enabled.
    pub fn statsd_addr(&self) -> Option<SocketAddr> {
        self.statsd_addr
    }

    /// Drains the shared queue until the sentinel arrives or a child dies, then stops all
    /// children.
    ///
    /// Every sink receives a sentinel, and listeners and the processor receive a stop signal.
    /// All children share one deadline, the configured grace period from the moment draining
    /// ends. Children still running at the deadline are aborted.
    ///
    /// The grace period applies to every shutdown, including the immediate ones requested by
    /// `SIGINT` and `SIGQUIT`, so sinks always get the chance to write their last batch.
    pub async fn run(mut self) -> Result<(), ServerError> {
        let result = self.drain().await;
        self.set_state(SupervisorState::Draining);

        let deadline = Instant::now() + self.grace;

        // a full sink channel must not hold back the sentinels of the other sinks
        for sink in &self.sinks {
            let tx = sink.tx.clone();
            let name = sink.name.clone();
            tokio::spawn(async move {
                if tx.send(Message::Sentinel).await.is_err() {
                    ferry_log::trace!("sink {name} is gone, skipping sentinel");
                }
            });
        }

        self.stop.shutdown(Some(self.grace));

        for child in std::mem::take(&mut self.children) {
            let name = child.name().to_owned();
            let remaining = deadline.saturating_duration_since(Instant::now());
            match child.stop(remaining).await {
                ChildExit::Completed => (),
                ChildExit::Failed(error) => {
                    ferry_log::error!("{name} failed: {}", LogError(&*error));
                }
                exit => ferry_log::warn!("{name} {exit}"),
            }
        }

        self.sentinel.abort();
        self.set_state(SupervisorState::Stopped);
        ferry_log::info!("pipeline stopped");

        result
    }

    async fn drain(&mut self) -> Result<(), ServerError> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = ticker.tick() => self.check_liveness()?,
                message = self.queue.recv() => match message {
                    Some(Message::Point(point)) => {
                        if !self.fan_out(point).await {
                            return Ok(());
                        }
                    }
                    Some(Message::Sentinel) | None => return Ok(()),
                },
            }
        }
    }

    /// Sends the point to every sink in turn. Returns `false` if a shutdown interrupted a send.
    async fn fan_out(&mut self, point: MetricPoint) -> bool {
        for sink in &self.sinks {
            tokio::select! {
                biased;

                result = sink.tx.send(Message::Point(point.clone())) => {
                    if result.is_err() {
                        ferry_log::trace!("sink {} is gone, dropping point", sink.name);
                    }
                }
                _ = self.shutdown.notified() => {
                    ferry_log::warn!(
                        "sink {} is stalled, dropping {} queued points",
                        sink.name,
                        self.queue.len(),
                    );
                    return false;
                }
            }
        }

        true
    }

    fn check_liveness(&self) -> Result<(), ServerError> {
        if let Some(child) = self.children.iter().find(|child| !child.is_alive()) {
            ferry_log::error!("{} terminated, shutting down the pipeline", child.name());
            return Err(ServerError::ChildDied(child.name().to_owned()));
        }

        for sink in &self.sinks {
            let queued = sink.tx.max_capacity() - sink.tx.capacity();
            metric!(
                gauge(ServerGauges::SinkQueueSize) = queued as u64,
                sink = sink.name.as_str(),
            );
        }

        Ok(())
    }

    fn set_state(&self, state: SupervisorState) {
        ferry_log::debug!("supervisor {state}");
        self.state.send_replace(state);
    }
}

/// Loads the types and credentials and binds the collectd listener.
async fn collectd_listener(
    config: &Config,
    output: mpsc::UnboundedSender<Message>,
) -> Result<CollectdListener, ServerError> {
    let collectd = config.collectd();

    let types = TypeRegistry::load(&collectd.types_db)?;
    ferry_log::info!("loaded {} collectd types", types.len());

    let store = match &collectd.auth_file {
        Some(path) => Some(Arc::new(AuthStore::open(path.clone())?)),
        None => None,
    };

    let handler = PacketHandler::new(
        Arc::new(types),
        CryptoGate::new(collectd.security_level, store.clone()),
        config.converter_registry()?,
        MetricNamer::new(config.naming().clone()),
    );

    let listener = CollectdListener::bind(
        config.collectd_addr(),
        handler,
        collectd.max_packet_size,
        output,
    )
    .await?;

    Ok(match store {
        Some(store) => listener.reload_credentials(store, config.auth_reload_interval()),
        None => listener,
    })
}
