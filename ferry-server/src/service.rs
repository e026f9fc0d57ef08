use std::io;
use std::net::SocketAddr;

use ferry_auth::AuthFileError;
use ferry_collectd::TypesDbError;
use ferry_config::{Config, ConfigError};
use ferry_system::Controller;

use crate::services::supervisor::Supervisor;

/// Indicates the type of failure of the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Binding a listener socket failed.
    #[error("could not bind {listener} listener to {addr}")]
    Bind {
        /// The protocol of the listener.
        listener: &'static str,
        /// The configured address.
        addr: SocketAddr,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Receiving from a bound listener socket failed.
    #[error("failed to receive datagram")]
    Receive(#[source] io::Error),

    /// None of the configured types.db files could be loaded.
    #[error("could not load types.db")]
    TypesDb(#[from] TypesDbError),

    /// The configured auth file could not be read.
    #[error("could not load auth file")]
    AuthFile(#[from] AuthFileError),

    /// A part of the configuration was rejected at startup.
    #[error("invalid configuration")]
    Config(#[from] ConfigError),

    /// The async runtime could not be created.
    #[error("could not start the runtime")]
    Runtime(#[source] io::Error),

    /// A listener, the processor or a sink terminated while the pipeline was running.
    #[error("{0} terminated unexpectedly")]
    ChildDied(String),
}

/// Runs the pipeline until a shutdown signal is received or a child terminates.
///
/// This effectively boots the entire server application. It blocks the current thread until the
/// supervisor has stopped all listeners, the processor and all sinks.
pub fn run(config: Config) -> Result<(), ServerError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("ferry-worker")
        .enable_all()
        .build()
        .map_err(ServerError::Runtime)?;

    runtime.block_on(async {
        let controller = Controller::new(config.shutdown_grace_period());
        let supervisor = Supervisor::start(&config, controller.shutdown_handle()).await?;

        tokio::spawn({
            let controller = controller.clone();
            async move { controller.listen_for_signals().await }
        });

        supervisor.run().await
    })
}
