use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Shutdown request sent by the [`Controller`] to everything holding a [`ShutdownHandle`].
///
/// A receiver has to ensure that it doesn't take longer than `timeout` to finish its work.
/// Ideally, open work is flushed in an orderly manner but no new input is accepted anymore.
///
/// After the timeout the system will shut down regardless of what the receivers of this message
/// do.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Shutdown {
    /// The timeout for this shutdown. `None` indicates an immediate forced shutdown.
    pub timeout: Option<Duration>,
}

/// Notifies a task when the [`Controller`] initiates a shutdown.
///
/// Obtain a handle through [`Controller::shutdown_handle`]. Handles can be cloned freely and
/// every clone is notified exactly once.
#[derive(Clone, Debug)]
pub struct ShutdownHandle(watch::Receiver<Option<Shutdown>>);

impl ShutdownHandle {
    /// Returns the current shutdown state, if a shutdown has been initiated.
    pub fn get(&self) -> Option<Shutdown> {
        *self.0.borrow()
    }

    /// Waits for a shutdown to be initiated.
    ///
    /// Resolves immediately if a shutdown is already in progress. If the controller is dropped
    /// without initiating a shutdown, this resolves to an immediate shutdown.
    pub async fn notified(&mut self) -> Shutdown {
        match self.0.wait_for(Option::is_some).await {
            Ok(shutdown) => shutdown.unwrap_or(Shutdown { timeout: None }),
            Err(_) => Shutdown { timeout: None },
        }
    }
}

/// Starts and gracefully stops the pipeline.
///
/// The controller listens for process signals and translates them into a [`Shutdown`] that is
/// broadcast to all [`ShutdownHandle`]s:
///
///  - `SIGINT` and `SIGQUIT` trigger an immediate shutdown.
///  - `SIGTERM` triggers a graceful shutdown with the configured timeout.
///
/// The controller is cheap to clone and every clone controls the same shutdown state.
///
/// ### Example
///
/// ```
/// use std::time::Duration;
/// use ferry_system::Controller;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let controller = Controller::new(Duration::from_secs(5));
/// let mut handle = controller.shutdown_handle();
///
/// controller.shutdown(None);
/// assert_eq!(handle.notified().await.timeout, None);
/// # }
/// ```
#[derive(Clone)]
pub struct Controller {
    /// Configured timeout for graceful shutdowns.
    timeout: Duration,
    sender: Arc<watch::Sender<Option<Shutdown>>>,
}

impl Controller {
    /// Creates a new controller with the given graceful shutdown timeout.
    pub fn new(timeout: Duration) -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            timeout,
            sender: Arc::new(sender),
        }
    }

    /// Returns the configured timeout for graceful shutdowns.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns a handle that is notified once a shutdown is initiated.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.sender.subscribe())
    }

    /// Initiates a shutdown with the given timeout.
    ///
    /// Only the first shutdown request takes effect, subsequent calls are ignored.
    pub fn shutdown(&self, timeout: Option<Duration>) {
        self.sender.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }

            *state = Some(Shutdown { timeout });
            true
        });
    }

    /// Listens for process signals until one of them initiates a shutdown.
    ///
    /// This must be called within a tokio runtime. The returned future completes once a shutdown
    /// has been initiated, either through a signal or through [`shutdown`](Self::shutdown).
    pub async fn listen_for_signals(&self) {
        let mut handle = self.shutdown_handle();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            let (mut int, mut quit, mut term) = match (
                signal(SignalKind::interrupt()),
                signal(SignalKind::quit()),
                signal(SignalKind::terminate()),
            ) {
                (Ok(int), Ok(quit), Ok(term)) => (int, quit, term),
                _ => {
                    ferry_log::error!("failed to register signal handlers");
                    handle.notified().await;
                    return;
                }
            };

            tokio::select! {
                biased;

                _ = handle.notified() => (),
                _ = int.recv() => {
                    ferry_log::info!("SIGINT received, exiting");
                    self.shutdown(None);
                }
                _ = quit.recv() => {
                    ferry_log::info!("SIGQUIT received, exiting");
                    self.shutdown(None);
                }
                _ = term.recv() => {
                    ferry_log::info!("SIGTERM received, stopping in {}s", self.timeout.as_secs());
                    self.shutdown(Some(self.timeout));
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::select! {
                biased;

                _ = handle.notified() => (),
                _ = tokio::signal::ctrl_c() => {
                    ferry_log::info!("SIGINT received, exiting");
                    self.shutdown(None);
                }
            }
        }
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("timeout", &self.timeout)
            .field("shutdown", &*self.sender.borrow())
            .finish()
    }
}
