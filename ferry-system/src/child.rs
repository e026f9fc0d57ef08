use std::error::Error;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// A type-erased error returned by a failed child.
pub type ChildError = Box<dyn Error + Send + Sync + 'static>;

/// Describes how a [`Child`] terminated.
#[derive(Debug)]
pub enum ChildExit {
    /// The child ran to completion.
    Completed,
    /// The child returned an error.
    Failed(ChildError),
    /// The child panicked.
    Panicked,
    /// The child did not terminate within its grace period and was aborted.
    Aborted,
}

impl ChildExit {
    /// Returns `true` if the child completed without error.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for ChildExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::Failed(error) => write!(f, "failed: {error}"),
            Self::Panicked => f.write_str("panicked"),
            Self::Aborted => f.write_str("aborted after grace period"),
        }
    }
}

/// A named, supervised task.
///
/// Children are the unit of liveness in the pipeline: every listener, the processor and every
/// sink run as a child of the supervisor. A child that terminates while the pipeline is running
/// is considered dead, regardless of whether it returned successfully.
pub struct Child {
    name: String,
    handle: JoinHandle<Result<(), ChildError>>,
}

impl Child {
    /// Spawns the given future as a child task on the current runtime.
    pub fn spawn<F, E>(name: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<ChildError>,
    {
        let name = name.into();
        ferry_log::debug!("starting {name}");

        let handle = tokio::spawn(async move { future.await.map_err(Into::into) });
        Self { name, handle }
    }

    /// The name of this child.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` while the child's task has not terminated.
    pub fn is_alive(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Waits up to `grace` for the child to terminate, then aborts it.
    ///
    /// Returns immediately for children that already terminated.
    pub async fn stop(mut self, grace: Duration) -> ChildExit {
        let result = tokio::time::timeout(grace, &mut self.handle).await;
        let exit = match result {
            Ok(Ok(Ok(()))) => ChildExit::Completed,
            Ok(Ok(Err(error))) => ChildExit::Failed(error),
            Ok(Err(join_error)) if join_error.is_panic() => ChildExit::Panicked,
            Ok(Err(_)) => ChildExit::Aborted,
            Err(_) => {
                self.handle.abort();
                ChildExit::Aborted
            }
        };

        ferry_log::debug!("{} stopped: {exit}", self.name);
        exit
    }
}

impl fmt::Debug for Child {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Child")
            .field("name", &self.name)
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[tokio::test]
    async fn test_completed_child() {
        let child = Child::spawn("completes", async { Ok::<_, io::Error>(()) });
        assert!(child.stop(Duration::from_secs(1)).await.is_success());
    }

    #[tokio::test]
    async fn test_failed_child() {
        let child = Child::spawn("fails", async {
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
        });

        tokio::task::yield_now().await;
        let exit = child.stop(Duration::from_secs(1)).await;
        assert!(matches!(exit, ChildExit::Failed(ref e) if e.to_string() == "refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_child_is_aborted() {
        let child = Child::spawn("stuck", std::future::pending::<Result<(), io::Error>>());

        assert!(child.is_alive());
        let exit = child.stop(Duration::from_secs(5)).await;
        assert!(matches!(exit, ChildExit::Aborted));
    }

    #[tokio::test]
    async fn test_liveness() {
        let child = Child::spawn("short", async { Ok::<_, io::Error>(()) });

        for _ in 0..100 {
            if !child.is_alive() {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert!(!child.is_alive());
    }
}
