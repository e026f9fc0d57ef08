//! The optional transformer between listeners and the supervisor.

use std::sync::Arc;

use ferry_metrics::Transform;
use ferry_statsd::metric;
use ferry_system::ShutdownHandle;
use tokio::sync::mpsc;

use crate::services::Message;
use crate::statsd::ServerCounters;

/// Applies a [`Transform`] to every point on its way to the shared queue.
///
/// The processor owns its own inbound queue. Listeners push into it instead of the shared queue
/// when the processor is enabled, so points never pass the same queue twice.
pub struct Processor {
    transform: Arc<dyn Transform>,
    input: mpsc::UnboundedReceiver<Message>,
    output: mpsc::UnboundedSender<Message>,
}

impl Processor {
    /// Creates a processor and the sender for its inbound queue.
    pub fn new(
        transform: Arc<dyn Transform>,
        output: mpsc::UnboundedSender<Message>,
    ) -> (Self, mpsc::UnboundedSender<Message>) {
        let (tx, input) = mpsc::unbounded_channel();
        let processor = Self {
            transform,
            input,
            output,
        };
        (processor, tx)
    }

    /// Forwards transformed points until the stop signal or until all listeners are gone.
    pub async fn run(mut self, mut stop: ShutdownHandle) -> Result<(), std::convert::Infallible> {
        loop {
            let message = tokio::select! {
                biased;

                _ = stop.notified() => break,
                message = self.input.recv() => message,
            };

            let point = match message {
                Some(Message::Point(point)) => point,
                Some(Message::Sentinel) | None => break,
            };

            let Some(point) = self.transform.apply(point) else {
                metric!(counter(ServerCounters::PointsDropped) += 1, reason = "transform");
                continue;
            };

            if self.output.send(Message::Point(point)).is_err() {
                break;
            }
        }

        ferry_log::debug!("processor stopped");
        Ok(())
    }
}
