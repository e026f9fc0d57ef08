//! The Ferry pipeline.
//!
//! Ferry receives telemetry from collectd and statsd over UDP, normalizes it into dotted metric
//! names with rate-adjusted values, and forwards the resulting points to one or more Carbon
//! servers over TCP.
//!
//! # Architecture
//!
//! ```text
//!  collectd listener ─┐                                  ┌─> sink "carbon" ─> TCP
//!                     ├─> [processor] ─> shared queue ─> supervisor
//!    statsd listener ─┘                                  └─> sink "backup" ─> TCP
//! ```
//!
//! Every box is a separate task supervised by the [`Supervisor`]:
//!
//!  - The **collectd listener** authenticates packets with the crypto gate, decodes them into
//!    samples, converts samples into names and computes rates. Invalid packets and values are
//!    logged and dropped without affecting other packets.
//!  - The **statsd listener** parses text lines and flushes aggregates on a fixed interval.
//!  - The optional **processor** drops and renames points with configured regular expressions.
//!  - The **supervisor** drains the unbounded shared queue and fans every point out to all sinks
//!    through bounded channels, one sink after the other. It polls the liveness of all tasks and
//!    stops the entire pipeline when one of them terminates.
//!  - Each **sink** writes batches in plaintext or pickle format and reconnects with a fixed delay
//!    up to a bounded number of attempts.
//!
//! # Shutdown
//!
//! A shutdown enqueues a sentinel into the shared queue. Once the supervisor reaches it, every sink
//! receives a sentinel and writes its remaining batch, and all listeners are stopped. Tasks that
//! do not finish within the grace period are aborted.
#![warn(missing_docs)]

mod service;
mod services;
mod statsd;

pub use self::service::*;
pub use self::services::Message;
pub use self::services::collectd::{CollectdListener, PacketHandler};
pub use self::services::processor::Processor;
pub use self::services::sink::{SinkClient, SinkError, encode_batch};
pub use self::services::statsd::StatsdListener;
pub use self::services::supervisor::{Supervisor, SupervisorState};
