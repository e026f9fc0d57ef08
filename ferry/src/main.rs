//! Ferry receives metrics from collectd and statsd and forwards them to Carbon.
//!
//! Collectd agents send their samples in the binary network protocol, optionally signed or
//! encrypted. Ferry authenticates and decodes the packets, turns every value into a dotted metric
//! name, converts counters into per-second rates and writes the result to one or more Carbon
//! servers in the plaintext or pickle protocol.
//!
//! # Workspace Crates
//!
//! Ferry is split into the following workspace crates:
//!
//!  - `ferry`: Main entry point and command line interface.
//!  - [`ferry-auth`]: Credentials and the signature and encryption gate.
//!  - [`ferry-collectd`]: The collectd wire format and the types.db registry.
//!  - [`ferry-config`]: Static configuration for the CLI and server.
//!  - [`ferry-log`]: Logging setup and error rendering.
//!  - [`ferry-metrics`]: Metric points, naming, converters, rates and statsd aggregation.
//!  - [`ferry-server`]: Listeners, sinks and the supervisor.
//!  - [`ferry-statsd`]: High-level StatsD client for internal measurements.
//!  - [`ferry-system`]: Shutdown coordination and supervised tasks.
//!
//! [`ferry-auth`]: ../ferry_auth/index.html
//! [`ferry-collectd`]: ../ferry_collectd/index.html
//! [`ferry-config`]: ../ferry_config/index.html
//! [`ferry-log`]: ../ferry_log/index.html
//! [`ferry-metrics`]: ../ferry_metrics/index.html
//! [`ferry-server`]: ../ferry_server/index.html
//! [`ferry-statsd`]: ../ferry_statsd/index.html
//! [`ferry-system`]: ../ferry_system/index.html

mod cli;
mod cliapp;
mod setup;

use std::process;

pub fn main() {
    let exit_code = match cli::execute() {
        Ok(()) => 0,
        Err(err) => {
            ferry_log::ensure_error(&err);
            1
        }
    };

    process::exit(exit_code);
}
