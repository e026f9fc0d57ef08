//! Configuration for the Ferry CLI and server.
//!
//! The configuration is loaded from a `config.yml` file in a configuration directory. All sections
//! and fields are optional and fall back to defaults, so an empty file starts a collectd listener on
//! port `25826` that forwards to a single Carbon server at `127.0.0.1:2003`.
//!
//! ```yaml
//! collectd:
//!   port: 25826
//!   types_db: [/usr/share/collectd/types.db]
//!   security_level: sign
//!   auth_file: /etc/collectd/passwd
//! statsd:
//!   enabled: true
//! sinks:
//!   - name: carbon
//!     host: 127.0.0.1
//!     port: 2003
//!     protocol: plaintext
//! ```
#![warn(missing_docs)]

mod config;

pub use self::config::*;
