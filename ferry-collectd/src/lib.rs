//! Decoder for the collectd binary network protocol.
//!
//! A collectd packet is a stream of self-describing parts. String and numeric parts update a
//! running context (host, plugin, type, time, ...), and every values part emits one [`Sample`]
//! per value in that context. The layout of a values part is declared by the types database,
//! which is loaded into a [`TypeRegistry`] at startup.
//!
//! ```
//! use ferry_collectd::{TypeRegistry, decode};
//!
//! let mut types = TypeRegistry::new();
//! types.extend_from_str("load shortterm:GAUGE:0:5000, midterm:GAUGE:0:5000, longterm:GAUGE:0:5000");
//!
//! # let packet = Vec::new();
//! for result in decode(&types, &packet) {
//!     match result {
//!         Ok(sample) => println!("{} {}", sample.host, sample.value_name),
//!         Err(error) => eprintln!("dropping packet: {error}"),
//!     }
//! }
//! ```
//!
//! Signed and encrypted packets have to be unwrapped before decoding.
#![warn(missing_docs)]

mod decode;
pub mod parts;
mod sample;
#[cfg(any(test, feature = "test"))]
pub mod testutils;
mod types_db;

pub use self::decode::*;
pub use self::sample::*;
pub use self::types_db::*;
