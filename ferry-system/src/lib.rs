//! Foundational system components for Ferry's pipeline.
//!
//! This crate provides the [`Controller`], which translates process signals into a coordinated
//! [`Shutdown`], and [`Child`], a named task handle used by the supervisor to poll liveness and to
//! stop components within a bounded grace period.

#![warn(missing_docs)]

mod child;
mod controller;

pub use self::child::*;
pub use self::controller::*;
