//! # Verbose Module
//!
//! Structured JSON logging for the simulation core, built on `tracing`.
//!
//! A single [`VerboseLevel`] ladder controls how much of the tick
//! pipeline is narrated: major phases at `Main`, per-subsystem details
//! at `Additional`, per-vehicle loop events at `Detailed`, everything at
//! `All`. Each log line carries an `event` tag from the constants below
//! so downstream tooling can filter the stream.
pub mod verbose;

pub use self::verbose::*;
