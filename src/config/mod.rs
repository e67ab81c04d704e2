//! # Config Module
//!
//! Configuration surface of the simulation core.
//!
//! ## Key Components
//!
//! - [`parameters::SimulationConfig`] - The plain record of every recognized
//!   option, with defaults matching the reference highway scenario
//! - [`parameters::ConfigError`] - Structural validation failures raised at
//!   construction, before a run starts
//! - [`parameters::Weather`] - Environment tag carried into the alert context
//!
//! A configuration is validated once when the engine is built; a run never
//! starts from an invalid record.
pub mod parameters;

pub use self::parameters::*;
