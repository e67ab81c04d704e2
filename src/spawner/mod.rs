//! # Spawner Module
//!
//! Produces the monotonically non-decreasing schedule of vehicle entry
//! times consumed by the engine: a homogeneous or time-varying Poisson
//! process shaped by a flow profile, with optional platoon clustering.
//!
//! ## Key Components
//!
//! - [`spawner::VehicleSpawner`] - The schedule generator, built once per
//!   run from the engine's seeded generator
//! - [`spawner::FlowMode`] - Named flow profiles (uniform, peaks, night)
//!   plus a custom piecewise-linear curve
pub mod spawner;

pub use self::spawner::*;
