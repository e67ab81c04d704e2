//! # Vehicles Module
//!
//! The per-vehicle model: kinematic state, physical parameters drawn from
//! the vehicle-class catalog, driver style, the anomaly sub-state machine
//! and per-segment bookkeeping.
//!
//! ## Key Components
//!
//! - [`vehicle::Vehicle`] - The simulated vehicle, exclusively owned by the engine
//! - [`vehicle::NeighborView`] - Read-only copy of the fields the decision
//!   kernels need; built per neighbor each tick so no references are held
//!   between vehicles across ticks
//! - [`vehicle_types::VehicleClass`] / [`vehicle_types::DriverStyle`] -
//!   Sampled catalogs for physical and behavioral parameters
//! - [`anomaly::AnomalyState`] - The injected-misbehavior state machine
//! - [`storage::VehiclesStorage`] - Insertion-ordered vehicle collection
//!
//! ## Ownership
//!
//! The engine owns every vehicle for its lifetime. Kernels receive
//! read-only [`vehicle::NeighborView`] slices plus a mutation on the focal
//! vehicle; vehicle ids are the only handle that survives a tick.
pub mod anomaly;
pub mod storage;
pub mod vehicle;
pub mod vehicle_types;

pub use self::{anomaly::*, storage::*, vehicle::*, vehicle_types::*};
