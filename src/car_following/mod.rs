//! # Car-Following Module
//!
//! Longitudinal acceleration kernels. Pure functions over read-only
//! neighbor views; the engine applies the returned acceleration to the
//! focal vehicle.
//!
//! ## Key Components
//!
//! - [`idm`] - The Intelligent Driver Model with the staged-braking
//!   override for stopped obstacles and an emergency scaling term
//! - [`coupling`] - Adjacent-lane lateral influence correction
pub mod coupling;
pub mod idm;
