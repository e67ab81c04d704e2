//! # Utils Module
//!
//! Shared numeric helpers used across the simulation core.
//!
//! ## Key Components
//!
//! - [`units`] - Speed unit conversions (km/h ↔ m/s)
//! - [`sampling`] - Sampling helpers for the stochastic parts of the model
//!
//! ## Example
//!
//! ```rust
//! use etc_traffic_sim_core::utils::units::{kmh_to_ms, ms_to_kmh};
//!
//! let v = kmh_to_ms(120.0);
//! assert!((ms_to_kmh(v) - 120.0).abs() < 1e-9);
//! ```
pub mod sampling;
pub mod units;
