//! # etc_traffic_sim_core
//!
//! Core library for microscopic highway traffic simulation with ETC
//! (electronic toll collection) anomaly detection.
//!
//! The crate simulates thousands of individual vehicles on a multi-lane
//! road with gantry sensors, injects rare driver anomalies (full stops,
//! speed fluctuations), and emits a rich trace consumed by downstream
//! alert-rule tooling: per-vehicle trajectories, per-gantry
//! transactions, per-segment flow statistics, and rule-fired alerts.
//!
//! ## Subsystems
//!
//! - [`engine`] - The fixed time-step loop owning all world state
//! - [`vehicles`] - Per-vehicle state, parameter catalogs and the
//!   anomaly state machine
//! - [`car_following`] / [`lane_change`] - The IDM and MOBIL decision
//!   kernels, pure functions over neighbor views
//! - [`spatial`] - The lane-by-cell grid keeping neighbor queries O(N)
//! - [`spawner`] - Poisson entry schedules with flow profiles and platoons
//! - [`etc`] - Gantry transactions, the hardware-noise stage and the
//!   streaming anomaly detector
//! - [`alerts`] - The condition catalog and the cooldown-aware rule engine
//! - [`road`], [`config`], [`utils`], [`verbose`] - Geometry,
//!   configuration, numeric helpers and structured logging
//!
//! ## Example
//!
//! ```rust
//! use etc_traffic_sim_core::config::SimulationConfig;
//! use etc_traffic_sim_core::engine::SimulationEngine;
//!
//! let mut config = SimulationConfig::default();
//! config.total_vehicles = 20;
//! config.road_length_km = 4.0;
//! config.max_simulation_time = 600.0;
//!
//! let mut engine = SimulationEngine::new(config).unwrap();
//! engine.run().unwrap();
//!
//! let artifact = engine.artifact();
//! assert_eq!(artifact.statistics.total_finished, 20);
//! ```
//!
//! ## Determinism
//!
//! Given the same configuration (including `random_seed`) a run is
//! reproducible: every stochastic choice draws from one seeded
//! generator threaded through the engine.
pub mod alerts;
pub mod car_following;
pub mod config;
pub mod engine;
pub mod etc;
pub mod lane_change;
pub mod road;
pub mod spatial;
pub mod spawner;
pub mod utils;
pub mod vehicles;
pub mod verbose;
