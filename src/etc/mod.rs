//! # ETC Module
//!
//! The electronic-toll-collection sensing chain: gantry crossing
//! transactions, the noise stage that perturbs them the way real ETC
//! hardware does, and the streaming detector that maintains per-gantry
//! rolling statistics and raises congestion alerts.
//!
//! ## Data Flow
//!
//! ```text
//! vehicle crosses gantry
//!     → raw EtcTransaction
//!     → NoiseStage (drop / duplicate / delay / drift)
//!     → EtcDetector (ring buffers, z-score, consecutive outliers)
//!     → DetectorAlert
//! ```
//!
//! ## Key Components
//!
//! - [`transaction::EtcTransaction`] - One gantry read of one vehicle
//! - [`noise::NoiseStage`] - Ordered pipeline of independent injectors
//! - [`detector::EtcDetector`] - Travel-time and speed anomaly detection
pub mod detector;
pub mod noise;
pub mod transaction;

pub use self::{detector::*, noise::*, transaction::*};
