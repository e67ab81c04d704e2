//! # Lane-Change Module
//!
//! The MOBIL lane-change decision kernel: a pure function weighing the
//! focal vehicle's acceleration gain in a candidate lane against the
//! braking it would force on that lane's follower, scaled by the driver's
//! politeness. A forced variant handles escape from behind a stopped
//! obstacle, where only physical feasibility is checked.
//!
//! ## Key Components
//!
//! - [`mobil::decide`] - The decision entry point used by the vehicle update
//! - [`mobil::LaneChangeReason`] - Whether a change was discretionary or forced
//! - [`mobil::BlockedLanes`] - Per-lane positions of active full-stop anomalies
pub mod mobil;

pub use self::mobil::*;
