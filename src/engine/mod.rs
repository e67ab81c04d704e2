//! # Engine Module
//!
//! **Top-level orchestration module** - owns all world state and drives
//! the fixed time-step loop.
//!
//! ## Tick pipeline
//!
//! Each call to [`engine::SimulationEngine::step`] executes, in order:
//! ```text
//!  1. Admit scheduled spawns (defer on contention)
//!  2. Materialize the active set, position-sorted; rebuild spatial index
//!  3. Collect blocked lanes from active full-stop anomalies
//!  4. Per-vehicle update: segment log → anomaly coin → neighbors →
//!     IDM + MOBIL → kinematics → index refresh
//!  5. Gantry crossings → noise stage → detector
//!  6. Trajectory points and per-segment flow records
//!  7. Queue and phantom-jam detection
//!  8. Alert context assembly → rule engine
//!  9. Finalize finished vehicles
//! 10. Advance the clock
//! ```
//!
//! Within a tick, trace events are emitted in exactly this order; the
//! downstream evaluator and feature extractor rely on it.
//!
//! ## Key Components
//!
//! - [`engine::SimulationEngine`] - The orchestrator; `step()` is the
//!   only unit of progress and completes without suspension points
//! - [`states::EngineCommand`] / [`states::SimulationState`] - The
//!   control surface the outer shell drives
//! - [`trace::RunArtifact`] - Everything a run persists
pub mod engine;
pub mod states;
pub mod trace;

pub use self::{engine::*, states::*, trace::*};
