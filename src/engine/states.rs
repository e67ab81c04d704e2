use crate::alerts::context::AlertEvent;
use crate::config::SimulationConfig;
use crate::etc::detector::DetectorAlert;
use crate::etc::noise::NoiseEvent;
use crate::etc::transaction::EtcTransaction;
use crate::vehicles::anomaly::AnomalyLogEntry;
use crate::vehicles::vehicle::{Vehicle, VehicleId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of the engine as seen by its shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulationState {
    Created,
    Running,
    Paused,
    Stopped,
    Finished,
}

impl fmt::Display for SimulationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SimulationState::Created => "created",
            SimulationState::Running => "running",
            SimulationState::Paused => "paused",
            SimulationState::Stopped => "stopped",
            SimulationState::Finished => "finished",
        };
        write!(f, "{}", s)
    }
}

/// Control messages the core consumes from its shell.
#[derive(Debug, Clone)]
pub enum EngineCommand {
    Init(Box<SimulationConfig>),
    Start,
    Pause,
    Resume,
    Stop,
    Reset,
}

/// PROGRESS frame for the live viewer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub current_time: f64,
    pub total_time: f64,
    pub progress: f64,
    pub active_vehicles: usize,
    pub completed_vehicles: usize,
    pub active_anomalies: usize,
    /// Estimated remaining simulated seconds
    pub eta: f64,
}

/// One vehicle in a SNAPSHOT frame. `x` is longitudinal meters, `y` the
/// lateral visual coordinate
/// `lane · lane_width + lane_width/2 + lateral_offset`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleSnapshot {
    pub id: VehicleId,
    pub x: f64,
    pub y: f64,
    pub lane: usize,
    pub speed_kmh: f64,
    #[serde(rename = "type")]
    pub vehicle_type: String,
    pub driver_style: String,
    pub anomaly_state: String,
    pub anomaly_type: u8,
    pub is_affected: bool,
    pub length: f64,
    pub color: String,
}

impl VehicleSnapshot {
    pub fn of(vehicle: &Vehicle, lane_width: f64) -> Self {
        VehicleSnapshot {
            id: vehicle.id,
            x: vehicle.pos,
            y: vehicle.lane as f64 * lane_width + lane_width / 2.0 + vehicle.lateral,
            lane: vehicle.lane,
            speed_kmh: vehicle.speed * 3.6,
            vehicle_type: vehicle.class.to_string(),
            driver_style: vehicle.style.to_string(),
            anomaly_state: vehicle.anomaly.phase.to_string(),
            anomaly_type: vehicle.anomaly.kind.code(),
            is_affected: vehicle.is_affected,
            length: vehicle.length,
            color: vehicle.color().to_string(),
        }
    }
}

/// SNAPSHOT frame: the whole active set at a tick boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFrame {
    pub time: f64,
    pub vehicles: Vec<VehicleSnapshot>,
}

/// Everything one tick produced, in emission order.
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    pub time: f64,
    pub tick: u64,
    pub spawned: Vec<VehicleId>,
    pub anomaly_logs: Vec<AnomalyLogEntry>,
    pub transactions: Vec<EtcTransaction>,
    pub noise_events: Vec<NoiseEvent>,
    pub detector_alerts: Vec<DetectorAlert>,
    pub rule_events: Vec<AlertEvent>,
    pub finished: Vec<VehicleId>,
    /// Set on the tick the run completes
    pub done: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_snapshot_lateral_coordinate() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut vehicle = Vehicle::spawn(1, 0.0, 2, &SimulationConfig::default(), &mut rng);
        vehicle.pos = 500.0;
        let snap = VehicleSnapshot::of(&vehicle, 3.5);
        assert_eq!(snap.x, 500.0);
        // Lane 2 center: 2 * 3.5 + 1.75 = 8.75, no lateral offset.
        assert!((snap.y - 8.75).abs() < 1e-12);
        assert_eq!(snap.anomaly_state, "normal");
        assert_eq!(snap.anomaly_type, 0);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(format!("{}", SimulationState::Running), "running");
        assert_eq!(format!("{}", SimulationState::Finished), "finished");
    }
}
