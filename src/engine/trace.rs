use crate::alerts::context::AlertEvent;
use crate::alerts::rules::RuleEngineStats;
use crate::config::SimulationConfig;
use crate::etc::detector::{DetectorAlert, GantryStatsSnapshot};
use crate::etc::noise::NoiseEvent;
use crate::etc::transaction::EtcTransaction;
use crate::road::GantryId;
use crate::vehicles::anomaly::AnomalyLogEntry;
use crate::vehicles::vehicle::{SegmentTiming, Vehicle, VehicleId};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One trajectory sample: a vehicle at a tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryPoint {
    pub id: VehicleId,
    pub pos: f64,
    pub time: f64,
    pub lane: usize,
    /// m/s
    pub speed: f64,
    pub anomaly_state: String,
    pub anomaly_type: u8,
    pub vehicle_type: String,
    pub driver_style: String,
    pub is_affected: bool,
}

/// Per-segment flow aggregate for one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentFlowRecord {
    pub time: f64,
    pub segment: usize,
    /// m/s
    pub avg_speed: f64,
    /// vehicles/km
    pub density: f64,
    /// (m/s)·(vehicles/km)
    pub flow: f64,
}

/// A detected queue: a segment holding enough slow vehicles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEvent {
    pub time: f64,
    pub segment: usize,
    pub queue_start: f64,
    pub queue_end: f64,
    pub queue_length: f64,
    pub vehicle_count: usize,
}

/// A phantom-jam witness: slow with nothing slow ahead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhantomJamEvent {
    pub time: f64,
    pub vehicle_id: VehicleId,
    pub position_km: f64,
    pub speed_kmh: f64,
    pub lane: usize,
}

/// Per-vehicle safety sample for one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyRecord {
    pub time: f64,
    pub vehicle_id: VehicleId,
    pub vehicle_type: String,
    pub driver_style: String,
    pub speed_kmh: f64,
    pub pos: f64,
    pub min_ttc: f64,
    pub max_decel: f64,
    pub brake_count: u64,
    pub emergency_brake_count: u64,
}

/// A finished vehicle as persisted in the run artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleRecord {
    pub id: VehicleId,
    pub vehicle_type: String,
    pub driver_style: String,
    pub entry_time: f64,
    pub exit_time: Option<f64>,
    pub lane_changes: u32,
    pub free_changes: u32,
    pub forced_changes: u32,
    pub anomaly_type: u8,
    pub anomaly_trigger_time: Option<f64>,
    pub etc_detection_delay: Option<f64>,
    pub response_times: Vec<f64>,
    pub min_ttc: f64,
    pub max_decel: f64,
    pub brake_count: u64,
    pub emergency_brake_count: u64,
    pub logs: BTreeMap<usize, SegmentTiming>,
}

impl VehicleRecord {
    pub fn of(vehicle: &Vehicle) -> Self {
        VehicleRecord {
            id: vehicle.id,
            vehicle_type: vehicle.class.to_string(),
            driver_style: vehicle.style.to_string(),
            entry_time: vehicle.entry_time,
            exit_time: vehicle.exit_time,
            lane_changes: vehicle.lane_changes,
            free_changes: vehicle.free_changes,
            forced_changes: vehicle.forced_changes,
            anomaly_type: vehicle.anomaly.kind.code(),
            anomaly_trigger_time: vehicle.anomaly.trigger_time,
            etc_detection_delay: vehicle.etc_detection_delay,
            response_times: vehicle.response_times.clone(),
            min_ttc: vehicle.safety.min_ttc,
            max_decel: vehicle.safety.max_decel,
            brake_count: vehicle.safety.brake_count,
            emergency_brake_count: vehicle.safety.emergency_brake_count,
            logs: vehicle.segment_log.clone(),
        }
    }
}

/// Run totals.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RunStatistics {
    pub total_spawned: usize,
    pub total_finished: usize,
    pub total_active: usize,
    pub total_lane_changes: u64,
    pub total_anomalies: usize,
    pub total_transactions: usize,
    pub total_detector_alerts: usize,
    pub total_noise_events: usize,
    pub total_rule_events: usize,
    pub total_queue_events: usize,
    pub total_phantom_jam_events: usize,
    pub ticks: u64,
}

/// The ETC branch of the run artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtcDetectionOutput {
    pub transactions: Vec<EtcTransaction>,
    pub alerts: Vec<DetectorAlert>,
    pub gate_stats: IndexMap<GantryId, GantryStatsSnapshot>,
    pub noise_events: Vec<NoiseEvent>,
}

/// The rule-engine branch of the run artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleEngineOutput {
    pub events: Vec<AlertEvent>,
    pub engine_stats: RuleEngineStats,
}

/// The single document a run produces for persistent storage. Field
/// names are a contract for the downstream evaluator and feature
/// extractor; renaming any of them is a breaking change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunArtifact {
    pub run_id: String,
    pub config: SimulationConfig,
    pub statistics: RunStatistics,
    pub anomaly_logs: Vec<AnomalyLogEntry>,
    pub trajectory_data: Vec<TrajectoryPoint>,
    pub segment_speed_history: Vec<SegmentFlowRecord>,
    pub queue_events: Vec<QueueEvent>,
    pub phantom_jam_events: Vec<PhantomJamEvent>,
    pub safety_data: Vec<SafetyRecord>,
    pub vehicle_records: Vec<VehicleRecord>,
    pub etc_detection: EtcDetectionOutput,
    pub rule_engine: RuleEngineOutput,
}

impl RunArtifact {
    /// Serializes the artifact to a JSON value.
    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Serializes the artifact to a JSON string.
    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_vehicle_record_captures_segment_log() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut vehicle = Vehicle::spawn(3, 10.0, 1, &SimulationConfig::default(), &mut rng);
        vehicle.record_time(10.0, 0, 10);
        vehicle.record_time(110.0, 1, 10);
        let record = VehicleRecord::of(&vehicle);
        assert_eq!(record.id, 3);
        assert_eq!(record.entry_time, 10.0);
        assert_eq!(record.logs.len(), 2);
        let json = serde_json::to_value(&record).expect("serialize");
        assert!(json["logs"]["0"]["in"].is_number());
        assert!(json["logs"]["1"]["out"].is_number());
    }

    #[test]
    fn test_artifact_field_names() {
        let artifact = RunArtifact {
            run_id: "test".to_string(),
            config: SimulationConfig::default(),
            statistics: RunStatistics::default(),
            anomaly_logs: vec![],
            trajectory_data: vec![],
            segment_speed_history: vec![],
            queue_events: vec![],
            phantom_jam_events: vec![],
            safety_data: vec![],
            vehicle_records: vec![],
            etc_detection: EtcDetectionOutput {
                transactions: vec![],
                alerts: vec![],
                gate_stats: IndexMap::new(),
                noise_events: vec![],
            },
            rule_engine: RuleEngineOutput {
                events: vec![],
                engine_stats: RuleEngineStats::default(),
            },
        };
        let json = artifact.to_json().expect("serialize");
        for field in [
            "config",
            "statistics",
            "anomaly_logs",
            "trajectory_data",
            "segment_speed_history",
            "queue_events",
            "phantom_jam_events",
            "safety_data",
            "vehicle_records",
        ] {
            assert!(json.get(field).is_some(), "missing artifact field {}", field);
        }
        assert!(json["etc_detection"].get("gate_stats").is_some());
        assert!(json["rule_engine"].get("engine_stats").is_some());
    }
}
