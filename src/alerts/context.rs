use crate::config::Weather;
use crate::etc::detector::GantryStatsSnapshot;
use crate::etc::noise::NoiseStatistics;
use crate::etc::transaction::EtcTransaction;
use crate::road::GantryId;
use crate::vehicles::anomaly::AnomalyPhase;
use crate::vehicles::vehicle::VehicleId;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Alert severity ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Default confidence attached to events of this severity.
    pub fn base_confidence(&self) -> f64 {
        match self {
            Severity::Low => 0.5,
            Severity::Medium => 0.65,
            Severity::High => 0.8,
            Severity::Critical => 0.9,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// Event produced by a fired rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub rule_name: String,
    pub severity: Severity,
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gantry_id: Option<GantryId>,
    pub position_km: f64,
    pub description: String,
    pub confidence: f64,
    pub affected_lanes: Vec<usize>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// The per-tick snapshot the rule engine evaluates against.
///
/// Assembled by the engine at the end of each tick from detector state,
/// vehicle state and the aggregation buffers. All maps are ordered so
/// that iteration during evaluation is deterministic.
#[derive(Debug, Clone, Default)]
pub struct AlertContext {
    pub current_time: f64,
    /// Per-gantry rolling statistics
    pub gantry_stats: IndexMap<GantryId, GantryStatsSnapshot>,
    /// Trailing window of (noisy) transactions
    pub recent_transactions: Vec<EtcTransaction>,
    /// Vehicle speed snapshot, m/s
    pub vehicle_speeds: BTreeMap<VehicleId, f64>,
    /// Vehicle position snapshot, m
    pub vehicle_positions: BTreeMap<VehicleId, f64>,
    /// Vehicle lane snapshot
    pub vehicle_lanes: BTreeMap<VehicleId, usize>,
    /// Vehicle anomaly phase snapshot
    pub vehicle_anomaly_phases: BTreeMap<VehicleId, AnomalyPhase>,
    /// Running noise-stage statistics
    pub noise_stats: NoiseStatistics,
    pub weather: Weather,
    /// Queue length in meters keyed by the gantry covering the queue
    pub queue_lengths: BTreeMap<GantryId, f64>,
    /// Average speed per non-empty segment, m/s
    pub segment_avg_speeds: BTreeMap<usize, f64>,
    /// Density per non-empty segment, vehicles/km
    pub segment_densities: BTreeMap<usize, f64>,
    /// Events fired within the trailing history window
    pub recent_alert_events: Vec<AlertEvent>,
}

impl AlertContext {
    /// Mean vehicle speed in km/h across the active set, or `None` when
    /// the road is empty.
    pub fn mean_speed_kmh(&self) -> Option<f64> {
        if self.vehicle_speeds.is_empty() {
            return None;
        }
        let sum: f64 = self.vehicle_speeds.values().sum();
        Some(sum / self.vehicle_speeds.len() as f64 * 3.6)
    }

    /// The named scalar variables exposed to custom-expression
    /// conditions. This is the whole sandbox surface: an expression may
    /// reference these and nothing else.
    pub fn variables(&self) -> BTreeMap<String, f64> {
        let mut vars = BTreeMap::new();
        vars.insert("current_time".to_string(), self.current_time);
        vars.insert("active_vehicles".to_string(), self.vehicle_speeds.len() as f64);
        vars.insert("mean_speed_kmh".to_string(), self.mean_speed_kmh().unwrap_or(0.0));
        vars.insert(
            "min_segment_speed_kmh".to_string(),
            self.segment_avg_speeds
                .values()
                .fold(f64::INFINITY, |min, &s| min.min(s * 3.6))
                .min(1e9),
        );
        vars.insert(
            "max_segment_density".to_string(),
            self.segment_densities.values().fold(0.0f64, |max, &d| max.max(d)),
        );
        vars.insert(
            "max_queue_length_m".to_string(),
            self.queue_lengths.values().fold(0.0f64, |max, &q| max.max(q)),
        );
        vars.insert(
            "active_anomalies".to_string(),
            self.vehicle_anomaly_phases
                .values()
                .filter(|p| **p == AnomalyPhase::Active)
                .count() as f64,
        );
        vars.insert("missed_read_rate".to_string(), self.noise_stats.missed_read_rate_actual);
        vars.insert("total_transactions".to_string(), self.noise_stats.total_processed as f64);
        vars.insert("recent_alerts".to_string(), self.recent_alert_events.len() as f64);
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn test_mean_speed() {
        let mut ctx = AlertContext::default();
        assert_eq!(ctx.mean_speed_kmh(), None);
        ctx.vehicle_speeds.insert(1, 10.0);
        ctx.vehicle_speeds.insert(2, 20.0);
        assert!((ctx.mean_speed_kmh().unwrap() - 54.0).abs() < 1e-9);
    }

    #[test]
    fn test_variables_cover_sandbox_surface() {
        let mut ctx = AlertContext::default();
        ctx.current_time = 120.0;
        ctx.vehicle_speeds.insert(1, 25.0);
        ctx.vehicle_anomaly_phases.insert(1, AnomalyPhase::Active);
        ctx.segment_densities.insert(3, 18.0);
        let vars = ctx.variables();
        assert_eq!(vars["current_time"], 120.0);
        assert_eq!(vars["active_vehicles"], 1.0);
        assert_eq!(vars["active_anomalies"], 1.0);
        assert_eq!(vars["max_segment_density"], 18.0);
    }

    #[test]
    fn test_event_serialization_skips_empty_metadata() {
        let event = AlertEvent {
            rule_name: "r".into(),
            severity: Severity::Low,
            timestamp: 1.0,
            gantry_id: None,
            position_km: 0.0,
            description: String::new(),
            confidence: 0.5,
            affected_lanes: vec![],
            metadata: BTreeMap::new(),
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert!(json.get("metadata").is_none());
        assert!(json.get("gantry_id").is_none());
        assert_eq!(json["severity"], "low");
    }
}
