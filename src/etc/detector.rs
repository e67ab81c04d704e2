use crate::alerts::context::Severity;
use crate::etc::transaction::EtcTransaction;
use crate::road::GantryId;
use crate::utils::units::ms_to_kmh;
use crate::vehicles::vehicle::VehicleId;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;

/// Ring buffer capacity for per-gantry statistics.
pub const RING_CAPACITY: usize = 50;
/// Samples needed before travel-time statistics are trusted.
const MIN_SAMPLES: usize = 5;
/// Travel-time z-score threshold.
const TT_OUTLIER_SIGMA: f64 = 2.0;
/// Travel-time ratio-over-mean threshold.
const TT_OUTLIER_RATIO: f64 = 1.5;
/// Downstream/upstream flow ratio under which an incident is suspected.
const FLOW_DROP_THRESHOLD: f64 = 0.5;
/// Crossing-speed alert threshold, km/h.
const SPEED_ALERT_THRESHOLD_KMH: f64 = 30.0;
/// Consecutive outliers before a congestion alert fires.
const CONSECUTIVE_THRESHOLD: u32 = 3;

/// What a detector alert is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorAlertKind {
    Congestion,
    Incident,
    SlowDown,
}

impl fmt::Display for DetectorAlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DetectorAlertKind::Congestion => "congestion",
            DetectorAlertKind::Incident => "incident",
            DetectorAlertKind::SlowDown => "slow_down",
        };
        write!(f, "{}", s)
    }
}

/// Alert emitted by the streaming detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorAlert {
    #[serde(rename = "type")]
    pub kind: DetectorAlertKind,
    pub severity: Severity,
    pub gantry_id: GantryId,
    pub position_km: f64,
    pub timestamp: f64,
    pub description: String,
    pub confidence: f64,
    pub affected_lanes: Vec<usize>,
}

/// Rolling per-gantry statistics fed by the transaction stream.
#[derive(Debug, Clone)]
pub struct GantryStatistics {
    pub gantry_id: GantryId,
    pub position_km: f64,
    pub recent_travel_times: VecDeque<f64>,
    pub recent_speeds_kmh: VecDeque<f64>,
    pub avg_travel_time: f64,
    pub std_travel_time: f64,
    pub avg_speed_kmh: f64,
    /// Z-score of the most recent travel-time sample
    pub last_z_score: f64,
    pub outlier_count: u64,
    pub consecutive_outliers: u32,
}

impl GantryStatistics {
    fn new(gantry_id: GantryId, position_km: f64) -> Self {
        GantryStatistics {
            gantry_id,
            position_km,
            recent_travel_times: VecDeque::with_capacity(RING_CAPACITY),
            recent_speeds_kmh: VecDeque::with_capacity(RING_CAPACITY),
            avg_travel_time: 0.0,
            std_travel_time: 0.0,
            avg_speed_kmh: 0.0,
            last_z_score: 0.0,
            outlier_count: 0,
            consecutive_outliers: 0,
        }
    }

    fn push_speed(&mut self, speed_kmh: f64) {
        if self.recent_speeds_kmh.len() == RING_CAPACITY {
            self.recent_speeds_kmh.pop_front();
        }
        self.recent_speeds_kmh.push_back(speed_kmh);
        self.avg_speed_kmh =
            self.recent_speeds_kmh.iter().sum::<f64>() / self.recent_speeds_kmh.len() as f64;
    }

    fn push_travel_time(&mut self, travel_time: f64) {
        if self.recent_travel_times.len() == RING_CAPACITY {
            self.recent_travel_times.pop_front();
        }
        self.recent_travel_times.push_back(travel_time);
        if self.recent_travel_times.len() >= MIN_SAMPLES {
            let n = self.recent_travel_times.len() as f64;
            let mean = self.recent_travel_times.iter().sum::<f64>() / n;
            let variance =
                self.recent_travel_times.iter().map(|t| (t - mean).powi(2)).sum::<f64>() / n;
            self.avg_travel_time = mean;
            self.std_travel_time = if variance > 0.0 { variance.sqrt() } else { 1.0 };
        }
    }

    /// Snapshot for the alert context and the run artifact.
    pub fn snapshot(&self) -> GantryStatsSnapshot {
        GantryStatsSnapshot {
            gantry_id: self.gantry_id.clone(),
            position_km: self.position_km,
            avg_travel_time: self.avg_travel_time,
            std_travel_time: self.std_travel_time,
            avg_speed_kmh: self.avg_speed_kmh,
            last_z_score: self.last_z_score,
            recent_speeds_kmh: self.recent_speeds_kmh.iter().copied().collect(),
            outlier_count: self.outlier_count,
            consecutive_outliers: self.consecutive_outliers,
            sample_count: self.recent_travel_times.len(),
        }
    }
}

/// Immutable view of one gantry's statistics at a tick boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GantryStatsSnapshot {
    pub gantry_id: GantryId,
    pub position_km: f64,
    pub avg_travel_time: f64,
    pub std_travel_time: f64,
    pub avg_speed_kmh: f64,
    pub last_z_score: f64,
    pub recent_speeds_kmh: Vec<f64>,
    pub outlier_count: u64,
    pub consecutive_outliers: u32,
    pub sample_count: usize,
}

/// Streaming ETC anomaly detector.
///
/// Consumes the (noisy) transaction stream, maintains per-gantry rolling
/// travel-time and speed statistics, and raises alerts on travel-time
/// outliers, sustained low crossing speeds, and upstream/downstream flow
/// imbalance.
#[derive(Debug)]
pub struct EtcDetector {
    gantry_stats: IndexMap<GantryId, GantryStatistics>,
    vehicle_last_gantry: HashMap<VehicleId, (GantryId, f64)>,
    transactions: Vec<EtcTransaction>,
    alerts: Vec<DetectorAlert>,
}

impl Default for EtcDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl EtcDetector {
    pub fn new() -> Self {
        EtcDetector {
            gantry_stats: IndexMap::new(),
            vehicle_last_gantry: HashMap::new(),
            transactions: Vec::new(),
            alerts: Vec::new(),
        }
    }

    /// Registers a gantry; repeat registrations are no-ops.
    pub fn register_gantry(&mut self, gantry_id: &GantryId, position_km: f64) {
        if !self.gantry_stats.contains_key(gantry_id) {
            self.gantry_stats
                .insert(gantry_id.clone(), GantryStatistics::new(gantry_id.clone(), position_km));
        }
    }

    /// Ingests one transaction. Returns an alert when the read pushes a
    /// gantry over one of the detection thresholds.
    pub fn record_transaction(&mut self, tx: EtcTransaction) -> Option<DetectorAlert> {
        self.transactions.push(tx.clone());

        let speed_kmh = ms_to_kmh(tx.speed);
        let prior = self.vehicle_last_gantry.get(&tx.vehicle_id).cloned();
        self.vehicle_last_gantry
            .insert(tx.vehicle_id, (tx.gantry_id.clone(), tx.timestamp));

        let stats = self
            .gantry_stats
            .entry(tx.gantry_id.clone())
            .or_insert_with(|| GantryStatistics::new(tx.gantry_id.clone(), tx.gantry_position_km));
        stats.push_speed(speed_kmh);

        let mut alert = None;
        if let Some((last_gantry, last_time)) = prior {
            let travel_time = tx.timestamp - last_time;
            if travel_time > 0.0 && last_gantry != tx.gantry_id {
                stats.push_travel_time(travel_time);
                if stats.recent_travel_times.len() >= MIN_SAMPLES {
                    alert = Self::check_travel_time_outlier(stats, travel_time, &tx);
                }
            }
        }

        if alert.is_none() {
            alert = Self::check_speed_anomaly(stats, &tx);
        }

        if let Some(a) = &alert {
            self.alerts.push(a.clone());
        }
        alert
    }

    fn check_travel_time_outlier(
        stats: &mut GantryStatistics,
        travel_time: f64,
        tx: &EtcTransaction,
    ) -> Option<DetectorAlert> {
        if stats.std_travel_time < 0.1 {
            return None;
        }
        let z_score = (travel_time - stats.avg_travel_time) / stats.std_travel_time;
        stats.last_z_score = z_score;
        let is_outlier = z_score > TT_OUTLIER_SIGMA
            || travel_time > stats.avg_travel_time * TT_OUTLIER_RATIO;

        if !is_outlier {
            stats.consecutive_outliers = 0;
            return None;
        }

        stats.outlier_count += 1;
        stats.consecutive_outliers += 1;

        if stats.consecutive_outliers < CONSECUTIVE_THRESHOLD {
            return None;
        }

        let severity =
            if stats.consecutive_outliers >= 5 { Severity::High } else { Severity::Medium };
        Some(DetectorAlert {
            kind: DetectorAlertKind::Congestion,
            severity,
            gantry_id: stats.gantry_id.clone(),
            position_km: stats.position_km,
            timestamp: tx.timestamp,
            description: format!(
                "{} consecutive travel-time outliers, tt={:.1}s vs mean {:.1}s",
                stats.consecutive_outliers, travel_time, stats.avg_travel_time
            ),
            confidence: (0.5 + stats.consecutive_outliers as f64 * 0.1).min(0.9),
            affected_lanes: vec![tx.lane],
        })
    }

    fn check_speed_anomaly(
        stats: &GantryStatistics,
        tx: &EtcTransaction,
    ) -> Option<DetectorAlert> {
        let speed_kmh = ms_to_kmh(tx.speed);
        if speed_kmh >= SPEED_ALERT_THRESHOLD_KMH || stats.recent_speeds_kmh.len() < 3 {
            return None;
        }
        let sustained = stats
            .recent_speeds_kmh
            .iter()
            .rev()
            .take(3)
            .all(|&s| s < SPEED_ALERT_THRESHOLD_KMH);
        if !sustained {
            return None;
        }
        Some(DetectorAlert {
            kind: DetectorAlertKind::SlowDown,
            severity: Severity::Low,
            gantry_id: stats.gantry_id.clone(),
            position_km: stats.position_km,
            timestamp: tx.timestamp,
            description: format!("sustained low crossing speed, now {:.1} km/h", speed_kmh),
            confidence: 0.6,
            affected_lanes: vec![tx.lane],
        })
    }

    /// Compares flow through two gantries over a trailing window. A
    /// downstream/upstream ratio under 0.5 suggests vehicles are held up
    /// between them.
    pub fn flow_imbalance(
        &self,
        upstream: &GantryId,
        downstream: &GantryId,
        window_s: f64,
    ) -> Option<DetectorAlert> {
        let downstream_stats = self.gantry_stats.get(downstream)?;
        self.gantry_stats.get(upstream)?;
        let now = self.transactions.last()?.timestamp;

        let count_in_window = |gantry: &GantryId| {
            self.transactions
                .iter()
                .filter(|t| &t.gantry_id == gantry && now - t.timestamp <= window_s)
                .count()
        };
        let upstream_count = count_in_window(upstream);
        let downstream_count = count_in_window(downstream);
        if upstream_count == 0 {
            return None;
        }

        let ratio = downstream_count as f64 / upstream_count as f64;
        if ratio >= FLOW_DROP_THRESHOLD {
            return None;
        }
        Some(DetectorAlert {
            kind: DetectorAlertKind::Incident,
            severity: Severity::High,
            gantry_id: downstream.clone(),
            position_km: downstream_stats.position_km,
            timestamp: now,
            description: format!(
                "flow imbalance: {} upstream vs {} downstream in {:.0}s",
                upstream_count, downstream_count, window_s
            ),
            confidence: 0.85,
            affected_lanes: Vec::new(),
        })
    }

    /// All transactions ingested so far, in arrival order.
    pub fn transactions(&self) -> &[EtcTransaction] {
        &self.transactions
    }

    /// All alerts raised so far, in firing order.
    pub fn alerts(&self) -> &[DetectorAlert] {
        &self.alerts
    }

    /// Alerts no older than `max_age` seconds relative to the last
    /// ingested transaction.
    pub fn recent_alerts(&self, max_age: f64) -> Vec<DetectorAlert> {
        let Some(now) = self.transactions.last().map(|t| t.timestamp) else {
            return Vec::new();
        };
        self.alerts
            .iter()
            .filter(|a| now - a.timestamp <= max_age)
            .cloned()
            .collect()
    }

    /// Snapshots of every gantry's statistics, in registration order.
    pub fn stats_snapshots(&self) -> IndexMap<GantryId, GantryStatsSnapshot> {
        self.gantry_stats
            .iter()
            .map(|(id, stats)| (id.clone(), stats.snapshot()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etc::transaction::TransactionStatus;

    fn tx(vehicle: VehicleId, gantry: &str, position_km: f64, time: f64, speed: f64) -> EtcTransaction {
        EtcTransaction::raw(vehicle, gantry.into(), position_km, time, 0, speed, TransactionStatus::Normal)
    }

    /// Pushes `count` vehicles through G02 then G04 with the given
    /// section travel time.
    fn warm_up(detector: &mut EtcDetector, count: u64, travel_time: f64) {
        for i in 0..count {
            let start = i as f64 * 10.0;
            detector.record_transaction(tx(i, "G02", 2.0, start, 28.0));
            detector.record_transaction(tx(i, "G04", 4.0, start + travel_time, 28.0));
        }
    }

    #[test]
    fn test_travel_time_outlier_needs_consecutive_hits() {
        let mut detector = EtcDetector::new();
        warm_up(&mut detector, 20, 70.0);

        // Three straggler vehicles in a row trip the congestion alert.
        let mut fired = None;
        for i in 0..3 {
            let vid = 100 + i;
            let start = 1000.0 + i as f64 * 10.0;
            detector.record_transaction(tx(vid, "G02", 2.0, start, 28.0));
            fired = detector.record_transaction(tx(vid, "G04", 4.0, start + 200.0, 28.0));
        }
        let alert = fired.expect("third consecutive outlier fires");
        assert_eq!(alert.kind, DetectorAlertKind::Congestion);
        assert_eq!(alert.severity, Severity::Medium);
        assert_eq!(alert.gantry_id, "G04");
    }

    #[test]
    fn test_outlier_streak_escalates_severity() {
        let mut detector = EtcDetector::new();
        warm_up(&mut detector, 20, 70.0);
        let mut last = None;
        for i in 0..6 {
            let vid = 100 + i;
            let start = 1000.0 + i as f64 * 10.0;
            detector.record_transaction(tx(vid, "G02", 2.0, start, 28.0));
            if let Some(alert) = detector.record_transaction(tx(vid, "G04", 4.0, start + 200.0, 28.0)) {
                last = Some(alert);
            }
        }
        assert_eq!(last.expect("alerts fired").severity, Severity::High);
    }

    #[test]
    fn test_normal_crossing_resets_streak() {
        let mut detector = EtcDetector::new();
        warm_up(&mut detector, 20, 70.0);
        for i in 0..2 {
            let vid = 100 + i;
            let start = 1000.0 + i as f64 * 10.0;
            detector.record_transaction(tx(vid, "G02", 2.0, start, 28.0));
            assert!(detector.record_transaction(tx(vid, "G04", 4.0, start + 200.0, 28.0)).is_none());
        }
        // One healthy vehicle breaks the streak.
        detector.record_transaction(tx(300, "G02", 2.0, 1100.0, 28.0));
        detector.record_transaction(tx(300, "G04", 4.0, 1170.0, 28.0));
        // The next outlier starts from zero again.
        detector.record_transaction(tx(301, "G02", 2.0, 1200.0, 28.0));
        assert!(detector.record_transaction(tx(301, "G04", 4.0, 1400.0, 28.0)).is_none());
    }

    #[test]
    fn test_sustained_low_speed_alert() {
        let mut detector = EtcDetector::new();
        let mut alert = None;
        for i in 0..3 {
            alert = detector.record_transaction(tx(i, "G06", 6.0, 100.0 + i as f64, 5.0));
        }
        let alert = alert.expect("three slow crossings in a row");
        assert_eq!(alert.kind, DetectorAlertKind::SlowDown);
        assert_eq!(alert.severity, Severity::Low);
    }

    #[test]
    fn test_flow_imbalance() {
        let mut detector = EtcDetector::new();
        detector.register_gantry(&"G02".to_string(), 2.0);
        detector.register_gantry(&"G04".to_string(), 4.0);
        for i in 0..10 {
            detector.record_transaction(tx(i, "G02", 2.0, 100.0 + i as f64, 28.0));
        }
        detector.record_transaction(tx(0, "G04", 4.0, 115.0, 28.0));
        let alert = detector
            .flow_imbalance(&"G02".to_string(), &"G04".to_string(), 60.0)
            .expect("1/10 ratio is an incident");
        assert_eq!(alert.kind, DetectorAlertKind::Incident);
        assert_eq!(alert.gantry_id, "G04");
    }

    #[test]
    fn test_snapshot_reflects_ring() {
        let mut detector = EtcDetector::new();
        warm_up(&mut detector, 10, 70.0);
        let snapshots = detector.stats_snapshots();
        let g04 = &snapshots["G04"];
        assert_eq!(g04.sample_count, 10);
        assert!((g04.avg_travel_time - 70.0).abs() < 1e-9);
        assert!(g04.avg_speed_kmh > 0.0);
    }

    #[test]
    fn test_ring_is_bounded() {
        let mut detector = EtcDetector::new();
        warm_up(&mut detector, 200, 70.0);
        let snapshots = detector.stats_snapshots();
        assert_eq!(snapshots["G04"].sample_count, RING_CAPACITY);
    }
}
