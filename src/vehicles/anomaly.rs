use crate::config::SimulationConfig;
use crate::utils::units::{kmh_to_ms, ms_to_kmh};
use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Injected driver misbehavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    /// No anomaly assigned
    #[default]
    None,
    /// Vehicle brakes to a complete stop and stays stopped
    FullStop,
    /// Short speed fluctuation (10 s)
    ShortFluctuation,
    /// Long speed fluctuation (20 s)
    LongFluctuation,
}

impl AnomalyType {
    /// Numeric code used in the trace (0..=3).
    pub fn code(&self) -> u8 {
        match self {
            AnomalyType::None => 0,
            AnomalyType::FullStop => 1,
            AnomalyType::ShortFluctuation => 2,
            AnomalyType::LongFluctuation => 3,
        }
    }

    /// Whether this is one of the fluctuation types that can re-activate.
    pub fn is_fluctuation(&self) -> bool {
        matches!(self, AnomalyType::ShortFluctuation | AnomalyType::LongFluctuation)
    }
}

impl fmt::Display for AnomalyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AnomalyType::None => "none",
            AnomalyType::FullStop => "full_stop",
            AnomalyType::ShortFluctuation => "short_fluctuation",
            AnomalyType::LongFluctuation => "long_fluctuation",
        };
        write!(f, "{}", s)
    }
}

/// Phase of the per-vehicle anomaly state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyPhase {
    #[default]
    Normal,
    Active,
    Cooling,
}

impl fmt::Display for AnomalyPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AnomalyPhase::Normal => "normal",
            AnomalyPhase::Active => "active",
            AnomalyPhase::Cooling => "cooling",
        };
        write!(f, "{}", s)
    }
}

/// Emitted once per activation, in tick order, before any trajectory
/// point of the same tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyLogEntry {
    pub vehicle_id: u64,
    #[serde(rename = "type")]
    pub anomaly_type: u8,
    pub time: f64,
    pub pos_km: f64,
    pub segment: usize,
    pub min_speed_kmh: f64,
}

/// Residency of the cooling phase, in ticks.
const COOLING_TICKS: i64 = 1000;
/// Re-activation coin for vehicles with a prior fluctuation anomaly.
const REACTIVATION_PROBABILITY: f64 = 0.3;
/// Upper bound of the fluctuation target-speed draw, km/h.
const FLUCTUATION_SPEED_CAP_KMH: f64 = 40.0;

/// Per-vehicle anomaly sub-state, owned by the vehicle and driven by the
/// engine clock.
///
/// Transitions: `normal → active` via the per-tick activation coin,
/// `active → cooling` on timer expiry (fluctuation types only),
/// `cooling → normal` after the cooling residency. A full stop stays
/// active until the vehicle leaves the road.
#[derive(Debug, Clone)]
pub struct AnomalyState {
    /// Flagged at spawn; non-potential vehicles never activate
    pub is_potential: bool,
    pub kind: AnomalyType,
    pub phase: AnomalyPhase,
    /// Remaining active time in seconds; infinite for a full stop
    pub timer: f64,
    cooling_ticks: i64,
    /// Clock of the most recent activation
    pub trigger_time: Option<f64>,
    /// Speed override in m/s while active
    pub target_speed: f64,
}

impl AnomalyState {
    pub fn new(is_potential: bool) -> Self {
        AnomalyState {
            is_potential,
            kind: AnomalyType::None,
            phase: AnomalyPhase::Normal,
            timer: 0.0,
            cooling_ticks: 0,
            trigger_time: None,
            target_speed: 0.0,
        }
    }

    /// Whether the anomaly is currently active.
    pub fn is_active(&self) -> bool {
        self.phase == AnomalyPhase::Active
    }

    /// Whether this vehicle is an active full stop (a road blocker).
    pub fn is_full_stop_active(&self) -> bool {
        self.kind == AnomalyType::FullStop && self.phase == AnomalyPhase::Active
    }

    /// Runs one tick of the activation side of the state machine.
    ///
    /// Handles the cooling countdown and the activation coin. Returns a
    /// log entry exactly when an activation happens this tick.
    pub fn try_trigger(
        &mut self,
        vehicle_id: u64,
        clock: f64,
        entry_time: f64,
        pos_m: f64,
        segment: usize,
        config: &SimulationConfig,
        rng: &mut StdRng,
    ) -> Option<AnomalyLogEntry> {
        if !self.is_potential || self.phase == AnomalyPhase::Active {
            return None;
        }

        if self.phase == AnomalyPhase::Cooling {
            self.cooling_ticks -= 1;
            if self.cooling_ticks <= 0 {
                self.phase = AnomalyPhase::Normal;
            }
            return None;
        }

        if clock < config.global_anomaly_start {
            return None;
        }
        if clock - entry_time < config.vehicle_safe_run_time {
            return None;
        }

        let triggered = match self.kind {
            AnomalyType::None => {
                if rng.random::<f64>() < 0.5 * config.anomaly_ratio {
                    self.kind = Self::sample_kind(rng);
                    true
                } else {
                    false
                }
            }
            kind if kind.is_fluctuation() => rng.random::<f64>() < REACTIVATION_PROBABILITY,
            _ => false,
        };

        if triggered {
            Some(self.activate(vehicle_id, clock, pos_m, segment, rng))
        } else {
            None
        }
    }

    /// Forces an activation of the given kind, regardless of the
    /// preconditions. Used to inject scripted incidents into a run.
    pub fn force_activate(
        &mut self,
        vehicle_id: u64,
        kind: AnomalyType,
        clock: f64,
        pos_m: f64,
        segment: usize,
        rng: &mut StdRng,
    ) -> Option<AnomalyLogEntry> {
        if kind == AnomalyType::None {
            return None;
        }
        self.is_potential = true;
        self.kind = kind;
        Some(self.activate(vehicle_id, clock, pos_m, segment, rng))
    }

    fn sample_kind(rng: &mut StdRng) -> AnomalyType {
        let r: f64 = rng.random();
        if r < 1.0 / 3.0 {
            AnomalyType::FullStop
        } else if r < 2.0 / 3.0 {
            AnomalyType::ShortFluctuation
        } else {
            AnomalyType::LongFluctuation
        }
    }

    fn activate(
        &mut self,
        vehicle_id: u64,
        clock: f64,
        pos_m: f64,
        segment: usize,
        rng: &mut StdRng,
    ) -> AnomalyLogEntry {
        self.phase = AnomalyPhase::Active;
        self.trigger_time = Some(clock);
        match self.kind {
            AnomalyType::FullStop => {
                self.target_speed = 0.0;
                self.timer = f64::INFINITY;
            }
            AnomalyType::ShortFluctuation => {
                self.target_speed = kmh_to_ms(rng.random_range(0.0..FLUCTUATION_SPEED_CAP_KMH));
                self.timer = 10.0;
            }
            AnomalyType::LongFluctuation => {
                self.target_speed = kmh_to_ms(rng.random_range(0.0..FLUCTUATION_SPEED_CAP_KMH));
                self.timer = 20.0;
            }
            AnomalyType::None => unreachable!("activation with no anomaly kind"),
        }
        AnomalyLogEntry {
            vehicle_id,
            anomaly_type: self.kind.code(),
            time: clock,
            pos_km: pos_m / 1000.0,
            segment,
            min_speed_kmh: ms_to_kmh(self.target_speed),
        }
    }

    /// Advances the active timer by one tick. Fluctuation anomalies whose
    /// timer expires enter cooling; a full stop never expires. Returns
    /// `true` when a transition to cooling happened.
    pub fn tick_active(&mut self, dt: f64) -> bool {
        if self.phase != AnomalyPhase::Active {
            return false;
        }
        self.timer -= dt;
        if self.timer <= 0.0 && self.kind != AnomalyType::FullStop {
            self.phase = AnomalyPhase::Cooling;
            self.cooling_ticks = COOLING_TICKS;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn ready_config() -> SimulationConfig {
        let mut config = SimulationConfig::default();
        config.anomaly_ratio = 1.0;
        config
    }

    #[test]
    fn test_non_potential_never_triggers() {
        let mut rng = StdRng::seed_from_u64(42);
        let config = ready_config();
        let mut state = AnomalyState::new(false);
        for tick in 0..1000 {
            let clock = 500.0 + tick as f64;
            assert!(state.try_trigger(1, clock, 0.0, 100.0, 0, &config, &mut rng).is_none());
        }
    }

    #[test]
    fn test_no_trigger_before_global_start() {
        let mut rng = StdRng::seed_from_u64(42);
        let config = ready_config();
        let mut state = AnomalyState::new(true);
        assert!(state.try_trigger(1, 100.0, 0.0, 100.0, 0, &config, &mut rng).is_none());
    }

    #[test]
    fn test_no_trigger_during_safe_run_time() {
        let mut rng = StdRng::seed_from_u64(42);
        let config = ready_config();
        let mut state = AnomalyState::new(true);
        assert!(state.try_trigger(1, 300.0, 250.0, 100.0, 0, &config, &mut rng).is_none());
    }

    #[test]
    fn test_trigger_emits_log_once() {
        let mut rng = StdRng::seed_from_u64(42);
        let config = ready_config();
        let mut state = AnomalyState::new(true);
        // Activation coin is 0.5 with anomaly_ratio 1.0; a handful of
        // ticks is enough to see exactly one activation.
        let mut logs = 0;
        for tick in 0..64 {
            let clock = 500.0 + tick as f64;
            if let Some(log) = state.try_trigger(9, clock, 0.0, 4000.0, 2, &config, &mut rng) {
                logs += 1;
                assert_eq!(log.vehicle_id, 9);
                assert_eq!(log.segment, 2);
                assert!((log.pos_km - 4.0).abs() < 1e-9);
                assert!(log.anomaly_type >= 1 && log.anomaly_type <= 3);
            }
            if state.is_active() {
                break;
            }
        }
        assert_eq!(logs, 1);
        assert!(state.is_active());
    }

    #[test]
    fn test_full_stop_never_expires() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut state = AnomalyState::new(true);
        state.force_activate(1, AnomalyType::FullStop, 600.0, 5000.0, 2, &mut rng);
        for _ in 0..10_000 {
            assert!(!state.tick_active(1.0));
        }
        assert!(state.is_full_stop_active());
    }

    #[test]
    fn test_fluctuation_cools_then_returns_to_normal() {
        let mut rng = StdRng::seed_from_u64(42);
        let config = ready_config();
        let mut state = AnomalyState::new(true);
        state.force_activate(1, AnomalyType::ShortFluctuation, 600.0, 5000.0, 2, &mut rng);
        let mut cooled = false;
        for _ in 0..11 {
            if state.tick_active(1.0) {
                cooled = true;
                break;
            }
        }
        assert!(cooled, "short fluctuation must expire within its 10 s timer");
        assert_eq!(state.phase, AnomalyPhase::Cooling);
        // Cooling counts down through the trigger path.
        for tick in 0..1000 {
            let clock = 700.0 + tick as f64;
            state.try_trigger(1, clock, 0.0, 5000.0, 2, &config, &mut rng);
        }
        assert_eq!(state.phase, AnomalyPhase::Normal);
    }

    #[test]
    fn test_fluctuation_target_speed_bounds() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            let mut state = AnomalyState::new(true);
            state.force_activate(1, AnomalyType::LongFluctuation, 600.0, 0.0, 0, &mut rng);
            assert!(state.target_speed >= 0.0);
            assert!(state.target_speed < kmh_to_ms(40.0));
        }
    }
}
