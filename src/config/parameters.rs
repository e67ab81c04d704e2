use crate::etc::noise::NoiseConfig;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Structural configuration errors. Raised at engine construction;
/// a run never starts from an invalid record.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Lane count must be at least one
    InvalidLaneCount(usize),
    /// Road or segment geometry is degenerate
    InvalidGeometry { field: &'static str, value: f64 },
    /// Time step or horizon is non-positive
    InvalidTiming { field: &'static str, value: f64 },
    /// A probability or ratio is outside [0, 1]
    InvalidProbability { field: &'static str, value: f64 },
    /// No vehicles to simulate
    NoVehicles,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidLaneCount(n) => {
                write!(f, "Number of lanes must be >= 1, got {}", n)
            }
            ConfigError::InvalidGeometry { field, value } => {
                write!(f, "Geometry field '{}' must be positive, got {}", field, value)
            }
            ConfigError::InvalidTiming { field, value } => {
                write!(f, "Timing field '{}' must be positive, got {}", field, value)
            }
            ConfigError::InvalidProbability { field, value } => {
                write!(f, "Probability field '{}' must be within [0, 1], got {}", field, value)
            }
            ConfigError::NoVehicles => {
                write!(f, "Total vehicles must be greater than zero")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Weather tag carried into the alert context. The core does not model
/// weather physics; the tag exists so rules can scope on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Weather {
    #[default]
    Clear,
    Rain,
    Fog,
    Snow,
}

impl fmt::Display for Weather {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Weather::Clear => "clear",
            Weather::Rain => "rain",
            Weather::Fog => "fog",
            Weather::Snow => "snow",
        };
        write!(f, "{}", s)
    }
}

/// Simulation configuration record.
///
/// Every recognized option with its default. Serializes to flat JSON so
/// saved run documents embed the exact configuration they were produced
/// with.
///
/// # Example
/// ```rust
/// use etc_traffic_sim_core::config::SimulationConfig;
///
/// let mut config = SimulationConfig::default();
/// config.total_vehicles = 200;
/// config.anomaly_ratio = 0.0;
/// assert!(config.validate().is_ok());
/// assert_eq!(config.num_segments(), 10);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    // Road geometry
    pub road_length_km: f64,
    pub segment_length_km: f64,
    pub num_lanes: usize,
    pub lane_width: f64,

    // Run horizon
    pub total_vehicles: usize,
    pub simulation_dt: f64,
    pub max_simulation_time: f64,

    // Anomaly injection
    pub anomaly_ratio: f64,
    pub global_anomaly_start: f64,
    pub vehicle_safe_run_time: f64,

    // Lane changing
    pub forced_change_dist: f64,
    pub lane_change_gap: f64,
    pub lane_change_max_retries: u32,
    pub lane_change_retry_interval: f64,

    // Impact marking
    pub impact_threshold: f64,
    pub impact_speed_ratio: f64,
    pub impact_discover_dist: f64,

    // Adjacent-lane coupling
    pub lane_coupling_dist: f64,
    pub lane_coupling_factor: f64,

    // Queue detection
    pub queue_speed_threshold: f64,
    pub queue_min_vehicles: usize,
    pub queue_dissipation_rate: f64,

    // Phantom jam detection
    pub phantom_jam_speed: f64,
    pub phantom_jam_dist: f64,

    // Phase analysis
    pub phase_critical_density: f64,
    pub phase_transition_threshold: f64,

    // ETC noise stage
    pub noise: NoiseConfig,

    // Environment
    pub weather: Weather,

    // Reproducibility
    pub random_seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            road_length_km: 20.0,
            segment_length_km: 2.0,
            num_lanes: 4,
            lane_width: 3.5,
            total_vehicles: 1200,
            simulation_dt: 1.0,
            max_simulation_time: 3900.0,
            anomaly_ratio: 0.01,
            global_anomaly_start: 200.0,
            vehicle_safe_run_time: 200.0,
            forced_change_dist: 400.0,
            lane_change_gap: 25.0,
            lane_change_max_retries: 5,
            lane_change_retry_interval: 1.0,
            impact_threshold: 0.90,
            impact_speed_ratio: 0.70,
            impact_discover_dist: 150.0,
            lane_coupling_dist: 50.0,
            lane_coupling_factor: 0.01,
            queue_speed_threshold: 15.0,
            queue_min_vehicles: 3,
            queue_dissipation_rate: 0.8,
            phantom_jam_speed: 30.0,
            phantom_jam_dist: 200.0,
            phase_critical_density: 35.0,
            phase_transition_threshold: 5.0,
            noise: NoiseConfig::default(),
            weather: Weather::Clear,
            random_seed: 42,
        }
    }
}

impl SimulationConfig {
    /// Number of flow-aggregation segments along the road.
    pub fn num_segments(&self) -> usize {
        (self.road_length_km / self.segment_length_km) as usize
    }

    /// Segment length in meters.
    pub fn segment_length_m(&self) -> f64 {
        self.segment_length_km * 1000.0
    }

    /// Road length in meters.
    pub fn road_length_m(&self) -> f64 {
        self.road_length_km * 1000.0
    }

    /// Validates the record. Returns the first structural error found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_lanes < 1 {
            return Err(ConfigError::InvalidLaneCount(self.num_lanes));
        }
        if self.road_length_km <= 0.0 {
            return Err(ConfigError::InvalidGeometry {
                field: "road_length_km",
                value: self.road_length_km,
            });
        }
        if self.segment_length_km <= 0.0 {
            return Err(ConfigError::InvalidGeometry {
                field: "segment_length_km",
                value: self.segment_length_km,
            });
        }
        if self.lane_width <= 0.0 {
            return Err(ConfigError::InvalidGeometry {
                field: "lane_width",
                value: self.lane_width,
            });
        }
        if self.simulation_dt <= 0.0 {
            return Err(ConfigError::InvalidTiming {
                field: "simulation_dt",
                value: self.simulation_dt,
            });
        }
        if self.max_simulation_time <= 0.0 {
            return Err(ConfigError::InvalidTiming {
                field: "max_simulation_time",
                value: self.max_simulation_time,
            });
        }
        if self.total_vehicles == 0 {
            return Err(ConfigError::NoVehicles);
        }
        for (field, value) in [
            ("anomaly_ratio", self.anomaly_ratio),
            ("impact_threshold", self.impact_threshold),
            ("impact_speed_ratio", self.impact_speed_ratio),
            ("queue_dissipation_rate", self.queue_dissipation_rate),
            ("noise.missed_read_rate", self.noise.missed_read_rate),
            ("noise.duplicate_read_rate", self.noise.duplicate_read_rate),
            ("noise.delayed_upload_rate", self.noise.delayed_upload_rate),
            ("noise.clock_drift_rate", self.noise.clock_drift_rate),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidProbability { field, value });
            }
        }
        Ok(())
    }

    /// Serializes the record to a JSON value.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Deserializes a record from JSON, falling back to defaults for
    /// unknown or missing options.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}
