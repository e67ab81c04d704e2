use crate::utils::sampling::sample_exponential;
use lazy_static::lazy_static;
use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Named flow shapes for the time-varying Poisson process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowMode {
    Uniform,
    PeakMorning,
    PeakEvening,
    PeakBoth,
    Night,
    Custom,
}

impl fmt::Display for FlowMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlowMode::Uniform => "uniform",
            FlowMode::PeakMorning => "peak_morning",
            FlowMode::PeakEvening => "peak_evening",
            FlowMode::PeakBoth => "peak_both",
            FlowMode::Night => "night",
            FlowMode::Custom => "custom",
        };
        write!(f, "{}", s)
    }
}

lazy_static! {
    /// Piecewise-linear rate multipliers per flow mode: `(time_s, rate)`
    /// control points, 1.0 meaning the base rate. Linearly interpolated
    /// between points, clamped at the ends.
    static ref FLOW_PROFILES: HashMap<FlowMode, Vec<(f64, f64)>> = {
        let mut profiles = HashMap::new();
        profiles.insert(FlowMode::Uniform, vec![(0.0, 1.0), (3600.0, 1.0)]);
        profiles.insert(
            FlowMode::PeakMorning,
            vec![
                (0.0, 0.3),
                (300.0, 0.5),
                (600.0, 1.2),
                (1200.0, 1.8),
                (1800.0, 1.5),
                (2400.0, 0.8),
                (3000.0, 0.5),
                (3600.0, 0.3),
            ],
        );
        profiles.insert(
            FlowMode::PeakEvening,
            vec![
                (0.0, 0.5),
                (600.0, 0.4),
                (1200.0, 0.6),
                (1800.0, 1.2),
                (2400.0, 1.8),
                (3000.0, 1.5),
                (3600.0, 0.5),
            ],
        );
        profiles.insert(
            FlowMode::PeakBoth,
            vec![
                (0.0, 0.3),
                (300.0, 0.8),
                (600.0, 1.5),
                (900.0, 1.8),
                (1200.0, 1.2),
                (1500.0, 0.6),
                (1800.0, 0.5),
                (2100.0, 0.8),
                (2400.0, 1.5),
                (2700.0, 1.8),
                (3000.0, 1.2),
                (3300.0, 0.6),
                (3600.0, 0.3),
            ],
        );
        profiles.insert(FlowMode::Night, vec![(0.0, 0.2), (1800.0, 0.15), (3600.0, 0.1)]);
        profiles
    };
}

/// Per-spawn metadata, aligned by index with the schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpawnMeta {
    pub is_platoon: bool,
    pub platoon_id: u32,
    pub platoon_position: u32,
}

impl Default for SpawnMeta {
    fn default() -> Self {
        SpawnMeta { is_platoon: false, platoon_id: 0, platoon_position: 0 }
    }
}

/// Aggregate view of a generated schedule.
#[derive(Debug, Clone, Serialize)]
pub struct SpawnStatistics {
    pub total_vehicles: usize,
    pub duration_s: f64,
    pub avg_rate_per_min: f64,
    pub flow_mode: FlowMode,
    pub platoon_vehicles: usize,
    pub platoon_ratio: f64,
}

/// Vehicle spawner: turns a flow profile into a concrete entry-time
/// schedule via a non-homogeneous Poisson process.
///
/// The base rate is calibrated so the integral of the profile over its
/// span yields `total_vehicles`; a top-up pass guarantees the exact
/// count even for profiles that tail off. Platoons insert bursts of 3-6
/// vehicles with sub-2-second headways.
///
/// # Example
/// ```rust
/// use etc_traffic_sim_core::spawner::{FlowMode, VehicleSpawner};
/// use rand::SeedableRng;
/// use rand::rngs::StdRng;
///
/// let mut rng = StdRng::seed_from_u64(42);
/// let spawner = VehicleSpawner::new(100, 4)
///     .with_flow_mode(FlowMode::Uniform)
///     .build(&mut rng);
/// assert_eq!(spawner.spawn_times().len(), 100);
/// ```
#[derive(Debug)]
pub struct VehicleSpawner {
    total_vehicles: usize,
    num_lanes: usize,
    flow_mode: FlowMode,
    profile: Vec<(f64, f64)>,
    platoon_probability: f64,
    platoon_size: (u32, u32),
    schedule: Vec<f64>,
    metadata: Vec<SpawnMeta>,
}

impl VehicleSpawner {
    /// Starts a builder for a spawner targeting `total_vehicles` entries
    /// on a road with `num_lanes` lanes.
    pub fn new(total_vehicles: usize, num_lanes: usize) -> VehicleSpawnerBuilder {
        VehicleSpawnerBuilder {
            spawner: VehicleSpawner {
                total_vehicles,
                num_lanes,
                flow_mode: FlowMode::Uniform,
                profile: FLOW_PROFILES[&FlowMode::Uniform].clone(),
                platoon_probability: 0.15,
                platoon_size: (3, 6),
                schedule: Vec::new(),
                metadata: Vec::new(),
            },
        }
    }

    /// The generated schedule, non-decreasing.
    pub fn spawn_times(&self) -> &[f64] {
        &self.schedule
    }

    /// Metadata for the spawn at `index`.
    pub fn meta(&self, index: usize) -> SpawnMeta {
        self.metadata.get(index).copied().unwrap_or_default()
    }

    /// Number of lanes vehicles may be placed into.
    pub fn num_lanes(&self) -> usize {
        self.num_lanes
    }

    /// Spawns still scheduled after `current_time`.
    pub fn remaining_count(&self, current_time: f64) -> usize {
        let first = self.schedule.partition_point(|&t| t <= current_time);
        self.schedule.len() - first
    }

    /// Rate multiplier at time `t` (piecewise-linear interpolation).
    pub fn flow_rate_at(&self, t: f64) -> f64 {
        let profile = &self.profile;
        if profile.is_empty() {
            return 1.0;
        }
        if t <= profile[0].0 {
            return profile[0].1;
        }
        if t >= profile[profile.len() - 1].0 {
            return profile[profile.len() - 1].1;
        }
        for window in profile.windows(2) {
            let (t0, r0) = window[0];
            let (t1, r1) = window[1];
            if t >= t0 && t < t1 {
                let ratio = (t - t0) / (t1 - t0);
                return r0 + ratio * (r1 - r0);
            }
        }
        1.0
    }

    /// Aggregate statistics of the generated schedule.
    pub fn statistics(&self) -> SpawnStatistics {
        let total = self.schedule.len();
        let duration = if total > 1 {
            self.schedule[total - 1] - self.schedule[0]
        } else {
            1.0
        };
        let platoon_vehicles = self.metadata.iter().filter(|m| m.is_platoon).count();
        SpawnStatistics {
            total_vehicles: total,
            duration_s: duration,
            avg_rate_per_min: if duration > 0.0 { total as f64 / duration * 60.0 } else { 0.0 },
            flow_mode: self.flow_mode,
            platoon_vehicles,
            platoon_ratio: if total > 0 { platoon_vehicles as f64 / total as f64 } else { 0.0 },
        }
    }

    fn generate_schedule(&mut self, rng: &mut StdRng) {
        let span = self.profile.last().map(|&(t, _)| t).filter(|&t| t > 0.0).unwrap_or(3600.0);

        // Calibrate the base rate so the profile integral matches the
        // target count.
        let sample_dt = 10.0;
        let mut integral = 0.0;
        let mut t = 0.0;
        while t < span {
            integral += self.flow_rate_at(t) * sample_dt;
            t += sample_dt;
        }
        if integral <= 0.0 {
            integral = span;
        }
        let base_rate = self.total_vehicles as f64 / integral;

        let mut generated = 0usize;
        let mut platoon_id = 0u32;
        let mut clock = 0.0;

        while generated < self.total_vehicles && clock < span * 1.5 {
            let rate = (self.flow_rate_at(clock) * base_rate).max(0.01);
            clock += sample_exponential(rng, rate);
            if clock > span * 1.5 {
                break;
            }

            if rng.random::<f64>() < self.platoon_probability
                && generated + 3 < self.total_vehicles
            {
                platoon_id += 1;
                let size = rng
                    .random_range(self.platoon_size.0..=self.platoon_size.1)
                    .min((self.total_vehicles - generated) as u32);
                for position in 0..size {
                    if generated >= self.total_vehicles {
                        break;
                    }
                    let headway: f64 = rng.random_range(0.5..2.0);
                    self.schedule.push(clock + position as f64 * headway);
                    self.metadata.push(SpawnMeta {
                        is_platoon: true,
                        platoon_id,
                        platoon_position: position,
                    });
                    generated += 1;
                }
                clock += size as f64 * 1.5;
            } else {
                self.schedule.push(clock);
                self.metadata.push(SpawnMeta::default());
                generated += 1;
            }
        }

        // Top up to the exact count when the profile tails off early.
        while generated < self.total_vehicles {
            clock += rng.random_range(1.0..5.0);
            self.schedule.push(clock);
            self.metadata.push(SpawnMeta::default());
            generated += 1;
        }

        self.schedule.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    }
}

/// Builder for [`VehicleSpawner`].
pub struct VehicleSpawnerBuilder {
    spawner: VehicleSpawner,
}

impl VehicleSpawnerBuilder {
    /// Selects a named flow profile.
    pub fn with_flow_mode(mut self, mode: FlowMode) -> Self {
        if mode != FlowMode::Custom {
            if let Some(profile) = FLOW_PROFILES.get(&mode) {
                self.spawner.flow_mode = mode;
                self.spawner.profile = profile.clone();
            }
        }
        self
    }

    /// Installs a custom `(time_s, rate)` curve; points are sorted by time.
    pub fn with_custom_profile(mut self, mut profile: Vec<(f64, f64)>) -> Self {
        if !profile.is_empty() {
            profile.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
            self.spawner.flow_mode = FlowMode::Custom;
            self.spawner.profile = profile;
        }
        self
    }

    /// Tunes platoon clustering.
    pub fn with_platoons(mut self, probability: f64, size: (u32, u32)) -> Self {
        self.spawner.platoon_probability = probability.clamp(0.0, 1.0);
        if size.0 >= 1 && size.1 >= size.0 {
            self.spawner.platoon_size = size;
        }
        self
    }

    /// Generates the schedule from the seeded generator and finishes.
    pub fn build(mut self, rng: &mut StdRng) -> VehicleSpawner {
        self.spawner.generate_schedule(rng);
        self.spawner
    }
}
