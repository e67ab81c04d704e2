use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Vehicle class sampled at spawn time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleClass {
    Car,
    Truck,
    Bus,
}

/// Physical parameter set attached to a vehicle class.
///
/// These feed directly into the car-following kernel: `v0_kmh` is the
/// class free-flow speed, `a_max`/`b_comfort` bound acceleration and
/// comfortable braking, `s0`/`time_headway` shape the desired gap and
/// `delta` is the free-flow exponent.
#[derive(Debug, Clone, Copy)]
pub struct ClassParams {
    pub weight: f64,
    pub v0_kmh: f64,
    pub a_max: f64,
    pub b_comfort: f64,
    pub s0: f64,
    pub time_headway: f64,
    pub delta: f64,
    pub length_m: f64,
    pub reaction_time: (f64, f64),
}

impl VehicleClass {
    const CATALOG: [(VehicleClass, ClassParams); 3] = [
        (
            VehicleClass::Car,
            ClassParams {
                weight: 0.60,
                v0_kmh: 120.0,
                a_max: 3.0,
                b_comfort: 3.5,
                s0: 2.0,
                time_headway: 1.5,
                delta: 4.0,
                length_m: 4.5,
                reaction_time: (0.8, 1.2),
            },
        ),
        (
            VehicleClass::Truck,
            ClassParams {
                weight: 0.25,
                v0_kmh: 100.0,
                a_max: 2.0,
                b_comfort: 2.5,
                s0: 2.5,
                time_headway: 1.8,
                delta: 4.0,
                length_m: 12.0,
                reaction_time: (1.0, 1.5),
            },
        ),
        (
            VehicleClass::Bus,
            ClassParams {
                weight: 0.15,
                v0_kmh: 90.0,
                a_max: 1.8,
                b_comfort: 2.2,
                s0: 2.2,
                time_headway: 1.6,
                delta: 4.0,
                length_m: 10.0,
                reaction_time: (0.9, 1.3),
            },
        ),
    ];

    /// Physical parameters of this class.
    pub fn params(&self) -> ClassParams {
        Self::CATALOG
            .iter()
            .find(|(class, _)| class == self)
            .map(|(_, params)| *params)
            .unwrap_or(Self::CATALOG[0].1)
    }

    /// Samples a class from the catalog weights (60/25/15).
    pub fn sample(rng: &mut StdRng) -> Self {
        let total: f64 = Self::CATALOG.iter().map(|(_, p)| p.weight).sum();
        let mut roll = rng.random::<f64>() * total;
        for (class, params) in Self::CATALOG {
            if roll < params.weight {
                return class;
            }
            roll -= params.weight;
        }
        VehicleClass::Car
    }
}

impl fmt::Display for VehicleClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VehicleClass::Car => "car",
            VehicleClass::Truck => "truck",
            VehicleClass::Bus => "bus",
        };
        write!(f, "{}", s)
    }
}

/// Driver style sampled at spawn time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverStyle {
    Aggressive,
    Normal,
    Conservative,
}

/// Behavioral parameter ranges attached to a driver style. Each vehicle
/// draws its concrete values uniformly from these ranges at spawn.
#[derive(Debug, Clone, Copy)]
pub struct StyleParams {
    pub weight: f64,
    pub politeness: (f64, f64),
    pub aggressiveness: (f64, f64),
    pub reaction_time_factor: (f64, f64),
}

impl DriverStyle {
    const CATALOG: [(DriverStyle, StyleParams); 3] = [
        (
            DriverStyle::Aggressive,
            StyleParams {
                weight: 0.20,
                politeness: (0.1, 0.3),
                aggressiveness: (1.1, 1.3),
                reaction_time_factor: (0.8, 1.0),
            },
        ),
        (
            DriverStyle::Normal,
            StyleParams {
                weight: 0.60,
                politeness: (0.4, 0.6),
                aggressiveness: (0.95, 1.05),
                reaction_time_factor: (1.0, 1.2),
            },
        ),
        (
            DriverStyle::Conservative,
            StyleParams {
                weight: 0.20,
                politeness: (0.6, 0.8),
                aggressiveness: (0.8, 0.95),
                reaction_time_factor: (1.2, 1.5),
            },
        ),
    ];

    /// Behavioral parameter ranges of this style.
    pub fn params(&self) -> StyleParams {
        Self::CATALOG
            .iter()
            .find(|(style, _)| style == self)
            .map(|(_, params)| *params)
            .unwrap_or(Self::CATALOG[1].1)
    }

    /// Samples a style from the catalog weights (20/60/20).
    pub fn sample(rng: &mut StdRng) -> Self {
        let total: f64 = Self::CATALOG.iter().map(|(_, p)| p.weight).sum();
        let mut roll = rng.random::<f64>() * total;
        for (style, params) in Self::CATALOG {
            if roll < params.weight {
                return style;
            }
            roll -= params.weight;
        }
        DriverStyle::Normal
    }
}

impl fmt::Display for DriverStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DriverStyle::Aggressive => "aggressive",
            DriverStyle::Normal => "normal",
            DriverStyle::Conservative => "conservative",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_class_params_lookup() {
        let truck = VehicleClass::Truck.params();
        assert_eq!(truck.v0_kmh, 100.0);
        assert_eq!(truck.length_m, 12.0);
    }

    #[test]
    fn test_sampling_matches_weights() {
        let mut rng = StdRng::seed_from_u64(42);
        let n = 10_000;
        let mut cars = 0;
        let mut trucks = 0;
        for _ in 0..n {
            match VehicleClass::sample(&mut rng) {
                VehicleClass::Car => cars += 1,
                VehicleClass::Truck => trucks += 1,
                VehicleClass::Bus => {}
            }
        }
        let car_ratio = cars as f64 / n as f64;
        let truck_ratio = trucks as f64 / n as f64;
        assert!((car_ratio - 0.60).abs() < 0.03, "car ratio {}", car_ratio);
        assert!((truck_ratio - 0.25).abs() < 0.03, "truck ratio {}", truck_ratio);
    }

    #[test]
    fn test_style_sampling_deterministic() {
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            assert_eq!(DriverStyle::sample(&mut a), DriverStyle::sample(&mut b));
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", VehicleClass::Bus), "bus");
        assert_eq!(format!("{}", DriverStyle::Conservative), "conservative");
    }
}
