use crate::config::SimulationConfig;
use serde::{Deserialize, Serialize};

/// Gantry identifier, e.g. `"G04"` for the gantry at kilometer 4.
pub type GantryId = String;

/// Half-width of the crossing window around a gantry, in kilometers.
/// A vehicle is considered crossing in the tick its position first
/// enters `[position_km - 0.05, position_km + 0.05)`.
pub const CROSSING_WINDOW_KM: f64 = 0.05;

/// A roadside ETC sensor at a fixed position along the road.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gantry {
    /// Unique gantry identifier
    pub id: GantryId,
    /// Position along the road in kilometers
    pub position_km: f64,
}

impl Gantry {
    /// Creates a gantry with the canonical id for its position.
    pub fn at_km(position_km: f64) -> Self {
        Gantry {
            id: format!("G{:02}", position_km as i64),
            position_km,
        }
    }

    /// Whether a vehicle at `pos_km` is inside this gantry's crossing window.
    pub fn in_crossing_window(&self, pos_km: f64) -> bool {
        pos_km >= self.position_km - CROSSING_WINDOW_KM
            && pos_km < self.position_km + CROSSING_WINDOW_KM
    }
}

/// The simulated road: a straight multi-lane carriageway with
/// fixed-length segments and a set of ETC gantries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Road {
    pub length_km: f64,
    pub segment_length_km: f64,
    pub num_lanes: usize,
    pub lane_width: f64,
    gantries: Vec<Gantry>,
}

impl Road {
    /// Builds the road described by the configuration, placing the
    /// default gantry layout: one every 2 km starting at kilometer 2.
    pub fn from_config(config: &SimulationConfig) -> Self {
        let mut road = Road {
            length_km: config.road_length_km,
            segment_length_km: config.segment_length_km,
            num_lanes: config.num_lanes,
            lane_width: config.lane_width,
            gantries: Vec::new(),
        };
        let mut km = 2;
        while (km as f64) < config.road_length_km {
            road.add_gantry(Gantry::at_km(km as f64));
            km += 2;
        }
        road
    }

    /// Adds a gantry, keeping the list ordered by position.
    pub fn add_gantry(&mut self, gantry: Gantry) {
        self.gantries.push(gantry);
        self.gantries
            .sort_by(|a, b| a.position_km.partial_cmp(&b.position_km).unwrap_or(std::cmp::Ordering::Equal));
    }

    /// All gantries, ordered by position.
    pub fn gantries(&self) -> &[Gantry] {
        &self.gantries
    }

    /// Number of flow-aggregation segments.
    pub fn num_segments(&self) -> usize {
        (self.length_km / self.segment_length_km) as usize
    }

    /// Segment length in meters.
    pub fn segment_length_m(&self) -> f64 {
        self.segment_length_km * 1000.0
    }

    /// Road length in meters.
    pub fn length_m(&self) -> f64 {
        self.length_km * 1000.0
    }

    /// Segment index for a longitudinal position in meters.
    /// Positions past the end map past the terminal segment.
    pub fn segment_index(&self, pos_m: f64) -> usize {
        if pos_m <= 0.0 {
            return 0;
        }
        (pos_m / self.segment_length_m()) as usize
    }

    /// Whether the segment index is past the end of the road.
    pub fn is_terminal(&self, segment_idx: usize) -> bool {
        segment_idx >= self.num_segments()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_gantry_layout() {
        let road = Road::from_config(&SimulationConfig::default());
        let positions: Vec<f64> = road.gantries().iter().map(|g| g.position_km).collect();
        assert_eq!(positions, vec![2.0, 4.0, 6.0, 8.0, 10.0, 12.0, 14.0, 16.0, 18.0]);
        assert_eq!(road.gantries()[0].id, "G02");
        assert_eq!(road.gantries()[8].id, "G18");
    }

    #[test]
    fn test_segment_index() {
        let road = Road::from_config(&SimulationConfig::default());
        assert_eq!(road.segment_index(0.0), 0);
        assert_eq!(road.segment_index(1999.9), 0);
        assert_eq!(road.segment_index(2000.0), 1);
        assert_eq!(road.segment_index(19_999.0), 9);
        assert!(road.is_terminal(road.segment_index(20_000.0)));
        assert!(!road.is_terminal(9));
    }

    #[test]
    fn test_crossing_window() {
        let gantry = Gantry::at_km(4.0);
        assert!(gantry.in_crossing_window(3.96));
        assert!(gantry.in_crossing_window(4.0));
        assert!(!gantry.in_crossing_window(4.05));
        assert!(!gantry.in_crossing_window(3.94));
    }

    #[test]
    fn test_negative_position_clamps_to_first_segment() {
        let road = Road::from_config(&SimulationConfig::default());
        assert_eq!(road.segment_index(-5.0), 0);
    }
}
