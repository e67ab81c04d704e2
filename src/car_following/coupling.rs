use crate::vehicles::vehicle::NeighborView;

/// Adjacent-lane coupling: a slow vehicle one lane over drags the focal
/// vehicle's acceleration down a little, scaled by proximity.
///
/// Only neighbors exactly one lane away and within `coupling_dist`
/// meters longitudinally contribute, and only when they are slower than
/// 90% of the focal speed. The returned value is a (non-positive)
/// acceleration correction in m/s².
pub fn lateral_influence(
    focal: &NeighborView,
    neighbors: &[NeighborView],
    coupling_dist: f64,
    coupling_factor: f64,
) -> f64 {
    let mut influence = 0.0;
    for other in neighbors {
        if other.id == focal.id {
            continue;
        }
        if other.lane.abs_diff(focal.lane) != 1 {
            continue;
        }
        let dist = other.pos - focal.pos;
        if dist.abs() > coupling_dist {
            continue;
        }
        if other.speed < focal.speed * 0.9 {
            let dist_factor = 1.0 - dist.abs() / coupling_dist;
            let speed_diff = focal.speed - other.speed;
            influence -= coupling_factor * dist_factor * speed_diff * 10.0;
        }
    }
    influence
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vehicles::anomaly::{AnomalyPhase, AnomalyType};

    fn view(id: u64, lane: usize, pos: f64, speed: f64) -> NeighborView {
        NeighborView {
            id,
            lane,
            pos,
            speed,
            length: 4.5,
            v0: 33.3,
            a_max: 3.0,
            b_comfort: 3.5,
            s0: 2.0,
            time_headway: 1.5,
            delta: 4.0,
            aggressiveness: 1.0,
            anomaly_kind: AnomalyType::None,
            anomaly_phase: AnomalyPhase::Normal,
            anomaly_trigger_time: None,
        }
    }

    #[test]
    fn test_slow_adjacent_neighbor_drags() {
        let focal = view(0, 1, 100.0, 30.0);
        let slow = view(1, 2, 120.0, 5.0);
        let influence = lateral_influence(&focal, &[slow], 50.0, 0.01);
        assert!(influence < 0.0);
    }

    #[test]
    fn test_same_lane_neighbor_ignored() {
        let focal = view(0, 1, 100.0, 30.0);
        let same_lane = view(1, 1, 120.0, 5.0);
        assert_eq!(lateral_influence(&focal, &[same_lane], 50.0, 0.01), 0.0);
    }

    #[test]
    fn test_distant_neighbor_ignored() {
        let focal = view(0, 1, 100.0, 30.0);
        let far = view(1, 2, 200.0, 5.0);
        assert_eq!(lateral_influence(&focal, &[far], 50.0, 0.01), 0.0);
    }

    #[test]
    fn test_fast_neighbor_ignored() {
        let focal = view(0, 1, 100.0, 30.0);
        let fast = view(1, 2, 110.0, 29.0);
        assert_eq!(lateral_influence(&focal, &[fast], 50.0, 0.01), 0.0);
    }
}
