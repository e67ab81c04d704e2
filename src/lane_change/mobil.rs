use crate::car_following::idm;
use crate::config::SimulationConfig;
use crate::vehicles::anomaly::AnomalyType;
use crate::vehicles::vehicle::NeighborView;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Positions of active full-stop anomalies, keyed by lane. Consulted by
/// the feasibility check so nobody changes into a blocked stretch.
pub type BlockedLanes = HashMap<usize, Vec<f64>>;

/// Longitudinal exclusion range around a blocking vehicle, meters.
const BLOCK_RANGE: f64 = 100.0;

/// Why a lane change was initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaneChangeReason {
    /// Discretionary change that won the MOBIL utility comparison
    Free,
    /// Escape from behind a stopped obstacle, feasibility-gated only
    Forced,
}

impl fmt::Display for LaneChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LaneChangeReason::Free => "free",
            LaneChangeReason::Forced => "forced",
        };
        write!(f, "{}", s)
    }
}

/// Nearest vehicle ahead of the focal position in the given lane.
pub fn find_leader_in_lane(
    focal: &NeighborView,
    lane: usize,
    neighbors: &[NeighborView],
) -> Option<NeighborView> {
    let mut best: Option<NeighborView> = None;
    for other in neighbors {
        if other.id == focal.id || other.lane != lane || other.pos <= focal.pos {
            continue;
        }
        if best.is_none_or(|b| other.pos < b.pos) {
            best = Some(*other);
        }
    }
    best
}

/// Nearest vehicle behind the focal position in the given lane.
pub fn find_follower_in_lane(
    focal: &NeighborView,
    lane: usize,
    neighbors: &[NeighborView],
) -> Option<NeighborView> {
    let mut best: Option<NeighborView> = None;
    for other in neighbors {
        if other.id == focal.id || other.lane != lane || other.pos >= focal.pos {
            continue;
        }
        if best.is_none_or(|b| other.pos > b.pos) {
            best = Some(*other);
        }
    }
    best
}

/// MOBIL lane-change decision for the focal vehicle.
///
/// A leader that is an active full stop within `forced_change_dist`
/// short-circuits into the forced path, where only feasibility gates the
/// change. Otherwise each existing adjacent lane is scored with the MOBIL
/// utility
/// `ΔA = a_new − a_current − politeness · (a_follower_new − a_follower_current)`
/// and must beat the politeness-adjusted threshold
/// `0.1 + 0.4 · (1 − politeness)`. The best candidate wins.
pub fn decide(
    focal: &NeighborView,
    neighbors: &[NeighborView],
    blocked: &BlockedLanes,
    politeness: f64,
    config: &SimulationConfig,
) -> Option<(usize, LaneChangeReason)> {
    let leader = find_leader_in_lane(focal, focal.lane, neighbors);

    if let Some(l) = leader {
        if l.anomaly_kind == AnomalyType::FullStop && l.pos - focal.pos < config.forced_change_dist
        {
            if let Some(lane) = forced_change(focal, neighbors, blocked, config) {
                return Some((lane, LaneChangeReason::Forced));
            }
            return None;
        }
    }

    let threshold = 0.1 + 0.4 * (1.0 - politeness);
    let mut best: Option<(usize, f64)> = None;

    for candidate in adjacent_lanes(focal.lane, config.num_lanes) {
        if !is_feasible(focal, candidate, neighbors, blocked, config.lane_change_gap) {
            continue;
        }
        let gain = lane_gain(focal, candidate, leader.as_ref(), neighbors, politeness);
        if gain > threshold && best.is_none_or(|(_, g)| gain > g) {
            best = Some((candidate, gain));
        }
    }

    best.map(|(lane, _)| (lane, LaneChangeReason::Free))
}

/// Existing adjacent lanes, lower index first.
fn adjacent_lanes(lane: usize, num_lanes: usize) -> Vec<usize> {
    let mut lanes = Vec::with_capacity(2);
    if lane > 0 {
        lanes.push(lane - 1);
    }
    if lane + 1 < num_lanes {
        lanes.push(lane + 1);
    }
    lanes
}

/// Physical feasibility: the target lane is not blocked near the focal
/// position and no vehicle there sits inside the minimum gap.
fn is_feasible(
    focal: &NeighborView,
    target_lane: usize,
    neighbors: &[NeighborView],
    blocked: &BlockedLanes,
    min_gap: f64,
) -> bool {
    if let Some(positions) = blocked.get(&target_lane) {
        if positions.iter().any(|pos| (pos - focal.pos).abs() < BLOCK_RANGE) {
            return false;
        }
    }
    for other in neighbors {
        if other.id == focal.id || other.lane != target_lane {
            continue;
        }
        if (other.pos - focal.pos).abs() < min_gap {
            return false;
        }
    }
    true
}

/// MOBIL utility of moving into `target_lane`:
/// `ΔA = a_new − a_current − politeness · (a_follower_new − a_follower_current)`.
pub fn lane_gain(
    focal: &NeighborView,
    target_lane: usize,
    current_leader: Option<&NeighborView>,
    neighbors: &[NeighborView],
    politeness: f64,
) -> f64 {
    let a_current = idm::idm_acceleration(focal, current_leader, focal.speed);

    let new_leader = find_leader_in_lane(focal, target_lane, neighbors);
    let a_new = idm::idm_acceleration(focal, new_leader.as_ref(), focal.speed);

    let mut follower_term = 0.0;
    if let Some(follower) = find_follower_in_lane(focal, target_lane, neighbors) {
        // Follower's acceleration before the change (toward its current
        // leader in the target lane) and after (toward the focal vehicle).
        let follower_leader = find_leader_in_lane(&follower, target_lane, neighbors);
        let a_follower_current =
            idm::idm_acceleration(&follower, follower_leader.as_ref(), follower.speed);
        let a_follower_new = idm::idm_acceleration(&follower, Some(focal), follower.speed);
        follower_term = politeness * (a_follower_new - a_follower_current);
    }

    a_new - a_current - follower_term
}

/// Forced escape: the first adjacent lane that passes feasibility wins.
fn forced_change(
    focal: &NeighborView,
    neighbors: &[NeighborView],
    blocked: &BlockedLanes,
    config: &SimulationConfig,
) -> Option<usize> {
    adjacent_lanes(focal.lane, config.num_lanes)
        .into_iter()
        .find(|&lane| is_feasible(focal, lane, neighbors, blocked, config.lane_change_gap))
}
