use crate::vehicles::vehicle::NeighborView;

/// Hard lower bound on acceleration, m/s² (full emergency braking).
pub const MAX_BRAKING: f64 = -7.0;
/// Floor applied to the bumper-to-bumper gap, meters.
const GAP_FLOOR: f64 = 0.5;

/// Intelligent Driver Model acceleration for the focal vehicle.
///
/// Free flow without a leader, the full IDM interaction term with one,
/// and a staged distance-based braking profile when the leader is an
/// active full-stop anomaly. An emergency factor of 1.2 applies when the
/// time gap drops under 1.5 s or the closing speed exceeds 3 m/s. The
/// result is clamped to `[-7, 1.5 · a_max]`, which also bounds any
/// degenerate input, so the integration step never sees a non-finite
/// acceleration.
pub fn idm_acceleration(
    focal: &NeighborView,
    leader: Option<&NeighborView>,
    current_speed: f64,
) -> f64 {
    let v = if current_speed.is_finite() { current_speed.max(0.0) } else { 0.0 };
    let v0 = focal.v0.max(1e-6);
    let a_max = focal.a_max * focal.aggressiveness;
    let b = focal.b_comfort;

    let leader = match leader {
        Some(l) => l,
        None => return a_max * (1.0 - (v / v0).powf(focal.delta)),
    };

    let gap = bumper_gap(focal, leader);

    // A stopped obstacle ahead overrides the interaction term with
    // staged braking keyed on distance alone.
    if leader.is_full_stop_active() {
        return staged_braking(gap, v);
    }

    let delta_v = v - leader.speed;
    let s_star = desired_gap(focal, leader.speed, v);
    let ratio_v = (v / v0).powf(focal.delta);
    let ratio_s = (s_star / gap).powi(2);

    let mut accel = a_max * (1.0 - ratio_v - ratio_s);

    let time_gap = gap / v.max(0.1);
    if time_gap < 1.5 || delta_v > 3.0 {
        accel *= 1.2;
    }

    accel.clamp(MAX_BRAKING, 1.5 * a_max)
}

/// Desired dynamic gap `s* = s0 + v·T + v·Δv / (2·√(a_max·b))`.
pub fn desired_gap(focal: &NeighborView, leader_speed: f64, current_speed: f64) -> f64 {
    let v = current_speed;
    let delta_v = v - leader_speed;
    let interaction = v * delta_v / (2.0 * (focal.a_max * focal.b_comfort).sqrt());
    focal.s0 + v * focal.time_headway + interaction
}

/// Bumper-to-bumper gap with the floor applied.
fn bumper_gap(focal: &NeighborView, leader: &NeighborView) -> f64 {
    let dist = leader.pos - focal.pos;
    (dist - focal.length / 2.0 - leader.length / 2.0).max(GAP_FLOOR)
}

/// Distance-staged braking toward a stopped obstacle: light at range,
/// linearly harder through the mid bands, full emergency under 30 m.
fn staged_braking(gap: f64, speed: f64) -> f64 {
    if gap > 200.0 {
        (-0.1 * speed).max(-1.5)
    } else if gap > 100.0 {
        let ratio = (200.0 - gap) / 100.0;
        -1.5 - 2.5 * ratio
    } else if gap > 30.0 {
        let ratio = (100.0 - gap) / 70.0;
        -4.0 - 3.0 * ratio
    } else {
        MAX_BRAKING
    }
}
