use crate::alerts::context::AlertContext;
use crate::alerts::expression::{Expr, ExprError};
use crate::config::Weather;
use crate::etc::detector::GantryStatsSnapshot;
use crate::road::GantryId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Errors surfaced while validating or evaluating a condition. The rule
/// engine treats evaluation errors as the condition being false.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionError {
    /// Custom expression failed to parse or evaluate
    Expression(ExprError),
    /// Custom scripts are outside the portable core and refuse to load
    ScriptUnsupported(String),
}

impl fmt::Display for ConditionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionError::Expression(err) => write!(f, "Expression condition: {}", err),
            ConditionError::ScriptUnsupported(name) => {
                write!(
                    f,
                    "Custom script '{}' not supported: script execution is not embedded in the core",
                    name
                )
            }
        }
    }
}

impl std::error::Error for ConditionError {}

impl From<ExprError> for ConditionError {
    fn from(err: ExprError) -> Self {
        ConditionError::Expression(err)
    }
}

/// Which gantries a condition looks at.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GantryScope {
    /// Every registered gantry
    #[default]
    All,
    /// One gantry by id
    Single(GantryId),
    /// Every gantry with `from_km <= position < to_km`
    Range { from_km: f64, to_km: f64 },
}

impl GantryScope {
    /// Whether a gantry snapshot falls inside the scope.
    pub fn matches(&self, stats: &GantryStatsSnapshot) -> bool {
        match self {
            GantryScope::All => true,
            GantryScope::Single(id) => &stats.gantry_id == id,
            GantryScope::Range { from_km, to_km } => {
                stats.position_km >= *from_km && stats.position_km < *to_km
            }
        }
    }
}

/// The condition catalog. Each variant is a small evaluator over the
/// alert context; the JSON form is internally tagged with `type` and a
/// flat parameter bag, so rule documents read naturally:
///
/// ```json
/// { "type": "speed_below_threshold", "threshold_kmh": 30.0, "scope": "all" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Average crossing speed at a scoped gantry under the threshold
    SpeedBelowThreshold {
        #[serde(default)]
        scope: GantryScope,
        threshold_kmh: f64,
        #[serde(default = "default_min_samples")]
        min_samples: usize,
    },
    /// Latest travel time z-score above `sigma` at a scoped gantry
    TravelTimeOutlier {
        #[serde(default)]
        scope: GantryScope,
        sigma: f64,
    },
    /// Downstream flow under `ratio` of upstream in a trailing window
    FlowImbalance {
        upstream: GantryId,
        downstream: GantryId,
        ratio: f64,
        window_s: f64,
    },
    /// At least `count` alert events in the trailing history window
    ConsecutiveAlerts { count: usize },
    /// Any scoped queue longer than `length_m`
    QueueLengthExceeds {
        #[serde(default)]
        scope: GantryScope,
        length_m: f64,
    },
    /// Crossing-speed standard deviation above `std_kmh` at a scoped gantry
    SpeedStdHigh {
        #[serde(default)]
        scope: GantryScope,
        std_kmh: f64,
    },
    /// Any segment's average speed under `below_kmh`
    SegmentSpeedDrop { below_kmh: f64 },
    /// Exact weather match
    WeatherTypeIs { weather: Weather },
    /// Realized missed-read rate above `rate` once enough reads exist
    HighMissedReadRate {
        rate: f64,
        #[serde(default = "default_min_processed")]
        min_processed: u64,
    },
    /// Recent crossing speeds dropped by more than `drop_ratio` against
    /// the older half of the ring at a scoped gantry
    SpeedChangeRate {
        #[serde(default)]
        scope: GantryScope,
        drop_ratio: f64,
    },
    /// Any segment occupancy (density × mean vehicle length) above `ratio`
    OccupancyHigh {
        ratio: f64,
        #[serde(default = "default_mean_length")]
        mean_vehicle_length_m: f64,
    },
    /// Mean headway between successive reads at a scoped gantry under
    /// `below_s`
    HeadwayAnomaly {
        #[serde(default)]
        scope: GantryScope,
        below_s: f64,
    },
    /// Any segment density above `threshold_veh_km`
    DensityExceeds { threshold_veh_km: f64 },
    /// Sandboxed arithmetic/boolean expression over the named context
    /// variables
    CustomExpression { expression: String },
    /// User-supplied predicate; representable in rule documents but
    /// refused at load
    CustomScript { name: String },
}

fn default_min_samples() -> usize {
    3
}
fn default_min_processed() -> u64 {
    100
}
fn default_mean_length() -> f64 {
    5.0
}

impl Condition {
    /// Validates the condition at registration time. Custom expressions
    /// parse here so typos fail before a run starts; custom scripts are
    /// a documented capability gap and always refuse.
    pub fn validate(&self) -> Result<(), ConditionError> {
        match self {
            Condition::CustomExpression { expression } => {
                let allowed: Vec<String> =
                    AlertContext::default().variables().keys().cloned().collect();
                Expr::parse(expression, &allowed)?;
                Ok(())
            }
            Condition::CustomScript { name } => {
                Err(ConditionError::ScriptUnsupported(name.clone()))
            }
            _ => Ok(()),
        }
    }

    /// Evaluates the condition against a context snapshot.
    pub fn evaluate(&self, context: &AlertContext) -> Result<bool, ConditionError> {
        match self {
            Condition::SpeedBelowThreshold { scope, threshold_kmh, min_samples } => {
                Ok(context.gantry_stats.values().any(|stats| {
                    scope.matches(stats)
                        && stats.recent_speeds_kmh.len() >= *min_samples
                        && stats.avg_speed_kmh < *threshold_kmh
                }))
            }
            Condition::TravelTimeOutlier { scope, sigma } => {
                Ok(context
                    .gantry_stats
                    .values()
                    .any(|stats| scope.matches(stats) && stats.last_z_score > *sigma))
            }
            Condition::FlowImbalance { upstream, downstream, ratio, window_s } => {
                let now = context.current_time;
                let count = |gantry: &GantryId| {
                    context
                        .recent_transactions
                        .iter()
                        .filter(|t| &t.gantry_id == gantry && now - t.timestamp <= *window_s)
                        .count()
                };
                let up = count(upstream);
                if up == 0 {
                    return Ok(false);
                }
                Ok((count(downstream) as f64 / up as f64) < *ratio)
            }
            Condition::ConsecutiveAlerts { count } => {
                Ok(context.recent_alert_events.len() >= *count)
            }
            Condition::QueueLengthExceeds { scope, length_m } => {
                Ok(context.queue_lengths.iter().any(|(gantry_id, length)| {
                    let in_scope = match scope {
                        GantryScope::All => true,
                        GantryScope::Single(id) => gantry_id == id,
                        GantryScope::Range { .. } => context
                            .gantry_stats
                            .get(gantry_id)
                            .is_some_and(|stats| scope.matches(stats)),
                    };
                    in_scope && *length > *length_m
                }))
            }
            Condition::SpeedStdHigh { scope, std_kmh } => {
                Ok(context.gantry_stats.values().any(|stats| {
                    if !scope.matches(stats) || stats.recent_speeds_kmh.len() < 3 {
                        return false;
                    }
                    let n = stats.recent_speeds_kmh.len() as f64;
                    let mean = stats.recent_speeds_kmh.iter().sum::<f64>() / n;
                    let variance = stats
                        .recent_speeds_kmh
                        .iter()
                        .map(|s| (s - mean).powi(2))
                        .sum::<f64>()
                        / n;
                    variance.sqrt() > *std_kmh
                }))
            }
            Condition::SegmentSpeedDrop { below_kmh } => Ok(context
                .segment_avg_speeds
                .values()
                .any(|speed| speed * 3.6 < *below_kmh)),
            Condition::WeatherTypeIs { weather } => Ok(context.weather == *weather),
            Condition::HighMissedReadRate { rate, min_processed } => {
                Ok(context.noise_stats.total_processed >= *min_processed
                    && context.noise_stats.missed_read_rate_actual > *rate)
            }
            Condition::SpeedChangeRate { scope, drop_ratio } => {
                Ok(context.gantry_stats.values().any(|stats| {
                    if !scope.matches(stats) || stats.recent_speeds_kmh.len() < 10 {
                        return false;
                    }
                    let half = stats.recent_speeds_kmh.len() / 2;
                    let older: f64 =
                        stats.recent_speeds_kmh[..half].iter().sum::<f64>() / half as f64;
                    let newer: f64 = stats.recent_speeds_kmh[half..].iter().sum::<f64>()
                        / (stats.recent_speeds_kmh.len() - half) as f64;
                    older > 1.0 && (older - newer) / older > *drop_ratio
                }))
            }
            Condition::OccupancyHigh { ratio, mean_vehicle_length_m } => {
                Ok(context.segment_densities.values().any(|density| {
                    // Density is vehicles/km; occupancy is the length
                    // fraction those vehicles cover.
                    density * mean_vehicle_length_m / 1000.0 > *ratio
                }))
            }
            Condition::HeadwayAnomaly { scope, below_s } => {
                let mut by_gantry: std::collections::BTreeMap<&GantryId, Vec<f64>> =
                    std::collections::BTreeMap::new();
                for tx in &context.recent_transactions {
                    if tx.is_duplicate {
                        continue;
                    }
                    by_gantry.entry(&tx.gantry_id).or_default().push(tx.timestamp);
                }
                for (gantry_id, mut times) in by_gantry {
                    let in_scope = match scope {
                        GantryScope::All => true,
                        GantryScope::Single(id) => gantry_id == id,
                        GantryScope::Range { .. } => context
                            .gantry_stats
                            .get(gantry_id)
                            .is_some_and(|stats| scope.matches(stats)),
                    };
                    if !in_scope {
                        continue;
                    }
                    times.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                    if times.len() < 4 {
                        continue;
                    }
                    let headways: Vec<f64> = times.windows(2).map(|w| w[1] - w[0]).collect();
                    let mean = headways.iter().sum::<f64>() / headways.len() as f64;
                    if mean < *below_s {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Condition::DensityExceeds { threshold_veh_km } => Ok(context
                .segment_densities
                .values()
                .any(|density| density > threshold_veh_km)),
            Condition::CustomExpression { expression } => {
                let vars = context.variables();
                let allowed: Vec<String> = vars.keys().cloned().collect();
                let expr = Expr::parse(expression, &allowed)?;
                Ok(expr.eval_bool(&vars)?)
            }
            Condition::CustomScript { name } => {
                Err(ConditionError::ScriptUnsupported(name.clone()))
            }
        }
    }

    /// The gantry this condition is pinned to, when it is pinned to one.
    /// Fired events resolve their gantry id and position through this.
    pub fn pinned_gantry(&self) -> Option<&GantryId> {
        match self {
            Condition::SpeedBelowThreshold { scope: GantryScope::Single(id), .. }
            | Condition::TravelTimeOutlier { scope: GantryScope::Single(id), .. }
            | Condition::QueueLengthExceeds { scope: GantryScope::Single(id), .. }
            | Condition::SpeedStdHigh { scope: GantryScope::Single(id), .. }
            | Condition::SpeedChangeRate { scope: GantryScope::Single(id), .. }
            | Condition::HeadwayAnomaly { scope: GantryScope::Single(id), .. } => Some(id),
            Condition::FlowImbalance { downstream, .. } => Some(downstream),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etc::transaction::{EtcTransaction, TransactionStatus};

    fn snapshot(id: &str, position_km: f64, speeds: Vec<f64>) -> GantryStatsSnapshot {
        let avg = if speeds.is_empty() {
            0.0
        } else {
            speeds.iter().sum::<f64>() / speeds.len() as f64
        };
        GantryStatsSnapshot {
            gantry_id: id.to_string(),
            position_km,
            avg_travel_time: 70.0,
            std_travel_time: 5.0,
            avg_speed_kmh: avg,
            last_z_score: 0.0,
            recent_speeds_kmh: speeds,
            outlier_count: 0,
            consecutive_outliers: 0,
            sample_count: 10,
        }
    }

    fn context_with(snapshots: Vec<GantryStatsSnapshot>) -> AlertContext {
        let mut ctx = AlertContext::default();
        for s in snapshots {
            ctx.gantry_stats.insert(s.gantry_id.clone(), s);
        }
        ctx
    }

    #[test]
    fn test_speed_below_threshold() {
        let ctx = context_with(vec![snapshot("G02", 2.0, vec![20.0, 25.0, 22.0])]);
        let hit = Condition::SpeedBelowThreshold {
            scope: GantryScope::All,
            threshold_kmh: 30.0,
            min_samples: 3,
        };
        assert!(hit.evaluate(&ctx).unwrap());
        let miss = Condition::SpeedBelowThreshold {
            scope: GantryScope::Single("G04".to_string()),
            threshold_kmh: 30.0,
            min_samples: 3,
        };
        assert!(!miss.evaluate(&ctx).unwrap());
    }

    #[test]
    fn test_gantry_range_scope() {
        let ctx = context_with(vec![
            snapshot("G02", 2.0, vec![20.0, 25.0, 22.0]),
            snapshot("G08", 8.0, vec![90.0, 95.0, 92.0]),
        ]);
        let in_range = Condition::SpeedBelowThreshold {
            scope: GantryScope::Range { from_km: 0.0, to_km: 4.0 },
            threshold_kmh: 30.0,
            min_samples: 3,
        };
        assert!(in_range.evaluate(&ctx).unwrap());
        let out_of_range = Condition::SpeedBelowThreshold {
            scope: GantryScope::Range { from_km: 6.0, to_km: 10.0 },
            threshold_kmh: 30.0,
            min_samples: 3,
        };
        assert!(!out_of_range.evaluate(&ctx).unwrap());
    }

    #[test]
    fn test_travel_time_outlier_uses_last_z() {
        let mut s = snapshot("G02", 2.0, vec![]);
        s.last_z_score = 3.2;
        let ctx = context_with(vec![s]);
        assert!(Condition::TravelTimeOutlier { scope: GantryScope::All, sigma: 2.0 }
            .evaluate(&ctx)
            .unwrap());
        assert!(!Condition::TravelTimeOutlier { scope: GantryScope::All, sigma: 4.0 }
            .evaluate(&ctx)
            .unwrap());
    }

    #[test]
    fn test_queue_and_density_conditions() {
        let mut ctx = AlertContext::default();
        ctx.queue_lengths.insert("G04".to_string(), 600.0);
        ctx.segment_densities.insert(2, 40.0);
        assert!(Condition::QueueLengthExceeds { scope: GantryScope::All, length_m: 500.0 }
            .evaluate(&ctx)
            .unwrap());
        assert!(Condition::DensityExceeds { threshold_veh_km: 35.0 }.evaluate(&ctx).unwrap());
        assert!(!Condition::DensityExceeds { threshold_veh_km: 50.0 }.evaluate(&ctx).unwrap());
    }

    #[test]
    fn test_segment_speed_drop() {
        let mut ctx = AlertContext::default();
        ctx.segment_avg_speeds.insert(1, 8.0); // 28.8 km/h
        assert!(Condition::SegmentSpeedDrop { below_kmh: 40.0 }.evaluate(&ctx).unwrap());
        assert!(!Condition::SegmentSpeedDrop { below_kmh: 20.0 }.evaluate(&ctx).unwrap());
    }

    #[test]
    fn test_weather_condition() {
        let mut ctx = AlertContext::default();
        ctx.weather = Weather::Fog;
        assert!(Condition::WeatherTypeIs { weather: Weather::Fog }.evaluate(&ctx).unwrap());
        assert!(!Condition::WeatherTypeIs { weather: Weather::Clear }.evaluate(&ctx).unwrap());
    }

    #[test]
    fn test_missed_read_rate_needs_volume() {
        let mut ctx = AlertContext::default();
        ctx.noise_stats.total_processed = 10;
        ctx.noise_stats.missed_read_rate_actual = 0.5;
        let condition = Condition::HighMissedReadRate { rate: 0.08, min_processed: 100 };
        assert!(!condition.evaluate(&ctx).unwrap(), "too few reads to judge");
        ctx.noise_stats.total_processed = 200;
        assert!(condition.evaluate(&ctx).unwrap());
    }

    #[test]
    fn test_speed_change_rate() {
        let speeds: Vec<f64> =
            (0..5).map(|_| 100.0).chain((0..5).map(|_| 40.0)).collect();
        let ctx = context_with(vec![snapshot("G02", 2.0, speeds)]);
        let condition =
            Condition::SpeedChangeRate { scope: GantryScope::All, drop_ratio: 0.4 };
        assert!(condition.evaluate(&ctx).unwrap());
    }

    #[test]
    fn test_headway_anomaly() {
        let mut ctx = AlertContext::default();
        for i in 0..6 {
            ctx.recent_transactions.push(EtcTransaction::raw(
                i,
                "G02".to_string(),
                2.0,
                100.0 + i as f64 * 0.5,
                0,
                28.0,
                TransactionStatus::Normal,
            ));
        }
        let condition = Condition::HeadwayAnomaly { scope: GantryScope::All, below_s: 1.0 };
        assert!(condition.evaluate(&ctx).unwrap());
        let strict = Condition::HeadwayAnomaly { scope: GantryScope::All, below_s: 0.2 };
        assert!(!strict.evaluate(&ctx).unwrap());
    }

    #[test]
    fn test_custom_expression_round_trip() {
        let mut ctx = AlertContext::default();
        ctx.vehicle_speeds.insert(1, 5.0);
        let condition = Condition::CustomExpression {
            expression: "mean_speed_kmh < 30 && active_vehicles > 0".to_string(),
        };
        condition.validate().unwrap();
        assert!(condition.evaluate(&ctx).unwrap());
    }

    #[test]
    fn test_custom_expression_bad_identifier_fails_validation() {
        let condition =
            Condition::CustomExpression { expression: "open_file > 0".to_string() };
        assert!(matches!(condition.validate(), Err(ConditionError::Expression(_))));
    }

    #[test]
    fn test_custom_script_refused() {
        let condition = Condition::CustomScript { name: "my_predicate".to_string() };
        assert!(matches!(condition.validate(), Err(ConditionError::ScriptUnsupported(_))));
        assert!(matches!(
            condition.evaluate(&AlertContext::default()),
            Err(ConditionError::ScriptUnsupported(_))
        ));
    }

    #[test]
    fn test_json_form_is_tagged() {
        let condition = Condition::SpeedBelowThreshold {
            scope: GantryScope::Single("G02".to_string()),
            threshold_kmh: 30.0,
            min_samples: 3,
        };
        let json = serde_json::to_value(&condition).expect("serialize");
        assert_eq!(json["type"], "speed_below_threshold");
        assert_eq!(json["threshold_kmh"], 30.0);
        let parsed: Condition = serde_json::from_value(json).expect("deserialize");
        assert_eq!(parsed, condition);
    }
}
