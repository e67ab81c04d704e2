use crate::alerts::conditions::{Condition, ConditionError, GantryScope};
use crate::alerts::context::{AlertContext, AlertEvent, Severity};
use crate::config::Weather;
use crate::verbose::{EVENT_RULE_FIRED, VerboseLevel, verbose_log};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// How a rule combines its conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Combine {
    #[default]
    All,
    Any,
}

/// What a fired rule does besides emitting its event. Actions are
/// recommendations recorded into the event metadata; the shell decides
/// whether anything downstream acts on them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Log,
    Notify { channel: String },
    SpeedLimit { limit_kmh: f64 },
    LaneControl { close_lanes: Vec<usize> },
}

/// Errors from assembling the rule set.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleError {
    DuplicateName(String),
    InvalidCondition { rule: String, error: ConditionError },
}

impl fmt::Display for RuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleError::DuplicateName(name) => {
                write!(f, "A rule named '{}' is already registered", name)
            }
            RuleError::InvalidCondition { rule, error } => {
                write!(f, "Rule '{}' has an invalid condition: {}", rule, error)
            }
        }
    }
}

impl std::error::Error for RuleError {}

/// One alert rule: named, ordered conditions, a composition mode, a
/// severity, actions and a cooldown.
///
/// # Example
/// ```rust
/// use etc_traffic_sim_core::alerts::{Action, AlertRule, Combine, Condition, GantryScope, Severity};
///
/// let rule = AlertRule::new("gantry_low_speed")
///     .with_condition(Condition::SpeedBelowThreshold {
///         scope: GantryScope::All,
///         threshold_kmh: 30.0,
///         min_samples: 3,
///     })
///     .with_severity(Severity::Medium)
///     .with_cooldown(60.0)
///     .with_action(Action::Log)
///     .build();
/// assert_eq!(rule.name, "gantry_low_speed");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub name: String,
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub combine: Combine,
    pub severity: Severity,
    #[serde(default)]
    pub actions: Vec<Action>,
    pub cooldown_s: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Per-run state, reset between runs
    #[serde(skip)]
    last_trigger: Option<f64>,
}

fn default_enabled() -> bool {
    true
}

impl AlertRule {
    /// Starts a builder for a rule with the given unique name.
    pub fn new(name: &str) -> AlertRuleBuilder {
        AlertRuleBuilder {
            rule: AlertRule {
                name: name.to_string(),
                conditions: Vec::new(),
                combine: Combine::All,
                severity: Severity::Medium,
                actions: Vec::new(),
                cooldown_s: 60.0,
                enabled: true,
                last_trigger: None,
            },
        }
    }

    /// Clock of the most recent firing, if any.
    pub fn last_trigger(&self) -> Option<f64> {
        self.last_trigger
    }
}

/// Builder for [`AlertRule`].
pub struct AlertRuleBuilder {
    rule: AlertRule,
}

impl AlertRuleBuilder {
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.rule.conditions.push(condition);
        self
    }

    pub fn with_combine(mut self, combine: Combine) -> Self {
        self.rule.combine = combine;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.rule.severity = severity;
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.rule.actions.push(action);
        self
    }

    pub fn with_cooldown(mut self, cooldown_s: f64) -> Self {
        self.rule.cooldown_s = cooldown_s;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.rule.enabled = false;
        self
    }

    pub fn build(self) -> AlertRule {
        self.rule
    }
}

/// Engine statistics exported with the run artifact.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RuleEngineStats {
    pub rules: usize,
    pub evaluations: u64,
    pub fired: u64,
    pub evaluation_failures: u64,
}

/// The rule engine: explicit registration, per-tick evaluation, per-rule
/// cooldown state.
///
/// Rules register at engine construction; there is no global registry.
/// Evaluation failures are logged and count as the condition being
/// false, so a malformed rule can never abort a tick.
#[derive(Debug, Default)]
pub struct AlertRuleEngine {
    rules: Vec<AlertRule>,
    events: Vec<AlertEvent>,
    stats: RuleEngineStats,
}

impl AlertRuleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a rule after validating its conditions. Names are
    /// unique; custom-script conditions refuse here.
    pub fn add_rule(&mut self, rule: AlertRule) -> Result<(), RuleError> {
        if self.rules.iter().any(|r| r.name == rule.name) {
            return Err(RuleError::DuplicateName(rule.name));
        }
        for condition in &rule.conditions {
            condition.validate().map_err(|error| RuleError::InvalidCondition {
                rule: rule.name.clone(),
                error,
            })?;
        }
        self.stats.rules += 1;
        self.rules.push(rule);
        Ok(())
    }

    /// Evaluates every enabled rule against the context, honoring
    /// cooldowns, and returns the events fired this tick.
    pub fn evaluate_all(&mut self, context: &AlertContext) -> Vec<AlertEvent> {
        let mut fired = Vec::new();
        for rule in &mut self.rules {
            if !rule.enabled || rule.conditions.is_empty() {
                continue;
            }
            if let Some(last) = rule.last_trigger {
                if context.current_time - last < rule.cooldown_s {
                    continue;
                }
            }
            self.stats.evaluations += 1;

            let mut results = Vec::with_capacity(rule.conditions.len());
            for condition in &rule.conditions {
                let result = match condition.evaluate(context) {
                    Ok(value) => value,
                    Err(error) => {
                        self.stats.evaluation_failures += 1;
                        verbose_log(
                            VerboseLevel::Additional,
                            EVENT_RULE_FIRED,
                            &format!("rule '{}' condition failed: {}", rule.name, error),
                        );
                        false
                    }
                };
                results.push(result);
            }

            let satisfied = match rule.combine {
                Combine::All => results.iter().all(|&r| r),
                Combine::Any => results.iter().any(|&r| r),
            };
            if !satisfied {
                continue;
            }

            rule.last_trigger = Some(context.current_time);
            self.stats.fired += 1;
            let event = Self::build_event(rule, context);
            self.events.push(event.clone());
            fired.push(event);
        }
        fired
    }

    fn build_event(rule: &AlertRule, context: &AlertContext) -> AlertEvent {
        // Resolve the gantry the rule is about, when one is pinned.
        let gantry_id = rule.conditions.iter().find_map(|c| c.pinned_gantry()).cloned();
        let position_km = gantry_id
            .as_ref()
            .and_then(|id| context.gantry_stats.get(id))
            .map(|stats| stats.position_km)
            .unwrap_or(0.0);

        let mut metadata = BTreeMap::new();
        if let Some(id) = &gantry_id {
            metadata.insert("gantry_id".to_string(), serde_json::json!(id));
            metadata.insert("position_km".to_string(), serde_json::json!(position_km));
        }
        if !rule.actions.is_empty() {
            metadata.insert("actions".to_string(), serde_json::json!(rule.actions));
        }

        AlertEvent {
            rule_name: rule.name.clone(),
            severity: rule.severity,
            timestamp: context.current_time,
            gantry_id,
            position_km,
            description: format!("rule '{}' fired", rule.name),
            confidence: rule.severity.base_confidence(),
            affected_lanes: Vec::new(),
            metadata,
        }
    }

    /// All events fired during this run, in firing order.
    pub fn events(&self) -> &[AlertEvent] {
        &self.events
    }

    /// Events no older than `max_age` seconds.
    pub fn recent_events(&self, max_age: f64, current_time: f64) -> Vec<AlertEvent> {
        self.events
            .iter()
            .filter(|e| current_time - e.timestamp <= max_age)
            .cloned()
            .collect()
    }

    /// Engine statistics for the run artifact.
    pub fn stats(&self) -> RuleEngineStats {
        self.stats
    }

    /// Clears per-run state: cooldown timers, event history, counters.
    /// An engine reused across runs must reset between them.
    pub fn reset(&mut self) {
        for rule in &mut self.rules {
            rule.last_trigger = None;
        }
        self.events.clear();
        let rules = self.stats.rules;
        self.stats = RuleEngineStats { rules, ..RuleEngineStats::default() };
    }
}

/// The default rule set installed at engine construction.
pub fn default_rules() -> Vec<AlertRule> {
    vec![
        AlertRule::new("gantry_low_speed")
            .with_condition(Condition::SpeedBelowThreshold {
                scope: GantryScope::All,
                threshold_kmh: 30.0,
                min_samples: 3,
            })
            .with_severity(Severity::Medium)
            .with_cooldown(60.0)
            .with_action(Action::Log)
            .build(),
        AlertRule::new("travel_time_congestion")
            .with_condition(Condition::TravelTimeOutlier {
                scope: GantryScope::All,
                sigma: 2.0,
            })
            .with_severity(Severity::High)
            .with_cooldown(120.0)
            .with_action(Action::Log)
            .with_action(Action::Notify { channel: "operations".to_string() })
            .build(),
        AlertRule::new("segment_speed_collapse")
            .with_condition(Condition::SegmentSpeedDrop { below_kmh: 40.0 })
            .with_condition(Condition::DensityExceeds { threshold_veh_km: 35.0 })
            .with_combine(Combine::Any)
            .with_severity(Severity::High)
            .with_cooldown(120.0)
            .with_action(Action::SpeedLimit { limit_kmh: 60.0 })
            .build(),
        AlertRule::new("queue_buildup")
            .with_condition(Condition::QueueLengthExceeds {
                scope: GantryScope::All,
                length_m: 500.0,
            })
            .with_severity(Severity::Critical)
            .with_cooldown(180.0)
            .with_action(Action::Log)
            .with_action(Action::LaneControl { close_lanes: Vec::new() })
            .build(),
        AlertRule::new("sensor_degradation")
            .with_condition(Condition::HighMissedReadRate { rate: 0.08, min_processed: 100 })
            .with_severity(Severity::Low)
            .with_cooldown(300.0)
            .with_action(Action::Log)
            .build(),
        AlertRule::new("adverse_weather_slowdown")
            .with_condition(Condition::WeatherTypeIs { weather: Weather::Fog })
            .with_condition(Condition::SegmentSpeedDrop { below_kmh: 60.0 })
            .with_severity(Severity::Medium)
            .with_cooldown(300.0)
            .with_action(Action::SpeedLimit { limit_kmh: 80.0 })
            .build(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slow_context(time: f64) -> AlertContext {
        let mut ctx = AlertContext::default();
        ctx.current_time = time;
        ctx.segment_avg_speeds.insert(1, 5.0); // 18 km/h
        ctx
    }

    fn engine_with(rule: AlertRule) -> AlertRuleEngine {
        let mut engine = AlertRuleEngine::new();
        engine.add_rule(rule).expect("valid rule");
        engine
    }

    fn speed_drop_rule(cooldown_s: f64) -> AlertRule {
        AlertRule::new("speed_drop")
            .with_condition(Condition::SegmentSpeedDrop { below_kmh: 40.0 })
            .with_cooldown(cooldown_s)
            .build()
    }

    #[test]
    fn test_rule_fires_and_respects_cooldown() {
        let mut engine = engine_with(speed_drop_rule(60.0));
        assert_eq!(engine.evaluate_all(&slow_context(100.0)).len(), 1);
        assert_eq!(engine.evaluate_all(&slow_context(130.0)).len(), 0, "inside cooldown");
        assert_eq!(engine.evaluate_all(&slow_context(160.0)).len(), 1, "cooldown elapsed");
        let events = engine.events();
        assert_eq!(events.len(), 2);
        assert!(events[1].timestamp - events[0].timestamp >= 60.0);
    }

    #[test]
    fn test_all_composition_requires_every_condition() {
        let rule = AlertRule::new("all_rule")
            .with_condition(Condition::SegmentSpeedDrop { below_kmh: 40.0 })
            .with_condition(Condition::DensityExceeds { threshold_veh_km: 35.0 })
            .with_combine(Combine::All)
            .with_cooldown(0.0)
            .build();
        let mut engine = engine_with(rule);
        // Speed drop true, density false.
        assert!(engine.evaluate_all(&slow_context(10.0)).is_empty());
        let mut ctx = slow_context(20.0);
        ctx.segment_densities.insert(1, 50.0);
        assert_eq!(engine.evaluate_all(&ctx).len(), 1);
    }

    #[test]
    fn test_any_composition() {
        let rule = AlertRule::new("any_rule")
            .with_condition(Condition::SegmentSpeedDrop { below_kmh: 40.0 })
            .with_condition(Condition::DensityExceeds { threshold_veh_km: 35.0 })
            .with_combine(Combine::Any)
            .with_cooldown(0.0)
            .build();
        let mut engine = engine_with(rule);
        assert_eq!(engine.evaluate_all(&slow_context(10.0)).len(), 1);
    }

    #[test]
    fn test_disabled_rule_never_fires() {
        let rule = AlertRule::new("disabled")
            .with_condition(Condition::SegmentSpeedDrop { below_kmh: 40.0 })
            .disabled()
            .build();
        let mut engine = engine_with(rule);
        assert!(engine.evaluate_all(&slow_context(10.0)).is_empty());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut engine = engine_with(speed_drop_rule(60.0));
        let err = engine.add_rule(speed_drop_rule(30.0)).unwrap_err();
        assert_eq!(err, RuleError::DuplicateName("speed_drop".to_string()));
    }

    #[test]
    fn test_script_condition_rejected_at_registration() {
        let rule = AlertRule::new("scripted")
            .with_condition(Condition::CustomScript { name: "f".to_string() })
            .build();
        let mut engine = AlertRuleEngine::new();
        assert!(matches!(engine.add_rule(rule), Err(RuleError::InvalidCondition { .. })));
    }

    #[test]
    fn test_reset_clears_cooldowns_and_events() {
        let mut engine = engine_with(speed_drop_rule(600.0));
        assert_eq!(engine.evaluate_all(&slow_context(100.0)).len(), 1);
        engine.reset();
        assert!(engine.events().is_empty());
        assert_eq!(engine.stats().fired, 0);
        // Fires again immediately after reset despite the long cooldown.
        assert_eq!(engine.evaluate_all(&slow_context(101.0)).len(), 1);
    }

    #[test]
    fn test_default_rules_register_cleanly() {
        let mut engine = AlertRuleEngine::new();
        for rule in default_rules() {
            engine.add_rule(rule).expect("default rules are valid");
        }
        assert_eq!(engine.stats().rules, 6);
    }

    #[test]
    fn test_event_metadata_carries_actions() {
        let rule = AlertRule::new("meta_rule")
            .with_condition(Condition::SegmentSpeedDrop { below_kmh: 40.0 })
            .with_action(Action::SpeedLimit { limit_kmh: 60.0 })
            .with_cooldown(0.0)
            .build();
        let mut engine = engine_with(rule);
        let events = engine.evaluate_all(&slow_context(10.0));
        let actions = &events[0].metadata["actions"];
        assert_eq!(actions[0]["type"], "speed_limit");
    }

    #[test]
    fn test_rule_json_round_trip() {
        let rule = speed_drop_rule(45.0);
        let json = serde_json::to_string(&rule).expect("serialize");
        let parsed: AlertRule = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.name, rule.name);
        assert_eq!(parsed.cooldown_s, 45.0);
        assert_eq!(parsed.conditions, rule.conditions);
        assert_eq!(parsed.last_trigger(), None, "cooldown state is per-run, not serialized");
    }
}
