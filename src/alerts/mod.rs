//! # Alerts Module
//!
//! The rule engine that turns per-tick world snapshots into alert
//! events: an explicit catalog of condition evaluators, rules composing
//! them with ALL/ANY semantics, per-rule cooldowns, and a sandboxed
//! arithmetic expression evaluator for user-defined conditions.
//!
//! ## Key Components
//!
//! - [`context::AlertContext`] - The snapshot assembled by the engine each tick
//! - [`conditions::Condition`] - Tagged condition variants with a JSON form
//! - [`rules::AlertRuleEngine`] - Rule storage, evaluation and cooldown state
//! - [`expression::Expr`] - The restricted expression language for
//!   custom conditions; unknown identifiers are rejected at parse time
//!
//! ## Failure Policy
//!
//! A condition that fails to evaluate (bad expression, missing gantry)
//! is logged and treated as false; rule evaluation never aborts a tick.
pub mod conditions;
pub mod context;
pub mod expression;
pub mod rules;

pub use self::{conditions::*, context::*, expression::*, rules::*};
