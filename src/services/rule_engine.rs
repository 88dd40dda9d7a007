//! Business rule evaluation.
//!
//! Rules are declarative (condition + action) and evaluated purely against
//! the candidate payload: no storage reads, no clock, no network. The only
//! inputs are the payload mapping and the condition tuple, so evaluation is
//! deterministic and idempotent.

use crate::error::Result;
use crate::services::OfflineStore;
use crate::types::{
    BusinessRule, ConditionOp, OperationKind, Payload, RuleAction, RuleCondition,
};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// Result of evaluating all applicable rules against one payload.
#[derive(Debug, Clone, Default)]
pub struct RuleOutcome {
    /// Messages from reject-with-message actions; empty means acceptable.
    pub errors: Vec<String>,
    /// Set when any matched rule requires a sync handshake before the
    /// operation may execute.
    pub requires_sync: bool,
    /// Ids of the rules that were evaluated, in evaluation order.
    pub evaluated: Vec<String>,
    /// The evaluation copy of the payload, including set-field mutations.
    /// The submitted payload is never altered.
    pub payload: Payload,
}

/// Evaluates business rules for candidate operations.
pub struct RuleEngine {
    store: Arc<OfflineStore>,
    /// Rules per entity type, kept in evaluation order.
    rules: DashMap<String, Vec<BusinessRule>>,
}

impl RuleEngine {
    /// Create a rule engine hydrated from persisted rules.
    pub fn new(store: Arc<OfflineStore>) -> Result<Self> {
        let rules: DashMap<String, Vec<BusinessRule>> = DashMap::new();
        for rule in store.list_rules()? {
            rules.entry(rule.entity_type.clone()).or_default().push(rule);
        }
        debug!("Rule engine hydrated for {} entity types", rules.len());
        Ok(Self { store, rules })
    }

    /// Register (or replace) a rule. Evaluation order is priority
    /// ascending, then insertion order.
    pub fn register(&self, rule: BusinessRule, now: i64) -> Result<()> {
        self.store.put_rule(&rule, now)?;
        info!("Registered rule '{}' for '{}'", rule.rule_id, rule.entity_type);

        // Reload the type's rule list from storage so ordering matches the
        // persisted evaluation order exactly.
        let reloaded = self.store.list_rules_for_type(&rule.entity_type)?;
        self.rules.insert(rule.entity_type.clone(), reloaded);
        Ok(())
    }

    pub fn rules_for(&self, entity_type: &str) -> Vec<BusinessRule> {
        self.rules
            .get(entity_type)
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Evaluate the offline-applicable rules for an entity type against a
    /// payload. Matching reject rules accumulate; nothing short-circuits.
    pub fn evaluate(
        &self,
        entity_type: &str,
        payload: &Payload,
        _kind: OperationKind,
    ) -> RuleOutcome {
        let mut outcome = RuleOutcome {
            payload: payload.clone(),
            ..Default::default()
        };

        let Some(rules) = self.rules.get(entity_type) else {
            return outcome;
        };

        for rule in rules.iter() {
            if !rule.enabled || !rule.applies_offline() {
                continue;
            }
            outcome.evaluated.push(rule.rule_id.clone());

            if !condition_holds(&rule.condition, &outcome.payload) {
                continue;
            }

            match &rule.action {
                RuleAction::RejectWithMessage { message } => {
                    outcome.errors.push(message.clone());
                }
                RuleAction::RequireSyncBeforeExecute => {
                    outcome.requires_sync = true;
                }
                RuleAction::SetField { field, value } => {
                    outcome.payload.insert(field.clone(), value.clone());
                }
            }
        }

        outcome
    }
}

/// Evaluate a condition against a payload. Missing fields compare as JSON
/// null; unknown operators never match.
pub fn condition_holds(condition: &RuleCondition, payload: &Payload) -> bool {
    let field_value = payload.get(&condition.field).cloned().unwrap_or(Value::Null);
    let expected = condition.value.clone().unwrap_or(Value::Null);

    match condition.operator {
        ConditionOp::Equals => field_value == expected,
        ConditionOp::NotEquals => field_value != expected,
        ConditionOp::GreaterThan => match (field_value.as_f64(), expected.as_f64()) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        },
        ConditionOp::LessThan => match (field_value.as_f64(), expected.as_f64()) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        },
        ConditionOp::NotEmpty => !is_empty_value(&field_value),
        ConditionOp::Empty => is_empty_value(&field_value),
        ConditionOp::In => match &expected {
            Value::Array(set) => set.contains(&field_value),
            scalar => field_value == *scalar,
        },
        ConditionOp::NotIn => match &expected {
            Value::Array(set) => !set.contains(&field_value),
            scalar => field_value != *scalar,
        },
        ConditionOp::Unknown => false,
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}
