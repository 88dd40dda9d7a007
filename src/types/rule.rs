//! Declarative business rules evaluated against candidate payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Condition operators. Anything unrecognized deserializes to `Unknown`,
/// which never matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    NotEmpty,
    Empty,
    In,
    NotIn,
    #[serde(other)]
    Unknown,
}

/// A boolean condition over one payload field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCondition {
    pub field: String,
    pub operator: ConditionOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl RuleCondition {
    pub fn new(field: impl Into<String>, operator: ConditionOp, value: Option<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }
}

/// What happens when a rule's condition holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleAction {
    /// Record a validation error; evaluation continues so the caller sees
    /// every failure.
    RejectWithMessage { message: String },
    /// Hold the operation in pending until the sync coordinator has
    /// completed at least one successful handshake.
    RequireSyncBeforeExecute,
    /// Mutate the evaluation copy of the payload; later rules observe the
    /// change. The submitted payload is never altered.
    SetField { field: String, value: Value },
}

/// Where a rule applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleContext {
    Offline,
    Online,
    Both,
}

/// One declarative business rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessRule {
    pub rule_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub entity_type: String,

    pub condition: RuleCondition,
    pub action: RuleAction,

    /// Evaluation order: lower numbers win ties; insertion order breaks
    /// remaining ties.
    #[serde(default = "default_rule_priority")]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,

    pub contexts: BTreeSet<RuleContext>,
    #[serde(default)]
    pub depends_on_rules: Vec<String>,
}

fn default_rule_priority() -> i32 {
    100
}

fn default_true() -> bool {
    true
}

impl BusinessRule {
    pub fn new(
        rule_id: impl Into<String>,
        name: impl Into<String>,
        entity_type: impl Into<String>,
        condition: RuleCondition,
        action: RuleAction,
    ) -> Self {
        let mut contexts = BTreeSet::new();
        contexts.insert(RuleContext::Both);
        Self {
            rule_id: rule_id.into(),
            name: name.into(),
            description: String::new(),
            entity_type: entity_type.into(),
            condition,
            action,
            priority: default_rule_priority(),
            enabled: true,
            contexts,
            depends_on_rules: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_contexts(mut self, contexts: &[RuleContext]) -> Self {
        self.contexts = contexts.iter().copied().collect();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Whether this rule runs during local (offline) validation.
    pub fn applies_offline(&self) -> bool {
        self.contexts.contains(&RuleContext::Offline) || self.contexts.contains(&RuleContext::Both)
    }
}
