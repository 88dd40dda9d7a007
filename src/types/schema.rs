//! Entity schemas: field contracts validated at enqueue time.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Declared type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Decimal,
    Email,
    Date,
    Boolean,
    Enum,
    Array,
    Object,
}

/// Constraints on a single field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    /// Numeric lower bound (decimal fields).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Numeric upper bound (decimal fields).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Length bounds (string fields).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    /// Enumerated set; checked whenever non-empty, regardless of type.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_values: Vec<Value>,
}

impl FieldSpec {
    pub fn new(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: false,
            min: None,
            max: None,
            min_length: None,
            max_length: None,
            allowed_values: Vec::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn with_max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn with_length(mut self, min: Option<usize>, max: Option<usize>) -> Self {
        self.min_length = min;
        self.max_length = max;
        self
    }

    pub fn with_allowed_values(mut self, values: Vec<Value>) -> Self {
        self.allowed_values = values;
        self
    }
}

/// Contract for one entity type. Ordered maps keep validation output
/// deterministic across runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySchema {
    pub entity_type: String,
    pub version: String,
    pub fields: BTreeMap<String, FieldSpec>,
    pub required_fields: BTreeSet<String>,
    /// Fields the store may use for efficient cache lookups.
    pub indexed_fields: BTreeSet<String>,
    /// Local search hints; not interpreted by the engine core.
    pub full_text_fields: BTreeSet<String>,
}

impl EntitySchema {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            version: "1.0".to_string(),
            fields: BTreeMap::new(),
            required_fields: BTreeSet::new(),
            indexed_fields: BTreeSet::new(),
            full_text_fields: BTreeSet::new(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Declare a field; `required` on the spec also adds it to the
    /// required-fields set.
    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        let name = name.into();
        if spec.required {
            self.required_fields.insert(name.clone());
        }
        self.fields.insert(name, spec);
        self
    }

    pub fn indexed(mut self, fields: &[&str]) -> Self {
        self.indexed_fields
            .extend(fields.iter().map(|f| f.to_string()));
        self
    }

    pub fn full_text(mut self, fields: &[&str]) -> Self {
        self.full_text_fields
            .extend(fields.iter().map(|f| f.to_string()));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_field_joins_required_set() {
        let schema = EntitySchema::new("invoice")
            .field("amount", FieldSpec::new(FieldType::Decimal).required())
            .field("notes", FieldSpec::new(FieldType::String));

        assert!(schema.required_fields.contains("amount"));
        assert!(!schema.required_fields.contains("notes"));
        assert_eq!(schema.fields.len(), 2);
    }

    #[test]
    fn test_schema_serde_round_trip() {
        let schema = EntitySchema::new("invoice")
            .with_version("2.0")
            .field(
                "status",
                FieldSpec::new(FieldType::String).with_allowed_values(vec![
                    Value::String("draft".into()),
                    Value::String("sent".into()),
                ]),
            )
            .indexed(&["status"]);

        let json = serde_json::to_string(&schema).unwrap();
        let back: EntitySchema = serde_json::from_str(&json).unwrap();
        assert_eq!(back.version, "2.0");
        assert_eq!(back.fields["status"].allowed_values.len(), 2);
        assert!(back.indexed_fields.contains("status"));
    }
}
