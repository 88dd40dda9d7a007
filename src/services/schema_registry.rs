//! Entity schema registry and payload validation.
//!
//! Schemas are read-mostly: hydrated from the store at construction,
//! cached in memory, persisted on registration. Field validation is a pure
//! function so identical inputs always produce identical error lists.

use crate::error::Result;
use crate::services::OfflineStore;
use crate::types::{EntitySchema, FieldSpec, FieldType, Payload};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// Registry of entity schemas.
pub struct SchemaRegistry {
    store: Arc<OfflineStore>,
    schemas: DashMap<String, EntitySchema>,
}

impl SchemaRegistry {
    /// Create a registry hydrated from persisted schemas.
    pub fn new(store: Arc<OfflineStore>) -> Result<Self> {
        let schemas = DashMap::new();
        for schema in store.list_schemas()? {
            schemas.insert(schema.entity_type.clone(), schema);
        }
        debug!("Schema registry hydrated with {} schemas", schemas.len());
        Ok(Self { store, schemas })
    }

    /// Register (or supersede) a schema. The new version is used for all
    /// subsequent validations.
    pub fn register(&self, schema: EntitySchema, now: i64) -> Result<()> {
        self.store.put_schema(&schema, now)?;
        info!(
            "Registered schema for '{}' version {}",
            schema.entity_type, schema.version
        );
        self.schemas.insert(schema.entity_type.clone(), schema);
        Ok(())
    }

    pub fn get(&self, entity_type: &str) -> Option<EntitySchema> {
        self.schemas.get(entity_type).map(|s| s.clone())
    }

    /// Registered entity types, sorted for deterministic iteration.
    pub fn entity_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.schemas.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }

    /// Validate a payload against the schema for its entity type. Missing
    /// required fields are reported first, then per-field errors. Errors
    /// accumulate; nothing short-circuits. An unregistered entity type
    /// validates clean.
    pub fn validate_payload(&self, entity_type: &str, payload: &Payload) -> Vec<String> {
        let Some(schema) = self.schemas.get(entity_type) else {
            return Vec::new();
        };

        let mut errors = Vec::new();

        for field in &schema.required_fields {
            match payload.get(field) {
                None | Some(Value::Null) => {
                    errors.push(format!("Required field '{field}' is missing"));
                }
                Some(_) => {}
            }
        }

        for (name, spec) in &schema.fields {
            if let Some(value) = payload.get(name) {
                if value.is_null() {
                    continue;
                }
                errors.extend(validate_field(name, value, spec));
            }
        }

        errors
    }
}

/// Validate a single value against its declared field spec. Pure function.
pub fn validate_field(name: &str, value: &Value, spec: &FieldSpec) -> Vec<String> {
    let mut errors = Vec::new();

    match spec.field_type {
        FieldType::String => match value {
            Value::String(s) => {
                if let Some(min) = spec.min_length {
                    if s.chars().count() < min {
                        errors.push(format!("Field '{name}' must be at least {min} characters"));
                    }
                }
                if let Some(max) = spec.max_length {
                    if s.chars().count() > max {
                        errors.push(format!("Field '{name}' must be at most {max} characters"));
                    }
                }
            }
            _ => errors.push(format!("Field '{name}' must be a string")),
        },

        FieldType::Decimal => match value.as_f64() {
            Some(n) => {
                if let Some(min) = spec.min {
                    if n < min {
                        errors.push(format!("Field '{name}' must be at least {min}"));
                    }
                }
                if let Some(max) = spec.max {
                    if n > max {
                        errors.push(format!("Field '{name}' must be at most {max}"));
                    }
                }
            }
            None => errors.push(format!("Field '{name}' must be a number")),
        },

        FieldType::Email => {
            let valid = matches!(value, Value::String(s) if s.contains('@'));
            if !valid {
                errors.push(format!("Field '{name}' must be a valid email address"));
            }
        }

        FieldType::Date => {
            if !is_valid_date(value) {
                errors.push(format!("Field '{name}' must be a valid date"));
            }
        }

        FieldType::Boolean => {
            if !value.is_boolean() {
                errors.push(format!("Field '{name}' must be a boolean"));
            }
        }

        FieldType::Array => {
            if !value.is_array() {
                errors.push(format!("Field '{name}' must be an array"));
            }
        }

        FieldType::Object => {
            if !value.is_object() {
                errors.push(format!("Field '{name}' must be an object"));
            }
        }

        // Membership check only; handled below with the shared enum path.
        FieldType::Enum => {}
    }

    // The enumerated-set check applies whenever a set is declared,
    // independent of the declared type.
    if !spec.allowed_values.is_empty() && !spec.allowed_values.contains(value) {
        let allowed: Vec<String> = spec
            .allowed_values
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
        errors.push(format!(
            "Field '{name}' must be one of: {}",
            allowed.join(", ")
        ));
    }

    errors
}

/// A date is an RFC 3339 string (trailing `Z` permitted) or an epoch-millis
/// number carried through from an already-parsed datetime.
fn is_valid_date(value: &Value) -> bool {
    match value {
        Value::String(s) => chrono::DateTime::parse_from_rfc3339(s).is_ok(),
        Value::Number(n) => n.is_i64() || n.is_u64(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(field_type: FieldType) -> FieldSpec {
        FieldSpec::new(field_type)
    }

    #[test]
    fn test_string_length_bounds() {
        let s = spec(FieldType::String).with_length(Some(2), Some(4));
        assert!(validate_field("code", &json!("abc"), &s).is_empty());
        assert_eq!(
            validate_field("code", &json!("a"), &s),
            vec!["Field 'code' must be at least 2 characters"]
        );
        assert_eq!(
            validate_field("code", &json!("abcde"), &s),
            vec!["Field 'code' must be at most 4 characters"]
        );
        assert_eq!(
            validate_field("code", &json!(12), &s),
            vec!["Field 'code' must be a string"]
        );
    }

    #[test]
    fn test_decimal_bounds() {
        let s = spec(FieldType::Decimal).with_min(0.0).with_max(100.0);
        assert!(validate_field("amount", &json!(50), &s).is_empty());
        assert!(validate_field("amount", &json!(49.5), &s).is_empty());
        assert_eq!(
            validate_field("amount", &json!(-1), &s),
            vec!["Field 'amount' must be at least 0"]
        );
        assert_eq!(
            validate_field("amount", &json!(101), &s),
            vec!["Field 'amount' must be at most 100"]
        );
        assert_eq!(
            validate_field("amount", &json!("50"), &s),
            vec!["Field 'amount' must be a number"]
        );
    }

    #[test]
    fn test_email() {
        let s = spec(FieldType::Email);
        assert!(validate_field("email", &json!("a@b.com"), &s).is_empty());
        assert_eq!(
            validate_field("email", &json!("not-an-email"), &s),
            vec!["Field 'email' must be a valid email address"]
        );
        assert_eq!(
            validate_field("email", &json!(5), &s),
            vec!["Field 'email' must be a valid email address"]
        );
    }

    #[test]
    fn test_date_accepts_rfc3339_with_z() {
        let s = spec(FieldType::Date);
        assert!(validate_field("due", &json!("2025-01-15T10:30:00Z"), &s).is_empty());
        assert!(validate_field("due", &json!("2025-01-15T10:30:00+09:00"), &s).is_empty());
        assert!(validate_field("due", &json!(1_736_937_000_000i64), &s).is_empty());
        assert_eq!(
            validate_field("due", &json!("January 15"), &s),
            vec!["Field 'due' must be a valid date"]
        );
    }

    #[test]
    fn test_boolean_is_strict() {
        let s = spec(FieldType::Boolean);
        assert!(validate_field("active", &json!(true), &s).is_empty());
        assert_eq!(
            validate_field("active", &json!(1), &s),
            vec!["Field 'active' must be a boolean"]
        );
        assert_eq!(
            validate_field("active", &json!("true"), &s),
            vec!["Field 'active' must be a boolean"]
        );
    }

    #[test]
    fn test_enum_membership() {
        let s = spec(FieldType::String)
            .with_allowed_values(vec![json!("draft"), json!("sent"), json!("paid")]);
        assert!(validate_field("status", &json!("sent"), &s).is_empty());
        assert_eq!(
            validate_field("status", &json!("void"), &s),
            vec!["Field 'status' must be one of: draft, sent, paid"]
        );
    }

    #[test]
    fn test_array_and_object_shape() {
        assert!(validate_field("items", &json!([1, 2]), &spec(FieldType::Array)).is_empty());
        assert_eq!(
            validate_field("items", &json!("nope"), &spec(FieldType::Array)),
            vec!["Field 'items' must be an array"]
        );
        assert!(validate_field("extra", &json!({"a": 1}), &spec(FieldType::Object)).is_empty());
        assert_eq!(
            validate_field("extra", &json!([]), &spec(FieldType::Object)),
            vec!["Field 'extra' must be an object"]
        );
    }
}
