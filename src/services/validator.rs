//! Enqueue-time validation: schema contract + business rules + the
//! backpressure gate.
//!
//! Validation runs exactly once per operation, at enqueue. Later cache
//! changes never retroactively invalidate an operation; divergence is the
//! conflict resolver's problem during sync.

use crate::error::{EngineError, Result};
use crate::services::{OfflineStore, RuleEngine, SchemaRegistry};
use crate::types::{OperationKind, Payload};
use dashmap::DashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Combined validation outcome for one candidate operation.
#[derive(Debug, Clone, Default)]
pub struct ValidationOutcome {
    /// Schema errors followed by rule errors; empty means acceptable.
    pub errors: Vec<String>,
    /// The operation must wait for a sync handshake before executing.
    pub requires_sync: bool,
    /// Rule ids evaluated, recorded on the operation for audit.
    pub evaluated_rules: Vec<String>,
}

impl ValidationOutcome {
    pub fn is_acceptable(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Gates enqueues: schema + rules, plus per-entity-type backpressure with
/// high/low watermark hysteresis.
pub struct Validator {
    store: Arc<OfflineStore>,
    schemas: Arc<SchemaRegistry>,
    rules: Arc<RuleEngine>,
    high_water: u64,
    low_water: u64,
    /// Entity types currently rejecting enqueues until the upload queue
    /// drains below the low-water mark.
    gated: DashSet<String>,
}

impl Validator {
    pub fn new(
        store: Arc<OfflineStore>,
        schemas: Arc<SchemaRegistry>,
        rules: Arc<RuleEngine>,
        high_water: u64,
        low_water: u64,
    ) -> Self {
        Self {
            store,
            schemas,
            rules,
            high_water,
            low_water,
            gated: DashSet::new(),
        }
    }

    /// Reject the enqueue when the completed-unsynced backlog for this
    /// entity type is too deep. Once tripped, the gate stays closed until
    /// the backlog drains below the low-water mark.
    pub fn check_backpressure(&self, entity_type: &str) -> Result<()> {
        let depth = self.store.count_completed_unsynced_for_type(entity_type)?;

        if self.gated.contains(entity_type) {
            if depth <= self.low_water {
                self.gated.remove(entity_type);
                debug!("Backpressure released for '{entity_type}' at depth {depth}");
                return Ok(());
            }
            return Err(EngineError::Backpressure {
                entity_type: entity_type.to_string(),
                depth,
            });
        }

        if depth >= self.high_water {
            warn!("Backpressure tripped for '{entity_type}' at depth {depth}");
            self.gated.insert(entity_type.to_string());
            return Err(EngineError::Backpressure {
                entity_type: entity_type.to_string(),
                depth,
            });
        }

        Ok(())
    }

    /// Validate a candidate payload: schema errors first, then rule errors.
    pub fn validate(
        &self,
        entity_type: &str,
        payload: &Payload,
        kind: OperationKind,
    ) -> ValidationOutcome {
        let mut errors = self.schemas.validate_payload(entity_type, payload);
        let rule_outcome = self.rules.evaluate(entity_type, payload, kind);
        errors.extend(rule_outcome.errors);

        ValidationOutcome {
            errors,
            requires_sync: rule_outcome.requires_sync,
            evaluated_rules: rule_outcome.evaluated,
        }
    }
}
