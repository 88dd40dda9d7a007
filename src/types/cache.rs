//! Entity cache entries: the local materialized view of remote state.

use crate::types::Payload;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Payload field marking a soft-deleted entry awaiting sync acknowledgment.
pub const TOMBSTONE_FIELD: &str = "_deleted";

/// Local materialized state for one remote entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// `entity_type:entity_id`.
    pub cache_key: String,
    pub entity_type: String,
    pub entity_id: String,

    pub payload: Payload,
    /// Opaque metadata bag; persisted as-is, never interpreted.
    pub metadata: Map<String, Value>,

    pub created_at: i64,
    pub updated_at: i64,
    pub accessed_at: i64,
    pub expires_at: Option<i64>,

    /// Opaque version tag, advanced only by the sync coordinator.
    pub server_version: Option<String>,
    pub last_synced: Option<i64>,
    /// True iff local mutations exist that the server has not acknowledged.
    pub sync_required: bool,

    pub access_count: u64,
    /// Reads per hour since creation, floored at one hour.
    pub access_frequency: f64,
}

impl CacheEntry {
    pub fn key_for(entity_type: &str, entity_id: &str) -> String {
        format!("{entity_type}:{entity_id}")
    }

    /// Fresh entry for a locally created or server-installed entity.
    pub fn new(entity_type: &str, entity_id: &str, payload: Payload, now: i64) -> Self {
        Self {
            cache_key: Self::key_for(entity_type, entity_id),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            payload,
            metadata: Map::new(),
            created_at: now,
            updated_at: now,
            accessed_at: now,
            expires_at: None,
            server_version: None,
            last_synced: None,
            sync_required: false,
            access_count: 0,
            access_frequency: 0.0,
        }
    }

    pub fn is_tombstoned(&self) -> bool {
        self.payload.contains_key(TOMBSTONE_FIELD)
    }

    /// Mark the entry soft-deleted pending sync acknowledgment.
    pub fn tombstone(&mut self, now: i64) {
        self.payload
            .insert(TOMBSTONE_FIELD.to_string(), Value::Bool(true));
        self.updated_at = now;
        self.sync_required = true;
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.map(|at| at < now).unwrap_or(false)
    }

    /// Record a read and refresh the derived access frequency.
    pub fn record_access(&mut self, now: i64) {
        self.access_count += 1;
        self.accessed_at = now;
        let hours = ((now - self.created_at) as f64 / 3_600_000.0).max(1.0);
        self.access_frequency = self.access_count as f64 / hours;
    }
}
