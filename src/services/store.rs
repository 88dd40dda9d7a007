//! SQLite persistence layer for the operation engine.
//!
//! Everything that must survive restart lives here:
//! - Operations (the durable mutation log, retained through terminal states)
//! - Cache entries (local materialized entity state)
//! - Entity schemas and business rules
//! - Per-entity-type sync watermarks and parked conflicts
//!
//! All access goes through this store; callers never hold cursors across
//! calls. A restart against the same file reproduces the pre-restart state
//! exactly, including pending dependency edges.

use crate::error::{EngineError, Result};
use crate::types::{
    BusinessRule, CacheEntry, ConflictStrategy, EntitySchema, Operation, OperationKind,
    OperationMeta, OperationStatus, ParkedConflict, Payload, Priority, TOMBSTONE_FIELD,
};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

const OPERATION_COLUMNS: &str = "id, entity_type, entity_id, kind, payload, previous_payload, \
     user_id, session_id, device_id, created_at, executed_at, synced_at, status, priority, \
     depends_on, blocks, conflict_strategy, retry_count, max_retries, retry_at, requires_sync, \
     sync_retry_count, dead_letter, error_message, evaluated_rules, validation_errors";

const CACHE_COLUMNS: &str = "cache_key, entity_type, entity_id, payload, metadata, created_at, \
     updated_at, accessed_at, expires_at, server_version, last_synced, sync_required, \
     access_count, access_frequency";

/// Filter for pending-operation selection.
#[derive(Debug, Clone, Default)]
pub struct PendingFilter {
    pub entity_type: Option<String>,
    pub user_id: Option<String>,
    pub limit: usize,
    /// Operations with a `retry_at` after this instant are excluded.
    pub now: i64,
}

/// SQLite-backed durable store.
pub struct OfflineStore {
    conn: Mutex<Connection>,
    pub db_path: String,
}

impl OfflineStore {
    /// Open (or create) a store at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db_path = path.as_ref().to_string_lossy().to_string();
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
            db_path,
        };
        store.init_schema()?;
        info!("Offline store initialized");
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
            db_path: ":memory:".to_string(),
        };
        store.init_schema()?;
        debug!("In-memory offline store initialized");
        Ok(store)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<()> {
        let conn = self.lock_conn();

        // Operations table
        conn.execute(
            "CREATE TABLE IF NOT EXISTS operations (
                id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                previous_payload TEXT,
                user_id TEXT NOT NULL DEFAULT '',
                session_id TEXT NOT NULL DEFAULT '',
                device_id TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                executed_at INTEGER,
                synced_at INTEGER,
                status TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 1,
                depends_on TEXT NOT NULL DEFAULT '[]',
                blocks TEXT NOT NULL DEFAULT '[]',
                conflict_strategy TEXT NOT NULL DEFAULT 'client_wins',
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                retry_at INTEGER,
                requires_sync INTEGER NOT NULL DEFAULT 0,
                sync_retry_count INTEGER NOT NULL DEFAULT 0,
                dead_letter INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                evaluated_rules TEXT NOT NULL DEFAULT '[]',
                validation_errors TEXT NOT NULL DEFAULT '[]'
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_operations_entity ON operations(entity_type, entity_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_operations_status ON operations(status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_operations_created ON operations(created_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_operations_upload ON operations(status, dead_letter, priority DESC, created_at)",
            [],
        )?;

        // Cache entries table
        conn.execute(
            "CREATE TABLE IF NOT EXISTS cache_entries (
                cache_key TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                accessed_at INTEGER NOT NULL,
                expires_at INTEGER,
                server_version TEXT,
                last_synced INTEGER,
                sync_required INTEGER NOT NULL DEFAULT 0,
                access_count INTEGER NOT NULL DEFAULT 0,
                access_frequency REAL NOT NULL DEFAULT 0.0
            )",
            [],
        )?;

        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_cache_entity ON cache_entries(entity_type, entity_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_cache_sync ON cache_entries(sync_required)",
            [],
        )?;

        // Entity schemas table
        conn.execute(
            "CREATE TABLE IF NOT EXISTS entity_schemas (
                entity_type TEXT PRIMARY KEY,
                version TEXT NOT NULL,
                schema_json TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;

        // Business rules table
        conn.execute(
            "CREATE TABLE IF NOT EXISTS business_rules (
                rule_id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                rule_json TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 100,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_rules_entity ON business_rules(entity_type)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_rules_enabled ON business_rules(enabled)",
            [],
        )?;

        // Per-entity-type sync watermarks
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sync_watermarks (
                entity_type TEXT PRIMARY KEY,
                watermark TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;

        // Parked conflicts awaiting manual resolution
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sync_conflicts (
                id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                local_payload TEXT NOT NULL,
                server_payload TEXT NOT NULL,
                detected_at INTEGER NOT NULL,
                resolved_at INTEGER
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_conflicts_unresolved ON sync_conflicts(detected_at)
             WHERE resolved_at IS NULL",
            [],
        )?;

        Ok(())
    }

    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means a worker panicked mid-write; the data is
        // still consistent because every write is a single statement.
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ========== Operations ==========

    /// Store an operation, replacing any existing record with the same id.
    pub fn put_operation(&self, op: &Operation) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT OR REPLACE INTO operations (
                id, entity_type, entity_id, kind, payload, previous_payload,
                user_id, session_id, device_id, created_at, executed_at, synced_at,
                status, priority, depends_on, blocks, conflict_strategy,
                retry_count, max_retries, retry_at, requires_sync,
                sync_retry_count, dead_letter, error_message,
                evaluated_rules, validation_errors
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                      ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)",
            params![
                op.id,
                op.entity_type,
                op.entity_id,
                op.kind.as_str(),
                serde_json::to_string(&op.payload)?,
                op.previous_payload
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                op.meta.user_id,
                op.meta.session_id,
                op.meta.device_id,
                op.created_at,
                op.executed_at,
                op.synced_at,
                op.status.as_str(),
                op.priority.rank(),
                serde_json::to_string(&op.depends_on)?,
                serde_json::to_string(&op.blocks)?,
                op.conflict_strategy.as_str(),
                op.retry_count,
                op.max_retries,
                op.retry_at,
                op.requires_sync as i64,
                op.sync_retry_count,
                op.dead_letter as i64,
                op.error_message,
                serde_json::to_string(&op.evaluated_rules)?,
                serde_json::to_string(&op.validation_errors)?,
            ],
        )?;
        Ok(())
    }

    /// Get an operation by id.
    pub fn get_operation(&self, id: &str) -> Result<Option<Operation>> {
        let conn = self.lock_conn();
        let op = conn
            .query_row(
                &format!("SELECT {OPERATION_COLUMNS} FROM operations WHERE id = ?1"),
                params![id],
                row_to_operation,
            )
            .optional()?;
        Ok(op)
    }

    /// Atomically claim a pending operation for execution. Returns false if
    /// another worker got there first (or the operation left `pending`).
    pub fn claim_operation(&self, id: &str) -> Result<bool> {
        let conn = self.lock_conn();
        let changed = conn.execute(
            "UPDATE operations SET status = 'executing' WHERE id = ?1 AND status = 'pending'",
            params![id],
        )?;
        Ok(changed == 1)
    }

    /// Cancel a pending operation. Returns false when the operation is not
    /// in `pending` (executing operations must finish naturally).
    pub fn cancel_operation(&self, id: &str) -> Result<bool> {
        let conn = self.lock_conn();
        let changed = conn.execute(
            "UPDATE operations SET status = 'cancelled' WHERE id = ?1 AND status = 'pending'",
            params![id],
        )?;
        Ok(changed == 1)
    }

    /// Cancel every pending operation targeting an entity; returns the ids
    /// actually cancelled. Used by server-wins conflict resolution.
    pub fn cancel_pending_for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<String>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id FROM operations
             WHERE entity_type = ?1 AND entity_id = ?2 AND status = 'pending'",
        )?;
        let ids: Vec<String> = stmt
            .query_map(params![entity_type, entity_id], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);

        let mut cancelled = Vec::new();
        for id in ids {
            let changed = conn.execute(
                "UPDATE operations SET status = 'cancelled' WHERE id = ?1 AND status = 'pending'",
                params![&id],
            )?;
            if changed == 1 {
                cancelled.push(id);
            }
        }
        Ok(cancelled)
    }

    /// List schedulable pending operations: validation passed and any retry
    /// backoff has elapsed. Ordered by priority descending, then created_at
    /// ascending.
    pub fn list_pending(&self, filter: &PendingFilter) -> Result<Vec<Operation>> {
        let conn = self.lock_conn();

        let mut sql = format!(
            "SELECT {OPERATION_COLUMNS} FROM operations
             WHERE status = 'pending' AND validation_errors = '[]'
               AND (retry_at IS NULL OR retry_at <= ?1)"
        );
        let mut values: Vec<rusqlite::types::Value> = vec![filter.now.into()];

        if let Some(ref entity_type) = filter.entity_type {
            values.push(entity_type.clone().into());
            sql.push_str(&format!(" AND entity_type = ?{}", values.len()));
        }
        if let Some(ref user_id) = filter.user_id {
            values.push(user_id.clone().into());
            sql.push_str(&format!(" AND user_id = ?{}", values.len()));
        }

        values.push((filter.limit.max(1) as i64).into());
        sql.push_str(&format!(
            " ORDER BY priority DESC, created_at ASC LIMIT ?{}",
            values.len()
        ));

        let mut stmt = conn.prepare(&sql)?;
        let ops = stmt
            .query_map(params_from_iter(values), row_to_operation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ops)
    }

    /// Completed operations awaiting upload, excluding dead letters.
    pub fn list_completed_unsynced(&self, limit: usize) -> Result<Vec<Operation>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {OPERATION_COLUMNS} FROM operations
             WHERE status = 'completed' AND dead_letter = 0
             ORDER BY priority DESC, created_at ASC LIMIT ?1"
        ))?;
        let ops = stmt
            .query_map(params![limit.max(1) as i64], row_to_operation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ops)
    }

    /// Earliest completion instant among unsynced operations for one
    /// entity. Drives the per-entity upload-order guard.
    pub fn earliest_unsynced_executed_at(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<i64>> {
        let conn = self.lock_conn();
        let earliest: Option<i64> = conn.query_row(
            "SELECT MIN(executed_at) FROM operations
             WHERE entity_type = ?1 AND entity_id = ?2
               AND status = 'completed' AND dead_letter = 0",
            params![entity_type, entity_id],
            |row| row.get(0),
        )?;
        Ok(earliest)
    }

    /// Backpressure depth: completed-and-unsynced operations for one type.
    pub fn count_completed_unsynced_for_type(&self, entity_type: &str) -> Result<u64> {
        let conn = self.lock_conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM operations
             WHERE entity_type = ?1 AND status = 'completed' AND dead_letter = 0",
            params![entity_type],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Completed-and-unsynced operations still referencing one entity.
    pub fn count_completed_unsynced_for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<u64> {
        let conn = self.lock_conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM operations
             WHERE entity_type = ?1 AND entity_id = ?2
               AND status = 'completed' AND dead_letter = 0",
            params![entity_type, entity_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Most recent unacknowledged local intent for an entity; names the
    /// conflict strategy the resolver applies.
    pub fn latest_intent_for_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<Operation>> {
        let conn = self.lock_conn();
        let op = conn
            .query_row(
                &format!(
                    "SELECT {OPERATION_COLUMNS} FROM operations
                     WHERE entity_type = ?1 AND entity_id = ?2
                       AND status IN ('pending', 'executing', 'completed')
                     ORDER BY created_at DESC, id DESC LIMIT 1"
                ),
                params![entity_type, entity_id],
                row_to_operation,
            )
            .optional()?;
        Ok(op)
    }

    /// Operations that exhausted their sync retries.
    pub fn list_dead_letters(&self, limit: usize) -> Result<Vec<Operation>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {OPERATION_COLUMNS} FROM operations
             WHERE dead_letter = 1 ORDER BY created_at ASC LIMIT ?1"
        ))?;
        let ops = stmt
            .query_map(params![limit.max(1) as i64], row_to_operation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ops)
    }

    /// Operation counts grouped by status.
    pub fn status_counts(&self) -> Result<BTreeMap<String, u64>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM operations GROUP BY status")?;
        let counts = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;
        Ok(counts)
    }

    pub fn count_dead_letters(&self) -> Result<u64> {
        let conn = self.lock_conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM operations WHERE dead_letter = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Pending operations that passed validation (the scheduler's queue
    /// depth, ignoring dependency/backoff gating).
    pub fn count_schedulable_pending(&self) -> Result<u64> {
        let conn = self.lock_conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM operations
             WHERE status = 'pending' AND validation_errors = '[]'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn count_executing(&self) -> Result<u64> {
        let conn = self.lock_conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM operations WHERE status = 'executing'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Delete synced/terminal operations created before the cutoff.
    pub fn compact_operations(&self, cutoff: i64) -> Result<usize> {
        let conn = self.lock_conn();
        let deleted = conn.execute(
            "DELETE FROM operations
             WHERE created_at < ?1 AND status IN ('synced', 'failed', 'cancelled')",
            params![cutoff],
        )?;
        Ok(deleted)
    }

    // ========== Cache entries ==========

    /// Store a cache entry, replacing any existing entry with the same key.
    pub fn put_cache_entry(&self, entry: &CacheEntry) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT OR REPLACE INTO cache_entries (
                cache_key, entity_type, entity_id, payload, metadata,
                created_at, updated_at, accessed_at, expires_at,
                server_version, last_synced, sync_required,
                access_count, access_frequency
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                entry.cache_key,
                entry.entity_type,
                entry.entity_id,
                serde_json::to_string(&entry.payload)?,
                serde_json::to_string(&entry.metadata)?,
                entry.created_at,
                entry.updated_at,
                entry.accessed_at,
                entry.expires_at,
                entry.server_version,
                entry.last_synced,
                entry.sync_required as i64,
                entry.access_count as i64,
                entry.access_frequency,
            ],
        )?;
        Ok(())
    }

    /// Get a cache entry, recording the access (count, last-accessed,
    /// derived frequency).
    pub fn get_cache_entry(&self, cache_key: &str, now: i64) -> Result<Option<CacheEntry>> {
        let conn = self.lock_conn();
        let entry = conn
            .query_row(
                &format!("SELECT {CACHE_COLUMNS} FROM cache_entries WHERE cache_key = ?1"),
                params![cache_key],
                row_to_cache_entry,
            )
            .optional()?;

        let Some(mut entry) = entry else {
            return Ok(None);
        };

        entry.record_access(now);
        conn.execute(
            "UPDATE cache_entries
             SET accessed_at = ?1, access_count = ?2, access_frequency = ?3
             WHERE cache_key = ?4",
            params![
                entry.accessed_at,
                entry.access_count as i64,
                entry.access_frequency,
                cache_key
            ],
        )?;
        Ok(Some(entry))
    }

    /// Remove a cache entry outright (tombstone compaction after a synced
    /// delete).
    pub fn delete_cache_entry(&self, cache_key: &str) -> Result<bool> {
        let conn = self.lock_conn();
        let deleted = conn.execute(
            "DELETE FROM cache_entries WHERE cache_key = ?1",
            params![cache_key],
        )?;
        Ok(deleted == 1)
    }

    /// Equality-predicate query over cached entities of one type.
    /// Tombstoned entries are excluded.
    pub fn query_cache(
        &self,
        entity_type: &str,
        filters: &[(String, Value)],
        limit: usize,
    ) -> Result<Vec<CacheEntry>> {
        let conn = self.lock_conn();

        let mut sql = format!(
            "SELECT {CACHE_COLUMNS} FROM cache_entries
             WHERE entity_type = ?1
               AND json_extract(payload, '$.{TOMBSTONE_FIELD}') IS NULL"
        );
        let mut values: Vec<rusqlite::types::Value> = vec![entity_type.to_string().into()];

        for (field, value) in filters {
            let sql_value = scalar_to_sql(value).ok_or_else(|| {
                EngineError::IllegalState(format!(
                    "query filter on '{field}' must be a scalar value"
                ))
            })?;
            values.push(sql_value);
            sql.push_str(&format!(
                " AND json_extract(payload, '$.{}') = ?{}",
                sanitize_json_path(field),
                values.len()
            ));
        }

        values.push((limit.max(1) as i64).into());
        sql.push_str(&format!(" ORDER BY cache_key ASC LIMIT ?{}", values.len()));

        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map(params_from_iter(values), row_to_cache_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Total entries and entries awaiting sync.
    pub fn cache_stats(&self) -> Result<(u64, u64)> {
        let conn = self.lock_conn();
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))?;
        let pending: i64 = conn.query_row(
            "SELECT COUNT(*) FROM cache_entries WHERE sync_required = 1",
            [],
            |row| row.get(0),
        )?;
        Ok((total as u64, pending as u64))
    }

    /// Remove cache entries past their expiry; returns the count removed.
    pub fn compact_expired(&self, now: i64) -> Result<usize> {
        let conn = self.lock_conn();
        let deleted = conn.execute(
            "DELETE FROM cache_entries WHERE expires_at IS NOT NULL AND expires_at < ?1",
            params![now],
        )?;
        Ok(deleted)
    }

    // ========== Schemas ==========

    pub fn put_schema(&self, schema: &EntitySchema, now: i64) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO entity_schemas (entity_type, version, schema_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(entity_type) DO UPDATE SET
                 version = excluded.version,
                 schema_json = excluded.schema_json,
                 updated_at = excluded.updated_at",
            params![
                schema.entity_type,
                schema.version,
                serde_json::to_string(schema)?,
                now
            ],
        )?;
        Ok(())
    }

    pub fn get_schema(&self, entity_type: &str) -> Result<Option<EntitySchema>> {
        let conn = self.lock_conn();
        let json: Option<String> = conn
            .query_row(
                "SELECT schema_json FROM entity_schemas WHERE entity_type = ?1",
                params![entity_type],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j).map_err(corrupt_json("entity_schemas.schema_json")))
            .transpose()
    }

    pub fn list_schemas(&self) -> Result<Vec<EntitySchema>> {
        let conn = self.lock_conn();
        let mut stmt =
            conn.prepare("SELECT schema_json FROM entity_schemas ORDER BY entity_type ASC")?;
        let jsons = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        jsons
            .into_iter()
            .map(|j| serde_json::from_str(&j).map_err(corrupt_json("entity_schemas.schema_json")))
            .collect()
    }

    // ========== Business rules ==========

    pub fn put_rule(&self, rule: &BusinessRule, now: i64) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO business_rules (rule_id, entity_type, rule_json, priority, enabled, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(rule_id) DO UPDATE SET
                 entity_type = excluded.entity_type,
                 rule_json = excluded.rule_json,
                 priority = excluded.priority,
                 enabled = excluded.enabled,
                 updated_at = excluded.updated_at",
            params![
                rule.rule_id,
                rule.entity_type,
                serde_json::to_string(rule)?,
                rule.priority,
                rule.enabled as i64,
                now
            ],
        )?;
        Ok(())
    }

    /// Rules for one entity type in evaluation order: priority ascending,
    /// then insertion order.
    pub fn list_rules_for_type(&self, entity_type: &str) -> Result<Vec<BusinessRule>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT rule_json FROM business_rules
             WHERE entity_type = ?1
             ORDER BY priority ASC, created_at ASC, rule_id ASC",
        )?;
        let jsons = stmt
            .query_map(params![entity_type], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        jsons
            .into_iter()
            .map(|j| serde_json::from_str(&j).map_err(corrupt_json("business_rules.rule_json")))
            .collect()
    }

    pub fn list_rules(&self) -> Result<Vec<BusinessRule>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT rule_json FROM business_rules
             ORDER BY entity_type ASC, priority ASC, created_at ASC, rule_id ASC",
        )?;
        let jsons = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        jsons
            .into_iter()
            .map(|j| serde_json::from_str(&j).map_err(corrupt_json("business_rules.rule_json")))
            .collect()
    }

    // ========== Sync watermarks ==========

    pub fn get_watermark(&self, entity_type: &str) -> Result<Option<String>> {
        let conn = self.lock_conn();
        let wm = conn
            .query_row(
                "SELECT watermark FROM sync_watermarks WHERE entity_type = ?1",
                params![entity_type],
                |row| row.get(0),
            )
            .optional()?;
        Ok(wm)
    }

    pub fn put_watermark(&self, entity_type: &str, watermark: &str, now: i64) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO sync_watermarks (entity_type, watermark, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(entity_type) DO UPDATE SET
                 watermark = excluded.watermark,
                 updated_at = excluded.updated_at",
            params![entity_type, watermark, now],
        )?;
        Ok(())
    }

    // ========== Parked conflicts ==========

    pub fn put_conflict(&self, conflict: &ParkedConflict) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT OR REPLACE INTO sync_conflicts (
                id, entity_type, entity_id, local_payload, server_payload,
                detected_at, resolved_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                conflict.id,
                conflict.entity_type,
                conflict.entity_id,
                serde_json::to_string(&conflict.local_payload)?,
                serde_json::to_string(&conflict.server_payload)?,
                conflict.detected_at,
                conflict.resolved_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_conflict(&self, id: &str) -> Result<Option<ParkedConflict>> {
        let conn = self.lock_conn();
        let conflict = conn
            .query_row(
                "SELECT id, entity_type, entity_id, local_payload, server_payload,
                        detected_at, resolved_at
                 FROM sync_conflicts WHERE id = ?1",
                params![id],
                row_to_conflict,
            )
            .optional()?;
        Ok(conflict)
    }

    pub fn list_unresolved_conflicts(&self) -> Result<Vec<ParkedConflict>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, entity_type, entity_id, local_payload, server_payload,
                    detected_at, resolved_at
             FROM sync_conflicts WHERE resolved_at IS NULL
             ORDER BY detected_at ASC",
        )?;
        let conflicts = stmt
            .query_map([], row_to_conflict)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(conflicts)
    }

    pub fn count_unresolved_conflicts(&self) -> Result<u64> {
        let conn = self.lock_conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sync_conflicts WHERE resolved_at IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn mark_conflict_resolved(&self, id: &str, now: i64) -> Result<bool> {
        let conn = self.lock_conn();
        let changed = conn.execute(
            "UPDATE sync_conflicts SET resolved_at = ?1 WHERE id = ?2 AND resolved_at IS NULL",
            params![now, id],
        )?;
        Ok(changed == 1)
    }
}

// ========== Row mapping ==========

fn row_to_operation(row: &Row<'_>) -> rusqlite::Result<Operation> {
    let kind_str: String = row.get(3)?;
    let kind = OperationKind::parse(&kind_str)
        .ok_or_else(|| corrupt_column(3, format!("unknown operation kind '{kind_str}'")))?;

    let status_str: String = row.get(12)?;
    let status = OperationStatus::parse(&status_str)
        .ok_or_else(|| corrupt_column(12, format!("unknown operation status '{status_str}'")))?;

    let strategy_str: String = row.get(16)?;
    let conflict_strategy = ConflictStrategy::parse(&strategy_str)
        .ok_or_else(|| corrupt_column(16, format!("unknown conflict strategy '{strategy_str}'")))?;

    Ok(Operation {
        id: row.get(0)?,
        entity_type: row.get(1)?,
        entity_id: row.get(2)?,
        kind,
        payload: parse_json_column(row, 4)?,
        previous_payload: parse_optional_json_column(row, 5)?,
        meta: OperationMeta {
            user_id: row.get(6)?,
            session_id: row.get(7)?,
            device_id: row.get(8)?,
        },
        created_at: row.get(9)?,
        executed_at: row.get(10)?,
        synced_at: row.get(11)?,
        status,
        priority: Priority::from_rank(row.get::<_, i64>(13)? as u8),
        depends_on: parse_json_list(row, 14)?,
        blocks: parse_json_list(row, 15)?,
        conflict_strategy,
        retry_count: row.get::<_, i64>(17)? as u32,
        max_retries: row.get::<_, i64>(18)? as u32,
        retry_at: row.get(19)?,
        requires_sync: row.get::<_, i64>(20)? != 0,
        sync_retry_count: row.get::<_, i64>(21)? as u32,
        dead_letter: row.get::<_, i64>(22)? != 0,
        error_message: row.get(23)?,
        evaluated_rules: parse_json_list(row, 24)?,
        validation_errors: parse_json_list(row, 25)?,
    })
}

fn row_to_cache_entry(row: &Row<'_>) -> rusqlite::Result<CacheEntry> {
    Ok(CacheEntry {
        cache_key: row.get(0)?,
        entity_type: row.get(1)?,
        entity_id: row.get(2)?,
        payload: parse_json_column(row, 3)?,
        metadata: parse_json_column(row, 4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        accessed_at: row.get(7)?,
        expires_at: row.get(8)?,
        server_version: row.get(9)?,
        last_synced: row.get(10)?,
        sync_required: row.get::<_, i64>(11)? != 0,
        access_count: row.get::<_, i64>(12)? as u64,
        access_frequency: row.get(13)?,
    })
}

fn row_to_conflict(row: &Row<'_>) -> rusqlite::Result<ParkedConflict> {
    Ok(ParkedConflict {
        id: row.get(0)?,
        entity_type: row.get(1)?,
        entity_id: row.get(2)?,
        local_payload: parse_json_column(row, 3)?,
        server_payload: parse_json_column(row, 4)?,
        detected_at: row.get(5)?,
        resolved_at: row.get(6)?,
    })
}

fn parse_json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Payload> {
    let raw: String = row.get(idx)?;
    serde_json::from_str::<Map<String, Value>>(&raw)
        .map_err(|e| corrupt_column(idx, format!("payload column is not a JSON object: {e}")))
}

fn parse_optional_json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Payload>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| {
        serde_json::from_str::<Map<String, Value>>(&r)
            .map_err(|e| corrupt_column(idx, format!("payload column is not a JSON object: {e}")))
    })
    .transpose()
}

fn parse_json_list(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<String>> {
    let raw: String = row.get(idx)?;
    serde_json::from_str::<Vec<String>>(&raw)
        .map_err(|e| corrupt_column(idx, format!("list column is not a JSON array: {e}")))
}

/// Corruption detected while reading a row. Surfaced as a fatal storage
/// error; the engine refuses to proceed on this record.
fn corrupt_column(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn corrupt_json(column: &'static str) -> impl FnOnce(serde_json::Error) -> EngineError {
    move |e| EngineError::Storage(format!("{column} is corrupt: {e}"))
}

/// Convert a scalar JSON value to a SQL parameter for `json_extract`
/// comparison. Objects and arrays are rejected.
fn scalar_to_sql(value: &Value) -> Option<rusqlite::types::Value> {
    match value {
        Value::Null => Some(rusqlite::types::Value::Null),
        Value::Bool(b) => Some((*b as i64).into()),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.into())
            } else {
                n.as_f64().map(|f| f.into())
            }
        }
        Value::String(s) => Some(s.clone().into()),
        Value::Array(_) | Value::Object(_) => None,
    }
}

/// Strip characters that would escape a `json_extract` path expression.
fn sanitize_json_path(field: &str) -> String {
    field
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}
