//! Sync coordinator: bridges local state to the remote server.
//!
//! Runs on its own slow tick. Each pass uploads completed operations in
//! per-entity completion order, then downloads server-originated changes
//! per entity type behind a persisted watermark. Transport-level failures
//! are non-fatal and retried next tick; per-operation failures count
//! toward dead-lettering.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::services::conflict::{ConflictResolver, Resolution};
use crate::services::{OfflineStore, SchemaRegistry};
use crate::transport::{AuthProvider, AuthToken, Clock, TransportClient};
use crate::types::{
    CacheEntry, ConflictStrategy, Operation, OperationStatus, ParkedConflict, Payload,
    ServerChange, SyncEvent, UploadResult, TOMBSTONE_FIELD,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Coordinates upload/download passes against the embedder's transport.
pub struct SyncCoordinator {
    store: Arc<OfflineStore>,
    clock: Arc<dyn Clock>,
    transport: Arc<dyn TransportClient>,
    auth: Arc<dyn AuthProvider>,
    resolver: Arc<ConflictResolver>,
    schemas: Arc<SchemaRegistry>,
    config: EngineConfig,
    /// Flipped after the first successful transport round-trip; read by
    /// the scheduler to release require-sync operations.
    handshake_done: Arc<AtomicBool>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<OfflineStore>,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn TransportClient>,
        auth: Arc<dyn AuthProvider>,
        resolver: Arc<ConflictResolver>,
        schemas: Arc<SchemaRegistry>,
        config: EngineConfig,
        handshake_done: Arc<AtomicBool>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            store,
            clock,
            transport,
            auth,
            resolver,
            schemas,
            config,
            handshake_done,
            events,
        })
    }

    /// Subscribe to sync events. Lagging receivers are dropped by the
    /// channel; the coordinator never waits on them.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Start the sync loop. Runs until the shutdown signal flips.
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        info!("Starting sync coordinator (interval: {:?})", self.config.sync_interval);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.sync_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                if *shutdown.borrow() {
                    debug!("Sync coordinator shutting down");
                    break;
                }
                self.tick().await;
            }
        })
    }

    /// One full sync pass: upload, then download. Pass-level failures are
    /// logged and retried on the next tick, never raised. Public so
    /// embedders can pump sync on their own cadence.
    pub async fn tick(&self) {
        if let Err(e) = self.upload_pass().await {
            error!("Upload pass failed: {e}");
        }
        if let Err(e) = self.download_pass().await {
            error!("Download pass failed: {e}");
        }
    }

    // ========== Upload ==========

    /// Ship completed-and-unsynced operations, grouped by entity type,
    /// preserving per-(type, id) completion order.
    pub async fn upload_pass(&self) -> Result<()> {
        let candidates = self
            .store
            .list_completed_unsynced(self.config.upload_batch_size)?;
        if candidates.is_empty() {
            return Ok(());
        }

        let groups = self.order_for_upload(candidates)?;
        if groups.is_empty() {
            return Ok(());
        }

        let token = match self.auth.token().await {
            Ok(token) => token,
            Err(e) => {
                warn!("Auth provider unavailable, deferring upload: {e}");
                return Ok(());
            }
        };

        for (entity_type, ops) in groups {
            self.upload_group(&token, &entity_type, ops).await?;
        }
        Ok(())
    }

    /// Group candidates by entity type with each entity's operations in
    /// completion order. An entity whose earliest unsynced operation did
    /// not make the batch is deferred entirely so order is never inverted.
    fn order_for_upload(
        &self,
        candidates: Vec<Operation>,
    ) -> Result<BTreeMap<String, Vec<Operation>>> {
        let mut per_entity: BTreeMap<(String, String), Vec<Operation>> = BTreeMap::new();
        for op in candidates {
            per_entity
                .entry((op.entity_type.clone(), op.entity_id.clone()))
                .or_default()
                .push(op);
        }

        let mut groups: BTreeMap<String, Vec<Operation>> = BTreeMap::new();
        for ((entity_type, entity_id), mut ops) in per_entity {
            ops.sort_by_key(|op| (op.executed_at.unwrap_or(op.created_at), op.created_at));

            let batch_earliest = ops
                .first()
                .and_then(|op| op.executed_at)
                .unwrap_or(i64::MAX);
            if let Some(store_earliest) = self
                .store
                .earliest_unsynced_executed_at(&entity_type, &entity_id)?
            {
                if store_earliest < batch_earliest {
                    debug!(
                        "Deferring upload for {entity_type}:{entity_id}: earlier completion not in batch"
                    );
                    continue;
                }
            }
            groups.entry(entity_type).or_default().extend(ops);
        }
        Ok(groups)
    }

    async fn upload_group(
        &self,
        token: &AuthToken,
        entity_type: &str,
        ops: Vec<Operation>,
    ) -> Result<()> {
        let call = self.transport.upload_batch(token, entity_type, &ops);
        let acks = match timeout(self.config.transport_timeout, call).await {
            Err(_) => {
                warn!("Upload batch for '{entity_type}' timed out; retrying next tick");
                return Ok(());
            }
            Ok(Err(e)) => {
                warn!("Upload batch for '{entity_type}' failed: {e}; retrying next tick");
                return Ok(());
            }
            Ok(Ok(acks)) => acks,
        };

        self.handshake_done.store(true, Ordering::Release);

        let mut by_id: BTreeMap<String, Operation> =
            ops.into_iter().map(|op| (op.id.clone(), op)).collect();
        let now = self.clock.now_millis();
        let mut synced = 0usize;
        let mut failed = 0usize;

        for ack in acks {
            let Some(mut op) = by_id.remove(&ack.operation_id) else {
                warn!("Transport acked unknown operation {}", ack.operation_id);
                continue;
            };

            match ack.result {
                UploadResult::Acked { server_version } => {
                    op.status = OperationStatus::Synced;
                    op.synced_at = Some(now);
                    self.store.put_operation(&op)?;
                    self.acknowledge_entity(&op, server_version.as_deref(), now)?;
                    synced += 1;
                }
                UploadResult::Error { message } => {
                    op.sync_retry_count += 1;
                    if op.sync_retry_count >= self.config.sync_retry_limit {
                        op.dead_letter = true;
                        warn!(
                            "Operation {} dead-lettered after {} sync failures: {message}",
                            op.id, op.sync_retry_count
                        );
                        let _ = self.events.send(SyncEvent::OperationDeadLettered {
                            operation_id: op.id.clone(),
                            entity_type: op.entity_type.clone(),
                        });
                    } else {
                        debug!(
                            "Operation {} sync failure {}/{}: {message}",
                            op.id, op.sync_retry_count, self.config.sync_retry_limit
                        );
                    }
                    self.store.put_operation(&op)?;
                    failed += 1;
                }
            }
        }

        let _ = self.events.send(SyncEvent::UploadCompleted {
            entity_type: entity_type.to_string(),
            synced,
            failed,
        });
        Ok(())
    }

    /// Clear the entity's dirty flag once no unacknowledged operations
    /// remain; compact tombstones whose delete the server just accepted.
    fn acknowledge_entity(
        &self,
        op: &Operation,
        server_version: Option<&str>,
        now: i64,
    ) -> Result<()> {
        let key = op.cache_key();
        let Some(mut entry) = self.store.get_cache_entry(&key, now)? else {
            return Ok(());
        };

        if entry.is_tombstoned() {
            self.store.delete_cache_entry(&key)?;
            debug!("Compacted tombstone {key} after sync acknowledgment");
            return Ok(());
        }

        if let Some(version) = server_version {
            entry.server_version = Some(version.to_string());
        }
        entry.last_synced = Some(now);
        if self
            .store
            .count_completed_unsynced_for_entity(&op.entity_type, &op.entity_id)?
            == 0
        {
            entry.sync_required = false;
        }
        self.store.put_cache_entry(&entry)?;
        Ok(())
    }

    // ========== Download ==========

    /// Fetch server-originated changes per registered entity type, behind
    /// the persisted watermark.
    pub async fn download_pass(&self) -> Result<()> {
        let entity_types = self.schemas.entity_types();
        if entity_types.is_empty() {
            return Ok(());
        }

        let token = match self.auth.token().await {
            Ok(token) => token,
            Err(e) => {
                warn!("Auth provider unavailable, deferring download: {e}");
                return Ok(());
            }
        };

        for entity_type in entity_types {
            let watermark = self.store.get_watermark(&entity_type)?;
            let call = self
                .transport
                .download_changes(&token, &entity_type, watermark.as_deref());
            let change_set = match timeout(self.config.transport_timeout, call).await {
                Err(_) => {
                    warn!("Download for '{entity_type}' timed out; retrying next tick");
                    continue;
                }
                Ok(Err(e)) => {
                    warn!("Download for '{entity_type}' failed: {e}; retrying next tick");
                    continue;
                }
                Ok(Ok(change_set)) => change_set,
            };

            self.handshake_done.store(true, Ordering::Release);

            let mut applied = 0usize;
            let mut conflicts = 0usize;
            for change in change_set.changes {
                match self.apply_change(&entity_type, change) {
                    Ok(was_conflict) => {
                        applied += 1;
                        if was_conflict {
                            conflicts += 1;
                        }
                    }
                    Err(e) => {
                        error!("Failed to apply server change for '{entity_type}': {e}");
                        return Err(e);
                    }
                }
            }

            if let Some(new_watermark) = change_set.new_watermark {
                let now = self.clock.now_millis();
                self.store.put_watermark(&entity_type, &new_watermark, now)?;
            }

            let _ = self.events.send(SyncEvent::DownloadApplied {
                entity_type: entity_type.clone(),
                applied,
                conflicts,
            });
        }
        Ok(())
    }

    /// Apply one server change. Returns true when the change collided with
    /// unacknowledged local state.
    fn apply_change(&self, entity_type: &str, change: ServerChange) -> Result<bool> {
        let now = self.clock.now_millis();
        let key = CacheEntry::key_for(entity_type, &change.entity_id);
        let local = self.store.get_cache_entry(&key, now)?;

        let server_payload = if change.deleted {
            let mut tombstone = Payload::new();
            tombstone.insert(TOMBSTONE_FIELD.to_string(), Value::Bool(true));
            tombstone
        } else {
            change.payload.clone()
        };

        match local {
            // No local state: install the server payload verbatim.
            None => {
                if change.deleted {
                    return Ok(false);
                }
                let mut entry = CacheEntry::new(entity_type, &change.entity_id, server_payload, now);
                entry.server_version = change.server_version;
                entry.last_synced = Some(now);
                self.store.put_cache_entry(&entry)?;
                Ok(false)
            }

            // Clean local state: the server is authoritative.
            Some(mut entry) if !entry.sync_required => {
                if change.deleted {
                    self.store.delete_cache_entry(&key)?;
                    return Ok(false);
                }
                entry.payload = server_payload;
                entry.server_version = change.server_version;
                entry.updated_at = now;
                entry.last_synced = Some(now);
                self.store.put_cache_entry(&entry)?;
                Ok(false)
            }

            // Dirty local state: delegate to the conflict resolver.
            Some(entry) => {
                self.resolve_download_conflict(entity_type, change, entry, server_payload, now)?;
                Ok(true)
            }
        }
    }

    fn resolve_download_conflict(
        &self,
        entity_type: &str,
        change: ServerChange,
        mut entry: CacheEntry,
        server_payload: Payload,
        now: i64,
    ) -> Result<()> {
        let intent = self
            .store
            .latest_intent_for_entity(entity_type, &change.entity_id)?;
        let strategy = intent.as_ref().map(|op| op.conflict_strategy);
        let previous = intent.as_ref().and_then(|op| op.previous_payload.as_ref());

        let resolution = self.resolver.resolve(
            entity_type,
            strategy,
            &entry.payload,
            &server_payload,
            previous,
        );

        match resolution {
            Resolution::Resolved {
                payload,
                acknowledged,
                cancel_pending,
            } => {
                entry.payload = payload;
                entry.server_version = change.server_version;
                entry.updated_at = now;
                if acknowledged {
                    entry.sync_required = false;
                    entry.last_synced = Some(now);
                } else {
                    entry.sync_required = true;
                }

                if acknowledged && entry.is_tombstoned() {
                    // The reconciled state is a server-acknowledged delete.
                    self.store.delete_cache_entry(&entry.cache_key)?;
                } else {
                    self.store.put_cache_entry(&entry)?;
                }

                if cancel_pending {
                    let cancelled = self
                        .store
                        .cancel_pending_for_entity(entity_type, &change.entity_id)?;
                    if !cancelled.is_empty() {
                        info!(
                            "Cancelled {} pending operations for {entity_type}:{} after server-wins resolution",
                            cancelled.len(),
                            change.entity_id
                        );
                        let _ = self.events.send(SyncEvent::OperationsCancelled {
                            entity_type: entity_type.to_string(),
                            entity_id: change.entity_id.clone(),
                            operation_ids: cancelled,
                        });
                    }
                }

                let effective =
                    strategy.unwrap_or_else(|| self.resolver.default_strategy());
                let _ = self.events.send(SyncEvent::ConflictResolved {
                    entity_type: entity_type.to_string(),
                    entity_id: change.entity_id,
                    strategy: effective,
                });
            }

            Resolution::Manual { local, server } => {
                let conflict = ParkedConflict {
                    id: Uuid::new_v4().to_string(),
                    entity_type: entity_type.to_string(),
                    entity_id: change.entity_id.clone(),
                    local_payload: local,
                    server_payload: server,
                    detected_at: now,
                    resolved_at: None,
                };
                self.store.put_conflict(&conflict)?;
                info!(
                    "Parked conflict {} for {entity_type}:{} pending manual resolution",
                    conflict.id, change.entity_id
                );
                let _ = self.events.send(SyncEvent::ConflictParked {
                    conflict_id: conflict.id,
                    entity_type: entity_type.to_string(),
                    entity_id: change.entity_id,
                });
            }
        }
        Ok(())
    }

    /// Apply an externally reviewed resolution for a parked conflict. The
    /// chosen payload becomes local intent and is uploaded on a later pass.
    pub fn resolve_manual(&self, conflict_id: &str, resolved: Payload) -> Result<()> {
        let now = self.clock.now_millis();
        let conflict = self
            .store
            .get_conflict(conflict_id)?
            .ok_or_else(|| EngineError::NotFound(format!("conflict {conflict_id}")))?;
        if conflict.resolved_at.is_some() {
            return Err(EngineError::IllegalState(format!(
                "conflict {conflict_id} is already resolved"
            )));
        }

        let key = CacheEntry::key_for(&conflict.entity_type, &conflict.entity_id);
        let mut entry = match self.store.get_cache_entry(&key, now)? {
            Some(entry) => entry,
            None => CacheEntry::new(&conflict.entity_type, &conflict.entity_id, Payload::new(), now),
        };
        entry.payload = resolved;
        entry.updated_at = now;
        entry.sync_required = true;
        self.store.put_cache_entry(&entry)?;
        self.store.mark_conflict_resolved(conflict_id, now)?;

        let _ = self.events.send(SyncEvent::ConflictResolved {
            entity_type: conflict.entity_type,
            entity_id: conflict.entity_id,
            strategy: ConflictStrategy::Manual,
        });
        Ok(())
    }
}
