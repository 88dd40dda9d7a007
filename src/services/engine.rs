//! The engine facade: wires the components together, owns the background
//! drivers and exposes the embedder-facing API.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::services::conflict::ConflictResolver;
use crate::services::maintenance::Maintenance;
use crate::services::scheduler::Scheduler;
use crate::services::sync::SyncCoordinator;
use crate::services::{OfflineStore, RuleEngine, SchemaRegistry, Validator};
use crate::transport::{AuthProvider, Clock, TransportClient};
use crate::types::{
    BusinessRule, CacheStats, EngineStatistics, EnqueueOutcome, EnqueueRequest, EntitySchema,
    Operation, OperationStats, OperationStatus, ParkedConflict, Payload, SyncEvent,
};
use serde_json::Value;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

/// Offline-first ERP operation engine.
///
/// Construct with `new`, then call `start` to spawn the scheduler, sync
/// and maintenance drivers. All state lives in the durable store; a
/// restart against the same storage resumes exactly where it left off,
/// pending dependency edges included.
pub struct OperationEngine {
    config: EngineConfig,
    store: Arc<OfflineStore>,
    clock: Arc<dyn Clock>,
    schemas: Arc<SchemaRegistry>,
    rules: Arc<RuleEngine>,
    validator: Arc<Validator>,
    scheduler: Arc<Scheduler>,
    sync: Arc<SyncCoordinator>,
    maintenance: Arc<Maintenance>,
    resolver: Arc<ConflictResolver>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    drivers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl OperationEngine {
    /// Wire up the engine. `schemas` and `rules` are the startup
    /// configuration; both can also be registered at runtime.
    pub fn new(
        config: EngineConfig,
        store: Arc<OfflineStore>,
        transport: Arc<dyn TransportClient>,
        auth: Arc<dyn AuthProvider>,
        clock: Arc<dyn Clock>,
        schemas: Vec<EntitySchema>,
        rules: Vec<BusinessRule>,
    ) -> Result<Arc<Self>> {
        let schema_registry = Arc::new(SchemaRegistry::new(store.clone())?);
        let rule_engine = Arc::new(RuleEngine::new(store.clone())?);

        let now = clock.now_millis();
        for schema in schemas {
            schema_registry.register(schema, now)?;
        }
        for rule in rules {
            rule_engine.register(rule, now)?;
        }

        let validator = Arc::new(Validator::new(
            store.clone(),
            schema_registry.clone(),
            rule_engine.clone(),
            config.backpressure_high_water,
            config.backpressure_low_water,
        ));

        let resolver = Arc::new(ConflictResolver::new(config.default_conflict_strategy));
        let handshake_done = Arc::new(AtomicBool::new(false));

        let scheduler = Scheduler::new(
            store.clone(),
            clock.clone(),
            config.clone(),
            handshake_done.clone(),
        );
        let sync = SyncCoordinator::new(
            store.clone(),
            clock.clone(),
            transport,
            auth,
            resolver.clone(),
            schema_registry.clone(),
            config.clone(),
            handshake_done,
        );
        let maintenance = Maintenance::new(store.clone(), clock.clone(), config.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            store,
            clock,
            schemas: schema_registry,
            rules: rule_engine,
            validator,
            scheduler,
            sync,
            maintenance,
            resolver,
            shutdown_tx,
            shutdown_rx,
            drivers: Mutex::new(Vec::new()),
        }))
    }

    /// Spawn the background drivers: scheduler (fast), sync coordinator
    /// (slow) and maintenance (very slow).
    pub async fn start(&self) {
        info!("Starting operation engine");
        let mut drivers = self.drivers.lock().await;
        drivers.push(self.scheduler.clone().start(self.shutdown_rx.clone()));
        drivers.push(self.sync.clone().start(self.shutdown_rx.clone()));
        drivers.push(self.maintenance.clone().start(self.shutdown_rx.clone()));
    }

    /// Signal the drivers to stop and wait for them to finish. Workers
    /// holding an executing operation complete naturally.
    pub async fn shutdown(&self) {
        info!("Shutting down operation engine");
        let _ = self.shutdown_tx.send(true);
        let mut drivers = self.drivers.lock().await;
        for driver in drivers.drain(..) {
            let _ = driver.await;
        }
    }

    // ========== Enqueue ==========

    /// Validate and persist a new operation. The operation is stored even
    /// when validation fails (for audit) but is only scheduled when the
    /// error list comes back empty. Backpressure rejections are returned
    /// as errors and nothing is persisted.
    pub fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueOutcome> {
        self.validator.check_backpressure(&request.entity_type)?;

        let outcome =
            self.validator
                .validate(&request.entity_type, &request.payload, request.kind);
        let now = self.clock.now_millis();
        let outcome_is_acceptable = outcome.is_acceptable();

        let operation = Operation {
            id: Uuid::new_v4().to_string(),
            entity_type: request.entity_type,
            entity_id: request.entity_id,
            kind: request.kind,
            payload: request.payload,
            previous_payload: None,
            meta: request.meta,
            created_at: now,
            executed_at: None,
            synced_at: None,
            status: OperationStatus::Pending,
            priority: request.priority,
            depends_on: request.depends_on,
            blocks: Vec::new(),
            conflict_strategy: request.conflict_strategy.unwrap_or_default(),
            retry_count: 0,
            max_retries: request
                .max_retries
                .unwrap_or(self.config.default_max_retries),
            retry_at: None,
            requires_sync: outcome.requires_sync,
            sync_retry_count: 0,
            dead_letter: false,
            error_message: None,
            evaluated_rules: outcome.evaluated_rules,
            validation_errors: outcome.errors.clone(),
        };

        self.store.put_operation(&operation)?;
        self.record_reverse_edges(&operation)?;

        if outcome_is_acceptable {
            debug!(
                "Enqueued {} {} for {}:{}",
                operation.kind.as_str(),
                operation.id,
                operation.entity_type,
                operation.entity_id
            );
            self.scheduler.notify();
        } else {
            debug!(
                "Stored rejected operation {} with {} validation errors",
                operation.id,
                outcome.errors.len()
            );
        }

        Ok(EnqueueOutcome {
            operation_id: operation.id,
            validation_errors: outcome.errors,
        })
    }

    /// Maintain `blocks` back-edges on the dependencies. A dependency id
    /// that is not stored yet simply has no edge recorded; the forward
    /// `depends_on` reference alone gates scheduling.
    fn record_reverse_edges(&self, operation: &Operation) -> Result<()> {
        for dep_id in &operation.depends_on {
            if let Some(mut dep) = self.store.get_operation(dep_id)? {
                if !dep.blocks.contains(&operation.id) {
                    dep.blocks.push(operation.id.clone());
                    self.store.put_operation(&dep)?;
                }
            }
        }
        Ok(())
    }

    // ========== Reads ==========

    pub fn get_operation(&self, id: &str) -> Result<Option<Operation>> {
        self.store.get_operation(id)
    }

    /// Read an entity from the cache. Tombstoned entries read as absent.
    pub fn get_entity(&self, entity_type: &str, entity_id: &str) -> Result<Option<Payload>> {
        let key = crate::types::CacheEntry::key_for(entity_type, entity_id);
        let now = self.clock.now_millis();
        let Some(entry) = self.store.get_cache_entry(&key, now)? else {
            return Ok(None);
        };
        if entry.is_tombstoned() {
            return Ok(None);
        }
        Ok(Some(entry.payload))
    }

    /// Equality-predicate query over cached entities of one type.
    pub fn query_entities(
        &self,
        entity_type: &str,
        filters: &[(String, Value)],
        limit: usize,
    ) -> Result<Vec<Payload>> {
        let entries = self.store.query_cache(entity_type, filters, limit)?;
        Ok(entries.into_iter().map(|entry| entry.payload).collect())
    }

    // ========== Control ==========

    /// Cancel a pending operation. Executing operations must complete or
    /// fail naturally.
    pub fn cancel_operation(&self, id: &str) -> Result<()> {
        if self.store.cancel_operation(id)? {
            debug!("Cancelled operation {id}");
            return Ok(());
        }
        match self.store.get_operation(id)? {
            None => Err(EngineError::NotFound(format!("operation {id}"))),
            Some(op) => Err(EngineError::IllegalState(format!(
                "operation {id} is {}, only pending operations can be cancelled",
                op.status.as_str()
            ))),
        }
    }

    /// Operations that exhausted their sync retries and await intervention.
    pub fn dead_letters(&self) -> Result<Vec<Operation>> {
        self.store.list_dead_letters(self.config.upload_batch_size)
    }

    pub fn pending_conflicts(&self) -> Result<Vec<ParkedConflict>> {
        self.store.list_unresolved_conflicts()
    }

    /// Apply an externally reviewed resolution for a parked conflict.
    pub fn resolve_conflict_manually(&self, conflict_id: &str, resolved: Payload) -> Result<()> {
        self.sync.resolve_manual(conflict_id, resolved)
    }

    // ========== Registration ==========

    pub fn register_schema(&self, schema: EntitySchema) -> Result<()> {
        self.schemas.register(schema, self.clock.now_millis())
    }

    pub fn register_rule(&self, rule: BusinessRule) -> Result<()> {
        self.rules.register(rule, self.clock.now_millis())
    }

    /// Register a custom conflict resolver for an entity type.
    pub fn register_resolver<F>(&self, entity_type: impl Into<String>, resolver: F)
    where
        F: Fn(&Payload, &Payload, Option<&Payload>) -> Payload + Send + Sync + 'static,
    {
        self.resolver.register(entity_type, resolver);
    }

    /// Register an execution interceptor for an entity type.
    pub fn register_interceptor<F>(&self, entity_type: impl Into<String>, interceptor: F)
    where
        F: Fn(&Operation) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.scheduler.register_interceptor(entity_type, interceptor);
    }

    // ========== Observation ==========

    pub fn subscribe_sync_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.sync.subscribe()
    }

    pub fn statistics(&self) -> Result<EngineStatistics> {
        let by_status = self.store.status_counts()?;
        let total = by_status.values().sum();
        let get = |status: OperationStatus| by_status.get(status.as_str()).copied().unwrap_or(0);

        let (total_entries, pending_sync) = self.store.cache_stats()?;
        let sync_progress_pct = if total_entries > 0 {
            (total_entries - pending_sync) as f64 / total_entries as f64 * 100.0
        } else {
            100.0
        };

        Ok(EngineStatistics {
            operations: OperationStats {
                total,
                pending: get(OperationStatus::Pending),
                completed: get(OperationStatus::Completed),
                failed: get(OperationStatus::Failed),
                dead_letters: self.store.count_dead_letters()?,
                by_status,
            },
            cache: CacheStats {
                total_entries,
                pending_sync,
                sync_progress_pct,
            },
            queue_depth: self.store.count_schedulable_pending()?,
            in_flight: self.scheduler.in_flight_count() as u64,
            unresolved_conflicts: self.store.count_unresolved_conflicts()?,
        })
    }

    // ========== Manual pumping ==========
    //
    // Embedders that own their cadence (or tests) can drive the engine
    // without the background loops.

    /// Run one scheduler pass; returns the number of operations dispatched.
    pub async fn pump_scheduler(&self) -> Result<usize> {
        self.scheduler.clone().tick().await
    }

    /// Run one sync pass (upload then download).
    pub async fn pump_sync(&self) {
        self.sync.tick().await
    }

    /// Run one maintenance pass.
    pub fn pump_maintenance(&self) -> crate::services::maintenance::CleanupResult {
        self.maintenance.run_cleanup()
    }

    /// Operations currently claimed by workers in this process.
    pub fn in_flight(&self) -> usize {
        self.scheduler.in_flight_count()
    }

    pub fn store(&self) -> &Arc<OfflineStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
