//! Operation scheduler: drives `pending → executing → {completed, failed}`
//! with bounded concurrency, dependency gating and retry.
//!
//! The tick loop selects ready operations by priority, claims each with an
//! atomic store update (no two workers can own the same id) and executes
//! the mutation against the entity cache. Failures retry with exponential
//! backoff up to the operation's bound, then land in `failed`.

use crate::config::EngineConfig;
use crate::error::Result;
use crate::services::store::{OfflineStore, PendingFilter};
use crate::transport::Clock;
use crate::types::{CacheEntry, Operation, OperationKind, OperationStatus};
use dashmap::{DashMap, DashSet};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify, Semaphore};
use tracing::{debug, error, info, warn};

/// Embedder-supplied side effect that runs inside the claim, before the
/// cache write. An error counts as an execution failure and takes the
/// retry path.
pub type ExecutionInterceptor = dyn Fn(&Operation) -> std::result::Result<(), String> + Send + Sync;

/// Scheduler for pending operations.
pub struct Scheduler {
    store: Arc<OfflineStore>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    /// Bounds worker concurrency; one permit per executing operation.
    permits: Arc<Semaphore>,
    /// Ids claimed by this process, for tick-level skip and statistics.
    in_flight: Arc<DashSet<String>>,
    /// Wakes the tick loop early when work arrives.
    wakeup: Notify,
    /// Set by the sync coordinator after the first successful handshake;
    /// gates require-sync operations.
    handshake_done: Arc<AtomicBool>,
    interceptors: DashMap<String, Arc<ExecutionInterceptor>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<OfflineStore>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
        handshake_done: Arc<AtomicBool>,
    ) -> Arc<Self> {
        let permits = Arc::new(Semaphore::new(config.worker_concurrency.max(1)));
        Arc::new(Self {
            store,
            clock,
            config,
            permits,
            in_flight: Arc::new(DashSet::new()),
            wakeup: Notify::new(),
            handshake_done,
            interceptors: DashMap::new(),
        })
    }

    /// Wake the tick loop ahead of its interval (called on enqueue).
    pub fn notify(&self) {
        self.wakeup.notify_one();
    }

    /// Register an execution interceptor for an entity type.
    pub fn register_interceptor<F>(&self, entity_type: impl Into<String>, interceptor: F)
    where
        F: Fn(&Operation) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.interceptors
            .insert(entity_type.into(), Arc::new(interceptor));
    }

    /// Operations currently claimed by this process.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Start the tick loop. Runs until the shutdown signal flips.
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        info!(
            "Starting scheduler (concurrency: {}, tick: {:?})",
            self.config.worker_concurrency, self.config.scheduler_tick
        );
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.scheduler_tick);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = self.wakeup.notified() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                if *shutdown.borrow() {
                    debug!("Scheduler shutting down");
                    break;
                }
                if let Err(e) = self.clone().tick().await {
                    error!("Scheduler tick failed: {e}");
                }
            }
        })
    }

    /// One scheduling pass: select, gate, claim and dispatch ready
    /// operations. Returns the number dispatched. Public so embedders can
    /// pump the scheduler on their own cadence instead of the tick loop.
    pub async fn tick(self: Arc<Self>) -> Result<usize> {
        let now = self.clock.now_millis();
        let batch = self.store.list_pending(&PendingFilter {
            entity_type: None,
            user_id: None,
            limit: self.config.scheduler_batch,
            now,
        })?;

        let mut dispatched = 0;
        for op in batch {
            if self.in_flight.contains(&op.id) {
                continue;
            }
            if op.requires_sync && !self.handshake_done.load(Ordering::Acquire) {
                continue;
            }
            if !self.dependencies_ready(&op)? {
                continue;
            }

            // Respect the worker bound before claiming so a claimed
            // operation is always actively owned.
            let permit = match self.permits.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => break,
            };

            if !self.store.claim_operation(&op.id)? {
                continue;
            }
            self.in_flight.insert(op.id.clone());
            dispatched += 1;

            let scheduler = self.clone();
            tokio::spawn(async move {
                scheduler.run_claimed(op).await;
                drop(permit);
            });
        }

        Ok(dispatched)
    }

    /// Every dependency must resolve to a stored operation in `completed`
    /// or `synced`. A missing id means not ready: the operation waits
    /// rather than run with unverifiable ordering.
    fn dependencies_ready(&self, op: &Operation) -> Result<bool> {
        for dep_id in &op.depends_on {
            match self.store.get_operation(dep_id)? {
                Some(dep) if dep.status.satisfies_dependency() => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Execute one claimed operation and record its outcome.
    async fn run_claimed(&self, mut op: Operation) {
        let result = self.execute(&mut op);
        let now = self.clock.now_millis();

        match result {
            Ok(()) => {
                op.status = OperationStatus::Completed;
                op.executed_at = Some(now);
                op.error_message = None;
                op.retry_at = None;
                if let Err(e) = self.store.put_operation(&op) {
                    error!("Failed to persist completed operation {}: {e}", op.id);
                }
                self.stamp_last_operation(&op, now);
                debug!("Operation {} completed", op.id);
                // Dependents may have become ready.
                self.wakeup.notify_one();
            }
            Err(message) => {
                if op.retry_count < op.max_retries {
                    op.retry_count += 1;
                    op.status = OperationStatus::Pending;
                    let backoff = self.config.retry_backoff(op.retry_count);
                    op.retry_at = Some(now + backoff.as_millis() as i64);
                    op.error_message = Some(message.clone());
                    warn!(
                        "Operation {} failed (retry {}/{}): {message}",
                        op.id, op.retry_count, op.max_retries
                    );
                } else {
                    op.status = OperationStatus::Failed;
                    op.error_message = Some(message.clone());
                    warn!("Operation {} failed permanently: {message}", op.id);
                }
                if let Err(e) = self.store.put_operation(&op) {
                    error!("Failed to persist failed operation {}: {e}", op.id);
                }
            }
        }

        self.in_flight.remove(&op.id);
    }

    /// Apply the operation's mutation to the entity cache. Storage errors
    /// surface as execution failures (retryable).
    fn execute(&self, op: &mut Operation) -> std::result::Result<(), String> {
        if let Some(interceptor) = self.interceptors.get(&op.entity_type) {
            (interceptor.value().as_ref())(op)?;
        }

        let now = self.clock.now_millis();
        let key = op.cache_key();

        match op.kind {
            OperationKind::Create => {
                match self.store.get_cache_entry(&key, now).map_err(stringify)? {
                    // Re-create over an existing entity: last writer wins
                    // locally, the entry keeps its history fields.
                    Some(mut entry) => {
                        entry.payload = op.payload.clone();
                        entry.updated_at = now;
                        entry.sync_required = true;
                        self.store.put_cache_entry(&entry).map_err(stringify)?;
                    }
                    None => {
                        let mut entry =
                            CacheEntry::new(&op.entity_type, &op.entity_id, op.payload.clone(), now);
                        entry.sync_required = true;
                        self.store.put_cache_entry(&entry).map_err(stringify)?;
                    }
                }
            }

            OperationKind::Update => {
                match self.store.get_cache_entry(&key, now).map_err(stringify)? {
                    Some(mut entry) => {
                        op.previous_payload = Some(entry.payload.clone());
                        for (field, value) in &op.payload {
                            entry.payload.insert(field.clone(), value.clone());
                        }
                        entry.updated_at = now;
                        entry.sync_required = true;
                        self.store.put_cache_entry(&entry).map_err(stringify)?;
                    }
                    None => {
                        // Nothing local to merge over: start from the
                        // operation's payload.
                        let mut entry =
                            CacheEntry::new(&op.entity_type, &op.entity_id, op.payload.clone(), now);
                        entry.sync_required = true;
                        self.store.put_cache_entry(&entry).map_err(stringify)?;
                    }
                }
            }

            OperationKind::Delete => {
                if let Some(mut entry) =
                    self.store.get_cache_entry(&key, now).map_err(stringify)?
                {
                    entry.tombstone(now);
                    self.store.put_cache_entry(&entry).map_err(stringify)?;
                }
            }

            OperationKind::Approve | OperationKind::Reject => {
                if let Some(mut entry) =
                    self.store.get_cache_entry(&key, now).map_err(stringify)?
                {
                    op.previous_payload = Some(entry.payload.clone());
                    let stamp = chrono::DateTime::from_timestamp_millis(now)
                        .map(|dt| dt.to_rfc3339())
                        .unwrap_or_default();
                    if op.kind == OperationKind::Approve {
                        entry.payload.insert("status".into(), json!("approved"));
                        entry
                            .payload
                            .insert("approved_by".into(), Value::String(op.meta.user_id.clone()));
                        entry.payload.insert("approved_at".into(), Value::String(stamp));
                    } else {
                        entry.payload.insert("status".into(), json!("rejected"));
                        entry
                            .payload
                            .insert("rejected_by".into(), Value::String(op.meta.user_id.clone()));
                        entry.payload.insert("rejected_at".into(), Value::String(stamp));
                    }
                    entry.updated_at = now;
                    entry.sync_required = true;
                    self.store.put_cache_entry(&entry).map_err(stringify)?;
                }
            }

            // Interpreted by the server during sync; no local effect.
            OperationKind::Submit | OperationKind::Cancel => {}
        }

        Ok(())
    }

    /// Record the operation into the entry's metadata bag. Best-effort:
    /// the operation outcome is already decided.
    fn stamp_last_operation(&self, op: &Operation, now: i64) {
        if !op.kind.mutates_cache() {
            return;
        }
        let key = op.cache_key();
        match self.store.get_cache_entry(&key, now) {
            Ok(Some(mut entry)) => {
                entry.metadata.insert(
                    "last_operation".to_string(),
                    json!({
                        "operation_id": op.id,
                        "kind": op.kind.as_str(),
                        "executed_at": op.executed_at,
                    }),
                );
                if let Err(e) = self.store.put_cache_entry(&entry) {
                    debug!("Failed to stamp last_operation for {key}: {e}");
                }
            }
            Ok(None) => {}
            Err(e) => debug!("Failed to read entry for last_operation stamp: {e}"),
        }
    }
}

fn stringify<E: std::fmt::Display>(e: E) -> String {
    e.to_string()
}
