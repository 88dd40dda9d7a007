//! Storage maintenance: compaction of expired cache entries and retained
//! terminal operations.

use crate::config::EngineConfig;
use crate::services::OfflineStore;
use crate::transport::Clock;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Summary of one cleanup pass.
#[derive(Debug, Clone, Default)]
pub struct CleanupResult {
    /// Cache entries removed past their expiry.
    pub expired_cache_entries: usize,
    /// Synced/terminal operations removed past the retention horizon.
    pub compacted_operations: usize,
    pub duration_ms: i64,
    pub errors: Vec<String>,
}

/// Very-slow background driver for storage compaction.
pub struct Maintenance {
    store: Arc<OfflineStore>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl Maintenance {
    pub fn new(store: Arc<OfflineStore>, clock: Arc<dyn Clock>, config: EngineConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            clock,
            config,
        })
    }

    /// Start the compaction loop. Runs until the shutdown signal flips.
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        info!(
            "Starting maintenance (interval: {:?}, retention: {:?})",
            self.config.maintenance_interval, self.config.operation_retention
        );
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.maintenance_interval);
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
                    debug!("Maintenance shutting down");
                    break;
                }
                let result = self.run_cleanup();
                if !result.errors.is_empty() {
                    error!("Maintenance pass finished with errors: {:?}", result.errors);
                }
            }
        })
    }

    /// One compaction pass. Errors accumulate per table; a failure in one
    /// step never blocks the others.
    pub fn run_cleanup(&self) -> CleanupResult {
        let started = Instant::now();
        let now = self.clock.now_millis();
        let mut result = CleanupResult::default();

        match self.store.compact_expired(now) {
            Ok(count) => result.expired_cache_entries = count,
            Err(e) => result.errors.push(format!("cache_entries: {e}")),
        }

        let cutoff = now - self.config.operation_retention.as_millis() as i64;
        match self.store.compact_operations(cutoff) {
            Ok(count) => result.compacted_operations = count,
            Err(e) => result.errors.push(format!("operations: {e}")),
        }

        result.duration_ms = started.elapsed().as_millis() as i64;
        if result.expired_cache_entries > 0 || result.compacted_operations > 0 {
            info!(
                "Maintenance pass: {} expired cache entries, {} operations compacted in {}ms",
                result.expired_cache_entries, result.compacted_operations, result.duration_ms
            );
        }
        result
    }
}
