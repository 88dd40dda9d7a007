//! Engine statistics snapshots.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Operation counts by lifecycle status.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationStats {
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
    pub pending: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead_letters: u64,
}

/// Cache population and sync backlog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_entries: u64,
    pub pending_sync: u64,
    /// Share of entries acknowledged by the server, 0-100.
    pub sync_progress_pct: f64,
}

/// Point-in-time engine statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineStatistics {
    pub operations: OperationStats,
    pub cache: CacheStats,
    /// Pending operations eligible for scheduling.
    pub queue_depth: u64,
    /// Operations currently claimed by workers.
    pub in_flight: u64,
    pub unresolved_conflicts: u64,
}
