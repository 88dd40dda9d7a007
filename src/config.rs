use crate::types::ConflictStrategy;
use std::env;
use std::time::Duration;

/// Engine configuration.
///
/// All knobs have conservative defaults sized for a mobile/edge deployment;
/// `from_env` overrides them from `OUTPOST_*` environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Scheduler tick interval while idle.
    pub scheduler_tick: Duration,
    /// Maximum pending operations examined per scheduler tick.
    pub scheduler_batch: usize,
    /// Bounded degree of worker concurrency.
    pub worker_concurrency: usize,
    /// Base delay for exponential retry backoff.
    pub retry_backoff_base: Duration,
    /// Upper bound on retry backoff.
    pub retry_backoff_cap: Duration,
    /// Default execution retry bound for enqueued operations.
    pub default_max_retries: u32,
    /// Sync coordinator tick interval.
    pub sync_interval: Duration,
    /// Maximum completed operations fetched per upload pass.
    pub upload_batch_size: usize,
    /// Sync failures per operation before it is dead-lettered.
    pub sync_retry_limit: u32,
    /// Timeout applied to each transport call.
    pub transport_timeout: Duration,
    /// Completed-and-unsynced depth per entity type that trips backpressure.
    pub backpressure_high_water: u64,
    /// Depth the queue must drain below before enqueues resume.
    pub backpressure_low_water: u64,
    /// Maintenance (compaction) tick interval.
    pub maintenance_interval: Duration,
    /// Retention horizon for synced/terminal operations.
    pub operation_retention: Duration,
    /// Resolver fallback when no local operation names a strategy.
    pub default_conflict_strategy: ConflictStrategy,
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to
    /// the built-in defaults.
    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            scheduler_tick: env_duration_ms("OUTPOST_SCHEDULER_TICK_MS", base.scheduler_tick),
            scheduler_batch: env_parse("OUTPOST_SCHEDULER_BATCH", base.scheduler_batch),
            worker_concurrency: env_parse("OUTPOST_WORKER_CONCURRENCY", base.worker_concurrency),
            retry_backoff_base: env_duration_ms(
                "OUTPOST_RETRY_BACKOFF_BASE_MS",
                base.retry_backoff_base,
            ),
            retry_backoff_cap: env_duration_ms(
                "OUTPOST_RETRY_BACKOFF_CAP_MS",
                base.retry_backoff_cap,
            ),
            default_max_retries: env_parse("OUTPOST_DEFAULT_MAX_RETRIES", base.default_max_retries),
            sync_interval: env_duration_ms("OUTPOST_SYNC_INTERVAL_MS", base.sync_interval),
            upload_batch_size: env_parse("OUTPOST_UPLOAD_BATCH_SIZE", base.upload_batch_size),
            sync_retry_limit: env_parse("OUTPOST_SYNC_RETRY_LIMIT", base.sync_retry_limit),
            transport_timeout: env_duration_ms(
                "OUTPOST_TRANSPORT_TIMEOUT_MS",
                base.transport_timeout,
            ),
            backpressure_high_water: env_parse(
                "OUTPOST_BACKPRESSURE_HIGH_WATER",
                base.backpressure_high_water,
            ),
            backpressure_low_water: env_parse(
                "OUTPOST_BACKPRESSURE_LOW_WATER",
                base.backpressure_low_water,
            ),
            maintenance_interval: env_duration_ms(
                "OUTPOST_MAINTENANCE_INTERVAL_MS",
                base.maintenance_interval,
            ),
            operation_retention: env_duration_ms(
                "OUTPOST_OPERATION_RETENTION_MS",
                base.operation_retention,
            ),
            default_conflict_strategy: base.default_conflict_strategy,
        }
    }

    /// Backoff delay for the given retry attempt (1-based), doubling from
    /// the base and saturating at the cap.
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let base = self.retry_backoff_base.as_millis() as u64;
        let shift = attempt.saturating_sub(1).min(16);
        let delay = base.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.retry_backoff_cap.as_millis() as u64))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scheduler_tick: Duration::from_secs(1),
            scheduler_batch: 25,
            worker_concurrency: 10,
            retry_backoff_base: Duration::from_millis(500),
            retry_backoff_cap: Duration::from_secs(30),
            default_max_retries: 3,
            sync_interval: Duration::from_secs(30),
            upload_batch_size: 50,
            sync_retry_limit: 5,
            transport_timeout: Duration::from_secs(10),
            backpressure_high_water: 500,
            backpressure_low_water: 350,
            maintenance_interval: Duration::from_secs(300),
            operation_retention: Duration::from_secs(30 * 24 * 60 * 60),
            default_conflict_strategy: ConflictStrategy::ServerWins,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

fn env_duration_ms(key: &str, fallback: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(fallback)
}
