//! Operation records: the durable unit of offline work.

use crate::types::ConflictStrategy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Dynamic entity payload: field name to JSON value.
pub type Payload = Map<String, Value>;

/// Kinds of mutation an operation can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    Approve,
    Reject,
    Submit,
    Cancel,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Approve => "approve",
            OperationKind::Reject => "reject",
            OperationKind::Submit => "submit",
            OperationKind::Cancel => "cancel",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(OperationKind::Create),
            "update" => Some(OperationKind::Update),
            "delete" => Some(OperationKind::Delete),
            "approve" => Some(OperationKind::Approve),
            "reject" => Some(OperationKind::Reject),
            "submit" => Some(OperationKind::Submit),
            "cancel" => Some(OperationKind::Cancel),
            _ => None,
        }
    }

    /// Whether local execution writes to the entity cache. Submit/cancel
    /// are interpreted by the server during sync and are local no-ops.
    pub fn mutates_cache(&self) -> bool {
        matches!(
            self,
            OperationKind::Create
                | OperationKind::Update
                | OperationKind::Delete
                | OperationKind::Approve
                | OperationKind::Reject
        )
    }
}

/// Lifecycle status of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Cancelled,
    Synced,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Executing => "executing",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
            OperationStatus::Cancelled => "cancelled",
            OperationStatus::Synced => "synced",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OperationStatus::Pending),
            "executing" => Some(OperationStatus::Executing),
            "completed" => Some(OperationStatus::Completed),
            "failed" => Some(OperationStatus::Failed),
            "cancelled" => Some(OperationStatus::Cancelled),
            "synced" => Some(OperationStatus::Synced),
            _ => None,
        }
    }

    /// Whether an operation in this status satisfies a dependency edge.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, OperationStatus::Completed | OperationStatus::Synced)
    }

    /// Whether this status admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Failed | OperationStatus::Cancelled | OperationStatus::Synced
        )
    }

    /// Legal status transitions. Everything else is rejected.
    pub fn can_transition_to(&self, next: OperationStatus) -> bool {
        matches!(
            (self, next),
            (OperationStatus::Pending, OperationStatus::Executing)
                | (OperationStatus::Pending, OperationStatus::Cancelled)
                | (OperationStatus::Executing, OperationStatus::Completed)
                | (OperationStatus::Executing, OperationStatus::Pending)
                | (OperationStatus::Executing, OperationStatus::Failed)
                | (OperationStatus::Completed, OperationStatus::Synced)
        )
    }
}

/// Operation priority. Higher ranks are selected first within a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Numeric rank used for storage ordering (higher runs first).
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }

    pub fn from_rank(rank: u8) -> Self {
        match rank {
            0 => Priority::Low,
            2 => Priority::High,
            3 => Priority::Critical,
            _ => Priority::Normal,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Originating identity of an operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationMeta {
    pub user_id: String,
    pub session_id: String,
    pub device_id: String,
}

/// A single proposed mutation, durable and tracked through its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub kind: OperationKind,

    pub payload: Payload,
    /// Pre-image captured at execution time, used for conflict review.
    pub previous_payload: Option<Payload>,

    pub meta: OperationMeta,

    pub created_at: i64,
    pub executed_at: Option<i64>,
    pub synced_at: Option<i64>,

    pub status: OperationStatus,
    pub priority: Priority,

    /// Ids of operations that must reach completed or synced before this
    /// one becomes eligible. An id that does not resolve to a stored
    /// operation parks this operation indefinitely; it is never treated as
    /// satisfied.
    pub depends_on: Vec<String>,
    /// Reverse edges, maintained at enqueue time.
    pub blocks: Vec<String>,

    pub conflict_strategy: ConflictStrategy,

    pub retry_count: u32,
    pub max_retries: u32,
    /// Not-before timestamp applied after a retryable failure.
    pub retry_at: Option<i64>,
    pub error_message: Option<String>,

    /// Set by the rule engine: hold in pending until the sync coordinator
    /// completes at least one successful handshake.
    pub requires_sync: bool,
    pub sync_retry_count: u32,
    pub dead_letter: bool,

    pub evaluated_rules: Vec<String>,
    pub validation_errors: Vec<String>,
}

impl Operation {
    /// Cache key of the entity this operation targets.
    pub fn cache_key(&self) -> String {
        format!("{}:{}", self.entity_type, self.entity_id)
    }

    /// Whether the scheduler may ever pick this operation up.
    pub fn is_schedulable(&self) -> bool {
        self.status == OperationStatus::Pending && self.validation_errors.is_empty()
    }
}

/// Request shape accepted by `OperationEngine::enqueue`.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub entity_type: String,
    pub entity_id: String,
    pub kind: OperationKind,
    pub payload: Payload,
    pub meta: OperationMeta,
    pub priority: Priority,
    pub depends_on: Vec<String>,
    /// Conflict strategy recorded on the operation; defaults to client-wins.
    pub conflict_strategy: Option<ConflictStrategy>,
    /// Overrides the configured default retry bound.
    pub max_retries: Option<u32>,
}

impl EnqueueRequest {
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        kind: OperationKind,
        payload: Payload,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            kind,
            payload,
            meta: OperationMeta::default(),
            priority: Priority::Normal,
            depends_on: Vec::new(),
            conflict_strategy: None,
            max_retries: None,
        }
    }

    pub fn with_meta(mut self, meta: OperationMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_depends_on(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }

    pub fn with_conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = Some(strategy);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Synchronous result of an enqueue call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueOutcome {
    pub operation_id: String,
    /// Empty when the operation was accepted for scheduling. A non-empty
    /// list means the operation was persisted for audit but will never
    /// execute.
    pub validation_errors: Vec<String>,
}

impl EnqueueOutcome {
    pub fn accepted(&self) -> bool {
        self.validation_errors.is_empty()
    }
}
