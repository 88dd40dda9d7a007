//! Types crossing the sync boundary: transport shapes, conflict records,
//! and coordinator events.

use crate::types::Payload;
use serde::{Deserialize, Serialize};

/// Deterministic merge strategies applied when local intent collides with
/// server state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Keep the local payload; the next upload overwrites the server.
    ClientWins,
    /// Install the server payload; pending local operations for the entity
    /// are cancelled and reported.
    ServerWins,
    /// Compare `updated_at` fields; the newer payload wins in full.
    LastWriterWins,
    /// Field-by-field union with the server payload as base.
    Merge,
    /// Park both payloads for external review.
    Manual,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::ClientWins => "client_wins",
            ConflictStrategy::ServerWins => "server_wins",
            ConflictStrategy::LastWriterWins => "last_writer_wins",
            ConflictStrategy::Merge => "merge",
            ConflictStrategy::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "client_wins" => Some(ConflictStrategy::ClientWins),
            "server_wins" => Some(ConflictStrategy::ServerWins),
            "last_writer_wins" => Some(ConflictStrategy::LastWriterWins),
            "merge" => Some(ConflictStrategy::Merge),
            "manual" => Some(ConflictStrategy::Manual),
            _ => None,
        }
    }
}

impl Default for ConflictStrategy {
    fn default() -> Self {
        ConflictStrategy::ClientWins
    }
}

/// One server-originated change delivered by the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerChange {
    pub entity_id: String,
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
    /// Server-side deletion of the entity.
    #[serde(default)]
    pub deleted: bool,
}

/// Result of a download call: changes since the watermark plus the cursor
/// to persist for the next call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeSet {
    pub changes: Vec<ServerChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_watermark: Option<String>,
}

/// Per-operation upload outcome reported by the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadAck {
    pub operation_id: String,
    pub result: UploadResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UploadResult {
    Acked {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server_version: Option<String>,
    },
    Error {
        message: String,
    },
}

/// A conflict parked for manual resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParkedConflict {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub local_payload: Payload,
    pub server_payload: Payload,
    pub detected_at: i64,
    pub resolved_at: Option<i64>,
}

/// Events published by the sync coordinator. Subscribers that lag are
/// dropped by the broadcast channel, never waited on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    UploadCompleted {
        entity_type: String,
        synced: usize,
        failed: usize,
    },
    OperationDeadLettered {
        operation_id: String,
        entity_type: String,
    },
    DownloadApplied {
        entity_type: String,
        applied: usize,
        conflicts: usize,
    },
    ConflictResolved {
        entity_type: String,
        entity_id: String,
        strategy: ConflictStrategy,
    },
    ConflictParked {
        conflict_id: String,
        entity_type: String,
        entity_id: String,
    },
    /// Pending local operations cancelled by a server-wins resolution.
    OperationsCancelled {
        entity_type: String,
        entity_id: String,
        operation_ids: Vec<String>,
    },
}
