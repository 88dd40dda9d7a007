//! External collaborator seams: the transport to the remote server, the
//! auth provider, and the clock. All three are supplied by the embedding
//! application; the engine only depends on these traits.

use crate::error::Result;
use crate::types::{ChangeSet, Operation, UploadAck};
use async_trait::async_trait;

/// Opaque identity token attached to sync calls. The engine never inspects
/// its contents.
#[derive(Debug, Clone)]
pub struct AuthToken(pub String);

/// Yields identity tokens for sync calls.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn token(&self) -> Result<AuthToken>;
}

/// Transport to the remote server. Payloads beyond these shapes are never
/// parsed by the engine.
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Ship a batch of completed operations for one entity type. Returns a
    /// per-operation acknowledgment or error.
    async fn upload_batch(
        &self,
        token: &AuthToken,
        entity_type: &str,
        operations: &[Operation],
    ) -> Result<Vec<UploadAck>>;

    /// Fetch server-originated changes since the given watermark.
    async fn download_changes(
        &self,
        token: &AuthToken,
        entity_type: &str,
        since_watermark: Option<&str>,
    ) -> Result<ChangeSet>;
}

/// Wall-clock source. Consulted only for timestamps stored in records,
/// never for ordering decisions.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Default clock backed by the system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// No-op auth provider for deployments where the transport handles
/// authentication itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousAuth;

#[async_trait]
impl AuthProvider for AnonymousAuth {
    async fn token(&self) -> Result<AuthToken> {
        Ok(AuthToken(String::new()))
    }
}
