//! Outpost - offline-first ERP operation engine.
//!
//! A durable, dependency-ordered operation queue that lets an edge client
//! perform writes against an ERP data model while disconnected, then
//! reconciles them with a remote server, resolving conflicts
//! deterministically.
//!
//! The engine is built from six cooperating components:
//!
//! - [`services::OfflineStore`] — SQLite-backed durable state
//! - [`services::SchemaRegistry`] — entity field contracts
//! - [`services::RuleEngine`] — declarative business rules
//! - [`services::Validator`] — enqueue gating (schema + rules + backpressure)
//! - [`services::Scheduler`] — dependency-ordered execution with retry
//! - [`services::SyncCoordinator`] — batched upload/download and conflict
//!   resolution
//!
//! [`services::OperationEngine`] wires them together behind one facade.

pub mod config;
pub mod error;
pub mod services;
pub mod transport;
pub mod types;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use services::{ConflictResolver, OfflineStore, OperationEngine, PendingFilter};
pub use transport::{AnonymousAuth, AuthProvider, AuthToken, Clock, SystemClock, TransportClient};
pub use types::*;
