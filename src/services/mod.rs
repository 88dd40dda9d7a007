pub mod conflict;
pub mod engine;
pub mod maintenance;
pub mod rule_engine;
pub mod scheduler;
pub mod schema_registry;
pub mod store;
pub mod sync;
pub mod validator;

pub use conflict::{merge_payloads, ConflictResolver, Resolution};
pub use engine::OperationEngine;
pub use maintenance::{CleanupResult, Maintenance};
pub use rule_engine::{condition_holds, RuleEngine, RuleOutcome};
pub use scheduler::Scheduler;
pub use schema_registry::{validate_field, SchemaRegistry};
pub use store::{OfflineStore, PendingFilter};
pub use sync::SyncCoordinator;
pub use validator::{ValidationOutcome, Validator};
