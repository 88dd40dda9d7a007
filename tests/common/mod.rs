//! Shared fixtures for the integration suites: a manual clock, a scripted
//! transport and the invoice schema/rules used across scenarios.
#![allow(dead_code)]

use async_trait::async_trait;
use outpost::{
    AuthProvider, AuthToken, BusinessRule, ChangeSet, Clock, ConditionOp, EngineConfig,
    EntitySchema, FieldSpec, FieldType, Operation, OperationEngine, OfflineStore, Payload,
    Result, RuleAction, RuleCondition, RuleContext, TransportClient, UploadAck, UploadResult,
};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

/// Clock advanced explicitly by tests.
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(start: i64) -> Arc<Self> {
        Arc::new(Self(AtomicI64::new(start)))
    }

    pub fn advance(&self, millis: i64) {
        self.0.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set(&self, millis: i64) {
        self.0.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Auth provider returning a fixed token, with an optional failure switch.
pub struct StaticAuth {
    pub fail: AtomicBool,
}

impl StaticAuth {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fail: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl AuthProvider for StaticAuth {
    async fn token(&self) -> Result<AuthToken> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(outpost::EngineError::Transport("auth unavailable".into()));
        }
        Ok(AuthToken("test-token".into()))
    }
}

/// Scripted transport: records uploads, acks everything except the ids in
/// `fail_ops`, and serves queued change sets per entity type.
pub struct MockTransport {
    /// Recorded upload calls: (entity_type, operation ids in ship order).
    pub uploads: Mutex<Vec<(String, Vec<String>)>>,
    /// Operation ids to report per-op errors for.
    pub fail_ops: Mutex<Vec<String>>,
    /// When set, every call fails at the transport level.
    pub fail_transport: AtomicBool,
    /// Server version tag attached to acks.
    pub server_version: Mutex<Option<String>>,
    /// Queued download responses per entity type.
    pub downloads: Mutex<HashMap<String, VecDeque<ChangeSet>>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            uploads: Mutex::new(Vec::new()),
            fail_ops: Mutex::new(Vec::new()),
            fail_transport: AtomicBool::new(false),
            server_version: Mutex::new(Some("v1".into())),
            downloads: Mutex::new(HashMap::new()),
        })
    }

    pub fn queue_download(&self, entity_type: &str, change_set: ChangeSet) {
        self.downloads
            .lock()
            .unwrap()
            .entry(entity_type.to_string())
            .or_default()
            .push_back(change_set);
    }

    pub fn fail_operation(&self, operation_id: &str) {
        self.fail_ops.lock().unwrap().push(operation_id.to_string());
    }

    pub fn uploaded_ids(&self) -> Vec<(String, Vec<String>)> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransportClient for MockTransport {
    async fn upload_batch(
        &self,
        _token: &AuthToken,
        entity_type: &str,
        operations: &[Operation],
    ) -> Result<Vec<UploadAck>> {
        if self.fail_transport.load(Ordering::SeqCst) {
            return Err(outpost::EngineError::Transport("link down".into()));
        }

        self.uploads.lock().unwrap().push((
            entity_type.to_string(),
            operations.iter().map(|op| op.id.clone()).collect(),
        ));

        let fail_ops = self.fail_ops.lock().unwrap();
        let server_version = self.server_version.lock().unwrap().clone();
        Ok(operations
            .iter()
            .map(|op| UploadAck {
                operation_id: op.id.clone(),
                result: if fail_ops.contains(&op.id) {
                    UploadResult::Error {
                        message: "rejected by server".into(),
                    }
                } else {
                    UploadResult::Acked {
                        server_version: server_version.clone(),
                    }
                },
            })
            .collect())
    }

    async fn download_changes(
        &self,
        _token: &AuthToken,
        entity_type: &str,
        _since_watermark: Option<&str>,
    ) -> Result<ChangeSet> {
        if self.fail_transport.load(Ordering::SeqCst) {
            return Err(outpost::EngineError::Transport("link down".into()));
        }
        let next = self
            .downloads
            .lock()
            .unwrap()
            .get_mut(entity_type)
            .and_then(|queue| queue.pop_front());
        Ok(next.unwrap_or_default())
    }
}

/// Invoice schema used by the end-to-end scenarios.
pub fn invoice_schema() -> EntitySchema {
    EntitySchema::new("invoice")
        .field("invoice_id", FieldSpec::new(FieldType::String).required())
        .field("customer_id", FieldSpec::new(FieldType::String).required())
        .field("invoice_number", FieldSpec::new(FieldType::String).required())
        .field(
            "amount",
            FieldSpec::new(FieldType::Decimal).required().with_min(0.0),
        )
        .field("invoice_date", FieldSpec::new(FieldType::Date))
        .field(
            "status",
            FieldSpec::new(FieldType::String).with_allowed_values(vec![
                json!("draft"),
                json!("sent"),
                json!("paid"),
                json!("overdue"),
                json!("approved"),
                json!("rejected"),
            ]),
        )
        .indexed(&["invoice_id", "customer_id", "status"])
}

pub fn customer_schema() -> EntitySchema {
    EntitySchema::new("customer")
        .field("customer_id", FieldSpec::new(FieldType::String).required())
        .field("name", FieldSpec::new(FieldType::String).required())
        .field("email", FieldSpec::new(FieldType::Email))
        .indexed(&["customer_id"])
}

/// "Invoice amount must be greater than zero" as a reject rule.
pub fn amount_rule() -> BusinessRule {
    BusinessRule::new(
        "invoice_amount_positive",
        "Invoice Amount Required",
        "invoice",
        RuleCondition::new("amount", ConditionOp::LessThan, Some(json!(1))),
        RuleAction::RejectWithMessage {
            message: "Invoice amount must be greater than zero".into(),
        },
    )
    .with_contexts(&[RuleContext::Offline, RuleContext::Online])
}

pub fn payload(v: Value) -> Payload {
    v.as_object().cloned().unwrap_or_default()
}

pub struct Harness {
    pub engine: Arc<OperationEngine>,
    pub store: Arc<OfflineStore>,
    pub clock: Arc<ManualClock>,
    pub transport: Arc<MockTransport>,
    pub auth: Arc<StaticAuth>,
}

/// Engine wired against an in-memory store, manual clock and scripted
/// transport. Drivers are not started; tests pump the engine directly.
pub fn harness_with(
    config: EngineConfig,
    schemas: Vec<EntitySchema>,
    rules: Vec<BusinessRule>,
) -> Harness {
    let store = Arc::new(OfflineStore::new_in_memory().unwrap());
    harness_on(store, config, schemas, rules)
}

pub fn harness_on(
    store: Arc<OfflineStore>,
    config: EngineConfig,
    schemas: Vec<EntitySchema>,
    rules: Vec<BusinessRule>,
) -> Harness {
    let clock = ManualClock::new(1_000_000);
    let transport = MockTransport::new();
    let auth = StaticAuth::new();
    let engine = OperationEngine::new(
        config,
        store.clone(),
        transport.clone(),
        auth.clone(),
        clock.clone(),
        schemas,
        rules,
    )
    .unwrap();
    Harness {
        engine,
        store,
        clock,
        transport,
        auth,
    }
}

pub fn harness() -> Harness {
    harness_with(
        EngineConfig::default(),
        vec![invoice_schema(), customer_schema()],
        vec![amount_rule()],
    )
}

/// Pump the scheduler until no more operations dispatch (dependencies
/// resolve across passes), advancing the clock past retry backoffs.
pub async fn drain_scheduler(h: &Harness) {
    for _ in 0..16 {
        let dispatched = h.engine.pump_scheduler().await.unwrap();
        // Let spawned workers run to completion.
        tokio::task::yield_now().await;
        wait_for_idle(h).await;
        if dispatched == 0 {
            break;
        }
    }
}

/// Wait until no operation is claimed by a worker.
pub async fn wait_for_idle(h: &Harness) {
    for _ in 0..200 {
        if h.engine.in_flight() == 0 {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }
    panic!("scheduler workers did not settle");
}
