//! Scheduler tests: dependency gating, claims, execution semantics per
//! operation kind, retry/backoff and cancellation.

mod common;

use common::{drain_scheduler, harness, payload, wait_for_idle};
use outpost::{
    EngineError, EnqueueRequest, OperationKind, OperationStatus, Priority, TOMBSTONE_FIELD,
};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

fn invoice(id: &str, amount: i64) -> serde_json::Value {
    json!({
        "invoice_id": id,
        "customer_id": "C1",
        "invoice_number": format!("INV-{id}"),
        "amount": amount
    })
}

#[tokio::test]
async fn test_create_executes_and_populates_cache() {
    let h = harness();
    let outcome = h
        .engine
        .enqueue(EnqueueRequest::new(
            "invoice",
            "I1",
            OperationKind::Create,
            payload(invoice("I1", 250)),
        ))
        .unwrap();

    drain_scheduler(&h).await;

    let op = h.engine.get_operation(&outcome.operation_id).unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Completed);
    assert!(op.executed_at.is_some());

    let entity = h.engine.get_entity("invoice", "I1").unwrap().unwrap();
    assert_eq!(entity.get("amount"), Some(&json!(250)));

    let entry = h.store.get_cache_entry("invoice:I1", 0).unwrap().unwrap();
    assert!(entry.sync_required);
    // Metadata carries the last-operation stamp.
    let stamp = entry.metadata.get("last_operation").unwrap();
    assert_eq!(stamp.get("kind"), Some(&json!("create")));
    assert_eq!(stamp.get("operation_id"), Some(&json!(op.id)));
}

#[tokio::test]
async fn test_dependency_ordering() {
    let h = harness();

    // A gate interceptor holds customer creation until released.
    let gate = Arc::new(AtomicU32::new(0));
    let gate_in_executor = gate.clone();
    h.engine.register_interceptor("customer", move |_op| {
        if gate_in_executor.load(Ordering::SeqCst) == 0 {
            Err("customer backend not ready".to_string())
        } else {
            Ok(())
        }
    });

    let a = h
        .engine
        .enqueue(EnqueueRequest::new(
            "customer",
            "C1",
            OperationKind::Create,
            payload(json!({"customer_id": "C1", "name": "Acme"})),
        ))
        .unwrap();
    let b = h
        .engine
        .enqueue(
            EnqueueRequest::new("invoice", "I1", OperationKind::Create, payload(invoice("I1", 100)))
                .with_depends_on(vec![a.operation_id.clone()]),
        )
        .unwrap();

    // A fails (gated) and backs off; B must stay pending.
    drain_scheduler(&h).await;
    assert_eq!(
        h.engine.get_operation(&b.operation_id).unwrap().unwrap().status,
        OperationStatus::Pending
    );

    // Release the gate, let A's backoff elapse, and pump again.
    gate.store(1, Ordering::SeqCst);
    h.clock.advance(120_000);
    drain_scheduler(&h).await;

    let op_a = h.engine.get_operation(&a.operation_id).unwrap().unwrap();
    let op_b = h.engine.get_operation(&b.operation_id).unwrap().unwrap();
    assert_eq!(op_a.status, OperationStatus::Completed);
    assert_eq!(op_b.status, OperationStatus::Completed);
    assert!(op_b.executed_at.unwrap() >= op_a.executed_at.unwrap());
    // The reverse edge was recorded at enqueue.
    assert!(op_a.blocks.contains(&b.operation_id));
}

#[tokio::test]
async fn test_unknown_dependency_parks_operation() {
    let h = harness();
    let outcome = h
        .engine
        .enqueue(
            EnqueueRequest::new("invoice", "I1", OperationKind::Create, payload(invoice("I1", 100)))
                .with_depends_on(vec!["never-enqueued".to_string()]),
        )
        .unwrap();

    drain_scheduler(&h).await;

    // A dependency that resolves to nothing is treated as not ready, not
    // as satisfied.
    let op = h.engine.get_operation(&outcome.operation_id).unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Pending);
    assert!(h.engine.get_entity("invoice", "I1").unwrap().is_none());
}

#[tokio::test]
async fn test_priority_tie_break_by_age() {
    let h = harness();

    // Hold everything back so all four are pending at once.
    let gate = Arc::new(AtomicU32::new(0));
    let order: Arc<std::sync::Mutex<Vec<String>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
    {
        let gate = gate.clone();
        let order = order.clone();
        h.engine.register_interceptor("invoice", move |op| {
            if gate.load(Ordering::SeqCst) == 0 {
                return Err("held".to_string());
            }
            order.lock().unwrap().push(op.entity_id.clone());
            Ok(())
        });
    }

    let mut enqueue = |entity_id: &str, priority: Priority| {
        h.clock.advance(100);
        h.engine
            .enqueue(
                EnqueueRequest::new(
                    "invoice",
                    entity_id,
                    OperationKind::Create,
                    payload(invoice(entity_id, 100)),
                )
                .with_priority(priority),
            )
            .unwrap()
    };

    enqueue("I-low", Priority::Low);
    enqueue("I-normal-old", Priority::Normal);
    enqueue("I-normal-new", Priority::Normal);
    enqueue("I-critical", Priority::Critical);

    drain_scheduler(&h).await;
    gate.store(1, Ordering::SeqCst);
    h.clock.advance(120_000);
    drain_scheduler(&h).await;

    let recorded = order.lock().unwrap().clone();
    assert_eq!(
        recorded,
        vec!["I-critical", "I-normal-old", "I-normal-new", "I-low"]
    );
}

#[tokio::test]
async fn test_retry_then_fail_sequence() {
    let h = harness();

    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_in_executor = attempts.clone();
    h.engine.register_interceptor("invoice", move |_op| {
        attempts_in_executor.fetch_add(1, Ordering::SeqCst);
        Err("ledger write refused".to_string())
    });

    let outcome = h
        .engine
        .enqueue(
            EnqueueRequest::new("invoice", "I1", OperationKind::Create, payload(invoice("I1", 100)))
                .with_max_retries(2),
        )
        .unwrap();

    // Attempt 1: back to pending with retry_count = 1.
    drain_scheduler(&h).await;
    let op = h.engine.get_operation(&outcome.operation_id).unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Pending);
    assert_eq!(op.retry_count, 1);
    assert!(op.retry_at.is_some());

    // Attempt 2: still retryable.
    h.clock.advance(120_000);
    drain_scheduler(&h).await;
    let op = h.engine.get_operation(&outcome.operation_id).unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Pending);
    assert_eq!(op.retry_count, 2);

    // Attempt 3: retries exhausted, exactly max_retries retries happened.
    h.clock.advance(120_000);
    drain_scheduler(&h).await;
    let op = h.engine.get_operation(&outcome.operation_id).unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Failed);
    assert_eq!(op.retry_count, 2);
    assert_eq!(op.error_message.as_deref(), Some("ledger write refused"));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    // No further attempts on later ticks.
    h.clock.advance(120_000);
    drain_scheduler(&h).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_backoff_defers_re_eligibility() {
    let h = harness();
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_in_executor = attempts.clone();
    h.engine.register_interceptor("invoice", move |_op| {
        attempts_in_executor.fetch_add(1, Ordering::SeqCst);
        Err("refused".to_string())
    });

    h.engine
        .enqueue(EnqueueRequest::new(
            "invoice",
            "I1",
            OperationKind::Create,
            payload(invoice("I1", 100)),
        ))
        .unwrap();

    drain_scheduler(&h).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    // Without advancing the clock the operation is still backing off.
    drain_scheduler(&h).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    h.clock.advance(120_000);
    drain_scheduler(&h).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_update_merges_and_records_pre_image() {
    let h = harness();
    let create = h
        .engine
        .enqueue(EnqueueRequest::new(
            "invoice",
            "I1",
            OperationKind::Create,
            payload(invoice("I1", 100)),
        ))
        .unwrap();
    drain_scheduler(&h).await;

    let update = h
        .engine
        .enqueue(
            EnqueueRequest::new(
                "invoice",
                "I1",
                OperationKind::Update,
                payload(json!({"amount": 300, "notes": "rush"})),
            )
            .with_depends_on(vec![create.operation_id.clone()]),
        )
        .unwrap();
    drain_scheduler(&h).await;

    let entity = h.engine.get_entity("invoice", "I1").unwrap().unwrap();
    // Shallow merge over the existing payload.
    assert_eq!(entity.get("amount"), Some(&json!(300)));
    assert_eq!(entity.get("notes"), Some(&json!("rush")));
    assert_eq!(entity.get("customer_id"), Some(&json!("C1")));

    let op = h.engine.get_operation(&update.operation_id).unwrap().unwrap();
    let pre_image = op.previous_payload.unwrap();
    assert_eq!(pre_image.get("amount"), Some(&json!(100)));
    assert!(!pre_image.contains_key("notes"));
}

#[tokio::test]
async fn test_identical_updates_converge() {
    let h = harness();
    h.engine
        .enqueue(EnqueueRequest::new(
            "invoice",
            "I1",
            OperationKind::Create,
            payload(invoice("I1", 100)),
        ))
        .unwrap();
    drain_scheduler(&h).await;

    for _ in 0..2 {
        h.engine
            .enqueue(EnqueueRequest::new(
                "invoice",
                "I1",
                OperationKind::Update,
                payload(json!({"amount": 300})),
            ))
            .unwrap();
        drain_scheduler(&h).await;
    }

    let entity = h.engine.get_entity("invoice", "I1").unwrap().unwrap();
    assert_eq!(entity.get("amount"), Some(&json!(300)));
    let entries = h.store.query_cache("invoice", &[], 10).unwrap();
    assert_eq!(entries.len(), 1);
}

#[tokio::test]
async fn test_create_over_existing_is_last_writer_wins() {
    let h = harness();
    h.engine
        .enqueue(EnqueueRequest::new(
            "invoice",
            "I1",
            OperationKind::Create,
            payload(invoice("I1", 100)),
        ))
        .unwrap();
    drain_scheduler(&h).await;

    h.engine
        .enqueue(EnqueueRequest::new(
            "invoice",
            "I1",
            OperationKind::Create,
            payload(json!({
                "invoice_id": "I1",
                "customer_id": "C2",
                "invoice_number": "INV-I1-v2",
                "amount": 900
            })),
        ))
        .unwrap();
    drain_scheduler(&h).await;

    let entity = h.engine.get_entity("invoice", "I1").unwrap().unwrap();
    assert_eq!(entity.get("amount"), Some(&json!(900)));
    assert_eq!(entity.get("customer_id"), Some(&json!("C2")));
}

#[tokio::test]
async fn test_delete_tombstones_until_sync() {
    let h = harness();
    h.engine
        .enqueue(EnqueueRequest::new(
            "invoice",
            "I1",
            OperationKind::Create,
            payload(invoice("I1", 100)),
        ))
        .unwrap();
    drain_scheduler(&h).await;

    h.engine
        .enqueue(EnqueueRequest::new(
            "invoice",
            "I1",
            OperationKind::Delete,
            payload(json!({})),
        ))
        .unwrap();
    drain_scheduler(&h).await;

    // Reads treat the tombstone as absent; the row itself survives until
    // the delete is acknowledged.
    assert!(h.engine.get_entity("invoice", "I1").unwrap().is_none());
    assert!(h.engine.query_entities("invoice", &[], 10).unwrap().is_empty());
    let entry = h.store.get_cache_entry("invoice:I1", 0).unwrap().unwrap();
    assert_eq!(entry.payload.get(TOMBSTONE_FIELD), Some(&json!(true)));
    assert!(entry.sync_required);
}

#[tokio::test]
async fn test_approve_writes_decision_fields() {
    let h = harness();
    h.engine
        .enqueue(EnqueueRequest::new(
            "invoice",
            "I1",
            OperationKind::Create,
            payload(invoice("I1", 100)),
        ))
        .unwrap();
    drain_scheduler(&h).await;

    let mut request = EnqueueRequest::new(
        "invoice",
        "I1",
        OperationKind::Approve,
        payload(json!({})),
    );
    request.meta.user_id = "manager-7".to_string();
    h.engine.enqueue(request).unwrap();
    drain_scheduler(&h).await;

    let entity = h.engine.get_entity("invoice", "I1").unwrap().unwrap();
    assert_eq!(entity.get("status"), Some(&json!("approved")));
    assert_eq!(entity.get("approved_by"), Some(&json!("manager-7")));
    assert!(entity.get("approved_at").is_some());
}

#[tokio::test]
async fn test_submit_is_local_no_op() {
    let h = harness();
    let outcome = h
        .engine
        .enqueue(EnqueueRequest::new(
            "invoice",
            "I1",
            OperationKind::Submit,
            payload(json!({})),
        ))
        .unwrap();
    drain_scheduler(&h).await;

    let op = h.engine.get_operation(&outcome.operation_id).unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Completed);
    // No cache entry was materialized.
    assert!(h.engine.get_entity("invoice", "I1").unwrap().is_none());
}

#[tokio::test]
async fn test_cancel_pending_but_not_completed() {
    let h = harness();
    let gated = h
        .engine
        .enqueue(
            EnqueueRequest::new("invoice", "I1", OperationKind::Create, payload(invoice("I1", 100)))
                .with_depends_on(vec!["never".to_string()]),
        )
        .unwrap();

    h.engine.cancel_operation(&gated.operation_id).unwrap();
    assert_eq!(
        h.engine.get_operation(&gated.operation_id).unwrap().unwrap().status,
        OperationStatus::Cancelled
    );

    let done = h
        .engine
        .enqueue(EnqueueRequest::new(
            "invoice",
            "I2",
            OperationKind::Create,
            payload(invoice("I2", 100)),
        ))
        .unwrap();
    drain_scheduler(&h).await;
    match h.engine.cancel_operation(&done.operation_id) {
        Err(EngineError::IllegalState(_)) => {}
        other => panic!("expected illegal state, got {other:?}"),
    }

    match h.engine.cancel_operation("no-such-op") {
        Err(EngineError::NotFound(_)) => {}
        other => panic!("expected not found, got {other:?}"),
    }
}

#[tokio::test]
async fn test_requires_sync_holds_until_handshake() {
    let h = harness();
    let rule = outpost::BusinessRule::new(
        "large_invoice_needs_sync",
        "Large Invoice Approval",
        "invoice",
        outpost::RuleCondition::new(
            "amount",
            outpost::ConditionOp::GreaterThan,
            Some(json!(10_000)),
        ),
        outpost::RuleAction::RequireSyncBeforeExecute,
    )
    .with_contexts(&[outpost::RuleContext::Offline]);
    h.engine.register_rule(rule).unwrap();

    let outcome = h
        .engine
        .enqueue(EnqueueRequest::new(
            "invoice",
            "I-big",
            OperationKind::Create,
            payload(invoice("I-big", 50_000)),
        ))
        .unwrap();
    assert!(outcome.accepted());

    // No handshake yet: the operation stays pending.
    drain_scheduler(&h).await;
    let op = h.engine.get_operation(&outcome.operation_id).unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Pending);
    assert!(op.requires_sync);

    // One successful sync pass establishes the handshake.
    h.engine.pump_sync().await;
    drain_scheduler(&h).await;
    let op = h.engine.get_operation(&outcome.operation_id).unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Completed);
}

#[tokio::test]
async fn test_claim_is_single_worker() {
    let h = harness();
    let outcome = h
        .engine
        .enqueue(EnqueueRequest::new(
            "invoice",
            "I1",
            OperationKind::Create,
            payload(invoice("I1", 100)),
        ))
        .unwrap();

    // First claim wins, the second observes the operation gone from
    // pending.
    assert!(h.store.claim_operation(&outcome.operation_id).unwrap());
    assert!(!h.store.claim_operation(&outcome.operation_id).unwrap());

    // The scheduler skips it too: nothing to dispatch.
    let dispatched = h.engine.pump_scheduler().await.unwrap();
    wait_for_idle(&h).await;
    assert_eq!(dispatched, 0);
}
