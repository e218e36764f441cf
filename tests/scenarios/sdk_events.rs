//! Inbound SDK events: validation, decoding and deduplication

use crate::helpers::*;
use plan_engine::core::{Ambiance, Plan, PlanNode, SetupAbstractions, Status, StepResponse};
use plan_engine::events::{ResumeNodeRequest, SdkResponseEvent, SdkResponseEventEnvelope};
use plan_engine::core::config::EngineConfig;
use plan_engine::execution::{EngineError, ErrorKind, ExecutionEngine};
use plan_engine::persistence::{InMemoryStore, ProcessedEventStore};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn two_callbacks() -> Plan {
    Plan::new(
        "events",
        "wait",
        vec![PlanNode::new("wait", "WAIT", "ASYNC")
            .with_parameters(json!({ "callbacks": ["c1", "c2"] }))],
    )
}

fn resume(ambiance: &Ambiance, key: &str) -> SdkResponseEventEnvelope {
    let event = SdkResponseEvent::ResumeNode(ResumeNodeRequest {
        responses: output(key, json!(key)),
        async_error: false,
    });
    SdkResponseEventEnvelope::new(ambiance.clone(), &event).unwrap()
}

#[tokio::test]
async fn test_resume_events_complete_the_node() {
    let engine = engine();
    let id = start(&engine, &two_callbacks()).await;
    let node = current(&engine, id, "wait").await;

    engine.handle_sdk_response_event(resume(&node.ambiance, "c1")).await.unwrap();
    assert_eq!(current(&engine, id, "wait").await.status, Status::AsyncWaiting);

    engine.handle_sdk_response_event(resume(&node.ambiance, "c2")).await.unwrap();
    let node = current(&engine, id, "wait").await;
    assert_eq!(node.status, Status::Succeeded);
    assert_eq!(node.resume_responses.len(), 2);
    assert_eq!(engine.plan_execution(id).await.unwrap().status, Status::Succeeded);
}

#[tokio::test]
async fn test_duplicate_event_is_processed_once() {
    let engine = engine();
    let id = start(&engine, &two_callbacks()).await;
    let node = current(&engine, id, "wait").await;

    engine.handle_sdk_response_event(resume(&node.ambiance, "c1")).await.unwrap();
    let after_first = current(&engine, id, "wait").await;

    engine.handle_sdk_response_event(resume(&node.ambiance, "c1")).await.unwrap();
    let after_second = current(&engine, id, "wait").await;

    assert_eq!(after_second.version, after_first.version);
    assert_eq!(after_second.status, Status::AsyncWaiting);
}

#[tokio::test]
async fn test_unknown_event_type_is_rejected() {
    let engine = engine();
    let id = start(&engine, &two_callbacks()).await;
    let node = current(&engine, id, "wait").await;

    let envelope = SdkResponseEventEnvelope {
        ambiance: node.ambiance.clone(),
        event_type: "RESTART_NODE".to_string(),
        payload: b"{}".to_vec(),
    };
    let error = engine.handle_sdk_response_event(envelope).await.unwrap_err();

    assert!(matches!(error, EngineError::UnknownEventType(ref t) if t == "RESTART_NODE"));
    assert_eq!(error.kind(), ErrorKind::Validation);
    assert_eq!(current(&engine, id, "wait").await.version, node.version);
}

#[tokio::test]
async fn test_malformed_payload_is_rejected() {
    let engine = engine();
    let id = start(&engine, &two_callbacks()).await;
    let node = current(&engine, id, "wait").await;

    let envelope = SdkResponseEventEnvelope {
        ambiance: node.ambiance.clone(),
        event_type: "RESUME_NODE".to_string(),
        payload: b"not json".to_vec(),
    };
    let error = engine.handle_sdk_response_event(envelope).await.unwrap_err();

    assert!(matches!(error, EngineError::MalformedEvent { .. }));
    assert!(error.is_validation());
    assert_eq!(current(&engine, id, "wait").await.status, Status::AsyncWaiting);
}

#[tokio::test]
async fn test_event_without_node_level_is_rejected() {
    let engine = engine();
    let event = SdkResponseEvent::HandleStepResponse(StepResponse::succeeded());
    let envelope = SdkResponseEventEnvelope::new(
        Ambiance::for_plan("events", SetupAbstractions::default()),
        &event,
    )
    .unwrap();

    let error = engine.handle_sdk_response_event(envelope).await.unwrap_err();
    assert!(matches!(error, EngineError::InvalidAmbiance(_)));
}

#[tokio::test]
async fn test_step_response_event_concludes_async_node() {
    let engine = engine();
    let id = start(&engine, &two_callbacks()).await;
    let node = current(&engine, id, "wait").await;

    let event = SdkResponseEvent::HandleStepResponse(StepResponse::failed("host gave up"));
    let envelope = SdkResponseEventEnvelope::new(node.ambiance.clone(), &event).unwrap();
    engine.handle_sdk_response_event(envelope).await.unwrap();

    let node = current(&engine, id, "wait").await;
    assert_eq!(node.status, Status::Failed);
    assert_eq!(node.cause.as_deref(), Some("host gave up"));
    assert_eq!(engine.plan_execution(id).await.unwrap().status, Status::Failed);
}

/// Engine over `store` whose unfinished event claims expire after `lease_ms`
fn engine_with_claims(store: Arc<InMemoryStore>, lease_ms: u64) -> ExecutionEngine {
    ExecutionEngine::builder()
        .with_execution_store(store)
        .with_config(EngineConfig {
            event_claim_lease_ms: lease_ms,
            ..EngineConfig::default()
        })
        .build()
}

fn resume_event(key: &str) -> SdkResponseEvent {
    SdkResponseEvent::ResumeNode(ResumeNodeRequest {
        responses: output(key, json!(key)),
        async_error: false,
    })
}

#[tokio::test]
async fn test_unfinished_claim_blocks_redelivery_within_lease() {
    let store = Arc::new(InMemoryStore::new());
    let engine = engine_with_claims(store.clone(), 60_000);
    let id = start(&engine, &two_callbacks()).await;
    let node = current(&engine, id, "wait").await;

    // A handler took the claim and never finished
    let key = resume_event("c1").idempotency_key(node.id);
    assert!(store.try_claim(&key, Duration::from_secs(60)).await.unwrap());

    engine.handle_sdk_response_event(resume(&node.ambiance, "c1")).await.unwrap();
    assert!(current(&engine, id, "wait").await.resume_responses.is_empty());
}

#[tokio::test]
async fn test_stale_claim_is_redelivered() {
    let store = Arc::new(InMemoryStore::new());
    let engine = engine_with_claims(store.clone(), 0);
    let id = start(&engine, &two_callbacks()).await;
    let node = current(&engine, id, "wait").await;

    let key = resume_event("c1").idempotency_key(node.id);
    assert!(store.try_claim(&key, Duration::from_secs(60)).await.unwrap());

    engine.handle_sdk_response_event(resume(&node.ambiance, "c1")).await.unwrap();
    let after = current(&engine, id, "wait").await;
    assert!(after.resume_responses.contains_key("c1"));

    // Settled claims stay settled even with a zero lease
    engine.handle_sdk_response_event(resume(&node.ambiance, "c1")).await.unwrap();
    assert_eq!(current(&engine, id, "wait").await.version, after.version);
}
