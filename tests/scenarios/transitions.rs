//! Node statuses only move forward through the lifecycle

use crate::helpers::*;
use plan_engine::core::{AdviserObtainment, AdviserResponse, Plan, PlanNode, Status};
use serde_json::json;

/// Every journaled node history is non-decreasing in rank
fn assert_forward_only(store: &JournalingStore) {
    let ids = store.node_ids();
    assert!(!ids.is_empty());
    for id in ids {
        let history = store.history(id);
        assert_eq!(history.first(), Some(&Status::Queued), "node execution {}", id);
        for pair in history.windows(2) {
            assert!(
                pair[0].rank() <= pair[1].rank(),
                "node execution {} went from {} back to {} in {:?}",
                id,
                pair[0],
                pair[1],
                history
            );
        }
    }
}

#[tokio::test]
async fn test_retries_only_move_forward() {
    let store = JournalingStore::new();
    let engine = journaled_engine(store.clone());
    let plan = Plan::new(
        "retries",
        "wait",
        vec![PlanNode::new("wait", "WAIT", "ASYNC")
            .with_parameters(json!({ "callbacks": ["done"] }))
            .with_adviser(AdviserObtainment::new("RETRY", json!({ "max_attempts": 3 })))],
    );
    let id = start(&engine, &plan).await;

    for _ in 0..2 {
        let attempt = current(&engine, id, "wait").await;
        engine
            .resume_node_execution(attempt.ambiance.clone(), error("done", "flaky"), false)
            .await
            .unwrap();
    }
    let last = current(&engine, id, "wait").await;
    resume_all(&engine, &last).await;

    assert_eq!(engine.wait_for_plan(id).await.unwrap().status, Status::Succeeded);
    assert_eq!(engine.node_executions(id).await.unwrap().len(), 3);
    assert_forward_only(&store);
}

#[tokio::test]
async fn test_children_only_move_forward() {
    let store = JournalingStore::new();
    let engine = journaled_engine(store.clone());
    let plan = Plan::new(
        "children",
        "parent",
        vec![
            PlanNode::new("parent", "SECTION", "CHILDREN")
                .with_children(vec!["lint".to_string(), "unit".to_string(), "e2e".to_string()]),
            PlanNode::new("lint", "NOOP", "SYNC"),
            PlanNode::new("unit", "FAIL", "SYNC").with_parameters(json!({ "message": "red" })),
            PlanNode::new("e2e", "WAIT", "ASYNC"),
        ],
    );
    let id = start(&engine, &plan).await;
    let e2e = current(&engine, id, "e2e").await;
    resume_all(&engine, &e2e).await;

    assert_eq!(engine.wait_for_plan(id).await.unwrap().status, Status::Failed);
    assert_forward_only(&store);
}

#[tokio::test]
async fn test_abort_only_moves_forward() {
    let store = JournalingStore::new();
    let engine = journaled_engine(store.clone());
    let plan = Plan::new(
        "abort",
        "outer",
        vec![
            PlanNode::new("outer", "SECTION", "CHILD").with_children(vec!["inner".to_string()]),
            PlanNode::new("inner", "SECTION", "CHILDREN")
                .with_children(vec!["a".to_string(), "b".to_string()]),
            PlanNode::new("a", "WAIT", "ASYNC"),
            PlanNode::new("b", "NOOP", "SYNC"),
        ],
    );
    let id = start(&engine, &plan).await;

    engine.abort_plan(id, "operator abort").await.unwrap();

    assert_eq!(engine.wait_for_plan(id).await.unwrap().status, Status::Aborted);
    assert_forward_only(&store);
}

#[tokio::test]
async fn test_intervention_reopens_a_failure_once() {
    let store = JournalingStore::new();
    let engine = journaled_engine(store.clone());
    let plan = Plan::new(
        "intervene",
        "deploy",
        vec![PlanNode::new("deploy", "FAIL", "SYNC")
            .with_adviser(AdviserObtainment::new("MANUAL_INTERVENTION", json!({})))],
    );
    let id = start(&engine, &plan).await;
    let deploy = current(&engine, id, "deploy").await;

    engine
        .process_adviser_response(
            deploy.ambiance.clone(),
            AdviserResponse::MarkSuccess { next_node_id: None },
        )
        .await
        .unwrap();

    let mut history = store.history(deploy.id);
    history.dedup();
    assert_eq!(
        history,
        vec![
            Status::Queued,
            Status::Facilitating,
            Status::Running,
            Status::Failed,
            Status::InterventionWaiting,
            Status::Succeeded,
        ]
    );
    assert_eq!(engine.wait_for_plan(id).await.unwrap().status, Status::Succeeded);
}
