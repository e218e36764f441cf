//! Aborts and expiry cascade through every open node of a plan execution

use crate::helpers::*;
use plan_engine::core::{AdviserObtainment, AdviserResponse, Plan, PlanNode, Status};
use serde_json::json;

/// `depth` nested sections, each with a single child, ending in a wait
fn nested(depth: usize) -> Plan {
    let mut nodes = Vec::new();
    for level in 0..depth {
        let child = if level + 1 == depth {
            "leaf".to_string()
        } else {
            format!("section-{}", level + 1)
        };
        nodes.push(
            PlanNode::new(format!("section-{}", level), "SECTION", "CHILD").with_children(vec![child]),
        );
    }
    nodes.push(PlanNode::new("leaf", "WAIT", "ASYNC"));
    Plan::new("nested", "section-0", nodes)
}

#[tokio::test]
async fn test_abort_reaches_every_level() {
    for depth in [1, 3, 5] {
        let engine = engine();
        let events = EventLog::attach(&engine).await;
        let id = start(&engine, &nested(depth)).await;

        let leaf = current(&engine, id, "leaf").await;
        assert_eq!(leaf.status, Status::AsyncWaiting);
        assert_eq!(leaf.ambiance.levels.len(), depth + 1);

        engine.abort_plan(id, "operator abort").await.unwrap();

        let nodes = engine.node_executions(id).await.unwrap();
        assert_eq!(nodes.len(), depth + 1);
        for node in &nodes {
            assert_eq!(node.status, Status::Aborted, "node '{}'", node.node.id);
            assert!(node.end_ts.is_some());
        }

        let execution = engine.wait_for_plan(id).await.unwrap();
        assert_eq!(execution.status, Status::Aborted);
        assert_eq!(execution.interrupt, Some(Status::Aborted));
        assert_eq!(events.count("PIPELINE_ABORT"), 1);
        assert_eq!(events.count("PIPELINE_END"), 1);
    }
}

#[tokio::test]
async fn test_abort_is_idempotent() {
    let engine = engine();
    let events = EventLog::attach(&engine).await;
    let id = start(&engine, &nested(2)).await;

    engine.abort_plan(id, "first").await.unwrap();
    engine.abort_plan(id, "second").await.unwrap();

    let execution = engine.plan_execution(id).await.unwrap();
    assert_eq!(execution.status, Status::Aborted);
    assert!(!execution.cause.unwrap().contains("second"));
    assert_eq!(current(&engine, id, "leaf").await.cause.as_deref(), Some("first"));
    assert_eq!(events.count("PIPELINE_END"), 1);
}

#[tokio::test]
async fn test_abort_does_not_retry_or_continue() {
    let engine = engine();
    let plan = Plan::new(
        "no-retry",
        "wait",
        vec![
            PlanNode::new("wait", "WAIT", "ASYNC")
                .with_adviser(AdviserObtainment::new("RETRY", json!({ "max_attempts": 5 })))
                .with_adviser(AdviserObtainment::new("ON_FAIL", json!({ "next_node_id": "cleanup" }))),
            PlanNode::new("cleanup", "NOOP", "SYNC"),
        ],
    );
    let id = start(&engine, &plan).await;

    engine.abort_plan(id, "stop").await.unwrap();

    let nodes = engine.node_executions(id).await.unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].status, Status::Aborted);
    assert_eq!(engine.plan_execution(id).await.unwrap().status, Status::Aborted);
}

#[tokio::test]
async fn test_expire_plan_marks_open_nodes_expired() {
    let engine = engine();
    let events = EventLog::attach(&engine).await;
    let id = start(&engine, &nested(2)).await;

    engine.expire_plan(id, "timed out").await.unwrap();

    for node in engine.node_executions(id).await.unwrap() {
        assert_eq!(node.status, Status::Expired);
    }
    let execution = engine.wait_for_plan(id).await.unwrap();
    assert_eq!(execution.status, Status::Expired);
    assert_eq!(events.count("PIPELINE_TIMEOUT"), 1);
}

#[tokio::test]
async fn test_expire_node_lets_the_adviser_decide() {
    let engine = engine();
    let plan = Plan::new(
        "node-timeout",
        "wait",
        vec![
            PlanNode::new("wait", "WAIT", "ASYNC")
                .with_adviser(AdviserObtainment::new("ON_FAIL", json!({ "next_node_id": "cleanup" }))),
            PlanNode::new("cleanup", "NOOP", "SYNC"),
        ],
    );
    let id = start(&engine, &plan).await;
    let wait = current(&engine, id, "wait").await;

    engine.expire_node(wait.id, "no callback in time").await.unwrap();

    assert_eq!(current(&engine, id, "wait").await.status, Status::Expired);
    assert_eq!(current(&engine, id, "cleanup").await.status, Status::Succeeded);
    assert_eq!(engine.wait_for_plan(id).await.unwrap().status, Status::Succeeded);
}

#[tokio::test]
async fn test_expire_node_ends_an_intervention_wait() {
    let engine = engine();
    let plan = Plan::new(
        "intervention-timeout",
        "deploy",
        vec![PlanNode::new("deploy", "FAIL", "SYNC")
            .with_parameters(json!({ "message": "rollout stuck" }))
            .with_adviser(AdviserObtainment::new("MANUAL_INTERVENTION", json!({})))],
    );
    let id = start(&engine, &plan).await;
    let deploy = current(&engine, id, "deploy").await;
    assert_eq!(deploy.status, Status::InterventionWaiting);

    engine.expire_node(deploy.id, "nobody intervened").await.unwrap();

    let deploy = current(&engine, id, "deploy").await;
    assert_eq!(deploy.status, Status::Expired);
    assert!(matches!(
        deploy.adviser_response,
        Some(AdviserResponse::InterventionWait { .. })
    ));
    let execution = tokio::time::timeout(std::time::Duration::from_secs(5), engine.wait_for_plan(id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, Status::Expired);
}
