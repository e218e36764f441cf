//! Children barriers: the parent advances once, whatever the resume order

use crate::helpers::*;
use plan_engine::core::config::EngineConfig;
use plan_engine::core::{AdviserObtainment, Plan, PlanNode, ResponseData, Status};
use plan_engine::execution::{ExecutionEngine, SchedulingStrategy};
use proptest::prelude::*;
use serde_json::json;
use std::collections::BTreeMap;

const WIDTH: usize = 4;

fn fan_out(width: usize) -> Plan {
    let child_ids: Vec<String> = (0..width).map(|i| format!("child-{}", i)).collect();
    let mut nodes = vec![PlanNode::new("parent", "SECTION", "CHILDREN")
        .with_children(child_ids.clone())
        .with_adviser(AdviserObtainment::new("COUNTING", json!({})))];
    for child_id in &child_ids {
        nodes.push(PlanNode::new(child_id.as_str(), "WAIT", "ASYNC"));
    }
    Plan::new("fan-out", "parent", nodes)
}

fn counting_engine() -> (ExecutionEngine, CountingAdviser) {
    let (advisers, counter) = counting_advisers();
    let engine = ExecutionEngine::builder().with_advisers(advisers).build();
    (engine, counter)
}

#[test]
fn test_parent_advances_once_in_any_resume_order() {
    let mut runner = proptest::test_runner::TestRunner::new(ProptestConfig {
        cases: 24,
        ..ProptestConfig::default()
    });
    let orders = Just((0..WIDTH).collect::<Vec<_>>()).prop_shuffle();

    runner
        .run(&orders, |order| {
            let runtime = tokio::runtime::Runtime::new().unwrap();
            runtime.block_on(async {
                let (engine, counter) = counting_engine();
                let id = start(&engine, &fan_out(WIDTH)).await;

                let parent = current(&engine, id, "parent").await;
                assert_eq!(parent.status, Status::Running);
                assert_eq!(parent.expected_callbacks.len(), WIDTH);

                for (position, index) in order.iter().enumerate() {
                    let child = current(&engine, id, &format!("child-{}", index)).await;
                    assert_eq!(child.status, Status::AsyncWaiting);
                    resume_all(&engine, &child).await;

                    let parent = current(&engine, id, "parent").await;
                    if position + 1 < WIDTH {
                        assert_eq!(parent.status, Status::Running);
                        assert!(!parent.resumed);
                    }
                }

                let parent = current(&engine, id, "parent").await;
                assert_eq!(parent.status, Status::Succeeded);
                assert!(parent.resumed);
                assert_eq!(parent.resume_responses.len(), WIDTH);
                assert_eq!(counter.count(), 1);
                assert_eq!(engine.plan_execution(id).await.unwrap().status, Status::Succeeded);
            });
            Ok(())
        })
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_child_resumes_advance_parent_once() {
    let (advisers, counter) = counting_advisers();
    let engine = ExecutionEngine::builder()
        .with_advisers(advisers)
        .with_config(EngineConfig {
            scheduling: SchedulingStrategy::Spawned,
            ..EngineConfig::default()
        })
        .build();
    let id = start(&engine, &fan_out(WIDTH)).await;

    let mut children = Vec::new();
    for index in 0..WIDTH {
        children.push(wait_for_status(&engine, id, &format!("child-{}", index), Status::AsyncWaiting).await);
    }

    let handles: Vec<_> = children
        .into_iter()
        .map(|child| {
            let engine = engine.clone();
            tokio::spawn(async move { resume_all(&engine, &child).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    let execution = tokio::time::timeout(std::time::Duration::from_secs(5), engine.wait_for_plan(id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, Status::Succeeded);

    let parent = current(&engine, id, "parent").await;
    assert_eq!(parent.status, Status::Succeeded);
    assert_eq!(counter.count(), 1);
}

#[tokio::test]
async fn test_failed_child_fails_parent_after_all_conclude() {
    let (engine, counter) = counting_engine();
    let id = start(&engine, &fan_out(2)).await;

    let first = current(&engine, id, "child-0").await;
    let failures: BTreeMap<String, ResponseData> = first
        .expected_callbacks
        .iter()
        .map(|key| (key.clone(), ResponseData::Error { message: "boom".to_string() }))
        .collect();
    engine
        .resume_node_execution(first.ambiance.clone(), failures, false)
        .await
        .unwrap();
    assert_eq!(current(&engine, id, "child-0").await.status, Status::Failed);
    assert_eq!(current(&engine, id, "parent").await.status, Status::Running);

    let second = current(&engine, id, "child-1").await;
    resume_all(&engine, &second).await;

    let parent = current(&engine, id, "parent").await;
    assert_eq!(parent.status, Status::Failed);
    assert!(parent.cause.unwrap().contains("child-0"));
    assert_eq!(counter.count(), 1);
    assert_eq!(engine.plan_execution(id).await.unwrap().status, Status::Failed);
}
