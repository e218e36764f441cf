//! Task delegation through the task executor

use crate::helpers::*;
use plan_engine::core::{
    ErrorMarker, ExecutableResponse, FailureType, Plan, PlanNode, ResponseData, Status, TaskRequest,
};
use plan_engine::events::{
    EventErrorRequest, QueueTaskRequest, ResumeNodeRequest, SdkResponseEvent, SdkResponseEventEnvelope,
};
use plan_engine::execution::ExecutionEngine;
use plan_engine::task::{InlineTaskExecutor, NoopTaskExecutor};
use serde_json::json;
use std::sync::Arc;

fn task_plan() -> Plan {
    Plan::new(
        "tasks",
        "build",
        vec![PlanNode::new("build", "TASK", "TASK")
            .with_parameters(json!({ "task_type": "BUILD", "data": { "target": "release" } }))],
    )
}

#[tokio::test]
async fn test_inline_task_succeeds_without_waiting() {
    let engine = ExecutionEngine::builder()
        .with_task_executor(Arc::new(InlineTaskExecutor))
        .build();
    let id = start(&engine, &task_plan()).await;

    assert_eq!(engine.wait_for_plan(id).await.unwrap().status, Status::Succeeded);
    let node = current(&engine, id, "build").await;
    assert_eq!(node.status, Status::Succeeded);
    assert!(matches!(
        node.executable_responses.as_slice(),
        [ExecutableResponse::Task { task_id: None, .. }]
    ));
    assert_eq!(node.resume_responses.len(), 1);
}

#[tokio::test]
async fn test_inline_task_chain_fails_on_failing_link() {
    let engine = ExecutionEngine::builder()
        .with_task_executor(Arc::new(InlineTaskExecutor))
        .build();
    let plan = Plan::new(
        "chain",
        "pipeline",
        vec![PlanNode::new("pipeline", "TASK", "TASK_CHAIN").with_parameters(json!({
            "chain": [
                { "task_type": "SHELL", "data": { "cmd": "make" } },
                { "task_type": "FAIL", "data": { "message": "tests failed" } }
            ]
        }))],
    );
    let id = start(&engine, &plan).await;

    let node = current(&engine, id, "pipeline").await;
    assert_eq!(node.status, Status::Failed);
    assert_eq!(node.cause.as_deref(), Some("tests failed"));
    assert_eq!(node.expected_callbacks.len(), 2);
    assert_eq!(engine.plan_execution(id).await.unwrap().status, Status::Failed);
}

#[tokio::test]
async fn test_queued_task_waits_for_its_callback() {
    let executor = RecordingTaskExecutor::new();
    let engine = ExecutionEngine::builder()
        .with_task_executor(executor.clone())
        .build();
    let id = start(&engine, &task_plan()).await;

    let node = current(&engine, id, "build").await;
    assert_eq!(node.status, Status::TaskWaiting);
    assert_eq!(node.task_ids(), vec!["task-1".to_string()]);
    let callbacks = executor.queued_callbacks();
    assert_eq!(node.expected_callbacks, callbacks);

    let event = SdkResponseEvent::ResumeNode(ResumeNodeRequest {
        responses: output(&callbacks[0], json!({ "artifact": "app.tar" })),
        async_error: false,
    });
    engine
        .handle_sdk_response_event(SdkResponseEventEnvelope::new(node.ambiance.clone(), &event).unwrap())
        .await
        .unwrap();

    let node = current(&engine, id, "build").await;
    assert_eq!(node.status, Status::Succeeded);
    assert!(matches!(
        node.resume_responses.get(&callbacks[0]),
        Some(ResponseData::Output { .. })
    ));
    assert_eq!(engine.wait_for_plan(id).await.unwrap().status, Status::Succeeded);
}

#[tokio::test]
async fn test_unavailable_executor_fails_node_as_infrastructure() {
    let engine = ExecutionEngine::builder()
        .with_task_executor(Arc::new(NoopTaskExecutor))
        .build();
    let id = start(&engine, &task_plan()).await;

    let node = current(&engine, id, "build").await;
    assert_eq!(node.status, Status::Failed);
    assert_eq!(node.error_marker, Some(ErrorMarker::Infrastructure));
    assert_eq!(
        node.failure_info.unwrap().failure_types,
        vec![FailureType::Infrastructure]
    );
    assert_eq!(node.adviser_response, None);
    assert_eq!(engine.plan_execution(id).await.unwrap().status, Status::Failed);
}

#[tokio::test]
async fn test_abort_stops_queued_tasks() {
    let executor = RecordingTaskExecutor::new();
    let engine = ExecutionEngine::builder()
        .with_task_executor(executor.clone())
        .build();
    let id = start(&engine, &task_plan()).await;

    engine.abort_plan(id, "cancelled").await.unwrap();

    assert_eq!(*executor.aborted.lock().unwrap(), vec!["task-1".to_string()]);
    assert!(executor.expired.lock().unwrap().is_empty());
    assert_eq!(current(&engine, id, "build").await.status, Status::Aborted);
    assert_eq!(engine.wait_for_plan(id).await.unwrap().status, Status::Aborted);
}

#[tokio::test]
async fn test_expire_plan_expires_queued_tasks() {
    let executor = RecordingTaskExecutor::new();
    let engine = ExecutionEngine::builder()
        .with_task_executor(executor.clone())
        .build();
    let id = start(&engine, &task_plan()).await;

    engine.expire_plan(id, "deadline").await.unwrap();

    assert_eq!(*executor.expired.lock().unwrap(), vec!["task-1".to_string()]);
    assert_eq!(current(&engine, id, "build").await.status, Status::Expired);
}

#[tokio::test]
async fn test_event_error_fails_waiting_node() {
    let executor = RecordingTaskExecutor::new();
    let engine = ExecutionEngine::builder()
        .with_task_executor(executor.clone())
        .build();
    let id = start(&engine, &task_plan()).await;
    let node = current(&engine, id, "build").await;

    let event = SdkResponseEvent::HandleEventError(EventErrorRequest {
        message: "runner lost".to_string(),
        failure_types: vec![FailureType::Connectivity],
    });
    engine
        .handle_sdk_response_event(SdkResponseEventEnvelope::new(node.ambiance.clone(), &event).unwrap())
        .await
        .unwrap();

    let node = current(&engine, id, "build").await;
    assert_eq!(node.status, Status::Failed);
    assert_eq!(node.error_marker, Some(ErrorMarker::Errored));
    assert_eq!(
        node.failure_info.unwrap().failure_types,
        vec![FailureType::Connectivity]
    );
}

#[tokio::test]
async fn test_queue_task_event_requires_running_node() {
    let executor = RecordingTaskExecutor::new();
    let engine = ExecutionEngine::builder()
        .with_task_executor(executor.clone())
        .build();
    let id = start(&engine, &task_plan()).await;
    let node = current(&engine, id, "build").await;

    // Already waiting on its own task
    let event = SdkResponseEvent::QueueTask(QueueTaskRequest {
        task: TaskRequest {
            task_type: "SHELL".to_string(),
            task_data: json!({}),
        },
        callback_id: "extra".to_string(),
    });
    let result = engine
        .handle_sdk_response_event(SdkResponseEventEnvelope::new(node.ambiance.clone(), &event).unwrap())
        .await;

    assert!(result.is_err());
    assert_eq!(executor.queued_callbacks().len(), 1);
    assert_eq!(current(&engine, id, "build").await.status, Status::TaskWaiting);
}

#[tokio::test]
async fn test_task_chain_queues_every_link_up_front() {
    let executor = RecordingTaskExecutor::new();
    let engine = ExecutionEngine::builder()
        .with_task_executor(executor.clone())
        .build();
    let plan = Plan::new(
        "chain",
        "release",
        vec![PlanNode::new("release", "TASK", "TASK_CHAIN").with_parameters(json!({
            "chain": [
                { "task_type": "BUILD", "data": {} },
                { "task_type": "PUBLISH", "data": {} }
            ]
        }))],
    );
    let id = start(&engine, &plan).await;

    let node = current(&engine, id, "release").await;
    assert_eq!(node.status, Status::TaskWaiting);
    assert_eq!(node.task_ids(), vec!["task-1".to_string(), "task-2".to_string()]);
    let callbacks = executor.queued_callbacks();
    assert_eq!(callbacks.len(), 2);

    resume_all(&engine, &node).await;
    assert_eq!(current(&engine, id, "release").await.status, Status::Succeeded);
    assert_eq!(engine.wait_for_plan(id).await.unwrap().status, Status::Succeeded);
}
