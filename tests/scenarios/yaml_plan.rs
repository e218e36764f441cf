//! Plans loaded from YAML, end to end

use crate::helpers::*;
use plan_engine::core::config::PlanConfig;
use plan_engine::core::{SetupAbstractions, Status};
use plan_engine::execution::ExecutionEngine;
use plan_engine::task::InlineTaskExecutor;
use std::sync::Arc;

const RELEASE: &str = r#"
name: "release"
start: "checks"

nodes:
  - id: "checks"
    step_type: "SECTION"
    group: "STAGE"
    facilitators:
      - type: "CHILDREN"
    children: ["lint", "unit"]
    advisers:
      - type: "NEXT_STEP"
        parameters:
          next_node_id: "publish"

  - id: "lint"
    step_type: "NOOP"
    facilitators:
      - type: "SYNC"

  - id: "unit"
    step_type: "TASK"
    facilitators:
      - type: "TASK"
    parameters:
      task_type: "SHELL"
      data: { cmd: "cargo test" }

  - id: "publish"
    step_type: "NOOP"
    skip_condition: "project == 'sandbox'"
    facilitators:
      - type: "SYNC"
"#;

fn inline_engine() -> ExecutionEngine {
    ExecutionEngine::builder()
        .with_task_executor(Arc::new(InlineTaskExecutor))
        .build()
}

#[tokio::test]
async fn test_yaml_plan_runs_to_success() {
    let config = PlanConfig::from_yaml(RELEASE).unwrap();
    let plan = config.to_plan();
    let engine = inline_engine();
    let events = EventLog::attach(&engine).await;

    let id = start(&engine, &plan).await;
    let execution = engine.wait_for_plan(id).await.unwrap();

    assert_eq!(execution.status, Status::Succeeded);
    assert_eq!(execution.plan_id, "release");
    for node_id in ["checks", "lint", "unit", "publish"] {
        assert_eq!(current(&engine, id, node_id).await.status, Status::Succeeded, "{}", node_id);
    }
    assert_eq!(events.count("STAGE_START"), 1);
    assert_eq!(events.count("PIPELINE_END"), 1);
}

#[tokio::test]
async fn test_setup_abstractions_drive_skip_conditions() {
    let plan = PlanConfig::from_yaml(RELEASE).unwrap().to_plan();
    let engine = inline_engine();
    engine.register_plan(&plan).await.unwrap();

    let setup = SetupAbstractions {
        project_identifier: Some("sandbox".to_string()),
        ..SetupAbstractions::default()
    };
    let id = engine.start_plan(&plan.id, setup).await.unwrap();

    assert_eq!(engine.wait_for_plan(id).await.unwrap().status, Status::Succeeded);
    assert_eq!(current(&engine, id, "publish").await.status, Status::Skipped);
}

#[tokio::test]
async fn test_unknown_step_type_is_rejected_at_registration() {
    let yaml = RELEASE.replace("step_type: \"NOOP\"\n    skip", "step_type: \"DEPLOY\"\n    skip");
    let plan = PlanConfig::from_yaml(&yaml).unwrap().to_plan();

    let error = inline_engine().register_plan(&plan).await.unwrap_err();
    assert!(error.to_string().contains("DEPLOY"));
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_history_survives_in_sqlite_file() {
    use plan_engine::persistence::{NodeExecutionStore, PlanExecutionStore, SqliteExecutionStore};

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.db");
    let path = path.to_str().unwrap();

    let plan = PlanConfig::from_yaml(RELEASE).unwrap().to_plan();
    let store = Arc::new(SqliteExecutionStore::new(path).await.unwrap());
    let engine = ExecutionEngine::builder()
        .with_execution_store(store)
        .with_task_executor(Arc::new(InlineTaskExecutor))
        .build();
    let id = start(&engine, &plan).await;
    assert_eq!(engine.wait_for_plan(id).await.unwrap().status, Status::Succeeded);

    let reopened = SqliteExecutionStore::new(path).await.unwrap();
    let executions = reopened.list_plan_executions(Some("release")).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].id, id);
    assert_eq!(executions[0].status, Status::Succeeded);

    let nodes = reopened.list_by_plan_execution(id).await.unwrap();
    assert_eq!(nodes.len(), 4);
    assert!(nodes.iter().all(|node| node.status == Status::Succeeded));
}
