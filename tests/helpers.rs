//! Test utility functions for plan-engine

use async_trait::async_trait;
use plan_engine::advisement::{Adviser, AdviserRegistry, AdvisingEvent};
use plan_engine::core::config::EngineConfig;
use plan_engine::core::{
    AdviserResponse, Ambiance, NodeExecution, Plan, PlanExecution, ResponseData, SetupAbstractions,
    Status, TaskRequest,
};
use plan_engine::execution::{ExecutionEngine, PolicyError, SchedulingStrategy};
use plan_engine::persistence::{
    InMemoryStore, NodeExecutionStore, NodeOps, PlanExecutionStore, ProcessedEventStore, StoreError,
};
use plan_engine::task::{TaskError, TaskExecutor};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Task executor that queues every task and remembers what it was asked
#[derive(Default)]
pub struct RecordingTaskExecutor {
    next_id: AtomicUsize,
    pub queued: Mutex<Vec<(String, String)>>,
    pub aborted: Mutex<Vec<String>>,
    pub expired: Mutex<Vec<String>>,
}

impl RecordingTaskExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn queued_callbacks(&self) -> Vec<String> {
        self.queued
            .lock()
            .unwrap()
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect()
    }
}

#[async_trait]
impl TaskExecutor for RecordingTaskExecutor {
    async fn queue_task(
        &self,
        _ambiance: &Ambiance,
        task: &TaskRequest,
        callback_id: &str,
    ) -> Result<Option<String>, TaskError> {
        let index = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.queued
            .lock()
            .unwrap()
            .push((task.task_type.clone(), callback_id.to_string()));
        Ok(Some(format!("task-{}", index)))
    }

    async fn expire_task(&self, _ambiance: &Ambiance, task_id: &str) -> Result<(), TaskError> {
        self.expired.lock().unwrap().push(task_id.to_string());
        Ok(())
    }

    async fn abort_task(&self, _ambiance: &Ambiance, task_id: &str) -> Result<bool, TaskError> {
        self.aborted.lock().unwrap().push(task_id.to_string());
        Ok(true)
    }

    async fn execute_task(
        &self,
        _ambiance: &Ambiance,
        _task: &TaskRequest,
    ) -> Result<Option<ResponseData>, TaskError> {
        Ok(None)
    }
}

/// Adviser that ends the chain and counts how often it was consulted
#[derive(Clone, Default)]
pub struct CountingAdviser {
    pub calls: Arc<AtomicUsize>,
}

impl CountingAdviser {
    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Adviser for CountingAdviser {
    fn can_advise(&self, _event: &AdvisingEvent<'_>) -> bool {
        true
    }

    fn on_advise_event(&self, _event: &AdvisingEvent<'_>) -> Result<AdviserResponse, PolicyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(AdviserResponse::EndPlan)
    }
}

/// Built-in advisers plus a `COUNTING` adviser
pub fn counting_advisers() -> (AdviserRegistry, CountingAdviser) {
    let counter = CountingAdviser::default();
    let mut registry = AdviserRegistry::with_builtins();
    registry.register("COUNTING", counter.clone());
    (registry, counter)
}

pub fn engine() -> ExecutionEngine {
    ExecutionEngine::in_memory(EngineConfig::default())
}

pub fn spawned_engine() -> ExecutionEngine {
    ExecutionEngine::in_memory(EngineConfig {
        scheduling: SchedulingStrategy::Spawned,
        ..EngineConfig::default()
    })
}

/// Register `plan` and start one execution of it
pub async fn start(engine: &ExecutionEngine, plan: &Plan) -> Uuid {
    engine.register_plan(plan).await.unwrap();
    engine
        .start_plan(&plan.id, SetupAbstractions::default())
        .await
        .unwrap()
}

/// Current attempt of the node with setup id `node_id`
pub async fn current(engine: &ExecutionEngine, plan_execution_id: Uuid, node_id: &str) -> NodeExecution {
    find(engine, plan_execution_id, node_id)
        .await
        .unwrap_or_else(|| panic!("no node execution for '{}'", node_id))
}

pub async fn find(engine: &ExecutionEngine, plan_execution_id: Uuid, node_id: &str) -> Option<NodeExecution> {
    engine
        .node_executions(plan_execution_id)
        .await
        .unwrap()
        .into_iter()
        .find(|node| node.node.id == node_id && !node.old_retry)
}

/// Poll until the current attempt of `node_id` reaches `status`
pub async fn wait_for_status(
    engine: &ExecutionEngine,
    plan_execution_id: Uuid,
    node_id: &str,
    status: Status,
) -> NodeExecution {
    let polled = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(node) = find(engine, plan_execution_id, node_id).await {
                if node.status == status {
                    return node;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    polled.unwrap_or_else(|_| panic!("'{}' never reached {}", node_id, status))
}

pub fn output(key: &str, data: serde_json::Value) -> BTreeMap<String, ResponseData> {
    BTreeMap::from([(key.to_string(), ResponseData::Output { data })])
}

pub fn error(key: &str, message: &str) -> BTreeMap<String, ResponseData> {
    BTreeMap::from([(
        key.to_string(),
        ResponseData::Error {
            message: message.to_string(),
        },
    )])
}

/// Answer every expected callback of `node` with an output
pub async fn resume_all(engine: &ExecutionEngine, node: &NodeExecution) {
    let responses = node
        .expected_callbacks
        .iter()
        .map(|key| (key.clone(), ResponseData::Output { data: serde_json::Value::Null }))
        .collect();
    engine
        .resume_node_execution(node.ambiance.clone(), responses, false)
        .await
        .unwrap();
}

/// In-memory store that journals every status it persists, per node execution
///
/// With `failing_retries` it refuses to save retry attempts.
#[derive(Default)]
pub struct JournalingStore {
    inner: InMemoryStore,
    statuses: Mutex<Vec<(Uuid, Status)>>,
    fail_retry_saves: bool,
}

impl JournalingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_retries() -> Arc<Self> {
        Arc::new(Self {
            fail_retry_saves: true,
            ..Self::default()
        })
    }

    fn record(&self, node: &NodeExecution) {
        self.statuses.lock().unwrap().push((node.id, node.status));
    }

    /// Statuses written for one node execution, oldest first
    pub fn history(&self, id: Uuid) -> Vec<Status> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .filter(|(node_id, _)| *node_id == id)
            .map(|(_, status)| *status)
            .collect()
    }

    pub fn node_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.statuses.lock().unwrap().iter().map(|(id, _)| *id).collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

#[async_trait]
impl NodeExecutionStore for JournalingStore {
    async fn save(&self, node: &NodeExecution) -> Result<NodeExecution, StoreError> {
        if self.fail_retry_saves && !node.retry_ids.is_empty() {
            return Err(StoreError::Backend("database is locked".to_string()));
        }
        let saved = self.inner.save(node).await?;
        self.record(&saved);
        Ok(saved)
    }

    async fn get(&self, id: Uuid) -> Result<Option<NodeExecution>, StoreError> {
        self.inner.get(id).await
    }

    async fn update(&self, node: &NodeExecution) -> Result<NodeExecution, StoreError> {
        let written = self.inner.update(node).await?;
        self.record(&written);
        Ok(written)
    }

    async fn list_children(&self, parent_id: Uuid) -> Result<Vec<NodeExecution>, StoreError> {
        self.inner.list_children(parent_id).await
    }

    async fn list_by_plan_execution(
        &self,
        plan_execution_id: Uuid,
    ) -> Result<Vec<NodeExecution>, StoreError> {
        self.inner.list_by_plan_execution(plan_execution_id).await
    }

    async fn update_status_if_in(
        &self,
        id: Uuid,
        from: &[Status],
        to: Status,
        ops: &NodeOps<'_>,
    ) -> Result<Option<NodeExecution>, StoreError> {
        let written = self.inner.update_status_if_in(id, from, to, ops).await?;
        if let Some(node) = &written {
            self.record(node);
        }
        Ok(written)
    }
}

#[async_trait]
impl PlanExecutionStore for JournalingStore {
    async fn save_plan_execution(&self, execution: &PlanExecution) -> Result<PlanExecution, StoreError> {
        self.inner.save_plan_execution(execution).await
    }

    async fn get_plan_execution(&self, id: Uuid) -> Result<Option<PlanExecution>, StoreError> {
        self.inner.get_plan_execution(id).await
    }

    async fn update_plan_execution(&self, execution: &PlanExecution) -> Result<PlanExecution, StoreError> {
        self.inner.update_plan_execution(execution).await
    }

    async fn list_plan_executions(&self, plan_id: Option<&str>) -> Result<Vec<PlanExecution>, StoreError> {
        self.inner.list_plan_executions(plan_id).await
    }
}

#[async_trait]
impl ProcessedEventStore for JournalingStore {
    async fn try_claim(&self, key: &str, lease: Duration) -> Result<bool, StoreError> {
        self.inner.try_claim(key, lease).await
    }

    async fn complete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.complete(key).await
    }

    async fn release(&self, key: &str) -> Result<(), StoreError> {
        self.inner.release(key).await
    }
}

/// Engine whose node executions go through `store`
pub fn journaled_engine(store: Arc<JournalingStore>) -> ExecutionEngine {
    ExecutionEngine::builder().with_execution_store(store).build()
}

/// Collects the event types the engine emits, in order
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    pub async fn attach(engine: &ExecutionEngine) -> Self {
        let log = Self::default();
        let events = log.events.clone();
        engine
            .add_event_handler(move |event| {
                events.lock().unwrap().push(event.event_type().to_string());
            })
            .await;
        log
    }

    pub fn types(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event_type: &str) -> usize {
        self.types().iter().filter(|t| *t == event_type).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_executor_numbers_tasks() {
        let executor = RecordingTaskExecutor::new();
        let ambiance = Ambiance::for_plan("plan", SetupAbstractions::default());
        let task = TaskRequest {
            task_type: "SHELL".to_string(),
            task_data: serde_json::Value::Null,
        };

        let first = executor.queue_task(&ambiance, &task, "c1").await.unwrap();
        let second = executor.queue_task(&ambiance, &task, "c2").await.unwrap();

        assert_eq!(first.as_deref(), Some("task-1"));
        assert_eq!(second.as_deref(), Some("task-2"));
        assert_eq!(executor.queued_callbacks(), vec!["c1".to_string(), "c2".to_string()]);
    }
}
