//! Generic built-in steps

use crate::core::{Ambiance, PlanNode, StepResponse, TaskRequest};
use crate::step::{Step, StepError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

/// Succeeds immediately
pub struct NoopStep;

#[async_trait]
impl Step for NoopStep {
    async fn execute_sync(&self, _ambiance: &Ambiance, _node: &PlanNode) -> Result<StepResponse, StepError> {
        Ok(StepResponse::succeeded())
    }
}

/// Fails with the `message` parameter
pub struct FailStep;

#[async_trait]
impl Step for FailStep {
    async fn execute_sync(&self, _ambiance: &Ambiance, node: &PlanNode) -> Result<StepResponse, StepError> {
        let message = node
            .parameters
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("step failed");
        Ok(StepResponse::failed(message))
    }
}

/// Groups children; its result is the aggregate of theirs
pub struct SectionStep;

#[async_trait]
impl Step for SectionStep {}

#[derive(Debug, Default, Deserialize)]
struct WaitParameters {
    #[serde(default)]
    callbacks: Vec<String>,
}

/// Waits on the callback ids named by `callbacks`, or on one fresh id
pub struct WaitStep;

#[async_trait]
impl Step for WaitStep {
    async fn execute_async(&self, _ambiance: &Ambiance, node: &PlanNode) -> Result<Vec<String>, StepError> {
        let parameters: WaitParameters = parse_parameters(node)?;
        if parameters.callbacks.is_empty() {
            return Ok(vec![Uuid::new_v4().to_string()]);
        }
        Ok(parameters.callbacks)
    }
}

#[derive(Debug, Deserialize)]
struct TaskLink {
    #[serde(default = "default_task_type")]
    task_type: String,

    #[serde(default)]
    data: Value,
}

fn default_task_type() -> String {
    "SHELL".to_string()
}

#[derive(Debug, Deserialize)]
struct TaskParameters {
    #[serde(default = "default_task_type")]
    task_type: String,

    #[serde(default)]
    data: Value,

    /// Links of a task chain, in order
    #[serde(default)]
    chain: Vec<TaskLink>,
}

impl Default for TaskParameters {
    fn default() -> Self {
        Self {
            task_type: default_task_type(),
            data: Value::Null,
            chain: Vec::new(),
        }
    }
}

/// Delegates its parameters to the task executor
pub struct TaskStep;

#[async_trait]
impl Step for TaskStep {
    async fn obtain_task(&self, _ambiance: &Ambiance, node: &PlanNode) -> Result<TaskRequest, StepError> {
        let parameters: TaskParameters = parse_parameters(node)?;
        Ok(TaskRequest {
            task_type: parameters.task_type,
            task_data: parameters.data,
        })
    }

    async fn obtain_task_chain(
        &self,
        _ambiance: &Ambiance,
        node: &PlanNode,
    ) -> Result<Vec<TaskRequest>, StepError> {
        let parameters: TaskParameters = parse_parameters(node)?;
        if parameters.chain.is_empty() {
            return Err(StepError::invalid_parameters(node, "task chain has no links"));
        }
        Ok(parameters
            .chain
            .into_iter()
            .map(|link| TaskRequest {
                task_type: link.task_type,
                task_data: link.data,
            })
            .collect())
    }
}

fn parse_parameters<T>(node: &PlanNode) -> Result<T, StepError>
where
    T: for<'de> Deserialize<'de> + Default,
{
    if node.parameters.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(node.parameters.clone()).map_err(|e| StepError::invalid_parameters(node, e))
}
