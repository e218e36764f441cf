//! Step boundary - the business logic a node runs, resolved by step type

pub mod builtin;

use crate::core::{
    Ambiance, ExecutionMode, PlanNode, ResponseData, Status, StepResponse, TaskRequest,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

/// Error types for step invocation
#[derive(Debug, Error)]
pub enum StepError {
    #[error("Step type {step_type} does not support {mode} mode")]
    UnsupportedMode {
        step_type: String,
        mode: ExecutionMode,
    },

    #[error("Invalid parameters for step {step_type}: {reason}")]
    InvalidParameters { step_type: String, reason: String },

    #[error("Step {step_type} failed unexpectedly: {reason}")]
    Internal { step_type: String, reason: String },
}

impl StepError {
    pub fn unsupported(node: &PlanNode, mode: ExecutionMode) -> Self {
        StepError::UnsupportedMode {
            step_type: node.step_type.clone(),
            mode,
        }
    }

    pub fn invalid_parameters(node: &PlanNode, reason: impl ToString) -> Self {
        StepError::InvalidParameters {
            step_type: node.step_type.clone(),
            reason: reason.to_string(),
        }
    }
}

/// A step type; one implementation per tag, shared by every node using it
///
/// Each execution mode has its own entry point. Modes a step does not
/// implement fail with `UnsupportedMode`.
#[async_trait]
pub trait Step: Send + Sync {
    async fn execute_sync(&self, _ambiance: &Ambiance, node: &PlanNode) -> Result<StepResponse, StepError> {
        Err(StepError::unsupported(node, ExecutionMode::Sync))
    }

    /// Start asynchronous work; returns the callback ids to wait for
    async fn execute_async(&self, _ambiance: &Ambiance, node: &PlanNode) -> Result<Vec<String>, StepError> {
        Err(StepError::unsupported(node, ExecutionMode::Async))
    }

    async fn obtain_task(&self, _ambiance: &Ambiance, node: &PlanNode) -> Result<TaskRequest, StepError> {
        Err(StepError::unsupported(node, ExecutionMode::Task))
    }

    async fn obtain_task_chain(
        &self,
        _ambiance: &Ambiance,
        node: &PlanNode,
    ) -> Result<Vec<TaskRequest>, StepError> {
        Err(StepError::unsupported(node, ExecutionMode::TaskChain))
    }

    /// Turn async or task callbacks into the node's result
    ///
    /// The default fails when any callback reported an error.
    async fn handle_async_response(
        &self,
        _ambiance: &Ambiance,
        _node: &PlanNode,
        responses: &BTreeMap<String, ResponseData>,
    ) -> Result<StepResponse, StepError> {
        let errors: Vec<&str> = responses
            .values()
            .filter_map(|response| match response {
                ResponseData::Error { message } => Some(message.as_str()),
                _ => None,
            })
            .collect();

        if errors.is_empty() {
            Ok(StepResponse::succeeded())
        } else {
            Ok(StepResponse::failed(errors.join("; ")))
        }
    }

    /// Turn concluded children into the node's result
    ///
    /// The default aggregates the child statuses.
    async fn handle_children_response(
        &self,
        _ambiance: &Ambiance,
        _node: &PlanNode,
        responses: &BTreeMap<String, ResponseData>,
    ) -> Result<StepResponse, StepError> {
        let status = Status::aggregate(responses.values().filter_map(|response| match response {
            ResponseData::ChildConcluded { status, .. } => Some(*status),
            ResponseData::Error { .. } => Some(Status::Failed),
            ResponseData::Output { .. } => None,
        }));

        if status.is_positive() {
            Ok(StepResponse::succeeded())
        } else {
            let failed: Vec<&str> = responses
                .iter()
                .filter(|(_, response)| {
                    !matches!(response, ResponseData::ChildConcluded { status, .. } if status.is_positive())
                })
                .map(|(key, _)| key.as_str())
                .collect();
            let mut response = StepResponse::failed(format!("children did not succeed: {}", failed.join(", ")));
            response.status = status;
            Ok(response)
        }
    }
}

/// Registry of step implementations by step type
#[derive(Clone, Default)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<dyn Step>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with NOOP, FAIL, SECTION, WAIT and TASK
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("NOOP", builtin::NoopStep);
        registry.register("FAIL", builtin::FailStep);
        registry.register("SECTION", builtin::SectionStep);
        registry.register("WAIT", builtin::WaitStep);
        registry.register("TASK", builtin::TaskStep);
        registry
    }

    pub fn register<S: Step + 'static>(&mut self, step_type: impl Into<String>, step: S) {
        self.steps.insert(step_type.into(), Arc::new(step));
    }

    pub fn resolve(&self, step_type: &str) -> Option<Arc<dyn Step>> {
        self.steps.get(step_type).cloned()
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.steps.contains_key(step_type)
    }
}
