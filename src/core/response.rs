//! Payloads exchanged between the engine, facilitators, advisers and steps

use crate::core::state::Status;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// How a node is going to execute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    Sync,
    Async,
    Task,
    TaskChain,
    Child,
    Children,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionMode::Sync => "SYNC",
            ExecutionMode::Async => "ASYNC",
            ExecutionMode::Task => "TASK",
            ExecutionMode::TaskChain => "TASK_CHAIN",
            ExecutionMode::Child => "CHILD",
            ExecutionMode::Children => "CHILDREN",
        };
        f.write_str(name)
    }
}

/// Decision of a facilitator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacilitatorResponse {
    pub mode: ExecutionMode,

    /// Delay requested before invocation, in milliseconds
    #[serde(default)]
    pub initial_wait_ms: u64,
}

impl FacilitatorResponse {
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            mode,
            initial_wait_ms: 0,
        }
    }
}

/// Category of a failure reported for a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    Application,
    Connectivity,
    Authentication,
    Timeout,
    Infrastructure,
    Unknown,
}

/// Failure details attached to a concluded node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub message: String,

    #[serde(default)]
    pub failure_types: Vec<FailureType>,
}

impl FailureInfo {
    pub fn new(message: impl Into<String>, failure_type: FailureType) -> Self {
        Self {
            message: message.into(),
            failure_types: vec![failure_type],
        }
    }
}

/// Result of running a step, synchronously or after a resume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResponse {
    pub status: Status,

    #[serde(default)]
    pub failure_info: Option<FailureInfo>,
}

impl StepResponse {
    pub fn succeeded() -> Self {
        Self {
            status: Status::Succeeded,
            failure_info: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Status::Failed,
            failure_info: Some(FailureInfo::new(message, FailureType::Application)),
        }
    }
}

/// What to do once a node has concluded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdviserResponse {
    /// Run the next sibling, or end the chain when there is none
    NextStep { next_node_id: Option<String> },
    /// Start a new attempt of the same node
    Retry {
        #[serde(default)]
        wait_ms: u64,
    },
    /// Propagate the conclusion to the parent
    EndPlan,
    /// Park the node until an operator answers
    InterventionWait {
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    /// Override a failure with success, then continue
    MarkSuccess { next_node_id: Option<String> },
    /// Override a failure with ignore-failed, then continue
    IgnoreFailure { next_node_id: Option<String> },
}

impl AdviserResponse {
    pub fn kind(&self) -> &'static str {
        match self {
            AdviserResponse::NextStep { .. } => "NEXT_STEP",
            AdviserResponse::Retry { .. } => "RETRY",
            AdviserResponse::EndPlan => "END_PLAN",
            AdviserResponse::InterventionWait { .. } => "INTERVENTION_WAITING",
            AdviserResponse::MarkSuccess { .. } => "MARK_SUCCESS",
            AdviserResponse::IgnoreFailure { .. } => "IGNORE_FAILURE",
        }
    }
}

/// A delegated unit of work handed to the task executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_type: String,

    #[serde(default)]
    pub task_data: Value,
}

/// Record of how a node was invoked, kept on the node execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutableResponse {
    Sync,
    Async { callback_ids: Vec<String> },
    Task {
        task_id: Option<String>,
        callback_id: String,
    },
    TaskChain {
        task_ids: Vec<Option<String>>,
        callback_ids: Vec<String>,
    },
    Child { child_node_id: String },
    Children { child_node_ids: Vec<String> },
}

impl ExecutableResponse {
    /// Task ids known to the task executor, for abort and expiry
    pub fn task_ids(&self) -> Vec<&str> {
        match self {
            ExecutableResponse::Task { task_id, .. } => task_id.iter().map(String::as_str).collect(),
            ExecutableResponse::TaskChain { task_ids, .. } => {
                task_ids.iter().flatten().map(String::as_str).collect()
            }
            _ => Vec::new(),
        }
    }
}

/// Payload delivered for one callback key on resume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseData {
    /// Output of a task or async callback
    Output { data: Value },
    /// A child chain concluded
    ChildConcluded {
        node_execution_id: Uuid,
        status: Status,
    },
    /// The callback reports a failure of its own work
    Error { message: String },
}
