//! SDK response events - how external step hosts report back to the engine

pub mod envelope;

pub use envelope::SdkResponseEventEnvelope;

use crate::core::{
    AdviserResponse, ExecutableResponse, FacilitatorResponse, FailureType, ResponseData,
    StepResponse, TaskRequest,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Wire tags of the event types the engine accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SdkResponseEventType {
    AddExecutableResponse,
    HandleStepResponse,
    ResumeNode,
    HandleFacilitateResponse,
    HandleAdviserResponse,
    HandleEventError,
    QueueTask,
    SpawnChild,
    SpawnChildren,
}

impl SdkResponseEventType {
    pub const ALL: &'static [SdkResponseEventType] = &[
        SdkResponseEventType::AddExecutableResponse,
        SdkResponseEventType::HandleStepResponse,
        SdkResponseEventType::ResumeNode,
        SdkResponseEventType::HandleFacilitateResponse,
        SdkResponseEventType::HandleAdviserResponse,
        SdkResponseEventType::HandleEventError,
        SdkResponseEventType::QueueTask,
        SdkResponseEventType::SpawnChild,
        SdkResponseEventType::SpawnChildren,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SdkResponseEventType::AddExecutableResponse => "ADD_EXECUTABLE_RESPONSE",
            SdkResponseEventType::HandleStepResponse => "HANDLE_STEP_RESPONSE",
            SdkResponseEventType::ResumeNode => "RESUME_NODE",
            SdkResponseEventType::HandleFacilitateResponse => "HANDLE_FACILITATE_RESPONSE",
            SdkResponseEventType::HandleAdviserResponse => "HANDLE_ADVISER_RESPONSE",
            SdkResponseEventType::HandleEventError => "HANDLE_EVENT_ERROR",
            SdkResponseEventType::QueueTask => "QUEUE_TASK",
            SdkResponseEventType::SpawnChild => "SPAWN_CHILD",
            SdkResponseEventType::SpawnChildren => "SPAWN_CHILDREN",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|event_type| event_type.as_str() == value)
    }
}

impl fmt::Display for SdkResponseEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of `RESUME_NODE`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeNodeRequest {
    pub responses: BTreeMap<String, ResponseData>,

    /// The remote executor itself failed
    #[serde(default)]
    pub async_error: bool,
}

/// Payload of `HANDLE_EVENT_ERROR`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventErrorRequest {
    pub message: String,

    #[serde(default)]
    pub failure_types: Vec<FailureType>,
}

/// Payload of `QUEUE_TASK`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueTaskRequest {
    pub task: TaskRequest,
    pub callback_id: String,
}

/// Payload of `SPAWN_CHILD`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnChildRequest {
    pub child_node_id: String,
}

/// Payload of `SPAWN_CHILDREN`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnChildrenRequest {
    pub child_node_ids: Vec<String>,
}

/// A decoded event, ready to forward to the node's strategy
#[derive(Debug, Clone, PartialEq)]
pub enum SdkResponseEvent {
    AddExecutableResponse(ExecutableResponse),
    HandleStepResponse(StepResponse),
    ResumeNode(ResumeNodeRequest),
    HandleFacilitateResponse(FacilitatorResponse),
    HandleAdviserResponse(AdviserResponse),
    HandleEventError(EventErrorRequest),
    QueueTask(QueueTaskRequest),
    SpawnChild(SpawnChildRequest),
    SpawnChildren(SpawnChildrenRequest),
}

impl SdkResponseEvent {
    pub fn event_type(&self) -> SdkResponseEventType {
        match self {
            SdkResponseEvent::AddExecutableResponse(_) => SdkResponseEventType::AddExecutableResponse,
            SdkResponseEvent::HandleStepResponse(_) => SdkResponseEventType::HandleStepResponse,
            SdkResponseEvent::ResumeNode(_) => SdkResponseEventType::ResumeNode,
            SdkResponseEvent::HandleFacilitateResponse(_) => SdkResponseEventType::HandleFacilitateResponse,
            SdkResponseEvent::HandleAdviserResponse(_) => SdkResponseEventType::HandleAdviserResponse,
            SdkResponseEvent::HandleEventError(_) => SdkResponseEventType::HandleEventError,
            SdkResponseEvent::QueueTask(_) => SdkResponseEventType::QueueTask,
            SdkResponseEvent::SpawnChild(_) => SdkResponseEventType::SpawnChild,
            SdkResponseEvent::SpawnChildren(_) => SdkResponseEventType::SpawnChildren,
        }
    }

    /// Distinguishes events of the same type for the same node
    fn discriminator(&self) -> String {
        match self {
            SdkResponseEvent::ResumeNode(request) => {
                // BTreeMap keys are already sorted
                request.responses.keys().cloned().collect::<Vec<_>>().join(",")
            }
            SdkResponseEvent::QueueTask(request) => request.callback_id.clone(),
            SdkResponseEvent::SpawnChild(request) => request.child_node_id.clone(),
            SdkResponseEvent::SpawnChildren(request) => request.child_node_ids.join(","),
            SdkResponseEvent::AddExecutableResponse(response) => match response {
                ExecutableResponse::Async { callback_ids } => callback_ids.join(","),
                ExecutableResponse::Task { callback_id, .. } => callback_id.clone(),
                ExecutableResponse::TaskChain { callback_ids, .. } => callback_ids.join(","),
                ExecutableResponse::Child { child_node_id } => child_node_id.clone(),
                ExecutableResponse::Children { child_node_ids } => child_node_ids.join(","),
                ExecutableResponse::Sync => String::new(),
            },
            _ => String::new(),
        }
    }

    /// Key under which the processed-event store remembers this event
    pub fn idempotency_key(&self, node_execution_id: Uuid) -> String {
        format!("{}:{}:{}", node_execution_id, self.event_type(), self.discriminator())
    }
}
