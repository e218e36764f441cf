//! Node execution strategies - one per node type, selected by the engine

use crate::core::{
    AdviserResponse, Ambiance, ErrorMarker, FacilitatorResponse, FailureInfo, NodeExecution,
    NodeType, PlanNode, ResponseData, Status, StepResponse,
};
use crate::events::SdkResponseEvent;
use crate::execution::{EngineError, ExecutionEngine};
use async_trait::async_trait;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Where a new node execution sits relative to existing ones
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeLinks {
    pub parent_id: Option<Uuid>,
    pub previous_id: Option<Uuid>,
    pub branch_id: Option<String>,
}

/// Everything `run_node` needs besides the ambiance
#[derive(Debug, Clone, PartialEq)]
pub struct RunNodeRequest {
    pub node: PlanNode,
    pub parent_id: Option<Uuid>,
    pub previous_id: Option<Uuid>,
    pub branch_id: Option<String>,
    /// First attempt, when this run is a retry
    pub original_node_execution_id: Option<Uuid>,
    pub retry_ids: Vec<Uuid>,
}

impl RunNodeRequest {
    pub fn new(node: PlanNode) -> Self {
        Self {
            node,
            parent_id: None,
            previous_id: None,
            branch_id: None,
            original_node_execution_id: None,
            retry_ids: Vec::new(),
        }
    }

    pub fn linked(node: PlanNode, links: NodeLinks) -> Self {
        Self {
            parent_id: links.parent_id,
            previous_id: links.previous_id,
            branch_id: links.branch_id,
            ..Self::new(node)
        }
    }

    pub fn with_parent(mut self, parent_id: Option<Uuid>) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn with_previous(mut self, previous_id: Option<Uuid>) -> Self {
        self.previous_id = previous_id;
        self
    }

    pub fn with_branch(mut self, branch_id: Option<String>) -> Self {
        self.branch_id = branch_id;
        self
    }
}

/// A terminal status with its reason
#[derive(Debug, Clone, PartialEq)]
pub struct Conclusion {
    pub status: Status,
    pub cause: String,
    pub failure_info: Option<FailureInfo>,
    pub error_marker: Option<ErrorMarker>,
}

impl Conclusion {
    pub fn new(status: Status, cause: impl Into<String>) -> Self {
        Self {
            status,
            cause: cause.into(),
            failure_info: None,
            error_marker: None,
        }
    }

    pub fn from_step(response: StepResponse) -> Self {
        let cause = match &response.failure_info {
            Some(info) => info.message.clone(),
            None => format!("step concluded {}", response.status),
        };
        Self {
            status: response.status,
            cause,
            failure_info: response.failure_info,
            error_marker: None,
        }
    }

    pub fn with_failure(mut self, failure_info: FailureInfo) -> Self {
        self.failure_info = Some(failure_info);
        self
    }

    pub fn with_marker(mut self, marker: ErrorMarker) -> Self {
        self.error_marker = Some(marker);
        self
    }
}

/// Per-node-type behaviour behind the engine's entry points
///
/// Every operation receives the engine so it can re-enter through the
/// dispatcher. Operations a node type has no use for are `Unsupported`.
#[async_trait]
pub trait NodeExecutionStrategy: Send + Sync {
    fn node_type(&self) -> NodeType;

    /// Create the record for `ambiance` and start it; returns its id
    async fn run_node(
        &self,
        engine: &ExecutionEngine,
        ambiance: Ambiance,
        request: RunNodeRequest,
    ) -> Result<Uuid, EngineError>;

    /// Start the sibling `next_node_id` after the current node
    async fn run_next_node(
        &self,
        _engine: &ExecutionEngine,
        _ambiance: Ambiance,
        _next_node_id: String,
    ) -> Result<Uuid, EngineError> {
        Err(self.unsupported("run_next_node"))
    }

    async fn start_execution(&self, _engine: &ExecutionEngine, _ambiance: Ambiance) -> Result<(), EngineError> {
        Err(self.unsupported("start_execution"))
    }

    async fn process_facilitator_response(
        &self,
        _engine: &ExecutionEngine,
        _ambiance: Ambiance,
        _response: FacilitatorResponse,
    ) -> Result<(), EngineError> {
        Err(self.unsupported("process_facilitator_response"))
    }

    async fn process_step_response(
        &self,
        _engine: &ExecutionEngine,
        _ambiance: Ambiance,
        _response: StepResponse,
    ) -> Result<(), EngineError> {
        Err(self.unsupported("process_step_response"))
    }

    async fn process_adviser_response(
        &self,
        _engine: &ExecutionEngine,
        _ambiance: Ambiance,
        _response: AdviserResponse,
    ) -> Result<(), EngineError> {
        Err(self.unsupported("process_adviser_response"))
    }

    async fn resume_node_execution(
        &self,
        _engine: &ExecutionEngine,
        _ambiance: Ambiance,
        _responses: BTreeMap<String, ResponseData>,
        _async_error: bool,
    ) -> Result<(), EngineError> {
        Err(self.unsupported("resume_node_execution"))
    }

    /// Guarded move into a terminal status, then advise or end
    async fn conclude_execution(
        &self,
        _engine: &ExecutionEngine,
        _ambiance: Ambiance,
        _conclusion: Conclusion,
        _allowed: &[Status],
    ) -> Result<NodeExecution, EngineError> {
        Err(self.unsupported("conclude_execution"))
    }

    /// The node is done for good; propagate to its parent (or the plan)
    async fn end_node_execution(&self, engine: &ExecutionEngine, ambiance: Ambiance) -> Result<(), EngineError>;

    /// Interrupt the addressed node (or the whole plan)
    ///
    /// `status` is `Aborted` or `Expired`.
    async fn interrupt(
        &self,
        engine: &ExecutionEngine,
        ambiance: Ambiance,
        status: Status,
        cause: String,
    ) -> Result<(), EngineError>;

    /// Last resort when an operation failed; never fails itself
    async fn handle_error(&self, engine: &ExecutionEngine, ambiance: Ambiance, error: EngineError);

    async fn handle_sdk_response_event(
        &self,
        _engine: &ExecutionEngine,
        _ambiance: Ambiance,
        _event: SdkResponseEvent,
    ) -> Result<(), EngineError> {
        Err(self.unsupported("handle_sdk_response_event"))
    }

    fn unsupported(&self, operation: &'static str) -> EngineError {
        EngineError::Unsupported {
            operation,
            node_type: self.node_type(),
        }
    }
}
