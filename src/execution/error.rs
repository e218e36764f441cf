//! Engine error taxonomy

use crate::core::{NodeType, Status};
use crate::persistence::StoreError;
use crate::step::StepError;
use crate::task::TaskError;
use thiserror::Error;
use uuid::Uuid;

/// How the engine reacts to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected before any state is touched
    Validation,
    /// A guarded transition found the record in an unexpected status
    TransitionGuard,
    /// The delegated executor itself failed
    Executor,
    /// Anything else; ends up in `handle_error`
    Unhandled,
}

/// Invalid parameters or input for a facilitator or adviser
#[derive(Debug, Error)]
#[error("{policy} cannot use its parameters: {reason}")]
pub struct PolicyError {
    pub policy: String,
    pub reason: String,
}

impl PolicyError {
    pub fn new(policy: impl Into<String>, reason: impl ToString) -> Self {
        Self {
            policy: policy.into(),
            reason: reason.to_string(),
        }
    }
}

/// Error types for engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid ambiance: {0}")]
    InvalidAmbiance(String),

    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    #[error("Malformed {event_type} event: {reason}")]
    MalformedEvent { event_type: String, reason: String },

    #[error("No strategy registered for node type {0:?}")]
    UnknownNodeType(NodeType),

    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("Node '{node_id}' not found in plan '{plan_id}'")]
    PlanNodeNotFound { plan_id: String, node_id: String },

    #[error("Node execution not found: {0}")]
    NodeExecutionNotFound(Uuid),

    #[error("Plan execution not found: {0}")]
    PlanExecutionNotFound(Uuid),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Node execution {id} is {status}, expected one of {allowed:?}")]
    InvalidTransition {
        id: Uuid,
        status: Status,
        allowed: Vec<Status>,
    },

    #[error("No facilitator matched node '{0}'")]
    NoFacilitator(String),

    #[error("Unknown facilitator type: {0}")]
    UnknownFacilitator(String),

    #[error("Unknown adviser type: {0}")]
    UnknownAdviser(String),

    #[error("Unknown step type: {0}")]
    UnknownStep(String),

    #[error("{operation} is not supported for node type {node_type:?}")]
    Unsupported {
        operation: &'static str,
        node_type: NodeType,
    },

    #[error("Gave up on {id} after {attempts} conflicting writes")]
    ConflictRetriesExhausted { id: Uuid, attempts: u32 },

    #[error("Expression error: {0}")]
    Expression(String),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Step(#[from] StepError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidAmbiance(_)
            | EngineError::UnknownEventType(_)
            | EngineError::MalformedEvent { .. }
            | EngineError::UnknownNodeType(_)
            | EngineError::PlanNotFound(_)
            | EngineError::PlanNodeNotFound { .. }
            | EngineError::NodeExecutionNotFound(_)
            | EngineError::PlanExecutionNotFound(_)
            | EngineError::InvalidPlan(_) => ErrorKind::Validation,
            EngineError::InvalidTransition { .. } => ErrorKind::TransitionGuard,
            EngineError::Task(_) => ErrorKind::Executor,
            _ => ErrorKind::Unhandled,
        }
    }

    pub fn is_validation(&self) -> bool {
        self.kind() == ErrorKind::Validation
    }
}
