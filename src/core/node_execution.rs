//! Runtime records: one node execution per attempt, one plan execution per run

use crate::core::{
    ambiance::Ambiance,
    plan::PlanNode,
    response::{AdviserResponse, ExecutableResponse, ExecutionMode, FailureInfo, ResponseData},
    state::{ErrorMarker, Status},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// One runtime attempt of one plan node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    /// Equal to the runtime id of the ambiance's current level
    pub id: Uuid,

    pub ambiance: Ambiance,

    /// Snapshot of the plan node this attempt runs
    pub node: PlanNode,

    pub status: Status,

    pub mode: Option<ExecutionMode>,

    pub parent_id: Option<Uuid>,

    pub previous_id: Option<Uuid>,

    pub next_id: Option<Uuid>,

    /// Setup id of the declared child whose chain this node belongs to
    pub branch_id: Option<String>,

    /// First attempt of this node, for retries
    pub original_node_execution_id: Option<Uuid>,

    /// Earlier attempts, oldest first
    pub retry_ids: Vec<Uuid>,

    /// Set once a newer attempt replaced this one
    pub old_retry: bool,

    pub executable_responses: Vec<ExecutableResponse>,

    /// Callback keys that must all arrive before the node advances
    pub expected_callbacks: Vec<String>,

    pub resume_responses: BTreeMap<String, ResponseData>,

    /// Set by the write that completed `expected_callbacks`
    pub resumed: bool,

    /// Recorded once, guarding against duplicate advisement
    pub adviser_response: Option<AdviserResponse>,

    /// Failure status an intervention wait replaced
    #[serde(default)]
    pub pre_intervention_status: Option<Status>,

    pub failure_info: Option<FailureInfo>,

    pub error_marker: Option<ErrorMarker>,

    /// Human-readable reason for the current terminal status
    pub cause: Option<String>,

    pub initial_wait_ms: Option<u64>,

    pub created_at: DateTime<Utc>,

    pub started_at: Option<DateTime<Utc>>,

    pub end_ts: Option<DateTime<Utc>>,

    pub last_updated_at: DateTime<Utc>,

    /// Optimistic-lock counter, bumped by the store on every update
    pub version: u64,
}

impl NodeExecution {
    /// New queued record for the node addressed by `ambiance`
    pub fn new(ambiance: Ambiance, node: PlanNode) -> Option<Self> {
        let id = ambiance.current_runtime_id()?;
        let now = Utc::now();
        Some(Self {
            id,
            ambiance,
            node,
            status: Status::Queued,
            mode: None,
            parent_id: None,
            previous_id: None,
            next_id: None,
            branch_id: None,
            original_node_execution_id: None,
            retry_ids: Vec::new(),
            old_retry: false,
            executable_responses: Vec::new(),
            expected_callbacks: Vec::new(),
            resume_responses: BTreeMap::new(),
            resumed: false,
            adviser_response: None,
            pre_intervention_status: None,
            failure_info: None,
            error_marker: None,
            cause: None,
            initial_wait_ms: None,
            created_at: now,
            started_at: None,
            end_ts: None,
            last_updated_at: now,
            version: 0,
        })
    }

    pub fn retry_index(&self) -> u32 {
        self.ambiance
            .current_level()
            .map(|level| level.retry_index)
            .unwrap_or_default()
    }

    /// Number of earlier attempts of this node
    pub fn retry_count(&self) -> usize {
        self.retry_ids.len()
    }

    /// The retry chain root, which is this record for a first attempt
    pub fn original_id(&self) -> Uuid {
        self.original_node_execution_id.unwrap_or(self.id)
    }

    /// Whether every expected callback has a response
    pub fn callbacks_complete(&self) -> bool {
        self.expected_callbacks
            .iter()
            .all(|key| self.resume_responses.contains_key(key))
    }

    /// Task ids of every delegated task of this node
    pub fn task_ids(&self) -> Vec<String> {
        self.executable_responses
            .iter()
            .flat_map(|response| response.task_ids().into_iter().map(str::to_string))
            .collect()
    }

    /// Apply a terminal status with its cause
    pub fn conclude(&mut self, status: Status, cause: impl Into<String>, failure: Option<FailureInfo>) {
        self.status = status;
        self.cause = Some(cause.into());
        if failure.is_some() {
            self.failure_info = failure;
        }
        if status.is_final() {
            self.end_ts = Some(Utc::now());
        }
    }
}

/// One top-level run of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanExecution {
    pub id: Uuid,

    pub plan_id: String,

    pub status: Status,

    /// Abort or expiry requested while the run was open
    pub interrupt: Option<Status>,

    pub cause: Option<String>,

    /// Root ambiance of the run (no levels)
    pub ambiance: Ambiance,

    pub start_ts: DateTime<Utc>,

    pub end_ts: Option<DateTime<Utc>>,

    pub version: u64,
}

impl PlanExecution {
    pub fn new(ambiance: Ambiance) -> Self {
        Self {
            id: ambiance.plan_execution_id,
            plan_id: ambiance.plan_id.clone(),
            status: Status::Running,
            interrupt: None,
            cause: None,
            ambiance,
            start_ts: Utc::now(),
            end_ts: None,
            version: 0,
        }
    }
}
