//! Execution context (ambiance) - the immutable path from plan root to a node

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Group name carried by stage-level nodes
pub const STAGE_GROUP: &str = "STAGE";

/// Kind of node a level addresses, used by the dispatcher to pick a strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    /// The plan execution itself (an ambiance without levels)
    Plan,
    /// A node of the compiled plan graph
    PlanNode,
}

/// One step of the path from the plan root to the current node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    /// Grouping of the node (e.g. STAGE, STEP), free-form
    pub group: Option<String>,

    /// Plan node id this level executes
    pub setup_id: String,

    /// Node execution id of this attempt
    pub runtime_id: Uuid,

    /// Human-readable identifier of the plan node
    pub identifier: String,

    pub node_type: NodeType,

    /// Step type tag used to resolve the step implementation
    pub step_type: String,

    /// Zero for the first attempt, incremented for every retry
    pub retry_index: u32,

    pub start_ts: DateTime<Utc>,
}

impl Level {
    /// Create the level of a first attempt
    pub fn new(
        setup_id: impl Into<String>,
        identifier: impl Into<String>,
        step_type: impl Into<String>,
        group: Option<String>,
    ) -> Self {
        Self {
            group,
            setup_id: setup_id.into(),
            runtime_id: Uuid::new_v4(),
            identifier: identifier.into(),
            node_type: NodeType::PlanNode,
            step_type: step_type.into(),
            retry_index: 0,
            start_ts: Utc::now(),
        }
    }

    fn is_well_formed(&self) -> bool {
        !self.setup_id.is_empty() && !self.runtime_id.is_nil() && !self.step_type.is_empty()
    }
}

/// Account/org/project scoping carried by every ambiance of a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupAbstractions {
    pub account_id: Option<String>,
    pub org_identifier: Option<String>,
    pub project_identifier: Option<String>,
}

/// Immutable execution context threaded through every engine call
///
/// Every derivation returns a new value; the level sequence only grows by
/// appending, shrinks by dropping from the end, or has its last level
/// replaced by a retry of the same node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ambiance {
    pub plan_execution_id: Uuid,

    pub plan_id: String,

    /// Runtime id of the enclosing stage node, if any
    pub stage_execution_id: Option<Uuid>,

    pub levels: Vec<Level>,

    #[serde(default)]
    pub setup_abstractions: SetupAbstractions,

    /// Increases by one with every appended level
    pub expression_functor_token: u64,
}

impl Ambiance {
    /// Root ambiance of a fresh plan execution (no levels)
    pub fn for_plan(plan_id: impl Into<String>, setup_abstractions: SetupAbstractions) -> Self {
        Self {
            plan_execution_id: Uuid::new_v4(),
            plan_id: plan_id.into(),
            stage_execution_id: None,
            levels: Vec::new(),
            setup_abstractions,
            expression_functor_token: 0,
        }
    }

    /// Append a level for a child or sibling node
    pub fn clone_for_child(&self, level: Level) -> Self {
        let mut next = self.clone();
        if level.group.as_deref() == Some(STAGE_GROUP) {
            next.stage_execution_id = Some(level.runtime_id);
        }
        next.levels.push(level);
        next.expression_functor_token = self.expression_functor_token + 1;
        next
    }

    /// Drop the current level, addressing the parent
    pub fn clone_for_finish(&self) -> Self {
        self.clone_truncated(self.levels.len().saturating_sub(1))
    }

    /// Keep only the first `depth` levels
    pub fn clone_truncated(&self, depth: usize) -> Self {
        let mut next = self.clone();
        next.levels.truncate(depth);
        let stage_still_open = next.stage_execution_id.is_some_and(|stage_id| {
            next.levels.iter().any(|level| level.runtime_id == stage_id)
        });
        if !stage_still_open {
            next.stage_execution_id = None;
        }
        next
    }

    /// Replace the current level with the next attempt of the same node
    pub fn clone_for_retry(&self) -> Option<Self> {
        let current = self.levels.last()?;
        let mut level = current.clone();
        level.runtime_id = Uuid::new_v4();
        level.retry_index = current.retry_index + 1;
        level.start_ts = Utc::now();

        let mut next = self.clone_for_finish();
        next.expression_functor_token = self.expression_functor_token;
        Some(next.clone_for_child(level))
    }

    pub fn current_level(&self) -> Option<&Level> {
        self.levels.last()
    }

    pub fn current_runtime_id(&self) -> Option<Uuid> {
        self.current_level().map(|level| level.runtime_id)
    }

    pub fn current_setup_id(&self) -> Option<&str> {
        self.current_level().map(|level| level.setup_id.as_str())
    }

    pub fn step_identifier(&self) -> Option<&str> {
        self.current_level().map(|level| level.identifier.as_str())
    }

    pub fn current_step_type(&self) -> Option<&str> {
        self.current_level().map(|level| level.step_type.as_str())
    }

    pub fn current_group(&self) -> Option<&str> {
        self.current_level().and_then(|level| level.group.as_deref())
    }

    /// Node type of the current level; an empty path addresses the plan
    pub fn node_type(&self) -> NodeType {
        self.current_level()
            .map(|level| level.node_type)
            .unwrap_or(NodeType::Plan)
    }

    pub fn account_id(&self) -> Option<&str> {
        self.setup_abstractions.account_id.as_deref()
    }

    pub fn org_identifier(&self) -> Option<&str> {
        self.setup_abstractions.org_identifier.as_deref()
    }

    pub fn project_identifier(&self) -> Option<&str> {
        self.setup_abstractions.project_identifier.as_deref()
    }

    /// Check the ambiance addresses a plan execution and every level is complete
    pub fn validate(&self) -> Result<(), String> {
        if self.plan_execution_id.is_nil() {
            return Err("plan execution id is nil".to_string());
        }
        if self.plan_id.is_empty() {
            return Err("plan id is empty".to_string());
        }
        if let Some(index) = self.levels.iter().position(|level| !level.is_well_formed()) {
            return Err(format!("level {} is incomplete", index));
        }
        Ok(())
    }

    /// Like `validate`, but also require a current node
    pub fn validate_for_node(&self) -> Result<(), String> {
        self.validate()?;
        if self.levels.is_empty() {
            return Err("ambiance has no levels".to_string());
        }
        Ok(())
    }
}
