//! Plan domain model - the immutable, compiled graph of nodes for one run

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Declares a facilitator a node may be facilitated by
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacilitatorObtainment {
    /// Registry tag of the facilitator (e.g. SYNC, TASK, CHILDREN)
    #[serde(rename = "type")]
    pub facilitator_type: String,

    #[serde(default)]
    pub parameters: Value,
}

impl FacilitatorObtainment {
    pub fn new(facilitator_type: impl Into<String>) -> Self {
        Self {
            facilitator_type: facilitator_type.into(),
            parameters: Value::Null,
        }
    }
}

/// Declares an adviser a node may be advised by
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdviserObtainment {
    /// Registry tag of the adviser (e.g. NEXT_STEP, RETRY)
    #[serde(rename = "type")]
    pub adviser_type: String,

    #[serde(default)]
    pub parameters: Value,
}

impl AdviserObtainment {
    pub fn new(adviser_type: impl Into<String>, parameters: Value) -> Self {
        Self {
            adviser_type: adviser_type.into(),
            parameters,
        }
    }

    /// The `next_node_id` parameter, if this adviser routes somewhere
    pub fn next_node_id(&self) -> Option<&str> {
        self.parameters.get("next_node_id").and_then(Value::as_str)
    }
}

/// A node of the plan graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    /// Setup id, unique within the plan
    pub id: String,

    pub identifier: String,

    pub name: String,

    /// Tag resolving the step implementation
    pub step_type: String,

    pub group: Option<String>,

    /// Tried in declared order, first match wins
    pub facilitator_obtainments: Vec<FacilitatorObtainment>,

    /// Tried in declared order, first that can advise wins
    pub adviser_obtainments: Vec<AdviserObtainment>,

    pub parameters: Value,

    /// Child node ids in declared order (CHILD / CHILDREN modes)
    pub children: Vec<String>,

    /// When it evaluates true the node concludes as skipped
    pub skip_condition: Option<String>,

    pub timeout_secs: Option<u64>,
}

impl PlanNode {
    /// Minimal node with a single facilitator and no advisers
    pub fn new(id: impl Into<String>, step_type: impl Into<String>, facilitator: &str) -> Self {
        let id = id.into();
        Self {
            identifier: id.clone(),
            name: id.clone(),
            id,
            step_type: step_type.into(),
            group: None,
            facilitator_obtainments: vec![FacilitatorObtainment::new(facilitator)],
            adviser_obtainments: Vec::new(),
            parameters: Value::Null,
            children: Vec::new(),
            skip_condition: None,
            timeout_secs: None,
        }
    }

    pub fn with_adviser(mut self, adviser: AdviserObtainment) -> Self {
        self.adviser_obtainments.push(adviser);
        self
    }

    pub fn with_children(mut self, children: Vec<String>) -> Self {
        self.children = children;
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_skip_condition(mut self, condition: impl Into<String>) -> Self {
        self.skip_condition = Some(condition.into());
        self
    }
}

/// A compiled plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,

    pub name: String,

    /// Node the plan execution starts with
    pub start_node_id: String,

    pub nodes: HashMap<String, PlanNode>,
}

impl Plan {
    pub fn new(id: impl Into<String>, start_node_id: impl Into<String>, nodes: Vec<PlanNode>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            start_node_id: start_node_id.into(),
            nodes: nodes.into_iter().map(|node| (node.id.clone(), node)).collect(),
        }
    }

    pub fn node(&self, id: &str) -> Option<&PlanNode> {
        self.nodes.get(id)
    }

    pub fn start_node(&self) -> Option<&PlanNode> {
        self.node(&self.start_node_id)
    }
}
