//! Plan and engine configuration from YAML

use crate::core::plan::{AdviserObtainment, FacilitatorObtainment, Plan, PlanNode};
use crate::execution::scheduler::SchedulingStrategy;
use crate::persistence::ConflictRetryPolicy;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Engine tuning, optional in a plan file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Whether child and sibling nodes run inline or on spawned tasks
    #[serde(default)]
    pub scheduling: SchedulingStrategy,

    /// Backoff for optimistic-lock conflicts on node executions
    #[serde(default)]
    pub conflict_retry: ConflictRetryPolicy,

    /// How long an unfinished event claim blocks redeliveries
    #[serde(default = "default_event_claim_lease_ms")]
    pub event_claim_lease_ms: u64,
}

fn default_event_claim_lease_ms() -> u64 {
    30_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scheduling: SchedulingStrategy::default(),
            conflict_retry: ConflictRetryPolicy::default(),
            event_claim_lease_ms: default_event_claim_lease_ms(),
        }
    }
}

impl EngineConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }
}

/// Top-level plan configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanConfig {
    /// Plan name, also used as plan id when `id` is absent
    pub name: String,

    #[serde(default)]
    pub id: Option<String>,

    /// Node the run starts with
    pub start: String,

    #[serde(default)]
    pub engine: EngineConfig,

    pub nodes: Vec<NodeConfig>,
}

/// Node configuration as defined in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node id
    pub id: String,

    /// Human-readable identifier (defaults to the id)
    #[serde(default)]
    pub identifier: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    pub step_type: String,

    #[serde(default)]
    pub group: Option<String>,

    pub facilitators: Vec<FacilitatorObtainment>,

    #[serde(default)]
    pub advisers: Vec<AdviserObtainment>,

    #[serde(default)]
    pub parameters: Value,

    /// Child node ids, in declared order
    #[serde(default)]
    pub children: Vec<String>,

    #[serde(default)]
    pub skip_condition: Option<String>,

    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl PlanConfig {
    /// Load plan configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse plan configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: PlanConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the plan graph
    pub fn validate(&self) -> Result<()> {
        let mut seen_ids = HashSet::new();
        for node in &self.nodes {
            if !seen_ids.insert(node.id.as_str()) {
                anyhow::bail!("Duplicate node ID: {}", node.id);
            }
        }

        if !seen_ids.contains(self.start.as_str()) {
            anyhow::bail!("Start node '{}' does not exist", self.start);
        }

        for node in &self.nodes {
            if node.facilitators.is_empty() {
                anyhow::bail!("Node '{}' declares no facilitator", node.id);
            }

            for child in &node.children {
                if !seen_ids.contains(child.as_str()) {
                    anyhow::bail!(
                        "Node '{}' references non-existent child '{}'",
                        node.id,
                        child
                    );
                }
            }

            for adviser in &node.advisers {
                if let Some(next) = adviser.next_node_id() {
                    if !seen_ids.contains(next) {
                        anyhow::bail!(
                            "Node '{}' adviser {} references non-existent node '{}'",
                            node.id,
                            adviser.adviser_type,
                            next
                        );
                    }
                }
            }
        }

        self.check_cycles()?;

        Ok(())
    }

    /// Check for cycles in the parent/child graph
    ///
    /// Only `children` edges are checked. Sibling routing through advisers
    /// may loop on purpose.
    fn check_cycles(&self) -> Result<()> {
        let children: HashMap<&str, &[String]> = self
            .nodes
            .iter()
            .map(|node| (node.id.as_str(), node.children.as_slice()))
            .collect();
        let mut visited = HashSet::new();
        let mut recursion_stack = HashSet::new();

        for node in &self.nodes {
            if !visited.contains(node.id.as_str()) {
                Self::dfs_check(&node.id, &children, &mut visited, &mut recursion_stack)?;
            }
        }

        Ok(())
    }

    fn dfs_check<'a>(
        node_id: &'a str,
        children: &HashMap<&'a str, &'a [String]>,
        visited: &mut HashSet<&'a str>,
        recursion_stack: &mut HashSet<&'a str>,
    ) -> Result<()> {
        visited.insert(node_id);
        recursion_stack.insert(node_id);

        for child in children.get(node_id).copied().unwrap_or_default() {
            if recursion_stack.contains(child.as_str()) {
                anyhow::bail!("Cycle detected in child graph involving node '{}'", child);
            }
            if !visited.contains(child.as_str()) {
                Self::dfs_check(child, children, visited, recursion_stack)?;
            }
        }

        recursion_stack.remove(node_id);
        Ok(())
    }

    /// Convert config to a compiled plan
    pub fn to_plan(&self) -> Plan {
        let nodes = self
            .nodes
            .iter()
            .map(|node| PlanNode {
                id: node.id.clone(),
                identifier: node.identifier.clone().unwrap_or_else(|| node.id.clone()),
                name: node.name.clone().unwrap_or_else(|| node.id.clone()),
                step_type: node.step_type.clone(),
                group: node.group.clone(),
                facilitator_obtainments: node.facilitators.clone(),
                adviser_obtainments: node.advisers.clone(),
                parameters: node.parameters.clone(),
                children: node.children.clone(),
                skip_condition: node.skip_condition.clone(),
                timeout_secs: node.timeout_secs,
            })
            .collect();

        let mut plan = Plan::new(
            self.id.clone().unwrap_or_else(|| self.name.clone()),
            self.start.clone(),
            nodes,
        );
        plan.name = self.name.clone();
        plan
    }
}
