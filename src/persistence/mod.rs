//! Persistence boundary for plans, node executions and plan executions

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteExecutionStore;

use crate::core::{Ambiance, NodeExecution, Plan, PlanExecution, PlanNode, Status};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Error types for store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Version conflict on {id}: expected {expected}, found {found}")]
    VersionConflict { id: Uuid, expected: u64, found: u64 },

    #[error("Record not found: {0}")]
    NotFound(Uuid),

    #[error("Record already exists: {0}")]
    AlreadyExists(Uuid),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Bounded exponential backoff for optimistic-lock conflicts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    10
}

fn default_max_delay_ms() -> u64 {
    500
}

impl Default for ConflictRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl ConflictRetryPolicy {
    /// Delay before the given retry (0-indexed)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

/// In-place edit applied to a node execution by a guarded transition
pub type NodeOps<'a> = dyn Fn(&mut NodeExecution) + Send + Sync + 'a;

/// Store of node execution records
#[async_trait::async_trait]
pub trait NodeExecutionStore: Send + Sync {
    /// Insert a new record; fails if the id is taken
    async fn save(&self, node: &NodeExecution) -> Result<NodeExecution, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<NodeExecution>, StoreError>;

    /// Write `node` if its version matches the stored one, bumping the version
    async fn update(&self, node: &NodeExecution) -> Result<NodeExecution, StoreError>;

    async fn list_children(&self, parent_id: Uuid) -> Result<Vec<NodeExecution>, StoreError>;

    async fn list_by_plan_execution(
        &self,
        plan_execution_id: Uuid,
    ) -> Result<Vec<NodeExecution>, StoreError>;

    /// Record addressed by the ambiance's current level
    async fn find_by_path(&self, ambiance: &Ambiance) -> Result<Option<NodeExecution>, StoreError> {
        match ambiance.current_runtime_id() {
            Some(id) => self.get(id).await,
            None => Ok(None),
        }
    }

    /// Move a record to `to` only if its status is in `from`
    ///
    /// Returns `None` when the status guard does not hold. A concurrent
    /// writer surfaces as `VersionConflict`.
    async fn update_status_if_in(
        &self,
        id: Uuid,
        from: &[Status],
        to: Status,
        ops: &NodeOps<'_>,
    ) -> Result<Option<NodeExecution>, StoreError> {
        let Some(mut node) = self.get(id).await? else {
            return Err(StoreError::NotFound(id));
        };
        if !from.contains(&node.status) {
            return Ok(None);
        }
        node.status = to;
        ops(&mut node);
        self.update(&node).await.map(Some)
    }
}

/// Store of plan execution records
#[async_trait::async_trait]
pub trait PlanExecutionStore: Send + Sync {
    async fn save_plan_execution(&self, execution: &PlanExecution) -> Result<PlanExecution, StoreError>;

    async fn get_plan_execution(&self, id: Uuid) -> Result<Option<PlanExecution>, StoreError>;

    /// Versioned write, like `NodeExecutionStore::update`
    async fn update_plan_execution(&self, execution: &PlanExecution) -> Result<PlanExecution, StoreError>;

    /// Most recent first
    async fn list_plan_executions(&self, plan_id: Option<&str>) -> Result<Vec<PlanExecution>, StoreError>;
}

/// Read access to compiled plans
#[async_trait::async_trait]
pub trait PlanStore: Send + Sync {
    async fn save_plan(&self, plan: &Plan) -> Result<(), StoreError>;

    async fn fetch_plan(&self, plan_id: &str) -> Result<Option<Plan>, StoreError>;

    async fn fetch_node(&self, plan_id: &str, node_id: &str) -> Result<Option<PlanNode>, StoreError> {
        Ok(self
            .fetch_plan(plan_id)
            .await?
            .and_then(|plan| plan.nodes.get(node_id).cloned()))
    }
}

/// Idempotency keys of inbound events, claimed in two phases
///
/// A claim is pending while its event is processed and done once the
/// handler returned. A pending claim older than the lease belongs to a
/// handler that never finished and can be claimed again.
#[async_trait::async_trait]
pub trait ProcessedEventStore: Send + Sync {
    /// Claim a key; false if it is done or pending within `lease`
    async fn try_claim(&self, key: &str, lease: Duration) -> Result<bool, StoreError>;

    /// Mark a claimed key as processed for good
    async fn complete(&self, key: &str) -> Result<(), StoreError>;

    /// Give a key back so a redelivery can be processed
    async fn release(&self, key: &str) -> Result<(), StoreError>;
}

/// Claim state of one idempotency key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventClaim {
    Pending(DateTime<Utc>),
    Done,
}

/// Only children that are the latest attempt of their node
pub fn without_old_retries(nodes: Vec<NodeExecution>) -> Vec<NodeExecution> {
    nodes.into_iter().filter(|node| !node.old_retry).collect()
}

/// In-memory persistence (for testing or ephemeral use)
pub struct InMemoryStore {
    node_executions: RwLock<HashMap<Uuid, NodeExecution>>,
    by_parent: RwLock<HashMap<Uuid, Vec<Uuid>>>,
    plan_executions: RwLock<HashMap<Uuid, PlanExecution>>,
    plans: RwLock<HashMap<String, Plan>>,
    processed_events: RwLock<HashMap<String, EventClaim>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            node_executions: RwLock::new(HashMap::new()),
            by_parent: RwLock::new(HashMap::new()),
            plan_executions: RwLock::new(HashMap::new()),
            plans: RwLock::new(HashMap::new()),
            processed_events: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl NodeExecutionStore for InMemoryStore {
    async fn save(&self, node: &NodeExecution) -> Result<NodeExecution, StoreError> {
        let mut nodes = self.node_executions.write().await;
        if nodes.contains_key(&node.id) {
            return Err(StoreError::AlreadyExists(node.id));
        }
        nodes.insert(node.id, node.clone());

        if let Some(parent_id) = node.parent_id {
            let mut by_parent = self.by_parent.write().await;
            by_parent.entry(parent_id).or_default().push(node.id);
        }

        Ok(node.clone())
    }

    async fn get(&self, id: Uuid) -> Result<Option<NodeExecution>, StoreError> {
        let nodes = self.node_executions.read().await;
        Ok(nodes.get(&id).cloned())
    }

    async fn update(&self, node: &NodeExecution) -> Result<NodeExecution, StoreError> {
        let mut nodes = self.node_executions.write().await;
        let stored = nodes.get_mut(&node.id).ok_or(StoreError::NotFound(node.id))?;
        if stored.version != node.version {
            return Err(StoreError::VersionConflict {
                id: node.id,
                expected: node.version,
                found: stored.version,
            });
        }

        let mut next = node.clone();
        next.version = node.version + 1;
        next.last_updated_at = Utc::now();
        *stored = next.clone();
        Ok(next)
    }

    async fn list_children(&self, parent_id: Uuid) -> Result<Vec<NodeExecution>, StoreError> {
        // Same lock order as `save`
        let nodes = self.node_executions.read().await;
        let by_parent = self.by_parent.read().await;
        Ok(by_parent
            .get(&parent_id)
            .map(|ids| ids.iter().filter_map(|id| nodes.get(id).cloned()).collect())
            .unwrap_or_default())
    }

    async fn list_by_plan_execution(
        &self,
        plan_execution_id: Uuid,
    ) -> Result<Vec<NodeExecution>, StoreError> {
        let nodes = self.node_executions.read().await;
        let mut result: Vec<NodeExecution> = nodes
            .values()
            .filter(|node| node.ambiance.plan_execution_id == plan_execution_id)
            .cloned()
            .collect();
        result.sort_by_key(|node| node.created_at);
        Ok(result)
    }

    async fn update_status_if_in(
        &self,
        id: Uuid,
        from: &[Status],
        to: Status,
        ops: &NodeOps<'_>,
    ) -> Result<Option<NodeExecution>, StoreError> {
        let mut nodes = self.node_executions.write().await;
        let stored = nodes.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if !from.contains(&stored.status) {
            return Ok(None);
        }

        stored.status = to;
        ops(stored);
        stored.version += 1;
        stored.last_updated_at = Utc::now();
        Ok(Some(stored.clone()))
    }
}

#[async_trait::async_trait]
impl PlanExecutionStore for InMemoryStore {
    async fn save_plan_execution(&self, execution: &PlanExecution) -> Result<PlanExecution, StoreError> {
        let mut execs = self.plan_executions.write().await;
        if execs.contains_key(&execution.id) {
            return Err(StoreError::AlreadyExists(execution.id));
        }
        execs.insert(execution.id, execution.clone());
        Ok(execution.clone())
    }

    async fn get_plan_execution(&self, id: Uuid) -> Result<Option<PlanExecution>, StoreError> {
        let execs = self.plan_executions.read().await;
        Ok(execs.get(&id).cloned())
    }

    async fn update_plan_execution(&self, execution: &PlanExecution) -> Result<PlanExecution, StoreError> {
        let mut execs = self.plan_executions.write().await;
        let stored = execs
            .get_mut(&execution.id)
            .ok_or(StoreError::NotFound(execution.id))?;
        if stored.version != execution.version {
            return Err(StoreError::VersionConflict {
                id: execution.id,
                expected: execution.version,
                found: stored.version,
            });
        }

        let mut next = execution.clone();
        next.version = execution.version + 1;
        *stored = next.clone();
        Ok(next)
    }

    async fn list_plan_executions(&self, plan_id: Option<&str>) -> Result<Vec<PlanExecution>, StoreError> {
        let execs = self.plan_executions.read().await;
        let mut result: Vec<PlanExecution> = execs
            .values()
            .filter(|exec| plan_id.map_or(true, |id| exec.plan_id == id))
            .cloned()
            .collect();
        result.sort_by(|a, b| b.start_ts.cmp(&a.start_ts));
        Ok(result)
    }
}

#[async_trait::async_trait]
impl PlanStore for InMemoryStore {
    async fn save_plan(&self, plan: &Plan) -> Result<(), StoreError> {
        let mut plans = self.plans.write().await;
        plans.insert(plan.id.clone(), plan.clone());
        Ok(())
    }

    async fn fetch_plan(&self, plan_id: &str) -> Result<Option<Plan>, StoreError> {
        let plans = self.plans.read().await;
        Ok(plans.get(plan_id).cloned())
    }
}

#[async_trait::async_trait]
impl ProcessedEventStore for InMemoryStore {
    async fn try_claim(&self, key: &str, lease: Duration) -> Result<bool, StoreError> {
        let mut processed = self.processed_events.write().await;
        let now = Utc::now();
        let claimable = match processed.get(key) {
            None => true,
            Some(EventClaim::Done) => false,
            Some(EventClaim::Pending(claimed_at)) => {
                now.signed_duration_since(*claimed_at).to_std().unwrap_or_default() >= lease
            }
        };
        if claimable {
            processed.insert(key.to_string(), EventClaim::Pending(now));
        }
        Ok(claimable)
    }

    async fn complete(&self, key: &str) -> Result<(), StoreError> {
        let mut processed = self.processed_events.write().await;
        processed.insert(key.to_string(), EventClaim::Done);
        Ok(())
    }

    async fn release(&self, key: &str) -> Result<(), StoreError> {
        let mut processed = self.processed_events.write().await;
        processed.remove(key);
        Ok(())
    }
}
