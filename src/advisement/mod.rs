//! Advisement - deciding what happens after a node concludes

pub mod builtin;

use crate::core::{AdviserResponse, Ambiance, NodeExecution, Status};
use crate::execution::PolicyError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Input of an adviser: the concluded node and the adviser's own parameters
#[derive(Debug, Clone, Copy)]
pub struct AdvisingEvent<'a> {
    pub ambiance: &'a Ambiance,
    pub node_execution: &'a NodeExecution,
    pub to_status: Status,
    pub parameters: &'a Value,
}

impl AdvisingEvent<'_> {
    /// Attempts made so far, the current one included
    pub fn attempt(&self) -> u32 {
        self.node_execution.retry_index() + 1
    }
}

/// Policy choosing the next action for a concluded node
pub trait Adviser: Send + Sync {
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> bool;

    fn on_advise_event(&self, event: &AdvisingEvent<'_>) -> Result<AdviserResponse, PolicyError>;
}

/// Registry of advisers by obtainment type
#[derive(Clone, Default)]
pub struct AdviserRegistry {
    advisers: HashMap<String, Arc<dyn Adviser>>,
}

impl AdviserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("NEXT_STEP", builtin::NextStepAdviser);
        registry.register("ON_FAIL", builtin::OnFailAdviser);
        registry.register("RETRY", builtin::RetryAdviser);
        registry.register("MANUAL_INTERVENTION", builtin::ManualInterventionAdviser);
        registry.register("IGNORE_FAILURE", builtin::IgnoreFailureAdviser);
        registry.register("MARK_SUCCESS", builtin::MarkSuccessAdviser);
        registry
    }

    pub fn register<A: Adviser + 'static>(&mut self, adviser_type: impl Into<String>, adviser: A) {
        self.advisers.insert(adviser_type.into(), Arc::new(adviser));
    }

    pub fn resolve(&self, adviser_type: &str) -> Option<Arc<dyn Adviser>> {
        self.advisers.get(adviser_type).cloned()
    }

    pub fn contains(&self, adviser_type: &str) -> bool {
        self.advisers.contains_key(adviser_type)
    }
}
