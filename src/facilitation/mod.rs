//! Facilitation - deciding how a node is going to execute

pub mod builtin;

use crate::core::{Ambiance, ExecutionMode, FacilitatorResponse, PlanNode};
use crate::execution::PolicyError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Policy choosing the execution mode of a node
///
/// Facilitators are pure: they only look at their inputs. Returning `None`
/// passes the decision to the next obtainment of the node.
pub trait Facilitator: Send + Sync {
    fn facilitate(
        &self,
        ambiance: &Ambiance,
        node: &PlanNode,
        parameters: &Value,
    ) -> Result<Option<FacilitatorResponse>, PolicyError>;
}

/// Registry of facilitators by obtainment type
#[derive(Clone, Default)]
pub struct FacilitatorRegistry {
    facilitators: HashMap<String, Arc<dyn Facilitator>>,
}

impl FacilitatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with one facilitator per execution mode
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for mode in [
            ExecutionMode::Sync,
            ExecutionMode::Async,
            ExecutionMode::Task,
            ExecutionMode::TaskChain,
            ExecutionMode::Child,
            ExecutionMode::Children,
        ] {
            registry.register(mode.to_string(), builtin::ModeFacilitator::new(mode));
        }
        registry
    }

    pub fn register<F: Facilitator + 'static>(&mut self, facilitator_type: impl Into<String>, facilitator: F) {
        self.facilitators
            .insert(facilitator_type.into(), Arc::new(facilitator));
    }

    pub fn resolve(&self, facilitator_type: &str) -> Option<Arc<dyn Facilitator>> {
        self.facilitators.get(facilitator_type).cloned()
    }

    pub fn contains(&self, facilitator_type: &str) -> bool {
        self.facilitators.contains_key(facilitator_type)
    }
}
