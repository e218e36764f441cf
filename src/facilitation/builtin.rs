//! Built-in facilitators

use crate::core::{Ambiance, ExecutionMode, FacilitatorResponse, PlanNode};
use crate::execution::PolicyError;
use crate::facilitation::Facilitator;
use serde_json::Value;

/// Facilitates a fixed execution mode
///
/// An optional `wait_ms` parameter becomes the initial wait. The CHILD and
/// CHILDREN modes only apply to nodes that declare children.
pub struct ModeFacilitator {
    mode: ExecutionMode,
}

impl ModeFacilitator {
    pub fn new(mode: ExecutionMode) -> Self {
        Self { mode }
    }
}

impl Facilitator for ModeFacilitator {
    fn facilitate(
        &self,
        _ambiance: &Ambiance,
        node: &PlanNode,
        parameters: &Value,
    ) -> Result<Option<FacilitatorResponse>, PolicyError> {
        if matches!(self.mode, ExecutionMode::Child | ExecutionMode::Children) && node.children.is_empty() {
            return Ok(None);
        }

        let initial_wait_ms = match parameters.get("wait_ms") {
            None | Some(Value::Null) => 0,
            Some(value) => value
                .as_u64()
                .ok_or_else(|| PolicyError::new(self.mode.to_string(), "wait_ms must be a non-negative integer"))?,
        };

        Ok(Some(FacilitatorResponse {
            mode: self.mode,
            initial_wait_ms,
        }))
    }
}
