//! Built-in advisers

use crate::advisement::{Adviser, AdvisingEvent};
use crate::core::AdviserResponse;
use crate::execution::PolicyError;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Default, Deserialize)]
struct RouteParameters {
    #[serde(default)]
    next_node_id: Option<String>,
}

fn parse<T>(policy: &str, parameters: &Value) -> Result<T, PolicyError>
where
    T: for<'de> Deserialize<'de> + Default,
{
    if parameters.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(parameters.clone()).map_err(|e| PolicyError::new(policy, e))
}

/// Routes positive conclusions to `next_node_id`, or ends the chain
pub struct NextStepAdviser;

impl Adviser for NextStepAdviser {
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> bool {
        event.to_status.is_positive()
    }

    fn on_advise_event(&self, event: &AdvisingEvent<'_>) -> Result<AdviserResponse, PolicyError> {
        let parameters: RouteParameters = parse("NEXT_STEP", event.parameters)?;
        Ok(AdviserResponse::NextStep {
            next_node_id: parameters.next_node_id,
        })
    }
}

/// Routes failures to `next_node_id`, or ends the chain
pub struct OnFailAdviser;

impl Adviser for OnFailAdviser {
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> bool {
        event.to_status.is_broke()
    }

    fn on_advise_event(&self, event: &AdvisingEvent<'_>) -> Result<AdviserResponse, PolicyError> {
        let parameters: RouteParameters = parse("ON_FAIL", event.parameters)?;
        Ok(match parameters.next_node_id {
            Some(next_node_id) => AdviserResponse::NextStep {
                next_node_id: Some(next_node_id),
            },
            None => AdviserResponse::EndPlan,
        })
    }
}

/// What the retry adviser does once attempts are used up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AfterRetries {
    #[default]
    EndPlan,
    MarkSuccess,
    IgnoreFailure,
    ManualIntervention,
}

#[derive(Debug, Deserialize)]
struct RetryParameters {
    /// Total attempts, the first one included
    #[serde(default = "default_max_attempts")]
    max_attempts: u32,

    /// Wait before each retry; the last value repeats
    #[serde(default)]
    wait_intervals_ms: Vec<u64>,

    #[serde(default)]
    after_retries: AfterRetries,

    #[serde(default)]
    next_node_id: Option<String>,
}

fn default_max_attempts() -> u32 {
    2
}

impl Default for RetryParameters {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            wait_intervals_ms: Vec::new(),
            after_retries: AfterRetries::default(),
            next_node_id: None,
        }
    }
}

/// Retries failures up to `max_attempts` total attempts
pub struct RetryAdviser;

impl Adviser for RetryAdviser {
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> bool {
        event.to_status.is_broke()
    }

    fn on_advise_event(&self, event: &AdvisingEvent<'_>) -> Result<AdviserResponse, PolicyError> {
        let parameters: RetryParameters = parse("RETRY", event.parameters)?;
        if parameters.max_attempts == 0 {
            return Err(PolicyError::new("RETRY", "max_attempts must be at least 1"));
        }

        if event.attempt() < parameters.max_attempts {
            let retry_index = event.node_execution.retry_index() as usize;
            let wait_ms = parameters
                .wait_intervals_ms
                .get(retry_index)
                .or(parameters.wait_intervals_ms.last())
                .copied()
                .unwrap_or_default();
            return Ok(AdviserResponse::Retry { wait_ms });
        }

        Ok(match parameters.after_retries {
            AfterRetries::EndPlan => AdviserResponse::EndPlan,
            AfterRetries::MarkSuccess => AdviserResponse::MarkSuccess {
                next_node_id: parameters.next_node_id,
            },
            AfterRetries::IgnoreFailure => AdviserResponse::IgnoreFailure {
                next_node_id: parameters.next_node_id,
            },
            AfterRetries::ManualIntervention => AdviserResponse::InterventionWait { timeout_ms: None },
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct InterventionParameters {
    #[serde(default)]
    timeout_ms: Option<u64>,
}

/// Parks failed nodes until an operator decides
pub struct ManualInterventionAdviser;

impl Adviser for ManualInterventionAdviser {
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> bool {
        event.to_status.is_broke()
    }

    fn on_advise_event(&self, event: &AdvisingEvent<'_>) -> Result<AdviserResponse, PolicyError> {
        let parameters: InterventionParameters = parse("MANUAL_INTERVENTION", event.parameters)?;
        Ok(AdviserResponse::InterventionWait {
            timeout_ms: parameters.timeout_ms,
        })
    }
}

/// Concludes failures as ignored and moves on
pub struct IgnoreFailureAdviser;

impl Adviser for IgnoreFailureAdviser {
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> bool {
        event.to_status.is_broke()
    }

    fn on_advise_event(&self, event: &AdvisingEvent<'_>) -> Result<AdviserResponse, PolicyError> {
        let parameters: RouteParameters = parse("IGNORE_FAILURE", event.parameters)?;
        Ok(AdviserResponse::IgnoreFailure {
            next_node_id: parameters.next_node_id,
        })
    }
}

/// Concludes failures as succeeded and moves on
pub struct MarkSuccessAdviser;

impl Adviser for MarkSuccessAdviser {
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> bool {
        event.to_status.is_broke()
    }

    fn on_advise_event(&self, event: &AdvisingEvent<'_>) -> Result<AdviserResponse, PolicyError> {
        let parameters: RouteParameters = parse("MARK_SUCCESS", event.parameters)?;
        Ok(AdviserResponse::MarkSuccess {
            next_node_id: parameters.next_node_id,
        })
    }
}
