//! Task delegation - hands task requests of a node to the task executor

use crate::core::{Ambiance, ExecutableResponse, ResponseData, TaskRequest};
use crate::task::{TaskError, TaskExecutor};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Outcome of delegating the tasks of one node
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delegation {
    /// Executor task id per link, `None` where the task ran in place
    pub task_ids: Vec<Option<String>>,

    pub callback_ids: Vec<String>,

    /// Responses of links that ran in place, keyed by callback id
    pub inline_responses: BTreeMap<String, ResponseData>,
}

impl Delegation {
    /// Record of the delegation kept on the node execution
    pub fn executable_response(&self, chain: bool) -> ExecutableResponse {
        if chain {
            return ExecutableResponse::TaskChain {
                task_ids: self.task_ids.clone(),
                callback_ids: self.callback_ids.clone(),
            };
        }
        ExecutableResponse::Task {
            task_id: self.task_ids.first().cloned().flatten(),
            callback_id: self.callback_ids.first().cloned().unwrap_or_default(),
        }
    }
}

/// Queue every link up front; links the executor will not queue run in place
///
/// A link that is neither queued nor run is an executor failure.
pub async fn delegate_tasks(
    executor: &dyn TaskExecutor,
    ambiance: &Ambiance,
    tasks: &[(TaskRequest, String)],
) -> Result<Delegation, TaskError> {
    let mut delegation = Delegation::default();

    for (task, callback_id) in tasks {
        match executor.queue_task(ambiance, task, callback_id).await? {
            Some(task_id) => {
                info!("Queued {} task {} (callback {})", task.task_type, task_id, callback_id);
                delegation.task_ids.push(Some(task_id));
            }
            None => {
                let response = executor.execute_task(ambiance, task).await?.ok_or_else(|| {
                    TaskError::Unavailable(format!(
                        "{} task was neither queued nor executed",
                        task.task_type
                    ))
                })?;
                debug!("Ran {} task in place (callback {})", task.task_type, callback_id);
                delegation.task_ids.push(None);
                delegation.inline_responses.insert(callback_id.clone(), response);
            }
        }
        delegation.callback_ids.push(callback_id.clone());
    }

    Ok(delegation)
}
