//! Boundary to the executor that runs delegated tasks

use crate::core::{Ambiance, ResponseData, TaskRequest};
use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

/// Error types for task execution
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Task executor unavailable: {0}")]
    Unavailable(String),

    #[error("Task executor rejected {task_type}: {reason}")]
    Rejected { task_type: String, reason: String },

    #[error("Task {0} is unknown to the executor")]
    UnknownTask(String),
}

/// Remote or local runner of delegated tasks
///
/// Completion of a queued task is reported back to the engine as a
/// `RESUME_NODE` event carrying the callback id it was queued with.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Hand a task over; returns the executor's task id, or `None` if the
    /// executor does not queue tasks
    async fn queue_task(
        &self,
        ambiance: &Ambiance,
        task: &TaskRequest,
        callback_id: &str,
    ) -> Result<Option<String>, TaskError>;

    async fn expire_task(&self, ambiance: &Ambiance, task_id: &str) -> Result<(), TaskError>;

    /// Returns whether the task was still live
    async fn abort_task(&self, ambiance: &Ambiance, task_id: &str) -> Result<bool, TaskError>;

    /// Run a task in place; `None` if the executor cannot
    async fn execute_task(
        &self,
        ambiance: &Ambiance,
        task: &TaskRequest,
    ) -> Result<Option<ResponseData>, TaskError>;
}

/// Executor with no backing runner
#[derive(Debug, Clone, Default)]
pub struct NoopTaskExecutor;

#[async_trait]
impl TaskExecutor for NoopTaskExecutor {
    async fn queue_task(
        &self,
        _ambiance: &Ambiance,
        _task: &TaskRequest,
        _callback_id: &str,
    ) -> Result<Option<String>, TaskError> {
        Ok(None)
    }

    async fn expire_task(&self, _ambiance: &Ambiance, _task_id: &str) -> Result<(), TaskError> {
        Ok(())
    }

    async fn abort_task(&self, _ambiance: &Ambiance, _task_id: &str) -> Result<bool, TaskError> {
        Ok(true)
    }

    async fn execute_task(
        &self,
        _ambiance: &Ambiance,
        _task: &TaskRequest,
    ) -> Result<Option<ResponseData>, TaskError> {
        Ok(None)
    }
}

/// Executor that runs every task in place and echoes its data as output
///
/// Task type `FAIL` reports an error response instead.
#[derive(Debug, Clone, Default)]
pub struct InlineTaskExecutor;

#[async_trait]
impl TaskExecutor for InlineTaskExecutor {
    async fn queue_task(
        &self,
        _ambiance: &Ambiance,
        _task: &TaskRequest,
        _callback_id: &str,
    ) -> Result<Option<String>, TaskError> {
        Ok(None)
    }

    async fn expire_task(&self, _ambiance: &Ambiance, task_id: &str) -> Result<(), TaskError> {
        Err(TaskError::UnknownTask(task_id.to_string()))
    }

    async fn abort_task(&self, _ambiance: &Ambiance, _task_id: &str) -> Result<bool, TaskError> {
        Ok(false)
    }

    async fn execute_task(
        &self,
        ambiance: &Ambiance,
        task: &TaskRequest,
    ) -> Result<Option<ResponseData>, TaskError> {
        debug!(
            "Running {} task inline for {:?}",
            task.task_type,
            ambiance.current_setup_id()
        );
        let response = if task.task_type == "FAIL" {
            ResponseData::Error {
                message: task
                    .task_data
                    .get("message")
                    .and_then(|value| value.as_str())
                    .unwrap_or("task failed")
                    .to_string(),
            }
        } else {
            ResponseData::Output {
                data: task.task_data.clone(),
            }
        };
        Ok(Some(response))
    }
}
