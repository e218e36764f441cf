//! Plan execution strategy - the root of every run
//!
//! Addressed by an ambiance without levels. Owns the plan execution record
//! and its lifecycle notifications.

use crate::{
    core::{Ambiance, NodeExecution, NodeType, PlanExecution, Status},
    execution::{
        lifecycle::ExecutionEvent,
        strategy::{NodeExecutionStrategy, NodeLinks, RunNodeRequest},
        EngineError, ExecutionEngine,
    },
};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// The root-chain node whose conclusion decides the plan's status
///
/// Root nodes have no parent; the last link of the chain has no next node.
fn concluding_root(nodes: &[NodeExecution]) -> Option<&NodeExecution> {
    nodes
        .iter()
        .filter(|node| {
            node.parent_id.is_none() && !node.old_retry && node.next_id.is_none() && node.status.is_final()
        })
        .max_by_key(|node| node.end_ts)
}

/// Strategy for the plan execution itself
#[derive(Debug, Default)]
pub struct PlanExecutionStrategy;

impl PlanExecutionStrategy {
    pub fn new() -> Self {
        Self
    }

    /// Mark the plan execution terminal; an interrupt wins over `status`
    async fn finish(
        &self,
        engine: &ExecutionEngine,
        ambiance: &Ambiance,
        status: Status,
        cause: String,
    ) -> Result<(), EngineError> {
        let finished = engine
            .update_plan_execution(ambiance.plan_execution_id, |execution| {
                if execution.status.is_final() {
                    return false;
                }
                execution.status = match execution.interrupt {
                    Some(interrupt) => interrupt,
                    None if status.is_positive() => Status::Succeeded,
                    None => status,
                };
                execution.cause = Some(cause.clone());
                execution.end_ts = Some(Utc::now());
                true
            })
            .await?;

        let Some(execution) = finished else {
            debug!("Plan execution {} already finished", ambiance.plan_execution_id);
            return Ok(());
        };

        info!(
            "Plan execution {} of '{}' finished {}: {}",
            execution.id, execution.plan_id, execution.status, cause
        );
        let timestamp = Utc::now();
        match execution.interrupt {
            Some(Status::Aborted) => {
                engine
                    .notify(ExecutionEvent::PipelineAbort {
                        ambiance: execution.ambiance.clone(),
                        timestamp,
                    })
                    .await
            }
            Some(Status::Expired) => {
                engine
                    .notify(ExecutionEvent::PipelineTimeout {
                        ambiance: execution.ambiance.clone(),
                        timestamp,
                    })
                    .await
            }
            _ => {}
        }
        engine
            .notify(ExecutionEvent::PipelineEnd {
                ambiance: execution.ambiance.clone(),
                status: execution.status,
                timestamp,
            })
            .await;
        engine.plan_finished();
        Ok(())
    }
}

#[async_trait]
impl NodeExecutionStrategy for PlanExecutionStrategy {
    fn node_type(&self) -> NodeType {
        NodeType::Plan
    }

    async fn run_node(
        &self,
        engine: &ExecutionEngine,
        ambiance: Ambiance,
        request: RunNodeRequest,
    ) -> Result<Uuid, EngineError> {
        ambiance.validate().map_err(EngineError::InvalidAmbiance)?;
        if !ambiance.levels.is_empty() {
            return Err(EngineError::InvalidAmbiance(
                "a plan execution starts from an ambiance without levels".to_string(),
            ));
        }

        let execution = engine
            .plan_executions()
            .save_plan_execution(&PlanExecution::new(ambiance.clone()))
            .await?;
        info!(
            "Started plan execution {} of '{}' at '{}'",
            execution.id, execution.plan_id, request.node.id
        );
        engine
            .notify(ExecutionEvent::PipelineStart {
                ambiance: ambiance.clone(),
                timestamp: Utc::now(),
            })
            .await;

        if let Err(error) = engine
            .initiate_node(&ambiance, &request.node.id, NodeLinks::default())
            .await
        {
            self.handle_error(engine, ambiance, error).await;
        }
        Ok(execution.id)
    }

    async fn end_node_execution(&self, engine: &ExecutionEngine, ambiance: Ambiance) -> Result<(), EngineError> {
        let nodes = engine
            .node_store()
            .list_by_plan_execution(ambiance.plan_execution_id)
            .await?;
        let (status, cause) = match concluding_root(&nodes) {
            Some(node) => (
                node.status,
                node.cause
                    .clone()
                    .unwrap_or_else(|| format!("'{}' concluded {}", node.node.id, node.status)),
            ),
            None => (Status::Errored, "no root node concluded".to_string()),
        };
        self.finish(engine, &ambiance, status, cause).await
    }

    async fn interrupt(
        &self,
        engine: &ExecutionEngine,
        ambiance: Ambiance,
        status: Status,
        cause: String,
    ) -> Result<(), EngineError> {
        let marked = engine
            .update_plan_execution(ambiance.plan_execution_id, |execution| {
                if execution.status.is_final() || execution.interrupt.is_some() {
                    return false;
                }
                execution.interrupt = Some(status);
                true
            })
            .await?;
        if marked.is_none() {
            debug!(
                "Plan execution {} is already finished or interrupted",
                ambiance.plan_execution_id
            );
            return Ok(());
        }
        info!(
            "Interrupting plan execution {} as {}: {}",
            ambiance.plan_execution_id, status, cause
        );

        let mut open: Vec<NodeExecution> = engine
            .node_store()
            .list_by_plan_execution(ambiance.plan_execution_id)
            .await?
            .into_iter()
            .filter(|node| !node.status.is_final())
            .collect();
        open.sort_by_key(|node| std::cmp::Reverse(node.ambiance.levels.len()));

        for node in open {
            if let Err(error) = engine
                .interrupt_node(node.ambiance.clone(), status, cause.clone())
                .await
            {
                warn!("Could not interrupt node execution {}: {}", node.id, error);
            }
        }

        let execution = engine
            .plan_executions()
            .get_plan_execution(ambiance.plan_execution_id)
            .await?
            .ok_or(EngineError::PlanExecutionNotFound(ambiance.plan_execution_id))?;
        if !execution.status.is_final() {
            self.end_node_execution(engine, execution.ambiance).await?;
        }
        Ok(())
    }

    async fn handle_error(&self, engine: &ExecutionEngine, ambiance: Ambiance, error: EngineError) {
        error!(
            "Plan execution {} failed unexpectedly: {}",
            ambiance.plan_execution_id, error
        );
        if let Err(finish) = self
            .finish(engine, &ambiance, Status::Errored, error.to_string())
            .await
        {
            error!(
                "Could not finish plan execution {}: {}",
                ambiance.plan_execution_id, finish
            );
        }
    }
}
