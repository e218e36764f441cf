//! Plan node strategy - the node execution state machine
//!
//! Every mutation of a node execution goes through a guarded transition or
//! a version-checked read-modify-write on the engine, so replays and
//! concurrent deliveries converge on one outcome.

use crate::{
    advisement::AdvisingEvent,
    core::{
        AdviserResponse, Ambiance, ErrorMarker, ExecutableResponse, ExecutionMode,
        FacilitatorResponse, FailureInfo, FailureType, NodeExecution, NodeType, ResponseData,
        Status, StepResponse, TaskRequest, STAGE_GROUP,
    },
    events::SdkResponseEvent,
    execution::{
        executor::delegate_tasks,
        lifecycle::ExecutionEvent,
        strategy::{Conclusion, NodeExecutionStrategy, NodeLinks, RunNodeRequest},
        EngineError, ExecutionEngine,
    },
    persistence::without_old_retries,
    step::StepError,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

fn current_id(ambiance: &Ambiance) -> Result<Uuid, EngineError> {
    ambiance
        .current_runtime_id()
        .ok_or_else(|| EngineError::InvalidAmbiance("ambiance has no levels".to_string()))
}

/// Status a node holds while the given invocation is outstanding
fn waiting_status(response: &ExecutableResponse) -> Status {
    match response {
        ExecutableResponse::Async { .. } => Status::AsyncWaiting,
        ExecutableResponse::Task { .. } | ExecutableResponse::TaskChain { .. } => Status::TaskWaiting,
        _ => Status::Running,
    }
}

/// A guard failure against an already concluded node is a replay
fn settle(result: Result<NodeExecution, EngineError>) -> Result<(), EngineError> {
    match result {
        Ok(_) => Ok(()),
        Err(EngineError::InvalidTransition { id, status, .. }) if status.is_final() => {
            debug!("Node execution {} already concluded {}, nothing to do", id, status);
            Ok(())
        }
        Err(error) => Err(error),
    }
}

async fn guard_failure(engine: &ExecutionEngine, id: Uuid, allowed: &[Status]) -> EngineError {
    match engine.node_execution(id).await {
        Ok(current) => EngineError::InvalidTransition {
            id,
            status: current.status,
            allowed: allowed.to_vec(),
        },
        Err(error) => error,
    }
}

/// Strategy for nodes of the compiled plan graph
#[derive(Debug, Default)]
pub struct PlanNodeExecutionStrategy;

impl PlanNodeExecutionStrategy {
    pub fn new() -> Self {
        Self
    }

    async fn require_running(&self, engine: &ExecutionEngine, id: Uuid) -> Result<NodeExecution, EngineError> {
        let node = engine.node_execution(id).await?;
        if node.status != Status::Running {
            return Err(EngineError::InvalidTransition {
                id,
                status: node.status,
                allowed: vec![Status::Running],
            });
        }
        Ok(node)
    }

    /// Emit `STAGE_END` when a stage-group node is done
    async fn leave(&self, engine: &ExecutionEngine, node: &NodeExecution) {
        if node.ambiance.current_group() == Some(STAGE_GROUP) {
            engine
                .notify(ExecutionEvent::StageEnd {
                    ambiance: node.ambiance.clone(),
                    status: node.status,
                    timestamp: Utc::now(),
                })
                .await;
        }
    }

    async fn status_changed(&self, engine: &ExecutionEngine, node: &NodeExecution) {
        engine
            .notify(ExecutionEvent::NodeStatusChanged {
                ambiance: node.ambiance.clone(),
                node_execution_id: node.id,
                status: node.status,
                timestamp: Utc::now(),
            })
            .await;
    }

    /// Record an outstanding invocation and park the node until its callbacks arrive
    async fn await_callbacks(
        &self,
        engine: &ExecutionEngine,
        ambiance: Ambiance,
        response: ExecutableResponse,
        callbacks: Vec<String>,
        inline_responses: BTreeMap<String, ResponseData>,
    ) -> Result<(), EngineError> {
        let id = current_id(&ambiance)?;
        let waiting = waiting_status(&response);
        let allowed = [Status::Running, waiting];

        let record = |node: &mut NodeExecution| {
            node.executable_responses.push(response.clone());
            for key in &callbacks {
                if !node.expected_callbacks.contains(key) {
                    node.expected_callbacks.push(key.clone());
                }
            }
            for (key, data) in &inline_responses {
                node.resume_responses
                    .entry(key.clone())
                    .or_insert_with(|| data.clone());
            }
        };
        let Some(node) = engine.transition(id, &allowed, waiting, &record).await? else {
            return Err(guard_failure(engine, id, &allowed).await);
        };

        info!(
            "Node execution {} is {} on {} callback(s)",
            id,
            waiting,
            node.expected_callbacks.len()
        );
        if waiting.is_waiting() {
            self.status_changed(engine, &node).await;
        }
        self.try_advance(engine, node.ambiance).await
    }

    /// Hand task requests to the executor; executor failures fail the node
    async fn delegate(
        &self,
        engine: &ExecutionEngine,
        ambiance: Ambiance,
        tasks: Vec<(TaskRequest, String)>,
        chain: bool,
    ) -> Result<(), EngineError> {
        match delegate_tasks(engine.task_executor(), &ambiance, &tasks).await {
            Ok(delegation) => {
                let callbacks = delegation.callback_ids.clone();
                let response = delegation.executable_response(chain);
                self.await_callbacks(engine, ambiance, response, callbacks, delegation.inline_responses)
                    .await
            }
            Err(error) => self.fail_executor(engine, ambiance, error.to_string()).await,
        }
    }

    /// Executor failure path: fails the node and bypasses the adviser
    async fn fail_executor(&self, engine: &ExecutionEngine, ambiance: Ambiance, message: String) -> Result<(), EngineError> {
        warn!(
            "Task executor failed for {:?}: {}",
            ambiance.current_setup_id(),
            message
        );
        let conclusion = Conclusion::new(Status::Failed, message.clone())
            .with_failure(FailureInfo::new(message, FailureType::Infrastructure))
            .with_marker(ErrorMarker::Infrastructure);
        settle(
            self.conclude_execution(engine, ambiance, conclusion, Status::CONCLUDABLE)
                .await,
        )
    }

    /// Persist the barrier, then start every child
    async fn spawn_children(
        &self,
        engine: &ExecutionEngine,
        ambiance: Ambiance,
        response: ExecutableResponse,
        child_ids: Vec<String>,
    ) -> Result<(), EngineError> {
        let id = current_id(&ambiance)?;
        for child_id in &child_ids {
            if engine
                .plan_store()
                .fetch_node(&ambiance.plan_id, child_id)
                .await?
                .is_none()
            {
                return Err(EngineError::PlanNodeNotFound {
                    plan_id: ambiance.plan_id.clone(),
                    node_id: child_id.clone(),
                });
            }
        }

        let mode = match response {
            ExecutableResponse::Child { .. } => ExecutionMode::Child,
            _ => ExecutionMode::Children,
        };
        let barrier = |node: &mut NodeExecution| {
            node.mode = Some(mode);
            node.executable_responses.push(response.clone());
            node.expected_callbacks = child_ids.clone();
        };
        let Some(parent) = engine
            .transition(id, &[Status::Running], Status::Running, &barrier)
            .await?
        else {
            return Err(guard_failure(engine, id, &[Status::Running]).await);
        };

        info!(
            "Node execution {} waiting on {} child(ren): {}",
            id,
            child_ids.len(),
            child_ids.join(", ")
        );
        for child_id in &child_ids {
            let links = NodeLinks {
                parent_id: Some(parent.id),
                previous_id: None,
                branch_id: Some(child_id.clone()),
            };
            engine.initiate_node(&parent.ambiance, child_id, links).await?;
        }
        Ok(())
    }

    /// Claim the completed barrier; only the claiming write advances the node
    async fn try_advance(&self, engine: &ExecutionEngine, ambiance: Ambiance) -> Result<(), EngineError> {
        let id = current_id(&ambiance)?;
        let claimed = engine
            .update_node(id, |node| {
                let awaiting = match node.status {
                    Status::AsyncWaiting | Status::TaskWaiting => true,
                    Status::Running => matches!(
                        node.mode,
                        Some(ExecutionMode::Child | ExecutionMode::Children)
                    ),
                    _ => false,
                };
                if node.resumed
                    || !awaiting
                    || node.expected_callbacks.is_empty()
                    || !node.callbacks_complete()
                {
                    return false;
                }
                node.resumed = true;
                true
            })
            .await?;

        match claimed {
            Some(node) => {
                debug!("Node execution {} has all its callbacks", id);
                self.complete_resumed(engine, node).await
            }
            None => Ok(()),
        }
    }

    async fn complete_resumed(&self, engine: &ExecutionEngine, node: NodeExecution) -> Result<(), EngineError> {
        let step = engine
            .steps()
            .resolve(&node.node.step_type)
            .ok_or_else(|| EngineError::UnknownStep(node.node.step_type.clone()))?;

        let response = match node.mode {
            Some(ExecutionMode::Child | ExecutionMode::Children) => {
                step.handle_children_response(&node.ambiance, &node.node, &node.resume_responses)
                    .await?
            }
            _ => {
                step.handle_async_response(&node.ambiance, &node.node, &node.resume_responses)
                    .await?
            }
        };
        engine.process_step_response(node.ambiance, response).await
    }

    /// First adviser that can advise decides; none means the chain ends
    async fn advise(&self, engine: &ExecutionEngine, node: &NodeExecution) -> Result<(), EngineError> {
        let mut decision = None;
        for obtainment in &node.node.adviser_obtainments {
            let adviser = engine
                .advisers()
                .resolve(&obtainment.adviser_type)
                .ok_or_else(|| EngineError::UnknownAdviser(obtainment.adviser_type.clone()))?;
            let event = AdvisingEvent {
                ambiance: &node.ambiance,
                node_execution: node,
                to_status: node.status,
                parameters: &obtainment.parameters,
            };
            if adviser.can_advise(&event) {
                let response = adviser.on_advise_event(&event)?;
                debug!(
                    "Adviser {} chose {} for node execution {}",
                    obtainment.adviser_type,
                    response.kind(),
                    node.id
                );
                decision = Some(response);
                break;
            }
        }

        let mut response = decision.unwrap_or(AdviserResponse::EndPlan);
        if matches!(response, AdviserResponse::NextStep { .. } | AdviserResponse::Retry { .. })
            && engine.plan_interrupt(&node.ambiance).await?.is_some()
        {
            info!(
                "Plan execution {} is interrupted, ending instead of {}",
                node.ambiance.plan_execution_id,
                response.kind()
            );
            response = AdviserResponse::EndPlan;
        }

        engine
            .process_adviser_response(node.ambiance.clone(), response)
            .await
    }

    /// New attempt of the same node; the old one is flagged `old_retry`
    async fn retry(&self, engine: &ExecutionEngine, node: &NodeExecution, wait_ms: u64) -> Result<(), EngineError> {
        let ambiance = node
            .ambiance
            .clone_for_retry()
            .ok_or_else(|| EngineError::InvalidAmbiance("ambiance has no levels".to_string()))?;

        let marked = engine
            .update_node(node.id, |old| {
                if old.old_retry {
                    return false;
                }
                old.old_retry = true;
                true
            })
            .await?;
        if marked.is_none() {
            debug!("Node execution {} was already retried", node.id);
            return Ok(());
        }

        let mut retry_ids = node.retry_ids.clone();
        retry_ids.push(node.id);
        let request = RunNodeRequest {
            node: node.node.clone(),
            parent_id: node.parent_id,
            previous_id: node.previous_id,
            branch_id: node.branch_id.clone(),
            original_node_execution_id: Some(node.original_id()),
            retry_ids,
        };

        info!(
            "Retrying '{}' as attempt {} (requested wait {} ms)",
            node.node.id,
            node.retry_index() + 2,
            wait_ms
        );
        if let Err(error) = engine.run_node(ambiance, request).await {
            // No new attempt exists, so this one is still the latest
            warn!("Could not start a retry of node execution {}: {}", node.id, error);
            engine
                .update_node(node.id, |old| {
                    if !old.old_retry {
                        return false;
                    }
                    old.old_retry = false;
                    true
                })
                .await?;
            return Err(error);
        }
        Ok(())
    }
}

#[async_trait]
impl NodeExecutionStrategy for PlanNodeExecutionStrategy {
    fn node_type(&self) -> NodeType {
        NodeType::PlanNode
    }

    async fn run_node(
        &self,
        engine: &ExecutionEngine,
        ambiance: Ambiance,
        request: RunNodeRequest,
    ) -> Result<Uuid, EngineError> {
        ambiance
            .validate_for_node()
            .map_err(EngineError::InvalidAmbiance)?;
        if ambiance.current_setup_id() != Some(request.node.id.as_str()) {
            return Err(EngineError::InvalidAmbiance(format!(
                "current level addresses {:?}, not node '{}'",
                ambiance.current_setup_id(),
                request.node.id
            )));
        }

        let mut record = NodeExecution::new(ambiance.clone(), request.node)
            .ok_or_else(|| EngineError::InvalidAmbiance("ambiance has no levels".to_string()))?;
        record.parent_id = request.parent_id;
        record.previous_id = request.previous_id;
        record.branch_id = request.branch_id;
        record.original_node_execution_id = request.original_node_execution_id;
        record.retry_ids = request.retry_ids;
        let node = engine.node_store().save(&record).await?;
        info!(
            "Queued node execution {} for '{}' (attempt {})",
            node.id,
            node.node.id,
            node.retry_index() + 1
        );

        if let Some(previous_id) = node.previous_id {
            let next_id = node.id;
            engine
                .update_node(previous_id, |previous| {
                    if previous.next_id == Some(next_id) {
                        return false;
                    }
                    previous.next_id = Some(next_id);
                    true
                })
                .await?;
        }

        if ambiance.current_group() == Some(STAGE_GROUP) {
            engine
                .notify(ExecutionEvent::StageStart {
                    ambiance: ambiance.clone(),
                    timestamp: Utc::now(),
                })
                .await;
        }

        if let Some(condition) = &node.node.skip_condition {
            match engine.evaluator().evaluate_bool(&ambiance, condition) {
                Ok(true) => {
                    info!("Skipping '{}': {} holds", node.node.id, condition);
                    let conclusion = Conclusion::new(
                        Status::Skipped,
                        format!("skip condition '{}' evaluated true", condition),
                    );
                    if let Err(error) = self
                        .conclude_execution(engine, ambiance.clone(), conclusion, &[Status::Queued])
                        .await
                    {
                        engine.handle_error(ambiance, error).await;
                    }
                    return Ok(node.id);
                }
                Ok(false) => {}
                Err(error) => {
                    engine.handle_error(ambiance, error).await;
                    return Ok(node.id);
                }
            }
        }

        engine.schedule_start(ambiance).await;
        Ok(node.id)
    }

    async fn run_next_node(
        &self,
        engine: &ExecutionEngine,
        ambiance: Ambiance,
        next_node_id: String,
    ) -> Result<Uuid, EngineError> {
        let current = engine.node_execution(current_id(&ambiance)?).await?;
        let links = NodeLinks {
            parent_id: current.parent_id,
            previous_id: Some(current.id),
            branch_id: current.branch_id.clone(),
        };
        debug!("Node execution {} hands over to '{}'", current.id, next_node_id);
        engine
            .initiate_node(&ambiance.clone_for_finish(), &next_node_id, links)
            .await
    }

    async fn start_execution(&self, engine: &ExecutionEngine, ambiance: Ambiance) -> Result<(), EngineError> {
        let id = current_id(&ambiance)?;
        let started = engine
            .transition(id, &[Status::Queued], Status::Facilitating, &|node: &mut NodeExecution| {
                node.started_at = Some(Utc::now());
            })
            .await?;
        let Some(node) = started else {
            debug!("Node execution {} was already started", id);
            return Ok(());
        };

        if let Some(interrupt) = engine.plan_interrupt(&ambiance).await? {
            let conclusion = Conclusion::new(interrupt, "plan execution was interrupted before the node started");
            return settle(
                self.conclude_execution(engine, ambiance, conclusion, &[Status::Facilitating])
                    .await,
            );
        }

        for obtainment in &node.node.facilitator_obtainments {
            let facilitator = engine
                .facilitators()
                .resolve(&obtainment.facilitator_type)
                .ok_or_else(|| EngineError::UnknownFacilitator(obtainment.facilitator_type.clone()))?;
            if let Some(response) = facilitator.facilitate(&ambiance, &node.node, &obtainment.parameters)? {
                debug!(
                    "Facilitator {} chose {} for node execution {}",
                    obtainment.facilitator_type, response.mode, id
                );
                return engine.process_facilitator_response(ambiance, response).await;
            }
        }

        Err(EngineError::NoFacilitator(node.node.id.clone()))
    }

    async fn process_facilitator_response(
        &self,
        engine: &ExecutionEngine,
        ambiance: Ambiance,
        response: FacilitatorResponse,
    ) -> Result<(), EngineError> {
        let id = current_id(&ambiance)?;
        let mode = response.mode;
        let initial_wait_ms = response.initial_wait_ms;
        let running = engine
            .transition(id, &[Status::Facilitating], Status::Running, &move |node: &mut NodeExecution| {
                node.mode = Some(mode);
                node.initial_wait_ms = Some(initial_wait_ms);
            })
            .await?;
        let Some(node) = running else {
            let current = engine.node_execution(id).await?;
            if current.status == Status::Queued {
                return Err(EngineError::InvalidTransition {
                    id,
                    status: current.status,
                    allowed: vec![Status::Facilitating],
                });
            }
            debug!(
                "Ignoring facilitator response for node execution {}: it is {}",
                id, current.status
            );
            return Ok(());
        };

        if initial_wait_ms > 0 {
            debug!("Node execution {} requested an initial wait of {} ms", id, initial_wait_ms);
        }
        let step = engine
            .steps()
            .resolve(&node.node.step_type)
            .ok_or_else(|| EngineError::UnknownStep(node.node.step_type.clone()))?;

        match mode {
            ExecutionMode::Sync => {
                let response = step.execute_sync(&ambiance, &node.node).await?;
                engine.process_step_response(ambiance, response).await
            }
            ExecutionMode::Async => {
                let callbacks = step.execute_async(&ambiance, &node.node).await?;
                if callbacks.is_empty() {
                    let response = step
                        .handle_async_response(&ambiance, &node.node, &BTreeMap::new())
                        .await?;
                    return engine.process_step_response(ambiance, response).await;
                }
                let response = ExecutableResponse::Async {
                    callback_ids: callbacks.clone(),
                };
                self.await_callbacks(engine, ambiance, response, callbacks, BTreeMap::new())
                    .await
            }
            ExecutionMode::Task => {
                let task = step.obtain_task(&ambiance, &node.node).await?;
                self.delegate(engine, ambiance, vec![(task, Uuid::new_v4().to_string())], false)
                    .await
            }
            ExecutionMode::TaskChain => {
                let tasks = step.obtain_task_chain(&ambiance, &node.node).await?;
                if tasks.is_empty() {
                    return Err(StepError::invalid_parameters(&node.node, "task chain is empty").into());
                }
                let tasks = tasks
                    .into_iter()
                    .map(|task| (task, Uuid::new_v4().to_string()))
                    .collect();
                self.delegate(engine, ambiance, tasks, true).await
            }
            ExecutionMode::Child => {
                let child_node_id = node.node.children.first().cloned().ok_or_else(|| {
                    EngineError::InvalidPlan(format!("node '{}' has no children", node.node.id))
                })?;
                let response = ExecutableResponse::Child {
                    child_node_id: child_node_id.clone(),
                };
                self.spawn_children(engine, ambiance, response, vec![child_node_id])
                    .await
            }
            ExecutionMode::Children => {
                if node.node.children.is_empty() {
                    return Err(EngineError::InvalidPlan(format!(
                        "node '{}' has no children",
                        node.node.id
                    )));
                }
                let child_node_ids = node.node.children.clone();
                let response = ExecutableResponse::Children {
                    child_node_ids: child_node_ids.clone(),
                };
                self.spawn_children(engine, ambiance, response, child_node_ids)
                    .await
            }
        }
    }

    async fn process_step_response(
        &self,
        engine: &ExecutionEngine,
        ambiance: Ambiance,
        response: StepResponse,
    ) -> Result<(), EngineError> {
        if !response.status.is_final() {
            return Err(StepError::Internal {
                step_type: ambiance.current_step_type().unwrap_or_default().to_string(),
                reason: format!("step returned non-terminal status {}", response.status),
            }
            .into());
        }
        settle(
            self.conclude_execution(engine, ambiance, Conclusion::from_step(response), Status::CONCLUDABLE)
                .await,
        )
    }

    async fn process_adviser_response(
        &self,
        engine: &ExecutionEngine,
        ambiance: Ambiance,
        response: AdviserResponse,
    ) -> Result<(), EngineError> {
        let id = current_id(&ambiance)?;
        let recorded = engine
            .update_node(id, |node| {
                let intervening = node.status == Status::InterventionWaiting;
                if node.old_retry || !(node.status.is_final() || intervening) {
                    return false;
                }
                if node.adviser_response.is_some() && !intervening {
                    return false;
                }

                match &response {
                    AdviserResponse::InterventionWait { .. } => {
                        if intervening {
                            return false;
                        }
                        node.pre_intervention_status = Some(node.status);
                        node.conclude(Status::InterventionWaiting, "waiting for manual intervention", None);
                        node.end_ts = None;
                    }
                    AdviserResponse::MarkSuccess { .. } => {
                        node.conclude(Status::Succeeded, "failure marked as success", None);
                    }
                    AdviserResponse::IgnoreFailure { .. } => {
                        node.conclude(Status::IgnoreFailed, "failure ignored", None);
                    }
                    _ if intervening => {
                        let restored = node.pre_intervention_status.unwrap_or(Status::Failed);
                        node.conclude(
                            restored,
                            format!("intervention resolved with {}", response.kind()),
                            None,
                        );
                    }
                    _ => {}
                }
                node.adviser_response = Some(response.clone());
                true
            })
            .await?;

        let Some(node) = recorded else {
            debug!(
                "Ignoring {} for node execution {}: not concluded or already advised",
                response.kind(),
                id
            );
            return Ok(());
        };
        info!("Node execution {} advised {}", id, response.kind());

        let overrides_status = match response {
            AdviserResponse::InterventionWait { .. }
            | AdviserResponse::MarkSuccess { .. }
            | AdviserResponse::IgnoreFailure { .. } => true,
            _ => node.pre_intervention_status.is_some(),
        };
        if overrides_status {
            self.status_changed(engine, &node).await;
        }

        match response {
            AdviserResponse::NextStep { next_node_id }
            | AdviserResponse::MarkSuccess { next_node_id }
            | AdviserResponse::IgnoreFailure { next_node_id } => {
                self.leave(engine, &node).await;
                match next_node_id {
                    Some(next_node_id) => {
                        engine
                            .run_next_node(node.ambiance.clone(), next_node_id)
                            .await?;
                        Ok(())
                    }
                    None => self.end_node_execution(engine, node.ambiance.clone()).await,
                }
            }
            AdviserResponse::Retry { wait_ms } => self.retry(engine, &node, wait_ms).await,
            AdviserResponse::EndPlan => {
                self.leave(engine, &node).await;
                self.end_node_execution(engine, node.ambiance.clone()).await
            }
            AdviserResponse::InterventionWait { timeout_ms } => {
                info!(
                    "Node execution {} waits for manual intervention (timeout {:?} ms)",
                    id, timeout_ms
                );
                Ok(())
            }
        }
    }

    async fn resume_node_execution(
        &self,
        engine: &ExecutionEngine,
        ambiance: Ambiance,
        responses: BTreeMap<String, ResponseData>,
        async_error: bool,
    ) -> Result<(), EngineError> {
        let id = current_id(&ambiance)?;
        let node = engine.node_execution(id).await?;
        if node.status.is_final() {
            info!(
                "Ignoring resume of node execution {}: already {}",
                id, node.status
            );
            return Ok(());
        }

        if async_error {
            let message = responses
                .values()
                .find_map(|response| match response {
                    ResponseData::Error { message } => Some(message.clone()),
                    _ => None,
                })
                .unwrap_or_else(|| "task executor reported an error".to_string());
            return self.fail_executor(engine, ambiance, message).await;
        }

        let merged = engine
            .update_node(id, |node| {
                if node.status.is_final() || node.resumed {
                    return false;
                }
                let mut changed = false;
                for (key, data) in &responses {
                    if !node.resume_responses.contains_key(key) {
                        node.resume_responses.insert(key.clone(), data.clone());
                        changed = true;
                    }
                }
                changed
            })
            .await?;

        match merged {
            Some(node) => {
                debug!(
                    "Node execution {} has {}/{} callbacks",
                    id,
                    node.expected_callbacks
                        .iter()
                        .filter(|key| node.resume_responses.contains_key(*key))
                        .count(),
                    node.expected_callbacks.len()
                );
                self.try_advance(engine, node.ambiance).await
            }
            None => {
                debug!("Resume of node execution {} brought nothing new", id);
                Ok(())
            }
        }
    }

    async fn conclude_execution(
        &self,
        engine: &ExecutionEngine,
        ambiance: Ambiance,
        conclusion: Conclusion,
        allowed: &[Status],
    ) -> Result<NodeExecution, EngineError> {
        let id = current_id(&ambiance)?;
        let Conclusion {
            status,
            cause,
            failure_info,
            error_marker,
        } = conclusion;

        let apply = |node: &mut NodeExecution| {
            node.conclude(status, cause.clone(), failure_info.clone());
            if error_marker.is_some() {
                node.error_marker = error_marker;
            }
        };
        let Some(node) = engine.transition(id, allowed, status, &apply).await? else {
            let error = guard_failure(engine, id, allowed).await;
            if let EngineError::InvalidTransition { status: current, .. } = &error {
                if !current.is_final() {
                    warn!("Cannot conclude node execution {} as {}: it is {}", id, status, current);
                }
            }
            return Err(error);
        };

        info!(
            "Node execution {} ('{}') concluded {}: {}",
            id, node.node.id, status, cause
        );
        self.status_changed(engine, &node).await;

        // A node concluded out of an intervention wait was advised already
        let bypass_adviser = node.adviser_response.is_some()
            || match status {
                Status::Aborted => true,
                Status::Expired => engine.plan_interrupt(&node.ambiance).await?.is_some(),
                _ => node.error_marker.is_some(),
            };
        if bypass_adviser {
            self.leave(engine, &node).await;
            self.end_node_execution(engine, node.ambiance.clone()).await?;
        } else {
            self.advise(engine, &node).await?;
        }
        Ok(node)
    }

    async fn end_node_execution(&self, engine: &ExecutionEngine, ambiance: Ambiance) -> Result<(), EngineError> {
        let node = engine.node_execution(current_id(&ambiance)?).await?;

        let Some(parent_id) = node.parent_id else {
            return engine.end_node_execution(ambiance.clone_truncated(0)).await;
        };

        let parent = engine.node_execution(parent_id).await?;
        let key = node.branch_id.clone().unwrap_or_else(|| node.node.id.clone());
        debug!(
            "Node execution {} reports {} to parent {} as '{}'",
            node.id, node.status, parent_id, key
        );
        let responses = BTreeMap::from([(
            key,
            ResponseData::ChildConcluded {
                node_execution_id: node.id,
                status: node.status,
            },
        )]);
        if let Err(error) = engine
            .resume_node_execution(parent.ambiance.clone(), responses, false)
            .await
        {
            engine.handle_error(parent.ambiance, error).await;
        }
        Ok(())
    }

    async fn interrupt(
        &self,
        engine: &ExecutionEngine,
        ambiance: Ambiance,
        status: Status,
        cause: String,
    ) -> Result<(), EngineError> {
        let id = current_id(&ambiance)?;
        let node = engine.node_execution(id).await?;
        if node.status.is_final() {
            debug!("Node execution {} already {}, not interrupting", id, node.status);
            return Ok(());
        }

        let children = without_old_retries(engine.node_store().list_children(id).await?);
        for child in children.into_iter().filter(|child| !child.status.is_final()) {
            if let Err(error) = engine
                .interrupt_node(child.ambiance.clone(), status, cause.clone())
                .await
            {
                warn!("Could not interrupt child {} of {}: {}", child.id, id, error);
            }
        }

        for task_id in node.task_ids() {
            let result = match status {
                Status::Expired => engine.task_executor().expire_task(&node.ambiance, &task_id).await,
                _ => engine
                    .task_executor()
                    .abort_task(&node.ambiance, &task_id)
                    .await
                    .map(|_| ()),
            };
            if let Err(error) = result {
                warn!("Could not stop task {} of node execution {}: {}", task_id, id, error);
            }
        }

        info!("Interrupting node execution {} as {}: {}", id, status, cause);
        settle(
            self.conclude_execution(engine, node.ambiance.clone(), Conclusion::new(status, cause), Status::INTERRUPTIBLE)
                .await,
        )
    }

    async fn handle_error(&self, engine: &ExecutionEngine, ambiance: Ambiance, error: EngineError) {
        let Ok(id) = current_id(&ambiance) else {
            error!("Dropping error without a node to attribute it to: {}", error);
            return;
        };
        error!("Node execution {} failed unexpectedly: {}", id, error);

        let node = match engine.node_execution(id).await {
            Ok(node) => node,
            Err(lookup) => {
                error!("Cannot load node execution {} to fail it: {}", id, lookup);
                return;
            }
        };

        let result = if !node.status.is_final() {
            let message = error.to_string();
            let conclusion = Conclusion::new(Status::Failed, message.clone())
                .with_failure(FailureInfo::new(message, FailureType::Unknown))
                .with_marker(ErrorMarker::Errored);
            settle(
                self.conclude_execution(engine, node.ambiance.clone(), conclusion, Status::INTERRUPTIBLE)
                    .await,
            )
        } else if node.old_retry {
            warn!("Node execution {} was retried, leaving it alone", id);
            Ok(())
        } else if node.adviser_response.is_none() {
            self.process_adviser_response(engine, node.ambiance.clone(), AdviserResponse::EndPlan)
                .await
        } else {
            self.end_node_execution(engine, node.ambiance.clone()).await
        };

        if let Err(error) = result {
            error!("Could not recover node execution {}: {}", id, error);
        }
    }

    async fn handle_sdk_response_event(
        &self,
        engine: &ExecutionEngine,
        ambiance: Ambiance,
        event: SdkResponseEvent,
    ) -> Result<(), EngineError> {
        ambiance
            .validate_for_node()
            .map_err(EngineError::InvalidAmbiance)?;
        let id = current_id(&ambiance)?;
        let event_type = event.event_type().to_string();

        match event {
            SdkResponseEvent::AddExecutableResponse(response) => {
                let callbacks = match &response {
                    ExecutableResponse::Async { callback_ids } => callback_ids.clone(),
                    ExecutableResponse::Task { callback_id, .. } => vec![callback_id.clone()],
                    ExecutableResponse::TaskChain { callback_ids, .. } => callback_ids.clone(),
                    _ => {
                        return Err(EngineError::MalformedEvent {
                            event_type,
                            reason: "only async and task responses wait on callbacks".to_string(),
                        })
                    }
                };
                if callbacks.is_empty() {
                    return Err(EngineError::MalformedEvent {
                        event_type,
                        reason: "no callback ids".to_string(),
                    });
                }
                self.await_callbacks(engine, ambiance, response, callbacks, BTreeMap::new())
                    .await
            }
            SdkResponseEvent::HandleStepResponse(response) => {
                self.process_step_response(engine, ambiance, response).await
            }
            SdkResponseEvent::ResumeNode(request) => {
                self.resume_node_execution(engine, ambiance, request.responses, request.async_error)
                    .await
            }
            SdkResponseEvent::HandleFacilitateResponse(response) => {
                self.process_facilitator_response(engine, ambiance, response)
                    .await
            }
            SdkResponseEvent::HandleAdviserResponse(response) => {
                self.process_adviser_response(engine, ambiance, response).await
            }
            SdkResponseEvent::HandleEventError(request) => {
                let failure_types = if request.failure_types.is_empty() {
                    vec![FailureType::Unknown]
                } else {
                    request.failure_types
                };
                let failure = FailureInfo {
                    message: request.message.clone(),
                    failure_types,
                };
                let conclusion = Conclusion::new(Status::Failed, request.message)
                    .with_failure(failure)
                    .with_marker(ErrorMarker::Errored);
                settle(
                    self.conclude_execution(engine, ambiance, conclusion, Status::INTERRUPTIBLE)
                        .await,
                )
            }
            SdkResponseEvent::QueueTask(request) => {
                self.require_running(engine, id).await?;
                self.delegate(engine, ambiance, vec![(request.task, request.callback_id)], false)
                    .await
            }
            SdkResponseEvent::SpawnChild(request) => {
                self.require_running(engine, id).await?;
                let response = ExecutableResponse::Child {
                    child_node_id: request.child_node_id.clone(),
                };
                self.spawn_children(engine, ambiance, response, vec![request.child_node_id])
                    .await
            }
            SdkResponseEvent::SpawnChildren(request) => {
                if request.child_node_ids.is_empty() {
                    return Err(EngineError::MalformedEvent {
                        event_type,
                        reason: "no child node ids".to_string(),
                    });
                }
                self.require_running(engine, id).await?;
                let response = ExecutableResponse::Children {
                    child_node_ids: request.child_node_ids.clone(),
                };
                self.spawn_children(engine, ambiance, response, request.child_node_ids)
                    .await
            }
        }
    }
}
