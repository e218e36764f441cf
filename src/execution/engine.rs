//! Main execution engine - the single entry point for running plans
//!
//! Every entry point resolves the strategy for the node type addressed by
//! the ambiance and forwards to it. Strategies re-enter through the engine.

use crate::{
    advisement::AdviserRegistry,
    core::{
        config::EngineConfig, AdviserResponse, Ambiance, FacilitatorResponse, Level, NodeExecution,
        NodeType, Plan, PlanExecution, ResponseData, SetupAbstractions, Status, StepResponse,
    },
    events::SdkResponseEventEnvelope,
    execution::{
        lifecycle::{EventHandler, ExecutionEvent, LifecycleNotifier},
        node_strategy::PlanNodeExecutionStrategy,
        plan_strategy::PlanExecutionStrategy,
        scheduler::ExecutionScheduler,
        strategy::{Conclusion, NodeExecutionStrategy, NodeLinks, RunNodeRequest},
        EngineError,
    },
    expression::{AmbianceEvaluator, ExpressionEvaluator},
    facilitation::FacilitatorRegistry,
    persistence::{
        ConflictRetryPolicy, InMemoryStore, NodeExecutionStore, NodeOps, PlanExecutionStore,
        PlanStore, ProcessedEventStore, StoreError,
    },
    step::StepRegistry,
    task::{NoopTaskExecutor, TaskExecutor},
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

struct Shared {
    node_store: Arc<dyn NodeExecutionStore>,
    plan_execution_store: Arc<dyn PlanExecutionStore>,
    plan_store: Arc<dyn PlanStore>,
    processed_events: Arc<dyn ProcessedEventStore>,
    facilitators: FacilitatorRegistry,
    advisers: AdviserRegistry,
    steps: StepRegistry,
    task_executor: Arc<dyn TaskExecutor>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    strategies: HashMap<NodeType, Arc<dyn NodeExecutionStrategy>>,
    scheduler: ExecutionScheduler,
    conflict_retry: ConflictRetryPolicy,
    event_claim_lease: Duration,
    notifier: LifecycleNotifier,
    plan_finished: Notify,
}

/// Builder for [`ExecutionEngine`]
///
/// Unset stores default to one shared in-memory store; unset registries
/// default to the built-in policies and steps.
pub struct EngineBuilder {
    node_store: Option<Arc<dyn NodeExecutionStore>>,
    plan_execution_store: Option<Arc<dyn PlanExecutionStore>>,
    plan_store: Option<Arc<dyn PlanStore>>,
    processed_events: Option<Arc<dyn ProcessedEventStore>>,
    facilitators: FacilitatorRegistry,
    advisers: AdviserRegistry,
    steps: StepRegistry,
    task_executor: Arc<dyn TaskExecutor>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    config: EngineConfig,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            node_store: None,
            plan_execution_store: None,
            plan_store: None,
            processed_events: None,
            facilitators: FacilitatorRegistry::with_builtins(),
            advisers: AdviserRegistry::with_builtins(),
            steps: StepRegistry::with_builtins(),
            task_executor: Arc::new(NoopTaskExecutor),
            evaluator: Arc::new(AmbianceEvaluator),
            config: EngineConfig::default(),
        }
    }
}

impl EngineBuilder {
    /// Use one store for node executions, plan executions and processed events
    pub fn with_execution_store<S>(mut self, store: Arc<S>) -> Self
    where
        S: NodeExecutionStore + PlanExecutionStore + ProcessedEventStore + 'static,
    {
        self.node_store = Some(store.clone());
        self.plan_execution_store = Some(store.clone());
        self.processed_events = Some(store);
        self
    }

    pub fn with_plan_store(mut self, store: Arc<dyn PlanStore>) -> Self {
        self.plan_store = Some(store);
        self
    }

    pub fn with_facilitators(mut self, facilitators: FacilitatorRegistry) -> Self {
        self.facilitators = facilitators;
        self
    }

    pub fn with_advisers(mut self, advisers: AdviserRegistry) -> Self {
        self.advisers = advisers;
        self
    }

    pub fn with_steps(mut self, steps: StepRegistry) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_task_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.task_executor = executor;
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> ExecutionEngine {
        let memory = Arc::new(InMemoryStore::new());
        let node_store: Arc<dyn NodeExecutionStore> = match self.node_store {
            Some(store) => store,
            None => memory.clone(),
        };
        let plan_execution_store: Arc<dyn PlanExecutionStore> = match self.plan_execution_store {
            Some(store) => store,
            None => memory.clone(),
        };
        let plan_store: Arc<dyn PlanStore> = match self.plan_store {
            Some(store) => store,
            None => memory.clone(),
        };
        let processed_events: Arc<dyn ProcessedEventStore> = match self.processed_events {
            Some(store) => store,
            None => memory,
        };

        let mut strategies: HashMap<NodeType, Arc<dyn NodeExecutionStrategy>> = HashMap::new();
        for strategy in [
            Arc::new(PlanExecutionStrategy::new()) as Arc<dyn NodeExecutionStrategy>,
            Arc::new(PlanNodeExecutionStrategy::new()),
        ] {
            strategies.insert(strategy.node_type(), strategy);
        }

        ExecutionEngine {
            shared: Arc::new(Shared {
                node_store,
                plan_execution_store,
                plan_store,
                processed_events,
                facilitators: self.facilitators,
                advisers: self.advisers,
                steps: self.steps,
                task_executor: self.task_executor,
                evaluator: self.evaluator,
                strategies,
                scheduler: ExecutionScheduler::new(self.config.scheduling),
                conflict_retry: self.config.conflict_retry,
                event_claim_lease: Duration::from_millis(self.config.event_claim_lease_ms),
                notifier: LifecycleNotifier::new(),
                plan_finished: Notify::new(),
            }),
        }
    }
}

/// Main plan execution engine
#[derive(Clone)]
pub struct ExecutionEngine {
    shared: Arc<Shared>,
}

impl ExecutionEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Engine over in-memory stores with the built-in policies
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::builder().with_config(config).build()
    }

    /// Add an event handler
    pub async fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        let handler: EventHandler = Arc::new(handler);
        self.shared.notifier.add_handler(handler).await;
    }

    /// Validate a compiled plan against the registries and store it
    pub async fn register_plan(&self, plan: &Plan) -> Result<(), EngineError> {
        if plan.start_node().is_none() {
            return Err(EngineError::InvalidPlan(format!(
                "start node '{}' does not exist",
                plan.start_node_id
            )));
        }

        for node in plan.nodes.values() {
            if !self.shared.steps.contains(&node.step_type) {
                return Err(EngineError::UnknownStep(node.step_type.clone()));
            }
            for obtainment in &node.facilitator_obtainments {
                if !self.shared.facilitators.contains(&obtainment.facilitator_type) {
                    return Err(EngineError::UnknownFacilitator(obtainment.facilitator_type.clone()));
                }
            }
            for obtainment in &node.adviser_obtainments {
                if !self.shared.advisers.contains(&obtainment.adviser_type) {
                    return Err(EngineError::UnknownAdviser(obtainment.adviser_type.clone()));
                }
            }
            if let Some(child) = node.children.iter().find(|child| plan.node(child).is_none()) {
                return Err(EngineError::PlanNodeNotFound {
                    plan_id: plan.id.clone(),
                    node_id: child.clone(),
                });
            }
        }

        self.shared.plan_store.save_plan(plan).await?;
        info!("Registered plan '{}' with {} nodes", plan.id, plan.nodes.len());
        Ok(())
    }

    /// Start a new execution of a registered plan; returns its id
    pub async fn start_plan(&self, plan_id: &str, setup: SetupAbstractions) -> Result<Uuid, EngineError> {
        let plan = self
            .shared
            .plan_store
            .fetch_plan(plan_id)
            .await?
            .ok_or_else(|| EngineError::PlanNotFound(plan_id.to_string()))?;
        let start = plan.start_node().cloned().ok_or_else(|| EngineError::PlanNodeNotFound {
            plan_id: plan.id.clone(),
            node_id: plan.start_node_id.clone(),
        })?;

        let ambiance = Ambiance::for_plan(plan.id.clone(), setup);
        self.run_node(ambiance, RunNodeRequest::new(start)).await
    }

    pub async fn abort_plan(&self, plan_execution_id: Uuid, cause: impl Into<String>) -> Result<(), EngineError> {
        self.interrupt_plan(plan_execution_id, Status::Aborted, cause.into()).await
    }

    pub async fn expire_plan(&self, plan_execution_id: Uuid, cause: impl Into<String>) -> Result<(), EngineError> {
        self.interrupt_plan(plan_execution_id, Status::Expired, cause.into()).await
    }

    async fn interrupt_plan(&self, plan_execution_id: Uuid, status: Status, cause: String) -> Result<(), EngineError> {
        let execution = self
            .shared
            .plan_execution_store
            .get_plan_execution(plan_execution_id)
            .await?
            .ok_or(EngineError::PlanExecutionNotFound(plan_execution_id))?;
        self.interrupt_node(execution.ambiance, status, cause).await
    }

    /// Expire one node execution (e.g. on a timeout); the adviser decides what follows
    pub async fn expire_node(&self, node_execution_id: Uuid, cause: impl Into<String>) -> Result<(), EngineError> {
        let node_execution = self.node_execution(node_execution_id).await?;
        self.interrupt_node(node_execution.ambiance, Status::Expired, cause.into())
            .await
    }

    /// Wait until the plan execution reaches a terminal status
    pub async fn wait_for_plan(&self, plan_execution_id: Uuid) -> Result<PlanExecution, EngineError> {
        loop {
            let notified = self.shared.plan_finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let execution = self
                .shared
                .plan_execution_store
                .get_plan_execution(plan_execution_id)
                .await?
                .ok_or(EngineError::PlanExecutionNotFound(plan_execution_id))?;
            if execution.status.is_final() {
                return Ok(execution);
            }

            notified.await;
        }
    }

    pub async fn plan_execution(&self, plan_execution_id: Uuid) -> Result<PlanExecution, EngineError> {
        self.shared
            .plan_execution_store
            .get_plan_execution(plan_execution_id)
            .await?
            .ok_or(EngineError::PlanExecutionNotFound(plan_execution_id))
    }

    pub async fn node_executions(&self, plan_execution_id: Uuid) -> Result<Vec<NodeExecution>, EngineError> {
        Ok(self
            .shared
            .node_store
            .list_by_plan_execution(plan_execution_id)
            .await?)
    }

    pub async fn node_execution(&self, node_execution_id: Uuid) -> Result<NodeExecution, EngineError> {
        self.shared
            .node_store
            .get(node_execution_id)
            .await?
            .ok_or(EngineError::NodeExecutionNotFound(node_execution_id))
    }

    fn strategy(&self, ambiance: &Ambiance) -> Result<Arc<dyn NodeExecutionStrategy>, EngineError> {
        let node_type = ambiance.node_type();
        self.shared
            .strategies
            .get(&node_type)
            .cloned()
            .ok_or(EngineError::UnknownNodeType(node_type))
    }

    pub async fn run_node(&self, ambiance: Ambiance, request: RunNodeRequest) -> Result<Uuid, EngineError> {
        self.strategy(&ambiance)?.run_node(self, ambiance, request).await
    }

    pub async fn run_next_node(&self, ambiance: Ambiance, next_node_id: String) -> Result<Uuid, EngineError> {
        self.strategy(&ambiance)?
            .run_next_node(self, ambiance, next_node_id)
            .await
    }

    pub async fn start_node_execution(&self, ambiance: Ambiance) -> Result<(), EngineError> {
        self.strategy(&ambiance)?.start_execution(self, ambiance).await
    }

    pub async fn process_facilitator_response(
        &self,
        ambiance: Ambiance,
        response: FacilitatorResponse,
    ) -> Result<(), EngineError> {
        self.strategy(&ambiance)?
            .process_facilitator_response(self, ambiance, response)
            .await
    }

    pub async fn process_step_response(&self, ambiance: Ambiance, response: StepResponse) -> Result<(), EngineError> {
        self.strategy(&ambiance)?
            .process_step_response(self, ambiance, response)
            .await
    }

    pub async fn process_adviser_response(
        &self,
        ambiance: Ambiance,
        response: AdviserResponse,
    ) -> Result<(), EngineError> {
        self.strategy(&ambiance)?
            .process_adviser_response(self, ambiance, response)
            .await
    }

    pub async fn resume_node_execution(
        &self,
        ambiance: Ambiance,
        responses: BTreeMap<String, ResponseData>,
        async_error: bool,
    ) -> Result<(), EngineError> {
        self.strategy(&ambiance)?
            .resume_node_execution(self, ambiance, responses, async_error)
            .await
    }

    pub async fn conclude_node_execution(
        &self,
        ambiance: Ambiance,
        conclusion: Conclusion,
        allowed: &[Status],
    ) -> Result<NodeExecution, EngineError> {
        self.strategy(&ambiance)?
            .conclude_execution(self, ambiance, conclusion, allowed)
            .await
    }

    pub async fn end_node_execution(&self, ambiance: Ambiance) -> Result<(), EngineError> {
        self.strategy(&ambiance)?.end_node_execution(self, ambiance).await
    }

    pub async fn interrupt_node(&self, ambiance: Ambiance, status: Status, cause: String) -> Result<(), EngineError> {
        self.strategy(&ambiance)?
            .interrupt(self, ambiance, status, cause)
            .await
    }

    /// Route an unexpected error to the strategy of the addressed node
    pub async fn handle_error(&self, ambiance: Ambiance, error: EngineError) {
        match self.strategy(&ambiance) {
            Ok(strategy) => strategy.handle_error(self, ambiance, error).await,
            Err(lookup) => error!("Dropping error {} for unroutable ambiance: {}", error, lookup),
        }
    }

    /// Validate, deduplicate and forward an inbound SDK event
    pub async fn handle_sdk_response_event(&self, envelope: SdkResponseEventEnvelope) -> Result<(), EngineError> {
        let event = match envelope.validate().and_then(|_| envelope.decode()) {
            Ok(event) => event,
            Err(error) => {
                warn!("Rejected {} event: {}", envelope.event_type, error);
                return Err(error);
            }
        };

        let ambiance = envelope.ambiance;
        let node_execution_id = ambiance
            .current_runtime_id()
            .ok_or_else(|| EngineError::InvalidAmbiance("ambiance has no levels".to_string()))?;
        let key = event.idempotency_key(node_execution_id);
        let processed = &self.shared.processed_events;
        if !processed.try_claim(&key, self.shared.event_claim_lease).await? {
            info!("Skipping duplicate event {}", key);
            return Ok(());
        }

        debug!("Handling event {}", key);
        let result = match self.strategy(&ambiance) {
            Ok(strategy) => strategy.handle_sdk_response_event(self, ambiance, event).await,
            Err(error) => Err(error),
        };
        let settled = match &result {
            Ok(()) => processed.complete(&key).await,
            Err(error) if error.is_validation() => {
                warn!("Event {} rejected: {}", key, error);
                processed.complete(&key).await
            }
            Err(error) => {
                warn!("Event {} failed: {}", key, error);
                processed.release(&key).await
            }
        };
        if let Err(store) = settled {
            error!("Could not settle the claim on event {}: {}", key, store);
        }
        result
    }

    /// Create and start the plan node `node_id` below `ambiance`
    ///
    /// This is the only place levels are built.
    pub async fn initiate_node(
        &self,
        ambiance: &Ambiance,
        node_id: &str,
        links: NodeLinks,
    ) -> Result<Uuid, EngineError> {
        let node = self
            .shared
            .plan_store
            .fetch_node(&ambiance.plan_id, node_id)
            .await?
            .ok_or_else(|| EngineError::PlanNodeNotFound {
                plan_id: ambiance.plan_id.clone(),
                node_id: node_id.to_string(),
            })?;

        let level = Level::new(
            node.id.clone(),
            node.identifier.clone(),
            node.step_type.clone(),
            node.group.clone(),
        );
        let child_ambiance = ambiance.clone_for_child(level);
        self.run_node(child_ambiance, RunNodeRequest::linked(node, links))
            .await
    }

    /// Start a persisted node according to the scheduling strategy
    pub(crate) async fn schedule_start(&self, ambiance: Ambiance) {
        let engine = self.clone();
        let label = format!("start of {:?}", ambiance.current_setup_id());
        let work = async move {
            if let Err(error) = engine.start_node_execution(ambiance.clone()).await {
                engine.handle_error(ambiance, error).await;
            }
        };
        self.shared.scheduler.schedule(&label, work).await;
    }

    pub(crate) fn node_store(&self) -> &dyn NodeExecutionStore {
        self.shared.node_store.as_ref()
    }

    pub(crate) fn plan_executions(&self) -> &dyn PlanExecutionStore {
        self.shared.plan_execution_store.as_ref()
    }

    pub(crate) fn plan_store(&self) -> &dyn PlanStore {
        self.shared.plan_store.as_ref()
    }

    pub(crate) fn facilitators(&self) -> &FacilitatorRegistry {
        &self.shared.facilitators
    }

    pub(crate) fn advisers(&self) -> &AdviserRegistry {
        &self.shared.advisers
    }

    pub(crate) fn steps(&self) -> &StepRegistry {
        &self.shared.steps
    }

    pub(crate) fn task_executor(&self) -> &dyn TaskExecutor {
        self.shared.task_executor.as_ref()
    }

    pub(crate) fn evaluator(&self) -> &dyn ExpressionEvaluator {
        self.shared.evaluator.as_ref()
    }

    pub(crate) async fn notify(&self, event: ExecutionEvent) {
        self.shared.notifier.notify(event).await;
    }

    pub(crate) fn plan_finished(&self) {
        self.shared.plan_finished.notify_waiters();
    }

    /// Interrupt recorded on the plan execution of `ambiance`, if any
    pub(crate) async fn plan_interrupt(&self, ambiance: &Ambiance) -> Result<Option<Status>, EngineError> {
        Ok(self
            .shared
            .plan_execution_store
            .get_plan_execution(ambiance.plan_execution_id)
            .await?
            .and_then(|execution| execution.interrupt))
    }

    /// Read-modify-write of a node execution, retried on version conflicts
    ///
    /// `mutate` sees the freshly read record on every attempt and returns
    /// false to leave it untouched, in which case `None` is returned.
    pub(crate) async fn update_node<F>(&self, id: Uuid, mut mutate: F) -> Result<Option<NodeExecution>, EngineError>
    where
        F: FnMut(&mut NodeExecution) -> bool + Send,
    {
        let policy = &self.shared.conflict_retry;
        let attempts = policy.max_attempts.max(1);
        for attempt in 0..attempts {
            let mut node = self
                .shared
                .node_store
                .get(id)
                .await?
                .ok_or(EngineError::NodeExecutionNotFound(id))?;
            if !mutate(&mut node) {
                return Ok(None);
            }

            match self.shared.node_store.update(&node).await {
                Ok(written) => return Ok(Some(written)),
                Err(StoreError::VersionConflict { found, .. }) => {
                    debug!("Version conflict on {} (now {}), attempt {}", id, found, attempt + 1);
                    tokio::time::sleep(policy.delay(attempt)).await;
                }
                Err(error) => return Err(error.into()),
            }
        }
        Err(EngineError::ConflictRetriesExhausted { id, attempts })
    }

    /// Status-guarded transition, retried on version conflicts
    pub(crate) async fn transition(
        &self,
        id: Uuid,
        from: &[Status],
        to: Status,
        ops: &NodeOps<'_>,
    ) -> Result<Option<NodeExecution>, EngineError> {
        let policy = &self.shared.conflict_retry;
        let attempts = policy.max_attempts.max(1);
        for attempt in 0..attempts {
            match self.shared.node_store.update_status_if_in(id, from, to, ops).await {
                Ok(written) => return Ok(written),
                Err(StoreError::VersionConflict { found, .. }) => {
                    debug!("Version conflict on {} (now {}), attempt {}", id, found, attempt + 1);
                    tokio::time::sleep(policy.delay(attempt)).await;
                }
                Err(StoreError::NotFound(id)) => return Err(EngineError::NodeExecutionNotFound(id)),
                Err(error) => return Err(error.into()),
            }
        }
        Err(EngineError::ConflictRetriesExhausted { id, attempts })
    }

    /// Read-modify-write of a plan execution, retried on version conflicts
    pub(crate) async fn update_plan_execution<F>(
        &self,
        id: Uuid,
        mut mutate: F,
    ) -> Result<Option<PlanExecution>, EngineError>
    where
        F: FnMut(&mut PlanExecution) -> bool + Send,
    {
        let policy = &self.shared.conflict_retry;
        let attempts = policy.max_attempts.max(1);
        for attempt in 0..attempts {
            let mut execution = self
                .shared
                .plan_execution_store
                .get_plan_execution(id)
                .await?
                .ok_or(EngineError::PlanExecutionNotFound(id))?;
            if !mutate(&mut execution) {
                return Ok(None);
            }

            match self.shared.plan_execution_store.update_plan_execution(&execution).await {
                Ok(written) => return Ok(Some(written)),
                Err(StoreError::VersionConflict { found, .. }) => {
                    debug!("Version conflict on plan execution {} (now {})", id, found);
                    tokio::time::sleep(policy.delay(attempt)).await;
                }
                Err(error) => return Err(error.into()),
            }
        }
        Err(EngineError::ConflictRetriesExhausted { id, attempts })
    }
}
