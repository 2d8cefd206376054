//! The orchestration engine: drives node lifecycles from QUEUED to a
//! terminal status using the facilitator, adviser, interrupt, restraint,
//! barrier, timeout, and outcome subsystems.
//!
//! # Execution model
//!
//! All forward progress flows through a single command queue. Starting a
//! node, resuming a suspension, folding a child completion, and reacting to
//! a finalized record are each one [`EngineCmd`]; handlers never recurse
//! into each other, they push follow-up commands instead. The queue can be
//! drained deterministically on one task with
//! [`OrchestrationEngine::run_until_idle`] or concurrently by workers
//! spawned with [`OrchestrationEngine::spawn_workers`] — correctness never
//! depends on which, because every inter-command handoff goes through the
//! version-guarded store.

pub mod config;

pub use config::{EngineConfig, EventBusConfig, SinkConfig};

use chrono::Utc;
use miette::Diagnostic;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::advisers::{Advice, AdviserError, AdviserRegistry, AdvisingEvent};
use crate::ambiance::Ambiance;
use crate::events::{Event, MemorySink};
use crate::executions::{ExecutableResponse, NodeExecution, PlanExecution};
use crate::facilitators::{
    ExecutionMode, FacilitatorDecision, FacilitatorError, FacilitatorRegistry,
};
use crate::interrupts::{InterruptError, InterruptService, InterruptType};
use crate::outcomes::{OutcomeError, OutcomeService};
use crate::plan::{Plan, PlanNode};
use crate::restraints::{
    AcquireOutcome, ArrivalOutcome, BarrierError, BarrierService, RestraintError, RestraintService,
};
use crate::status::Status;
use crate::steps::{
    FailureInfo, FailureKind, StepContext, StepRegistry, StepResponse, TaskVerdict,
};
use crate::store::{EngineStore, StoreError};
use crate::timeouts::{FiredTimeout, TimeoutError, TimeoutTracker};
use crate::transport::{
    publish_json, RemoteDispatchError, TaskRequest, TaskResponse, Transport, TOPIC_TASKS,
};
use crate::utils::{backoff, ids};

/// One unit of engine work on the command queue.
#[derive(Clone, Debug)]
pub enum EngineCmd {
    /// Pick up a queued node execution and drive it to its first suspension
    /// or conclusion.
    StartNode { node_execution_id: String },
    /// Resume a node suspended on a barrier that is now standing.
    ResumeNode { node_execution_id: String },
    /// Fold a finalized child into its suspended parent.
    ChildDone {
        parent_execution_id: String,
        child_execution_id: String,
    },
    /// React to a record that just reached a terminal status: advisers,
    /// bookkeeping, branch propagation.
    NodeFinalized { node_execution_id: String },
    /// Bookkeeping-only cleanup for a record superseded by a retry.
    ReleaseNode { node_execution_id: String },
}

#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Facilitator(#[from] FacilitatorError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Adviser(#[from] AdviserError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Outcome(#[from] OutcomeError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Restraint(#[from] RestraintError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Barrier(#[from] BarrierError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Timeout(#[from] TimeoutError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Interrupt(#[from] InterruptError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Dispatch(#[from] RemoteDispatchError),

    #[error("no step registered for type {step_type}")]
    #[diagnostic(
        code(planwright::engine::unknown_step_type),
        help("Register the step type on the StepRegistry before starting executions.")
    )]
    UnknownStepType { step_type: String },

    #[error("node {node_id} is misconfigured: {detail}")]
    #[diagnostic(code(planwright::engine::misconfigured_node))]
    MisconfiguredNode { node_id: String, detail: String },

    #[error("engine command queue is closed")]
    #[diagnostic(code(planwright::engine::queue_closed))]
    QueueClosed,
}

pub struct OrchestrationEngine {
    config: EngineConfig,
    store: Arc<EngineStore>,
    transport: Arc<dyn Transport>,
    steps: StepRegistry,
    facilitators: FacilitatorRegistry,
    advisers: AdviserRegistry,
    restraints: RestraintService,
    barriers: BarrierService,
    timeouts: Arc<TimeoutTracker>,
    outcomes: OutcomeService,
    interrupts: Arc<InterruptService>,
    event_bus: crate::events::EventBus,
    memory_events: Option<MemorySink>,
    event_tx: flume::Sender<Event>,
    cmd_tx: flume::Sender<EngineCmd>,
    cmd_rx: flume::Receiver<EngineCmd>,
}

impl OrchestrationEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<EngineStore>,
        transport: Arc<dyn Transport>,
        steps: StepRegistry,
    ) -> Self {
        let (cmd_tx, cmd_rx) = flume::unbounded();
        let (event_bus, memory_events) = config.event_bus.build();
        let event_tx = event_bus.get_sender();
        let timeouts = Arc::new(TimeoutTracker::default().with_cas_attempts(config.cas_attempts));
        let interrupts = Arc::new(
            InterruptService::new(
                store.clone(),
                transport.clone(),
                timeouts.clone(),
                cmd_tx.clone(),
                event_tx.clone(),
            )
            .with_cas_attempts(config.cas_attempts),
        );
        Self {
            restraints: RestraintService::default().with_cas_attempts(config.cas_attempts),
            barriers: BarrierService::default().with_cas_attempts(config.cas_attempts),
            timeouts,
            config,
            store,
            transport,
            steps,
            facilitators: FacilitatorRegistry::with_builtins(),
            advisers: AdviserRegistry::with_builtins(),
            outcomes: OutcomeService::default(),
            interrupts,
            event_bus,
            memory_events,
            event_tx,
            cmd_tx,
            cmd_rx,
        }
    }

    #[must_use]
    pub fn with_facilitators(mut self, facilitators: FacilitatorRegistry) -> Self {
        self.facilitators = facilitators;
        self
    }

    #[must_use]
    pub fn with_advisers(mut self, advisers: AdviserRegistry) -> Self {
        self.advisers = advisers;
        self
    }

    pub fn store(&self) -> &Arc<EngineStore> {
        &self.store
    }

    /// Operator entry point for out-of-band signals.
    pub fn interrupts(&self) -> &InterruptService {
        &self.interrupts
    }

    pub fn restraints(&self) -> &RestraintService {
        &self.restraints
    }

    pub fn barriers(&self) -> &BarrierService {
        &self.barriers
    }

    pub fn timeout_tracker(&self) -> &TimeoutTracker {
        &self.timeouts
    }

    pub fn outcomes(&self) -> &OutcomeService {
        &self.outcomes
    }

    /// Start the background event-bus listener.
    pub fn listen_for_events(&self) {
        self.event_bus.listen_for_events();
    }

    /// Deterministic alternative to the listener: push everything queued on
    /// the bus straight into the sinks.
    pub fn drain_events(&self) {
        self.event_bus.drain_to_sinks();
    }

    /// Events captured so far, when a memory sink is configured.
    pub fn captured_events(&self) -> Vec<Event> {
        self.drain_events();
        self.memory_events
            .as_ref()
            .map(MemorySink::snapshot)
            .unwrap_or_default()
    }

    // ---- lifecycle entry points -----------------------------------------

    /// Begin a run of a registered plan. Returns the plan execution id; the
    /// root node is queued on the command queue.
    #[instrument(skip(self, trigger, scope), err)]
    pub fn start_execution(
        &self,
        plan_id: &str,
        trigger: crate::ambiance::TriggerInfo,
        scope: crate::ambiance::ScopeKeys,
    ) -> Result<String, EngineError> {
        let plan = self.store.plan(plan_id)?;
        let plan_execution = PlanExecution::start(
            ids::generate(),
            plan_id,
            trigger,
            scope,
            Utc::now(),
        );
        let plan_execution_id = plan_execution.id.clone();
        self.store.create_plan_execution(plan_execution)?;

        for (barrier, participants) in plan.barrier_participants() {
            self.barriers
                .ensure(&plan_execution_id, barrier, *participants)?;
        }
        for node in plan.nodes().values() {
            if let Some(restraint) = &node.restraint {
                self.restraints.ensure(&restraint.name, restraint.capacity)?;
            }
        }

        let root = plan.start_node();
        let root_id = self.spawn_node_execution(&plan_execution_id, &root, None, &[])?;
        self.send_cmd(EngineCmd::StartNode {
            node_execution_id: root_id,
        })?;
        let _ = self
            .event_tx
            .send(Event::plan_status(&plan_execution_id, Status::Running));
        info!(plan_id, plan_execution_id = %plan_execution_id, "plan execution started");
        Ok(plan_execution_id)
    }

    /// Drain the command queue on the current task until it is empty.
    pub async fn run_until_idle(&self) {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            self.process(cmd).await;
        }
    }

    /// Drain the queue, then return the plan execution's current state —
    /// terminal, or suspended awaiting an external wake-up.
    pub async fn run_until_settled(
        &self,
        plan_execution_id: &str,
    ) -> Result<PlanExecution, EngineError> {
        self.run_until_idle().await;
        Ok(self.store.plan_execution(plan_execution_id)?)
    }

    /// Spawn concurrent workers that drain the command queue until the
    /// engine is dropped.
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        (0..self.config.worker_concurrency)
            .map(|_| {
                let engine = Arc::clone(self);
                tokio::spawn(async move {
                    while let Ok(cmd) = engine.cmd_rx.recv_async().await {
                        engine.process(cmd).await;
                    }
                })
            })
            .collect()
    }

    /// Advance due timeouts: each fired instance raises an EXPIRE interrupt
    /// against its owning node.
    pub fn tick_timeouts(
        &self,
        now: chrono::DateTime<Utc>,
    ) -> Result<Vec<FiredTimeout>, EngineError> {
        let fired = self.timeouts.tick(now)?;
        for timeout in &fired {
            let _ = self.event_tx.send(Event::timeout_fired(
                &timeout.node_execution_id,
                timeout.dimension,
            ));
            let node = self.store.node_execution(&timeout.node_execution_id)?;
            self.interrupts.raise(
                InterruptType::ExpireAll,
                &node.plan_execution_id,
                Some(&timeout.node_execution_id),
                "timeout-tracker",
            )?;
        }
        Ok(fired)
    }

    /// Inbound remote-worker response, matched by correlation id. Duplicate
    /// and unknown correlations are dropped.
    pub async fn handle_task_response(&self, response: TaskResponse) -> Result<(), EngineError> {
        let Some(node) = self.store.node_by_correlation(&response.correlation_id) else {
            debug!(correlation_id = %response.correlation_id, "dropping unknown or duplicate task response");
            return Ok(());
        };
        if node.status.is_terminal() {
            // Aborted or expired while the worker was busy; its answer is moot.
            debug!(node_execution_id = %node.id, status = %node.status, "dropping task response for finished node");
            return Ok(());
        }
        if !self
            .store
            .consume_correlation(&node.id, &response.correlation_id)?
        {
            return Ok(());
        }
        let (plan_execution, _plan, plan_node) = self.context_for(&node)?;
        self.store.update_node_status(&node.id, Status::Running)?;
        let ambiance = self.ambiance_for(&plan_execution, &node);

        let step = self.obtain_step(&plan_node)?;
        let round = match node.last_executable_response() {
            Some(
                ExecutableResponse::Task { round, .. }
                | ExecutableResponse::TaskChain { round, .. },
            ) => *round,
            _ => 0,
        };
        match step
            .on_task_response(&ambiance, &node.resolved_parameters, &response)
            .await
        {
            Ok(TaskVerdict::Conclude(step_response)) => {
                self.conclude_node(&node.id, &ambiance, step_response)
            }
            Ok(TaskVerdict::DispatchNext(parameters)) => self.dispatch_task(
                &plan_execution,
                &plan_node,
                &node.id,
                &ambiance,
                &parameters,
                round + 1,
                true,
            ),
            Err(step_error) => self.conclude_node(
                &node.id,
                &ambiance,
                fault_response(step_error.to_string()),
            ),
        }
    }

    /// Externally driven resumption of an ASYNC suspension.
    pub fn resume_async(
        &self,
        correlation_id: &str,
        response: StepResponse,
    ) -> Result<(), EngineError> {
        let Some(node) = self.store.node_by_correlation(correlation_id) else {
            debug!(correlation_id, "dropping unknown or duplicate async resumption");
            return Ok(());
        };
        if node.status.is_terminal() {
            debug!(node_execution_id = %node.id, status = %node.status, "dropping resumption for finished node");
            return Ok(());
        }
        if !self.store.consume_correlation(&node.id, correlation_id)? {
            return Ok(());
        }
        let (plan_execution, _, _) = self.context_for(&node)?;
        self.store.update_node_status(&node.id, Status::Running)?;
        let ambiance = self.ambiance_for(&plan_execution, &node);
        self.conclude_node(&node.id, &ambiance, response)
    }

    // ---- command processing ---------------------------------------------

    async fn process(&self, cmd: EngineCmd) {
        let result = match &cmd {
            EngineCmd::StartNode { node_execution_id } => self.start_node(node_execution_id).await,
            EngineCmd::ResumeNode { node_execution_id } => {
                self.resume_node(node_execution_id).await
            }
            EngineCmd::ChildDone {
                parent_execution_id,
                child_execution_id,
            } => self.on_child_done(parent_execution_id, child_execution_id),
            EngineCmd::NodeFinalized { node_execution_id } => {
                self.node_finalized(node_execution_id)
            }
            EngineCmd::ReleaseNode { node_execution_id } => self.release_node(node_execution_id),
        };
        if let Err(err) = result {
            error!(?cmd, error = %err, "engine command failed");
            if let Some(node_execution_id) = cmd_node_id(&cmd) {
                self.fail_node_with_fault(node_execution_id, &err);
            }
        }
    }

    /// From QUEUED to first suspension or conclusion.
    #[instrument(skip(self), err)]
    async fn start_node(&self, node_execution_id: &str) -> Result<(), EngineError> {
        let node = self.store.node_execution(node_execution_id)?;
        if node.status != Status::Queued {
            // Parked by an interrupt or already picked up by another worker.
            return Ok(());
        }
        let (plan_execution, _plan, plan_node) = self.context_for(&node)?;
        if plan_execution.status == Status::Paused {
            return Ok(());
        }

        if let Some(restraint) = &plan_node.restraint {
            self.restraints
                .ensure(&restraint.name, restraint.capacity)?;
            if self.restraints.acquire(&restraint.name, node_execution_id)?
                == AcquireOutcome::Blocked
            {
                self.store.update_node_with(node_execution_id, |doc| {
                    let blocked = ExecutableResponse::RestraintBlocked {
                        restraint_name: restraint.name.clone(),
                    };
                    if doc.executable_responses.last() != Some(&blocked) {
                        doc.executable_responses.push(blocked);
                    }
                })?;
                debug!(node_execution_id, restraint = %restraint.name, "blocked on restraint");
                return Ok(());
            }
        }

        let running = self
            .store
            .update_node_status(node_execution_id, Status::Running)?;
        self.emit_node_status(&running);

        for timeout in &plan_node.timeouts {
            self.timeouts
                .register(node_execution_id, timeout, Utc::now())?;
        }

        let ambiance = self.ambiance_for(&plan_execution, &node);
        let resolved = self
            .outcomes
            .resolve_parameters(&ambiance, &plan_node.parameters)?;

        match self
            .facilitators
            .facilitate(&ambiance, &plan_node.facilitator, &resolved)?
        {
            FacilitatorDecision::Skip => {
                // A skipped branch still signals its barrier, or the
                // rendezvous would deadlock.
                if let Some(barrier) = &plan_node.barrier {
                    self.signal_barrier(&plan_execution.id, barrier, node_execution_id)?;
                }
                let skipped = self
                    .store
                    .update_node_status(node_execution_id, Status::Skipped)?;
                self.emit_node_status(&skipped);
                self.send_cmd(EngineCmd::NodeFinalized {
                    node_execution_id: node_execution_id.to_string(),
                })
            }
            FacilitatorDecision::Execute(mode) => {
                self.store.update_node_with(node_execution_id, |doc| {
                    doc.mode = Some(mode);
                    doc.resolved_parameters = resolved.clone();
                })?;
                if let Some(barrier) = &plan_node.barrier {
                    match self
                        .barriers
                        .arrive(&plan_execution.id, barrier, node_execution_id)?
                    {
                        ArrivalOutcome::Waiting => {
                            self.store.update_node_status_with(
                                node_execution_id,
                                Status::AsyncWaiting,
                                |doc| {
                                    doc.executable_responses.push(
                                        ExecutableResponse::BarrierWaiting {
                                            barrier_name: barrier.clone(),
                                        },
                                    );
                                },
                            )?;
                            debug!(node_execution_id, barrier = %barrier, "waiting at barrier");
                            self.resolve_barrier_deadlock(&plan_execution.id)?;
                            return Ok(());
                        }
                        ArrivalOutcome::Standing { released } => {
                            for waiter in released {
                                self.send_cmd(EngineCmd::ResumeNode {
                                    node_execution_id: waiter,
                                })?;
                            }
                        }
                        ArrivalOutcome::AlreadyStanding => {}
                    }
                }
                self.invoke(mode, &plan_execution, &plan_node, node_execution_id, &ambiance, &resolved)
                    .await
            }
        }
    }

    /// Continue a node whose barrier flipped to standing.
    async fn resume_node(&self, node_execution_id: &str) -> Result<(), EngineError> {
        let node = self.store.node_execution(node_execution_id)?;
        if node.status != Status::AsyncWaiting
            || !matches!(
                node.last_executable_response(),
                Some(ExecutableResponse::BarrierWaiting { .. })
            )
        {
            return Ok(());
        }
        let (plan_execution, _plan, plan_node) = self.context_for(&node)?;
        let mode = node.mode.ok_or_else(|| EngineError::MisconfiguredNode {
            node_id: node.node_id.clone(),
            detail: "barrier waiter has no persisted execution mode".to_string(),
        })?;
        let running = self
            .store
            .update_node_status(node_execution_id, Status::Running)?;
        self.emit_node_status(&running);
        let ambiance = self.ambiance_for(&plan_execution, &node);
        self.invoke(
            mode,
            &plan_execution,
            &plan_node,
            node_execution_id,
            &ambiance,
            &node.resolved_parameters,
        )
        .await
    }

    async fn invoke(
        &self,
        mode: ExecutionMode,
        plan_execution: &PlanExecution,
        plan_node: &PlanNode,
        node_execution_id: &str,
        ambiance: &Ambiance,
        parameters: &Value,
    ) -> Result<(), EngineError> {
        match mode {
            ExecutionMode::Sync => {
                let step = self.obtain_step(plan_node)?;
                let ctx = StepContext {
                    node_id: plan_node.id.clone(),
                    node_execution_id: node_execution_id.to_string(),
                    event_sender: self.event_tx.clone(),
                };
                let response = match step.run(ambiance, parameters, ctx).await {
                    Ok(response) => response,
                    Err(step_error) => fault_response(step_error.to_string()),
                };
                self.conclude_node(node_execution_id, ambiance, response)
            }
            ExecutionMode::Task => self.dispatch_task(
                plan_execution,
                plan_node,
                node_execution_id,
                ambiance,
                parameters,
                0,
                false,
            ),
            ExecutionMode::TaskChain => self.dispatch_task(
                plan_execution,
                plan_node,
                node_execution_id,
                ambiance,
                parameters,
                0,
                true,
            ),
            ExecutionMode::Async => {
                let correlation_id = ids::correlation();
                self.store.update_node_status_with(
                    node_execution_id,
                    Status::AsyncWaiting,
                    |doc| {
                        doc.executable_responses.push(ExecutableResponse::Async {
                            correlation_id: correlation_id.clone(),
                        });
                    },
                )?;
                self.publish_task_request(
                    plan_node,
                    node_execution_id,
                    ambiance,
                    parameters,
                    &correlation_id,
                    0,
                )?;
                Ok(())
            }
            ExecutionMode::Child => {
                let child_node_id = plan_node.child_ids.first().ok_or_else(|| {
                    EngineError::MisconfiguredNode {
                        node_id: plan_node.id.clone(),
                        detail: "child mode needs exactly one child reference".to_string(),
                    }
                })?;
                let plan = self.store.plan(&plan_execution.plan_id)?;
                let child_node = self.plan_node(&plan, child_node_id)?;
                let child_id = self.spawn_node_execution(
                    &plan_execution.id,
                    &child_node,
                    Some(node_execution_id.to_string()),
                    &self.store.node_execution(node_execution_id)?.levels,
                )?;
                self.store.update_node_status_with(
                    node_execution_id,
                    Status::AsyncWaiting,
                    |doc| {
                        doc.executable_responses.push(ExecutableResponse::Child {
                            child_execution_id: child_id.clone(),
                        });
                    },
                )?;
                self.send_cmd(EngineCmd::StartNode {
                    node_execution_id: child_id,
                })
            }
            ExecutionMode::Children => {
                if plan_node.child_ids.is_empty() {
                    return Err(EngineError::MisconfiguredNode {
                        node_id: plan_node.id.clone(),
                        detail: "children mode needs at least one child reference".to_string(),
                    });
                }
                let plan = self.store.plan(&plan_execution.plan_id)?;
                let levels = self.store.node_execution(node_execution_id)?.levels;
                let mut child_ids = Vec::with_capacity(plan_node.child_ids.len());
                for child_node_id in &plan_node.child_ids {
                    let child_node = self.plan_node(&plan, child_node_id)?;
                    child_ids.push(self.spawn_node_execution(
                        &plan_execution.id,
                        &child_node,
                        Some(node_execution_id.to_string()),
                        &levels,
                    )?);
                }
                self.store.update_node_status_with(
                    node_execution_id,
                    Status::AsyncWaiting,
                    |doc| {
                        doc.executable_responses
                            .push(ExecutableResponse::Children {
                                child_execution_ids: child_ids.clone(),
                                completed: Vec::new(),
                            });
                    },
                )?;
                for child_id in child_ids {
                    self.send_cmd(EngineCmd::StartNode {
                        node_execution_id: child_id,
                    })?;
                }
                Ok(())
            }
        }
    }

    /// Persist the suspension, then publish the unit of work. Persisting
    /// first means an inbound response always finds its record, even after
    /// a crash between the two.
    #[allow(clippy::too_many_arguments)]
    fn dispatch_task(
        &self,
        _plan_execution: &PlanExecution,
        plan_node: &PlanNode,
        node_execution_id: &str,
        ambiance: &Ambiance,
        parameters: &Value,
        round: u32,
        chain: bool,
    ) -> Result<(), EngineError> {
        let correlation_id = ids::correlation();
        self.store
            .update_node_status_with(node_execution_id, Status::TaskWaiting, |doc| {
                let response = if chain {
                    ExecutableResponse::TaskChain {
                        correlation_id: correlation_id.clone(),
                        round,
                    }
                } else {
                    ExecutableResponse::Task {
                        correlation_id: correlation_id.clone(),
                        round,
                    }
                };
                doc.executable_responses.push(response);
            })?;
        match self.publish_task_request(
            plan_node,
            node_execution_id,
            ambiance,
            parameters,
            &correlation_id,
            round,
        ) {
            Ok(()) => Ok(()),
            Err(dispatch_error) => {
                warn!(node_execution_id, error = %dispatch_error, "task dispatch failed");
                self.store
                    .update_node_status(node_execution_id, Status::Running)?;
                self.conclude_node(
                    node_execution_id,
                    ambiance,
                    StepResponse::failed(FailureInfo::new(
                        FailureKind::Connectivity,
                        dispatch_error.to_string(),
                        true,
                    )),
                )
            }
        }
    }

    fn publish_task_request(
        &self,
        plan_node: &PlanNode,
        node_execution_id: &str,
        ambiance: &Ambiance,
        parameters: &Value,
        correlation_id: &str,
        round: u32,
    ) -> Result<(), RemoteDispatchError> {
        let request = TaskRequest {
            correlation_id: correlation_id.to_string(),
            round,
            node_execution_id: node_execution_id.to_string(),
            step_type: plan_node.step_type.clone(),
            parameters: parameters.clone(),
            ambiance: ambiance.clone(),
        };
        let mut last_error = None;
        for attempt in 0..self.config.publish_attempts {
            match publish_json(
                self.transport.as_ref(),
                TOPIC_TASKS,
                correlation_id,
                &request,
            ) {
                Ok(()) => {
                    let _ = self.event_tx.send(Event::task_dispatched(
                        node_execution_id,
                        correlation_id,
                        round,
                    ));
                    return Ok(());
                }
                Err(err) => {
                    last_error = Some(err);
                    std::thread::sleep(backoff::jittered(attempt));
                }
            }
        }
        Err(last_error.unwrap_or(RemoteDispatchError::Publish {
            topic: TOPIC_TASKS.to_string(),
            detail: "no publish attempt was made".to_string(),
        }))
    }

    /// Publish outcomes and write the terminal status in one conclusion.
    fn conclude_node(
        &self,
        node_execution_id: &str,
        ambiance: &Ambiance,
        response: StepResponse,
    ) -> Result<(), EngineError> {
        let mut response = response;
        let mut outcome_refs = Vec::new();
        for publish in &response.outcomes {
            match self.outcomes.publish(ambiance, node_execution_id, publish) {
                Ok(outcome_id) => outcome_refs.push(outcome_id),
                Err(outcome_error) => {
                    warn!(node_execution_id, error = %outcome_error, "outcome publish rejected");
                    response = StepResponse {
                        status: Status::Errored,
                        failure_info: Some(FailureInfo::new(
                            FailureKind::Verification,
                            outcome_error.to_string(),
                            false,
                        )),
                        outcomes: Vec::new(),
                    };
                    break;
                }
            }
        }
        let concluded =
            self.store
                .update_node_status_with(node_execution_id, response.status, |doc| {
                    doc.failure_info = response.failure_info.clone();
                    for outcome_ref in &outcome_refs {
                        if !doc.outcome_refs.contains(outcome_ref) {
                            doc.outcome_refs.push(outcome_ref.clone());
                        }
                    }
                })?;
        self.emit_node_status(&concluded);
        self.send_cmd(EngineCmd::NodeFinalized {
            node_execution_id: node_execution_id.to_string(),
        })
    }

    /// Advisers, bookkeeping, and branch propagation for a record that just
    /// reached a terminal status.
    #[instrument(skip(self), err)]
    fn node_finalized(&self, node_execution_id: &str) -> Result<(), EngineError> {
        let node = self.store.node_execution(node_execution_id)?;
        if !node.status.is_terminal() {
            return Ok(());
        }
        let (plan_execution, plan, plan_node) = self.context_for(&node)?;

        let advising_event = AdvisingEvent {
            node_execution_id: node.id.clone(),
            node_id: node.node_id.clone(),
            status: node.status,
            failure_info: node.failure_info.clone(),
            retry_count: node.retry_count,
            retry_budget: plan_node
                .retry_budget
                .unwrap_or(self.config.default_retry_budget),
            next_node_id: plan_node.next_id.clone(),
        };
        let advice = self
            .advisers
            .first_match(&plan_node.advisers, &advising_event)?;

        // Intervention freezes the node before any cleanup: the restraint
        // stays held and ACTIVE timeouts pause until an operator decides.
        if advice == Some(Advice::InterventionWait) {
            let frozen = self
                .store
                .update_node_status(node_execution_id, Status::InterventionWaiting)?;
            self.emit_node_status(&frozen);
            self.timeouts.pause(node_execution_id, Utc::now())?;
            self.store
                .update_plan_status(&plan_execution.id, Status::InterventionWaiting)?;
            let _ = self.event_tx.send(Event::plan_status(
                &plan_execution.id,
                Status::InterventionWaiting,
            ));
            return Ok(());
        }

        self.cleanup_node(&plan_node, node_execution_id)?;

        let mut effective_status = node.status;
        let next_node_id = match advice {
            Some(Advice::Retry) => {
                let retry_id = self.spawn_retry(&node)?;
                info!(node_execution_id, retry_id = %retry_id, "retrying node");
                return self.send_cmd(EngineCmd::StartNode {
                    node_execution_id: retry_id,
                });
            }
            Some(Advice::NextStep {
                next_node_id,
                to_status,
            }) => {
                if let Some(to_status) = to_status {
                    let overridden = self
                        .store
                        .update_node_status(node_execution_id, to_status)?;
                    self.emit_node_status(&overridden);
                    effective_status = to_status;
                }
                next_node_id
            }
            Some(Advice::InterventionWait) => unreachable!("handled above"),
            Some(Advice::End) => None,
            None if node.status.is_positive() => plan_node.next_id.clone(),
            None => None,
        };

        if let Some(next_node_id) = next_node_id {
            let next_node = self.plan_node(&plan, &next_node_id)?;
            let sibling_levels = &node.levels[..node.levels.len().saturating_sub(1)];
            let next_id = self.spawn_node_execution(
                &plan_execution.id,
                &next_node,
                node.parent_id.clone(),
                sibling_levels,
            )?;
            return self.send_cmd(EngineCmd::StartNode {
                node_execution_id: next_id,
            });
        }

        // Branch concluded.
        if let Some(parent_id) = &node.parent_id {
            self.send_cmd(EngineCmd::ChildDone {
                parent_execution_id: parent_id.clone(),
                child_execution_id: node.id.clone(),
            })
        } else {
            self.conclude_plan(&plan_execution, effective_status)
        }
    }

    /// Bookkeeping-only cleanup for a record superseded by a retry.
    fn release_node(&self, node_execution_id: &str) -> Result<(), EngineError> {
        let node = self.store.node_execution(node_execution_id)?;
        let (_, _, plan_node) = self.context_for(&node)?;
        self.cleanup_node(&plan_node, node_execution_id)
    }

    fn cleanup_node(
        &self,
        plan_node: &PlanNode,
        node_execution_id: &str,
    ) -> Result<(), EngineError> {
        self.timeouts.cancel(node_execution_id)?;
        if let Some(restraint) = &plan_node.restraint {
            let store = self.store.clone();
            let promoted = self.restraints.release(&restraint.name, node_execution_id, &|id| {
                store.is_live(id)
            })?;
            for waiter in promoted {
                self.send_cmd(EngineCmd::StartNode {
                    node_execution_id: waiter,
                })?;
            }
        }
        Ok(())
    }

    fn on_child_done(
        &self,
        parent_execution_id: &str,
        child_execution_id: &str,
    ) -> Result<(), EngineError> {
        let parent = self.store.node_execution(parent_execution_id)?;
        if parent.status.is_terminal() {
            return Ok(());
        }
        let child = self.store.node_execution(child_execution_id)?;
        let (plan_execution, _, _) = self.context_for(&parent)?;
        let ambiance = self.ambiance_for(&plan_execution, &parent);

        // `child_execution_id` is the record that concluded its branch: the
        // last node of the chain under this parent, not necessarily the
        // spawned root.
        match parent.last_executable_response() {
            Some(ExecutableResponse::Child { .. }) => {
                self.store
                    .update_node_status(parent_execution_id, Status::Running)?;
                self.conclude_node(
                    parent_execution_id,
                    &ambiance,
                    StepResponse {
                        status: fold_child_status(child.status),
                        failure_info: child.failure_info.clone(),
                        outcomes: Vec::new(),
                    },
                )
            }
            Some(ExecutableResponse::Children { .. }) => {
                let updated = self.store.update_node_with(parent_execution_id, |doc| {
                    if let Some(ExecutableResponse::Children { completed, .. }) =
                        doc.executable_responses.last_mut()
                    {
                        if !completed.iter().any(|c| c == child_execution_id) {
                            completed.push(child_execution_id.to_string());
                        }
                    }
                })?;
                let Some(ExecutableResponse::Children {
                    child_execution_ids,
                    completed,
                }) = updated.last_executable_response()
                else {
                    return Ok(());
                };
                // One branch conclusion per spawned child. A concluded
                // branch may have starved a barrier that outstanding
                // siblings are parked on; sweep for that before waiting.
                if completed.len() < child_execution_ids.len() {
                    self.resolve_barrier_deadlock(&plan_execution.id)?;
                    return Ok(());
                }
                // Aggregate the worst branch conclusion. Severity is a total
                // order over the status set, so completion order cannot
                // change the result.
                let mut worst = Status::Succeeded;
                let mut worst_failure = None;
                for branch_end in completed {
                    let concluded = self.store.node_execution(branch_end)?;
                    if concluded.status.severity() > worst.severity() {
                        worst = concluded.status;
                        worst_failure = concluded.failure_info.clone();
                    }
                }
                self.store
                    .update_node_status(parent_execution_id, Status::Running)?;
                self.conclude_node(
                    parent_execution_id,
                    &ambiance,
                    StepResponse {
                        status: fold_child_status(worst),
                        failure_info: worst_failure,
                        outcomes: Vec::new(),
                    },
                )
            }
            _ => {
                warn!(
                    parent_execution_id,
                    child_execution_id, "child completion for a parent that is not suspended on children"
                );
                Ok(())
            }
        }
    }

    fn conclude_plan(
        &self,
        plan_execution: &PlanExecution,
        effective_status: Status,
    ) -> Result<(), EngineError> {
        let executions = self.store.node_executions_for_plan(&plan_execution.id);
        // Barrier waiters do not count as live here: once every other branch
        // has concluded, nobody can arrive and flip their barrier.
        let barrier_waiting = |n: &NodeExecution| {
            n.status == Status::AsyncWaiting
                && matches!(
                    n.last_executable_response(),
                    Some(ExecutableResponse::BarrierWaiting { .. })
                )
        };
        if executions
            .iter()
            .any(|n| !n.status.is_terminal() && !barrier_waiting(n))
        {
            return Ok(());
        }
        if self.resolve_barrier_deadlock(&plan_execution.id)? {
            // The waiters' finalizations drive the conclusion.
            return Ok(());
        }
        if executions.iter().any(|n| barrier_waiting(n)) {
            // Standing barrier, waiters not yet resumed; their ResumeNode
            // commands are still on the queue.
            return Ok(());
        }
        let final_status = if effective_status.is_positive() {
            Status::Succeeded
        } else {
            effective_status
        };
        let concluded = self
            .store
            .update_plan_status(&plan_execution.id, final_status)?;
        let _ = self
            .event_tx
            .send(Event::plan_status(&concluded.id, final_status));
        info!(plan_execution_id = %plan_execution.id, status = %final_status, "plan execution concluded");
        Ok(())
    }

    // ---- helpers ---------------------------------------------------------

    fn signal_barrier(
        &self,
        plan_execution_id: &str,
        barrier: &str,
        node_execution_id: &str,
    ) -> Result<(), EngineError> {
        if let ArrivalOutcome::Standing { released } =
            self.barriers
                .arrive(plan_execution_id, barrier, node_execution_id)?
        {
            for waiter in released {
                self.send_cmd(EngineCmd::ResumeNode {
                    node_execution_id: waiter,
                })?;
            }
        }
        Ok(())
    }

    /// Fail barrier waiters that can never be released: their barrier is
    /// short of arrivals and nobody runnable is left who could still
    /// arrive. Each waiter errors out and finalizes normally, so the
    /// conclusion propagates through parents like any other failure.
    ///
    /// Returns true when a deadlock was found and broken.
    fn resolve_barrier_deadlock(&self, plan_execution_id: &str) -> Result<bool, EngineError> {
        let unresolved = self.barriers.unresolved(plan_execution_id);
        if unresolved.is_empty() {
            return Ok(false);
        }
        let executions = self.store.node_executions_for_plan(plan_execution_id);
        let stuck_waiter = |n: &NodeExecution| {
            n.status == Status::AsyncWaiting
                && match n.last_executable_response() {
                    Some(ExecutableResponse::BarrierWaiting { barrier_name }) => {
                        unresolved.iter().any(|b| &b.name == barrier_name)
                    }
                    _ => false,
                }
        };
        let suspended_on_children = |n: &NodeExecution| {
            n.status == Status::AsyncWaiting
                && matches!(
                    n.last_executable_response(),
                    Some(ExecutableResponse::Child { .. } | ExecutableResponse::Children { .. })
                )
        };
        // Anyone still runnable may yet arrive. A parent suspended on its
        // children progresses only through them, so it does not count.
        if executions
            .iter()
            .any(|n| !n.status.is_terminal() && !stuck_waiter(n) && !suspended_on_children(n))
        {
            return Ok(false);
        }
        let waiters: Vec<&NodeExecution> =
            executions.iter().filter(|n| stuck_waiter(n)).collect();
        if waiters.is_empty() {
            return Ok(false);
        }
        let stuck = &unresolved[0];
        let deadlock = BarrierError::Deadlock {
            name: stuck.name.clone(),
            arrived: stuck.arrivals.len(),
            expected: stuck.expected,
        };
        error!(plan_execution_id, error = %deadlock, "barrier can never stand; failing its waiters");
        for waiter in waiters {
            self.store
                .update_node_status(&waiter.id, Status::Discontinuing)?;
            let errored =
                self.store
                    .update_node_status_with(&waiter.id, Status::Errored, |doc| {
                        doc.failure_info = Some(FailureInfo::new(
                            FailureKind::Application,
                            deadlock.to_string(),
                            false,
                        ));
                    })?;
            self.emit_node_status(&errored);
            self.send_cmd(EngineCmd::NodeFinalized {
                node_execution_id: waiter.id.clone(),
            })?;
        }
        Ok(true)
    }

    fn spawn_node_execution(
        &self,
        plan_execution_id: &str,
        plan_node: &PlanNode,
        parent_id: Option<String>,
        parent_levels: &[crate::ambiance::Level],
    ) -> Result<String, EngineError> {
        let node_execution_id = ids::generate();
        let mut levels = parent_levels.to_vec();
        levels.push(crate::ambiance::Level::from_plan_node(
            &node_execution_id,
            plan_node,
        ));
        let execution = NodeExecution::queued(
            &node_execution_id,
            plan_execution_id,
            &plan_node.id,
            parent_id,
            levels,
            Utc::now(),
        );
        self.store.create_node_execution(execution)?;
        let _ = self.event_tx.send(Event::node_status(
            plan_execution_id,
            &node_execution_id,
            &plan_node.id,
            Status::Queued,
        ));
        Ok(node_execution_id)
    }

    fn spawn_retry(&self, node: &NodeExecution) -> Result<String, EngineError> {
        let retry_id = ids::generate();
        let mut levels = node.levels.clone();
        if let Some(own) = levels.last_mut() {
            own.runtime_id = retry_id.clone();
        }
        let mut retry = NodeExecution::queued(
            &retry_id,
            &node.plan_execution_id,
            &node.node_id,
            node.parent_id.clone(),
            levels,
            Utc::now(),
        );
        retry.retry_of = Some(node.id.clone());
        retry.retry_count = node.retry_count + 1;
        self.store.create_node_execution(retry)?;
        Ok(retry_id)
    }

    fn fail_node_with_fault(&self, node_execution_id: &str, err: &EngineError) {
        let Ok(node) = self.store.node_execution(node_execution_id) else {
            return;
        };
        if node.status.is_terminal() {
            return;
        }
        let failure = FailureInfo::new(FailureKind::Unknown, err.to_string(), false);
        if !Status::Errored.reachable_from(node.status)
            && Status::Discontinuing.reachable_from(node.status)
        {
            if let Err(store_error) = self
                .store
                .update_node_status(node_execution_id, Status::Discontinuing)
            {
                error!(node_execution_id, error = %store_error, "could not discontinue faulted node");
                return;
            }
        }
        match self
            .store
            .update_node_status_with(node_execution_id, Status::Errored, |doc| {
                doc.failure_info = Some(failure.clone());
            }) {
            Ok(errored) => {
                self.emit_node_status(&errored);
                let _ = self.cmd_tx.send(EngineCmd::NodeFinalized {
                    node_execution_id: node_execution_id.to_string(),
                });
            }
            Err(store_error) => {
                error!(node_execution_id, error = %store_error, "could not record engine fault");
            }
        }
    }

    fn context_for(
        &self,
        node: &NodeExecution,
    ) -> Result<(PlanExecution, Plan, Arc<PlanNode>), EngineError> {
        let plan_execution = self.store.plan_execution(&node.plan_execution_id)?;
        let plan = self.store.plan(&plan_execution.plan_id)?;
        let plan_node = self.plan_node(&plan, &node.node_id)?;
        Ok((plan_execution, plan, plan_node))
    }

    fn plan_node(&self, plan: &Plan, node_id: &str) -> Result<Arc<PlanNode>, EngineError> {
        plan.node(node_id)
            .ok_or_else(|| EngineError::MisconfiguredNode {
                node_id: node_id.to_string(),
                detail: "plan node not found".to_string(),
            })
    }

    fn obtain_step(&self, plan_node: &PlanNode) -> Result<Arc<dyn crate::steps::Step>, EngineError> {
        self.steps
            .obtain(&plan_node.step_type)
            .ok_or_else(|| EngineError::UnknownStepType {
                step_type: plan_node.step_type.clone(),
            })
    }

    fn ambiance_for(&self, plan_execution: &PlanExecution, node: &NodeExecution) -> Ambiance {
        Ambiance {
            plan_execution_id: plan_execution.id.clone(),
            levels: node.levels.clone(),
            scope: plan_execution.scope.clone(),
            trigger: plan_execution.trigger.clone(),
        }
    }

    fn emit_node_status(&self, node: &NodeExecution) {
        let _ = self.event_tx.send(Event::node_status(
            &node.plan_execution_id,
            &node.id,
            &node.node_id,
            node.status,
        ));
    }

    fn send_cmd(&self, cmd: EngineCmd) -> Result<(), EngineError> {
        self.cmd_tx.send(cmd).map_err(|_| EngineError::QueueClosed)
    }
}

fn cmd_node_id(cmd: &EngineCmd) -> Option<&str> {
    match cmd {
        EngineCmd::StartNode { node_execution_id }
        | EngineCmd::ResumeNode { node_execution_id }
        | EngineCmd::NodeFinalized { node_execution_id }
        | EngineCmd::ReleaseNode { node_execution_id } => Some(node_execution_id),
        EngineCmd::ChildDone {
            parent_execution_id,
            ..
        } => Some(parent_execution_id),
    }
}

/// Fold a child's terminal status into its parent's conclusion: positive
/// variants collapse to SUCCEEDED, everything else carries through.
fn fold_child_status(status: Status) -> Status {
    if status.is_positive() {
        Status::Succeeded
    } else {
        status
    }
}

/// A step fault surfaces as an ERRORED conclusion, distinct from a business
/// FAILED reported through a StepResponse.
fn fault_response(message: String) -> StepResponse {
    StepResponse {
        status: Status::Errored,
        failure_info: Some(FailureInfo::new(FailureKind::Unknown, message, false)),
        outcomes: Vec::new(),
    }
}
