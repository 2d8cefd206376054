//! Out-of-band control signals: abort, pause, resume, retry, expire, ignore.
//!
//! Interrupts arrive from operators or the timeout tracker, are persisted
//! as their own records, and move through a small state machine:
//! REGISTERED -> PROCESSING -> processed (successfully or not). Processing
//! is idempotent per target via the interrupt-effect history on the
//! [`NodeExecution`]; a duplicate delivery finds its effect already applied
//! and does nothing. An interrupt is never left stuck in PROCESSING.

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::ambiance::Ambiance;
use crate::engine::EngineCmd;
use crate::events::Event;
use crate::executions::{InterruptEffect, NodeExecution};
use crate::status::Status;
use crate::store::{
    mutate_with_retry, Collection, EffectOutcome, EngineStore, InMemoryCollection, Record,
    StoreError,
};
use crate::timeouts::{TimeoutError, TimeoutTracker};
use crate::transport::{publish_json, InterruptEvent, RemoteDispatchError, Transport,
    TOPIC_INTERRUPTS};
use crate::utils::ids;

const DEFAULT_INTERRUPT_CAS_ATTEMPTS: u32 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptType {
    Abort,
    PauseAll,
    ResumeAll,
    Retry,
    ExpireAll,
    Ignore,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptState {
    Registered,
    Processing,
    ProcessedSuccessfully,
    ProcessedUnsuccessfully,
}

/// A persisted interrupt. Immutable once processed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interrupt {
    pub id: String,
    pub interrupt_type: InterruptType,
    pub plan_execution_id: String,
    /// `None` targets the whole plan execution.
    pub node_execution_id: Option<String>,
    pub state: InterruptState,
    pub registered_by: String,
    pub registered_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Record for Interrupt {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum InterruptError {
    #[error("interrupt {id} not found")]
    #[diagnostic(code(planwright::interrupt::not_found))]
    NotFound { id: String },

    #[error("interrupt {id} was already processed")]
    #[diagnostic(code(planwright::interrupt::already_processed))]
    AlreadyProcessed { id: String },

    #[error("interrupt {interrupt_type:?} needs a node target: {detail}")]
    #[diagnostic(code(planwright::interrupt::invalid_target))]
    InvalidTarget {
        interrupt_type: InterruptType,
        detail: String,
    },

    #[error("target {node_execution_id} is in {status}, which this interrupt cannot act on")]
    #[diagnostic(
        code(planwright::interrupt::inapplicable),
        help("Retry needs a retryable terminal status; ignore needs a broke status.")
    )]
    Inapplicable {
        node_execution_id: String,
        status: Status,
    },

    #[error(transparent)]
    #[diagnostic(code(planwright::interrupt::store))]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(code(planwright::interrupt::dispatch))]
    Dispatch(#[from] RemoteDispatchError),

    #[error(transparent)]
    #[diagnostic(code(planwright::interrupt::timeout))]
    Timeout(#[from] TimeoutError),

    #[error("engine command queue is closed")]
    #[diagnostic(code(planwright::interrupt::engine_gone))]
    EngineGone,
}

/// Registers and applies interrupts against the execution records, talking
/// back to the engine only through its command queue.
pub struct InterruptService {
    interrupts: Arc<dyn Collection<Interrupt>>,
    store: Arc<EngineStore>,
    transport: Arc<dyn Transport>,
    timeouts: Arc<TimeoutTracker>,
    cmd_tx: flume::Sender<EngineCmd>,
    event_tx: flume::Sender<Event>,
    cas_attempts: u32,
}

impl InterruptService {
    #[must_use]
    pub fn new(
        store: Arc<EngineStore>,
        transport: Arc<dyn Transport>,
        timeouts: Arc<TimeoutTracker>,
        cmd_tx: flume::Sender<EngineCmd>,
        event_tx: flume::Sender<Event>,
    ) -> Self {
        Self {
            interrupts: Arc::new(InMemoryCollection::new()),
            store,
            transport,
            timeouts,
            cmd_tx,
            event_tx,
            cas_attempts: DEFAULT_INTERRUPT_CAS_ATTEMPTS,
        }
    }

    #[must_use]
    pub fn with_cas_attempts(mut self, cas_attempts: u32) -> Self {
        self.cas_attempts = cas_attempts;
        self
    }

    /// Persist a new interrupt in REGISTERED state.
    pub fn register(
        &self,
        interrupt_type: InterruptType,
        plan_execution_id: &str,
        node_execution_id: Option<&str>,
        registered_by: &str,
    ) -> Result<Interrupt, InterruptError> {
        let interrupt = Interrupt {
            id: ids::generate(),
            interrupt_type,
            plan_execution_id: plan_execution_id.to_string(),
            node_execution_id: node_execution_id.map(str::to_string),
            state: InterruptState::Registered,
            registered_by: registered_by.to_string(),
            registered_at: Utc::now(),
            processed_at: None,
        };
        self.interrupts.create(interrupt.clone())?;
        let _ = self.event_tx.send(Event::interrupt(
            &interrupt.id,
            interrupt_type,
            InterruptState::Registered,
        ));
        info!(interrupt_id = %interrupt.id, ?interrupt_type, plan_execution_id, "interrupt registered");
        Ok(interrupt)
    }

    pub fn interrupt(&self, id: &str) -> Result<Interrupt, InterruptError> {
        match self.interrupts.get(id) {
            Ok(found) => Ok(found.doc),
            Err(StoreError::NotFound { .. }) => Err(InterruptError::NotFound {
                id: id.to_string(),
            }),
            Err(other) => Err(other.into()),
        }
    }

    /// Apply a registered interrupt. On any failure the interrupt ends in
    /// PROCESSED_UNSUCCESSFULLY and the error is re-raised so the caller can
    /// retry or alert on it.
    #[instrument(skip(self), fields(interrupt_id = %interrupt_id))]
    pub fn process(&self, interrupt_id: &str) -> Result<(), InterruptError> {
        let interrupt = self.interrupt(interrupt_id)?;
        if interrupt.state != InterruptState::Registered {
            return Err(InterruptError::AlreadyProcessed {
                id: interrupt_id.to_string(),
            });
        }
        self.set_state(interrupt_id, InterruptState::Processing)?;

        let result = match interrupt.interrupt_type {
            InterruptType::Abort => self.apply_abort(&interrupt),
            InterruptType::PauseAll => self.apply_pause_all(&interrupt),
            InterruptType::ResumeAll => self.apply_resume_all(&interrupt),
            InterruptType::Retry => self.apply_retry(&interrupt),
            InterruptType::ExpireAll => self.apply_expire(&interrupt),
            InterruptType::Ignore => self.apply_ignore(&interrupt),
        };

        match result {
            Ok(()) => {
                self.set_state(interrupt_id, InterruptState::ProcessedSuccessfully)?;
                Ok(())
            }
            Err(err) => {
                warn!(interrupt_id, error = %err, "interrupt processing failed");
                self.set_state(interrupt_id, InterruptState::ProcessedUnsuccessfully)?;
                Err(err)
            }
        }
    }

    /// Register and immediately process. The common operator path.
    pub fn raise(
        &self,
        interrupt_type: InterruptType,
        plan_execution_id: &str,
        node_execution_id: Option<&str>,
        registered_by: &str,
    ) -> Result<Interrupt, InterruptError> {
        let interrupt = self.register(
            interrupt_type,
            plan_execution_id,
            node_execution_id,
            registered_by,
        )?;
        self.process(&interrupt.id)?;
        self.interrupt(&interrupt.id)
    }

    fn set_state(&self, id: &str, state: InterruptState) -> Result<(), InterruptError> {
        let updated = mutate_with_retry(
            self.interrupts.as_ref(),
            id,
            self.cas_attempts,
            |doc| {
                doc.state = state;
                if matches!(
                    state,
                    InterruptState::ProcessedSuccessfully
                        | InterruptState::ProcessedUnsuccessfully
                ) {
                    doc.processed_at = Some(Utc::now());
                }
                Ok(())
            },
        )?;
        let _ = self.event_tx.send(Event::interrupt(
            id,
            updated.doc.interrupt_type,
            state,
        ));
        Ok(())
    }

    // ---- per-type application -------------------------------------------

    /// Depth-first abort: every live descendant finalizes before its parent,
    /// so no in-flight child is orphaned.
    fn apply_abort(&self, interrupt: &Interrupt) -> Result<(), InterruptError> {
        let roots: Vec<NodeExecution> = match &interrupt.node_execution_id {
            Some(target) => vec![self.store.node_execution(target)?],
            None => self
                .store
                .node_executions_for_plan(&interrupt.plan_execution_id)
                .into_iter()
                .filter(|n| n.parent_id.is_none() && !n.status.is_terminal())
                .collect(),
        };
        for root in &roots {
            self.abort_subtree(interrupt, root)?;
        }
        if interrupt.node_execution_id.is_none() {
            self.store
                .update_plan_status(&interrupt.plan_execution_id, Status::Aborted)?;
            let _ = self.event_tx.send(Event::plan_status(
                &interrupt.plan_execution_id,
                Status::Aborted,
            ));
        }
        Ok(())
    }

    fn abort_subtree(
        &self,
        interrupt: &Interrupt,
        node: &NodeExecution,
    ) -> Result<(), InterruptError> {
        for child in self.store.children_of(&node.id) {
            if !child.status.is_terminal() {
                self.abort_subtree(interrupt, &child)?;
            }
        }
        if node.status.is_terminal() {
            return Ok(());
        }
        if self.mark_effect(interrupt, &node.id)? == EffectOutcome::AlreadyApplied {
            return Ok(());
        }
        // Remote work gets a cooperative-cancel notification; the record is
        // finalized regardless, without waiting for an ack.
        if node.is_remotely_suspended() {
            self.notify_remote(interrupt, node)?;
        }
        self.store
            .update_node_status(&node.id, Status::Discontinuing)?;
        let aborted = self.store.update_node_status(&node.id, Status::Aborted)?;
        let _ = self.event_tx.send(Event::node_status(
            &aborted.plan_execution_id,
            &aborted.id,
            &aborted.node_id,
            Status::Aborted,
        ));
        self.cmd_tx
            .send(EngineCmd::NodeFinalized {
                node_execution_id: node.id.clone(),
            })
            .map_err(|_| InterruptError::EngineGone)?;
        Ok(())
    }

    /// Park every queued node and freeze the plan. Running nodes finish
    /// their current step; newly reachable nodes queue up paused. ACTIVE
    /// timeout budgets stop counting while parked.
    fn apply_pause_all(&self, interrupt: &Interrupt) -> Result<(), InterruptError> {
        let now = Utc::now();
        for node in self
            .store
            .node_executions_for_plan(&interrupt.plan_execution_id)
        {
            if node.status.is_terminal() {
                continue;
            }
            // Parked plans do not consume ACTIVE budget.
            self.timeouts.pause(&node.id, now)?;
            if node.status == Status::Queued {
                if self.mark_effect(interrupt, &node.id)? == EffectOutcome::AlreadyApplied {
                    continue;
                }
                self.store.update_node_status(&node.id, Status::Paused)?;
            }
        }
        self.store
            .update_plan_status(&interrupt.plan_execution_id, Status::Paused)?;
        let _ = self.event_tx.send(Event::plan_status(
            &interrupt.plan_execution_id,
            Status::Paused,
        ));
        Ok(())
    }

    /// Re-queue every paused node, restart ACTIVE timeout countdowns, and
    /// set the plan running again.
    fn apply_resume_all(&self, interrupt: &Interrupt) -> Result<(), InterruptError> {
        self.store
            .update_plan_status(&interrupt.plan_execution_id, Status::Running)?;
        let now = Utc::now();
        for node in self
            .store
            .node_executions_for_plan(&interrupt.plan_execution_id)
        {
            // Frozen nodes keep their timeouts parked until an operator
            // decides; everything else resumes its ACTIVE countdown.
            if !node.status.is_terminal() && node.status != Status::InterventionWaiting {
                self.timeouts.resume(&node.id, now)?;
            }
            if node.status == Status::Paused {
                if self.mark_effect(interrupt, &node.id)? == EffectOutcome::AlreadyApplied {
                    continue;
                }
                self.store.update_node_status(&node.id, Status::Queued)?;
                self.cmd_tx
                    .send(EngineCmd::StartNode {
                        node_execution_id: node.id.clone(),
                    })
                    .map_err(|_| InterruptError::EngineGone)?;
            } else if node.status == Status::Queued {
                // Queued after the pause took hold; its original StartNode
                // was refused while the plan was parked.
                self.cmd_tx
                    .send(EngineCmd::StartNode {
                        node_execution_id: node.id.clone(),
                    })
                    .map_err(|_| InterruptError::EngineGone)?;
            }
        }
        let _ = self.event_tx.send(Event::plan_status(
            &interrupt.plan_execution_id,
            Status::Running,
        ));
        Ok(())
    }

    /// Spawn a fresh execution of the same plan node, linked back through
    /// `retry_of`. The broke record stays as the audit trail.
    fn apply_retry(&self, interrupt: &Interrupt) -> Result<(), InterruptError> {
        let target_id = interrupt.node_execution_id.as_deref().ok_or_else(|| {
            InterruptError::InvalidTarget {
                interrupt_type: InterruptType::Retry,
                detail: "retry is always node-scoped".to_string(),
            }
        })?;
        let target = self.store.node_execution(target_id)?;
        let frozen = target.status == Status::InterventionWaiting;
        if !target.status.is_retryable() && !frozen {
            return Err(InterruptError::Inapplicable {
                node_execution_id: target_id.to_string(),
                status: target.status,
            });
        }
        if self.mark_effect(interrupt, target_id)? == EffectOutcome::AlreadyApplied {
            return Ok(());
        }
        self.reopen_plan(&target.plan_execution_id)?;
        if frozen {
            // Thaw an intervention-frozen node: finalize it as FAILED and
            // release its gates; the fresh execution takes over.
            self.store.update_node_status(target_id, Status::Discontinuing)?;
            let failed = self.store.update_node_status(target_id, Status::Failed)?;
            let _ = self.event_tx.send(Event::node_status(
                &failed.plan_execution_id,
                &failed.id,
                &failed.node_id,
                failed.status,
            ));
            self.cmd_tx
                .send(EngineCmd::ReleaseNode {
                    node_execution_id: target_id.to_string(),
                })
                .map_err(|_| InterruptError::EngineGone)?;
        }
        let retry_id = ids::generate();
        let mut levels = target.levels.clone();
        if let Some(own) = levels.last_mut() {
            own.runtime_id = retry_id.clone();
        }
        let mut retry = NodeExecution::queued(
            &retry_id,
            &target.plan_execution_id,
            &target.node_id,
            target.parent_id.clone(),
            levels,
            Utc::now(),
        );
        retry.retry_of = Some(target.id.clone());
        retry.retry_count = target.retry_count + 1;
        self.store.create_node_execution(retry)?;
        self.cmd_tx
            .send(EngineCmd::StartNode {
                node_execution_id: retry_id,
            })
            .map_err(|_| InterruptError::EngineGone)?;
        Ok(())
    }

    /// Expire the target node (or every live node, plan-wide), then hand the
    /// finalized records to the engine so advisers can still react — a retry
    /// adviser may resurrect an expired node.
    fn apply_expire(&self, interrupt: &Interrupt) -> Result<(), InterruptError> {
        let targets: Vec<NodeExecution> = match &interrupt.node_execution_id {
            Some(target) => vec![self.store.node_execution(target)?],
            None => self
                .store
                .node_executions_for_plan(&interrupt.plan_execution_id)
                .into_iter()
                .filter(|n| !n.status.is_terminal())
                .collect(),
        };
        for node in targets {
            if node.status.is_terminal() {
                continue;
            }
            if self.mark_effect(interrupt, &node.id)? == EffectOutcome::AlreadyApplied {
                continue;
            }
            if node.is_remotely_suspended() {
                self.notify_remote(interrupt, &node)?;
            }
            self.store
                .update_node_status(&node.id, Status::Discontinuing)?;
            let expired = self.store.update_node_status(&node.id, Status::Expired)?;
            let _ = self.event_tx.send(Event::node_status(
                &expired.plan_execution_id,
                &expired.id,
                &expired.node_id,
                Status::Expired,
            ));
            self.cmd_tx
                .send(EngineCmd::NodeFinalized {
                    node_execution_id: node.id.clone(),
                })
                .map_err(|_| InterruptError::EngineGone)?;
        }
        Ok(())
    }

    /// Override a broke node to IGNORE_FAILED and let execution continue
    /// past it.
    fn apply_ignore(&self, interrupt: &Interrupt) -> Result<(), InterruptError> {
        let target_id = interrupt.node_execution_id.as_deref().ok_or_else(|| {
            InterruptError::InvalidTarget {
                interrupt_type: InterruptType::Ignore,
                detail: "ignore is always node-scoped".to_string(),
            }
        })?;
        let target = self.store.node_execution(target_id)?;
        if !target.status.is_broke() {
            return Err(InterruptError::Inapplicable {
                node_execution_id: target_id.to_string(),
                status: target.status,
            });
        }
        if self.mark_effect(interrupt, target_id)? == EffectOutcome::AlreadyApplied {
            return Ok(());
        }
        self.reopen_plan(&target.plan_execution_id)?;
        let ignored = self
            .store
            .update_node_status(target_id, Status::IgnoreFailed)?;
        let _ = self.event_tx.send(Event::node_status(
            &ignored.plan_execution_id,
            &ignored.id,
            &ignored.node_id,
            Status::IgnoreFailed,
        ));
        self.cmd_tx
            .send(EngineCmd::NodeFinalized {
                node_execution_id: target_id.to_string(),
            })
            .map_err(|_| InterruptError::EngineGone)?;
        Ok(())
    }

    // ---- shared helpers --------------------------------------------------

    /// A node-scoped ignore or retry can land after its plan already
    /// concluded broke, or while the plan is frozen for intervention; in
    /// both cases the plan flows again.
    fn reopen_plan(&self, plan_execution_id: &str) -> Result<(), InterruptError> {
        let plan_execution = self.store.plan_execution(plan_execution_id)?;
        let reopenable = (plan_execution.status.is_terminal()
            && !plan_execution.status.is_final())
            || plan_execution.status == Status::InterventionWaiting;
        if reopenable {
            self.store
                .update_plan_status(plan_execution_id, Status::Running)?;
            let _ = self
                .event_tx
                .send(Event::plan_status(plan_execution_id, Status::Running));
        }
        Ok(())
    }

    fn mark_effect(
        &self,
        interrupt: &Interrupt,
        node_execution_id: &str,
    ) -> Result<EffectOutcome, InterruptError> {
        Ok(self.store.append_interrupt_effect(
            node_execution_id,
            InterruptEffect {
                interrupt_id: interrupt.id.clone(),
                interrupt_type: interrupt.interrupt_type,
                applied_at: Utc::now(),
            },
        )?)
    }

    fn notify_remote(
        &self,
        interrupt: &Interrupt,
        node: &NodeExecution,
    ) -> Result<(), InterruptError> {
        let plan_execution = self.store.plan_execution(&node.plan_execution_id)?;
        let ambiance = Ambiance {
            plan_execution_id: node.plan_execution_id.clone(),
            levels: node.levels.clone(),
            scope: plan_execution.scope.clone(),
            trigger: plan_execution.trigger.clone(),
        };
        let event = InterruptEvent {
            interrupt_id: interrupt.id.clone(),
            interrupt_type: interrupt.interrupt_type,
            node_execution_id: node.id.clone(),
            ambiance,
            last_executable_response: node.last_executable_response().cloned(),
        };
        publish_json(self.transport.as_ref(), TOPIC_INTERRUPTS, &node.id, &event)?;
        Ok(())
    }
}
