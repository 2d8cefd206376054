//! Domain-guarded storage operations for the core execution records.

use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

use super::{mutate_with_retry, Collection, InMemoryCollection, StoreError, Versioned};
use crate::executions::{InterruptEffect, NodeExecution, PlanExecution};
use crate::plan::Plan;
use crate::status::Status;

/// Result of an idempotent interrupt-effect append.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EffectOutcome {
    Applied,
    /// The effect for this interrupt id was already present; reprocessing a
    /// duplicate delivery is a no-op.
    AlreadyApplied,
}

/// The engine's view of durable storage for plans and execution records.
///
/// All status writes go through the transition table in
/// [`Status::allowed_sources`]: the observed source must be a legal
/// predecessor of the target, and the write itself is a version-guarded
/// conditional update retried a bounded number of times.
pub struct EngineStore {
    plans: Arc<dyn Collection<Plan>>,
    plan_executions: Arc<dyn Collection<PlanExecution>>,
    node_executions: Arc<dyn Collection<NodeExecution>>,
    cas_attempts: u32,
}

/// A handful of attempts with short backoff before surfacing contention.
pub const DEFAULT_CAS_ATTEMPTS: u32 = 5;

impl Default for EngineStore {
    fn default() -> Self {
        Self::in_memory(DEFAULT_CAS_ATTEMPTS)
    }
}

impl EngineStore {
    #[must_use]
    pub fn in_memory(cas_attempts: u32) -> Self {
        Self {
            plans: Arc::new(InMemoryCollection::new()),
            plan_executions: Arc::new(InMemoryCollection::new()),
            node_executions: Arc::new(InMemoryCollection::new()),
            cas_attempts,
        }
    }

    /// Plug external collection implementations in behind the same guards.
    #[must_use]
    pub fn with_collections(
        plans: Arc<dyn Collection<Plan>>,
        plan_executions: Arc<dyn Collection<PlanExecution>>,
        node_executions: Arc<dyn Collection<NodeExecution>>,
        cas_attempts: u32,
    ) -> Self {
        Self {
            plans,
            plan_executions,
            node_executions,
            cas_attempts,
        }
    }

    // ---- plans -----------------------------------------------------------

    pub fn register_plan(&self, plan: Plan) -> Result<(), StoreError> {
        self.plans.create(plan).map(|_| ())
    }

    pub fn plan(&self, plan_id: &str) -> Result<Plan, StoreError> {
        Ok(self.plans.get(plan_id)?.doc)
    }

    // ---- plan executions -------------------------------------------------

    pub fn create_plan_execution(&self, execution: PlanExecution) -> Result<(), StoreError> {
        self.plan_executions.create(execution).map(|_| ())
    }

    pub fn plan_execution(&self, id: &str) -> Result<PlanExecution, StoreError> {
        Ok(self.plan_executions.get(id)?.doc)
    }

    /// Guarded plan-status write. Plan executions move freely among
    /// non-final statuses — a broke conclusion can be reopened by an
    /// ignore or retry interrupt — but a positively-final plan is
    /// immutable.
    pub fn update_plan_status(
        &self,
        id: &str,
        target: Status,
    ) -> Result<PlanExecution, StoreError> {
        let updated = mutate_with_retry(
            self.plan_executions.as_ref(),
            id,
            self.cas_attempts,
            |doc| {
                if doc.status.is_final() && doc.status != target {
                    return Err(StoreError::IllegalTransition {
                        id: id.to_string(),
                        from: doc.status,
                        to: target,
                    });
                }
                doc.status = target;
                if target.is_terminal() {
                    if doc.end_ts.is_none() {
                        doc.end_ts = Some(Utc::now());
                    }
                } else {
                    // A broke plan can be reopened by ignore/retry
                    // interrupts; the previous conclusion timestamp goes.
                    doc.end_ts = None;
                }
                Ok(())
            },
        )?;
        debug!(plan_execution_id = %id, status = %target, "plan status updated");
        Ok(updated.doc)
    }

    // ---- node executions -------------------------------------------------

    pub fn create_node_execution(&self, execution: NodeExecution) -> Result<(), StoreError> {
        self.node_executions.create(execution).map(|_| ())
    }

    pub fn node_execution(&self, id: &str) -> Result<NodeExecution, StoreError> {
        Ok(self.node_executions.get(id)?.doc)
    }

    /// Guarded status transition with no extra field writes.
    pub fn update_node_status(
        &self,
        id: &str,
        target: Status,
    ) -> Result<NodeExecution, StoreError> {
        self.update_node_status_with(id, target, |_| {})
    }

    /// Guarded status transition plus additional field writes applied in the
    /// same conditional update.
    ///
    /// Rejects with `StaleState` when the observed source status is not in
    /// `allowed_sources(target)`, and with `IllegalTransition` when the
    /// record is already positively finalized.
    pub fn update_node_status_with<F>(
        &self,
        id: &str,
        target: Status,
        apply: F,
    ) -> Result<NodeExecution, StoreError>
    where
        F: Fn(&mut NodeExecution),
    {
        let updated = mutate_with_retry(
            self.node_executions.as_ref(),
            id,
            self.cas_attempts,
            |doc| {
                let from = doc.status;
                if from.is_final() {
                    return Err(StoreError::IllegalTransition {
                        id: id.to_string(),
                        from,
                        to: target,
                    });
                }
                if !target.reachable_from(from) {
                    return Err(StoreError::stale(
                        id,
                        format!("{from} is not a legal source for {target}"),
                    ));
                }
                doc.status = target;
                if target.is_terminal() && doc.end_ts.is_none() {
                    doc.end_ts = Some(Utc::now());
                }
                apply(doc);
                Ok(())
            },
        )?;
        debug!(node_execution_id = %id, status = %target, "node status updated");
        Ok(updated.doc)
    }

    /// Non-status bookkeeping mutation (suspension history, correlation
    /// dedup, children completion). Still version-guarded and still refuses
    /// to touch a positively finalized record.
    pub fn update_node_with<F>(&self, id: &str, apply: F) -> Result<NodeExecution, StoreError>
    where
        F: Fn(&mut NodeExecution),
    {
        let updated = mutate_with_retry(
            self.node_executions.as_ref(),
            id,
            self.cas_attempts,
            |doc| {
                if doc.status.is_final() {
                    return Err(StoreError::IllegalTransition {
                        id: id.to_string(),
                        from: doc.status,
                        to: doc.status,
                    });
                }
                apply(doc);
                Ok(())
            },
        )?;
        Ok(updated.doc)
    }

    /// Append an interrupt-effect record, keyed by interrupt id. Duplicate
    /// deliveries are detected and ignored.
    pub fn append_interrupt_effect(
        &self,
        id: &str,
        effect: InterruptEffect,
    ) -> Result<EffectOutcome, StoreError> {
        let current = self.node_executions.get(id)?;
        if current
            .doc
            .interrupt_effects
            .iter()
            .any(|e| e.interrupt_id == effect.interrupt_id)
        {
            return Ok(EffectOutcome::AlreadyApplied);
        }
        mutate_with_retry(
            self.node_executions.as_ref(),
            id,
            self.cas_attempts,
            |doc| {
                if !doc
                    .interrupt_effects
                    .iter()
                    .any(|e| e.interrupt_id == effect.interrupt_id)
                {
                    doc.interrupt_effects.push(effect.clone());
                }
                Ok(())
            },
        )?;
        Ok(EffectOutcome::Applied)
    }

    /// Atomically mark a correlation id consumed. Returns false when another
    /// delivery of the same response already won, so at-least-once transport
    /// deliveries collapse to exactly-once handling.
    pub fn consume_correlation(
        &self,
        id: &str,
        correlation_id: &str,
    ) -> Result<bool, StoreError> {
        let (_, consumed) = super::mutate_returning(
            self.node_executions.as_ref(),
            id,
            self.cas_attempts,
            |doc| {
                if doc
                    .processed_correlations
                    .iter()
                    .any(|c| c == correlation_id)
                {
                    Ok(false)
                } else {
                    doc.processed_correlations.push(correlation_id.to_string());
                    Ok(true)
                }
            },
        )?;
        Ok(consumed)
    }

    /// Direct child executions of a node execution.
    pub fn children_of(&self, parent_execution_id: &str) -> Vec<NodeExecution> {
        self.node_executions
            .find(&|n| n.parent_id.as_deref() == Some(parent_execution_id))
            .into_iter()
            .map(|v| v.doc)
            .collect()
    }

    /// All executions belonging to one plan run.
    pub fn node_executions_for_plan(&self, plan_execution_id: &str) -> Vec<NodeExecution> {
        self.node_executions
            .find(&|n| n.plan_execution_id == plan_execution_id)
            .into_iter()
            .map(|v| v.doc)
            .collect()
    }

    /// The execution awaiting an unconsumed correlation id, if any. Looked
    /// up from durable state on every inbound transport message; no
    /// in-memory continuation survives a restart.
    pub fn node_by_correlation(&self, correlation_id: &str) -> Option<NodeExecution> {
        self.node_executions
            .find(&|n| n.awaits_correlation(correlation_id))
            .into_iter()
            .map(|v| v.doc)
            .next()
    }

    /// True when the node execution still exists and has not finished.
    pub fn is_live(&self, id: &str) -> bool {
        self.node_executions
            .get(id)
            .map(|v| !v.doc.status.is_terminal())
            .unwrap_or(false)
    }

    pub fn versioned_node_execution(
        &self,
        id: &str,
    ) -> Result<Versioned<NodeExecution>, StoreError> {
        self.node_executions.get(id)
    }
}
