//! Resource restraints and barriers: the two cross-branch coordination
//! primitives.
//!
//! A restraint is a named counting semaphore with FIFO waiters; a barrier
//! is a named rendezvous that flips to standing exactly once when the last
//! expected participant arrives. Both live in versioned records mutated
//! only through bounded conditional-update retry, so concurrent
//! acquire/release and arrivals from independent workers stay correct
//! without any lock.

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::store::{mutate_returning, Collection, InMemoryCollection, Record, StoreError};

/// Default attempts before acquire/release/arrive surfaces contention.
const DEFAULT_GATE_CAS_ATTEMPTS: u32 = 5;

// ---------------------------------------------------------------- restraint

/// A queued acquirer, ordered by registration time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestraintWaiter {
    pub node_execution_id: String,
    pub registered_at: DateTime<Utc>,
}

/// Durable state of one named restraint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestraintRecord {
    pub id: String,
    pub capacity: usize,
    pub holders: Vec<String>,
    pub waiters: Vec<RestraintWaiter>,
}

impl Record for RestraintRecord {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Result of a non-blocking acquire attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired,
    /// Queued behind the current holders; the engine suspends the node and
    /// a later release promotes it.
    Blocked,
}

#[derive(Debug, Error, Diagnostic)]
pub enum RestraintError {
    #[error("restraint {name} not registered")]
    #[diagnostic(code(planwright::restraint::unknown))]
    Unknown { name: String },

    #[error("restraint {name}: conditional updates kept losing after {attempts} attempts")]
    #[diagnostic(
        code(planwright::restraint::contention),
        help("Heavy acquire/release churn on one restraint; widen capacity or shard the gate.")
    )]
    Contention { name: String, attempts: u32 },

    #[error(transparent)]
    #[diagnostic(code(planwright::restraint::store))]
    Store(StoreError),
}

fn map_restraint_err(name: &str, err: StoreError) -> RestraintError {
    match err {
        StoreError::NotFound { .. } => RestraintError::Unknown {
            name: name.to_string(),
        },
        StoreError::Contention { attempts, .. } => RestraintError::Contention {
            name: name.to_string(),
            attempts,
        },
        other => RestraintError::Store(other),
    }
}

/// Acquire/release protocol over the restraint collection.
pub struct RestraintService {
    restraints: Arc<dyn Collection<RestraintRecord>>,
    cas_attempts: u32,
}

impl Default for RestraintService {
    fn default() -> Self {
        Self {
            restraints: Arc::new(InMemoryCollection::new()),
            cas_attempts: DEFAULT_GATE_CAS_ATTEMPTS,
        }
    }
}

impl RestraintService {
    #[must_use]
    pub fn new(restraints: Arc<dyn Collection<RestraintRecord>>) -> Self {
        Self {
            restraints,
            cas_attempts: DEFAULT_GATE_CAS_ATTEMPTS,
        }
    }

    #[must_use]
    pub fn with_cas_attempts(mut self, cas_attempts: u32) -> Self {
        self.cas_attempts = cas_attempts;
        self
    }

    /// Register a restraint if it does not exist yet. Idempotent; an
    /// existing record keeps its capacity.
    pub fn ensure(&self, name: &str, capacity: usize) -> Result<(), RestraintError> {
        match self.restraints.create(RestraintRecord {
            id: name.to_string(),
            capacity,
            holders: Vec::new(),
            waiters: Vec::new(),
        }) {
            Ok(_) | Err(StoreError::AlreadyExists { .. }) => Ok(()),
            Err(other) => Err(map_restraint_err(name, other)),
        }
    }

    /// Non-blocking acquire. Re-acquiring while already holding or queued
    /// is a no-op that reports the current position.
    pub fn acquire(
        &self,
        name: &str,
        node_execution_id: &str,
    ) -> Result<AcquireOutcome, RestraintError> {
        let (_, outcome) = mutate_returning(
            self.restraints.as_ref(),
            name,
            self.cas_attempts,
            |record| {
                if record.holders.iter().any(|h| h == node_execution_id) {
                    return Ok(AcquireOutcome::Acquired);
                }
                if record
                    .waiters
                    .iter()
                    .any(|w| w.node_execution_id == node_execution_id)
                {
                    return Ok(AcquireOutcome::Blocked);
                }
                if record.holders.len() < record.capacity {
                    record.holders.push(node_execution_id.to_string());
                    Ok(AcquireOutcome::Acquired)
                } else {
                    record.waiters.push(RestraintWaiter {
                        node_execution_id: node_execution_id.to_string(),
                        registered_at: Utc::now(),
                    });
                    Ok(AcquireOutcome::Blocked)
                }
            },
        )
        .map_err(|e| map_restraint_err(name, e))?;
        debug!(restraint = %name, node_execution_id, ?outcome, "restraint acquire");
        Ok(outcome)
    }

    /// Release a holder (or drop a queued waiter) and promote the
    /// earliest-registered waiters that are still live, up to capacity.
    /// Returns the promoted node execution ids so the engine can re-queue
    /// them.
    pub fn release(
        &self,
        name: &str,
        node_execution_id: &str,
        is_live: &dyn Fn(&str) -> bool,
    ) -> Result<Vec<String>, RestraintError> {
        let (_, promoted) = mutate_returning(
            self.restraints.as_ref(),
            name,
            self.cas_attempts,
            |record| {
                record.holders.retain(|h| h != node_execution_id);
                record
                    .waiters
                    .retain(|w| w.node_execution_id != node_execution_id);

                let mut promoted = Vec::new();
                record.waiters.sort_by_key(|w| w.registered_at);
                while record.holders.len() < record.capacity {
                    // Dead waiters are dropped on the way past.
                    let Some(next) = record.waiters.first().cloned() else {
                        break;
                    };
                    record.waiters.remove(0);
                    if is_live(&next.node_execution_id) {
                        record.holders.push(next.node_execution_id.clone());
                        promoted.push(next.node_execution_id);
                    }
                }
                Ok(promoted)
            },
        )
        .map_err(|e| map_restraint_err(name, e))?;
        if !promoted.is_empty() {
            debug!(restraint = %name, ?promoted, "restraint waiters promoted");
        }
        Ok(promoted)
    }

    pub fn snapshot(&self, name: &str) -> Result<RestraintRecord, RestraintError> {
        self.restraints
            .get(name)
            .map(|v| v.doc)
            .map_err(|e| map_restraint_err(name, e))
    }
}

// ------------------------------------------------------------------ barrier

/// Durable state of one barrier within one plan execution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierRecord {
    pub id: String,
    pub name: String,
    pub plan_execution_id: String,
    pub expected: usize,
    /// Node execution ids that arrived, including no-op arrivals from
    /// skipped branches.
    pub arrivals: Vec<String>,
    pub standing: bool,
}

impl BarrierRecord {
    fn key(plan_execution_id: &str, name: &str) -> String {
        format!("{plan_execution_id}/{name}")
    }
}

impl Record for BarrierRecord {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Result of one arrival.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArrivalOutcome {
    /// Not the last participant; the arriving node suspends.
    Waiting,
    /// This arrival flipped the barrier. `released` lists every earlier
    /// arrival now free to proceed (the flipper is not in the list).
    Standing { released: Vec<String> },
    /// The barrier was already standing, or this node already arrived.
    AlreadyStanding,
}

#[derive(Debug, Error, Diagnostic)]
pub enum BarrierError {
    #[error("barrier {name} not registered for plan execution {plan_execution_id}")]
    #[diagnostic(code(planwright::barrier::unknown))]
    Unknown {
        name: String,
        plan_execution_id: String,
    },

    #[error("barrier {name} deadlocked: {arrived} of {expected} participants arrived and none remain live")]
    #[diagnostic(
        code(planwright::barrier::deadlock),
        help("Every branch declaring a barrier must arrive, including skipped branches via a no-op arrival.")
    )]
    Deadlock {
        name: String,
        arrived: usize,
        expected: usize,
    },

    #[error(transparent)]
    #[diagnostic(code(planwright::barrier::store))]
    Store(StoreError),
}

fn map_barrier_err(name: &str, plan_execution_id: &str, err: StoreError) -> BarrierError {
    match err {
        StoreError::NotFound { .. } => BarrierError::Unknown {
            name: name.to_string(),
            plan_execution_id: plan_execution_id.to_string(),
        },
        other => BarrierError::Store(other),
    }
}

/// Arrival protocol over the barrier collection.
pub struct BarrierService {
    barriers: Arc<dyn Collection<BarrierRecord>>,
    cas_attempts: u32,
}

impl Default for BarrierService {
    fn default() -> Self {
        Self {
            barriers: Arc::new(InMemoryCollection::new()),
            cas_attempts: DEFAULT_GATE_CAS_ATTEMPTS,
        }
    }
}

impl BarrierService {
    #[must_use]
    pub fn new(barriers: Arc<dyn Collection<BarrierRecord>>) -> Self {
        Self {
            barriers,
            cas_attempts: DEFAULT_GATE_CAS_ATTEMPTS,
        }
    }

    #[must_use]
    pub fn with_cas_attempts(mut self, cas_attempts: u32) -> Self {
        self.cas_attempts = cas_attempts;
        self
    }

    /// Register a barrier for one plan execution, with the participant
    /// count fixed at plan-creation time. Idempotent.
    pub fn ensure(
        &self,
        plan_execution_id: &str,
        name: &str,
        expected: usize,
    ) -> Result<(), BarrierError> {
        match self.barriers.create(BarrierRecord {
            id: BarrierRecord::key(plan_execution_id, name),
            name: name.to_string(),
            plan_execution_id: plan_execution_id.to_string(),
            expected,
            arrivals: Vec::new(),
            standing: false,
        }) {
            Ok(_) | Err(StoreError::AlreadyExists { .. }) => Ok(()),
            Err(other) => Err(map_barrier_err(name, plan_execution_id, other)),
        }
    }

    /// Record one arrival. The arrival completing the expected count flips
    /// the barrier to standing exactly once; duplicate arrivals are no-ops.
    pub fn arrive(
        &self,
        plan_execution_id: &str,
        name: &str,
        node_execution_id: &str,
    ) -> Result<ArrivalOutcome, BarrierError> {
        let key = BarrierRecord::key(plan_execution_id, name);
        let (_, outcome) = mutate_returning(
            self.barriers.as_ref(),
            &key,
            self.cas_attempts,
            |record| {
                if record.arrivals.iter().any(|a| a == node_execution_id) || record.standing {
                    return Ok(ArrivalOutcome::AlreadyStanding);
                }
                record.arrivals.push(node_execution_id.to_string());
                if record.arrivals.len() >= record.expected {
                    record.standing = true;
                    let released = record
                        .arrivals
                        .iter()
                        .filter(|a| *a != node_execution_id)
                        .cloned()
                        .collect();
                    Ok(ArrivalOutcome::Standing { released })
                } else {
                    Ok(ArrivalOutcome::Waiting)
                }
            },
        )
        .map_err(|e| map_barrier_err(name, plan_execution_id, e))?;
        debug!(barrier = %name, node_execution_id, ?outcome, "barrier arrival");
        Ok(outcome)
    }

    /// Barriers of this plan execution that never flipped. Checked when a
    /// plan concludes with no live executions left; a non-empty result is a
    /// configuration bug surfaced as [`BarrierError::Deadlock`].
    pub fn unresolved(&self, plan_execution_id: &str) -> Vec<BarrierRecord> {
        self.barriers
            .find(&|b| b.plan_execution_id == plan_execution_id && !b.standing)
            .into_iter()
            .map(|v| v.doc)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn acquire_blocks_past_capacity_and_release_promotes_fifo() {
        let service = RestraintService::default();
        service.ensure("db-lock", 1).unwrap();
        assert_eq!(service.acquire("db-lock", "a").unwrap(), AcquireOutcome::Acquired);
        assert_eq!(service.acquire("db-lock", "b").unwrap(), AcquireOutcome::Blocked);
        assert_eq!(service.acquire("db-lock", "c").unwrap(), AcquireOutcome::Blocked);

        let promoted = service.release("db-lock", "a", &|_| true).unwrap();
        assert_eq!(promoted, vec!["b".to_string()]);
    }

    #[test]
    fn configured_attempt_budget_bounds_the_cas_loop() {
        let service = RestraintService::default().with_cas_attempts(0);
        service.ensure("db-lock", 1).unwrap();
        let err = service.acquire("db-lock", "a").unwrap_err();
        assert!(matches!(
            err,
            RestraintError::Contention { attempts: 0, .. }
        ));
    }

    #[test]
    fn release_skips_dead_waiters() {
        let service = RestraintService::default();
        service.ensure("db-lock", 1).unwrap();
        service.acquire("db-lock", "a").unwrap();
        service.acquire("db-lock", "b").unwrap();
        service.acquire("db-lock", "c").unwrap();

        let promoted = service.release("db-lock", "a", &|id| id != "b").unwrap();
        assert_eq!(promoted, vec!["c".to_string()]);
    }

    #[test]
    fn last_arrival_flips_exactly_once() {
        let service = BarrierService::default();
        service.ensure("pe-1", "merge", 3).unwrap();
        assert_eq!(service.arrive("pe-1", "merge", "a").unwrap(), ArrivalOutcome::Waiting);
        assert_eq!(service.arrive("pe-1", "merge", "b").unwrap(), ArrivalOutcome::Waiting);
        let outcome = service.arrive("pe-1", "merge", "c").unwrap();
        assert_eq!(
            outcome,
            ArrivalOutcome::Standing {
                released: vec!["a".to_string(), "b".to_string()]
            }
        );
        assert_eq!(
            service.arrive("pe-1", "merge", "c").unwrap(),
            ArrivalOutcome::AlreadyStanding
        );
        assert!(service.unresolved("pe-1").is_empty());
    }

    proptest! {
        /// Under any interleaving of acquires and releases from a pool of
        /// nodes, holders never exceed capacity and nobody is both holding
        /// and queued.
        #[test]
        fn holders_never_exceed_capacity(
            capacity in 1usize..4,
            ops in proptest::collection::vec((0u8..8, any::<bool>()), 1..40),
        ) {
            let service = RestraintService::default();
            service.ensure("gate", capacity).unwrap();
            for (node, is_acquire) in ops {
                let id = format!("n{node}");
                if is_acquire {
                    service.acquire("gate", &id).unwrap();
                } else {
                    service.release("gate", &id, &|_| true).unwrap();
                }
                let record = service.snapshot("gate").unwrap();
                prop_assert!(record.holders.len() <= capacity);
                for holder in &record.holders {
                    prop_assert!(
                        !record.waiters.iter().any(|w| &w.node_execution_id == holder)
                    );
                }
            }
        }
    }

    #[test]
    fn missing_arrival_is_reported_unresolved() {
        let service = BarrierService::default();
        service.ensure("pe-1", "merge", 2).unwrap();
        service.arrive("pe-1", "merge", "a").unwrap();
        let unresolved = service.unresolved("pe-1");
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].arrivals, vec!["a".to_string()]);
    }
}
