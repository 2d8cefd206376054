//! Lazy pull-based timeout tracking.
//!
//! Each [`TimeoutInstance`] carries a next-wake time; a periodic
//! [`TimeoutTracker::tick`] iterates the due instances and fires them, which
//! the engine turns into EXPIRE interrupts against the owning node. ACTIVE
//! timeouts only consume budget while the node is flowing: pausing persists
//! the remaining budget and parks the wake time, resuming recomputes the
//! wake time from the persisted remainder. Budgets are never reconstructed
//! from wall-clock deltas, so they survive a process restart.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::plan::{TimeoutConfig, TimeoutDimension};
use crate::store::{mutate_with_retry, Collection, InMemoryCollection, Record, StoreError};
use crate::utils::ids;

const DEFAULT_TIMEOUT_CAS_ATTEMPTS: u32 = 5;

/// Durable state of one armed timeout.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutInstance {
    pub id: String,
    pub node_execution_id: String,
    pub dimension: TimeoutDimension,
    /// Budget still unconsumed, persisted across pauses and restarts.
    pub remaining_ms: u64,
    /// When the countdown last started or resumed.
    pub resumed_at: DateTime<Utc>,
    /// `None` while paused: the tracker never wakes for this instance.
    pub next_wake: Option<DateTime<Utc>>,
}

impl Record for TimeoutInstance {
    fn id(&self) -> &str {
        &self.id
    }
}

/// A timeout whose deadline passed during a tick.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FiredTimeout {
    pub timeout_id: String,
    pub node_execution_id: String,
    pub dimension: TimeoutDimension,
}

#[derive(Debug, Error, Diagnostic)]
pub enum TimeoutError {
    #[error(transparent)]
    #[diagnostic(code(planwright::timeouts::store))]
    Store(#[from] StoreError),
}

/// Registration and polling over the timeout collection.
pub struct TimeoutTracker {
    timeouts: Arc<dyn Collection<TimeoutInstance>>,
    cas_attempts: u32,
}

impl Default for TimeoutTracker {
    fn default() -> Self {
        Self {
            timeouts: Arc::new(InMemoryCollection::new()),
            cas_attempts: DEFAULT_TIMEOUT_CAS_ATTEMPTS,
        }
    }
}

impl TimeoutTracker {
    #[must_use]
    pub fn new(timeouts: Arc<dyn Collection<TimeoutInstance>>) -> Self {
        Self {
            timeouts,
            cas_attempts: DEFAULT_TIMEOUT_CAS_ATTEMPTS,
        }
    }

    #[must_use]
    pub fn with_cas_attempts(mut self, cas_attempts: u32) -> Self {
        self.cas_attempts = cas_attempts;
        self
    }

    /// Arm a timeout for a node execution starting now.
    pub fn register(
        &self,
        node_execution_id: &str,
        config: &TimeoutConfig,
        now: DateTime<Utc>,
    ) -> Result<String, TimeoutError> {
        let remaining_ms = config.budget.as_millis().min(u128::from(u64::MAX)) as u64;
        let instance = TimeoutInstance {
            id: ids::generate(),
            node_execution_id: node_execution_id.to_string(),
            dimension: config.dimension,
            remaining_ms,
            resumed_at: now,
            next_wake: Some(now + ChronoDuration::milliseconds(remaining_ms as i64)),
        };
        let id = instance.id.clone();
        self.timeouts.create(instance)?;
        debug!(node_execution_id, timeout_id = %id, ?config.dimension, "timeout armed");
        Ok(id)
    }

    /// Fire everything due at `now`. Fired instances are deleted; a timeout
    /// fires at most once.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<Vec<FiredTimeout>, TimeoutError> {
        let due = self
            .timeouts
            .find(&|t| t.next_wake.is_some_and(|wake| wake <= now));
        let mut fired = Vec::with_capacity(due.len());
        for instance in due {
            match self.timeouts.delete(&instance.doc.id) {
                Ok(()) => fired.push(FiredTimeout {
                    timeout_id: instance.doc.id,
                    node_execution_id: instance.doc.node_execution_id,
                    dimension: instance.doc.dimension,
                }),
                // Another tracker fired it first.
                Err(StoreError::NotFound { .. }) => {}
                Err(other) => return Err(other.into()),
            }
        }
        Ok(fired)
    }

    /// Park every ACTIVE timeout of a node: subtract the budget consumed
    /// since the last resume and stop waking. ABSOLUTE timeouts keep
    /// counting.
    pub fn pause(&self, node_execution_id: &str, now: DateTime<Utc>) -> Result<(), TimeoutError> {
        for instance in self.active_instances(node_execution_id) {
            mutate_with_retry(
                self.timeouts.as_ref(),
                &instance.id,
                self.cas_attempts,
                |t| {
                    if t.next_wake.is_none() {
                        return Ok(());
                    }
                    let elapsed_ms = (now - t.resumed_at).num_milliseconds().max(0) as u64;
                    t.remaining_ms = t.remaining_ms.saturating_sub(elapsed_ms);
                    t.next_wake = None;
                    Ok(())
                },
            )?;
            debug!(node_execution_id, timeout_id = %instance.id, "timeout paused");
        }
        Ok(())
    }

    /// Restart every parked ACTIVE timeout of a node from its persisted
    /// remainder.
    pub fn resume(&self, node_execution_id: &str, now: DateTime<Utc>) -> Result<(), TimeoutError> {
        for instance in self.active_instances(node_execution_id) {
            mutate_with_retry(
                self.timeouts.as_ref(),
                &instance.id,
                self.cas_attempts,
                |t| {
                    if t.next_wake.is_some() {
                        return Ok(());
                    }
                    t.resumed_at = now;
                    t.next_wake = Some(now + ChronoDuration::milliseconds(t.remaining_ms as i64));
                    Ok(())
                },
            )?;
            debug!(node_execution_id, timeout_id = %instance.id, "timeout resumed");
        }
        Ok(())
    }

    /// Drop every timeout of a finalized node.
    pub fn cancel(&self, node_execution_id: &str) -> Result<(), TimeoutError> {
        for instance in self
            .timeouts
            .find(&|t| t.node_execution_id == node_execution_id)
        {
            match self.timeouts.delete(&instance.doc.id) {
                Ok(()) | Err(StoreError::NotFound { .. }) => {}
                Err(other) => return Err(other.into()),
            }
        }
        Ok(())
    }

    pub fn instances_for(&self, node_execution_id: &str) -> Vec<TimeoutInstance> {
        self.timeouts
            .find(&|t| t.node_execution_id == node_execution_id)
            .into_iter()
            .map(|v| v.doc)
            .collect()
    }

    fn active_instances(&self, node_execution_id: &str) -> Vec<TimeoutInstance> {
        self.timeouts
            .find(&|t| {
                t.node_execution_id == node_execution_id
                    && t.dimension == TimeoutDimension::Active
            })
            .into_iter()
            .map(|v| v.doc)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + seconds, 0).unwrap()
    }

    #[test]
    fn absolute_timeout_fires_once_at_deadline() {
        let tracker = TimeoutTracker::default();
        let config = TimeoutConfig {
            dimension: TimeoutDimension::Absolute,
            budget: Duration::from_secs(60),
        };
        tracker.register("ne-1", &config, at(0)).unwrap();

        assert!(tracker.tick(at(59)).unwrap().is_empty());
        let fired = tracker.tick(at(60)).unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].node_execution_id, "ne-1");
        assert!(tracker.tick(at(61)).unwrap().is_empty());
    }

    #[test]
    fn active_timeout_excludes_paused_interval() {
        let tracker = TimeoutTracker::default();
        let config = TimeoutConfig {
            dimension: TimeoutDimension::Active,
            budget: Duration::from_secs(300),
        };
        tracker.register("ne-1", &config, at(0)).unwrap();

        // 120s of activity, then parked for 600s, then resumed.
        tracker.pause("ne-1", at(120)).unwrap();
        assert!(tracker.tick(at(500)).unwrap().is_empty());
        tracker.resume("ne-1", at(720)).unwrap();

        // 180s of budget left: fires at 720 + 180 = 900.
        assert!(tracker.tick(at(899)).unwrap().is_empty());
        let fired = tracker.tick(at(900)).unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].dimension, TimeoutDimension::Active);
    }

    #[test]
    fn cancel_disarms_everything_for_the_node() {
        let tracker = TimeoutTracker::default();
        let config = TimeoutConfig {
            dimension: TimeoutDimension::Absolute,
            budget: Duration::from_secs(10),
        };
        tracker.register("ne-1", &config, at(0)).unwrap();
        tracker.cancel("ne-1").unwrap();
        assert!(tracker.tick(at(1000)).unwrap().is_empty());
    }
}
