//! Execution statuses and the legal-transition table.
//!
//! This module is the correctness core of the engine: every status write to a
//! [`NodeExecution`](crate::executions::NodeExecution) or
//! [`PlanExecution`](crate::executions::PlanExecution) is validated against
//! [`Status::allowed_sources`] before it is applied. The engine thread, the
//! timeout tracker, and interrupt handlers can all race to finalize the same
//! node; a write whose observed source status is not a legal predecessor of
//! the target must be rejected, never coerced.
//!
//! Statuses are partitioned into *in-flight*, *terminal-positive*,
//! *terminal-negative*, and other terminal groups, with derived sets
//! (`resumable`, `retryable`, `flowing`, `finalizable`, `broke`) used
//! throughout the engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of execution statuses.
///
/// # Persistence
///
/// `Status` serializes as SCREAMING_SNAKE_CASE strings so persisted records
/// and wire envelopes stay readable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Created but not yet picked up by a worker.
    Queued,
    /// Actively executing on an engine worker.
    Running,
    /// Suspended on a timer.
    TimedWaiting,
    /// Suspended awaiting an external (async or child) completion.
    AsyncWaiting,
    /// Suspended awaiting a keyed response from a remote worker.
    TaskWaiting,
    /// Abort/expire in progress; forward progress winding down.
    Discontinuing,
    /// Pause requested; waiting for the node to reach a parkable point.
    Pausing,
    /// Parked by a pause interrupt; resumable.
    Paused,
    /// Frozen pending a manual operator decision. Deliberate indefinite
    /// suspension, not an error.
    InterventionWaiting,
    /// Terminal: completed successfully.
    Succeeded,
    /// Terminal: branch was skipped; counts as positive.
    Skipped,
    /// Terminal: step reported a business failure.
    Failed,
    /// Terminal: engine-internal error while executing the node.
    Errored,
    /// Terminal: concluded by an abort interrupt.
    Aborted,
    /// Terminal: concluded by a timeout expiry.
    Expired,
    /// Terminal: a failure the user chose to ignore; counts as positive for
    /// aggregation and is neither resumable nor retryable.
    IgnoreFailed,
}

/// Statuses a node may be resumed from by an external wake-up.
pub const RESUMABLE: &[Status] = &[
    Status::Queued,
    Status::Running,
    Status::AsyncWaiting,
    Status::TaskWaiting,
    Status::TimedWaiting,
];

/// Statuses a retry (adviser or interrupt) may act on.
pub const RETRYABLE: &[Status] = &[Status::Failed, Status::Errored, Status::Expired];

/// Statuses representing active forward progress. ACTIVE-dimension timeouts
/// only count down while the owning node is flowing.
pub const FLOWING: &[Status] = &[
    Status::Queued,
    Status::Running,
    Status::AsyncWaiting,
    Status::TaskWaiting,
    Status::TimedWaiting,
    Status::Discontinuing,
];

/// Broke statuses considered by failure-scoped advisers.
pub const BROKE: &[Status] = &[Status::Failed, Status::Errored, Status::Expired];

/// Statuses with no further transitions once reached.
pub const TERMINAL: &[Status] = &[
    Status::Succeeded,
    Status::Skipped,
    Status::Failed,
    Status::Errored,
    Status::Aborted,
    Status::Expired,
    Status::IgnoreFailed,
];

impl Status {
    /// Legal predecessor statuses for a guarded write to `self`.
    ///
    /// An empty slice means the status is only ever set at record creation,
    /// never via transition.
    #[must_use]
    pub fn allowed_sources(self) -> &'static [Status] {
        use Status::*;
        match self {
            Queued => &[Paused],
            Running => &[Queued, AsyncWaiting, TaskWaiting, TimedWaiting, Paused],
            AsyncWaiting | TaskWaiting | TimedWaiting => &[Running],
            Discontinuing => &[
                Queued,
                Running,
                AsyncWaiting,
                TaskWaiting,
                TimedWaiting,
                Pausing,
                Paused,
                InterventionWaiting,
            ],
            Pausing => &[Queued, Running, AsyncWaiting, TaskWaiting, TimedWaiting],
            Paused => &[Pausing, Queued],
            InterventionWaiting => &[Running, Failed, Errored, Expired],
            Succeeded | Failed | Errored => &[Running, Queued, Discontinuing],
            Skipped => &[Running, Queued, Discontinuing, Paused],
            Aborted => &[
                Discontinuing,
                Queued,
                Running,
                AsyncWaiting,
                TaskWaiting,
                TimedWaiting,
                Paused,
                Pausing,
                InterventionWaiting,
            ],
            Expired => &[
                Discontinuing,
                Running,
                AsyncWaiting,
                TaskWaiting,
                TimedWaiting,
                InterventionWaiting,
            ],
            IgnoreFailed => &[Failed, Errored, Expired],
        }
    }

    /// True when `self` may legally be entered from `from`.
    #[must_use]
    pub fn reachable_from(self, from: Status) -> bool {
        self.allowed_sources().contains(&from)
    }

    #[must_use]
    pub fn is_resumable(self) -> bool {
        RESUMABLE.contains(&self)
    }

    #[must_use]
    pub fn is_retryable(self) -> bool {
        RETRYABLE.contains(&self)
    }

    #[must_use]
    pub fn is_flowing(self) -> bool {
        FLOWING.contains(&self)
    }

    #[must_use]
    pub fn is_broke(self) -> bool {
        BROKE.contains(&self)
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        TERMINAL.contains(&self)
    }

    /// Positive conclusions: the branch is done and nothing went unhandled.
    #[must_use]
    pub fn is_positive(self) -> bool {
        matches!(self, Status::Succeeded | Status::Skipped | Status::IgnoreFailed)
    }

    /// Positively-terminal records are immutable; any further guarded write
    /// is a programming bug, not a race.
    #[must_use]
    pub fn is_final(self) -> bool {
        matches!(
            self,
            Status::Succeeded | Status::Skipped | Status::IgnoreFailed | Status::Aborted
        )
    }

    /// True when a terminal status may still be set from `self`.
    #[must_use]
    pub fn is_finalizable(self) -> bool {
        !self.is_final()
    }

    /// Severity rank used by [`worst`]. Higher means more severe. Positive
    /// conclusions rank lowest so any negative child dominates a Children
    /// aggregate.
    #[must_use]
    pub fn severity(self) -> u8 {
        use Status::*;
        match self {
            Aborted => 12,
            Expired => 11,
            Errored => 10,
            Failed => 9,
            InterventionWaiting => 8,
            Discontinuing => 7,
            Pausing => 6,
            Paused => 5,
            TaskWaiting | AsyncWaiting | TimedWaiting => 4,
            Running => 3,
            Queued => 2,
            IgnoreFailed => 1,
            Succeeded | Skipped => 0,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Queued => "QUEUED",
            Status::Running => "RUNNING",
            Status::TimedWaiting => "TIMED_WAITING",
            Status::AsyncWaiting => "ASYNC_WAITING",
            Status::TaskWaiting => "TASK_WAITING",
            Status::Discontinuing => "DISCONTINUING",
            Status::Pausing => "PAUSING",
            Status::Paused => "PAUSED",
            Status::InterventionWaiting => "INTERVENTION_WAITING",
            Status::Succeeded => "SUCCEEDED",
            Status::Skipped => "SKIPPED",
            Status::Failed => "FAILED",
            Status::Errored => "ERRORED",
            Status::Aborted => "ABORTED",
            Status::Expired => "EXPIRED",
            Status::IgnoreFailed => "IGNORE_FAILED",
        };
        f.write_str(s)
    }
}

/// Every status, in declaration order. Used by exhaustive transition tests.
pub const ALL_STATUSES: &[Status] = &[
    Status::Queued,
    Status::Running,
    Status::TimedWaiting,
    Status::AsyncWaiting,
    Status::TaskWaiting,
    Status::Discontinuing,
    Status::Pausing,
    Status::Paused,
    Status::InterventionWaiting,
    Status::Succeeded,
    Status::Skipped,
    Status::Failed,
    Status::Errored,
    Status::Aborted,
    Status::Expired,
    Status::IgnoreFailed,
];

/// Most severe status in `statuses`, or `Succeeded` for an empty set.
///
/// Commutative over arrival order: severity ties (the waiting statuses
/// share a rank) break on a fixed variant ordinal, so Children aggregation
/// does not depend on which sibling finished first.
#[must_use]
pub fn worst<I>(statuses: I) -> Status
where
    I: IntoIterator<Item = Status>,
{
    statuses
        .into_iter()
        .max_by_key(|s| (s.severity(), *s as u8))
        .unwrap_or(Status::Succeeded)
}
