//! Per-invocation execution record for a plan node.
//!
//! Node executions form a tree through `parent_id` references — an arena of
//! records indexed by id, never object pointers, so parent/child links can
//! cross process boundaries and survive restarts. A node that retries gets a
//! fresh record linked back through `retry_of`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ambiance::Level;
use crate::facilitators::ExecutionMode;
use crate::interrupts::InterruptType;
use crate::status::Status;
use crate::steps::FailureInfo;
use crate::store::Record;

/// Record of *how* a node execution is currently suspended. The ordered
/// history is append-only; the last entry describes the live suspension.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutableResponse {
    /// Awaiting a keyed response from a remote worker.
    Task { correlation_id: String, round: u32 },
    /// Awaiting the next round of a multi-round remote protocol.
    TaskChain { correlation_id: String, round: u32 },
    /// Handed off to an external system; resumption is externally driven.
    Async { correlation_id: String },
    /// Suspended until the single spawned child finalizes.
    Child { child_execution_id: String },
    /// Suspended until all spawned children finalize.
    Children {
        child_execution_ids: Vec<String>,
        #[serde(default)]
        completed: Vec<String>,
    },
    /// Could not acquire a resource restraint; queued as a waiter.
    RestraintBlocked { restraint_name: String },
    /// Arrived at a barrier that is not yet standing.
    BarrierWaiting { barrier_name: String },
}

impl ExecutableResponse {
    /// Correlation key for suspensions resumed by keyed transport messages.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            ExecutableResponse::Task { correlation_id, .. }
            | ExecutableResponse::TaskChain { correlation_id, .. }
            | ExecutableResponse::Async { correlation_id } => Some(correlation_id),
            _ => None,
        }
    }
}

/// Applied-interrupt record; the interrupt id is the idempotency key for
/// replay detection under at-least-once delivery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptEffect {
    pub interrupt_id: String,
    pub interrupt_type: InterruptType,
    pub applied_at: DateTime<Utc>,
}

/// One invocation of a plan node inside a plan execution.
///
/// Mutated by the engine and by interrupt handlers under version-guarded
/// conditional updates; immutable once the status is positively terminal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    pub id: String,
    pub plan_execution_id: String,
    /// Plan node this record executes.
    pub node_id: String,
    /// Parent node-execution reference; `None` for the root.
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Earlier execution this one retries, if any.
    #[serde(default)]
    pub retry_of: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub mode: Option<ExecutionMode>,
    pub status: Status,
    #[serde(default)]
    pub resolved_parameters: Value,
    pub start_ts: DateTime<Utc>,
    #[serde(default)]
    pub end_ts: Option<DateTime<Utc>>,
    /// Ordered suspension history; last entry is the live suspension.
    #[serde(default)]
    pub executable_responses: Vec<ExecutableResponse>,
    /// Correlation ids already consumed, for at-least-once dedup.
    #[serde(default)]
    pub processed_correlations: Vec<String>,
    /// Names of outcomes this execution published.
    #[serde(default)]
    pub outcome_refs: Vec<String>,
    #[serde(default)]
    pub failure_info: Option<FailureInfo>,
    /// Ordered interrupt-effect history.
    #[serde(default)]
    pub interrupt_effects: Vec<InterruptEffect>,
    /// Ambiance levels at creation, outermost first; the last level is this
    /// execution itself.
    #[serde(default)]
    pub levels: Vec<Level>,
}

impl NodeExecution {
    /// Fresh queued execution record.
    #[must_use]
    pub fn queued(
        id: impl Into<String>,
        plan_execution_id: impl Into<String>,
        node_id: impl Into<String>,
        parent_id: Option<String>,
        levels: Vec<Level>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            plan_execution_id: plan_execution_id.into(),
            node_id: node_id.into(),
            parent_id,
            retry_of: None,
            retry_count: 0,
            mode: None,
            status: Status::Queued,
            resolved_parameters: Value::Null,
            start_ts: now,
            end_ts: None,
            executable_responses: Vec::new(),
            processed_correlations: Vec::new(),
            outcome_refs: Vec::new(),
            failure_info: None,
            interrupt_effects: Vec::new(),
            levels,
        }
    }

    /// Live suspension record, if the node is currently suspended.
    #[must_use]
    pub fn last_executable_response(&self) -> Option<&ExecutableResponse> {
        self.executable_responses.last()
    }

    /// True when this execution awaits the given correlation id and has not
    /// consumed it yet.
    #[must_use]
    pub fn awaits_correlation(&self, correlation_id: &str) -> bool {
        !self
            .processed_correlations
            .iter()
            .any(|c| c == correlation_id)
            && self
                .executable_responses
                .iter()
                .any(|r| r.correlation_id() == Some(correlation_id))
    }

    /// True when the node is suspended on a remote worker and interrupt
    /// notifications should be published over the transport.
    #[must_use]
    pub fn is_remotely_suspended(&self) -> bool {
        self.status == Status::TaskWaiting
            && matches!(
                self.last_executable_response(),
                Some(ExecutableResponse::Task { .. } | ExecutableResponse::TaskChain { .. })
            )
    }
}

impl Record for NodeExecution {
    fn id(&self) -> &str {
        &self.id
    }
}
