use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::interrupts::{InterruptState, InterruptType};
use crate::plan::TimeoutDimension;
use crate::status::Status;

/// Engine-emitted progress events, broadcast to every configured sink.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum Event {
    NodeStatus(NodeStatusEvent),
    PlanStatus(PlanStatusEvent),
    Interrupt(InterruptLifecycleEvent),
    TaskDispatched(TaskDispatchedEvent),
    TimeoutFired(TimeoutFiredEvent),
    Diagnostic(DiagnosticEvent),
}

impl Event {
    pub fn node_status(
        plan_execution_id: impl Into<String>,
        node_execution_id: impl Into<String>,
        node_id: impl Into<String>,
        status: Status,
    ) -> Self {
        Event::NodeStatus(NodeStatusEvent {
            plan_execution_id: plan_execution_id.into(),
            node_execution_id: node_execution_id.into(),
            node_id: node_id.into(),
            status,
            at: Utc::now(),
        })
    }

    pub fn plan_status(plan_execution_id: impl Into<String>, status: Status) -> Self {
        Event::PlanStatus(PlanStatusEvent {
            plan_execution_id: plan_execution_id.into(),
            status,
            at: Utc::now(),
        })
    }

    pub fn interrupt(
        interrupt_id: impl Into<String>,
        interrupt_type: InterruptType,
        state: InterruptState,
    ) -> Self {
        Event::Interrupt(InterruptLifecycleEvent {
            interrupt_id: interrupt_id.into(),
            interrupt_type,
            state,
            at: Utc::now(),
        })
    }

    pub fn task_dispatched(
        node_execution_id: impl Into<String>,
        correlation_id: impl Into<String>,
        round: u32,
    ) -> Self {
        Event::TaskDispatched(TaskDispatchedEvent {
            node_execution_id: node_execution_id.into(),
            correlation_id: correlation_id.into(),
            round,
            at: Utc::now(),
        })
    }

    pub fn timeout_fired(
        node_execution_id: impl Into<String>,
        dimension: TimeoutDimension,
    ) -> Self {
        Event::TimeoutFired(TimeoutFiredEvent {
            node_execution_id: node_execution_id.into(),
            dimension,
            at: Utc::now(),
        })
    }

    pub fn diagnostic(scope: impl Into<String>, message: impl Into<String>) -> Self {
        Event::Diagnostic(DiagnosticEvent {
            scope: scope.into(),
            message: message.into(),
        })
    }

    /// Short label identifying the event family, used by sinks and filters.
    pub fn scope_label(&self) -> &str {
        match self {
            Event::NodeStatus(_) => "node",
            Event::PlanStatus(_) => "plan",
            Event::Interrupt(_) => "interrupt",
            Event::TaskDispatched(_) => "task",
            Event::TimeoutFired(_) => "timeout",
            Event::Diagnostic(diag) => &diag.scope,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::NodeStatus(e) => write!(
                f,
                "node {} ({}) -> {}",
                e.node_id, e.node_execution_id, e.status
            ),
            Event::PlanStatus(e) => write!(f, "plan {} -> {}", e.plan_execution_id, e.status),
            Event::Interrupt(e) => write!(
                f,
                "interrupt {} ({:?}) -> {:?}",
                e.interrupt_id, e.interrupt_type, e.state
            ),
            Event::TaskDispatched(e) => write!(
                f,
                "task dispatched for {} round {} (correlation {})",
                e.node_execution_id, e.round, e.correlation_id
            ),
            Event::TimeoutFired(e) => write!(
                f,
                "timeout ({:?}) fired for {}",
                e.dimension, e.node_execution_id
            ),
            Event::Diagnostic(e) => write!(f, "[{}] {}", e.scope, e.message),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NodeStatusEvent {
    pub plan_execution_id: String,
    pub node_execution_id: String,
    pub node_id: String,
    pub status: Status,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PlanStatusEvent {
    pub plan_execution_id: String,
    pub status: Status,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct InterruptLifecycleEvent {
    pub interrupt_id: String,
    pub interrupt_type: InterruptType,
    pub state: InterruptState,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TaskDispatchedEvent {
    pub node_execution_id: String,
    pub correlation_id: String,
    pub round: u32,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TimeoutFiredEvent {
    pub node_execution_id: String,
    pub dimension: TimeoutDimension,
    pub at: DateTime<Utc>,
}

/// Freeform step- or engine-scoped log line.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiagnosticEvent {
    pub scope: String,
    pub message: String,
}
