//! Step execution contract.
//!
//! Business-domain steps live outside the engine; this module defines the
//! seam they plug into. The engine only ever sees a step's declared type
//! tag, its opaque parameter blob, and the [`StepResponse`] it produces.
//!
//! # Error handling
//!
//! Steps report business failures through [`StepResponse`] with
//! [`Status::Failed`] and a [`FailureInfo`]; a returned [`StepError`] is an
//! engine-visible fault and concludes the node as [`Status::Errored`].

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::ambiance::Ambiance;
use crate::events::Event;
use crate::status::Status;
use crate::transport::TaskResponse;

/// Coarse classification of a failure, consulted by failure-scoped advisers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    Application,
    Timeout,
    Connectivity,
    Authorization,
    Verification,
    Unknown,
}

/// Why a node broke: kind + message + whether a retry can plausibly help.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub kind: FailureKind,
    pub message: String,
    pub retryable: bool,
}

impl FailureInfo {
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable,
        }
    }

    #[must_use]
    pub fn application(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Application, message, false)
    }
}

/// A value a step wants published under a (name, scope-group) pair.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutcomePublish {
    pub name: String,
    /// Ambiance level group to publish at, e.g. "STEP" or "STAGE".
    pub scope_group: String,
    pub value: Value,
}

/// What a step produced: a terminal status, optional failure detail, and
/// outcomes to publish.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepResponse {
    pub status: Status,
    #[serde(default)]
    pub failure_info: Option<FailureInfo>,
    #[serde(default)]
    pub outcomes: Vec<OutcomePublish>,
}

impl StepResponse {
    #[must_use]
    pub fn succeeded() -> Self {
        Self {
            status: Status::Succeeded,
            failure_info: None,
            outcomes: Vec::new(),
        }
    }

    #[must_use]
    pub fn failed(failure_info: FailureInfo) -> Self {
        Self {
            status: Status::Failed,
            failure_info: Some(failure_info),
            outcomes: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_outcome(
        mut self,
        name: impl Into<String>,
        scope_group: impl Into<String>,
        value: Value,
    ) -> Self {
        self.outcomes.push(OutcomePublish {
            name: name.into(),
            scope_group: scope_group.into(),
            value,
        });
        self
    }
}

/// Decision after a keyed task response arrives.
///
/// `DispatchNext` is the TaskChain round-advancer: the engine publishes a
/// fresh unit of work carrying the given parameters under the same logical
/// node.
#[derive(Clone, Debug)]
pub enum TaskVerdict {
    Conclude(StepResponse),
    DispatchNext(Value),
}

/// Execution context handed to steps, mirroring the engine's view of the
/// node being run.
#[derive(Clone, Debug)]
pub struct StepContext {
    pub node_id: String,
    pub node_execution_id: String,
    /// Channel for emitting events to the engine's event bus.
    pub event_sender: flume::Sender<Event>,
}

impl StepContext {
    /// Emit a step-scoped diagnostic event. Errors mean the bus is gone;
    /// execution proceeds regardless.
    pub fn emit(
        &self,
        scope: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<(), StepError> {
        self.event_sender
            .send(Event::diagnostic(scope, message))
            .map_err(|_| StepError::EventBusUnavailable)
    }
}

/// Fatal step faults. Business failures belong in [`StepResponse`] instead.
#[derive(Debug, Error, Diagnostic)]
pub enum StepError {
    #[error("missing expected input: {what}")]
    #[diagnostic(
        code(planwright::step::missing_input),
        help("Check that an earlier step published the required sweeping output.")
    )]
    MissingInput { what: &'static str },

    #[error("step fault: {0}")]
    #[diagnostic(code(planwright::step::fault))]
    Fault(String),

    #[error(transparent)]
    #[diagnostic(code(planwright::step::serde_json))]
    Serde(#[from] serde_json::Error),

    #[error("failed to emit event: event bus unavailable")]
    #[diagnostic(code(planwright::step::event_bus_unavailable))]
    EventBusUnavailable,
}

/// A unit of business logic the engine can drive.
///
/// `run` is the Sync-mode path; `on_task_response` is consulted whenever a
/// keyed remote response arrives for a Task or TaskChain suspension. The
/// default conclusion folds the remote outcome straight into the node's
/// completion.
#[async_trait]
pub trait Step: Send + Sync {
    async fn run(
        &self,
        ambiance: &Ambiance,
        parameters: &Value,
        ctx: StepContext,
    ) -> Result<StepResponse, StepError>;

    async fn on_task_response(
        &self,
        _ambiance: &Ambiance,
        _parameters: &Value,
        response: &TaskResponse,
    ) -> Result<TaskVerdict, StepError> {
        Ok(TaskVerdict::Conclude(response.to_step_response()))
    }
}

/// Immutable step-type registry, built once at startup from explicit module
/// wiring and passed by reference into the engine.
#[derive(Clone, Default)]
pub struct StepRegistry {
    steps: FxHashMap<String, Arc<dyn Step>>,
}

impl StepRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn register(mut self, step_type: impl Into<String>, step: impl Step + 'static) -> Self {
        self.steps.insert(step_type.into(), Arc::new(step));
        self
    }

    #[must_use]
    pub fn obtain(&self, step_type: &str) -> Option<Arc<dyn Step>> {
        self.steps.get(step_type).cloned()
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRegistry")
            .field("step_types", &self.steps.keys().collect::<Vec<_>>())
            .finish()
    }
}
