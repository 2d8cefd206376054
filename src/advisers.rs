//! Post-event control-flow advice.
//!
//! After a node reaches an event (completion, failure, expiry), the engine
//! walks the node's declared adviser list in order and asks each whether it
//! applies. The first adviser whose predicate matches produces the single
//! [`Advice`] that is acted on; advices are never combined.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub use crate::plan::AdviserConfig;

use crate::status::Status;
use crate::steps::{FailureInfo, FailureKind};

/// Type tags for the built-in advisers.
pub const ON_SUCCESS_ADVISER: &str = "ON_SUCCESS";
pub const ON_FAIL_ADVISER: &str = "ON_FAIL";
pub const RETRY_ADVISER: &str = "RETRY";
pub const IGNORE_ADVISER: &str = "IGNORE";
pub const MANUAL_INTERVENTION_ADVISER: &str = "MANUAL_INTERVENTION";

/// Snapshot of the node event being advised on.
#[derive(Clone, Debug)]
pub struct AdvisingEvent {
    pub node_execution_id: String,
    pub node_id: String,
    pub status: Status,
    pub failure_info: Option<FailureInfo>,
    /// Retries already consumed by this logical node.
    pub retry_count: u32,
    pub retry_budget: u32,
    /// The node's declared successor, if any.
    pub next_node_id: Option<String>,
}

/// What to do next. Exactly one advice is applied per event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Advice {
    /// Proceed to a node (or, with no successor, let the branch conclude),
    /// optionally overriding the terminal status first.
    NextStep {
        next_node_id: Option<String>,
        to_status: Option<Status>,
    },
    /// Re-run the same logical node as a fresh execution.
    Retry,
    /// Freeze the node and the whole plan execution pending an operator
    /// decision. Deliberate indefinite suspension, not an error.
    InterventionWait,
    /// Conclude the branch with the status the node already holds.
    End,
}

#[derive(Debug, Error, Diagnostic)]
pub enum AdviserError {
    #[error("no adviser registered for type {adviser_type}")]
    #[diagnostic(
        code(planwright::adviser::unknown_type),
        help("Register the adviser type before loading plans that reference it.")
    )]
    UnknownType { adviser_type: String },

    #[error("adviser {adviser_type} rejected its configuration: {detail}")]
    #[diagnostic(code(planwright::adviser::invalid_config))]
    InvalidConfig {
        adviser_type: String,
        detail: String,
    },
}

/// One adviser variant: a match predicate plus the advice it produces.
pub trait Adviser: Send + Sync {
    fn can_advise(&self, event: &AdvisingEvent, parameters: &Value) -> bool;

    fn advise(&self, event: &AdvisingEvent, parameters: &Value) -> Result<Advice, AdviserError>;
}

/// Optional failure-kind filter shared by the failure-scoped advisers.
/// An absent or empty list matches every failure kind.
#[derive(Debug, Default, Deserialize)]
struct FailureScope {
    #[serde(default)]
    failure_kinds: Vec<FailureKind>,
}

impl FailureScope {
    fn parse(parameters: &Value) -> Self {
        if parameters.is_null() {
            return Self::default();
        }
        serde_json::from_value(parameters.clone()).unwrap_or_default()
    }

    fn matches(&self, failure_info: Option<&FailureInfo>) -> bool {
        if self.failure_kinds.is_empty() {
            return true;
        }
        failure_info.is_some_and(|info| self.failure_kinds.contains(&info.kind))
    }
}

/// Advances to the declared successor after a positive conclusion.
pub struct OnSuccessAdviser;

impl Adviser for OnSuccessAdviser {
    fn can_advise(&self, event: &AdvisingEvent, _parameters: &Value) -> bool {
        event.status.is_positive()
    }

    fn advise(&self, event: &AdvisingEvent, _parameters: &Value) -> Result<Advice, AdviserError> {
        Ok(Advice::NextStep {
            next_node_id: event.next_node_id.clone(),
            to_status: None,
        })
    }
}

/// Routes a broke node to a configured handler node (parameter
/// `next_node_id`), scoped by an optional failure-kind set.
pub struct OnFailAdviser;

impl Adviser for OnFailAdviser {
    fn can_advise(&self, event: &AdvisingEvent, parameters: &Value) -> bool {
        event.status.is_broke()
            && FailureScope::parse(parameters).matches(event.failure_info.as_ref())
            && parameters.get("next_node_id").is_some()
    }

    fn advise(&self, event: &AdvisingEvent, parameters: &Value) -> Result<Advice, AdviserError> {
        let next = parameters
            .get("next_node_id")
            .and_then(Value::as_str)
            .ok_or_else(|| AdviserError::InvalidConfig {
                adviser_type: ON_FAIL_ADVISER.to_string(),
                detail: format!(
                    "`next_node_id` must be a string (advising {})",
                    event.node_id
                ),
            })?;
        Ok(Advice::NextStep {
            next_node_id: Some(next.to_string()),
            to_status: None,
        })
    }
}

/// Re-runs a retryable node while budget remains.
pub struct RetryAdviser;

impl Adviser for RetryAdviser {
    fn can_advise(&self, event: &AdvisingEvent, parameters: &Value) -> bool {
        event.status.is_retryable()
            && event.retry_count < event.retry_budget
            && FailureScope::parse(parameters).matches(event.failure_info.as_ref())
    }

    fn advise(&self, _event: &AdvisingEvent, _parameters: &Value) -> Result<Advice, AdviserError> {
        Ok(Advice::Retry)
    }
}

/// Continues past a broke node: overrides the terminal status to
/// [`Status::IgnoreFailed`] and advances to the declared successor.
pub struct IgnoreAdviser;

impl Adviser for IgnoreAdviser {
    fn can_advise(&self, event: &AdvisingEvent, parameters: &Value) -> bool {
        event.status.is_broke()
            && FailureScope::parse(parameters).matches(event.failure_info.as_ref())
    }

    fn advise(&self, event: &AdvisingEvent, _parameters: &Value) -> Result<Advice, AdviserError> {
        Ok(Advice::NextStep {
            next_node_id: event.next_node_id.clone(),
            to_status: Some(Status::IgnoreFailed),
        })
    }
}

/// Parks a broke node for a human decision.
pub struct ManualInterventionAdviser;

impl Adviser for ManualInterventionAdviser {
    fn can_advise(&self, event: &AdvisingEvent, parameters: &Value) -> bool {
        event.status.is_broke()
            && FailureScope::parse(parameters).matches(event.failure_info.as_ref())
    }

    fn advise(&self, _event: &AdvisingEvent, _parameters: &Value) -> Result<Advice, AdviserError> {
        Ok(Advice::InterventionWait)
    }
}

/// Immutable type-tag → adviser mapping, built once at startup.
#[derive(Clone)]
pub struct AdviserRegistry {
    advisers: FxHashMap<String, Arc<dyn Adviser>>,
}

impl AdviserRegistry {
    /// Registry pre-wired with the built-in adviser variants.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut advisers: FxHashMap<String, Arc<dyn Adviser>> = FxHashMap::default();
        advisers.insert(ON_SUCCESS_ADVISER.to_string(), Arc::new(OnSuccessAdviser));
        advisers.insert(ON_FAIL_ADVISER.to_string(), Arc::new(OnFailAdviser));
        advisers.insert(RETRY_ADVISER.to_string(), Arc::new(RetryAdviser));
        advisers.insert(IGNORE_ADVISER.to_string(), Arc::new(IgnoreAdviser));
        advisers.insert(
            MANUAL_INTERVENTION_ADVISER.to_string(),
            Arc::new(ManualInterventionAdviser),
        );
        Self { advisers }
    }

    #[must_use]
    pub fn register(
        mut self,
        adviser_type: impl Into<String>,
        adviser: impl Adviser + 'static,
    ) -> Self {
        self.advisers.insert(adviser_type.into(), Arc::new(adviser));
        self
    }

    /// Walk `configs` in declared order; the first adviser whose predicate
    /// matches wins. `None` means no adviser applied and the engine falls
    /// back to its default conclusion.
    pub fn first_match(
        &self,
        configs: &[AdviserConfig],
        event: &AdvisingEvent,
    ) -> Result<Option<Advice>, AdviserError> {
        for config in configs {
            let adviser =
                self.advisers
                    .get(&config.adviser_type)
                    .ok_or_else(|| AdviserError::UnknownType {
                        adviser_type: config.adviser_type.clone(),
                    })?;
            if adviser.can_advise(event, &config.parameters) {
                return adviser.advise(event, &config.parameters).map(Some);
            }
        }
        Ok(None)
    }

    pub fn verify(&self, adviser_type: &str) -> Result<(), AdviserError> {
        if self.advisers.contains_key(adviser_type) {
            Ok(())
        } else {
            Err(AdviserError::UnknownType {
                adviser_type: adviser_type.to_string(),
            })
        }
    }
}

impl fmt::Debug for AdviserRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdviserRegistry")
            .field("adviser_types", &self.advisers.keys().collect::<Vec<_>>())
            .finish()
    }
}
