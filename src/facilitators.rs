//! Execution-mode selection.
//!
//! A facilitator examines a node's declared configuration and the current
//! [`Ambiance`] and decides how the node runs: inline, suspended on a remote
//! task, fanned out into children, and so on — or not at all. Facilitator
//! types are a small closed set resolved through an immutable registry built
//! once at startup; plans reference them by type tag.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::ambiance::Ambiance;
use crate::plan::FacilitatorConfig;

/// Type tags for the built-in facilitators.
pub const SYNC_FACILITATOR: &str = "SYNC";
pub const ASYNC_FACILITATOR: &str = "ASYNC";
pub const TASK_FACILITATOR: &str = "TASK";
pub const TASK_CHAIN_FACILITATOR: &str = "TASK_CHAIN";
pub const CHILD_FACILITATOR: &str = "CHILD";
pub const CHILDREN_FACILITATOR: &str = "CHILDREN";

/// How a node executes once facilitation picks it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    /// Run the step inline and conclude immediately.
    Sync,
    /// Hand off to an external system; resumption arrives out-of-band.
    Async,
    /// Publish one unit of remote work and await its keyed response.
    Task,
    /// Publish remote work round after round until a response concludes.
    TaskChain,
    /// Spawn exactly one child execution and fold in its outcome.
    Child,
    /// Spawn all declared children in parallel and aggregate the worst.
    Children,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ExecutionMode::Sync => "SYNC",
            ExecutionMode::Async => "ASYNC",
            ExecutionMode::Task => "TASK",
            ExecutionMode::TaskChain => "TASK_CHAIN",
            ExecutionMode::Child => "CHILD",
            ExecutionMode::Children => "CHILDREN",
        };
        f.write_str(label)
    }
}

/// Outcome of facilitation: run the node in a mode, or don't run it at all.
/// A skipped node still signals any barrier it participates in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FacilitatorDecision {
    Execute(ExecutionMode),
    Skip,
}

#[derive(Debug, Error, Diagnostic)]
pub enum FacilitatorError {
    #[error("no facilitator registered for type {facilitator_type}")]
    #[diagnostic(
        code(planwright::facilitator::unknown_type),
        help("Register the facilitator type before loading plans that reference it.")
    )]
    UnknownType { facilitator_type: String },

    #[error("facilitator {facilitator_type} rejected its configuration: {detail}")]
    #[diagnostic(code(planwright::facilitator::invalid_config))]
    InvalidConfig {
        facilitator_type: String,
        detail: String,
    },
}

/// Decides a node's execution mode from its configuration and context.
pub trait Facilitator: Send + Sync {
    fn facilitate(
        &self,
        ambiance: &Ambiance,
        config: &FacilitatorConfig,
        resolved_parameters: &Value,
    ) -> Result<FacilitatorDecision, FacilitatorError>;
}

/// The standard facilitator: a fixed mode, gated by an optional boolean
/// `when` in the facilitator configuration. `when: false` skips the node.
pub struct ModeFacilitator {
    mode: ExecutionMode,
}

impl ModeFacilitator {
    #[must_use]
    pub fn new(mode: ExecutionMode) -> Self {
        Self { mode }
    }
}

impl Facilitator for ModeFacilitator {
    fn facilitate(
        &self,
        _ambiance: &Ambiance,
        config: &FacilitatorConfig,
        _resolved_parameters: &Value,
    ) -> Result<FacilitatorDecision, FacilitatorError> {
        match config.parameters.get("when") {
            None => Ok(FacilitatorDecision::Execute(self.mode)),
            Some(Value::Bool(true)) => Ok(FacilitatorDecision::Execute(self.mode)),
            Some(Value::Bool(false)) => Ok(FacilitatorDecision::Skip),
            Some(other) => Err(FacilitatorError::InvalidConfig {
                facilitator_type: config.facilitator_type.clone(),
                detail: format!("`when` must be a boolean, got {other}"),
            }),
        }
    }
}

/// Immutable type-tag → facilitator mapping, built once at startup and
/// passed by reference into the engine.
#[derive(Clone)]
pub struct FacilitatorRegistry {
    facilitators: FxHashMap<String, Arc<dyn Facilitator>>,
}

impl FacilitatorRegistry {
    /// Registry pre-wired with the six built-in execution modes.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut facilitators: FxHashMap<String, Arc<dyn Facilitator>> = FxHashMap::default();
        let builtins = [
            (SYNC_FACILITATOR, ExecutionMode::Sync),
            (ASYNC_FACILITATOR, ExecutionMode::Async),
            (TASK_FACILITATOR, ExecutionMode::Task),
            (TASK_CHAIN_FACILITATOR, ExecutionMode::TaskChain),
            (CHILD_FACILITATOR, ExecutionMode::Child),
            (CHILDREN_FACILITATOR, ExecutionMode::Children),
        ];
        for (tag, mode) in builtins {
            facilitators.insert(tag.to_string(), Arc::new(ModeFacilitator::new(mode)));
        }
        Self { facilitators }
    }

    #[must_use]
    pub fn register(
        mut self,
        facilitator_type: impl Into<String>,
        facilitator: impl Facilitator + 'static,
    ) -> Self {
        self.facilitators
            .insert(facilitator_type.into(), Arc::new(facilitator));
        self
    }

    /// Resolve and run the facilitator a node declares.
    pub fn facilitate(
        &self,
        ambiance: &Ambiance,
        config: &FacilitatorConfig,
        resolved_parameters: &Value,
    ) -> Result<FacilitatorDecision, FacilitatorError> {
        let facilitator = self.facilitators.get(&config.facilitator_type).ok_or_else(|| {
            FacilitatorError::UnknownType {
                facilitator_type: config.facilitator_type.clone(),
            }
        })?;
        facilitator.facilitate(ambiance, config, resolved_parameters)
    }

    /// Fail fast at plan-load time if a plan references an unknown type.
    pub fn verify(&self, facilitator_type: &str) -> Result<(), FacilitatorError> {
        if self.facilitators.contains_key(facilitator_type) {
            Ok(())
        } else {
            Err(FacilitatorError::UnknownType {
                facilitator_type: facilitator_type.to_string(),
            })
        }
    }
}

impl fmt::Debug for FacilitatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FacilitatorRegistry")
            .field(
                "facilitator_types",
                &self.facilitators.keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ambiance::TriggerInfo;
    use serde_json::json;

    fn ambiance() -> Ambiance {
        Ambiance::for_plan_execution("pe-1", Default::default(), TriggerInfo::manual("tester"))
    }

    #[test]
    fn builtin_tags_resolve_to_their_modes() {
        let registry = FacilitatorRegistry::with_builtins();
        let config = FacilitatorConfig::of(CHILDREN_FACILITATOR);
        let decision = registry
            .facilitate(&ambiance(), &config, &Value::Null)
            .unwrap();
        assert_eq!(
            decision,
            FacilitatorDecision::Execute(ExecutionMode::Children)
        );
    }

    #[test]
    fn when_false_skips() {
        let registry = FacilitatorRegistry::with_builtins();
        let config = FacilitatorConfig::with_parameters(SYNC_FACILITATOR, json!({"when": false}));
        let decision = registry
            .facilitate(&ambiance(), &config, &Value::Null)
            .unwrap();
        assert_eq!(decision, FacilitatorDecision::Skip);
    }

    #[test]
    fn unknown_type_is_an_error() {
        let registry = FacilitatorRegistry::with_builtins();
        let config = FacilitatorConfig::of("BESPOKE");
        let err = registry
            .facilitate(&ambiance(), &config, &Value::Null)
            .unwrap_err();
        assert!(matches!(err, FacilitatorError::UnknownType { .. }));
    }
}
