//! Immutable execution-context snapshots passed through every engine call.
//!
//! An [`Ambiance`] carries the plan-execution id, an ordered stack of
//! [`Level`]s (one per ancestor in the execution tree), the tenancy scope,
//! and trigger metadata. A new level is pushed when descending into a child
//! node and is never mutated in place; consumers always receive a full
//! snapshot and derive new ones with [`Ambiance::with_level`].

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::plan::PlanNode;

/// One frame of the execution-context stack.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    /// Identifier of the plan node this frame belongs to.
    pub node_id: String,
    /// NodeExecution id for this frame (the "runtime id").
    pub runtime_id: String,
    /// Declared step type of the plan node.
    pub step_type: String,
    /// Scope group this level publishes under (e.g. "STEP", "STAGE").
    #[serde(default)]
    pub group: Option<String>,
}

impl Level {
    /// Build the level for a fresh node execution of `node`.
    #[must_use]
    pub fn from_plan_node(runtime_id: impl Into<String>, node: &PlanNode) -> Self {
        Self {
            node_id: node.id.clone(),
            runtime_id: runtime_id.into(),
            step_type: node.step_type.clone(),
            group: node.group.clone(),
        }
    }
}

/// Tenancy scope keys (tenant / org / project equivalents).
pub type ScopeKeys = FxHashMap<String, String>;

/// Who or what started the run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerInfo {
    /// Kind of trigger, e.g. "manual", "webhook", "schedule".
    pub trigger_type: String,
    /// Identity of the triggering principal, when known.
    #[serde(default)]
    pub triggered_by: Option<String>,
}

impl TriggerInfo {
    #[must_use]
    pub fn manual(by: impl Into<String>) -> Self {
        Self {
            trigger_type: "manual".to_string(),
            triggered_by: Some(by.into()),
        }
    }
}

/// Immutable snapshot of execution context and the scope stack.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ambiance {
    pub plan_execution_id: String,
    /// Outermost first; the last level is the current node execution.
    pub levels: Vec<Level>,
    #[serde(default)]
    pub scope: ScopeKeys,
    #[serde(default)]
    pub trigger: TriggerInfo,
}

impl Ambiance {
    /// Root ambiance for a plan execution, before any level is pushed.
    #[must_use]
    pub fn for_plan_execution(
        plan_execution_id: impl Into<String>,
        scope: ScopeKeys,
        trigger: TriggerInfo,
    ) -> Self {
        Self {
            plan_execution_id: plan_execution_id.into(),
            levels: Vec::new(),
            scope,
            trigger,
        }
    }

    /// Clone this snapshot with `level` pushed as the new innermost frame.
    #[must_use]
    pub fn with_level(&self, level: Level) -> Self {
        let mut cloned = self.clone();
        cloned.levels.push(level);
        cloned
    }

    /// Innermost level, if any.
    #[must_use]
    pub fn current_level(&self) -> Option<&Level> {
        self.levels.last()
    }

    /// Runtime id (node-execution id) of the innermost level.
    #[must_use]
    pub fn current_runtime_id(&self) -> Option<&str> {
        self.current_level().map(|l| l.runtime_id.as_str())
    }

    /// Innermost level carrying `group`, walking outward.
    #[must_use]
    pub fn level_for_group(&self, group: &str) -> Option<&Level> {
        self.levels
            .iter()
            .rev()
            .find(|l| l.group.as_deref() == Some(group))
    }
}
