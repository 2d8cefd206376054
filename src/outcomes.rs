//! Sweeping outputs: scope-published values resolved by later steps.
//!
//! A step publishes a value under a (name, scope) pair, where the scope is
//! one of the levels in its [`Ambiance`]. A later step resolves a name by
//! walking its own level stack innermost to outermost and taking the
//! nearest publication. Publications are write-once per (name, scope)
//! within a plan execution; a second publish under the same key is a
//! conflict, never an overwrite.

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::ambiance::Ambiance;
use crate::store::{Collection, InMemoryCollection, Record, StoreError};
use crate::steps::OutcomePublish;

/// Parameter-blob directive rewritten by [`OutcomeService::resolve_parameters`].
pub const RESOLVE_KEY: &str = "$resolve";
/// Optional variant; unresolved names become `null` instead of failing.
pub const RESOLVE_OPTIONAL_KEY: &str = "$resolve_optional";

/// One published sweeping output. The id is the write-once key:
/// plan execution + producing level runtime + name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub id: String,
    pub plan_execution_id: String,
    pub name: String,
    /// Runtime id of the ambiance level this value is scoped to.
    pub level_runtime_id: String,
    pub produced_by: String,
    pub value: Value,
}

impl OutcomeRecord {
    fn key(plan_execution_id: &str, level_runtime_id: &str, name: &str) -> String {
        format!("{plan_execution_id}/{level_runtime_id}/{name}")
    }
}

impl Record for OutcomeRecord {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum OutcomeError {
    #[error("outcome {name} already published at scope {level_runtime_id}")]
    #[diagnostic(
        code(planwright::outcomes::conflict),
        help("Sweeping outputs are write-once per (name, scope); pick a different name or scope.")
    )]
    Conflict {
        name: String,
        level_runtime_id: String,
    },

    #[error("no outcome named {name} visible from the current ambiance")]
    #[diagnostic(code(planwright::outcomes::not_found))]
    NotFound { name: String },

    #[error("publish references scope group {group} absent from the ambiance")]
    #[diagnostic(code(planwright::outcomes::unknown_scope))]
    UnknownScope { group: String },

    #[error(transparent)]
    #[diagnostic(code(planwright::outcomes::store))]
    Store(#[from] StoreError),
}

/// Publication and resolution over the outcome collection.
pub struct OutcomeService {
    outcomes: Arc<dyn Collection<OutcomeRecord>>,
}

impl Default for OutcomeService {
    fn default() -> Self {
        Self {
            outcomes: Arc::new(InMemoryCollection::new()),
        }
    }
}

impl OutcomeService {
    #[must_use]
    pub fn new(outcomes: Arc<dyn Collection<OutcomeRecord>>) -> Self {
        Self { outcomes }
    }

    /// Publish one outcome at the ambiance level matching the requested
    /// scope group. Returns the outcome record id for back-reference.
    pub fn publish(
        &self,
        ambiance: &Ambiance,
        produced_by: &str,
        publish: &OutcomePublish,
    ) -> Result<String, OutcomeError> {
        let level = ambiance.level_for_group(&publish.scope_group).ok_or_else(|| {
            OutcomeError::UnknownScope {
                group: publish.scope_group.clone(),
            }
        })?;
        let id = OutcomeRecord::key(&ambiance.plan_execution_id, &level.runtime_id, &publish.name);
        let record = OutcomeRecord {
            id: id.clone(),
            plan_execution_id: ambiance.plan_execution_id.clone(),
            name: publish.name.clone(),
            level_runtime_id: level.runtime_id.clone(),
            produced_by: produced_by.to_string(),
            value: publish.value.clone(),
        };
        match self.outcomes.create(record) {
            Ok(_) => {
                debug!(name = %publish.name, scope = %publish.scope_group, "outcome published");
                Ok(id)
            }
            Err(StoreError::AlreadyExists { .. }) => Err(OutcomeError::Conflict {
                name: publish.name.clone(),
                level_runtime_id: level.runtime_id.clone(),
            }),
            Err(other) => Err(other.into()),
        }
    }

    /// Nearest publication of `name` visible from `ambiance`, walking the
    /// level stack innermost to outermost.
    pub fn resolve(&self, ambiance: &Ambiance, name: &str) -> Result<Value, OutcomeError> {
        self.resolve_optional(ambiance, name)?
            .ok_or_else(|| OutcomeError::NotFound {
                name: name.to_string(),
            })
    }

    /// Found/not-found variant of [`resolve`](Self::resolve).
    pub fn resolve_optional(
        &self,
        ambiance: &Ambiance,
        name: &str,
    ) -> Result<Option<Value>, OutcomeError> {
        for level in ambiance.levels.iter().rev() {
            let id = OutcomeRecord::key(&ambiance.plan_execution_id, &level.runtime_id, name);
            match self.outcomes.get(&id) {
                Ok(found) => return Ok(Some(found.doc.value)),
                Err(StoreError::NotFound { .. }) => continue,
                Err(other) => return Err(other.into()),
            }
        }
        Ok(None)
    }

    /// Rewrite a parameter blob, replacing every `{"$resolve": name}` object
    /// with the resolved value and every `{"$resolve_optional": name}` with
    /// the resolved value or `null`.
    pub fn resolve_parameters(
        &self,
        ambiance: &Ambiance,
        parameters: &Value,
    ) -> Result<Value, OutcomeError> {
        match parameters {
            Value::Object(map) => {
                if map.len() == 1 {
                    if let Some(Value::String(name)) = map.get(RESOLVE_KEY) {
                        return self.resolve(ambiance, name);
                    }
                    if let Some(Value::String(name)) = map.get(RESOLVE_OPTIONAL_KEY) {
                        return Ok(self
                            .resolve_optional(ambiance, name)?
                            .unwrap_or(Value::Null));
                    }
                }
                let mut rewritten = serde_json::Map::with_capacity(map.len());
                for (key, value) in map {
                    rewritten.insert(key.clone(), self.resolve_parameters(ambiance, value)?);
                }
                Ok(Value::Object(rewritten))
            }
            Value::Array(items) => {
                let mut rewritten = Vec::with_capacity(items.len());
                for item in items {
                    rewritten.push(self.resolve_parameters(ambiance, item)?);
                }
                Ok(Value::Array(rewritten))
            }
            other => Ok(other.clone()),
        }
    }
}
