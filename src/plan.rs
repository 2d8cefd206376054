//! Static plan model and the validating builder.
//!
//! A [`Plan`] is an acyclic graph of [`PlanNode`]s indexed by id. Nodes
//! reference each other by id only — a single optional `next_id` for linear
//! flow and a `child_ids` list for Child/Children execution modes — so the
//! runtime execution tree never holds object cycles.
//!
//! Plans are constructed through [`PlanBuilder`], which validates the graph
//! shape up front (start node present, references resolve, no cycles) and
//! fixes each barrier's expected-participant count by counting how many
//! nodes declare the same barrier identifier.

use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Declared facilitator configuration: a type tag resolved against the
/// facilitator registry at execution time, plus opaque parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FacilitatorConfig {
    pub facilitator_type: String,
    #[serde(default)]
    pub parameters: Value,
}

impl FacilitatorConfig {
    #[must_use]
    pub fn of(facilitator_type: impl Into<String>) -> Self {
        Self {
            facilitator_type: facilitator_type.into(),
            parameters: Value::Null,
        }
    }

    #[must_use]
    pub fn with_parameters(facilitator_type: impl Into<String>, parameters: Value) -> Self {
        Self {
            facilitator_type: facilitator_type.into(),
            parameters,
        }
    }
}

/// Declared adviser configuration, evaluated in list order after node events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdviserConfig {
    pub adviser_type: String,
    #[serde(default)]
    pub parameters: Value,
}

impl AdviserConfig {
    #[must_use]
    pub fn of(adviser_type: impl Into<String>) -> Self {
        Self {
            adviser_type: adviser_type.into(),
            parameters: Value::Null,
        }
    }

    #[must_use]
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Which clock a timeout counts against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeoutDimension {
    /// Wall-clock deadline from node start.
    Absolute,
    /// Counts only while the node is in a flowing status; paused while
    /// suspended (e.g. manual intervention).
    Active,
}

/// Timeout declared on a plan node; an instance is created per execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub dimension: TimeoutDimension,
    pub budget: Duration,
}

/// Named counting-semaphore usage declared on a plan node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestraintConfig {
    pub name: String,
    /// Max concurrent holders for the named restraint.
    pub capacity: usize,
}

/// One step of the pipeline graph.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanNode {
    pub id: String,
    pub name: String,
    pub step_type: String,
    /// Opaque parameters blob; `{"$resolve": name}` objects inside it are
    /// rewritten from sweeping outputs before facilitation.
    #[serde(default)]
    pub parameters: Value,
    pub facilitator: FacilitatorConfig,
    #[serde(default)]
    pub advisers: Vec<AdviserConfig>,
    /// Single next-node reference for linear flow.
    #[serde(default)]
    pub next_id: Option<String>,
    /// Child references for Child/Children modes.
    #[serde(default)]
    pub child_ids: Vec<String>,
    /// Scope group this node's level publishes under (e.g. "STAGE").
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub restraint: Option<RestraintConfig>,
    /// Barrier identifier this node rendezvouses on before executing.
    #[serde(default)]
    pub barrier: Option<String>,
    #[serde(default)]
    pub timeouts: Vec<TimeoutConfig>,
    /// Retry budget consulted by the retry adviser and retry interrupts.
    /// `None` falls back to the engine's configured default.
    #[serde(default)]
    pub retry_budget: Option<u32>,
}

impl PlanNode {
    /// Minimal node with a sync facilitator; builder-style setters fill in
    /// the rest.
    #[must_use]
    pub fn new(id: impl Into<String>, step_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            step_type: step_type.into(),
            parameters: Value::Null,
            facilitator: FacilitatorConfig::of(crate::facilitators::SYNC_FACILITATOR),
            advisers: Vec::new(),
            next_id: None,
            child_ids: Vec::new(),
            group: None,
            restraint: None,
            barrier: None,
            timeouts: Vec::new(),
            retry_budget: None,
        }
    }

    #[must_use]
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    #[must_use]
    pub fn with_facilitator(mut self, facilitator: FacilitatorConfig) -> Self {
        self.facilitator = facilitator;
        self
    }

    #[must_use]
    pub fn with_adviser(mut self, adviser: AdviserConfig) -> Self {
        self.advisers.push(adviser);
        self
    }

    #[must_use]
    pub fn with_next(mut self, next_id: impl Into<String>) -> Self {
        self.next_id = Some(next_id.into());
        self
    }

    #[must_use]
    pub fn with_child(mut self, child_id: impl Into<String>) -> Self {
        self.child_ids.push(child_id.into());
        self
    }

    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    #[must_use]
    pub fn with_restraint(mut self, name: impl Into<String>, capacity: usize) -> Self {
        self.restraint = Some(RestraintConfig {
            name: name.into(),
            capacity,
        });
        self
    }

    #[must_use]
    pub fn with_barrier(mut self, barrier: impl Into<String>) -> Self {
        self.barrier = Some(barrier.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, dimension: TimeoutDimension, budget: Duration) -> Self {
        self.timeouts.push(TimeoutConfig { dimension, budget });
        self
    }

    #[must_use]
    pub fn with_retry_budget(mut self, budget: u32) -> Self {
        self.retry_budget = Some(budget);
        self
    }
}

/// Validated, immutable pipeline graph.
#[derive(Clone, Debug)]
pub struct Plan {
    pub id: String,
    pub start_node_id: String,
    nodes: FxHashMap<String, Arc<PlanNode>>,
    /// Barrier identifier -> number of declaring nodes, fixed at build time.
    barrier_participants: FxHashMap<String, usize>,
}

impl Plan {
    #[must_use]
    pub fn node(&self, id: &str) -> Option<Arc<PlanNode>> {
        self.nodes.get(id).cloned()
    }

    #[must_use]
    pub fn nodes(&self) -> &FxHashMap<String, Arc<PlanNode>> {
        &self.nodes
    }

    #[must_use]
    pub fn barrier_participants(&self) -> &FxHashMap<String, usize> {
        &self.barrier_participants
    }

    #[must_use]
    pub fn start_node(&self) -> Arc<PlanNode> {
        // Validated at build time; the start node always resolves.
        self.nodes[&self.start_node_id].clone()
    }
}

impl crate::store::Record for Plan {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Structural problems detected while building a plan.
#[derive(Debug, Error, Diagnostic)]
pub enum PlanError {
    #[error("plan has no nodes")]
    #[diagnostic(code(planwright::plan::empty))]
    Empty,

    #[error("start node not found: {node_id}")]
    #[diagnostic(
        code(planwright::plan::missing_start),
        help("Set the start node with PlanBuilder::with_start to a node you added.")
    )]
    MissingStart { node_id: String },

    #[error("duplicate node id: {node_id}")]
    #[diagnostic(code(planwright::plan::duplicate_node))]
    DuplicateNode { node_id: String },

    #[error("node {node_id} references unknown node {reference}")]
    #[diagnostic(code(planwright::plan::dangling_reference))]
    DanglingReference { node_id: String, reference: String },

    #[error("cycle detected through node {node_id}")]
    #[diagnostic(
        code(planwright::plan::cycle),
        help("Retry/rollback loops are runtime constructs; next/child edges must be acyclic.")
    )]
    Cycle { node_id: String },
}

/// Fluent builder for [`Plan`] graphs.
///
/// ```
/// use planwright::plan::{PlanBuilder, PlanNode};
///
/// let plan = PlanBuilder::new("demo")
///     .add_node(PlanNode::new("build", "shell").with_next("test"))
///     .add_node(PlanNode::new("test", "shell"))
///     .with_start("build")
///     .build()
///     .unwrap();
/// assert_eq!(plan.start_node_id, "build");
/// ```
pub struct PlanBuilder {
    id: String,
    start_node_id: Option<String>,
    nodes: Vec<PlanNode>,
}

impl PlanBuilder {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            start_node_id: None,
            nodes: Vec::new(),
        }
    }

    #[must_use]
    pub fn add_node(mut self, node: PlanNode) -> Self {
        self.nodes.push(node);
        self
    }

    #[must_use]
    pub fn with_start(mut self, node_id: impl Into<String>) -> Self {
        self.start_node_id = Some(node_id.into());
        self
    }

    /// Validate and freeze the plan.
    pub fn build(self) -> Result<Plan, PlanError> {
        if self.nodes.is_empty() {
            return Err(PlanError::Empty);
        }
        let mut nodes: FxHashMap<String, Arc<PlanNode>> = FxHashMap::default();
        let mut barrier_participants: FxHashMap<String, usize> = FxHashMap::default();
        for node in self.nodes {
            if nodes.contains_key(&node.id) {
                return Err(PlanError::DuplicateNode { node_id: node.id });
            }
            if let Some(barrier) = &node.barrier {
                *barrier_participants.entry(barrier.clone()).or_insert(0) += 1;
            }
            nodes.insert(node.id.clone(), Arc::new(node));
        }

        let start_node_id = match self.start_node_id {
            Some(id) => id,
            // A single-node plan needs no explicit start.
            None if nodes.len() == 1 => nodes.keys().next().cloned().unwrap_or_default(),
            None => {
                return Err(PlanError::MissingStart {
                    node_id: String::new(),
                });
            }
        };
        if !nodes.contains_key(&start_node_id) {
            return Err(PlanError::MissingStart {
                node_id: start_node_id,
            });
        }

        for node in nodes.values() {
            for reference in node.next_id.iter().chain(node.child_ids.iter()) {
                if !nodes.contains_key(reference) {
                    return Err(PlanError::DanglingReference {
                        node_id: node.id.clone(),
                        reference: reference.clone(),
                    });
                }
            }
        }

        detect_cycles(&nodes)?;

        Ok(Plan {
            id: self.id,
            start_node_id,
            nodes,
            barrier_participants,
        })
    }
}

/// Iterative DFS over next/child edges; retry and rollback re-entries are
/// runtime constructs and never appear as static edges.
fn detect_cycles(nodes: &FxHashMap<String, Arc<PlanNode>>) -> Result<(), PlanError> {
    let mut finished: FxHashSet<&str> = FxHashSet::default();
    for root in nodes.keys() {
        if finished.contains(root.as_str()) {
            continue;
        }
        // (node, next edge index) stack; on_path tracks the grey set.
        let mut on_path: FxHashSet<&str> = FxHashSet::default();
        let mut stack: Vec<(&str, usize)> = vec![(root.as_str(), 0)];
        on_path.insert(root.as_str());
        while let Some((node_id, edge_idx)) = stack.pop() {
            let node = &nodes[node_id];
            let edges: Vec<&str> = node
                .next_id
                .iter()
                .map(String::as_str)
                .chain(node.child_ids.iter().map(String::as_str))
                .collect();
            if edge_idx < edges.len() {
                stack.push((node_id, edge_idx + 1));
                let target = edges[edge_idx];
                if on_path.contains(target) {
                    return Err(PlanError::Cycle {
                        node_id: target.to_string(),
                    });
                }
                if !finished.contains(target) {
                    on_path.insert(target);
                    stack.push((target, 0));
                }
            } else {
                on_path.remove(node_id);
                finished.insert(node_id);
            }
        }
    }
    Ok(())
}
