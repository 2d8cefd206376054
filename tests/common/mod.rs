//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use planwright::ambiance::Ambiance;
use planwright::engine::{EngineConfig, OrchestrationEngine};
use planwright::plan::Plan;
use planwright::status::Status;
use planwright::steps::{
    FailureInfo, Step, StepContext, StepError, StepRegistry, StepResponse,
};
use planwright::store::EngineStore;
use planwright::transport::InMemoryTransport;

/// Step that always succeeds.
pub struct OkStep;

#[async_trait]
impl Step for OkStep {
    async fn run(
        &self,
        _ambiance: &Ambiance,
        _parameters: &Value,
        _ctx: StepContext,
    ) -> Result<StepResponse, StepError> {
        Ok(StepResponse::succeeded())
    }
}

/// Step that always reports a business failure.
pub struct FailStep {
    pub retryable: bool,
}

#[async_trait]
impl Step for FailStep {
    async fn run(
        &self,
        _ambiance: &Ambiance,
        _parameters: &Value,
        _ctx: StepContext,
    ) -> Result<StepResponse, StepError> {
        Ok(StepResponse::failed(FailureInfo::new(
            planwright::steps::FailureKind::Application,
            "deliberate failure",
            self.retryable,
        )))
    }
}

/// Step that echoes its resolved parameters as an outcome named `out` at
/// the enclosing STAGE scope. Useful for resolution tests.
pub struct PublishStep;

#[async_trait]
impl Step for PublishStep {
    async fn run(
        &self,
        _ambiance: &Ambiance,
        parameters: &Value,
        _ctx: StepContext,
    ) -> Result<StepResponse, StepError> {
        Ok(StepResponse::succeeded().with_outcome("out", "STAGE", parameters.clone()))
    }
}

pub struct TestHarness {
    pub engine: Arc<OrchestrationEngine>,
    pub store: Arc<EngineStore>,
    pub transport: Arc<InMemoryTransport>,
}

/// Engine over an in-memory store and transport, with a memory event sink.
pub fn harness(plan: Plan, steps: StepRegistry) -> TestHarness {
    harness_with_config(plan, steps, EngineConfig::default())
}

pub fn harness_with_config(plan: Plan, steps: StepRegistry, config: EngineConfig) -> TestHarness {
    let store = Arc::new(EngineStore::default());
    store.register_plan(plan).expect("plan registers");
    let transport = Arc::new(InMemoryTransport::new());
    let engine = Arc::new(OrchestrationEngine::new(
        config.with_memory_event_bus(),
        store.clone(),
        transport.clone(),
        steps,
    ));
    TestHarness {
        engine,
        store,
        transport,
    }
}

/// Default registry covering the fixture step types.
pub fn fixture_steps() -> StepRegistry {
    StepRegistry::new()
        .register("ok", OkStep)
        .register("fail", FailStep { retryable: false })
        .register("fail-retryable", FailStep { retryable: true })
        .register("publish", PublishStep)
}

impl TestHarness {
    pub async fn run_to_conclusion(&self, plan_id: &str) -> planwright::executions::PlanExecution {
        let run = self
            .engine
            .start_execution(plan_id, Default::default(), Default::default())
            .expect("execution starts");
        self.engine
            .run_until_settled(&run)
            .await
            .expect("engine settles")
    }

    pub fn node_statuses(&self, plan_execution_id: &str) -> Vec<(String, Status)> {
        let mut nodes: Vec<_> = self
            .store
            .node_executions_for_plan(plan_execution_id)
            .into_iter()
            .map(|n| (n.node_id, n.status))
            .collect();
        nodes.sort_by(|a, b| a.0.cmp(&b.0));
        nodes
    }
}
