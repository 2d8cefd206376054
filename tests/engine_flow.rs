use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};

use planwright::advisers::{
    AdviserConfig, IGNORE_ADVISER, MANUAL_INTERVENTION_ADVISER, ON_FAIL_ADVISER, RETRY_ADVISER,
};
use planwright::ambiance::Ambiance;
use planwright::engine::EngineConfig;
use planwright::facilitators::{CHILD_FACILITATOR, SYNC_FACILITATOR};
use planwright::interrupts::InterruptType;
use planwright::plan::{FacilitatorConfig, PlanBuilder, PlanNode};
use planwright::status::Status;
use planwright::steps::{
    FailureInfo, FailureKind, Step, StepContext, StepError, StepResponse,
};

mod common;
use common::*;

/// Fails while the counter lasts, then succeeds.
struct FlakyStep {
    failures_left: AtomicU32,
}

#[async_trait]
impl Step for FlakyStep {
    async fn run(
        &self,
        _ambiance: &Ambiance,
        _parameters: &Value,
        _ctx: StepContext,
    ) -> Result<StepResponse, StepError> {
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Ok(StepResponse::failed(FailureInfo::new(
                FailureKind::Connectivity,
                "transient",
                true,
            )));
        }
        Ok(StepResponse::succeeded())
    }
}

#[tokio::test]
async fn linear_plan_runs_to_success() {
    let plan = PlanBuilder::new("linear")
        .add_node(PlanNode::new("build", "ok").with_next("test"))
        .add_node(PlanNode::new("test", "ok"))
        .with_start("build")
        .build()
        .unwrap();
    let h = harness(plan, fixture_steps());
    let concluded = h.run_to_conclusion("linear").await;
    assert_eq!(concluded.status, Status::Succeeded);
    assert!(concluded.end_ts.is_some());
    assert_eq!(
        h.node_statuses(&concluded.id),
        vec![
            ("build".to_string(), Status::Succeeded),
            ("test".to_string(), Status::Succeeded),
        ]
    );
}

#[tokio::test]
async fn unadvised_failure_concludes_the_plan_failed() {
    let plan = PlanBuilder::new("failing")
        .add_node(PlanNode::new("build", "ok").with_next("deploy"))
        .add_node(PlanNode::new("deploy", "fail").with_next("verify"))
        .add_node(PlanNode::new("verify", "ok"))
        .with_start("build")
        .build()
        .unwrap();
    let h = harness(plan, fixture_steps());
    let concluded = h.run_to_conclusion("failing").await;
    assert_eq!(concluded.status, Status::Failed);
    // verify never ran: the branch stopped at the failure.
    let statuses = h.node_statuses(&concluded.id);
    assert!(!statuses.iter().any(|(node, _)| node == "verify"));
}

#[tokio::test]
async fn when_false_skips_the_node_and_flow_continues() {
    let plan = PlanBuilder::new("skipping")
        .add_node(
            PlanNode::new("optional", "fail")
                .with_facilitator(FacilitatorConfig::with_parameters(
                    SYNC_FACILITATOR,
                    json!({"when": false}),
                ))
                .with_next("always"),
        )
        .add_node(PlanNode::new("always", "ok"))
        .with_start("optional")
        .build()
        .unwrap();
    let h = harness(plan, fixture_steps());
    let concluded = h.run_to_conclusion("skipping").await;
    assert_eq!(concluded.status, Status::Succeeded);
    assert_eq!(
        h.node_statuses(&concluded.id),
        vec![
            ("always".to_string(), Status::Succeeded),
            ("optional".to_string(), Status::Skipped),
        ]
    );
}

#[tokio::test]
async fn outcomes_resolve_into_later_parameters() {
    let plan = PlanBuilder::new("wiring")
        .add_node(
            PlanNode::new("stage", "ok")
                .with_group("STAGE")
                .with_facilitator(FacilitatorConfig::of(CHILD_FACILITATOR))
                .with_child("produce"),
        )
        .add_node(
            PlanNode::new("produce", "publish")
                .with_parameters(json!({"artifact": "app-1.2.3"}))
                .with_next("consume"),
        )
        .add_node(
            PlanNode::new("consume", "ok")
                .with_parameters(json!({"input": {"$resolve": "out"}})),
        )
        .with_start("stage")
        .build()
        .unwrap();
    let h = harness(plan, fixture_steps());
    let concluded = h.run_to_conclusion("wiring").await;
    assert_eq!(concluded.status, Status::Succeeded);
    let consume = h
        .store
        .node_executions_for_plan(&concluded.id)
        .into_iter()
        .find(|n| n.node_id == "consume")
        .unwrap();
    assert_eq!(
        consume.resolved_parameters,
        json!({"input": {"artifact": "app-1.2.3"}})
    );
}

#[tokio::test]
async fn on_fail_adviser_routes_to_the_handler_node() {
    let plan = PlanBuilder::new("rollback")
        .add_node(
            PlanNode::new("deploy", "fail").with_adviser(
                AdviserConfig::of(ON_FAIL_ADVISER)
                    .with_parameters(json!({"next_node_id": "undo"})),
            ),
        )
        .add_node(PlanNode::new("undo", "ok"))
        .with_start("deploy")
        .build()
        .unwrap();
    let h = harness(plan, fixture_steps());
    let concluded = h.run_to_conclusion("rollback").await;
    assert_eq!(concluded.status, Status::Succeeded);
    assert_eq!(
        h.node_statuses(&concluded.id),
        vec![
            ("deploy".to_string(), Status::Failed),
            ("undo".to_string(), Status::Succeeded),
        ]
    );
}

#[tokio::test]
async fn ignore_adviser_overrides_to_ignore_failed_and_continues() {
    let plan = PlanBuilder::new("lenient")
        .add_node(
            PlanNode::new("flaky-check", "fail")
                .with_adviser(AdviserConfig::of(IGNORE_ADVISER))
                .with_next("ship"),
        )
        .add_node(PlanNode::new("ship", "ok"))
        .with_start("flaky-check")
        .build()
        .unwrap();
    let h = harness(plan, fixture_steps());
    let concluded = h.run_to_conclusion("lenient").await;
    assert_eq!(concluded.status, Status::Succeeded);
    assert_eq!(
        h.node_statuses(&concluded.id),
        vec![
            ("flaky-check".to_string(), Status::IgnoreFailed),
            ("ship".to_string(), Status::Succeeded),
        ]
    );
}

#[tokio::test]
async fn retry_adviser_spawns_fresh_executions_until_success() {
    let plan = PlanBuilder::new("retrying")
        .add_node(
            PlanNode::new("fetch", "flaky")
                .with_adviser(AdviserConfig::of(RETRY_ADVISER))
                .with_retry_budget(3),
        )
        .with_start("fetch")
        .build()
        .unwrap();
    let steps = fixture_steps().register(
        "flaky",
        FlakyStep {
            failures_left: AtomicU32::new(2),
        },
    );
    let h = harness(plan, steps);
    let concluded = h.run_to_conclusion("retrying").await;
    assert_eq!(concluded.status, Status::Succeeded);

    let mut executions = h.store.node_executions_for_plan(&concluded.id);
    executions.sort_by_key(|n| n.retry_count);
    assert_eq!(executions.len(), 3);
    assert_eq!(executions[0].status, Status::Failed);
    assert_eq!(executions[1].status, Status::Failed);
    assert_eq!(executions[2].status, Status::Succeeded);
    assert_eq!(executions[2].retry_of, Some(executions[1].id.clone()));
}

#[tokio::test]
async fn retry_budget_exhaustion_lets_the_failure_stand() {
    let plan = PlanBuilder::new("hopeless")
        .add_node(
            PlanNode::new("fetch", "fail-retryable")
                .with_adviser(AdviserConfig::of(RETRY_ADVISER))
                .with_retry_budget(2),
        )
        .with_start("fetch")
        .build()
        .unwrap();
    let h = harness(plan, fixture_steps());
    let concluded = h.run_to_conclusion("hopeless").await;
    assert_eq!(concluded.status, Status::Failed);
    // Original plus two retries, all failed.
    assert_eq!(h.store.node_executions_for_plan(&concluded.id).len(), 3);
}

#[tokio::test]
async fn an_explicit_zero_budget_overrides_the_engine_default() {
    let plan = PlanBuilder::new("pinned")
        .add_node(
            PlanNode::new("fetch", "fail-retryable")
                .with_adviser(AdviserConfig::of(RETRY_ADVISER))
                .with_retry_budget(0),
        )
        .with_start("fetch")
        .build()
        .unwrap();
    let mut config = EngineConfig::default();
    config.default_retry_budget = 2;
    let h = harness_with_config(plan, fixture_steps(), config);
    let concluded = h.run_to_conclusion("pinned").await;
    assert_eq!(concluded.status, Status::Failed);
    // The node pinned its budget to zero; the engine default does not apply.
    assert_eq!(h.store.node_executions_for_plan(&concluded.id).len(), 1);
}

#[tokio::test]
async fn nodes_without_a_budget_inherit_the_engine_default() {
    let plan = PlanBuilder::new("inherited")
        .add_node(PlanNode::new("fetch", "flaky").with_adviser(AdviserConfig::of(RETRY_ADVISER)))
        .with_start("fetch")
        .build()
        .unwrap();
    let steps = fixture_steps().register(
        "flaky",
        FlakyStep {
            failures_left: AtomicU32::new(1),
        },
    );
    let mut config = EngineConfig::default();
    config.default_retry_budget = 1;
    let h = harness_with_config(plan, steps, config);
    let concluded = h.run_to_conclusion("inherited").await;
    assert_eq!(concluded.status, Status::Succeeded);
    assert_eq!(h.store.node_executions_for_plan(&concluded.id).len(), 2);
}

#[tokio::test]
async fn intervention_freezes_the_plan_until_an_operator_retries() {
    let plan = PlanBuilder::new("guarded")
        .add_node(
            PlanNode::new("deploy", "flaky")
                .with_adviser(AdviserConfig::of(MANUAL_INTERVENTION_ADVISER)),
        )
        .with_start("deploy")
        .build()
        .unwrap();
    let steps = fixture_steps().register(
        "flaky",
        FlakyStep {
            failures_left: AtomicU32::new(1),
        },
    );
    let h = harness(plan, steps);
    let run = h
        .engine
        .start_execution("guarded", Default::default(), Default::default())
        .unwrap();
    let settled = h.engine.run_until_settled(&run).await.unwrap();
    assert_eq!(settled.status, Status::InterventionWaiting);
    let frozen = h
        .store
        .node_executions_for_plan(&run)
        .into_iter()
        .find(|n| n.status == Status::InterventionWaiting)
        .expect("one frozen node");

    h.engine
        .interrupts()
        .raise(InterruptType::Retry, &run, Some(&frozen.id), "operator")
        .unwrap();
    let concluded = h.engine.run_until_settled(&run).await.unwrap();
    assert_eq!(concluded.status, Status::Succeeded);
    let old = h.store.node_execution(&frozen.id).unwrap();
    assert_eq!(old.status, Status::Failed);
}
