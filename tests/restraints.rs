use planwright::executions::ExecutableResponse;
use planwright::facilitators::CHILDREN_FACILITATOR;
use planwright::plan::{FacilitatorConfig, PlanBuilder, PlanNode};
use planwright::status::Status;

mod common;
use common::*;

#[tokio::test]
async fn capacity_one_restraint_serializes_siblings() {
    let plan = PlanBuilder::new("serial")
        .add_node(
            PlanNode::new("stage", "ok")
                .with_facilitator(FacilitatorConfig::of(CHILDREN_FACILITATOR))
                .with_child("migrate-a")
                .with_child("migrate-b"),
        )
        .add_node(PlanNode::new("migrate-a", "ok").with_restraint("db", 1))
        .add_node(PlanNode::new("migrate-b", "ok").with_restraint("db", 1))
        .with_start("stage")
        .build()
        .unwrap();
    let h = harness(plan, fixture_steps());
    let concluded = h.run_to_conclusion("serial").await;
    assert_eq!(concluded.status, Status::Succeeded);

    // One sibling held the restraint first; the other was parked as a
    // waiter and promoted on release.
    let blocked: Vec<_> = h
        .store
        .node_executions_for_plan(&concluded.id)
        .into_iter()
        .filter(|n| {
            n.executable_responses
                .iter()
                .any(|r| matches!(r, ExecutableResponse::RestraintBlocked { .. }))
        })
        .collect();
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].status, Status::Succeeded);
}

#[tokio::test]
async fn barrier_releases_waiters_when_the_last_participant_arrives() {
    let plan = PlanBuilder::new("rendezvous")
        .add_node(
            PlanNode::new("stage", "ok")
                .with_facilitator(FacilitatorConfig::of(CHILDREN_FACILITATOR))
                .with_child("left")
                .with_child("right"),
        )
        .add_node(PlanNode::new("left", "ok").with_barrier("sync"))
        .add_node(PlanNode::new("right", "ok").with_barrier("sync"))
        .with_start("stage")
        .build()
        .unwrap();
    let h = harness(plan, fixture_steps());
    let concluded = h.run_to_conclusion("rendezvous").await;
    assert_eq!(concluded.status, Status::Succeeded);

    // The first arrival parked; the second flipped the barrier standing and
    // resumed it. Both ran to success either way.
    let executions = h.store.node_executions_for_plan(&concluded.id);
    let parked = executions
        .iter()
        .filter(|n| {
            n.executable_responses
                .iter()
                .any(|r| matches!(r, ExecutableResponse::BarrierWaiting { .. }))
        })
        .count();
    assert_eq!(parked, 1);
    assert!(executions.iter().all(|n| n.status == Status::Succeeded));
}

#[tokio::test]
async fn starved_barrier_errors_its_waiters() {
    // `late` declares the barrier but sits behind a node that fails, so it
    // never arrives; `waiter` would otherwise park forever.
    let plan = PlanBuilder::new("starved")
        .add_node(
            PlanNode::new("stage", "ok")
                .with_facilitator(FacilitatorConfig::of(CHILDREN_FACILITATOR))
                .with_child("doomed")
                .with_child("waiter"),
        )
        .add_node(PlanNode::new("doomed", "fail").with_next("late"))
        .add_node(PlanNode::new("late", "ok").with_barrier("sync"))
        .add_node(PlanNode::new("waiter", "ok").with_barrier("sync"))
        .with_start("stage")
        .build()
        .unwrap();
    let h = harness(plan, fixture_steps());
    let concluded = h.run_to_conclusion("starved").await;
    assert_eq!(concluded.status, Status::Errored);

    let executions = h.store.node_executions_for_plan(&concluded.id);
    assert!(!executions.iter().any(|n| n.node_id == "late"));
    let waiter = executions.iter().find(|n| n.node_id == "waiter").unwrap();
    assert_eq!(waiter.status, Status::Errored);
    let message = waiter.failure_info.as_ref().unwrap().message.clone();
    assert!(message.contains("barrier sync deadlocked"), "got: {message}");

    // The waiter's error dominates the sibling failure in the aggregate.
    let stage = executions.iter().find(|n| n.node_id == "stage").unwrap();
    assert_eq!(stage.status, Status::Errored);
}
