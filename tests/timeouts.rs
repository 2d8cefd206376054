use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;

use planwright::advisers::AdviserConfig;
use planwright::advisers::RETRY_ADVISER;
use planwright::facilitators::TASK_FACILITATOR;
use planwright::interrupts::InterruptType;
use planwright::plan::{FacilitatorConfig, PlanBuilder, PlanNode, TimeoutDimension};
use planwright::status::Status;
use planwright::transport::{InterruptEvent, TaskRequest, TaskResponse, TOPIC_INTERRUPTS, TOPIC_TASKS};

mod common;
use common::*;

fn slow_remote(node: PlanNode) -> planwright::plan::Plan {
    PlanBuilder::new("slow")
        .add_node(
            node.with_facilitator(FacilitatorConfig::of(TASK_FACILITATOR))
                .with_timeout(TimeoutDimension::Absolute, Duration::from_secs(60)),
        )
        .with_start("provision")
        .build()
        .unwrap()
}

#[tokio::test]
async fn absolute_timeout_expires_a_suspended_task() {
    let h = harness(slow_remote(PlanNode::new("provision", "ok")), fixture_steps());
    let run = h
        .engine
        .start_execution("slow", Default::default(), Default::default())
        .unwrap();
    h.engine.run_until_idle().await;
    let requests: Vec<TaskRequest> = h.transport.drain(TOPIC_TASKS);
    assert_eq!(requests.len(), 1);

    let fired = h
        .engine
        .tick_timeouts(Utc::now() + ChronoDuration::seconds(120))
        .unwrap();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].dimension, TimeoutDimension::Absolute);

    let concluded = h.engine.run_until_settled(&run).await.unwrap();
    assert_eq!(concluded.status, Status::Expired);
    let node = h.store.node_execution(&requests[0].node_execution_id).unwrap();
    assert_eq!(node.status, Status::Expired);

    // The suspended worker was told to stand down.
    let notices: Vec<InterruptEvent> = h.transport.drain(TOPIC_INTERRUPTS);
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].interrupt_type, InterruptType::ExpireAll);

    // An answer arriving after the expiry changes nothing.
    h.engine
        .handle_task_response(TaskResponse::succeeded(&requests[0].correlation_id))
        .await
        .unwrap();
    let after = h.engine.run_until_settled(&run).await.unwrap();
    assert_eq!(after.status, Status::Expired);
}

#[tokio::test]
async fn a_tick_before_the_deadline_fires_nothing() {
    let h = harness(slow_remote(PlanNode::new("provision", "ok")), fixture_steps());
    let run = h
        .engine
        .start_execution("slow", Default::default(), Default::default())
        .unwrap();
    h.engine.run_until_idle().await;

    let fired = h
        .engine
        .tick_timeouts(Utc::now() + ChronoDuration::seconds(1))
        .unwrap();
    assert!(fired.is_empty());
    let settled = h.engine.run_until_settled(&run).await.unwrap();
    assert_eq!(settled.status, Status::Running);
}

#[tokio::test]
async fn plan_pause_parks_an_active_countdown_until_resume() {
    let plan = PlanBuilder::new("slow")
        .add_node(
            PlanNode::new("provision", "ok")
                .with_facilitator(FacilitatorConfig::of(TASK_FACILITATOR))
                .with_timeout(TimeoutDimension::Active, Duration::from_secs(60)),
        )
        .with_start("provision")
        .build()
        .unwrap();
    let h = harness(plan, fixture_steps());
    let run = h
        .engine
        .start_execution("slow", Default::default(), Default::default())
        .unwrap();
    h.engine.run_until_idle().await;
    let requests: Vec<TaskRequest> = h.transport.drain(TOPIC_TASKS);
    assert_eq!(requests.len(), 1);

    h.engine
        .interrupts()
        .raise(InterruptType::PauseAll, &run, None, "operator")
        .unwrap();

    // Paused time consumes no ACTIVE budget: an hour past the original
    // deadline fires nothing.
    let fired = h
        .engine
        .tick_timeouts(Utc::now() + ChronoDuration::hours(1))
        .unwrap();
    assert!(fired.is_empty());

    h.engine
        .interrupts()
        .raise(InterruptType::ResumeAll, &run, None, "operator")
        .unwrap();
    h.engine.run_until_idle().await;

    // The countdown restarts from its persisted remainder.
    let fired = h
        .engine
        .tick_timeouts(Utc::now() + ChronoDuration::seconds(1))
        .unwrap();
    assert!(fired.is_empty());
    let fired = h
        .engine
        .tick_timeouts(Utc::now() + ChronoDuration::seconds(120))
        .unwrap();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].dimension, TimeoutDimension::Active);

    let concluded = h.engine.run_until_settled(&run).await.unwrap();
    assert_eq!(concluded.status, Status::Expired);
}

#[tokio::test]
async fn retry_adviser_resurrects_an_expired_node() {
    let node = PlanNode::new("provision", "ok")
        .with_adviser(AdviserConfig::of(RETRY_ADVISER))
        .with_retry_budget(2);
    let h = harness(slow_remote(node), fixture_steps());
    let run = h
        .engine
        .start_execution("slow", Default::default(), Default::default())
        .unwrap();
    h.engine.run_until_idle().await;
    let first: Vec<TaskRequest> = h.transport.drain(TOPIC_TASKS);
    assert_eq!(first.len(), 1);

    h.engine
        .tick_timeouts(Utc::now() + ChronoDuration::seconds(120))
        .unwrap();
    h.engine.run_until_idle().await;

    // A fresh execution went out with a new correlation.
    let second: Vec<TaskRequest> = h.transport.drain(TOPIC_TASKS);
    assert_eq!(second.len(), 1);
    assert_ne!(second[0].correlation_id, first[0].correlation_id);

    h.engine
        .handle_task_response(TaskResponse::succeeded(&second[0].correlation_id))
        .await
        .unwrap();
    let concluded = h.engine.run_until_settled(&run).await.unwrap();
    assert_eq!(concluded.status, Status::Succeeded);

    let mut executions = h.store.node_executions_for_plan(&run);
    executions.sort_by_key(|n| n.retry_count);
    assert_eq!(executions.len(), 2);
    assert_eq!(executions[0].status, Status::Expired);
    assert_eq!(executions[1].status, Status::Succeeded);
    assert_eq!(executions[1].retry_of, Some(executions[0].id.clone()));
}
