use async_trait::async_trait;
use serde_json::{json, Value};

use planwright::ambiance::Ambiance;
use planwright::facilitators::{
    ASYNC_FACILITATOR, TASK_CHAIN_FACILITATOR, TASK_FACILITATOR,
};
use planwright::plan::{FacilitatorConfig, PlanBuilder, PlanNode};
use planwright::status::Status;
use planwright::steps::{Step, StepContext, StepError, StepResponse, TaskVerdict};
use planwright::transport::{TaskRequest, TaskResponse, TOPIC_TASKS};

mod common;
use common::*;

/// Remote protocol with three rounds: dispatches the next round until the
/// worker has been asked twice more, then concludes.
struct RolloutStep;

#[async_trait]
impl Step for RolloutStep {
    async fn run(
        &self,
        _ambiance: &Ambiance,
        _parameters: &Value,
        _ctx: StepContext,
    ) -> Result<StepResponse, StepError> {
        Ok(StepResponse::succeeded())
    }

    async fn on_task_response(
        &self,
        _ambiance: &Ambiance,
        _parameters: &Value,
        response: &TaskResponse,
    ) -> Result<TaskVerdict, StepError> {
        let done = response
            .partial_progress
            .as_ref()
            .and_then(|p| p.get("phase"))
            .and_then(Value::as_u64)
            .is_some_and(|phase| phase >= 2);
        if done {
            Ok(TaskVerdict::Conclude(response.to_step_response()))
        } else {
            Ok(TaskVerdict::DispatchNext(json!({"continue": true})))
        }
    }
}

fn task_plan(facilitator: &str, step_type: &str) -> planwright::plan::Plan {
    PlanBuilder::new("remote")
        .add_node(
            PlanNode::new("provision", step_type)
                .with_parameters(json!({"size": "large"}))
                .with_facilitator(FacilitatorConfig::of(facilitator)),
        )
        .with_start("provision")
        .build()
        .unwrap()
}

#[tokio::test]
async fn task_mode_publishes_a_request_and_suspends() {
    let h = harness(task_plan(TASK_FACILITATOR, "ok"), fixture_steps());
    let run = h
        .engine
        .start_execution("remote", Default::default(), Default::default())
        .unwrap();
    let settled = h.engine.run_until_settled(&run).await.unwrap();
    assert_eq!(settled.status, Status::Running);

    let requests: Vec<TaskRequest> = h.transport.drain(TOPIC_TASKS);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].step_type, "ok");
    assert_eq!(requests[0].round, 0);
    assert_eq!(requests[0].parameters, json!({"size": "large"}));

    let node = h.store.node_execution(&requests[0].node_execution_id).unwrap();
    assert_eq!(node.status, Status::TaskWaiting);
}

#[tokio::test]
async fn task_response_concludes_the_suspended_node() {
    let h = harness(task_plan(TASK_FACILITATOR, "ok"), fixture_steps());
    let run = h
        .engine
        .start_execution("remote", Default::default(), Default::default())
        .unwrap();
    h.engine.run_until_idle().await;
    let requests: Vec<TaskRequest> = h.transport.drain(TOPIC_TASKS);

    h.engine
        .handle_task_response(TaskResponse::succeeded(&requests[0].correlation_id))
        .await
        .unwrap();
    let concluded = h.engine.run_until_settled(&run).await.unwrap();
    assert_eq!(concluded.status, Status::Succeeded);
}

#[tokio::test]
async fn duplicate_task_responses_are_dropped() {
    let h = harness(task_plan(TASK_FACILITATOR, "ok"), fixture_steps());
    let run = h
        .engine
        .start_execution("remote", Default::default(), Default::default())
        .unwrap();
    h.engine.run_until_idle().await;
    let requests: Vec<TaskRequest> = h.transport.drain(TOPIC_TASKS);
    let response = TaskResponse::succeeded(&requests[0].correlation_id);

    h.engine.handle_task_response(response.clone()).await.unwrap();
    // At-least-once delivery: the replay must be a no-op, not a second
    // conclusion attempt.
    h.engine.handle_task_response(response).await.unwrap();
    let concluded = h.engine.run_until_settled(&run).await.unwrap();
    assert_eq!(concluded.status, Status::Succeeded);

    let node = h
        .store
        .node_executions_for_plan(&run)
        .into_iter()
        .next()
        .unwrap();
    assert_eq!(node.processed_correlations.len(), 1);
}

#[tokio::test]
async fn unknown_correlations_are_ignored() {
    let h = harness(task_plan(TASK_FACILITATOR, "ok"), fixture_steps());
    let run = h
        .engine
        .start_execution("remote", Default::default(), Default::default())
        .unwrap();
    h.engine.run_until_idle().await;

    h.engine
        .handle_task_response(TaskResponse::succeeded("no-such-correlation"))
        .await
        .unwrap();
    let settled = h.engine.run_until_settled(&run).await.unwrap();
    assert_eq!(settled.status, Status::Running);
}

#[tokio::test]
async fn task_chain_advances_rounds_until_the_step_concludes() {
    let steps = fixture_steps().register("rollout", RolloutStep);
    let h = harness(task_plan(TASK_CHAIN_FACILITATOR, "rollout"), steps);
    let run = h
        .engine
        .start_execution("remote", Default::default(), Default::default())
        .unwrap();
    h.engine.run_until_idle().await;

    for phase in 0..3u64 {
        let requests: Vec<TaskRequest> = h.transport.drain(TOPIC_TASKS);
        assert_eq!(requests.len(), 1, "phase {phase}: one request per round");
        assert_eq!(requests[0].round, phase as u32);
        let mut response = TaskResponse::succeeded(&requests[0].correlation_id);
        response.partial_progress = Some(json!({"phase": phase}));
        h.engine.handle_task_response(response).await.unwrap();
    }

    let concluded = h.engine.run_until_settled(&run).await.unwrap();
    assert_eq!(concluded.status, Status::Succeeded);

    let node = h
        .store
        .node_executions_for_plan(&run)
        .into_iter()
        .next()
        .unwrap();
    // One suspension record per round, all consumed.
    assert_eq!(node.executable_responses.len(), 3);
    assert_eq!(node.processed_correlations.len(), 3);
}

#[tokio::test]
async fn async_mode_suspends_until_externally_resumed() {
    let h = harness(task_plan(ASYNC_FACILITATOR, "ok"), fixture_steps());
    let run = h
        .engine
        .start_execution("remote", Default::default(), Default::default())
        .unwrap();
    h.engine.run_until_idle().await;

    let node = h
        .store
        .node_executions_for_plan(&run)
        .into_iter()
        .next()
        .unwrap();
    assert_eq!(node.status, Status::AsyncWaiting);
    let correlation = node
        .last_executable_response()
        .and_then(|r| r.correlation_id())
        .unwrap()
        .to_string();

    h.engine
        .resume_async(&correlation, StepResponse::succeeded())
        .unwrap();
    let concluded = h.engine.run_until_settled(&run).await.unwrap();
    assert_eq!(concluded.status, Status::Succeeded);
}
