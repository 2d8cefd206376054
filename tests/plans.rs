use planwright::plan::{PlanBuilder, PlanError, PlanNode};

#[test]
fn linear_plan_builds() {
    let plan = PlanBuilder::new("p")
        .add_node(PlanNode::new("a", "ok").with_next("b"))
        .add_node(PlanNode::new("b", "ok"))
        .with_start("a")
        .build()
        .unwrap();
    assert_eq!(plan.start_node_id, "a");
    assert_eq!(plan.nodes().len(), 2);
}

#[test]
fn single_node_plan_needs_no_explicit_start() {
    let plan = PlanBuilder::new("p")
        .add_node(PlanNode::new("only", "ok"))
        .build()
        .unwrap();
    assert_eq!(plan.start_node_id, "only");
}

#[test]
fn empty_plan_is_rejected() {
    assert!(matches!(
        PlanBuilder::new("p").build(),
        Err(PlanError::Empty)
    ));
}

#[test]
fn duplicate_node_ids_are_rejected() {
    let result = PlanBuilder::new("p")
        .add_node(PlanNode::new("a", "ok"))
        .add_node(PlanNode::new("a", "ok"))
        .with_start("a")
        .build();
    assert!(matches!(result, Err(PlanError::DuplicateNode { node_id }) if node_id == "a"));
}

#[test]
fn dangling_next_reference_is_rejected() {
    let result = PlanBuilder::new("p")
        .add_node(PlanNode::new("a", "ok").with_next("ghost"))
        .with_start("a")
        .build();
    assert!(matches!(
        result,
        Err(PlanError::DanglingReference { reference, .. }) if reference == "ghost"
    ));
}

#[test]
fn dangling_child_reference_is_rejected() {
    let result = PlanBuilder::new("p")
        .add_node(PlanNode::new("parent", "ok").with_child("ghost"))
        .with_start("parent")
        .build();
    assert!(matches!(result, Err(PlanError::DanglingReference { .. })));
}

#[test]
fn next_cycle_is_rejected() {
    let result = PlanBuilder::new("p")
        .add_node(PlanNode::new("a", "ok").with_next("b"))
        .add_node(PlanNode::new("b", "ok").with_next("a"))
        .with_start("a")
        .build();
    assert!(matches!(result, Err(PlanError::Cycle { .. })));
}

#[test]
fn child_cycle_is_rejected() {
    let result = PlanBuilder::new("p")
        .add_node(PlanNode::new("a", "ok").with_child("b"))
        .add_node(PlanNode::new("b", "ok").with_child("a"))
        .with_start("a")
        .build();
    assert!(matches!(result, Err(PlanError::Cycle { .. })));
}

#[test]
fn missing_start_is_rejected() {
    let result = PlanBuilder::new("p")
        .add_node(PlanNode::new("a", "ok"))
        .add_node(PlanNode::new("b", "ok"))
        .build();
    assert!(matches!(result, Err(PlanError::MissingStart { .. })));
}

#[test]
fn barrier_participants_are_counted_at_build_time() {
    let plan = PlanBuilder::new("p")
        .add_node(PlanNode::new("a", "ok").with_barrier("sync-point"))
        .add_node(PlanNode::new("b", "ok").with_barrier("sync-point"))
        .add_node(PlanNode::new("c", "ok").with_barrier("other"))
        .with_start("a")
        .build()
        .unwrap();
    assert_eq!(plan.barrier_participants().get("sync-point"), Some(&2));
    assert_eq!(plan.barrier_participants().get("other"), Some(&1));
}

/// A diamond is a DAG, not a cycle: two routes into the same node build fine.
#[test]
fn diamond_shape_builds() {
    let result = PlanBuilder::new("p")
        .add_node(PlanNode::new("fork", "ok").with_child("left").with_child("right"))
        .add_node(PlanNode::new("left", "ok").with_next("join"))
        .add_node(PlanNode::new("right", "ok").with_next("join"))
        .add_node(PlanNode::new("join", "ok"))
        .with_start("fork")
        .build();
    assert!(result.is_ok());
}
