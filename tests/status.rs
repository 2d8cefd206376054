use chrono::Utc;
use proptest::prelude::*;

use planwright::executions::NodeExecution;
use planwright::status::{self, Status, ALL_STATUSES};
use planwright::store::{EngineStore, StoreError};

fn seeded_node(store: &EngineStore, status: Status) -> String {
    let id = format!("node-{status}");
    let mut node = NodeExecution::queued(&id, "pe-1", "step-1", None, vec![], Utc::now());
    node.status = status;
    store.create_node_execution(node).unwrap();
    id
}

/// Every (from, to) pair either transitions or is rejected, exactly per the
/// transition table, and a rejected write leaves the record unchanged.
#[test]
fn guarded_writes_follow_the_transition_table() {
    for &from in ALL_STATUSES {
        for &to in ALL_STATUSES {
            let store = EngineStore::default();
            let id = seeded_node(&store, from);
            let result = store.update_node_status(&id, to);
            let after = store.node_execution(&id).unwrap();
            if from.is_final() {
                assert!(
                    matches!(result, Err(StoreError::IllegalTransition { .. })),
                    "{from} -> {to}: final records must be immutable"
                );
                assert_eq!(after.status, from);
            } else if to.reachable_from(from) {
                assert!(result.is_ok(), "{from} -> {to} should be legal");
                assert_eq!(after.status, to);
            } else {
                assert!(
                    matches!(result, Err(StoreError::StaleState { .. })),
                    "{from} -> {to} should be rejected as stale"
                );
                assert_eq!(after.status, from, "{from} must survive a rejected write");
            }
        }
    }
}

#[test]
fn terminal_writes_stamp_end_ts() {
    let store = EngineStore::default();
    let id = seeded_node(&store, Status::Running);
    let updated = store.update_node_status(&id, Status::Succeeded).unwrap();
    assert!(updated.end_ts.is_some());
}

#[test]
fn every_status_has_self_excluded_sources() {
    for &status in ALL_STATUSES {
        assert!(
            !status.allowed_sources().contains(&status),
            "{status} must not be its own source"
        );
    }
}

#[test]
fn derived_sets_are_consistent() {
    for &status in ALL_STATUSES {
        if status.is_final() {
            assert!(status.is_terminal(), "{status}: final implies terminal");
        }
        if status.is_retryable() {
            assert!(status.is_broke(), "{status}: retryable implies broke");
        }
        if status.is_positive() {
            assert!(!status.is_broke(), "{status}: positive excludes broke");
        }
    }
}

#[test]
fn severity_ties_break_the_same_way_in_both_orders() {
    // The three waiting statuses share a severity rank; the aggregate must
    // not depend on which sibling reported first.
    assert_eq!(
        status::worst([Status::TimedWaiting, Status::AsyncWaiting]),
        status::worst([Status::AsyncWaiting, Status::TimedWaiting]),
    );
    assert_eq!(
        status::worst([Status::TaskWaiting, Status::AsyncWaiting, Status::TimedWaiting]),
        status::worst([Status::TimedWaiting, Status::AsyncWaiting, Status::TaskWaiting]),
    );
}

proptest! {
    /// Severity aggregation is commutative over arrival order.
    #[test]
    fn worst_is_order_independent(mut statuses in proptest::collection::vec(
        proptest::sample::select(ALL_STATUSES.to_vec()), 1..8,
    )) {
        let forward = status::worst(statuses.iter().copied());
        statuses.reverse();
        let backward = status::worst(statuses.iter().copied());
        prop_assert_eq!(forward, backward);
    }

    /// The aggregate is always at least as severe as any input.
    #[test]
    fn worst_dominates_inputs(statuses in proptest::collection::vec(
        proptest::sample::select(ALL_STATUSES.to_vec()), 1..8,
    )) {
        let aggregate = status::worst(statuses.iter().copied());
        for s in &statuses {
            prop_assert!(aggregate.severity() >= s.severity());
        }
    }
}
