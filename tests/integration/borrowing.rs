//! Borrow execution, rejection and return across full cycles.

use std::sync::Arc;

use tandem::bus::{Channel, Payload};
use tandem::core::{TeamId, WorkerId};
use tandem::orchestration::{BorrowRejection, Organization, PoolOrchestrator};

use crate::fixtures::{assert_org_consistent, card, struggling_pair, ScriptedAdvisor};

/// Test: A struggling team receives a worker from a team with spare people
///
/// Given team a with three cards blocked on team b, and team b with three
///       idle workers and nothing blocked
/// When one cycle runs with the heuristic advisor
/// Then b1 moves to a's roster, is located on a, and exactly one loan is active
#[tokio::test]
async fn test_struggling_team_borrows_from_donor() {
    let config = struggling_pair(1);
    let mut orchestrator = PoolOrchestrator::new(&config).unwrap();
    let mut transfers = orchestrator.bus().subscribe(Channel::CrossTeam);

    let report = orchestrator.run().await.unwrap();
    let org = orchestrator.organization();

    let a = TeamId::from("a");
    let b = TeamId::from("b");
    let b1 = WorkerId::from("b1");
    assert_eq!(report.totals.borrows, 1);
    assert!(org.team(&a).unwrap().roster().contains(&b1));
    assert!(!org.team(&b).unwrap().roster().contains(&b1));
    assert_eq!(org.worker(&b1).unwrap().current_team_id, a);
    assert_eq!(org.worker(&b1).unwrap().home_team_id, b);

    assert_eq!(org.borrows().active().len(), 1);
    let record = &org.borrows().active()[0];
    assert_eq!(record.worker, b1);
    assert_eq!(record.source, b);
    assert_eq!(record.destination, a);
    assert_eq!(record.started_cycle, 1);
    assert_org_consistent(org);

    let messages = transfers.drain();
    assert!(messages.iter().any(|m| matches!(
        &m.payload,
        Payload::Transfer { worker, returning: false, .. } if worker == &b1
    )));
}

/// Test: A borrowed worker goes home when the loan runs out
///
/// Given the struggling pair, where team b also has one small card of its own
/// When two cycles run
/// Then b delivers in cycle 2, a's cards unblock, and the borrowed worker is
///      back home with an archived record ended in cycle 2
#[tokio::test]
async fn test_borrowed_worker_returns_after_duration() {
    let mut config = struggling_pair(2);
    config.teams[1].backlog.push(card("Search index", 1));
    let mut orchestrator = PoolOrchestrator::new(&config).unwrap();

    orchestrator.iteration_zero().await.unwrap();
    let cycle1 = orchestrator.run_cycle(1).await.unwrap();
    assert_eq!(cycle1.coordination.borrows.len(), 1);
    let borrowed = cycle1.coordination.borrows[0].worker.clone();

    let cycle2 = orchestrator.run_cycle(2).await.unwrap();
    assert_eq!(cycle2.team(&TeamId::from("b")).unwrap().throughput, 1);
    assert_eq!(cycle2.dependencies_resolved, 3);
    assert_eq!(cycle2.coordination.returned.len(), 1);
    assert!(cycle2.coordination.borrows.is_empty());

    let org = orchestrator.organization();
    let worker = org.worker(&borrowed).unwrap();
    assert_eq!(worker.current_team_id, worker.home_team_id);
    assert!(org.team(&TeamId::from("b")).unwrap().roster().contains(&borrowed));
    assert!(org.borrows().active().is_empty());
    assert_eq!(org.borrows().archived().len(), 1);
    assert_eq!(org.borrows().archived()[0].ended_cycle, Some(2));
    assert_org_consistent(org);
}

/// Test: A scripted advisor's directive runs through the pass unchanged
///
/// Given an advisor that always asks for b2 to move to a
/// When one cycle runs
/// Then b2 is on loan to a and the pass reports no rejections
#[tokio::test]
async fn test_scripted_directive_is_executed() {
    let config = struggling_pair(1);
    let advisor = Arc::new(ScriptedAdvisor::new("b2", "b", "a"));
    let mut orchestrator = PoolOrchestrator::with_advisor(&config, advisor).unwrap();

    let report = orchestrator.run().await.unwrap();
    let pass = &report.cycles[0].coordination;
    assert_eq!(pass.borrows.len(), 1);
    assert_eq!(pass.borrows[0].worker, WorkerId::from("b2"));
    assert!(pass.rejected.is_empty());
    assert_eq!(report.advisor, "scripted");
}

/// Test: Directives the organization cannot honor are recorded, not executed
///
/// Given an advisor asking to move a1 out of team b, where a1 does not work
/// When one cycle runs
/// Then no worker moves and the directive is listed as rejected with a reason
#[tokio::test]
async fn test_invalid_directive_is_rejected() {
    let config = struggling_pair(1);
    let advisor = Arc::new(ScriptedAdvisor::new("a1", "b", "a"));
    let mut orchestrator = PoolOrchestrator::with_advisor(&config, advisor).unwrap();

    let report = orchestrator.run().await.unwrap();
    let pass = &report.cycles[0].coordination;
    assert!(pass.borrows.is_empty());
    assert_eq!(pass.rejected.len(), 1);
    assert!(pass.rejected[0].reason.contains("roster"));

    let org = orchestrator.organization();
    assert!(org.borrows().active().is_empty());
    assert_eq!(org.team(&TeamId::from("a")).unwrap().roster_size(), 2);
    assert_eq!(org.team(&TeamId::from("b")).unwrap().roster_size(), 3);
}

/// Test: A rejected borrow changes nothing
///
/// Given an organization built from the struggling pair
/// When borrows are attempted for a worker not on the source roster, to a
///      missing team, and below the minimum roster
/// Then each is refused with the matching reason and rosters are unchanged
#[tokio::test]
async fn test_rejected_borrow_leaves_state_untouched() {
    let mut org = Organization::from_config(&struggling_pair(1)).unwrap();
    let a = TeamId::from("a");
    let b = TeamId::from("b");

    let err = org
        .borrow(&b, &a, &WorkerId::from("a1"), 1, "wrong roster", 1)
        .await
        .unwrap_err();
    assert!(matches!(err, BorrowRejection::NotOnSourceRoster { .. }));

    let err = org
        .borrow(&b, &TeamId::from("ghost"), &WorkerId::from("b1"), 1, "nowhere", 1)
        .await
        .unwrap_err();
    assert_eq!(err, BorrowRejection::DestinationMissing(TeamId::from("ghost")));

    let err = org
        .borrow(&a, &b, &WorkerId::from("a1"), 1, "too small", 1)
        .await
        .unwrap_err();
    assert!(matches!(err, BorrowRejection::BelowMinimumRoster { .. }));

    assert!(org.borrows().active().is_empty());
    assert_eq!(org.team(&a).unwrap().roster_size(), 2);
    assert_eq!(org.team(&b).unwrap().roster_size(), 3);
    assert_org_consistent(&org);
    assert!(org.check_invariants().await.is_ok());
}

/// Test: The same worker cannot be lent twice
///
/// Given b1 already on loan to a
/// When b1 is borrowed again
/// Then the second borrow is refused as already borrowed
#[tokio::test]
async fn test_double_borrow_is_refused() {
    let mut org = Organization::from_config(&struggling_pair(1)).unwrap();
    let a = TeamId::from("a");
    let b = TeamId::from("b");
    let b1 = WorkerId::from("b1");

    org.borrow(&b, &a, &b1, 2, "help", 1).await.unwrap();
    let err = org.borrow(&a, &b, &b1, 2, "back", 1).await.unwrap_err();
    assert_eq!(err, BorrowRejection::AlreadyBorrowed(b1.clone()));
    assert_eq!(org.borrows().active().len(), 1);
    assert_org_consistent(&org);
}
