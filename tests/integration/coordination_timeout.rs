//! Coordination fallback when the advisor is slow or broken.

use std::sync::Arc;
use std::time::Duration;

use tandem::bus::{Channel, Payload};
use tandem::orchestration::{PoolOrchestrator, StepName};

use crate::fixtures::{assert_org_consistent, struggling_pair, ScriptedAdvisor};

/// Test: A planner that overruns its deadline takes no action
///
/// Given an advisor whose plan step takes far longer than the cycle budget
/// When two cycles run on a paused clock
/// Then both passes time out, no worker moves, the audit marks each plan as
///      timed out, and the run still completes every cycle
#[tokio::test(start_paused = true)]
async fn test_slow_planner_falls_back_to_no_action() {
    let config = struggling_pair(2);
    let advisor = Arc::new(ScriptedAdvisor::new("b1", "b", "a").slow(Duration::from_secs(100_000)));
    let mut orchestrator = PoolOrchestrator::with_advisor(&config, advisor).unwrap();

    let report = orchestrator.run().await.unwrap();

    assert_eq!(report.cycles.len(), 2);
    for cycle in &report.cycles {
        assert!(cycle.coordination.timed_out);
        assert!(cycle.coordination.fell_back());
        assert!(cycle.coordination.borrows.is_empty());
    }
    assert_eq!(report.totals.coordination_timeouts, 2);
    assert_eq!(report.totals.borrows, 0);

    let plans: Vec<_> = report.audit.iter().filter(|r| r.step == "plan").collect();
    assert_eq!(plans.len(), 2);
    for plan in plans {
        assert!(plan.timed_out);
        assert_eq!(plan.phase, Some(StepName::Coordination));
        assert!(plan.elapsed_seconds <= plan.deadline_seconds + 1.0);
    }

    let org = orchestrator.organization();
    assert!(org.borrows().active().is_empty());
    assert_org_consistent(org);
}

/// Test: An evaluation that overruns its deadline skips planning
///
/// Given an advisor whose evaluate step takes far longer than the cycle budget
/// When one cycle runs on a paused clock
/// Then the evaluate record is marked timed out, no plan step is audited,
///      nobody is borrowed, and the checkin reports its own timeout
#[tokio::test(start_paused = true)]
async fn test_slow_evaluation_skips_plan() {
    let config = struggling_pair(1);
    let advisor = Arc::new(ScriptedAdvisor::new("b1", "b", "a").slow_evaluate(Duration::from_secs(100_000)));
    let mut orchestrator = PoolOrchestrator::with_advisor(&config, advisor).unwrap();

    let report = orchestrator.run().await.unwrap();
    let cycle = &report.cycles[0];

    assert!(cycle.coordination.timed_out);
    assert!(cycle.coordination.borrows.is_empty());
    assert_eq!(report.totals.borrows, 0);

    let evaluations: Vec<_> = report.audit.iter().filter(|r| r.step == "evaluate").collect();
    assert_eq!(evaluations.len(), 1);
    assert!(evaluations[0].timed_out);
    assert!(report.audit.iter().all(|r| r.step != "plan"));

    assert!(cycle.checkin.timed_out);
    assert!(cycle.checkin.assessment.is_none());

    assert!(orchestrator.organization().borrows().active().is_empty());
    assert_org_consistent(orchestrator.organization());
}

/// Test: A failing planner is reported as a no-action pass
///
/// Given an advisor whose plan step returns an error
/// When one cycle runs
/// Then the pass records the failure, moves nobody, and the coordination
///      channel carries a no-action notice instead of a summary
#[tokio::test]
async fn test_failing_planner_broadcasts_no_action_notice() {
    let config = struggling_pair(1);
    let advisor = Arc::new(ScriptedAdvisor::new("b1", "b", "a").failing());
    let mut orchestrator = PoolOrchestrator::with_advisor(&config, advisor).unwrap();
    let mut notices = orchestrator.bus().subscribe(Channel::Coordination);

    let report = orchestrator.run().await.unwrap();
    let pass = &report.cycles[0].coordination;
    assert!(!pass.timed_out);
    assert!(pass.failure.as_deref().unwrap_or_default().contains("planner unavailable"));
    assert!(pass.borrows.is_empty());
    assert_eq!(report.totals.coordination_failures, 1);

    let messages = notices.drain();
    assert!(messages.iter().any(|m| matches!(
        &m.payload,
        Payload::CoordinationSkipped { timed_out: false, reason, .. } if reason.contains("planner unavailable")
    )));
    assert!(!messages
        .iter()
        .any(|m| matches!(m.payload, Payload::CoordinationSummary { .. })));
}

/// Test: The checkin never moves anyone
///
/// Given the struggling pair and the heuristic advisor
/// When one cycle runs
/// Then the checkin produced an assessment naming team a as struggling,
///      and the only borrow came from the full pass
#[tokio::test]
async fn test_checkin_is_observational() {
    let config = struggling_pair(1);
    let mut orchestrator = PoolOrchestrator::new(&config).unwrap();

    let report = orchestrator.run().await.unwrap();
    let cycle = &report.cycles[0];
    let assessment = cycle.checkin.assessment.as_ref().unwrap();
    assert_eq!(assessment.struggling.len(), 1);
    assert_eq!(assessment.struggling[0].as_str(), "a");
    assert_eq!(report.totals.borrows, 1);

    let checkins: Vec<_> = report.audit.iter().filter(|r| r.step == "checkin").collect();
    assert_eq!(checkins.len(), 1);
    assert_eq!(checkins[0].phase, Some(StepName::Checkin));
}
