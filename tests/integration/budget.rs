//! Overhead budget split and accounting over a run.

use tandem::config::SimConfig;
use tandem::orchestration::{PoolOrchestrator, StepName};

/// Test: The default budget splits as documented
///
/// Given the default budget of 2160s, 40% for iteration zero, three cycles
/// When the orchestrator is built
/// Then iteration zero gets 864s, each cycle 432s, split 216/129.6/86.4
#[test]
fn test_default_allocation() {
    let mut config = SimConfig::sample();
    config.simulation.cycles = 3;
    let orchestrator = PoolOrchestrator::new(&config).unwrap();
    let allocation = orchestrator.budget().allocation();

    let close = |a: f64, b: f64| (a - b).abs() < 1e-9;
    assert!(close(allocation.iteration_zero_seconds, 864.0));
    assert!(close(allocation.per_cycle_seconds, 432.0));
    assert!(close(allocation.deadline_seconds(StepName::Coordination), 216.0));
    assert!(close(allocation.deadline_seconds(StepName::Distribution), 129.6));
    assert!(close(allocation.deadline_seconds(StepName::Checkin), 86.4));
}

/// Test: Spend equals the sum of the audit trail
///
/// Given the sample organization
/// When a full run completes
/// Then spent seconds match the audit sum, remaining is total minus spent,
///      and every cycle has distribution, checkin and evaluate entries
#[tokio::test]
async fn test_spend_matches_audit() {
    let config = SimConfig::sample();
    let mut orchestrator = PoolOrchestrator::new(&config).unwrap();
    let report = orchestrator.run().await.unwrap();

    let audited: f64 = report.audit.iter().map(|r| r.elapsed_seconds).sum();
    let budget = orchestrator.budget();
    assert!((budget.spent_seconds() - audited).abs() < 1e-3);
    assert!(
        (budget.remaining_seconds() - (budget.allocation().total_seconds - budget.spent_seconds())).abs()
            < 1e-9
    );

    assert_eq!(report.audit[0].step, "iteration_zero");
    assert_eq!(report.audit[0].phase, None);
    for cycle in 1..=config.simulation.cycles {
        let steps: Vec<&str> = report
            .audit
            .iter()
            .filter(|r| r.cycle == cycle)
            .map(|r| r.step.as_str())
            .collect();
        for expected in ["distribution", "checkin", "evaluate"] {
            assert!(steps.contains(&expected), "cycle {} lacks {}", cycle, expected);
        }
    }
    assert_eq!(report.budget.spent_seconds, budget.spent_seconds());
}
