//! Disturbance impact caps over complete runs.

use tandem::config::SimConfig;
use tandem::orchestration::{DisturbanceKind, DisturbanceSpec, PoolOrchestrator};

const CAP: f64 = 0.3;

fn capped(window_cycles: u32) -> SimConfig {
    let mut config = SimConfig::sample();
    config.simulation.seed = Some(5);
    config.simulation.cycles = 4;
    config.disturbances.max_velocity_impact = CAP;
    config.disturbances.max_quality_regression = 10.0;
    config.disturbances.window_cycles = window_cycles;
    config.disturbances.kinds = [DisturbanceKind::ProductionIncident, DisturbanceKind::ScopeCreep]
        .into_iter()
        .map(|kind| DisturbanceSpec {
            kind,
            probability: 1.0,
            velocity_impact: 0.1,
            quality_impact: 0.0,
        })
        .collect();
    config
}

/// Test: Velocity impact never exceeds the cap
///
/// Given certain disturbances of 0.1 each against a 0.3 cap over the whole run
/// When four cycles run
/// Then at most three disturbances apply, the rest are suppressed, and
///      nothing applies after the cap is reached
#[tokio::test]
async fn test_velocity_cap_is_never_exceeded() {
    let config = capped(0);
    let mut orchestrator = PoolOrchestrator::new(&config).unwrap();
    let report = orchestrator.run().await.unwrap();

    let mut exhausted_before = false;
    for cycle in &report.cycles {
        assert!(cycle.impact.velocity <= CAP + 1e-9, "cycle {}", cycle.cycle);
        if exhausted_before {
            assert!(cycle.disturbances.iter().all(|d| !d.is_applied()));
        }
        exhausted_before = cycle.impact.exhausted;
    }

    assert_eq!(report.totals.disturbances_applied, 3);
    assert!(report.totals.disturbances_suppressed > 0);
    assert!(orchestrator.engine().ledger().exhausted);
}

/// Test: The cap applies per measurement window
///
/// Given the same disturbances with a two-cycle window
/// When four cycles run
/// Then the ledger resets at cycle 3 and up to the cap applies again
#[tokio::test]
async fn test_window_reset_restores_headroom() {
    let config = capped(2);
    let mut orchestrator = PoolOrchestrator::new(&config).unwrap();
    let report = orchestrator.run().await.unwrap();

    assert_eq!(report.cycles[2].impact.window_start, 3);
    assert_eq!(report.totals.disturbances_applied, 6);
    for cycle in &report.cycles {
        assert!(cycle.impact.velocity <= CAP + 1e-9);
    }
}
