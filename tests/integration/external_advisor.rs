//! End-to-end runs with an external advisor program.

#![cfg(unix)]

use std::path::PathBuf;
use std::sync::Arc;

use tandem::core::WorkerId;
use tandem::orchestration::{CommandAdvisor, PoolOrchestrator};

use crate::fixtures::struggling_pair;

fn shell_advisor(script: &str) -> Arc<CommandAdvisor> {
    Arc::new(CommandAdvisor::with_binary(
        PathBuf::from("/bin/sh"),
        &["-c".to_string(), script.to_string()],
    ))
}

/// Test: A shell script can drive coordination
///
/// Given a script that names a struggling and b as donor, and plans to
///       move b3
/// When one cycle runs
/// Then b3 is on loan to a
#[tokio::test]
async fn test_shell_advisor_moves_worker() {
    let script = r#"
cat > /dev/null
if [ "$0" = evaluate ]; then
  echo '{"struggling":["a"],"donors":["b"]}'
else
  echo '{"directives":[{"worker":"b3","source":"b","destination":"a","reason":"script"}]}'
fi
"#;
    let config = struggling_pair(1);
    let mut orchestrator = PoolOrchestrator::with_advisor(&config, shell_advisor(script)).unwrap();

    let report = orchestrator.run().await.unwrap();
    assert_eq!(report.advisor, "command");
    assert_eq!(report.totals.borrows, 1);
    let record = orchestrator
        .organization()
        .borrows()
        .active_for(&WorkerId::from("b3"))
        .cloned()
        .unwrap();
    assert_eq!(record.destination.as_str(), "a");
    assert_eq!(record.reason, "script");
}

/// Test: A script reporting an error falls back to no action
///
/// Given a script whose evaluate answers with an error object
/// When one cycle runs
/// Then the pass records the failure and no worker moves
#[tokio::test]
async fn test_shell_advisor_error_is_a_failure() {
    let script = r#"cat > /dev/null; echo '{"error":"model unavailable"}'"#;
    let config = struggling_pair(1);
    let mut orchestrator = PoolOrchestrator::with_advisor(&config, shell_advisor(script)).unwrap();

    let report = orchestrator.run().await.unwrap();
    let pass = &report.cycles[0].coordination;
    assert_eq!(pass.failure.as_deref(), Some("Advisor error: model unavailable"));
    assert!(pass.borrows.is_empty());
    assert!(report.cycles[0].checkin.failure.is_some());
}
