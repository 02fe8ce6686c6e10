//! JSON store output of a complete run.

use std::sync::Arc;

use tandem::core::TeamId;
use tandem::orchestration::PoolOrchestrator;
use tandem::state::{JsonStore, Store, RUN_SCOPE};
use tempfile::TempDir;

use crate::fixtures::{card, struggling_pair};

/// Test: A run leaves boards, loans and the audit trail on disk
///
/// Given the struggling pair with a JSON store
/// When two cycles run
/// Then each team has a board file, both teams list the loan once with its
///      final state, and the run audit matches the in-memory trail
#[tokio::test]
async fn test_run_persists_to_json_store() {
    let dir = TempDir::new().unwrap();
    let mut config = struggling_pair(2);
    config.teams[1].backlog.push(card("Search index", 1));

    let store = Arc::new(JsonStore::open(dir.path()).unwrap());
    let mut orchestrator = PoolOrchestrator::new(&config)
        .unwrap()
        .with_store(Arc::clone(&store) as Arc<dyn Store>);
    let report = orchestrator.run().await.unwrap();

    for team in ["a", "b"] {
        assert!(dir.path().join(team).join("board.json").exists());
        let board = store.get_board(&TeamId::from(team)).unwrap().unwrap();
        assert_eq!(board.team_id, TeamId::from(team));
    }
    assert!(dir.path().join(RUN_SCOPE).join("audit.json").exists());

    let a_loans = store.list_borrows(&TeamId::from("a")).unwrap();
    let b_loans = store.list_borrows(&TeamId::from("b")).unwrap();
    assert_eq!(a_loans.len(), 1);
    assert_eq!(b_loans.len(), 1);
    assert_eq!(a_loans[0].id, b_loans[0].id);
    assert_eq!(a_loans[0].ended_cycle, Some(2));

    let audit = store.list_audit(RUN_SCOPE).unwrap();
    assert_eq!(audit.len(), report.audit.len());
    assert_eq!(audit[0].step, "iteration_zero");
}

/// Test: A store that cannot be written does not stop the run
///
/// Given a JSON store whose root was replaced by a plain file
/// When a cycle runs
/// Then the run completes and reports the cycle
#[tokio::test]
async fn test_store_failure_is_not_fatal() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("state");
    let store: Arc<dyn Store> = Arc::new(JsonStore::open(&root).unwrap());
    std::fs::remove_dir_all(&root).unwrap();
    std::fs::write(&root, "not a directory").unwrap();

    let config = struggling_pair(1);
    let mut orchestrator = PoolOrchestrator::new(&config).unwrap().with_store(store);
    let report = orchestrator.run().await.unwrap();
    assert_eq!(report.cycles.len(), 1);
}
