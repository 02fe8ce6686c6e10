//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Building small team configurations
//! - A quiet configuration with no disturbances
//! - Scripted advisors with controllable latency

use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use tandem::config::{CardConfig, DependencyConfig, SimConfig, TeamConfig, WorkerConfig};
use tandem::core::{DependencyType, Priority, Seniority, WorkerRole};
use tandem::orchestration::{Advisor, Assessment, BorrowDirective, HealthPayload, Organization, Plan};
use tandem::{Error, Result};

pub fn engineer(id: &str) -> WorkerConfig {
    WorkerConfig {
        id: id.to_string(),
        role: WorkerRole::Engineer,
        seniority: Seniority::Mid,
        specializations: Vec::new(),
    }
}

pub fn card(title: &str, weight: u32) -> CardConfig {
    CardConfig {
        title: title.to_string(),
        weight,
        priority: Priority::Normal,
        depends_on: None,
    }
}

/// A card that starts blocked on `team` and unblocks once that team
/// delivers anything.
pub fn blocked_on(title: &str, team: &str) -> CardConfig {
    CardConfig {
        depends_on: Some(DependencyConfig {
            team: team.to_string(),
            dependency_type: DependencyType::Blocks,
            provider: None,
        }),
        ..card(title, 2)
    }
}

pub fn team(id: &str, workers: &[&str], backlog: Vec<CardConfig>) -> TeamConfig {
    TeamConfig {
        id: id.to_string(),
        topology: Default::default(),
        capacity: None,
        workers: workers.iter().map(|w| engineer(w)).collect(),
        backlog,
    }
}

/// Deterministic config: no disturbances, no tester injection, fixed seed.
pub fn quiet_config(teams: Vec<TeamConfig>, cycles: u32) -> SimConfig {
    let mut config = SimConfig::default();
    config.simulation.cycles = cycles;
    config.simulation.seed = Some(1);
    config.pairing.tester_injection_rate = 0.0;
    config.disturbances.kinds.clear();
    config.teams = teams;
    config
}

/// Team `a` (two workers) has three cards blocked on team `b`; team `b`
/// (three idle workers) has nothing blocked and an empty backlog.
pub fn struggling_pair(cycles: u32) -> SimConfig {
    quiet_config(
        vec![
            team(
                "a",
                &["a1", "a2"],
                vec![
                    blocked_on("Checkout flow", "b"),
                    blocked_on("Order history", "b"),
                    blocked_on("Refunds", "b"),
                ],
            ),
            team("b", &["b1", "b2", "b3"], Vec::new()),
        ],
        cycles,
    )
}

/// Check borrow exclusivity and location consistency across the org.
pub fn assert_org_consistent(org: &Organization) {
    for worker in org.workers() {
        let records: Vec<_> = org
            .borrows()
            .active()
            .iter()
            .filter(|r| r.worker == worker.id)
            .collect();
        assert!(records.len() <= 1, "{} has {} active loans", worker.id, records.len());
        assert_eq!(
            records.is_empty(),
            worker.current_team_id == worker.home_team_id,
            "{} location does not match its loans",
            worker.id
        );
        let team = org.team(&worker.current_team_id).expect("current team exists");
        assert!(team.roster().contains(&worker.id));
    }
}

/// Advisor that always wants `worker` moved from `source` to
/// `destination`, answering evaluate after `evaluate_delay` and plan after
/// `plan_delay`.
pub struct ScriptedAdvisor {
    pub directive: BorrowDirective,
    pub evaluate_delay: Duration,
    pub plan_delay: Duration,
    pub fail_plan: bool,
}

impl ScriptedAdvisor {
    pub fn new(worker: &str, source: &str, destination: &str) -> Self {
        Self {
            directive: BorrowDirective {
                worker: worker.into(),
                source: source.into(),
                destination: destination.into(),
                reason: "scripted".to_string(),
            },
            evaluate_delay: Duration::ZERO,
            plan_delay: Duration::ZERO,
            fail_plan: false,
        }
    }

    pub fn slow(mut self, plan_delay: Duration) -> Self {
        self.plan_delay = plan_delay;
        self
    }

    pub fn slow_evaluate(mut self, evaluate_delay: Duration) -> Self {
        self.evaluate_delay = evaluate_delay;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail_plan = true;
        self
    }
}

impl Advisor for ScriptedAdvisor {
    fn name(&self) -> &str {
        "scripted"
    }

    fn evaluate(
        &self,
        payload: HealthPayload,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<Assessment>> {
        let struggling = vec![self.directive.destination.clone()];
        let donors = vec![self.directive.source.clone()];
        let delay = self.evaluate_delay;
        Box::pin(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(Error::Advisor("cancelled".to_string())),
            }
            Ok(Assessment {
                cycle: payload.cycle,
                struggling,
                donors,
                notes: Vec::new(),
                payload,
            })
        })
    }

    fn plan(&self, _assessment: Assessment, cancel: CancellationToken) -> BoxFuture<'static, Result<Plan>> {
        let directive = self.directive.clone();
        let delay = self.plan_delay;
        let fail = self.fail_plan;
        Box::pin(async move {
            if fail {
                return Err(Error::Advisor("planner unavailable".to_string()));
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(Error::Advisor("cancelled".to_string())),
            }
            Ok(Plan {
                directives: vec![directive],
                notes: Vec::new(),
            })
        })
    }
}
