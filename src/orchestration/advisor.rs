//! Decision-making collaborators for the coordination loop.
//!
//! An [`Advisor`] looks at team health and recommends borrows. Both calls
//! return boxed `'static` futures so the coordination loop can run them as
//! their own tasks and abandon them at the deadline. Implementations should
//! watch the [`CancellationToken`] and stop early once it fires.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::{AdvisorConfig, CoordinationConfig, SimConfig};
use crate::core::{DependencyFact, TeamId, WorkerId, WorkerRole};
use crate::orchestration::external::CommandAdvisor;
use crate::orchestration::health::{MemberStatus, TeamHealth};
use crate::Result;

/// Everything the advisor gets to see.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthPayload {
    pub cycle: u32,
    pub teams: Vec<TeamHealth>,
    pub dependencies: Vec<DependencyFact>,
    /// Groups of teams that wait on each other.
    pub dependency_cycles: Vec<Vec<TeamId>>,
}

impl HealthPayload {
    pub fn team(&self, id: &TeamId) -> Option<&TeamHealth> {
        self.teams.iter().find(|t| &t.team == id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub cycle: u32,
    /// Teams that need help, most urgent first.
    pub struggling: Vec<TeamId>,
    /// Teams that can spare a worker, most spare capacity first.
    pub donors: Vec<TeamId>,
    #[serde(default)]
    pub notes: Vec<String>,
    /// The health the assessment was made from.
    #[serde(default)]
    pub payload: HealthPayload,
}

impl Assessment {
    pub fn needs_action(&self) -> bool {
        !self.struggling.is_empty() && !self.donors.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BorrowDirective {
    pub worker: WorkerId,
    pub source: TeamId,
    pub destination: TeamId,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub directives: Vec<BorrowDirective>,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl Plan {
    pub fn no_action() -> Self {
        Self::default()
    }
}

pub trait Advisor: Send + Sync {
    fn name(&self) -> &str;

    fn evaluate(
        &self,
        payload: HealthPayload,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<Assessment>>;

    fn plan(&self, assessment: Assessment, cancel: CancellationToken) -> BoxFuture<'static, Result<Plan>>;
}

/// Build the advisor named in the configuration.
pub fn from_config(config: &SimConfig) -> Result<Arc<dyn Advisor>> {
    match &config.advisor {
        AdvisorConfig::Heuristic => Ok(Arc::new(HeuristicAdvisor::from_config(&config.coordination))),
        AdvisorConfig::Command { program, args } => Ok(Arc::new(CommandAdvisor::new(program, args)?)),
    }
}

/// Deterministic rules: teams with many blocked cards borrow idle
/// engineers from teams with nothing blocked and people to spare.
#[derive(Debug, Clone)]
pub struct HeuristicAdvisor {
    struggling_blocked_threshold: usize,
    min_roster_size: usize,
    max_borrows: usize,
}

impl HeuristicAdvisor {
    pub fn new(struggling_blocked_threshold: usize, min_roster_size: usize, max_borrows: usize) -> Self {
        Self {
            struggling_blocked_threshold: struggling_blocked_threshold.max(1),
            min_roster_size,
            max_borrows,
        }
    }

    pub fn from_config(config: &CoordinationConfig) -> Self {
        Self::new(
            config.struggling_blocked_threshold,
            config.min_roster_size,
            config.max_borrows_per_cycle,
        )
    }

    fn lendable(member: &MemberStatus) -> bool {
        member.role != WorkerRole::Lead && !member.on_loan && !member.unavailable
    }

    fn spare(&self, team: &TeamHealth) -> usize {
        team.roster_size().saturating_sub(self.min_roster_size)
    }

    pub fn assess(&self, payload: HealthPayload) -> Assessment {
        let mut struggling: Vec<&TeamHealth> = payload
            .teams
            .iter()
            .filter(|t| t.blocked >= self.struggling_blocked_threshold)
            .collect();
        struggling.sort_by(|a, b| b.blocked.cmp(&a.blocked).then_with(|| a.team.cmp(&b.team)));

        let mut donors: Vec<&TeamHealth> = payload
            .teams
            .iter()
            .filter(|t| t.blocked == 0 && self.spare(t) > 0)
            .filter(|t| t.members.iter().any(Self::lendable))
            .collect();
        donors.sort_by(|a, b| self.spare(b).cmp(&self.spare(a)).then_with(|| a.team.cmp(&b.team)));

        let mut notes: Vec<String> = struggling
            .iter()
            .map(|t| format!("{} has {} blocked cards", t.team, t.blocked))
            .collect();
        for cycle in &payload.dependency_cycles {
            let names: Vec<&str> = cycle.iter().map(TeamId::as_str).collect();
            notes.push(format!("dependency cycle between {}", names.join(", ")));
        }

        Assessment {
            cycle: payload.cycle,
            struggling: struggling.iter().map(|t| t.team.clone()).collect(),
            donors: donors.iter().map(|t| t.team.clone()).collect(),
            notes,
            payload,
        }
    }

    pub fn decide(&self, assessment: &Assessment) -> Plan {
        let mut plan = Plan::no_action();
        let mut spare: Vec<(TeamId, usize)> = assessment
            .donors
            .iter()
            .filter_map(|id| assessment.payload.team(id).map(|t| (id.clone(), self.spare(t))))
            .collect();
        let mut taken: Vec<WorkerId> = Vec::new();

        for needy in &assessment.struggling {
            if plan.directives.len() >= self.max_borrows {
                break;
            }
            // Donor with the most spare people left.
            let Some((donor, left)) = spare
                .iter_mut()
                .filter(|(id, left)| id != needy && *left > 0)
                .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
            else {
                plan.notes.push(format!("no donor available for {}", needy));
                continue;
            };
            let Some(donor_health) = assessment.payload.team(donor) else {
                continue;
            };

            let mut candidates: Vec<&MemberStatus> = donor_health
                .members
                .iter()
                .filter(|m| Self::lendable(m) && !taken.contains(&m.worker))
                .collect();
            candidates.sort_by(|a, b| {
                (a.busy, a.role == WorkerRole::Tester, &a.worker)
                    .cmp(&(b.busy, b.role == WorkerRole::Tester, &b.worker))
            });
            let Some(member) = candidates.first() else {
                continue;
            };

            let blocked = assessment.payload.team(needy).map(|t| t.blocked).unwrap_or(0);
            plan.directives.push(BorrowDirective {
                worker: member.worker.clone(),
                source: donor.clone(),
                destination: needy.clone(),
                reason: format!("{} has {} blocked cards", needy, blocked),
            });
            taken.push(member.worker.clone());
            *left -= 1;
        }
        plan
    }
}

impl Advisor for HeuristicAdvisor {
    fn name(&self) -> &str {
        "heuristic"
    }

    fn evaluate(
        &self,
        payload: HealthPayload,
        _cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<Assessment>> {
        let advisor = self.clone();
        Box::pin(async move { Ok(advisor.assess(payload)) })
    }

    fn plan(&self, assessment: Assessment, _cancel: CancellationToken) -> BoxFuture<'static, Result<Plan>> {
        let advisor = self.clone();
        Box::pin(async move { Ok(advisor.decide(&assessment)) })
    }
}
