//! Team health snapshots.
//!
//! Health is gathered from published board snapshots only, so it can run
//! while team cycles are still writing to their boards.

use serde::{Deserialize, Serialize};

use crate::config::Topology;
use crate::core::{CardStatus, Seniority, TeamId, WorkerId, WorkerRole};
use crate::orchestration::organization::Organization;

/// A roster member as seen by the advisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberStatus {
    pub worker: WorkerId,
    pub role: WorkerRole,
    pub seniority: Seniority,
    pub busy: bool,
    pub on_loan: bool,
    /// In transit or due home; cannot be moved again this pass.
    pub unavailable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamHealth {
    pub team: TeamId,
    pub topology: Topology,
    pub ready: usize,
    pub in_progress: usize,
    pub review: usize,
    pub blocked: usize,
    pub done: usize,
    pub in_progress_limit: Option<usize>,
    pub review_limit: Option<usize>,
    /// Cards completed in the last finished cycle.
    pub last_throughput: usize,
    pub members: Vec<MemberStatus>,
}

impl TeamHealth {
    pub fn roster_size(&self) -> usize {
        self.members.len()
    }

    pub fn wip(&self) -> usize {
        self.in_progress + self.review
    }
}

pub fn gather(org: &Organization) -> Vec<TeamHealth> {
    org.teams()
        .map(|team| {
            let snapshot = team.board.snapshot();
            let unavailable = org.unavailable_for(&team.id);
            let members = team
                .roster()
                .iter()
                .filter_map(|id| org.worker(id))
                .map(|w| MemberStatus {
                    worker: w.id.clone(),
                    role: w.role,
                    seniority: w.seniority,
                    busy: w.busy,
                    on_loan: w.is_on_loan(),
                    unavailable: unavailable.contains(&w.id),
                })
                .collect();
            TeamHealth {
                team: team.id.clone(),
                topology: team.topology,
                ready: snapshot.count(CardStatus::Ready),
                in_progress: snapshot.count(CardStatus::InProgress),
                review: snapshot.count(CardStatus::Review),
                blocked: snapshot.count(CardStatus::Blocked),
                done: snapshot.count(CardStatus::Done),
                in_progress_limit: snapshot.limits.limit(CardStatus::InProgress),
                review_limit: snapshot.limits.limit(CardStatus::Review),
                last_throughput: team.last_throughput,
                members,
            }
        })
        .collect()
}
