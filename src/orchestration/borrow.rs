//! Temporary worker reassignment records.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{TeamId, WorkerId};

/// A worker on loan from `source` to `destination`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BorrowRecord {
    pub id: Uuid,
    pub worker: WorkerId,
    pub source: TeamId,
    pub destination: TeamId,
    pub reason: String,
    /// Cycles left before the worker is due home.
    pub remaining: u32,
    pub started_cycle: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_cycle: Option<u32>,
}

impl BorrowRecord {
    pub fn new(
        worker: WorkerId,
        source: TeamId,
        destination: TeamId,
        reason: &str,
        duration: u32,
        started_cycle: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            worker,
            source,
            destination,
            reason: reason.to_string(),
            remaining: duration,
            started_cycle,
            ended_cycle: None,
        }
    }

    pub fn is_due(&self) -> bool {
        self.remaining == 0
    }

    pub fn involves(&self, team: &TeamId) -> bool {
        &self.source == team || &self.destination == team
    }
}

/// Why a borrow was refused. Nothing changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BorrowRejection {
    UnknownWorker(WorkerId),
    SourceMissing(TeamId),
    DestinationMissing(TeamId),
    NotOnSourceRoster { worker: WorkerId, source: TeamId },
    AlreadyBorrowed(WorkerId),
    SameTeam(TeamId),
    ZeroDuration,
    BelowMinimumRoster { team: TeamId, minimum: usize },
    /// The pass already executed its maximum number of borrows.
    PassLimitReached(usize),
}

impl std::fmt::Display for BorrowRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BorrowRejection::UnknownWorker(w) => write!(f, "unknown worker {}", w),
            BorrowRejection::SourceMissing(t) => write!(f, "source team {} does not exist", t),
            BorrowRejection::DestinationMissing(t) => {
                write!(f, "destination team {} does not exist", t)
            }
            BorrowRejection::NotOnSourceRoster { worker, source } => {
                write!(f, "{} is not on {}'s roster", worker, source)
            }
            BorrowRejection::AlreadyBorrowed(w) => write!(f, "{} is already on loan", w),
            BorrowRejection::SameTeam(t) => write!(f, "cannot borrow from {} to itself", t),
            BorrowRejection::ZeroDuration => f.write_str("borrow duration must be at least 1"),
            BorrowRejection::BelowMinimumRoster { team, minimum } => {
                write!(f, "{} would drop below {} workers", team, minimum)
            }
            BorrowRejection::PassLimitReached(limit) => {
                write!(f, "pass already executed {} borrows", limit)
            }
        }
    }
}

/// Active and archived borrow records.
#[derive(Debug, Clone, Default)]
pub struct BorrowLedger {
    active: Vec<BorrowRecord>,
    archived: Vec<BorrowRecord>,
}

impl BorrowLedger {
    pub fn active(&self) -> &[BorrowRecord] {
        &self.active
    }

    pub fn archived(&self) -> &[BorrowRecord] {
        &self.archived
    }

    pub fn active_for(&self, worker: &WorkerId) -> Option<&BorrowRecord> {
        self.active.iter().find(|r| &r.worker == worker)
    }

    pub(crate) fn open(&mut self, record: BorrowRecord) {
        self.active.push(record);
    }

    /// Count down every active record by one cycle.
    pub fn tick(&mut self) {
        for record in &mut self.active {
            record.remaining = record.remaining.saturating_sub(1);
        }
    }

    /// Workers whose loan has run out.
    pub fn due(&self) -> Vec<WorkerId> {
        self.active
            .iter()
            .filter(|r| r.is_due())
            .map(|r| r.worker.clone())
            .collect()
    }

    /// Close a worker's active record.
    pub(crate) fn archive(&mut self, worker: &WorkerId, cycle: u32) -> Option<BorrowRecord> {
        let index = self.active.iter().position(|r| &r.worker == worker)?;
        let mut record = self.active.remove(index);
        record.ended_cycle = Some(cycle);
        self.archived.push(record.clone());
        Some(record)
    }

    /// Active and archived records touching a team.
    pub fn for_team(&self, team: &TeamId) -> Vec<BorrowRecord> {
        self.active
            .iter()
            .chain(self.archived.iter())
            .filter(|r| r.involves(team))
            .cloned()
            .collect()
    }

    pub fn total(&self) -> usize {
        self.active.len() + self.archived.len()
    }
}
