//! Teams, workers and loans.
//!
//! The organization is an arena: teams live in a map keyed by id, workers in
//! a second map that doubles as the worker-location index (each worker's
//! `current_team_id`), and loans in a [`BorrowLedger`]. Cross references are
//! always ids. Only the orchestrator and the coordination loop mutate it.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::config::{SimConfig, Topology};
use crate::core::{
    BoardSnapshot, CardId, Dependency, SharedBoard, TaskBoard, TaskCard, TeamId, Worker, WorkerId,
};
use crate::orchestration::borrow::{BorrowLedger, BorrowRecord, BorrowRejection};
use crate::{tlog, tlog_debug, Error, Result};

/// One team ("pool"): its board and active roster.
pub struct TeamHandle {
    pub id: TeamId,
    pub topology: Topology,
    pub board: Arc<SharedBoard>,
    roster: BTreeSet<WorkerId>,
    /// Cards completed in the last finished cycle.
    pub last_throughput: usize,
    pub last_points: u32,
}

impl TeamHandle {
    pub fn roster(&self) -> &BTreeSet<WorkerId> {
        &self.roster
    }

    pub fn roster_size(&self) -> usize {
        self.roster.len()
    }
}

/// Outcome of the return step of a coordination pass.
#[derive(Debug, Clone, Default)]
pub struct ReturnSummary {
    pub returned: Vec<BorrowRecord>,
    /// Due, but still finishing a session on the destination board.
    pub deferred: Vec<WorkerId>,
}

pub struct Organization {
    teams: BTreeMap<TeamId, TeamHandle>,
    workers: HashMap<WorkerId, Worker>,
    borrows: BorrowLedger,
    /// Borrowed workers sitting out their first destination cycle.
    in_transit: HashSet<WorkerId>,
    min_roster_size: usize,
}

impl Organization {
    pub fn new(min_roster_size: usize) -> Self {
        Self {
            teams: BTreeMap::new(),
            workers: HashMap::new(),
            borrows: BorrowLedger::default(),
            in_transit: HashSet::new(),
            min_roster_size,
        }
    }

    /// Build every team, roster and backlog from configuration.
    ///
    /// Dependency providers are matched by card title on the providing
    /// team, so all cards are created before any dependency is attached.
    pub fn from_config(config: &SimConfig) -> Result<Self> {
        let mut org = Self::new(config.coordination.min_roster_size);

        let mut planned: Vec<(TeamId, Vec<TaskCard>)> = Vec::new();
        let mut titles: HashMap<(String, String), CardId> = HashMap::new();
        for team in &config.teams {
            let team_id = team.team_id();
            let cards: Vec<TaskCard> = team
                .backlog
                .iter()
                .map(|c| TaskCard::new(&c.title, c.weight, team_id.clone()).with_priority(c.priority))
                .collect();
            for card in &cards {
                titles
                    .entry((team.id.clone(), card.title.clone()))
                    .or_insert(card.id);
            }
            planned.push((team_id, cards));
        }

        for (team, (team_id, cards)) in config.teams.iter().zip(planned) {
            let mut board = TaskBoard::new(team_id.clone(), config.capacity_for(team));
            for (card, spec) in cards.into_iter().zip(&team.backlog) {
                let card = match &spec.depends_on {
                    Some(dep) => {
                        let mut dependency =
                            Dependency::open(TeamId::from(dep.team.as_str()), dep.dependency_type);
                        if let Some(provider) = &dep.provider {
                            let key = (dep.team.clone(), provider.clone());
                            if let Some(id) = titles.get(&key) {
                                dependency = dependency.with_provider(*id);
                            }
                        }
                        card.with_dependency(&dependency)
                    }
                    None => card,
                };
                let title = card.title.clone();
                board.add(card).map_err(|rejection| {
                    Error::Config(format!(
                        "team '{}' cannot plan '{}': {}",
                        team.id, title, rejection
                    ))
                })?;
            }
            org.add_team(team_id.clone(), team.topology, board);

            for spec in &team.workers {
                let specializations: Vec<&str> =
                    spec.specializations.iter().map(String::as_str).collect();
                let worker = Worker::new(&spec.id, &team_id, spec.role, spec.seniority)
                    .with_specializations(&specializations);
                org.add_worker(worker)?;
            }
        }

        tlog!(
            "organization: {} teams, {} workers",
            org.teams.len(),
            org.workers.len()
        );
        Ok(org)
    }

    pub fn add_team(&mut self, id: TeamId, topology: Topology, board: TaskBoard) {
        self.teams.insert(
            id.clone(),
            TeamHandle {
                id,
                topology,
                board: Arc::new(SharedBoard::new(board)),
                roster: BTreeSet::new(),
                last_throughput: 0,
                last_points: 0,
            },
        );
    }

    /// Place a worker on its current team's roster.
    pub fn add_worker(&mut self, worker: Worker) -> Result<()> {
        if self.workers.contains_key(&worker.id) {
            return Err(Error::Config(format!("worker '{}' added twice", worker.id)));
        }
        let team = self
            .teams
            .get_mut(&worker.current_team_id)
            .ok_or_else(|| Error::TeamNotFound(worker.current_team_id.clone()))?;
        team.roster.insert(worker.id.clone());
        self.workers.insert(worker.id.clone(), worker);
        Ok(())
    }

    pub fn team(&self, id: &TeamId) -> Option<&TeamHandle> {
        self.teams.get(id)
    }

    pub fn teams(&self) -> impl Iterator<Item = &TeamHandle> {
        self.teams.values()
    }

    pub fn team_ids(&self) -> Vec<TeamId> {
        self.teams.keys().cloned().collect()
    }

    pub fn worker(&self, id: &WorkerId) -> Option<&Worker> {
        self.workers.get(id)
    }

    pub fn workers(&self) -> impl Iterator<Item = &Worker> {
        self.workers.values()
    }

    pub fn borrows(&self) -> &BorrowLedger {
        &self.borrows
    }

    pub fn min_roster_size(&self) -> usize {
        self.min_roster_size
    }

    /// Copies of the workers on a team's active roster, in id order.
    pub fn roster_workers(&self, team: &TeamId) -> Vec<Worker> {
        self.teams
            .get(team)
            .map(|t| {
                t.roster
                    .iter()
                    .filter_map(|id| self.workers.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn snapshots(&self) -> Vec<Arc<BoardSnapshot>> {
        self.teams.values().map(|t| t.board.snapshot()).collect()
    }

    pub fn is_in_transit(&self, worker: &WorkerId) -> bool {
        self.in_transit.contains(worker)
    }

    /// Roster members that may not start a new pairing session this cycle:
    /// workers in transit and workers whose loan is due but deferred.
    pub fn unavailable_for(&self, team: &TeamId) -> HashSet<WorkerId> {
        let Some(handle) = self.teams.get(team) else {
            return HashSet::new();
        };
        handle
            .roster
            .iter()
            .filter(|w| {
                self.in_transit.contains(*w)
                    || self.borrows.active_for(w).map(|r| r.is_due()).unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    fn in_session(&self, worker: &WorkerId) -> bool {
        self.teams.values().any(|team| {
            team.board
                .snapshot()
                .all_cards()
                .filter_map(|c| c.assigned_pair.as_ref())
                .any(|p| p.contains(worker))
        })
    }

    /// Move `worker` from `source` to `destination` for `duration` cycles.
    ///
    /// # Errors
    ///
    /// Returns a [`BorrowRejection`] and changes nothing if the worker or
    /// either team is unknown, the worker is not on the source roster or is
    /// already on loan, or the source would drop below the minimum roster.
    pub async fn borrow(
        &mut self,
        source: &TeamId,
        destination: &TeamId,
        worker: &WorkerId,
        duration: u32,
        reason: &str,
        cycle: u32,
    ) -> std::result::Result<BorrowRecord, BorrowRejection> {
        if duration == 0 {
            return Err(BorrowRejection::ZeroDuration);
        }
        if source == destination {
            return Err(BorrowRejection::SameTeam(source.clone()));
        }
        if !self.workers.contains_key(worker) {
            return Err(BorrowRejection::UnknownWorker(worker.clone()));
        }
        let source_handle = self
            .teams
            .get(source)
            .ok_or_else(|| BorrowRejection::SourceMissing(source.clone()))?;
        if !self.teams.contains_key(destination) {
            return Err(BorrowRejection::DestinationMissing(destination.clone()));
        }
        if !source_handle.roster.contains(worker) {
            return Err(BorrowRejection::NotOnSourceRoster {
                worker: worker.clone(),
                source: source.clone(),
            });
        }
        if self.borrows.active_for(worker).is_some() {
            return Err(BorrowRejection::AlreadyBorrowed(worker.clone()));
        }
        if source_handle.roster.len() <= self.min_roster_size {
            return Err(BorrowRejection::BelowMinimumRoster {
                team: source.clone(),
                minimum: self.min_roster_size,
            });
        }

        // Accepted. Dissolve any session on the source board first.
        let source_board = Arc::clone(&source_handle.board);
        let released = source_board.write().await.release_worker(worker);
        if let Some((card, pair)) = &released {
            tlog_debug!(
                "borrow: dissolved session {} on card {} for {}",
                pair,
                card.short(),
                worker
            );
            for member in pair.members() {
                if let Some(w) = self.workers.get_mut(member) {
                    w.busy = false;
                }
            }
            self.in_transit.insert(worker.clone());
        }

        if let Some(handle) = self.teams.get_mut(source) {
            handle.roster.remove(worker);
        }
        if let Some(handle) = self.teams.get_mut(destination) {
            handle.roster.insert(worker.clone());
        }
        if let Some(w) = self.workers.get_mut(worker) {
            w.current_team_id = destination.clone();
        }

        let record = BorrowRecord::new(
            worker.clone(),
            source.clone(),
            destination.clone(),
            reason,
            duration,
            cycle,
        );
        self.borrows.open(record.clone());
        tlog!(
            "borrow: {} from {} to {} for {} cycle(s): {}",
            worker,
            source,
            destination,
            duration,
            reason
        );
        Ok(record)
    }

    /// Send home every worker whose loan has run out.
    ///
    /// A worker still holding a session on the destination board keeps it;
    /// the return is retried on the next pass.
    pub fn return_due(&mut self, cycle: u32) -> ReturnSummary {
        let mut summary = ReturnSummary::default();
        for worker in self.borrows.due() {
            if self.in_session(&worker) {
                tlog_debug!("return: {} is mid-session, deferring", worker);
                summary.deferred.push(worker);
                continue;
            }
            let Some(record) = self.borrows.archive(&worker, cycle) else {
                continue;
            };
            if let Some(handle) = self.teams.get_mut(&record.destination) {
                handle.roster.remove(&worker);
            }
            let home = match self.workers.get_mut(&worker) {
                Some(w) => {
                    w.current_team_id = w.home_team_id.clone();
                    w.busy = false;
                    w.home_team_id.clone()
                }
                None => record.source.clone(),
            };
            if let Some(handle) = self.teams.get_mut(&home) {
                handle.roster.insert(worker.clone());
            }
            self.in_transit.remove(&worker);
            tlog!("return: {} is back on {}", worker, home);
            summary.returned.push(record);
        }
        summary
    }

    /// Refresh every worker's busy flag from the boards.
    pub fn sync_busy(&mut self) {
        let paired: HashSet<WorkerId> = self
            .teams
            .values()
            .flat_map(|t| {
                let snapshot = t.board.snapshot();
                snapshot
                    .all_cards()
                    .filter_map(|c| c.assigned_pair.clone())
                    .flat_map(|p| [p.driver, p.navigator])
                    .collect::<Vec<_>>()
            })
            .collect();
        for worker in self.workers.values_mut() {
            worker.busy = paired.contains(&worker.id);
        }
    }

    pub fn record_throughput(&mut self, team: &TeamId, cards: usize, points: u32) {
        if let Some(handle) = self.teams.get_mut(team) {
            handle.last_throughput = cards;
            handle.last_points = points;
        }
    }

    /// Close out a cycle: loans count down and transit ends.
    pub fn finish_cycle(&mut self) {
        self.borrows.tick();
        self.in_transit.clear();
    }

    /// Verify rosters, loans and every board.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InconsistentBoard`] naming the first team found in
    /// an inconsistent state.
    pub async fn check_invariants(&self) -> Result<()> {
        let mut seen: HashMap<&WorkerId, &TeamId> = HashMap::new();
        for team in self.teams.values() {
            for worker in &team.roster {
                if let Some(other) = seen.insert(worker, &team.id) {
                    return Err(inconsistent(
                        &team.id,
                        format!("{} is also on {}'s roster", worker, other),
                    ));
                }
                let Some(w) = self.workers.get(worker) else {
                    return Err(inconsistent(&team.id, format!("unknown worker {}", worker)));
                };
                if w.current_team_id != team.id {
                    return Err(inconsistent(
                        &team.id,
                        format!("{} is rostered here but located on {}", worker, w.current_team_id),
                    ));
                }
                let on_loan = self.borrows.active_for(worker).is_some();
                if on_loan == (w.current_team_id == w.home_team_id) {
                    return Err(inconsistent(
                        &team.id,
                        format!("{} loan state does not match its location", worker),
                    ));
                }
            }
            team.board
                .write()
                .await
                .check_invariants()
                .map_err(|reason| inconsistent(&team.id, reason))?;
        }
        if seen.len() != self.workers.len() {
            let missing = self
                .workers
                .keys()
                .find(|w| !seen.contains_key(w))
                .map(|w| w.to_string())
                .unwrap_or_default();
            return Err(Error::InconsistentBoard {
                team: TeamId::from("-"),
                reason: format!("{} is on no roster", missing),
            });
        }
        Ok(())
    }
}

fn inconsistent(team: &TeamId, reason: String) -> Error {
    Error::InconsistentBoard {
        team: team.clone(),
        reason,
    }
}
