//! One team's work for one cycle.
//!
//! A cycle unit owns everything it needs (a board handle, a copy of the
//! roster, its own RNG stream) so the orchestrator can run one per team as
//! independent tasks. Per cycle a unit:
//!
//! 1. lifts disturbance blocks that have expired,
//! 2. completes cards that sat in review,
//! 3. rolls disturbances,
//! 4. forms pairs and puts them on pairable cards,
//! 5. credits every paired card with a cycle of work, moving finished cards
//!    to review.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rand::rngs::StdRng;

use crate::bus::{Channel, Message, MessageBus, Payload};
use crate::core::{
    BoardSnapshot, CardId, CardStatus, MoveRejection, Pair, Seniority, SharedBoard, TeamId, Worker,
    WorkerId,
};
use crate::orchestration::disturbance::{DisturbanceEngine, DisturbanceEvent};
use crate::orchestration::pairing::{PairingAllocator, ProposedPair};
use crate::{tlog_debug, Result};

/// Work credited per pair and cycle.
#[derive(Debug, Clone, Copy)]
pub struct Velocity {
    pub points_per_pair: u32,
    pub senior_bonus: u32,
}

pub struct CycleUnit {
    pub team: TeamId,
    pub cycle: u32,
    pub board: Arc<SharedBoard>,
    pub roster: Vec<Worker>,
    pub unavailable: HashSet<WorkerId>,
    pub rng: StdRng,
    pub engine: Arc<DisturbanceEngine>,
    pub allocator: PairingAllocator,
    pub bus: Arc<MessageBus>,
    pub velocity: Velocity,
}

#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub team: TeamId,
    pub cycle: u32,
    /// Cards that reached done this cycle.
    pub completed: Vec<CardId>,
    pub points: u32,
    pub disturbances: Vec<DisturbanceEvent>,
    pub pairs: Vec<ProposedPair>,
    pub unblocked: usize,
    /// Moves refused because a column was full.
    pub capacity_rejections: usize,
    pub snapshot: Arc<BoardSnapshot>,
}

impl CycleOutcome {
    pub fn throughput(&self) -> usize {
        self.completed.len()
    }
}

impl CycleUnit {
    pub async fn run(mut self) -> Result<CycleOutcome> {
        tlog_debug!("cycle {}: {} starting with {} workers", self.cycle, self.team, self.roster.len());

        let (unblocked, completed, points) = self.settle().await;

        let disturbances = self
            .engine
            .roll(&self.board, &self.roster, self.cycle, &mut self.rng)
            .await;
        for event in &disturbances {
            if let Some(worker) = event.interrupted() {
                self.unavailable.insert(worker.clone());
                self.bus.publish(Message::new(
                    Channel::Team(self.team.clone()),
                    "disturbance",
                    self.cycle,
                    Payload::Interruption {
                        worker: worker.clone(),
                        reason: "pulled into an unplanned request".to_string(),
                    },
                ));
            }
        }

        let mut capacity_rejections = 0;
        let pairs = {
            let mut board = self.board.write().await;
            let in_session = board.paired_workers();
            for worker in &mut self.roster {
                worker.busy = in_session.contains(&worker.id);
            }

            let proposed =
                self.allocator
                    .available_pairs(&self.roster, &board, &self.unavailable, &mut self.rng);
            let cards = board.pairable_cards();
            let mut placed = Vec::with_capacity(proposed.len());
            for (proposal, card) in proposed.into_iter().zip(cards) {
                match board.assign_pair(card, proposal.pair.clone()) {
                    Ok(()) => placed.push(proposal),
                    Err(MoveRejection::AtCapacity { .. }) => capacity_rejections += 1,
                    Err(rejection) => {
                        tlog_debug!("cycle {}: {} pairing refused: {}", self.cycle, self.team, rejection)
                    }
                }
            }

            let seniority: HashMap<&WorkerId, Seniority> =
                self.roster.iter().map(|w| (&w.id, w.seniority)).collect();
            let working: Vec<(CardId, Pair)> = board
                .cards()
                .filter(|c| c.status == CardStatus::InProgress)
                .filter_map(|c| c.assigned_pair.clone().map(|p| (c.id, p)))
                .collect();
            for (card, pair) in working {
                let bonus = match seniority.get(&pair.navigator) {
                    Some(Seniority::Senior) => self.velocity.senior_bonus,
                    _ => 0,
                };
                let remaining = match board.record_progress(card, self.velocity.points_per_pair + bonus) {
                    Ok(remaining) => remaining,
                    Err(_) => continue,
                };
                if remaining == 0 {
                    match board.move_card(card, CardStatus::Review) {
                        Ok(_) => {}
                        Err(MoveRejection::AtCapacity { .. }) => capacity_rejections += 1,
                        Err(rejection) => {
                            tlog_debug!("cycle {}: {} review refused: {}", self.cycle, self.team, rejection)
                        }
                    }
                }
            }
            placed
        };

        let snapshot = self.board.snapshot();
        tlog_debug!(
            "cycle {}: {} done={} pairs={} wip={}",
            self.cycle,
            self.team,
            completed.len(),
            pairs.len(),
            snapshot.wip()
        );
        Ok(CycleOutcome {
            team: self.team,
            cycle: self.cycle,
            completed,
            points,
            disturbances,
            pairs,
            unblocked,
            capacity_rejections,
            snapshot,
        })
    }

    /// Lift expired blocks and finish reviewed cards.
    async fn settle(&self) -> (usize, Vec<CardId>, u32) {
        let mut board = self.board.write().await;

        let expired: Vec<CardId> = board
            .cards()
            .filter(|c| c.status == CardStatus::Blocked && !c.is_gated())
            .filter(|c| c.blocked_until.map(|until| self.cycle > until).unwrap_or(false))
            .map(|c| c.id)
            .collect();
        let mut unblocked = 0;
        for id in expired {
            if board.move_card(id, CardStatus::Ready).is_ok() {
                unblocked += 1;
            }
        }

        let reviewed: Vec<(CardId, u32)> = board
            .cards()
            .filter(|c| c.status == CardStatus::Review)
            .map(|c| (c.id, c.weight))
            .collect();
        let mut completed = Vec::with_capacity(reviewed.len());
        let mut points = 0;
        for (id, weight) in reviewed {
            if board.move_card(id, CardStatus::Done).is_ok() {
                completed.push(id);
                points += weight;
            }
        }
        (unblocked, completed, points)
    }
}
