//! Team task board with admission control.
//!
//! [`TaskBoard`] is the per-team state machine over cards. Moves into a
//! column that is at its configured capacity are rejected and the card stays
//! where it was. Moves into `blocked` and `done` always succeed.
//!
//! [`SharedBoard`] wraps a board for concurrent use: one writer at a time
//! (a `tokio::sync::Mutex`), while readers take the latest published
//! [`BoardSnapshot`] from a `watch` channel and never wait on the writer.

use crate::core::card::{CardId, CardStatus, DependencyStatus, Pair, TaskCard};
use crate::core::ids::{TeamId, WorkerId};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, MutexGuard};

/// Default WIP limit for `in_progress`.
pub const DEFAULT_IN_PROGRESS_LIMIT: usize = 4;
/// Default WIP limit for `review`.
pub const DEFAULT_REVIEW_LIMIT: usize = 2;

/// Per-status capacity limits. Columns without an entry are unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapacityLimits(BTreeMap<CardStatus, usize>);

impl CapacityLimits {
    pub fn unlimited() -> Self {
        Self(BTreeMap::new())
    }

    pub fn with_limit(mut self, status: CardStatus, limit: usize) -> Self {
        self.0.insert(status, limit);
        self
    }

    pub fn limit(&self, status: CardStatus) -> Option<usize> {
        if status.bypasses_capacity() {
            return None;
        }
        self.0.get(&status).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (CardStatus, usize)> + '_ {
        self.0.iter().map(|(s, l)| (*s, *l))
    }
}

impl Default for CapacityLimits {
    fn default() -> Self {
        Self::unlimited()
            .with_limit(CardStatus::InProgress, DEFAULT_IN_PROGRESS_LIMIT)
            .with_limit(CardStatus::Review, DEFAULT_REVIEW_LIMIT)
    }
}

/// Why a board operation was refused. The board is unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveRejection {
    AtCapacity { status: CardStatus, limit: usize },
    UnknownCard(CardId),
    AlreadyIn(CardStatus),
    /// Done cards are archived and immutable.
    Archived(CardId),
    WrongTeam { expected: TeamId, found: TeamId },
    /// The card cannot take a pair in its current state.
    NotPairable { card: CardId, reason: String },
    NoDependency(CardId),
}

impl std::fmt::Display for MoveRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MoveRejection::AtCapacity { status, limit } => {
                write!(f, "{} is at capacity ({})", status, limit)
            }
            MoveRejection::UnknownCard(id) => write!(f, "unknown card {}", id.short()),
            MoveRejection::AlreadyIn(status) => write!(f, "card already in {}", status),
            MoveRejection::Archived(id) => write!(f, "card {} is archived", id.short()),
            MoveRejection::WrongTeam { expected, found } => {
                write!(f, "card belongs to {} not {}", found, expected)
            }
            MoveRejection::NotPairable { card, reason } => {
                write!(f, "card {} cannot take a pair: {}", card.short(), reason)
            }
            MoveRejection::NoDependency(id) => {
                write!(f, "card {} has no dependency descriptor", id.short())
            }
        }
    }
}

/// Result of an accepted move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Moved {
    pub from: CardStatus,
    pub to: CardStatus,
    /// Pair whose session ended because of the move.
    pub released: Option<Pair>,
}

/// Point-in-time copy of a board, grouped by status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardSnapshot {
    pub team_id: TeamId,
    pub limits: CapacityLimits,
    pub columns: BTreeMap<CardStatus, Vec<TaskCard>>,
}

impl BoardSnapshot {
    pub fn cards(&self, status: CardStatus) -> &[TaskCard] {
        self.columns.get(&status).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn count(&self, status: CardStatus) -> usize {
        self.cards(status).len()
    }

    pub fn all_cards(&self) -> impl Iterator<Item = &TaskCard> {
        self.columns.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.columns.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cards in `in_progress` plus `review`.
    pub fn wip(&self) -> usize {
        self.count(CardStatus::InProgress) + self.count(CardStatus::Review)
    }

    pub fn within_limits(&self) -> bool {
        self.limits.iter().all(|(status, limit)| self.count(status) <= limit)
    }
}

/// Per-team state machine over task cards.
#[derive(Debug, Clone)]
pub struct TaskBoard {
    team_id: TeamId,
    limits: CapacityLimits,
    /// Insertion order is the backlog order.
    cards: Vec<TaskCard>,
}

impl TaskBoard {
    pub fn new(team_id: TeamId, limits: CapacityLimits) -> Self {
        Self {
            team_id,
            limits,
            cards: Vec::new(),
        }
    }

    pub fn team_id(&self) -> &TeamId {
        &self.team_id
    }

    pub fn limits(&self) -> &CapacityLimits {
        &self.limits
    }

    /// Add a card. Capacity applies to the card's initial status too.
    pub fn add(&mut self, card: TaskCard) -> Result<CardId, MoveRejection> {
        if card.team_id != self.team_id {
            return Err(MoveRejection::WrongTeam {
                expected: self.team_id.clone(),
                found: card.team_id,
            });
        }
        if let Some(limit) = self.limits.limit(card.status) {
            if self.count(card.status) >= limit {
                return Err(MoveRejection::AtCapacity {
                    status: card.status,
                    limit,
                });
            }
        }
        let id = card.id;
        self.cards.push(card);
        Ok(id)
    }

    /// Move a card to another column.
    ///
    /// # Errors
    ///
    /// Returns a [`MoveRejection`] if the card is unknown, archived, already
    /// in `to`, or `to` is at capacity. A rejected move changes nothing.
    pub fn move_card(&mut self, id: CardId, to: CardStatus) -> Result<Moved, MoveRejection> {
        let limit = self.limits.limit(to);
        let count = self.count(to);
        let card = self.card_mut(id)?;
        let from = card.status;

        if from == CardStatus::Done {
            return Err(MoveRejection::Archived(id));
        }
        if from == to {
            return Err(MoveRejection::AlreadyIn(to));
        }
        if let Some(limit) = limit {
            if count >= limit {
                return Err(MoveRejection::AtCapacity { status: to, limit });
            }
        }

        card.status = to;
        let released = match to {
            CardStatus::Done | CardStatus::Blocked | CardStatus::Ready => card.assigned_pair.take(),
            CardStatus::InProgress | CardStatus::Review => None,
        };
        if to == CardStatus::Done {
            card.completed_at = Some(Utc::now());
            card.progress = card.progress.max(card.weight);
        }
        if to != CardStatus::Blocked {
            card.blocked_until = None;
        }

        Ok(Moved { from, to, released })
    }

    /// Start a pairing session on a card.
    ///
    /// A ready card is pulled into `in_progress` (subject to capacity); an
    /// unpaired `in_progress` card is simply taken over.
    pub fn assign_pair(&mut self, id: CardId, pair: Pair) -> Result<(), MoveRejection> {
        let card = self.card(id).ok_or(MoveRejection::UnknownCard(id))?;
        if card.assigned_pair.is_some() {
            return Err(MoveRejection::NotPairable {
                card: id,
                reason: "already paired".to_string(),
            });
        }
        if card.is_gated() {
            return Err(MoveRejection::NotPairable {
                card: id,
                reason: "waiting on a cross-team dependency".to_string(),
            });
        }
        if self
            .cards
            .iter()
            .filter_map(|c| c.assigned_pair.as_ref())
            .any(|p| p.contains(&pair.driver) || p.contains(&pair.navigator))
        {
            return Err(MoveRejection::NotPairable {
                card: id,
                reason: "a worker is already in a session".to_string(),
            });
        }

        match card.status {
            CardStatus::Ready => {
                self.move_card(id, CardStatus::InProgress)?;
            }
            CardStatus::InProgress => {}
            other => {
                return Err(MoveRejection::NotPairable {
                    card: id,
                    reason: format!("card is {}", other),
                })
            }
        }

        self.card_mut(id)?.assigned_pair = Some(pair);
        Ok(())
    }

    /// End the pairing session on a card, leaving it in its column.
    pub fn release_pair(&mut self, id: CardId) -> Option<Pair> {
        self.card_mut(id).ok()?.assigned_pair.take()
    }

    /// End whichever session `worker` is in.
    pub fn release_worker(&mut self, worker: &WorkerId) -> Option<(CardId, Pair)> {
        let card = self.cards.iter_mut().find(|c| {
            c.assigned_pair
                .as_ref()
                .map(|p| p.contains(worker))
                .unwrap_or(false)
        })?;
        let pair = card.assigned_pair.take()?;
        Some((card.id, pair))
    }

    /// Record work against a card; returns the points still remaining.
    pub fn record_progress(&mut self, id: CardId, points: u32) -> Result<u32, MoveRejection> {
        let card = self.card_mut(id)?;
        if card.status == CardStatus::Done {
            return Err(MoveRejection::Archived(id));
        }
        card.progress = card.progress.saturating_add(points).min(card.weight);
        Ok(card.remaining_points())
    }

    /// Set a metadata tag on a card.
    pub fn tag(&mut self, id: CardId, key: &str, value: &str) -> Result<(), MoveRejection> {
        let card = self.card_mut(id)?;
        if card.status == CardStatus::Done {
            return Err(MoveRejection::Archived(id));
        }
        card.metadata.insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Add rework points to a card's weight.
    pub fn add_rework(&mut self, id: CardId, points: u32) -> Result<(), MoveRejection> {
        let card = self.card_mut(id)?;
        if card.status == CardStatus::Done {
            return Err(MoveRejection::Archived(id));
        }
        card.weight = card.weight.saturating_add(points);
        Ok(())
    }

    /// Block a card until after `until_cycle`.
    pub fn block_until(&mut self, id: CardId, until_cycle: u32) -> Result<Moved, MoveRejection> {
        let moved = self.move_card(id, CardStatus::Blocked)?;
        if let Ok(card) = self.card_mut(id) {
            card.blocked_until = Some(until_cycle);
        }
        Ok(moved)
    }

    /// Update the dependency status recorded on a card.
    pub fn set_dependency_status(
        &mut self,
        id: CardId,
        status: DependencyStatus,
    ) -> Result<(), MoveRejection> {
        let card = self.card_mut(id)?;
        let mut dependency = card.dependency().ok_or(MoveRejection::NoDependency(id))?;
        dependency.dependency_status = status;
        card.set_dependency(&dependency);
        Ok(())
    }

    pub fn card(&self, id: CardId) -> Option<&TaskCard> {
        self.cards.iter().find(|c| c.id == id)
    }

    fn card_mut(&mut self, id: CardId) -> Result<&mut TaskCard, MoveRejection> {
        self.cards
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(MoveRejection::UnknownCard(id))
    }

    pub fn cards(&self) -> impl Iterator<Item = &TaskCard> {
        self.cards.iter()
    }

    pub fn count(&self, status: CardStatus) -> usize {
        self.cards.iter().filter(|c| c.status == status).count()
    }

    /// Spare capacity in a column; `None` means unlimited.
    pub fn spare(&self, status: CardStatus) -> Option<usize> {
        self.limits
            .limit(status)
            .map(|limit| limit.saturating_sub(self.count(status)))
    }

    /// Cards a new pair could pick up, best first: unpaired `in_progress`
    /// work, then ready cards by priority in backlog order. Ready cards are
    /// only offered while `in_progress` has room for them.
    pub fn pairable_cards(&self) -> Vec<CardId> {
        let mut ids: Vec<CardId> = self
            .cards
            .iter()
            .filter(|c| c.status == CardStatus::InProgress && c.assigned_pair.is_none())
            .filter(|c| !c.is_gated())
            .map(|c| c.id)
            .collect();

        let mut ready: Vec<&TaskCard> = self
            .cards
            .iter()
            .filter(|c| c.status == CardStatus::Ready && c.assigned_pair.is_none())
            .filter(|c| !c.is_gated())
            .collect();
        // Stable sort keeps backlog order within a priority.
        ready.sort_by(|a, b| b.priority.cmp(&a.priority));

        let room = self.spare(CardStatus::InProgress).unwrap_or(usize::MAX);
        ids.extend(ready.into_iter().take(room).map(|c| c.id));
        ids
    }

    /// Workers currently holding a session on this board.
    pub fn paired_workers(&self) -> HashSet<WorkerId> {
        self.cards
            .iter()
            .filter_map(|c| c.assigned_pair.as_ref())
            .flat_map(|p| [p.driver.clone(), p.navigator.clone()])
            .collect()
    }

    pub fn snapshot(&self) -> BoardSnapshot {
        let mut columns: BTreeMap<CardStatus, Vec<TaskCard>> = CardStatus::ALL
            .into_iter()
            .map(|s| (s, Vec::new()))
            .collect();
        for card in &self.cards {
            columns.entry(card.status).or_default().push(card.clone());
        }
        BoardSnapshot {
            team_id: self.team_id.clone(),
            limits: self.limits.clone(),
            columns,
        }
    }

    /// Verify the board's internal invariants.
    ///
    /// Returns a description of the first violation found.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        for (status, limit) in self.limits.iter() {
            let count = self.count(status);
            if count > limit {
                return Err(format!("{} cards {}, limit {}", count, status, limit));
            }
        }

        let mut seen = HashSet::new();
        for card in &self.cards {
            if card.team_id != self.team_id {
                return Err(format!("card {} belongs to {}", card.id.short(), card.team_id));
            }
            if let Some(pair) = &card.assigned_pair {
                if !card.status.is_active() {
                    return Err(format!(
                        "card {} is {} but still paired",
                        card.id.short(),
                        card.status
                    ));
                }
                if pair.driver == pair.navigator {
                    return Err(format!("card {} paired with itself", card.id.short()));
                }
                for member in pair.members() {
                    if !seen.insert(member.clone()) {
                        return Err(format!("{} is in two sessions", member));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Write access to a [`SharedBoard`]. Publishes a fresh snapshot on drop.
pub struct BoardGuard<'a> {
    board: MutexGuard<'a, TaskBoard>,
    publish: &'a watch::Sender<Arc<BoardSnapshot>>,
}

impl Deref for BoardGuard<'_> {
    type Target = TaskBoard;

    fn deref(&self) -> &TaskBoard {
        &self.board
    }
}

impl DerefMut for BoardGuard<'_> {
    fn deref_mut(&mut self) -> &mut TaskBoard {
        &mut self.board
    }
}

impl Drop for BoardGuard<'_> {
    fn drop(&mut self) {
        self.publish.send_replace(Arc::new(self.board.snapshot()));
    }
}

/// A board shared between a team's cycle, the orchestrator and observers.
pub struct SharedBoard {
    team_id: TeamId,
    writer: Mutex<TaskBoard>,
    snapshots: watch::Sender<Arc<BoardSnapshot>>,
}

impl SharedBoard {
    pub fn new(board: TaskBoard) -> Self {
        let (snapshots, _) = watch::channel(Arc::new(board.snapshot()));
        Self {
            team_id: board.team_id().clone(),
            writer: Mutex::new(board),
            snapshots,
        }
    }

    pub fn team_id(&self) -> &TeamId {
        &self.team_id
    }

    /// Take the single writer slot for this board.
    pub async fn write(&self) -> BoardGuard<'_> {
        BoardGuard {
            board: self.writer.lock().await,
            publish: &self.snapshots,
        }
    }

    /// Latest published snapshot. Never waits on the writer.
    pub fn snapshot(&self) -> Arc<BoardSnapshot> {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<BoardSnapshot>> {
        self.snapshots.subscribe()
    }
}
