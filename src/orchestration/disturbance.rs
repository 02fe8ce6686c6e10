//! Probabilistic disturbance injection.
//!
//! Every cycle, each configured disturbance kind gets an independent
//! Bernoulli trial per team. A disturbance that fires is applied only if its
//! estimated velocity and quality impact fit under the run caps. Once a cap
//! is hit, every later disturbance in the measurement window is suppressed
//! and recorded as such.
//!
//! The impact ledger is shared by all teams. A roll holds its team's board
//! writer while it takes the ledger lock, so the cap check and the board
//! effect happen together.

use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::{
    CardId, CardStatus, Priority, SharedBoard, TaskBoard, TaskCard, TeamId, Worker, WorkerId,
    card::{META_DISTURBANCE, META_FLAKY},
};
use crate::{tlog, tlog_debug};

const IMPACT_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisturbanceKind {
    ProductionIncident,
    ScopeCreep,
    FlakyTests,
    ExternalBlocker,
    Interruption,
}

impl DisturbanceKind {
    pub const ALL: [DisturbanceKind; 5] = [
        DisturbanceKind::ProductionIncident,
        DisturbanceKind::ScopeCreep,
        DisturbanceKind::FlakyTests,
        DisturbanceKind::ExternalBlocker,
        DisturbanceKind::Interruption,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DisturbanceKind::ProductionIncident => "production_incident",
            DisturbanceKind::ScopeCreep => "scope_creep",
            DisturbanceKind::FlakyTests => "flaky_tests",
            DisturbanceKind::ExternalBlocker => "external_blocker",
            DisturbanceKind::Interruption => "interruption",
        }
    }
}

impl std::fmt::Display for DisturbanceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One configured disturbance: how often it fires and what it costs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisturbanceSpec {
    pub kind: DisturbanceKind,
    pub probability: f64,
    #[serde(default)]
    pub velocity_impact: f64,
    #[serde(default)]
    pub quality_impact: f64,
}

impl DisturbanceSpec {
    pub fn default_for(kind: DisturbanceKind) -> Self {
        let (probability, velocity_impact, quality_impact) = match kind {
            DisturbanceKind::ProductionIncident => (0.10, 0.10, 0.05),
            DisturbanceKind::ScopeCreep => (0.15, 0.05, 0.0),
            DisturbanceKind::FlakyTests => (0.15, 0.02, 0.05),
            DisturbanceKind::ExternalBlocker => (0.10, 0.08, 0.0),
            DisturbanceKind::Interruption => (0.20, 0.03, 0.0),
        };
        Self {
            kind,
            probability,
            velocity_impact,
            quality_impact,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Effect {
    Applied {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        card: Option<CardId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        worker: Option<WorkerId>,
    },
    Suppressed,
    NoTarget,
}

/// A disturbance that fired, and what became of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisturbanceEvent {
    pub kind: DisturbanceKind,
    pub team: TeamId,
    pub cycle: u32,
    pub effect: Effect,
}

impl DisturbanceEvent {
    pub fn is_applied(&self) -> bool {
        matches!(self.effect, Effect::Applied { .. })
    }

    pub fn is_suppressed(&self) -> bool {
        self.effect == Effect::Suppressed
    }

    /// The worker pulled away, for applied interruptions.
    pub fn interrupted(&self) -> Option<&WorkerId> {
        match (&self.kind, &self.effect) {
            (DisturbanceKind::Interruption, Effect::Applied { worker, .. }) => worker.as_ref(),
            _ => None,
        }
    }
}

/// Running impact totals for the current measurement window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImpactLedger {
    pub velocity: f64,
    pub quality: f64,
    pub exhausted: bool,
    pub window_start: u32,
}

pub struct DisturbanceEngine {
    specs: Vec<DisturbanceSpec>,
    max_velocity_impact: f64,
    max_quality_regression: f64,
    ledger: Mutex<ImpactLedger>,
}

impl DisturbanceEngine {
    pub fn new(specs: Vec<DisturbanceSpec>, max_velocity_impact: f64, max_quality_regression: f64) -> Self {
        Self {
            specs,
            max_velocity_impact,
            max_quality_regression,
            ledger: Mutex::new(ImpactLedger::default()),
        }
    }

    pub fn ledger(&self) -> ImpactLedger {
        match self.ledger.lock() {
            Ok(ledger) => ledger.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Start a new measurement window.
    pub fn reset_window(&self, cycle: u32) {
        let mut ledger = match self.ledger.lock() {
            Ok(ledger) => ledger,
            Err(poisoned) => poisoned.into_inner(),
        };
        *ledger = ImpactLedger {
            window_start: cycle,
            ..Default::default()
        };
        tlog_debug!("disturbance: window reset at cycle {}", cycle);
    }

    /// Roll every kind once against a team's board.
    pub async fn roll(
        &self,
        board: &SharedBoard,
        roster: &[Worker],
        cycle: u32,
        rng: &mut StdRng,
    ) -> Vec<DisturbanceEvent> {
        let fired: Vec<&DisturbanceSpec> = self
            .specs
            .iter()
            .filter(|spec| rng.gen_bool(spec.probability.clamp(0.0, 1.0)))
            .collect();
        if fired.is_empty() {
            return Vec::new();
        }

        let mut guard = board.write().await;
        let mut ledger = match self.ledger.lock() {
            Ok(ledger) => ledger,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut interrupted: Vec<WorkerId> = Vec::new();
        let mut events = Vec::with_capacity(fired.len());
        for spec in fired {
            let effect = self.apply_one(spec, &mut guard, &mut ledger, roster, &interrupted, cycle, rng);
            if let Effect::Applied {
                worker: Some(worker),
                ..
            } = &effect
            {
                interrupted.push(worker.clone());
            }
            let event = DisturbanceEvent {
                kind: spec.kind,
                team: guard.team_id().clone(),
                cycle,
                effect,
            };
            match &event.effect {
                Effect::Applied { .. } => tlog!(
                    "disturbance: {} hit {} in cycle {} (velocity {:.2}, quality {:.2})",
                    spec.kind,
                    event.team,
                    cycle,
                    ledger.velocity,
                    ledger.quality
                ),
                Effect::Suppressed => {
                    tlog_debug!("disturbance: {} on {} suppressed", spec.kind, event.team)
                }
                Effect::NoTarget => {
                    tlog_debug!("disturbance: {} on {} had no target", spec.kind, event.team)
                }
            }
            events.push(event);
        }
        events
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_one(
        &self,
        spec: &DisturbanceSpec,
        board: &mut TaskBoard,
        ledger: &mut ImpactLedger,
        roster: &[Worker],
        interrupted: &[WorkerId],
        cycle: u32,
        rng: &mut StdRng,
    ) -> Effect {
        if ledger.exhausted {
            return Effect::Suppressed;
        }
        let Some(target) = find_target(spec.kind, board, roster, interrupted, rng) else {
            return Effect::NoTarget;
        };

        let velocity = ledger.velocity + spec.velocity_impact;
        let quality = ledger.quality + spec.quality_impact;
        if velocity > self.max_velocity_impact + IMPACT_EPSILON
            || quality > self.max_quality_regression + IMPACT_EPSILON
        {
            return Effect::Suppressed;
        }

        let effect = match apply_effect(spec.kind, target, board, cycle, rng) {
            Some(effect) => effect,
            None => return Effect::NoTarget,
        };
        ledger.velocity = velocity;
        ledger.quality = quality;
        if velocity >= self.max_velocity_impact - IMPACT_EPSILON
            || quality >= self.max_quality_regression - IMPACT_EPSILON
        {
            ledger.exhausted = true;
        }
        effect
    }
}

enum Target {
    NewCard,
    Card(CardId),
    Worker(WorkerId),
}

fn pick<T: Clone>(items: &[T], rng: &mut StdRng) -> Option<T> {
    if items.is_empty() {
        None
    } else {
        Some(items[rng.gen_range(0..items.len())].clone())
    }
}

fn find_target(
    kind: DisturbanceKind,
    board: &TaskBoard,
    roster: &[Worker],
    interrupted: &[WorkerId],
    rng: &mut StdRng,
) -> Option<Target> {
    match kind {
        DisturbanceKind::ProductionIncident | DisturbanceKind::ScopeCreep => Some(Target::NewCard),
        DisturbanceKind::FlakyTests => {
            let candidates: Vec<CardId> = board
                .cards()
                .filter(|c| c.status == CardStatus::InProgress && !c.metadata.contains_key(META_FLAKY))
                .map(|c| c.id)
                .collect();
            pick(&candidates, rng).map(Target::Card)
        }
        DisturbanceKind::ExternalBlocker => {
            let in_progress: Vec<CardId> = board
                .cards()
                .filter(|c| c.status == CardStatus::InProgress)
                .map(|c| c.id)
                .collect();
            let candidates = if in_progress.is_empty() {
                board
                    .cards()
                    .filter(|c| c.status == CardStatus::Ready)
                    .map(|c| c.id)
                    .collect()
            } else {
                in_progress
            };
            pick(&candidates, rng).map(Target::Card)
        }
        DisturbanceKind::Interruption => {
            let in_session = board.paired_workers();
            let candidates: Vec<WorkerId> = roster
                .iter()
                .filter(|w| !w.busy && !in_session.contains(&w.id) && !interrupted.contains(&w.id))
                .map(|w| w.id.clone())
                .collect();
            pick(&candidates, rng).map(Target::Worker)
        }
    }
}

fn apply_effect(
    kind: DisturbanceKind,
    target: Target,
    board: &mut TaskBoard,
    cycle: u32,
    rng: &mut StdRng,
) -> Option<Effect> {
    let team = board.team_id().clone();
    match (kind, target) {
        (DisturbanceKind::ProductionIncident, Target::NewCard) => {
            let card = TaskCard::new(&format!("Hotfix: production incident (cycle {})", cycle), 2, team)
                .with_priority(Priority::Urgent)
                .with_metadata(META_DISTURBANCE, kind.as_str());
            board.add(card).ok().map(applied_card)
        }
        (DisturbanceKind::ScopeCreep, Target::NewCard) => {
            let weight = rng.gen_range(1..=3);
            let card = TaskCard::new(&format!("Scope creep (cycle {})", cycle), weight, team)
                .with_metadata(META_DISTURBANCE, kind.as_str());
            board.add(card).ok().map(applied_card)
        }
        (DisturbanceKind::FlakyTests, Target::Card(id)) => {
            board.tag(id, META_FLAKY, "true").ok()?;
            board.tag(id, META_DISTURBANCE, kind.as_str()).ok()?;
            board.add_rework(id, 1).ok()?;
            Some(applied_card(id))
        }
        (DisturbanceKind::ExternalBlocker, Target::Card(id)) => {
            board.block_until(id, cycle).ok()?;
            board.tag(id, META_DISTURBANCE, kind.as_str()).ok()?;
            Some(applied_card(id))
        }
        (DisturbanceKind::Interruption, Target::Worker(worker)) => Some(Effect::Applied {
            card: None,
            worker: Some(worker),
        }),
        _ => None,
    }
}

fn applied_card(id: CardId) -> Effect {
    Effect::Applied {
        card: Some(id),
        worker: None,
    }
}
