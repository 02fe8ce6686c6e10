//! Pair allocation.
//!
//! Workers are matched into (driver, navigator) pairs each cycle. Role
//! precedence decides who navigates, first match wins:
//!
//! 1. a lead navigates,
//! 2. an injected tester navigates,
//! 3. a senior paired with a junior navigates,
//! 4. otherwise a coin flip.
//!
//! Testers only take part when one is injected for the cycle, which happens
//! with the configured probability. Candidates are ordered by seniority and
//! matched outer-to-inner so mentoring pairs form first. Testers never pair
//! with leads and leads never pair with each other.

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::{Pair, Seniority, TaskBoard, Worker, WorkerId};
use crate::tlog_trace;

/// The rule that decided who navigates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleRule {
    LeadNavigates,
    TesterNavigates,
    MentorNavigates,
    Random,
}

impl RoleRule {
    /// Order two workers as (driver, navigator).
    fn apply<'a>(self, a: &'a Worker, b: &'a Worker, rng: &mut StdRng) -> (&'a Worker, &'a Worker) {
        let a_navigates = match self {
            RoleRule::LeadNavigates => a.is_lead(),
            RoleRule::TesterNavigates => a.is_tester(),
            RoleRule::MentorNavigates => a.seniority > b.seniority,
            RoleRule::Random => rng.gen_bool(0.5),
        };
        if a_navigates {
            (b, a)
        } else {
            (a, b)
        }
    }

    /// First rule in precedence order that matches the two workers.
    fn select(a: &Worker, b: &Worker) -> RoleRule {
        if a.is_lead() || b.is_lead() {
            RoleRule::LeadNavigates
        } else if a.is_tester() != b.is_tester() {
            RoleRule::TesterNavigates
        } else if is_mentoring(a.seniority, b.seniority) {
            RoleRule::MentorNavigates
        } else {
            RoleRule::Random
        }
    }
}

fn is_mentoring(a: Seniority, b: Seniority) -> bool {
    matches!(
        (a, b),
        (Seniority::Senior, Seniority::Junior) | (Seniority::Junior, Seniority::Senior)
    )
}

fn compatible(a: &Worker, b: &Worker) -> bool {
    !(a.is_lead() && b.is_lead()) && !(a.is_lead() && b.is_tester()) && !(a.is_tester() && b.is_lead())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedPair {
    pub pair: Pair,
    pub rule: RoleRule,
}

#[derive(Debug, Clone)]
pub struct PairingAllocator {
    tester_injection_rate: f64,
}

impl PairingAllocator {
    pub fn new(tester_injection_rate: f64) -> Self {
        Self {
            tester_injection_rate: tester_injection_rate.clamp(0.0, 1.0),
        }
    }

    /// Propose pairs for one cycle.
    ///
    /// Busy workers, workers already in a session on `board` and anyone in
    /// `unavailable` are skipped. At most one pair per pairable card is
    /// proposed, so a full board yields an empty list rather than an error.
    pub fn available_pairs(
        &self,
        roster: &[Worker],
        board: &TaskBoard,
        unavailable: &HashSet<WorkerId>,
        rng: &mut StdRng,
    ) -> Vec<ProposedPair> {
        let slots = board.pairable_cards().len();
        if slots == 0 {
            return Vec::new();
        }
        let in_session = board.paired_workers();

        let free: Vec<&Worker> = roster
            .iter()
            .filter(|w| !w.busy && !unavailable.contains(&w.id) && !in_session.contains(&w.id))
            .collect();
        let (testers, mut others): (Vec<&Worker>, Vec<&Worker>) =
            free.into_iter().partition(|w| w.is_tester());
        others.sort_by(|a, b| b.seniority.cmp(&a.seniority).then_with(|| a.id.cmp(&b.id)));

        let mut pairs = Vec::new();

        if !testers.is_empty() && rng.gen_bool(self.tester_injection_rate) {
            let tester = testers[rng.gen_range(0..testers.len())];
            if let Some(index) = others.iter().position(|w| compatible(w, tester)) {
                let partner = others.remove(index);
                pairs.push(ProposedPair {
                    pair: Pair::new(partner.id.clone(), tester.id.clone()),
                    rule: RoleRule::TesterNavigates,
                });
            }
        }

        while pairs.len() < slots && others.len() >= 2 {
            let first = others.remove(0);
            let Some(index) = others.iter().rposition(|w| compatible(first, w)) else {
                tlog_trace!("pairing: no compatible partner for {}", first.id);
                continue;
            };
            let second = others.remove(index);
            let rule = RoleRule::select(first, second);
            let (driver, navigator) = rule.apply(first, second, rng);
            pairs.push(ProposedPair {
                pair: Pair::new(driver.id.clone(), navigator.id.clone()),
                rule,
            });
        }

        pairs.truncate(slots);
        pairs
    }
}
