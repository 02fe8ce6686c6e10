//! Per-cycle and end-of-run reports.

use std::fmt::Write;

use serde::{Deserialize, Serialize};

use crate::core::{BoardSnapshot, CardStatus, TeamId};
use crate::orchestration::budget::{OverheadBudgetManager, StepRecord};
use crate::orchestration::coordination::{CheckinResult, PassResult};
use crate::orchestration::cycle::CycleOutcome;
use crate::orchestration::disturbance::{DisturbanceEvent, ImpactLedger};

/// One team at the end of one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamCycleHealth {
    pub team: TeamId,
    pub throughput: usize,
    pub points: u32,
    pub ready: usize,
    pub in_progress: usize,
    pub review: usize,
    pub blocked: usize,
    pub done: usize,
    pub roster_size: usize,
    pub pairs: usize,
    pub capacity_rejections: usize,
    /// Set when the team's cycle failed; the counts are from its last
    /// published snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl TeamCycleHealth {
    pub fn from_outcome(outcome: &CycleOutcome, roster_size: usize) -> Self {
        let mut health = Self::from_snapshot(&outcome.snapshot, roster_size);
        health.throughput = outcome.throughput();
        health.points = outcome.points;
        health.pairs = outcome.pairs.len();
        health.capacity_rejections = outcome.capacity_rejections;
        health
    }

    pub fn failed(snapshot: &BoardSnapshot, roster_size: usize, reason: String) -> Self {
        Self {
            failure: Some(reason),
            ..Self::from_snapshot(snapshot, roster_size)
        }
    }

    fn from_snapshot(snapshot: &BoardSnapshot, roster_size: usize) -> Self {
        Self {
            team: snapshot.team_id.clone(),
            throughput: 0,
            points: 0,
            ready: snapshot.count(CardStatus::Ready),
            in_progress: snapshot.count(CardStatus::InProgress),
            review: snapshot.count(CardStatus::Review),
            blocked: snapshot.count(CardStatus::Blocked),
            done: snapshot.count(CardStatus::Done),
            roster_size,
            pairs: 0,
            capacity_rejections: 0,
            failure: None,
        }
    }

    pub fn wip(&self) -> usize {
        self.in_progress + self.review
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle: u32,
    pub teams: Vec<TeamCycleHealth>,
    pub disturbances: Vec<DisturbanceEvent>,
    pub dependencies_resolved: usize,
    pub checkin: CheckinResult,
    pub coordination: PassResult,
    pub impact: ImpactLedger,
    /// Budget spent so far, at the end of this cycle.
    pub spent_seconds: f64,
}

impl CycleReport {
    pub fn throughput(&self) -> usize {
        self.teams.iter().map(|t| t.throughput).sum()
    }

    pub fn team(&self, id: &TeamId) -> Option<&TeamCycleHealth> {
        self.teams.iter().find(|t| &t.team == id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetSummary {
    pub total_seconds: f64,
    pub iteration_zero_seconds: f64,
    pub per_cycle_seconds: f64,
    pub spent_seconds: f64,
    pub remaining_seconds: f64,
    pub overspend_seconds: f64,
    /// Worst case added by the per-step floor.
    pub projected_overspend_seconds: f64,
}

impl BudgetSummary {
    pub fn from_manager(budget: &OverheadBudgetManager) -> Self {
        let allocation = budget.allocation();
        Self {
            total_seconds: allocation.total_seconds,
            iteration_zero_seconds: allocation.iteration_zero_seconds,
            per_cycle_seconds: allocation.per_cycle_seconds,
            spent_seconds: budget.spent_seconds(),
            remaining_seconds: budget.remaining_seconds(),
            overspend_seconds: budget.overspend_seconds(),
            projected_overspend_seconds: allocation.projected_overspend(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub throughput: usize,
    pub points: u32,
    pub borrows: usize,
    pub returns: usize,
    pub disturbances_applied: usize,
    pub disturbances_suppressed: usize,
    pub coordination_timeouts: usize,
    pub coordination_failures: usize,
    pub team_failures: usize,
}

impl Totals {
    pub fn from_cycles(cycles: &[CycleReport]) -> Self {
        let mut totals = Self::default();
        for report in cycles {
            totals.throughput += report.throughput();
            totals.points += report.teams.iter().map(|t| t.points).sum::<u32>();
            totals.borrows += report.coordination.borrows.len();
            totals.returns += report.coordination.returned.len();
            totals.disturbances_applied += report.disturbances.iter().filter(|d| d.is_applied()).count();
            totals.disturbances_suppressed +=
                report.disturbances.iter().filter(|d| d.is_suppressed()).count();
            totals.coordination_timeouts += usize::from(report.coordination.timed_out);
            totals.coordination_failures += usize::from(report.coordination.failure.is_some());
            totals.team_failures += report.teams.iter().filter(|t| t.failure.is_some()).count();
        }
        totals
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub seed: u64,
    pub advisor: String,
    pub cycles: Vec<CycleReport>,
    pub totals: Totals,
    pub budget: BudgetSummary,
    pub audit: Vec<StepRecord>,
}

impl RunReport {
    pub fn new(seed: u64, advisor: &str, cycles: Vec<CycleReport>, budget: &OverheadBudgetManager) -> Self {
        Self {
            seed,
            advisor: advisor.to_string(),
            totals: Totals::from_cycles(&cycles),
            budget: BudgetSummary::from_manager(budget),
            audit: budget.audit(),
            cycles,
        }
    }

    /// Plain-text rendering for the terminal.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "tandem run (seed {}, advisor {})", self.seed, self.advisor);

        for cycle in &self.cycles {
            let _ = writeln!(out);
            let _ = writeln!(out, "cycle {}", cycle.cycle);
            let _ = writeln!(
                out,
                "  {:<16} {:>4} {:>6} {:>5} {:>4} {:>7} {:>5}",
                "team", "done", "points", "wip", "blk", "roster", "pairs"
            );
            for team in &cycle.teams {
                let _ = write!(
                    out,
                    "  {:<16} {:>4} {:>6} {:>5} {:>4} {:>7} {:>5}",
                    team.team.as_str(),
                    team.throughput,
                    team.points,
                    team.wip(),
                    team.blocked,
                    team.roster_size,
                    team.pairs
                );
                match &team.failure {
                    Some(reason) => {
                        let _ = writeln!(out, "  FAILED: {}", reason);
                    }
                    None => {
                        let _ = writeln!(out);
                    }
                }
            }

            let applied = cycle.disturbances.iter().filter(|d| d.is_applied()).count();
            let suppressed = cycle.disturbances.iter().filter(|d| d.is_suppressed()).count();
            if !cycle.disturbances.is_empty() {
                let _ = writeln!(
                    out,
                    "  disturbances: {} applied, {} suppressed (velocity {:.2}, quality {:.2})",
                    applied, suppressed, cycle.impact.velocity, cycle.impact.quality
                );
            }
            if cycle.dependencies_resolved > 0 {
                let _ = writeln!(out, "  dependencies resolved: {}", cycle.dependencies_resolved);
            }

            let pass = &cycle.coordination;
            if pass.timed_out {
                let _ = writeln!(out, "  coordination: timed out, no action");
            } else if let Some(reason) = &pass.failure {
                let _ = writeln!(out, "  coordination: advisor failed ({}), no action", reason);
            }
            for record in &pass.returned {
                let _ = writeln!(out, "  return: {} back to {}", record.worker, record.source);
            }
            for record in &pass.borrows {
                let _ = writeln!(
                    out,
                    "  borrow: {} {} -> {} ({})",
                    record.worker, record.source, record.destination, record.reason
                );
            }
            for rejected in &pass.rejected {
                let _ = writeln!(
                    out,
                    "  rejected: {} {} -> {}: {}",
                    rejected.directive.worker,
                    rejected.directive.source,
                    rejected.directive.destination,
                    rejected.reason
                );
            }
            for group in &pass.dependency_cycles {
                let names: Vec<&str> = group.iter().map(TeamId::as_str).collect();
                let _ = writeln!(out, "  dependency cycle: {}", names.join(" <-> "));
            }
        }

        let _ = writeln!(out);
        let _ = writeln!(out, "totals");
        let t = &self.totals;
        let _ = writeln!(out, "  throughput: {} cards, {} points", t.throughput, t.points);
        let _ = writeln!(out, "  borrows: {} executed, {} returned", t.borrows, t.returns);
        let _ = writeln!(
            out,
            "  disturbances: {} applied, {} suppressed",
            t.disturbances_applied, t.disturbances_suppressed
        );
        if t.coordination_timeouts + t.coordination_failures + t.team_failures > 0 {
            let _ = writeln!(
                out,
                "  fallbacks: {} timeouts, {} advisor failures, {} team failures",
                t.coordination_timeouts, t.coordination_failures, t.team_failures
            );
        }

        let b = &self.budget;
        let _ = writeln!(
            out,
            "  budget: {:.1}s spent of {:.1}s, {:.1}s remaining",
            b.spent_seconds, b.total_seconds, b.remaining_seconds
        );
        if b.overspend_seconds > 0.0 {
            let _ = writeln!(out, "  budget overspend: {:.1}s", b.overspend_seconds);
        }
        if b.projected_overspend_seconds > 0.0 {
            let _ = writeln!(
                out,
                "  step floor may add up to {:.1}s",
                b.projected_overspend_seconds
            );
        }
        out
    }
}
