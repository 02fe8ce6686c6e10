//! Runs the whole simulation.
//!
//! The orchestrator owns the [`Organization`] and every shared service. Per
//! cycle it spawns one [`CycleUnit`] per team, joins them while a checkin
//! runs alongside, applies the results, then hands the organization to the
//! [`CoordinationLoop`] for a full pass. A team unit that errors or panics is
//! reported and skipped; the run only stops early on an inconsistent board.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;

use crate::bus::MessageBus;
use crate::config::SimConfig;
use crate::core::{CardId, CardStatus, DependencyStatus, TeamId};
use crate::orchestration::advisor::{self, Advisor};
use crate::orchestration::borrow::BorrowRecord;
use crate::orchestration::budget::{allocate, OverheadBudgetManager, StepName};
use crate::orchestration::coordination::CoordinationLoop;
use crate::orchestration::cycle::{CycleOutcome, CycleUnit, Velocity};
use crate::orchestration::disturbance::DisturbanceEngine;
use crate::orchestration::organization::Organization;
use crate::orchestration::pairing::PairingAllocator;
use crate::report::{CycleReport, RunReport, TeamCycleHealth};
use crate::state::{Store, RUN_SCOPE};
use crate::util::{blocking_with_timeout, derive_rng};
use crate::{tlog, tlog_debug, tlog_error, tlog_warn, Result};

/// Upper bound on one cycle's store writes.
const STORE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct PoolOrchestrator {
    org: Organization,
    engine: Arc<DisturbanceEngine>,
    allocator: PairingAllocator,
    budget: Arc<OverheadBudgetManager>,
    coordination: CoordinationLoop,
    bus: Arc<MessageBus>,
    store: Option<Arc<dyn Store>>,
    seed: u64,
    cycles: u32,
    window_cycles: u32,
    velocity: Velocity,
    reports: Vec<CycleReport>,
}

impl PoolOrchestrator {
    /// Build an orchestrator with the advisor named in the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] for invalid configuration and
    /// [`crate::Error::AdvisorBinaryNotFound`] if a command advisor cannot
    /// be resolved.
    pub fn new(config: &SimConfig) -> Result<Self> {
        let advisor = advisor::from_config(config)?;
        Self::with_advisor(config, advisor)
    }

    pub fn with_advisor(config: &SimConfig, advisor: Arc<dyn Advisor>) -> Result<Self> {
        config.validate()?;
        let org = Organization::from_config(config)?;

        let engine = Arc::new(DisturbanceEngine::new(
            config.disturbances.kinds.clone(),
            config.disturbances.max_velocity_impact,
            config.disturbances.max_quality_regression,
        ));
        let allocation = allocate(
            config.budget.total_seconds,
            config.budget.iteration_zero_share,
            &config.budget.weights(),
            config.simulation.cycles,
            config.budget.min_step_timeout_seconds,
        );
        let bus = Arc::new(MessageBus::default());
        let coordination = CoordinationLoop::from_config(advisor, Arc::clone(&bus), &config.coordination);
        let seed = config.simulation.seed.unwrap_or_else(rand::random);
        tlog!(
            "orchestrator: {} cycles, seed {}, advisor {}",
            config.simulation.cycles,
            seed,
            coordination.advisor_name()
        );

        Ok(Self {
            org,
            engine,
            allocator: PairingAllocator::new(config.pairing.tester_injection_rate),
            budget: Arc::new(OverheadBudgetManager::new(allocation)),
            coordination,
            bus,
            store: None,
            seed,
            cycles: config.simulation.cycles,
            window_cycles: config.disturbances.window_cycles,
            velocity: Velocity {
                points_per_pair: config.simulation.points_per_pair,
                senior_bonus: config.simulation.senior_bonus,
            },
            reports: Vec::new(),
        })
    }

    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn organization(&self) -> &Organization {
        &self.org
    }

    pub fn budget(&self) -> &OverheadBudgetManager {
        &self.budget
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn engine(&self) -> &DisturbanceEngine {
        &self.engine
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn reports(&self) -> &[CycleReport] {
        &self.reports
    }

    /// Run iteration zero and every cycle.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InconsistentBoard`] if a board or roster
    /// fails its invariant check after a cycle.
    pub async fn run(&mut self) -> Result<RunReport> {
        self.iteration_zero().await?;
        for cycle in 1..=self.cycles {
            self.run_cycle(cycle).await?;
        }
        Ok(self.report())
    }

    pub fn report(&self) -> RunReport {
        RunReport::new(
            self.seed,
            self.coordination.advisor_name(),
            self.reports.clone(),
            &self.budget,
        )
    }

    /// Planning: verify the initial organization and persist it.
    pub async fn iteration_zero(&mut self) -> Result<()> {
        self.budget
            .measure("iteration_zero", None, 0, self.org.check_invariants())
            .await?;
        self.persist(0, &[]).await;
        Ok(())
    }

    /// Run one cycle and its coordination pass.
    pub async fn run_cycle(&mut self, cycle: u32) -> Result<&CycleReport> {
        if self.window_cycles > 0 && (cycle - 1) % self.window_cycles == 0 {
            self.engine.reset_window(cycle);
        }

        let units = self.spawn_units(cycle);
        let distribution = self.budget.measure(
            "distribution",
            Some(StepName::Distribution),
            cycle,
            join_all(units.into_iter().map(|(team, handle)| async move {
                let result = match handle.await {
                    Ok(result) => result.map_err(|e| e.to_string()),
                    Err(join_err) => Err(join_err.to_string()),
                };
                (team, result)
            })),
        );
        let checkin = self.coordination.checkin(&self.org, &self.budget, cycle);
        let (results, checkin) = tokio::join!(distribution, checkin);

        let mut outcomes: Vec<CycleOutcome> = Vec::with_capacity(results.len());
        let mut teams: Vec<TeamCycleHealth> = Vec::with_capacity(results.len());
        for (team, result) in results {
            let roster_size = self.org.team(&team).map(|t| t.roster_size()).unwrap_or(0);
            match result {
                Ok(outcome) => {
                    self.org
                        .record_throughput(&team, outcome.throughput(), outcome.points);
                    teams.push(TeamCycleHealth::from_outcome(&outcome, roster_size));
                    outcomes.push(outcome);
                }
                Err(reason) => {
                    tlog_error!("cycle {}: team {} failed: {}", cycle, team, reason);
                    self.org.record_throughput(&team, 0, 0);
                    if let Some(handle) = self.org.team(&team) {
                        teams.push(TeamCycleHealth::failed(
                            &handle.board.snapshot(),
                            roster_size,
                            reason,
                        ));
                    }
                }
            }
        }

        let dependencies_resolved = self.resolve_dependencies(&outcomes).await;
        self.org.sync_busy();
        self.org.finish_cycle();

        let pass = self
            .coordination
            .full_pass(&mut self.org, &self.budget, cycle)
            .await;
        self.org.sync_busy();
        self.org.check_invariants().await?;

        let mut records = pass.borrows.clone();
        records.extend(pass.returned.iter().cloned());
        self.persist(cycle, &records).await;

        let report = CycleReport {
            cycle,
            teams,
            disturbances: outcomes.iter().flat_map(|o| o.disturbances.clone()).collect(),
            dependencies_resolved,
            checkin,
            coordination: pass,
            impact: self.engine.ledger(),
            spent_seconds: self.budget.spent_seconds(),
        };
        tlog!(
            "cycle {}: throughput {} borrows {} spent {:.1}s",
            cycle,
            report.throughput(),
            report.coordination.borrows.len(),
            report.spent_seconds
        );
        self.reports.push(report);
        Ok(&self.reports[self.reports.len() - 1])
    }

    fn spawn_units(&self, cycle: u32) -> Vec<(TeamId, JoinHandle<Result<CycleOutcome>>)> {
        self.org
            .teams()
            .enumerate()
            .map(|(stream, team)| {
                let unit = CycleUnit {
                    team: team.id.clone(),
                    cycle,
                    board: Arc::clone(&team.board),
                    roster: self.org.roster_workers(&team.id),
                    unavailable: self.org.unavailable_for(&team.id),
                    rng: derive_rng(self.seed, stream as u64, cycle),
                    engine: Arc::clone(&self.engine),
                    allocator: self.allocator.clone(),
                    bus: Arc::clone(&self.bus),
                    velocity: self.velocity,
                };
                (team.id.clone(), tokio::spawn(unit.run()))
            })
            .collect()
    }

    /// Resolve dependencies whose provider is done, or, without a provider,
    /// whose depended-on team finished a card this cycle. Blocked cards
    /// waiting on them go back to ready.
    async fn resolve_dependencies(&self, outcomes: &[CycleOutcome]) -> usize {
        let done: HashSet<CardId> = self
            .org
            .snapshots()
            .iter()
            .flat_map(|s| s.cards(CardStatus::Done).iter().map(|c| c.id).collect::<Vec<_>>())
            .collect();
        let delivered: HashSet<&TeamId> = outcomes
            .iter()
            .filter(|o| o.throughput() > 0)
            .map(|o| &o.team)
            .collect();

        let mut resolved = 0;
        for team in self.org.teams() {
            let mut board = team.board.write().await;
            let satisfied: Vec<CardId> = board
                .cards()
                .filter(|c| !c.is_archived())
                .filter_map(|c| c.dependency().filter(|d| d.is_open()).map(|d| (c.id, d)))
                .filter(|(_, d)| match d.provider {
                    Some(provider) => done.contains(&provider),
                    None => delivered.contains(&d.depends_on_team),
                })
                .map(|(id, _)| id)
                .collect();

            for id in satisfied {
                if board.set_dependency_status(id, DependencyStatus::Resolved).is_err() {
                    continue;
                }
                resolved += 1;
                let waiting = board
                    .card(id)
                    .map(|c| c.status == CardStatus::Blocked && c.blocked_until.is_none())
                    .unwrap_or(false);
                if waiting {
                    if let Err(rejection) = board.move_card(id, CardStatus::Ready) {
                        tlog_debug!("dependency: card {} stays blocked: {}", id.short(), rejection);
                    }
                }
                tlog_debug!("dependency: card {} on {} resolved", id.short(), team.id);
            }
        }
        resolved
    }

    /// Write boards, new loan records and this cycle's audit entries.
    /// Store failures are logged; the run goes on.
    async fn persist(&self, cycle: u32, records: &[BorrowRecord]) {
        let Some(store) = &self.store else {
            return;
        };
        let store = Arc::clone(store);
        let snapshots = self.org.snapshots();
        let records = records.to_vec();
        let audit = self.budget.audit_for_cycle(cycle);
        let result = blocking_with_timeout(STORE_TIMEOUT, move || {
            for snapshot in &snapshots {
                store.put_board(snapshot)?;
            }
            for record in &records {
                store.put_borrow(record)?;
            }
            store.append_audit(RUN_SCOPE, &audit)
        })
        .await;
        if let Err(e) = result {
            tlog_warn!("store: cycle {} not persisted: {}", cycle, e);
        }
    }
}
