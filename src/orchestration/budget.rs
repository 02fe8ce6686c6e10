//! Wall-clock overhead budget.
//!
//! The run has a fixed budget of seconds for coordination overhead. A share
//! goes to iteration zero (initial planning); the rest is split evenly over
//! cycles, and each cycle's share is split across the three budgeted steps by
//! weight. Every step deadline is floored at `min_step_timeout_seconds`, so
//! the realized spend can exceed the nominal budget; that overspend is
//! computed up front and logged rather than hidden.
//!
//! [`OverheadBudgetManager::run_step`] races a collaborator against its
//! deadline. A step that runs out of time is cancelled through its
//! [`CancellationToken`] and reported as [`StepOutcome::TimedOut`]; it is
//! never an error.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::util::secs;
use crate::{tlog, tlog_debug, tlog_warn, Result};

/// Steps that receive a weighted share of each cycle's budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    /// Full coordination pass between cycles (evaluate and plan share it).
    Coordination,
    /// Per-team work distribution inside a cycle.
    Distribution,
    /// Mid-cycle observational pass.
    Checkin,
}

impl StepName {
    pub const ALL: [StepName; 3] = [
        StepName::Coordination,
        StepName::Distribution,
        StepName::Checkin,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StepName::Coordination => "coordination",
            StepName::Distribution => "distribution",
            StepName::Checkin => "checkin",
        }
    }
}

impl std::fmt::Display for StepName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepName {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        StepName::ALL
            .into_iter()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| format!("unknown budget step '{}'", s))
    }
}

/// Result of a time-boxed step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome<T> {
    Completed(T),
    TimedOut,
    /// The collaborator returned an error or panicked.
    Failed(String),
}

impl<T> StepOutcome<T> {
    pub fn is_timed_out(&self) -> bool {
        matches!(self, StepOutcome::TimedOut)
    }

    pub fn completed(self) -> Option<T> {
        match self {
            StepOutcome::Completed(value) => Some(value),
            _ => None,
        }
    }
}

/// One entry in the run's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Step label, e.g. `evaluate` or `plan`.
    pub step: String,
    /// Budget bucket the step was charged to. `None` for iteration zero.
    pub phase: Option<StepName>,
    pub cycle: u32,
    pub elapsed_seconds: f64,
    pub deadline_seconds: f64,
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Pure arithmetic split of the overhead budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetAllocation {
    pub total_seconds: f64,
    pub iteration_zero_seconds: f64,
    pub per_cycle_seconds: f64,
    pub cycles: u32,
    /// Weighted share per step before the floor.
    pub nominal: BTreeMap<StepName, f64>,
    /// Deadline per step after the floor.
    pub deadlines: BTreeMap<StepName, f64>,
    pub min_step_seconds: f64,
}

impl BudgetAllocation {
    pub fn deadline(&self, step: StepName) -> Duration {
        secs(self.deadline_seconds(step))
    }

    pub fn deadline_seconds(&self, step: StepName) -> f64 {
        self.deadlines
            .get(&step)
            .copied()
            .unwrap_or(self.min_step_seconds)
    }

    /// Extra seconds per cycle caused by the floor.
    pub fn floor_overspend_per_cycle(&self) -> f64 {
        StepName::ALL
            .into_iter()
            .map(|step| {
                let nominal = self.nominal.get(&step).copied().unwrap_or(0.0);
                (self.deadline_seconds(step) - nominal).max(0.0)
            })
            .sum()
    }

    /// Worst-case spend beyond the nominal budget over the whole run.
    pub fn projected_overspend(&self) -> f64 {
        self.floor_overspend_per_cycle() * f64::from(self.cycles)
    }
}

/// Split `total` seconds across iteration zero, cycles and steps.
pub fn allocate(
    total: f64,
    iteration_zero_share: f64,
    weights: &BTreeMap<StepName, f64>,
    cycles: u32,
    min_step_seconds: f64,
) -> BudgetAllocation {
    let iteration_zero = total * iteration_zero_share;
    let per_cycle = if cycles == 0 {
        0.0
    } else {
        (total - iteration_zero) / f64::from(cycles)
    };

    let nominal: BTreeMap<StepName, f64> = StepName::ALL
        .into_iter()
        .map(|step| (step, per_cycle * weights.get(&step).copied().unwrap_or(0.0)))
        .collect();
    let deadlines = nominal
        .iter()
        .map(|(step, seconds)| (*step, seconds.max(min_step_seconds)))
        .collect();

    BudgetAllocation {
        total_seconds: total,
        iteration_zero_seconds: iteration_zero,
        per_cycle_seconds: per_cycle,
        cycles,
        nominal,
        deadlines,
        min_step_seconds,
    }
}

/// Tracks spend against a [`BudgetAllocation`] and keeps the audit trail.
///
/// Shared by reference across every concurrent unit of a run; the spent
/// counter is atomic and the audit trail is append-only.
pub struct OverheadBudgetManager {
    allocation: BudgetAllocation,
    spent_micros: AtomicU64,
    audit: Mutex<Vec<StepRecord>>,
}

impl OverheadBudgetManager {
    pub fn new(allocation: BudgetAllocation) -> Self {
        let overspend = allocation.projected_overspend();
        if overspend > 0.0 {
            tlog_warn!(
                "budget: step floor of {:.1}s adds up to {:.1}s beyond the nominal {:.1}s",
                allocation.min_step_seconds,
                overspend,
                allocation.total_seconds
            );
        }
        tlog!(
            "budget: total={:.1}s iteration_zero={:.1}s per_cycle={:.1}s cycles={}",
            allocation.total_seconds,
            allocation.iteration_zero_seconds,
            allocation.per_cycle_seconds,
            allocation.cycles
        );
        Self {
            allocation,
            spent_micros: AtomicU64::new(0),
            audit: Mutex::new(Vec::new()),
        }
    }

    pub fn allocation(&self) -> &BudgetAllocation {
        &self.allocation
    }

    pub fn deadline(&self, step: StepName) -> Duration {
        self.allocation.deadline(step)
    }

    pub fn min_step(&self) -> Duration {
        secs(self.allocation.min_step_seconds)
    }

    /// Race `work` against `deadline`.
    ///
    /// The work runs as its own task and receives a cancellation token. On
    /// timeout the token is cancelled and the task is left to wind down on
    /// its own; whatever it eventually produces is dropped.
    pub async fn run_step<T, F, Fut>(
        &self,
        step: &str,
        phase: StepName,
        cycle: u32,
        deadline: Duration,
        work: F,
    ) -> StepOutcome<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let cancel = CancellationToken::new();
        let start = Instant::now();
        let mut handle = tokio::spawn(work(cancel.clone()));

        let outcome = match tokio::time::timeout(deadline, &mut handle).await {
            Ok(Ok(Ok(value))) => StepOutcome::Completed(value),
            Ok(Ok(Err(e))) => StepOutcome::Failed(e.to_string()),
            Ok(Err(join_err)) => StepOutcome::Failed(join_err.to_string()),
            Err(_) => {
                cancel.cancel();
                drop(handle);
                StepOutcome::TimedOut
            }
        };
        let elapsed = start.elapsed();

        let failure = match &outcome {
            StepOutcome::Failed(reason) => Some(reason.clone()),
            _ => None,
        };
        if outcome.is_timed_out() {
            tlog_warn!(
                "budget: step {} (cycle {}) timed out after {:.2}s",
                step,
                cycle,
                elapsed.as_secs_f64()
            );
        } else if let Some(reason) = &failure {
            tlog_warn!("budget: step {} (cycle {}) failed: {}", step, cycle, reason);
        }

        self.record(StepRecord {
            step: step.to_string(),
            phase: Some(phase),
            cycle,
            elapsed_seconds: elapsed.as_secs_f64(),
            deadline_seconds: deadline.as_secs_f64(),
            timed_out: outcome.is_timed_out(),
            failure,
        });
        outcome
    }

    /// Time a bounded local step without racing it.
    ///
    /// Going over the step's deadline is logged but not interrupted.
    pub async fn measure<T, Fut>(
        &self,
        step: &str,
        phase: Option<StepName>,
        cycle: u32,
        work: Fut,
    ) -> T
    where
        Fut: Future<Output = T>,
    {
        let deadline = match phase {
            Some(phase) => self.allocation.deadline_seconds(phase),
            None => self.allocation.iteration_zero_seconds,
        };
        let start = Instant::now();
        let value = work.await;
        let elapsed = start.elapsed().as_secs_f64();
        if elapsed > deadline {
            tlog_warn!(
                "budget: step {} (cycle {}) took {:.2}s, over its {:.2}s deadline",
                step,
                cycle,
                elapsed,
                deadline
            );
        }
        self.record(StepRecord {
            step: step.to_string(),
            phase,
            cycle,
            elapsed_seconds: elapsed,
            deadline_seconds: deadline,
            timed_out: false,
            failure: None,
        });
        value
    }

    /// Append a record and charge its elapsed time.
    pub fn record(&self, record: StepRecord) {
        let micros = (record.elapsed_seconds * 1_000_000.0).round().max(0.0) as u64;
        self.spent_micros.fetch_add(micros, Ordering::Relaxed);
        tlog_debug!(
            "budget: {} cycle={} elapsed={:.3}s timed_out={}",
            record.step,
            record.cycle,
            record.elapsed_seconds,
            record.timed_out
        );
        match self.audit.lock() {
            Ok(mut audit) => audit.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }

    pub fn spent(&self) -> Duration {
        Duration::from_micros(self.spent_micros.load(Ordering::Relaxed))
    }

    pub fn spent_seconds(&self) -> f64 {
        self.spent().as_secs_f64()
    }

    /// Seconds left in the nominal budget; never negative.
    pub fn remaining_seconds(&self) -> f64 {
        (self.allocation.total_seconds - self.spent_seconds()).max(0.0)
    }

    /// Seconds spent beyond the nominal budget.
    pub fn overspend_seconds(&self) -> f64 {
        (self.spent_seconds() - self.allocation.total_seconds).max(0.0)
    }

    /// Copy of the audit trail so far.
    pub fn audit(&self) -> Vec<StepRecord> {
        match self.audit.lock() {
            Ok(audit) => audit.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Audit entries recorded for one cycle.
    pub fn audit_for_cycle(&self, cycle: u32) -> Vec<StepRecord> {
        self.audit()
            .into_iter()
            .filter(|record| record.cycle == cycle)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn weights() -> BTreeMap<StepName, f64> {
        BTreeMap::from([
            (StepName::Coordination, 0.50),
            (StepName::Distribution, 0.30),
            (StepName::Checkin, 0.20),
        ])
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn manager(min_step: f64) -> OverheadBudgetManager {
        OverheadBudgetManager::new(allocate(2160.0, 0.40, &weights(), 3, min_step))
    }

    #[test]
    fn test_allocation_arithmetic() {
        let a = allocate(2160.0, 0.40, &weights(), 3, 5.0);
        assert!(close(a.iteration_zero_seconds, 864.0));
        assert!(close(a.per_cycle_seconds, 432.0));
        assert!(close(a.deadline_seconds(StepName::Coordination), 216.0));
        assert!(close(a.deadline_seconds(StepName::Distribution), 129.6));
        assert!(close(a.deadline_seconds(StepName::Checkin), 86.4));
        assert!(close(a.projected_overspend(), 0.0));
    }

    #[test]
    fn test_floor_raises_small_deadlines() {
        let a = allocate(10.0, 0.40, &weights(), 3, 5.0);
        // 6s over three cycles: nominal 1.0 / 0.6 / 0.4 per step.
        assert!(close(a.deadline_seconds(StepName::Coordination), 5.0));
        assert!(close(a.deadline_seconds(StepName::Checkin), 5.0));
        assert!(close(a.floor_overspend_per_cycle(), 4.0 + 4.4 + 4.6));
        assert!(a.projected_overspend() > 0.0);
    }

    #[test]
    fn test_zero_cycles_allocates_nothing_per_cycle() {
        let a = allocate(100.0, 0.5, &weights(), 0, 0.0);
        assert!(close(a.per_cycle_seconds, 0.0));
    }

    #[test]
    fn test_step_name_parse() {
        assert_eq!("checkin".parse::<StepName>().unwrap(), StepName::Checkin);
        assert!("standup".parse::<StepName>().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_step_completes() {
        let budget = manager(5.0);
        let outcome = budget
            .run_step("evaluate", StepName::Coordination, 1, Duration::from_secs(10), |_| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Ok(7)
            })
            .await;
        assert_eq!(outcome, StepOutcome::Completed(7));
        let audit = budget.audit();
        assert_eq!(audit.len(), 1);
        assert!(!audit[0].timed_out);
        assert!(close(audit[0].elapsed_seconds, 2.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_step_times_out_and_cancels() {
        let budget = manager(5.0);
        let (tx, rx) = tokio::sync::oneshot::channel();
        let outcome: StepOutcome<u32> = budget
            .run_step("plan", StepName::Coordination, 2, Duration::from_secs(3), |cancel| async move {
                cancel.cancelled().await;
                let _ = tx.send(());
                Ok(1)
            })
            .await;

        assert!(outcome.is_timed_out());
        rx.await.unwrap();
        let audit = budget.audit();
        assert!(audit[0].timed_out);
        assert_eq!(audit[0].step, "plan");
        assert!(close(audit[0].deadline_seconds, 3.0));
    }

    #[tokio::test]
    async fn test_run_step_reports_failure() {
        let budget = manager(5.0);
        let outcome: StepOutcome<()> = budget
            .run_step("evaluate", StepName::Coordination, 1, Duration::from_secs(1), |_| async {
                Err(Error::Advisor("model unavailable".to_string()))
            })
            .await;
        assert!(matches!(outcome, StepOutcome::Failed(ref r) if r.contains("model unavailable")));
        let audit = budget.audit();
        assert!(!audit[0].timed_out);
        assert!(audit[0].failure.is_some());
    }

    #[tokio::test]
    async fn test_run_step_survives_panic() {
        let budget = manager(5.0);
        let outcome: StepOutcome<()> = budget
            .run_step("plan", StepName::Coordination, 1, Duration::from_secs(1), |_| async {
                if true {
                    panic!("collaborator crashed");
                }
                Ok(())
            })
            .await;
        assert!(matches!(outcome, StepOutcome::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spent_accumulates_and_remaining_shrinks() {
        let budget = manager(5.0);
        budget
            .measure("distribution", Some(StepName::Distribution), 1, async {
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
            .await;
        budget
            .measure("planning", None, 0, async {
                tokio::time::sleep(Duration::from_secs(100)).await;
            })
            .await;

        assert!(close(budget.spent_seconds(), 160.0));
        assert!(close(budget.remaining_seconds(), 2000.0));
        assert!(close(budget.overspend_seconds(), 0.0));
        assert_eq!(budget.audit_for_cycle(1).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_measure_over_deadline_is_recorded_not_interrupted() {
        let budget = manager(5.0);
        let value = budget
            .measure("distribution", Some(StepName::Distribution), 1, async {
                tokio::time::sleep(Duration::from_secs(200)).await;
                "done"
            })
            .await;
        assert_eq!(value, "done");
        assert!(budget.audit()[0].elapsed_seconds > budget.audit()[0].deadline_seconds);
    }
}
