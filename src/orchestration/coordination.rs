//! Cross-team coordination.
//!
//! A full pass runs between cycles and is the only place workers change
//! teams:
//!
//! 1. send home workers whose loan ran out,
//! 2. gather team health,
//! 3. detect cross-team dependencies,
//! 4. ask the advisor for an assessment,
//! 5. ask the advisor for a borrow plan,
//! 6. execute at most `max_borrows_per_cycle` borrows,
//! 7. broadcast a summary on the coordination channel.
//!
//! Steps 4 and 5 are time-boxed through the [`OverheadBudgetManager`]. If
//! either times out or fails, the pass takes no action and step 7 publishes
//! [`Payload::CoordinationSkipped`] instead of a summary. A checkin runs steps
//! 2 to 4 mid-cycle against published snapshots and never mutates anything.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::bus::{Channel, Message, MessageBus, Payload};
use crate::config::CoordinationConfig;
use crate::core::dependency::detect;
use crate::core::{TeamDependencyGraph, TeamId, WorkerId};
use crate::orchestration::advisor::{Advisor, Assessment, BorrowDirective, HealthPayload, Plan};
use crate::orchestration::borrow::{BorrowRecord, BorrowRejection};
use crate::orchestration::budget::{OverheadBudgetManager, StepName, StepOutcome};
use crate::orchestration::health;
use crate::orchestration::organization::Organization;
use crate::{tlog, tlog_debug, tlog_warn};

const SENDER: &str = "coordination";

/// A directive the organization refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedDirective {
    pub directive: BorrowDirective,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PassResult {
    pub cycle: u32,
    pub returned: Vec<BorrowRecord>,
    /// Due home but still mid-session.
    pub deferred: Vec<WorkerId>,
    pub borrows: Vec<BorrowRecord>,
    pub rejected: Vec<RejectedDirective>,
    /// Evaluate or plan ran out of time.
    pub timed_out: bool,
    /// Evaluate or plan failed.
    pub failure: Option<String>,
    pub notes: Vec<String>,
    pub open_dependencies: usize,
    pub dependency_cycles: Vec<Vec<TeamId>>,
}

impl PassResult {
    /// True when the pass fell back to doing nothing.
    pub fn fell_back(&self) -> bool {
        self.timed_out || self.failure.is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckinResult {
    pub cycle: u32,
    pub assessment: Option<Assessment>,
    pub timed_out: bool,
    pub failure: Option<String>,
}

pub struct CoordinationLoop {
    advisor: Arc<dyn Advisor>,
    bus: Arc<MessageBus>,
    max_borrows_per_cycle: usize,
    borrow_duration: u32,
}

impl CoordinationLoop {
    pub fn new(
        advisor: Arc<dyn Advisor>,
        bus: Arc<MessageBus>,
        max_borrows_per_cycle: usize,
        borrow_duration: u32,
    ) -> Self {
        Self {
            advisor,
            bus,
            max_borrows_per_cycle,
            borrow_duration,
        }
    }

    pub fn from_config(advisor: Arc<dyn Advisor>, bus: Arc<MessageBus>, config: &CoordinationConfig) -> Self {
        Self::new(advisor, bus, config.max_borrows_per_cycle, config.borrow_duration)
    }

    pub fn advisor_name(&self) -> &str {
        self.advisor.name()
    }

    /// Steps 2 and 3: health plus the dependency picture.
    pub fn health_payload(org: &Organization, cycle: u32) -> HealthPayload {
        let teams = health::gather(org);
        let snapshots = org.snapshots();
        let dependencies = detect(snapshots.iter().map(|s| s.as_ref()));
        let dependency_cycles = TeamDependencyGraph::from_facts(&dependencies).cycles();
        HealthPayload {
            cycle,
            teams,
            dependencies,
            dependency_cycles,
        }
    }

    /// Run all seven steps.
    pub async fn full_pass(
        &self,
        org: &mut Organization,
        budget: &OverheadBudgetManager,
        cycle: u32,
    ) -> PassResult {
        let mut result = PassResult {
            cycle,
            ..Default::default()
        };

        let returns = org.return_due(cycle);
        for record in &returns.returned {
            self.announce_transfer(cycle, &record.worker, &record.destination, &record.source, true);
        }
        result.returned = returns.returned;
        result.deferred = returns.deferred;

        let payload = Self::health_payload(org, cycle);
        result.open_dependencies = payload.dependencies.iter().filter(|d| d.is_open()).count();
        result.dependency_cycles = payload.dependency_cycles.clone();

        let deadline = budget.deadline(StepName::Coordination);
        let started = Instant::now();

        let advisor = Arc::clone(&self.advisor);
        let outcome = budget
            .run_step("evaluate", StepName::Coordination, cycle, deadline, move |cancel| {
                advisor.evaluate(payload, cancel)
            })
            .await;
        let Some(assessment) = self.accept(outcome, &mut result) else {
            self.broadcast(&result);
            return result;
        };
        result.notes.extend(assessment.notes.iter().cloned());
        if !assessment.needs_action() {
            tlog_debug!("coordination: cycle {} needs no borrows", cycle);
            self.broadcast(&result);
            return result;
        }

        let remaining = deadline
            .saturating_sub(started.elapsed())
            .max(budget.min_step());
        let advisor = Arc::clone(&self.advisor);
        let outcome = budget
            .run_step("plan", StepName::Coordination, cycle, remaining, move |cancel| {
                advisor.plan(assessment, cancel)
            })
            .await;
        let Some(plan) = self.accept(outcome, &mut result) else {
            self.broadcast(&result);
            return result;
        };

        self.execute(org, plan, cycle, &mut result).await;
        self.broadcast(&result);
        result
    }

    /// Steps 2 to 4, read-only.
    pub async fn checkin(
        &self,
        org: &Organization,
        budget: &OverheadBudgetManager,
        cycle: u32,
    ) -> CheckinResult {
        let payload = Self::health_payload(org, cycle);
        let advisor = Arc::clone(&self.advisor);
        let outcome = budget
            .run_step(
                "checkin",
                StepName::Checkin,
                cycle,
                budget.deadline(StepName::Checkin),
                move |cancel| advisor.evaluate(payload, cancel),
            )
            .await;

        let mut result = CheckinResult {
            cycle,
            ..Default::default()
        };
        match outcome {
            StepOutcome::Completed(assessment) => {
                if assessment.needs_action() {
                    let names: Vec<&str> = assessment.struggling.iter().map(TeamId::as_str).collect();
                    tlog!("checkin: cycle {} teams struggling: {}", cycle, names.join(", "));
                }
                result.assessment = Some(assessment);
            }
            StepOutcome::TimedOut => result.timed_out = true,
            StepOutcome::Failed(reason) => result.failure = Some(reason),
        }
        result
    }

    fn accept<T>(&self, outcome: StepOutcome<T>, result: &mut PassResult) -> Option<T> {
        match outcome {
            StepOutcome::Completed(value) => Some(value),
            StepOutcome::TimedOut => {
                tlog_warn!("coordination: cycle {} timed out, taking no action", result.cycle);
                result.timed_out = true;
                None
            }
            StepOutcome::Failed(reason) => {
                tlog_warn!("coordination: cycle {} advisor failed: {}", result.cycle, reason);
                result.failure = Some(reason);
                None
            }
        }
    }

    async fn execute(&self, org: &mut Organization, plan: Plan, cycle: u32, result: &mut PassResult) {
        result.notes.extend(plan.notes);
        for directive in plan.directives {
            if result.borrows.len() >= self.max_borrows_per_cycle {
                result.rejected.push(RejectedDirective {
                    reason: BorrowRejection::PassLimitReached(self.max_borrows_per_cycle).to_string(),
                    directive,
                });
                continue;
            }
            match org
                .borrow(
                    &directive.source,
                    &directive.destination,
                    &directive.worker,
                    self.borrow_duration,
                    &directive.reason,
                    cycle,
                )
                .await
            {
                Ok(record) => {
                    self.announce_transfer(
                        cycle,
                        &record.worker,
                        &record.source,
                        &record.destination,
                        false,
                    );
                    result.borrows.push(record);
                }
                Err(rejection) => {
                    tlog_debug!("coordination: borrow of {} refused: {}", directive.worker, rejection);
                    result.rejected.push(RejectedDirective {
                        reason: rejection.to_string(),
                        directive,
                    });
                }
            }
        }
    }

    fn announce_transfer(&self, cycle: u32, worker: &WorkerId, from: &TeamId, to: &TeamId, returning: bool) {
        self.bus.publish(Message::new(
            Channel::CrossTeam,
            SENDER,
            cycle,
            Payload::Transfer {
                worker: worker.clone(),
                from: from.clone(),
                to: to.clone(),
                returning,
            },
        ));
    }

    fn broadcast(&self, result: &PassResult) {
        let payload = if result.fell_back() {
            Payload::CoordinationSkipped {
                returns: result.returned.len(),
                timed_out: result.timed_out,
                reason: result
                    .failure
                    .clone()
                    .unwrap_or_else(|| "deadline exceeded".to_string()),
            }
        } else {
            Payload::CoordinationSummary {
                borrows: result.borrows.len(),
                returns: result.returned.len(),
                notes: result.notes.clone(),
            }
        };
        self.bus
            .publish(Message::new(Channel::Coordination, SENDER, result.cycle, payload));
    }
}
