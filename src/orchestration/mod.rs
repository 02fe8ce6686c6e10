//! Scheduling and coordination engine.
//!
//! Team cycles ([`cycle`]) pair workers and take disturbances; between
//! cycles the [`coordination`] loop moves workers across teams under the
//! overhead [`budget`]. The [`orchestrator`] drives both.

pub mod advisor;
pub mod borrow;
pub mod budget;
pub mod coordination;
pub mod cycle;
pub mod disturbance;
pub mod external;
pub mod health;
pub mod organization;
pub mod orchestrator;
pub mod pairing;

pub use advisor::{Advisor, Assessment, BorrowDirective, HealthPayload, HeuristicAdvisor, Plan};
pub use borrow::{BorrowLedger, BorrowRecord, BorrowRejection};
pub use budget::{allocate, BudgetAllocation, OverheadBudgetManager, StepName, StepOutcome, StepRecord};
pub use coordination::{CheckinResult, CoordinationLoop, PassResult, RejectedDirective};
pub use cycle::{CycleOutcome, CycleUnit, Velocity};
pub use disturbance::{DisturbanceEngine, DisturbanceEvent, DisturbanceKind, DisturbanceSpec, Effect};
pub use external::CommandAdvisor;
pub use health::{MemberStatus, TeamHealth};
pub use organization::{Organization, TeamHandle};
pub use orchestrator::PoolOrchestrator;
pub use pairing::{PairingAllocator, ProposedPair, RoleRule};
