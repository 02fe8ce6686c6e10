//! Core domain models for the delivery simulation.
//!
//! Teams, workers and cards refer to one another only by id; the
//! orchestrator owns the flat collections they live in.

pub mod board;
pub mod card;
pub mod dependency;
pub mod ids;
pub mod worker;

pub use board::{
    BoardGuard, BoardSnapshot, CapacityLimits, MoveRejection, Moved, SharedBoard, TaskBoard,
};
pub use card::{
    CardId, CardStatus, Dependency, DependencyStatus, DependencyType, Pair, Priority, TaskCard,
};
pub use dependency::{DependencyFact, TeamDependencyGraph};
pub use ids::{TeamId, WorkerId};
pub use worker::{Seniority, Worker, WorkerRole};
