//! Persistence for boards, loans and the coordination audit trail.
//!
//! The simulation never reads its own state back mid-run; stores exist so
//! a finished run can be inspected.

mod json;
mod store;

pub use json::JsonStore;
pub use store::{MemoryStore, Store, RUN_SCOPE};
