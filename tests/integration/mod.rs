//! Integration test suite for tandem.
//!
//! These tests drive whole runs through the orchestrator and check the
//! organization-level guarantees that no single module can check alone.
//!
//! # Test Categories
//!
//! - `borrowing`: borrow execution, rejection and return
//! - `coordination_timeout`: deadline fallback for slow advisors
//! - `invariants`: WIP limits and roster consistency over full runs
//! - `disturbances`: impact caps and suppression
//! - `budget`: allocation arithmetic and spend accounting
//! - `persistence`: JSON store output of a run
//! - `external_advisor`: `/bin/sh` scripts as advisors (unix only)
//!
//! # CI Compatibility
//!
//! Advisors are in-process or `/bin/sh` scripts; no network access.

mod fixtures;

mod borrowing;
mod budget;
mod coordination_timeout;
mod disturbances;
mod external_advisor;
mod invariants;
mod persistence;
