//! Worker model.

use crate::core::ids::{TeamId, WorkerId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Seniority {
    Junior,
    #[default]
    Mid,
    Senior,
}

/// Role used by the pairing rules. Free-form skills live in
/// [`Worker::specializations`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    #[default]
    Engineer,
    Tester,
    Lead,
}

/// A worker ("agent").
///
/// `home_team_id` never changes. `current_team_id` differs from it only
/// while the worker is on loan, and both it and `busy` are written only by
/// the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    #[serde(default)]
    pub specializations: Vec<String>,
    #[serde(default)]
    pub seniority: Seniority,
    #[serde(default)]
    pub role: WorkerRole,
    pub home_team_id: TeamId,
    pub current_team_id: TeamId,
    /// Holding a pairing session on some card.
    #[serde(default)]
    pub busy: bool,
}

impl Worker {
    pub fn new(id: &str, home_team: &TeamId, role: WorkerRole, seniority: Seniority) -> Self {
        Self {
            id: WorkerId::from(id),
            specializations: Vec::new(),
            seniority,
            role,
            home_team_id: home_team.clone(),
            current_team_id: home_team.clone(),
            busy: false,
        }
    }

    pub fn with_specializations(mut self, tags: &[&str]) -> Self {
        self.specializations = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn is_on_loan(&self) -> bool {
        self.current_team_id != self.home_team_id
    }

    pub fn is_tester(&self) -> bool {
        self.role == WorkerRole::Tester
    }

    pub fn is_lead(&self) -> bool {
        self.role == WorkerRole::Lead
    }

    pub fn has_specialization(&self, tag: &str) -> bool {
        self.specializations.iter().any(|s| s.eq_ignore_ascii_case(tag))
    }
}
