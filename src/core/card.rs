//! Task card data model.
//!
//! Cards are the small, story-point weighted units of work that live on a
//! team's board. Their status only changes through board-mediated moves;
//! completed cards are archived in place (they keep their `done` status and
//! gain a completion timestamp) and are never deleted.

use crate::core::ids::{TeamId, WorkerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Metadata key naming the team a card depends on.
pub const META_DEPENDS_ON_TEAM: &str = "depends_on_team";
/// Metadata key holding the [`DependencyType`].
pub const META_DEPENDENCY_TYPE: &str = "dependency_type";
/// Metadata key holding the [`DependencyStatus`].
pub const META_DEPENDENCY_STATUS: &str = "dependency_status";
/// Metadata key naming the card on the other team that satisfies the dependency.
pub const META_DEPENDENCY_PROVIDER: &str = "dependency_provider";
/// Metadata key set on cards created or touched by a disturbance.
pub const META_DISTURBANCE: &str = "disturbance";
/// Metadata key set on cards carrying flaky tests.
pub const META_FLAKY: &str = "flaky";

/// Unique identifier for a card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CardId(pub Uuid);

impl CardId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for CardId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for CardId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Column a card sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardStatus {
    Ready,
    InProgress,
    Review,
    Done,
    Blocked,
}

impl CardStatus {
    pub const ALL: [CardStatus; 5] = [
        CardStatus::Ready,
        CardStatus::InProgress,
        CardStatus::Review,
        CardStatus::Done,
        CardStatus::Blocked,
    ];

    /// Failure and completion must always be recordable, so moves into
    /// these columns skip admission control.
    pub fn bypasses_capacity(self) -> bool {
        matches!(self, CardStatus::Blocked | CardStatus::Done)
    }

    /// Whether a pair is actively working cards in this column.
    pub fn is_active(self) -> bool {
        matches!(self, CardStatus::InProgress | CardStatus::Review)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CardStatus::Ready => "ready",
            CardStatus::InProgress => "in_progress",
            CardStatus::Review => "review",
            CardStatus::Done => "done",
            CardStatus::Blocked => "blocked",
        }
    }
}

impl std::fmt::Display for CardStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CardStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        CardStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown card status '{}'", s))
    }
}

/// Scheduling priority; urgent cards are picked up first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Normal,
    Urgent,
}

/// Kind of cross-team dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    /// The other team's work must land before this card can start.
    Blocks,
    /// This card consumes an API the other team has not shipped yet.
    NeedsApi,
    /// Both teams touch a shared component. Advisory only.
    SharedComponent,
}

impl DependencyType {
    /// Whether an open dependency of this type keeps the card in `blocked`.
    pub fn gates_work(self) -> bool {
        matches!(self, DependencyType::Blocks | DependencyType::NeedsApi)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DependencyType::Blocks => "blocks",
            DependencyType::NeedsApi => "needs_api",
            DependencyType::SharedComponent => "shared_component",
        }
    }
}

impl std::str::FromStr for DependencyType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "blocks" => Ok(DependencyType::Blocks),
            "needs_api" => Ok(DependencyType::NeedsApi),
            "shared_component" => Ok(DependencyType::SharedComponent),
            other => Err(format!("unknown dependency type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyStatus {
    Open,
    Resolved,
}

impl DependencyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DependencyStatus::Open => "open",
            DependencyStatus::Resolved => "resolved",
        }
    }
}

impl std::str::FromStr for DependencyStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "open" => Ok(DependencyStatus::Open),
            "resolved" => Ok(DependencyStatus::Resolved),
            other => Err(format!("unknown dependency status '{}'", other)),
        }
    }
}

/// Cross-team dependency descriptor carried in a card's metadata map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub depends_on_team: TeamId,
    pub dependency_type: DependencyType,
    pub dependency_status: DependencyStatus,
    /// Card on `depends_on_team` whose completion resolves this dependency.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<CardId>,
}

impl Dependency {
    pub fn open(depends_on_team: TeamId, dependency_type: DependencyType) -> Self {
        Self {
            depends_on_team,
            dependency_type,
            dependency_status: DependencyStatus::Open,
            provider: None,
        }
    }

    pub fn with_provider(mut self, provider: CardId) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn is_open(&self) -> bool {
        self.dependency_status == DependencyStatus::Open
    }

    /// Whether this dependency currently prevents work on its card.
    pub fn is_gating(&self) -> bool {
        self.is_open() && self.dependency_type.gates_work()
    }
}

/// A driver/navigator pair working a card.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pair {
    pub driver: WorkerId,
    pub navigator: WorkerId,
}

impl Pair {
    pub fn new(driver: WorkerId, navigator: WorkerId) -> Self {
        Self { driver, navigator }
    }

    pub fn contains(&self, worker: &WorkerId) -> bool {
        &self.driver == worker || &self.navigator == worker
    }

    pub fn members(&self) -> [&WorkerId; 2] {
        [&self.driver, &self.navigator]
    }

    /// The other member of the pair, if `worker` is in it.
    pub fn partner_of(&self, worker: &WorkerId) -> Option<&WorkerId> {
        if &self.driver == worker {
            Some(&self.navigator)
        } else if &self.navigator == worker {
            Some(&self.driver)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Pair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(driver)+{}(navigator)", self.driver, self.navigator)
    }
}

/// A single card on a team board.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCard {
    pub id: CardId,
    pub title: String,
    pub status: CardStatus,
    /// Story points.
    pub weight: u32,
    pub team_id: TeamId,
    pub assigned_pair: Option<Pair>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Points of work already done against `weight`.
    #[serde(default)]
    pub progress: u32,
    #[serde(default)]
    pub priority: Priority,
    /// Cycle after which a disturbance-induced block lifts.
    #[serde(default)]
    pub blocked_until: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskCard {
    /// Create a new ready card. Weights below one point are raised to one.
    pub fn new(title: &str, weight: u32, team_id: TeamId) -> Self {
        Self {
            id: CardId::new(),
            title: title.to_string(),
            status: CardStatus::Ready,
            weight: weight.max(1),
            team_id,
            assigned_pair: None,
            metadata: BTreeMap::new(),
            progress: 0,
            priority: Priority::Normal,
            blocked_until: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Attach a dependency descriptor. A gating dependency starts the card
    /// in `blocked`.
    pub fn with_dependency(mut self, dependency: &Dependency) -> Self {
        self.set_dependency(dependency);
        if dependency.is_gating() {
            self.status = CardStatus::Blocked;
        }
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// Parse the dependency descriptor out of the metadata map.
    ///
    /// Returns `None` if there is no descriptor or it is malformed.
    pub fn dependency(&self) -> Option<Dependency> {
        let team = self.metadata.get(META_DEPENDS_ON_TEAM)?;
        let dependency_type = self.metadata.get(META_DEPENDENCY_TYPE)?.parse().ok()?;
        let dependency_status = self
            .metadata
            .get(META_DEPENDENCY_STATUS)
            .map(|s| s.parse())
            .unwrap_or(Ok(DependencyStatus::Open))
            .ok()?;
        let provider = self
            .metadata
            .get(META_DEPENDENCY_PROVIDER)
            .and_then(|s| s.parse().ok());

        Some(Dependency {
            depends_on_team: TeamId::from(team.as_str()),
            dependency_type,
            dependency_status,
            provider,
        })
    }

    pub(crate) fn set_dependency(&mut self, dependency: &Dependency) {
        self.metadata.insert(
            META_DEPENDS_ON_TEAM.to_string(),
            dependency.depends_on_team.to_string(),
        );
        self.metadata.insert(
            META_DEPENDENCY_TYPE.to_string(),
            dependency.dependency_type.as_str().to_string(),
        );
        self.metadata.insert(
            META_DEPENDENCY_STATUS.to_string(),
            dependency.dependency_status.as_str().to_string(),
        );
        match dependency.provider {
            Some(provider) => {
                self.metadata
                    .insert(META_DEPENDENCY_PROVIDER.to_string(), provider.to_string());
            }
            None => {
                self.metadata.remove(META_DEPENDENCY_PROVIDER);
            }
        }
    }

    /// Whether a gating dependency is still open.
    pub fn is_gated(&self) -> bool {
        self.dependency().map(|d| d.is_gating()).unwrap_or(false)
    }

    pub fn remaining_points(&self) -> u32 {
        self.weight.saturating_sub(self.progress)
    }

    pub fn is_archived(&self) -> bool {
        self.status == CardStatus::Done
    }
}
