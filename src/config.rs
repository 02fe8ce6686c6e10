//! Simulation configuration.
//!
//! Configuration is read from TOML (by default `~/.tandem/tandem.toml`) and
//! validated once at load time. Every problem found here is fatal: a run
//! never starts with a configuration that fails [`SimConfig::validate`].

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::core::{
    CapacityLimits, CardStatus, DependencyType, Priority, Seniority, TeamId, WorkerRole,
};
use crate::orchestration::budget::StepName;
use crate::orchestration::disturbance::{DisturbanceKind, DisturbanceSpec};
use crate::{tlog_debug, Error, Result};

/// Tolerance used when checking that step weights sum to 1.0.
pub const WEIGHT_TOLERANCE: f64 = 1e-6;

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9_-]*$").expect("static pattern"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub cycles: u32,
    /// Seed for every random decision in the run. Random if unset.
    pub seed: Option<u64>,
    /// Story points a pair completes per cycle.
    pub points_per_pair: u32,
    /// Extra points when the navigator is a senior.
    pub senior_bonus: u32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            cycles: 3,
            seed: None,
            points_per_pair: 3,
            senior_bonus: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    /// Probability that a tester joins the candidate pool in a cycle.
    pub tester_injection_rate: f64,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            tester_injection_rate: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisturbanceConfig {
    pub max_velocity_impact: f64,
    pub max_quality_regression: f64,
    /// Length of the measurement window in cycles; 0 means the whole run.
    pub window_cycles: u32,
    pub kinds: Vec<DisturbanceSpec>,
}

impl Default for DisturbanceConfig {
    fn default() -> Self {
        Self {
            max_velocity_impact: 0.3,
            max_quality_regression: 0.2,
            window_cycles: 0,
            kinds: DisturbanceKind::ALL
                .into_iter()
                .map(DisturbanceSpec::default_for)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub max_borrows_per_cycle: usize,
    /// Cycles a borrowed worker stays with the destination team.
    pub borrow_duration: u32,
    /// A borrow may not leave the source team with fewer workers.
    pub min_roster_size: usize,
    /// Blocked cards at which the heuristic advisor calls a team struggling.
    pub struggling_blocked_threshold: usize,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            max_borrows_per_cycle: 2,
            borrow_duration: 1,
            min_roster_size: 2,
            struggling_blocked_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub total_seconds: f64,
    pub iteration_zero_share: f64,
    /// Weight per step name; must cover every step and sum to 1.0.
    pub step_weights: BTreeMap<String, f64>,
    pub min_step_timeout_seconds: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            total_seconds: 2160.0,
            iteration_zero_share: 0.40,
            step_weights: BTreeMap::from([
                (StepName::Coordination.as_str().to_string(), 0.50),
                (StepName::Distribution.as_str().to_string(), 0.30),
                (StepName::Checkin.as_str().to_string(), 0.20),
            ]),
            min_step_timeout_seconds: 5.0,
        }
    }
}

impl BudgetConfig {
    /// Step weights keyed by step. Only meaningful after validation.
    pub fn weights(&self) -> BTreeMap<StepName, f64> {
        self.step_weights
            .iter()
            .filter_map(|(name, weight)| name.parse::<StepName>().ok().map(|s| (s, *weight)))
            .collect()
    }
}

/// Which decision-making collaborator drives coordination.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdvisorConfig {
    /// Deterministic, in-process rules.
    #[default]
    Heuristic,
    /// External program speaking JSON on stdin/stdout.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

/// Team topology. Reporting only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    #[default]
    StreamAligned,
    Platform,
    Enabling,
    ComplicatedSubsystem,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub id: String,
    #[serde(default)]
    pub role: WorkerRole,
    #[serde(default)]
    pub seniority: Seniority,
    #[serde(default)]
    pub specializations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyConfig {
    pub team: String,
    #[serde(rename = "type")]
    pub dependency_type: DependencyType,
    /// Title of the card on `team` whose completion resolves the dependency.
    #[serde(default)]
    pub provider: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardConfig {
    pub title: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub depends_on: Option<DependencyConfig>,
}

fn default_weight() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamConfig {
    pub id: String,
    #[serde(default)]
    pub topology: Topology,
    /// Overrides the global capacity limits for this team.
    #[serde(default)]
    pub capacity: Option<CapacityLimits>,
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
    #[serde(default)]
    pub backlog: Vec<CardConfig>,
}

impl TeamConfig {
    pub fn team_id(&self) -> TeamId {
        TeamId::from(self.id.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub simulation: SimulationConfig,
    pub capacity: CapacityLimits,
    pub pairing: PairingConfig,
    pub disturbances: DisturbanceConfig,
    pub coordination: CoordinationConfig,
    pub budget: BudgetConfig,
    pub advisor: AdvisorConfig,
    pub teams: Vec<TeamConfig>,
}

impl SimConfig {
    pub fn tandem_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".tandem"))
    }

    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::tandem_dir()?.join("tandem.toml"))
    }

    /// Parse and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        tlog_debug!("SimConfig::load path={}", path.display());
        let config = Self::from_toml(&fs::read_to_string(path)?)?;
        tlog_debug!(
            "Config loaded: teams={}, cycles={}, advisor={:?}",
            config.teams.len(),
            config.simulation.cycles,
            config.advisor
        );
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        tlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    /// Capacity limits for a team, honoring its override.
    pub fn capacity_for(&self, team: &TeamConfig) -> CapacityLimits {
        team.capacity.clone().unwrap_or_else(|| self.capacity.clone())
    }

    /// Check the whole configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        self.validate_simulation()?;
        self.validate_capacity(&self.capacity, "capacity")?;
        unit_interval("pairing.tester_injection_rate", self.pairing.tester_injection_rate)?;
        self.validate_disturbances()?;
        self.validate_coordination()?;
        self.validate_budget()?;
        self.validate_advisor()?;
        self.validate_teams()
    }

    fn validate_simulation(&self) -> Result<()> {
        if self.simulation.cycles == 0 {
            return Err(config_err("simulation.cycles must be at least 1"));
        }
        if self.simulation.points_per_pair == 0 {
            return Err(config_err("simulation.points_per_pair must be at least 1"));
        }
        Ok(())
    }

    fn validate_capacity(&self, limits: &CapacityLimits, scope: &str) -> Result<()> {
        for (status, _) in limits.iter() {
            if status.bypasses_capacity() {
                return Err(config_err(&format!(
                    "{}: {} cannot have a capacity limit",
                    scope, status
                )));
            }
        }
        Ok(())
    }

    fn validate_disturbances(&self) -> Result<()> {
        let d = &self.disturbances;
        non_negative("disturbances.max_velocity_impact", d.max_velocity_impact)?;
        non_negative("disturbances.max_quality_regression", d.max_quality_regression)?;

        let mut seen = HashSet::new();
        for spec in &d.kinds {
            if !seen.insert(spec.kind) {
                return Err(config_err(&format!(
                    "disturbance {} is configured twice",
                    spec.kind
                )));
            }
            unit_interval(&format!("disturbances.{}.probability", spec.kind), spec.probability)?;
            non_negative(
                &format!("disturbances.{}.velocity_impact", spec.kind),
                spec.velocity_impact,
            )?;
            non_negative(
                &format!("disturbances.{}.quality_impact", spec.kind),
                spec.quality_impact,
            )?;
        }
        Ok(())
    }

    fn validate_coordination(&self) -> Result<()> {
        if self.coordination.borrow_duration == 0 {
            return Err(config_err("coordination.borrow_duration must be at least 1 cycle"));
        }
        Ok(())
    }

    fn validate_budget(&self) -> Result<()> {
        let b = &self.budget;
        if !(b.total_seconds > 0.0) || !b.total_seconds.is_finite() {
            return Err(config_err("budget.total_seconds must be positive"));
        }
        if !(0.0..1.0).contains(&b.iteration_zero_share) {
            return Err(config_err("budget.iteration_zero_share must be in [0, 1)"));
        }
        non_negative("budget.min_step_timeout_seconds", b.min_step_timeout_seconds)?;

        let mut sum = 0.0;
        for (name, weight) in &b.step_weights {
            name.parse::<StepName>().map_err(|e| config_err(&e))?;
            non_negative(&format!("budget.step_weights.{}", name), *weight)?;
            sum += weight;
        }
        for step in StepName::ALL {
            if !b.step_weights.contains_key(step.as_str()) {
                return Err(config_err(&format!("budget.step_weights is missing '{}'", step)));
            }
        }
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(config_err(&format!(
                "budget.step_weights must sum to 1.0, got {}",
                sum
            )));
        }
        Ok(())
    }

    fn validate_advisor(&self) -> Result<()> {
        if let AdvisorConfig::Command { program, .. } = &self.advisor {
            if program.trim().is_empty() {
                return Err(config_err("advisor.program must not be empty"));
            }
        }
        Ok(())
    }

    fn validate_teams(&self) -> Result<()> {
        if self.teams.is_empty() {
            return Err(config_err("at least one team is required"));
        }

        let mut teams = HashSet::new();
        let mut worker_homes: HashMap<&str, &str> = HashMap::new();
        for team in &self.teams {
            check_id("team", &team.id)?;
            if !teams.insert(team.id.as_str()) {
                return Err(config_err(&format!("team '{}' is defined twice", team.id)));
            }
            if let Some(limits) = &team.capacity {
                self.validate_capacity(limits, &format!("teams.{}.capacity", team.id))?;
            }
            for worker in &team.workers {
                check_id("worker", &worker.id)?;
                if let Some(other) = worker_homes.insert(&worker.id, &team.id) {
                    return Err(config_err(&format!(
                        "worker '{}' is assigned to both '{}' and '{}'",
                        worker.id, other, team.id
                    )));
                }
            }
        }

        let titles: HashMap<&str, HashSet<&str>> = self
            .teams
            .iter()
            .map(|t| (t.id.as_str(), t.backlog.iter().map(|c| c.title.as_str()).collect()))
            .collect();

        for team in &self.teams {
            for card in &team.backlog {
                if card.weight == 0 {
                    return Err(config_err(&format!(
                        "card '{}' on team '{}' has zero weight",
                        card.title, team.id
                    )));
                }
                let Some(dep) = &card.depends_on else {
                    continue;
                };
                if dep.team == team.id {
                    return Err(config_err(&format!(
                        "card '{}' on team '{}' depends on its own team",
                        card.title, team.id
                    )));
                }
                let Some(provider_titles) = titles.get(dep.team.as_str()) else {
                    return Err(config_err(&format!(
                        "card '{}' depends on unknown team '{}'",
                        card.title, dep.team
                    )));
                };
                if let Some(provider) = &dep.provider {
                    if !provider_titles.contains(provider.as_str()) {
                        return Err(config_err(&format!(
                            "card '{}' names provider '{}' which is not on team '{}'",
                            card.title, provider, dep.team
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// A small three-team organization, written by `tandem init`.
    pub fn sample() -> Self {
        fn worker(id: &str, role: WorkerRole, seniority: Seniority) -> WorkerConfig {
            WorkerConfig {
                id: id.to_string(),
                role,
                seniority,
                specializations: Vec::new(),
            }
        }
        fn card(title: &str, weight: u32) -> CardConfig {
            CardConfig {
                title: title.to_string(),
                weight,
                priority: Priority::Normal,
                depends_on: None,
            }
        }

        let mut checkout = TeamConfig {
            id: "checkout".to_string(),
            topology: Topology::StreamAligned,
            capacity: None,
            workers: vec![
                worker("ada", WorkerRole::Lead, Seniority::Senior),
                worker("brook", WorkerRole::Engineer, Seniority::Junior),
                worker("cyd", WorkerRole::Engineer, Seniority::Mid),
                worker("dana", WorkerRole::Tester, Seniority::Mid),
            ],
            backlog: vec![card("Cart totals", 3), card("Coupon codes", 5), card("Receipt email", 2)],
        };
        let mut payment_ui = card("Card payment form", 3);
        payment_ui.depends_on = Some(DependencyConfig {
            team: "platform".to_string(),
            dependency_type: DependencyType::NeedsApi,
            provider: Some("Payments API".to_string()),
        });
        checkout.backlog.push(payment_ui);

        let platform = TeamConfig {
            id: "platform".to_string(),
            topology: Topology::Platform,
            capacity: None,
            workers: vec![
                worker("emil", WorkerRole::Engineer, Seniority::Senior),
                worker("fay", WorkerRole::Engineer, Seniority::Mid),
                worker("gus", WorkerRole::Engineer, Seniority::Junior),
            ],
            backlog: vec![card("Payments API", 5), card("Rate limiter", 3)],
        };

        let search = TeamConfig {
            id: "search".to_string(),
            topology: Topology::ComplicatedSubsystem,
            capacity: None,
            workers: vec![
                worker("hana", WorkerRole::Lead, Seniority::Senior),
                worker("ivo", WorkerRole::Engineer, Seniority::Mid),
                worker("jun", WorkerRole::Engineer, Seniority::Mid),
                worker("kai", WorkerRole::Tester, Seniority::Junior),
            ],
            backlog: vec![card("Fuzzy matching", 5), card("Facet counts", 3), card("Index warmup", 2)],
        };

        Self {
            simulation: SimulationConfig {
                seed: Some(7),
                ..Default::default()
            },
            teams: vec![checkout, platform, search],
            ..Default::default()
        }
    }
}

fn config_err(msg: &str) -> Error {
    Error::Config(msg.to_string())
}

fn unit_interval(name: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(config_err(&format!("{} must be within [0, 1], got {}", name, value)))
    }
}

fn non_negative(name: &str, value: f64) -> Result<()> {
    if value >= 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(config_err(&format!("{} must be non-negative, got {}", name, value)))
    }
}

fn check_id(kind: &str, id: &str) -> Result<()> {
    if id_pattern().is_match(id) {
        Ok(())
    } else {
        Err(config_err(&format!(
            "{} id '{}' must match {}",
            kind,
            id,
            id_pattern().as_str()
        )))
    }
}
