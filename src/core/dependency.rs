//! Cross-team dependency detection.
//!
//! Dependencies are recorded on individual cards (see
//! [`crate::core::card::Dependency`]). Coordination needs the team-level
//! view: which teams wait on which, and whether any teams wait on each other
//! in a cycle. [`TeamDependencyGraph`] builds that view on a petgraph
//! `DiGraph` whose edges point from the waiting team to the team it waits on.

use crate::core::board::BoardSnapshot;
use crate::core::card::{CardId, DependencyStatus, DependencyType};
use crate::core::ids::TeamId;
use petgraph::algo::{is_cyclic_directed, tarjan_scc};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One card-level dependency between two teams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyFact {
    /// Team owning the dependent card.
    pub source_team: TeamId,
    /// Team the card depends on.
    pub target_team: TeamId,
    pub dependency_type: DependencyType,
    pub status: DependencyStatus,
    pub card: CardId,
    pub card_title: String,
}

impl DependencyFact {
    pub fn is_open(&self) -> bool {
        self.status == DependencyStatus::Open
    }
}

/// Scan board snapshots for dependency descriptors.
///
/// Archived cards are skipped; their dependencies no longer matter.
pub fn detect<'a, I>(snapshots: I) -> Vec<DependencyFact>
where
    I: IntoIterator<Item = &'a BoardSnapshot>,
{
    snapshots
        .into_iter()
        .flat_map(|snapshot| snapshot.all_cards())
        .filter(|card| !card.is_archived())
        .filter_map(|card| {
            let dependency = card.dependency()?;
            Some(DependencyFact {
                source_team: card.team_id.clone(),
                target_team: dependency.depends_on_team,
                dependency_type: dependency.dependency_type,
                status: dependency.dependency_status,
                card: card.id,
                card_title: card.title.clone(),
            })
        })
        .collect()
}

/// Team-level graph of open dependencies.
pub struct TeamDependencyGraph {
    graph: DiGraph<TeamId, DependencyType>,
    index: HashMap<TeamId, NodeIndex>,
}

impl TeamDependencyGraph {
    /// Build the graph from the open facts. Parallel edges are collapsed.
    pub fn from_facts(facts: &[DependencyFact]) -> Self {
        let mut graph = Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
        };
        for fact in facts.iter().filter(|f| f.is_open()) {
            let from = graph.node(&fact.source_team);
            let to = graph.node(&fact.target_team);
            if graph.graph.find_edge(from, to).is_none() {
                graph.graph.add_edge(from, to, fact.dependency_type);
            }
        }
        graph
    }

    fn node(&mut self, team: &TeamId) -> NodeIndex {
        if let Some(&index) = self.index.get(team) {
            return index;
        }
        let index = self.graph.add_node(team.clone());
        self.index.insert(team.clone(), index);
        index
    }

    pub fn team_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn has_cycle(&self) -> bool {
        is_cyclic_directed(&self.graph)
    }

    /// Groups of teams that transitively wait on each other.
    pub fn cycles(&self) -> Vec<Vec<TeamId>> {
        tarjan_scc(&self.graph)
            .into_iter()
            .filter(|component| {
                component.len() > 1
                    || component
                        .first()
                        .map(|&n| self.graph.find_edge(n, n).is_some())
                        .unwrap_or(false)
            })
            .map(|component| {
                let mut teams: Vec<TeamId> = component
                    .into_iter()
                    .filter_map(|n| self.graph.node_weight(n).cloned())
                    .collect();
                teams.sort();
                teams
            })
            .collect()
    }

    /// Teams that `team` is waiting on.
    pub fn waits_on(&self, team: &TeamId) -> Vec<TeamId> {
        self.neighbors(team, Direction::Outgoing)
    }

    /// Teams waiting on `team`.
    pub fn waited_on_by(&self, team: &TeamId) -> Vec<TeamId> {
        self.neighbors(team, Direction::Incoming)
    }

    fn neighbors(&self, team: &TeamId, direction: Direction) -> Vec<TeamId> {
        let Some(&index) = self.index.get(team) else {
            return Vec::new();
        };
        let mut teams: Vec<TeamId> = self
            .graph
            .neighbors_directed(index, direction)
            .filter_map(|n| self.graph.node_weight(n).cloned())
            .collect();
        teams.sort();
        teams
    }
}
