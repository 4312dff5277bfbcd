//! Universe seed state (agents, spaces, memberships) and the mutable
//! membership registry consumed by the visibility engine.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::Path;

pub type AgentId = String;
pub type SpaceId = String;

/// One simulated participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSeed {
    pub id: AgentId,
    pub name: String,
    /// Relative likelihood of being picked each turn, in [0, 1].
    pub activity_level: f64,
    /// Behavioral persona text handed to the oracle as the system prompt.
    #[serde(rename = "systemPrompt")]
    pub persona: String,
}

/// An organizational container (channel, room, thread) with a type and a
/// free-form data bag carrying at minimum a display name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceSeed {
    pub id: SpaceId,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl SpaceSeed {
    pub fn display_name(&self) -> &str {
        self.data
            .get("name")
            .and_then(|value| value.as_str())
            .unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub agent_id: AgentId,
    pub space_id: SpaceId,
}

/// The complete seeded universe. Side effects extend `initial_spaces` and
/// `memberships` during simulation so the persisted state reflects spaces
/// created mid-run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UniverseState {
    pub agents: Vec<AgentSeed>,
    #[serde(default)]
    pub initial_spaces: Vec<SpaceSeed>,
    #[serde(default)]
    pub memberships: Vec<Membership>,
}

impl UniverseState {
    pub fn from_json(input: &str) -> Result<Self, UniverseError> {
        Ok(serde_json::from_str(input)?)
    }

    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, UniverseError> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).map_err(|err| UniverseError::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        Self::from_json(&data)
    }

    pub fn agent(&self, id: &str) -> Option<&AgentSeed> {
        self.agents.iter().find(|agent| agent.id == id)
    }

    pub fn space(&self, id: &str) -> Option<&SpaceSeed> {
        self.initial_spaces.iter().find(|space| space.id == id)
    }

    pub fn display_name_of<'a>(&'a self, agent_id: &'a str) -> &'a str {
        self.agent(agent_id)
            .map(|agent| agent.name.as_str())
            .unwrap_or(agent_id)
    }

    /// Fatal and non-fatal seed checks, run once before the first turn.
    ///
    /// An empty roster is fatal. Spaces nobody belongs to and agents who
    /// belong nowhere are reported but allowed.
    pub fn validate(&self) -> Result<Vec<SeedIssue>, UniverseError> {
        if self.agents.is_empty() {
            return Err(UniverseError::EmptyRoster);
        }

        let mut issues = Vec::new();
        for space in &self.initial_spaces {
            let populated = self
                .memberships
                .iter()
                .any(|membership| membership.space_id == space.id);
            if !populated {
                issues.push(SeedIssue::SpaceWithoutMembers {
                    space_id: space.id.clone(),
                });
            }
        }
        for agent in &self.agents {
            let placed = self
                .memberships
                .iter()
                .any(|membership| membership.agent_id == agent.id);
            if !placed {
                issues.push(SeedIssue::AgentWithoutSpaces {
                    agent_id: agent.id.clone(),
                });
            }
        }
        for membership in &self.memberships {
            if self.agent(&membership.agent_id).is_none() {
                issues.push(SeedIssue::MembershipUnknownAgent {
                    agent_id: membership.agent_id.clone(),
                    space_id: membership.space_id.clone(),
                });
            }
            if self.space(&membership.space_id).is_none() {
                issues.push(SeedIssue::MembershipUnknownSpace {
                    agent_id: membership.agent_id.clone(),
                    space_id: membership.space_id.clone(),
                });
            }
        }
        Ok(issues)
    }
}

/// A non-fatal finding from seed validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SeedIssue {
    SpaceWithoutMembers { space_id: SpaceId },
    AgentWithoutSpaces { agent_id: AgentId },
    MembershipUnknownAgent { agent_id: AgentId, space_id: SpaceId },
    MembershipUnknownSpace { agent_id: AgentId, space_id: SpaceId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UniverseError {
    EmptyRoster,
    Io { path: String, message: String },
    Parse { message: String },
}

impl From<serde_json::Error> for UniverseError {
    fn from(err: serde_json::Error) -> Self {
        UniverseError::Parse {
            message: err.to_string(),
        }
    }
}

impl fmt::Display for UniverseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UniverseError::EmptyRoster => write!(f, "universe has no agents"),
            UniverseError::Io { path, message } => {
                write!(f, "read universe failed ({path}): {message}")
            }
            UniverseError::Parse { message } => write!(f, "parse universe failed: {message}"),
        }
    }
}

impl std::error::Error for UniverseError {}

/// Mutable map from space id to the set of member agent ids.
///
/// Seeded once from the universe's membership pairs, then mutated only by
/// side-effect handlers. Spaces appear here the first time someone joins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipRegistry {
    spaces: BTreeMap<SpaceId, BTreeSet<AgentId>>,
}

impl MembershipRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_from(universe: &UniverseState) -> Self {
        let mut registry = Self::new();
        for membership in &universe.memberships {
            registry.join(&membership.space_id, &membership.agent_id);
        }
        registry
    }

    /// Adds the pair; returns false if it was already present.
    pub fn join(&mut self, space_id: &str, agent_id: &str) -> bool {
        self.spaces
            .entry(space_id.to_string())
            .or_default()
            .insert(agent_id.to_string())
    }

    pub fn members(&self, space_id: &str) -> Option<&BTreeSet<AgentId>> {
        self.spaces.get(space_id)
    }

    pub fn is_member(&self, space_id: &str, agent_id: &str) -> bool {
        self.members(space_id)
            .map(|members| members.contains(agent_id))
            .unwrap_or(false)
    }

    /// Space ids the agent belongs to, in stable (sorted) order.
    pub fn spaces_of(&self, agent_id: &str) -> Vec<SpaceId> {
        self.spaces
            .iter()
            .filter(|(_, members)| members.contains(agent_id))
            .map(|(space_id, _)| space_id.clone())
            .collect()
    }

    pub fn member_count(&self, space_id: &str) -> usize {
        self.members(space_id).map(|members| members.len()).unwrap_or(0)
    }

    pub fn space_count(&self) -> usize {
        self.spaces.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_agent_universe() -> UniverseState {
        UniverseState {
            agents: vec![
                AgentSeed {
                    id: "a-maya".to_string(),
                    name: "Maya".to_string(),
                    activity_level: 0.9,
                    persona: "Maya, a product manager".to_string(),
                },
                AgentSeed {
                    id: "a-ravi".to_string(),
                    name: "Ravi".to_string(),
                    activity_level: 0.4,
                    persona: "Ravi, an engineer".to_string(),
                },
            ],
            initial_spaces: vec![SpaceSeed {
                id: "s-general".to_string(),
                type_name: "Channel".to_string(),
                data: serde_json::Map::new(),
            }],
            memberships: vec![Membership {
                agent_id: "a-maya".to_string(),
                space_id: "s-general".to_string(),
            }],
        }
    }

    #[test]
    fn parses_camel_case_seed() {
        let input = r#"{
            "agents": [{"id": "a-1", "name": "A", "activityLevel": 0.5, "systemPrompt": "persona"}],
            "initialSpaces": [{"id": "s-1", "type": "Channel", "data": {"name": "general"}}],
            "memberships": [{"agentId": "a-1", "spaceId": "s-1"}]
        }"#;
        let universe = UniverseState::from_json(input).unwrap();
        assert_eq!(universe.agents[0].persona, "persona");
        assert_eq!(universe.initial_spaces[0].display_name(), "general");
        assert_eq!(universe.memberships[0].agent_id, "a-1");
    }

    #[test]
    fn registry_join_is_idempotent() {
        let universe = two_agent_universe();
        let mut registry = MembershipRegistry::seed_from(&universe);
        assert!(registry.is_member("s-general", "a-maya"));
        assert!(!registry.is_member("s-general", "a-ravi"));

        assert!(registry.join("s-general", "a-ravi"));
        assert!(!registry.join("s-general", "a-ravi"));
        assert_eq!(registry.member_count("s-general"), 2);
    }

    #[test]
    fn spaces_of_reports_sorted_space_ids() {
        let mut registry = MembershipRegistry::new();
        registry.join("s-zeta", "a-1");
        registry.join("s-alpha", "a-1");
        registry.join("s-alpha", "a-2");
        assert_eq!(registry.spaces_of("a-1"), vec!["s-alpha", "s-zeta"]);
        assert_eq!(registry.spaces_of("a-2"), vec!["s-alpha"]);
    }

    #[test]
    fn validate_reports_unplaced_agents_and_empty_spaces() {
        let mut universe = two_agent_universe();
        universe.initial_spaces.push(SpaceSeed {
            id: "s-ghost".to_string(),
            type_name: "Channel".to_string(),
            data: serde_json::Map::new(),
        });
        let issues = universe.validate().unwrap();
        assert!(issues.contains(&SeedIssue::SpaceWithoutMembers {
            space_id: "s-ghost".to_string()
        }));
        assert!(issues.contains(&SeedIssue::AgentWithoutSpaces {
            agent_id: "a-ravi".to_string()
        }));
    }

    #[test]
    fn empty_roster_is_fatal() {
        let universe = UniverseState {
            agents: Vec::new(),
            initial_spaces: Vec::new(),
            memberships: Vec::new(),
        };
        assert_eq!(universe.validate().unwrap_err(), UniverseError::EmptyRoster);
    }
}
