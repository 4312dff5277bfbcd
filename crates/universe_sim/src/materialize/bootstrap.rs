//! Bootstrap pseudo-events: the universe seed expanded into privileged
//! system-authored events so the materializer can create foundational rows
//! (actors, spaces, memberships) through the same pipeline as everything else.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;

use crate::catalog::BootstrapSpec;
use crate::sim::CanonicalEvent;
use crate::universe::UniverseState;

pub const SYSTEM_ACTOR: &str = "system";

pub const BOOTSTRAP_ACTION_PREFIX: &str = "bootstrap_";
pub const BOOTSTRAP_CREATE_USER: &str = "bootstrap_create_user";
pub const BOOTSTRAP_CREATE_SPACE: &str = "bootstrap_create_space";
pub const BOOTSTRAP_CREATE_MEMBERSHIP: &str = "bootstrap_create_membership";

pub const BOOTSTRAP_USER_ID_PREFIX: &str = "bootstrap_user_";
pub const BOOTSTRAP_SPACE_ID_PREFIX: &str = "bootstrap_space_";
const BOOTSTRAP_MEMBERSHIP_ID_PREFIX: &str = "bootstrap_membership_";

const DEFAULT_AGENT_COLUMN: &str = "user_id";
const DEFAULT_SPACE_COLUMN: &str = "space_id";

/// True for privileged seed events routed to the bootstrap tables.
pub fn is_bootstrap_event(event: &CanonicalEvent) -> bool {
    event.actor_id == SYSTEM_ACTOR && event.action.starts_with(BOOTSTRAP_ACTION_PREFIX)
}

/// Expands the seed into ordered bootstrap events: all actors, then all
/// spaces, then all memberships, so foreign keys resolve in one pass. Every
/// event is stamped at `at` and visible to the whole roster.
pub fn bootstrap_events(
    universe: &UniverseState,
    bootstrap: &BootstrapSpec,
    at: DateTime<Utc>,
) -> Vec<CanonicalEvent> {
    let visibility: BTreeSet<String> = universe
        .agents
        .iter()
        .map(|agent| agent.id.clone())
        .chain(std::iter::once(SYSTEM_ACTOR.to_string()))
        .collect();

    let mut events = Vec::new();

    for agent in &universe.agents {
        let mut metadata = Map::new();
        metadata.insert("id".to_string(), Value::String(agent.id.clone()));
        metadata.insert("name".to_string(), Value::String(agent.name.clone()));
        metadata.insert("email".to_string(), Value::String(synthesize_email(&agent.id)));
        metadata.insert("type".to_string(), Value::String("user".to_string()));
        metadata.insert("metadata".to_string(), json!({ "persona": agent.persona }));
        events.push(system_event(
            format!("{BOOTSTRAP_USER_ID_PREFIX}{}", agent.id),
            BOOTSTRAP_CREATE_USER,
            at,
            metadata,
            &visibility,
        ));
    }

    for space in &universe.initial_spaces {
        let mut metadata = Map::new();
        metadata.insert("id".to_string(), Value::String(space.id.clone()));
        metadata.insert(
            "name".to_string(),
            Value::String(space.display_name().to_string()),
        );
        metadata.insert("type".to_string(), Value::String(space.type_name.clone()));
        metadata.insert("metadata".to_string(), Value::Object(space.data.clone()));
        events.push(system_event(
            format!("{BOOTSTRAP_SPACE_ID_PREFIX}{}", space.id),
            BOOTSTRAP_CREATE_SPACE,
            at,
            metadata,
            &visibility,
        ));
    }

    let (agent_column, space_column) = match &bootstrap.memberships {
        Some(spec) => (spec.agent_column.clone(), spec.space_column.clone()),
        None => (
            DEFAULT_AGENT_COLUMN.to_string(),
            DEFAULT_SPACE_COLUMN.to_string(),
        ),
    };
    for membership in &universe.memberships {
        let mut metadata = Map::new();
        metadata.insert(
            agent_column.clone(),
            Value::String(membership.agent_id.clone()),
        );
        metadata.insert(
            space_column.clone(),
            Value::String(membership.space_id.clone()),
        );
        events.push(system_event(
            format!(
                "{BOOTSTRAP_MEMBERSHIP_ID_PREFIX}{}_{}",
                membership.agent_id, membership.space_id
            ),
            BOOTSTRAP_CREATE_MEMBERSHIP,
            at,
            metadata,
            &visibility,
        ));
    }

    events
}

/// Deterministic placeholder address for actor rows whose table wants one.
fn synthesize_email(agent_id: &str) -> String {
    let local: String = agent_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '.'
            }
        })
        .collect();
    format!("{local}@example.com")
}

fn system_event(
    id: String,
    action: &str,
    at: DateTime<Utc>,
    metadata: Map<String, Value>,
    visibility: &BTreeSet<String>,
) -> CanonicalEvent {
    CanonicalEvent {
        id,
        timestamp: at,
        action: action.to_string(),
        actor_id: SYSTEM_ACTOR.to_string(),
        context_id: None,
        recipients: None,
        parent_id: None,
        content: None,
        metadata,
        visibility: visibility.clone(),
    }
}
