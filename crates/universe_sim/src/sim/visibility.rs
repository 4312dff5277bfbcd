//! Visibility engine: decides which agents observe an event.
//!
//! Resolution is structural, not stringly: the catalog's visibility method is
//! matched as a closed sum. Events whose action has no method, or an
//! `Unresolved` one, go through a deterministic fallback chain (context
//! membership, then explicit recipients, then system broadcast, then actor
//! only) so a sparse catalog degrades predictably instead of panicking.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::catalog::{ActionCatalog, VisibilityComputation};
use crate::universe::{AgentId, AgentSeed, MembershipRegistry};

use super::event::EventView;

/// True when `agent_id` can observe the event described by `view`.
///
/// The actor always observes their own event. Membership checks read the
/// registry as it stands right now; finalized events snapshot the result.
pub fn can_observe(
    agent_id: &str,
    view: EventView<'_>,
    catalog: &ActionCatalog,
    registry: &MembershipRegistry,
) -> bool {
    if agent_id == view.actor_id {
        return true;
    }
    let spec = catalog.action(view.action);
    match spec.and_then(|spec| spec.visibility.as_ref()) {
        Some(VisibilityComputation::SpaceMembers { .. }) => match view.context_id {
            Some(context_id) => registry.is_member(context_id, agent_id),
            None => false,
        },
        Some(VisibilityComputation::ExplicitRecipients { .. }) => view
            .recipients
            .map(|recipients| recipients.contains(agent_id))
            .unwrap_or(false),
        Some(VisibilityComputation::Everyone) => true,
        Some(VisibilityComputation::Unresolved { .. }) | None => {
            let is_system = spec.map(|spec| spec.is_system()).unwrap_or(false);
            fallback_observe(agent_id, view, is_system, registry)
        }
    }
}

fn fallback_observe(
    agent_id: &str,
    view: EventView<'_>,
    is_system: bool,
    registry: &MembershipRegistry,
) -> bool {
    if let Some(context_id) = view.context_id {
        return registry.is_member(context_id, agent_id);
    }
    if let Some(recipients) = view.recipients {
        return recipients.contains(agent_id);
    }
    is_system
}

/// Diagnostics surfaced while computing an event's observer set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum VisibilityNote {
    /// A `space_members` event referenced a space the registry has never seen.
    UnknownSpace { space_id: String },
    /// An `explicit_recipients` event carried no recipient set.
    MissingRecipients { action: String },
    /// No rule matched; the event collapsed to actor-only visibility.
    ActorOnlyFallback { action: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VisibilityOutcome {
    pub observers: BTreeSet<AgentId>,
    pub notes: Vec<VisibilityNote>,
}

/// Computes the full observer set for an event over the current roster.
///
/// The actor is always included, even when (like the system actor) they are
/// not part of the roster.
pub fn compute_visibility(
    view: EventView<'_>,
    roster: &[AgentSeed],
    catalog: &ActionCatalog,
    registry: &MembershipRegistry,
) -> VisibilityOutcome {
    let mut outcome = VisibilityOutcome::default();
    outcome.observers.insert(view.actor_id.to_string());
    for agent in roster {
        if can_observe(&agent.id, view, catalog, registry) {
            outcome.observers.insert(agent.id.clone());
        }
    }

    let spec = catalog.action(view.action);
    match spec.and_then(|spec| spec.visibility.as_ref()) {
        Some(VisibilityComputation::SpaceMembers { .. }) => {
            if let Some(context_id) = view.context_id {
                if registry.members(context_id).is_none() {
                    outcome.notes.push(VisibilityNote::UnknownSpace {
                        space_id: context_id.to_string(),
                    });
                }
            }
        }
        Some(VisibilityComputation::ExplicitRecipients { .. }) => {
            let missing = view
                .recipients
                .map(|recipients| recipients.is_empty())
                .unwrap_or(true);
            if missing {
                outcome.notes.push(VisibilityNote::MissingRecipients {
                    action: view.action.to_string(),
                });
            }
        }
        Some(VisibilityComputation::Everyone) => {}
        Some(VisibilityComputation::Unresolved { .. }) | None => {
            let is_system = spec.map(|spec| spec.is_system()).unwrap_or(false);
            if view.context_id.is_none() && view.recipients.is_none() && !is_system {
                outcome.notes.push(VisibilityNote::ActorOnlyFallback {
                    action: view.action.to_string(),
                });
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ActionSpec;
    use crate::universe::UniverseState;

    fn catalog_json() -> &'static str {
        r#"{
            "actions": [
                {
                    "name": "post_message",
                    "description": "Post a message to a space",
                    "visibilityComputation": { "method": "space_members" }
                },
                {
                    "name": "send_dm",
                    "description": "Send a direct message",
                    "visibilityComputation": { "method": "explicit_recipients" }
                },
                {
                    "name": "announce",
                    "description": "Broadcast to all agents",
                    "visibilityComputation": { "method": "everyone" }
                },
                {
                    "name": "adjust_profile",
                    "description": "Edit own profile",
                    "visibilityComputation": { "method": "custom", "description": "depends on viewer settings" }
                },
                {
                    "name": "log_note",
                    "description": "Write a private note"
                },
                {
                    "name": "announce_system",
                    "description": "System broadcast",
                    "actionType": "system"
                }
            ],
            "spaceTypes": []
        }"#
    }

    fn fixture() -> (ActionCatalog, MembershipRegistry, Vec<AgentSeed>) {
        let catalog = ActionCatalog::from_json(catalog_json()).unwrap();
        let universe = UniverseState::from_json(
            r#"{
                "agents": [
                    { "id": "a-maya", "name": "Maya", "activityLevel": 0.9, "systemPrompt": "pm" },
                    { "id": "a-ravi", "name": "Ravi", "activityLevel": 0.5, "systemPrompt": "eng" },
                    { "id": "a-lena", "name": "Lena", "activityLevel": 0.2, "systemPrompt": "designer" }
                ],
                "initialSpaces": [
                    { "id": "s-general", "type": "Channel", "data": { "name": "general" } }
                ],
                "memberships": [
                    { "agentId": "a-maya", "spaceId": "s-general" },
                    { "agentId": "a-ravi", "spaceId": "s-general" }
                ]
            }"#,
        )
        .unwrap();
        let registry = MembershipRegistry::seed_from(&universe);
        (catalog, registry, universe.agents)
    }

    fn view<'a>(
        action: &'a str,
        actor: &'a str,
        context: Option<&'a str>,
        recipients: Option<&'a BTreeSet<AgentId>>,
    ) -> EventView<'a> {
        EventView {
            action,
            actor_id: actor,
            context_id: context,
            recipients,
        }
    }

    #[test]
    fn actor_always_observes() {
        let (catalog, registry, _) = fixture();
        let view = view("send_dm", "a-maya", None, None);
        assert!(can_observe("a-maya", view, &catalog, &registry));
        assert!(!can_observe("a-ravi", view, &catalog, &registry));
    }

    #[test]
    fn space_members_follow_registry() {
        let (catalog, registry, roster) = fixture();
        let view = view("post_message", "a-maya", Some("s-general"), None);
        assert!(can_observe("a-ravi", view, &catalog, &registry));
        assert!(!can_observe("a-lena", view, &catalog, &registry));

        let outcome = compute_visibility(view, &roster, &catalog, &registry);
        let expected: BTreeSet<String> =
            ["a-maya".to_string(), "a-ravi".to_string()].into_iter().collect();
        assert_eq!(outcome.observers, expected);
        assert!(outcome.notes.is_empty());
    }

    #[test]
    fn space_members_without_context_excludes_everyone_else() {
        let (catalog, registry, _) = fixture();
        let view = view("post_message", "a-maya", None, None);
        assert!(!can_observe("a-ravi", view, &catalog, &registry));
    }

    #[test]
    fn unknown_space_noted() {
        let (catalog, registry, roster) = fixture();
        let view = view("post_message", "a-maya", Some("s-ghost"), None);
        let outcome = compute_visibility(view, &roster, &catalog, &registry);
        assert_eq!(
            outcome.notes,
            vec![VisibilityNote::UnknownSpace {
                space_id: "s-ghost".to_string()
            }]
        );
        assert_eq!(outcome.observers.len(), 1);
    }

    #[test]
    fn explicit_recipients_exact_set() {
        let (catalog, registry, roster) = fixture();
        let recipients: BTreeSet<String> = ["a-lena".to_string()].into_iter().collect();
        let view = view("send_dm", "a-maya", None, Some(&recipients));
        assert!(can_observe("a-lena", view, &catalog, &registry));
        assert!(!can_observe("a-ravi", view, &catalog, &registry));

        let outcome = compute_visibility(view, &roster, &catalog, &registry);
        let expected: BTreeSet<String> =
            ["a-lena".to_string(), "a-maya".to_string()].into_iter().collect();
        assert_eq!(outcome.observers, expected);
    }

    #[test]
    fn missing_recipients_noted() {
        let (catalog, registry, roster) = fixture();
        let view = view("send_dm", "a-maya", None, None);
        let outcome = compute_visibility(view, &roster, &catalog, &registry);
        assert_eq!(
            outcome.notes,
            vec![VisibilityNote::MissingRecipients {
                action: "send_dm".to_string()
            }]
        );
    }

    #[test]
    fn everyone_reaches_full_roster() {
        let (catalog, registry, roster) = fixture();
        let view = view("announce", "a-maya", None, None);
        let outcome = compute_visibility(view, &roster, &catalog, &registry);
        assert_eq!(outcome.observers.len(), roster.len());
    }

    #[test]
    fn unresolved_method_uses_fallback_chain() {
        let (catalog, registry, _) = fixture();
        // Context present: membership decides.
        let contextual = view("adjust_profile", "a-maya", Some("s-general"), None);
        assert!(can_observe("a-ravi", contextual, &catalog, &registry));
        assert!(!can_observe("a-lena", contextual, &catalog, &registry));
        // Nothing to go on: actor only.
        let bare = view("adjust_profile", "a-maya", None, None);
        assert!(!can_observe("a-ravi", bare, &catalog, &registry));
    }

    #[test]
    fn actor_only_fallback_noted() {
        let (catalog, registry, roster) = fixture();
        let bare = view("log_note", "a-maya", None, None);
        let outcome = compute_visibility(bare, &roster, &catalog, &registry);
        assert_eq!(outcome.observers.len(), 1);
        assert_eq!(
            outcome.notes,
            vec![VisibilityNote::ActorOnlyFallback {
                action: "log_note".to_string()
            }]
        );
    }

    #[test]
    fn system_actions_without_method_broadcast() {
        let (catalog, registry, roster) = fixture();
        let view = view("announce_system", "system", None, None);
        assert!(can_observe("a-lena", view, &catalog, &registry));
        let outcome = compute_visibility(view, &roster, &catalog, &registry);
        assert_eq!(outcome.observers.len(), roster.len() + 1);
        assert!(outcome.notes.is_empty());
    }

    #[test]
    fn unknown_action_still_resolves_by_context() {
        let (catalog, registry, _) = fixture();
        let view = view("unlisted_action", "a-maya", Some("s-general"), None);
        assert!(can_observe("a-ravi", view, &catalog, &registry));
    }

    #[test]
    fn unresolved_round_trips_as_custom() {
        let (catalog, _, _) = fixture();
        let spec: &ActionSpec = catalog.action("adjust_profile").unwrap();
        let json = serde_json::to_value(spec).unwrap();
        assert_eq!(json["visibilityComputation"]["method"], "custom");
    }
}
