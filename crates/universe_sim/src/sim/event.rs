//! Canonical events and the append-only event log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::universe::{AgentId, SpaceId};

pub type EventId = String;

/// A single simulated action, service-agnostic. Created once by the turn
/// scheduler and never mutated afterward; visibility is computed at creation
/// from the registry state current at that moment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalEvent {
    pub id: EventId,
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub actor_id: AgentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<SpaceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipients: Option<BTreeSet<AgentId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub visibility: BTreeSet<AgentId>,
}

impl CanonicalEvent {
    pub fn is_visible_to(&self, agent_id: &str) -> bool {
        self.visibility.contains(agent_id)
    }

    /// The fields visibility computation depends on. Lets the engine run on
    /// drafts before an id or timestamp exists.
    pub fn view(&self) -> EventView<'_> {
        EventView {
            action: &self.action,
            actor_id: &self.actor_id,
            context_id: self.context_id.as_deref(),
            recipients: self.recipients.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EventView<'a> {
    pub action: &'a str,
    pub actor_id: &'a str,
    pub context_id: Option<&'a str>,
    pub recipients: Option<&'a BTreeSet<AgentId>>,
}

/// Append-only ordered sequence of finalized events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventLog {
    events: Vec<CanonicalEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, event: CanonicalEvent) -> &CanonicalEvent {
        self.events.push(event);
        let index = self.events.len() - 1;
        &self.events[index]
    }

    pub fn get(&self, event_id: &str) -> Option<&CanonicalEvent> {
        self.events.iter().find(|event| event.id == event_id)
    }

    pub fn last(&self) -> Option<&CanonicalEvent> {
        self.events.last()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CanonicalEvent> {
        self.events.iter()
    }

    pub fn events(&self) -> &[CanonicalEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<CanonicalEvent> {
        self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_event() -> CanonicalEvent {
        let mut metadata = serde_json::Map::new();
        metadata.insert(
            "message".to_string(),
            serde_json::Value::String("standup at ten".to_string()),
        );
        CanonicalEvent {
            id: "evt_1700000000000_ab12cd34e".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 4, 10, 30, 0).unwrap(),
            action: "post_message".to_string(),
            actor_id: "a-maya".to_string(),
            context_id: Some("s-general".to_string()),
            recipients: None,
            parent_id: Some("evt_1699999990000_ffffeeee0".to_string()),
            content: Some("standup at ten".to_string()),
            metadata,
            visibility: ["a-maya".to_string(), "a-ravi".to_string()]
                .into_iter()
                .collect(),
        }
    }

    #[test]
    fn serde_round_trip_reproduces_event() {
        let event = sample_event();
        let json = serde_json::to_string_pretty(&event).unwrap();
        let back: CanonicalEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
    }

    #[test]
    fn wire_format_uses_camel_case_and_iso_timestamps() {
        let event = sample_event();
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["actorId"], "a-maya");
        assert_eq!(value["contextId"], "s-general");
        let timestamp = value["timestamp"].as_str().unwrap();
        assert!(timestamp.starts_with("2024-03-04T10:30:00"));
    }

    #[test]
    fn log_append_and_lookup() {
        let mut log = EventLog::new();
        assert!(log.is_empty());
        let appended_id = log.append(sample_event()).id.clone();
        assert_eq!(log.len(), 1);
        assert_eq!(log.get(&appended_id).unwrap().actor_id, "a-maya");
        assert!(log.get("evt_missing").is_none());
        assert_eq!(log.last().unwrap().id, appended_id);
    }
}
