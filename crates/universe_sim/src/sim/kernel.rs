//! SimKernel: the turn state machine.
//!
//! Each turn picks an actor by activity weight, asks the oracle for an
//! action, validates the proposal against the catalog and the membership
//! registry, resolves context, parent and recipients, computes visibility,
//! and only then appends the event and applies side effects. A turn that
//! fails validation mutates nothing: no event, no memberships, no clock
//! movement.

use chrono::{DateTime, Duration, Timelike, Utc};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt;

use crate::catalog::{ActionCatalog, ActionSpec, VisibilityComputation};
use crate::universe::{
    AgentId, AgentSeed, Membership, MembershipRegistry, SeedIssue, SpaceId, SpaceSeed,
    UniverseError, UniverseState,
};

use super::event::{CanonicalEvent, EventId, EventLog, EventView};
use super::oracle::{ActionBrief, ActionOracle, OracleClientError, OracleReply, SpaceBrief, TurnRequest};
use super::visibility::{can_observe, compute_visibility, VisibilityNote};

/// Visible history entries per actor briefing.
pub const DEFAULT_HISTORY_WINDOW: usize = 50;
/// Global (context-free) events shown at the top of a briefing.
pub const GLOBAL_HISTORY_TAIL: usize = 5;
/// Message content is truncated to this many characters in briefings.
pub const CONTENT_PREVIEW_CHARS: usize = 250;
/// Simulated clock starts this many days in the past by default.
pub const DEFAULT_START_OFFSET_DAYS: i64 = 7;
/// Recipients sampled when the oracle names none.
pub const DEFAULT_RECIPIENT_SAMPLE: usize = 2;

pub const FALLBACK_SPACE_TYPE: &str = "Context";
pub const FALLBACK_SPACE_NAME: &str = "new-context";

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct SimConfig {
    /// Fixed start instant; defaults to now minus [`DEFAULT_START_OFFSET_DAYS`].
    pub start_time: Option<DateTime<Utc>>,
    pub history_window: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            start_time: None,
            history_window: DEFAULT_HISTORY_WINDOW,
        }
    }
}

// ============================================================================
// Turn Errors
// ============================================================================

/// Why a turn was skipped. All variants are turn-scoped: the kernel state is
/// exactly what it was before the turn started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TurnError {
    OracleTimeout,
    OracleRequestFailed { detail: String },
    OracleInvalidAction { action: String },
    OracleInvalidContext {
        action: String,
        context_id: Option<SpaceId>,
        fault: ContextFault,
    },
    OracleInvalidParent { action: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextFault {
    /// The action needs a context and the oracle named none.
    Missing,
    /// The actor is not a member of the named space.
    NotAccessible,
    /// The named space's type does not support the action.
    Unsupported,
}

impl From<OracleClientError> for TurnError {
    fn from(err: OracleClientError) -> Self {
        match err {
            OracleClientError::Timeout => TurnError::OracleTimeout,
            other => TurnError::OracleRequestFailed {
                detail: other.to_string(),
            },
        }
    }
}

impl fmt::Display for TurnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnError::OracleTimeout => write!(f, "oracle request timed out"),
            TurnError::OracleRequestFailed { detail } => {
                write!(f, "oracle request failed: {detail}")
            }
            TurnError::OracleInvalidAction { action } => {
                write!(f, "action not in catalog: {action}")
            }
            TurnError::OracleInvalidContext {
                action,
                context_id,
                fault,
            } => match fault {
                ContextFault::Missing => {
                    write!(f, "action {action} requires a context and none was proposed")
                }
                ContextFault::NotAccessible => write!(
                    f,
                    "context {} is not accessible for action {action}",
                    context_id.as_deref().unwrap_or("<none>")
                ),
                ContextFault::Unsupported => write!(
                    f,
                    "context {} does not support action {action}",
                    context_id.as_deref().unwrap_or("<none>")
                ),
            },
            TurnError::OracleInvalidParent { action } => {
                write!(f, "no visible parent event for action {action}")
            }
        }
    }
}

impl Error for TurnError {}

// ============================================================================
// Turn Output
// ============================================================================

/// Registry and universe mutations applied after an event was appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SideEffect {
    SpaceCreated {
        space_id: SpaceId,
        space_type: String,
        members: BTreeSet<AgentId>,
    },
    MemberJoined {
        space_id: SpaceId,
        agent_id: AgentId,
    },
}

/// Non-fatal observations made while a turn committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TurnNote {
    Visibility { note: VisibilityNote },
    /// The oracle named a parent that is missing or not visible to the actor;
    /// the backward scan result was used instead.
    ParentDiscarded { parent_id: EventId },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnReceipt {
    pub event: CanonicalEvent,
    pub side_effects: Vec<SideEffect>,
    pub notes: Vec<TurnNote>,
}

// ============================================================================
// Kernel
// ============================================================================

pub struct SimKernel {
    catalog: ActionCatalog,
    universe: UniverseState,
    registry: MembershipRegistry,
    log: EventLog,
    now: DateTime<Utc>,
    history_window: usize,
    rng: Box<dyn RngCore>,
    seed_issues: Vec<SeedIssue>,
}

impl fmt::Debug for SimKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimKernel")
            .field("now", &self.now)
            .field("history_window", &self.history_window)
            .finish_non_exhaustive()
    }
}

impl SimKernel {
    pub fn new(
        universe: UniverseState,
        catalog: ActionCatalog,
        config: SimConfig,
    ) -> Result<Self, UniverseError> {
        Self::with_rng(universe, catalog, config, StdRng::from_entropy())
    }

    /// Like [`SimKernel::new`] with a caller-supplied rng, for reproducible runs.
    pub fn with_rng(
        universe: UniverseState,
        catalog: ActionCatalog,
        config: SimConfig,
        rng: impl RngCore + 'static,
    ) -> Result<Self, UniverseError> {
        let seed_issues = universe.validate()?;
        let registry = MembershipRegistry::seed_from(&universe);
        let now = config
            .start_time
            .unwrap_or_else(|| Utc::now() - Duration::days(DEFAULT_START_OFFSET_DAYS));
        Ok(Self {
            catalog,
            universe,
            registry,
            log: EventLog::new(),
            now,
            history_window: config.history_window,
            rng: Box::new(rng),
            seed_issues,
        })
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn registry(&self) -> &MembershipRegistry {
        &self.registry
    }

    pub fn universe(&self) -> &UniverseState {
        &self.universe
    }

    pub fn catalog(&self) -> &ActionCatalog {
        &self.catalog
    }

    /// Non-fatal problems found in the seed at construction time.
    pub fn seed_issues(&self) -> &[SeedIssue] {
        &self.seed_issues
    }

    /// Runs one full turn against the oracle.
    ///
    /// On error the kernel is untouched: the log, the registry, the universe
    /// and the clock all keep their prior state.
    pub fn run_turn<O: ActionOracle + ?Sized>(
        &mut self,
        oracle: &O,
    ) -> Result<TurnReceipt, TurnError> {
        let actor = self.select_actor().clone();
        let request = self.build_turn_request(&actor);
        let reply = oracle.propose(&request)?;

        let action = match self.catalog.action(&reply.action) {
            Some(spec) => spec.clone(),
            None => {
                return Err(TurnError::OracleInvalidAction {
                    action: reply.action,
                })
            }
        };

        let mut notes = Vec::new();
        let mut context_id = self.resolve_context(&actor, &action, &reply)?;
        let parent_id =
            self.resolve_parent(&actor, &action, &reply, &mut context_id, &mut notes)?;
        let recipients = self.resolve_recipients(&actor, &action, &reply, context_id.as_deref());
        let content = extract_content(&reply.params);

        let view = EventView {
            action: &action.name,
            actor_id: &actor.id,
            context_id: context_id.as_deref(),
            recipients: recipients.as_ref(),
        };
        let outcome = compute_visibility(view, &self.universe.agents, &self.catalog, &self.registry);
        notes.extend(
            outcome
                .notes
                .into_iter()
                .map(|note| TurnNote::Visibility { note }),
        );

        // Validation is done; the turn commits from here.
        let event = CanonicalEvent {
            id: self.next_event_id(),
            timestamp: self.now,
            action: action.name.clone(),
            actor_id: actor.id.clone(),
            context_id,
            recipients,
            parent_id,
            content,
            metadata: reply.params,
            visibility: outcome.observers,
        };
        let event = self.log.append(event).clone();
        let side_effects = self.apply_side_effects(&action, &event);
        self.advance_clock();

        Ok(TurnReceipt {
            event,
            side_effects,
            notes,
        })
    }

    // ------------------------------------------------------------------
    // Actor selection and briefing
    // ------------------------------------------------------------------

    /// Weighted draw over activity levels. A roster whose weights sum to zero
    /// degrades to a uniform draw instead of always electing the first agent.
    fn select_actor(&mut self) -> &AgentSeed {
        let weights: Vec<f64> = self
            .universe
            .agents
            .iter()
            .map(|agent| agent.activity_level.max(0.0))
            .collect();
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            let index = self.rng.gen_range(0..self.universe.agents.len());
            return &self.universe.agents[index];
        }
        let mut draw = self.rng.gen_range(0.0..total);
        for (index, weight) in weights.iter().enumerate() {
            draw -= weight;
            if draw <= 0.0 {
                return &self.universe.agents[index];
            }
        }
        &self.universe.agents[0]
    }

    fn build_turn_request(&self, actor: &AgentSeed) -> TurnRequest {
        let actions = self
            .catalog
            .actions
            .iter()
            .map(|spec| ActionBrief {
                name: spec.name.clone(),
                description: spec.description.clone(),
                required_params: spec.required_params.clone(),
            })
            .collect();

        let spaces = self
            .registry
            .spaces_of(&actor.id)
            .into_iter()
            .map(|space_id| {
                let (name, type_name) = match self.universe.space(&space_id) {
                    Some(space) => (space.display_name().to_string(), space.type_name.clone()),
                    None => (space_id.clone(), FALLBACK_SPACE_TYPE.to_string()),
                };
                let supported_actions = self
                    .catalog
                    .space_type(&type_name)
                    .map(|space_type| {
                        space_type
                            .supports_actions
                            .iter()
                            .filter(|action| self.catalog.action(action).is_some())
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                SpaceBrief {
                    member_count: self.registry.member_count(&space_id),
                    id: space_id,
                    name,
                    type_name,
                    supported_actions,
                }
            })
            .collect();

        TurnRequest {
            actor_id: actor.id.clone(),
            persona: actor.persona.clone(),
            actions,
            spaces,
            history: self.build_history(&actor.id),
        }
    }

    /// Digest of the actor's visible history: global events first, then
    /// per-space sections, then the list of spaces the actor belongs to.
    fn build_history(&self, actor_id: &str) -> String {
        let visible: Vec<&CanonicalEvent> = self
            .log
            .iter()
            .filter(|event| can_observe(actor_id, event.view(), &self.catalog, &self.registry))
            .collect();
        let window_start = visible.len().saturating_sub(self.history_window);
        let visible = &visible[window_start..];

        let mut global: Vec<&CanonicalEvent> = Vec::new();
        let mut by_space: BTreeMap<&str, Vec<&CanonicalEvent>> = BTreeMap::new();
        for event in visible {
            match event.context_id.as_deref() {
                None => global.push(event),
                Some(space_id) => by_space.entry(space_id).or_default().push(event),
            }
        }

        let mut digest = String::from("Recent activity you can see:\n\n");
        if !global.is_empty() {
            digest.push_str("System/Global events:\n");
            let tail = global.len().saturating_sub(GLOBAL_HISTORY_TAIL);
            for event in &global[tail..] {
                let who = self.universe.display_name_of(&event.actor_id);
                match &event.content {
                    Some(content) => {
                        digest.push_str(&format!("- {who}: {} ({content})\n", event.action))
                    }
                    None => digest.push_str(&format!("- {who}: {}\n", event.action)),
                }
            }
            digest.push('\n');
        }

        for (space_id, events) in &by_space {
            let space_id = *space_id;
            let name = self
                .universe
                .space(space_id)
                .map(|space| space.display_name())
                .unwrap_or(space_id);
            digest.push_str(&format!("In {name}:\n"));
            for event in events {
                let who = self.universe.display_name_of(&event.actor_id);
                let me = if event.actor_id == actor_id { " (you)" } else { "" };
                let line = match &event.content {
                    Some(content) => content_preview(content),
                    None => event.action.clone(),
                };
                digest.push_str(&format!("- {who}{me}: {line}\n"));
            }
            digest.push('\n');
        }

        let spaces = self.registry.spaces_of(actor_id);
        digest.push_str(&format!("\nYou are in these spaces: {}\n", spaces.join(", ")));
        digest
    }

    // ------------------------------------------------------------------
    // Proposal resolution
    // ------------------------------------------------------------------

    fn resolve_context(
        &self,
        actor: &AgentSeed,
        action: &ActionSpec,
        reply: &OracleReply,
    ) -> Result<Option<SpaceId>, TurnError> {
        if !action.requires_context() {
            return Ok(None);
        }
        let context_id = match &reply.context_id {
            Some(context_id) => context_id.clone(),
            None => {
                return Err(TurnError::OracleInvalidContext {
                    action: action.name.clone(),
                    context_id: None,
                    fault: ContextFault::Missing,
                })
            }
        };
        if !self.registry.is_member(&context_id, &actor.id) {
            return Err(TurnError::OracleInvalidContext {
                action: action.name.clone(),
                context_id: Some(context_id),
                fault: ContextFault::NotAccessible,
            });
        }
        let supported = self
            .universe
            .space(&context_id)
            .map(|space| self.catalog.space_type_supports(&space.type_name, &action.name))
            .unwrap_or(false);
        if !supported {
            return Err(TurnError::OracleInvalidContext {
                action: action.name.clone(),
                context_id: Some(context_id),
                fault: ContextFault::Unsupported,
            });
        }
        Ok(Some(context_id))
    }

    /// Resolves the parent when the action threads replies.
    ///
    /// An oracle-named parent must exist and be visible to the actor; when it
    /// is used, it also donates its context if none was chosen. Otherwise the
    /// newest event visible within the chosen context is used.
    fn resolve_parent(
        &self,
        actor: &AgentSeed,
        action: &ActionSpec,
        reply: &OracleReply,
        context_id: &mut Option<SpaceId>,
        notes: &mut Vec<TurnNote>,
    ) -> Result<Option<EventId>, TurnError> {
        if !action.requires_parent() {
            return Ok(None);
        }

        if let Some(candidate) = reply.parent_id.as_deref() {
            match self.log.get(candidate) {
                Some(parent)
                    if can_observe(&actor.id, parent.view(), &self.catalog, &self.registry) =>
                {
                    if context_id.is_none() {
                        *context_id = parent.context_id.clone();
                    }
                    return Ok(Some(parent.id.clone()));
                }
                _ => notes.push(TurnNote::ParentDiscarded {
                    parent_id: candidate.to_string(),
                }),
            }
        }

        let fallback = self
            .log
            .iter()
            .rev()
            .find(|event| {
                let in_scope = match context_id.as_deref() {
                    Some(context_id) => event.context_id.as_deref() == Some(context_id),
                    None => true,
                };
                in_scope && can_observe(&actor.id, event.view(), &self.catalog, &self.registry)
            })
            .map(|event| event.id.clone());

        match fallback {
            Some(parent_id) => Ok(Some(parent_id)),
            None => Err(TurnError::OracleInvalidParent {
                action: action.name.clone(),
            }),
        }
    }

    /// Resolves the recipient set for explicit-recipient actions. Oracle-named
    /// recipients win; otherwise the first [`DEFAULT_RECIPIENT_SAMPLE`] other
    /// members of the context (or of the roster) are used.
    fn resolve_recipients(
        &self,
        actor: &AgentSeed,
        action: &ActionSpec,
        reply: &OracleReply,
        context_id: Option<&str>,
    ) -> Option<BTreeSet<AgentId>> {
        let recipient_fields = match &action.visibility {
            Some(VisibilityComputation::ExplicitRecipients { recipient_fields }) => {
                recipient_fields
            }
            _ => return None,
        };

        let mut recipients: BTreeSet<AgentId> = BTreeSet::new();
        if let Some(listed) = &reply.recipients {
            recipients.extend(listed.iter().cloned());
        }
        for field in recipient_fields {
            match reply.params.get(field) {
                Some(serde_json::Value::String(id)) => {
                    recipients.insert(id.clone());
                }
                Some(serde_json::Value::Array(ids)) => {
                    recipients.extend(ids.iter().filter_map(|id| id.as_str().map(str::to_string)));
                }
                _ => {}
            }
        }

        if recipients.is_empty() {
            let pool: Vec<AgentId> = match context_id.and_then(|id| self.registry.members(id)) {
                Some(members) => members.iter().cloned().collect(),
                None => self.universe.agents.iter().map(|agent| agent.id.clone()).collect(),
            };
            recipients = pool
                .into_iter()
                .filter(|id| id != &actor.id)
                .take(DEFAULT_RECIPIENT_SAMPLE)
                .collect();
        }
        Some(recipients)
    }

    // ------------------------------------------------------------------
    // Side effects and clock
    // ------------------------------------------------------------------

    fn apply_side_effects(
        &mut self,
        action: &ActionSpec,
        event: &CanonicalEvent,
    ) -> Vec<SideEffect> {
        let mut effects = Vec::new();
        if action.can_create_space {
            effects.push(self.create_space(action, event));
        }
        if action.creates_memberships() {
            if let Some(effect) = self.apply_membership_change(action, event) {
                effects.push(effect);
            }
        }
        effects
    }

    fn create_space(&mut self, action: &ActionSpec, event: &CanonicalEvent) -> SideEffect {
        let space_id = self.next_space_id();
        let mut members: BTreeSet<AgentId> = BTreeSet::new();
        members.insert(event.actor_id.clone());
        if let Some(recipients) = &event.recipients {
            members.extend(recipients.iter().cloned());
        }
        let space_type = self
            .catalog
            .space_type_supporting(&action.name)
            .map(|space_type| space_type.name.clone())
            .unwrap_or_else(|| FALLBACK_SPACE_TYPE.to_string());
        let name = event
            .metadata
            .get("name")
            .and_then(|value| value.as_str())
            .unwrap_or(FALLBACK_SPACE_NAME)
            .to_string();

        let mut data = serde_json::Map::new();
        data.insert("name".to_string(), serde_json::Value::String(name));
        self.universe.initial_spaces.push(SpaceSeed {
            id: space_id.clone(),
            type_name: space_type.clone(),
            data,
        });
        for member in &members {
            self.registry.join(&space_id, member);
            self.universe.memberships.push(Membership {
                agent_id: member.clone(),
                space_id: space_id.clone(),
            });
        }

        SideEffect::SpaceCreated {
            space_id,
            space_type,
            members,
        }
    }

    /// Joins an agent to a space named by the action's metadata. Already a
    /// member means no effect; the registry and seed stay consistent.
    fn apply_membership_change(
        &mut self,
        action: &ActionSpec,
        event: &CanonicalEvent,
    ) -> Option<SideEffect> {
        let space_param = action.space_parameter.as_deref()?;
        let space_id = event
            .metadata
            .get(space_param)
            .and_then(|value| value.as_str())?
            .to_string();
        let agent_id = ["user_id", "agent_id", "member_id"]
            .iter()
            .find_map(|key| event.metadata.get(*key).and_then(|value| value.as_str()))?
            .to_string();

        if !self.registry.join(&space_id, &agent_id) {
            return None;
        }
        let already_seeded = self
            .universe
            .memberships
            .iter()
            .any(|membership| membership.agent_id == agent_id && membership.space_id == space_id);
        if !already_seeded {
            self.universe.memberships.push(Membership {
                agent_id: agent_id.clone(),
                space_id: space_id.clone(),
            });
        }
        Some(SideEffect::MemberJoined { space_id, agent_id })
    }

    fn advance_clock(&mut self) {
        let jump = clock_jump(self.now.hour(), self.rng.as_mut());
        self.now = self.now + jump;
    }

    fn next_event_id(&mut self) -> EventId {
        format!(
            "evt_{}_{}",
            self.now.timestamp_millis(),
            random_suffix(self.rng.as_mut(), 9)
        )
    }

    fn next_space_id(&mut self) -> SpaceId {
        format!(
            "space_{}_{}",
            self.now.timestamp_millis(),
            random_suffix(self.rng.as_mut(), 4)
        )
    }
}

// ============================================================================
// Free helpers
// ============================================================================

/// Diurnal time jump: overnight hours leap up to eight hours, working hours
/// crawl in minutes, evenings sit in between.
fn clock_jump(hour: u32, rng: &mut dyn RngCore) -> Duration {
    let max_ms: i64 = if hour >= 22 || hour < 7 {
        8 * 60 * 60 * 1000
    } else if (9..17).contains(&hour) {
        10 * 60 * 1000
    } else {
        60 * 60 * 1000
    };
    let fraction: f64 = rng.gen_range(0.0..1.0);
    Duration::milliseconds((fraction * max_ms as f64) as i64)
}

fn random_suffix(rng: &mut dyn RngCore, len: usize) -> String {
    (0..len)
        .map(|_| {
            let index = rng.gen_range(0..ID_ALPHABET.len());
            ID_ALPHABET[index] as char
        })
        .collect()
}

fn extract_content(params: &serde_json::Map<String, serde_json::Value>) -> Option<String> {
    for key in ["message", "text", "content"] {
        if let Some(value) = params.get(key).and_then(|value| value.as_str()) {
            return Some(value.to_string());
        }
    }
    None
}

fn content_preview(content: &str) -> String {
    let mut preview: String = content.chars().take(CONTENT_PREVIEW_CHARS).collect();
    if content.chars().count() > CONTENT_PREVIEW_CHARS {
        preview.push_str("...");
    }
    preview
}
