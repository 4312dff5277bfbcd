//! Declarative action catalog: actions, visibility computations, write specs,
//! space types, and bootstrap specs. Supplied as JSON by an external
//! collaborator and consumed read-only by the simulation and materialization
//! layers.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::Path;

/// Whether an action is authored by a regular agent or by the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    #[default]
    Agent,
    System,
}

/// How an action decides who can observe the resulting event.
///
/// The wire format is `{method, field?, fields?, description?}` with an open
/// `method` string; unknown methods collapse into `Unresolved` so the engine
/// can apply its inference fallback instead of failing the catalog load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawVisibility", into = "RawVisibility")]
pub enum VisibilityComputation {
    SpaceMembers { space_field: String },
    ExplicitRecipients { recipient_fields: Vec<String> },
    Everyone,
    Unresolved { description: String },
}

pub const DEFAULT_SPACE_FIELD: &str = "contextId";
pub const DEFAULT_RECIPIENT_FIELD: &str = "recipients";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawVisibility {
    method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    field: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
}

impl From<RawVisibility> for VisibilityComputation {
    fn from(raw: RawVisibility) -> Self {
        match raw.method.as_str() {
            "space_members" => VisibilityComputation::SpaceMembers {
                space_field: raw
                    .field
                    .unwrap_or_else(|| DEFAULT_SPACE_FIELD.to_string()),
            },
            "explicit_recipients" => VisibilityComputation::ExplicitRecipients {
                recipient_fields: if raw.fields.is_empty() {
                    vec![DEFAULT_RECIPIENT_FIELD.to_string()]
                } else {
                    raw.fields
                },
            },
            "everyone" => VisibilityComputation::Everyone,
            other => VisibilityComputation::Unresolved {
                description: raw.description.unwrap_or_else(|| other.to_string()),
            },
        }
    }
}

impl From<VisibilityComputation> for RawVisibility {
    fn from(value: VisibilityComputation) -> Self {
        match value {
            VisibilityComputation::SpaceMembers { space_field } => RawVisibility {
                method: "space_members".to_string(),
                field: Some(space_field),
                fields: Vec::new(),
                description: None,
            },
            VisibilityComputation::ExplicitRecipients { recipient_fields } => RawVisibility {
                method: "explicit_recipients".to_string(),
                field: None,
                fields: recipient_fields,
                description: None,
            },
            VisibilityComputation::Everyone => RawVisibility {
                method: "everyone".to_string(),
                field: None,
                fields: Vec::new(),
                description: None,
            },
            VisibilityComputation::Unresolved { description } => RawVisibility {
                method: "custom".to_string(),
                field: None,
                fields: Vec::new(),
                description: Some(description),
            },
        }
    }
}

/// Where a column's value comes from when an event is materialized.
///
/// Stringly-typed source tags (`metadata.X`, `idMap.X`, `static_X`) are
/// parsed into this closed variant once at catalog load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnSource {
    ActorId,
    ContextId,
    ParentId,
    Content,
    Timestamp,
    Metadata(String),
    IdMapRef(String),
    /// Carries the full `static_*` key looked up in the write's static table.
    StaticRef(String),
    Literal(String),
}

impl ColumnSource {
    pub fn parse(source: &str) -> Self {
        match source {
            "actorId" => ColumnSource::ActorId,
            "contextId" => ColumnSource::ContextId,
            "parentId" => ColumnSource::ParentId,
            "content" => ColumnSource::Content,
            "timestamp" => ColumnSource::Timestamp,
            other => {
                if let Some(key) = other.strip_prefix("metadata.") {
                    ColumnSource::Metadata(key.to_string())
                } else if let Some(key) = other.strip_prefix("idMap.") {
                    ColumnSource::IdMapRef(key.to_string())
                } else if other.starts_with("static_") {
                    ColumnSource::StaticRef(other.to_string())
                } else {
                    ColumnSource::Literal(other.to_string())
                }
            }
        }
    }

    pub fn encode(&self) -> String {
        match self {
            ColumnSource::ActorId => "actorId".to_string(),
            ColumnSource::ContextId => "contextId".to_string(),
            ColumnSource::ParentId => "parentId".to_string(),
            ColumnSource::Content => "content".to_string(),
            ColumnSource::Timestamp => "timestamp".to_string(),
            ColumnSource::Metadata(key) => format!("metadata.{key}"),
            ColumnSource::IdMapRef(key) => format!("idMap.{key}"),
            ColumnSource::StaticRef(key) => key.clone(),
            ColumnSource::Literal(value) => value.clone(),
        }
    }
}

/// Storage-level coercion applied after a column source resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeHint {
    Fk,
    Json,
    Text,
    Integer,
    Boolean,
    Timestamp,
}

/// One column of a write spec: a parsed source plus an optional type hint.
///
/// Wire format is either a bare source string or `{source, type}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawColumnMapping", into = "RawColumnMapping")]
pub struct ColumnMapping {
    pub source: ColumnSource,
    pub type_hint: Option<TypeHint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawColumnMapping {
    Source(String),
    Full {
        source: String,
        #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
        type_hint: Option<TypeHint>,
    },
}

impl From<RawColumnMapping> for ColumnMapping {
    fn from(raw: RawColumnMapping) -> Self {
        match raw {
            RawColumnMapping::Source(source) => ColumnMapping {
                source: ColumnSource::parse(&source),
                type_hint: None,
            },
            RawColumnMapping::Full { source, type_hint } => ColumnMapping {
                source: ColumnSource::parse(&source),
                type_hint,
            },
        }
    }
}

impl From<ColumnMapping> for RawColumnMapping {
    fn from(mapping: ColumnMapping) -> Self {
        match mapping.type_hint {
            None => RawColumnMapping::Source(mapping.source.encode()),
            Some(type_hint) => RawColumnMapping::Full {
                source: mapping.source.encode(),
                type_hint: Some(type_hint),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteOp {
    #[default]
    Insert,
    Update,
    Upsert,
}

/// One declarative table write an action performs when materialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteSpec {
    #[serde(default)]
    pub op: WriteOp,
    pub table: String,
    pub columns: BTreeMap<String, ColumnMapping>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub static_values: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returning: Option<String>,
}

/// A single action an agent (or the system) can take.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_params: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creates_entity: Option<String>,
    #[serde(default)]
    pub can_create_space: bool,
    #[serde(default)]
    pub action_type: ActionKind,
    #[serde(
        rename = "visibilityComputation",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub visibility: Option<VisibilityComputation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space_parameter: Option<String>,
    #[serde(rename = "dbWrites", default, skip_serializing_if = "Vec::is_empty")]
    pub writes: Vec<WriteSpec>,
}

/// The `createsEntity` tag marking membership-creating actions.
pub const ENTITY_MEMBERS: &str = "members";

impl ActionSpec {
    pub fn is_system(&self) -> bool {
        self.action_type == ActionKind::System
    }

    pub fn creates_memberships(&self) -> bool {
        self.creates_entity.as_deref() == Some(ENTITY_MEMBERS)
    }

    /// An action needs a context if its visibility is space-scoped, if it can
    /// create a space, or if any write binds a context-bearing column.
    pub fn requires_context(&self) -> bool {
        if matches!(
            self.visibility,
            Some(VisibilityComputation::SpaceMembers { .. })
        ) {
            return true;
        }
        if self.can_create_space {
            return true;
        }
        self.writes.iter().any(|write| {
            write.columns.values().any(|col| match &col.source {
                ColumnSource::ContextId => true,
                ColumnSource::Metadata(key) => key == DEFAULT_SPACE_FIELD,
                _ => false,
            })
        })
    }

    /// An action needs a parent if it declares a parent-bearing required
    /// parameter or any write binds a parent column.
    pub fn requires_parent(&self) -> bool {
        if self
            .required_params
            .iter()
            .any(|param| param == "parentId" || param == "parent_id")
        {
            return true;
        }
        self.writes.iter().any(|write| {
            write
                .columns
                .values()
                .any(|col| matches!(col.source, ColumnSource::ParentId))
        })
    }
}

/// A kind of space and which actions it hosts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaceTypeSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub membership_table: Option<String>,
    #[serde(default)]
    pub supports_actions: Vec<String>,
}

fn default_returning() -> String {
    "id".to_string()
}

fn default_agent_column() -> String {
    "user_id".to_string()
}

fn default_space_column() -> String {
    "space_id".to_string()
}

/// Write spec for one bootstrap entity family (actors or spaces).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapTableSpec {
    pub table: String,
    #[serde(default = "default_returning")]
    pub returning: String,
    #[serde(default)]
    pub columns: BTreeMap<String, BootstrapColumnSpec>,
}

/// One bootstrap column: a source key in the conventional metadata
/// vocabulary, an optional type hint, and an optional `{{key}}` transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapColumnSpec {
    pub source: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_hint: Option<TypeHint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,
}

/// Write spec for bootstrap memberships. Metadata keys are the literal target
/// column names, so synthesis and materialization agree on them here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipTableSpec {
    pub table: String,
    #[serde(default = "default_agent_column")]
    pub agent_column: String,
    #[serde(default = "default_space_column")]
    pub space_column: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actors: Option<BootstrapTableSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spaces: Option<BootstrapTableSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memberships: Option<MembershipTableSpec>,
}

/// The full catalog handed to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionCatalog {
    pub actions: Vec<ActionSpec>,
    #[serde(default)]
    pub space_types: Vec<SpaceTypeSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<BootstrapSpec>,
}

impl ActionCatalog {
    pub fn from_json(input: &str) -> Result<Self, CatalogError> {
        let catalog: Self = serde_json::from_str(input)?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).map_err(|err| CatalogError::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        Self::from_json(&data)
    }

    /// Action names must be unique within the catalog.
    pub fn validate(&self) -> Result<(), CatalogError> {
        let mut seen = BTreeSet::new();
        for action in &self.actions {
            if !seen.insert(action.name.as_str()) {
                return Err(CatalogError::DuplicateAction {
                    name: action.name.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn action(&self, name: &str) -> Option<&ActionSpec> {
        self.actions.iter().find(|action| action.name == name)
    }

    pub fn space_type(&self, name: &str) -> Option<&SpaceTypeSpec> {
        self.space_types.iter().find(|st| st.name == name)
    }

    /// First space type whose supported actions include `action`.
    pub fn space_type_supporting(&self, action: &str) -> Option<&SpaceTypeSpec> {
        self.space_types
            .iter()
            .find(|st| st.supports_actions.iter().any(|name| name == action))
    }

    pub fn space_type_supports(&self, space_type: &str, action: &str) -> bool {
        self.space_type(space_type)
            .map(|st| st.supports_actions.iter().any(|name| name == action))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    Io { path: String, message: String },
    Parse { message: String },
    DuplicateAction { name: String },
}

impl From<serde_json::Error> for CatalogError {
    fn from(err: serde_json::Error) -> Self {
        CatalogError::Parse {
            message: err.to_string(),
        }
    }
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogError::Io { path, message } => {
                write!(f, "read catalog failed ({path}): {message}")
            }
            CatalogError::Parse { message } => write!(f, "parse catalog failed: {message}"),
            CatalogError::DuplicateAction { name } => {
                write!(f, "duplicate action name in catalog: {name}")
            }
        }
    }
}

impl std::error::Error for CatalogError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_action_with_mixed_column_forms() {
        let input = r#"{
            "actions": [{
                "name": "post_message",
                "description": "Post a message to a channel",
                "requiredParams": ["message"],
                "visibilityComputation": {"method": "space_members", "field": "contextId"},
                "dbWrites": [{
                    "table": "messages",
                    "columns": {
                        "author_id": {"source": "actorId", "type": "fk"},
                        "channel_id": {"source": "contextId", "type": "fk"},
                        "body": "content",
                        "sent_at": {"source": "timestamp", "type": "timestamp"},
                        "kind": "static_kind"
                    },
                    "staticValues": {"static_kind": "chat"},
                    "returning": "id"
                }]
            }],
            "spaceTypes": [{"name": "Channel", "supportsActions": ["post_message"]}]
        }"#;

        let catalog = ActionCatalog::from_json(input).unwrap();
        let action = catalog.action("post_message").unwrap();
        assert_eq!(
            action.visibility,
            Some(VisibilityComputation::SpaceMembers {
                space_field: "contextId".to_string()
            })
        );
        let write = &action.writes[0];
        assert_eq!(
            write.columns["author_id"].source,
            ColumnSource::ActorId
        );
        assert_eq!(write.columns["author_id"].type_hint, Some(TypeHint::Fk));
        assert_eq!(write.columns["body"].source, ColumnSource::Content);
        assert_eq!(write.columns["body"].type_hint, None);
        assert_eq!(
            write.columns["kind"].source,
            ColumnSource::StaticRef("static_kind".to_string())
        );
        assert!(action.requires_context());
        assert!(!action.requires_parent());
    }

    #[test]
    fn column_source_parse_covers_tagged_prefixes() {
        assert_eq!(
            ColumnSource::parse("metadata.subject"),
            ColumnSource::Metadata("subject".to_string())
        );
        assert_eq!(
            ColumnSource::parse("idMap.a-1"),
            ColumnSource::IdMapRef("a-1".to_string())
        );
        assert_eq!(
            ColumnSource::parse("static_origin"),
            ColumnSource::StaticRef("static_origin".to_string())
        );
        assert_eq!(
            ColumnSource::parse("direct-value"),
            ColumnSource::Literal("direct-value".to_string())
        );
        assert_eq!(ColumnSource::parse("parentId"), ColumnSource::ParentId);
    }

    #[test]
    fn unknown_visibility_method_becomes_unresolved() {
        let raw = r#"{"method": "graph_reachability", "description": "per edge"}"#;
        let vis: VisibilityComputation = serde_json::from_str(raw).unwrap();
        assert_eq!(
            vis,
            VisibilityComputation::Unresolved {
                description: "per edge".to_string()
            }
        );
    }

    #[test]
    fn visibility_round_trips_through_wire_form() {
        let vis = VisibilityComputation::ExplicitRecipients {
            recipient_fields: vec!["recipient".to_string(), "cc".to_string()],
        };
        let json = serde_json::to_string(&vis).unwrap();
        let back: VisibilityComputation = serde_json::from_str(&json).unwrap();
        assert_eq!(vis, back);
    }

    #[test]
    fn duplicate_action_names_fail_validation() {
        let input = r#"{
            "actions": [
                {"name": "ping"},
                {"name": "ping"}
            ]
        }"#;
        let err = ActionCatalog::from_json(input).unwrap_err();
        assert_eq!(
            err,
            CatalogError::DuplicateAction {
                name: "ping".to_string()
            }
        );
    }

    #[test]
    fn parent_requirement_from_params_and_writes() {
        let by_param: ActionSpec = serde_json::from_str(
            r#"{"name": "react", "requiredParams": ["parentId", "emoji"]}"#,
        )
        .unwrap();
        assert!(by_param.requires_parent());

        let by_write: ActionSpec = serde_json::from_str(
            r#"{
                "name": "reply",
                "dbWrites": [{
                    "table": "messages",
                    "columns": {"parent_id": {"source": "parentId", "type": "fk"}}
                }]
            }"#,
        )
        .unwrap();
        assert!(by_write.requires_parent());
    }

    #[test]
    fn bootstrap_spec_defaults() {
        let input = r#"{
            "actions": [],
            "bootstrap": {
                "actors": {
                    "table": "users",
                    "columns": {"name": {"source": "name"}}
                },
                "memberships": {"table": "channel_members"}
            }
        }"#;
        let catalog = ActionCatalog::from_json(input).unwrap();
        let bootstrap = catalog.bootstrap.unwrap();
        assert_eq!(bootstrap.actors.unwrap().returning, "id");
        let memberships = bootstrap.memberships.unwrap();
        assert_eq!(memberships.agent_column, "user_id");
        assert_eq!(memberships.space_column, "space_id");
    }
}
