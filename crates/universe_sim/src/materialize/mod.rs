//! Materialize module - canonical events rendered into service tables.
//!
//! This module is organized into submodules:
//! - `bootstrap`: seed expansion into privileged bootstrap events
//! - `sql`: the SqlWrite shape and the SQLite backend behind StorageBackend
//!
//! The materializer itself walks the event list in order, turns each event's
//! write specs into parameterized writes, and reconciles synthetic ids
//! against storage-assigned ones. Errors are write-scoped: a failed write is
//! logged and skipped, the batch keeps going. The single fatal case is
//! bootstrap events arriving with no bootstrap configuration at all.

mod bootstrap;
mod sql;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;

use crate::catalog::{
    ActionCatalog, BootstrapColumnSpec, BootstrapTableSpec, ColumnSource, MembershipTableSpec,
    TypeHint, WriteOp, WriteSpec,
};
use crate::sim::CanonicalEvent;

pub use bootstrap::{
    bootstrap_events, is_bootstrap_event, BOOTSTRAP_ACTION_PREFIX, BOOTSTRAP_CREATE_MEMBERSHIP,
    BOOTSTRAP_CREATE_SPACE, BOOTSTRAP_CREATE_USER, BOOTSTRAP_SPACE_ID_PREFIX,
    BOOTSTRAP_USER_ID_PREFIX, SYSTEM_ACTOR,
};
pub use sql::{render_sql, SqlValue, SqlWrite, SqliteBackend, StorageBackend, StorageError};

/// Synthetic id values that look like entity references. A membership
/// metadata value carrying one of these prefixes must already be bound in the
/// reconciliation map; anything else passes through untouched.
const ACTOR_REF_PREFIXES: [&str; 6] = ["agent_", "agent-", "a_", "a-", "user_", "user-"];
const SPACE_REF_PREFIXES: [&str; 8] = ["space_", "space-", "s_", "s-", "ch_", "ch-", "ws_", "ws-"];

// ============================================================================
// Reconciliation
// ============================================================================

/// A storage-assigned identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StorageId {
    Integer(i64),
    Text(String),
}

impl StorageId {
    fn from_sql(value: &SqlValue) -> Option<StorageId> {
        match value {
            SqlValue::Integer(value) => Some(StorageId::Integer(*value)),
            SqlValue::Real(value) => Some(StorageId::Integer(*value as i64)),
            SqlValue::Text(value) => Some(StorageId::Text(value.clone())),
            SqlValue::Null | SqlValue::Bool(_) => None,
        }
    }

    fn to_sql(&self) -> SqlValue {
        match self {
            StorageId::Integer(value) => SqlValue::Integer(*value),
            StorageId::Text(value) => SqlValue::Text(value.clone()),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            StorageId::Integer(value) => Value::Number((*value).into()),
            StorageId::Text(value) => Value::String(value.clone()),
        }
    }
}

impl fmt::Display for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageId::Integer(value) => write!(f, "{value}"),
            StorageId::Text(value) => write!(f, "{value}"),
        }
    }
}

/// Synthetic id to storage id. Grows monotonically within a run: a key bound
/// once is never overwritten and never removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationMap {
    entries: BTreeMap<String, StorageId>,
}

impl ReconciliationMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `key` to `id`. Returns false and keeps the first binding when
    /// the key is already present.
    pub fn bind(&mut self, key: &str, id: StorageId) -> bool {
        if self.entries.contains_key(key) {
            return false;
        }
        self.entries.insert(key.to_string(), id);
        true
    }

    pub fn lookup(&self, key: &str) -> Option<&StorageId> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Errors and logs
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum MaterializeError {
    /// A value with an entity prefix never went through the reconciliation map.
    UnmappedForeignKey { column: String, value: String },
    UnknownBootstrapAction { action: String },
    /// The catalog has no bootstrap table spec for this family of events.
    MissingBootstrapConfig { family: String },
    WriteExecutionFailed { table: String, message: String },
}

impl fmt::Display for MaterializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaterializeError::UnmappedForeignKey { column, value } => {
                write!(f, "unmapped foreign key in {column}: {value}")
            }
            MaterializeError::UnknownBootstrapAction { action } => {
                write!(f, "unknown bootstrap action: {action}")
            }
            MaterializeError::MissingBootstrapConfig { family } => {
                write!(f, "no bootstrap config for {family}")
            }
            MaterializeError::WriteExecutionFailed { table, message } => {
                write!(f, "write to {table} failed: {message}")
            }
        }
    }
}

impl Error for MaterializeError {}

impl From<StorageError> for MaterializeError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Execute { table, message } => {
                MaterializeError::WriteExecutionFailed { table, message }
            }
            StorageError::Open { message } => MaterializeError::WriteExecutionFailed {
                table: "<connection>".to_string(),
                message,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteLogEntry {
    pub event_id: String,
    pub kind: WriteLogKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WriteLogKind {
    Written {
        table: String,
        returned: Option<StorageId>,
    },
    WriteSkipped {
        table: String,
        reason: MaterializeError,
    },
    EventSkipped {
        reason: MaterializeError,
    },
    UnknownAction {
        action: String,
    },
    NoWriteSpecs {
        action: String,
    },
    Bound {
        key: String,
        id: StorageId,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializeReport {
    pub events_processed: u64,
    pub events_skipped: u64,
    pub writes_executed: u64,
    pub writes_skipped: u64,
}

// ============================================================================
// Materializer
// ============================================================================

pub struct Materializer<'a> {
    catalog: &'a ActionCatalog,
    map: ReconciliationMap,
    logs: Vec<WriteLogEntry>,
    report: MaterializeReport,
}

impl<'a> Materializer<'a> {
    pub fn new(catalog: &'a ActionCatalog) -> Self {
        Self {
            catalog,
            map: ReconciliationMap::new(),
            logs: Vec::new(),
            report: MaterializeReport::default(),
        }
    }

    /// Fatal startup check: bootstrap events present with no bootstrap
    /// configuration anywhere in the catalog. Runs before any write.
    pub fn preflight(
        catalog: &ActionCatalog,
        events: &[CanonicalEvent],
    ) -> Result<(), MaterializeError> {
        if catalog.bootstrap.is_none() && events.iter().any(is_bootstrap_event) {
            return Err(MaterializeError::MissingBootstrapConfig {
                family: "bootstrap".to_string(),
            });
        }
        Ok(())
    }

    /// Materializes `events` in order against `backend`.
    pub fn run(
        &mut self,
        events: &[CanonicalEvent],
        backend: &mut dyn StorageBackend,
    ) -> Result<MaterializeReport, MaterializeError> {
        Self::preflight(self.catalog, events)?;
        for event in events {
            self.apply_event(event, backend);
            self.report.events_processed += 1;
        }
        Ok(self.report.clone())
    }

    pub fn id_map(&self) -> &ReconciliationMap {
        &self.map
    }

    pub fn logs(&self) -> &[WriteLogEntry] {
        &self.logs
    }

    pub fn take_logs(&mut self) -> Vec<WriteLogEntry> {
        std::mem::take(&mut self.logs)
    }

    pub fn report(&self) -> &MaterializeReport {
        &self.report
    }

    fn log(&mut self, event: &CanonicalEvent, kind: WriteLogKind) {
        self.logs.push(WriteLogEntry {
            event_id: event.id.clone(),
            kind,
        });
    }

    fn apply_event(&mut self, event: &CanonicalEvent, backend: &mut dyn StorageBackend) {
        if is_bootstrap_event(event) {
            self.apply_bootstrap_event(event, backend);
            return;
        }

        let catalog = self.catalog;
        let action = match catalog.action(&event.action) {
            Some(action) => action,
            None => {
                self.log(
                    event,
                    WriteLogKind::UnknownAction {
                        action: event.action.clone(),
                    },
                );
                return;
            }
        };
        if action.writes.is_empty() {
            self.log(
                event,
                WriteLogKind::NoWriteSpecs {
                    action: action.name.clone(),
                },
            );
            return;
        }
        for write in &action.writes {
            self.apply_write(event, write, backend);
        }
    }

    fn apply_write(
        &mut self,
        event: &CanonicalEvent,
        write: &WriteSpec,
        backend: &mut dyn StorageBackend,
    ) {
        let sql = match self.prepare_write(event, write) {
            Ok(sql) => sql,
            Err(reason) => {
                self.report.writes_skipped += 1;
                self.log(
                    event,
                    WriteLogKind::WriteSkipped {
                        table: write.table.clone(),
                        reason,
                    },
                );
                return;
            }
        };

        match backend.execute(&sql).map_err(MaterializeError::from) {
            Ok(returned) => {
                self.report.writes_executed += 1;
                let returned_id = returned.as_ref().and_then(StorageId::from_sql);
                self.log(
                    event,
                    WriteLogKind::Written {
                        table: sql.table.clone(),
                        returned: returned_id.clone(),
                    },
                );
                if write.returning.is_some() {
                    if let Some(id) = returned_id {
                        self.bind_returned_id(event, id);
                    }
                }
            }
            Err(reason) => {
                self.report.writes_skipped += 1;
                self.log(
                    event,
                    WriteLogKind::WriteSkipped {
                        table: sql.table.clone(),
                        reason,
                    },
                );
            }
        }
    }

    fn prepare_write(
        &self,
        event: &CanonicalEvent,
        write: &WriteSpec,
    ) -> Result<SqlWrite, MaterializeError> {
        let mut columns = Vec::with_capacity(write.columns.len());
        let mut values = Vec::with_capacity(write.columns.len());
        for (column, mapping) in &write.columns {
            let raw = resolve_source(event, write, &self.map, &mapping.source);
            let value = self.coerce(column, raw, mapping.type_hint)?;
            columns.push(column.clone());
            values.push(value);
        }
        Ok(SqlWrite {
            op: write.op,
            table: write.table.clone(),
            columns,
            values,
            returning: write.returning.clone(),
        })
    }

    fn coerce(
        &self,
        column: &str,
        raw: Value,
        hint: Option<TypeHint>,
    ) -> Result<SqlValue, MaterializeError> {
        match hint {
            Some(TypeHint::Fk) => self.coerce_fk(column, raw),
            Some(TypeHint::Json) => Ok(coerce_json(raw)),
            Some(TypeHint::Integer) => Ok(coerce_integer(raw)),
            Some(TypeHint::Boolean) => Ok(coerce_boolean(raw)),
            Some(TypeHint::Timestamp) => Ok(coerce_timestamp(raw)),
            Some(TypeHint::Text) | None => Ok(plain_value(raw)),
        }
    }

    /// Foreign keys: mapped synthetic ids become storage ids; bare numeric
    /// strings pass through as storage-native; anything else is an error
    /// scoped to this write.
    fn coerce_fk(&self, column: &str, raw: Value) -> Result<SqlValue, MaterializeError> {
        match raw {
            Value::String(synthetic) => {
                if let Some(id) = self.map.lookup(&synthetic) {
                    return Ok(id.to_sql());
                }
                if is_bare_numeric(&synthetic) {
                    return Ok(match synthetic.parse::<i64>() {
                        Ok(value) => SqlValue::Integer(value),
                        Err(_) => SqlValue::Text(synthetic),
                    });
                }
                Err(MaterializeError::UnmappedForeignKey {
                    column: column.to_string(),
                    value: synthetic,
                })
            }
            other => Ok(plain_value(other)),
        }
    }

    // ------------------------------------------------------------------
    // Bootstrap events
    // ------------------------------------------------------------------

    fn apply_bootstrap_event(&mut self, event: &CanonicalEvent, backend: &mut dyn StorageBackend) {
        let catalog = self.catalog;
        let bootstrap = match &catalog.bootstrap {
            Some(bootstrap) => bootstrap,
            None => {
                self.report.events_skipped += 1;
                self.log(
                    event,
                    WriteLogKind::EventSkipped {
                        reason: MaterializeError::MissingBootstrapConfig {
                            family: "bootstrap".to_string(),
                        },
                    },
                );
                return;
            }
        };

        let prepared = match event.action.as_str() {
            BOOTSTRAP_CREATE_USER => match &bootstrap.actors {
                Some(spec) => self.prepare_bootstrap_write(event, spec),
                None => Err(MaterializeError::MissingBootstrapConfig {
                    family: "actors".to_string(),
                }),
            },
            BOOTSTRAP_CREATE_SPACE => match &bootstrap.spaces {
                Some(spec) => self.prepare_bootstrap_write(event, spec),
                None => Err(MaterializeError::MissingBootstrapConfig {
                    family: "spaces".to_string(),
                }),
            },
            BOOTSTRAP_CREATE_MEMBERSHIP => match &bootstrap.memberships {
                Some(spec) => self.prepare_membership_write(event, spec),
                None => Err(MaterializeError::MissingBootstrapConfig {
                    family: "memberships".to_string(),
                }),
            },
            other => Err(MaterializeError::UnknownBootstrapAction {
                action: other.to_string(),
            }),
        };

        let sql = match prepared {
            Ok(sql) => sql,
            Err(reason) => {
                self.report.events_skipped += 1;
                self.log(event, WriteLogKind::EventSkipped { reason });
                return;
            }
        };

        match backend.execute(&sql).map_err(MaterializeError::from) {
            Ok(returned) => {
                self.report.writes_executed += 1;
                let returned_id = returned.as_ref().and_then(StorageId::from_sql);
                self.log(
                    event,
                    WriteLogKind::Written {
                        table: sql.table.clone(),
                        returned: returned_id.clone(),
                    },
                );
                if let Some(id) = returned_id {
                    self.bind_returned_id(event, id);
                }
            }
            Err(reason) => {
                self.report.writes_skipped += 1;
                self.log(
                    event,
                    WriteLogKind::WriteSkipped {
                        table: sql.table.clone(),
                        reason,
                    },
                );
            }
        }
    }

    /// Actor and space bootstrap rows share one column-resolution ladder; see
    /// [`resolve_bootstrap_source`]. Columns whose source resolves to nothing
    /// are left out of the insert entirely.
    fn prepare_bootstrap_write(
        &self,
        event: &CanonicalEvent,
        spec: &BootstrapTableSpec,
    ) -> Result<SqlWrite, MaterializeError> {
        let mut columns = Vec::new();
        let mut values = Vec::new();
        for (column, column_spec) in &spec.columns {
            let raw = match resolve_bootstrap_source(event, column, column_spec) {
                Some(raw) => raw,
                None => continue,
            };
            let value = self.coerce(column, raw, column_spec.type_hint)?;
            columns.push(column.clone());
            values.push(value);
        }
        Ok(SqlWrite {
            op: WriteOp::Insert,
            table: spec.table.clone(),
            columns,
            values,
            returning: Some(spec.returning.clone()),
        })
    }

    /// Membership rows have no column specs: metadata keys are used as column
    /// names directly. Values that look like entity references must already
    /// be bound; unprefixed values pass through as-is.
    fn prepare_membership_write(
        &self,
        event: &CanonicalEvent,
        spec: &MembershipTableSpec,
    ) -> Result<SqlWrite, MaterializeError> {
        let mut columns = Vec::new();
        let mut values = Vec::new();
        for (column, value) in &event.metadata {
            let resolved = match value {
                Value::String(text) if has_entity_prefix(text) => match self.map.lookup(text) {
                    Some(id) => id.to_sql(),
                    None => {
                        return Err(MaterializeError::UnmappedForeignKey {
                            column: column.clone(),
                            value: text.clone(),
                        })
                    }
                },
                other => plain_value(other.clone()),
            };
            columns.push(column.clone());
            values.push(resolved);
        }
        Ok(SqlWrite {
            op: WriteOp::Insert,
            table: spec.table.clone(),
            columns,
            values,
            returning: None,
        })
    }

    /// Binds the storage id under the event's reconciliation key: bootstrap
    /// events use their entity id (prefix stripped), simulated events their
    /// event id.
    fn bind_returned_id(&mut self, event: &CanonicalEvent, id: StorageId) {
        let key = match map_key_for(event) {
            Some(key) => key,
            None => return,
        };
        if self.map.bind(&key, id.clone()) {
            let bound_key = key.clone();
            self.log(event, WriteLogKind::Bound { key: bound_key, id });
        }
    }
}

// ============================================================================
// Source resolution and coercion
// ============================================================================

fn map_key_for(event: &CanonicalEvent) -> Option<String> {
    if event.actor_id == SYSTEM_ACTOR {
        if let Some(entity) = event.id.strip_prefix(BOOTSTRAP_USER_ID_PREFIX) {
            return Some(entity.to_string());
        }
        if let Some(entity) = event.id.strip_prefix(BOOTSTRAP_SPACE_ID_PREFIX) {
            return Some(entity.to_string());
        }
        return None;
    }
    Some(event.id.clone())
}

fn resolve_source(
    event: &CanonicalEvent,
    write: &WriteSpec,
    map: &ReconciliationMap,
    source: &ColumnSource,
) -> Value {
    match source {
        ColumnSource::ActorId => Value::String(event.actor_id.clone()),
        ColumnSource::ContextId => event
            .context_id
            .clone()
            .map(Value::String)
            .unwrap_or(Value::Null),
        ColumnSource::ParentId => event
            .parent_id
            .clone()
            .map(Value::String)
            .unwrap_or(Value::Null),
        ColumnSource::Content => event
            .content
            .clone()
            .map(Value::String)
            .unwrap_or(Value::Null),
        ColumnSource::Timestamp => Value::String(event.timestamp.to_rfc3339()),
        ColumnSource::Metadata(key) => event.metadata.get(key).cloned().unwrap_or(Value::Null),
        ColumnSource::IdMapRef(key) => map
            .lookup(key)
            .map(|id| id.to_value())
            .unwrap_or(Value::Null),
        ColumnSource::StaticRef(key) => {
            write.static_values.get(key).cloned().unwrap_or(Value::Null)
        }
        ColumnSource::Literal(text) => Value::String(text.clone()),
    }
}

/// Bootstrap column ladder, tried in order: a `{{key}}` transform against
/// metadata, a `metadata.key` path, the source as a metadata key, and finally
/// the column name itself as a metadata key.
fn resolve_bootstrap_source(
    event: &CanonicalEvent,
    column: &str,
    spec: &BootstrapColumnSpec,
) -> Option<Value> {
    let metadata = &event.metadata;
    if spec.source == "metadata" {
        if let Some(template) = &spec.transform {
            if let Some(key) = template
                .strip_prefix("{{")
                .and_then(|rest| rest.strip_suffix("}}"))
            {
                return metadata.get(key.trim()).cloned();
            }
        }
    }
    if let Some(key) = spec.source.strip_prefix("metadata.") {
        return metadata.get(key).cloned();
    }
    if let Some(value) = metadata.get(&spec.source) {
        return Some(value.clone());
    }
    metadata.get(column).cloned()
}

fn has_entity_prefix(value: &str) -> bool {
    ACTOR_REF_PREFIXES
        .iter()
        .chain(SPACE_REF_PREFIXES.iter())
        .any(|prefix| value.starts_with(prefix))
}

fn is_bare_numeric(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit())
}

/// `json` hint: objects and arrays are stringified, bare strings are wrapped
/// as `{"text": ...}` so the column always holds a JSON object or array.
fn coerce_json(raw: Value) -> SqlValue {
    match raw {
        Value::Null => SqlValue::Null,
        Value::String(text) => SqlValue::Text(serde_json::json!({ "text": text }).to_string()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn coerce_integer(raw: Value) -> SqlValue {
    match raw {
        Value::Number(number) => number
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| number.as_f64().map(|f| SqlValue::Integer(f as i64)))
            .unwrap_or(SqlValue::Null),
        Value::String(text) => {
            let trimmed = text.trim();
            trimmed
                .parse::<i64>()
                .map(SqlValue::Integer)
                .or_else(|_| trimmed.parse::<f64>().map(|f| SqlValue::Integer(f as i64)))
                .unwrap_or(SqlValue::Null)
        }
        Value::Bool(flag) => SqlValue::Integer(i64::from(flag)),
        _ => SqlValue::Null,
    }
}

/// Truthiness in the JavaScript sense: null, false, zero, and the empty
/// string are false, everything else is true.
fn coerce_boolean(raw: Value) -> SqlValue {
    match raw {
        Value::Null => SqlValue::Bool(false),
        Value::Bool(flag) => SqlValue::Bool(flag),
        Value::Number(number) => {
            SqlValue::Bool(number.as_f64().map(|f| f != 0.0).unwrap_or(true))
        }
        Value::String(text) => SqlValue::Bool(!text.is_empty()),
        _ => SqlValue::Bool(true),
    }
}

fn coerce_timestamp(raw: Value) -> SqlValue {
    match raw {
        Value::String(text) => SqlValue::Text(text),
        other => plain_value(other),
    }
}

fn plain_value(raw: Value) -> SqlValue {
    match raw {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Bool(flag),
        Value::Number(number) => number
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| number.as_f64().map(SqlValue::Real))
            .unwrap_or(SqlValue::Null),
        Value::String(text) => SqlValue::Text(text),
        other => SqlValue::Text(other.to_string()),
    }
}
