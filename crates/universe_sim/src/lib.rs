pub mod catalog;
pub mod materialize;
pub mod sim;
pub mod universe;

pub use catalog::{
    ActionCatalog, ActionKind, ActionSpec, BootstrapColumnSpec, BootstrapSpec, BootstrapTableSpec,
    CatalogError, ColumnMapping, ColumnSource, MembershipTableSpec, SpaceTypeSpec, TypeHint,
    VisibilityComputation, WriteOp, WriteSpec, DEFAULT_RECIPIENT_FIELD, DEFAULT_SPACE_FIELD,
};

pub use universe::{
    AgentId, AgentSeed, Membership, MembershipRegistry, SeedIssue, SpaceId, SpaceSeed,
    UniverseError, UniverseState,
};

// Turn pipeline (select → propose → resolve → append)
pub use sim::{
    can_observe, compute_visibility, parse_oracle_reply, ActionBrief, ActionOracle,
    CanonicalEvent, ContextFault, EventId, EventLog, EventView, OpenAiChatOracle,
    OracleClientError, OracleConfig, OracleConfigError, OracleReply, PersistError, RunArtifact,
    RunMetrics, SideEffect, SimConfig, SimKernel, SimRunner, SpaceBrief, TurnError, TurnLogEntry,
    TurnLogKind, TurnNote, TurnOutcome, TurnReceipt, TurnRequest, VisibilityNote,
    VisibilityOutcome, DEFAULT_CONFIG_FILE_NAME, DEFAULT_HISTORY_WINDOW,
    DEFAULT_ORACLE_TIMEOUT_MS, ENV_ORACLE_API_KEY, ENV_ORACLE_BASE_URL, ENV_ORACLE_MODEL,
    ENV_ORACLE_TIMEOUT_MS, RUN_ARTIFACT_VERSION,
};

// Write side (events → service tables)
pub use materialize::{
    bootstrap_events, is_bootstrap_event, render_sql, MaterializeError, MaterializeReport,
    Materializer, ReconciliationMap, SqlValue, SqlWrite, SqliteBackend, StorageBackend,
    StorageError, StorageId, WriteLogEntry, WriteLogKind, SYSTEM_ACTOR,
};
