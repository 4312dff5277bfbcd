//! Simulation module - turn scheduling, visibility, oracle seam, persistence.
//!
//! This module is organized into submodules:
//! - `event`: CanonicalEvent and the append-only EventLog
//! - `visibility`: who observes an event, and why
//! - `oracle`: the ActionOracle trait and the chat-completions client
//! - `kernel`: SimKernel, the per-turn state machine
//! - `runner`: SimRunner, multi-turn driver with logs and metrics
//! - `persist`: the versioned run artifact

mod event;
mod kernel;
mod oracle;
mod persist;
mod runner;
mod visibility;


// Re-export all public types
pub use event::{CanonicalEvent, EventId, EventLog, EventView};
pub use kernel::{
    ContextFault, SideEffect, SimConfig, SimKernel, TurnError, TurnNote, TurnReceipt,
    CONTENT_PREVIEW_CHARS, DEFAULT_HISTORY_WINDOW, DEFAULT_RECIPIENT_SAMPLE,
    DEFAULT_START_OFFSET_DAYS, FALLBACK_SPACE_NAME, FALLBACK_SPACE_TYPE, GLOBAL_HISTORY_TAIL,
};
pub use oracle::{
    parse_oracle_reply, ActionBrief, ActionOracle, OpenAiChatOracle, OracleClientError,
    OracleConfig, OracleConfigError, OracleReply, SpaceBrief, TurnRequest,
    DEFAULT_CONFIG_FILE_NAME, DEFAULT_ORACLE_TEMPERATURE, DEFAULT_ORACLE_TIMEOUT_MS,
    ENV_ORACLE_API_KEY, ENV_ORACLE_BASE_URL, ENV_ORACLE_MODEL, ENV_ORACLE_TIMEOUT_MS,
};
pub use persist::{PersistError, RunArtifact, RUN_ARTIFACT_VERSION};
pub use runner::{RunMetrics, SimRunner, TurnLogEntry, TurnLogKind, TurnOutcome};
pub use visibility::{can_observe, compute_visibility, VisibilityNote, VisibilityOutcome};
