//! Persistence: the versioned run artifact.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

use crate::universe::UniverseState;

use super::event::CanonicalEvent;

pub const RUN_ARTIFACT_VERSION: u32 = 1;

// ============================================================================
// Run Artifact
// ============================================================================

fn default_artifact_version() -> u32 {
    RUN_ARTIFACT_VERSION
}

/// Everything a finished run needs to be replayed or materialized later: the
/// universe as it ended up (including spaces created mid-run) and the ordered
/// event list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunArtifact {
    #[serde(default = "default_artifact_version")]
    pub version: u32,
    pub universe: UniverseState,
    pub events: Vec<CanonicalEvent>,
}

impl RunArtifact {
    pub fn new(universe: UniverseState, events: Vec<CanonicalEvent>) -> Self {
        Self {
            version: RUN_ARTIFACT_VERSION,
            universe,
            events,
        }
    }

    pub fn to_json(&self) -> Result<String, PersistError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(input: &str) -> Result<Self, PersistError> {
        let artifact: Self = serde_json::from_str(input)?;
        artifact.validate_version()?;
        Ok(artifact)
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<(), PersistError> {
        write_json_to_path(self, path.as_ref())
    }

    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        let artifact: Self = read_json_from_path(path.as_ref())?;
        artifact.validate_version()?;
        Ok(artifact)
    }

    pub(crate) fn validate_version(&self) -> Result<(), PersistError> {
        if self.version == RUN_ARTIFACT_VERSION {
            Ok(())
        } else {
            Err(PersistError::UnsupportedVersion {
                kind: "run_artifact".to_string(),
                version: self.version,
                expected: RUN_ARTIFACT_VERSION,
            })
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistError {
    Io(String),
    Serde(String),
    UnsupportedVersion {
        kind: String,
        version: u32,
        expected: u32,
    },
}

impl From<io::Error> for PersistError {
    fn from(err: io::Error) -> Self {
        PersistError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for PersistError {
    fn from(err: serde_json::Error) -> Self {
        PersistError::Serde(err.to_string())
    }
}

// ============================================================================
// Helper functions
// ============================================================================

pub(crate) fn write_json_to_path<T: Serialize>(value: &T, path: &Path) -> Result<(), PersistError> {
    let data = serde_json::to_vec_pretty(value)?;
    fs::write(path, data)?;
    Ok(())
}

pub(crate) fn read_json_from_path<T: DeserializeOwned>(path: &Path) -> Result<T, PersistError> {
    let data = fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}
