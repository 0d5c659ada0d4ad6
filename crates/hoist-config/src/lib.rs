#![deny(clippy::all)]
//! Configuration documents.
//!
//! Two documents feed the orchestrator: the workspace configuration (global
//! task definitions, lockfile location, workspace policy) and an optional
//! per-package `tasks` block embedded in each package's manifest. Validation
//! reports the precise key path of any offending value.

mod raw;

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
pub use raw::{RawTaskDefinition, TaskDefinitions};
use serde::{Deserialize, Serialize};

pub const SUPPORTED_SCHEMA_VERSION: u32 = 1;

/// The workspace-level configuration document.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WorkspaceConfig {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// Identity of the package manager the workspace uses (`npm`, `pnpm`,
    /// ...). Informational; the orchestrator never invokes it directly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_manager: Option<String>,
    /// Workspace-relative path of the package manager's lockfile. Its
    /// content hash is part of every task fingerprint.
    pub lockfile: Utf8PathBuf,
    #[serde(default)]
    pub tasks: TaskDefinitions,
    /// When present, dependency references to task names outside this list
    /// are dropped during resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_references: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<Utf8PathBuf>,
}

fn default_schema_version() -> u32 {
    SUPPORTED_SCHEMA_VERSION
}

impl WorkspaceConfig {
    pub fn load(path: &Utf8Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::parse(&contents, path)
    }

    pub fn parse(contents: &str, path: &Utf8Path) -> Result<Self, Error> {
        let config: WorkspaceConfig =
            serde_json::from_str(contents).map_err(|source| Error::Json {
                path: path.to_owned(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.schema_version != SUPPORTED_SCHEMA_VERSION {
            return Err(Error::UnsupportedSchemaVersion {
                found: self.schema_version,
            });
        }
        if self.lockfile.as_str().is_empty() {
            return Err(Error::InvalidValue {
                key_path: "lockfile".to_owned(),
                reason: "lockfile path is empty".to_owned(),
            });
        }
        validate_task_definitions(&self.tasks, "tasks", DocumentKind::Workspace)
    }

    /// Stable hash of the global definitions, used as a component of the
    /// resolver's memoization key.
    pub fn global_definitions_hash(&self) -> String {
        let serialized =
            serde_json::to_string(&self.tasks).expect("task definitions serialize to JSON");
        hoist_hash::hash_bytes(serialized.as_bytes())
    }
}

/// Which document a definition block came from. Workspace-level definitions
/// may not use the `...` sentinel (there is nothing to inherit from).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Workspace,
    Package,
}

/// Validate a `tasks` block, reporting errors with key paths rooted at
/// `prefix` (`tasks.build.dependsOn[1]`).
pub fn validate_task_definitions(
    tasks: &TaskDefinitions,
    prefix: &str,
    kind: DocumentKind,
) -> Result<(), Error> {
    for (name, definition) in tasks {
        definition.validate(&format!("{prefix}.{name}"), kind)?;
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path} is not a valid configuration document: {source}")]
    Json {
        path: Utf8PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(
        "unsupported configuration schema version {found}, this version of hoist supports \
         {SUPPORTED_SCHEMA_VERSION}"
    )]
    UnsupportedSchemaVersion { found: u32 },
    #[error("invalid value at `{key_path}`: {reason}")]
    InvalidValue { key_path: String, reason: String },
}
