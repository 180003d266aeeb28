//! FX-007: Error taxonomy for catalogs and install runs.

use super::parser::Violation;
use super::types::Stage;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Why a stage of an install run failed.
#[derive(Debug, Error)]
pub enum StageError {
    /// Malformed descriptor, detected before any I/O.
    #[error("invalid descriptor: {}", join_violations(.violations))]
    Validation { violations: Vec<Violation> },

    /// Source unreachable or corrupt.
    #[error("cannot fetch {url}: {reason}")]
    Fetch { url: String, reason: String },

    /// Build command exited non-zero.
    #[error("build exited with code {exit_code}")]
    Build {
        exit_code: i32,
        captured_output: String,
    },

    /// Missing artifact or unwritable destination.
    #[error("cannot install {}: {reason}", .path.display())]
    Install { path: PathBuf, reason: String },

    /// Stage exceeded its caller-supplied bound.
    #[error("{stage} exceeded its {}s timeout", .limit.as_secs())]
    Timeout { stage: Stage, limit: Duration },
}

impl StageError {
    /// Short taxonomy name, as reported to the driver.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "ValidationError",
            Self::Fetch { .. } => "FetchError",
            Self::Build { .. } => "BuildError",
            Self::Install { .. } => "InstallError",
            Self::Timeout { .. } => "TimeoutError",
        }
    }

    pub(crate) fn fetch(url: &str, reason: impl Into<String>) -> Self {
        Self::Fetch {
            url: url.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn install(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Install {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn version_suffix(version: &Option<String>) -> String {
    version
        .as_deref()
        .map(|v| format!(" at version '{}'", v))
        .unwrap_or_default()
}

/// Catalog and receipt loading failures.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML error: {0}")]
    Parse(#[from] serde_yaml_ng::Error),

    #[error("{count} validation error(s)")]
    Invalid { count: usize },

    #[error("no package '{name}'{}", version_suffix(.version))]
    NotFound {
        name: String,
        version: Option<String>,
    },
}
