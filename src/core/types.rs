//! FX-001: Catalog, descriptor, run and receipt types.
//!
//! Defines the YAML schema for package catalogs and descriptors, the run
//! state machine, installed layouts, receipts, and provenance events. All
//! persisted types derive Serialize/Deserialize for YAML/JSON roundtripping.

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::PathBuf;

// ============================================================================
// Top-level formulary.yaml
// ============================================================================

/// A catalog of package descriptors, as maintained by the driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogFile {
    /// Schema version (must be "1.0")
    pub version: String,

    /// Catalog name (e.g. a tap)
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Execution policy
    #[serde(default)]
    pub policy: Policy,

    /// Descriptor revisions, in declaration order
    #[serde(default)]
    pub packages: Vec<PackageDescriptor>,
}

// ============================================================================
// Descriptors
// ============================================================================

/// How to fetch, build, and install one package revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageDescriptor {
    /// Package name, unique per version within a catalog
    pub name: String,

    /// Revision label; YAML numbers are kept in their textual form
    #[serde(default, deserialize_with = "version_label")]
    pub version: String,

    /// Informational homepage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,

    /// Informational description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Where to fetch source from (VCS URL, archive URL, file:// or path)
    #[serde(default, alias = "sourceURL")]
    pub source_url: String,

    /// Expected SHA-256 of a downloaded archive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,

    /// Git branch or tag to clone
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,

    /// Descriptors that must be installed first (declared, not resolved)
    #[serde(default)]
    pub dependencies: IndexSet<String>,

    /// Shell instruction run inside the fetched source tree
    #[serde(default, alias = "buildCommand")]
    pub build_command: String,

    /// Opaque build-environment selection handed to the command runner
    #[serde(
        default,
        alias = "buildEnvironment",
        skip_serializing_if = "Option::is_none"
    )]
    pub build_environment: Option<String>,

    /// Artifact mappings, applied in order
    #[serde(default, alias = "installMappings")]
    pub install: Vec<InstallMapping>,
}

impl PackageDescriptor {
    /// `name@version`, or just the name when the version is empty.
    pub fn label(&self) -> String {
        if self.version.is_empty() {
            self.name.clone()
        } else {
            format!("{}@{}", self.name, self.version)
        }
    }
}

/// One (sourcePath, destinationCategory) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallMapping {
    /// Path (or glob) relative to the source tree
    #[serde(alias = "sourcePath")]
    pub source: String,

    /// Category resolved to a concrete directory by the driver
    #[serde(alias = "destinationCategory")]
    pub destination: DestinationCategory,
}

/// Symbolic classification of an installed artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationCategory {
    Binary,
    #[serde(alias = "sharedResources")]
    SharedResources,
}

impl fmt::Display for DestinationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Binary => write!(f, "binary"),
            Self::SharedResources => write!(f, "shared_resources"),
        }
    }
}

fn version_label<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_yaml_ng::Value::deserialize(deserializer)?;
    Ok(yaml_value_to_string(&value))
}

// ============================================================================
// Policy
// ============================================================================

/// Execution policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Upper bound for the fetch stage
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Upper bound for the build stage
    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,

    /// Retain the fetched source tree after the run (debugging)
    #[serde(default)]
    pub keep_source: bool,

    /// What to do with already-copied mappings when install fails
    #[serde(default)]
    pub install: InstallPolicy,

    /// Write the JSONL provenance log
    #[serde(default = "default_true")]
    pub tripwire: bool,

    /// Persist an install receipt after a successful run
    #[serde(default = "default_true")]
    pub receipts: bool,

    /// Run independent descriptors on worker threads
    #[serde(default)]
    pub parallel_packages: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: default_fetch_timeout(),
            build_timeout_secs: default_build_timeout(),
            keep_source: false,
            install: InstallPolicy::default(),
            tripwire: true,
            receipts: true,
            parallel_packages: false,
        }
    }
}

impl Policy {
    /// Fetch bound; zero means unbounded.
    pub fn fetch_timeout(&self) -> Option<std::time::Duration> {
        non_zero_secs(self.fetch_timeout_secs)
    }

    /// Build bound; zero means unbounded.
    pub fn build_timeout(&self) -> Option<std::time::Duration> {
        non_zero_secs(self.build_timeout_secs)
    }
}

fn non_zero_secs(secs: u64) -> Option<std::time::Duration> {
    (secs > 0).then(|| std::time::Duration::from_secs(secs))
}

fn default_fetch_timeout() -> u64 {
    600
}

fn default_build_timeout() -> u64 {
    1800
}

fn default_true() -> bool {
    true
}

/// Install failure handling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallPolicy {
    /// Already-copied mappings stay in place.
    #[default]
    NoRollback,
    /// Touched destinations are restored on failure.
    Rollback,
}

// ============================================================================
// Run state machine
// ============================================================================

/// A stage of one install run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validating,
    Fetching,
    Building,
    Installing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validating => write!(f, "validating"),
            Self::Fetching => write!(f, "fetching"),
            Self::Building => write!(f, "building"),
            Self::Installing => write!(f, "installing"),
        }
    }
}

/// States of one install run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Loaded,
    Fetching,
    Fetched,
    Building,
    Built,
    Installing,
    Installed,
    Failed { stage: Stage },
}

impl RunState {
    /// Installed and Failed accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Installed | Self::Failed { .. })
    }

    /// The stage a failure in this state belongs to.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Loaded => Some(Stage::Validating),
            Self::Fetching => Some(Stage::Fetching),
            Self::Building => Some(Stage::Building),
            Self::Installing => Some(Stage::Installing),
            Self::Fetched | Self::Built | Self::Installed => None,
            Self::Failed { stage } => Some(*stage),
        }
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(&self, next: &RunState) -> bool {
        match (self, next) {
            (Self::Loaded, Self::Fetching)
            | (Self::Fetching, Self::Fetched)
            | (Self::Fetched, Self::Building)
            | (Self::Building, Self::Built)
            | (Self::Built, Self::Installing)
            | (Self::Installing, Self::Installed) => true,
            (s, Self::Failed { .. }) => !s.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loaded => write!(f, "LOADED"),
            Self::Fetching => write!(f, "FETCHING"),
            Self::Fetched => write!(f, "FETCHED"),
            Self::Building => write!(f, "BUILDING"),
            Self::Built => write!(f, "BUILT"),
            Self::Installing => write!(f, "INSTALLING"),
            Self::Installed => write!(f, "INSTALLED"),
            Self::Failed { stage } => write!(f, "FAILED({})", stage),
        }
    }
}

// ============================================================================
// Installed layout
// ============================================================================

/// One file written under the prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledFile {
    /// Index of the mapping that last wrote this file
    pub mapping: usize,

    /// Mapping source as written in the descriptor
    pub source: String,

    /// Category of that mapping
    pub category: DestinationCategory,

    /// Absolute destination path
    pub path: PathBuf,

    /// BLAKE3 hash of the installed content
    pub hash: String,
}

/// Result of a successful install stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledLayout {
    pub prefix: PathBuf,
    pub files: Vec<InstalledFile>,
}

impl InstalledLayout {
    /// Composite hash over every (path, hash) pair, in layout order.
    pub fn digest(&self) -> String {
        let parts: Vec<String> = self
            .files
            .iter()
            .map(|f| format!("{}={}", f.path.display(), f.hash))
            .collect();
        let refs: Vec<&str> = parts.iter().map(String::as_str).collect();
        crate::tripwire::hasher::composite_hash(&refs)
    }
}

// ============================================================================
// Receipts
// ============================================================================

/// Persisted record of an installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallReceipt {
    /// Schema version
    pub schema: String,

    /// Package name
    pub name: String,

    /// Installed revision
    pub version: String,

    /// Source the revision was built from
    pub source_url: String,

    /// Installation prefix
    pub prefix: PathBuf,

    /// When the install completed
    pub installed_at: String,

    /// Generator version
    pub generator: String,

    /// Composite hash of the layout
    pub layout_hash: String,

    /// Per-file entries keyed by absolute path (order-preserving)
    pub files: IndexMap<String, FileReceipt>,
}

/// Per-file receipt entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReceipt {
    pub source: String,
    pub category: DestinationCategory,
    pub hash: String,
}

// ============================================================================
// Provenance events
// ============================================================================

/// Provenance event for the JSONL event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProvenanceEvent {
    RunStarted {
        package: String,
        version: String,
        run_id: String,
        formulary_version: String,
    },
    StageStarted {
        package: String,
        stage: Stage,
    },
    StageCompleted {
        package: String,
        stage: Stage,
        duration_seconds: f64,
    },
    StageFailed {
        package: String,
        stage: Stage,
        error: String,
    },
    RunCompleted {
        package: String,
        version: String,
        run_id: String,
        state: RunState,
        files_installed: u32,
        total_seconds: f64,
    },
    DriftDetected {
        package: String,
        path: String,
        expected_hash: String,
        actual_hash: String,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: ProvenanceEvent,
}

// ============================================================================
// YAML helper
// ============================================================================

/// Convert a serde_yaml_ng::Value to a string (version labels, display).
pub fn yaml_value_to_string(val: &serde_yaml_ng::Value) -> String {
    match val {
        serde_yaml_ng::Value::String(s) => s.clone(),
        serde_yaml_ng::Value::Number(n) => n.to_string(),
        serde_yaml_ng::Value::Bool(b) => b.to_string(),
        serde_yaml_ng::Value::Null => String::new(),
        other => format!("{:?}", other),
    }
}

// ============================================================================
// Tests
// ============================================================================
