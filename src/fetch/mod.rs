//! FX-020: Source acquisition into a scoped temporary tree.
//!
//! `source_url` decides the fetcher: git URLs are shallow-cloned, archive
//! URLs are downloaded and unpacked, anything else is a local directory.
//! The tree lives in a [`tempfile::TempDir`] and is removed when the
//! [`SourceTree`] drops, unless the driver calls [`SourceTree::keep`].

pub mod archive;
pub mod git;
pub mod local;

use crate::core::error::StageError;
use crate::core::types::{PackageDescriptor, Stage};
use crate::exec::{Deadline, ExecError, LocalShell};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How a `source_url` is retrieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Git,
    Archive(ArchiveFormat),
    LocalDir,
}

/// Supported archive containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Tar,
    TarGz,
    TarBz2,
    TarZst,
    Zip,
}

impl ArchiveFormat {
    /// Detect from a file name or URL path.
    pub fn detect(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        [
            (".tar.gz", Self::TarGz),
            (".tgz", Self::TarGz),
            (".tar.bz2", Self::TarBz2),
            (".tbz2", Self::TarBz2),
            (".tbz", Self::TarBz2),
            (".tar.zst", Self::TarZst),
            (".tzst", Self::TarZst),
            (".tar", Self::Tar),
            (".zip", Self::Zip),
        ]
        .into_iter()
        .find(|(ext, _)| lower.ends_with(ext))
        .map(|(_, fmt)| fmt)
    }
}

/// Classify a source URL.
pub fn classify(url: &str) -> SourceKind {
    let lower = url.trim().to_ascii_lowercase();
    let path_part = lower.split(['?', '#']).next().unwrap_or_default();

    if let Some(fmt) = ArchiveFormat::detect(path_part) {
        return SourceKind::Archive(fmt);
    }
    if lower.starts_with("git+")
        || lower.starts_with("git://")
        || lower.starts_with("git@")
        || lower.starts_with("ssh://")
        || path_part.ends_with(".git")
        || lower.starts_with("http://")
        || lower.starts_with("https://")
    {
        return SourceKind::Git;
    }
    SourceKind::LocalDir
}

/// Strip a `file://` scheme, leaving a filesystem path.
pub fn local_path(url: &str) -> &str {
    url.trim().strip_prefix("file://").unwrap_or(url.trim())
}

/// Map a process failure during fetch to the stage taxonomy.
pub(crate) fn exec_failure(url: &str, deadline: &Deadline, err: ExecError) -> StageError {
    match err {
        ExecError::TimedOut(waited) => StageError::Timeout {
            stage: Stage::Fetching,
            limit: deadline.limit().unwrap_or(waited),
        },
        other => StageError::fetch(url, other.to_string()),
    }
}

/// Deadline check between in-process steps.
pub(crate) fn check_deadline(deadline: &Deadline) -> Result<(), StageError> {
    match deadline.limit() {
        Some(limit) if deadline.expired() => Err(StageError::Timeout {
            stage: Stage::Fetching,
            limit,
        }),
        _ => Ok(()),
    }
}

/// Source-fetch capability keyed by `source_url`.
pub trait SourceFetcher: Sync {
    /// Populate `dest` (which does not exist yet) with the source tree.
    fn fetch(
        &self,
        descriptor: &PackageDescriptor,
        dest: &Path,
        deadline: Deadline,
    ) -> Result<(), StageError>;
}

/// git + curl + in-process unpacking, run through the local shell.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFetcher;

impl SourceFetcher for DefaultFetcher {
    fn fetch(
        &self,
        descriptor: &PackageDescriptor,
        dest: &Path,
        deadline: Deadline,
    ) -> Result<(), StageError> {
        match classify(&descriptor.source_url) {
            SourceKind::Git => git::clone(&LocalShell, descriptor, dest, &deadline),
            SourceKind::Archive(fmt) => {
                archive::fetch_archive(&LocalShell, descriptor, fmt, dest, &deadline)
            }
            SourceKind::LocalDir => local::copy_source(descriptor, dest, &deadline),
        }
    }
}

/// A fetched source tree, removed on drop.
#[derive(Debug)]
pub struct SourceTree {
    dir: Option<tempfile::TempDir>,
    root: PathBuf,
}

impl SourceTree {
    /// Root of the fetched sources (the build's working directory).
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Opt out of cleanup; returns the retained root.
    pub fn keep(mut self) -> PathBuf {
        if let Some(dir) = self.dir.take() {
            let _ = dir.keep();
        }
        self.root
    }
}

/// Acquire a scoped temporary directory and fetch the descriptor into it.
/// Any failure releases the directory before returning.
pub fn acquire(
    fetcher: &dyn SourceFetcher,
    descriptor: &PackageDescriptor,
    timeout: Option<Duration>,
) -> Result<SourceTree, StageError> {
    let prefix = format!("formulary-{}-", sanitize(&descriptor.name));
    let dir = tempfile::Builder::new()
        .prefix(&prefix)
        .tempdir()
        .map_err(|e| {
            StageError::fetch(
                &descriptor.source_url,
                format!("cannot create temporary directory: {}", e),
            )
        })?;
    let root = dir.path().join("src");

    fetcher.fetch(descriptor, &root, Deadline::after(timeout))?;

    if !root.is_dir() {
        return Err(StageError::fetch(
            &descriptor.source_url,
            "fetch produced no source tree",
        ));
    }

    Ok(SourceTree {
        dir: Some(dir),
        root,
    })
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
