//! FX-013: Install receipts: load, save (atomic), list.
//!
//! The descriptor is discarded after a run; the receipt records the
//! filesystem layout it produced so later runs can verify it.

use super::error::CatalogError;
use super::types::{FileReceipt, InstallReceipt, InstalledLayout, PackageDescriptor};
use crate::tripwire::eventlog::{now_iso8601, package_dir};
use indexmap::IndexMap;
use std::path::{Path, PathBuf};

/// Derive the receipt path for a package within the state directory.
pub fn receipt_path(state_dir: &Path, package: &str) -> PathBuf {
    package_dir(state_dir, package).join("receipt.yaml")
}

/// Build a receipt for a completed install.
pub fn new_receipt(descriptor: &PackageDescriptor, layout: &InstalledLayout) -> InstallReceipt {
    let files: IndexMap<String, FileReceipt> = layout
        .files
        .iter()
        .map(|f| {
            (
                f.path.display().to_string(),
                FileReceipt {
                    source: f.source.clone(),
                    category: f.category,
                    hash: f.hash.clone(),
                },
            )
        })
        .collect();

    InstallReceipt {
        schema: "1.0".to_string(),
        name: descriptor.name.clone(),
        version: descriptor.version.clone(),
        source_url: descriptor.source_url.clone(),
        prefix: layout.prefix.clone(),
        installed_at: now_iso8601(),
        generator: format!("formulary {}", env!("CARGO_PKG_VERSION")),
        layout_hash: layout.digest(),
        files,
    }
}

/// Load a package's receipt. Returns None if it was never installed.
pub fn load_receipt(state_dir: &Path, package: &str) -> Result<Option<InstallReceipt>, CatalogError> {
    let path = receipt_path(state_dir, package);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path).map_err(|e| CatalogError::Read {
        path: path.clone(),
        source: e,
    })?;
    Ok(Some(serde_yaml_ng::from_str(&content)?))
}

/// Save a receipt atomically (write to temp, then rename).
pub fn save_receipt(state_dir: &Path, receipt: &InstallReceipt) -> Result<(), CatalogError> {
    let path = receipt_path(state_dir, &receipt.name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| CatalogError::Write {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    let yaml = serde_yaml_ng::to_string(receipt)?;

    let tmp_path = path.with_extension("yaml.tmp");
    std::fs::write(&tmp_path, &yaml).map_err(|e| CatalogError::Write {
        path: tmp_path.clone(),
        source: e,
    })?;
    std::fs::rename(&tmp_path, &path).map_err(|e| CatalogError::Write {
        path: path.clone(),
        source: e,
    })?;

    Ok(())
}

/// Every receipt in the state directory, sorted by package name.
pub fn list_receipts(state_dir: &Path) -> Result<Vec<InstallReceipt>, CatalogError> {
    if !state_dir.exists() {
        return Ok(Vec::new());
    }
    let entries = std::fs::read_dir(state_dir).map_err(|e| CatalogError::Read {
        path: state_dir.to_path_buf(),
        source: e,
    })?;

    let mut names: Vec<String> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    names.sort();

    let mut receipts = Vec::new();
    for name in names {
        if let Some(receipt) = load_receipt(state_dir, &name)? {
            receipts.push(receipt);
        }
    }
    Ok(receipts)
}
