//! FX-016: Drift detection against receipt hashes.

use crate::core::types::InstallReceipt;
use crate::tripwire::hasher;
use std::path::Path;

/// A single drift finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftFinding {
    pub package: String,
    pub path: String,
    pub expected_hash: String,
    pub actual_hash: String,
    pub detail: String,
}

/// Check one installed file against its recorded hash.
pub fn check_file_drift(package: &str, path: &str, expected_hash: &str) -> Option<DriftFinding> {
    let file_path = Path::new(path);
    let finding = |actual: String, detail: String| DriftFinding {
        package: package.to_string(),
        path: path.to_string(),
        expected_hash: expected_hash.to_string(),
        actual_hash: actual,
        detail,
    };

    if !file_path.is_file() {
        return Some(finding(
            "MISSING".to_string(),
            format!("{} does not exist", path),
        ));
    }

    match hasher::hash_file(file_path) {
        Ok(actual) if actual == expected_hash => None,
        Ok(actual) => Some(finding(actual, format!("{} content changed", path))),
        Err(e) => Some(finding(
            format!("ERROR:{}", e),
            format!("{} is unreadable", path),
        )),
    }
}

/// Check every file a receipt recorded.
pub fn detect_drift(receipt: &InstallReceipt) -> Vec<DriftFinding> {
    receipt
        .files
        .iter()
        .filter_map(|(path, entry)| check_file_drift(&receipt.name, path, &entry.hash))
        .collect()
}
