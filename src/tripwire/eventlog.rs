//! FX-015: Append-only JSONL provenance log and build logs, per package.

use crate::core::types::{ProvenanceEvent, TimestampedEvent};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Generate an ISO 8601 UTC timestamp.
pub fn now_iso8601() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format_utc(secs)
}

/// Format seconds since the epoch as `YYYY-MM-DDTHH:MM:SSZ`.
fn format_utc(secs: u64) -> String {
    let days = (secs / 86400) as i64;
    let rem = secs % 86400;
    let (y, m, d) = civil_from_days(days);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        y,
        m,
        d,
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

/// Days since 1970-01-01 to a proleptic Gregorian (year, month, day).
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let y = yoe + era * 400 + i64::from(m <= 2);
    (y, m, d)
}

/// Generate a run ID.
pub fn generate_run_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("r-{:012x}", nanos & 0xFFFF_FFFF_FFFF)
}

/// Per-package directory inside the state directory.
pub fn package_dir(state_dir: &Path, package: &str) -> PathBuf {
    state_dir.join(package)
}

/// Derive the event log path for a package.
pub fn event_log_path(state_dir: &Path, package: &str) -> PathBuf {
    package_dir(state_dir, package).join("events.jsonl")
}

/// Derive the build log path for a package.
pub fn build_log_path(state_dir: &Path, package: &str) -> PathBuf {
    package_dir(state_dir, package).join("build.log")
}

/// Append an event to the package's event log.
pub fn append_event(
    state_dir: &Path,
    package: &str,
    event: ProvenanceEvent,
) -> std::io::Result<()> {
    let path = event_log_path(state_dir, package);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let te = TimestampedEvent {
        ts: now_iso8601(),
        event,
    };
    let json = serde_json::to_string(&te).map_err(std::io::Error::other)?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    writeln!(file, "{}", json)
}

/// Replace the package's build log with the latest build output.
pub fn write_build_log(state_dir: &Path, package: &str, output: &str) -> std::io::Result<()> {
    let path = build_log_path(state_dir, package);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, output)
}

/// Read back every event for a package (missing log = no events).
pub fn read_events(state_dir: &Path, package: &str) -> std::io::Result<Vec<TimestampedEvent>> {
    let path = event_log_path(state_dir, package);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(&path)?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(std::io::Error::other))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Stage;

    #[test]
    fn test_fx015_now_iso8601() {
        let ts = now_iso8601();
        assert!(ts.starts_with("20"));
        assert!(ts.ends_with('Z'));
        assert_eq!(ts.len(), 20);
    }

    #[test]
    fn test_fx015_format_utc_known_dates() {
        assert_eq!(format_utc(0), "1970-01-01T00:00:00Z");
        assert_eq!(format_utc(951_782_400), "2000-02-29T00:00:00Z");
        assert_eq!(format_utc(1_709_251_199), "2024-02-29T23:59:59Z");
        assert_eq!(format_utc(1_792_368_000), "2026-10-19T00:00:00Z");
    }

    #[test]
    fn test_fx015_civil_from_days_century_rules() {
        // 1900 is not a leap year, 2000 is
        assert_eq!(civil_from_days(-25_508), (1900, 3, 1));
        assert_eq!(civil_from_days(11_016), (2000, 2, 29));
        assert_eq!(civil_from_days(11_017), (2000, 3, 1));
    }

    #[test]
    fn test_fx015_generate_run_id() {
        let id = generate_run_id();
        assert!(id.starts_with("r-"));
        assert_eq!(id.len(), 14);
    }

    #[test]
    fn test_fx015_paths() {
        let state = Path::new("/state");
        assert_eq!(
            event_log_path(state, "slang"),
            PathBuf::from("/state/slang/events.jsonl")
        );
        assert_eq!(
            build_log_path(state, "slang"),
            PathBuf::from("/state/slang/build.log")
        );
    }

    #[test]
    fn test_fx015_append_and_read_events() {
        let dir = tempfile::tempdir().unwrap();
        for stage in [Stage::Fetching, Stage::Building] {
            append_event(
                dir.path(),
                "slang",
                ProvenanceEvent::StageStarted {
                    package: "slang".to_string(),
                    stage,
                },
            )
            .unwrap();
        }
        let content = std::fs::read_to_string(dir.path().join("slang/events.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("stage_started"));

        let events = read_events(dir.path(), "slang").unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1].event,
            ProvenanceEvent::StageStarted {
                stage: Stage::Building,
                ..
            }
        ));
    }

    #[test]
    fn test_fx015_read_events_missing_log() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_events(dir.path(), "ghost").unwrap().is_empty());
    }

    #[test]
    fn test_fx015_build_log_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        write_build_log(dir.path(), "slang", "first").unwrap();
        write_build_log(dir.path(), "slang", "second").unwrap();
        let log = std::fs::read_to_string(build_log_path(dir.path(), "slang")).unwrap();
        assert_eq!(log, "second");
    }
}
