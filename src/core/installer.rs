//! FX-030: Install stage: copy built artifacts into the prefix.
//!
//! Mappings are applied in declaration order. A file source lands at
//! `<dir>/<basename>`; a directory source has its contents merged into
//! `<dir>`. When two mappings write the same destination the later one
//! wins. Sources containing glob metacharacters expand to every match,
//! in sorted order; a glob with no matches is an error.
//!
//! Under [`InstallPolicy::Rollback`] every destination is journaled on
//! first touch and restored if a later mapping fails.

use super::error::StageError;
use super::types::{
    DestinationCategory, InstallMapping, InstallPolicy, InstalledFile, InstalledLayout,
    PackageDescriptor,
};
use crate::tripwire::hasher;
use indexmap::IndexMap;
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Maps a destination category to a concrete directory.
pub trait DestinationResolver: Sync {
    fn resolve(&self, prefix: &Path, package: &str, category: DestinationCategory) -> PathBuf;
}

/// `binary` → `<prefix>/bin`, `shared_resources` → `<prefix>/share/<package>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardLayout;

impl DestinationResolver for StandardLayout {
    fn resolve(&self, prefix: &Path, package: &str, category: DestinationCategory) -> PathBuf {
        match category {
            DestinationCategory::Binary => prefix.join("bin"),
            DestinationCategory::SharedResources => prefix.join("share").join(package),
        }
    }
}

/// Apply every install mapping of `descriptor` from `source_root` into `prefix`.
pub fn install(
    descriptor: &PackageDescriptor,
    source_root: &Path,
    prefix: &Path,
    resolver: &dyn DestinationResolver,
    policy: InstallPolicy,
) -> Result<InstalledLayout, StageError> {
    if let Some(problem) = super::parser::name_problem(&descriptor.name) {
        return Err(StageError::install(
            &descriptor.name,
            format!("package name {}", problem),
        ));
    }
    let mut journal = Journal::new(policy)
        .map_err(|e| StageError::install(prefix, format!("cannot create rollback journal: {}", e)))?;
    let mut files: IndexMap<PathBuf, InstalledFile> = IndexMap::new();

    let result = descriptor
        .install
        .iter()
        .enumerate()
        .try_for_each(|(index, mapping)| {
            let dir = resolver.resolve(prefix, &descriptor.name, mapping.destination);
            apply_mapping(index, mapping, source_root, &dir, &mut journal, &mut files)
        });

    match result {
        Ok(()) => Ok(InstalledLayout {
            prefix: prefix.to_path_buf(),
            files: files.into_values().collect(),
        }),
        Err(err) => {
            let problems = journal.rollback();
            if problems.is_empty() {
                return Err(err);
            }
            Err(match err {
                StageError::Install { path, reason } => StageError::Install {
                    path,
                    reason: format!("{}; rollback incomplete: {}", reason, problems.join("; ")),
                },
                other => other,
            })
        }
    }
}

/// Expand a mapping source to concrete paths under `source_root`.
pub fn expand_source(source_root: &Path, mapping: &InstallMapping) -> Result<Vec<PathBuf>, StageError> {
    if !is_glob(&mapping.source) {
        let path = source_root.join(&mapping.source);
        if std::fs::symlink_metadata(&path).is_err() {
            return Err(StageError::install(
                &mapping.source,
                "artifact was not produced by the build",
            ));
        }
        return Ok(vec![path]);
    }

    let pattern = format!(
        "{}/{}",
        glob::Pattern::escape(&source_root.display().to_string()),
        mapping.source
    );
    let paths = glob::glob(&pattern)
        .map_err(|e| StageError::install(&mapping.source, format!("invalid pattern: {}", e)))?;
    let mut matches: Vec<PathBuf> = paths
        .collect::<Result<_, _>>()
        .map_err(|e| StageError::install(&mapping.source, e.to_string()))?;
    if matches.is_empty() {
        return Err(StageError::install(
            &mapping.source,
            "no artifact matches pattern",
        ));
    }
    matches.sort();
    Ok(matches)
}

fn is_glob(source: &str) -> bool {
    source.contains(['*', '?', '['])
}

fn apply_mapping(
    index: usize,
    mapping: &InstallMapping,
    source_root: &Path,
    dir: &Path,
    journal: &mut Journal,
    files: &mut IndexMap<PathBuf, InstalledFile>,
) -> Result<(), StageError> {
    for src in expand_source(source_root, mapping)? {
        let mut pairs = Vec::new();
        if src.is_dir() {
            collect_tree(&src, dir, &mut pairs).map_err(|e| StageError::install(&src, e.to_string()))?;
        } else {
            let name = src
                .file_name()
                .ok_or_else(|| StageError::install(&src, "source has no file name"))?;
            pairs.push((src.clone(), dir.join(name)));
        }

        for (from, to) in pairs {
            copy_artifact(&from, &to, mapping.destination, journal)?;
            let hash = hasher::hash_file(&to).map_err(|e| StageError::install(&to, e.to_string()))?;
            files.shift_remove(&to);
            files.insert(
                to.clone(),
                InstalledFile {
                    mapping: index,
                    source: mapping.source.clone(),
                    category: mapping.destination,
                    path: to,
                    hash,
                },
            );
        }
    }
    Ok(())
}

/// (source file, destination file) pairs for a directory, in sorted order.
/// Symlinks inside the tree are skipped, never followed.
fn collect_tree(src: &Path, dest: &Path, out: &mut Vec<(PathBuf, PathBuf)>) -> std::io::Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(src)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let file_type = entry.file_type()?;
        if file_type.is_symlink() {
            continue;
        }
        let from = entry.path();
        let to = dest.join(entry.file_name());
        if file_type.is_dir() {
            collect_tree(&from, &to, out)?;
        } else {
            out.push((from, to));
        }
    }
    Ok(())
}

/// Write one file via a sibling temp file and rename.
fn copy_artifact(
    from: &Path,
    to: &Path,
    category: DestinationCategory,
    journal: &mut Journal,
) -> Result<(), StageError> {
    let err = |e: std::io::Error| StageError::install(to, e.to_string());

    if to.is_dir() {
        return Err(StageError::install(to, "destination is a directory"));
    }
    let parent = to
        .parent()
        .ok_or_else(|| StageError::install(to, "destination has no parent"))?;
    journal.create_dirs(parent).map_err(err)?;
    journal.touch(to).map_err(err)?;

    let mut src = std::fs::File::open(from).map_err(|e| StageError::install(from, e.to_string()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(err)?;
    std::io::copy(&mut src, tmp.as_file_mut()).map_err(err)?;
    tmp.as_file_mut().flush().map_err(err)?;

    let mode = std::fs::metadata(from).map_err(err)?.permissions();
    set_mode(tmp.path(), mode, category).map_err(err)?;

    tmp.persist(to).map_err(|e| err(e.error))?;
    Ok(())
}

#[cfg(unix)]
fn set_mode(
    path: &Path,
    source: std::fs::Permissions,
    category: DestinationCategory,
) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut mode = source.mode() & 0o777;
    if category == DestinationCategory::Binary {
        mode |= 0o755;
    }
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(path: &Path, source: std::fs::Permissions, _: DestinationCategory) -> std::io::Result<()> {
    std::fs::set_permissions(path, source)
}

// ============================================================================
// Rollback journal
// ============================================================================

enum Touched {
    /// Existed before; content saved at `backup`.
    Replaced { path: PathBuf, backup: PathBuf },
    /// Did not exist before.
    Created(PathBuf),
}

struct Journal {
    backups: Option<tempfile::TempDir>,
    touched: Vec<Touched>,
    seen: HashSet<PathBuf>,
    created_dirs: Vec<PathBuf>,
}

impl Journal {
    fn new(policy: InstallPolicy) -> std::io::Result<Self> {
        Self::with_backups_in(policy, &std::env::temp_dir())
    }

    fn with_backups_in(policy: InstallPolicy, base: &Path) -> std::io::Result<Self> {
        let backups = match policy {
            InstallPolicy::Rollback => Some(tempfile::tempdir_in(base)?),
            InstallPolicy::NoRollback => None,
        };
        Ok(Self {
            backups,
            touched: Vec::new(),
            seen: HashSet::new(),
            created_dirs: Vec::new(),
        })
    }

    fn enabled(&self) -> bool {
        self.backups.is_some()
    }

    /// Create `dir` and any missing ancestors, remembering which were new.
    fn create_dirs(&mut self, dir: &Path) -> std::io::Result<()> {
        if dir.is_dir() {
            return Ok(());
        }
        if self.enabled() {
            let mut missing: Vec<PathBuf> = dir
                .ancestors()
                .take_while(|a| !a.exists())
                .map(Path::to_path_buf)
                .collect();
            missing.reverse();
            self.created_dirs.extend(missing);
        }
        std::fs::create_dir_all(dir)
    }

    /// Record the prior state of `path` the first time it is written.
    fn touch(&mut self, path: &Path) -> std::io::Result<()> {
        let Some(backups) = &self.backups else {
            return Ok(());
        };
        if !self.seen.insert(path.to_path_buf()) {
            return Ok(());
        }
        if path.is_file() {
            let backup = backups.path().join(self.touched.len().to_string());
            std::fs::copy(path, &backup)?;
            self.touched.push(Touched::Replaced {
                path: path.to_path_buf(),
                backup,
            });
        } else {
            self.touched.push(Touched::Created(path.to_path_buf()));
        }
        Ok(())
    }

    /// Undo every touch in reverse order. Returns what could not be undone.
    fn rollback(self) -> Vec<String> {
        let mut problems = Vec::new();
        for touched in self.touched.iter().rev() {
            let result = match touched {
                Touched::Replaced { path, backup } => std::fs::copy(backup, path).map(|_| ()),
                Touched::Created(path) if path.exists() => std::fs::remove_file(path),
                Touched::Created(_) => Ok(()),
            };
            if let Err(e) = result {
                let path = match touched {
                    Touched::Replaced { path, .. } | Touched::Created(path) => path,
                };
                problems.push(format!("{}: {}", path.display(), e));
            }
        }
        for dir in self.created_dirs.iter().rev() {
            // Only empty directories; anything else was not ours
            let _ = std::fs::remove_dir(dir);
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(install: &str) -> PackageDescriptor {
        serde_yaml_ng::from_str(&format!(
            r#"
name: slang
version: "1"
source_url: https://github.com/bww/Slang.git
build_command: make
install:
{}
"#,
            install
        ))
        .unwrap()
    }

    fn built_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("bin")).unwrap();
        std::fs::write(root.join("bin/slang"), "#!/bin/sh\necho slang\n").unwrap();
        std::fs::create_dir_all(root.join("share/slang/css")).unwrap();
        std::fs::write(root.join("share/slang/index.html"), "<html>").unwrap();
        std::fs::write(root.join("share/slang/css/a.css"), "a{}").unwrap();
        std::fs::create_dir_all(root.join("completions")).unwrap();
        std::fs::write(root.join("completions/slang.bash"), "complete").unwrap();
        std::fs::write(root.join("completions/slang.zsh"), "#compdef").unwrap();
        dir
    }

    const STANDARD: &str = r#"
  - { source: bin/slang, destination: binary }
  - { source: share/slang, destination: shared_resources }
"#;

    #[test]
    fn test_fx030_standard_layout() {
        let p = Path::new("/opt/pkg");
        assert_eq!(
            StandardLayout.resolve(p, "slang", DestinationCategory::Binary),
            PathBuf::from("/opt/pkg/bin")
        );
        assert_eq!(
            StandardLayout.resolve(p, "slang", DestinationCategory::SharedResources),
            PathBuf::from("/opt/pkg/share/slang")
        );
    }

    #[test]
    fn test_fx030_install_binary_and_resources() {
        let src = built_tree();
        let prefix = tempfile::tempdir().unwrap();
        let layout = install(
            &descriptor(STANDARD),
            src.path(),
            prefix.path(),
            &StandardLayout,
            InstallPolicy::NoRollback,
        )
        .unwrap();

        let bin = prefix.path().join("bin/slang");
        assert!(bin.is_file());
        assert!(prefix.path().join("share/slang/index.html").is_file());
        assert!(prefix.path().join("share/slang/css/a.css").is_file());

        let paths: Vec<_> = layout.files.iter().map(|f| f.path.clone()).collect();
        assert_eq!(
            paths,
            vec![
                bin.clone(),
                prefix.path().join("share/slang/css/a.css"),
                prefix.path().join("share/slang/index.html"),
            ]
        );
        assert_eq!(layout.files[0].mapping, 0);
        assert_eq!(layout.files[1].mapping, 1);
        assert_eq!(layout.files[0].hash, hasher::hash_file(&bin).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_fx030_binary_is_executable() {
        use std::os::unix::fs::PermissionsExt;
        let src = built_tree();
        let prefix = tempfile::tempdir().unwrap();
        install(
            &descriptor(STANDARD),
            src.path(),
            prefix.path(),
            &StandardLayout,
            InstallPolicy::NoRollback,
        )
        .unwrap();
        let mode = |p: &str| {
            std::fs::metadata(prefix.path().join(p))
                .unwrap()
                .permissions()
                .mode()
        };
        assert_eq!(mode("bin/slang") & 0o755, 0o755);
        assert_eq!(mode("share/slang/index.html") & 0o111, 0);
    }

    #[test]
    fn test_fx030_idempotent() {
        let src = built_tree();
        let prefix = tempfile::tempdir().unwrap();
        let d = descriptor(STANDARD);
        let first = install(&d, src.path(), prefix.path(), &StandardLayout, InstallPolicy::NoRollback).unwrap();
        let second = install(&d, src.path(), prefix.path(), &StandardLayout, InstallPolicy::NoRollback).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.digest(), second.digest());
    }

    #[test]
    fn test_fx030_idempotent_with_duplicate_destinations() {
        let src = built_tree();
        std::fs::create_dir_all(src.path().join("alt")).unwrap();
        std::fs::write(src.path().join("alt/slang"), "alt").unwrap();
        let d = descriptor(
            r#"
  - { source: bin/slang, destination: binary }
  - { source: alt/slang, destination: binary }
"#,
        );
        let prefix = tempfile::tempdir().unwrap();
        let first = install(&d, src.path(), prefix.path(), &StandardLayout, InstallPolicy::NoRollback).unwrap();
        let second = install(&d, src.path(), prefix.path(), &StandardLayout, InstallPolicy::NoRollback).unwrap();
        assert_eq!(first, second);
        assert_eq!(second.files.len(), 1);
        assert_eq!(second.files[0].source, "alt/slang");
        assert_eq!(
            std::fs::read_to_string(prefix.path().join("bin/slang")).unwrap(),
            "alt"
        );
    }

    #[test]
    fn test_fx030_later_mapping_wins() {
        let src = built_tree();
        std::fs::create_dir_all(src.path().join("alt")).unwrap();
        std::fs::write(src.path().join("alt/slang"), "newer").unwrap();
        let d = descriptor(
            r#"
  - { source: bin/slang, destination: binary }
  - { source: alt/slang, destination: binary }
"#,
        );
        let prefix = tempfile::tempdir().unwrap();
        let layout = install(&d, src.path(), prefix.path(), &StandardLayout, InstallPolicy::NoRollback).unwrap();

        assert_eq!(
            std::fs::read_to_string(prefix.path().join("bin/slang")).unwrap(),
            "newer"
        );
        assert_eq!(layout.files.len(), 1);
        assert_eq!(layout.files[0].mapping, 1);
        assert_eq!(layout.files[0].source, "alt/slang");
    }

    #[test]
    fn test_fx030_glob_sorted() {
        let src = built_tree();
        let d = descriptor("  - { source: completions/slang.*, destination: shared_resources }");
        let prefix = tempfile::tempdir().unwrap();
        let layout = install(&d, src.path(), prefix.path(), &StandardLayout, InstallPolicy::NoRollback).unwrap();
        let names: Vec<_> = layout
            .files
            .iter()
            .map(|f| f.path.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["slang.bash", "slang.zsh"]);
    }

    #[test]
    fn test_fx030_glob_without_matches() {
        let src = built_tree();
        let d = descriptor("  - { source: target/*.so, destination: shared_resources }");
        let prefix = tempfile::tempdir().unwrap();
        let err = install(&d, src.path(), prefix.path(), &StandardLayout, InstallPolicy::NoRollback).unwrap_err();
        match err {
            StageError::Install { path, reason } => {
                assert_eq!(path, PathBuf::from("target/*.so"));
                assert!(reason.contains("no artifact"));
            }
            other => panic!("expected Install, got {:?}", other),
        }
    }

    #[test]
    fn test_fx030_missing_artifact_names_path() {
        let src = tempfile::tempdir().unwrap();
        let prefix = tempfile::tempdir().unwrap();
        let err = install(
            &descriptor(STANDARD),
            src.path(),
            prefix.path(),
            &StandardLayout,
            InstallPolicy::NoRollback,
        )
        .unwrap_err();
        match err {
            StageError::Install { path, .. } => assert_eq!(path, PathBuf::from("bin/slang")),
            other => panic!("expected Install, got {:?}", other),
        }
        assert!(!prefix.path().join("bin").exists());
    }

    #[test]
    fn test_fx030_no_rollback_keeps_earlier_mappings() {
        let src = built_tree();
        let d = descriptor(
            r#"
  - { source: bin/slang, destination: binary }
  - { source: bin/missing, destination: binary }
"#,
        );
        let prefix = tempfile::tempdir().unwrap();
        let err = install(&d, src.path(), prefix.path(), &StandardLayout, InstallPolicy::NoRollback).unwrap_err();
        assert!(matches!(err, StageError::Install { .. }));
        assert!(prefix.path().join("bin/slang").exists());
    }

    #[test]
    fn test_fx030_rollback_restores_prefix() {
        let src = built_tree();
        let prefix = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(prefix.path().join("bin")).unwrap();
        std::fs::write(prefix.path().join("bin/slang"), "previous release").unwrap();

        let d = descriptor(
            r#"
  - { source: bin/slang, destination: binary }
  - { source: share/slang, destination: shared_resources }
  - { source: bin/missing, destination: binary }
"#,
        );
        let err = install(&d, src.path(), prefix.path(), &StandardLayout, InstallPolicy::Rollback).unwrap_err();
        assert!(matches!(err, StageError::Install { .. }));

        assert_eq!(
            std::fs::read_to_string(prefix.path().join("bin/slang")).unwrap(),
            "previous release"
        );
        assert!(!prefix.path().join("share").exists());
    }

    #[test]
    fn test_fx030_destination_is_directory() {
        let src = built_tree();
        let prefix = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(prefix.path().join("bin/slang")).unwrap();
        let err = install(
            &descriptor(STANDARD),
            src.path(),
            prefix.path(),
            &StandardLayout,
            InstallPolicy::NoRollback,
        )
        .unwrap_err();
        assert!(err.to_string().contains("destination is a directory"));
    }

    #[test]
    fn test_fx030_path_like_name_stays_out_of_prefix() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("share")).unwrap();
        std::fs::write(src.path().join("share/x"), "x").unwrap();
        let mut d = descriptor("  - { source: share/x, destination: shared_resources }");
        d.name = "../../escaped".to_string();

        let scratch = tempfile::tempdir().unwrap();
        let prefix = scratch.path().join("a/prefix");
        let err = install(&d, src.path(), &prefix, &StandardLayout, InstallPolicy::NoRollback).unwrap_err();
        assert!(matches!(err, StageError::Install { .. }));
        assert!(err.to_string().contains("package name"));
        assert!(!scratch.path().join("escaped").exists());
        assert!(!prefix.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_fx030_symlinks_in_directory_are_skipped() {
        let src = built_tree();
        let share = src.path().join("share/slang");
        std::os::unix::fs::symlink(".", share.join("self")).unwrap();
        std::os::unix::fs::symlink("index.html", share.join("home.html")).unwrap();
        let prefix = tempfile::tempdir().unwrap();

        let layout = install(
            &descriptor(STANDARD),
            src.path(),
            prefix.path(),
            &StandardLayout,
            InstallPolicy::NoRollback,
        )
        .unwrap();
        assert_eq!(layout.files.len(), 3);
        assert!(prefix.path().join("share/slang/index.html").is_file());
        assert!(!prefix.path().join("share/slang/self").exists());
        assert!(!prefix.path().join("share/slang/home.html").exists());
    }

    #[test]
    fn test_fx030_rollback_journal_needs_backup_dir() {
        let scratch = tempfile::tempdir().unwrap();
        let not_a_dir = scratch.path().join("file");
        std::fs::write(&not_a_dir, "").unwrap();

        assert!(Journal::with_backups_in(InstallPolicy::Rollback, &not_a_dir).is_err());
        let plain = Journal::with_backups_in(InstallPolicy::NoRollback, &not_a_dir).unwrap();
        assert!(!plain.enabled());
        let journal = Journal::with_backups_in(InstallPolicy::Rollback, scratch.path()).unwrap();
        assert!(journal.enabled());
    }

    struct Flat;

    impl DestinationResolver for Flat {
        fn resolve(&self, prefix: &Path, _: &str, category: DestinationCategory) -> PathBuf {
            prefix.join(category.to_string())
        }
    }

    #[test]
    fn test_fx030_custom_resolver() {
        let src = built_tree();
        let prefix = tempfile::tempdir().unwrap();
        install(&descriptor(STANDARD), src.path(), prefix.path(), &Flat, InstallPolicy::NoRollback).unwrap();
        assert!(prefix.path().join("binary/slang").is_file());
        assert!(prefix.path().join("shared_resources/css/a.css").is_file());
    }

    #[test]
    fn test_fx030_empty_install_list() {
        let mut d = descriptor(STANDARD);
        d.install.clear();
        let prefix = tempfile::tempdir().unwrap();
        let layout = install(&d, Path::new("/nonexistent"), prefix.path(), &StandardLayout, InstallPolicy::NoRollback).unwrap();
        assert!(layout.files.is_empty());
    }
}
