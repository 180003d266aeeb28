//! FX-002: Catalog parsing and descriptor validation.
//!
//! Parses formulary.yaml and validates structural constraints:
//! - Version must be "1.0"
//! - `(name, version)` pairs are unique
//! - Every descriptor is installable (`describe` returns no violations)

use super::error::CatalogError;
use super::types::*;
use std::collections::HashSet;
use std::path::{Component, Path};

/// A violated descriptor or catalog invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub field: String,
    pub message: String,
}

impl Violation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.field, self.message)
    }
}

/// Parse a catalog file from disk.
pub fn parse_catalog_file(path: &Path) -> Result<CatalogFile, CatalogError> {
    let content = std::fs::read_to_string(path).map_err(|e| CatalogError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    parse_catalog(&content)
}

/// Parse a catalog from a string.
pub fn parse_catalog(yaml: &str) -> Result<CatalogFile, CatalogError> {
    Ok(serde_yaml_ng::from_str(yaml)?)
}

/// Static check run before any fetch. Empty list = well-formed.
pub fn describe(descriptor: &PackageDescriptor) -> Vec<Violation> {
    let mut violations = Vec::new();

    if let Some(problem) = name_problem(&descriptor.name) {
        violations.push(Violation::new("name", problem));
    }
    if descriptor.source_url.trim().is_empty() {
        violations.push(Violation::new("source_url", "must not be empty"));
    }
    if descriptor.build_command.trim().is_empty() {
        violations.push(Violation::new("build_command", "must not be empty"));
    }
    if descriptor.install.is_empty() {
        violations.push(Violation::new("install", "must declare at least one mapping"));
    }

    if let Some(ref sum) = descriptor.sha256 {
        if sum.len() != 64 || !sum.chars().all(|c| c.is_ascii_hexdigit()) {
            violations.push(Violation::new("sha256", "must be 64 hex characters"));
        }
    }

    for (i, mapping) in descriptor.install.iter().enumerate() {
        let field = format!("install[{}].source", i);
        let source = mapping.source.trim();
        if source.is_empty() {
            violations.push(Violation::new(field, "must not be empty"));
            continue;
        }
        let path = Path::new(source);
        if path.is_absolute() {
            violations.push(Violation::new(field, "must be relative to the source tree"));
        } else if path.components().any(|c| c == Component::ParentDir) {
            violations.push(Violation::new(field, "must not escape the source tree"));
        }
    }

    violations
}

/// The name becomes a directory under the prefix and the state dir, so it
/// must be a single plain path component.
pub(crate) fn name_problem(name: &str) -> Option<&'static str> {
    if name.trim().is_empty() {
        Some("must not be empty")
    } else if name.contains(['/', '\\']) {
        Some("must not contain path separators")
    } else if name.starts_with('.') || name.contains("..") {
        Some("must not start with '.' or contain '..'")
    } else {
        None
    }
}

/// Validate a parsed catalog. Returns a list of violations (empty = valid).
pub fn validate_catalog(catalog: &CatalogFile) -> Vec<Violation> {
    let mut violations = Vec::new();

    if catalog.version != "1.0" {
        violations.push(Violation::new(
            "version",
            format!("must be \"1.0\", got \"{}\"", catalog.version),
        ));
    }

    if catalog.name.is_empty() {
        violations.push(Violation::new("name", "must not be empty"));
    }

    let mut seen: HashSet<(&str, &str)> = HashSet::new();
    for descriptor in &catalog.packages {
        let label = descriptor.label();

        if !seen.insert((descriptor.name.as_str(), descriptor.version.as_str())) {
            violations.push(Violation::new(
                "packages",
                format!("declare revision '{}' more than once", label),
            ));
        }

        if descriptor.dependencies.contains(&descriptor.name) {
            violations.push(Violation::new(
                format!("{}.dependencies", label),
                "must not name the package itself",
            ));
        }

        for v in describe(descriptor) {
            violations.push(Violation::new(format!("{}.{}", label, v.field), v.message));
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn slang() -> PackageDescriptor {
        serde_yaml_ng::from_str(
            r#"
name: slang
version: "1"
source_url: https://example/slang.git
build_command: make
install:
  - { source: bin/slang, destination: binary }
  - { source: share/slang, destination: shared_resources }
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_fx002_describe_well_formed() {
        assert!(describe(&slang()).is_empty());
    }

    #[test]
    fn test_fx002_describe_names_each_missing_field() {
        let mut d = slang();
        d.source_url.clear();
        d.build_command = "   ".to_string();
        d.install.clear();
        let fields: Vec<_> = describe(&d).into_iter().map(|v| v.field).collect();
        assert_eq!(fields, vec!["source_url", "build_command", "install"]);
    }

    #[test]
    fn test_fx002_describe_single_missing_field() {
        let mut d = slang();
        d.build_command.clear();
        let violations = describe(&d);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].field, "build_command");
    }

    #[test]
    fn test_fx002_describe_rejects_escaping_sources() {
        let mut d = slang();
        d.install[0].source = "../outside".to_string();
        d.install[1].source = "/etc/passwd".to_string();
        let violations = describe(&d);
        assert_eq!(violations.len(), 2);
        assert!(violations[0].message.contains("escape"));
        assert!(violations[1].message.contains("relative"));
    }

    #[test]
    fn test_fx002_describe_rejects_path_like_names() {
        for name in ["../../escaped", "a/b", "a\\b", ".hidden", "..", "x..y"] {
            let mut d = slang();
            d.name = name.to_string();
            let violations = describe(&d);
            assert_eq!(violations.len(), 1, "{name}: {:?}", violations);
            assert_eq!(violations[0].field, "name");
        }
    }

    #[test]
    fn test_fx002_describe_accepts_ordinary_names() {
        for name in ["slang", "lib-foo", "c++", "python3.12", "Slang_2"] {
            let mut d = slang();
            d.name = name.to_string();
            assert!(describe(&d).is_empty(), "{name}");
        }
    }

    #[test]
    fn test_fx002_describe_bad_checksum() {
        let mut d = slang();
        d.sha256 = Some("abc".to_string());
        assert_eq!(describe(&d)[0].field, "sha256");
    }

    #[test]
    fn test_fx002_violation_display() {
        let v = Violation::new("source_url", "must not be empty");
        assert_eq!(v.to_string(), "source_url must not be empty");
    }

    #[test]
    fn test_fx002_parse_valid() {
        let yaml = r#"
version: "1.0"
name: tap
packages:
  - name: slang
    version: 1
    source_url: https://github.com/bww/Slang.git
    build_command: make
    install:
      - { source: slang, destination: binary }
"#;
        let catalog = parse_catalog(yaml).unwrap();
        let violations = validate_catalog(&catalog);
        assert!(violations.is_empty(), "unexpected violations: {:?}", violations);
    }

    #[test]
    fn test_fx002_bad_version() {
        let catalog = parse_catalog("version: \"2.0\"\nname: tap\n").unwrap();
        let violations = validate_catalog(&catalog);
        assert!(violations.iter().any(|v| v.field == "version"));
    }

    #[test]
    fn test_fx002_duplicate_revision() {
        let yaml = r#"
version: "1.0"
name: tap
packages:
  - { name: slang, version: 1, source_url: a.git, build_command: make, install: [{ source: slang, destination: binary }] }
  - { name: slang, version: 1, source_url: b.git, build_command: make, install: [{ source: slang, destination: binary }] }
"#;
        let catalog = parse_catalog(yaml).unwrap();
        let violations = validate_catalog(&catalog);
        assert!(violations.iter().any(|v| v.message.contains("more than once")));
    }

    #[test]
    fn test_fx002_revisions_may_share_name() {
        let yaml = r#"
version: "1.0"
name: tap
packages:
  - { name: slang, version: 1, source_url: a.git, build_command: make, install: [{ source: slang, destination: binary }] }
  - { name: slang, version: 2, source_url: a.git, build_command: make, install: [{ source: bin/slang, destination: binary }] }
"#;
        let catalog = parse_catalog(yaml).unwrap();
        assert!(validate_catalog(&catalog).is_empty());
    }

    #[test]
    fn test_fx002_self_dependency() {
        let yaml = r#"
version: "1.0"
name: tap
packages:
  - { name: slang, version: 1, source_url: a.git, build_command: make, dependencies: [slang], install: [{ source: slang, destination: binary }] }
"#;
        let catalog = parse_catalog(yaml).unwrap();
        let violations = validate_catalog(&catalog);
        assert!(violations.iter().any(|v| v.field == "slang@1.dependencies"));
    }

    #[test]
    fn test_fx002_descriptor_violations_are_prefixed() {
        let yaml = r#"
version: "1.0"
name: tap
packages:
  - { name: slang, version: 3, build_command: make, install: [{ source: slang, destination: binary }] }
"#;
        let catalog = parse_catalog(yaml).unwrap();
        let violations = validate_catalog(&catalog);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].field, "slang@3.source_url");
    }

    #[test]
    fn test_fx002_parse_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("formulary.yaml");
        std::fs::write(&path, "version: \"1.0\"\nname: file-test\n").unwrap();
        let catalog = parse_catalog_file(&path).unwrap();
        assert_eq!(catalog.name, "file-test");
        assert!(catalog.packages.is_empty());
    }

    #[test]
    fn test_fx002_parse_missing_file() {
        let err = parse_catalog_file(Path::new("/nonexistent/formulary.yaml")).unwrap_err();
        assert!(matches!(err, CatalogError::Read { .. }));
    }

    #[test]
    fn test_fx002_parse_invalid_yaml() {
        let result = parse_catalog("not: [valid: yaml: {{");
        assert!(matches!(result, Err(CatalogError::Parse(_))));
    }

    proptest! {
        #[test]
        fn prop_fx002_populated_descriptor_is_well_formed(
            url in "[a-z]{1,12}://[a-z]{1,12}/[a-z]{1,8}\\.git",
            cmd in "[a-z]{1,8}( [a-z]{1,8}){0,3}",
            sources in proptest::collection::vec("[a-z]{1,6}(/[a-z]{1,6}){0,2}", 1..5),
        ) {
            let mut d = slang();
            d.source_url = url;
            d.build_command = cmd;
            d.install = sources
                .into_iter()
                .map(|source| InstallMapping { source, destination: DestinationCategory::Binary })
                .collect();
            prop_assert!(describe(&d).is_empty());
        }

        #[test]
        fn prop_fx002_empty_url_always_reported(cmd in "[a-z ]{0,10}") {
            let mut d = slang();
            d.source_url = String::new();
            d.build_command = cmd;
            let violations = describe(&d);
            prop_assert!(violations.iter().any(|v| v.field == "source_url"));
        }
    }
}
