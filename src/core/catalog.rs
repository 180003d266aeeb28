//! FX-003: Descriptor revisions keyed by `(name, version)`.
//!
//! A catalog holds immutable descriptor records. Revisions of the same
//! package are distinct records; the last one declared is the latest.
//! Dependencies are only declared here, never resolved.

use super::error::CatalogError;
use super::types::{CatalogFile, PackageDescriptor, Policy};
use indexmap::IndexMap;

/// Read-only index over a parsed catalog.
#[derive(Debug, Clone)]
pub struct Catalog {
    pub name: String,
    pub policy: Policy,
    revisions: IndexMap<(String, String), PackageDescriptor>,
}

impl Catalog {
    /// Index a parsed catalog. Later duplicates of a `(name, version)`
    /// pair are rejected by validation, so the first one is kept here.
    pub fn new(file: CatalogFile) -> Self {
        let mut revisions = IndexMap::new();
        for descriptor in file.packages {
            let key = (descriptor.name.clone(), descriptor.version.clone());
            revisions.entry(key).or_insert(descriptor);
        }
        Self {
            name: file.name,
            policy: file.policy,
            revisions,
        }
    }

    pub fn len(&self) -> usize {
        self.revisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    /// All revisions in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &PackageDescriptor> {
        self.revisions.values()
    }

    /// Distinct package names in declaration order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for (name, _) in self.revisions.keys() {
            if !names.contains(&name.as_str()) {
                names.push(name.as_str());
            }
        }
        names
    }

    /// Every revision of one package, oldest first.
    pub fn revisions(&self, name: &str) -> Vec<&PackageDescriptor> {
        self.revisions
            .iter()
            .filter(|((n, _), _)| n == name)
            .map(|(_, d)| d)
            .collect()
    }

    /// The last revision declared for `name`.
    pub fn latest(&self, name: &str) -> Option<&PackageDescriptor> {
        self.revisions(name).into_iter().last()
    }

    /// An exact revision.
    pub fn get(&self, name: &str, version: &str) -> Option<&PackageDescriptor> {
        self.revisions
            .get(&(name.to_string(), version.to_string()))
    }

    /// Look up an exact revision, or the latest when no version is given.
    pub fn select(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<&PackageDescriptor, CatalogError> {
        let found = match version {
            Some(v) => self.get(name, v),
            None => self.latest(name),
        };
        found.ok_or_else(|| CatalogError::NotFound {
            name: name.to_string(),
            version: version.map(str::to_string),
        })
    }

    /// Declared dependencies with no descriptor in this catalog.
    pub fn unknown_dependencies<'a>(&self, descriptor: &'a PackageDescriptor) -> Vec<&'a str> {
        descriptor
            .dependencies
            .iter()
            .filter(|dep| self.latest(dep).is_none())
            .map(String::as_str)
            .collect()
    }
}
