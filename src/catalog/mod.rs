// Per-platform bundle catalog: names, content hashes and dependency edges.

pub mod manifest;
pub mod service;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{BundleError, BundleResult};

/// Opaque 128-bit content hash, written as 32 hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct ContentHash(u128);

impl ContentHash {
    pub const fn from_u128(value: u128) -> Self {
        Self(value)
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl FromStr for ContentHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(format!("invalid content hash '{}': expected 32 hex chars", s));
        }
        u128::from_str_radix(s, 16)
            .map(ContentHash)
            .map_err(|e| format!("invalid content hash '{}': {}", s, e))
    }
}

impl TryFrom<String> for ContentHash {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub name: String,
    pub hash: ContentHash,
    /// Direct dependencies, in manifest order.
    pub dependencies: Vec<String>,
}

/// Immutable table of the bundles published for one platform target.
#[derive(Debug, Clone)]
pub struct Catalog {
    target: String,
    entries: HashMap<String, CatalogEntry>,
}

impl Catalog {
    pub fn new(target: impl Into<String>, entries: impl IntoIterator<Item = CatalogEntry>) -> Self {
        Self {
            target: target.into(),
            entries: entries
                .into_iter()
                .map(|e| (e.name.clone(), e))
                .collect(),
        }
    }

    /// Target name this catalog was published for.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn entry(&self, name: &str) -> Option<&CatalogEntry> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bundle names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn dependencies(&self, name: &str) -> BundleResult<&[String]> {
        self.entries
            .get(name)
            .map(|e| e.dependencies.as_slice())
            .ok_or_else(|| BundleError::UnknownBundle(name.to_string()))
    }

    /// `name` plus every transitive dependency, dependencies before dependents
    /// (root last). Each bundle appears once even with diamond dependencies.
    pub fn load_order(&self, name: &str) -> BundleResult<Vec<String>> {
        let mut visited = HashSet::new();
        let mut in_progress = HashSet::new();
        let mut order = Vec::new();
        self.visit(name, &mut visited, &mut in_progress, &mut order)?;
        Ok(order)
    }

    /// Transitive dependencies of `name`, excluding `name` itself.
    pub fn transitive_dependencies(&self, name: &str) -> BundleResult<Vec<String>> {
        let mut order = self.load_order(name)?;
        order.pop();
        Ok(order)
    }

    /// Group the load order into levels: every bundle's dependencies live in
    /// strictly earlier levels, so one level can be fetched concurrently.
    pub fn load_levels(&self, name: &str) -> BundleResult<Vec<Vec<String>>> {
        let order = self.load_order(name)?;
        let mut depth: HashMap<&str, usize> = HashMap::with_capacity(order.len());
        let mut levels: BTreeMap<usize, Vec<String>> = BTreeMap::new();

        for bundle in &order {
            let level = self
                .dependencies(bundle)?
                .iter()
                .filter_map(|dep| depth.get(dep.as_str()))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(bundle.as_str(), level);
            levels.entry(level).or_default().push(bundle.clone());
        }

        Ok(levels.into_values().collect())
    }

    fn visit(
        &self,
        name: &str,
        visited: &mut HashSet<String>,
        in_progress: &mut HashSet<String>,
        order: &mut Vec<String>,
    ) -> BundleResult<()> {
        if visited.contains(name) {
            return Ok(());
        }
        if in_progress.contains(name) {
            return Err(BundleError::CyclicDependency(name.to_string()));
        }

        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| BundleError::UnknownBundle(name.to_string()))?;

        in_progress.insert(name.to_string());
        for dep in &entry.dependencies {
            self.visit(dep, visited, in_progress, order)?;
        }
        in_progress.remove(name);

        visited.insert(name.to_string());
        order.push(name.to_string());
        Ok(())
    }
}
