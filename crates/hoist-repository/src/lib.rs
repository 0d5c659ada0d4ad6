#![deny(clippy::all)]
//! The package set: the workspace model the orchestrator is handed by its
//! caller.
//!
//! Package discovery and manifest parsing happen outside this crate; what
//! arrives here is already a list of packages with their directories,
//! scripts, declared dependencies, and optional task-definition blocks.
//! This crate validates the set (unique names, acyclic dependencies) and
//! resolves the direct-dependency edges, applying the version-skew rule: a
//! declared dependency whose version range the workspace copy does not
//! satisfy is treated as not-a-dependency.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
};

use camino::Utf8PathBuf;
use hoist_config::TaskDefinitions;
use petgraph::Graph;
use semver::{Version, VersionReq};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PackageName(String);

impl PackageName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PackageName {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for PackageName {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone)]
pub struct PackageDependency {
    pub name: PackageName,
    pub range: VersionReq,
}

impl PackageDependency {
    pub fn new(name: impl Into<PackageName>, range: VersionReq) -> Self {
        Self {
            name: name.into(),
            range,
        }
    }

    /// A dependency satisfied by any workspace version.
    pub fn any(name: impl Into<PackageName>) -> Self {
        Self::new(name, VersionReq::STAR)
    }
}

#[derive(Debug, Clone)]
pub struct PackageInfo {
    pub name: PackageName,
    /// Directory of the package, relative to the workspace root.
    pub dir: Utf8PathBuf,
    pub version: Version,
    pub scripts: BTreeMap<String, String>,
    pub dependencies: Vec<PackageDependency>,
    /// The package's embedded task-definition block, if any.
    pub tasks: Option<TaskDefinitions>,
    pub is_release_group_root: bool,
}

impl PackageInfo {
    pub fn new(name: impl Into<PackageName>, dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
            version: Version::new(0, 0, 0),
            scripts: BTreeMap::new(),
            dependencies: Vec::new(),
            tasks: None,
            is_release_group_root: false,
        }
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn with_script(mut self, name: impl Into<String>, command: impl Into<String>) -> Self {
        self.scripts.insert(name.into(), command.into());
        self
    }

    pub fn with_dependency(mut self, dependency: PackageDependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn with_tasks(mut self, tasks: TaskDefinitions) -> Self {
        self.tasks = Some(tasks);
        self
    }

    pub fn script(&self, name: &str) -> Option<&str> {
        self.scripts.get(name).map(String::as_str)
    }
}

/// A validated set of workspace packages with resolved direct-dependency
/// edges.
#[derive(Debug)]
pub struct PackageSet {
    packages: BTreeMap<PackageName, PackageInfo>,
    dependencies: BTreeMap<PackageName, Vec<PackageName>>,
}

impl PackageSet {
    pub fn new(packages: Vec<PackageInfo>) -> Result<Self, Error> {
        let mut map = BTreeMap::new();
        for package in packages {
            let name = package.name.clone();
            if map.insert(name.clone(), package).is_some() {
                return Err(Error::DuplicatePackage { name });
            }
        }

        let mut dependencies: BTreeMap<PackageName, Vec<PackageName>> = BTreeMap::new();
        for (name, package) in &map {
            let mut direct = Vec::new();
            for dependency in &package.dependencies {
                let Some(target) = map.get(&dependency.name) else {
                    // External dependency, not part of the workspace.
                    continue;
                };
                if !dependency.range.matches(&target.version) {
                    debug!(
                        "dropping dependency edge {name} -> {}: workspace version {} does not \
                         satisfy range {}",
                        dependency.name, target.version, dependency.range,
                    );
                    continue;
                }
                direct.push(dependency.name.clone());
            }
            direct.sort();
            direct.dedup();
            dependencies.insert(name.clone(), direct);
        }

        let set = Self {
            packages: map,
            dependencies,
        };
        set.validate()?;
        Ok(set)
    }

    fn validate(&self) -> Result<(), Error> {
        let mut graph = Graph::new();
        let mut lookup = HashMap::new();
        for name in self.packages.keys() {
            lookup.insert(name.clone(), graph.add_node(name.clone()));
        }
        for (name, deps) in &self.dependencies {
            for dep in deps {
                graph.add_edge(lookup[name], lookup[dep], ());
            }
        }
        hoist_graph_utils::validate_graph(&graph)?;
        Ok(())
    }

    pub fn get(&self, name: &PackageName) -> Option<&PackageInfo> {
        self.packages.get(name)
    }

    pub fn contains(&self, name: &PackageName) -> bool {
        self.packages.contains_key(name)
    }

    /// Direct dependencies after version-skew filtering, sorted by name.
    pub fn immediate_dependencies(&self, name: &PackageName) -> &[PackageName] {
        self.dependencies
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn packages(&self) -> impl Iterator<Item = &PackageInfo> {
        self.packages.values()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("package `{name}` is declared more than once")]
    DuplicatePackage { name: PackageName },
    #[error(transparent)]
    Graph(#[from] hoist_graph_utils::Error),
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    fn version(raw: &str) -> Version {
        Version::parse(raw).unwrap()
    }

    fn range(raw: &str) -> VersionReq {
        VersionReq::parse(raw).unwrap()
    }

    #[test]
    fn test_resolves_direct_dependencies() {
        let set = PackageSet::new(vec![
            PackageInfo::new("app", "packages/app")
                .with_dependency(PackageDependency::any("lib"))
                .with_dependency(PackageDependency::any("left-pad")),
            PackageInfo::new("lib", "packages/lib"),
        ])
        .unwrap();

        // The external dependency is ignored, the workspace one resolves.
        assert_eq!(
            set.immediate_dependencies(&PackageName::from("app")),
            &[PackageName::from("lib")]
        );
        assert!(set
            .immediate_dependencies(&PackageName::from("lib"))
            .is_empty());
    }

    #[test]
    fn test_version_skew_drops_edge() {
        let set = PackageSet::new(vec![
            PackageInfo::new("app", "packages/app")
                .with_dependency(PackageDependency::new("lib", range("^2.0.0"))),
            PackageInfo::new("lib", "packages/lib").with_version(version("1.4.0")),
        ])
        .unwrap();

        assert!(set
            .immediate_dependencies(&PackageName::from("app"))
            .is_empty());
    }

    #[test]
    fn test_satisfied_range_keeps_edge() {
        let set = PackageSet::new(vec![
            PackageInfo::new("app", "packages/app")
                .with_dependency(PackageDependency::new("lib", range("^1.2.0"))),
            PackageInfo::new("lib", "packages/lib").with_version(version("1.4.0")),
        ])
        .unwrap();

        assert_eq!(
            set.immediate_dependencies(&PackageName::from("app")),
            &[PackageName::from("lib")]
        );
    }

    #[test]
    fn test_duplicate_package_is_rejected() {
        let err = PackageSet::new(vec![
            PackageInfo::new("app", "a"),
            PackageInfo::new("app", "b"),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::DuplicatePackage { .. }));
    }

    #[test]
    fn test_dependency_cycle_is_rejected() {
        let err = PackageSet::new(vec![
            PackageInfo::new("a", "a").with_dependency(PackageDependency::any("b")),
            PackageInfo::new("b", "b").with_dependency(PackageDependency::any("a")),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::Graph(_)));
    }
}
