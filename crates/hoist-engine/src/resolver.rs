//! Task definition resolution.
//!
//! Produces, per package, the concrete map of task definitions that reflects
//! the full inheritance chain: global definitions, per-package overrides
//! with `...` splicing, the script-backed retention rule, and the workspace
//! reference allow-list. Results are memoized; the memo key covers
//! everything the output depends on, so two packages can never share an
//! entry by accident.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    sync::Arc,
};

use hoist_config::{RawTaskDefinition, TaskDefinitions, WorkspaceConfig};
use hoist_repository::{PackageInfo, PackageName, PackageSet};
use hoist_task_id::DependencySpec;
use parking_lot::Mutex;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDefinition {
    pub depends_on: Vec<DependencySpec>,
    pub before: Vec<DependencySpec>,
    pub after: Vec<DependencySpec>,
    pub children: Vec<String>,
    pub script: bool,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub cache: bool,
}

pub type ResolvedDefinitions = BTreeMap<String, TaskDefinition>;

/// An invalid reference surfaced during resolution. Resolution itself never
/// aborts on these; the graph builder decides whether they matter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionWarning {
    pub package: PackageName,
    pub task: String,
    pub reference: String,
    pub reason: String,
}

impl fmt::Display for ResolutionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}: reference `{}` {}",
            self.package, self.task, self.reference, self.reason
        )
    }
}

#[derive(Debug, Default)]
pub struct ResolverOutput {
    pub definitions: ResolvedDefinitions,
    pub warnings: Vec<ResolutionWarning>,
}

pub struct TaskDefinitionResolver<'a> {
    global: &'a TaskDefinitions,
    global_hash: String,
    allowed_references: Option<HashSet<String>>,
    memo: Mutex<HashMap<String, Arc<ResolverOutput>>>,
}

impl<'a> TaskDefinitionResolver<'a> {
    pub fn new(config: &'a WorkspaceConfig) -> Self {
        Self {
            global: &config.tasks,
            global_hash: config.global_definitions_hash(),
            allowed_references: config
                .allowed_references
                .as_ref()
                .map(|list| list.iter().cloned().collect()),
            memo: Mutex::new(HashMap::new()),
        }
    }

    pub fn resolve(&self, package: &PackageInfo, packages: &PackageSet) -> Arc<ResolverOutput> {
        let key = self.memo_key(package);
        if let Some(cached) = self.memo.lock().get(&key) {
            return cached.clone();
        }

        let output = Arc::new(self.resolve_uncached(package, packages));
        self.memo.lock().insert(key, output.clone());
        output
    }

    /// The memo key hashes every input of `resolve_uncached`. The package
    /// name and the release-group-root flag are separate record fields, so a
    /// workspace root with no scripts can never collide with a regular
    /// package that happens to share the remaining components.
    fn memo_key(&self, package: &PackageInfo) -> String {
        let mut fields: Vec<String> = vec![
            package.name.to_string(),
            self.script_set_hash(package),
            self.global_hash.clone(),
            package.is_release_group_root.to_string(),
        ];
        if let Some(tasks) = &package.tasks {
            fields.push(serde_json_hash(tasks));
        }
        hoist_hash::hash_fields(fields)
    }

    fn script_set_hash(&self, package: &PackageInfo) -> String {
        hoist_hash::hash_fields(
            package
                .scripts
                .iter()
                .flat_map(|(name, command)| [name.as_str(), command.as_str()]),
        )
    }

    fn resolve_uncached(&self, package: &PackageInfo, packages: &PackageSet) -> ResolverOutput {
        let mut warnings = Vec::new();
        let empty = TaskDefinitions::new();
        let overrides = package.tasks.as_ref().unwrap_or(&empty);

        // Global definitions first, merged with any per-package override,
        // then per-package definitions with no global counterpart.
        let mut raw: BTreeMap<&String, RawTaskDefinition> = BTreeMap::new();
        for (name, global) in self.global {
            match overrides.get(name) {
                Some(package_def) => raw.insert(name, package_def.merge_with_global(global)),
                None => raw.insert(name, global.clone()),
            };
        }
        let standalone = RawTaskDefinition::default();
        for (name, package_def) in overrides {
            if !self.global.contains_key(name) {
                raw.insert(name, package_def.merge_with_global(&standalone));
            }
        }

        let mut definitions = ResolvedDefinitions::new();
        for (name, definition) in raw {
            // Script-backed definitions apply only to packages that define
            // the script; grouping tasks exist independently of scripts.
            if definition.is_script_backed() && package.script(name).is_none() {
                continue;
            }
            definitions.insert(
                name.clone(),
                self.lower(package, packages, name, definition, &mut warnings),
            );
        }

        ResolverOutput {
            definitions,
            warnings,
        }
    }

    fn lower(
        &self,
        package: &PackageInfo,
        packages: &PackageSet,
        task: &str,
        raw: RawTaskDefinition,
        warnings: &mut Vec<ResolutionWarning>,
    ) -> TaskDefinition {
        let mut parse_list = |list: Option<Vec<String>>, ordering: bool| -> Vec<DependencySpec> {
            list.unwrap_or_default()
                .into_iter()
                .filter_map(|reference| {
                    let spec = match DependencySpec::parse(&reference) {
                        Ok(spec) => spec,
                        Err(error) => {
                            warnings.push(ResolutionWarning {
                                package: package.name.clone(),
                                task: task.to_owned(),
                                reference,
                                reason: error.to_string(),
                            });
                            return None;
                        }
                    };
                    if spec.is_ordering_only() && !ordering {
                        warnings.push(ResolutionWarning {
                            package: package.name.clone(),
                            task: task.to_owned(),
                            reference,
                            reason: "is only valid in `before` or `after`".to_owned(),
                        });
                        return None;
                    }
                    if let DependencySpec::Package { package: target, .. } = &spec {
                        // Surfaced here, but kept: the graph builder decides
                        // whether a dangling cross-package reference matters.
                        if !packages.contains(&PackageName::from(target.as_str())) {
                            warnings.push(ResolutionWarning {
                                package: package.name.clone(),
                                task: task.to_owned(),
                                reference: reference.clone(),
                                reason: format!("names unknown package `{target}`"),
                            });
                        }
                    }
                    if let (Some(allowed), Some(target)) =
                        (&self.allowed_references, spec.task())
                    {
                        if !allowed.contains(target) {
                            debug!(
                                "dropping reference `{spec}` from {}#{task}: `{target}` is not \
                                 in the workspace allow-list",
                                package.name
                            );
                            return None;
                        }
                    }
                    Some(spec)
                })
                .collect()
        };

        let depends_on = parse_list(raw.depends_on, false);
        let before = parse_list(raw.before, true);
        let after = parse_list(raw.after, true);

        TaskDefinition {
            depends_on,
            before,
            after,
            children: raw.children.unwrap_or_default(),
            script: raw.script.unwrap_or(true),
            inputs: raw.inputs.unwrap_or_default(),
            outputs: raw.outputs.unwrap_or_default(),
            cache: raw.cache.unwrap_or(true),
        }
    }
}

fn serde_json_hash(tasks: &TaskDefinitions) -> String {
    let serialized = serde_json::to_string(tasks).expect("task definitions serialize to JSON");
    hoist_hash::hash_bytes(serialized.as_bytes())
}

#[cfg(test)]
mod test {
    use camino::Utf8Path;
    use hoist_config::WorkspaceConfig;
    use pretty_assertions::assert_eq;

    use super::*;

    fn config(json: &str) -> WorkspaceConfig {
        WorkspaceConfig::parse(json, Utf8Path::new("hoist.json")).unwrap()
    }

    fn package_set(packages: Vec<PackageInfo>) -> PackageSet {
        PackageSet::new(packages).unwrap()
    }

    #[test]
    fn test_script_backed_retention() {
        let config = config(
            r#"{
                "lockfile": "lock",
                "tasks": {
                    "build": {"dependsOn": ["^build"]},
                    "lint": {},
                    "ci": {"script": false, "children": ["build", "lint"]}
                }
            }"#,
        );
        let resolver = TaskDefinitionResolver::new(&config);
        let packages = package_set(vec![
            PackageInfo::new("web", "web").with_script("build", "tsc")
        ]);
        let web = packages.get(&PackageName::from("web")).unwrap();

        let output = resolver.resolve(web, &packages);
        // `lint` has no script here so its definition is dropped; the
        // grouping task survives unconditionally.
        assert_eq!(
            output.definitions.keys().collect::<Vec<_>>(),
            vec!["build", "ci"]
        );
        assert!(!output.definitions["ci"].script);
        assert_eq!(
            output.definitions["build"].depends_on,
            vec![DependencySpec::DependencyPackages("build".to_owned())]
        );
    }

    #[test]
    fn test_package_override_splices_global_list() {
        let config = config(
            r#"{
                "lockfile": "lock",
                "tasks": {"build": {"dependsOn": ["^build"]}}
            }"#,
        );
        let resolver = TaskDefinitionResolver::new(&config);
        let tasks: TaskDefinitions = serde_json::from_str(
            r#"{"build": {"dependsOn": ["codegen", "..."]}}"#,
        )
        .unwrap();
        let packages = package_set(vec![PackageInfo::new("web", "web")
            .with_script("build", "tsc")
            .with_script("codegen", "gen")
            .with_tasks(tasks)]);
        let web = packages.get(&PackageName::from("web")).unwrap();

        let output = resolver.resolve(web, &packages);
        assert_eq!(
            output.definitions["build"].depends_on,
            vec![
                DependencySpec::Task("codegen".to_owned()),
                DependencySpec::DependencyPackages("build".to_owned()),
            ]
        );
    }

    #[test]
    fn test_unknown_package_reference_is_surfaced_not_fatal() {
        let config = config(
            r#"{
                "lockfile": "lock",
                "tasks": {"build": {"dependsOn": ["@ghost#build"]}}
            }"#,
        );
        let resolver = TaskDefinitionResolver::new(&config);
        let packages =
            package_set(vec![PackageInfo::new("web", "web").with_script("build", "tsc")]);
        let web = packages.get(&PackageName::from("web")).unwrap();

        let output = resolver.resolve(web, &packages);
        // The reference is kept so the graph builder can reject it if it is
        // actually reached, but the problem is surfaced immediately.
        assert_eq!(
            output.definitions["build"].depends_on,
            vec![DependencySpec::Package {
                package: "ghost".to_owned(),
                task: "build".to_owned(),
            }]
        );
        assert_eq!(output.warnings.len(), 1);
        assert!(output.warnings[0].reason.contains("ghost"));
    }

    #[test]
    fn test_allow_list_drops_references() {
        let config = config(
            r#"{
                "lockfile": "lock",
                "allowedReferences": ["build"],
                "tasks": {
                    "build": {"dependsOn": ["^build", "codegen"]},
                    "codegen": {}
                }
            }"#,
        );
        let resolver = TaskDefinitionResolver::new(&config);
        let packages = package_set(vec![PackageInfo::new("web", "web")
            .with_script("build", "tsc")
            .with_script("codegen", "gen")]);
        let web = packages.get(&PackageName::from("web")).unwrap();

        let output = resolver.resolve(web, &packages);
        assert_eq!(
            output.definitions["build"].depends_on,
            vec![DependencySpec::DependencyPackages("build".to_owned())]
        );
    }

    #[test]
    fn test_resolution_is_memoized_per_package() {
        let config = config(r#"{"lockfile": "lock", "tasks": {"build": {}}}"#);
        let resolver = TaskDefinitionResolver::new(&config);
        let packages = package_set(vec![
            PackageInfo::new("a", "a").with_script("build", "tsc"),
            PackageInfo::new("b", "b"),
        ]);
        let a = packages.get(&PackageName::from("a")).unwrap();
        let b = packages.get(&PackageName::from("b")).unwrap();

        let first = resolver.resolve(a, &packages);
        let second = resolver.resolve(a, &packages);
        assert!(Arc::ptr_eq(&first, &second));

        // A package with a different script set resolves independently even
        // though the global definitions are shared.
        let other = resolver.resolve(b, &packages);
        assert!(!Arc::ptr_eq(&first, &other));
        assert!(other.definitions.is_empty());
    }
}
