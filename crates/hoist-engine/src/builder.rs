//! Graph construction.
//!
//! The builder materializes the requested task names into leaf tasks,
//! walking strong dependency references breadth-first so everything a
//! requested task needs ends up in the graph. Grouping tasks are expanded to
//! their leaf descendants and have no runtime identity of their own. Weak
//! `before`/`after` references add ordering edges between tasks that are
//! already scheduled and never materialize anything new.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::Arc,
};

use hoist_repository::{PackageName, PackageSet};
use hoist_task_id::{DependencySpec, TaskId};
use petgraph::graph::NodeIndex;
use tracing::debug;

use crate::{
    Building, Built, EdgeKind, Engine, LeafTask, ResolvedDefinitions, ResolverOutput,
    TaskDefinition, TaskDefinitionResolver,
};

type PackageTask = (PackageName, String);

pub struct EngineBuilder<'a> {
    package_set: &'a PackageSet,
    resolver: &'a TaskDefinitionResolver<'a>,
    tasks: Vec<String>,
}

impl<'a> EngineBuilder<'a> {
    pub fn new(package_set: &'a PackageSet, resolver: &'a TaskDefinitionResolver<'a>) -> Self {
        Self {
            package_set,
            resolver,
            tasks: Vec::new(),
        }
    }

    pub fn with_tasks<I, S>(mut self, tasks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tasks = tasks.into_iter().map(Into::into).collect();
        self
    }

    pub fn build(self) -> Result<Engine<Built>, BuilderError> {
        let mut engine = Engine::default();

        // An empty request is a no-op build, not an error.
        if self.tasks.is_empty() {
            return Ok(engine.seal()?);
        }

        let resolved: BTreeMap<PackageName, Arc<ResolverOutput>> = self
            .package_set
            .packages()
            .map(|package| {
                (
                    package.name.clone(),
                    self.resolver.resolve(package, self.package_set),
                )
            })
            .collect();
        for output in resolved.values() {
            engine.add_warnings(output.warnings.iter().cloned());
        }

        let mut build = GraphBuild {
            package_set: self.package_set,
            resolved: &resolved,
            engine,
            materialized: Vec::new(),
            materialized_set: HashSet::new(),
            leaves: HashMap::new(),
            edges: HashSet::new(),
            empty: ResolvedDefinitions::new(),
        };

        build.materialize_requested(&self.tasks)?;
        build.add_strong_edges()?;
        build.add_ordering_edges();
        build.connect_roots();

        if build.leaf_count() == 0 {
            return Err(BuilderError::NoTasksMaterialized {
                names: self.tasks.join(", "),
            });
        }

        Ok(build.engine.seal()?)
    }
}

struct GraphBuild<'a> {
    package_set: &'a PackageSet,
    resolved: &'a BTreeMap<PackageName, Arc<ResolverOutput>>,
    engine: Engine<Building>,
    /// Materialization order, kept for deterministic edge construction.
    materialized: Vec<PackageTask>,
    materialized_set: HashSet<PackageTask>,
    /// Leaf descendants of every materialized task, groups included.
    leaves: HashMap<PackageTask, Vec<TaskId<'static>>>,
    edges: HashSet<(NodeIndex, NodeIndex)>,
    empty: ResolvedDefinitions,
}

impl GraphBuild<'_> {
    fn definitions(&self, package: &PackageName) -> &ResolvedDefinitions {
        self.resolved
            .get(package)
            .map(|output| &output.definitions)
            .unwrap_or(&self.empty)
    }

    fn definition(&self, key: &PackageTask) -> Option<&TaskDefinition> {
        self.definitions(&key.0).get(&key.1)
    }

    fn leaf_count(&self) -> usize {
        self.materialized
            .iter()
            .filter_map(|key| self.definition(key))
            .filter(|def| def.script)
            .count()
    }

    /// Walk the materialization closure: requested tasks, their children,
    /// and every strong dependency target, breadth-first.
    fn materialize_requested(&mut self, tasks: &[String]) -> Result<(), BuilderError> {
        let mut queue: VecDeque<PackageTask> = VecDeque::new();
        for package in self.package_set.packages() {
            for task in tasks {
                if self.definitions(&package.name).contains_key(task) {
                    queue.push_back((package.name.clone(), task.clone()));
                }
            }
        }

        while let Some(key) = queue.pop_front() {
            if !self.materialized_set.insert(key.clone()) {
                continue;
            }
            self.materialized.push(key.clone());

            let definition = self
                .definition(&key)
                .expect("queued tasks always have definitions")
                .clone();
            let (package_name, task_name) = &key;

            if definition.script {
                let package = self
                    .package_set
                    .get(package_name)
                    .expect("resolved packages exist in the package set");
                let command = package
                    .script(task_name)
                    .expect("script-backed definitions are only retained with a script")
                    .to_owned();
                self.engine.add_leaf_task(LeafTask {
                    task_id: TaskId::from_owned(package_name.to_string(), task_name.clone()),
                    package_dir: package.dir.clone(),
                    command,
                    inputs: definition.inputs.clone(),
                    outputs: definition.outputs.clone(),
                    cache: definition.cache,
                });
            } else {
                for child in &definition.children {
                    let child_key = (package_name.clone(), child.clone());
                    if self.definition(&child_key).is_some() {
                        queue.push_back(child_key);
                    } else {
                        // The child was either dropped by the script-backed
                        // retention rule or never defined; the group's leaf
                        // set is simply smaller.
                        debug!("skipping child task `{child}` of {package_name}#{task_name}");
                    }
                }
            }

            for spec in &definition.depends_on {
                for target in self.strong_targets(&key, spec)? {
                    queue.push_back(target);
                }
            }
        }

        // Expand every materialized task to its leaf descendants now that
        // the closure is complete.
        for key in self.materialized.clone() {
            let mut in_progress = Vec::new();
            self.leaves_of(&key, &mut in_progress)?;
        }
        Ok(())
    }

    fn leaves_of(
        &mut self,
        key: &PackageTask,
        in_progress: &mut Vec<PackageTask>,
    ) -> Result<Vec<TaskId<'static>>, BuilderError> {
        if let Some(leaves) = self.leaves.get(key) {
            return Ok(leaves.clone());
        }
        if in_progress.contains(key) {
            let cycle = in_progress
                .iter()
                .map(|(_, task)| task.as_str())
                .chain([key.1.as_str()])
                .collect::<Vec<_>>()
                .join(" -> ");
            return Err(BuilderError::ChildCycle {
                package: key.0.to_string(),
                cycle,
            });
        }

        let Some(definition) = self.definition(key).cloned() else {
            return Ok(Vec::new());
        };

        let leaves = if definition.script {
            vec![TaskId::from_owned(key.0.to_string(), key.1.clone())]
        } else {
            in_progress.push(key.clone());
            let mut collected = Vec::new();
            for child in &definition.children {
                let child_key = (key.0.clone(), child.clone());
                for leaf in self.leaves_of(&child_key, in_progress)? {
                    if !collected.contains(&leaf) {
                        collected.push(leaf);
                    }
                }
            }
            in_progress.pop();
            collected
        };

        self.leaves.insert(key.clone(), leaves.clone());
        Ok(leaves)
    }

    /// Resolve a strong reference to the `(package, task)` pairs it targets.
    /// A reference to a task a package simply doesn't define is dormant; a
    /// reference naming a package that does not exist is fatal.
    fn strong_targets(
        &self,
        owner: &PackageTask,
        spec: &DependencySpec,
    ) -> Result<Vec<PackageTask>, BuilderError> {
        let (owner_package, owner_task) = owner;
        Ok(match spec {
            DependencySpec::Task(task) => {
                if task != owner_task && self.definitions(owner_package).contains_key(task) {
                    vec![(owner_package.clone(), task.clone())]
                } else {
                    debug!("no task `{task}` to depend on in package {owner_package}");
                    vec![]
                }
            }
            DependencySpec::DependencyPackages(task) => self
                .package_set
                .immediate_dependencies(owner_package)
                .iter()
                .filter(|dependency| self.definitions(dependency).contains_key(task))
                .map(|dependency| (dependency.clone(), task.clone()))
                .collect(),
            DependencySpec::AllDependencyTasks => self
                .package_set
                .immediate_dependencies(owner_package)
                .iter()
                .flat_map(|dependency| {
                    self.definitions(dependency)
                        .keys()
                        .map(|task| (dependency.clone(), task.clone()))
                })
                .collect(),
            DependencySpec::Package { package, task } => {
                let package_name = PackageName::from(package.as_str());
                if !self.package_set.contains(&package_name) {
                    return Err(BuilderError::UnknownPackage {
                        package: package.clone(),
                        task: format!("{owner_package}#{owner_task}"),
                        reference: spec.to_string(),
                    });
                }
                if self.definitions(&package_name).contains_key(task) {
                    vec![(package_name, task.clone())]
                } else {
                    debug!("no task `{task}` to depend on in package {package}");
                    vec![]
                }
            }
            // `*` is rejected for `dependsOn` during validation and
            // resolution; `...` is spliced away during merging.
            DependencySpec::AllSiblings | DependencySpec::Inherit => vec![],
        })
    }

    /// Resolve a weak reference to already-scheduled tasks only.
    fn ordering_targets(&self, owner: &PackageTask, spec: &DependencySpec) -> Vec<PackageTask> {
        let (owner_package, owner_task) = owner;
        let scheduled = |key: &PackageTask| self.materialized_set.contains(key);
        match spec {
            DependencySpec::Task(task) => {
                let key = (owner_package.clone(), task.clone());
                if task != owner_task && scheduled(&key) {
                    vec![key]
                } else {
                    vec![]
                }
            }
            DependencySpec::DependencyPackages(task) => self
                .package_set
                .immediate_dependencies(owner_package)
                .iter()
                .map(|dependency| (dependency.clone(), task.clone()))
                .filter(scheduled)
                .collect(),
            DependencySpec::AllSiblings => self
                .materialized
                .iter()
                .filter(|(package, task)| package == owner_package && task != owner_task)
                .cloned()
                .collect(),
            DependencySpec::AllDependencyTasks => {
                let dependencies = self.package_set.immediate_dependencies(owner_package);
                self.materialized
                    .iter()
                    .filter(|(package, _)| dependencies.contains(package))
                    .cloned()
                    .collect()
            }
            DependencySpec::Package { package, task } => {
                let key = (PackageName::from(package.as_str()), task.clone());
                if scheduled(&key) {
                    vec![key]
                } else {
                    vec![]
                }
            }
            DependencySpec::Inherit => vec![],
        }
    }

    fn add_strong_edges(&mut self) -> Result<(), BuilderError> {
        for key in self.materialized.clone() {
            let Some(definition) = self.definition(&key).cloned() else {
                continue;
            };
            let sources = self.leaves[&key].clone();
            for spec in &definition.depends_on {
                for target in self.strong_targets(&key, spec)? {
                    let targets = self.leaves[&target].clone();
                    self.add_edges(&sources, &targets, EdgeKind::Strong);
                }
            }
        }
        Ok(())
    }

    fn add_ordering_edges(&mut self) {
        for key in self.materialized.clone() {
            let Some(definition) = self.definition(&key).cloned() else {
                continue;
            };
            let own = self.leaves[&key].clone();

            // `before: [T]` puts this task ahead of T: T gains an ordering
            // dependency on this task.
            for spec in &definition.before {
                for target in self.ordering_targets(&key, spec) {
                    let targets = self.leaves[&target].clone();
                    self.add_edges(&targets, &own, EdgeKind::Ordering);
                }
            }
            // `after: [T]` is the mirror: this task gains an ordering
            // dependency on T.
            for spec in &definition.after {
                for target in self.ordering_targets(&key, spec) {
                    let targets = self.leaves[&target].clone();
                    self.add_edges(&own, &targets, EdgeKind::Ordering);
                }
            }
        }
    }

    fn add_edges(&mut self, sources: &[TaskId<'static>], targets: &[TaskId<'static>], kind: EdgeKind) {
        for source in sources {
            for target in targets {
                if source == target {
                    continue;
                }
                let source_index = self.engine.get_index(source);
                let target_index = self.engine.get_index(target);
                if self.edges.insert((source_index, target_index)) {
                    self.engine.add_edge(source_index, target_index, kind);
                }
            }
        }
    }

    fn connect_roots(&mut self) {
        let leaf_ids: Vec<TaskId<'static>> = self
            .materialized
            .iter()
            .filter(|key| self.definition(key).is_some_and(|def| def.script))
            .map(|(package, task)| TaskId::from_owned(package.to_string(), task.clone()))
            .collect();
        for task_id in leaf_ids {
            let index = self.engine.get_index(&task_id);
            if !self.engine.has_outgoing(index) {
                self.engine.connect_to_root(&task_id);
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuilderError {
    #[error("{task} depends on `{reference}`, but package `{package}` does not exist")]
    UnknownPackage {
        package: String,
        task: String,
        reference: String,
    },
    #[error("cyclic task grouping in package `{package}`: {cycle}")]
    ChildCycle { package: String, cycle: String },
    #[error("no tasks were materialized for the requested names: {names}")]
    NoTasksMaterialized { names: String },
    #[error(transparent)]
    Graph(#[from] hoist_graph_utils::Error),
}

#[cfg(test)]
mod test {
    use std::collections::{HashMap, HashSet};

    use camino::Utf8Path;
    use hoist_config::WorkspaceConfig;
    use hoist_repository::{PackageDependency, PackageInfo};
    use pretty_assertions::assert_eq;
    use semver::{Version, VersionReq};

    use super::*;
    use crate::TaskNode;

    fn config(json: &str) -> WorkspaceConfig {
        WorkspaceConfig::parse(json, Utf8Path::new("hoist.json")).unwrap()
    }

    macro_rules! deps {
        {$($key:expr => $value:expr),* $(,)?} => {
            {
                let mut _map = HashMap::new();
                $(
                let key = TaskId::try_from($key).unwrap();
                let value = $value.iter().copied().map(|x| {
                    if x == "___ROOT___" {
                        TaskNode::Root
                    } else {
                        TaskNode::Task(TaskId::try_from(x).unwrap())
                    }
                }).collect::<HashSet<_>>();
                _map.insert(key, value);
                )*
                _map
            }
        };
    }

    fn all_dependencies(engine: &Engine<Built>) -> HashMap<TaskId<'static>, HashSet<TaskNode>> {
        engine
            .task_ids()
            .filter_map(|task_id| {
                let deps = engine.dependencies(task_id)?;
                Some((task_id.clone(), deps.into_iter().cloned().collect()))
            })
            .collect()
    }

    fn build_engine(
        config: &WorkspaceConfig,
        packages: &PackageSet,
        tasks: &[&str],
    ) -> Result<Engine<Built>, BuilderError> {
        let resolver = TaskDefinitionResolver::new(config);
        EngineBuilder::new(packages, &resolver)
            .with_tasks(tasks.iter().copied())
            .build()
    }

    fn three_scripted_packages() -> PackageSet {
        let scripted = |name: &str| {
            PackageInfo::new(name, name)
                .with_script("build", "build it")
                .with_script("test", "test it")
                .with_script("prepare", "prepare it")
        };
        PackageSet::new(vec![
            scripted("a"),
            scripted("b"),
            scripted("c")
                .with_dependency(PackageDependency::any("a"))
                .with_dependency(PackageDependency::any("b")),
        ])
        .unwrap()
    }

    #[test]
    fn test_default_engine() {
        let config = config(
            r#"{
                "lockfile": "lock",
                "tasks": {
                    "test": {"dependsOn": ["^build", "prepare"]},
                    "build": {"dependsOn": ["^build", "prepare"]},
                    "prepare": {}
                }
            }"#,
        );
        let packages = three_scripted_packages();
        let engine = build_engine(&config, &packages, &["test"]).unwrap();

        let expected = deps! {
            "a#test" => ["a#prepare"],
            "a#build" => ["a#prepare"],
            "a#prepare" => ["___ROOT___"],
            "b#test" => ["b#prepare"],
            "b#build" => ["b#prepare"],
            "b#prepare" => ["___ROOT___"],
            "c#prepare" => ["___ROOT___"],
            "c#test" => ["a#build", "b#build", "c#prepare"],
        };
        assert_eq!(all_dependencies(&engine), expected);
    }

    #[test]
    fn test_levels_follow_the_dependency_chain() {
        let config = config(
            r#"{"lockfile": "lock", "tasks": {"build": {"dependsOn": ["^build"]}}}"#,
        );
        let packages = PackageSet::new(vec![
            PackageInfo::new("a", "a").with_script("build", "x"),
            PackageInfo::new("b", "b")
                .with_script("build", "x")
                .with_dependency(PackageDependency::any("a")),
            PackageInfo::new("c", "c")
                .with_script("build", "x")
                .with_dependency(PackageDependency::any("b")),
        ])
        .unwrap();
        let engine = build_engine(&config, &packages, &["build"]).unwrap();

        let level = |id: &str| engine.level(&TaskId::try_from(id).unwrap());
        assert_eq!(level("a#build"), 0);
        assert_eq!(level("b#build"), 1);
        assert_eq!(level("c#build"), 2);

        let weight = |id: &str| engine.weight(&TaskId::try_from(id).unwrap());
        assert_eq!(weight("a#build"), 2);
        assert_eq!(weight("b#build"), 1);
        assert_eq!(weight("c#build"), 0);
    }

    #[test]
    fn test_weak_dependency_is_dormant() {
        let config = config(
            r#"{
                "lockfile": "lock",
                "tasks": {"clean": {"before": ["build"], "cache": false}, "build": {}}
            }"#,
        );
        let packages = PackageSet::new(vec![PackageInfo::new("p", "p")
            .with_script("clean", "rm -rf dist")
            .with_script("build", "build it")])
        .unwrap();
        let engine = build_engine(&config, &packages, &["clean"]).unwrap();

        let expected = deps! {
            "p#clean" => ["___ROOT___"],
        };
        assert_eq!(all_dependencies(&engine), expected);
    }

    #[test]
    fn test_weak_dependency_activates_when_both_scheduled() {
        let config = config(
            r#"{
                "lockfile": "lock",
                "tasks": {"clean": {"before": ["build"], "cache": false}, "build": {}}
            }"#,
        );
        let packages = PackageSet::new(vec![PackageInfo::new("p", "p")
            .with_script("clean", "rm -rf dist")
            .with_script("build", "build it")])
        .unwrap();
        let engine = build_engine(&config, &packages, &["clean", "build"]).unwrap();

        let expected = deps! {
            "p#clean" => ["___ROOT___"],
            "p#build" => ["p#clean"],
        };
        assert_eq!(all_dependencies(&engine), expected);
    }

    #[test]
    fn test_after_mirrors_before() {
        let config = config(
            r#"{
                "lockfile": "lock",
                "tasks": {"docs": {"after": ["build"]}, "build": {}}
            }"#,
        );
        let packages = PackageSet::new(vec![PackageInfo::new("p", "p")
            .with_script("docs", "docs")
            .with_script("build", "build")])
        .unwrap();
        let engine = build_engine(&config, &packages, &["docs", "build"]).unwrap();

        let expected = deps! {
            "p#build" => ["___ROOT___"],
            "p#docs" => ["p#build"],
        };
        assert_eq!(all_dependencies(&engine), expected);
    }

    #[test]
    fn test_star_orders_against_all_scheduled_siblings() {
        let config = config(
            r#"{
                "lockfile": "lock",
                "tasks": {"clean": {"before": ["*"], "cache": false}, "build": {}, "lint": {}}
            }"#,
        );
        let packages = PackageSet::new(vec![PackageInfo::new("p", "p")
            .with_script("clean", "clean")
            .with_script("build", "build")
            .with_script("lint", "lint")])
        .unwrap();
        let engine = build_engine(&config, &packages, &["clean", "build", "lint"]).unwrap();

        let expected = deps! {
            "p#clean" => ["___ROOT___"],
            "p#build" => ["p#clean"],
            "p#lint" => ["p#clean"],
        };
        assert_eq!(all_dependencies(&engine), expected);
    }

    #[test]
    fn test_group_task_expands_to_leaves() {
        let config = config(
            r#"{
                "lockfile": "lock",
                "tasks": {
                    "ci": {"script": false, "children": ["build", "lint"], "dependsOn": ["prepare"]},
                    "deploy": {"dependsOn": ["ci"]},
                    "build": {},
                    "lint": {},
                    "prepare": {}
                }
            }"#,
        );
        let packages = PackageSet::new(vec![PackageInfo::new("p", "p")
            .with_script("deploy", "deploy")
            .with_script("build", "build")
            .with_script("lint", "lint")
            .with_script("prepare", "prepare")])
        .unwrap();
        let engine = build_engine(&config, &packages, &["deploy"]).unwrap();

        // The grouping task has no node of its own: depending on it means
        // depending on its leaves, and its own dependsOn lands on each leaf.
        let expected = deps! {
            "p#deploy" => ["p#build", "p#lint"],
            "p#build" => ["p#prepare"],
            "p#lint" => ["p#prepare"],
            "p#prepare" => ["___ROOT___"],
        };
        assert_eq!(all_dependencies(&engine), expected);
    }

    #[test]
    fn test_grouping_task_with_no_scripts_has_empty_leaves() {
        let config = config(
            r#"{
                "lockfile": "lock",
                "tasks": {
                    "ci": {"script": false, "children": ["build"]},
                    "build": {}
                }
            }"#,
        );
        let packages = PackageSet::new(vec![
            PackageInfo::new("scripted", "scripted").with_script("build", "build"),
            PackageInfo::new("bare", "bare"),
        ])
        .unwrap();
        let engine = build_engine(&config, &packages, &["ci"]).unwrap();

        let expected = deps! {
            "scripted#build" => ["___ROOT___"],
        };
        assert_eq!(all_dependencies(&engine), expected);
    }

    #[test]
    fn test_cross_package_reference() {
        let config = config(
            r#"{
                "lockfile": "lock",
                "tasks": {
                    "build": {"dependsOn": ["@lib#codegen"]},
                    "codegen": {}
                }
            }"#,
        );
        let packages = PackageSet::new(vec![
            PackageInfo::new("app", "app").with_script("build", "build"),
            PackageInfo::new("lib", "lib").with_script("codegen", "gen"),
        ])
        .unwrap();
        let engine = build_engine(&config, &packages, &["build"]).unwrap();

        let expected = deps! {
            "app#build" => ["lib#codegen"],
            "lib#codegen" => ["___ROOT___"],
        };
        assert_eq!(all_dependencies(&engine), expected);
    }

    #[test]
    fn test_unknown_package_in_reached_reference_is_fatal() {
        let config = config(
            r#"{
                "lockfile": "lock",
                "tasks": {"build": {"dependsOn": ["@ghost#build"]}}
            }"#,
        );
        let packages =
            PackageSet::new(vec![PackageInfo::new("app", "app").with_script("build", "build")])
                .unwrap();
        let err = build_engine(&config, &packages, &["build"]).unwrap_err();
        assert!(matches!(err, BuilderError::UnknownPackage { .. }), "{err}");
    }

    #[test]
    fn test_version_skew_drops_cross_package_edges() {
        let config = config(
            r#"{"lockfile": "lock", "tasks": {"build": {"dependsOn": ["^build"]}}}"#,
        );
        let packages = PackageSet::new(vec![
            PackageInfo::new("app", "app")
                .with_script("build", "build")
                .with_dependency(PackageDependency::new(
                    "lib",
                    VersionReq::parse("^2.0.0").unwrap(),
                )),
            PackageInfo::new("lib", "lib")
                .with_script("build", "build")
                .with_version(Version::new(1, 0, 0)),
        ])
        .unwrap();
        let engine = build_engine(&config, &packages, &["build"]).unwrap();

        // lib no longer counts as a dependency of app, so both build tasks
        // are roots.
        let expected = deps! {
            "app#build" => ["___ROOT___"],
            "lib#build" => ["___ROOT___"],
        };
        assert_eq!(all_dependencies(&engine), expected);
    }

    #[test]
    fn test_task_cycle_is_fatal() {
        // Cross-package strong references forming a loop without a package
        // cycle: a#build -> b#build -> a#build.
        let tasks_a: hoist_config::TaskDefinitions =
            serde_json::from_str(r#"{"build": {"dependsOn": ["@b#build"]}}"#).unwrap();
        let tasks_b: hoist_config::TaskDefinitions =
            serde_json::from_str(r#"{"build": {"dependsOn": ["@a#build"]}}"#).unwrap();
        let config = config(r#"{"lockfile": "lock", "tasks": {"build": {}}}"#);
        let packages = PackageSet::new(vec![
            PackageInfo::new("a", "a")
                .with_script("build", "build")
                .with_tasks(tasks_a),
            PackageInfo::new("b", "b")
                .with_script("build", "build")
                .with_tasks(tasks_b),
        ])
        .unwrap();
        let err = build_engine(&config, &packages, &["build"]).unwrap_err();
        assert!(matches!(err, BuilderError::Graph(_)), "{err}");
    }

    #[test]
    fn test_children_cycle_is_fatal() {
        let config = config(
            r#"{
                "lockfile": "lock",
                "tasks": {
                    "outer": {"script": false, "children": ["inner"]},
                    "inner": {"script": false, "children": ["outer"]}
                }
            }"#,
        );
        let packages = PackageSet::new(vec![PackageInfo::new("p", "p")]).unwrap();
        let err = build_engine(&config, &packages, &["outer"]).unwrap_err();
        assert!(matches!(err, BuilderError::ChildCycle { .. }), "{err}");
    }

    #[test]
    fn test_no_tasks_materialized_is_an_error() {
        let config = config(r#"{"lockfile": "lock", "tasks": {"build": {}}}"#);
        let packages = PackageSet::new(vec![PackageInfo::new("p", "p")]).unwrap();
        let err = build_engine(&config, &packages, &["build"]).unwrap_err();
        assert!(
            matches!(err, BuilderError::NoTasksMaterialized { .. }),
            "{err}"
        );
    }

    #[test]
    fn test_empty_request_builds_empty_engine() {
        let config = config(r#"{"lockfile": "lock", "tasks": {"build": {}}}"#);
        let packages =
            PackageSet::new(vec![PackageInfo::new("p", "p").with_script("build", "x")]).unwrap();
        let engine = build_engine(&config, &packages, &[]).unwrap();
        assert!(engine.is_empty());
    }

    #[test]
    fn test_caret_star_depends_on_every_dependency_task() {
        let config = config(
            r#"{
                "lockfile": "lock",
                "tasks": {
                    "release": {"dependsOn": ["^*"]},
                    "build": {},
                    "lint": {}
                }
            }"#,
        );
        let packages = PackageSet::new(vec![
            PackageInfo::new("app", "app")
                .with_script("release", "release")
                .with_dependency(PackageDependency::any("lib")),
            PackageInfo::new("lib", "lib")
                .with_script("build", "build")
                .with_script("lint", "lint"),
        ])
        .unwrap();
        let engine = build_engine(&config, &packages, &["release"]).unwrap();

        let expected = deps! {
            "app#release" => ["lib#build", "lib#lint"],
            "lib#build" => ["___ROOT___"],
            "lib#lint" => ["___ROOT___"],
        };
        assert_eq!(all_dependencies(&engine), expected);
    }
}
