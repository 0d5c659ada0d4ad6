#![deny(clippy::all)]
//! Task graph engine.
//!
//! The resolver turns configuration documents into per-package task
//! definitions; the builder turns resolved definitions plus a set of
//! requested task names into the executable leaf-task DAG. The sealed
//! `Engine<Built>` is what the scheduler walks.

mod builder;
mod dot;
mod mermaid;
mod resolver;

use std::{
    collections::{HashMap, HashSet},
    fmt,
};

pub use builder::{BuilderError, EngineBuilder};
use camino::Utf8PathBuf;
pub use dot::render_dot;
use hoist_task_id::TaskId;
pub use mermaid::render_mermaid;
use petgraph::{graph::NodeIndex, Direction, Graph};
pub use resolver::{
    ResolutionWarning, ResolvedDefinitions, ResolverOutput, TaskDefinition, TaskDefinitionResolver,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskNode {
    Root,
    Task(TaskId<'static>),
}

impl From<TaskId<'static>> for TaskNode {
    fn from(value: TaskId<'static>) -> Self {
        Self::Task(value)
    }
}

impl fmt::Display for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskNode::Root => f.write_str("___ROOT___"),
            TaskNode::Task(task) => task.fmt(f),
        }
    }
}

/// Strong edges gate execution and propagate failure; ordering edges only
/// sequence tasks that both happen to be scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Strong,
    Ordering,
}

/// A concrete executable unit: one script invocation in one package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafTask {
    pub task_id: TaskId<'static>,
    /// Package directory, relative to the workspace root.
    pub package_dir: Utf8PathBuf,
    pub command: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub cache: bool,
}

#[derive(Debug, Default)]
pub struct Building;
#[derive(Debug, Default)]
pub struct Built;

#[derive(Debug)]
pub struct Engine<S = Built> {
    marker: std::marker::PhantomData<S>,
    task_graph: Graph<TaskNode, EdgeKind>,
    root_index: NodeIndex,
    task_lookup: HashMap<TaskId<'static>, NodeIndex>,
    leaf_tasks: HashMap<TaskId<'static>, LeafTask>,
    levels: Vec<u32>,
    weights: Vec<u32>,
    warnings: Vec<ResolutionWarning>,
}

impl Engine<Building> {
    pub fn new() -> Self {
        let mut task_graph = Graph::default();
        let root_index = task_graph.add_node(TaskNode::Root);
        Self {
            marker: std::marker::PhantomData,
            task_graph,
            root_index,
            task_lookup: HashMap::default(),
            leaf_tasks: HashMap::default(),
            levels: Vec::new(),
            weights: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn get_index(&mut self, task_id: &TaskId<'static>) -> NodeIndex {
        self.task_lookup.get(task_id).copied().unwrap_or_else(|| {
            let index = self.task_graph.add_node(TaskNode::Task(task_id.clone()));
            self.task_lookup.insert(task_id.clone(), index);
            index
        })
    }

    pub fn add_leaf_task(&mut self, leaf: LeafTask) -> NodeIndex {
        let index = self.get_index(&leaf.task_id);
        self.leaf_tasks.insert(leaf.task_id.clone(), leaf);
        index
    }

    pub fn add_edge(&mut self, source: NodeIndex, target: NodeIndex, kind: EdgeKind) {
        self.task_graph.add_edge(source, target, kind);
    }

    pub fn connect_to_root(&mut self, task_id: &TaskId<'static>) {
        let source = self.get_index(task_id);
        self.task_graph
            .add_edge(source, self.root_index, EdgeKind::Strong);
    }

    pub fn has_outgoing(&self, index: NodeIndex) -> bool {
        self.task_graph
            .neighbors_directed(index, Direction::Outgoing)
            .next()
            .is_some()
    }

    pub fn add_warnings(&mut self, warnings: impl IntoIterator<Item = ResolutionWarning>) {
        self.warnings.extend(warnings);
    }

    /// Validate the graph and seal it against further mutation, computing
    /// each node's level and critical-path weight.
    pub fn seal(self) -> Result<Engine<Built>, hoist_graph_utils::Error> {
        hoist_graph_utils::validate_graph(&self.task_graph)?;

        let levels = self.compute_levels();
        let weights = hoist_graph_utils::critical_path_weights(&self.task_graph);

        let Engine {
            task_graph,
            root_index,
            task_lookup,
            leaf_tasks,
            warnings,
            ..
        } = self;
        Ok(Engine {
            marker: std::marker::PhantomData,
            task_graph,
            root_index,
            task_lookup,
            leaf_tasks,
            levels,
            weights,
            warnings,
        })
    }

    /// Longest path from a root of the DAG, ignoring the synthetic root
    /// node: a task with no real dependencies sits at level 0.
    fn compute_levels(&self) -> Vec<u32> {
        fn level_of(
            graph: &Graph<TaskNode, EdgeKind>,
            root_index: NodeIndex,
            node: NodeIndex,
            levels: &mut [u32],
        ) -> u32 {
            if levels[node.index()] != u32::MAX {
                return levels[node.index()];
            }
            let level = graph
                .neighbors_directed(node, Direction::Outgoing)
                .filter(|dep| *dep != root_index)
                .map(|dep| level_of(graph, root_index, dep, levels) + 1)
                .max()
                .unwrap_or(0);
            levels[node.index()] = level;
            level
        }

        let mut levels = vec![u32::MAX; self.task_graph.node_count()];
        for node in self.task_graph.node_indices() {
            level_of(&self.task_graph, self.root_index, node, &mut levels);
        }
        levels
    }
}

impl Default for Engine<Building> {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine<Built> {
    /// Every node this task points at, regardless of edge kind.
    pub fn dependencies(&self, task_id: &TaskId) -> Option<HashSet<&TaskNode>> {
        self.neighbors(task_id, Direction::Outgoing)
    }

    pub fn dependents(&self, task_id: &TaskId) -> Option<HashSet<&TaskNode>> {
        self.neighbors(task_id, Direction::Incoming)
    }

    fn neighbors(&self, task_id: &TaskId, direction: Direction) -> Option<HashSet<&TaskNode>> {
        let index = self.task_lookup.get(task_id)?;
        Some(
            self.task_graph
                .neighbors_directed(*index, direction)
                .map(|index| {
                    self.task_graph
                        .node_weight(index)
                        .expect("node index should be present")
                })
                .collect(),
        )
    }

    /// Strong dependencies only; ordering edges are invisible to fingerprint
    /// computation.
    pub fn strong_dependencies(&self, task_id: &TaskId) -> Vec<&TaskId<'static>> {
        use petgraph::visit::EdgeRef;

        let Some(index) = self.task_lookup.get(task_id) else {
            return Vec::new();
        };
        self.task_graph
            .edges_directed(*index, Direction::Outgoing)
            .filter(|edge| *edge.weight() == EdgeKind::Strong)
            .filter_map(|edge| match self.task_graph.node_weight(edge.target()) {
                Some(TaskNode::Task(task_id)) => Some(task_id),
                _ => None,
            })
            .collect()
    }

    pub fn leaf_task<'a>(&'a self, task_id: &TaskId<'a>) -> Option<&'a LeafTask> {
        self.leaf_tasks.get(task_id)
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &TaskId<'static>> {
        self.leaf_tasks.keys()
    }

    pub fn len(&self) -> usize {
        self.leaf_tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaf_tasks.is_empty()
    }

    pub fn level(&self, task_id: &TaskId) -> u32 {
        self.task_lookup
            .get(task_id)
            .map(|index| self.levels[index.index()])
            .unwrap_or(0)
    }

    pub fn weight(&self, task_id: &TaskId) -> u32 {
        self.task_lookup
            .get(task_id)
            .map(|index| self.weights[index.index()])
            .unwrap_or(0)
    }

    pub fn warnings(&self) -> &[ResolutionWarning] {
        &self.warnings
    }

    /// Graph access for the scheduler and for rendering.
    pub fn task_graph(&self) -> &Graph<TaskNode, EdgeKind> {
        &self.task_graph
    }

    pub fn root_index(&self) -> NodeIndex {
        self.root_index
    }

    pub fn task_lookup(&self) -> &HashMap<TaskId<'static>, NodeIndex> {
        &self.task_lookup
    }
}
