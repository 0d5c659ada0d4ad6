//! Dot-format rendering of the built task graph. Ordering edges render
//! dashed so weak sequencing is visually distinct from hard dependencies.

use std::io::{self, Write};

use itertools::Itertools;
use petgraph::visit::EdgeRef;

use crate::{Built, EdgeKind, Engine, TaskNode};

pub fn render_dot<W: Write>(engine: &Engine<Built>, writer: &mut W) -> io::Result<()> {
    writeln!(writer, "digraph tasks {{")?;

    let graph = engine.task_graph();
    for node in graph.node_indices() {
        if let Some(TaskNode::Task(task_id)) = graph.node_weight(node) {
            writeln!(writer, "\t\"{task_id}\"")?;
        }
    }

    let mut lines = Vec::new();
    for edge in graph.edge_references() {
        let (Some(TaskNode::Task(source)), Some(TaskNode::Task(target))) = (
            graph.node_weight(edge.source()),
            graph.node_weight(edge.target()),
        ) else {
            // Edges to the synthetic root carry no information worth drawing.
            continue;
        };
        let style = match edge.weight() {
            EdgeKind::Strong => "",
            EdgeKind::Ordering => " [style=dashed]",
        };
        lines.push(format!("\t\"{source}\" -> \"{target}\"{style}"));
    }
    writeln!(writer, "{}", lines.iter().sorted().join("\n"))?;

    writeln!(writer, "}}")
}
