//! Mermaid flowchart rendering of the built task graph, for embedding in
//! markdown. Ordering edges render with a dotted link.

use std::io::{self, Write};

use itertools::Itertools;
use petgraph::visit::EdgeRef;

use crate::{Built, EdgeKind, Engine, TaskNode};

pub fn render_mermaid<W: Write>(engine: &Engine<Built>, writer: &mut W) -> io::Result<()> {
    writeln!(writer, "graph TD")?;

    let graph = engine.task_graph();
    let mut lines = Vec::new();
    for edge in graph.edge_references() {
        let (Some(TaskNode::Task(source)), Some(TaskNode::Task(target))) = (
            graph.node_weight(edge.source()),
            graph.node_weight(edge.target()),
        ) else {
            continue;
        };
        let arrow = match edge.weight() {
            EdgeKind::Strong => "-->",
            EdgeKind::Ordering => "-.->",
        };
        lines.push(format!(
            "\t{}(\"{source}\") {arrow} {}(\"{target}\")",
            node_id(&source.to_string()),
            node_id(&target.to_string()),
        ));
    }
    for line in lines.iter().sorted() {
        writeln!(writer, "{line}")?;
    }
    Ok(())
}

/// Mermaid node ids cannot contain `#`; derive a safe identifier from the
/// task id.
fn node_id(task_id: &str) -> String {
    task_id.replace(['#', '-', '.', '/', '@'], "_")
}
