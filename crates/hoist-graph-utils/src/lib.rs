#![deny(clippy::all)]
//! Additional utilities to be used with `petgraph`.
//! Provides cycle detection with cycle extraction and the critical-path
//! weight assignment used for scheduling priority.

use std::fmt::Display;

use itertools::Itertools;
use petgraph::prelude::*;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Cyclic dependency detected:\n\t{cycle_line}")]
    CyclicDependencies { cycle_line: String },
    #[error("{0} depends on itself")]
    SelfDependency(String),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Look for a cycle using a three-color depth first search. Returns the nodes
/// of the first cycle found, in dependency order.
pub fn find_cycle<N, E>(graph: &Graph<N, E>) -> Option<Vec<NodeIndex>> {
    let mut colors = vec![Color::White; graph.node_count()];
    let mut stack = Vec::new();

    for start in graph.node_indices() {
        if colors[start.index()] == Color::White {
            if let Some(cycle) = visit(graph, start, &mut colors, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

fn visit<N, E>(
    graph: &Graph<N, E>,
    node: NodeIndex,
    colors: &mut [Color],
    stack: &mut Vec<NodeIndex>,
) -> Option<Vec<NodeIndex>> {
    colors[node.index()] = Color::Gray;
    stack.push(node);

    for next in graph.neighbors_directed(node, Direction::Outgoing) {
        match colors[next.index()] {
            // A gray node is on the current DFS path: the slice of the stack
            // from its position onward is the cycle.
            Color::Gray => {
                let position = stack
                    .iter()
                    .position(|n| *n == next)
                    .expect("gray node must be on the stack");
                return Some(stack[position..].to_vec());
            }
            Color::White => {
                if let Some(cycle) = visit(graph, next, colors, stack) {
                    return Some(cycle);
                }
            }
            Color::Black => {}
        }
    }

    stack.pop();
    colors[node.index()] = Color::Black;
    None
}

pub fn validate_graph<N: Display, E>(graph: &Graph<N, E>) -> Result<(), Error> {
    for edge in graph.edge_references() {
        if edge.source() == edge.target() {
            let node = graph
                .node_weight(edge.source())
                .expect("edge pointed to missing node");
            return Err(Error::SelfDependency(node.to_string()));
        }
    }

    if let Some(cycle) = find_cycle(graph) {
        let cycle_line = cycle
            .into_iter()
            .map(|id| graph.node_weight(id).unwrap())
            .format(" -> ")
            .to_string();
        return Err(Error::CyclicDependencies { cycle_line });
    }

    Ok(())
}

/// Longest remaining chain of dependents above each node. A node nothing
/// depends on has weight 0. The graph must already be validated as acyclic.
pub fn critical_path_weights<N, E>(graph: &Graph<N, E>) -> Vec<u32> {
    let mut weights = vec![u32::MAX; graph.node_count()];
    for node in graph.node_indices() {
        weight_of(graph, node, &mut weights);
    }
    weights
}

fn weight_of<N, E>(graph: &Graph<N, E>, node: NodeIndex, weights: &mut [u32]) -> u32 {
    if weights[node.index()] != u32::MAX {
        return weights[node.index()];
    }
    // Mark before recursing so accidental cycles fail loudly in tests rather
    // than overflowing the stack silently. Validated graphs never hit this.
    weights[node.index()] = 0;
    let weight = graph
        .neighbors_directed(node, Direction::Incoming)
        .map(|dependent| weight_of(graph, dependent, weights) + 1)
        .max()
        .unwrap_or(0);
    weights[node.index()] = weight;
    weight
}
