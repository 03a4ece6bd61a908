//! Import graph over image files
//!
//! Nodes are file names, edges point from an importing file to the file it
//! imports. Imports of files the image does not contain are ignored.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

use super::Image;

/// Directed import graph, in image order
pub struct ImportGraph<'a> {
    graph: DiGraph<&'a str, ()>,
    nodes: HashMap<&'a str, NodeIndex>,
}

impl<'a> ImportGraph<'a> {
    pub fn new(image: &'a Image) -> Self {
        let mut graph = DiGraph::new();
        let mut nodes = HashMap::with_capacity(image.file.len());
        for file in &image.file {
            nodes.entry(file.name()).or_insert_with(|| graph.add_node(file.name()));
        }
        for file in &image.file {
            let from = nodes[file.name()];
            for dep in &file.dependency {
                if let Some(&to) = nodes.get(dep.as_str()) {
                    graph.add_edge(from, to, ());
                }
            }
        }
        Self { graph, nodes }
    }

    /// Every file reachable from `roots` through imports, excluding the roots
    /// themselves unless another root imports them
    pub fn transitive_imports<I, S>(&self, roots: I) -> HashSet<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut reached = HashSet::new();
        for root in roots {
            let Some(&start) = self.nodes.get(root.as_ref()) else {
                continue;
            };
            for next in self.graph.neighbors_directed(start, Direction::Outgoing) {
                let mut dfs = Dfs::new(&self.graph, next);
                while let Some(node) = dfs.next(&self.graph) {
                    reached.insert(self.graph[node].to_string());
                }
            }
        }
        reached
    }

    /// Files that nothing imports. Files reachable only through an import
    /// cycle are added so every file is covered by some entry point.
    pub fn entry_points(&self) -> Vec<String> {
        let mut entries: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&n| {
                self.graph
                    .neighbors_directed(n, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .collect();

        let mut covered: HashSet<NodeIndex> = HashSet::new();
        for &entry in &entries {
            let mut dfs = Dfs::new(&self.graph, entry);
            while let Some(node) = dfs.next(&self.graph) {
                covered.insert(node);
            }
        }
        for node in self.graph.node_indices() {
            if covered.contains(&node) {
                continue;
            }
            entries.push(node);
            let mut dfs = Dfs::new(&self.graph, node);
            while let Some(reached) = dfs.next(&self.graph) {
                covered.insert(reached);
            }
        }

        entries.sort();
        entries.into_iter().map(|n| self.graph[n].to_string()).collect()
    }
}
