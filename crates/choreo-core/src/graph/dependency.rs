//! Dependency graph between jobs.
//!
//! Design:
//! - Forward edges: job -> jobs it waits for, each tagged with a `DependencyKind`
//! - Reverse edges: job -> jobs waiting for it
//! - Invariant: edges and reverse_edges must be kept in sync
//! - Nodes and per-node edges keep insertion order so traversal is deterministic

use std::collections::{HashMap, HashSet};

use crate::domain::{DependencyKind, JobId};

/// DFS colour used by cycle detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    /// Not visited yet.
    White,
    /// On the current DFS path.
    Gray,
    /// Fully explored.
    Black,
}

#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// Nodes in declaration order.
    nodes: Vec<JobId>,

    /// Forward edges: job -> (dependency, kind), in declaration order.
    edges: HashMap<JobId, Vec<(JobId, DependencyKind)>>,

    /// Reverse edges: job -> jobs that depend on it.
    reverse_edges: HashMap<JobId, HashSet<JobId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node. Adding the same node twice is a no-op.
    pub fn add_node(&mut self, job: JobId) {
        if !self.edges.contains_key(&job) {
            self.nodes.push(job);
            self.edges.insert(job, Vec::new());
        }
    }

    /// Add a dependency: `job` waits for `depends_on`.
    ///
    /// Declaring the same pair twice keeps one edge; a hard declaration
    /// upgrades an existing soft one.
    pub fn add_dependency(&mut self, job: JobId, depends_on: JobId, kind: DependencyKind) {
        self.add_node(job);
        self.add_node(depends_on);

        let deps = self.edges.entry(job).or_default();
        match deps.iter_mut().find(|(dep, _)| *dep == depends_on) {
            Some((_, existing)) => {
                if kind == DependencyKind::Hard {
                    *existing = DependencyKind::Hard;
                }
            }
            None => deps.push((depends_on, kind)),
        }
        self.reverse_edges
            .entry(depends_on)
            .or_default()
            .insert(job);
    }

    /// Nodes in the order they were added.
    pub fn nodes(&self) -> &[JobId] {
        &self.nodes
    }

    /// Dependencies of `job` with their kinds.
    pub fn dependencies(&self, job: JobId) -> &[(JobId, DependencyKind)] {
        self.edges.get(&job).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Jobs waiting for `job` (order unspecified).
    pub fn dependents(&self, job: JobId) -> Vec<JobId> {
        self.reverse_edges
            .get(&job)
            .map(|waiting| waiting.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Detect a cycle.
    ///
    /// Returns the first cycle found as a path that starts and ends on the
    /// same node (`[a, b, a]`), or `None` if the graph is a DAG.
    /// Three-colour DFS, O(V + E).
    pub fn detect_cycle(&self) -> Option<Vec<JobId>> {
        let mut colors: HashMap<JobId, Color> =
            self.nodes.iter().map(|&n| (n, Color::White)).collect();
        let mut path = Vec::new();

        for &start in &self.nodes {
            if colors.get(&start) == Some(&Color::White)
                && let Some(cycle) = self.dfs_cycle(start, &mut colors, &mut path)
            {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs_cycle(
        &self,
        node: JobId,
        colors: &mut HashMap<JobId, Color>,
        path: &mut Vec<JobId>,
    ) -> Option<Vec<JobId>> {
        colors.insert(node, Color::Gray);
        path.push(node);

        for &(dep, _) in self.dependencies(node) {
            match colors.get(&dep).copied().unwrap_or(Color::White) {
                Color::Gray => {
                    // dep is on the current path: the cycle is path[dep..] + dep
                    let from = path.iter().position(|&n| n == dep).unwrap_or(0);
                    let mut cycle = path[from..].to_vec();
                    cycle.push(dep);
                    return Some(cycle);
                }
                Color::White => {
                    if let Some(cycle) = self.dfs_cycle(dep, colors, path) {
                        return Some(cycle);
                    }
                }
                Color::Black => {}
            }
        }

        colors.insert(node, Color::Black);
        path.pop();
        None
    }
}
