use std::collections::{HashMap, HashSet};

use mc_core::types::Task;

// ---------------------------------------------------------------------------
// DependencyGraph
// ---------------------------------------------------------------------------

/// A value-type view of the dependency edges between tasks.
///
/// Tasks reference each other by id only; no live references. All traversal
/// goes through this graph, which makes validation a pure function.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Node ids in input order (determinism for DFS and tie-breaks).
    nodes: Vec<String>,
    /// node -> ids it depends on, in declaration order.
    edges: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    pub fn from_tasks(tasks: &[Task]) -> Self {
        let nodes: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
        let edges = tasks
            .iter()
            .map(|t| (t.id.clone(), t.dependencies.clone()))
            .collect();
        Self { nodes, edges }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.edges.contains_key(id)
    }

    pub fn dependencies_of(&self, id: &str) -> &[String] {
        self.edges.get(id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Ids of nodes that depend on `id`, in node order.
    pub fn dependents_of(&self, id: &str) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| self.dependencies_of(n).iter().any(|d| d == id))
            .cloned()
            .collect()
    }

    /// First cycle found by depth-first search, as the path
    /// `[n0, n1, ..., nk, n0]`; the closing edge is `nk -> n0`.
    ///
    /// Deterministic: nodes are visited in input order, edges in declaration
    /// order.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = Vec::new();
        let mut on_stack: HashSet<&str> = HashSet::new();

        for start in &self.nodes {
            if visited.contains(start.as_str()) {
                continue;
            }
            if let Some(cycle) = self.dfs(start, &mut visited, &mut stack, &mut on_stack) {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs<'a>(
        &'a self,
        node: &'a str,
        visited: &mut HashSet<&'a str>,
        stack: &mut Vec<&'a str>,
        on_stack: &mut HashSet<&'a str>,
    ) -> Option<Vec<String>> {
        visited.insert(node);
        stack.push(node);
        on_stack.insert(node);

        for dep in self.dependencies_of(node) {
            if !self.contains(dep) {
                continue;
            }
            if on_stack.contains(dep.as_str()) {
                // Cycle: slice of the stack from `dep` onward, closed by
                // the edge node -> dep.
                let from = stack.iter().position(|n| *n == dep.as_str()).expect("on stack");
                let mut cycle: Vec<String> = stack[from..].iter().map(|s| s.to_string()).collect();
                cycle.push(dep.clone());
                return Some(cycle);
            }
            if !visited.contains(dep.as_str()) {
                if let Some(cycle) = self.dfs(dep, visited, stack, on_stack) {
                    return Some(cycle);
                }
            }
        }

        stack.pop();
        on_stack.remove(node);
        None
    }

    pub fn is_acyclic(&self) -> bool {
        self.find_cycle().is_none()
    }

    /// Every dependency id that does not name a node in the graph.
    pub fn orphan_references(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for node in &self.nodes {
            for dep in self.dependencies_of(node) {
                if !self.contains(dep) {
                    out.push((node.clone(), dep.clone()));
                }
            }
        }
        out
    }

    /// True if `target` is in the transitive dependency closure of `id`.
    pub fn depends_transitively(&self, id: &str, target: &str) -> bool {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut frontier: Vec<&str> = vec![id];
        while let Some(node) = frontier.pop() {
            for dep in self.dependencies_of(node) {
                if dep == target {
                    return true;
                }
                if self.contains(dep) && seen.insert(dep.as_str()) {
                    frontier.push(dep);
                }
            }
        }
        false
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
