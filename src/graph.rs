use std::collections::{BTreeSet, HashMap, HashSet};

use petgraph::graphmap::DiGraphMap;
use petgraph::visit::Dfs;

use crate::error::GraphError;

/// Name-level view of the atom graph: every node and the names it depends on.
///
/// Nodes keep their insertion order, which is used as the tie-break for
/// [`execution_order`](Self::execution_order) so reruns are deterministic.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<String>,
    dependencies: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node, or extends the dependencies of an existing one.
    pub fn add_node<I, S>(&mut self, name: &str, dependencies: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if !self.dependencies.contains_key(name) {
            self.nodes.push(name.to_string());
        }
        let deps = self.dependencies.entry(name.to_string()).or_default();
        for dep in dependencies {
            let dep = dep.into();
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.dependencies.contains_key(name)
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn dependencies_of(&self, name: &str) -> &[String] {
        self.dependencies
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Nodes without dependencies, in insertion order.
    pub fn roots(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|name| self.dependencies_of(name).is_empty())
            .cloned()
            .collect()
    }

    /// Checks that every dependency resolves and that the graph is acyclic.
    pub fn validate(&self) -> Result<(), GraphError> {
        for name in &self.nodes {
            for dep in self.dependencies_of(name) {
                if !self.contains(dep) {
                    return Err(GraphError::MissingDependency {
                        atom: name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let mut visited = HashSet::new();
        let mut path = Vec::new();
        for name in &self.nodes {
            if let Some(cycle) = self.find_cycle(name, &mut visited, &mut path) {
                return Err(GraphError::Cycle { path: cycle });
            }
        }
        Ok(())
    }

    fn find_cycle(
        &self,
        node: &str,
        visited: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        if let Some(start) = path.iter().position(|n| n == node) {
            let mut cycle = path[start..].to_vec();
            cycle.push(node.to_string());
            return Some(cycle);
        }

        if visited.contains(node) {
            return None;
        }

        visited.insert(node.to_string());
        path.push(node.to_string());

        for dep in self.dependencies_of(node) {
            if let Some(cycle) = self.find_cycle(dep, visited, path) {
                return Some(cycle);
            }
        }

        path.pop();
        None
    }

    /// Topological order: every node appears after all of its dependencies.
    ///
    /// Post-order DFS over all nodes. Assumes [`validate`](Self::validate)
    /// passed; dependencies on unknown names are skipped.
    pub fn execution_order(&self) -> Vec<String> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut visited = HashSet::new();
        for name in &self.nodes {
            self.visit_post_order(name, &mut visited, &mut order);
        }
        order
    }

    fn visit_post_order(&self, node: &str, visited: &mut HashSet<String>, order: &mut Vec<String>) {
        if !self.contains(node) || !visited.insert(node.to_string()) {
            return;
        }
        for dep in self.dependencies_of(node) {
            self.visit_post_order(dep, visited, order);
        }
        order.push(node.to_string());
    }

    /// The seed plus every node transitively downstream of it.
    pub fn affected<'s, I>(&self, seed: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'s str>,
    {
        let mut downstream: DiGraphMap<&str, ()> = DiGraphMap::new();
        for name in &self.nodes {
            downstream.add_node(name.as_str());
            for dep in self.dependencies_of(name) {
                downstream.add_edge(dep.as_str(), name.as_str(), ());
            }
        }

        let mut affected = BTreeSet::new();
        for start in seed {
            if !downstream.contains_node(start) {
                tracing::debug!("Ignoring unknown atom in recompute seed: {}", start);
                continue;
            }
            let mut dfs = Dfs::new(&downstream, start);
            while let Some(node) = dfs.next(&downstream) {
                affected.insert(node.to_string());
            }
        }
        affected
    }

    /// Direct dependents of `name`.
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|node| self.dependencies_of(node).iter().any(|d| d == name))
            .cloned()
            .collect()
    }
}
