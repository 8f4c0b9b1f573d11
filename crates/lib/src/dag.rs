//! The dependency engine over the result graph.
//!
//! Edges run from a dependency to its dependents. All orders are
//! deterministic: topological sorts break ties lexicographically by result
//! name, and dependency listings come out sorted.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, BTreeMap, BTreeSet, HashMap};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use thiserror::Error;

use crate::project::Project;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DagError {
  #[error("dependency cycle detected: {}", cycle.join(" -> "))]
  CycleDetected { cycle: Vec<String> },

  #[error("no such result: {0}")]
  UnknownResult(String),
}

/// The result dependency graph.
#[derive(Debug)]
pub struct DepGraph {
  graph: DiGraph<String, ()>,
  nodes: BTreeMap<String, NodeIndex>,
}

impl DepGraph {
  /// Build a graph from `(result, depends)` pairs. Fails on references to
  /// unknown results and on cycles.
  pub fn new<I>(results: I) -> Result<Self, DagError>
  where
    I: IntoIterator<Item = (String, Vec<String>)>,
  {
    let entries: BTreeMap<String, Vec<String>> = results.into_iter().collect();

    let mut graph = DiGraph::new();
    let mut nodes = BTreeMap::new();
    for name in entries.keys() {
      let idx = graph.add_node(name.clone());
      nodes.insert(name.clone(), idx);
    }

    for (name, depends) in &entries {
      let dependent = nodes[name];
      for dep in depends {
        let dep_idx = *nodes.get(dep).ok_or_else(|| DagError::UnknownResult(dep.clone()))?;
        graph.add_edge(dep_idx, dependent, ());
      }
    }

    let dag = Self { graph, nodes };
    dag.check_acyclic()?;
    Ok(dag)
  }

  pub fn from_project(project: &Project) -> Result<Self, DagError> {
    Self::new(
      project
        .results
        .iter()
        .map(|(name, r)| (name.clone(), r.depends.clone())),
    )
  }

  fn check_acyclic(&self) -> Result<(), DagError> {
    for scc in petgraph::algo::tarjan_scc(&self.graph) {
      let is_cycle = scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0]);
      if is_cycle {
        let mut cycle: Vec<String> = scc.iter().map(|&idx| self.graph[idx].clone()).collect();
        cycle.sort();
        return Err(DagError::CycleDetected { cycle });
      }
    }
    Ok(())
  }

  fn index(&self, name: &str) -> Result<NodeIndex, DagError> {
    self
      .nodes
      .get(name)
      .copied()
      .ok_or_else(|| DagError::UnknownResult(name.to_string()))
  }

  pub fn contains(&self, name: &str) -> bool {
    self.nodes.contains_key(name)
  }

  /// Direct dependencies of one result, sorted.
  pub fn dlist(&self, name: &str) -> Result<Vec<String>, DagError> {
    let idx = self.index(name)?;
    let mut deps: Vec<String> = self
      .graph
      .neighbors_directed(idx, Direction::Incoming)
      .map(|dep| self.graph[dep].clone())
      .collect();
    deps.sort();
    Ok(deps)
  }

  /// Full topological order, dependencies first, lexicographic tie-break.
  pub fn dsort(&self) -> Vec<String> {
    self.kahn_order(None)
  }

  /// Topologically ordered closure reachable from `seeds` (the seeds plus
  /// everything they transitively depend on).
  pub fn dlist_recursive(&self, seeds: &[String]) -> Result<Vec<String>, DagError> {
    let mut wanted = BTreeSet::new();
    let mut stack = Vec::new();
    for seed in seeds {
      stack.push(self.index(seed)?);
    }
    while let Some(idx) = stack.pop() {
      if wanted.insert(idx) {
        stack.extend(self.graph.neighbors_directed(idx, Direction::Incoming));
      }
    }

    let names: BTreeSet<String> = wanted.iter().map(|&idx| self.graph[idx].clone()).collect();
    Ok(self.kahn_order(Some(&names)))
  }

  /// Group `subset` into dependency waves: each wave only depends on
  /// earlier waves, so its members can build concurrently.
  pub fn waves(&self, subset: &BTreeSet<String>) -> Vec<Vec<String>> {
    let mut level: HashMap<&str, usize> = HashMap::new();
    let mut waves: Vec<Vec<String>> = Vec::new();

    // dsort is already a linear extension, so every dependency's level is
    // known by the time its dependent is seen.
    for name in self.kahn_order(Some(subset)) {
      let idx = self.nodes[&name];
      let my_level = self
        .graph
        .neighbors_directed(idx, Direction::Incoming)
        .filter_map(|dep| level.get(self.graph[dep].as_str()))
        .map(|&l| l + 1)
        .max()
        .unwrap_or(0);

      if waves.len() <= my_level {
        waves.resize_with(my_level + 1, Vec::new);
      }
      waves[my_level].push(name.clone());
      let key: &str = self.graph[idx].as_str();
      level.insert(key, my_level);
    }
    waves
  }

  /// Kahn's algorithm with a lexicographic ready queue, optionally
  /// restricted to a subset of the nodes.
  fn kahn_order(&self, subset: Option<&BTreeSet<String>>) -> Vec<String> {
    let in_subset = |name: &str| subset.map_or(true, |s| s.contains(name));

    let mut in_degree: HashMap<NodeIndex, usize> = HashMap::new();
    for (name, &idx) in &self.nodes {
      if !in_subset(name) {
        continue;
      }
      let degree = self
        .graph
        .neighbors_directed(idx, Direction::Incoming)
        .filter(|&dep| in_subset(&self.graph[dep]))
        .count();
      in_degree.insert(idx, degree);
    }

    let mut ready: BinaryHeap<Reverse<String>> = in_degree
      .iter()
      .filter(|&(_, &deg)| deg == 0)
      .map(|(&idx, _)| Reverse(self.graph[idx].clone()))
      .collect();

    let mut order = Vec::with_capacity(in_degree.len());
    while let Some(Reverse(name)) = ready.pop() {
      let idx = self.nodes[&name];
      order.push(name);
      for dependent in self.graph.neighbors_directed(idx, Direction::Outgoing) {
        if let Some(degree) = in_degree.get_mut(&dependent) {
          *degree -= 1;
          if *degree == 0 {
            ready.push(Reverse(self.graph[dependent].clone()));
          }
        }
      }
    }
    order
  }
}
