//! # Dependency Graph Analyzer
//!
//! Builds the step DAG of a task template and answers the structural
//! questions orchestration depends on: is the graph acyclic, in what order can
//! steps run, how deep is each step, which steps are roots and leaves.
//!
//! Nodes are step indices in declaration order and edges are index pairs, so
//! the analyzer never holds references between steps. Topological order is
//! Kahn's algorithm with the lowest declaration index released first, which
//! makes the order deterministic. Cycles are found with an iterative
//! three-color depth-first search.
//!
//! [`DependencyGraphAnalyzer::analyze`] caches its result: two calls without
//! [`invalidate_cache`](DependencyGraphAnalyzer::invalidate_cache) in between
//! return the same `Arc`.

use crate::error::TaskerError;
use crate::models::StepDefinition;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphValidationError {
    #[error("Duplicate step name '{0}'")]
    DuplicateStep(String),

    #[error("Step '{step}' depends on missing step '{dependency}'")]
    DanglingDependency { step: String, dependency: String },

    #[error("Step '{0}' depends on itself")]
    SelfDependency(String),

    #[error("Dependency cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("Dependency depth {depth} exceeds maximum of {max}")]
    MaxDepthExceeded { depth: usize, max: usize },
}

impl From<GraphValidationError> for TaskerError {
    fn from(err: GraphValidationError) -> Self {
        TaskerError::GraphValidationError(err.to_string())
    }
}

/// Structural analysis of a step graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyAnalysis {
    /// Step names in declaration order
    pub step_names: Vec<String>,
    /// Dependencies before dependents; empty when the graph has a cycle
    pub topological_order: Vec<String>,
    /// 0 for roots, else 1 + max level of direct dependencies; empty on a cycle
    pub levels: HashMap<String, usize>,
    /// Number of direct dependencies per step
    pub dependency_counts: HashMap<String, usize>,
    /// Every step reachable through dependency edges; empty on a cycle
    pub transitive_dependencies: HashMap<String, BTreeSet<String>>,
    /// Steps with no dependencies, in declaration order
    pub roots: Vec<String>,
    /// Steps nothing depends on, in declaration order
    pub leaves: Vec<String>,
    pub has_cycles: bool,
    /// One offending cycle, first node repeated at the end
    pub cycle: Option<Vec<String>>,
    /// Number of levels; 0 for an empty graph
    pub max_depth: usize,
}

impl DependencyAnalysis {
    pub fn level_of(&self, step_name: &str) -> Option<usize> {
        self.levels.get(step_name).copied()
    }

    /// Steps grouped by level, each group in declaration order
    pub fn steps_by_level(&self) -> Vec<Vec<String>> {
        let mut groups: Vec<Vec<String>> = vec![Vec::new(); self.max_depth];
        for name in &self.step_names {
            if let Some(&level) = self.levels.get(name) {
                groups[level].push(name.clone());
            }
        }
        groups
    }

    /// Reject cycles and graphs deeper than `max_depth` levels
    pub fn ensure_valid(&self, max_depth: usize) -> Result<(), GraphValidationError> {
        if let Some(path) = &self.cycle {
            if path.len() == 2 && path[0] == path[1] {
                return Err(GraphValidationError::SelfDependency(path[0].clone()));
            }
            return Err(GraphValidationError::Cycle { path: path.clone() });
        }
        if self.has_cycles {
            return Err(GraphValidationError::Cycle { path: Vec::new() });
        }
        if self.max_depth > max_depth {
            return Err(GraphValidationError::MaxDepthExceeded {
                depth: self.max_depth,
                max: max_depth,
            });
        }
        Ok(())
    }
}

/// Analyzer over an index-based step graph
#[derive(Debug)]
pub struct DependencyGraphAnalyzer {
    names: Vec<String>,
    /// `dependencies[i]` are the indices step `i` depends on
    dependencies: Vec<Vec<usize>>,
    build_error: Option<GraphValidationError>,
    cache: Mutex<Option<Arc<DependencyAnalysis>>>,
}

impl DependencyGraphAnalyzer {
    /// Build from template step definitions
    pub fn from_step_definitions(steps: &[StepDefinition]) -> Self {
        Self::from_edges(
            steps
                .iter()
                .map(|step| (step.name.clone(), step.dependency_names())),
        )
    }

    /// Build from `(step name, dependency names)` pairs in declaration order
    pub fn from_edges<I, S>(steps: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<S>)>,
        S: Into<String>,
    {
        let declared: Vec<(String, Vec<String>)> = steps
            .into_iter()
            .map(|(name, deps)| (name.into(), deps.into_iter().map(Into::into).collect()))
            .collect();

        let mut index: HashMap<&str, usize> = HashMap::with_capacity(declared.len());
        let mut build_error = None;
        for (i, (name, _)) in declared.iter().enumerate() {
            if index.insert(name.as_str(), i).is_some() && build_error.is_none() {
                build_error = Some(GraphValidationError::DuplicateStep(name.clone()));
            }
        }

        let mut dependencies = vec![Vec::new(); declared.len()];
        for (i, (name, deps)) in declared.iter().enumerate() {
            for dep in deps {
                match index.get(dep.as_str()) {
                    Some(&j) => {
                        if !dependencies[i].contains(&j) {
                            dependencies[i].push(j);
                        }
                    }
                    None => {
                        if build_error.is_none() {
                            build_error = Some(GraphValidationError::DanglingDependency {
                                step: name.clone(),
                                dependency: dep.clone(),
                            });
                        }
                    }
                }
            }
        }

        Self {
            names: declared.into_iter().map(|(name, _)| name).collect(),
            dependencies,
            build_error,
            cache: Mutex::new(None),
        }
    }

    /// Analyze the graph, returning the cached result when there is one.
    ///
    /// Duplicate names and dangling dependencies are errors. A cycle is not:
    /// it is reported through [`DependencyAnalysis::has_cycles`].
    pub fn analyze(&self) -> Result<Arc<DependencyAnalysis>, GraphValidationError> {
        if let Some(err) = &self.build_error {
            return Err(err.clone());
        }

        let mut cache = self.cache.lock();
        if let Some(analysis) = cache.as_ref() {
            return Ok(Arc::clone(analysis));
        }

        let analysis = Arc::new(self.compute());
        *cache = Some(Arc::clone(&analysis));
        Ok(analysis)
    }

    /// Drop the cached analysis so the next `analyze` recomputes
    pub fn invalidate_cache(&self) {
        *self.cache.lock() = None;
    }

    pub fn step_count(&self) -> usize {
        self.names.len()
    }

    fn compute(&self) -> DependencyAnalysis {
        let n = self.names.len();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, deps) in self.dependencies.iter().enumerate() {
            for &d in deps {
                dependents[d].push(i);
            }
        }

        let dependency_counts = self
            .names
            .iter()
            .zip(&self.dependencies)
            .map(|(name, deps)| (name.clone(), deps.len()))
            .collect();
        let roots = (0..n)
            .filter(|&i| self.dependencies[i].is_empty())
            .map(|i| self.names[i].clone())
            .collect();
        let leaves = (0..n)
            .filter(|&i| dependents[i].is_empty())
            .map(|i| self.names[i].clone())
            .collect();

        if let Some(cycle) = self.find_cycle() {
            return DependencyAnalysis {
                step_names: self.names.clone(),
                topological_order: Vec::new(),
                levels: HashMap::new(),
                dependency_counts,
                transitive_dependencies: HashMap::new(),
                roots,
                leaves,
                has_cycles: true,
                cycle: Some(cycle.into_iter().map(|i| self.names[i].clone()).collect()),
                max_depth: 0,
            };
        }

        let order = self.topological_indices(&dependents);

        let mut levels = vec![0usize; n];
        let mut transitive: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
        for &i in &order {
            for &d in &self.dependencies[i] {
                levels[i] = levels[i].max(levels[d] + 1);
                transitive[i].insert(d);
                let inherited: Vec<usize> = transitive[d].iter().copied().collect();
                transitive[i].extend(inherited);
            }
        }

        let max_depth = if n == 0 {
            0
        } else {
            levels.iter().copied().max().unwrap_or(0) + 1
        };

        DependencyAnalysis {
            step_names: self.names.clone(),
            topological_order: order.iter().map(|&i| self.names[i].clone()).collect(),
            levels: (0..n).map(|i| (self.names[i].clone(), levels[i])).collect(),
            dependency_counts,
            transitive_dependencies: (0..n)
                .map(|i| {
                    (
                        self.names[i].clone(),
                        transitive[i].iter().map(|&d| self.names[d].clone()).collect(),
                    )
                })
                .collect(),
            roots,
            leaves,
            has_cycles: false,
            cycle: None,
            max_depth,
        }
    }

    /// Kahn's algorithm; ready nodes are released lowest declaration index first
    fn topological_indices(&self, dependents: &[Vec<usize>]) -> Vec<usize> {
        let n = self.names.len();
        let mut remaining: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = (0..n)
            .filter(|&i| remaining[i] == 0)
            .map(Reverse)
            .collect();

        let mut order = Vec::with_capacity(n);
        while let Some(Reverse(i)) = ready.pop() {
            order.push(i);
            for &dependent in &dependents[i] {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }
        order
    }

    /// Iterative three-color DFS over step -> dependency edges
    fn find_cycle(&self) -> Option<Vec<usize>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let n = self.names.len();
        let mut color = vec![Color::White; n];

        for start in 0..n {
            if color[start] != Color::White {
                continue;
            }
            // (node, index of the next dependency to visit)
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
            color[start] = Color::Gray;

            while let Some(frame) = stack.last_mut() {
                let (node, next) = *frame;
                if next < self.dependencies[node].len() {
                    frame.1 += 1;
                    let dep = self.dependencies[node][next];
                    match color[dep] {
                        Color::White => {
                            color[dep] = Color::Gray;
                            stack.push((dep, 0));
                        }
                        Color::Gray => {
                            let from = stack.iter().position(|&(n, _)| n == dep).unwrap_or(0);
                            let mut path: Vec<usize> =
                                stack[from..].iter().map(|&(n, _)| n).collect();
                            path.push(dep);
                            return Some(path);
                        }
                        Color::Black => {}
                    }
                } else {
                    color[node] = Color::Black;
                    stack.pop();
                }
            }
        }
        None
    }
}
