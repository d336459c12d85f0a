//! DAG construction and traversal for pipeline jobs.

use crate::matrix::MatrixExpander;
use crate::triggers::TriggerMatcher;
use conduit_core::context::TriggerEvent;
use conduit_core::pipeline::{JobTemplate, JoinPolicy, MatrixAssignment, PipelineDefinition};
use conduit_core::run::JobKey;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use thiserror::Error;

/// Errors that reject a pipeline definition before anything runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DagError {
    #[error("Cycle detected in job dependencies: {}", cycle_path(.jobs))]
    CycleDetected { jobs: Vec<String> },

    #[error("Job '{job}' needs unknown job '{dependency}'")]
    UnknownDependency { job: String, dependency: String },

    #[error("Duplicate job name: {0}")]
    DuplicateJob(String),

    #[error("Invalid matrix for job '{job}': {reason}")]
    InvalidMatrix { job: String, reason: String },

    #[error("Pipeline has no jobs")]
    EmptyPipeline,

    #[error("Unknown job selected: {0}")]
    UnknownJob(String),
}

fn cycle_path(jobs: &[String]) -> String {
    let mut path = jobs.join(" -> ");
    if let Some(first) = jobs.first() {
        path.push_str(" -> ");
        path.push_str(first);
    }
    path
}

/// One materialized job instance.
#[derive(Debug, Clone)]
pub struct DagNode {
    pub key: JobKey,
    pub template: Arc<JobTemplate>,
    pub template_index: usize,
    pub matrix_index: usize,
}

impl DagNode {
    /// Tie-break for simultaneously eligible instances.
    pub fn order_key(&self) -> (usize, usize, String) {
        (self.template_index, self.matrix_index, self.key.to_string())
    }
}

/// Frozen graph of job instances. Edges point from prerequisite to dependent.
#[derive(Debug, Clone)]
pub struct PipelineDag {
    pipeline: String,
    graph: DiGraph<DagNode, ()>,
    index: HashMap<JobKey, NodeIndex>,
    filtered: Vec<String>,
}

impl PipelineDag {
    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    /// Number of materialized instances.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn node(&self, index: NodeIndex) -> &DagNode {
        &self.graph[index]
    }

    pub fn index_of(&self, key: &JobKey) -> Option<NodeIndex> {
        self.index.get(key).copied()
    }

    /// Instances in declaration order, then matrix order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeIndex, &DagNode)> {
        self.graph
            .node_indices()
            .map(move |index| (index, &self.graph[index]))
    }

    /// Instances of one template, in matrix order.
    pub fn instances<'a>(&'a self, template: &'a str) -> impl Iterator<Item = &'a DagNode> + 'a {
        self.nodes()
            .map(|(_, node)| node)
            .filter(move |node| node.key.template == template)
    }

    /// Templates rejected by their trigger predicate, directly or through a need.
    pub fn filtered(&self) -> &[String] {
        &self.filtered
    }

    /// Instances with no prerequisites.
    pub fn roots(&self) -> Vec<NodeIndex> {
        self.graph
            .node_indices()
            .filter(|&index| self.in_degree(index) == 0)
            .collect()
    }

    pub fn in_degree(&self, index: NodeIndex) -> usize {
        self.graph
            .neighbors_directed(index, Direction::Incoming)
            .count()
    }

    /// Prerequisites of an instance, in dispatch order.
    pub fn predecessors(&self, index: NodeIndex) -> Vec<NodeIndex> {
        self.sorted(self.graph.neighbors_directed(index, Direction::Incoming))
    }

    /// Dependents of an instance, in dispatch order.
    pub fn successors(&self, index: NodeIndex) -> Vec<NodeIndex> {
        self.sorted(self.graph.neighbors_directed(index, Direction::Outgoing))
    }

    fn sorted(&self, indices: impl Iterator<Item = NodeIndex>) -> Vec<NodeIndex> {
        let mut indices: Vec<NodeIndex> = indices.collect();
        indices.sort_by_key(|&index| self.graph[index].order_key());
        indices
    }

    /// Kahn's algorithm, ties broken by (declaration index, matrix index, name).
    pub fn topological_order(&self) -> Vec<NodeIndex> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|index| (index, self.in_degree(index)))
            .collect();

        let mut ready: BinaryHeap<Reverse<((usize, usize, String), NodeIndex)>> = self
            .roots()
            .into_iter()
            .map(|index| Reverse((self.graph[index].order_key(), index)))
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(Reverse((_, index))) = ready.pop() {
            order.push(index);
            for successor in self.graph.neighbors_directed(index, Direction::Outgoing) {
                if let Some(degree) = in_degree.get_mut(&successor) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse((self.graph[successor].order_key(), successor)));
                    }
                }
            }
        }
        order
    }
}

/// Validates a definition and materializes its instance graph.
#[derive(Debug, Clone, Default)]
pub struct DagBuilder {
    matcher: TriggerMatcher,
    expander: MatrixExpander,
    selection: Vec<String>,
}

impl DagBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the graph to these jobs and their transitive prerequisites.
    pub fn select<I, S>(mut self, jobs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selection = jobs.into_iter().map(Into::into).collect();
        self
    }

    pub fn build(
        &self,
        definition: &PipelineDefinition,
        trigger: &TriggerEvent,
    ) -> Result<PipelineDag, DagError> {
        let jobs = &definition.jobs;
        if jobs.is_empty() {
            return Err(DagError::EmptyPipeline);
        }

        let mut positions: HashMap<&str, usize> = HashMap::new();
        for (i, job) in jobs.iter().enumerate() {
            if positions.insert(job.name.as_str(), i).is_some() {
                return Err(DagError::DuplicateJob(job.name.clone()));
            }
        }
        for job in jobs {
            for need in &job.needs {
                if !positions.contains_key(need.as_str()) {
                    return Err(DagError::UnknownDependency {
                        job: job.name.clone(),
                        dependency: need.clone(),
                    });
                }
            }
        }

        let order = template_order(jobs, &positions)?;
        let expansions = jobs
            .iter()
            .map(|job| self.expander.expand(job))
            .collect::<Result<Vec<_>, _>>()?;
        let selected = self.selected(jobs, &positions)?;

        // Needs come first in `order`, so a filtered prerequisite is known
        // before its dependents are visited.
        let mut filtered = vec![false; jobs.len()];
        for &i in &order {
            let job = &jobs[i];
            filtered[i] = !self.matcher.matches(&job.triggers, trigger)
                || job
                    .needs
                    .iter()
                    .any(|need| positions.get(need.as_str()).is_some_and(|&p| filtered[p]));
        }

        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        let mut by_template: Vec<Vec<NodeIndex>> = vec![Vec::new(); jobs.len()];

        for (template_index, job) in jobs.iter().enumerate() {
            if !selected[template_index] || filtered[template_index] {
                continue;
            }
            let template = Arc::new(job.clone());
            for (matrix_index, assignment) in expansions[template_index].iter().enumerate() {
                let key = JobKey::new(job.name.clone(), assignment.clone());
                let node = graph.add_node(DagNode {
                    key: key.clone(),
                    template: Arc::clone(&template),
                    template_index,
                    matrix_index,
                });
                index.insert(key, node);
                by_template[template_index].push(node);
            }
        }

        for (template_index, job) in jobs.iter().enumerate() {
            for &node in &by_template[template_index] {
                let matrix: MatrixAssignment = graph[node].key.matrix.clone();
                for need in &job.needs {
                    let Some(&prerequisite) = positions.get(need.as_str()) else {
                        continue;
                    };
                    let candidates = &by_template[prerequisite];
                    let matched: Vec<NodeIndex> = match job.join {
                        JoinPolicy::All => candidates.clone(),
                        JoinPolicy::Matching => candidates
                            .iter()
                            .copied()
                            .filter(|&p| graph[p].key.matrix.agrees_with(&matrix))
                            .collect(),
                    };
                    if matched.is_empty() && !candidates.is_empty() {
                        return Err(DagError::InvalidMatrix {
                            job: job.name.clone(),
                            reason: format!("no instance of '{}' matches {}", need, matrix),
                        });
                    }
                    for p in matched {
                        graph.update_edge(p, node, ());
                    }
                }
            }
        }

        let filtered = jobs
            .iter()
            .enumerate()
            .filter(|(i, _)| selected[*i] && filtered[*i])
            .map(|(_, job)| job.name.clone())
            .collect();

        Ok(PipelineDag {
            pipeline: definition.name.clone(),
            graph,
            index,
            filtered,
        })
    }

    fn selected(&self, jobs: &[JobTemplate], positions: &HashMap<&str, usize>) -> Result<Vec<bool>, DagError> {
        if self.selection.is_empty() {
            return Ok(vec![true; jobs.len()]);
        }

        let mut selected = vec![false; jobs.len()];
        let mut stack = Vec::new();
        for name in &self.selection {
            let &i = positions
                .get(name.as_str())
                .ok_or_else(|| DagError::UnknownJob(name.clone()))?;
            stack.push(i);
        }
        while let Some(i) = stack.pop() {
            if selected[i] {
                continue;
            }
            selected[i] = true;
            stack.extend(jobs[i].needs.iter().filter_map(|need| positions.get(need.as_str()).copied()));
        }
        Ok(selected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Grey,
    Black,
}

/// Templates in an order where every job follows its needs.
///
/// Depth-first with white/grey/black coloring; meeting a grey template
/// means the current path loops back on itself.
fn template_order(jobs: &[JobTemplate], positions: &HashMap<&str, usize>) -> Result<Vec<usize>, DagError> {
    let mut colors = vec![Color::White; jobs.len()];
    let mut path = Vec::new();
    let mut order = Vec::with_capacity(jobs.len());

    for start in 0..jobs.len() {
        if colors[start] == Color::White {
            visit(start, jobs, positions, &mut colors, &mut path, &mut order)?;
        }
    }
    Ok(order)
}

fn visit(
    i: usize,
    jobs: &[JobTemplate],
    positions: &HashMap<&str, usize>,
    colors: &mut [Color],
    path: &mut Vec<usize>,
    order: &mut Vec<usize>,
) -> Result<(), DagError> {
    colors[i] = Color::Grey;
    path.push(i);

    for need in &jobs[i].needs {
        let Some(&j) = positions.get(need.as_str()) else {
            continue;
        };
        match colors[j] {
            Color::Grey => {
                let start = path.iter().position(|&p| p == j).unwrap_or(0);
                return Err(DagError::CycleDetected {
                    jobs: path[start..].iter().map(|&p| jobs[p].name.clone()).collect(),
                });
            }
            Color::White => visit(j, jobs, positions, colors, path, order)?,
            Color::Black => {}
        }
    }

    path.pop();
    colors[i] = Color::Black;
    order.push(i);
    Ok(())
}
