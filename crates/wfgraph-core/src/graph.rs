//! Job dependency graph and level-ordered execution planning.
//!
//! An edge `A → B` means "B needs A": A must reach a terminal state before B
//! may start. Ordering is Kahn's algorithm with ties broken by declaration
//! order, so plans are stable across runs.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, VecDeque};

use serde::Serialize;

use crate::error::{Result, WorkflowError};
use crate::model::Workflow;

/// A step in a level-ordered execution plan.
#[derive(Debug, Clone, Serialize)]
pub struct PlanStep {
    /// 0-indexed position in the plan.
    pub position: usize,
    pub job: String,
    /// Kahn wave; every dependency sits on a lower level.
    pub level: usize,
    pub depends_on: Vec<String>,
    /// True when other jobs share this level.
    pub parallelizable: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    pub title: String,
    pub steps: Vec<PlanStep>,
}

impl ExecutionPlan {
    /// Steps grouped by level; each group may run concurrently.
    pub fn parallel_groups(&self) -> Vec<Vec<&PlanStep>> {
        let mut groups: Vec<Vec<&PlanStep>> = Vec::new();
        for step in &self.steps {
            if groups.len() <= step.level {
                groups.resize_with(step.level + 1, Vec::new);
            }
            groups[step.level].push(step);
        }
        groups
    }
}

/// Directed dependency graph over job ids.
#[derive(Debug, Clone, Default)]
pub struct JobGraph {
    /// Ids in registration order.
    nodes: Vec<String>,
    index: HashMap<String, usize>,
    /// `dependency → {dependents}`
    downstream: Vec<BTreeSet<usize>>,
    /// `dependent → {dependencies}`
    upstream: Vec<BTreeSet<usize>>,
}

impl JobGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph of a workflow's jobs from their `needs`.
    pub fn from_workflow(workflow: &Workflow) -> Result<Self> {
        let mut graph = Self::new();
        for job in &workflow.jobs {
            if graph.contains(job.id.as_str()) {
                return Err(WorkflowError::DuplicateJob {
                    workflow: workflow.name.clone(),
                    job: job.id.to_string(),
                });
            }
            graph.add_node(job.id.as_str());
        }
        for job in &workflow.jobs {
            for need in &job.needs {
                if !graph.contains(need.as_str()) {
                    return Err(WorkflowError::UnknownNeeds {
                        workflow: workflow.name.clone(),
                        job: job.id.to_string(),
                        missing: need.to_string(),
                    });
                }
                graph.add_dependency(need.as_str(), job.id.as_str())?;
            }
        }
        Ok(graph)
    }

    /// Register a node. Idempotent.
    pub fn add_node(&mut self, id: &str) {
        if self.index.contains_key(id) {
            return;
        }
        self.index.insert(id.to_string(), self.nodes.len());
        self.nodes.push(id.to_string());
        self.downstream.push(BTreeSet::new());
        self.upstream.push(BTreeSet::new());
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Ids in registration order.
    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    fn idx(&self, id: &str) -> Result<usize> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| WorkflowError::JobNotFound { job: id.to_string() })
    }

    /// Add `dependent` needs `dependency`. The edge is rolled back and
    /// [`WorkflowError::DependencyCycle`] returned if it closes a cycle.
    pub fn add_dependency(&mut self, dependency: &str, dependent: &str) -> Result<()> {
        let from = self.idx(dependency)?;
        let to = self.idx(dependent)?;

        self.downstream[from].insert(to);
        self.upstream[to].insert(from);

        if let Some(cycle) = self.find_cycle_through(to) {
            self.downstream[from].remove(&to);
            self.upstream[to].remove(&from);
            return Err(WorkflowError::DependencyCycle { jobs: cycle });
        }
        Ok(())
    }

    /// Kahn's algorithm; returns `(id index, level)` pairs in order.
    fn kahn(&self) -> Result<Vec<(usize, usize)>> {
        let mut in_degree: Vec<usize> = self.upstream.iter().map(BTreeSet::len).collect();
        let mut level = vec![0usize; self.nodes.len()];
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(node)) = ready.pop() {
            order.push((node, level[node]));
            for &dep in &self.downstream[node] {
                level[dep] = level[dep].max(level[node] + 1);
                in_degree[dep] -= 1;
                if in_degree[dep] == 0 {
                    ready.push(Reverse(dep));
                }
            }
        }

        if order.len() != self.nodes.len() {
            let stuck = in_degree
                .iter()
                .enumerate()
                .filter(|(_, d)| **d > 0)
                .map(|(i, _)| self.nodes[i].clone())
                .collect();
            return Err(WorkflowError::DependencyCycle { jobs: stuck });
        }
        Ok(order)
    }

    /// Jobs with dependencies before dependents.
    pub fn topological_order(&self) -> Result<Vec<&str>> {
        Ok(self
            .kahn()?
            .into_iter()
            .map(|(i, _)| self.nodes[i].as_str())
            .collect())
    }

    pub fn dependencies_of(&self, id: &str) -> Result<Vec<&str>> {
        let i = self.idx(id)?;
        Ok(self.upstream[i]
            .iter()
            .map(|&d| self.nodes[d].as_str())
            .collect())
    }

    pub fn dependents_of(&self, id: &str) -> Result<Vec<&str>> {
        let i = self.idx(id)?;
        Ok(self.downstream[i]
            .iter()
            .map(|&d| self.nodes[d].as_str())
            .collect())
    }

    /// Every job reachable downstream of `id`, in registration order.
    pub fn transitive_dependents_of(&self, id: &str) -> Result<Vec<&str>> {
        let start = self.idx(id)?;
        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            for &dep in &self.downstream[current] {
                if visited.insert(dep) {
                    queue.push_back(dep);
                }
            }
        }
        Ok(visited.into_iter().map(|i| self.nodes[i].as_str()).collect())
    }

    pub fn to_execution_plan(&self, title: &str) -> Result<ExecutionPlan> {
        let order = self.kahn()?;
        let mut level_counts: HashMap<usize, usize> = HashMap::new();
        for (_, level) in &order {
            *level_counts.entry(*level).or_default() += 1;
        }
        // Order by level so groups are contiguous.
        let mut order = order;
        order.sort_by_key(|(i, level)| (*level, *i));

        let steps = order
            .into_iter()
            .enumerate()
            .map(|(position, (i, level))| PlanStep {
                position,
                job: self.nodes[i].clone(),
                level,
                depends_on: self.upstream[i]
                    .iter()
                    .map(|&d| self.nodes[d].clone())
                    .collect(),
                parallelizable: level_counts.get(&level).copied().unwrap_or(1) > 1,
            })
            .collect();

        Ok(ExecutionPlan {
            title: title.to_string(),
            steps,
        })
    }

    fn find_cycle_through(&self, start: usize) -> Option<Vec<String>> {
        let mut visited = BTreeSet::new();
        let mut path = Vec::new();
        if self.dfs_cycle(start, &mut visited, &mut path) {
            Some(path.into_iter().map(|i| self.nodes[i].clone()).collect())
        } else {
            None
        }
    }

    fn dfs_cycle(&self, node: usize, visited: &mut BTreeSet<usize>, path: &mut Vec<usize>) -> bool {
        if path.contains(&node) {
            path.push(node);
            return true;
        }
        if !visited.insert(node) {
            return false;
        }
        path.push(node);
        for &dep in &self.downstream[node] {
            if self.dfs_cycle(dep, visited, path) {
                return true;
            }
        }
        path.pop();
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The PR-checks shape: quality gate, two test jobs, integration last.
    fn pr_graph() -> JobGraph {
        let mut g = JobGraph::new();
        for id in ["Code-Quality-Checks", "Unit-Test", "Coverage-Test", "Integration-Test"] {
            g.add_node(id);
        }
        g.add_dependency("Code-Quality-Checks", "Unit-Test").unwrap();
        g.add_dependency("Code-Quality-Checks", "Coverage-Test").unwrap();
        g.add_dependency("Unit-Test", "Integration-Test").unwrap();
        g.add_dependency("Coverage-Test", "Integration-Test").unwrap();
        g
    }

    #[test]
    fn test_topological_order_is_declaration_stable() {
        let g = pr_graph();
        assert_eq!(
            g.topological_order().unwrap(),
            vec!["Code-Quality-Checks", "Unit-Test", "Coverage-Test", "Integration-Test"]
        );
    }

    #[test]
    fn test_cycle_rejected_and_rolled_back() {
        let mut g = pr_graph();
        let err = g.add_dependency("Integration-Test", "Code-Quality-Checks");
        assert!(matches!(err, Err(WorkflowError::DependencyCycle { .. })));
        // Graph still usable after rollback.
        assert_eq!(g.topological_order().unwrap().len(), 4);
    }

    #[test]
    fn test_parallel_groups_by_level() {
        let plan = pr_graph().to_execution_plan("PR Checks").unwrap();
        let groups = plan.parallel_groups();
        assert_eq!(groups.len(), 3);
        let middle: Vec<&str> = groups[1].iter().map(|s| s.job.as_str()).collect();
        assert_eq!(middle, vec!["Unit-Test", "Coverage-Test"]);
        assert!(groups[1][0].parallelizable);
        assert!(!groups[0][0].parallelizable);
        assert_eq!(plan.title, "PR Checks");
    }

    #[test]
    fn test_transitive_dependents() {
        let g = pr_graph();
        assert_eq!(
            g.transitive_dependents_of("Code-Quality-Checks").unwrap(),
            vec!["Unit-Test", "Coverage-Test", "Integration-Test"]
        );
        assert!(g.transitive_dependents_of("Integration-Test").unwrap().is_empty());
    }

    #[test]
    fn test_direct_neighbours() {
        let g = pr_graph();
        assert_eq!(
            g.dependencies_of("Integration-Test").unwrap(),
            vec!["Unit-Test", "Coverage-Test"]
        );
        assert_eq!(
            g.dependents_of("Code-Quality-Checks").unwrap(),
            vec!["Unit-Test", "Coverage-Test"]
        );
    }

    #[test]
    fn test_missing_node() {
        let mut g = JobGraph::new();
        g.add_node("A");
        assert!(matches!(
            g.add_dependency("A", "missing"),
            Err(WorkflowError::JobNotFound { .. })
        ));
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let mut g = JobGraph::new();
        g.add_node("A");
        assert!(g.add_dependency("A", "A").is_err());
    }
}
