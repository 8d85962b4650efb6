//! Planning: a triggered workflow instance to concrete job instances.
//!
//! Calls of reusable workflows are flattened into the caller's graph. A
//! callee job `Benchmark` called from `Perf` becomes `Perf/Benchmark`; callee
//! jobs without `needs` inherit the caller job's dependencies, and anything
//! that needs the caller job waits for every callee job.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use crate::catalog::Catalog;
use crate::concurrency::instance_label;
use crate::context::{EvalContext, GithubContext};
use crate::error::{Result, WorkflowError};
use crate::expr::{Condition, ExprValue, Template};
use crate::graph::{ExecutionPlan, JobGraph};
use crate::matrix::Combination;
use crate::model::{ContainerSpec, Step, Workflow};
use crate::trigger::{resolve_inputs, WorkflowInstance};

/// Nesting limit for reusable workflow calls.
pub const MAX_CALL_DEPTH: usize = 4;

/// A rendered concurrency group for one instance or run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupAssignment {
    pub group: String,
    pub cancel_in_progress: bool,
}

/// One matrix instance of a planned job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobInstance {
    /// `Job (a, b)` label, unique within the job.
    pub label: String,
    /// Rendered display name.
    pub name: String,
    pub matrix: Option<Combination>,
    pub concurrency: Option<GroupAssignment>,
}

/// The `if:` of a reusable workflow call, evaluated with the caller's inputs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallGuard {
    pub condition: Condition,
    pub inputs: BTreeMap<String, ExprValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedJob {
    /// Flattened id, unique within the run.
    pub id: String,
    /// File that declares the job.
    pub source: String,
    pub needs: Vec<String>,
    /// Local `needs.<name>` → flattened ids it stands for.
    pub need_aliases: BTreeMap<String, Vec<String>>,
    pub condition: Option<Condition>,
    pub call_guards: Vec<CallGuard>,
    pub runs_on: Vec<String>,
    pub timeout_minutes: Option<u64>,
    pub fail_fast: bool,
    pub max_parallel: Option<usize>,
    pub container: Option<ContainerSpec>,
    /// Workflow-level env overlaid with job-level env.
    pub env: BTreeMap<String, Template>,
    pub steps: Vec<Step>,
    /// The `inputs` context this job's templates see.
    pub inputs: BTreeMap<String, ExprValue>,
    pub instances: Vec<JobInstance>,
}

impl PlannedJob {
    pub fn has_matrix(&self) -> bool {
        self.instances.iter().any(|i| i.matrix.is_some())
    }
}

/// Everything needed to execute one workflow instance.
#[derive(Debug, Clone, Serialize)]
pub struct RunPlan {
    pub workflow: String,
    pub file: String,
    pub github: GithubContext,
    pub inputs: BTreeMap<String, ExprValue>,
    pub concurrency: Option<GroupAssignment>,
    pub jobs: Vec<PlannedJob>,
    #[serde(skip)]
    graph: JobGraph,
}

impl RunPlan {
    pub fn job(&self, id: &str) -> Option<&PlannedJob> {
        self.jobs.iter().find(|j| j.id == id)
    }

    pub fn graph(&self) -> &JobGraph {
        &self.graph
    }

    pub fn execution_plan(&self) -> Result<ExecutionPlan> {
        self.graph.to_execution_plan(&self.workflow)
    }

    pub fn instance_count(&self) -> usize {
        self.jobs.iter().map(|j| j.instances.len()).sum()
    }

    /// Context for templates of `job` (optionally one matrix instance).
    pub fn eval_context(&self, job: &PlannedJob, matrix: Option<&Combination>) -> EvalContext {
        EvalContext::new(self.github.clone())
            .with_inputs(job.inputs.clone())
            .with_matrix(matrix.cloned())
    }
}

/// Plans instances against a catalog that resolves reusable workflows.
pub struct Planner<'a> {
    catalog: &'a Catalog,
}

struct Scope<'s> {
    prefix: Option<String>,
    ctx: EvalContext,
    outer_needs: Vec<String>,
    outer_aliases: BTreeMap<String, Vec<String>>,
    guards: Vec<CallGuard>,
    env: BTreeMap<String, Template>,
    source: &'s str,
    depth: usize,
}

impl<'a> Planner<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self { catalog }
    }

    pub fn plan(&self, workflow: &Workflow, instance: &WorkflowInstance) -> Result<RunPlan> {
        let ctx = instance.eval_context();
        let concurrency = match &workflow.concurrency {
            Some(spec) => Some(GroupAssignment {
                group: spec.group.render(&ctx).map_err(|e| {
                    WorkflowError::expression(format!("{}/concurrency", workflow.file), e)
                })?,
                cancel_in_progress: spec.cancel_in_progress,
            }),
            None => None,
        };

        let scope = Scope {
            prefix: None,
            ctx,
            outer_needs: Vec::new(),
            outer_aliases: BTreeMap::new(),
            guards: Vec::new(),
            env: workflow.env.clone(),
            source: &workflow.file,
            depth: 0,
        };
        let mut jobs = Vec::new();
        self.flatten(workflow, &scope, &mut jobs)?;

        let mut graph = JobGraph::new();
        for job in &jobs {
            graph.add_node(&job.id);
        }
        for job in &jobs {
            for need in &job.needs {
                graph.add_dependency(need, &job.id)?;
            }
        }

        debug!(
            workflow = %workflow.name,
            jobs = jobs.len(),
            instances = jobs.iter().map(|j| j.instances.len()).sum::<usize>(),
            "planned run"
        );
        Ok(RunPlan {
            workflow: instance.workflow.clone(),
            file: instance.file.clone(),
            github: instance.github.clone(),
            inputs: instance.inputs.clone(),
            concurrency,
            jobs,
            graph,
        })
    }

    /// Append the jobs of `workflow` to `out`; returns the ids added.
    fn flatten(&self, workflow: &Workflow, scope: &Scope<'_>, out: &mut Vec<PlannedJob>) -> Result<Vec<String>> {
        let local = JobGraph::from_workflow(workflow)?;
        let mut expanded: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut added = Vec::new();

        for local_id in local.topological_order()? {
            let Some(job) = workflow.job(local_id) else {
                continue;
            };
            let id = match &scope.prefix {
                Some(p) => format!("{p}/{local_id}"),
                None => local_id.to_string(),
            };
            let (needs, need_aliases) = if job.needs.is_empty() {
                (scope.outer_needs.clone(), scope.outer_aliases.clone())
            } else {
                let aliases: BTreeMap<String, Vec<String>> = job
                    .needs
                    .iter()
                    .map(|n| {
                        let ids = expanded.get(n.as_str()).cloned().unwrap_or_default();
                        (n.to_string(), ids)
                    })
                    .collect();
                let mut needs: Vec<String> = Vec::new();
                for need in &job.needs {
                    for flat in &aliases[need.as_str()] {
                        if !needs.contains(flat) {
                            needs.push(flat.clone());
                        }
                    }
                }
                (needs, aliases)
            };

            if let Some(file) = job.called_workflow() {
                if scope.depth + 1 > MAX_CALL_DEPTH {
                    return Err(WorkflowError::CallDepthExceeded {
                        workflow: file.to_string(),
                        max: MAX_CALL_DEPTH,
                    });
                }
                let callee = self.catalog.require(file)?;
                let mut provided = BTreeMap::new();
                for (name, template) in &job.with {
                    let value = template.render(&scope.ctx).map_err(|e| {
                        WorkflowError::expression(format!("{}/{}/with/{name}", scope.source, local_id), e)
                    })?;
                    provided.insert(name.clone(), value);
                }
                let specs = callee.triggers.workflow_call.as_deref().unwrap_or(&[]);
                let inputs = resolve_inputs(&callee.name, specs, &provided)?;

                let mut guards = scope.guards.clone();
                if let Some(condition) = &job.condition {
                    guards.push(CallGuard {
                        condition: condition.clone(),
                        inputs: scope.ctx.inputs.clone(),
                    });
                }
                let inner = Scope {
                    prefix: Some(id.clone()),
                    ctx: EvalContext::new(scope.ctx.github.clone()).with_inputs(inputs),
                    outer_needs: needs,
                    outer_aliases: need_aliases,
                    guards,
                    env: callee.env.clone(),
                    source: &callee.file,
                    depth: scope.depth + 1,
                };
                let ids = self.flatten(callee, &inner, out)?;
                added.extend(ids.iter().cloned());
                expanded.insert(local_id.to_string(), ids);
                continue;
            }

            let (fail_fast, max_parallel) = match &job.strategy {
                Some(s) => (s.fail_fast, s.max_parallel),
                None => (true, None),
            };
            let combos = match job.matrix() {
                Some(m) => m.expand(local_id)?.into_iter().map(Some).collect(),
                None => vec![None],
            };
            let mut instances = Vec::with_capacity(combos.len());
            for combo in combos {
                let scoped = scope.ctx.clone().with_matrix(combo.clone());
                let name = job
                    .name
                    .as_ref()
                    .map(|t| t.render_lenient(&scoped))
                    .unwrap_or_else(|| local_id.to_string());
                let concurrency = match &job.concurrency {
                    Some(spec) => Some(GroupAssignment {
                        group: spec.group.render(&scoped).map_err(|e| {
                            WorkflowError::expression(
                                format!("{}/{}/concurrency", scope.source, local_id),
                                e,
                            )
                        })?,
                        cancel_in_progress: spec.cancel_in_progress,
                    }),
                    None => None,
                };
                instances.push(JobInstance {
                    label: instance_label(&id, combo.as_ref()),
                    name,
                    matrix: combo,
                    concurrency,
                });
            }

            let mut env = scope.env.clone();
            env.extend(job.env.iter().map(|(k, v)| (k.clone(), v.clone())));
            out.push(PlannedJob {
                id: id.clone(),
                source: scope.source.to_string(),
                needs,
                need_aliases,
                condition: job.condition.clone(),
                call_guards: scope.guards.clone(),
                runs_on: job
                    .runs_on
                    .as_ref()
                    .map(|r| r.labels().into_iter().map(str::to_string).collect())
                    .unwrap_or_default(),
                timeout_minutes: job.timeout_minutes,
                fail_fast,
                max_parallel,
                container: job.container.clone(),
                env,
                steps: job.steps.clone(),
                inputs: scope.ctx.inputs.clone(),
                instances,
            });
            added.push(id.clone());
            expanded.insert(local_id.to_string(), vec![id]);
        }
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::{instantiate, TriggerEvent};

    fn catalog() -> Catalog {
        Catalog::builtin().unwrap()
    }

    fn pr_event() -> TriggerEvent {
        TriggerEvent::PullRequest {
            number: 42,
            base: "develop".to_string(),
            head: "feature/x".to_string(),
            action: "synchronize".to_string(),
            fork: false,
            sha: "abc".to_string(),
        }
    }

    #[test]
    fn test_pr_plan_expands_matrices() {
        let catalog = catalog();
        let wf = catalog.require("pr_check.yaml").unwrap();
        let instance = instantiate(wf, &pr_event()).unwrap().unwrap();
        let plan = Planner::new(&catalog).plan(wf, &instance).unwrap();

        let unit = plan.job("Unit-Test").unwrap();
        assert_eq!(unit.instances.len(), 2);
        assert_eq!(unit.instances[0].name, "Unit-Test-with-Python3.10");
        assert_eq!(
            unit.instances[0].concurrency.as_ref().unwrap().group,
            "PR Checks-Unit-42-py310"
        );
        let integ = plan.job("Integration-Test").unwrap();
        assert_eq!(integ.needs, vec!["Unit-Test".to_string(), "Coverage-Test".to_string()]);
        assert_eq!(integ.instances.len(), 7);
        assert_eq!(plan.instance_count(), 1 + 2 + 1 + 7);
    }

    #[test]
    fn test_reusable_call_is_flattened() {
        let catalog = catalog();
        let wf = catalog.require("perf_efficiency.yaml").unwrap();
        let event = TriggerEvent::WorkflowDispatch {
            workflow: "perf_efficiency.yaml".to_string(),
            git_ref: "refs/heads/develop".to_string(),
            inputs: BTreeMap::new(),
            sha: String::new(),
        };
        let instance = instantiate(wf, &event).unwrap().unwrap();
        let plan = Planner::new(&catalog).plan(wf, &instance).unwrap();

        assert_eq!(plan.jobs.len(), 1);
        let job = &plan.jobs[0];
        assert_eq!(job.id, "Perf-Efficiency-Benchmark/Perf-Benchmark");
        assert_eq!(job.source, "perf-benchmark.yaml");
        assert_eq!(job.instances.len(), 6);
        assert_eq!(job.inputs["benchmark-type"], ExprValue::from("efficiency"));
        assert_eq!(job.inputs["num-epoch"], ExprValue::Number(2.0));
        assert_eq!(
            job.inputs["artifact-prefix"],
            ExprValue::from("perf-efficiency-benchmark")
        );
    }

    #[test]
    fn test_call_depth_limit() {
        let recursive = crate::loader::load_str(
            "loop.yaml",
            "on:\n  workflow_call:\njobs:\n  Again:\n    uses: ./.github/workflows/loop.yaml\n",
        )
        .unwrap();
        let caller = crate::loader::load_str(
            "start.yaml",
            "on: workflow_dispatch\njobs:\n  Call:\n    uses: ./.github/workflows/loop.yaml\n",
        )
        .unwrap();
        let catalog = Catalog::new(vec![recursive, caller.clone()]);
        let event = TriggerEvent::WorkflowDispatch {
            workflow: "start.yaml".to_string(),
            git_ref: "refs/heads/develop".to_string(),
            inputs: BTreeMap::new(),
            sha: String::new(),
        };
        let instance = instantiate(&caller, &event).unwrap().unwrap();
        let err = Planner::new(&catalog).plan(&caller, &instance).unwrap_err();
        assert!(matches!(err, WorkflowError::CallDepthExceeded { .. }));
    }

    #[test]
    fn test_callee_roots_inherit_caller_needs() {
        let callee = crate::loader::load_str(
            "callee.yaml",
            "on:\n  workflow_call:\njobs:\n  A:\n    runs-on: x\n    steps:\n      - run: a\n  B:\n    needs: A\n    runs-on: x\n    steps:\n      - run: b\n",
        )
        .unwrap();
        let caller = crate::loader::load_str(
            "caller.yaml",
            "on: workflow_dispatch\njobs:\n  Setup:\n    runs-on: x\n    steps:\n      - run: s\n  Call:\n    needs: Setup\n    uses: ./.github/workflows/callee.yaml\n  Report:\n    needs: Call\n    runs-on: x\n    steps:\n      - run: r\n",
        )
        .unwrap();
        let catalog = Catalog::new(vec![callee, caller.clone()]);
        let event = TriggerEvent::WorkflowDispatch {
            workflow: "caller.yaml".to_string(),
            git_ref: "refs/heads/develop".to_string(),
            inputs: BTreeMap::new(),
            sha: String::new(),
        };
        let instance = instantiate(&caller, &event).unwrap().unwrap();
        let plan = Planner::new(&catalog).plan(&caller, &instance).unwrap();

        assert_eq!(plan.job("Call/A").unwrap().needs, vec!["Setup".to_string()]);
        assert_eq!(plan.job("Call/B").unwrap().needs, vec!["Call/A".to_string()]);
        let report = plan.job("Report").unwrap();
        assert_eq!(report.needs, vec!["Call/A".to_string(), "Call/B".to_string()]);
        assert_eq!(report.need_aliases["Call"].len(), 2);
        assert_eq!(
            plan.graph().topological_order().unwrap(),
            vec!["Setup", "Call/A", "Call/B", "Report"]
        );
    }
}
