//! Static checks over workflows.
//!
//! Rules never abort on the first problem: every finding is collected into a
//! [`LintReport`] so a single pass shows everything wrong with a workflow set.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

use crate::artifact;
use crate::catalog::Catalog;
use crate::concurrency::{self, ShapeError};
use crate::context::{EvalContext, GithubContext};
use crate::error::WorkflowError;
use crate::expr::{ExprValue, TemplateDiagnostic};
use crate::graph::JobGraph;
use crate::model::{InputKind, InputSpec, StepKind, Workflow};
use crate::obs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Warning => "warning",
            Severity::Error => "error",
        })
    }
}

/// Rule identifiers.
pub mod rules {
    pub const UNKNOWN_NEEDS: &str = "unknown-needs";
    pub const FORWARD_NEEDS: &str = "forward-needs";
    pub const DEPENDENCY_CYCLE: &str = "dependency-cycle";
    pub const CHOICE_DEFAULT: &str = "choice-default";
    pub const CONCURRENCY_COLLISION: &str = "concurrency-collision";
    pub const STRAY_BRACE: &str = "stray-brace";
    pub const ARTIFACT_COLLISION: &str = "artifact-collision";
    pub const UNPINNED_ACTION: &str = "unpinned-action";
    pub const UPLOAD_NOT_ALWAYS: &str = "upload-not-always";
    pub const UNKNOWN_TOX_ENV: &str = "unknown-tox-env";
    pub const INVALID_EXPRESSION: &str = "invalid-expression";
    pub const INVALID_MATRIX: &str = "invalid-matrix";
    pub const UNKNOWN_WORKFLOW_CALL: &str = "unknown-workflow-call";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub rule: &'static str,
    pub severity: Severity,
    /// Workflow file.
    pub workflow: String,
    pub job: Option<String>,
    pub message: String,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} [{}]", self.severity, self.workflow, self.rule)?;
        if let Some(job) = &self.job {
            write!(f, " {job}")?;
        }
        write!(f, ": {}", self.message)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LintReport {
    pub findings: Vec<Finding>,
}

impl LintReport {
    pub fn errors(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.severity == Severity::Warning)
    }

    pub fn has_errors(&self) -> bool {
        self.errors().next().is_some()
    }

    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn by_rule(&self, rule: &str) -> Vec<&Finding> {
        self.findings.iter().filter(|f| f.rule == rule).collect()
    }

    pub fn merge(&mut self, other: LintReport) {
        self.findings.extend(other.findings);
    }
}

#[derive(Debug, Clone, Default)]
pub struct LintOptions {
    /// Environments defined in the tox configuration. `None` skips the
    /// `unknown-tox-env` rule.
    pub tox_envs: Option<BTreeSet<String>>,
}

struct Linter<'w> {
    workflow: &'w Workflow,
    report: LintReport,
}

impl<'w> Linter<'w> {
    fn push(&mut self, rule: &'static str, severity: Severity, job: Option<&str>, message: String) {
        let finding = Finding {
            rule,
            severity,
            workflow: self.workflow.file.clone(),
            job: job.map(str::to_string),
            message,
        };
        obs::emit_lint_finding(&finding);
        self.report.findings.push(finding);
    }

    fn error(&mut self, rule: &'static str, job: Option<&str>, message: String) {
        self.push(rule, Severity::Error, job, message);
    }

    fn warn(&mut self, rule: &'static str, job: Option<&str>, message: String) {
        self.push(rule, Severity::Warning, job, message);
    }

    fn expression_error(&mut self, err: WorkflowError) {
        match err {
            WorkflowError::InvalidMatrix { job, reason } => {
                self.error(rules::INVALID_MATRIX, Some(&job), reason)
            }
            other => self.error(rules::INVALID_EXPRESSION, None, other.to_string()),
        }
    }
}

/// Input values for static checks: declared defaults, or a `<name>`
/// placeholder where none is declared.
fn placeholder_inputs(specs: &[InputSpec]) -> BTreeMap<String, ExprValue> {
    specs
        .iter()
        .map(|spec| {
            let value = spec
                .default_text()
                .unwrap_or_else(|| format!("<{}>", spec.name));
            (spec.name.clone(), ExprValue::from(value))
        })
        .collect()
}

/// A pull request and a branch push context for `workflow`.
fn sample_contexts(workflow: &Workflow) -> Vec<EvalContext> {
    let specs = workflow
        .triggers
        .workflow_dispatch
        .as_deref()
        .or(workflow.triggers.workflow_call.as_deref())
        .unwrap_or(&[]);
    let inputs = placeholder_inputs(specs);
    let pr = GithubContext {
        event_name: "pull_request".to_string(),
        git_ref: "refs/pull/1/merge".to_string(),
        ref_name: "1/merge".to_string(),
        workflow: workflow.name.clone(),
        event: serde_json::json!({ "pull_request": { "number": 1 } }),
        ..GithubContext::default()
    };
    let push = GithubContext {
        event_name: "push".to_string(),
        git_ref: "refs/heads/develop".to_string(),
        ref_name: "develop".to_string(),
        workflow: workflow.name.clone(),
        ..GithubContext::default()
    };
    vec![
        EvalContext::new(pr).with_inputs(inputs.clone()),
        EvalContext::new(push).with_inputs(inputs),
    ]
}

/// Environment names passed to `tox -e` in a rendered script.
pub fn tox_envs_in(script: &str) -> Vec<String> {
    let mut out = Vec::new();
    for line in script.lines() {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some(start) = words.iter().position(|w| *w == "tox") else {
            continue;
        };
        let mut iter = words[start + 1..].iter();
        while let Some(word) = iter.next() {
            if *word == "--" {
                break;
            }
            if *word == "-e" {
                if let Some(envs) = iter.next() {
                    out.extend(envs.split(',').filter(|e| !e.is_empty()).map(str::to_string));
                }
            }
        }
    }
    out
}

fn check_needs(l: &mut Linter<'_>) {
    let wf = l.workflow;
    let position: BTreeMap<&str, usize> = wf
        .jobs
        .iter()
        .enumerate()
        .map(|(i, j)| (j.id.as_str(), i))
        .collect();
    for (i, job) in wf.jobs.iter().enumerate() {
        for need in &job.needs {
            match position.get(need.as_str()) {
                None => l.error(
                    rules::UNKNOWN_NEEDS,
                    Some(job.id.as_str()),
                    format!("needs unknown job '{need}'"),
                ),
                Some(&p) if p >= i => l.warn(
                    rules::FORWARD_NEEDS,
                    Some(job.id.as_str()),
                    format!("needs '{need}', which is defined later in the file"),
                ),
                Some(_) => {}
            }
        }
    }
    if l.report.by_rule(rules::UNKNOWN_NEEDS).is_empty() {
        if let Err(WorkflowError::DependencyCycle { jobs }) =
            JobGraph::from_workflow(wf).and_then(|g| g.topological_order().map(|_| ()))
        {
            l.error(
                rules::DEPENDENCY_CYCLE,
                None,
                format!("dependency cycle through {}", jobs.join(" -> ")),
            );
        }
    }
}

fn check_inputs(l: &mut Linter<'_>) {
    let triggers = &l.workflow.triggers;
    let specs: Vec<InputSpec> = triggers
        .workflow_dispatch
        .iter()
        .chain(triggers.workflow_call.iter())
        .flatten()
        .cloned()
        .collect();
    for spec in specs {
        if let InputKind::Choice {
            options,
            default: Some(default),
        } = &spec.kind
        {
            if !options.contains(default) {
                l.error(
                    rules::CHOICE_DEFAULT,
                    None,
                    format!(
                        "input '{}' defaults to {default:?}, not one of {options:?}",
                        spec.name
                    ),
                );
            }
        }
    }
}

fn check_concurrency(l: &mut Linter<'_>, contexts: &[EvalContext]) {
    let wf = l.workflow;
    for job in &wf.jobs {
        let Some(spec) = &job.concurrency else {
            continue;
        };
        for diag in spec.group.diagnostics() {
            let TemplateDiagnostic::StrayClosingBrace { offset } = diag;
            l.warn(
                rules::STRAY_BRACE,
                Some(job.id.as_str()),
                format!(
                    "concurrency group {:?} has a stray '}}' at offset {offset}; the key keeps it verbatim",
                    spec.group.source()
                ),
            );
        }
    }
    for ctx in contexts {
        let groups = match concurrency::render_groups(wf, ctx) {
            Ok(g) => g,
            Err(e) => {
                l.expression_error(e);
                return;
            }
        };
        for g in groups.iter().filter(|g| g.diverges()) {
            if let Some(ShapeError::TrailingText { text }) = &g.shape_error {
                l.warn(
                    rules::STRAY_BRACE,
                    Some(&g.job),
                    format!(
                        "group {:?} for {} carries trailing {text:?} after the canonical key",
                        g.group, ctx.github.event_name
                    ),
                );
                // One instance is enough to show the defect.
                break;
            }
        }
        for c in concurrency::find_collisions(&groups) {
            l.error(
                rules::CONCURRENCY_COLLISION,
                None,
                format!(
                    "{} render the same group {:?} on {}",
                    c.instances.join(", "),
                    c.group,
                    ctx.github.event_name
                ),
            );
        }
    }
}

fn check_artifacts(l: &mut Linter<'_>, ctx: &EvalContext) {
    let wf = l.workflow;
    for (job, step) in wf.steps() {
        if let StepKind::UploadArtifact(spec) = &step.kind {
            let guarded = step.condition.as_ref().is_some_and(|c| c.runs_after_failure());
            if !guarded {
                l.warn(
                    rules::UPLOAD_NOT_ALWAYS,
                    Some(job.id.as_str()),
                    format!(
                        "upload of {:?} is skipped when an earlier step fails; guard it with always()",
                        spec.name.source()
                    ),
                );
            }
        }
    }
    match artifact::find_collisions(wf, ctx) {
        Ok(collisions) => {
            for c in collisions {
                l.error(rules::ARTIFACT_COLLISION, Some(&c.job), c.to_string());
            }
        }
        Err(e) => l.expression_error(e),
    }
}

fn check_actions(l: &mut Linter<'_>) {
    let wf = l.workflow;
    for (job, step) in wf.steps() {
        let Some(remote) = step.action().and_then(|a| a.remote()) else {
            continue;
        };
        if !remote.is_pinned() {
            l.warn(
                rules::UNPINNED_ACTION,
                Some(job.id.as_str()),
                format!("{remote} is not pinned to a full commit hash"),
            );
        }
    }
}

fn check_tox_envs(l: &mut Linter<'_>, known: &BTreeSet<String>, ctx: &EvalContext) {
    let wf = l.workflow;
    for job in &wf.jobs {
        let combos = match job.matrix().map(|m| m.expand(job.id.as_str())) {
            Some(Ok(c)) => c.into_iter().map(Some).collect(),
            Some(Err(e)) => {
                l.expression_error(e);
                continue;
            }
            None => vec![None],
        };
        let mut unknown = BTreeSet::new();
        for combo in combos {
            let scoped = ctx.clone().with_matrix(combo);
            for step in &job.steps {
                if let StepKind::Run { script, .. } = &step.kind {
                    let rendered = script.render_lenient(&scoped);
                    unknown.extend(tox_envs_in(&rendered).into_iter().filter(|e| !known.contains(e)));
                }
            }
        }
        for env in unknown {
            l.error(
                rules::UNKNOWN_TOX_ENV,
                Some(job.id.as_str()),
                format!("tox environment '{env}' is not defined"),
            );
        }
    }
}

/// Lint one workflow in isolation.
pub fn lint_workflow(workflow: &Workflow, options: &LintOptions) -> LintReport {
    let mut l = Linter {
        workflow,
        report: LintReport::default(),
    };
    check_needs(&mut l);
    check_inputs(&mut l);
    check_actions(&mut l);
    let contexts = sample_contexts(workflow);
    check_concurrency(&mut l, &contexts);
    check_artifacts(&mut l, &contexts[0]);
    if let Some(known) = &options.tox_envs {
        check_tox_envs(&mut l, known, &contexts[0]);
    }
    l.report
}

/// Lint every workflow in `catalog`, including calls between them.
pub fn lint_catalog(catalog: &Catalog, options: &LintOptions) -> LintReport {
    let mut report = LintReport::default();
    for wf in catalog.workflows() {
        let mut l = Linter {
            workflow: wf,
            report: lint_workflow(wf, options),
        };
        for job in &wf.jobs {
            let Some(file) = job.called_workflow() else {
                continue;
            };
            match catalog.get(file) {
                None => l.error(
                    rules::UNKNOWN_WORKFLOW_CALL,
                    Some(job.id.as_str()),
                    format!("calls unknown workflow '{file}'"),
                ),
                Some(callee) if !callee.triggers.is_reusable() => l.error(
                    rules::UNKNOWN_WORKFLOW_CALL,
                    Some(job.id.as_str()),
                    format!("calls '{file}', which has no workflow_call trigger"),
                ),
                Some(_) => {}
            }
        }
        report.merge(l.report);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::load_str;

    fn lint(yaml: &str) -> LintReport {
        lint_workflow(&load_str("t.yaml", yaml).unwrap(), &LintOptions::default())
    }

    #[test]
    fn test_unknown_and_forward_needs() {
        let report = lint(
            "on: push\njobs:\n  A:\n    needs: B\n    runs-on: x\n    steps:\n      - run: a\n  B:\n    runs-on: x\n    steps:\n      - run: b\n  C:\n    needs: Z\n    runs-on: x\n    steps:\n      - run: c\n",
        );
        assert_eq!(report.by_rule(rules::UNKNOWN_NEEDS).len(), 1);
        assert_eq!(report.by_rule(rules::FORWARD_NEEDS).len(), 1);
        assert!(report.has_errors());
    }

    #[test]
    fn test_cycle_reported() {
        let report = lint(
            "on: push\njobs:\n  A:\n    needs: B\n    runs-on: x\n    steps:\n      - run: a\n  B:\n    needs: A\n    runs-on: x\n    steps:\n      - run: b\n",
        );
        assert_eq!(report.by_rule(rules::DEPENDENCY_CYCLE).len(), 1);
    }

    #[test]
    fn test_choice_default_outside_options() {
        let report = lint(
            "on:\n  workflow_dispatch:\n    inputs:\n      eval-upto:\n        type: choice\n        options: [train, export]\n        default: optimize\njobs:\n  A:\n    runs-on: x\n    steps:\n      - run: a\n",
        );
        assert_eq!(report.by_rule(rules::CHOICE_DEFAULT).len(), 1);
    }

    #[test]
    fn test_concurrency_collision_without_matrix_discriminator() {
        let report = lint(
            "on: pull_request\njobs:\n  Unit:\n    runs-on: x\n    strategy:\n      matrix:\n        py: ['3.10', '3.11']\n    concurrency:\n      group: ${{ github.workflow }}-Unit-${{ github.event.pull_request.number || github.ref }}\n      cancel-in-progress: true\n    steps:\n      - run: a\n",
        );
        // One per sample context.
        assert_eq!(report.by_rule(rules::CONCURRENCY_COLLISION).len(), 2);
    }

    #[test]
    fn test_artifact_collision_and_unguarded_upload() {
        let report = lint(
            "on: push\njobs:\n  Bench:\n    runs-on: x\n    strategy:\n      matrix:\n        task: [det, cls]\n    steps:\n      - run: a\n      - uses: actions/upload-artifact@v4\n        with:\n          name: results\n          path: out.csv\n",
        );
        assert_eq!(report.by_rule(rules::ARTIFACT_COLLISION).len(), 1);
        assert_eq!(report.by_rule(rules::UPLOAD_NOT_ALWAYS).len(), 1);
        assert_eq!(report.by_rule(rules::UNPINNED_ACTION).len(), 1);
    }

    #[test]
    fn test_tox_env_extraction() {
        assert_eq!(
            tox_envs_in("tox -vv -e unit-test-py310,integration-test-action -- -k det -e x"),
            vec!["unit-test-py310".to_string(), "integration-test-action".to_string()]
        );
        assert!(tox_envs_in("pytest tests").is_empty());
    }

    #[test]
    fn test_unknown_tox_env() {
        let wf = load_str(
            "t.yaml",
            "on: push\njobs:\n  Unit:\n    runs-on: x\n    strategy:\n      matrix:\n        tox-env: [py310, py39]\n    steps:\n      - run: tox -e unit-test-${{ matrix.tox-env }}\n",
        )
        .unwrap();
        let options = LintOptions {
            tox_envs: Some(["unit-test-py310".to_string()].into_iter().collect()),
        };
        let report = lint_workflow(&wf, &options);
        let findings = report.by_rule(rules::UNKNOWN_TOX_ENV);
        assert_eq!(findings.len(), 1);
        assert!(findings[0].message.contains("unit-test-py39"));
    }
}
