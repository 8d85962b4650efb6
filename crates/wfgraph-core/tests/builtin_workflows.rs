//! End-to-end checks over the embedded workflow catalog.

use std::collections::BTreeMap;

use wfgraph_core::concurrency::render_groups;
use wfgraph_core::config::CiEnvironment;
use wfgraph_core::lint::rules;
use wfgraph_core::model::StepKind;
use wfgraph_core::trigger::resolve;
use wfgraph_core::{
    instantiate, lint_catalog, BenchmarkInvocation, Catalog, ExprValue, LintOptions, Planner,
    TriggerEvent,
};

fn catalog() -> Catalog {
    Catalog::builtin().unwrap()
}

fn dispatch(file: &str, inputs: &[(&str, &str)]) -> TriggerEvent {
    TriggerEvent::WorkflowDispatch {
        workflow: file.to_string(),
        git_ref: "refs/heads/develop".to_string(),
        inputs: inputs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        sha: "0123abcd".to_string(),
    }
}

fn pull_request(number: u64, fork: bool) -> TriggerEvent {
    TriggerEvent::PullRequest {
        number,
        base: "develop".to_string(),
        head: "feature/x".to_string(),
        action: "synchronize".to_string(),
        fork,
        sha: "0123abcd".to_string(),
    }
}

#[test]
fn perf_dispatch_without_inputs_uses_declared_defaults() {
    let catalog = catalog();
    let wf = catalog.require("perf_efficiency.yaml").unwrap();
    let instance = instantiate(wf, &dispatch("perf_efficiency.yaml", &[])).unwrap().unwrap();
    let plan = Planner::new(&catalog).plan(wf, &instance).unwrap();
    let job = &plan.jobs[0];

    let invocation = BenchmarkInvocation::from_inputs(
        &job.inputs,
        "detection",
        "det",
        &CiEnvironment::default(),
        None,
    )
    .unwrap();
    let args = invocation.to_args();
    for pair in [
        ["--model-category", "default"],
        ["--data-size", "medium"],
        ["--num-repeat", "1"],
        ["--num-epoch", "2"],
        ["--eval-upto", "optimize"],
    ] {
        assert!(args.windows(2).any(|w| w == pair), "missing {pair:?} in {args:?}");
    }
}

#[test]
fn scheduled_accuracy_run_uses_dispatch_defaults() {
    let catalog = catalog();
    let event = TriggerEvent::Schedule {
        cron: "0 18 * * 6".to_string(),
        git_ref: "refs/heads/develop".to_string(),
        sha: String::new(),
    };
    let instances = resolve(catalog.workflows(), &event).unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].file, "perf_accuracy.yaml");
    assert_eq!(instances[0].inputs["data-size"], ExprValue::from("all"));
}

#[test]
fn rendered_benchmark_script_matches_typed_command() {
    let catalog = catalog();
    let wf = catalog.require("perf_efficiency.yaml").unwrap();
    let event = dispatch("perf_efficiency.yaml", &[("data-size", "small"), ("pytest-args", "-k yolox")]);
    let instance = instantiate(wf, &event).unwrap().unwrap();
    let plan = Planner::new(&catalog).plan(wf, &instance).unwrap();
    let job = &plan.jobs[0];
    let det = job
        .instances
        .iter()
        .find(|i| i.name == "Perf-Benchmark-det")
        .unwrap();

    let env = CiEnvironment {
        mlflow_tracking_server_uri: Some("http://mlflow:5000".to_string()),
        ..CiEnvironment::default()
    };
    let mut ctx = plan.eval_context(job, det.matrix.as_ref()).with_vars(env.vars());
    ctx.github.actor = "ci-bot".to_string();

    let script = job
        .steps
        .iter()
        .find_map(|s| match &s.kind {
            StepKind::Run { script, .. } if script.source().contains("perf-benchmark") => Some(script),
            _ => None,
        })
        .unwrap()
        .render(&ctx)
        .unwrap();
    let rendered: Vec<&str> = script.split_whitespace().collect();

    let typed = BenchmarkInvocation::from_inputs(&job.inputs, "detection", "det", &env, Some("ci-bot"))
        .unwrap()
        .command();
    assert_eq!(rendered, typed.iter().map(String::as_str).collect::<Vec<_>>());
}

#[test]
fn fork_pull_requests_skip_the_codecov_upload() {
    let catalog = catalog();
    let wf = catalog.require("pr_check.yaml").unwrap();
    for (fork, expected) in [(false, true), (true, false)] {
        let instance = instantiate(wf, &pull_request(7, fork)).unwrap().unwrap();
        let plan = Planner::new(&catalog).plan(wf, &instance).unwrap();
        let job = plan.job("Coverage-Test").unwrap();
        let ctx = plan.eval_context(job, None);
        let codecov = job
            .steps
            .iter()
            .find(|s| s.label().contains("Codecov"))
            .unwrap();
        assert_eq!(codecov.condition.as_ref().unwrap().evaluate(&ctx), expected);
    }
}

#[test]
fn coverage_group_keeps_its_stray_brace() {
    let catalog = catalog();
    let wf = catalog.require("pr_check.yaml").unwrap();
    let instance = instantiate(wf, &pull_request(42, false)).unwrap().unwrap();
    let groups = render_groups(wf, &instance.eval_context()).unwrap();

    let coverage = groups.iter().find(|g| g.job == "Coverage-Test").unwrap();
    assert_eq!(coverage.group, "PR Checks-Coverage-42}");
    assert!(coverage.diverges());

    let unit: Vec<&str> = groups
        .iter()
        .filter(|g| g.job == "Unit-Test")
        .map(|g| g.group.as_str())
        .collect();
    assert_eq!(unit, ["PR Checks-Unit-42-py310", "PR Checks-Unit-42-py311"]);
}

#[test]
fn builtin_catalog_lints_without_errors() {
    let report = lint_catalog(&catalog(), &LintOptions::default());
    let errors: Vec<String> = report.errors().map(ToString::to_string).collect();
    assert!(errors.is_empty(), "unexpected errors: {errors:#?}");

    let stray = report.by_rule(rules::STRAY_BRACE);
    assert!(!stray.is_empty());
    assert!(stray
        .iter()
        .all(|f| f.job.as_deref() == Some("Coverage-Test")));
    assert!(report.by_rule(rules::ARTIFACT_COLLISION).is_empty());
    assert!(report.by_rule(rules::CONCURRENCY_COLLISION).is_empty());
}

#[test]
fn invalid_dispatch_choice_is_rejected_before_planning() {
    let catalog = catalog();
    let wf = catalog.require("perf_efficiency.yaml").unwrap();
    let err = instantiate(wf, &dispatch("perf_efficiency.yaml", &[("data-size", "huge")])).unwrap_err();
    assert!(err.to_string().contains("huge"));

    let unknown = instantiate(wf, &dispatch("perf_efficiency.yaml", &[("gpu", "a100")])).unwrap_err();
    assert!(unknown.to_string().contains("gpu"));
}

#[test]
fn accuracy_dispatch_defaults() {
    let catalog = catalog();
    let wf = catalog.require("perf_accuracy.yaml").unwrap();
    let inputs: BTreeMap<String, String> = instantiate(wf, &dispatch("perf_accuracy.yaml", &[]))
        .unwrap()
        .unwrap()
        .input_text();
    assert_eq!(inputs["data-size"], "all");
    assert_eq!(inputs["num-repeat"], "0");
    assert_eq!(inputs["eval-upto"], "optimize");
}
