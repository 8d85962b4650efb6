//! wfgraph - typed CI workflow graphs
//!
//! The `wfgraph` command loads the project's GitHub Actions workflows as typed
//! records and answers questions about them without a hosted runner.
//!
//! ## Commands
//!
//! - `validate`: lint every workflow (needs, choice defaults, group and artifact collisions)
//! - `trigger`: which workflows an event starts, with resolved inputs
//! - `plan`: job levels, matrix instances and concurrency groups for an event
//! - `keys`: rendered concurrency groups, flagging ones that diverge from their canonical shape
//! - `run`: execute the planned jobs locally
//! - `dockerfile`: render the CI container recipe

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures::future::try_join_all;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};

use wfgraph_core::concurrency::{find_collisions, render_groups};
use wfgraph_core::trigger::resolve;
use wfgraph_core::{
    lint_catalog, obs, telemetry, Catalog, CiEnvironment, ContainerRecipe, EngineConfig,
    LintOptions, Planner, RenderedGroup, RunPlan, TriggerEvent, WorkflowInstance,
};
use wfgraph_engine::{
    CancellationToken, DryRunExecutor, ProcessExecutor, RunReport, RunVerdict, StepExecutor,
    WorkflowEngine,
};
use wfgraph_state::fakes::MemoryRunLedger;
use wfgraph_state::{FsArtifactStore, RunId, RunLedger};

#[derive(Parser)]
#[command(name = "wfgraph")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Typed CI workflow graphs", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Load workflows from this directory instead of the built-in set
    #[arg(long, global = true, env = "WFGRAPH_WORKFLOWS_DIR")]
    workflows_dir: Option<PathBuf>,

    /// Output format for command results
    #[arg(long, global = true, value_enum, default_value_t = Format::Text)]
    format: Format,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Lint every workflow in the catalog
    Validate {
        /// Tox environments that exist (comma-separated); enables the unknown-tox-env rule
        #[arg(long, value_delimiter = ',')]
        tox_envs: Option<Vec<String>>,
    },

    /// List the workflows an event triggers, with resolved inputs
    Trigger {
        #[command(flatten)]
        event: EventArgs,
    },

    /// Show the job plan for every workflow an event triggers
    Plan {
        #[command(flatten)]
        event: EventArgs,
    },

    /// Render concurrency groups for an event
    Keys {
        #[command(flatten)]
        event: EventArgs,
    },

    /// Execute the workflows an event triggers
    Run {
        #[command(flatten)]
        event: EventArgs,

        /// Engine configuration (JSON): runner pools, timeouts, workspace
        #[arg(long)]
        config: Option<PathBuf>,

        /// Source tree checked out into each job (overrides the configuration)
        #[arg(short, long)]
        workspace: Option<PathBuf>,

        /// Log step commands instead of executing them
        #[arg(long)]
        dry_run: bool,
    },

    /// Render the CI container Dockerfile
    Dockerfile {
        /// Recipe overrides (JSON)
        #[arg(long)]
        recipe: Option<PathBuf>,

        /// Python `major.minor` to install
        #[arg(long)]
        python_version: Option<String>,

        /// Write here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum EventKind {
    Push,
    PullRequest,
    WorkflowDispatch,
    Schedule,
}

/// A repository event, from flags or from a JSON file.
#[derive(clap::Args, Debug, Clone)]
struct EventArgs {
    /// Event JSON (`{"event": "push", "git_ref": ...}`); overrides the other event flags
    #[arg(long)]
    event_file: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = EventKind::Push)]
    event: EventKind,

    /// Fully qualified ref for push, dispatch and schedule
    #[arg(long = "ref", default_value = "refs/heads/develop")]
    git_ref: String,

    #[arg(long, default_value = "")]
    sha: String,

    /// Pull request number
    #[arg(long, default_value_t = 1)]
    pr: u64,

    /// The pull request comes from a fork
    #[arg(long)]
    fork: bool,

    #[arg(long, default_value = "develop")]
    base: String,

    #[arg(long, default_value = "feature")]
    head: String,

    /// Workflow file for workflow_dispatch
    #[arg(long)]
    workflow: Option<String>,

    /// Dispatch input as `name=value` (repeatable)
    #[arg(short, long = "input", value_parser = parse_input)]
    inputs: Vec<(String, String)>,

    /// Cron expression for schedule events
    #[arg(long, default_value = "0 18 * * 1-5")]
    cron: String,
}

fn parse_input(raw: &str) -> std::result::Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got `{raw}`"))?;
    if name.is_empty() {
        return Err(format!("empty input name in `{raw}`"));
    }
    Ok((name.to_string(), value.to_string()))
}

impl EventArgs {
    fn to_event(&self) -> Result<TriggerEvent> {
        if let Some(path) = &self.event_file {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read event file {}", path.display()))?;
            return serde_json::from_str(&text)
                .with_context(|| format!("Invalid event in {}", path.display()));
        }
        Ok(match self.event {
            EventKind::Push => TriggerEvent::Push {
                git_ref: self.git_ref.clone(),
                sha: self.sha.clone(),
            },
            EventKind::PullRequest => TriggerEvent::PullRequest {
                number: self.pr,
                base: self.base.clone(),
                head: self.head.clone(),
                action: "synchronize".to_string(),
                fork: self.fork,
                sha: self.sha.clone(),
            },
            EventKind::WorkflowDispatch => TriggerEvent::WorkflowDispatch {
                workflow: self
                    .workflow
                    .clone()
                    .context("--workflow is required for workflow_dispatch")?,
                git_ref: self.git_ref.clone(),
                inputs: self.inputs.iter().cloned().collect(),
                sha: self.sha.clone(),
            },
            EventKind::Schedule => TriggerEvent::Schedule {
                cron: self.cron.clone(),
                git_ref: self.git_ref.clone(),
                sha: self.sha.clone(),
            },
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    telemetry::init_tracing(cli.json, level);

    let catalog = load_catalog(cli.workflows_dir.as_deref())?;
    let format = cli.format;

    match cli.command {
        Commands::Validate { tox_envs } => cmd_validate(&catalog, tox_envs, format),
        Commands::Trigger { event } => cmd_trigger(&catalog, &event.to_event()?, format),
        Commands::Plan { event } => cmd_plan(&catalog, &event.to_event()?, format),
        Commands::Keys { event } => cmd_keys(&catalog, &event.to_event()?, format),
        Commands::Run {
            event,
            config,
            workspace,
            dry_run,
        } => {
            let mut engine_config = match &config {
                Some(path) => EngineConfig::load(path)
                    .with_context(|| format!("Failed to load engine config {}", path.display()))?,
                None => EngineConfig::default(),
            };
            if let Some(workspace) = workspace {
                engine_config.workspace = workspace;
            }
            engine_config.dry_run |= dry_run;
            cmd_run(&catalog, &event.to_event()?, engine_config, format).await
        }
        Commands::Dockerfile {
            recipe,
            python_version,
            output,
        } => cmd_dockerfile(recipe.as_deref(), python_version, output.as_deref()),
    }
}

fn load_catalog(dir: Option<&Path>) -> Result<Catalog> {
    match dir {
        Some(dir) => Catalog::from_dir(dir)
            .with_context(|| format!("Failed to load workflows from {}", dir.display())),
        None => Catalog::builtin().context("Built-in workflows failed to load"),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Lint the catalog; fails if any finding is an error.
fn cmd_validate(catalog: &Catalog, tox_envs: Option<Vec<String>>, format: Format) -> Result<()> {
    let options = LintOptions {
        tox_envs: tox_envs.map(|envs| envs.into_iter().collect::<BTreeSet<_>>()),
    };
    let report = lint_catalog(catalog, &options);
    for finding in &report.findings {
        obs::emit_lint_finding(finding);
    }

    match format {
        Format::Json => print_json(&report)?,
        Format::Text => {
            for finding in &report.findings {
                println!("{finding}");
            }
            println!(
                "{} workflow(s): {} error(s), {} warning(s)",
                catalog.len(),
                report.errors().count(),
                report.warnings().count()
            );
        }
    }

    if report.has_errors() {
        bail!("Validation failed");
    }
    Ok(())
}

fn instances(catalog: &Catalog, event: &TriggerEvent) -> Result<Vec<WorkflowInstance>> {
    let instances = resolve(catalog.workflows(), event).context("Failed to resolve trigger")?;
    if instances.is_empty() {
        info!(event = event.name(), "no workflow triggered");
    }
    Ok(instances)
}

fn plans(catalog: &Catalog, event: &TriggerEvent) -> Result<Vec<RunPlan>> {
    let planner = Planner::new(catalog);
    instances(catalog, event)?
        .iter()
        .map(|instance| {
            let workflow = catalog.require(&instance.file)?;
            planner
                .plan(workflow, instance)
                .with_context(|| format!("Failed to plan {}", instance.file))
        })
        .collect()
}

#[derive(Serialize)]
struct TriggeredWorkflow {
    file: String,
    workflow: String,
    git_ref: String,
    inputs: BTreeMap<String, String>,
}

fn cmd_trigger(catalog: &Catalog, event: &TriggerEvent, format: Format) -> Result<()> {
    let triggered: Vec<TriggeredWorkflow> = instances(catalog, event)?
        .iter()
        .map(|i| TriggeredWorkflow {
            file: i.file.clone(),
            workflow: i.workflow.clone(),
            git_ref: i.github.git_ref.clone(),
            inputs: i.input_text(),
        })
        .collect();

    match format {
        Format::Json => print_json(&triggered),
        Format::Text => {
            for t in &triggered {
                println!("{} ({}) on {}", t.workflow, t.file, t.git_ref);
                for (name, value) in &t.inputs {
                    println!("  {name} = {value}");
                }
            }
            Ok(())
        }
    }
}

fn render_plan_text(plan: &RunPlan) -> Result<String> {
    use std::fmt::Write;

    let execution = plan.execution_plan()?;
    let mut out = String::new();
    writeln!(out, "{} ({})", plan.workflow, plan.file)?;
    if let Some(group) = &plan.concurrency {
        writeln!(out, "  concurrency: {} (cancel-in-progress: {})", group.group, group.cancel_in_progress)?;
    }
    for (level, steps) in execution.parallel_groups().iter().enumerate() {
        writeln!(out, "  level {level}:")?;
        for step in steps {
            let Some(job) = plan.job(&step.job) else {
                continue;
            };
            let needs = if job.needs.is_empty() {
                String::new()
            } else {
                format!(" (needs: {})", job.needs.join(", "))
            };
            writeln!(out, "    {} [{}]{needs}", job.id, job.runs_on.join(", "))?;
            for instance in &job.instances {
                match &instance.concurrency {
                    Some(group) => writeln!(out, "      - {}  group: {}", instance.name, group.group)?,
                    None => writeln!(out, "      - {}", instance.name)?,
                }
            }
        }
    }
    Ok(out)
}

fn cmd_plan(catalog: &Catalog, event: &TriggerEvent, format: Format) -> Result<()> {
    let plans = plans(catalog, event)?;
    match format {
        Format::Json => print_json(&plans),
        Format::Text => {
            for plan in &plans {
                print!("{}", render_plan_text(plan)?);
            }
            Ok(())
        }
    }
}

#[derive(Serialize)]
struct WorkflowKeys {
    file: String,
    groups: Vec<RenderedGroup>,
    collisions: Vec<wfgraph_core::concurrency::Collision>,
}

fn workflow_keys(catalog: &Catalog, event: &TriggerEvent) -> Result<Vec<WorkflowKeys>> {
    instances(catalog, event)?
        .iter()
        .map(|instance| {
            let workflow = catalog.require(&instance.file)?;
            let groups = render_groups(workflow, &instance.eval_context())?;
            let collisions = find_collisions(&groups);
            Ok(WorkflowKeys {
                file: instance.file.clone(),
                groups,
                collisions,
            })
        })
        .collect()
}

fn cmd_keys(catalog: &Catalog, event: &TriggerEvent, format: Format) -> Result<()> {
    let keys = workflow_keys(catalog, event)?;
    match format {
        Format::Json => print_json(&keys),
        Format::Text => {
            for wf in &keys {
                println!("{}", wf.file);
                for g in &wf.groups {
                    let marker = if g.diverges() { "  !" } else { "   " };
                    println!("{marker} {}: {}", g.instance, g.group);
                    if let (true, Some(key)) = (g.diverges(), &g.canonical) {
                        println!("      canonical: {}", key.render());
                    }
                }
                for c in &wf.collisions {
                    println!("  collision on {}: {}", c.group, c.instances.join(", "));
                }
            }
            Ok(())
        }
    }
}

#[derive(Serialize)]
struct RunOutput<'a> {
    report: &'a RunReport,
    verdict: &'a RunVerdict,
}

async fn cmd_run(
    catalog: &Catalog,
    event: &TriggerEvent,
    config: EngineConfig,
    format: Format,
) -> Result<()> {
    let plans = plans(catalog, event)?;
    if plans.is_empty() {
        println!("No workflow triggered by {}", event.name());
        return Ok(());
    }

    let executor: Arc<dyn StepExecutor> = if config.dry_run {
        Arc::new(DryRunExecutor::new())
    } else {
        Arc::new(ProcessExecutor::new(config.shell.clone()))
    };
    let ledger = Arc::new(MemoryRunLedger::new());
    let artifacts = Arc::new(
        FsArtifactStore::new(&config.artifact_dir)
            .with_context(|| format!("Failed to open artifact store {}", config.artifact_dir.display()))?,
    );
    let engine = WorkflowEngine::new(config, executor, ledger.clone(), artifacts)
        .with_environment(CiEnvironment::from_env());

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling runs");
            on_signal.cancel();
        }
    });

    let reports = try_join_all(
        plans
            .into_iter()
            .map(|plan| engine.run_with_cancel(plan, cancel.clone())),
    )
    .await
    .context("Workflow run failed")?;

    let mut all_passed = true;
    for report in &reports {
        let events = ledger.get_events(&RunId(report.run_id.clone())).await?;
        let verdict = RunVerdict::evaluate_run(&report.run_id, &events);
        all_passed &= report.success() && verdict.passed;

        match format {
            Format::Json => print_json(&RunOutput {
                report,
                verdict: &verdict,
            })?,
            Format::Text => print!("{}", render_report_text(report, &verdict)),
        }
    }

    if !all_passed {
        bail!("Workflow run failed");
    }
    Ok(())
}

fn render_report_text(report: &RunReport, verdict: &RunVerdict) -> String {
    let mut out = format!(
        "{} [{}] {} in {}ms\n",
        report.workflow, report.run_id, report.conclusion, report.duration_ms
    );
    for job in &report.jobs {
        out.push_str(&format!("  {} {}\n", job.conclusion, job.id));
        if let Some(reason) = &job.skipped_reason {
            out.push_str(&format!("      {reason}\n"));
        }
        for instance in &job.instances {
            out.push_str(&format!(
                "    {} {} ({}ms)\n",
                instance.conclusion, instance.name, instance.duration_ms
            ));
            if let Some(message) = &instance.message {
                out.push_str(&format!("      {message}\n"));
            }
            for step in instance.steps.iter().filter(|s| !s.conclusion.is_success()) {
                out.push_str(&format!("      {} {}\n", step.conclusion, step.name));
            }
        }
    }
    out.push_str(&format!("  verdict: {}\n", verdict.message));
    for violation in &verdict.violations {
        out.push_str(&format!("    - {violation}\n"));
    }
    out
}

fn cmd_dockerfile(
    recipe: Option<&Path>,
    python_version: Option<String>,
    output: Option<&Path>,
) -> Result<()> {
    let mut recipe = match recipe {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read recipe {}", path.display()))?;
            serde_json::from_str::<ContainerRecipe>(&text)
                .with_context(|| format!("Invalid recipe in {}", path.display()))?
        }
        None => ContainerRecipe::default(),
    };
    if let Some(version) = python_version {
        recipe.python_version = version;
    }

    let dockerfile = recipe.render();
    match output {
        Some(path) => {
            std::fs::write(path, &dockerfile)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!(path = %path.display(), hash = %recipe.hash().short(), "dockerfile written");
        }
        None => print!("{dockerfile}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn event_args(argv: &[&str]) -> EventArgs {
        let mut full = vec!["wfgraph", "plan"];
        full.extend_from_slice(argv);
        match Cli::try_parse_from(full).unwrap().command {
            Commands::Plan { event } => event,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_input_pairs() {
        assert_eq!(
            parse_input("data-size=large").unwrap(),
            ("data-size".to_string(), "large".to_string())
        );
        assert_eq!(
            parse_input("pytest-args=-k det=1").unwrap(),
            ("pytest-args".to_string(), "-k det=1".to_string())
        );
        assert!(parse_input("no-equals").is_err());
        assert!(parse_input("=value").is_err());
    }

    #[test]
    fn test_pull_request_flags_build_event() {
        let event = event_args(&["--event", "pull-request", "--pr", "42", "--fork"])
            .to_event()
            .unwrap();
        match event {
            TriggerEvent::PullRequest { number, fork, .. } => {
                assert_eq!(number, 42);
                assert!(fork);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_dispatch_requires_workflow() {
        let args = event_args(&["--event", "workflow-dispatch"]);
        assert!(args.to_event().is_err());

        let event = event_args(&[
            "--event",
            "workflow-dispatch",
            "--workflow",
            "perf_accuracy.yaml",
            "-i",
            "data-size=small",
        ])
        .to_event()
        .unwrap();
        match event {
            TriggerEvent::WorkflowDispatch { inputs, .. } => {
                assert_eq!(inputs.get("data-size").map(String::as_str), Some("small"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_event_file_overrides_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("event.json");
        std::fs::write(
            &path,
            r#"{"event": "schedule", "cron": "0 19 * * 1-5"}"#,
        )
        .unwrap();
        let event = event_args(&["--event-file", path.to_str().unwrap()])
            .to_event()
            .unwrap();
        assert_eq!(event.name(), "schedule");
    }

    #[test]
    fn test_pr_plan_lists_levels_and_groups() {
        let catalog = Catalog::builtin().unwrap();
        let event = event_args(&["--event", "pull-request", "--pr", "42"]).to_event().unwrap();
        let plans = plans(&catalog, &event).unwrap();
        assert_eq!(plans.len(), 1);

        let text = render_plan_text(&plans[0]).unwrap();
        assert!(text.starts_with("PR Checks (pr_check.yaml)"));
        let level0 = text.find("level 0:").unwrap();
        let level1 = text.find("level 1:").unwrap();
        let quality = text.find("Code-Quality-Checks").unwrap();
        let unit = text.find("Unit-Test [").unwrap();
        assert!(level0 < quality && quality < level1 && level1 < unit);
        assert!(text.contains("group: PR Checks-Coverage-42}"));
    }

    #[test]
    fn test_keys_flag_the_stray_brace() {
        let catalog = Catalog::builtin().unwrap();
        let event = event_args(&["--event", "pull-request", "--pr", "42"]).to_event().unwrap();
        let keys = workflow_keys(&catalog, &event).unwrap();
        let pr = keys.iter().find(|k| k.file == "pr_check.yaml").unwrap();

        let diverging: Vec<&str> = pr
            .groups
            .iter()
            .filter(|g| g.diverges())
            .map(|g| g.job.as_str())
            .collect();
        assert_eq!(diverging, vec!["Coverage-Test"]);
        assert!(pr.collisions.is_empty());
    }

    #[test]
    fn test_validate_builtin_catalog_passes() {
        let catalog = Catalog::builtin().unwrap();
        cmd_validate(&catalog, None, Format::Json).unwrap();
    }

    #[test]
    fn test_validate_rejects_unknown_needs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("broken.yaml"),
            "name: Broken\non: push\njobs:\n  B:\n    runs-on: ubuntu-22.04\n    needs: Missing\n    steps:\n      - run: echo\n",
        )
        .unwrap();
        let catalog = load_catalog(Some(dir.path())).unwrap();
        let err = cmd_validate(&catalog, None, Format::Text).unwrap_err();
        assert!(err.to_string().contains("Validation failed"));
    }

    #[test]
    fn test_dockerfile_written_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("Dockerfile");
        cmd_dockerfile(None, Some("3.11".to_string()), Some(&out)).unwrap();
        let text = std::fs::read_to_string(out).unwrap();
        assert!(text.contains("python3.11"));
    }

    #[tokio::test]
    async fn test_dry_run_of_pull_request_succeeds() {
        let workspace = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            workspace: workspace.path().to_path_buf(),
            artifact_dir: workspace.path().join("artifacts"),
            dry_run: true,
            ..EngineConfig::default()
        };
        let catalog = Catalog::builtin().unwrap();
        let event = event_args(&["--event", "pull-request", "--pr", "42"]).to_event().unwrap();
        cmd_run(&catalog, &event, config, Format::Json).await.unwrap();
    }
}
