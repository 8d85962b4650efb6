//! Dependency-gated execution of a run plan.
//!
//! Each planned job runs on its own task once every job it needs reached a
//! terminal state; each matrix instance runs on its own task inside it.
//! Steps within an instance run sequentially in a working directory of their
//! own.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};
use wfgraph_core::artifact::{self, ArtifactSpec};
use wfgraph_core::config::{CiEnvironment, EngineConfig};
use wfgraph_core::context::{EvalContext, JobConclusion, NeedResult, StepResult};
use wfgraph_core::expr::JobStatus;
use wfgraph_core::model::{ActionUse, Step, StepKind};
use wfgraph_core::obs;
use wfgraph_core::plan::{JobInstance, PlannedJob, RunPlan};
use wfgraph_state::{
    ArtifactPayload, ArtifactStore, ContentDigest, RunLedger, RunMetadata, RunSummary,
};

use crate::error::{EngineError, Result};
use crate::gate::ConcurrencyGate;
use crate::pool::RunnerPools;
use crate::recorder::{kinds, RunRecorder};
use crate::runner::{StepCommand, StepExecutor};
use crate::workspace::{self, InstanceWorkspace, CHECKOUT_ACTION};

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub name: String,
    pub conclusion: JobConclusion,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    /// Failure detail or upload notice.
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceReport {
    pub label: String,
    pub name: String,
    pub conclusion: JobConclusion,
    pub steps: Vec<StepReport>,
    pub duration_ms: u64,
    pub message: Option<String>,
}

impl InstanceReport {
    fn not_run(instance: &JobInstance, started: Instant, message: String) -> Self {
        Self {
            label: instance.label.clone(),
            name: instance.name.clone(),
            conclusion: JobConclusion::Cancelled,
            steps: Vec::new(),
            duration_ms: started.elapsed().as_millis() as u64,
            message: Some(message),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub id: String,
    pub conclusion: JobConclusion,
    /// Why the job never started, if it did not.
    pub skipped_reason: Option<String>,
    pub instances: Vec<InstanceReport>,
    pub duration_ms: u64,
}

/// Result of one workflow run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub workflow: String,
    pub conclusion: JobConclusion,
    /// In plan order.
    pub jobs: Vec<JobReport>,
    pub duration_ms: u64,
    pub spec_digest: String,
}

impl RunReport {
    pub fn success(&self) -> bool {
        self.conclusion.is_success()
    }

    pub fn job(&self, id: &str) -> Option<&JobReport> {
        self.jobs.iter().find(|j| j.id == id)
    }

    /// Instances that succeeded, and everything else (skipped jobs count once).
    pub fn tally(&self) -> (u32, u32) {
        let mut ok = 0;
        let mut not_ok = 0;
        for job in &self.jobs {
            if job.instances.is_empty() {
                not_ok += 1;
            }
            for instance in &job.instances {
                if instance.conclusion.is_success() {
                    ok += 1;
                } else {
                    not_ok += 1;
                }
            }
        }
        (ok, not_ok)
    }
}

/// Worst conclusion wins: failure, then cancelled, then skipped.
fn aggregate(conclusions: impl IntoIterator<Item = JobConclusion>) -> JobConclusion {
    let all: Vec<JobConclusion> = conclusions.into_iter().collect();
    [
        JobConclusion::Failure,
        JobConclusion::Cancelled,
        JobConclusion::Skipped,
    ]
    .into_iter()
    .find(|c| all.contains(c))
    .unwrap_or(JobConclusion::Success)
}

/// `needs.<alias>` results for `job`, from finished dependencies.
fn need_results(job: &PlannedJob, done: &BTreeMap<String, JobReport>) -> BTreeMap<String, NeedResult> {
    job.need_aliases
        .iter()
        .map(|(alias, ids)| {
            let result = aggregate(ids.iter().filter_map(|id| done.get(id)).map(|r| r.conclusion));
            (
                alias.clone(),
                NeedResult {
                    result,
                    outputs: BTreeMap::new(),
                },
            )
        })
        .collect()
}

fn working_dir(root: &Path, relative: Option<&str>) -> PathBuf {
    match relative {
        Some(dir) => root.join(dir),
        None => root.to_path_buf(),
    }
}

fn last_line(text: &str) -> Option<String> {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

/// Executes run plans against a step executor, a ledger and an artifact store.
#[derive(Clone)]
pub struct WorkflowEngine {
    config: Arc<EngineConfig>,
    environment: Arc<CiEnvironment>,
    executor: Arc<dyn StepExecutor>,
    ledger: Arc<dyn RunLedger>,
    artifacts: Arc<dyn ArtifactStore>,
    gate: ConcurrencyGate,
    pools: RunnerPools,
}

impl WorkflowEngine {
    pub fn new(
        config: EngineConfig,
        executor: Arc<dyn StepExecutor>,
        ledger: Arc<dyn RunLedger>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        let pools = RunnerPools::new(&config.runner_pools);
        Self {
            config: Arc::new(config),
            environment: Arc::new(CiEnvironment::default()),
            executor,
            ledger,
            artifacts,
            gate: ConcurrencyGate::new(),
            pools,
        }
    }

    pub fn with_environment(mut self, environment: CiEnvironment) -> Self {
        self.environment = Arc::new(environment);
        self
    }

    /// Share concurrency groups with other engines.
    pub fn with_gate(mut self, gate: ConcurrencyGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    pub async fn run(&self, plan: RunPlan) -> Result<RunReport> {
        self.run_with_cancel(plan, CancellationToken::new()).await
    }

    /// Execute `plan`; cancelling `cancel` cancels the whole run.
    pub async fn run_with_cancel(&self, plan: RunPlan, cancel: CancellationToken) -> Result<RunReport> {
        let start = Instant::now();
        let plan = Arc::new(plan);
        let spec_digest = ContentDigest::from_bytes(&serde_json::to_vec(&*plan)?);
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        let metadata = RunMetadata {
            workflow: plan.workflow.clone(),
            event: plan.github.event_name.clone(),
            git_ref: non_empty(&plan.github.git_ref),
            git_sha: non_empty(&plan.github.sha),
            tags: json!({
                "file": &plan.file,
                "inputs": plan.inputs.iter().map(|(k, v)| (k.clone(), v.render())).collect::<BTreeMap<_, _>>(),
                "jobs": plan.jobs.iter().map(|j| &j.id).collect::<Vec<_>>(),
            }),
        };
        let recorder = Arc::new(RunRecorder::start(self.ledger.clone(), &spec_digest, metadata).await?);
        let run_id = recorder.run_id().to_string();
        let span = obs::run_span(&run_id, &plan.file);

        let run_permit = match &plan.concurrency {
            Some(group) => {
                let admitted = self
                    .gate
                    .acquire(&group.group, &run_id, group.cancel_in_progress, cancel.clone())
                    .instrument(span.clone())
                    .await;
                match admitted {
                    Ok(permit) => Some(permit),
                    Err(admission) => {
                        debug!(run_id = %run_id, reason = %admission, "run not admitted");
                        cancel.cancel();
                        None
                    }
                }
            }
            None => None,
        };

        let scheduled = self
            .schedule(plan.clone(), recorder.clone(), cancel.clone())
            .instrument(span)
            .await;
        drop(run_permit);

        let jobs = match scheduled {
            Ok(jobs) => jobs,
            Err(e) => {
                let summary = RunSummary {
                    total_events: recorder.total_events(),
                    jobs_succeeded: 0,
                    jobs_not_succeeded: plan.jobs.len() as u32,
                    duration_ms: start.elapsed().as_millis() as u64,
                    success: false,
                };
                if let Err(finalize) = recorder.finish_err(summary).await {
                    obs::emit_run_finalize_error(&run_id, &finalize);
                }
                return Err(e);
            }
        };

        let conclusion = if cancel.is_cancelled() {
            JobConclusion::Cancelled
        } else if jobs
            .iter()
            .any(|j| matches!(j.conclusion, JobConclusion::Failure | JobConclusion::Cancelled))
        {
            JobConclusion::Failure
        } else {
            JobConclusion::Success
        };
        let report = RunReport {
            run_id: run_id.clone(),
            workflow: plan.workflow.clone(),
            conclusion,
            jobs,
            duration_ms: start.elapsed().as_millis() as u64,
            spec_digest: spec_digest.to_string(),
        };

        let (jobs_succeeded, jobs_not_succeeded) = report.tally();
        let summary = RunSummary {
            total_events: recorder.total_events(),
            jobs_succeeded,
            jobs_not_succeeded,
            duration_ms: report.duration_ms,
            success: report.success(),
        };
        let finalized = match conclusion {
            JobConclusion::Success => recorder.finish_ok(summary).await,
            JobConclusion::Cancelled => recorder.finish_cancelled(summary).await,
            _ => recorder.finish_err(summary).await,
        };
        if let Err(e) = finalized {
            obs::emit_run_finalize_error(&run_id, &e);
            return Err(e.into());
        }
        Ok(report)
    }

    async fn schedule(
        &self,
        plan: Arc<RunPlan>,
        recorder: Arc<RunRecorder>,
        cancel: CancellationToken,
    ) -> Result<Vec<JobReport>> {
        let run_id = recorder.run_id().to_string();
        let mut done: BTreeMap<String, JobReport> = BTreeMap::new();
        let mut started: BTreeSet<String> = BTreeSet::new();
        let mut running: JoinSet<Result<JobReport>> = JoinSet::new();

        loop {
            // Skipped jobs can release their dependents immediately.
            let mut progressed = true;
            while progressed {
                progressed = false;
                for (index, job) in plan.jobs.iter().enumerate() {
                    if started.contains(&job.id) || !job.needs.iter().all(|n| done.contains_key(n)) {
                        continue;
                    }
                    started.insert(job.id.clone());
                    let needs = need_results(job, &done);
                    let ctx = self.context(&plan, job, None, &run_id).with_needs(needs.clone());

                    if let Some((conclusion, reason)) = self.skip_reason(job, &ctx, &cancel) {
                        obs::emit_job_skipped(&run_id, &job.id, &reason);
                        recorder
                            .record(
                                kinds::JOB_SKIPPED,
                                json!({ "job": &job.id, "conclusion": conclusion.as_str(), "reason": &reason }),
                            )
                            .await?;
                        done.insert(
                            job.id.clone(),
                            JobReport {
                                id: job.id.clone(),
                                conclusion,
                                skipped_reason: Some(reason),
                                instances: Vec::new(),
                                duration_ms: 0,
                            },
                        );
                        progressed = true;
                        continue;
                    }

                    let engine = self.clone();
                    let plan = plan.clone();
                    let recorder = recorder.clone();
                    let cancel = cancel.clone();
                    running.spawn(
                        async move { engine.run_job(plan, index, needs, recorder, cancel).await }
                            .in_current_span(),
                    );
                }
            }

            match running.join_next().await {
                Some(joined) => {
                    let report = joined??;
                    done.insert(report.id.clone(), report);
                }
                None => break,
            }
        }

        Ok(plan.jobs.iter().filter_map(|j| done.remove(&j.id)).collect())
    }

    /// Why `job` does not start, with the conclusion it gets instead.
    fn skip_reason(
        &self,
        job: &PlannedJob,
        ctx: &EvalContext,
        cancel: &CancellationToken,
    ) -> Option<(JobConclusion, String)> {
        if cancel.is_cancelled() {
            return Some((JobConclusion::Cancelled, "run cancelled".to_string()));
        }
        for guard in &job.call_guards {
            let scoped = ctx.clone().with_inputs(guard.inputs.clone());
            if !guard.condition.evaluate(&scoped) {
                return Some((
                    JobConclusion::Skipped,
                    format!("calling job condition `{}` is false", guard.condition),
                ));
            }
        }
        let runs = match &job.condition {
            Some(condition) => condition.evaluate(ctx),
            None => ctx.status == JobStatus::Success,
        };
        if runs {
            return None;
        }
        let implicit = job.condition.as_ref().map_or(true, |c| !c.runs_after_failure());
        let reason = match &job.condition {
            _ if implicit && ctx.status != JobStatus::Success => {
                let failed: Vec<&str> = ctx
                    .needs
                    .iter()
                    .filter(|(_, n)| !n.result.is_success())
                    .map(|(alias, _)| alias.as_str())
                    .collect();
                format!("needed job(s) did not succeed: {}", failed.join(", "))
            }
            Some(condition) => format!("condition `{condition}` is false"),
            None => "condition is false".to_string(),
        };
        Some((JobConclusion::Skipped, reason))
    }

    /// Context for `job`, with the run's secrets and vars.
    fn context(
        &self,
        plan: &RunPlan,
        job: &PlannedJob,
        instance: Option<&JobInstance>,
        run_id: &str,
    ) -> EvalContext {
        let mut ctx = plan
            .eval_context(job, instance.and_then(|i| i.matrix.as_ref()))
            .with_secrets(self.environment.secrets())
            .with_vars(self.environment.vars());
        ctx.github.run_id = run_id.to_string();
        ctx
    }

    async fn run_job(
        self,
        plan: Arc<RunPlan>,
        index: usize,
        needs: BTreeMap<String, NeedResult>,
        recorder: Arc<RunRecorder>,
        cancel: CancellationToken,
    ) -> Result<JobReport> {
        let start = Instant::now();
        let job = &plan.jobs[index];
        let run_id = recorder.run_id().to_string();
        obs::emit_job_started(&run_id, &job.id, &job.runs_on);
        recorder
            .record(
                kinds::JOB_STARTED,
                json!({ "job": &job.id, "instances": job.instances.len(), "runs_on": &job.runs_on }),
            )
            .await?;

        let siblings = cancel.child_token();
        let width = job.max_parallel.unwrap_or(job.instances.len()).max(1);
        let slots = Arc::new(Semaphore::new(width));
        let mut set: JoinSet<Result<(usize, InstanceReport)>> = JoinSet::new();
        for position in 0..job.instances.len() {
            let engine = self.clone();
            let plan = plan.clone();
            let needs = needs.clone();
            let recorder = recorder.clone();
            let siblings = siblings.clone();
            let token = siblings.child_token();
            let slots = slots.clone();
            set.spawn(
                async move {
                    let started = Instant::now();
                    let job = &plan.jobs[index];
                    let instance = &job.instances[position];
                    let slot = tokio::select! {
                        biased;
                        _ = token.cancelled() => None,
                        slot = slots.acquire_owned() => slot.ok(),
                    };
                    let Some(_slot) = slot.filter(|_| !token.is_cancelled()) else {
                        let report = InstanceReport::not_run(instance, started, "cancelled before start".to_string());
                        return Ok((position, report));
                    };
                    let report = engine
                        .run_instance(&plan, index, position, needs, &recorder, token)
                        .await?;
                    // Cancel while still holding the slot so no queued sibling starts.
                    if report.conclusion == JobConclusion::Failure && job.fail_fast {
                        debug!(job = %job.id, instance = %report.label, "fail-fast: cancelling siblings");
                        siblings.cancel();
                    }
                    Ok((position, report))
                }
                .in_current_span(),
            );
        }

        let mut reports = Vec::with_capacity(job.instances.len());
        while let Some(joined) = set.join_next().await {
            reports.push(joined??);
        }
        reports.sort_by_key(|(position, _)| *position);
        let instances: Vec<InstanceReport> = reports.into_iter().map(|(_, r)| r).collect();

        let conclusion = aggregate(instances.iter().map(|i| i.conclusion));
        let duration_ms = start.elapsed().as_millis() as u64;
        obs::emit_job_finished(&run_id, &job.id, conclusion.as_str(), duration_ms);
        recorder
            .record(
                kinds::JOB_FINISHED,
                json!({ "job": &job.id, "conclusion": conclusion.as_str(), "duration_ms": duration_ms }),
            )
            .await?;
        Ok(JobReport {
            id: job.id.clone(),
            conclusion,
            skipped_reason: None,
            instances,
            duration_ms,
        })
    }

    async fn run_instance(
        &self,
        plan: &RunPlan,
        index: usize,
        position: usize,
        needs: BTreeMap<String, NeedResult>,
        recorder: &RunRecorder,
        token: CancellationToken,
    ) -> Result<InstanceReport> {
        let start = Instant::now();
        let job = &plan.jobs[index];
        let instance = &job.instances[position];
        let run_id = recorder.run_id().to_string();

        let _group = match &instance.concurrency {
            Some(group) => {
                let holder = format!("{run_id}/{}", instance.label);
                match self
                    .gate
                    .acquire(&group.group, &holder, group.cancel_in_progress, token.clone())
                    .await
                {
                    Ok(permit) => Some(permit),
                    Err(admission) => {
                        return Ok(InstanceReport::not_run(instance, start, admission.to_string()))
                    }
                }
            }
            None => None,
        };
        let Some(_lease) = self.pools.acquire(&job.runs_on, &token).await else {
            return Ok(InstanceReport::not_run(
                instance,
                start,
                "cancelled while waiting for a runner".to_string(),
            ));
        };

        let workspace = InstanceWorkspace::create(&instance.label).map_err(|source| {
            EngineError::Workspace {
                job: instance.label.clone(),
                source,
            }
        })?;

        let minutes = job.timeout_minutes.unwrap_or(self.config.default_timeout_minutes);
        let limit = Duration::from_secs(minutes.saturating_mul(60));
        let mut steps = Vec::new();
        let mut message = None;
        let conclusion = match tokio::time::timeout(
            limit,
            self.run_steps(plan, job, instance, workspace.path(), needs, recorder, &token, &mut steps),
        )
        .await
        {
            Ok(conclusion) => conclusion?,
            Err(_) => {
                warn!(job = %instance.label, minutes = minutes, "job instance timed out");
                message = Some(format!("timed out after {minutes} minute(s)"));
                JobConclusion::Failure
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        recorder
            .record(
                kinds::INSTANCE_FINISHED,
                json!({
                    "job": &job.id,
                    "instance": &instance.label,
                    "conclusion": conclusion.as_str(),
                    "duration_ms": duration_ms,
                }),
            )
            .await?;
        Ok(InstanceReport {
            label: instance.label.clone(),
            name: instance.name.clone(),
            conclusion,
            steps,
            duration_ms,
            message,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_steps(
        &self,
        plan: &RunPlan,
        job: &PlannedJob,
        instance: &JobInstance,
        root: &Path,
        needs: BTreeMap<String, NeedResult>,
        recorder: &RunRecorder,
        token: &CancellationToken,
        reports: &mut Vec<StepReport>,
    ) -> Result<JobConclusion> {
        let run_id = recorder.run_id().to_string();
        let mut ctx = self.context(plan, job, Some(instance), &run_id).with_needs(needs);
        // Step-level status functions see the job's own steps only.
        ctx.status = JobStatus::Success;
        ctx.env = job
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.render_lenient(&ctx)))
            .collect();

        for step in &job.steps {
            if token.is_cancelled() {
                ctx.status = JobStatus::Cancelled;
            }
            let name = step
                .name
                .as_ref()
                .map(|t| t.render_lenient(&ctx))
                .unwrap_or_else(|| step.label());
            let runs = match &step.condition {
                Some(condition) => condition.evaluate(&ctx),
                None => ctx.status == JobStatus::Success,
            };

            let started = Instant::now();
            let (conclusion, exit_code, message) = if !runs {
                (JobConclusion::Skipped, None, None)
            } else {
                match &step.kind {
                    StepKind::Run {
                        script,
                        shell,
                        working_directory,
                    } => match script.render(&ctx) {
                        Ok(script) => {
                            let command = StepCommand {
                                job: instance.label.clone(),
                                step: name.clone(),
                                script,
                                shell: shell.clone(),
                                env: self.step_env(&ctx, step),
                                working_directory: working_dir(root, working_directory.as_deref()),
                            };
                            let outcome = self.executor.execute(&command, token).await?;
                            let conclusion = if outcome.cancelled {
                                JobConclusion::Cancelled
                            } else if outcome.passed() {
                                JobConclusion::Success
                            } else {
                                JobConclusion::Failure
                            };
                            let message = (!outcome.passed())
                                .then(|| last_line(&outcome.stderr))
                                .flatten();
                            (conclusion, Some(outcome.exit_code), message)
                        }
                        Err(e) => (JobConclusion::Failure, None, Some(e.to_string())),
                    },
                    StepKind::Action(ActionUse::Remote(action)) if action.repository == CHECKOUT_ACTION => {
                        let (conclusion, message) = self.checkout(instance, root).await?;
                        (conclusion, None, message)
                    }
                    StepKind::Action(action) => {
                        debug!(job = %instance.label, action = ?action, "actions are not executed locally");
                        (JobConclusion::Success, None, None)
                    }
                    StepKind::UploadArtifact(spec) => {
                        let (conclusion, message) = self.upload(spec, &ctx, instance, root, recorder).await?;
                        (conclusion, None, message)
                    }
                }
            };

            match conclusion {
                JobConclusion::Failure if ctx.status == JobStatus::Success => {
                    ctx.status = JobStatus::Failure
                }
                JobConclusion::Cancelled => ctx.status = JobStatus::Cancelled,
                _ => {}
            }
            if let Some(id) = &step.id {
                ctx.steps.insert(
                    id.clone(),
                    StepResult {
                        outcome: conclusion,
                        conclusion,
                        outputs: BTreeMap::new(),
                    },
                );
            }
            let duration_ms = started.elapsed().as_millis() as u64;
            recorder
                .record(
                    kinds::STEP_FINISHED,
                    json!({
                        "job": &job.id,
                        "instance": &instance.label,
                        "step": &name,
                        "conclusion": conclusion.as_str(),
                        "exit_code": exit_code,
                        "duration_ms": duration_ms,
                    }),
                )
                .await?;
            reports.push(StepReport {
                name,
                conclusion,
                exit_code,
                duration_ms,
                message,
            });
        }

        Ok(match ctx.status {
            JobStatus::Success => JobConclusion::Success,
            JobStatus::Failure => JobConclusion::Failure,
            JobStatus::Cancelled => JobConclusion::Cancelled,
        })
    }

    /// Default variables, then job env, then step env.
    fn step_env(&self, ctx: &EvalContext, step: &Step) -> BTreeMap<String, String> {
        let github = &ctx.github;
        let mut env: BTreeMap<String, String> = [
            ("CI", "true"),
            ("GITHUB_ACTIONS", "true"),
            ("GITHUB_WORKFLOW", github.workflow.as_str()),
            ("GITHUB_EVENT_NAME", github.event_name.as_str()),
            ("GITHUB_REF", github.git_ref.as_str()),
            ("GITHUB_REF_NAME", github.ref_name.as_str()),
            ("GITHUB_SHA", github.sha.as_str()),
            ("GITHUB_RUN_ID", github.run_id.as_str()),
            ("GITHUB_ACTOR", github.actor.as_str()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        env.extend(ctx.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        for (key, template) in &step.env {
            env.insert(key.clone(), template.render_lenient(ctx));
        }
        env
    }

    /// Copy the source workspace into the instance directory. The artifact
    /// store is left out when it lives inside the workspace.
    async fn checkout(&self, instance: &JobInstance, root: &Path) -> Result<(JobConclusion, Option<String>)> {
        let source = self.config.workspace.clone();
        let dest = root.to_path_buf();
        let skip = vec![self.config.artifact_dir.clone()];
        let copied =
            tokio::task::spawn_blocking(move || workspace::checkout(&source, &dest, &skip)).await?;
        Ok(match copied {
            Ok(files) => {
                debug!(job = %instance.label, files = files, dir = %root.display(), "workspace checked out");
                (JobConclusion::Success, None)
            }
            Err(e) => (JobConclusion::Failure, Some(format!("checkout failed: {e}"))),
        })
    }

    /// Collect and store one artifact. Storage failures are logged and leave
    /// the step successful; `if-no-files-found: error` fails it.
    async fn upload(
        &self,
        spec: &ArtifactSpec,
        ctx: &EvalContext,
        instance: &JobInstance,
        root: &Path,
        recorder: &RunRecorder,
    ) -> Result<(JobConclusion, Option<String>)> {
        let run_id = recorder.run_id();
        let name = match spec.render_name(ctx) {
            Ok(name) => name,
            Err(e) => return Ok((JobConclusion::Failure, Some(e.to_string()))),
        };
        let paths = match spec.render_paths(ctx) {
            Ok(paths) => paths,
            Err(e) => return Ok((JobConclusion::Failure, Some(e.to_string()))),
        };

        let workspace = root.to_path_buf();
        let policy = spec.if_no_files_found;
        let artifact_name = name.clone();
        let collected = tokio::task::spawn_blocking(move || {
            artifact::collect(&workspace, &artifact_name, &paths, policy)
        })
        .await?;
        let files = match collected {
            Ok(files) => files,
            Err(e) => return Ok((JobConclusion::Failure, Some(e.to_string()))),
        };
        if files.is_empty() {
            return Ok((JobConclusion::Success, Some(format!("no files for artifact '{name}'"))));
        }

        let payload: Vec<ArtifactPayload> = files
            .into_iter()
            .map(|f| ArtifactPayload {
                path: f.path,
                contents: f.contents,
            })
            .collect();
        match self
            .artifacts
            .put_artifact(run_id, &name, &instance.label, payload)
            .await
        {
            Ok(record) => {
                obs::emit_artifact_uploaded(&run_id.to_string(), &name, record.files.len(), record.total_size());
                recorder
                    .record(
                        kinds::ARTIFACT_UPLOADED,
                        json!({
                            "name": &name,
                            "producer": &instance.label,
                            "files": record.files.len(),
                            "bytes": record.total_size(),
                        }),
                    )
                    .await?;
                Ok((JobConclusion::Success, None))
            }
            Err(e) => {
                obs::emit_artifact_upload_failed(&run_id.to_string(), &name, &e);
                recorder
                    .record(
                        kinds::ARTIFACT_UPLOAD_FAILED,
                        json!({ "name": &name, "producer": &instance.label, "error": e.to_string() }),
                    )
                    .await?;
                Ok((JobConclusion::Success, Some(format!("upload of '{name}' failed: {e}"))))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_worst_wins() {
        use JobConclusion::*;
        assert_eq!(aggregate([Success, Success]), Success);
        assert_eq!(aggregate([Success, Skipped]), Skipped);
        assert_eq!(aggregate([Cancelled, Skipped]), Cancelled);
        assert_eq!(aggregate([Cancelled, Failure, Success]), Failure);
        assert_eq!(aggregate([]), Success);
    }

    #[test]
    fn test_last_line_skips_blank_tail() {
        assert_eq!(last_line("a\nerror: boom\n\n").as_deref(), Some("error: boom"));
        assert_eq!(last_line(""), None);
    }
}
