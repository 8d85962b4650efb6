//! Structured observability hooks for workflow runs.
//!
//! This module provides:
//! - A run-scoped tracing span carrying `run_id` and `workflow`
//! - Emission functions for run, job, artifact, concurrency and lint events
//!
//! Every event carries an `event` field so log pipelines can filter on it.
//! Filtering is configured through `WFGRAPH_LOG` (see [`crate::telemetry`]).

use tracing::{info, warn};

use crate::lint::{Finding, Severity};

/// Run-scoped span, attached to run futures with `tracing::Instrument`.
pub fn run_span(run_id: &str, workflow: &str) -> tracing::Span {
    tracing::info_span!("wfgraph.run", run_id = %run_id, workflow = %workflow)
}

/// Emit event: run started for a workflow and triggering event.
pub fn emit_run_started(run_id: &str, workflow: &str, event_name: &str) {
    info!(event = "run.started", run_id = %run_id, workflow = %workflow, trigger = %event_name);
}

/// Emit event: run finished with duration, job tallies and overall success.
pub fn emit_run_finished(
    run_id: &str,
    duration_ms: u64,
    jobs_succeeded: u32,
    jobs_not_succeeded: u32,
    success: bool,
) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        jobs_succeeded = jobs_succeeded,
        jobs_not_succeeded = jobs_not_succeeded,
        success = success,
    );
}

/// Emit event: a single event appended to the run ledger.
pub fn emit_event_appended(run_id: &str, event_kind: &str, seq: u64) {
    tracing::debug!(event = "run.event_appended", run_id = %run_id, kind = %event_kind, seq = seq);
}

pub fn emit_job_started(run_id: &str, job: &str, runs_on: &[String]) {
    info!(event = "job.started", run_id = %run_id, job = %job, runs_on = ?runs_on);
}

pub fn emit_job_finished(run_id: &str, job: &str, conclusion: &str, duration_ms: u64) {
    info!(
        event = "job.finished",
        run_id = %run_id,
        job = %job,
        conclusion = %conclusion,
        duration_ms = duration_ms,
    );
}

/// Emit event: a job was skipped, with the reason (condition, failed need).
pub fn emit_job_skipped(run_id: &str, job: &str, reason: &str) {
    info!(event = "job.skipped", run_id = %run_id, job = %job, reason = %reason);
}

pub fn emit_artifact_uploaded(run_id: &str, name: &str, files: usize, bytes: u64) {
    info!(
        event = "artifact.uploaded",
        run_id = %run_id,
        name = %name,
        files = files,
        bytes = bytes,
    );
}

/// Emit event: an upload failed; the step itself is not failed.
pub fn emit_artifact_upload_failed(run_id: &str, name: &str, error: &dyn std::fmt::Display) {
    warn!(event = "artifact.upload_failed", run_id = %run_id, name = %name, error = %error);
}

/// Emit event: a concurrency group released its holder to a newer run.
pub fn emit_group_cancelled(group: &str, cancelled: &str, by: &str) {
    warn!(event = "concurrency.cancelled", group = %group, cancelled = %cancelled, by = %by);
}

/// Emit event: a queued run waiting on a group.
pub fn emit_group_waiting(group: &str, waiter: &str, holder: &str) {
    info!(event = "concurrency.waiting", group = %group, waiter = %waiter, holder = %holder);
}

pub fn emit_lint_finding(finding: &Finding) {
    let job = finding.job.as_deref().unwrap_or("-");
    match finding.severity {
        Severity::Error => warn!(
            event = "lint.finding",
            rule = finding.rule,
            severity = %finding.severity,
            workflow = %finding.workflow,
            job = %job,
            message = %finding.message,
        ),
        Severity::Warning => tracing::debug!(
            event = "lint.finding",
            rule = finding.rule,
            severity = %finding.severity,
            workflow = %finding.workflow,
            job = %job,
            message = %finding.message,
        ),
    }
}

/// Emit event: verdict over a finished run.
pub fn emit_verdict_evaluated(run_id: &str, passed: bool, violations: usize) {
    info!(
        event = "verdict.evaluated",
        run_id = %run_id,
        passed = passed,
        violations = violations,
    );
}

/// Emit event: run finalization error (warning level).
pub fn emit_run_finalize_error(run_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "run.finalize_error", run_id = %run_id, error = %error);
}
