//! Pass/fail verdict over the recorded events of a run.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use wfgraph_core::obs;
use wfgraph_state::RunEvent;

use crate::recorder::kinds;

/// Verdict over one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunVerdict {
    pub passed: bool,
    /// Violations that caused failure (empty if passed).
    pub violations: Vec<String>,
    pub message: String,
}

impl RunVerdict {
    /// Evaluate the recorded job events of a run.
    ///
    /// Rules:
    /// - every started job must finish;
    /// - a finished job must conclude `success`;
    /// - skipped jobs are not violations by themselves (their cause is).
    pub fn evaluate(events: &[RunEvent]) -> RunVerdict {
        let mut violations = Vec::new();
        let mut started = BTreeSet::new();
        let mut finished = BTreeSet::new();

        for event in events {
            let job = event.payload["job"].as_str().unwrap_or("unknown").to_string();
            match event.kind.as_str() {
                kinds::JOB_STARTED => {
                    started.insert(job);
                }
                kinds::JOB_FINISHED => {
                    let conclusion = event.payload["conclusion"].as_str().unwrap_or("unknown");
                    if conclusion != "success" {
                        violations.push(format!("Job '{job}' concluded {conclusion}"));
                    }
                    finished.insert(job);
                }
                _ => {}
            }
        }

        for job in started.difference(&finished) {
            violations.push(format!("Job '{job}' was started but never finished"));
        }

        let passed = violations.is_empty();
        let message = if passed {
            format!("All {} job(s) succeeded", finished.len())
        } else {
            format!("Run failed with {} violation(s)", violations.len())
        };
        RunVerdict {
            passed,
            violations,
            message,
        }
    }

    /// [`RunVerdict::evaluate`] with the result logged against `run_id`.
    pub fn evaluate_run(run_id: &str, events: &[RunEvent]) -> RunVerdict {
        let verdict = Self::evaluate(events);
        obs::emit_verdict_evaluated(run_id, verdict.passed, verdict.violations.len());
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn event(seq: u64, kind: &str, payload: serde_json::Value) -> RunEvent {
        RunEvent {
            seq,
            kind: kind.to_string(),
            payload,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_empty_events_passes() {
        assert!(RunVerdict::evaluate(&[]).passed);
    }

    #[test]
    fn test_successful_job() {
        let events = vec![
            event(1, kinds::JOB_STARTED, json!({ "job": "Code-Quality-Checks" })),
            event(
                2,
                kinds::JOB_FINISHED,
                json!({ "job": "Code-Quality-Checks", "conclusion": "success" }),
            ),
        ];
        let verdict = RunVerdict::evaluate(&events);
        assert!(verdict.passed);
        assert!(verdict.violations.is_empty());
    }

    #[test]
    fn test_failed_job_and_skipped_dependents() {
        let events = vec![
            event(1, kinds::JOB_STARTED, json!({ "job": "Code-Quality-Checks" })),
            event(
                2,
                kinds::JOB_FINISHED,
                json!({ "job": "Code-Quality-Checks", "conclusion": "failure" }),
            ),
            event(3, kinds::JOB_SKIPPED, json!({ "job": "Unit-Test" })),
            event(4, kinds::JOB_SKIPPED, json!({ "job": "Coverage-Test" })),
        ];
        let verdict = RunVerdict::evaluate(&events);
        assert!(!verdict.passed);
        assert_eq!(verdict.violations.len(), 1);
        assert!(verdict.violations[0].contains("failure"));
    }

    #[test]
    fn test_started_but_never_finished() {
        let events = vec![event(1, kinds::JOB_STARTED, json!({ "job": "Unit-Test" }))];
        let verdict = RunVerdict::evaluate(&events);
        assert!(!verdict.passed);
        assert!(verdict.violations[0].contains("never finished"));
    }
}
