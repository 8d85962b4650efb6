//! Typed evaluation contexts for expressions.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::expr::{Context, ContextPath, ExprValue, JobStatus, Resolver};
use crate::matrix::Combination;

/// The `github` context for one triggering event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GithubContext {
    pub event_name: String,
    /// Fully qualified ref, e.g. `refs/heads/develop` or `refs/pull/42/merge`.
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub ref_name: String,
    pub sha: String,
    pub repository: String,
    pub workflow: String,
    pub actor: String,
    pub run_id: String,
    pub base_ref: String,
    pub head_ref: String,
    /// Raw event payload (`github.event.*`).
    pub event: serde_json::Value,
}

impl GithubContext {
    fn lookup(&self, segments: &[String]) -> Option<ExprValue> {
        let (head, rest) = segments.split_first()?;
        let scalar = |s: &str| (rest.is_empty()).then(|| ExprValue::from(s));
        match head.as_str() {
            "event_name" => scalar(&self.event_name),
            "ref" => scalar(&self.git_ref),
            "ref_name" => scalar(&self.ref_name),
            "sha" => scalar(&self.sha),
            "repository" => scalar(&self.repository),
            "workflow" => scalar(&self.workflow),
            "actor" => scalar(&self.actor),
            "run_id" => scalar(&self.run_id),
            "base_ref" => scalar(&self.base_ref),
            "head_ref" => scalar(&self.head_ref),
            "event" => {
                let mut value = &self.event;
                for seg in rest {
                    value = match value {
                        serde_json::Value::Object(map) => map.get(seg)?,
                        serde_json::Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
                        _ => return None,
                    };
                }
                Some(ExprValue::from_json(value))
            }
            _ => None,
        }
    }

    /// Pull request number from the event payload, if this is a PR event.
    pub fn pull_request_number(&self) -> Option<u64> {
        self.event
            .get("pull_request")
            .and_then(|pr| pr.get("number"))
            .and_then(serde_json::Value::as_u64)
    }
}

/// Terminal state of a job, as exposed through `needs.<job>.result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobConclusion {
    Success,
    Failure,
    Cancelled,
    Skipped,
}

impl JobConclusion {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobConclusion::Success => "success",
            JobConclusion::Failure => "failure",
            JobConclusion::Cancelled => "cancelled",
            JobConclusion::Skipped => "skipped",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobConclusion::Success)
    }
}

impl fmt::Display for JobConclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeedResult {
    pub result: JobConclusion,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub outcome: JobConclusion,
    pub conclusion: JobConclusion,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

/// Every context an expression can see while a job is planned or running.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    pub github: GithubContext,
    pub inputs: BTreeMap<String, ExprValue>,
    pub matrix: Option<Combination>,
    pub env: BTreeMap<String, String>,
    pub secrets: BTreeMap<String, String>,
    pub vars: BTreeMap<String, String>,
    pub runner: BTreeMap<String, String>,
    pub strategy: BTreeMap<String, ExprValue>,
    pub needs: BTreeMap<String, NeedResult>,
    pub steps: BTreeMap<String, StepResult>,
    pub status: JobStatus,
}

impl EvalContext {
    pub fn new(github: GithubContext) -> Self {
        Self {
            github,
            ..Self::default()
        }
    }

    pub fn with_inputs(mut self, inputs: BTreeMap<String, ExprValue>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_matrix(mut self, matrix: Option<Combination>) -> Self {
        self.matrix = matrix;
        self
    }

    pub fn with_secrets(mut self, secrets: BTreeMap<String, String>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn with_vars(mut self, vars: BTreeMap<String, String>) -> Self {
        self.vars = vars;
        self
    }

    /// Record dependency results and derive the status seen by job-level
    /// `if:` predicates.
    pub fn with_needs(mut self, needs: BTreeMap<String, NeedResult>) -> Self {
        self.status = if needs.values().any(|n| n.result == JobConclusion::Cancelled) {
            JobStatus::Cancelled
        } else if needs
            .values()
            .any(|n| matches!(n.result, JobConclusion::Failure | JobConclusion::Skipped))
        {
            JobStatus::Failure
        } else {
            JobStatus::Success
        };
        self.needs = needs;
        self
    }

    fn map_lookup(map: &BTreeMap<String, String>, segments: &[String]) -> Option<ExprValue> {
        match segments {
            [key] => map.get(key).map(|v| ExprValue::from(v.as_str())),
            _ => None,
        }
    }

    fn result_lookup(
        result: JobConclusion,
        conclusion: Option<JobConclusion>,
        outputs: &BTreeMap<String, String>,
        rest: &[String],
    ) -> Option<ExprValue> {
        match rest {
            [field] if field == "result" || field == "outcome" => {
                Some(ExprValue::from(result.as_str()))
            }
            [field] if field == "conclusion" => {
                Some(ExprValue::from(conclusion.unwrap_or(result).as_str()))
            }
            [field, name] if field == "outputs" => {
                // Unset outputs read as empty strings.
                Some(ExprValue::from(outputs.get(name).map(String::as_str).unwrap_or("")))
            }
            _ => None,
        }
    }
}

impl Resolver for EvalContext {
    fn resolve(&self, path: &ContextPath) -> Option<ExprValue> {
        let segs = &path.segments;
        match path.context {
            Context::Github => self.github.lookup(segs),
            Context::Inputs => match segs.as_slice() {
                [key] => self.inputs.get(key).cloned(),
                _ => None,
            },
            Context::Matrix => match segs.as_slice() {
                [key] => self.matrix.as_ref()?.get(key).cloned(),
                _ => None,
            },
            Context::Env => Self::map_lookup(&self.env, segs),
            // Unset secrets and variables read as empty strings.
            Context::Secrets | Context::Vars => {
                let map = if path.context == Context::Secrets {
                    &self.secrets
                } else {
                    &self.vars
                };
                match segs.as_slice() {
                    [_] => Some(Self::map_lookup(map, segs).unwrap_or_else(|| ExprValue::from(""))),
                    _ => None,
                }
            }
            Context::Runner => Self::map_lookup(&self.runner, segs),
            Context::Strategy => match segs.as_slice() {
                [key] => self.strategy.get(key).cloned(),
                _ => None,
            },
            Context::Job => match segs.as_slice() {
                [key] if key == "status" => Some(ExprValue::from(match self.status {
                    JobStatus::Success => "success",
                    JobStatus::Failure => "failure",
                    JobStatus::Cancelled => "cancelled",
                })),
                _ => None,
            },
            Context::Needs => {
                let (job, rest) = segs.split_first()?;
                let need = self.needs.get(job)?;
                Self::result_lookup(need.result, None, &need.outputs, rest)
            }
            Context::Steps => {
                let (step, rest) = segs.split_first()?;
                let result = self.steps.get(step)?;
                Self::result_lookup(
                    result.outcome,
                    Some(result.conclusion),
                    &result.outputs,
                    rest,
                )
            }
        }
    }

    fn status(&self) -> JobStatus {
        self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{Condition, Expr};

    fn pr_context() -> EvalContext {
        EvalContext::new(GithubContext {
            event_name: "pull_request".to_string(),
            git_ref: "refs/pull/42/merge".to_string(),
            workflow: "PR Checks".to_string(),
            event: serde_json::json!({
                "pull_request": {"number": 42, "head": {"repo": {"fork": true}}}
            }),
            ..GithubContext::default()
        })
    }

    #[test]
    fn test_event_payload_walk() {
        let ctx = pr_context();
        let v = Expr::parse("github.event.pull_request.number")
            .unwrap()
            .evaluate(&ctx);
        assert_eq!(v.render(), "42");
        assert_eq!(ctx.github.pull_request_number(), Some(42));
    }

    #[test]
    fn test_fork_prs_skip_coverage_upload() {
        let ctx = pr_context();
        let cond = Condition::parse("github.event.pull_request.head.repo.fork == false").unwrap();
        assert!(!cond.evaluate(&ctx));
    }

    #[test]
    fn test_failed_need_sets_failure_status() {
        let mut needs = BTreeMap::new();
        needs.insert(
            "Code-Quality-Checks".to_string(),
            NeedResult {
                result: JobConclusion::Failure,
                outputs: BTreeMap::new(),
            },
        );
        let ctx = pr_context().with_needs(needs);
        assert_eq!(ctx.status, JobStatus::Failure);
        let v = Expr::parse("needs.Code-Quality-Checks.result")
            .unwrap()
            .evaluate(&ctx);
        assert_eq!(v, ExprValue::from("failure"));
    }

    #[test]
    fn test_unset_secret_is_empty() {
        let ctx = pr_context();
        let v = Expr::parse("secrets.CODECOV_TOKEN")
            .unwrap()
            .evaluate_strict(&ctx)
            .unwrap();
        assert_eq!(v, ExprValue::from(""));
    }

    #[test]
    fn test_matrix_lookup() {
        let ctx = pr_context().with_matrix(Some(Combination::new(vec![(
            "task".to_string(),
            ExprValue::from("detection"),
        )])));
        let v = Expr::parse("matrix.task").unwrap().evaluate(&ctx);
        assert_eq!(v, ExprValue::from("detection"));
        assert_eq!(
            Expr::parse("matrix.other").unwrap().evaluate(&ctx),
            ExprValue::Null
        );
    }
}
