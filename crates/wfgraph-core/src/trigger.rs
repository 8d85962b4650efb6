//! Trigger resolution: repository events to workflow instances with resolved
//! inputs.
//!
//! Explicit input values are only accepted for `workflow_dispatch` and
//! `workflow_call`; every other event runs with the declared defaults.
//! Input validation happens here, before any job is planned.

use std::collections::BTreeMap;

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::{EvalContext, GithubContext};
use crate::error::{Result, WorkflowError};
use crate::expr::ExprValue;
use crate::model::{BranchFilter, InputKind, InputSpec, Workflow};

/// Pull request activity types that trigger when `types:` is omitted.
pub const DEFAULT_PR_TYPES: [&str; 3] = ["opened", "synchronize", "reopened"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TriggerEvent {
    Push {
        /// Fully qualified ref, `refs/heads/<branch>` or `refs/tags/<tag>`.
        git_ref: String,
        #[serde(default)]
        sha: String,
    },
    PullRequest {
        number: u64,
        /// Target branch.
        base: String,
        /// Source branch.
        head: String,
        #[serde(default = "default_pr_action")]
        action: String,
        #[serde(default)]
        fork: bool,
        #[serde(default)]
        sha: String,
    },
    WorkflowDispatch {
        /// Workflow file to run.
        workflow: String,
        git_ref: String,
        #[serde(default)]
        inputs: BTreeMap<String, String>,
        #[serde(default)]
        sha: String,
    },
    Schedule {
        cron: String,
        #[serde(default = "default_branch_ref")]
        git_ref: String,
        #[serde(default)]
        sha: String,
    },
}

fn default_pr_action() -> String {
    "synchronize".to_string()
}

fn default_branch_ref() -> String {
    "refs/heads/develop".to_string()
}

fn short_ref(git_ref: &str) -> &str {
    git_ref
        .strip_prefix("refs/heads/")
        .or_else(|| git_ref.strip_prefix("refs/tags/"))
        .or_else(|| git_ref.strip_prefix("refs/"))
        .unwrap_or(git_ref)
}

impl TriggerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TriggerEvent::Push { .. } => "push",
            TriggerEvent::PullRequest { .. } => "pull_request",
            TriggerEvent::WorkflowDispatch { .. } => "workflow_dispatch",
            TriggerEvent::Schedule { .. } => "schedule",
        }
    }

    pub fn git_ref(&self) -> String {
        match self {
            TriggerEvent::Push { git_ref, .. }
            | TriggerEvent::WorkflowDispatch { git_ref, .. }
            | TriggerEvent::Schedule { git_ref, .. } => git_ref.clone(),
            TriggerEvent::PullRequest { number, .. } => format!("refs/pull/{number}/merge"),
        }
    }

    /// The `github` context this event produces for `workflow`.
    pub fn github_context(&self, workflow: &str) -> GithubContext {
        let git_ref = self.git_ref();
        let mut ctx = GithubContext {
            event_name: self.name().to_string(),
            ref_name: short_ref(&git_ref).to_string(),
            git_ref,
            workflow: workflow.to_string(),
            ..GithubContext::default()
        };
        match self {
            TriggerEvent::Push { git_ref, sha } => {
                ctx.sha = sha.clone();
                ctx.event = serde_json::json!({ "ref": git_ref, "after": sha });
            }
            TriggerEvent::PullRequest {
                number,
                base,
                head,
                action,
                fork,
                sha,
            } => {
                ctx.sha = sha.clone();
                ctx.base_ref = base.clone();
                ctx.head_ref = head.clone();
                ctx.event = serde_json::json!({
                    "action": action,
                    "number": number,
                    "pull_request": {
                        "number": number,
                        "base": { "ref": base },
                        "head": { "ref": head, "sha": sha, "repo": { "fork": fork } },
                    },
                });
            }
            TriggerEvent::WorkflowDispatch { inputs, sha, .. } => {
                ctx.sha = sha.clone();
                ctx.event = serde_json::json!({ "inputs": inputs });
            }
            TriggerEvent::Schedule { cron, sha, .. } => {
                ctx.sha = sha.clone();
                ctx.event = serde_json::json!({ "schedule": cron });
            }
        }
        ctx
    }
}

fn compile(pattern: &str) -> Result<Pattern> {
    Pattern::new(pattern).map_err(|source| WorkflowError::Pattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// Ordered pattern list with `!negation`; the last matching pattern wins.
fn filter_matches(patterns: &[String], name: &str) -> Result<bool> {
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };
    let mut matched = false;
    for p in patterns {
        let (negated, body) = match p.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, p.as_str()),
        };
        if compile(body)?.matches_with(name, options) {
            matched = !negated;
        }
    }
    Ok(matched)
}

fn branch_filter_matches(filter: &BranchFilter, git_ref: &str) -> Result<bool> {
    if let Some(tag) = git_ref.strip_prefix("refs/tags/") {
        if filter.tags.is_empty() {
            // Tag pushes only trigger when no branch filter is declared either.
            return Ok(filter.branches.is_empty() && filter.branches_ignore.is_empty());
        }
        return filter_matches(&filter.tags, tag);
    }
    let branch = short_ref(git_ref);
    if !filter.branches.is_empty() {
        return filter_matches(&filter.branches, branch);
    }
    if !filter.branches_ignore.is_empty() {
        return Ok(!filter_matches(&filter.branches_ignore, branch)?);
    }
    // Only tag filters declared: branch pushes do not trigger.
    Ok(filter.tags.is_empty())
}

/// Whether `workflow` is triggered by `event`.
pub fn matches(workflow: &Workflow, event: &TriggerEvent) -> Result<bool> {
    let triggers = &workflow.triggers;
    match event {
        TriggerEvent::Push { git_ref, .. } => match &triggers.push {
            Some(filter) => branch_filter_matches(filter, git_ref),
            None => Ok(false),
        },
        TriggerEvent::PullRequest { base, action, .. } => match &triggers.pull_request {
            Some(filter) => {
                let type_ok = if filter.types.is_empty() {
                    DEFAULT_PR_TYPES.contains(&action.as_str())
                } else {
                    filter.types.iter().any(|t| t == action)
                };
                Ok(type_ok && branch_filter_matches(&filter.branches, &format!("refs/heads/{base}"))?)
            }
            None => Ok(false),
        },
        TriggerEvent::WorkflowDispatch { workflow: file, .. } => {
            Ok(triggers.workflow_dispatch.is_some() && (file == &workflow.file || file == &workflow.name))
        }
        TriggerEvent::Schedule { cron, .. } => Ok(triggers.schedule.iter().any(|c| c == cron)),
    }
}

fn input_value(spec: &InputSpec, raw: &str) -> Result<ExprValue> {
    match &spec.kind {
        InputKind::Choice { options, .. } => {
            if options.iter().any(|o| o == raw) {
                Ok(ExprValue::from(raw))
            } else {
                Err(WorkflowError::ChoiceOutOfRange {
                    input: spec.name.clone(),
                    value: raw.to_string(),
                    options: options.clone(),
                })
            }
        }
        InputKind::String { .. } => Ok(ExprValue::from(raw)),
        InputKind::Number { .. } => raw
            .trim()
            .parse::<f64>()
            .map(ExprValue::Number)
            .map_err(|_| WorkflowError::InvalidInputValue {
                input: spec.name.clone(),
                value: raw.to_string(),
                expected: "number".to_string(),
            }),
        InputKind::Boolean { .. } => match raw {
            "true" => Ok(ExprValue::Bool(true)),
            "false" => Ok(ExprValue::Bool(false)),
            _ => Err(WorkflowError::InvalidInputValue {
                input: spec.name.clone(),
                value: raw.to_string(),
                expected: "boolean".to_string(),
            }),
        },
    }
}

/// Resolve input values against declared specs.
///
/// Unknown names are rejected, explicit values and defaults are both
/// validated, and a required input with neither is an error. Optional inputs
/// without a value resolve to the empty string (`false` for booleans).
pub fn resolve_inputs(
    workflow: &str,
    specs: &[InputSpec],
    provided: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, ExprValue>> {
    if let Some(unknown) = provided.keys().find(|k| !specs.iter().any(|s| &s.name == *k)) {
        return Err(WorkflowError::UnknownInput {
            workflow: workflow.to_string(),
            input: unknown.clone(),
        });
    }

    let mut resolved = BTreeMap::new();
    for spec in specs {
        let raw = provided.get(&spec.name).cloned().or_else(|| spec.default_text());
        let value = match raw {
            Some(raw) => input_value(spec, &raw)?,
            None if spec.required => {
                return Err(WorkflowError::MissingInput {
                    workflow: workflow.to_string(),
                    input: spec.name.clone(),
                })
            }
            None => match spec.kind {
                InputKind::Boolean { .. } => ExprValue::Bool(false),
                _ => ExprValue::from(""),
            },
        };
        resolved.insert(spec.name.clone(), value);
    }
    Ok(resolved)
}

/// A workflow bound to one triggering event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowInstance {
    pub workflow: String,
    pub file: String,
    pub event: TriggerEvent,
    pub inputs: BTreeMap<String, ExprValue>,
    pub github: GithubContext,
}

impl WorkflowInstance {
    /// Input values as text, for reports.
    pub fn input_text(&self) -> BTreeMap<String, String> {
        self.inputs
            .iter()
            .map(|(k, v)| (k.clone(), v.render()))
            .collect()
    }

    pub fn eval_context(&self) -> EvalContext {
        EvalContext::new(self.github.clone()).with_inputs(self.inputs.clone())
    }
}

/// Instantiate `workflow` for `event`, or `None` if the event does not
/// trigger it.
pub fn instantiate(workflow: &Workflow, event: &TriggerEvent) -> Result<Option<WorkflowInstance>> {
    if !matches(workflow, event)? {
        return Ok(None);
    }
    let empty = BTreeMap::new();
    let provided = match event {
        TriggerEvent::WorkflowDispatch { inputs, .. } => inputs,
        _ => &empty,
    };
    // Non-dispatch events see the dispatch defaults.
    let specs = workflow.triggers.workflow_dispatch.as_deref().unwrap_or(&[]);
    let inputs = resolve_inputs(&workflow.name, specs, provided)?;
    debug!(workflow = %workflow.name, event = event.name(), inputs = inputs.len(), "instantiated workflow");
    Ok(Some(WorkflowInstance {
        workflow: workflow.name.clone(),
        file: workflow.file.clone(),
        event: event.clone(),
        inputs,
        github: event.github_context(&workflow.name),
    }))
}

/// Instantiate every workflow triggered by `event`.
pub fn resolve<'a>(
    workflows: impl IntoIterator<Item = &'a Workflow>,
    event: &TriggerEvent,
) -> Result<Vec<WorkflowInstance>> {
    let mut out = Vec::new();
    for wf in workflows {
        if let Some(instance) = instantiate(wf, event)? {
            out.push(instance);
        }
    }
    Ok(out)
}
