//! Typed concurrency group keys.
//!
//! A group key identifies one logical unit of work: workflow, job label,
//! pull request number or ref, plus any matrix discriminators. Keys are built
//! by [`ConcurrencyKey::new`] from typed inputs and rendered canonically as
//! `<workflow>-<job-label>-<pr-or-ref>[-<matrix value>...]`.
//!
//! Declared `group:` templates are rendered as written, so a defective
//! template produces the same (defective) key it would in production. When a
//! template follows the canonical shape it is also lifted into a
//! [`ConcurrencyKey`], which lets callers compare the two.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::context::{EvalContext, GithubContext};
use crate::error::{Result, WorkflowError};
use crate::expr::{BinaryOp, Context, Expr, Segment, Template, TemplateDiagnostic};
use crate::matrix::Combination;
use crate::model::Workflow;

/// What a run is working on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkUnit {
    PullRequest(u64),
    Ref(String),
}

impl WorkUnit {
    /// Pull request number when the event carries one, the ref otherwise.
    pub fn from_github(ctx: &GithubContext) -> Self {
        match ctx.pull_request_number() {
            Some(n) => WorkUnit::PullRequest(n),
            None => WorkUnit::Ref(ctx.git_ref.clone()),
        }
    }
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkUnit::PullRequest(n) => write!(f, "{n}"),
            WorkUnit::Ref(r) => f.write_str(r),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConcurrencyKey {
    pub workflow: String,
    pub job_label: String,
    pub unit: WorkUnit,
    /// `(matrix key, value)` pairs in template order.
    pub discriminators: Vec<(String, String)>,
}

impl ConcurrencyKey {
    pub fn new(
        workflow: impl Into<String>,
        job_label: impl Into<String>,
        unit: WorkUnit,
        discriminators: Vec<(String, String)>,
    ) -> Self {
        Self {
            workflow: workflow.into(),
            job_label: job_label.into(),
            unit,
            discriminators,
        }
    }

    pub fn render(&self) -> String {
        let mut out = format!("{}-{}-{}", self.workflow, self.job_label, self.unit);
        for (_, value) in &self.discriminators {
            out.push('-');
            out.push_str(value);
        }
        out
    }
}

impl fmt::Display for ConcurrencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Why a template could not be lifted into a [`GroupShape`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShapeError {
    /// Canonical prefix followed by leftover literal text, e.g. a stray `}`.
    TrailingText { text: String },
    /// Not of the canonical shape at all.
    Unrecognized,
}

impl fmt::Display for ShapeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShapeError::TrailingText { text } => write!(f, "unexpected trailing text {text:?}"),
            ShapeError::Unrecognized => f.write_str("not of the form <workflow>-<job>-<pr-or-ref>[-<matrix>...]"),
        }
    }
}

/// The structure of a canonical group template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupShape {
    pub job_label: String,
    /// Matrix keys appended to the key, in order.
    pub matrix_keys: Vec<String>,
}

fn is_ref(expr: &Expr, context: Context, segments: &[&str]) -> bool {
    matches!(expr, Expr::Ref(p) if p.context == context && p.segments == segments)
}

fn is_pr_or_ref(expr: &Expr) -> bool {
    match expr {
        Expr::Binary {
            op: BinaryOp::Or,
            lhs,
            rhs,
        } => {
            is_ref(lhs, Context::Github, &["event", "pull_request", "number"])
                && is_ref(rhs, Context::Github, &["ref"])
        }
        _ => false,
    }
}

impl GroupShape {
    pub fn from_template(template: &Template) -> std::result::Result<Self, ShapeError> {
        let segs = template.segments();
        let (
            Some(Segment::Expr(workflow)),
            Some(Segment::Literal(label)),
            Some(Segment::Expr(unit)),
        ) = (segs.first(), segs.get(1), segs.get(2))
        else {
            return Err(ShapeError::Unrecognized);
        };
        if !is_ref(workflow, Context::Github, &["workflow"]) || !is_pr_or_ref(unit) {
            return Err(ShapeError::Unrecognized);
        }
        let job_label = label
            .strip_prefix('-')
            .and_then(|l| l.strip_suffix('-'))
            .filter(|l| !l.is_empty())
            .ok_or(ShapeError::Unrecognized)?;

        let mut matrix_keys = Vec::new();
        let mut rest = &segs[3..];
        loop {
            match rest {
                [] => break,
                [Segment::Literal(sep), Segment::Expr(Expr::Ref(path)), tail @ ..]
                    if sep == "-" && path.context == Context::Matrix && path.segments.len() == 1 =>
                {
                    matrix_keys.push(path.segments[0].clone());
                    rest = tail;
                }
                [Segment::Literal(text)] => {
                    return Err(ShapeError::TrailingText { text: text.clone() });
                }
                _ => return Err(ShapeError::Unrecognized),
            }
        }
        Ok(Self {
            job_label: job_label.to_string(),
            matrix_keys,
        })
    }

    pub fn key(&self, workflow: &str, unit: WorkUnit, matrix: Option<&Combination>) -> ConcurrencyKey {
        let discriminators = self
            .matrix_keys
            .iter()
            .map(|k| {
                let value = matrix
                    .and_then(|m| m.get(k))
                    .map(|v| v.render())
                    .unwrap_or_default();
                (k.clone(), value)
            })
            .collect();
        ConcurrencyKey::new(workflow, self.job_label.clone(), unit, discriminators)
    }
}

/// A job instance's concurrency group, as declared and as typed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedGroup {
    pub job: String,
    /// `Job (a, b)` for matrix instances, the job id otherwise.
    pub instance: String,
    /// The declared template rendered verbatim.
    pub group: String,
    pub cancel_in_progress: bool,
    pub canonical: Option<ConcurrencyKey>,
    pub shape_error: Option<ShapeError>,
    pub diagnostics: Vec<TemplateDiagnostic>,
}

impl RenderedGroup {
    /// Declared and canonical renderings disagree.
    pub fn diverges(&self) -> bool {
        match &self.canonical {
            Some(key) => key.render() != self.group,
            None => matches!(self.shape_error, Some(ShapeError::TrailingText { .. })),
        }
    }
}

/// Label for one job instance.
pub fn instance_label(job: &str, matrix: Option<&Combination>) -> String {
    match matrix {
        Some(c) if !c.is_empty() => format!("{job} ({})", c.values_text()),
        _ => job.to_string(),
    }
}

/// Render every job-level concurrency group in `workflow` under `ctx`.
pub fn render_groups(workflow: &Workflow, ctx: &EvalContext) -> Result<Vec<RenderedGroup>> {
    let unit = WorkUnit::from_github(&ctx.github);
    let mut out = Vec::new();
    for job in &workflow.jobs {
        let Some(spec) = &job.concurrency else {
            continue;
        };
        let instances = match job.matrix() {
            Some(m) => m.expand(job.id.as_str())?.into_iter().map(Some).collect(),
            None => vec![None],
        };
        let shape = GroupShape::from_template(&spec.group);
        for combo in instances {
            let scoped = ctx.clone().with_matrix(combo.clone());
            let group = spec.group.render(&scoped).map_err(|e| {
                WorkflowError::expression(format!("{}/{}/concurrency", workflow.file, job.id), e)
            })?;
            let (canonical, shape_error) = match &shape {
                Ok(s) => (Some(s.key(&ctx.github.workflow, unit.clone(), combo.as_ref())), None),
                Err(e) => (None, Some(e.clone())),
            };
            out.push(RenderedGroup {
                job: job.id.to_string(),
                instance: instance_label(job.id.as_str(), combo.as_ref()),
                group,
                cancel_in_progress: spec.cancel_in_progress,
                canonical,
                shape_error,
                diagnostics: spec.group.diagnostics().to_vec(),
            });
        }
    }
    Ok(out)
}

/// Distinct job instances that render the same group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Collision {
    pub group: String,
    pub instances: Vec<String>,
}

pub fn find_collisions(groups: &[RenderedGroup]) -> Vec<Collision> {
    let mut by_key: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for g in groups {
        let entry = by_key.entry(g.group.as_str()).or_default();
        if !entry.contains(&g.instance) {
            entry.push(g.instance.clone());
        }
    }
    by_key
        .into_iter()
        .filter(|(_, instances)| instances.len() > 1)
        .map(|(group, instances)| Collision {
            group: group.to_string(),
            instances,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::ExprValue;

    const UNIT: &str = "${{ github.workflow }}-Unit-${{ github.event.pull_request.number || github.ref }}-${{ matrix.tox-env }}";
    const COVERAGE: &str = "${{ github.workflow }}-Coverage-${{ github.event.pull_request.number || github.ref }}}";

    #[test]
    fn test_canonical_key_render() {
        let key = ConcurrencyKey::new(
            "PR Checks",
            "Unit",
            WorkUnit::PullRequest(42),
            vec![("tox-env".to_string(), "unit-test-py310".to_string())],
        );
        assert_eq!(key.render(), "PR Checks-Unit-42-unit-test-py310");
    }

    #[test]
    fn test_shape_with_matrix_discriminator() {
        let shape = GroupShape::from_template(&Template::parse(UNIT).unwrap()).unwrap();
        assert_eq!(shape.job_label, "Unit");
        assert_eq!(shape.matrix_keys, vec!["tox-env".to_string()]);
        let combo = Combination::new(vec![("tox-env".to_string(), ExprValue::from("py310"))]);
        let key = shape.key(
            "PR Checks",
            WorkUnit::Ref("refs/heads/develop".to_string()),
            Some(&combo),
        );
        assert_eq!(key.render(), "PR Checks-Unit-refs/heads/develop-py310");
    }

    #[test]
    fn test_stray_brace_is_trailing_text() {
        let err = GroupShape::from_template(&Template::parse(COVERAGE).unwrap()).unwrap_err();
        assert_eq!(
            err,
            ShapeError::TrailingText {
                text: "}".to_string()
            }
        );
    }

    #[test]
    fn test_unrecognized_shape() {
        let t = Template::parse("static-group").unwrap();
        assert_eq!(GroupShape::from_template(&t), Err(ShapeError::Unrecognized));
    }

    #[test]
    fn test_find_collisions() {
        let group = |instance: &str, key: &str| RenderedGroup {
            job: instance.to_string(),
            instance: instance.to_string(),
            group: key.to_string(),
            cancel_in_progress: true,
            canonical: None,
            shape_error: None,
            diagnostics: Vec::new(),
        };
        let collisions = find_collisions(&[
            group("Unit-Test (a)", "k-1"),
            group("Unit-Test (b)", "k-1"),
            group("Coverage-Test", "k-2"),
        ]);
        assert_eq!(collisions.len(), 1);
        assert_eq!(collisions[0].instances.len(), 2);
    }
}
