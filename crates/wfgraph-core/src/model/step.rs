use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactSpec;
use crate::error::{Result, WorkflowError};
use crate::expr::{Condition, Template};

/// A remote action reference `owner/repo[/path]@ref`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRef {
    pub repository: String,
    pub path: Option<String>,
    pub git_ref: String,
    /// Human-readable version from a trailing `# vX.Y.Z` comment.
    pub version_comment: Option<String>,
}

impl ActionRef {
    pub fn parse(reference: &str) -> Result<Self> {
        let invalid = |reason: &str| WorkflowError::InvalidActionRef {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };
        let (target, git_ref) = reference
            .split_once('@')
            .ok_or_else(|| invalid("missing '@<ref>'"))?;
        if git_ref.is_empty() {
            return Err(invalid("empty ref"));
        }
        let mut parts = target.splitn(3, '/');
        let owner = parts.next().filter(|s| !s.is_empty());
        let repo = parts.next().filter(|s| !s.is_empty());
        let (Some(owner), Some(repo)) = (owner, repo) else {
            return Err(invalid("expected owner/repo"));
        };
        Ok(Self {
            repository: format!("{owner}/{repo}"),
            path: parts.next().map(str::to_string),
            git_ref: git_ref.to_string(),
            version_comment: None,
        })
    }

    /// Pinned to a full 40-hex commit hash.
    pub fn is_pinned(&self) -> bool {
        self.git_ref.len() == 40 && self.git_ref.chars().all(|c| c.is_ascii_hexdigit())
    }

    /// `owner/repo[/path]` without the ref.
    pub fn target(&self) -> String {
        match &self.path {
            Some(p) => format!("{}/{}", self.repository, p),
            None => self.repository.clone(),
        }
    }
}

impl fmt::Display for ActionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.target(), self.git_ref)
    }
}

/// Target of a step's `uses:`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionUse {
    Remote(ActionRef),
    Local { path: String },
    Docker { image: String },
}

impl ActionUse {
    pub fn parse(uses: &str) -> Result<Self> {
        if uses.starts_with("./") {
            Ok(ActionUse::Local {
                path: uses.to_string(),
            })
        } else if let Some(image) = uses.strip_prefix("docker://") {
            Ok(ActionUse::Docker {
                image: image.to_string(),
            })
        } else {
            ActionRef::parse(uses).map(ActionUse::Remote)
        }
    }

    pub fn remote(&self) -> Option<&ActionRef> {
        match self {
            ActionUse::Remote(r) => Some(r),
            _ => None,
        }
    }

    pub(crate) fn remote_mut(&mut self) -> Option<&mut ActionRef> {
        match self {
            ActionUse::Remote(r) => Some(r),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Action(ActionUse),
    Run {
        script: Template,
        shell: Option<String>,
        #[serde(rename = "working-directory")]
        working_directory: Option<String>,
    },
    UploadArtifact(ArtifactSpec),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawStep")]
pub struct Step {
    pub id: Option<String>,
    pub name: Option<Template>,
    pub kind: StepKind,
    #[serde(rename = "if")]
    pub condition: Option<Condition>,
    pub env: BTreeMap<String, Template>,
    pub with: BTreeMap<String, Template>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStep {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<Template>,
    #[serde(default)]
    uses: Option<String>,
    #[serde(default)]
    run: Option<Template>,
    #[serde(default)]
    shell: Option<String>,
    #[serde(rename = "working-directory", default)]
    working_directory: Option<String>,
    #[serde(rename = "if", default)]
    condition: Option<Condition>,
    #[serde(default)]
    env: BTreeMap<String, Template>,
    #[serde(default)]
    with: BTreeMap<String, Template>,
    #[serde(rename = "timeout-minutes", default)]
    _timeout_minutes: Option<u64>,
}

const UPLOAD_ACTION: &str = "actions/upload-artifact";

impl TryFrom<RawStep> for Step {
    type Error = WorkflowError;

    fn try_from(raw: RawStep) -> Result<Self> {
        let kind = match (raw.uses, raw.run) {
            (Some(_), Some(_)) => {
                return Err(WorkflowError::InvalidWorkflow {
                    file: String::new(),
                    reason: "a step cannot declare both 'uses' and 'run'".to_string(),
                })
            }
            (None, None) => {
                return Err(WorkflowError::InvalidWorkflow {
                    file: String::new(),
                    reason: "a step must declare 'uses' or 'run'".to_string(),
                })
            }
            (None, Some(script)) => StepKind::Run {
                script,
                shell: raw.shell,
                working_directory: raw.working_directory,
            },
            (Some(uses), None) => {
                let action = ActionUse::parse(&uses)?;
                match action.remote() {
                    Some(r) if r.target() == UPLOAD_ACTION => {
                        StepKind::UploadArtifact(ArtifactSpec::from_with(action, &raw.with)?)
                    }
                    _ => StepKind::Action(action),
                }
            }
        };
        Ok(Step {
            id: raw.id,
            name: raw.name,
            kind,
            condition: raw.condition,
            env: raw.env,
            with: raw.with,
        })
    }
}

impl Step {
    pub fn label(&self) -> String {
        if let Some(name) = &self.name {
            return name.source().to_string();
        }
        match &self.kind {
            StepKind::Action(ActionUse::Remote(r)) => r.target(),
            StepKind::Action(ActionUse::Local { path }) => path.clone(),
            StepKind::Action(ActionUse::Docker { image }) => image.clone(),
            StepKind::Run { script, .. } => script
                .source()
                .lines()
                .next()
                .unwrap_or_default()
                .to_string(),
            StepKind::UploadArtifact(spec) => format!("upload {}", spec.name.source()),
        }
    }

    /// The action this step invokes, including upload steps.
    pub fn action(&self) -> Option<&ActionUse> {
        match &self.kind {
            StepKind::Action(a) => Some(a),
            StepKind::UploadArtifact(spec) => Some(&spec.action),
            StepKind::Run { .. } => None,
        }
    }

    pub(crate) fn action_mut(&mut self) -> Option<&mut ActionUse> {
        match &mut self.kind {
            StepKind::Action(a) => Some(a),
            StepKind::UploadArtifact(spec) => Some(&mut spec.action),
            StepKind::Run { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHECKOUT: &str = "actions/checkout@b4ffde65f46336ab88eb53be808477a3936bae11";

    #[test]
    fn test_parse_pinned_action() {
        let r = ActionRef::parse(CHECKOUT).unwrap();
        assert_eq!(r.repository, "actions/checkout");
        assert!(r.is_pinned());
    }

    #[test]
    fn test_tag_ref_is_not_pinned() {
        let r = ActionRef::parse("codecov/codecov-action@v3").unwrap();
        assert!(!r.is_pinned());
    }

    #[test]
    fn test_action_with_subpath() {
        let r = ActionRef::parse("github/codeql-action/upload-sarif@v3").unwrap();
        assert_eq!(r.repository, "github/codeql-action");
        assert_eq!(r.path.as_deref(), Some("upload-sarif"));
        assert_eq!(r.target(), "github/codeql-action/upload-sarif");
    }

    #[test]
    fn test_invalid_action_ref() {
        assert!(ActionRef::parse("checkout").is_err());
        assert!(ActionRef::parse("actions/checkout@").is_err());
    }

    #[test]
    fn test_upload_step_becomes_artifact_kind() {
        let step: Step = serde_yaml::from_str(
            "name: Upload\nif: ${{ always() }}\nuses: actions/upload-artifact@5d5d22a31266ced268874388b861e4b58bb5c2f3\nwith:\n  name: perf-${{ matrix.task }}\n  path: .tox/perf-*.csv\n",
        )
        .unwrap();
        assert!(matches!(step.kind, StepKind::UploadArtifact(_)));
        assert!(step.condition.unwrap().runs_after_failure());
    }

    #[test]
    fn test_step_requires_uses_or_run() {
        let result: std::result::Result<Step, _> = serde_yaml::from_str("name: nothing\n");
        assert!(result.is_err());
    }
}
