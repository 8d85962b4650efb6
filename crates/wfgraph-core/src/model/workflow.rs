use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

use super::{one_or_many, Step, TriggerSet};
use crate::error::{Result, WorkflowError};
use crate::expr::{Condition, Template};
use crate::matrix::Matrix;

fn job_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*$").expect("static pattern"))
}

/// Validated job identifier (the key under `jobs:`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if job_id_pattern().is_match(&id) {
            Ok(Self(id))
        } else {
            Err(WorkflowError::InvalidJobId { id })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for JobId {
    type Error = WorkflowError;

    fn try_from(value: String) -> Result<Self> {
        JobId::new(value)
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> String {
        id.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Runner label selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunsOn {
    Label(String),
    Labels(Vec<String>),
}

impl RunsOn {
    pub fn labels(&self) -> Vec<&str> {
        match self {
            RunsOn::Label(l) => vec![l.as_str()],
            RunsOn::Labels(ls) => ls.iter().map(String::as_str).collect(),
        }
    }

    pub fn is_self_hosted(&self) -> bool {
        self.labels().contains(&"self-hosted")
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    pub matrix: Matrix,
    #[serde(rename = "fail-fast", default = "default_true")]
    pub fail_fast: bool,
    #[serde(rename = "max-parallel", default)]
    pub max_parallel: Option<usize>,
}

/// `concurrency:` as declared; either a bare group or a group plus cancel policy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConcurrencySpec {
    pub group: Template,
    #[serde(rename = "cancel-in-progress")]
    pub cancel_in_progress: bool,
}

impl<'de> Deserialize<'de> for ConcurrencySpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Group(Template),
            Full {
                group: Template,
                #[serde(rename = "cancel-in-progress", default)]
                cancel_in_progress: bool,
            },
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Group(group) => ConcurrencySpec {
                group,
                cancel_in_progress: false,
            },
            Raw::Full {
                group,
                cancel_in_progress,
            } => ConcurrencySpec {
                group,
                cancel_in_progress,
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerSpec {
    pub image: Template,
    pub options: Option<String>,
    pub env: BTreeMap<String, Template>,
}

impl<'de> Deserialize<'de> for ContainerSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Image(Template),
            Full {
                image: Template,
                #[serde(default)]
                options: Option<String>,
                #[serde(default)]
                env: BTreeMap<String, Template>,
            },
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Image(image) => ContainerSpec {
                image,
                options: None,
                env: BTreeMap::new(),
            },
            Raw::Full {
                image,
                options,
                env,
            } => ContainerSpec {
                image,
                options,
                env,
            },
        })
    }
}

/// One entry under `jobs:`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Job {
    pub id: JobId,
    #[serde(default)]
    pub name: Option<Template>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub needs: Vec<JobId>,
    #[serde(rename = "runs-on", default)]
    pub runs_on: Option<RunsOn>,
    #[serde(rename = "if", default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub strategy: Option<Strategy>,
    #[serde(default)]
    pub concurrency: Option<ConcurrencySpec>,
    #[serde(rename = "timeout-minutes", default)]
    pub timeout_minutes: Option<u64>,
    #[serde(default)]
    pub container: Option<ContainerSpec>,
    #[serde(default)]
    pub env: BTreeMap<String, Template>,
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Reusable workflow called by this job (`./.github/workflows/<file>`).
    #[serde(default)]
    pub uses: Option<String>,
    #[serde(default)]
    pub with: BTreeMap<String, Template>,
    #[serde(default)]
    pub secrets: Option<serde_yaml::Value>,
    #[serde(default)]
    pub outputs: BTreeMap<String, Template>,
    #[serde(default)]
    pub permissions: Option<serde_yaml::Value>,
    #[serde(default)]
    pub environment: Option<serde_yaml::Value>,
    #[serde(default)]
    pub defaults: Option<serde_yaml::Value>,
}

impl Job {
    /// Display name: the `name:` template source, or the id.
    pub fn label(&self) -> &str {
        self.name
            .as_ref()
            .map(Template::source)
            .unwrap_or(self.id.as_str())
    }

    /// File name of the called reusable workflow, if this job is a call.
    pub fn called_workflow(&self) -> Option<&str> {
        let path = self.uses.as_deref()?;
        let local = path.strip_prefix("./")?;
        Some(local.rsplit('/').next().unwrap_or(local))
    }

    pub fn matrix(&self) -> Option<&Matrix> {
        self.strategy.as_ref().map(|s| &s.matrix)
    }
}

/// A workflow file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Workflow {
    pub name: String,
    /// File name, e.g. `pr_check.yaml`.
    pub file: String,
    pub triggers: TriggerSet,
    pub env: BTreeMap<String, Template>,
    pub concurrency: Option<ConcurrencySpec>,
    /// Jobs in declaration order.
    pub jobs: Vec<Job>,
}

impl Workflow {
    pub fn job(&self, id: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id.as_str() == id)
    }

    pub fn job_ids(&self) -> impl Iterator<Item = &JobId> {
        self.jobs.iter().map(|j| &j.id)
    }

    /// Every step across all jobs, with its owning job.
    pub fn steps(&self) -> impl Iterator<Item = (&Job, &Step)> {
        self.jobs
            .iter()
            .flat_map(|job| job.steps.iter().map(move |step| (job, step)))
    }
}
