//! Artifact upload declarations and local file collection.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::concurrency::instance_label;
use crate::context::EvalContext;
use crate::error::{Result, WorkflowError};
use crate::expr::{Context, ExprError, Resolver, Template};
use crate::model::{ActionUse, StepKind, Workflow};

/// `if-no-files-found:` policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IfNoFilesFound {
    #[default]
    Warn,
    Error,
    Ignore,
}

impl IfNoFilesFound {
    fn parse(text: &str) -> Option<Self> {
        match text {
            "warn" => Some(IfNoFilesFound::Warn),
            "error" => Some(IfNoFilesFound::Error),
            "ignore" => Some(IfNoFilesFound::Ignore),
            _ => None,
        }
    }
}

/// How long an artifact is kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retention {
    /// Lives as long as the run that produced it.
    #[default]
    PerRun,
    Days(u32),
}

/// An `actions/upload-artifact` step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtifactSpec {
    pub name: Template,
    /// Glob patterns; a leading `!` excludes.
    pub paths: Vec<Template>,
    pub retention: Retention,
    pub if_no_files_found: IfNoFilesFound,
    pub action: ActionUse,
}

const DEFAULT_NAME: &str = "artifact";

impl ArtifactSpec {
    pub fn new(name: Template, paths: Vec<Template>) -> Self {
        Self {
            name,
            paths,
            retention: Retention::PerRun,
            if_no_files_found: IfNoFilesFound::Warn,
            action: ActionUse::Local {
                path: "upload-artifact".to_string(),
            },
        }
    }

    /// Build from the step's `with:` inputs.
    pub fn from_with(action: ActionUse, with: &BTreeMap<String, Template>) -> Result<Self> {
        let invalid = |reason: String| WorkflowError::InvalidWorkflow {
            file: String::new(),
            reason,
        };
        let name = with
            .get("name")
            .cloned()
            .unwrap_or_else(|| Template::literal(DEFAULT_NAME));
        let path = with
            .get("path")
            .ok_or_else(|| invalid("upload-artifact requires 'path'".to_string()))?;
        let paths = path
            .source()
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(|l| {
                Template::parse(l).map_err(|e| WorkflowError::expression("upload-artifact path", e))
            })
            .collect::<Result<Vec<_>>>()?;
        let if_no_files_found = match with.get("if-no-files-found") {
            None => IfNoFilesFound::Warn,
            Some(t) => IfNoFilesFound::parse(t.source())
                .ok_or_else(|| invalid(format!("invalid if-no-files-found {:?}", t.source())))?,
        };
        let retention = match with.get("retention-days") {
            None => Retention::PerRun,
            Some(t) => Retention::Days(
                t.source()
                    .parse()
                    .map_err(|_| invalid(format!("invalid retention-days {:?}", t.source())))?,
            ),
        };
        Ok(Self {
            name,
            paths,
            retention,
            if_no_files_found,
            action,
        })
    }

    pub fn render_name(&self, ctx: &dyn Resolver) -> std::result::Result<String, ExprError> {
        self.name.render(ctx)
    }

    pub fn render_paths(&self, ctx: &dyn Resolver) -> std::result::Result<Vec<String>, ExprError> {
        self.paths.iter().map(|p| p.render(ctx)).collect()
    }

    /// Matrix keys the name template references.
    pub fn name_discriminators(&self) -> Vec<String> {
        self.name
            .references()
            .into_iter()
            .filter(|p| p.context == Context::Matrix)
            .filter_map(|p| p.head().map(str::to_string))
            .collect()
    }
}

/// A file picked up for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedFile {
    /// Path relative to the workspace, `/`-separated.
    pub path: String,
    pub contents: Vec<u8>,
    /// SHA-256, lowercase hex.
    pub sha256: String,
}

impl CollectedFile {
    pub fn size(&self) -> u64 {
        self.contents.len() as u64
    }
}

fn walk(path: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    if path.is_dir() {
        let mut entries: Vec<PathBuf> = fs::read_dir(path)?
            .map(|e| e.map(|e| e.path()))
            .collect::<std::io::Result<_>>()?;
        entries.sort();
        for entry in entries {
            walk(&entry, out)?;
        }
    } else if path.is_file() {
        out.push(path.to_path_buf());
    }
    Ok(())
}

fn relative(workspace: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(workspace).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn expand(workspace: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    // The workspace path is literal; only the user pattern may glob.
    let root = glob::Pattern::escape(&workspace.to_string_lossy());
    let full = format!("{}/{}", root.trim_end_matches('/'), pattern);
    let matches = glob::glob(&full).map_err(|source| WorkflowError::Pattern {
        pattern: pattern.to_string(),
        source,
    })?;
    let mut out = Vec::new();
    for entry in matches.flatten() {
        walk(&entry, &mut out)?;
    }
    Ok(out)
}

/// Collect the files named by `patterns` under `workspace`, honouring the
/// `if-no-files-found` policy. Results are sorted by path.
pub fn collect(
    workspace: &Path,
    artifact: &str,
    patterns: &[String],
    policy: IfNoFilesFound,
) -> Result<Vec<CollectedFile>> {
    let mut included: BTreeMap<String, PathBuf> = BTreeMap::new();
    for pattern in patterns.iter().filter(|p| !p.starts_with('!')) {
        for path in expand(workspace, pattern)? {
            included.insert(relative(workspace, &path), path);
        }
    }
    for pattern in patterns.iter().filter_map(|p| p.strip_prefix('!')) {
        for path in expand(workspace, pattern)? {
            included.remove(&relative(workspace, &path));
        }
    }

    if included.is_empty() {
        match policy {
            IfNoFilesFound::Error => {
                return Err(WorkflowError::NoArtifactFiles {
                    artifact: artifact.to_string(),
                    paths: patterns.to_vec(),
                })
            }
            IfNoFilesFound::Warn => {
                warn!(artifact = %artifact, paths = ?patterns, "no files found for artifact");
            }
            IfNoFilesFound::Ignore => {}
        }
        return Ok(Vec::new());
    }

    included
        .into_iter()
        .map(|(path, full)| {
            let contents = fs::read(&full)?;
            let sha256 = hex::encode(Sha256::digest(&contents));
            Ok(CollectedFile {
                path,
                contents,
                sha256,
            })
        })
        .collect()
}

/// Two instances of one job that would upload under the same name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactCollision {
    pub job: String,
    pub name: String,
    pub instances: Vec<String>,
}

impl fmt::Display for ArtifactCollision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "artifact '{}' of job '{}' is uploaded by {}",
            self.name,
            self.job,
            self.instances.join(", ")
        )
    }
}

/// Render every upload name for every matrix instance and report names
/// shared between concurrently running instances of the same job.
pub fn find_collisions(workflow: &Workflow, ctx: &EvalContext) -> Result<Vec<ArtifactCollision>> {
    let mut out = Vec::new();
    for job in &workflow.jobs {
        let Some(matrix) = job.matrix() else {
            continue;
        };
        let combos = matrix.expand(job.id.as_str())?;
        for step in &job.steps {
            let StepKind::UploadArtifact(spec) = &step.kind else {
                continue;
            };
            let mut by_name: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for combo in &combos {
                let scoped = ctx.clone().with_matrix(Some(combo.clone()));
                let name = spec.render_name(&scoped).map_err(|e| {
                    WorkflowError::expression(format!("{}/{}/upload-artifact", workflow.file, job.id), e)
                })?;
                by_name
                    .entry(name)
                    .or_default()
                    .push(instance_label(job.id.as_str(), Some(combo)));
            }
            out.extend(
                by_name
                    .into_iter()
                    .filter(|(_, instances)| instances.len() > 1)
                    .map(|(name, instances)| ArtifactCollision {
                        job: job.id.to_string(),
                        name,
                        instances,
                    }),
            );
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with(pairs: &[(&str, &str)]) -> BTreeMap<String, Template> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Template::parse(v).unwrap()))
            .collect()
    }

    fn upload() -> ActionUse {
        ActionUse::parse("actions/upload-artifact@v4").unwrap()
    }

    #[test]
    fn test_from_with_multiline_paths() {
        let spec = ArtifactSpec::from_with(
            upload(),
            &with(&[
                ("name", "perf-${{ inputs.artifact-prefix }}-${{ matrix.task }}"),
                ("path", ".tox/perf-*.csv\n.tox/raw/\n!.tox/raw/tmp*\n"),
                ("if-no-files-found", "error"),
            ]),
        )
        .unwrap();
        assert_eq!(spec.paths.len(), 3);
        assert_eq!(spec.if_no_files_found, IfNoFilesFound::Error);
        assert_eq!(spec.retention, Retention::PerRun);
        assert_eq!(spec.name_discriminators(), vec!["task".to_string()]);
    }

    #[test]
    fn test_from_with_requires_path() {
        assert!(ArtifactSpec::from_with(upload(), &with(&[("name", "x")])).is_err());
    }

    #[test]
    fn test_collect_globs_and_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let tox = dir.path().join(".tox");
        fs::create_dir_all(tox.join("raw")).unwrap();
        fs::write(tox.join("perf-efficiency-detection.csv"), b"task,time\n").unwrap();
        fs::write(tox.join("raw/a.csv"), b"a").unwrap();
        fs::write(tox.join("raw/tmp.csv"), b"t").unwrap();
        fs::write(tox.join("ignored.txt"), b"x").unwrap();

        let files = collect(
            dir.path(),
            "perf",
            &[
                ".tox/perf-*.csv".to_string(),
                ".tox/raw".to_string(),
                "!.tox/raw/tmp*".to_string(),
            ],
            IfNoFilesFound::Error,
        )
        .unwrap();
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec![".tox/perf-efficiency-detection.csv", ".tox/raw/a.csv"]);
        assert_eq!(files[1].sha256, hex::encode(Sha256::digest(b"a")));
    }

    #[test]
    fn test_collect_under_workspace_with_glob_metacharacters() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("build[1]*?");
        fs::create_dir_all(workspace.join(".tox")).unwrap();
        fs::write(workspace.join(".tox/perf-detection.csv"), b"task,time\n").unwrap();

        let files = collect(
            &workspace,
            "perf",
            &[".tox/perf-*.csv".to_string()],
            IfNoFilesFound::Error,
        )
        .unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, ".tox/perf-detection.csv");
    }

    #[test]
    fn test_no_files_policy() {
        let dir = tempfile::tempdir().unwrap();
        let patterns = vec!["missing/*.csv".to_string()];
        assert!(matches!(
            collect(dir.path(), "x", &patterns, IfNoFilesFound::Error),
            Err(WorkflowError::NoArtifactFiles { .. })
        ));
        assert!(collect(dir.path(), "x", &patterns, IfNoFilesFound::Warn)
            .unwrap()
            .is_empty());
        assert!(collect(dir.path(), "x", &patterns, IfNoFilesFound::Ignore)
            .unwrap()
            .is_empty());
    }
}
