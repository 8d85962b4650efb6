//! Loading GitHub Actions workflow YAML into typed [`Workflow`] records.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde_yaml::{Mapping, Value};
use tracing::debug;

use crate::error::{Result, WorkflowError};
use crate::expr::Template;
use crate::model::{ConcurrencySpec, Job, TriggerSet, Workflow};

fn invalid(file: &str, reason: impl Into<String>) -> WorkflowError {
    WorkflowError::InvalidWorkflow {
        file: file.to_string(),
        reason: reason.into(),
    }
}

fn take<T: serde::de::DeserializeOwned>(
    file: &str,
    root: &mut Mapping,
    key: &str,
) -> Result<Option<T>> {
    match root.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => serde_yaml::from_value(v)
            .map(Some)
            .map_err(|e| invalid(file, format!("{key}: {e}"))),
    }
}

/// `uses: <ref> # <comment>` pairs found in the raw text.
fn version_comments(text: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim_start().trim_start_matches("- ");
        let Some(rest) = line.strip_prefix("uses:") else {
            continue;
        };
        let Some((reference, comment)) = rest.split_once(" #") else {
            continue;
        };
        let reference = reference.trim().trim_matches(|c| c == '"' || c == '\'');
        let comment = comment.trim();
        if !reference.is_empty() && !comment.is_empty() {
            out.insert(reference.to_string(), comment.to_string());
        }
    }
    out
}

/// Parse one workflow file's text. `file` is its file name.
pub fn load_str(file: &str, text: &str) -> Result<Workflow> {
    let mut root = match serde_yaml::from_str::<Value>(text)? {
        Value::Mapping(m) => m,
        _ => return Err(invalid(file, "top level must be a mapping")),
    };

    let name: Option<String> = take(file, &mut root, "name")?;
    // YAML 1.1 readers turn a bare `on` key into `true`.
    let on = root
        .remove("on")
        .or_else(|| root.remove(Value::Bool(true)))
        .ok_or_else(|| invalid(file, "missing 'on'"))?;
    let triggers: TriggerSet =
        serde_yaml::from_value(on).map_err(|e| invalid(file, format!("on: {e}")))?;
    let env: Option<BTreeMap<String, Template>> = take(file, &mut root, "env")?;
    let concurrency: Option<ConcurrencySpec> = take(file, &mut root, "concurrency")?;

    let jobs = match root.remove("jobs") {
        Some(Value::Mapping(m)) => m,
        _ => return Err(invalid(file, "missing 'jobs' mapping")),
    };

    let comments = version_comments(text);
    let mut parsed = Vec::with_capacity(jobs.len());
    for (key, body) in jobs {
        let Value::String(id) = key else {
            return Err(invalid(file, "job ids must be strings"));
        };
        let Value::Mapping(mut body) = body else {
            return Err(invalid(file, format!("job '{id}' must be a mapping")));
        };
        body.insert(Value::from("id"), Value::from(id.as_str()));
        let mut job: Job = serde_yaml::from_value(Value::Mapping(body))
            .map_err(|e| invalid(file, format!("job '{id}': {e}")))?;
        for step in &mut job.steps {
            if let Some(action) = step.action_mut().and_then(|a| a.remote_mut()) {
                if action.version_comment.is_none() {
                    action.version_comment = comments.get(&action.to_string()).cloned();
                }
            }
        }
        parsed.push(job);
    }

    let workflow = Workflow {
        name: name.unwrap_or_else(|| file.to_string()),
        file: file.to_string(),
        triggers,
        env: env.unwrap_or_default(),
        concurrency,
        jobs: parsed,
    };
    debug!(workflow = %workflow.name, file = %file, jobs = workflow.jobs.len(), "loaded workflow");
    Ok(workflow)
}

pub fn load_file(path: &Path) -> Result<Workflow> {
    let text = fs::read_to_string(path)?;
    let file = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    load_str(&file, &text)
}

/// Load every `*.yaml` / `*.yml` file in `dir`, sorted by file name.
pub fn load_dir(dir: &Path) -> Result<Vec<Workflow>> {
    let mut paths: Vec<_> = fs::read_dir(dir)?
        .map(|e| e.map(|e| e.path()))
        .collect::<std::io::Result<_>>()?;
    paths.retain(|p| {
        p.is_file()
            && matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            )
    });
    paths.sort();
    paths.iter().map(|p| load_file(p)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StepKind;

    const SMALL: &str = r#"
name: Small
on:
  push:
    branches: [develop]
jobs:
  Build:
    runs-on: ubuntu-22.04
    steps:
      - name: Checkout
        uses: actions/checkout@b4ffde65f46336ab88eb53be808477a3936bae11 # v4.1.1
      - run: echo hi
  Test:
    needs: Build
    runs-on: ubuntu-22.04
    steps:
      - run: echo test
"#;

    #[test]
    fn test_load_str_assigns_ids_and_order() {
        let wf = load_str("small.yaml", SMALL).unwrap();
        assert_eq!(wf.name, "Small");
        assert_eq!(wf.file, "small.yaml");
        let ids: Vec<&str> = wf.job_ids().map(|j| j.as_str()).collect();
        assert_eq!(ids, vec!["Build", "Test"]);
        assert_eq!(wf.jobs[1].needs[0].as_str(), "Build");
    }

    #[test]
    fn test_version_comment_recovered() {
        let wf = load_str("small.yaml", SMALL).unwrap();
        let StepKind::Action(action) = &wf.jobs[0].steps[0].kind else {
            panic!("expected action step");
        };
        let remote = action.remote().unwrap();
        assert!(remote.is_pinned());
        assert_eq!(remote.version_comment.as_deref(), Some("v4.1.1"));
    }

    #[test]
    fn test_missing_jobs_is_invalid() {
        let err = load_str("x.yaml", "name: x\non: push\n").unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidWorkflow { .. }));
    }

    #[test]
    fn test_bad_job_reports_file_and_job() {
        let err = load_str(
            "x.yaml",
            "on: push\njobs:\n  A:\n    runs-on: x\n    steps:\n      - run: echo ${{ nope.x }}\n",
        )
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("x.yaml"));
        assert!(msg.contains("'A'"));
    }

    #[test]
    fn test_load_dir_sorted() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.yaml"), SMALL.replace("Small", "B")).unwrap();
        fs::write(dir.path().join("a.yml"), SMALL.replace("Small", "A")).unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let wfs = load_dir(dir.path()).unwrap();
        let names: Vec<&str> = wfs.iter().map(|w| w.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B"]);
    }
}
