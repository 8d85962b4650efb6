//! The project's workflow set, built in or loaded from a directory.

use std::path::Path;

use crate::error::{Result, WorkflowError};
use crate::loader;
use crate::model::Workflow;

const BUILTIN: [(&str, &str); 5] = [
    ("pr_check.yaml", include_str!("../workflows/pr_check.yaml")),
    ("perf_efficiency.yaml", include_str!("../workflows/perf_efficiency.yaml")),
    ("perf_accuracy.yaml", include_str!("../workflows/perf_accuracy.yaml")),
    ("perf-benchmark.yaml", include_str!("../workflows/perf-benchmark.yaml")),
    ("code_scan.yaml", include_str!("../workflows/code_scan.yaml")),
];

/// A set of workflows addressable by file name or display name.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    workflows: Vec<Workflow>,
}

impl Catalog {
    pub fn new(workflows: Vec<Workflow>) -> Self {
        Self { workflows }
    }

    /// The workflows shipped with this crate.
    pub fn builtin() -> Result<Self> {
        BUILTIN
            .iter()
            .map(|(file, text)| loader::load_str(file, text))
            .collect::<Result<Vec<_>>>()
            .map(Self::new)
    }

    pub fn from_dir(dir: &Path) -> Result<Self> {
        loader::load_dir(dir).map(Self::new)
    }

    /// Raw text of a built-in workflow file.
    pub fn builtin_source(file: &str) -> Option<&'static str> {
        BUILTIN.iter().find(|(f, _)| *f == file).map(|(_, t)| *t)
    }

    pub fn get(&self, file_or_name: &str) -> Option<&Workflow> {
        self.workflows
            .iter()
            .find(|w| w.file == file_or_name)
            .or_else(|| self.workflows.iter().find(|w| w.name == file_or_name))
    }

    pub fn require(&self, file_or_name: &str) -> Result<&Workflow> {
        self.get(file_or_name)
            .ok_or_else(|| WorkflowError::WorkflowNotFound {
                workflow: file_or_name.to_string(),
            })
    }

    pub fn workflows(&self) -> &[Workflow] {
        &self.workflows
    }

    pub fn insert(&mut self, workflow: Workflow) {
        self.workflows.retain(|w| w.file != workflow.file);
        self.workflows.push(workflow);
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog_loads() {
        let catalog = Catalog::builtin().unwrap();
        assert_eq!(catalog.len(), 5);
        let pr = catalog.require("pr_check.yaml").unwrap();
        assert_eq!(pr.name, "PR Checks");
        assert_eq!(pr.jobs.len(), 4);
        assert!(catalog.get("Perf-Efficiency-Benchmark").is_some());
        assert!(catalog.require("nope.yaml").is_err());
    }

    #[test]
    fn test_reusable_benchmark_is_called_not_triggered() {
        let catalog = Catalog::builtin().unwrap();
        let reusable = catalog.require("perf-benchmark.yaml").unwrap();
        assert!(reusable.triggers.is_reusable());
        let caller = catalog.require("perf_efficiency.yaml").unwrap();
        assert_eq!(
            caller.jobs[0].called_workflow(),
            Some("perf-benchmark.yaml")
        );
    }

    #[test]
    fn test_insert_replaces_same_file() {
        let mut catalog = Catalog::builtin().unwrap();
        let mut wf = catalog.require("code_scan.yaml").unwrap().clone();
        wf.name = "Renamed".to_string();
        catalog.insert(wf);
        assert_eq!(catalog.len(), 5);
        assert_eq!(catalog.require("code_scan.yaml").unwrap().name, "Renamed");
    }
}
