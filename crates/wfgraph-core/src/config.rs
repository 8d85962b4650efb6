//! Environment consumed by the workflows and engine configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Variables and secrets the workflows read, as seen by one runner.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiEnvironment {
    pub mlflow_tracking_server_uri: Option<String>,
    /// Clear previous benchmark results before a run.
    pub benchmark_results_clear: bool,
    pub gh_ctx_ref_name: Option<String>,
    pub gh_ctx_sha: Option<String>,
    pub trivy_download_url: Option<String>,
    #[serde(skip_serializing)]
    pub codecov_token: Option<String>,
}

pub const MLFLOW_TRACKING_SERVER_URI: &str = "MLFLOW_TRACKING_SERVER_URI";
pub const BENCHMARK_RESULTS_CLEAR: &str = "BENCHMARK_RESULTS_CLEAR";
pub const GH_CTX_REF_NAME: &str = "GH_CTX_REF_NAME";
pub const GH_CTX_SHA: &str = "GH_CTX_SHA";
pub const TRIVY_DOWNLOAD_URL: &str = "TRIVY_DOWNLOAD_URL";
pub const CODECOV_TOKEN: &str = "CODECOV_TOKEN";

fn truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

impl CiEnvironment {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        Self {
            mlflow_tracking_server_uri: get(MLFLOW_TRACKING_SERVER_URI),
            benchmark_results_clear: get(BENCHMARK_RESULTS_CLEAR).is_some_and(|v| truthy(&v)),
            gh_ctx_ref_name: get(GH_CTX_REF_NAME),
            gh_ctx_sha: get(GH_CTX_SHA),
            trivy_download_url: get(TRIVY_DOWNLOAD_URL),
            codecov_token: get(CODECOV_TOKEN),
        }
    }

    /// Repository variables (`vars.*`).
    pub fn vars(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        if let Some(v) = &self.mlflow_tracking_server_uri {
            vars.insert(MLFLOW_TRACKING_SERVER_URI.to_string(), v.clone());
        }
        vars.insert(
            BENCHMARK_RESULTS_CLEAR.to_string(),
            self.benchmark_results_clear.to_string(),
        );
        if let Some(v) = &self.trivy_download_url {
            vars.insert(TRIVY_DOWNLOAD_URL.to_string(), v.clone());
        }
        vars
    }

    /// Repository secrets (`secrets.*`).
    pub fn secrets(&self) -> BTreeMap<String, String> {
        self.codecov_token
            .iter()
            .map(|t| (CODECOV_TOKEN.to_string(), t.clone()))
            .collect()
    }
}

impl fmt::Debug for CiEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CiEnvironment")
            .field("mlflow_tracking_server_uri", &self.mlflow_tracking_server_uri)
            .field("benchmark_results_clear", &self.benchmark_results_clear)
            .field("gh_ctx_ref_name", &self.gh_ctx_ref_name)
            .field("gh_ctx_sha", &self.gh_ctx_sha)
            .field("trivy_download_url", &self.trivy_download_url)
            .field("codecov_token", &self.codecov_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Default whole-job timeout, as on hosted runners.
pub const DEFAULT_TIMEOUT_MINUTES: u64 = 360;

/// Local executor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Capacity per runner label, e.g. `{"dmount-v2": 1}`. Jobs whose labels
    /// name no pool are unbounded.
    pub runner_pools: BTreeMap<String, usize>,
    pub default_timeout_minutes: u64,
    /// Source tree that `actions/checkout` copies into each instance's
    /// working directory.
    pub workspace: PathBuf,
    /// Where uploaded artifacts are stored.
    pub artifact_dir: PathBuf,
    /// Log commands instead of executing them.
    pub dry_run: bool,
    pub shell: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            runner_pools: BTreeMap::new(),
            default_timeout_minutes: DEFAULT_TIMEOUT_MINUTES,
            workspace: PathBuf::from("."),
            artifact_dir: PathBuf::from(".wfgraph/artifacts"),
            dry_run: false,
            shell: "bash".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn with_pool(mut self, label: &str, capacity: usize) -> Self {
        self.runner_pools.insert(label.to_string(), capacity);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn test_from_lookup() {
        let env = CiEnvironment::from_lookup(lookup(&[
            ("MLFLOW_TRACKING_SERVER_URI", "http://mlflow:5000"),
            ("BENCHMARK_RESULTS_CLEAR", "true"),
            ("GH_CTX_SHA", ""),
            ("CODECOV_TOKEN", "secret"),
        ]));
        assert_eq!(env.mlflow_tracking_server_uri.as_deref(), Some("http://mlflow:5000"));
        assert!(env.benchmark_results_clear);
        assert_eq!(env.gh_ctx_sha, None);
        assert_eq!(env.secrets()["CODECOV_TOKEN"], "secret");
        assert_eq!(env.vars()["BENCHMARK_RESULTS_CLEAR"], "true");
    }

    #[test]
    fn test_debug_redacts_token() {
        let env = CiEnvironment {
            codecov_token: Some("secret".to_string()),
            ..CiEnvironment::default()
        };
        let text = format!("{env:?}");
        assert!(!text.contains("secret"));
        assert!(text.contains("<redacted>"));
    }

    #[test]
    fn test_engine_config_load_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"runner_pools": {"dmount-v2": 1}, "dry_run": true}"#).unwrap();
        let cfg = EngineConfig::load(&path).unwrap();
        assert_eq!(cfg.runner_pools["dmount-v2"], 1);
        assert!(cfg.dry_run);
        assert_eq!(cfg.default_timeout_minutes, DEFAULT_TIMEOUT_MINUTES);
    }
}
