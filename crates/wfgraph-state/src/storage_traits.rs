//! Where workflow runs and their uploaded artifacts are kept.
//!
//! [`RunLedger`] records a run's lifecycle and event stream; [`ArtifactStore`]
//! keeps the named file bundles a run uploads. Backends live in `fakes`
//! (memory) and `fs_store` (disk).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result of a ledger or artifact-store call.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Lowercase SHA-256 hex of a serialized run plan or an artifact file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest(String);

impl ContentDigest {
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        ContentDigest(hex::encode(Sha256::digest(data)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier the ledger assigns to a workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What triggered a run, fixed when the run is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Workflow display name (e.g. "PR Checks")
    pub workflow: String,
    /// Event that triggered the run (e.g. "pull_request")
    pub event: String,
    /// Git ref the run executes against
    pub git_ref: Option<String>,
    /// Commit SHA the run executes against
    pub git_sha: Option<String>,
    /// Arbitrary key-value tags (resolved inputs, jobs, ...)
    pub tags: serde_json::Value,
}

/// One entry of a run's event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    /// Starts at 1 and increases by one per event within a run.
    pub seq: u64,
    /// `job.started`, `step.finished`, `artifact.uploaded`, ...
    pub kind: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Totals written when a run reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_events: u64,
    /// Number of job instances that succeeded
    pub jobs_succeeded: u32,
    /// Number of job instances that failed, were cancelled or skipped
    pub jobs_not_succeeded: u32,
    pub duration_ms: u64,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// A run as the ledger stores it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub spec_digest: ContentDigest,
    pub metadata: RunMetadata,
    pub status: RunStatus,
    pub summary: Option<RunSummary>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Append-only record of workflow runs.
///
/// A run starts `Running` and moves once to `Completed`, `Failed` or
/// `Cancelled`; after that neither its status nor its events change.
/// `get_events` returns events sorted by `seq`.
#[async_trait]
pub trait RunLedger: Send + Sync {
    /// Open a run for the plan with digest `spec_digest`.
    async fn create_run(
        &self,
        spec_digest: &ContentDigest,
        metadata: RunMetadata,
    ) -> StorageResult<RunId>;

    /// Fails with `InvalidRunState` once the run is terminal.
    async fn append_event(&self, run_id: &RunId, event: RunEvent) -> StorageResult<()>;

    async fn complete_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()>;

    async fn fail_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()>;

    /// Cancelled runs include those superseded through a concurrency group.
    async fn cancel_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()>;

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord>;

    async fn get_events(&self, run_id: &RunId) -> StorageResult<Vec<RunEvent>>;

    /// Runs of one plan digest, or all runs, oldest first.
    async fn list_runs(&self, spec_digest: Option<&ContentDigest>)
        -> StorageResult<Vec<RunRecord>>;
}

/// A single file inside an uploaded artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactFile {
    /// Path relative to the job workspace, with `/` separators.
    pub path: String,
    /// SHA-256 of the file contents.
    pub digest: ContentDigest,
    /// Size in bytes.
    pub size: u64,
}

/// A named artifact uploaded by one job instance of a run.
///
/// Retention is per run: artifacts are keyed by `(run_id, name)` and live as
/// long as the run record does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub run_id: RunId,
    pub name: String,
    /// Job instance that produced the artifact (e.g. `Perf-Benchmark (detection)`).
    pub producer: String,
    pub files: Vec<ArtifactFile>,
    pub uploaded_at: DateTime<Utc>,
}

impl ArtifactRecord {
    /// Total bytes across all files.
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// Payload handed to [`ArtifactStore::put_artifact`]: relative path + bytes.
#[derive(Debug, Clone)]
pub struct ArtifactPayload {
    pub path: String,
    pub contents: Vec<u8>,
}

/// Durable store for named run artifacts.
///
/// Guarantees:
/// - Names are unique per run; a second upload under the same name fails with
///   `StorageError::ArtifactConflict`.
/// - `read_file` returns exactly the bytes uploaded.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store a named artifact for a run.
    async fn put_artifact(
        &self,
        run_id: &RunId,
        name: &str,
        producer: &str,
        files: Vec<ArtifactPayload>,
    ) -> StorageResult<ArtifactRecord>;

    /// Fetch artifact metadata by name.
    async fn get_artifact(&self, run_id: &RunId, name: &str) -> StorageResult<ArtifactRecord>;

    /// Read one file of an artifact.
    async fn read_file(&self, run_id: &RunId, name: &str, path: &str) -> StorageResult<Vec<u8>>;

    /// List all artifacts of a run, ordered by name.
    async fn list_artifacts(&self, run_id: &RunId) -> StorageResult<Vec<ArtifactRecord>>;
}

/// Reject names that are empty or could escape a per-run directory.
pub fn validate_artifact_name(name: &str) -> StorageResult<()> {
    let bad = name.trim().is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name == "."
        || name == ".."
        || name.chars().any(|c| c.is_control());
    if bad {
        return Err(StorageError::InvalidArtifactName {
            name: name.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_try_from_rejects_short() {
        assert!(ContentDigest::try_from("abc".to_string()).is_err());
    }

    #[test]
    fn test_digest_try_from_lowercases() {
        let upper = ContentDigest::from_bytes(b"x").as_str().to_ascii_uppercase();
        let d = ContentDigest::try_from(upper).unwrap();
        assert_eq!(d, ContentDigest::from_bytes(b"x"));
    }

    #[test]
    fn test_artifact_name_validation() {
        assert!(validate_artifact_name("perf-efficiency-benchmark-detection").is_ok());
        assert!(validate_artifact_name("").is_err());
        assert!(validate_artifact_name("../escape").is_err());
        assert!(validate_artifact_name("a\\b").is_err());
    }
}
