//! Error types for wfgraph-state

use thiserror::Error;

/// Errors produced by the run ledger and artifact stores.
#[derive(Error, Debug)]
pub enum StorageError {
    /// A string was not a valid SHA-256 hex digest.
    #[error("invalid digest: {digest}")]
    InvalidDigest { digest: String },

    /// A run id is unknown to the ledger.
    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// The run is not in the state the operation requires.
    #[error("run {run_id} is {status}, expected {expected}")]
    InvalidRunState {
        run_id: String,
        status: String,
        expected: String,
    },

    /// An artifact name is unknown to the store.
    #[error("artifact not found: {name}")]
    ArtifactNotFound { name: String },

    /// An artifact with this name was already uploaded in the run.
    #[error("artifact '{name}' already exists in run {run_id}")]
    ArtifactConflict { run_id: String, name: String },

    /// Artifact names must be non-empty and free of path separators.
    #[error("invalid artifact name: {name:?}")]
    InvalidArtifactName { name: String },

    /// Filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_run_state_mentions_expected() {
        let err = StorageError::InvalidRunState {
            run_id: "r1".to_string(),
            status: "Completed".to_string(),
            expected: "Running".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("r1"));
        assert!(msg.contains("Completed"));
        assert!(msg.contains("Running"));
    }

    #[test]
    fn test_artifact_conflict_displays_name() {
        let err = StorageError::ArtifactConflict {
            run_id: "r1".to_string(),
            name: "perf-benchmark-detection".to_string(),
        };
        assert!(err.to_string().contains("perf-benchmark-detection"));
    }
}
