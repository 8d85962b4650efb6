//! Error types for wfgraph-engine

use thiserror::Error;
use wfgraph_core::WorkflowError;
use wfgraph_state::StorageError;

/// Errors that abort a run as a whole. Step and job failures are outcomes,
/// reported through [`crate::RunReport`], not errors.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A step command could not be started at all.
    #[error("failed to spawn step '{step}' of {job}: {source}")]
    Spawn {
        job: String,
        step: String,
        #[source]
        source: std::io::Error,
    },

    /// The instance's working directory could not be created.
    #[error("failed to prepare workspace for {job}: {source}")]
    Workspace {
        job: String,
        #[source]
        source: std::io::Error,
    },

    #[error("step '{step}' of {job} has an empty command")]
    EmptyCommand { job: String, step: String },

    /// A background job task panicked or was aborted.
    #[error("job task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
