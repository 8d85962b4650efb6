//! wfgraph-state: run ledger and artifact persistence for wfgraph
//!
//! ## Key Components
//!
//! - `RunLedger`: append-only record of a workflow run and its events
//! - `ArtifactStore`: named, per-run artifact bundles
//! - `fakes`: in-memory implementations for tests and dry runs
//! - `FsArtifactStore`: on-disk artifact store

mod error;
pub mod fakes;
pub mod fs_store;
pub mod storage_traits;

pub use error::StorageError;
pub use fs_store::FsArtifactStore;
pub use storage_traits::{
    validate_artifact_name, ArtifactFile, ArtifactPayload, ArtifactRecord, ArtifactStore,
    ContentDigest, RunEvent, RunId, RunLedger, RunMetadata, RunRecord, RunStatus, RunSummary,
    StorageResult,
};
