//! In-memory fakes for storage traits (testing and dry runs)
//!
//! Provides `MemoryRunLedger` and `MemoryArtifactStore` that satisfy the
//! trait contracts without touching the filesystem.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::storage_traits::*;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// MemoryRunLedger
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct RunState {
    record: RunRecord,
    events: Vec<RunEvent>,
}

impl RunState {
    fn ensure_running(&self) -> StorageResult<()> {
        if self.record.status != RunStatus::Running {
            return Err(StorageError::InvalidRunState {
                run_id: self.record.run_id.0.clone(),
                status: format!("{:?}", self.record.status),
                expected: "Running".to_string(),
            });
        }
        Ok(())
    }

    fn finish(&mut self, status: RunStatus, summary: RunSummary) -> StorageResult<()> {
        self.ensure_running()?;
        self.record.status = status;
        self.record.summary = Some(summary);
        self.record.completed_at = Some(Utc::now());
        Ok(())
    }
}

/// In-memory run ledger backed by a `HashMap<RunId, RunState>`.
#[derive(Debug, Default)]
pub struct MemoryRunLedger {
    runs: Mutex<HashMap<String, RunState>>,
}

impl MemoryRunLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_run<R>(
        &self,
        run_id: &RunId,
        f: impl FnOnce(&mut RunState) -> StorageResult<R>,
    ) -> StorageResult<R> {
        let mut runs = lock(&self.runs);
        let state = runs
            .get_mut(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        f(state)
    }
}

#[async_trait]
impl RunLedger for MemoryRunLedger {
    async fn create_run(
        &self,
        spec_digest: &ContentDigest,
        metadata: RunMetadata,
    ) -> StorageResult<RunId> {
        let run_id = RunId::new();
        let record = RunRecord {
            run_id: run_id.clone(),
            spec_digest: spec_digest.clone(),
            metadata,
            status: RunStatus::Running,
            summary: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        lock(&self.runs).insert(
            run_id.0.clone(),
            RunState {
                record,
                events: Vec::new(),
            },
        );
        Ok(run_id)
    }

    async fn append_event(&self, run_id: &RunId, event: RunEvent) -> StorageResult<()> {
        self.with_run(run_id, |state| {
            state.ensure_running()?;
            state.events.push(event);
            Ok(())
        })
    }

    async fn complete_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.with_run(run_id, |state| state.finish(RunStatus::Completed, summary))
    }

    async fn fail_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.with_run(run_id, |state| state.finish(RunStatus::Failed, summary))
    }

    async fn cancel_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.with_run(run_id, |state| state.finish(RunStatus::Cancelled, summary))
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        self.with_run(run_id, |state| Ok(state.record.clone()))
    }

    async fn get_events(&self, run_id: &RunId) -> StorageResult<Vec<RunEvent>> {
        self.with_run(run_id, |state| {
            let mut events = state.events.clone();
            events.sort_by_key(|e| e.seq);
            Ok(events)
        })
    }

    async fn list_runs(
        &self,
        spec_digest: Option<&ContentDigest>,
    ) -> StorageResult<Vec<RunRecord>> {
        let runs = lock(&self.runs);
        let mut records: Vec<RunRecord> = runs
            .values()
            .filter(|s| {
                spec_digest
                    .map(|d| s.record.spec_digest == *d)
                    .unwrap_or(true)
            })
            .map(|s| s.record.clone())
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}

// ---------------------------------------------------------------------------
// MemoryArtifactStore
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct StoredArtifact {
    record: ArtifactRecord,
    contents: HashMap<String, Vec<u8>>,
}

/// In-memory artifact store keyed by `(run_id, name)`.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    artifacts: Mutex<HashMap<String, BTreeMap<String, StoredArtifact>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put_artifact(
        &self,
        run_id: &RunId,
        name: &str,
        producer: &str,
        files: Vec<ArtifactPayload>,
    ) -> StorageResult<ArtifactRecord> {
        validate_artifact_name(name)?;
        let mut artifacts = lock(&self.artifacts);
        let per_run = artifacts.entry(run_id.0.clone()).or_default();
        if per_run.contains_key(name) {
            return Err(StorageError::ArtifactConflict {
                run_id: run_id.0.clone(),
                name: name.to_string(),
            });
        }

        let mut contents = HashMap::new();
        let mut entries = Vec::with_capacity(files.len());
        for file in files {
            entries.push(ArtifactFile {
                path: file.path.clone(),
                digest: ContentDigest::from_bytes(&file.contents),
                size: file.contents.len() as u64,
            });
            contents.insert(file.path, file.contents);
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        let record = ArtifactRecord {
            run_id: run_id.clone(),
            name: name.to_string(),
            producer: producer.to_string(),
            files: entries,
            uploaded_at: Utc::now(),
        };
        per_run.insert(
            name.to_string(),
            StoredArtifact {
                record: record.clone(),
                contents,
            },
        );
        Ok(record)
    }

    async fn get_artifact(&self, run_id: &RunId, name: &str) -> StorageResult<ArtifactRecord> {
        let artifacts = lock(&self.artifacts);
        artifacts
            .get(&run_id.0)
            .and_then(|per_run| per_run.get(name))
            .map(|a| a.record.clone())
            .ok_or_else(|| StorageError::ArtifactNotFound {
                name: name.to_string(),
            })
    }

    async fn read_file(&self, run_id: &RunId, name: &str, path: &str) -> StorageResult<Vec<u8>> {
        let artifacts = lock(&self.artifacts);
        artifacts
            .get(&run_id.0)
            .and_then(|per_run| per_run.get(name))
            .and_then(|a| a.contents.get(path))
            .cloned()
            .ok_or_else(|| StorageError::ArtifactNotFound {
                name: format!("{name}/{path}"),
            })
    }

    async fn list_artifacts(&self, run_id: &RunId) -> StorageResult<Vec<ArtifactRecord>> {
        let artifacts = lock(&self.artifacts);
        Ok(artifacts
            .get(&run_id.0)
            .map(|per_run| per_run.values().map(|a| a.record.clone()).collect())
            .unwrap_or_default())
    }
}
