//! Filesystem-backed artifact store.
//!
//! Layout:
//! ```text
//! <root>/<run_id>/<artifact name>/manifest.json
//! <root>/<run_id>/<artifact name>/files/<relative path>
//! ```
//! Files are written to a temp file in the destination directory and renamed
//! into place, so a crashed upload never leaves a truncated file behind.

use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::StorageError;
use crate::storage_traits::*;

const MANIFEST: &str = "manifest.json";

/// Artifact store rooted at a directory (e.g. `.wfgraph/artifacts`).
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn artifact_dir(&self, run_id: &RunId, name: &str) -> PathBuf {
        self.root.join(&run_id.0).join(name)
    }

    fn write_atomic(path: &Path, data: &[u8]) -> StorageResult<()> {
        let dir = path.parent().ok_or_else(|| {
            StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("path has no parent: {}", path.display()),
            ))
        })?;
        fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(data)?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    fn read_manifest(&self, run_id: &RunId, name: &str) -> StorageResult<ArtifactRecord> {
        let path = self.artifact_dir(run_id, name).join(MANIFEST);
        let bytes = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::ArtifactNotFound {
                    name: name.to_string(),
                }
            } else {
                StorageError::Io(e)
            }
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Only plain relative paths may be stored; `..`, roots and prefixes are refused.
fn safe_relative(path: &str) -> StorageResult<PathBuf> {
    let candidate = Path::new(path);
    let ok = !path.is_empty()
        && candidate
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !ok {
        return Err(StorageError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("artifact file path must be relative: {path}"),
        )));
    }
    Ok(candidate.to_path_buf())
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put_artifact(
        &self,
        run_id: &RunId,
        name: &str,
        producer: &str,
        files: Vec<ArtifactPayload>,
    ) -> StorageResult<ArtifactRecord> {
        validate_artifact_name(name)?;
        let dir = self.artifact_dir(run_id, name);
        if dir.join(MANIFEST).exists() {
            return Err(StorageError::ArtifactConflict {
                run_id: run_id.0.clone(),
                name: name.to_string(),
            });
        }

        let mut entries = Vec::with_capacity(files.len());
        for file in &files {
            let rel = safe_relative(&file.path)?;
            Self::write_atomic(&dir.join("files").join(rel), &file.contents)?;
            entries.push(ArtifactFile {
                path: file.path.clone(),
                digest: ContentDigest::from_bytes(&file.contents),
                size: file.contents.len() as u64,
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        let record = ArtifactRecord {
            run_id: run_id.clone(),
            name: name.to_string(),
            producer: producer.to_string(),
            files: entries,
            uploaded_at: Utc::now(),
        };
        Self::write_atomic(&dir.join(MANIFEST), &serde_json::to_vec_pretty(&record)?)?;
        debug!(run_id = %run_id, artifact = %name, files = record.files.len(), "stored artifact");
        Ok(record)
    }

    async fn get_artifact(&self, run_id: &RunId, name: &str) -> StorageResult<ArtifactRecord> {
        validate_artifact_name(name)?;
        self.read_manifest(run_id, name)
    }

    async fn read_file(&self, run_id: &RunId, name: &str, path: &str) -> StorageResult<Vec<u8>> {
        validate_artifact_name(name)?;
        let rel = safe_relative(path)?;
        let full = self.artifact_dir(run_id, name).join("files").join(rel);
        fs::read(&full).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::ArtifactNotFound {
                    name: format!("{name}/{path}"),
                }
            } else {
                StorageError::Io(e)
            }
        })
    }

    async fn list_artifacts(&self, run_id: &RunId) -> StorageResult<Vec<ArtifactRecord>> {
        let run_dir = self.root.join(&run_id.0);
        if !run_dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&run_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        names
            .iter()
            .map(|name| self.read_manifest(run_id, name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> (tempfile::TempDir, FsArtifactStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path()).unwrap();
        (dir, store)
    }

    fn payload(path: &str, data: &[u8]) -> ArtifactPayload {
        ArtifactPayload {
            path: path.to_string(),
            contents: data.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_put_then_read_file() {
        let (_dir, store) = make_store();
        let run = RunId::new();
        let record = store
            .put_artifact(
                &run,
                "coverage",
                "Coverage-Test",
                vec![payload(".tox/coverage.xml", b"<coverage/>")],
            )
            .await
            .unwrap();
        assert_eq!(record.files.len(), 1);
        assert_eq!(record.total_size(), 11);

        let bytes = store
            .read_file(&run, "coverage", ".tox/coverage.xml")
            .await
            .unwrap();
        assert_eq!(bytes, b"<coverage/>");
    }

    #[tokio::test]
    async fn test_duplicate_name_conflicts() {
        let (_dir, store) = make_store();
        let run = RunId::new();
        store
            .put_artifact(&run, "scan", "Trivy-Scan", vec![payload("a.json", b"{}")])
            .await
            .unwrap();
        let err = store
            .put_artifact(&run, "scan", "Trivy-Scan", vec![payload("a.json", b"{}")])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ArtifactConflict { .. }));
    }

    #[tokio::test]
    async fn test_rejects_parent_dir_paths() {
        let (_dir, store) = make_store();
        let run = RunId::new();
        let err = store
            .put_artifact(&run, "evil", "job", vec![payload("../x", b"!")])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Io(_)));
    }

    #[tokio::test]
    async fn test_list_artifacts_sorted() {
        let (_dir, store) = make_store();
        let run = RunId::new();
        for name in ["b-report", "a-report"] {
            store
                .put_artifact(&run, name, "job", vec![payload("r.csv", b"x")])
                .await
                .unwrap();
        }
        let names: Vec<String> = store
            .list_artifacts(&run)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(names, vec!["a-report", "b-report"]);
    }

    #[tokio::test]
    async fn test_missing_artifact_not_found() {
        let (_dir, store) = make_store();
        let err = store
            .get_artifact(&RunId::new(), "nothing")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ArtifactNotFound { .. }));
    }
}
