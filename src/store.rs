//! Durable collaborators behind narrow interfaces: the job store (single
//! writer: the orchestrator) and the advisory artifact store.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use crate::errors::EngineError;
use crate::job::{CssJob, JobId};

/// Durable record of job state and results.
///
/// The interface is deliberately whole-record: no partial or concurrent
/// field updates, so the orchestrator stays the single writer.
pub trait JobStore: Send + Sync {
    fn create(&self, job: CssJob) -> Result<(), EngineError>;
    fn load(&self, id: JobId) -> Result<CssJob, EngineError>;
    fn save(&self, job: &CssJob) -> Result<(), EngineError>;
    fn list(&self) -> Result<Vec<CssJob>, EngineError>;
}

/// Thread-safe in-memory registry. The production deployment swaps in a
/// relational-backed implementation of [`JobStore`].
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, CssJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for InMemoryJobStore {
    fn create(&self, job: CssJob) -> Result<(), EngineError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        jobs.insert(job.id, job);
        Ok(())
    }

    fn load(&self, id: JobId) -> Result<CssJob, EngineError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        jobs.get(&id).cloned().ok_or(EngineError::JobNotFound)
    }

    fn save(&self, job: &CssJob) -> Result<(), EngineError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        if !jobs.contains_key(&job.id) {
            return Err(EngineError::JobNotFound);
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<CssJob>, EngineError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        Ok(jobs.values().cloned().collect())
    }
}

fn poisoned() -> EngineError {
    EngineError::Store("job store lock poisoned".to_string())
}

/// Storage for debug artifacts (screenshots, snapshots). Purely advisory:
/// a failing artifact store must never fail the job.
pub trait ArtifactStore: Send + Sync {
    /// Store bytes for a (job, viewport) pair, returning an opaque reference.
    fn put(&self, job_id: JobId, viewport: &str, bytes: &[u8]) -> Result<String, EngineError>;
}

/// Keeps artifacts in memory and hands back `memory://` references.
#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    artifacts: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, reference: &str) -> Option<Vec<u8>> {
        let key = reference.strip_prefix("memory://")?;
        self.artifacts.read().ok()?.get(key).cloned()
    }
}

impl ArtifactStore for InMemoryArtifactStore {
    fn put(&self, job_id: JobId, viewport: &str, bytes: &[u8]) -> Result<String, EngineError> {
        let mut artifacts = self
            .artifacts
            .write()
            .map_err(|_| EngineError::Artifact("artifact store lock poisoned".to_string()))?;
        let index = artifacts.len();
        let key = format!("{job_id}/{viewport}/{index}");
        artifacts.insert(key.clone(), bytes.to_vec());
        Ok(format!("memory://{key}"))
    }
}

/// Writes artifacts below a root directory, one file per capture.
#[derive(Debug)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ArtifactStore for FsArtifactStore {
    fn put(&self, job_id: JobId, viewport: &str, bytes: &[u8]) -> Result<String, EngineError> {
        let dir = self.root.join(job_id.to_string());
        std::fs::create_dir_all(&dir)
            .map_err(|e| EngineError::Artifact(format!("create {}: {e}", dir.display())))?;
        let path = dir.join(format!("{viewport}.png"));
        std::fs::write(&path, bytes)
            .map_err(|e| EngineError::Artifact(format!("write {}: {e}", path.display())))?;
        Ok(path.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn job() -> CssJob {
        CssJob::new(
            Url::parse("https://shop.example/landing").unwrap(),
            "landing".to_string(),
            vec!["desktop".to_string()],
        )
    }

    #[test]
    fn create_load_save_round_trip() {
        let store = InMemoryJobStore::new();
        let mut job = job();
        let id = job.id;
        store.create(job.clone()).unwrap();

        job.begin_processing().unwrap();
        store.save(&job).unwrap();

        let loaded = store.load(id).unwrap();
        assert_eq!(loaded.status, crate::job::JobStatus::Processing);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn load_unknown_job_fails() {
        let store = InMemoryJobStore::new();
        assert!(matches!(store.load(JobId::new()), Err(EngineError::JobNotFound)));
        assert!(matches!(store.save(&job()), Err(EngineError::JobNotFound)));
    }

    #[test]
    fn memory_artifacts_round_trip() {
        let store = InMemoryArtifactStore::new();
        let reference = store.put(JobId::new(), "mobile", b"png-bytes").unwrap();
        assert!(reference.starts_with("memory://"));
        assert_eq!(store.get(&reference).unwrap(), b"png-bytes");
    }

    #[test]
    fn fs_artifacts_land_under_job_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let id = JobId::new();
        let reference = store.put(id, "desktop", b"img").unwrap();
        assert!(reference.contains(&id.to_string()));
        assert_eq!(std::fs::read(&reference).unwrap(), b"img");
    }
}
