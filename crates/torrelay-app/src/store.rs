//! Job persistence backends.
//!
//! # Design
//! - `MemoryJobStore` backs tests and ephemeral runs.
//! - `JsonJobStore` keeps one pretty-printed JSON document per job and replaces
//!   it through a temporary file plus rename, so a crash never leaves a torn
//!   record behind.
//! - Unreadable documents are skipped with a warning during load; one corrupt
//!   record must not keep the engine from starting.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use torrelay_core::{EngineError, EngineResult, Job, JobStore};
use tracing::{debug, warn};
use uuid::Uuid;

const JOB_EXTENSION: &str = "json";
const TEMP_EXTENSION: &str = "json.tmp";

/// In-memory job store.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `jobs`.
    #[must_use]
    pub fn with_jobs(jobs: impl IntoIterator<Item = Job>) -> Self {
        Self {
            jobs: Mutex::new(jobs.into_iter().map(|job| (job.id, job)).collect()),
        }
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<Uuid, Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of a stored job.
    #[must_use]
    pub fn get(&self, job_id: Uuid) -> Option<Job> {
        self.jobs().get(&job_id).cloned()
    }

    /// Number of stored jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs().len()
    }

    /// Whether the store holds no jobs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl JobStore for MemoryJobStore {
    fn load_jobs(&self) -> EngineResult<Vec<Job>> {
        Ok(self.jobs().values().cloned().collect())
    }

    fn save_job(&self, job: &Job) -> EngineResult<()> {
        self.jobs().insert(job.id, job.clone());
        Ok(())
    }

    fn delete_job(&self, job_id: Uuid) -> EngineResult<()> {
        self.jobs().remove(&job_id);
        Ok(())
    }
}

/// Directory of JSON job documents.
#[derive(Debug, Clone)]
pub struct JsonJobStore {
    dir: PathBuf,
}

impl JsonJobStore {
    /// Open (and create when missing) the store directory.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Storage`] when the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> EngineResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(storage_err("json.open", &dir))?;
        Ok(Self { dir })
    }

    /// Directory holding the documents.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn document_path(&self, job_id: Uuid) -> PathBuf {
        self.dir.join(format!("{job_id}.{JOB_EXTENSION}"))
    }

    fn temp_path(&self, job_id: Uuid) -> PathBuf {
        self.dir.join(format!("{job_id}.{TEMP_EXTENSION}"))
    }
}

fn storage_err(operation: &'static str, path: &Path) -> impl FnOnce(io::Error) -> EngineError {
    let path = path.display().to_string();
    move |err| EngineError::storage(operation, format!("{path}: {err}"))
}

impl JobStore for JsonJobStore {
    fn load_jobs(&self) -> EngineResult<Vec<Job>> {
        let entries = fs::read_dir(&self.dir).map_err(storage_err("json.load", &self.dir))?;
        let mut jobs = Vec::new();
        for entry in entries {
            let path = entry.map_err(storage_err("json.load", &self.dir))?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(JOB_EXTENSION) {
                continue;
            }
            let document = match fs::read(&path) {
                Ok(document) => document,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable job document");
                    continue;
                }
            };
            match serde_json::from_slice::<Job>(&document) {
                Ok(job) => jobs.push(job),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping malformed job document");
                }
            }
        }
        debug!(dir = %self.dir.display(), jobs = jobs.len(), "loaded job documents");
        Ok(jobs)
    }

    fn save_job(&self, job: &Job) -> EngineResult<()> {
        let document = serde_json::to_vec_pretty(job)
            .map_err(|err| EngineError::storage("json.encode", err.to_string()))?;
        let temp = self.temp_path(job.id);
        let target = self.document_path(job.id);
        fs::write(&temp, document).map_err(storage_err("json.write", &temp))?;
        fs::rename(&temp, &target).map_err(storage_err("json.rename", &target))
    }

    fn delete_job(&self, job_id: Uuid) -> EngineResult<()> {
        let path = self.document_path(job_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(storage_err("json.delete", &path)(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;
    use torrelay_core::{JobPolicy, JobSource, SubmitJob};

    fn job(name: &str) -> Job {
        Job::new(
            Uuid::new_v4(),
            SubmitJob {
                source: JobSource::magnet("magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567"),
                policy: JobPolicy::default(),
                name_hint: Some(name.into()),
            },
            None,
            Utc::now(),
        )
    }

    #[test]
    fn json_store_round_trips_and_replaces() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let store = JsonJobStore::open(dir.path().join("jobs"))?;
        let mut first = job("first");
        store.save_job(&first)?;
        first.name = "renamed".into();
        store.save_job(&first)?;
        store.save_job(&job("second"))?;

        let mut loaded = store.load_jobs()?;
        loaded.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].name, "renamed");
        assert!(!store.temp_path(first.id).exists());

        store.delete_job(first.id)?;
        store.delete_job(first.id)?;
        assert_eq!(store.load_jobs()?.len(), 1);
        Ok(())
    }

    #[test]
    fn json_store_skips_foreign_and_corrupt_files() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let store = JsonJobStore::open(dir.path())?;
        store.save_job(&job("kept"))?;
        fs::write(dir.path().join("notes.txt"), "ignore me")?;
        fs::write(dir.path().join(format!("{}.json", Uuid::new_v4())), "{ nope")?;

        let loaded = store.load_jobs()?;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "kept");
        Ok(())
    }

    #[test]
    fn memory_store_tracks_jobs() -> anyhow::Result<()> {
        let seeded = job("seeded");
        let store = MemoryJobStore::with_jobs([seeded.clone()]);
        assert_eq!(store.get(seeded.id), Some(seeded.clone()));
        store.delete_job(seeded.id)?;
        assert!(store.is_empty());
        Ok(())
    }
}
