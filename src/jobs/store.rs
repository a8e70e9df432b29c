//! Job persistence: one directory per job, one file per chunk

use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::types::{ChunkRecord, DocumentJob};
use crate::error::StoreError;

const JOBS_DIR: &str = "jobs";
const JOB_FILE: &str = "job.json";
const CHUNKS_DIR: &str = "chunks";

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job with all of its chunks, atomically
    async fn create_job(&self, job: &DocumentJob, chunks: &[ChunkRecord]) -> Result<(), StoreError>;

    async fn load_job(&self, id: &str) -> Result<DocumentJob, StoreError>;

    /// Overwrite the job record; the status change must be legal
    async fn save_job(&self, job: &DocumentJob) -> Result<(), StoreError>;

    /// Chunks ordered by index
    async fn load_chunks(&self, job_id: &str) -> Result<Vec<ChunkRecord>, StoreError>;

    async fn save_chunk(&self, chunk: &ChunkRecord) -> Result<(), StoreError>;

    async fn list_jobs(&self) -> Result<Vec<DocumentJob>, StoreError>;

    async fn delete_job(&self, id: &str) -> Result<(), StoreError>;
}

fn check_transition(previous: &DocumentJob, next: &DocumentJob) -> Result<(), StoreError> {
    if previous.status.can_transition_to(next.status) {
        Ok(())
    } else {
        Err(StoreError::IllegalTransition {
            from: previous.status,
            to: next.status,
        })
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// File-backed store under `<root>/jobs/<id>/`
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn jobs_dir(&self) -> PathBuf {
        self.root.join(JOBS_DIR)
    }

    fn job_dir(&self, id: &str) -> PathBuf {
        self.jobs_dir().join(id)
    }

    fn chunk_file(index: usize) -> String {
        format!("{:05}.json", index)
    }

    async fn blocking<T, F>(f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| StoreError::Io {
                path: PathBuf::new(),
                source: std::io::Error::other(e),
            })?
    }
}

/// Write `bytes` to a sibling temp file and rename it over `target`
fn write_atomic(target: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err(dir))?;
    tmp.write_all(bytes).map_err(io_err(target))?;
    tmp.as_file().sync_all().map_err(io_err(target))?;
    tmp.persist(target).map_err(|e| StoreError::Io {
        path: target.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let content = std::fs::read_to_string(path).map_err(io_err(path))?;
    Ok(serde_json::from_str(&content)?)
}

#[async_trait]
impl JobStore for FileStore {
    async fn create_job(&self, job: &DocumentJob, chunks: &[ChunkRecord]) -> Result<(), StoreError> {
        let jobs_dir = self.jobs_dir();
        let target = self.job_dir(&job.id);
        let id = job.id.clone();
        let job_bytes = serde_json::to_vec_pretty(job)?;
        let chunk_bytes = chunks
            .iter()
            .map(|c| Ok((c.index, serde_json::to_vec_pretty(c)?)))
            .collect::<Result<Vec<_>, StoreError>>()?;

        Self::blocking(move || {
            std::fs::create_dir_all(&jobs_dir).map_err(io_err(&jobs_dir))?;
            if target.exists() {
                return Err(StoreError::AlreadyExists(id));
            }

            // Build the whole job in a hidden staging dir, then move it into place
            let staging = tempfile::Builder::new()
                .prefix(".staging-")
                .tempdir_in(&jobs_dir)
                .map_err(io_err(&jobs_dir))?;
            let chunks_dir = staging.path().join(CHUNKS_DIR);
            std::fs::create_dir_all(&chunks_dir).map_err(io_err(&chunks_dir))?;
            std::fs::write(staging.path().join(JOB_FILE), &job_bytes)
                .map_err(io_err(staging.path()))?;
            for (index, bytes) in &chunk_bytes {
                let path = chunks_dir.join(Self::chunk_file(*index));
                std::fs::write(&path, bytes).map_err(io_err(&path))?;
            }
            std::fs::rename(staging.path(), &target).map_err(io_err(&target))?;
            debug!("Created job {} with {} chunks", id, chunk_bytes.len());
            Ok(())
        })
        .await
    }

    async fn load_job(&self, id: &str) -> Result<DocumentJob, StoreError> {
        let path = self.job_dir(id).join(JOB_FILE);
        let id = id.to_string();
        Self::blocking(move || {
            if !path.exists() {
                return Err(StoreError::NotFound(id));
            }
            read_json(&path)
        })
        .await
    }

    async fn save_job(&self, job: &DocumentJob) -> Result<(), StoreError> {
        let path = self.job_dir(&job.id).join(JOB_FILE);
        let job = job.clone();
        Self::blocking(move || {
            if !path.exists() {
                return Err(StoreError::NotFound(job.id));
            }
            let previous: DocumentJob = read_json(&path)?;
            check_transition(&previous, &job)?;
            write_atomic(&path, &serde_json::to_vec_pretty(&job)?)
        })
        .await
    }

    async fn load_chunks(&self, job_id: &str) -> Result<Vec<ChunkRecord>, StoreError> {
        let dir = self.job_dir(job_id).join(CHUNKS_DIR);
        let id = job_id.to_string();
        Self::blocking(move || {
            if !dir.exists() {
                return Err(StoreError::NotFound(id));
            }
            let mut chunks = Vec::new();
            for entry in std::fs::read_dir(&dir).map_err(io_err(&dir))? {
                let path = entry.map_err(io_err(&dir))?.path();
                if path.extension().and_then(|e| e.to_str()) == Some("json") {
                    chunks.push(read_json::<ChunkRecord>(&path)?);
                }
            }
            chunks.sort_by_key(|c| c.index);
            Ok(chunks)
        })
        .await
    }

    async fn save_chunk(&self, chunk: &ChunkRecord) -> Result<(), StoreError> {
        let dir = self.job_dir(&chunk.job_id).join(CHUNKS_DIR);
        let path = dir.join(Self::chunk_file(chunk.index));
        let bytes = serde_json::to_vec_pretty(chunk)?;
        let id = chunk.job_id.clone();
        Self::blocking(move || {
            if !dir.exists() {
                return Err(StoreError::NotFound(id));
            }
            write_atomic(&path, &bytes)
        })
        .await
    }

    async fn list_jobs(&self) -> Result<Vec<DocumentJob>, StoreError> {
        let dir = self.jobs_dir();
        Self::blocking(move || {
            if !dir.exists() {
                return Ok(Vec::new());
            }
            let mut jobs = Vec::new();
            for entry in std::fs::read_dir(&dir).map_err(io_err(&dir))? {
                let entry = entry.map_err(io_err(&dir))?;
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                let path = entry.path().join(JOB_FILE);
                match read_json::<DocumentJob>(&path) {
                    Ok(job) => jobs.push(job),
                    Err(e) => warn!("Skipping unreadable job at {}: {}", path.display(), e),
                }
            }
            jobs.sort_by_key(|j| j.created_at);
            Ok(jobs)
        })
        .await
    }

    async fn delete_job(&self, id: &str) -> Result<(), StoreError> {
        let dir = self.job_dir(id);
        let id = id.to_string();
        Self::blocking(move || {
            if !dir.exists() {
                return Err(StoreError::NotFound(id));
            }
            std::fs::remove_dir_all(&dir).map_err(io_err(&dir))
        })
        .await
    }
}

#[cfg(test)]
pub use memory::MemoryStore;
