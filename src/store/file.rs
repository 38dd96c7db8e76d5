//! File-per-job record store.
//!
//! Layout: `<dir>/<uuid>.json`, one JSON document per job. Each write goes
//! to its own `<uuid>.json.<nonce>.tmp`, is synced, and is renamed over the
//! target, so readers only ever see complete records. Writes are serialized per job id; writes to
//! different ids proceed in parallel. Reads take no lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};
use uuid::Uuid;

use super::traits::JobStore;
use crate::error::StoreError;
use crate::jobs::model::{Job, JobPatch, JobType};

const RECORD_EXT: &str = "json";

/// Parse the job id out of a record path (`<uuid>.json`).
///
/// Temp files and anything else in the directory yield `None`.
pub fn job_id_from_path(path: &Path) -> Option<Uuid> {
    if path.extension()? != RECORD_EXT {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    Uuid::parse_str(stem).ok()
}

/// Write `bytes` to `path` atomically (private temp file, fsync, rename).
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp_path = path.with_extension(format!("{RECORD_EXT}.{}.tmp", Uuid::new_v4().simple()));
    let result = match write_synced(&tmp_path, bytes).await {
        Ok(()) => fs::rename(&tmp_path, path).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }
    Ok(())
}

async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}

/// Per-id async write locks.
///
/// Entries exist only while someone holds or waits on them.
#[derive(Default)]
pub(crate) struct KeyedLocks {
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

/// Held write lock for one id. Dropping it releases the lock.
pub(crate) struct KeyedGuard<'a> {
    owner: &'a KeyedLocks,
    id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    pub(crate) async fn lock(&self, id: Uuid) -> KeyedGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(id).or_default())
        };
        KeyedGuard {
            owner: self,
            id,
            guard: Some(lock.lock_owned().await),
        }
    }

    fn release(&self, id: Uuid) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Only the map holds it now; nobody is waiting on this id.
        if locks.get(&id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&id);
        }
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
    }
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.owner.release(self.id);
    }
}

/// Read and parse one JSON record. `Ok(None)` if the file does not exist.
pub(crate) async fn read_record<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<Option<T>, StoreError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Job store backed by one file per job.
pub struct FileJobStore {
    dir: PathBuf,
    locks: KeyedLocks,
}

impl FileJobStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        debug!(dir = %dir.display(), "Job store opened");
        Ok(Self {
            dir,
            locks: KeyedLocks::default(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.{RECORD_EXT}"))
    }

    async fn write(&self, job: &Job) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(job)?;
        write_atomic(&self.record_path(job.id), &bytes).await
    }

    async fn update_locked(&self, id: Uuid, patch: &JobPatch) -> Result<Job, StoreError> {
        let mut job: Job = read_record(&self.record_path(id))
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "job".to_string(),
                id,
            })?;

        if let Some(expected) = patch.expect_stage {
            if job.stage != expected {
                return Err(StoreError::Conflict {
                    id,
                    expected,
                    actual: job.stage,
                });
            }
        }

        job.apply(patch);
        self.write(&job).await?;
        Ok(job)
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn create(&self, job_type: JobType, session_id: Option<Uuid>) -> Result<Job, StoreError> {
        let job = Job::new(job_type, session_id);
        self.write(&job).await?;
        debug!(job_id = %job.id, job_type = %job.job_type, "Job record created");
        Ok(job)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        read_record(&self.record_path(id)).await
    }

    async fn update(&self, id: Uuid, patch: JobPatch) -> Result<Job, StoreError> {
        let _guard = self.locks.lock(id).await;
        self.update_locked(id, &patch).await
    }

    async fn list_all(&self) -> Result<Vec<Job>, StoreError> {
        let mut paths = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if job_id_from_path(&path).is_some() {
                paths.push(path);
            }
        }

        let reads = paths.iter().map(|p| read_record::<Job>(p));
        let results = futures::future::join_all(reads).await;

        let mut jobs = Vec::with_capacity(results.len());
        for (path, result) in paths.iter().zip(results) {
            match result {
                Ok(Some(job)) => jobs.push(job),
                // Removed between listing and reading.
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable job record"),
            }
        }

        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    fn watch_dir(&self) -> Option<PathBuf> {
        Some(self.dir.clone())
    }
}
