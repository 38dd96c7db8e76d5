//! `JobStore` trait: the persistence seam for job records.
//!
//! One record per job id, whole-record atomic writes, point reads. The
//! file-per-job backend is the default; anything that keeps those two
//! guarantees can stand in for it.

use std::path::PathBuf;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::jobs::model::{Job, JobPatch, JobType};

/// Backend-agnostic job record store.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Allocate an id and persist a new `pending` record.
    async fn create(&self, job_type: JobType, session_id: Option<Uuid>) -> Result<Job, StoreError>;

    /// Point read. `Ok(None)` if no record exists.
    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Merge `patch` into the record and persist it.
    ///
    /// Fails with `NotFound` if the record does not exist and with
    /// `Conflict` if `patch.expect_stage` does not match the stored stage.
    async fn update(&self, id: Uuid, patch: JobPatch) -> Result<Job, StoreError>;

    /// All records, ordered by creation time.
    async fn list_all(&self) -> Result<Vec<Job>, StoreError>;

    /// Records whose stage is not terminal, ordered by creation time.
    async fn list_active(&self) -> Result<Vec<Job>, StoreError> {
        let jobs = self.list_all().await?;
        Ok(jobs.into_iter().filter(Job::is_active).collect())
    }

    /// Directory that receives file-level change events for this store, if
    /// the backend has one.
    fn watch_dir(&self) -> Option<PathBuf>;
}
