//! Job lifecycle manager: the only writer of a job's stage.
//!
//! Every transition is a read, a legality check and a compare-and-set write
//! (`JobPatch::expecting`). If another writer got in between, the record is
//! re-read and the check runs again against the fresh stage.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{Job, JobPatch, JobType};
use super::state::JobStage;
use crate::error::{JobError, StoreError};
use crate::store::JobStore;

/// Error text recorded on a job cancelled by the user.
pub const CANCELLED_BY_USER: &str = "Cancelled by user";

/// How many times a transition is re-evaluated after losing a race.
const MAX_CAS_ATTEMPTS: usize = 3;

/// Creates jobs and enforces legal stage transitions.
pub struct JobManager {
    store: Arc<dyn JobStore>,
}

impl JobManager {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Insert a new job at `pending`.
    pub async fn create_job(
        &self,
        job_type: JobType,
        session_id: Option<Uuid>,
    ) -> Result<Job, JobError> {
        let job = self.store.create(job_type, session_id).await?;
        info!(job_id = %job.id, job_type = %job_type, "Job created");
        Ok(job)
    }

    /// Fetch a job, failing with `NotFound` if it does not exist.
    pub async fn get_job(&self, id: Uuid) -> Result<Job, JobError> {
        self.store
            .get(id)
            .await?
            .ok_or(JobError::NotFound { id })
    }

    pub async fn list_active_jobs(&self) -> Result<Vec<Job>, JobError> {
        Ok(self.store.list_active().await?)
    }

    pub async fn list_all_jobs(&self) -> Result<Vec<Job>, JobError> {
        Ok(self.store.list_all().await?)
    }

    /// Advance a job to `next`. Only the forward successor or `failed` is legal.
    pub async fn update_stage(&self, id: Uuid, next: JobStage) -> Result<Job, JobError> {
        let job = self
            .transition(id, JobPatch::stage(next), |job| {
                if job.stage.can_transition_to(next) {
                    Ok(())
                } else {
                    Err(JobError::InvalidTransition {
                        id,
                        from: job.stage,
                        to: next,
                    })
                }
            })
            .await?;
        debug!(job_id = %id, stage = %next, "Job stage updated");
        Ok(job)
    }

    /// Mark a job completed with the session it produced.
    pub async fn complete_job(&self, id: Uuid, result_session_id: Uuid) -> Result<Job, JobError> {
        let patch = JobPatch::stage(JobStage::Completed).with_result_session(result_session_id);
        let job = self
            .transition(id, patch, |job| require_active(job, JobStage::Completed))
            .await?;
        info!(job_id = %id, result_session_id = %result_session_id, "Job completed");
        Ok(job)
    }

    /// Mark a job failed with a display message.
    pub async fn fail_job(&self, id: Uuid, message: impl Into<String>) -> Result<Job, JobError> {
        let message = message.into();
        let patch = JobPatch::stage(JobStage::Failed).with_error(message.clone());
        let job = self
            .transition(id, patch, |job| require_active(job, JobStage::Failed))
            .await?;
        warn!(job_id = %id, error = %message, "Job failed");
        Ok(job)
    }

    /// Cancel a job that has not started yet.
    ///
    /// Fails with `InvalidState` once the job has left `pending`; the record
    /// is left untouched in that case.
    pub async fn cancel_job(&self, id: Uuid) -> Result<Job, JobError> {
        let patch = JobPatch::stage(JobStage::Failed).with_error(CANCELLED_BY_USER);
        let job = self
            .transition(id, patch, |job| {
                if job.stage == JobStage::Pending {
                    Ok(())
                } else {
                    Err(JobError::InvalidState {
                        id,
                        stage: job.stage,
                    })
                }
            })
            .await?;
        info!(job_id = %id, "Job cancelled by user");
        Ok(job)
    }

    /// Bump the informational retry counter.
    pub async fn record_retry(&self, id: Uuid) -> Result<Job, JobError> {
        Ok(self.store.update(id, JobPatch::retry()).await?)
    }

    /// Fail every job still in a non-terminal stage.
    ///
    /// Meant for startup only, before any runner is spawned; a job advanced
    /// by a live runner would be failed out from under it.
    pub async fn reap_orphans(&self, reason: &str) -> Result<Vec<Job>, JobError> {
        let mut reaped = Vec::new();
        for job in self.store.list_active().await? {
            match self.fail_job(job.id, reason).await {
                Ok(job) => reaped.push(job),
                Err(e) => warn!(job_id = %job.id, error = %e, "Failed to reap orphaned job"),
            }
        }
        if !reaped.is_empty() {
            info!(count = reaped.len(), "Reaped orphaned jobs");
        }
        Ok(reaped)
    }

    async fn transition(
        &self,
        id: Uuid,
        patch: JobPatch,
        check: impl Fn(&Job) -> Result<(), JobError>,
    ) -> Result<Job, JobError> {
        let mut last_conflict = None;
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.get_job(id).await?;
            check(&current)?;
            match self
                .store
                .update(id, patch.clone().expecting(current.stage))
                .await
            {
                Ok(job) => return Ok(job),
                Err(e @ StoreError::Conflict { .. }) => {
                    debug!(job_id = %id, error = %e, "Lost transition race, re-checking");
                    last_conflict = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last_conflict
            .map(JobError::Store)
            .unwrap_or(JobError::NotFound { id }))
    }
}

fn require_active(job: &Job, target: JobStage) -> Result<(), JobError> {
    if job.is_active() {
        Ok(())
    } else {
        Err(JobError::InvalidTransition {
            id: job.id,
            from: job.stage,
            to: target,
        })
    }
}
