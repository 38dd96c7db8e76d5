//! Poll path: periodic re-fetch of the active job list.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};
use uuid::Uuid;

use super::JobSource;
use super::board::JobBoard;
use crate::error::JobError;

/// Default poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Result of a single poll.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PollOutcome {
    /// Nothing active or watched; no fetch was made.
    pub skipped: bool,
    /// Jobs that left the active set during this poll.
    pub departed: Vec<Uuid>,
}

/// Keeps a `JobBoard` in sync by polling a `JobSource`.
pub struct JobPoller {
    source: Arc<dyn JobSource>,
    board: Arc<RwLock<JobBoard>>,
    interval: Duration,
}

impl JobPoller {
    pub fn new(source: Arc<dyn JobSource>, interval: Duration) -> Self {
        Self {
            source,
            board: Arc::new(RwLock::new(JobBoard::new())),
            interval,
        }
    }

    pub fn board(&self) -> Arc<RwLock<JobBoard>> {
        Arc::clone(&self.board)
    }

    /// Track `id` until it is observed leaving the active set.
    pub async fn watch(&self, id: Uuid) {
        self.board.write().await.watch(id);
    }

    /// Poll once.
    ///
    /// Fetches the active list straight from the source, reconciles the
    /// board, then reads the final record of every job that left the active
    /// set so its terminal stage is observed.
    pub async fn poll(&self) -> Result<PollOutcome, JobError> {
        if !self.board.read().await.needs_polling() {
            return Ok(PollOutcome {
                skipped: true,
                departed: Vec::new(),
            });
        }

        let active = self.source.active_jobs().await?;
        let departed = self.board.write().await.reconcile_active(active);

        for id in &departed {
            match self.source.get_job(*id).await? {
                Some(job) => {
                    debug!(job_id = %id, stage = %job.stage, "Job left active set");
                    self.board.write().await.apply_update(job);
                }
                None => debug!(job_id = %id, "Departed job has no record"),
            }
        }

        Ok(PollOutcome {
            skipped: false,
            departed,
        })
    }

    /// Poll on an interval until the handle is aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = self.poll().await {
                    warn!(error = %e, "Job poll failed");
                }
            }
        })
    }
}
