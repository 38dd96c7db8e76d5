//! Push path: in-process observer fed by the change notifier.

use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::JobSource;
use super::board::JobBoard;
use crate::error::JobError;

/// Keeps a `JobBoard` in sync from pushed updates.
pub struct PushObserver {
    source: Arc<dyn JobSource>,
    board: Arc<RwLock<JobBoard>>,
}

impl PushObserver {
    pub fn new(source: Arc<dyn JobSource>) -> Self {
        Self {
            source,
            board: Arc::new(RwLock::new(JobBoard::new())),
        }
    }

    pub fn board(&self) -> Arc<RwLock<JobBoard>> {
        Arc::clone(&self.board)
    }

    /// Subscribe, apply the init snapshot, then apply updates until the
    /// handle is aborted. Aborting drops the subscription.
    pub async fn spawn(&self) -> Result<JoinHandle<()>, JobError> {
        // Subscribe before the snapshot so no change falls in between.
        let mut subscription = self.source.subscribe();
        resync(self.source.as_ref(), &self.board).await?;

        let source = Arc::clone(&self.source);
        let board = Arc::clone(&self.board);
        Ok(tokio::spawn(async move {
            loop {
                match subscription.recv().await {
                    Ok(job) => {
                        let changed = board.write().await.apply_update(job);
                        debug!(changed, "Applied pushed job update");
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Push observer lagged, resyncing");
                        if let Err(e) = resync(source.as_ref(), &board).await {
                            warn!(error = %e, "Push resync failed");
                        }
                    }
                    Err(RecvError::Closed) => {
                        info!("Job notifications closed");
                        break;
                    }
                }
            }
        }))
    }
}

/// Apply a fresh init snapshot and fetch final records for departed jobs.
async fn resync(source: &dyn JobSource, board: &RwLock<JobBoard>) -> Result<(), JobError> {
    let jobs = source.active_jobs().await?;
    let departed: Vec<Uuid> = board.write().await.apply_init(jobs);
    for id in departed {
        if let Some(job) = source.get_job(id).await? {
            board.write().await.apply_update(job);
        }
    }
    Ok(())
}
