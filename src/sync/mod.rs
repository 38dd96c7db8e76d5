//! Client synchronization: poll and push views over the same job records.
//!
//! Both paths consume a `JobSource`: the poller re-fetches the active set on
//! an interval, the push observer applies an init snapshot and then one
//! update per debounced change. Either can run without the other.

pub mod board;
pub mod poller;
pub mod push;
pub mod ws;

pub use board::JobBoard;
pub use poller::JobPoller;
pub use push::PushObserver;
pub use ws::{ClientHints, job_routes};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;
use crate::jobs::{Job, JobManager};
use crate::notifier::{ChangeNotifier, Subscription};

/// Handle returned by `JobSource::subscribe`. Dropping it unsubscribes.
pub type JobSubscription = Subscription;

/// Push channel messages (server → client).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsMessage {
    /// Full snapshot of active jobs, sent on connect and after a lag.
    #[serde(rename = "jobs:init")]
    Init { jobs: Vec<Job> },
    /// Latest state of one job.
    #[serde(rename = "jobs:update")]
    Update { job: Job },
}

/// Actions a push client can send (client → server).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum JobAction {
    #[serde(rename = "jobs:cancel", rename_all = "camelCase")]
    Cancel { job_id: Uuid },
}

/// Where observers read job state from.
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Current active jobs, read fresh from the store.
    async fn active_jobs(&self) -> Result<Vec<Job>, JobError>;

    /// A single job, including terminal ones. `None` if unknown.
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, JobError>;

    /// Start receiving debounced job changes.
    fn subscribe(&self) -> JobSubscription;
}

/// In-process source backed by the lifecycle manager and change notifier.
#[derive(Clone)]
pub struct LocalJobSource {
    manager: Arc<JobManager>,
    notifier: Arc<ChangeNotifier>,
}

impl LocalJobSource {
    pub fn new(manager: Arc<JobManager>, notifier: Arc<ChangeNotifier>) -> Self {
        Self { manager, notifier }
    }
}

#[async_trait]
impl JobSource for LocalJobSource {
    async fn active_jobs(&self) -> Result<Vec<Job>, JobError> {
        self.manager.list_active_jobs().await
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, JobError> {
        match self.manager.get_job(id).await {
            Ok(job) => Ok(Some(job)),
            Err(JobError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn subscribe(&self) -> JobSubscription {
        self.notifier.subscribe()
    }
}
