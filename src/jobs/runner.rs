//! Background task runner.
//!
//! `TaskRunner::start` creates the job and returns it right away; the work
//! runs in a detached tokio task that walks the four working stages and
//! always ends the job in a terminal stage unless the process dies.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use super::manager::JobManager;
use super::model::{Job, JobType};
use super::state::JobStage;
use crate::error::JobError;
use crate::llm::{CompletionRequest, LlmProvider, RetryPolicy};

/// The domain work behind a job, one method per working stage.
#[async_trait]
pub trait JobTask: Send + Sync + 'static {
    fn job_type(&self) -> JobType;

    /// Session the job operates on, if any.
    fn session_id(&self) -> Option<Uuid> {
        None
    }

    async fn extract(&self, ctx: &mut StepContext) -> Result<(), JobError>;

    async fn analyze(&self, ctx: &mut StepContext) -> Result<(), JobError>;

    async fn generate(&self, ctx: &mut StepContext) -> Result<(), JobError>;

    /// Write results and return the id of the resulting session.
    async fn finalize(&self, ctx: &mut StepContext) -> Result<Uuid, JobError>;
}

/// State handed from step to step.
pub struct StepContext {
    pub job_id: Uuid,
    manager: Arc<JobManager>,
    llm: Arc<dyn LlmProvider>,
    retry: RetryPolicy,
    scratch: HashMap<&'static str, String>,
}

impl StepContext {
    pub fn new(
        job_id: Uuid,
        manager: Arc<JobManager>,
        llm: Arc<dyn LlmProvider>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            job_id,
            manager,
            llm,
            retry,
            scratch: HashMap::new(),
        }
    }

    pub fn put(&mut self, key: &'static str, value: impl Into<String>) {
        self.scratch.insert(key, value.into());
    }

    pub fn get(&self, key: &'static str) -> Option<&str> {
        self.scratch.get(key).map(String::as_str)
    }

    /// Like `get`, but a missing value is an error naming the key.
    pub fn require(&self, key: &'static str) -> Result<&str, JobError> {
        self.get(key)
            .ok_or_else(|| JobError::UpstreamFailure(format!("Missing step output: {}", key)))
    }

    /// Run a completion, retrying transient provider errors.
    ///
    /// Each retry bumps the job's `retryCount`.
    pub async fn complete(&self, request: CompletionRequest) -> Result<String, JobError> {
        let mut attempt = 0;
        loop {
            match self.llm.complete(request.clone()).await {
                Ok(response) => {
                    debug!(
                        job_id = %self.job_id,
                        input_tokens = response.input_tokens,
                        output_tokens = response.output_tokens,
                        "Generation call finished"
                    );
                    return Ok(response.content);
                }
                Err(e) => {
                    attempt += 1;
                    let Some(delay) = self.retry.backoff(attempt, &e) else {
                        return Err(e.into());
                    };
                    warn!(
                        job_id = %self.job_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Generation call failed, retrying"
                    );
                    if let Err(e) = self.manager.record_retry(self.job_id).await {
                        warn!(job_id = %self.job_id, error = %e, "Failed to record retry");
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Runner settings.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Upper bound for a single step.
    pub step_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
        }
    }
}

/// How a pipeline run ended without error.
enum Outcome {
    Completed,
    /// Someone else already ended the job (e.g. cancelled while pending).
    Abandoned(JobStage),
}

/// Spawns and drives job pipelines.
pub struct TaskRunner {
    manager: Arc<JobManager>,
    llm: Arc<dyn LlmProvider>,
    config: RunnerConfig,
}

impl TaskRunner {
    pub fn new(manager: Arc<JobManager>, llm: Arc<dyn LlmProvider>, config: RunnerConfig) -> Self {
        Self {
            manager,
            llm,
            config,
        }
    }

    pub fn manager(&self) -> &Arc<JobManager> {
        &self.manager
    }

    /// Create a job for `task` and run it in the background.
    ///
    /// Returns the `pending` job as soon as it is persisted. The outcome is
    /// only observable by re-reading the record.
    pub async fn start(&self, task: Arc<dyn JobTask>) -> Result<Job, JobError> {
        let job = self
            .manager
            .create_job(task.job_type(), task.session_id())
            .await?;
        self.spawn(job.id, task);
        Ok(job)
    }

    /// Run `task` for an existing job. The handle is only useful for tests
    /// and shutdown; nothing about the job's outcome flows through it.
    pub fn spawn(&self, job_id: Uuid, task: Arc<dyn JobTask>) -> JoinHandle<()> {
        let ctx = StepContext::new(
            job_id,
            Arc::clone(&self.manager),
            Arc::clone(&self.llm),
            self.config.retry.clone(),
        );
        let manager = Arc::clone(&self.manager);
        let step_timeout = self.config.step_timeout;
        let span = info_span!("job", job_id = %job_id, job_type = %task.job_type());

        tokio::spawn(
            async move {
                // Inner task so a panicking step surfaces as a JoinError
                // instead of taking the job down silently.
                let pipeline = tokio::spawn(run_pipeline(task, ctx, step_timeout).in_current_span());
                let result = match pipeline.await {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => Err(format!(
                        "Task crashed: {}",
                        panic_message(e.into_panic().as_ref())
                    )),
                    Err(_) => Err("Task was aborted".to_string()),
                };

                match result {
                    Ok(Outcome::Completed) => {}
                    Ok(Outcome::Abandoned(stage)) => {
                        info!(stage = %stage, "Job ended elsewhere, runner stopping");
                    }
                    Err(message) => fail(&manager, job_id, message).await,
                }
            }
            .instrument(span),
        )
    }
}

async fn run_pipeline(
    task: Arc<dyn JobTask>,
    mut ctx: StepContext,
    step_timeout: Duration,
) -> Result<Outcome, String> {
    let job_id = ctx.job_id;
    let manager = Arc::clone(&ctx.manager);
    let mut result_session = None;

    for stage in JobStage::WORKING {
        match manager.update_stage(job_id, stage).await {
            Ok(_) => {}
            Err(JobError::InvalidTransition { from, .. }) if from.is_terminal() => {
                return Ok(Outcome::Abandoned(from));
            }
            Err(e) => return Err(format!("Could not enter {} stage: {}", stage, e)),
        }
        debug!(stage = %stage, "Step started");

        let step = async {
            match stage {
                JobStage::Extract => task.extract(&mut ctx).await.map(|_| None),
                JobStage::Analyze => task.analyze(&mut ctx).await.map(|_| None),
                JobStage::Generate => task.generate(&mut ctx).await.map(|_| None),
                _ => task.finalize(&mut ctx).await.map(Some),
            }
        };

        match tokio::time::timeout(step_timeout, step).await {
            Ok(Ok(Some(session_id))) => result_session = Some(session_id),
            Ok(Ok(None)) => {}
            Ok(Err(e)) => return Err(format!("{} step failed: {}", stage, e)),
            Err(_) => {
                return Err(JobError::Timeout {
                    stage,
                    timeout: step_timeout,
                }
                .to_string());
            }
        }
    }

    let Some(session_id) = result_session else {
        return Err("Finalize step produced no session".to_string());
    };
    match manager.complete_job(job_id, session_id).await {
        Ok(_) => Ok(Outcome::Completed),
        Err(JobError::InvalidTransition { from, .. }) if from.is_terminal() => {
            Ok(Outcome::Abandoned(from))
        }
        Err(e) => Err(format!("Could not complete job: {}", e)),
    }
}

async fn fail(manager: &JobManager, job_id: Uuid, message: String) {
    match manager.fail_job(job_id, message).await {
        Ok(_) => {}
        Err(JobError::InvalidTransition { from, .. }) if from.is_terminal() => {
            debug!(stage = %from, "Job already terminal, failure not recorded");
        }
        // The job stays in its working stage and shows up as stalled.
        Err(e) => error!(error = %e, "Failed to record job failure"),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::CompletionResponse;
    use crate::store::FileJobStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    struct EchoLlm {
        failures_before_success: AtomicU32,
    }

    #[async_trait]
    impl LlmProvider for EchoLlm {
        fn model_name(&self) -> &str {
            "echo"
        }

        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            if self.failures_before_success.load(Ordering::SeqCst) > 0 {
                self.failures_before_success.fetch_sub(1, Ordering::SeqCst);
                return Err(LlmError::RequestFailed {
                    provider: "echo".into(),
                    reason: "connection reset".into(),
                });
            }
            Ok(CompletionResponse {
                content: "ok".into(),
                input_tokens: 0,
                output_tokens: 0,
            })
        }
    }

    #[derive(Clone, Copy)]
    enum Behavior {
        Succeed,
        FailAt(JobStage),
        PanicAt(JobStage),
        HangAt(JobStage),
    }

    struct ScriptedTask {
        behavior: Behavior,
        result: Uuid,
    }

    impl ScriptedTask {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                result: Uuid::new_v4(),
            })
        }

        async fn step(&self, stage: JobStage, ctx: &mut StepContext) -> Result<(), JobError> {
            match self.behavior {
                Behavior::FailAt(s) if s == stage => {
                    Err(JobError::UpstreamFailure("model overloaded".into()))
                }
                Behavior::PanicAt(s) if s == stage => panic!("step exploded"),
                Behavior::HangAt(s) if s == stage => {
                    std::future::pending::<()>().await;
                    Ok(())
                }
                _ => {
                    let text = ctx.complete(CompletionRequest::new(vec![])).await?;
                    ctx.put("last", text);
                    Ok(())
                }
            }
        }
    }

    #[async_trait]
    impl JobTask for ScriptedTask {
        fn job_type(&self) -> JobType {
            JobType::CreateSession
        }

        async fn extract(&self, ctx: &mut StepContext) -> Result<(), JobError> {
            self.step(JobStage::Extract, ctx).await
        }

        async fn analyze(&self, ctx: &mut StepContext) -> Result<(), JobError> {
            self.step(JobStage::Analyze, ctx).await
        }

        async fn generate(&self, ctx: &mut StepContext) -> Result<(), JobError> {
            self.step(JobStage::Generate, ctx).await
        }

        async fn finalize(&self, ctx: &mut StepContext) -> Result<Uuid, JobError> {
            self.step(JobStage::Finalize, ctx).await?;
            Ok(self.result)
        }
    }

    async fn test_runner(config: RunnerConfig, failures: u32) -> (TaskRunner, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = FileJobStore::open(dir.path().join("jobs")).await.unwrap();
        let manager = Arc::new(JobManager::new(Arc::new(store)));
        let llm = Arc::new(EchoLlm {
            failures_before_success: AtomicU32::new(failures),
        });
        (TaskRunner::new(manager, llm, config), dir)
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn successful_run_completes() {
        let (runner, _dir) = test_runner(RunnerConfig::default(), 0).await;
        let task = ScriptedTask::new(Behavior::Succeed);
        let job = runner.manager().create_job(JobType::CreateSession, None).await.unwrap();

        runner.spawn(job.id, task.clone()).await.unwrap();

        let done = runner.manager().get_job(job.id).await.unwrap();
        assert_eq!(done.stage, JobStage::Completed);
        assert_eq!(done.result_session_id, Some(task.result));
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn start_returns_pending_job_immediately() {
        let (runner, _dir) = test_runner(RunnerConfig::default(), 0).await;
        let job = runner
            .start(ScriptedTask::new(Behavior::HangAt(JobStage::Extract)))
            .await
            .unwrap();
        assert_eq!(job.stage, JobStage::Pending);
    }

    #[tokio::test]
    async fn step_error_fails_job_with_message() {
        let (runner, _dir) = test_runner(RunnerConfig::default(), 0).await;
        let job = runner.manager().create_job(JobType::CreateSession, None).await.unwrap();

        runner
            .spawn(job.id, ScriptedTask::new(Behavior::FailAt(JobStage::Generate)))
            .await
            .unwrap();

        let failed = runner.manager().get_job(job.id).await.unwrap();
        assert_eq!(failed.stage, JobStage::Failed);
        let error = failed.error.unwrap();
        assert!(error.contains("model overloaded"), "{error}");
        assert!(error.starts_with("generate"), "{error}");
        assert!(failed.completed_at.is_some());
    }

    #[tokio::test]
    async fn panic_is_converted_to_failure() {
        let (runner, _dir) = test_runner(RunnerConfig::default(), 0).await;
        let job = runner.manager().create_job(JobType::CreateSession, None).await.unwrap();

        runner
            .spawn(job.id, ScriptedTask::new(Behavior::PanicAt(JobStage::Analyze)))
            .await
            .unwrap();

        let failed = runner.manager().get_job(job.id).await.unwrap();
        assert_eq!(failed.stage, JobStage::Failed);
        assert!(failed.error.unwrap().contains("step exploded"));
    }

    #[tokio::test]
    async fn hung_step_times_out() {
        let config = RunnerConfig {
            step_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let (runner, _dir) = test_runner(config, 0).await;
        let job = runner.manager().create_job(JobType::CreateSession, None).await.unwrap();

        runner
            .spawn(job.id, ScriptedTask::new(Behavior::HangAt(JobStage::Generate)))
            .await
            .unwrap();

        let failed = runner.manager().get_job(job.id).await.unwrap();
        assert_eq!(failed.stage, JobStage::Failed);
        assert!(failed.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn cancelled_before_start_is_left_alone() {
        let (runner, _dir) = test_runner(RunnerConfig::default(), 0).await;
        let job = runner.manager().create_job(JobType::CreateSession, None).await.unwrap();
        runner.manager().cancel_job(job.id).await.unwrap();

        runner
            .spawn(job.id, ScriptedTask::new(Behavior::Succeed))
            .await
            .unwrap();

        let job = runner.manager().get_job(job.id).await.unwrap();
        assert_eq!(job.stage, JobStage::Failed);
        assert_eq!(job.error.as_deref(), Some(crate::jobs::manager::CANCELLED_BY_USER));
    }

    #[tokio::test]
    async fn transient_llm_errors_are_retried_and_counted() {
        let config = RunnerConfig {
            retry: fast_retry(),
            ..Default::default()
        };
        let (runner, _dir) = test_runner(config, 2).await;
        let job = runner.manager().create_job(JobType::CreateSession, None).await.unwrap();

        runner
            .spawn(job.id, ScriptedTask::new(Behavior::Succeed))
            .await
            .unwrap();

        let done = runner.manager().get_job(job.id).await.unwrap();
        assert_eq!(done.stage, JobStage::Completed);
        assert_eq!(done.retry_count, 2);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_job() {
        let config = RunnerConfig {
            retry: fast_retry(),
            ..Default::default()
        };
        let (runner, _dir) = test_runner(config, 10).await;
        let job = runner.manager().create_job(JobType::CreateSession, None).await.unwrap();

        runner
            .spawn(job.id, ScriptedTask::new(Behavior::Succeed))
            .await
            .unwrap();

        let failed = runner.manager().get_job(job.id).await.unwrap();
        assert_eq!(failed.stage, JobStage::Failed);
        assert_eq!(failed.retry_count, 3);
        assert!(failed.error.unwrap().contains("connection reset"));
    }
}
