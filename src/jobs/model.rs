//! Job record data model.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::JobStage;

/// The closed set of background task kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Build a new study session from source material.
    CreateSession,
    /// Grade submitted answers for the current round.
    SubmitAnswers,
    /// Generate the next round of questions.
    CreateNextRound,
    /// Append questions to the current round.
    AddMoreQuestions,
    /// Project AI help: suggest new items for a board.
    ProjectSuggestItems,
    /// Project AI help: propose edits to an existing board.
    ProjectBoardEdit,
}

impl JobType {
    pub const ALL: [JobType; 6] = [
        Self::CreateSession,
        Self::SubmitAnswers,
        Self::CreateNextRound,
        Self::AddMoreQuestions,
        Self::ProjectSuggestItems,
        Self::ProjectBoardEdit,
    ];

    /// Human-readable label shown next to the progress indicator.
    pub fn label(&self) -> &'static str {
        match self {
            Self::CreateSession => "Generating questions",
            Self::SubmitAnswers => "Reviewing answers",
            Self::CreateNextRound => "Creating next round",
            Self::AddMoreQuestions => "Adding more questions",
            Self::ProjectSuggestItems => "Suggesting items",
            Self::ProjectBoardEdit => "Running AI board edits",
        }
    }

    /// Rough expected duration, used only for display.
    pub fn eta(&self) -> Duration {
        match self {
            Self::CreateSession => Duration::from_secs(45),
            Self::SubmitAnswers => Duration::from_secs(20),
            Self::CreateNextRound => Duration::from_secs(40),
            Self::AddMoreQuestions => Duration::from_secs(25),
            Self::ProjectSuggestItems => Duration::from_secs(30),
            Self::ProjectBoardEdit => Duration::from_secs(60),
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::CreateSession => "create_session",
            Self::SubmitAnswers => "submit_answers",
            Self::CreateNextRound => "create_next_round",
            Self::AddMoreQuestions => "add_more_questions",
            Self::ProjectSuggestItems => "project_suggest_items",
            Self::ProjectBoardEdit => "project_board_edit",
        };
        write!(f, "{s}")
    }
}

/// How a client should present a job type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTypeInfo {
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub label: String,
    pub eta_secs: u64,
}

impl From<JobType> for JobTypeInfo {
    fn from(job_type: JobType) -> Self {
        Self {
            job_type,
            label: job_type.label().to_string(),
            eta_secs: job_type.eta().as_secs(),
        }
    }
}

/// A tracked unit of asynchronous background work.
///
/// Serialized in camelCase both on disk and on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub stage: JobStage,
    /// When the job entered its current stage.
    pub stage_started_at: DateTime<Utc>,
    /// Session the job operates on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    /// Session the job produced. Set on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_session_id: Option<Uuid>,
    /// Display-only diagnostic. Set only when failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set iff the stage is terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new pending job.
    pub fn new(job_type: JobType, session_id: Option<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_type,
            stage: JobStage::Pending,
            stage_started_at: now,
            session_id,
            result_session_id: None,
            error: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.stage.is_active()
    }

    /// Time spent in the current stage as of `now`.
    pub fn time_in_stage(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.stage_started_at)
    }

    /// Merge a partial update into this record.
    pub fn apply(&mut self, patch: &JobPatch) {
        let now = Utc::now();
        if let Some(stage) = patch.stage {
            if stage != self.stage {
                self.stage_started_at = now;
            }
            self.stage = stage;
            self.completed_at = stage.is_terminal().then_some(now);
        }
        if let Some(id) = patch.result_session_id {
            self.result_session_id = Some(id);
        }
        if let Some(ref error) = patch.error {
            self.error = Some(error.clone());
        }
        self.retry_count += patch.retry_increment;
        self.updated_at = now;
    }
}

/// Partial update for a job record.
///
/// `expect_stage` turns the write into a compare-and-set: the store refuses
/// it if the stored stage differs.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub stage: Option<JobStage>,
    pub result_session_id: Option<Uuid>,
    pub error: Option<String>,
    pub retry_increment: u32,
    pub expect_stage: Option<JobStage>,
}

impl JobPatch {
    pub fn stage(stage: JobStage) -> Self {
        Self {
            stage: Some(stage),
            ..Default::default()
        }
    }

    pub fn with_result_session(mut self, id: Uuid) -> Self {
        self.result_session_id = Some(id);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn expecting(mut self, stage: JobStage) -> Self {
        self.expect_stage = Some(stage);
        self
    }

    pub fn retry() -> Self {
        Self {
            retry_increment: 1,
            ..Default::default()
        }
    }
}
